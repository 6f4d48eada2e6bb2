use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use memlens_core::debuginfo::DebugIndex;
use memlens_core::memory::{MemoryImage, ReadPolicy};
use memlens_core::types::{Address, TypeArena, TypeDescriptor, TypeId};
use memlens_core::{Program, ProgramConfig, Result as MemlensResult};
use memlens_utils::{info, init_logging, init_logging_with_level, LogFormat, LogLevel};

/// Look up kernel globals by name and read them out of a memory image.
#[derive(Parser, Debug)]
#[command(name = "memlens")]
#[command(version)]
#[command(about = "Look up kernel globals by name and read them out of a memory image", long_about = None)]
struct Cli
{
    /// Kernel image with debug information (searched first)
    #[arg(long, value_name = "PATH")]
    vmlinux: PathBuf,

    /// Module with debug information; repeat to search several, in order
    #[arg(short = 'm', long = "module", value_name = "PATH")]
    modules: Vec<PathBuf>,

    /// Symbol snapshot
    #[arg(long, value_name = "PATH", default_value = "/proc/kallsyms")]
    symbols: PathBuf,

    /// ELF memory image
    #[arg(long, value_name = "PATH", default_value = "/proc/kcore")]
    core: PathBuf,

    /// Reject reads that run past the end of their memory segment
    #[arg(long, default_value_t = false)]
    strict: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log output format (pretty or json)
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Locate a global variable, print its type and read its value
    Lookup
    {
        /// Variable name
        name: String,
        /// Only print address and type, skip reading memory
        #[arg(long, default_value_t = false)]
        no_read: bool,
    },
    /// Read raw memory at a virtual address
    Read
    {
        /// Virtual address (hex format: 0xffffffff81000000 or decimal)
        address: Address,
        /// Number of bytes to read (default: 16)
        #[arg(short, long, default_value_t = 16)]
        length: usize,
    },
    /// Show the opened binaries and the memory image's segment table
    Info,
}

fn main()
{
    let cli = Cli::parse();

    let logging = if cli.verbose > 0 || cli.log_format.is_some() {
        init_logging_with_level(
            LogLevel::from_verbosity(cli.verbose),
            cli.log_format.unwrap_or(LogFormat::Pretty),
        )
    } else {
        init_logging()
    };
    if let Err(e) = logging {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    if let Err(e) = run_command(cli) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run_command(cli: Cli) -> MemlensResult<()>
{
    let policy = if cli.strict {
        ReadPolicy::Strict
    } else {
        ReadPolicy::Unchecked
    };

    match cli.command {
        Commands::Lookup { ref name, no_read } => {
            let config = ProgramConfig::new(&cli.vmlinux, &cli.symbols, &cli.core)
                .with_auxiliary_binaries(&cli.modules)
                .with_read_policy(policy);
            let mut program = Program::open(&config)?;
            let variable = program.lookup_variable(name)?;
            info!("Resolved {} to {}", name, variable.address);

            println!("{} @ {}", variable.name, variable.address);
            print_type(program.types(), variable.type_id);

            if !no_read {
                let bytes = program.read_value(&variable)?;
                print_hex(variable.address, &bytes);
            }
            Ok(())
        }
        Commands::Read { address, length } => {
            let image = MemoryImage::open_with_policy(&cli.core, policy)?;
            let bytes = image.read(address, length)?;
            print_hex(address, &bytes);
            Ok(())
        }
        Commands::Info => {
            let index = DebugIndex::with_primary(&cli.vmlinux, &cli.modules)?;
            let image = MemoryImage::open_with_policy(&cli.core, policy)?;
            print_info(&index, &image);
            Ok(())
        }
    }
}

fn print_type(arena: &TypeArena, id: TypeId)
{
    let size = arena
        .size_of(id)
        .map_or_else(|| "unknown".to_string(), |size| size.to_string());
    println!("  type: {} (size {})", arena.type_name(id), size);

    if let Some(TypeDescriptor::Struct(compound) | TypeDescriptor::Union(compound)) = arena.get(arena.strip_typedefs(id)) {
        for member in &compound.members {
            let name = member.name.as_deref().unwrap_or("<anonymous>");
            match (member.bit_offset, member.bit_size) {
                (Some(bit_offset), Some(bit_size)) => println!(
                    "    +0x{:<4x} {} {} : {} (bit {})",
                    member.byte_offset,
                    arena.type_name(member.ty),
                    name,
                    bit_size,
                    bit_offset
                ),
                _ => println!("    +0x{:<4x} {} {}", member.byte_offset, arena.type_name(member.ty), name),
            }
        }
    }
}

fn print_hex(address: Address, bytes: &[u8])
{
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|byte| format!("{:02x}", byte)).collect();
        let ascii: String = chunk
            .iter()
            .map(|&byte| if byte.is_ascii_graphic() { byte as char } else { '.' })
            .collect();
        println!("{}  {:<47}  {}", row_label(address, row), hex.join(" "), ascii);
    }
}

/// Address of hex dump row `row`, or its offset from `address` once the
/// dump wraps past the top of the address space.
fn row_label(address: Address, row: usize) -> String
{
    let offset = row as u64 * 16;
    address
        .checked_add(offset)
        .map_or_else(|| format!("{address}+0x{offset:x}"), |row_address| row_address.to_string())
}

fn print_info(index: &DebugIndex, image: &MemoryImage)
{
    println!("\nDebug binaries:");
    for binary in index.binaries() {
        println!(
            "  [{}] {} ({} units, {} names)",
            binary.id(),
            binary.path().display(),
            binary.unit_count(),
            binary.indexed_names()
        );
    }
    for skipped in index.skipped() {
        println!("  [skipped] {}: {}", skipped.path.display(), skipped.error);
    }

    println!("\nMemory image: {}", image.path().display());
    println!("  Word size: {:?}", image.word_size());
    println!("  Segments: {}", image.segments().len());
    for (index, segment) in image.segments().iter().enumerate() {
        println!(
            "  [{:>3}] {}-{} file offset 0x{:x} type 0x{:x}",
            index,
            segment.start,
            segment.end(),
            segment.file_offset,
            segment.segment_type
        );
    }
}
