//! # memlens-core
//!
//! Read-only inspection of a live kernel (or any program described by DWARF)
//! through a symbol snapshot, debug binaries and a memory image.
//!
//! This crate provides:
//! - [`SymbolTable`]: name-to-address lookup over a `/proc/kallsyms` snapshot
//! - [`MemoryImage`]: virtual address translation and reads over an ELF
//!   memory image such as `/proc/kcore`
//! - [`DebugIndex`]: lazy (name, kind) lookup of DWARF records across an
//!   ordered list of binaries
//! - [`TypeResolver`]: cycle-safe, caching conversion of type records into
//!   [`TypeDescriptor`]s
//! - [`Program`]: the facade combining all of the above
//!
//! ## Example
//!
//! ```no_run
//! use memlens_core::{Program, ProgramConfig};
//!
//! let config = ProgramConfig::new("/boot/vmlinux", "/proc/kallsyms", "/proc/kcore");
//! let mut program = Program::open(&config)?;
//! let jiffies = program.lookup_variable("jiffies")?;
//! let bytes = program.read_value(&jiffies)?;
//! println!("{} = {bytes:02x?}", program.types().type_name(jiffies.type_id));
//! # Ok::<(), memlens_core::MemlensError>(())
//! ```

pub mod debuginfo;
pub mod error;
pub mod memory;
pub mod prelude;
pub mod program;
pub mod resolver;
pub mod symtab;
pub mod types;

pub use debuginfo::{DebugIndex, DebugRecord, RecordId, RecordKind, RecordSource};
pub use error::{MemlensError, Result};
pub use memory::{MemoryImage, MemorySegment, ReadPolicy};
pub use program::{Program, ProgramConfig, Variable};
pub use resolver::TypeResolver;
pub use symtab::SymbolTable;
pub use types::{Address, TypeArena, TypeDescriptor, TypeId};
