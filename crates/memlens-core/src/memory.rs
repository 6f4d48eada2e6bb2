//! # Memory Image
//!
//! Address translation over an ELF memory image such as `/proc/kcore` or a
//! core dump.
//!
//! Opening an image reads only its file header and program header table; the
//! rest of the file is never loaded. Every program header becomes a
//! [`MemorySegment`], whatever its type, because containment of the requested
//! address is the only thing that selects a segment at read time. Reads are
//! positioned reads against the one backing file.
//!
//! ## Segment boundaries
//!
//! Under [`ReadPolicy::Unchecked`] (the default) only the start address of a
//! read is translated. A read that runs past the end of its segment keeps
//! reading whatever bytes follow in the file. [`ReadPolicy::Strict`] rejects
//! such reads with `CrossesSegmentBoundary` instead.

use std::fs::File;
use std::path::{Path, PathBuf};

use object::elf;
use object::read::elf::{FileHeader, ProgramHeader};
use object::Endianness;
use tracing::{debug, trace};

use crate::error::{MemlensError, Result};
use crate::types::Address;

/// ELF file header is at most this long (64-bit class).
const ELF_HEADER_PROBE: usize = 64;

/// How reads that leave their segment are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPolicy
{
    /// Translate the start address only.
    #[default]
    Unchecked,
    /// Fail reads whose last byte lies outside the start address's segment.
    Strict,
}

/// One entry of the image's segment table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySegment
{
    /// First virtual address covered.
    pub start: Address,
    /// Length of the virtual range (`p_memsz`).
    pub length: u64,
    /// Byte offset of `start` inside the image file.
    pub file_offset: u64,
    /// Bytes present in the file (`p_filesz`); informational.
    pub file_size: u64,
    /// Raw `p_type`; informational, never used for selection.
    pub segment_type: u32,
}

impl MemorySegment
{
    /// Whether `address` lies in `[start, start + length)`.
    pub fn contains(&self, address: Address) -> bool
    {
        address.offset_from(self.start).is_some_and(|offset| offset < self.length)
    }

    /// Address one past the last covered byte, saturating at the top of the address space.
    pub fn end(&self) -> Address
    {
        Address::new(self.start.value().saturating_add(self.length))
    }
}

/// Result of translating a virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation
{
    /// Position of the matched segment in table order.
    pub segment_index: usize,
    pub segment: MemorySegment,
    /// File offset holding the byte at the translated address.
    pub file_offset: u64,
}

/// Word size of the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordSize
{
    Bits32,
    Bits64,
}

/// An opened memory image: backing file plus its segment table.
#[derive(Debug)]
pub struct MemoryImage
{
    path: PathBuf,
    file: File,
    word_size: WordSize,
    endian: Endianness,
    segments: Vec<MemorySegment>,
    policy: ReadPolicy,
}

impl MemoryImage
{
    /// Open an image with the default (unchecked) read policy.
    ///
    /// ## Errors
    ///
    /// I/O errors, or `InvalidImage` if the header or segment table cannot be parsed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self>
    {
        Self::open_with_policy(path, ReadPolicy::default())
    }

    /// Open an image with an explicit read policy.
    ///
    /// ## Errors
    ///
    /// I/O errors, or `InvalidImage` if the header or segment table cannot be parsed.
    pub fn open_with_policy(path: impl AsRef<Path>, policy: ReadPolicy) -> Result<Self>
    {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;

        let probe = read_up_to(&file, 0, ELF_HEADER_PROBE)?;
        let kind = object::FileKind::parse(probe.as_slice())
            .map_err(|err| MemlensError::InvalidImage(format!("{}: {err}", path.display())))?;

        let (word_size, endian, segments) = match kind {
            object::FileKind::Elf64 => {
                let (endian, segments) = parse_segments::<elf::FileHeader64<Endianness>>(&file, &probe)?;
                (WordSize::Bits64, endian, segments)
            }
            object::FileKind::Elf32 => {
                let (endian, segments) = parse_segments::<elf::FileHeader32<Endianness>>(&file, &probe)?;
                (WordSize::Bits32, endian, segments)
            }
            other => {
                return Err(MemlensError::InvalidImage(format!(
                    "{}: not an ELF image ({other:?})",
                    path.display()
                )))
            }
        };

        debug!(path = %path.display(), segments = segments.len(), ?word_size, "opened memory image");

        Ok(Self {
            path,
            file,
            word_size,
            endian,
            segments,
            policy,
        })
    }

    pub fn path(&self) -> &Path
    {
        &self.path
    }

    pub fn word_size(&self) -> WordSize
    {
        self.word_size
    }

    pub fn is_little_endian(&self) -> bool
    {
        self.endian == Endianness::Little
    }

    pub fn policy(&self) -> ReadPolicy
    {
        self.policy
    }

    /// Segments in table order.
    pub fn segments(&self) -> &[MemorySegment]
    {
        &self.segments
    }

    /// Find the first segment, in table order, containing `address`.
    ///
    /// ## Errors
    ///
    /// `AddressNotMapped` if no segment contains it.
    pub fn translate(&self, address: Address) -> Result<Translation>
    {
        self.segments
            .iter()
            .enumerate()
            .find(|(_, segment)| segment.contains(address))
            .and_then(|(segment_index, segment)| {
                let delta = address.offset_from(segment.start)?;
                Some(Translation {
                    segment_index,
                    segment: *segment,
                    file_offset: segment.file_offset.checked_add(delta)?,
                })
            })
            .ok_or(MemlensError::AddressNotMapped(address))
    }

    /// Read `size` bytes starting at virtual address `address`.
    ///
    /// ## Errors
    ///
    /// - `AddressNotMapped` if `address` is outside every segment
    /// - `CrossesSegmentBoundary` under `ReadPolicy::Strict` when the read leaves its segment
    /// - `TruncatedRead` if the file ends first
    pub fn read(&self, address: Address, size: usize) -> Result<Vec<u8>>
    {
        let translation = self.translate(address)?;

        if self.policy == ReadPolicy::Strict && size > 0 {
            let last = address.checked_add(size as u64 - 1);
            if !last.is_some_and(|last| translation.segment.contains(last)) {
                return Err(MemlensError::CrossesSegmentBoundary { address, size });
            }
        }

        trace!(%address, size, file_offset = translation.file_offset, segment = translation.segment_index, "reading memory");

        let bytes = read_up_to(&self.file, translation.file_offset, size)?;
        if bytes.len() < size {
            return Err(MemlensError::TruncatedRead {
                address,
                requested: size,
            });
        }
        Ok(bytes)
    }
}

fn parse_segments<Elf>(file: &File, probe: &[u8]) -> Result<(Endianness, Vec<MemorySegment>)>
where
    Elf: FileHeader<Endian = Endianness>,
{
    let header = Elf::parse(probe).map_err(|err| MemlensError::InvalidImage(format!("bad ELF header: {err}")))?;
    let endian = header
        .endian()
        .map_err(|err| MemlensError::InvalidImage(format!("bad ELF byte order: {err}")))?;

    let phoff: u64 = header.e_phoff(endian).into();
    let phentsize = u64::from(header.e_phentsize(endian));
    let mut phnum = u64::from(header.e_phnum(endian));
    let mut table_end = 0u64;

    // With PN_XNUM the real count lives in section header 0, which must be readable too.
    if phnum == u64::from(elf::PN_XNUM) {
        let shoff: u64 = header.e_shoff(endian).into();
        let shentsize = u64::from(header.e_shentsize(endian));
        table_end = shoff.saturating_add(shentsize);
        phnum = 0;
    }
    table_end = table_end.max(phoff.saturating_add(phentsize.saturating_mul(phnum.max(1))));

    let prefix_len = usize::try_from(table_end.max(probe.len() as u64))
        .map_err(|_| MemlensError::InvalidImage("segment table lies beyond addressable range".to_string()))?;
    let prefix = read_up_to(file, 0, prefix_len)?;

    let header = Elf::parse(prefix.as_slice()).map_err(|err| MemlensError::InvalidImage(format!("bad ELF header: {err}")))?;
    let program_headers = header
        .program_headers(endian, prefix.as_slice())
        .map_err(|err| MemlensError::InvalidImage(format!("bad program header table: {err}")))?;

    let segments = program_headers
        .iter()
        .map(|phdr| MemorySegment {
            start: Address::new(phdr.p_vaddr(endian).into()),
            length: phdr.p_memsz(endian).into(),
            file_offset: phdr.p_offset(endian).into(),
            file_size: phdr.p_filesz(endian).into(),
            segment_type: phdr.p_type(endian),
        })
        .collect();

    Ok((endian, segments))
}

/// Positioned read of up to `len` bytes; shorter only at end of file.
fn read_up_to(file: &File, offset: u64, len: usize) -> Result<Vec<u8>>
{
    let mut buffer = vec![0u8; len];
    let mut filled = 0usize;
    while filled < len {
        let read = read_at(file, &mut buffer[filled..], offset + filled as u64)?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    buffer.truncate(filled);
    Ok(buffer)
}

#[cfg(unix)]
fn read_at(file: &File, buffer: &mut [u8], offset: u64) -> std::io::Result<usize>
{
    use std::os::unix::fs::FileExt;

    loop {
        match file.read_at(buffer, offset) {
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            other => return other,
        }
    }
}

#[cfg(windows)]
fn read_at(file: &File, buffer: &mut [u8], offset: u64) -> std::io::Result<usize>
{
    use std::os::windows::fs::FileExt;

    file.seek_read(buffer, offset)
}
