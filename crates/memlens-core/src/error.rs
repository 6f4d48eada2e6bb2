//! # Error Types
//!
//! One error enum for every engine in the crate. We use `thiserror` to derive
//! the `Error` trait and the display messages.
//!
//! ## Error Categories
//!
//! 1. **Lookup errors**: NotFound, UnknownSymbol. Surfaced to the caller as-is,
//!    never replaced with a placeholder value.
//! 2. **Type errors**: MissingAttribute, UnsupportedType, TypeTooDeep, UnsizedType. These abort
//!    resolution of one record only; the index and other cached types stay valid.
//! 3. **Memory errors**: AddressNotMapped, CrossesSegmentBoundary, TruncatedRead
//! 4. **Input errors**: MalformedSymbol, NoDebugInfo, InvalidBinary, InvalidImage, Dwarf
//! 5. **I/O errors**: Io

use std::path::PathBuf;

use thiserror::Error;

use crate::debuginfo::{RecordId, RecordKind};
use crate::types::Address;

/// Main error type for memlens operations
#[derive(Error, Debug)]
pub enum MemlensError
{
    /// No opened binary holds a record with exactly this (name, kind) pair
    #[error("No {kind} record named '{name}' in any opened binary")]
    NotFound
    {
        name: String,
        kind: RecordKind,
    },

    /// The symbol snapshot never listed this name
    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    /// A record lacks an attribute its kind requires
    ///
    /// Examples:
    /// - a base type without `DW_AT_byte_size`
    /// - a variable without `DW_AT_type`
    /// - a structure member without `DW_AT_data_member_location`
    #[error("Record {record} is missing required attribute {attribute}")]
    MissingAttribute
    {
        record: RecordId,
        attribute: &'static str,
    },

    /// The record's kind has no type mapping
    #[error("Record {record} of kind {kind} cannot be resolved to a type")]
    UnsupportedType
    {
        record: RecordId,
        kind: RecordKind,
    },

    /// Type nesting went past the resolver's hard limit
    #[error("Type resolution of {record} exceeded nesting limit of {limit}")]
    TypeTooDeep
    {
        record: RecordId,
        limit: usize,
    },

    /// A value was requested for a type without a known size
    #[error("Type {0} has no known size")]
    UnsizedType(String),

    /// A reference points at a record that does not exist
    #[error("No record at {0}")]
    InvalidRecordId(RecordId),

    /// No segment of the memory image contains the address
    #[error("Could not find memory segment containing {0}")]
    AddressNotMapped(Address),

    /// A read would leave the segment that contains its start address
    ///
    /// Only raised when the image was opened with `ReadPolicy::Strict`.
    #[error("Read of {size} bytes at {address} crosses the end of its memory segment")]
    CrossesSegmentBoundary
    {
        address: Address,
        size: usize,
    },

    /// The image file ended before all requested bytes were read
    #[error("Memory image ended before {requested} bytes could be read at {address}")]
    TruncatedRead
    {
        address: Address,
        requested: usize,
    },

    /// A symbol snapshot line could not be parsed
    #[error("Malformed symbol line {line}: {reason}")]
    MalformedSymbol
    {
        line: usize,
        reason: String,
    },

    /// The binary carries no `.debug_info` section
    #[error("No debug information in {}", .0.display())]
    NoDebugInfo(PathBuf),

    /// The object file container could not be parsed
    #[error("Invalid binary: {0}")]
    InvalidBinary(String),

    /// The memory image header or segment table could not be parsed
    #[error("Invalid memory image: {0}")]
    InvalidImage(String),

    /// DWARF decoding failed
    #[error("DWARF error: {0}")]
    Dwarf(String),

    /// I/O error while opening or reading a backing file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for `Result<T, MemlensError>`
///
/// ```rust
/// use memlens_core::error::Result;
/// fn foo() -> Result<()>
/// {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, MemlensError>;

/// Map a gimli error to a `MemlensError` with context.
pub(crate) fn map_dwarf_error(context: &str, err: gimli::Error) -> MemlensError
{
    MemlensError::Dwarf(format!("{context}: {err}"))
}
