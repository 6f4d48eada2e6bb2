//! # Debug Information
//!
//! DWARF loading and lookup across an ordered list of binaries.
//!
//! - [`Binary`]: one object file; units are decoded lazily into [`CompileUnit`]s
//! - [`DebugIndex`]: the ordered collection; first binary with a match wins
//! - [`DebugRecord`]: an owned handle to one decoded DIE

mod binary;
mod index;
mod record;

pub use binary::Binary;
pub use index::{DebugIndex, SkippedBinary};
#[cfg(test)]
pub(crate) use record::UnitBuilder;
pub use record::{AttrValue, CompileUnit, DebugRecord, RecordId, RecordKind, UnitId};

use crate::error::Result;

/// Anything that can materialize a record from its identity.
///
/// The type resolver follows references through this trait, so it works the
/// same against a [`DebugIndex`] or a hand-built set of units.
pub trait RecordSource
{
    /// ## Errors
    ///
    /// `InvalidRecordId` if `id` names no record.
    fn record(&self, id: RecordId) -> Result<DebugRecord>;
}
