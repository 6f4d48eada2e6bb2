//! Ordered collection of debug binaries answering (name, kind) lookups.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::binary::Binary;
use super::record::{DebugRecord, RecordId, RecordKind};
use super::RecordSource;
use crate::error::{MemlensError, Result};

/// Links followed from a definition to the declaration carrying its type.
const MAX_ORIGIN_CHAIN: usize = 8;

/// Per-binary map from (kind, name) to record identities.
///
/// Definitions and declarations are kept apart so that a declaration is only
/// ever handed out when nothing defines the name.
#[derive(Debug, Default)]
pub(crate) struct NameIndex
{
    definitions: HashMap<RecordKind, HashMap<String, Vec<RecordId>>>,
    declarations: HashMap<RecordKind, HashMap<String, Vec<RecordId>>>,
    len: usize,
}

impl NameIndex
{
    pub(crate) fn insert(&mut self, name: String, kind: RecordKind, id: RecordId)
    {
        self.definitions.entry(kind).or_default().entry(name).or_default().push(id);
        self.len += 1;
    }

    pub(crate) fn insert_declaration(&mut self, name: String, kind: RecordKind, id: RecordId)
    {
        self.declarations.entry(kind).or_default().entry(name).or_default().push(id);
        self.len += 1;
    }

    pub(crate) fn lookup(&self, name: &str, kind: RecordKind) -> &[RecordId]
    {
        Self::get(&self.definitions, name, kind)
    }

    pub(crate) fn lookup_declarations(&self, name: &str, kind: RecordKind) -> &[RecordId]
    {
        Self::get(&self.declarations, name, kind)
    }

    fn get<'a>(map: &'a HashMap<RecordKind, HashMap<String, Vec<RecordId>>>, name: &str, kind: RecordKind) -> &'a [RecordId]
    {
        map.get(&kind)
            .and_then(|names| names.get(name))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub(crate) fn len(&self) -> usize
    {
        self.len
    }
}

/// A binary that could not contribute to the index, and why.
#[derive(Debug)]
pub struct SkippedBinary
{
    pub path: PathBuf,
    pub error: MemlensError,
}

/// Ordered set of binaries searched first to last.
///
/// The first binary holding a matching record wins, so the primary binary
/// (kernel image) goes first and modules follow. Binaries that cannot be
/// opened or carry no debug information are skipped and recorded in
/// [`DebugIndex::skipped`].
#[derive(Default)]
pub struct DebugIndex
{
    binaries: Vec<Binary>,
    skipped: Vec<SkippedBinary>,
}

impl DebugIndex
{
    /// Open every path in order, skipping the ones that fail.
    pub fn open<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut index = DebugIndex::default();
        for path in paths {
            index.add_optional(path.as_ref());
        }
        index.log_summary();
        index
    }

    /// Open a primary binary that must succeed, followed by best-effort
    /// auxiliary binaries.
    ///
    /// ## Errors
    ///
    /// Whatever [`Binary::open`] reports for the primary binary.
    pub fn with_primary<I, P>(primary: impl AsRef<Path>, auxiliary: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut index = DebugIndex::default();
        index.binaries.push(Binary::open(0, primary)?);
        for path in auxiliary {
            index.add_optional(path.as_ref());
        }
        index.log_summary();
        Ok(index)
    }

    fn add_optional(&mut self, path: &Path)
    {
        match Binary::open(self.binaries.len(), path) {
            Ok(binary) => self.binaries.push(binary),
            Err(error) => {
                warn!(path = %path.display(), %error, "skipping debug binary");
                self.skipped.push(SkippedBinary {
                    path: path.to_path_buf(),
                    error,
                });
            }
        }
    }

    fn log_summary(&self)
    {
        info!(
            binaries = self.binaries.len(),
            skipped = self.skipped.len(),
            "debug index ready"
        );
    }

    /// Opened binaries in search order.
    pub fn binaries(&self) -> &[Binary]
    {
        &self.binaries
    }

    pub fn skipped(&self) -> &[SkippedBinary]
    {
        &self.skipped
    }

    pub fn len(&self) -> usize
    {
        self.binaries.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.binaries.is_empty()
    }

    /// First record named `name` with kind `kind`, searching binaries in order.
    ///
    /// Defining records win over declarations in every binary; a declaration
    /// is returned only when no opened binary defines the name.
    ///
    /// ## Errors
    ///
    /// `NotFound` if no binary holds a match, or the error materializing it.
    pub fn find(&self, name: &str, kind: RecordKind) -> Result<DebugRecord>
    {
        for declarations in [false, true] {
            for binary in &self.binaries {
                if let Some(id) = ids_for(binary, name, kind, declarations).first() {
                    debug!(name, %kind, record = %id, "found record");
                    return binary.record(*id);
                }
            }
        }
        Err(MemlensError::NotFound {
            name: name.to_string(),
            kind,
        })
    }

    /// Every defining record, in binary order then unit order. Falls back to
    /// the declarations when nothing defines the name.
    ///
    /// ## Errors
    ///
    /// Errors materializing a matched record. An empty result is not an error.
    pub fn find_all(&self, name: &str, kind: RecordKind) -> Result<Vec<DebugRecord>>
    {
        for declarations in [false, true] {
            let mut records = Vec::new();
            for binary in &self.binaries {
                for id in ids_for(binary, name, kind, declarations) {
                    records.push(binary.record(*id)?);
                }
            }
            if !records.is_empty() {
                return Ok(records);
            }
        }
        Ok(Vec::new())
    }

    /// Materialize a record by identity.
    ///
    /// ## Errors
    ///
    /// `InvalidRecordId` if no opened binary holds it.
    pub fn record(&self, id: RecordId) -> Result<DebugRecord>
    {
        self.binaries
            .get(id.unit.binary)
            .ok_or(MemlensError::InvalidRecordId(id))?
            .record(id)
    }

    /// The record referenced by `record`'s `DW_AT_type`.
    ///
    /// A definition that only carries `DW_AT_specification` or
    /// `DW_AT_abstract_origin` takes its type from the record it points at.
    ///
    /// ## Errors
    ///
    /// `MissingAttribute` if there is no type reference, `InvalidRecordId` if it dangles.
    pub fn type_of(&self, record: &DebugRecord) -> Result<DebugRecord>
    {
        let mut current = record.clone();
        for _ in 0..MAX_ORIGIN_CHAIN {
            if let Some(ty) = current.reference(gimli::DW_AT_type) {
                return self.record(ty);
            }
            let origin = current
                .reference(gimli::DW_AT_specification)
                .or_else(|| current.reference(gimli::DW_AT_abstract_origin));
            match origin {
                Some(origin) => current = self.record(origin)?,
                None => break,
            }
        }
        Err(MemlensError::MissingAttribute {
            record: record.id(),
            attribute: "DW_AT_type",
        })
    }
}

fn ids_for<'a>(binary: &'a Binary, name: &str, kind: RecordKind, declarations: bool) -> &'a [RecordId]
{
    if declarations {
        binary.lookup_declarations(name, kind)
    } else {
        binary.lookup(name, kind)
    }
}

impl RecordSource for DebugIndex
{
    fn record(&self, id: RecordId) -> Result<DebugRecord>
    {
        DebugIndex::record(self, id)
    }
}
