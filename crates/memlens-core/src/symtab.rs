//! # Symbol Table
//!
//! Name-to-address index built from a symbol snapshot such as `/proc/kallsyms`.
//!
//! Each line holds a hex address, a one-character kind marker, a name and an
//! optional `[module]` suffix:
//!
//! ```text
//! ffffffff81e0a000 D init_task
//! ffffffffc0a01040 d debug_level	[xfs]
//! ```
//!
//! Names may repeat (once per loaded module, for instance). Every occurrence is
//! kept in listing order and [`SymbolTable::lookup`] returns the **last** one.
//! The table is a point-in-time snapshot; it is never refreshed.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::debug;

use crate::error::{MemlensError, Result};
use crate::types::Address;

/// One occurrence of a name in the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolEntry
{
    pub address: Address,
    /// Kind marker as listed (`T`, `d`, `B`, ...).
    pub kind: char,
    /// Owning module, without brackets; `None` for the core image.
    pub module: Option<String>,
}

/// Immutable name-to-addresses index.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable
{
    symbols: HashMap<String, Vec<SymbolEntry>>,
    entry_count: usize,
}

impl SymbolTable
{
    /// Parse a snapshot from already-split lines.
    ///
    /// Blank lines are skipped.
    ///
    /// ## Errors
    ///
    /// `MalformedSymbol` for a line without a hex address, kind marker and name.
    pub fn parse<I, S>(lines: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut table = SymbolTable::default();
        for (index, line) in lines.into_iter().enumerate() {
            let line = line.as_ref();
            if line.trim().is_empty() {
                continue;
            }
            let (name, entry) = parse_line(index + 1, line)?;
            table.symbols.entry(name).or_default().push(entry);
            table.entry_count += 1;
        }
        Ok(table)
    }

    /// Parse a snapshot from any buffered reader.
    ///
    /// ## Errors
    ///
    /// I/O errors from the reader, or `MalformedSymbol`.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self>
    {
        let lines = reader.lines().collect::<std::io::Result<Vec<_>>>()?;
        Self::parse(lines)
    }

    /// Read and parse a snapshot file.
    ///
    /// ## Errors
    ///
    /// I/O errors opening or reading the file, or `MalformedSymbol`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self>
    {
        let path = path.as_ref();
        let table = Self::from_reader(BufReader::new(File::open(path)?))?;
        debug!(path = %path.display(), names = table.symbols.len(), entries = table.entry_count, "parsed symbol snapshot");
        Ok(table)
    }

    /// Address of `name`, taking the last occurrence in listing order.
    ///
    /// ## Errors
    ///
    /// `UnknownSymbol` if the name never appeared.
    pub fn lookup(&self, name: &str) -> Result<Address>
    {
        self.entries(name)
            .last()
            .map(|entry| entry.address)
            .ok_or_else(|| MemlensError::UnknownSymbol(name.to_string()))
    }

    /// Address of `name` as listed for one module (`None` selects the core image).
    ///
    /// The last matching occurrence wins, as with [`SymbolTable::lookup`].
    ///
    /// ## Errors
    ///
    /// `UnknownSymbol` if no occurrence belongs to that module.
    pub fn lookup_in_module(&self, name: &str, module: Option<&str>) -> Result<Address>
    {
        self.entries(name)
            .iter()
            .rev()
            .find(|entry| entry.module.as_deref() == module)
            .map(|entry| entry.address)
            .ok_or_else(|| MemlensError::UnknownSymbol(name.to_string()))
    }

    /// Every occurrence of `name`, in listing order.
    pub fn entries(&self, name: &str) -> &[SymbolEntry]
    {
        self.symbols.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of distinct names.
    pub fn len(&self) -> usize
    {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.symbols.is_empty()
    }

    /// Number of lines that produced an entry.
    pub fn entry_count(&self) -> usize
    {
        self.entry_count
    }
}

fn parse_line(line_number: usize, line: &str) -> Result<(String, SymbolEntry)>
{
    let malformed = |reason: &str| MemlensError::MalformedSymbol {
        line: line_number,
        reason: reason.to_string(),
    };

    let mut fields = line.split_whitespace();
    let address = fields.next().ok_or_else(|| malformed("missing address"))?;
    let address = u64::from_str_radix(address, 16).map_err(|_| malformed("address is not hexadecimal"))?;

    let kind = fields.next().ok_or_else(|| malformed("missing kind marker"))?;
    let mut kind_chars = kind.chars();
    let kind = match (kind_chars.next(), kind_chars.next()) {
        (Some(kind), None) => kind,
        _ => return Err(malformed("kind marker must be one character")),
    };

    let name = fields.next().ok_or_else(|| malformed("missing name"))?;

    let module = match fields.next() {
        Some(module) => {
            let module = module
                .strip_prefix('[')
                .and_then(|module| module.strip_suffix(']'))
                .ok_or_else(|| malformed("module must be written as [name]"))?;
            Some(module.to_string())
        }
        None => None,
    };

    if fields.next().is_some() {
        return Err(malformed("trailing fields"));
    }

    Ok((
        name.to_string(),
        SymbolEntry {
            address: Address::new(address),
            kind,
            module,
        },
    ))
}
