//! # Program
//!
//! Facade tying the symbol table, debug index, type resolver and memory image
//! together. A variable lookup is address first, then debug record, then type:
//!
//! 1. the symbol table gives the address (`UnknownSymbol` otherwise)
//! 2. the debug index gives the variable record (`NotFound` otherwise)
//! 3. the record's `DW_AT_type` gives the type record (`MissingAttribute` otherwise)
//! 4. the resolver turns that into a descriptor
//!
//! Any failing step fails the whole lookup; there is no partial result.

use std::path::PathBuf;

use tracing::{debug, info};

use crate::debuginfo::{DebugIndex, RecordKind};
use crate::error::{MemlensError, Result};
use crate::memory::{MemoryImage, ReadPolicy};
use crate::resolver::TypeResolver;
use crate::symtab::SymbolTable;
use crate::types::{Address, TypeArena, TypeDescriptor, TypeId};

/// Inputs of a [`Program`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramConfig
{
    /// Binary searched first (the kernel image). Must load.
    pub primary_binary: PathBuf,
    /// Further binaries (modules), searched after the primary in this order.
    /// Each may be missing or lack debug information.
    pub auxiliary_binaries: Vec<PathBuf>,
    /// Symbol snapshot, e.g. `/proc/kallsyms`.
    pub symbol_file: PathBuf,
    /// Memory image, e.g. `/proc/kcore`.
    pub memory_image: PathBuf,
    pub read_policy: ReadPolicy,
}

impl ProgramConfig
{
    pub fn new(primary_binary: impl Into<PathBuf>, symbol_file: impl Into<PathBuf>, memory_image: impl Into<PathBuf>) -> Self
    {
        Self {
            primary_binary: primary_binary.into(),
            auxiliary_binaries: Vec::new(),
            symbol_file: symbol_file.into(),
            memory_image: memory_image.into(),
            read_policy: ReadPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_auxiliary_binaries<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.auxiliary_binaries.extend(paths.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_read_policy(mut self, policy: ReadPolicy) -> Self
    {
        self.read_policy = policy;
        self
    }
}

/// A located, typed variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable
{
    pub name: String,
    pub address: Address,
    /// Resolved type, valid in [`Program::types`].
    pub type_id: TypeId,
}

/// An inspected program: symbols, debug information and memory.
pub struct Program
{
    symbols: SymbolTable,
    debug_index: DebugIndex,
    resolver: TypeResolver,
    memory: MemoryImage,
}

impl Program
{
    /// Load everything named by `config`.
    ///
    /// ## Errors
    ///
    /// Failures loading the primary binary, the symbol snapshot or the memory
    /// image. Auxiliary binaries never fail the load.
    pub fn open(config: &ProgramConfig) -> Result<Self>
    {
        let debug_index = DebugIndex::with_primary(&config.primary_binary, &config.auxiliary_binaries)?;
        let symbols = SymbolTable::open(&config.symbol_file)?;
        let memory = MemoryImage::open_with_policy(&config.memory_image, config.read_policy)?;

        info!(
            binaries = debug_index.len(),
            skipped = debug_index.skipped().len(),
            symbols = symbols.len(),
            segments = memory.segments().len(),
            "program loaded"
        );

        Ok(Self::new(symbols, debug_index, memory))
    }

    /// Assemble a program from already-loaded parts.
    pub fn new(symbols: SymbolTable, debug_index: DebugIndex, memory: MemoryImage) -> Self
    {
        Self {
            symbols,
            debug_index,
            resolver: TypeResolver::new(),
            memory,
        }
    }

    /// Locate the global variable `name` and resolve its type.
    ///
    /// ## Errors
    ///
    /// `UnknownSymbol`, `NotFound`, `MissingAttribute`, or any type resolution error.
    pub fn lookup_variable(&mut self, name: &str) -> Result<Variable>
    {
        let address = self.symbols.lookup(name)?;
        let record = self.debug_index.find(name, RecordKind::Variable)?;
        let type_record = self.debug_index.type_of(&record)?;
        let type_id = self.resolver.resolve(&self.debug_index, &type_record)?;

        debug!(name, %address, ty = %self.resolver.arena().type_name(type_id), "looked up variable");

        Ok(Variable {
            name: name.to_string(),
            address,
            type_id,
        })
    }

    /// Read `size` raw bytes at virtual address `address`.
    ///
    /// ## Errors
    ///
    /// `AddressNotMapped`, `CrossesSegmentBoundary` or `TruncatedRead`.
    pub fn read_memory(&self, address: Address, size: usize) -> Result<Vec<u8>>
    {
        self.memory.read(address, size)
    }

    /// Read the bytes of `variable`, sized by its type.
    ///
    /// ## Errors
    ///
    /// `UnsizedType` if the type has no known size, or any read error.
    pub fn read_value(&self, variable: &Variable) -> Result<Vec<u8>>
    {
        let arena = self.resolver.arena();
        let size = arena
            .size_of(variable.type_id)
            .and_then(|size| usize::try_from(size).ok())
            .ok_or_else(|| MemlensError::UnsizedType(arena.type_name(variable.type_id)))?;
        self.read_memory(variable.address, size)
    }

    /// Resolved descriptor for `id`.
    pub fn type_descriptor(&self, id: TypeId) -> Option<&TypeDescriptor>
    {
        self.resolver.get(id)
    }

    /// Every type resolved so far.
    pub fn types(&self) -> &TypeArena
    {
        self.resolver.arena()
    }

    pub fn resolver(&self) -> &TypeResolver
    {
        &self.resolver
    }

    pub fn symbols(&self) -> &SymbolTable
    {
        &self.symbols
    }

    pub fn debug_index(&self) -> &DebugIndex
    {
        &self.debug_index
    }

    pub fn memory(&self) -> &MemoryImage
    {
        &self.memory
    }
}
