//! Common module for library exports

pub use crate::debuginfo::{DebugIndex, DebugRecord, RecordId, RecordKind, RecordSource};
pub use crate::error::{MemlensError, Result};
pub use crate::memory::{MemoryImage, ReadPolicy};
pub use crate::program::{Program, ProgramConfig, Variable};
pub use crate::resolver::TypeResolver;
pub use crate::symtab::SymbolTable;
pub use crate::types::{Address, TypeArena, TypeDescriptor, TypeId};
