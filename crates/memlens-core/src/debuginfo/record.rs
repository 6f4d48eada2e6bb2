//! Owned, immutable debug-information records.
//!
//! A [`CompileUnit`] is the fully decoded DIE tree of one unit. Its records
//! live in a flat vector; parent and child links are indices into that vector,
//! so the parent link is a lookup, never an owning pointer. A [`DebugRecord`]
//! is a cheap handle (`Arc` of the unit plus an index) handed out to callers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use gimli::{DwAt, DwTag};

use crate::error::{MemlensError, Result};

/// Identity of one unit: which binary (position in the index) and which unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId
{
    pub binary: usize,
    pub unit: usize,
}

/// Stable identity of a record: its unit plus its byte offset inside that unit.
///
/// Used as a cache key; it never keeps the record alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId
{
    pub unit: UnitId,
    pub offset: usize,
}

impl fmt::Display for RecordId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}:{}+0x{:x}", self.unit.binary, self.unit.unit, self.offset)
    }
}

/// Kind of a record, from its DWARF tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind
{
    CompileUnit,
    TypeUnit,
    Variable,
    Subprogram,
    FormalParameter,
    UnspecifiedParameters,
    Member,
    BaseType,
    PointerType,
    ReferenceType,
    StructureType,
    ClassType,
    UnionType,
    EnumerationType,
    Enumerator,
    Typedef,
    ArrayType,
    SubrangeType,
    ConstType,
    VolatileType,
    RestrictType,
    AtomicType,
    SubroutineType,
    Other(DwTag),
}

impl From<DwTag> for RecordKind
{
    fn from(tag: DwTag) -> Self
    {
        match tag {
            gimli::DW_TAG_compile_unit | gimli::DW_TAG_partial_unit => RecordKind::CompileUnit,
            gimli::DW_TAG_type_unit => RecordKind::TypeUnit,
            gimli::DW_TAG_variable => RecordKind::Variable,
            gimli::DW_TAG_subprogram => RecordKind::Subprogram,
            gimli::DW_TAG_formal_parameter => RecordKind::FormalParameter,
            gimli::DW_TAG_unspecified_parameters => RecordKind::UnspecifiedParameters,
            gimli::DW_TAG_member => RecordKind::Member,
            gimli::DW_TAG_base_type => RecordKind::BaseType,
            gimli::DW_TAG_pointer_type => RecordKind::PointerType,
            gimli::DW_TAG_reference_type => RecordKind::ReferenceType,
            gimli::DW_TAG_structure_type => RecordKind::StructureType,
            gimli::DW_TAG_class_type => RecordKind::ClassType,
            gimli::DW_TAG_union_type => RecordKind::UnionType,
            gimli::DW_TAG_enumeration_type => RecordKind::EnumerationType,
            gimli::DW_TAG_enumerator => RecordKind::Enumerator,
            gimli::DW_TAG_typedef => RecordKind::Typedef,
            gimli::DW_TAG_array_type => RecordKind::ArrayType,
            gimli::DW_TAG_subrange_type => RecordKind::SubrangeType,
            gimli::DW_TAG_const_type => RecordKind::ConstType,
            gimli::DW_TAG_volatile_type => RecordKind::VolatileType,
            gimli::DW_TAG_restrict_type => RecordKind::RestrictType,
            gimli::DW_TAG_atomic_type => RecordKind::AtomicType,
            gimli::DW_TAG_subroutine_type => RecordKind::SubroutineType,
            other => RecordKind::Other(other),
        }
    }
}

impl fmt::Display for RecordKind
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let label = match self {
            RecordKind::CompileUnit => "compile-unit",
            RecordKind::TypeUnit => "type-unit",
            RecordKind::Variable => "variable",
            RecordKind::Subprogram => "subprogram",
            RecordKind::FormalParameter => "formal-parameter",
            RecordKind::UnspecifiedParameters => "unspecified-parameters",
            RecordKind::Member => "member",
            RecordKind::BaseType => "base-type",
            RecordKind::PointerType => "pointer-type",
            RecordKind::ReferenceType => "reference-type",
            RecordKind::StructureType => "structure-type",
            RecordKind::ClassType => "class-type",
            RecordKind::UnionType => "union-type",
            RecordKind::EnumerationType => "enumeration-type",
            RecordKind::Enumerator => "enumerator",
            RecordKind::Typedef => "typedef",
            RecordKind::ArrayType => "array-type",
            RecordKind::SubrangeType => "subrange-type",
            RecordKind::ConstType => "const-type",
            RecordKind::VolatileType => "volatile-type",
            RecordKind::RestrictType => "restrict-type",
            RecordKind::AtomicType => "atomic-type",
            RecordKind::SubroutineType => "subroutine-type",
            RecordKind::Other(tag) => return write!(f, "{tag}"),
        };
        write!(f, "{label}")
    }
}

/// Decoded attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue
{
    Unsigned(u64),
    Signed(i64),
    /// Fixed-width constant (`data1`..`data8`) whose signedness depends on
    /// the type it describes.
    Data
    {
        value: u64,
        width: u8,
    },
    String(String),
    /// Reference to another record, possibly in another unit.
    Reference(RecordId),
    Flag(bool),
    Address(u64),
    /// DWARF expression bytes (`exprloc`).
    Expr(Vec<u8>),
    Block(Vec<u8>),
}

#[derive(Debug)]
struct RecordNode
{
    offset: usize,
    kind: RecordKind,
    name: Option<String>,
    attrs: Vec<(DwAt, AttrValue)>,
    parent: Option<usize>,
    children: Vec<usize>,
}

/// One decoded unit. Immutable once built.
#[derive(Debug)]
pub struct CompileUnit
{
    id: UnitId,
    address_size: u8,
    nodes: Vec<RecordNode>,
    by_offset: HashMap<usize, usize>,
}

impl CompileUnit
{
    pub fn id(&self) -> UnitId
    {
        self.id
    }

    /// Size of a target address in bytes, from the unit header.
    pub fn address_size(&self) -> u8
    {
        self.address_size
    }

    pub fn len(&self) -> usize
    {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.nodes.is_empty()
    }

    /// The unit's root record.
    pub fn root(unit: &Arc<CompileUnit>) -> Option<DebugRecord>
    {
        (!unit.nodes.is_empty()).then(|| DebugRecord {
            unit: Arc::clone(unit),
            index: 0,
        })
    }

    /// The record at a unit-relative byte offset.
    pub fn record_at(unit: &Arc<CompileUnit>, offset: usize) -> Option<DebugRecord>
    {
        unit.by_offset.get(&offset).map(|&index| DebugRecord {
            unit: Arc::clone(unit),
            index,
        })
    }
}

/// Incremental builder for a [`CompileUnit`]; records are pushed in DFS order.
pub(crate) struct UnitBuilder
{
    unit: CompileUnit,
}

impl UnitBuilder
{
    pub(crate) fn new(id: UnitId, address_size: u8) -> Self
    {
        Self {
            unit: CompileUnit {
                id,
                address_size,
                nodes: Vec::new(),
                by_offset: HashMap::new(),
            },
        }
    }

    /// Append a record under `parent` and return its index.
    pub(crate) fn push(
        &mut self,
        offset: usize,
        kind: RecordKind,
        attrs: Vec<(DwAt, AttrValue)>,
        parent: Option<usize>,
    ) -> usize
    {
        let index = self.unit.nodes.len();
        let name = attrs.iter().find_map(|(at, value)| match (at, value) {
            (&gimli::DW_AT_name, AttrValue::String(name)) => Some(name.clone()),
            _ => None,
        });
        self.unit.nodes.push(RecordNode {
            offset,
            kind,
            name,
            attrs,
            parent,
            children: Vec::new(),
        });
        if let Some(parent) = parent {
            self.unit.nodes[parent].children.push(index);
        }
        self.unit.by_offset.insert(offset, index);
        index
    }

    pub(crate) fn finish(self) -> CompileUnit
    {
        self.unit
    }
}

/// Handle to one record of a decoded unit.
#[derive(Clone)]
pub struct DebugRecord
{
    unit: Arc<CompileUnit>,
    index: usize,
}

impl DebugRecord
{
    fn node(&self) -> &RecordNode
    {
        &self.unit.nodes[self.index]
    }

    fn sibling(&self, index: usize) -> DebugRecord
    {
        DebugRecord {
            unit: Arc::clone(&self.unit),
            index,
        }
    }

    pub fn id(&self) -> RecordId
    {
        RecordId {
            unit: self.unit.id,
            offset: self.node().offset,
        }
    }

    pub fn kind(&self) -> RecordKind
    {
        self.node().kind
    }

    pub fn name(&self) -> Option<&str>
    {
        self.node().name.as_deref()
    }

    pub fn unit(&self) -> &CompileUnit
    {
        &self.unit
    }

    pub fn attr(&self, name: DwAt) -> Option<&AttrValue>
    {
        self.node()
            .attrs
            .iter()
            .find_map(|(at, value)| (*at == name).then_some(value))
    }

    /// Constant attribute as unsigned; negative signed constants yield `None`.
    pub fn udata(&self, name: DwAt) -> Option<u64>
    {
        match self.attr(name)? {
            AttrValue::Unsigned(value) | AttrValue::Data { value, .. } => Some(*value),
            AttrValue::Signed(value) => u64::try_from(*value).ok(),
            _ => None,
        }
    }

    /// Constant attribute as signed; unsigned constants are reinterpreted.
    pub fn sdata(&self, name: DwAt) -> Option<i64>
    {
        match self.attr(name)? {
            AttrValue::Signed(value) => Some(*value),
            #[allow(clippy::cast_possible_wrap)]
            AttrValue::Unsigned(value) | AttrValue::Data { value, .. } => Some(*value as i64),
            _ => None,
        }
    }

    /// Constant attribute interpreted for a type of the given signedness.
    ///
    /// Fixed-width data forms are sign-extended from their own width when
    /// `signed` is set, so `data4 0xffffffff` reads as -1 for an `int`.
    pub fn constant(&self, name: DwAt, signed: bool) -> Option<i64>
    {
        match self.attr(name)? {
            AttrValue::Data { value, width } if signed => Some(sign_extend(*value, *width)),
            _ => self.sdata(name),
        }
    }

    pub fn string(&self, name: DwAt) -> Option<&str>
    {
        match self.attr(name)? {
            AttrValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn reference(&self, name: DwAt) -> Option<RecordId>
    {
        match self.attr(name)? {
            AttrValue::Reference(id) => Some(*id),
            _ => None,
        }
    }

    /// `true` only for a present flag attribute set to true.
    pub fn flag(&self, name: DwAt) -> bool
    {
        matches!(self.attr(name), Some(AttrValue::Flag(true)))
    }

    /// Whether this record only declares something defined elsewhere.
    pub fn is_declaration(&self) -> bool
    {
        self.flag(gimli::DW_AT_declaration)
    }

    /// Identity of the declared type (`DW_AT_type`).
    ///
    /// ## Errors
    ///
    /// `MissingAttribute` if the record has no type reference.
    pub fn type_ref(&self) -> Result<RecordId>
    {
        self.reference(gimli::DW_AT_type).ok_or(MemlensError::MissingAttribute {
            record: self.id(),
            attribute: "DW_AT_type",
        })
    }

    pub fn parent(&self) -> Option<DebugRecord>
    {
        self.node().parent.map(|index| self.sibling(index))
    }

    pub fn children(&self) -> impl Iterator<Item = DebugRecord> + '_
    {
        self.node().children.iter().map(|&index| self.sibling(index))
    }
}

#[allow(clippy::cast_possible_wrap)]
fn sign_extend(value: u64, width: u8) -> i64
{
    let bits = u32::from(width) * 8;
    if bits == 0 || bits >= 64 {
        return value as i64;
    }
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

impl PartialEq for DebugRecord
{
    fn eq(&self, other: &Self) -> bool
    {
        self.id() == other.id()
    }
}

impl Eq for DebugRecord {}

impl fmt::Debug for DebugRecord
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("DebugRecord")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("name", &self.name())
            .finish()
    }
}
