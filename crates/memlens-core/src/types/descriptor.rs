//! Resolved type descriptors and the arena that owns them.
//!
//! Descriptors never own each other. Every reference between types (a pointer's
//! referent, a member's type, a typedef's target) is a [`TypeId`] into one
//! [`TypeArena`]; that is what lets `struct list_head` point at itself.

use std::fmt;

/// Index of a descriptor inside a [`TypeArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(u32);

impl TypeId
{
    /// The shared `void` descriptor; slot 0 of every arena.
    pub const VOID: TypeId = TypeId(0);

    pub fn index(self) -> usize
    {
        self.0 as usize
    }
}

impl fmt::Display for TypeId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "#{}", self.0)
    }
}

/// `DW_AT_encoding` of a base type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseEncoding
{
    Signed,
    Unsigned,
    SignedChar,
    UnsignedChar,
    Boolean,
    Float,
    ComplexFloat,
    Address,
    Other(u8),
}

impl From<gimli::DwAte> for BaseEncoding
{
    fn from(encoding: gimli::DwAte) -> Self
    {
        match encoding {
            gimli::DW_ATE_signed => BaseEncoding::Signed,
            gimli::DW_ATE_unsigned => BaseEncoding::Unsigned,
            gimli::DW_ATE_signed_char => BaseEncoding::SignedChar,
            gimli::DW_ATE_unsigned_char | gimli::DW_ATE_UTF => BaseEncoding::UnsignedChar,
            gimli::DW_ATE_boolean => BaseEncoding::Boolean,
            gimli::DW_ATE_float => BaseEncoding::Float,
            gimli::DW_ATE_complex_float => BaseEncoding::ComplexFloat,
            gimli::DW_ATE_address => BaseEncoding::Address,
            other => BaseEncoding::Other(other.0),
        }
    }
}

impl BaseEncoding
{
    pub fn is_signed(self) -> bool
    {
        matches!(self, BaseEncoding::Signed | BaseEncoding::SignedChar)
    }
}

/// Type qualifier wrapping another type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qualifier
{
    Const,
    Volatile,
    Restrict,
    Atomic,
}

impl fmt::Display for Qualifier
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let label = match self {
            Qualifier::Const => "const",
            Qualifier::Volatile => "volatile",
            Qualifier::Restrict => "restrict",
            Qualifier::Atomic => "_Atomic",
        };
        write!(f, "{label}")
    }
}

/// One member of a struct or union, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member
{
    /// `None` for anonymous struct/union members.
    pub name: Option<String>,
    /// Byte offset from the start of the enclosing type, as declared.
    pub byte_offset: u64,
    pub ty: TypeId,
    /// Width in bits for bit-field members.
    pub bit_size: Option<u64>,
    /// Bit position inside the byte at `byte_offset` for bit-field members.
    pub bit_offset: Option<u64>,
}

/// Layout shared by structs and unions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compound
{
    pub name: Option<String>,
    /// `None` for incomplete (declaration-only) types.
    pub size: Option<u64>,
    pub members: Vec<Member>,
}

impl Compound
{
    pub fn is_complete(&self) -> bool
    {
        self.size.is_some()
    }

    pub fn member(&self, name: &str) -> Option<&Member>
    {
        self.members.iter().find(|member| member.name.as_deref() == Some(name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enumerator
{
    pub name: String,
    pub value: i64,
}

/// A resolved source-level type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeDescriptor
{
    Void,
    Base
    {
        name: String,
        size: u64,
        encoding: BaseEncoding,
    },
    Pointer
    {
        referent: TypeId,
        size: u64,
    },
    Array
    {
        element: TypeId,
        /// `None` for flexible or unbounded arrays.
        length: Option<u64>,
    },
    Struct(Compound),
    Union(Compound),
    Enum
    {
        name: Option<String>,
        size: Option<u64>,
        underlying: Option<TypeId>,
        enumerators: Vec<Enumerator>,
    },
    Typedef
    {
        name: String,
        underlying: TypeId,
    },
    Qualified
    {
        qualifier: Qualifier,
        underlying: TypeId,
    },
    Function
    {
        return_type: TypeId,
        params: Vec<TypeId>,
        variadic: bool,
    },
}

const MAX_NAME_DEPTH: usize = 32;
const MAX_ALIAS_DEPTH: usize = 64;

/// Owner of every descriptor produced by one resolver.
///
/// Slots are reserved before they are filled so that recursive references
/// can name a type that is still being resolved. Once filled a slot is never
/// changed.
#[derive(Debug, Clone)]
pub struct TypeArena
{
    slots: Vec<Option<TypeDescriptor>>,
}

impl Default for TypeArena
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl TypeArena
{
    #[must_use]
    pub fn new() -> Self
    {
        Self {
            slots: vec![Some(TypeDescriptor::Void)],
        }
    }

    /// Number of slots, including `void` and any unfilled reservations.
    pub fn len(&self) -> usize
    {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.slots.is_empty()
    }

    pub(crate) fn reserve(&mut self) -> TypeId
    {
        let id = self.next_id();
        self.slots.push(None);
        id
    }

    pub(crate) fn fill(&mut self, id: TypeId, descriptor: TypeDescriptor)
    {
        let slot = &mut self.slots[id.index()];
        debug_assert!(slot.is_none(), "type slot {id} filled twice");
        *slot = Some(descriptor);
    }

    pub(crate) fn push(&mut self, descriptor: TypeDescriptor) -> TypeId
    {
        let id = self.next_id();
        self.slots.push(Some(descriptor));
        id
    }

    /// Drop every slot at or after `len`. Used to roll back a failed resolution.
    pub(crate) fn truncate(&mut self, len: usize)
    {
        self.slots.truncate(len.max(1));
    }

    fn next_id(&self) -> TypeId
    {
        let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        TypeId(index)
    }

    /// Descriptor for `id`, or `None` for an unknown id or an unfilled reservation.
    pub fn get(&self, id: TypeId) -> Option<&TypeDescriptor>
    {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    /// Follow typedefs and qualifiers down to the type that defines the layout.
    pub fn strip_typedefs(&self, id: TypeId) -> TypeId
    {
        let mut current = id;
        for _ in 0..MAX_ALIAS_DEPTH {
            match self.get(current) {
                Some(TypeDescriptor::Typedef { underlying, .. } | TypeDescriptor::Qualified { underlying, .. }) => {
                    current = *underlying;
                }
                _ => break,
            }
        }
        current
    }

    /// Size in bytes, or `None` for `void`, functions, incomplete types and
    /// arrays of unknown length.
    pub fn size_of(&self, id: TypeId) -> Option<u64>
    {
        self.size_of_inner(id, 0)
    }

    fn size_of_inner(&self, id: TypeId, depth: usize) -> Option<u64>
    {
        if depth > MAX_ALIAS_DEPTH {
            return None;
        }
        match self.get(id)? {
            TypeDescriptor::Void | TypeDescriptor::Function { .. } => None,
            TypeDescriptor::Base { size, .. } | TypeDescriptor::Pointer { size, .. } => Some(*size),
            TypeDescriptor::Array { element, length } => {
                let element_size = self.size_of_inner(*element, depth + 1)?;
                element_size.checked_mul((*length)?)
            }
            TypeDescriptor::Struct(compound) | TypeDescriptor::Union(compound) => compound.size,
            TypeDescriptor::Enum { size, underlying, .. } => {
                size.or_else(|| underlying.and_then(|ty| self.size_of_inner(ty, depth + 1)))
            }
            TypeDescriptor::Typedef { underlying, .. } | TypeDescriptor::Qualified { underlying, .. } => {
                self.size_of_inner(*underlying, depth + 1)
            }
        }
    }

    /// C-style spelling of a type, e.g. `struct list_head *` or `int [16]`.
    pub fn type_name(&self, id: TypeId) -> String
    {
        self.name_inner(id, 0)
    }

    fn name_inner(&self, id: TypeId, depth: usize) -> String
    {
        if depth > MAX_NAME_DEPTH {
            return "...".to_string();
        }
        let Some(descriptor) = self.get(id) else {
            return format!("<unresolved {id}>");
        };
        match descriptor {
            TypeDescriptor::Void => "void".to_string(),
            TypeDescriptor::Base { name, .. } | TypeDescriptor::Typedef { name, .. } => name.clone(),
            TypeDescriptor::Pointer { referent, .. } => match self.get(*referent) {
                Some(TypeDescriptor::Function {
                    return_type,
                    params,
                    variadic,
                }) => format!(
                    "{} (*)({})",
                    self.name_inner(*return_type, depth + 1),
                    self.param_list(params, *variadic, depth)
                ),
                _ => format!("{} *", self.name_inner(*referent, depth + 1)),
            },
            TypeDescriptor::Array { element, length } => match length {
                Some(length) => format!("{} [{length}]", self.name_inner(*element, depth + 1)),
                None => format!("{} []", self.name_inner(*element, depth + 1)),
            },
            TypeDescriptor::Struct(compound) => tagged_name("struct", compound.name.as_deref()),
            TypeDescriptor::Union(compound) => tagged_name("union", compound.name.as_deref()),
            TypeDescriptor::Enum { name, .. } => tagged_name("enum", name.as_deref()),
            TypeDescriptor::Qualified { qualifier, underlying } => {
                format!("{qualifier} {}", self.name_inner(*underlying, depth + 1))
            }
            TypeDescriptor::Function {
                return_type,
                params,
                variadic,
            } => format!(
                "{} ({})",
                self.name_inner(*return_type, depth + 1),
                self.param_list(params, *variadic, depth)
            ),
        }
    }

    fn param_list(&self, params: &[TypeId], variadic: bool, depth: usize) -> String
    {
        let mut parts: Vec<String> = params.iter().map(|param| self.name_inner(*param, depth + 1)).collect();
        if variadic {
            parts.push("...".to_string());
        }
        if parts.is_empty() {
            "void".to_string()
        } else {
            parts.join(", ")
        }
    }
}

fn tagged_name(keyword: &str, name: Option<&str>) -> String
{
    match name {
        Some(name) => format!("{keyword} {name}"),
        None => format!("{keyword} <anonymous>"),
    }
}
