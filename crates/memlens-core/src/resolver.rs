//! # Type Resolver
//!
//! Turns type records into [`TypeDescriptor`]s stored in a [`TypeArena`].
//!
//! Every record gets an arena slot *before* its referenced types are
//! resolved, and the slot is registered under the record's identity right
//! away. A cycle (`struct list_head { struct list_head *next; }`) therefore
//! finds the placeholder and links to it instead of recursing forever, and
//! resolving the same record twice hands back the same [`TypeId`].
//!
//! A failed resolution rolls the arena and the cache back to where the
//! outermost call started, so no half-built descriptor is ever observable.

use std::collections::HashMap;

use gimli::Reader;
use tracing::trace;

use crate::debuginfo::{AttrValue, DebugRecord, RecordId, RecordKind, RecordSource};
use crate::error::{MemlensError, Result};
use crate::types::{BaseEncoding, Compound, Enumerator, Member, Qualifier, TypeArena, TypeDescriptor, TypeId};

/// Nesting limit for one resolution. Real kernels stay far below it.
pub const MAX_RESOLVE_DEPTH: usize = 512;

/// Caching resolver from record identity to type descriptor.
#[derive(Debug, Default)]
pub struct TypeResolver
{
    arena: TypeArena,
    resolved: HashMap<RecordId, TypeId>,
    depth: usize,
    steps: usize,
}

impl TypeResolver
{
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Every descriptor resolved so far.
    pub fn arena(&self) -> &TypeArena
    {
        &self.arena
    }

    pub fn get(&self, id: TypeId) -> Option<&TypeDescriptor>
    {
        self.arena.get(id)
    }

    /// Type already resolved for `record`, if any.
    pub fn cached(&self, record: RecordId) -> Option<TypeId>
    {
        self.resolved.get(&record).copied()
    }

    /// Number of records actually resolved (cache misses) so far.
    pub fn steps(&self) -> usize
    {
        self.steps
    }

    /// Resolve `record` into a descriptor, following references through `source`.
    ///
    /// ## Errors
    ///
    /// - `MissingAttribute` when a record lacks what its kind requires
    /// - `UnsupportedType` when a record (or a type it references) has no type mapping
    /// - `TypeTooDeep` past [`MAX_RESOLVE_DEPTH`] nested references
    /// - errors from `source` materializing referenced records
    pub fn resolve<S>(&mut self, source: &S, record: &DebugRecord) -> Result<TypeId>
    where
        S: RecordSource + ?Sized,
    {
        if let Some(id) = self.cached(record.id()) {
            return Ok(id);
        }

        let outermost = self.depth == 0;
        let checkpoint = self.arena.len();
        let result = self.resolve_uncached(source, record);

        if result.is_err() && outermost {
            self.arena.truncate(checkpoint);
            self.resolved.retain(|_, id| id.index() < checkpoint);
        }
        result
    }

    fn resolve_uncached<S>(&mut self, source: &S, record: &DebugRecord) -> Result<TypeId>
    where
        S: RecordSource + ?Sized,
    {
        if !is_type_kind(record.kind()) {
            return Err(MemlensError::UnsupportedType {
                record: record.id(),
                kind: record.kind(),
            });
        }
        if self.depth >= MAX_RESOLVE_DEPTH {
            return Err(MemlensError::TypeTooDeep {
                record: record.id(),
                limit: MAX_RESOLVE_DEPTH,
            });
        }

        self.steps += 1;
        let id = self.arena.reserve();
        self.resolved.insert(record.id(), id);
        trace!(record = %record.id(), kind = %record.kind(), %id, "resolving type");

        self.depth += 1;
        let descriptor = self.build(source, record);
        self.depth -= 1;

        self.arena.fill(id, descriptor?);
        Ok(id)
    }

    fn build<S>(&mut self, source: &S, record: &DebugRecord) -> Result<TypeDescriptor>
    where
        S: RecordSource + ?Sized,
    {
        let descriptor = match record.kind() {
            RecordKind::BaseType => TypeDescriptor::Base {
                name: required_name(record)?.to_string(),
                size: required_udata(record, gimli::DW_AT_byte_size, "DW_AT_byte_size")?,
                encoding: required_encoding(record)?,
            },
            RecordKind::PointerType => TypeDescriptor::Pointer {
                referent: self.optional_type(source, record)?,
                size: record
                    .udata(gimli::DW_AT_byte_size)
                    .unwrap_or_else(|| u64::from(record.unit().address_size())),
            },
            RecordKind::ConstType => self.qualified(source, record, Qualifier::Const)?,
            RecordKind::VolatileType => self.qualified(source, record, Qualifier::Volatile)?,
            RecordKind::RestrictType => self.qualified(source, record, Qualifier::Restrict)?,
            RecordKind::AtomicType => self.qualified(source, record, Qualifier::Atomic)?,
            RecordKind::Typedef => TypeDescriptor::Typedef {
                name: required_name(record)?.to_string(),
                underlying: self.optional_type(source, record)?,
            },
            RecordKind::StructureType | RecordKind::ClassType => {
                TypeDescriptor::Struct(self.compound(source, record, false)?)
            }
            RecordKind::UnionType => TypeDescriptor::Union(self.compound(source, record, true)?),
            RecordKind::EnumerationType => self.enumeration(source, record)?,
            RecordKind::ArrayType => self.array(source, record)?,
            RecordKind::SubroutineType => self.subroutine(source, record)?,
            kind => {
                return Err(MemlensError::UnsupportedType {
                    record: record.id(),
                    kind,
                })
            }
        };
        Ok(descriptor)
    }

    /// Type named by `DW_AT_type`, or `void` when the attribute is absent.
    fn optional_type<S>(&mut self, source: &S, record: &DebugRecord) -> Result<TypeId>
    where
        S: RecordSource + ?Sized,
    {
        match record.reference(gimli::DW_AT_type) {
            Some(target) => {
                let target = source.record(target)?;
                self.resolve(source, &target)
            }
            None => Ok(TypeId::VOID),
        }
    }

    fn required_type<S>(&mut self, source: &S, record: &DebugRecord) -> Result<TypeId>
    where
        S: RecordSource + ?Sized,
    {
        let target = source.record(record.type_ref()?)?;
        self.resolve(source, &target)
    }

    fn qualified<S>(&mut self, source: &S, record: &DebugRecord, qualifier: Qualifier) -> Result<TypeDescriptor>
    where
        S: RecordSource + ?Sized,
    {
        Ok(TypeDescriptor::Qualified {
            qualifier,
            underlying: self.optional_type(source, record)?,
        })
    }

    fn compound<S>(&mut self, source: &S, record: &DebugRecord, is_union: bool) -> Result<Compound>
    where
        S: RecordSource + ?Sized,
    {
        let name = record.name().map(str::to_string);
        let size = record.udata(gimli::DW_AT_byte_size);

        if record.is_declaration() && size.is_none() {
            return Ok(Compound {
                name,
                size: None,
                members: Vec::new(),
            });
        }
        let size = size.ok_or(MemlensError::MissingAttribute {
            record: record.id(),
            attribute: "DW_AT_byte_size",
        })?;

        let mut members = Vec::new();
        for child in record.children().filter(|child| child.kind() == RecordKind::Member) {
            let ty = self.required_type(source, &child)?;
            let bit_size = child.udata(gimli::DW_AT_bit_size);
            let (byte_offset, bit_offset) = member_location(&child, is_union, bit_size)?;
            members.push(Member {
                name: child.name().map(str::to_string),
                byte_offset,
                ty,
                bit_size,
                bit_offset,
            });
        }

        Ok(Compound {
            name,
            size: Some(size),
            members,
        })
    }

    fn enumeration<S>(&mut self, source: &S, record: &DebugRecord) -> Result<TypeDescriptor>
    where
        S: RecordSource + ?Sized,
    {
        let underlying = match record.reference(gimli::DW_AT_type) {
            Some(_) => Some(self.required_type(source, record)?),
            None => None,
        };

        let signed = constant_signedness(source, record)?.unwrap_or(false);
        let mut enumerators = Vec::new();
        for child in record.children().filter(|child| child.kind() == RecordKind::Enumerator) {
            let value = child.constant(gimli::DW_AT_const_value, signed).ok_or(MemlensError::MissingAttribute {
                record: child.id(),
                attribute: "DW_AT_const_value",
            })?;
            enumerators.push(Enumerator {
                name: required_name(&child)?.to_string(),
                value,
            });
        }

        Ok(TypeDescriptor::Enum {
            name: record.name().map(str::to_string),
            size: record.udata(gimli::DW_AT_byte_size),
            underlying,
            enumerators,
        })
    }

    /// `int x[2][3]` is one record with two subranges; it becomes an array of
    /// two arrays of three. The outer dimension fills the reserved slot.
    fn array<S>(&mut self, source: &S, record: &DebugRecord) -> Result<TypeDescriptor>
    where
        S: RecordSource + ?Sized,
    {
        let element = self.required_type(source, record)?;
        let mut lengths: Vec<Option<u64>> = Vec::new();
        for subrange in record.children().filter(|child| child.kind() == RecordKind::SubrangeType) {
            // C index types without DW_AT_type are plain `int`.
            let signed = constant_signedness(source, &subrange)?.unwrap_or(true);
            lengths.push(subrange_length(&subrange, signed));
        }
        if lengths.is_empty() {
            lengths.push(None);
        }

        let mut inner = element;
        for length in lengths.iter().skip(1).rev() {
            inner = self.arena.push(TypeDescriptor::Array {
                element: inner,
                length: *length,
            });
        }
        Ok(TypeDescriptor::Array {
            element: inner,
            length: lengths[0],
        })
    }

    fn subroutine<S>(&mut self, source: &S, record: &DebugRecord) -> Result<TypeDescriptor>
    where
        S: RecordSource + ?Sized,
    {
        let return_type = self.optional_type(source, record)?;
        let mut params = Vec::new();
        let mut variadic = false;
        for child in record.children() {
            match child.kind() {
                RecordKind::FormalParameter => params.push(self.required_type(source, &child)?),
                RecordKind::UnspecifiedParameters => variadic = true,
                _ => {}
            }
        }
        Ok(TypeDescriptor::Function {
            return_type,
            params,
            variadic,
        })
    }
}

fn is_type_kind(kind: RecordKind) -> bool
{
    matches!(
        kind,
        RecordKind::BaseType
            | RecordKind::PointerType
            | RecordKind::ConstType
            | RecordKind::VolatileType
            | RecordKind::RestrictType
            | RecordKind::AtomicType
            | RecordKind::Typedef
            | RecordKind::StructureType
            | RecordKind::ClassType
            | RecordKind::UnionType
            | RecordKind::EnumerationType
            | RecordKind::ArrayType
            | RecordKind::SubroutineType
    )
}

fn required_name(record: &DebugRecord) -> Result<&str>
{
    record.name().ok_or(MemlensError::MissingAttribute {
        record: record.id(),
        attribute: "DW_AT_name",
    })
}

fn required_udata(record: &DebugRecord, name: gimli::DwAt, attribute: &'static str) -> Result<u64>
{
    record.udata(name).ok_or(MemlensError::MissingAttribute {
        record: record.id(),
        attribute,
    })
}

fn required_encoding(record: &DebugRecord) -> Result<BaseEncoding>
{
    let raw = required_udata(record, gimli::DW_AT_encoding, "DW_AT_encoding")?;
    let raw = u8::try_from(raw).map_err(|_| MemlensError::MissingAttribute {
        record: record.id(),
        attribute: "DW_AT_encoding",
    })?;
    Ok(BaseEncoding::from(gimli::DwAte(raw)))
}

/// Element count of one subrange: `DW_AT_count`, else bounds, else unknown.
fn subrange_length(subrange: &DebugRecord, signed: bool) -> Option<u64>
{
    if let Some(count) = subrange.udata(gimli::DW_AT_count) {
        return Some(count);
    }
    let lower = subrange.constant(gimli::DW_AT_lower_bound, signed).unwrap_or(0);
    let upper = match subrange.attr(gimli::DW_AT_upper_bound)? {
        // `int x[0]` is emitted with an upper bound of -1.
        AttrValue::Signed(upper) => *upper,
        AttrValue::Data { .. } if signed => subrange.constant(gimli::DW_AT_upper_bound, true)?,
        AttrValue::Unsigned(_) | AttrValue::Data { .. } => {
            let upper = subrange.udata(gimli::DW_AT_upper_bound)?;
            let lower = u64::try_from(lower).ok()?;
            return upper.checked_sub(lower)?.checked_add(1);
        }
        _ => return None,
    };
    u64::try_from(upper.checked_sub(lower)?.checked_add(1)?).ok()
}

/// Whether constants on `record` (enumerator values, subrange bounds) are
/// signed, judged by the base type under its `DW_AT_type`. `None` when the
/// record names no type.
fn constant_signedness<S>(source: &S, record: &DebugRecord) -> Result<Option<bool>>
where
    S: RecordSource + ?Sized,
{
    let mut next = record.reference(gimli::DW_AT_type);
    for _ in 0..MAX_RESOLVE_DEPTH {
        let Some(id) = next else {
            return Ok(None);
        };
        let target = source.record(id)?;
        match target.kind() {
            RecordKind::BaseType => return Ok(Some(required_encoding(&target)?.is_signed())),
            RecordKind::Typedef
            | RecordKind::ConstType
            | RecordKind::VolatileType
            | RecordKind::AtomicType
            | RecordKind::EnumerationType => next = target.reference(gimli::DW_AT_type),
            _ => return Ok(Some(false)),
        }
    }
    Err(MemlensError::TypeTooDeep {
        record: record.id(),
        limit: MAX_RESOLVE_DEPTH,
    })
}

/// Byte and bit position of a member, taken verbatim from the record.
fn member_location(member: &DebugRecord, is_union: bool, bit_size: Option<u64>) -> Result<(u64, Option<u64>)>
{
    let missing = || MemlensError::MissingAttribute {
        record: member.id(),
        attribute: "DW_AT_data_member_location",
    };

    if let Some(bits) = member.udata(gimli::DW_AT_data_bit_offset) {
        return Ok((bits / 8, Some(bits % 8)));
    }

    let byte_offset = match member.attr(gimli::DW_AT_data_member_location) {
        Some(AttrValue::Unsigned(offset) | AttrValue::Data { value: offset, .. }) => *offset,
        Some(AttrValue::Expr(expression) | AttrValue::Block(expression)) => {
            constant_offset_expression(expression).ok_or_else(missing)?
        }
        Some(_) => return Err(missing()),
        None if is_union => 0,
        None => return Err(missing()),
    };

    // DWARF 2/3 bit-fields count DW_AT_bit_offset from the most significant
    // bit of a storage unit of DW_AT_byte_size bytes.
    if let (Some(bit_size), Some(msb_offset), Some(storage)) = (
        bit_size,
        member.udata(gimli::DW_AT_bit_offset),
        member.udata(gimli::DW_AT_byte_size),
    ) {
        let lsb_offset = (storage * 8).checked_sub(msb_offset + bit_size).ok_or_else(missing)?;
        let total = byte_offset * 8 + lsb_offset;
        return Ok((total / 8, Some(total % 8)));
    }

    Ok((byte_offset, None))
}

/// Decode `DW_OP_plus_uconst N` or `DW_OP_constu N`, the only forms compilers
/// emit for a constant member offset.
fn constant_offset_expression(bytes: &[u8]) -> Option<u64>
{
    let (&op, operand) = bytes.split_first()?;
    if op != gimli::DW_OP_plus_uconst.0 && op != gimli::DW_OP_constu.0 {
        return None;
    }
    let mut reader = gimli::EndianSlice::new(operand, gimli::LittleEndian);
    let value = reader.read_uleb128().ok()?;
    reader.is_empty().then_some(value)
}

#[cfg(test)]
mod tests
{
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;
    use crate::debuginfo::{CompileUnit, UnitBuilder, UnitId};

    const UNIT: UnitId = UnitId { binary: 0, unit: 0 };

    struct Units(HashMap<UnitId, Arc<CompileUnit>>);

    impl RecordSource for Units
    {
        fn record(&self, id: RecordId) -> Result<DebugRecord>
        {
            self.0
                .get(&id.unit)
                .and_then(|unit| CompileUnit::record_at(unit, id.offset))
                .ok_or(MemlensError::InvalidRecordId(id))
        }
    }

    fn id(offset: usize) -> RecordId
    {
        RecordId { unit: UNIT, offset }
    }

    fn name(name: &str) -> (gimli::DwAt, AttrValue)
    {
        (gimli::DW_AT_name, AttrValue::String(name.to_string()))
    }

    fn udata(at: gimli::DwAt, value: u64) -> (gimli::DwAt, AttrValue)
    {
        (at, AttrValue::Unsigned(value))
    }

    fn type_ref(offset: usize) -> (gimli::DwAt, AttrValue)
    {
        (gimli::DW_AT_type, AttrValue::Reference(id(offset)))
    }

    /// Unit with `int` at 0x10 and `struct list_head { struct list_head *next, *prev; }`
    /// at 0x20 (pointer at 0x40).
    fn list_head_unit() -> Units
    {
        let mut builder = UnitBuilder::new(UNIT, 8);
        let root = builder.push(0x0b, RecordKind::CompileUnit, Vec::new(), None);
        builder.push(
            0x10,
            RecordKind::BaseType,
            vec![
                name("int"),
                udata(gimli::DW_AT_byte_size, 4),
                udata(gimli::DW_AT_encoding, u64::from(gimli::DW_ATE_signed.0)),
            ],
            Some(root),
        );
        let list = builder.push(
            0x20,
            RecordKind::StructureType,
            vec![name("list_head"), udata(gimli::DW_AT_byte_size, 16)],
            Some(root),
        );
        builder.push(
            0x28,
            RecordKind::Member,
            vec![name("next"), type_ref(0x40), udata(gimli::DW_AT_data_member_location, 0)],
            Some(list),
        );
        builder.push(
            0x30,
            RecordKind::Member,
            vec![name("prev"), type_ref(0x40), udata(gimli::DW_AT_data_member_location, 8)],
            Some(list),
        );
        builder.push(
            0x40,
            RecordKind::PointerType,
            vec![udata(gimli::DW_AT_byte_size, 8), type_ref(0x20)],
            Some(root),
        );
        builder.push(0x50, RecordKind::Variable, vec![name("x"), type_ref(0x10)], Some(root));
        builder.push(0x60, RecordKind::Typedef, vec![name("broken_t"), type_ref(0x50)], Some(root));
        builder.push(
            0x70,
            RecordKind::StructureType,
            vec![name("holder"), udata(gimli::DW_AT_byte_size, 8)],
            Some(root),
        );
        Units(HashMap::from([(UNIT, Arc::new(builder.finish()))]))
    }

    #[test]
    fn test_self_referential_struct()
    {
        let units = list_head_unit();
        let mut resolver = TypeResolver::new();
        let record = units.record(id(0x20)).unwrap();

        let first = resolver.resolve(&units, &record).unwrap();
        let steps = resolver.steps();
        let second = resolver.resolve(&units, &record).unwrap();

        assert_eq!(first, second);
        assert_eq!(resolver.steps(), steps);
        assert_eq!(steps, 2);

        let Some(TypeDescriptor::Struct(list)) = resolver.get(first) else {
            panic!("expected a struct");
        };
        let next = list.member("next").unwrap();
        assert_eq!(resolver.get(next.ty), Some(&TypeDescriptor::Pointer { referent: first, size: 8 }));
        assert_eq!(list.member("prev").unwrap().byte_offset, 8);
        assert_eq!(resolver.arena().type_name(next.ty), "struct list_head *");
    }

    #[test]
    fn test_failure_rolls_back()
    {
        let units = list_head_unit();
        let mut resolver = TypeResolver::new();
        let before = resolver.arena().len();

        let err = resolver.resolve(&units, &units.record(id(0x60)).unwrap()).unwrap_err();
        assert!(matches!(
            err,
            MemlensError::UnsupportedType {
                kind: RecordKind::Variable,
                ..
            }
        ));
        assert_eq!(resolver.arena().len(), before);
        assert_eq!(resolver.cached(id(0x60)), None);

        let int = resolver.resolve(&units, &units.record(id(0x10)).unwrap()).unwrap();
        assert_eq!(resolver.arena().type_name(int), "int");
    }

    #[test]
    fn test_struct_member_without_location_is_rejected()
    {
        let mut builder = UnitBuilder::new(UNIT, 8);
        let root = builder.push(0x0b, RecordKind::CompileUnit, Vec::new(), None);
        builder.push(
            0x10,
            RecordKind::BaseType,
            vec![
                name("char"),
                udata(gimli::DW_AT_byte_size, 1),
                udata(gimli::DW_AT_encoding, u64::from(gimli::DW_ATE_signed_char.0)),
            ],
            Some(root),
        );
        let strukt = builder.push(
            0x20,
            RecordKind::StructureType,
            vec![name("s"), udata(gimli::DW_AT_byte_size, 1)],
            Some(root),
        );
        builder.push(0x28, RecordKind::Member, vec![name("c"), type_ref(0x10)], Some(strukt));
        let union = builder.push(
            0x30,
            RecordKind::UnionType,
            vec![name("u"), udata(gimli::DW_AT_byte_size, 1)],
            Some(root),
        );
        builder.push(0x38, RecordKind::Member, vec![name("c"), type_ref(0x10)], Some(union));
        let units = Units(HashMap::from([(UNIT, Arc::new(builder.finish()))]));
        let mut resolver = TypeResolver::new();

        let err = resolver.resolve(&units, &units.record(id(0x20)).unwrap()).unwrap_err();
        assert!(matches!(
            err,
            MemlensError::MissingAttribute {
                attribute: "DW_AT_data_member_location",
                ..
            }
        ));

        let union = resolver.resolve(&units, &units.record(id(0x30)).unwrap()).unwrap();
        let Some(TypeDescriptor::Union(union)) = resolver.get(union) else {
            panic!("expected a union");
        };
        assert_eq!(union.members[0].byte_offset, 0);
    }

    #[test]
    fn test_multidimensional_array()
    {
        let mut builder = UnitBuilder::new(UNIT, 8);
        let root = builder.push(0x0b, RecordKind::CompileUnit, Vec::new(), None);
        builder.push(
            0x10,
            RecordKind::BaseType,
            vec![
                name("int"),
                udata(gimli::DW_AT_byte_size, 4),
                udata(gimli::DW_AT_encoding, u64::from(gimli::DW_ATE_signed.0)),
            ],
            Some(root),
        );
        let array = builder.push(0x20, RecordKind::ArrayType, vec![type_ref(0x10)], Some(root));
        builder.push(0x28, RecordKind::SubrangeType, vec![udata(gimli::DW_AT_upper_bound, 1)], Some(array));
        builder.push(0x2c, RecordKind::SubrangeType, vec![udata(gimli::DW_AT_count, 3)], Some(array));
        let flexible = builder.push(0x30, RecordKind::ArrayType, vec![type_ref(0x10)], Some(root));
        builder.push(0x38, RecordKind::SubrangeType, Vec::new(), Some(flexible));
        let units = Units(HashMap::from([(UNIT, Arc::new(builder.finish()))]));
        let mut resolver = TypeResolver::new();

        let matrix = resolver.resolve(&units, &units.record(id(0x20)).unwrap()).unwrap();
        assert_eq!(resolver.arena().size_of(matrix), Some(24));
        assert_eq!(resolver.arena().type_name(matrix), "int [3] [2]");

        let flexible = resolver.resolve(&units, &units.record(id(0x30)).unwrap()).unwrap();
        assert_eq!(resolver.arena().size_of(flexible), None);
    }

    #[test]
    fn test_constant_offset_expression()
    {
        assert_eq!(constant_offset_expression(&[0x23, 0x90, 0x01]), Some(0x90));
        assert_eq!(constant_offset_expression(&[0x10, 0x08]), Some(8));
        assert_eq!(constant_offset_expression(&[0x91, 0x08]), None);
        assert_eq!(constant_offset_expression(&[]), None);
    }
}
