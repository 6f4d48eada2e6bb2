//! Tests for type resolution over real DWARF

use common::DebugBinary;
use gimli::write::AttributeValue;
use memlens_core::debuginfo::{DebugIndex, RecordKind};
use memlens_core::error::MemlensError;
use memlens_core::resolver::TypeResolver;
use memlens_core::types::{BaseEncoding, Qualifier, TypeDescriptor, TypeId};

mod common;

fn open(binary: DebugBinary) -> (tempfile::TempDir, DebugIndex)
{
    let dir = tempfile::tempdir().unwrap();
    let path = common::path_in(&dir, "vmlinux");
    binary.write(&path);
    let index = DebugIndex::open([&path]);
    assert_eq!(index.len(), 1);
    (dir, index)
}

fn resolve_named(resolver: &mut TypeResolver, index: &DebugIndex, name: &str, kind: RecordKind) -> TypeId
{
    let record = index.find(name, kind).unwrap();
    resolver.resolve(index, &record).unwrap()
}

#[test]
fn test_self_referential_struct_resolves_once()
{
    let mut binary = DebugBinary::new();
    let list = binary.structure("list_head", 16);
    let pointer = binary.pointer(Some(list));
    binary.member(list, "next", pointer, 0);
    binary.member(list, "prev", pointer, 8);
    let (_dir, index) = open(binary);

    let mut resolver = TypeResolver::new();
    let first = resolve_named(&mut resolver, &index, "list_head", RecordKind::StructureType);
    let steps = resolver.steps();
    let second = resolve_named(&mut resolver, &index, "list_head", RecordKind::StructureType);

    assert_eq!(first, second);
    assert_eq!(steps, 2);
    assert_eq!(resolver.steps(), steps);

    let Some(TypeDescriptor::Struct(compound)) = resolver.get(first) else {
        panic!("list_head should be a struct");
    };
    assert_eq!(compound.size, Some(16));
    let next = compound.member("next").unwrap();
    assert_eq!(resolver.get(next.ty), Some(&TypeDescriptor::Pointer { referent: first, size: 8 }));
    assert_eq!(compound.member("prev").unwrap().ty, next.ty);
}

#[test]
fn test_mutual_recursion_shares_instances()
{
    let mut binary = DebugBinary::new();
    let a = binary.structure("a", 8);
    let b = binary.structure("b", 8);
    let a_ptr = binary.pointer(Some(a));
    let b_ptr = binary.pointer(Some(b));
    binary.member(a, "b", b_ptr, 0);
    binary.member(b, "a", a_ptr, 0);
    let (_dir, index) = open(binary);

    let mut resolver = TypeResolver::new();
    let a_id = resolve_named(&mut resolver, &index, "a", RecordKind::StructureType);
    let steps = resolver.steps();
    let b_id = resolve_named(&mut resolver, &index, "b", RecordKind::StructureType);
    assert_eq!(resolver.steps(), steps, "b was resolved as part of a");

    let Some(TypeDescriptor::Struct(a_struct)) = resolver.get(a_id) else {
        panic!("a should be a struct");
    };
    let Some(TypeDescriptor::Pointer { referent, .. }) = resolver.get(a_struct.members[0].ty) else {
        panic!("a.b should be a pointer");
    };
    assert_eq!(*referent, b_id);

    let Some(TypeDescriptor::Struct(b_struct)) = resolver.get(b_id) else {
        panic!("b should be a struct");
    };
    let Some(TypeDescriptor::Pointer { referent, .. }) = resolver.get(b_struct.members[0].ty) else {
        panic!("b.a should be a pointer");
    };
    assert_eq!(*referent, a_id);
}

#[test]
fn test_member_offsets_are_verbatim()
{
    let mut binary = DebugBinary::new();
    let char_type = binary.base_type("char", 1, gimli::DW_ATE_signed_char);
    let long = binary.base_type("long", 8, gimli::DW_ATE_signed);
    let packed = binary.structure("packed", 13);
    binary.member(packed, "tag", char_type, 0);
    binary.member(packed, "value", long, 1);
    binary.member(packed, "tail", char_type, 12);
    let (_dir, index) = open(binary);

    let mut resolver = TypeResolver::new();
    let id = resolve_named(&mut resolver, &index, "packed", RecordKind::StructureType);
    let Some(TypeDescriptor::Struct(compound)) = resolver.get(id) else {
        panic!("packed should be a struct");
    };

    let offsets: Vec<(Option<&str>, u64)> = compound
        .members
        .iter()
        .map(|member| (member.name.as_deref(), member.byte_offset))
        .collect();
    assert_eq!(offsets, vec![(Some("tag"), 0), (Some("value"), 1), (Some("tail"), 12)]);
    assert_eq!(resolver.arena().size_of(id), Some(13));
}

#[test]
fn test_bit_field_members()
{
    let mut binary = DebugBinary::new();
    let uint = binary.base_type("unsigned int", 4, gimli::DW_ATE_unsigned);
    let flags = binary.structure("flags", 4);
    let low = binary.entry(flags, gimli::DW_TAG_member);
    binary.set_name(low, "low");
    binary.set_type(low, uint);
    binary.set(low, gimli::DW_AT_bit_size, AttributeValue::Udata(3));
    binary.set(low, gimli::DW_AT_data_bit_offset, AttributeValue::Udata(0));
    let high = binary.entry(flags, gimli::DW_TAG_member);
    binary.set_name(high, "high");
    binary.set_type(high, uint);
    binary.set(high, gimli::DW_AT_bit_size, AttributeValue::Udata(5));
    binary.set(high, gimli::DW_AT_data_bit_offset, AttributeValue::Udata(11));
    let (_dir, index) = open(binary);

    let mut resolver = TypeResolver::new();
    let id = resolve_named(&mut resolver, &index, "flags", RecordKind::StructureType);
    let Some(TypeDescriptor::Struct(compound)) = resolver.get(id) else {
        panic!("flags should be a struct");
    };
    let high = compound.member("high").unwrap();
    assert_eq!(high.byte_offset, 1);
    assert_eq!(high.bit_offset, Some(3));
    assert_eq!(high.bit_size, Some(5));
}

#[test]
fn test_declaration_only_struct_is_incomplete()
{
    let mut binary = DebugBinary::new();
    let opaque = binary.declaration(gimli::DW_TAG_structure_type, "opaque");
    let pointer = binary.pointer(Some(opaque));
    binary.variable("handle", Some(pointer));
    let (_dir, index) = open(binary);

    let mut resolver = TypeResolver::new();
    let variable = index.find("handle", RecordKind::Variable).unwrap();
    let pointer = resolver.resolve(&index, &index.type_of(&variable).unwrap()).unwrap();

    let Some(TypeDescriptor::Pointer { referent, size }) = resolver.get(pointer) else {
        panic!("handle should be a pointer");
    };
    assert_eq!(*size, 8);
    let Some(TypeDescriptor::Struct(compound)) = resolver.get(*referent) else {
        panic!("referent should be a struct");
    };
    assert!(!compound.is_complete());
    assert!(compound.members.is_empty());
    assert_eq!(resolver.arena().type_name(pointer), "struct opaque *");
}

#[test]
fn test_typedefs_qualifiers_and_void_pointers()
{
    let mut binary = DebugBinary::new();
    let root = binary.root();
    let ulong = binary.base_type("unsigned long", 8, gimli::DW_ATE_unsigned);
    let constant = binary.entry(root, gimli::DW_TAG_const_type);
    binary.set_type(constant, ulong);
    let alias = binary.entry(root, gimli::DW_TAG_typedef);
    binary.set_name(alias, "cjiffies_t");
    binary.set_type(alias, constant);
    let void_ptr = binary.pointer(None);
    let handle = binary.entry(root, gimli::DW_TAG_typedef);
    binary.set_name(handle, "handle_t");
    binary.set_type(handle, void_ptr);
    let (_dir, index) = open(binary);

    let mut resolver = TypeResolver::new();
    let alias = resolve_named(&mut resolver, &index, "cjiffies_t", RecordKind::Typedef);
    let arena = resolver.arena();
    assert_eq!(arena.size_of(alias), Some(8));
    let Some(TypeDescriptor::Typedef { underlying, .. }) = arena.get(alias) else {
        panic!("expected typedef");
    };
    assert!(matches!(
        arena.get(*underlying),
        Some(TypeDescriptor::Qualified {
            qualifier: Qualifier::Const,
            ..
        })
    ));
    let Some(TypeDescriptor::Base { encoding, .. }) = arena.get(arena.strip_typedefs(alias)) else {
        panic!("expected base type");
    };
    assert_eq!(*encoding, BaseEncoding::Unsigned);

    let handle = resolve_named(&mut resolver, &index, "handle_t", RecordKind::Typedef);
    let pointer = resolver.arena().strip_typedefs(handle);
    assert_eq!(
        resolver.get(pointer),
        Some(&TypeDescriptor::Pointer {
            referent: TypeId::VOID,
            size: 8
        })
    );
}

#[test]
fn test_enum_values()
{
    let mut binary = DebugBinary::new();
    let root = binary.root();
    let int = binary.base_type("int", 4, gimli::DW_ATE_signed);
    let level = binary.entry(root, gimli::DW_TAG_enumeration_type);
    binary.set_name(level, "level");
    binary.set(level, gimli::DW_AT_byte_size, AttributeValue::Udata(4));
    binary.set_type(level, int);
    for (name, value) in [("LOW", -1), ("MID", 0), ("HIGH", 7)] {
        let enumerator = binary.entry(level, gimli::DW_TAG_enumerator);
        binary.set_name(enumerator, name);
        binary.set(enumerator, gimli::DW_AT_const_value, AttributeValue::Sdata(value));
    }
    let (_dir, index) = open(binary);

    let mut resolver = TypeResolver::new();
    let id = resolve_named(&mut resolver, &index, "level", RecordKind::EnumerationType);
    let Some(TypeDescriptor::Enum {
        name,
        size,
        underlying,
        enumerators,
    }) = resolver.get(id)
    else {
        panic!("level should be an enum");
    };
    assert_eq!(name.as_deref(), Some("level"));
    assert_eq!(*size, Some(4));
    assert!(underlying.is_some());
    let values: Vec<(&str, i64)> = enumerators.iter().map(|e| (e.name.as_str(), e.value)).collect();
    assert_eq!(values, vec![("LOW", -1), ("MID", 0), ("HIGH", 7)]);
}

#[test]
fn test_fixed_width_constants_take_sign_from_type()
{
    let mut binary = DebugBinary::new();
    let root = binary.root();
    let int = binary.base_type("int", 4, gimli::DW_ATE_signed);
    let uint = binary.base_type("unsigned int", 4, gimli::DW_ATE_unsigned);
    for (enum_name, underlying, member) in [("state", int, "STATE_DEAD"), ("mask", uint, "MASK_ALL")] {
        let enumeration = binary.entry(root, gimli::DW_TAG_enumeration_type);
        binary.set_name(enumeration, enum_name);
        binary.set(enumeration, gimli::DW_AT_byte_size, AttributeValue::Udata(4));
        binary.set_type(enumeration, underlying);
        let enumerator = binary.entry(enumeration, gimli::DW_TAG_enumerator);
        binary.set_name(enumerator, member);
        binary.set(enumerator, gimli::DW_AT_const_value, AttributeValue::Data4(0xffff_ffff));
    }
    // `int empty[0]` with a one-byte upper bound of -1 over a signed index type.
    let empty = binary.entry(root, gimli::DW_TAG_array_type);
    binary.set_type(empty, int);
    let subrange = binary.entry(empty, gimli::DW_TAG_subrange_type);
    binary.set_type(subrange, int);
    binary.set(subrange, gimli::DW_AT_upper_bound, AttributeValue::Data1(0xff));
    binary.variable("empty_table", Some(empty));
    let (_dir, index) = open(binary);

    let mut resolver = TypeResolver::new();
    let value_of = |resolver: &TypeResolver, id: TypeId| match resolver.get(id) {
        Some(TypeDescriptor::Enum { enumerators, .. }) => enumerators[0].value,
        other => panic!("expected an enum, got {other:?}"),
    };
    let state = resolve_named(&mut resolver, &index, "state", RecordKind::EnumerationType);
    assert_eq!(value_of(&resolver, state), -1);
    let mask = resolve_named(&mut resolver, &index, "mask", RecordKind::EnumerationType);
    assert_eq!(value_of(&resolver, mask), 0xffff_ffff);

    let variable = index.find("empty_table", RecordKind::Variable).unwrap();
    let array = resolver.resolve(&index, &index.type_of(&variable).unwrap()).unwrap();
    assert!(matches!(resolver.get(array), Some(TypeDescriptor::Array { length: Some(0), .. })));
}

#[test]
fn test_function_pointer()
{
    let mut binary = DebugBinary::new();
    let root = binary.root();
    let int = binary.base_type("int", 4, gimli::DW_ATE_signed);
    let function = binary.entry(root, gimli::DW_TAG_subroutine_type);
    binary.set_type(function, int);
    let param = binary.entry(function, gimli::DW_TAG_formal_parameter);
    binary.set_type(param, int);
    binary.entry(function, gimli::DW_TAG_unspecified_parameters);
    let pointer = binary.pointer(Some(function));
    binary.variable("printk_fn", Some(pointer));
    let (_dir, index) = open(binary);

    let mut resolver = TypeResolver::new();
    let variable = index.find("printk_fn", RecordKind::Variable).unwrap();
    let id = resolver.resolve(&index, &index.type_of(&variable).unwrap()).unwrap();
    assert_eq!(resolver.arena().type_name(id), "int (*)(int, ...)");
}

#[test]
fn test_unsupported_kind_is_reported()
{
    let mut binary = DebugBinary::new();
    let int = binary.base_type("int", 4, gimli::DW_ATE_signed);
    binary.variable("counter", Some(int));
    let (_dir, index) = open(binary);

    let mut resolver = TypeResolver::new();
    let variable = index.find("counter", RecordKind::Variable).unwrap();
    let err = resolver.resolve(&index, &variable).unwrap_err();
    assert!(matches!(
        err,
        MemlensError::UnsupportedType {
            kind: RecordKind::Variable,
            ..
        }
    ));
    assert_eq!(resolver.arena().len(), 1);
}

#[test]
fn test_failed_resolution_leaves_cache_clean()
{
    let mut binary = DebugBinary::new();
    let int = binary.base_type("int", 4, gimli::DW_ATE_signed);
    let broken = binary.structure("broken", 8);
    binary.member(broken, "ok", int, 0);
    let bad = binary.entry(broken, gimli::DW_TAG_member);
    binary.set_name(bad, "bad");
    binary.set_type(bad, int);
    let (_dir, index) = open(binary);

    let mut resolver = TypeResolver::new();
    let record = index.find("broken", RecordKind::StructureType).unwrap();
    let err = resolver.resolve(&index, &record).unwrap_err();
    assert!(matches!(err, MemlensError::MissingAttribute { .. }));
    assert_eq!(resolver.cached(record.id()), None);
    assert_eq!(resolver.arena().len(), 1);

    // Retrying fails the same way rather than returning a half-built type.
    assert!(resolver.resolve(&index, &record).is_err());
}
