//! Fixture builders shared by the integration tests.
//!
//! Debug binaries are real ELF relocatable objects carrying DWARF 4 written
//! with `gimli::write`; memory images are hand-assembled ELF64 core files.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use gimli::write::{AttributeValue, DwarfUnit, EndianVec, Sections, UnitEntryId};

/// Builder for one binary with a single compilation unit.
pub struct DebugBinary
{
    dwarf: DwarfUnit,
}

impl DebugBinary
{
    pub fn new() -> Self
    {
        let encoding = gimli::Encoding {
            format: gimli::Format::Dwarf32,
            version: 4,
            address_size: 8,
        };
        Self {
            dwarf: DwarfUnit::new(encoding),
        }
    }

    pub fn root(&self) -> UnitEntryId
    {
        self.dwarf.unit.root()
    }

    /// Add a bare entry under `parent`.
    pub fn entry(&mut self, parent: UnitEntryId, tag: gimli::DwTag) -> UnitEntryId
    {
        self.dwarf.unit.add(parent, tag)
    }

    pub fn set(&mut self, id: UnitEntryId, attr: gimli::DwAt, value: AttributeValue)
    {
        self.dwarf.unit.get_mut(id).set(attr, value);
    }

    pub fn set_name(&mut self, id: UnitEntryId, name: &str)
    {
        self.set(id, gimli::DW_AT_name, AttributeValue::String(name.as_bytes().to_vec()));
    }

    pub fn set_type(&mut self, id: UnitEntryId, ty: UnitEntryId)
    {
        self.set(id, gimli::DW_AT_type, AttributeValue::UnitRef(ty));
    }

    pub fn base_type(&mut self, name: &str, size: u64, encoding: gimli::DwAte) -> UnitEntryId
    {
        let id = self.entry(self.root(), gimli::DW_TAG_base_type);
        self.set_name(id, name);
        self.set(id, gimli::DW_AT_byte_size, AttributeValue::Udata(size));
        self.set(id, gimli::DW_AT_encoding, AttributeValue::Encoding(encoding));
        id
    }

    /// Pointer to `target`, or `void *` for `None`.
    pub fn pointer(&mut self, target: Option<UnitEntryId>) -> UnitEntryId
    {
        let id = self.entry(self.root(), gimli::DW_TAG_pointer_type);
        self.set(id, gimli::DW_AT_byte_size, AttributeValue::Udata(8));
        if let Some(target) = target {
            self.set_type(id, target);
        }
        id
    }

    pub fn structure(&mut self, name: &str, size: u64) -> UnitEntryId
    {
        let id = self.entry(self.root(), gimli::DW_TAG_structure_type);
        self.set_name(id, name);
        self.set(id, gimli::DW_AT_byte_size, AttributeValue::Udata(size));
        id
    }

    /// Declaration-only entry (`struct foo;`, `extern int foo;`).
    pub fn declaration(&mut self, tag: gimli::DwTag, name: &str) -> UnitEntryId
    {
        let id = self.entry(self.root(), tag);
        self.set_name(id, name);
        self.set(id, gimli::DW_AT_declaration, AttributeValue::Flag(true));
        id
    }

    pub fn member(&mut self, parent: UnitEntryId, name: &str, ty: UnitEntryId, offset: u64) -> UnitEntryId
    {
        let id = self.entry(parent, gimli::DW_TAG_member);
        self.set_name(id, name);
        self.set_type(id, ty);
        self.set(id, gimli::DW_AT_data_member_location, AttributeValue::Udata(offset));
        id
    }

    pub fn variable(&mut self, name: &str, ty: Option<UnitEntryId>) -> UnitEntryId
    {
        let id = self.entry(self.root(), gimli::DW_TAG_variable);
        self.set_name(id, name);
        if let Some(ty) = ty {
            self.set_type(id, ty);
        }
        id
    }

    /// `extern T name;` followed by the nameless defining record GCC emits
    /// for `T name = ...;`. Returns (declaration, definition).
    pub fn specified_variable(&mut self, name: &str, ty: UnitEntryId) -> (UnitEntryId, UnitEntryId)
    {
        let declaration = self.declaration(gimli::DW_TAG_variable, name);
        self.set_type(declaration, ty);
        self.set(declaration, gimli::DW_AT_external, AttributeValue::Flag(true));
        let definition = self.entry(self.root(), gimli::DW_TAG_variable);
        self.set(definition, gimli::DW_AT_specification, AttributeValue::UnitRef(declaration));
        (declaration, definition)
    }

    /// Write the unit as an ELF object at `path`.
    pub fn write(mut self, path: &Path)
    {
        let mut sections = Sections::new(EndianVec::new(gimli::LittleEndian));
        self.dwarf.write(&mut sections).unwrap();

        let mut object = new_object();
        sections
            .for_each(|id, data| {
                if !data.slice().is_empty() {
                    let section = object.add_section(Vec::new(), id.name().as_bytes().to_vec(), object::SectionKind::Debug);
                    object.append_section_data(section, data.slice(), 1);
                }
                Ok::<(), gimli::Error>(())
            })
            .unwrap();
        fs::write(path, object.write().unwrap()).unwrap();
    }
}

fn new_object() -> object::write::Object<'static>
{
    object::write::Object::new(
        object::BinaryFormat::Elf,
        object::Architecture::X86_64,
        object::Endianness::Little,
    )
}

/// ELF object with code but no debug sections.
pub fn write_plain_binary(path: &Path)
{
    let mut object = new_object();
    let text = object.add_section(Vec::new(), b".text".to_vec(), object::SectionKind::Text);
    object.append_section_data(text, &[0xc3], 1);
    fs::write(path, object.write().unwrap()).unwrap();
}

/// One program header of a fixture image.
#[derive(Debug, Clone, Copy)]
pub struct ImageSegment
{
    pub vaddr: u64,
    pub memsz: u64,
    pub offset: u64,
}

/// ELF64 little-endian core file of `len` bytes.
///
/// Bytes past the headers follow a fixed pattern so reads can be compared
/// against the file itself.
pub fn write_memory_image(path: &Path, segments: &[ImageSegment], len: usize)
{
    let mut bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();

    let mut header = Vec::with_capacity(64);
    header.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    header.extend_from_slice(&[0; 8]);
    header.extend_from_slice(&4u16.to_le_bytes()); // ET_CORE
    header.extend_from_slice(&62u16.to_le_bytes()); // EM_X86_64
    header.extend_from_slice(&1u32.to_le_bytes());
    header.extend_from_slice(&0u64.to_le_bytes()); // e_entry
    header.extend_from_slice(&64u64.to_le_bytes()); // e_phoff
    header.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    header.extend_from_slice(&0u32.to_le_bytes());
    header.extend_from_slice(&64u16.to_le_bytes());
    header.extend_from_slice(&56u16.to_le_bytes());
    header.extend_from_slice(&(segments.len() as u16).to_le_bytes());
    header.extend_from_slice(&64u16.to_le_bytes());
    header.extend_from_slice(&0u16.to_le_bytes());
    header.extend_from_slice(&0u16.to_le_bytes());
    assert_eq!(header.len(), 64);

    for segment in segments {
        header.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        header.extend_from_slice(&4u32.to_le_bytes()); // PF_R
        header.extend_from_slice(&segment.offset.to_le_bytes());
        header.extend_from_slice(&segment.vaddr.to_le_bytes());
        header.extend_from_slice(&0u64.to_le_bytes());
        header.extend_from_slice(&segment.memsz.to_le_bytes());
        header.extend_from_slice(&segment.memsz.to_le_bytes());
        header.extend_from_slice(&0x1000u64.to_le_bytes());
    }

    assert!(header.len() <= bytes.len(), "image too small for its headers");
    bytes[..header.len()].copy_from_slice(&header);
    fs::write(path, bytes).unwrap();
}

pub fn write_symbols(path: &Path, lines: &[&str])
{
    fs::write(path, lines.join("\n")).unwrap();
}

/// Path of `name` inside `dir`.
pub fn path_in(dir: &tempfile::TempDir, name: &str) -> PathBuf
{
    dir.path().join(name)
}
