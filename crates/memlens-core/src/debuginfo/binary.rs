//! One object file's debugging information.
//!
//! Opening a binary reads its DWARF sections into memory and parses the unit
//! headers. Everything else is lazy: a unit's DIE tree is decoded into a
//! [`CompileUnit`] on first access, and the (name, kind) index is built on the
//! first lookup.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gimli::{
    Attribute, AttributeValue, DebugInfoOffset, DebugTypeSignature, DebuggingInformationEntry, Dwarf, EndianArcSlice,
    Reader, RunTimeEndian, SectionId, Unit, UnitOffset, UnitSectionOffset, UnitType,
};
use object::{Object, ObjectKind, ObjectSection, ObjectSymbol, RelocationKind, RelocationTarget};
use once_cell::sync::OnceCell;
use tracing::{debug, trace, warn};

use super::index::NameIndex;
use super::record::{AttrValue, CompileUnit, DebugRecord, RecordId, RecordKind, UnitBuilder, UnitId};
use crate::error::{map_dwarf_error, MemlensError, Result};

type OwnedReader = EndianArcSlice<RunTimeEndian>;
type OwnedDwarf = Dwarf<OwnedReader>;

const DWARF_SECTIONS: &[SectionId] = &[
    SectionId::DebugAbbrev,
    SectionId::DebugAddr,
    SectionId::DebugInfo,
    SectionId::DebugLine,
    SectionId::DebugLineStr,
    SectionId::DebugRanges,
    SectionId::DebugRngLists,
    SectionId::DebugStr,
    SectionId::DebugStrOffsets,
    SectionId::DebugTypes,
    SectionId::DebugLoc,
    SectionId::DebugLocLists,
];

struct UnitSlot
{
    unit: Unit<OwnedReader>,
    decoded: OnceCell<Arc<CompileUnit>>,
}

/// An opened binary with a non-empty `.debug_info` section.
pub struct Binary
{
    id: usize,
    path: PathBuf,
    dwarf: OwnedDwarf,
    units: Vec<UnitSlot>,
    index: OnceCell<NameIndex>,
}

impl Binary
{
    /// Open `path` as binary number `id` of an index.
    ///
    /// ## Errors
    ///
    /// - I/O errors reading the file
    /// - `InvalidBinary` if the container cannot be parsed
    /// - `NoDebugInfo` if there is no `.debug_info` or it is empty
    /// - `Dwarf` if a unit header is malformed
    pub fn open(id: usize, path: impl AsRef<Path>) -> Result<Self>
    {
        let path = path.as_ref().to_path_buf();
        let bytes = fs::read(&path)?;
        let file = object::File::parse(bytes.as_slice())
            .map_err(|err| MemlensError::InvalidBinary(format!("failed to parse {}: {err}", path.display())))?;

        let endian = if file.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let mut sections: HashMap<SectionId, Arc<[u8]>> = HashMap::new();
        for id in DWARF_SECTIONS {
            if let Some(data) = load_section_bytes(&file, *id, file.is_little_endian())? {
                sections.insert(*id, data);
            }
        }

        if !sections.get(&SectionId::DebugInfo).is_some_and(|data| !data.is_empty()) {
            return Err(MemlensError::NoDebugInfo(path));
        }

        let dwarf = Dwarf::load(|section| {
            let data = sections
                .get(&section)
                .cloned()
                .unwrap_or_else(|| Arc::<[u8]>::from(Vec::new()));
            Ok::<_, gimli::Error>(EndianArcSlice::new(data, endian))
        })
        .map_err(|err| map_dwarf_error("loading DWARF sections", err))?;

        let mut units = Vec::new();
        let mut headers = dwarf.units();
        while let Some(header) = headers
            .next()
            .map_err(|err| map_dwarf_error("reading .debug_info unit header", err))?
        {
            let unit = dwarf
                .unit(header)
                .map_err(|err| map_dwarf_error("parsing compilation unit", err))?;
            units.push(UnitSlot {
                unit,
                decoded: OnceCell::new(),
            });
        }

        let mut type_headers = dwarf.type_units();
        while let Some(header) = type_headers
            .next()
            .map_err(|err| map_dwarf_error("reading .debug_types unit header", err))?
        {
            let unit = dwarf.unit(header).map_err(|err| map_dwarf_error("parsing type unit", err))?;
            units.push(UnitSlot {
                unit,
                decoded: OnceCell::new(),
            });
        }

        debug!(binary = id, path = %path.display(), units = units.len(), "opened debug binary");

        Ok(Self {
            id,
            path,
            dwarf,
            units,
            index: OnceCell::new(),
        })
    }

    /// Position of this binary in its index's search order.
    pub fn id(&self) -> usize
    {
        self.id
    }

    pub fn path(&self) -> &Path
    {
        &self.path
    }

    /// Number of units (compilation and type units).
    pub fn unit_count(&self) -> usize
    {
        self.units.len()
    }

    /// Records named `name` of kind `kind`, in unit and offset order.
    ///
    /// The first call builds the name index. If that fails the binary is
    /// treated as having no named records.
    pub fn lookup(&self, name: &str, kind: RecordKind) -> &[RecordId]
    {
        self.names().lookup(name, kind)
    }

    /// Declaration-only records named `name` of kind `kind`.
    pub fn lookup_declarations(&self, name: &str, kind: RecordKind) -> &[RecordId]
    {
        self.names().lookup_declarations(name, kind)
    }

    /// Number of (name, kind, record) entries in the name index.
    pub fn indexed_names(&self) -> usize
    {
        self.names().len()
    }

    fn names(&self) -> &NameIndex
    {
        self.index.get_or_init(|| match self.build_name_index() {
            Ok(index) => {
                debug!(binary = self.id, entries = index.len(), "built name index");
                index
            }
            Err(err) => {
                warn!(binary = self.id, path = %self.path.display(), error = %err, "failed to index names; binary contributes nothing");
                NameIndex::default()
            }
        })
    }

    /// Materialize the record with identity `id`.
    ///
    /// ## Errors
    ///
    /// `InvalidRecordId` if no such unit or record exists, or `Dwarf` if the
    /// unit cannot be decoded.
    pub fn record(&self, id: RecordId) -> Result<DebugRecord>
    {
        if id.unit.binary != self.id {
            return Err(MemlensError::InvalidRecordId(id));
        }
        let unit = self.compile_unit(id.unit.unit)?;
        CompileUnit::record_at(&unit, id.offset).ok_or(MemlensError::InvalidRecordId(id))
    }

    /// Decoded form of unit number `index`, decoding it on first use.
    ///
    /// ## Errors
    ///
    /// `InvalidRecordId` for an out-of-range index, `Dwarf` on decode failure.
    pub fn compile_unit(&self, index: usize) -> Result<Arc<CompileUnit>>
    {
        let slot = self.units.get(index).ok_or(MemlensError::InvalidRecordId(RecordId {
            unit: self.unit_id(index),
            offset: 0,
        }))?;
        slot.decoded
            .get_or_try_init(|| self.decode_unit(index, &slot.unit).map(Arc::new))
            .cloned()
    }

    fn unit_id(&self, unit: usize) -> UnitId
    {
        UnitId { binary: self.id, unit }
    }

    fn decode_unit(&self, index: usize, unit: &Unit<OwnedReader>) -> Result<CompileUnit>
    {
        let unit_id = self.unit_id(index);
        let mut builder = UnitBuilder::new(unit_id, unit.encoding().address_size);
        let mut ancestors: Vec<usize> = Vec::new();
        let mut depth: isize = 0;

        let mut cursor = unit.entries();
        while let Some((delta, entry)) = cursor.next_dfs().map_err(|err| map_dwarf_error("traversing DIE tree", err))? {
            depth += delta;
            ancestors.truncate(usize::try_from(depth).unwrap_or(0));
            let attrs = self.decode_attrs(unit_id, unit, entry)?;
            let node = builder.push(entry.offset().0, RecordKind::from(entry.tag()), attrs, ancestors.last().copied());
            ancestors.push(node);
        }

        let decoded = builder.finish();
        trace!(unit = %unit_id.unit, binary = unit_id.binary, records = decoded.len(), "decoded unit");
        Ok(decoded)
    }

    fn decode_attrs(
        &self,
        unit_id: UnitId,
        unit: &Unit<OwnedReader>,
        entry: &DebuggingInformationEntry<'_, '_, OwnedReader>,
    ) -> Result<Vec<(gimli::DwAt, AttrValue)>>
    {
        let mut attrs = Vec::new();
        let mut iter = entry.attrs();
        while let Some(attr) = iter.next().map_err(|err| map_dwarf_error("reading attributes", err))? {
            if let Some(value) = self.decode_value(unit_id, unit, &attr)? {
                attrs.push((attr.name(), value));
            }
        }
        Ok(attrs)
    }

    fn decode_value(&self, unit_id: UnitId, unit: &Unit<OwnedReader>, attr: &Attribute<OwnedReader>) -> Result<Option<AttrValue>>
    {
        let value = match attr.value() {
            AttributeValue::UnitRef(offset) => AttrValue::Reference(RecordId {
                unit: unit_id,
                offset: offset.0,
            }),
            AttributeValue::DebugInfoRef(offset) => match self.locate_offset(offset) {
                Some(id) => AttrValue::Reference(id),
                None => {
                    trace!(attribute = %attr.name(), offset = offset.0, "dangling .debug_info reference");
                    return Ok(None);
                }
            },
            AttributeValue::DebugTypesRef(signature) => match self.locate_signature(signature) {
                Some(id) => AttrValue::Reference(id),
                None => {
                    trace!(attribute = %attr.name(), "unknown type signature");
                    return Ok(None);
                }
            },
            AttributeValue::Flag(flag) => AttrValue::Flag(flag),
            AttributeValue::Sdata(value) => AttrValue::Signed(value),
            AttributeValue::Addr(address) => AttrValue::Address(address),
            AttributeValue::Exprloc(expression) => AttrValue::Expr(reader_bytes(&expression.0)?),
            AttributeValue::Block(block) => AttrValue::Block(reader_bytes(&block)?),
            value @ (AttributeValue::String(_)
            | AttributeValue::DebugStrRef(_)
            | AttributeValue::DebugStrOffsetsIndex(_)
            | AttributeValue::DebugLineStrRef(_)) => AttrValue::String(self.attr_to_string(unit, value)?),
            AttributeValue::Encoding(encoding) => AttrValue::Unsigned(u64::from(encoding.0)),
            AttributeValue::Data1(value) => AttrValue::Data {
                value: u64::from(value),
                width: 1,
            },
            AttributeValue::Data2(value) => AttrValue::Data {
                value: u64::from(value),
                width: 2,
            },
            AttributeValue::Data4(value) => AttrValue::Data {
                value: u64::from(value),
                width: 4,
            },
            AttributeValue::Data8(value) => AttrValue::Data { value, width: 8 },
            _ => match attr.udata_value() {
                Some(value) => AttrValue::Unsigned(value),
                None => return Ok(None),
            },
        };
        Ok(Some(value))
    }

    fn attr_to_string(&self, unit: &Unit<OwnedReader>, value: AttributeValue<OwnedReader>) -> Result<String>
    {
        let reader = self
            .dwarf
            .attr_string(unit, value)
            .map_err(|err| map_dwarf_error("resolving DWARF string", err))?;
        let owned = match reader.to_string() {
            Ok(cow) => cow.into_owned(),
            Err(_) => reader
                .to_string_lossy()
                .map_err(|err| map_dwarf_error("decoding DWARF string", err))?
                .into_owned(),
        };
        Ok(owned)
    }

    fn locate_offset(&self, offset: DebugInfoOffset<usize>) -> Option<RecordId>
    {
        let target = UnitSectionOffset::from(offset);
        self.units.iter().enumerate().find_map(|(index, slot)| {
            target.to_unit_offset(&slot.unit).map(|unit_offset| RecordId {
                unit: self.unit_id(index),
                offset: unit_offset.0,
            })
        })
    }

    fn locate_signature(&self, signature: DebugTypeSignature) -> Option<RecordId>
    {
        self.units
            .iter()
            .enumerate()
            .find_map(|(index, slot)| match slot.unit.header.type_() {
                UnitType::Type {
                    type_signature,
                    type_offset,
                }
                | UnitType::SplitType {
                    type_signature,
                    type_offset,
                } if type_signature == signature => Some(RecordId {
                    unit: self.unit_id(index),
                    offset: type_offset.0,
                }),
                _ => None,
            })
    }

    /// Index file-scope records: direct children of each unit root, plus the
    /// enumerators of file-scope enumerations. Declarations go to a separate list.
    fn build_name_index(&self) -> Result<NameIndex>
    {
        let mut index = NameIndex::default();
        for (unit_index, slot) in self.units.iter().enumerate() {
            let unit = &slot.unit;
            let unit_id = self.unit_id(unit_index);
            let mut tree = unit
                .entries_tree(None)
                .map_err(|err| map_dwarf_error("creating DIE tree", err))?;
            let root = tree.root().map_err(|err| map_dwarf_error("reading unit root", err))?;

            let mut children = root.children();
            while let Some(child) = children.next().map_err(|err| map_dwarf_error("iterating unit children", err))? {
                let tag = child.entry().tag();
                self.index_entry(unit_id, unit, child.entry(), &mut index)?;
                if tag != gimli::DW_TAG_enumeration_type {
                    continue;
                }
                let mut enumerators = child.children();
                while let Some(enumerator) = enumerators
                    .next()
                    .map_err(|err| map_dwarf_error("iterating enumerators", err))?
                {
                    if enumerator.entry().tag() == gimli::DW_TAG_enumerator {
                        self.index_entry(unit_id, unit, enumerator.entry(), &mut index)?;
                    }
                }
            }
        }
        Ok(index)
    }

    fn index_entry(
        &self,
        unit_id: UnitId,
        unit: &Unit<OwnedReader>,
        entry: &DebuggingInformationEntry<'_, '_, OwnedReader>,
        index: &mut NameIndex,
    ) -> Result<()>
    {
        let declaration = entry
            .attr(gimli::DW_AT_declaration)
            .map_err(|err| map_dwarf_error("reading DW_AT_declaration", err))?;
        let is_declaration = matches!(declaration.map(|attr| attr.value()), Some(AttributeValue::Flag(true)));

        let name = match entry
            .attr(gimli::DW_AT_name)
            .map_err(|err| map_dwarf_error("reading DW_AT_name", err))?
        {
            Some(name) => Some(self.attr_to_string(unit, name.value())?),
            // `int x = 1;` after `extern int x;` is a nameless definition
            // pointing back at the declaration.
            None if !is_declaration => self.origin_name(unit, entry)?,
            None => None,
        };
        let Some(name) = name else {
            return Ok(());
        };

        let kind = RecordKind::from(entry.tag());
        let id = RecordId {
            unit: unit_id,
            offset: entry.offset().0,
        };
        if is_declaration {
            index.insert_declaration(name, kind, id);
        } else {
            index.insert(name, kind, id);
        }
        Ok(())
    }

    /// Name of the record a definition's `DW_AT_specification` or
    /// `DW_AT_abstract_origin` refers to.
    fn origin_name(
        &self,
        unit: &Unit<OwnedReader>,
        entry: &DebuggingInformationEntry<'_, '_, OwnedReader>,
    ) -> Result<Option<String>>
    {
        for link in [gimli::DW_AT_specification, gimli::DW_AT_abstract_origin] {
            let Some(attr) = entry
                .attr(link)
                .map_err(|err| map_dwarf_error("reading origin reference", err))?
            else {
                continue;
            };
            let (target_unit, offset) = match attr.value() {
                AttributeValue::UnitRef(offset) => (unit, offset),
                AttributeValue::DebugInfoRef(offset) => {
                    let Some(id) = self.locate_offset(offset) else {
                        continue;
                    };
                    let Some(slot) = self.units.get(id.unit.unit) else {
                        continue;
                    };
                    (&slot.unit, UnitOffset(id.offset))
                }
                _ => continue,
            };
            let target = target_unit
                .entry(offset)
                .map_err(|err| map_dwarf_error("reading origin record", err))?;
            if let Some(name) = target
                .attr(gimli::DW_AT_name)
                .map_err(|err| map_dwarf_error("reading DW_AT_name", err))?
            {
                return Ok(Some(self.attr_to_string(target_unit, name.value())?));
            }
        }
        Ok(None)
    }
}

fn reader_bytes(reader: &OwnedReader) -> Result<Vec<u8>>
{
    reader
        .to_slice()
        .map(Cow::into_owned)
        .map_err(|err| map_dwarf_error("reading attribute bytes", err))
}

fn load_section_bytes(file: &object::File<'_>, id: SectionId, little_endian: bool) -> Result<Option<Arc<[u8]>>>
{
    let name = id.name();
    let Some(section) = file.section_by_name(name) else {
        return Ok(None);
    };
    let data = section
        .uncompressed_data()
        .map_err(|err| MemlensError::InvalidBinary(format!("failed to read {name}: {err}")))?;

    // Relocatable objects (kernel modules) carry section-relative offsets as
    // relocations; apply them or every string and reference points at offset 0.
    if file.kind() == ObjectKind::Relocatable {
        let mut bytes = data.into_owned();
        apply_relocations(file, &section, &mut bytes, little_endian);
        return Ok(Some(bytes.into()));
    }

    Ok(Some(match data {
        Cow::Borrowed(bytes) => Arc::<[u8]>::from(bytes.to_vec()),
        Cow::Owned(vec) => vec.into(),
    }))
}

fn apply_relocations(file: &object::File<'_>, section: &object::Section<'_, '_>, bytes: &mut [u8], little_endian: bool)
{
    for (offset, relocation) in section.relocations() {
        if relocation.kind() != RelocationKind::Absolute {
            continue;
        }
        let base = match relocation.target() {
            RelocationTarget::Symbol(index) => file.symbol_by_index(index).ok().map(|symbol| symbol.address()),
            RelocationTarget::Section(index) => file.section_by_index(index).ok().map(|target| target.address()),
            _ => None,
        };
        let Some(base) = base else {
            continue;
        };
        let Ok(start) = usize::try_from(offset) else {
            continue;
        };
        let width = usize::from(relocation.size() / 8);
        let Some(slot) = start.checked_add(width).and_then(|end| bytes.get_mut(start..end)) else {
            continue;
        };

        let implicit = if relocation.has_implicit_addend() {
            read_uint(slot, little_endian)
        } else {
            0
        };
        #[allow(clippy::cast_sign_loss)]
        let value = base.wrapping_add(relocation.addend() as u64).wrapping_add(implicit);
        write_uint(slot, value, little_endian);
    }
}

fn read_uint(bytes: &[u8], little_endian: bool) -> u64
{
    let fold = |acc: u64, byte: &u8| (acc << 8) | u64::from(*byte);
    if little_endian {
        bytes.iter().rev().fold(0, fold)
    } else {
        bytes.iter().fold(0, fold)
    }
}

fn write_uint(bytes: &mut [u8], value: u64, little_endian: bool)
{
    let width = bytes.len();
    for (position, byte) in bytes.iter_mut().enumerate() {
        let shift = if little_endian { position } else { width - 1 - position };
        #[allow(clippy::cast_possible_truncation)]
        let shifted = value.checked_shr(u32::try_from(shift * 8).unwrap_or(u32::MAX)).unwrap_or(0) as u8;
        *byte = shifted;
    }
}
