//! Granny2 type system.
//!
//! GR2 files are self-describing: a dedicated section carries struct
//! definitions (ordered member lists) for every native type in the file,
//! and the object graph is traversed by walking those definitions. This
//! module holds the member-kind enumeration, member/struct definitions and
//! the per-session catalog that caches definitions by address.

use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::formats::gr2::format::{FileFormat, SectionKind};
use crate::formats::gr2::section::Unified;

/// Granny member kind enumeration. Tag 0 is the sentinel terminating a
/// member list; anything above [`MemberKind::MAX_TAG`] is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MemberKind {
    /// End-of-members sentinel
    None = 0,
    /// Embedded struct data (no pointer indirection)
    Inline = 1,
    /// Pointer to a single struct instance
    Reference = 2,
    /// Count + pointer to an array of structs
    ReferenceToArray = 3,
    /// Count + pointer to an array of pointers to structs
    ArrayOfReferences = 4,
    /// Polymorphic reference: type pointer + value pointer
    VariantReference = 5,
    /// Legacy switchable-type slot, stored as a bare u32
    UnsupportedUInt32 = 6,
    /// Type pointer + count + pointer to an array of structs
    ReferenceToVariantArray = 7,
    /// Pointer to a null-terminated UTF-8 string
    String = 8,
    /// Fixed 17 x 4-byte transform record
    Transform = 9,
    /// 32-bit float
    Real32 = 10,
    /// 8-bit signed integer
    Int8 = 11,
    /// 8-bit unsigned integer
    UInt8 = 12,
    /// 8-bit signed, binormal-scaled
    BinormalInt8 = 13,
    /// 8-bit unsigned, normal-scaled
    NormalUInt8 = 14,
    /// 16-bit signed integer
    Int16 = 15,
    /// 16-bit unsigned integer
    UInt16 = 16,
    /// 16-bit signed, binormal-scaled
    BinormalInt16 = 17,
    /// 16-bit unsigned, normal-scaled
    NormalUInt16 = 18,
    /// 32-bit signed integer
    Int32 = 19,
    /// 32-bit unsigned integer
    UInt32 = 20,
    /// 16-bit half-precision float
    Real16 = 21,
    /// Always-null pointer slot
    EmptyReference = 22,
}

impl Default for MemberKind {
    fn default() -> Self {
        Self::None
    }
}

impl MemberKind {
    /// Highest defined tag.
    pub const MAX_TAG: u32 = 22;

    /// Parse a member kind from its on-disk tag.
    ///
    /// `offset` is the absolute offset of the member definition, reported
    /// on failure before any payload bytes for the member are consumed.
    pub fn from_u32(tag: u32, offset: usize) -> Result<Self> {
        Ok(match tag {
            0 => Self::None,
            1 => Self::Inline,
            2 => Self::Reference,
            3 => Self::ReferenceToArray,
            4 => Self::ArrayOfReferences,
            5 => Self::VariantReference,
            6 => Self::UnsupportedUInt32,
            7 => Self::ReferenceToVariantArray,
            8 => Self::String,
            9 => Self::Transform,
            10 => Self::Real32,
            11 => Self::Int8,
            12 => Self::UInt8,
            13 => Self::BinormalInt8,
            14 => Self::NormalUInt8,
            15 => Self::Int16,
            16 => Self::UInt16,
            17 => Self::BinormalInt16,
            18 => Self::NormalUInt16,
            19 => Self::Int32,
            20 => Self::UInt32,
            21 => Self::Real16,
            22 => Self::EmptyReference,
            tag => return Err(Error::UnknownMemberType { tag, offset }),
        })
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// True for kinds that dereference into other parts of the buffer.
    pub fn is_reference(self) -> bool {
        matches!(
            self,
            Self::Reference
                | Self::ReferenceToArray
                | Self::ArrayOfReferences
                | Self::VariantReference
                | Self::ReferenceToVariantArray
                | Self::String
                | Self::EmptyReference
        )
    }

    /// True for plain scalar kinds.
    pub fn is_scalar(self) -> bool {
        matches!(
            self,
            Self::Real32
                | Self::Int8
                | Self::UInt8
                | Self::BinormalInt8
                | Self::NormalUInt8
                | Self::Int16
                | Self::UInt16
                | Self::BinormalInt16
                | Self::NormalUInt16
                | Self::Int32
                | Self::UInt32
                | Self::Real16
                | Self::UnsupportedUInt32
        )
    }

    /// Width of one scalar of this kind, or 0 for non-scalars.
    pub fn scalar_width(self) -> usize {
        match self {
            Self::Real32 | Self::Int32 | Self::UInt32 | Self::UnsupportedUInt32 => 4,
            Self::Int16 | Self::UInt16 | Self::BinormalInt16 | Self::NormalUInt16
            | Self::Real16 => 2,
            Self::Int8 | Self::UInt8 | Self::BinormalInt8 | Self::NormalUInt8 => 1,
            _ => 0,
        }
    }
}

/// How a member is serialized: by the generic walk or by a registered
/// [`NodeSerializer`](crate::formats::gr2::reader::NodeSerializer).
///
/// In-memory metadata only; never stored in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializationKind {
    /// Generic schema-driven walk
    #[default]
    Builtin,
    /// Custom serializer handles the whole struct
    UserRaw,
    /// Custom serializer handles this member
    UserMember,
    /// Custom serializer handles each array element
    UserElement,
}

/// Link from a member definition to the struct type it references.
#[derive(Debug, Clone, Default)]
pub enum TypeRef {
    /// No nested type
    #[default]
    None,
    /// Absolute address of the definition in the unified buffer (read side)
    Address(usize),
    /// In-memory definition (write side)
    Def(Rc<StructDefinition>),
}

impl TypeRef {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// One member of a struct definition.
#[derive(Debug, Clone, Default)]
pub struct MemberDefinition {
    /// Member kind tag
    pub kind: MemberKind,
    /// Schema name
    pub name: String,
    /// Nested struct type, for `Inline` and the pointer-like kinds
    pub definition: TypeRef,
    /// Fixed array repeat count; 0 = single value
    pub array_size: u32,
    /// Extra tags carried verbatim
    pub extra: [u32; 3],
    /// Serialization dispatch (in-memory metadata)
    pub serialization: SerializationKind,
    /// Minimum file version carrying this member; 0 = unbounded
    pub min_version: u32,
    /// Maximum file version carrying this member; 0 = unbounded
    pub max_version: u32,
    /// Writer hint: place the payload in the owning section's data area
    pub data_area: bool,
    /// Writer hint: place the payload in a specific section
    pub preferred_section: Option<SectionKind>,
}

impl MemberDefinition {
    /// Create a scalar or simple member with defaults.
    pub fn new(name: impl Into<String>, kind: MemberKind) -> Self {
        Self { name: name.into(), kind, ..Self::default() }
    }

    /// Create a member referencing a nested struct type.
    pub fn with_def(name: impl Into<String>, kind: MemberKind, def: Rc<StructDefinition>) -> Self {
        Self {
            name: name.into(),
            kind,
            definition: TypeRef::Def(def),
            ..Self::default()
        }
    }

    /// Fixed array repeat count, never zero.
    pub fn repeat(&self) -> usize {
        self.array_size.max(1) as usize
    }

    /// Whether this member is carried by files of `version`.
    pub fn in_version(&self, version: u32) -> bool {
        (self.min_version == 0 || version >= self.min_version)
            && (self.max_version == 0 || version <= self.max_version)
    }

    /// Size of one element of this member in struct data, excluding the
    /// fixed-array repeat. `Inline` members need the resolved nested size.
    pub(crate) fn unit_size(&self, format: FileFormat, inline_size: usize) -> usize {
        let ps = format.pointer_size();
        match self.kind {
            MemberKind::None => 0,
            MemberKind::Inline => inline_size,
            MemberKind::Reference | MemberKind::String | MemberKind::EmptyReference => ps,
            MemberKind::VariantReference => 2 * ps,
            MemberKind::ReferenceToArray | MemberKind::ArrayOfReferences => 4 + ps,
            MemberKind::ReferenceToVariantArray => 4 + 2 * ps,
            MemberKind::Transform => 68,
            kind => kind.scalar_width(),
        }
    }

    /// On-disk size of a member definition record.
    pub fn record_size(format: FileFormat) -> usize {
        // type + name ptr + definition ptr + array size + 3 extras + reserved ptr
        4 + format.pointer_size() * 2 + 4 + 12 + format.pointer_size()
    }
}

/// Ordered member list describing one native type's on-disk layout.
#[derive(Debug, Clone, Default)]
pub struct StructDefinition {
    pub members: Vec<MemberDefinition>,
}

impl StructDefinition {
    pub fn new(members: Vec<MemberDefinition>) -> Rc<Self> {
        Rc::new(Self { members })
    }

    /// Members present in files of `version`, in schema order.
    pub fn members_for(&self, version: u32) -> impl Iterator<Item = &MemberDefinition> {
        self.members.iter().filter(move |m| m.in_version(version))
    }
}

/// Per-session cache of struct definitions, keyed by definition address.
///
/// Created fresh for every read or write call and dropped at the end; no
/// cross-session caching.
#[derive(Debug, Default)]
pub struct TypeCatalog {
    defs: HashMap<usize, Rc<StructDefinition>>,
}

impl TypeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached definitions.
    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Register an in-memory definition under an address, as if it had been
    /// loaded from the buffer.
    pub fn prime(&mut self, addr: usize, def: Rc<StructDefinition>) {
        self.defs.insert(addr, def);
    }

    /// Look up an already-loaded definition without touching the buffer.
    pub fn cached(&self, addr: usize) -> Option<Rc<StructDefinition>> {
        self.defs.get(&addr).map(Rc::clone)
    }

    /// Load the struct definition at `addr`, reading member records until the
    /// `None` sentinel. Cached per distinct address for the session.
    ///
    /// Nested definitions are recorded by address ([`TypeRef::Address`]) and
    /// resolved lazily, so self-referential type graphs cannot recurse here.
    pub fn load(&mut self, buf: &Unified, addr: usize, format: FileFormat) -> Result<Rc<StructDefinition>> {
        if let Some(def) = self.defs.get(&addr) {
            return Ok(Rc::clone(def));
        }

        let record = MemberDefinition::record_size(format);
        let ps = format.pointer_size();
        let mut members = Vec::new();
        let mut pos = addr;

        loop {
            let tag = buf.read_u32(pos)?;
            let kind = MemberKind::from_u32(tag, pos)?;
            if kind == MemberKind::None {
                break;
            }

            let name = match buf.read_pointer(pos + 4)? {
                Some(target) => buf.read_cstring(target)?,
                None => String::new(),
            };
            let definition = match buf.read_pointer(pos + 4 + ps)? {
                Some(target) => TypeRef::Address(target),
                None => TypeRef::None,
            };
            let array_size = buf.read_u32(pos + 4 + 2 * ps)?;
            let extra = [
                buf.read_u32(pos + 8 + 2 * ps)?,
                buf.read_u32(pos + 12 + 2 * ps)?,
                buf.read_u32(pos + 16 + 2 * ps)?,
            ];

            members.push(MemberDefinition {
                kind,
                name,
                definition,
                array_size,
                extra,
                ..MemberDefinition::default()
            });
            pos += record;
        }

        tracing::debug!(addr, members = members.len(), "loaded struct definition");
        let def = Rc::new(StructDefinition { members });
        self.defs.insert(addr, Rc::clone(&def));
        Ok(def)
    }

    /// Load every definition reachable from the already-cached ones, so the
    /// catalog can resolve any address-form link without the buffer later.
    pub fn load_closure(&mut self, buf: &Unified, format: FileFormat) -> Result<()> {
        loop {
            let mut missing = Vec::new();
            for def in self.defs.values() {
                for member in &def.members {
                    if let TypeRef::Address(addr) = &member.definition {
                        if !self.defs.contains_key(addr) {
                            missing.push(*addr);
                        }
                    }
                }
            }
            if missing.is_empty() {
                return Ok(());
            }
            missing.sort_unstable();
            missing.dedup();
            for addr in missing {
                self.load(buf, addr, format)?;
            }
        }
    }

    /// Resolve a member's nested definition, loading by address if needed.
    pub fn resolve(
        &mut self,
        buf: &Unified,
        type_ref: &TypeRef,
        format: FileFormat,
    ) -> Result<Option<Rc<StructDefinition>>> {
        match type_ref {
            TypeRef::None => Ok(None),
            TypeRef::Address(addr) => self.load(buf, *addr, format).map(Some),
            TypeRef::Def(def) => Ok(Some(Rc::clone(def))),
        }
    }

    /// Total size in struct data of one member, fixed-array repeat included.
    pub fn member_size(
        &mut self,
        buf: &Unified,
        member: &MemberDefinition,
        format: FileFormat,
    ) -> Result<usize> {
        let inline_size = if member.kind == MemberKind::Inline {
            match self.resolve(buf, &member.definition, format)? {
                Some(def) => self.struct_size(buf, &def, format)?,
                None => 0,
            }
        } else {
            0
        };
        Ok(member.unit_size(format, inline_size) * member.repeat())
    }

    /// Size in bytes of one struct instance in the unified buffer.
    pub fn struct_size(
        &mut self,
        buf: &Unified,
        def: &StructDefinition,
        format: FileFormat,
    ) -> Result<usize> {
        let mut total = 0;
        for member in &def.members {
            total += self.member_size(buf, member, format)?;
        }
        Ok(total)
    }
}

/// Write-side struct sizing: all nested [`TypeRef`]s must be in-memory.
///
/// Used by the writer to lay out inline members and array strides before
/// any addresses exist.
pub fn write_side_struct_size(def: &StructDefinition, format: FileFormat, version: u32) -> usize {
    def.members_for(version)
        .map(|m| {
            let inline = if m.kind == MemberKind::Inline {
                match &m.definition {
                    TypeRef::Def(nested) => write_side_struct_size(nested, format, version),
                    _ => 0,
                }
            } else {
                0
            };
            m.unit_size(format, inline) * m.repeat()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_kind_parsing() {
        assert_eq!(MemberKind::from_u32(0, 0).unwrap(), MemberKind::None);
        assert_eq!(MemberKind::from_u32(1, 0).unwrap(), MemberKind::Inline);
        assert_eq!(MemberKind::from_u32(8, 0).unwrap(), MemberKind::String);
        assert_eq!(MemberKind::from_u32(22, 0).unwrap(), MemberKind::EmptyReference);
        assert!(matches!(
            MemberKind::from_u32(23, 0x40),
            Err(Error::UnknownMemberType { tag: 23, offset: 0x40 })
        ));
    }

    #[test]
    fn test_member_widths_by_bitness() {
        let member = |kind| MemberDefinition::new("m", kind);

        let cases = [
            (MemberKind::Reference, 4, 8),
            (MemberKind::String, 4, 8),
            (MemberKind::EmptyReference, 4, 8),
            (MemberKind::VariantReference, 8, 16),
            (MemberKind::ReferenceToArray, 8, 12),
            (MemberKind::ArrayOfReferences, 8, 12),
            (MemberKind::ReferenceToVariantArray, 12, 20),
            (MemberKind::Transform, 68, 68),
            (MemberKind::Real32, 4, 4),
            (MemberKind::Real16, 2, 2),
            (MemberKind::UInt8, 1, 1),
        ];
        for (kind, w32, w64) in cases {
            assert_eq!(member(kind).unit_size(FileFormat::Le32, 0), w32, "{kind:?} (32)");
            assert_eq!(member(kind).unit_size(FileFormat::Le64, 0), w64, "{kind:?} (64)");
        }
    }

    #[test]
    fn test_record_size() {
        assert_eq!(MemberDefinition::record_size(FileFormat::Le32), 32);
        assert_eq!(MemberDefinition::record_size(FileFormat::Le64), 44);
    }

    #[test]
    fn test_version_gating() {
        let mut member = MemberDefinition::new("Tag", MemberKind::UInt32);
        assert!(member.in_version(6));
        assert!(member.in_version(7));

        member.min_version = 7;
        assert!(!member.in_version(6));
        assert!(member.in_version(7));

        member.min_version = 0;
        member.max_version = 6;
        assert!(member.in_version(6));
        assert!(!member.in_version(7));
    }

    #[test]
    fn test_write_side_struct_size() {
        let inner = StructDefinition::new(vec![
            MemberDefinition::new("X", MemberKind::Real32),
            MemberDefinition::new("Y", MemberKind::Real32),
        ]);
        let mut coords = MemberDefinition::with_def("Coords", MemberKind::Inline, inner);
        coords.array_size = 2;

        let outer = StructDefinition {
            members: vec![
                MemberDefinition::new("Name", MemberKind::String),
                coords,
                MemberDefinition::new("Count", MemberKind::Int32),
            ],
        };

        // 8 (string ptr) + 2*8 (two inline {f32,f32}) + 4
        assert_eq!(write_side_struct_size(&outer, FileFormat::Le64, 7), 28);
        // 4 + 16 + 4
        assert_eq!(write_side_struct_size(&outer, FileFormat::Le32, 7), 24);
    }
}
