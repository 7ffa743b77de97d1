//! Object graph reader.
//!
//! Turns a GR2 byte image into a graph of [`Instance`] nodes: classify the
//! magic, validate the header and payload CRC, resolve sections into the
//! unified address space, then walk the root struct definition from the
//! root node. Every non-inline struct is materialized once per distinct
//! address; further references to the same address share the node.

use std::collections::HashMap;
use std::io::Cursor;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::formats::gr2::codec::{NullCodec, SectionCodec};
use crate::formats::gr2::format::{
    FileFormat, Gr2Header, Gr2Magic, SectionHeader, SectionRef, MAGIC_SIZE,
};
use crate::formats::gr2::instance::{Instance, SharedInstance, Transform, Value};
use crate::formats::gr2::section::Unified;
use crate::formats::gr2::type_system::{
    MemberDefinition, MemberKind, SerializationKind, StructDefinition, TypeCatalog,
};

/// Pointer chains deeper than this are treated as corrupt input. The format
/// is acyclic in practice; this guard turns a malformed file into an error
/// instead of a stack overflow. Each level costs several nested call frames,
/// so the limit is kept low enough to trip well before the call stack runs
/// out on a default-sized thread stack.
const MAX_DEPTH: usize = 128;

/// Substitutes the concrete type of a variant reference at read time.
///
/// The file stores a type pointer per variant; the selector sees the
/// definition loaded from that pointer and may hand back a different one
/// (e.g. an application schema with serialization metadata attached).
pub trait VariantTypeSelector {
    fn select(
        &self,
        member: &MemberDefinition,
        declared: &Rc<StructDefinition>,
    ) -> Option<Rc<StructDefinition>>;
}

/// Custom (de)serialization hook, dispatched by member name for members
/// whose [`SerializationKind`] is not `Builtin`.
pub trait NodeSerializer {
    /// Decode the member stored at `offset`.
    fn read(&self, buf: &Unified, member: &MemberDefinition, offset: usize) -> Result<Value>;

    /// Encode `value` into the member's on-disk slot. The returned buffer
    /// must be exactly the member's layout size.
    fn write(&self, member: &MemberDefinition, value: &Value) -> Result<Vec<u8>>;
}

/// Read-session configuration.
pub struct ReaderOptions {
    /// Section decompression; [`NullCodec`] handles uncompressed files only
    pub codec: Box<dyn SectionCodec>,
    /// Optional variant type substitution
    pub variant_selector: Option<Box<dyn VariantTypeSelector>>,
    /// Custom serializers, keyed by member name
    pub serializers: HashMap<String, Box<dyn NodeSerializer>>,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            codec: Box::new(NullCodec),
            variant_selector: None,
            serializers: HashMap::new(),
        }
    }
}

/// A decoded file: header identity plus the materialized object graph.
#[derive(Debug)]
pub struct Gr2Document {
    /// File format version (6 or 7)
    pub version: u32,
    /// Endianness and pointer width of the source bytes
    pub format: FileFormat,
    /// Game version tag
    pub tag: u32,
    /// Extra header tags, carried verbatim
    pub extra_tags: [u32; 4],
    /// The root struct definition
    pub root_definition: Rc<StructDefinition>,
    /// The root node of the graph
    pub root: SharedInstance,
    /// Every definition loaded during the read, keyed by its address in the
    /// source. The writer uses this to resolve address-form type links,
    /// which is what makes self-referential schemas round-trip.
    pub types: TypeCatalog,
}

/// Decode a GR2 byte image into its object graph.
pub fn read_gr2(bytes: &[u8], options: &ReaderOptions) -> Result<Gr2Document> {
    let mut cursor = Cursor::new(bytes);
    let (_magic, format) = Gr2Magic::read(&mut cursor)?;
    let header = Gr2Header::read(&mut cursor)?;
    tracing::debug!(
        version = header.version,
        ?format,
        sections = header.num_sections,
        "header accepted"
    );

    verify_payload_crc(bytes, &header)?;

    let sections_start = MAGIC_SIZE + header.sections_offset as usize;
    let section_bytes = bytes
        .get(sections_start..)
        .ok_or(Error::UnexpectedEof { offset: sections_start })?;
    let mut cursor = Cursor::new(section_bytes);
    let sections = (0..header.num_sections)
        .map(|_| SectionHeader::read(&mut cursor))
        .collect::<Result<Vec<_>>>()?;

    let mut unified = Unified::resolve(bytes, &sections, format, options.codec.as_ref())?;
    let mut catalog = TypeCatalog::new();

    // Accepted files are little-endian; the swap pass only has work to do
    // when the host disagrees.
    if cfg!(target_endian = "big") {
        unified.apply_mixed_marshalling(&mut catalog)?;
    }

    let type_addr = resolve_root(&unified, &header, header.root_type)?;
    let node_addr = resolve_root(&unified, &header, header.root_node)?;
    let root_definition = catalog.load(&unified, type_addr, format)?;

    let mut reader = GraphReader {
        buf: &unified,
        catalog,
        options,
        version: header.version,
        format,
        pos: 0,
        depth: 0,
        structs: HashMap::new(),
        strings: HashMap::new(),
    };
    let root = reader.read_struct_ref(node_addr, &root_definition)?;
    reader.catalog.load_closure(&unified, format)?;
    tracing::debug!(
        structs = reader.structs.len(),
        strings = reader.strings.len(),
        types = reader.catalog.len(),
        "graph materialized"
    );

    Ok(Gr2Document {
        version: header.version,
        format,
        tag: header.tag,
        extra_tags: header.extra_tags,
        root_definition,
        root,
        types: reader.catalog,
    })
}

fn verify_payload_crc(bytes: &[u8], header: &Gr2Header) -> Result<()> {
    let payload_start = MAGIC_SIZE + header.size() as usize;
    let payload = bytes
        .get(payload_start..)
        .ok_or(Error::UnexpectedEof { offset: payload_start })?;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    let actual = hasher.finalize();
    if actual != header.crc {
        return Err(Error::CrcMismatch { expected: header.crc, actual });
    }
    Ok(())
}

fn resolve_root(unified: &Unified, header: &Gr2Header, root: SectionRef) -> Result<usize> {
    let base = unified.section_base(root.section as usize).ok_or(
        Error::RootSectionOutOfRange {
            section: root.section,
            num_sections: header.num_sections,
        },
    )?;
    Ok(base + root.offset as usize)
}

struct GraphReader<'a> {
    buf: &'a Unified,
    catalog: TypeCatalog,
    options: &'a ReaderOptions,
    version: u32,
    format: FileFormat,
    pos: usize,
    depth: usize,
    /// One node per distinct address; consulted before materializing
    structs: HashMap<usize, SharedInstance>,
    /// Session string cache, keyed by string address
    strings: HashMap<usize, Rc<str>>,
}

impl<'a> GraphReader<'a> {
    /// Cursor guard: seek to `target`, run `f`, restore the cursor on every
    /// exit path.
    fn at<T>(&mut self, target: usize, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let saved = self.pos;
        self.pos = target;
        let out = f(self);
        self.pos = saved;
        out
    }

    /// Materialize the struct at `addr`, or return the already-shared node.
    ///
    /// The node enters the cache before its fields are read, so a reference
    /// back to an ancestor address resolves to the ancestor node.
    fn read_struct_ref(&mut self, addr: usize, def: &Rc<StructDefinition>) -> Result<SharedInstance> {
        if let Some(existing) = self.structs.get(&addr) {
            return Ok(Rc::clone(existing));
        }
        let instance = Instance::new(Rc::clone(def)).shared();
        self.structs.insert(addr, Rc::clone(&instance));
        self.at(addr, |r| r.fill(&instance, def))?;
        Ok(instance)
    }

    /// Materialize an inline struct at the cursor; never cached, always a
    /// fresh node.
    fn read_inline(&mut self, def: &Rc<StructDefinition>) -> Result<SharedInstance> {
        let instance = Instance::new(Rc::clone(def)).shared();
        self.fill(&instance, def)?;
        Ok(instance)
    }

    fn fill(&mut self, instance: &SharedInstance, def: &Rc<StructDefinition>) -> Result<()> {
        if self.depth >= MAX_DEPTH {
            return Err(Error::RecursionLimitExceeded { offset: self.pos, depth: MAX_DEPTH });
        }
        self.depth += 1;
        let result = self.fill_members(instance, def);
        self.depth -= 1;
        result
    }

    fn fill_members(&mut self, instance: &SharedInstance, def: &Rc<StructDefinition>) -> Result<()> {
        let version = self.version;
        for member in def.members.iter().filter(|m| m.in_version(version)) {
            tracing::trace!(member = %member.name, kind = ?member.kind, offset = self.pos, "reading member");
            let value = self.read_member(member)?;
            instance.borrow_mut().set(member.name.clone(), value);
        }
        Ok(())
    }

    fn serializer_for(&self, member: &MemberDefinition) -> Result<&'a dyn NodeSerializer> {
        self.options
            .serializers
            .get(&member.name)
            .map(AsRef::as_ref)
            .ok_or_else(|| Error::SerializerMissing { member: member.name.clone() })
    }

    /// Resolve the nested definition a reference-like member requires.
    fn element_def(&mut self, member: &MemberDefinition) -> Result<Rc<StructDefinition>> {
        self.catalog
            .resolve(self.buf, &member.definition, self.format)?
            .ok_or_else(|| value_mismatch(member, "member has no element type definition"))
    }

    fn read_member(&mut self, member: &MemberDefinition) -> Result<Value> {
        match member.serialization {
            SerializationKind::UserRaw | SerializationKind::UserMember => {
                let serializer = self.serializer_for(member)?;
                let size = self.catalog.member_size(self.buf, member, self.format)?;
                let value = serializer.read(self.buf, member, self.pos)?;
                self.pos += size;
                return Ok(value);
            }
            // UserElement dispatches per array element below
            SerializationKind::UserElement | SerializationKind::Builtin => {}
        }

        let ps = self.format.pointer_size();
        let repeat = member.repeat();
        match member.kind {
            MemberKind::None => Err(value_mismatch(member, "sentinel kind in member list")),

            MemberKind::Inline => {
                let def = self.element_def(member)?;
                self.repeated(repeat, |r| Ok(Value::Struct(r.read_inline(&def)?)))
            }

            MemberKind::Reference => self.repeated(repeat, |r| {
                let target = r.buf.read_pointer(r.pos)?;
                r.pos += ps;
                Ok(Value::Reference(match target {
                    Some(addr) => {
                        let def = r.element_def(member)?;
                        Some(r.read_struct_ref(addr, &def)?)
                    }
                    None => None,
                }))
            }),

            MemberKind::EmptyReference => self.repeated(repeat, |r| {
                // Always-null slot; reading validates the field is a proper
                // (relocated or zero) pointer, the target is ignored.
                r.buf.read_pointer(r.pos)?;
                r.pos += ps;
                Ok(Value::Reference(None))
            }),

            MemberKind::ReferenceToArray => self.repeated(repeat, |r| {
                let count = r.buf.read_u32(r.pos)? as usize;
                let target = r.buf.read_pointer(r.pos + 4)?;
                r.pos += 4 + ps;
                match target {
                    Some(addr) => {
                        let def = r.element_def(member)?;
                        Ok(Value::Array(r.read_elements(member, &def, addr, count)?))
                    }
                    None if count == 0 => Ok(Value::Array(Vec::new())),
                    None => Err(value_mismatch(member, "non-zero count with null array pointer")),
                }
            }),

            MemberKind::ArrayOfReferences => self.repeated(repeat, |r| {
                let count = r.buf.read_u32(r.pos)? as usize;
                let target = r.buf.read_pointer(r.pos + 4)?;
                r.pos += 4 + ps;
                match target {
                    Some(addr) => {
                        let def = r.element_def(member)?;
                        let mut items = Vec::with_capacity(count);
                        for i in 0..count {
                            let element = r.buf.read_pointer(addr + i * ps)?;
                            items.push(Value::Reference(match element {
                                Some(at) => Some(r.read_struct_ref(at, &def)?),
                                None => None,
                            }));
                        }
                        Ok(Value::Array(items))
                    }
                    None if count == 0 => Ok(Value::Array(Vec::new())),
                    None => Err(value_mismatch(member, "non-zero count with null array pointer")),
                }
            }),

            MemberKind::VariantReference => self.repeated(repeat, |r| {
                let type_ptr = r.buf.read_pointer(r.pos)?;
                let value_ptr = r.buf.read_pointer(r.pos + ps)?;
                r.pos += 2 * ps;
                match type_ptr {
                    None if value_ptr.is_some() => {
                        Err(value_mismatch(member, "variant value without a type pointer"))
                    }
                    None => Ok(Value::Variant { definition: None, value: None }),
                    Some(type_addr) => {
                        let def = r.variant_def(member, type_addr)?;
                        let value = match value_ptr {
                            Some(addr) => Some(r.read_struct_ref(addr, &def)?),
                            None => None,
                        };
                        Ok(Value::Variant { definition: Some(def), value })
                    }
                }
            }),

            MemberKind::ReferenceToVariantArray => self.repeated(repeat, |r| {
                let type_ptr = r.buf.read_pointer(r.pos)?;
                let count = r.buf.read_u32(r.pos + ps)? as usize;
                let target = r.buf.read_pointer(r.pos + ps + 4)?;
                r.pos += 2 * ps + 4;
                match (type_ptr, target) {
                    (Some(type_addr), Some(addr)) => {
                        let def = r.variant_def(member, type_addr)?;
                        Ok(Value::Array(r.read_elements(member, &def, addr, count)?))
                    }
                    (_, None) if count == 0 => Ok(Value::Array(Vec::new())),
                    (None, _) => Err(value_mismatch(member, "variant array without a type pointer")),
                    (_, None) => Err(value_mismatch(member, "non-zero count with null array pointer")),
                }
            }),

            MemberKind::String => self.repeated(repeat, |r| {
                let target = r.buf.read_pointer(r.pos)?;
                r.pos += ps;
                Ok(Value::Str(match target {
                    Some(addr) => Some(r.string_at(addr)?),
                    None => None,
                }))
            }),

            MemberKind::Transform => self.repeated(repeat, |r| {
                let transform = Transform::read(r.buf, r.pos)?;
                r.pos += 68;
                Ok(Value::Transform(transform))
            }),

            MemberKind::Real32 => self.scalar(repeat, 4, |r| Ok(Value::Real32(r.buf.read_f32(r.pos)?))),
            MemberKind::Real16 => self.scalar(repeat, 2, |r| Ok(Value::Real16(r.buf.read_f16(r.pos)?))),
            MemberKind::Int8 | MemberKind::BinormalInt8 => {
                self.scalar(repeat, 1, |r| Ok(Value::Int8(r.buf.read_i8(r.pos)?)))
            }
            MemberKind::UInt8 | MemberKind::NormalUInt8 => {
                self.scalar(repeat, 1, |r| Ok(Value::UInt8(r.buf.read_u8(r.pos)?)))
            }
            MemberKind::Int16 | MemberKind::BinormalInt16 => {
                self.scalar(repeat, 2, |r| Ok(Value::Int16(r.buf.read_i16(r.pos)?)))
            }
            MemberKind::UInt16 | MemberKind::NormalUInt16 => {
                self.scalar(repeat, 2, |r| Ok(Value::UInt16(r.buf.read_u16(r.pos)?)))
            }
            MemberKind::Int32 => self.scalar(repeat, 4, |r| Ok(Value::Int32(r.buf.read_i32(r.pos)?))),
            MemberKind::UInt32 | MemberKind::UnsupportedUInt32 => {
                self.scalar(repeat, 4, |r| Ok(Value::UInt32(r.buf.read_u32(r.pos)?)))
            }
        }
    }

    /// Load a variant's concrete type from its type pointer, then give the
    /// selector a chance to substitute.
    fn variant_def(
        &mut self,
        member: &MemberDefinition,
        type_addr: usize,
    ) -> Result<Rc<StructDefinition>> {
        let declared = self.catalog.load(self.buf, type_addr, self.format)?;
        if let Some(selector) = self.options.variant_selector.as_deref() {
            if let Some(substituted) = selector.select(member, &declared) {
                tracing::trace!(member = %member.name, "variant type substituted");
                return Ok(substituted);
            }
        }
        Ok(declared)
    }

    /// Read `count` consecutive struct elements starting at `addr`.
    fn read_elements(
        &mut self,
        member: &MemberDefinition,
        def: &Rc<StructDefinition>,
        addr: usize,
        count: usize,
    ) -> Result<Vec<Value>> {
        let stride = self.catalog.struct_size(self.buf, def, self.format)?;
        let mut items = Vec::with_capacity(count);
        if member.serialization == SerializationKind::UserElement {
            let serializer = self.serializer_for(member)?;
            for i in 0..count {
                items.push(serializer.read(self.buf, member, addr + i * stride)?);
            }
        } else {
            for i in 0..count {
                items.push(Value::Struct(self.read_struct_ref(addr + i * stride, def)?));
            }
        }
        Ok(items)
    }

    fn string_at(&mut self, addr: usize) -> Result<Rc<str>> {
        if let Some(cached) = self.strings.get(&addr) {
            return Ok(Rc::clone(cached));
        }
        let string: Rc<str> = Rc::from(self.buf.read_cstring(addr)?);
        self.strings.insert(addr, Rc::clone(&string));
        Ok(string)
    }

    /// Run `f` `repeat` times for a fixed-size member, collecting into an
    /// array when the member declares one.
    fn repeated(
        &mut self,
        repeat: usize,
        mut f: impl FnMut(&mut Self) -> Result<Value>,
    ) -> Result<Value> {
        if repeat == 1 {
            return f(self);
        }
        let mut items = Vec::with_capacity(repeat);
        for _ in 0..repeat {
            items.push(f(self)?);
        }
        Ok(Value::Array(items))
    }

    fn scalar(
        &mut self,
        repeat: usize,
        width: usize,
        mut f: impl FnMut(&mut Self) -> Result<Value>,
    ) -> Result<Value> {
        self.repeated(repeat, |r| {
            let value = f(r)?;
            r.pos += width;
            Ok(value)
        })
    }
}

fn value_mismatch(member: &MemberDefinition, message: impl Into<String>) -> Error {
    Error::ValueMismatch {
        member: member.name.clone(),
        message: message.into(),
    }
}
