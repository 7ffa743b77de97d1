//! Object graph writer.
//!
//! Serializes an object graph back into a GR2 byte image. Writing is
//! breadth-first: serializing a struct emits its scalar and inline data in
//! place, writes zero placeholders for every pointer field, and enqueues the
//! referenced payloads (structs, array blocks, strings, type definitions) on
//! per-kind queues. A fixed-point flush loop drains the queues until nothing
//! new is enqueued; a finalization pass then resolves every placeholder into
//! a relocation table entry, lays out the sections, and backpatches the
//! header with the file size and payload CRC.
//!
//! Output is deterministic: the same graph serializes to the same bytes.

use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::formats::gr2::codec::{CompressionMethod, NullCodec, SectionCodec};
use crate::formats::gr2::format::{
    FileFormat, Gr2Header, Gr2Magic, MixedMarshallingEntry, Relocation, SectionHeader,
    SectionKind, SectionRef, MAGIC_SIZE, SECTION_HEADER_SIZE,
};
use crate::formats::gr2::instance::{Instance, SharedInstance, Transform, Value};
use crate::formats::gr2::reader::{Gr2Document, NodeSerializer};
use crate::formats::gr2::type_system::{
    MemberDefinition, MemberKind, SerializationKind, StructDefinition, TypeCatalog, TypeRef,
};

/// Overrides the section a member's payload lands in.
pub trait SectionSelector {
    fn section_for(&self, member: &MemberDefinition, value: &Value) -> Option<SectionKind>;
}

/// Write-session configuration.
pub struct WriterOptions {
    /// Section compression; method [`CompressionMethod::None`] writes
    /// uncompressed sections through any codec
    pub compression: CompressionMethod,
    /// Compression level handed to the codec
    pub compression_level: u32,
    /// Codec used when `compression` is not `None`
    pub codec: Box<dyn SectionCodec>,
    /// Optional per-member section override
    pub section_selector: Option<Box<dyn SectionSelector>>,
    /// Custom serializers, keyed by member name
    pub serializers: HashMap<String, Box<dyn NodeSerializer>>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            compression: CompressionMethod::None,
            compression_level: 0,
            codec: Box::new(NullCodec),
            section_selector: None,
            serializers: HashMap::new(),
        }
    }
}

/// Encode a document into a GR2 byte image.
pub fn write_gr2(document: &Gr2Document, options: &WriterOptions) -> Result<Vec<u8>> {
    if document.format.is_big_endian() {
        return Err(Error::BigEndianNotSupported);
    }
    if document.version != 6 && document.version != 7 {
        return Err(Error::UnsupportedVersion { version: document.version });
    }

    let mut writer = Writer::new(document.version, document.format, options, &document.types);
    let root_struct = writer.enqueue_struct(&document.root, MAIN);
    let root_type = writer.enqueue_type(&document.root_definition);
    writer.flush()?;
    tracing::debug!(
        structs = writer.struct_jobs.len(),
        arrays = writer.array_jobs.len(),
        strings = writer.string_jobs.len(),
        types = writer.type_jobs.len(),
        fixups = writer.fixups.len(),
        "graph serialized"
    );
    writer.assemble(document, root_struct, root_type)
}

/// Which stream of a section a payload is written into. Data areas are
/// appended after the section's main stream at layout time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Area {
    Main,
    Data,
}

/// A write destination: section plus stream within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Placement {
    section: usize,
    area: Area,
}

const MAIN: Placement = Placement { section: 0, area: Area::Main };
const TYPES: Placement = Placement {
    section: SectionKind::Discardable as usize,
    area: Area::Main,
};

/// A payload location within a section, relative to its area stream.
#[derive(Debug, Clone, Copy)]
struct Location {
    placement: Placement,
    offset: usize,
}

/// Pending-payload handle a placeholder pointer will be fixed up to.
#[derive(Debug, Clone, Copy)]
enum Target {
    Struct(usize),
    Array(usize),
    Str(usize),
    Type(usize),
}

/// A zero placeholder awaiting relocation-table emission.
#[derive(Debug, Clone, Copy)]
struct Fixup {
    site: Location,
    target: Target,
}

struct StructJob {
    instance: SharedInstance,
    def: Rc<StructDefinition>,
    placement: Placement,
    offset: Option<usize>,
}

enum ArrayPayload {
    /// Contiguous struct elements
    Structs {
        items: Vec<SharedInstance>,
        def: Rc<StructDefinition>,
    },
    /// Pointer table, one slot per element
    Pointers { items: Vec<Option<SharedInstance>> },
    /// Elements encoded by a registered serializer
    Custom {
        member: MemberDefinition,
        items: Vec<Value>,
    },
}

struct ArrayJob {
    payload: ArrayPayload,
    placement: Placement,
    offset: Option<usize>,
}

struct StringJob {
    text: String,
    placement: Placement,
    offset: Option<usize>,
}

struct TypeJob {
    def: Rc<StructDefinition>,
    offset: Option<usize>,
}

/// Byte-swap descriptor recorded for struct data that mixes 8-bit and wider
/// members; emitted into the owning section's marshalling table.
struct MarshalRecord {
    count: u32,
    location: Location,
    type_id: usize,
}

struct SectionBuf {
    main: Vec<u8>,
    data: Vec<u8>,
}

struct Writer<'a> {
    version: u32,
    format: FileFormat,
    options: &'a WriterOptions,
    /// Definitions from the document's read session, for address-form links
    types: &'a TypeCatalog,
    sections: Vec<SectionBuf>,

    struct_jobs: Vec<StructJob>,
    struct_queue: VecDeque<usize>,
    struct_ids: HashMap<usize, usize>,

    array_jobs: Vec<ArrayJob>,
    array_queue: VecDeque<usize>,

    string_jobs: Vec<StringJob>,
    string_queue: VecDeque<usize>,
    string_ids: HashMap<String, usize>,

    type_jobs: Vec<TypeJob>,
    type_queue: VecDeque<usize>,
    type_ids: HashMap<usize, usize>,

    fixups: Vec<Fixup>,
    marshal: Vec<MarshalRecord>,
}

impl<'a> Writer<'a> {
    fn new(
        version: u32,
        format: FileFormat,
        options: &'a WriterOptions,
        types: &'a TypeCatalog,
    ) -> Self {
        let sections = (0..SectionKind::COUNT)
            .map(|_| SectionBuf { main: Vec::new(), data: Vec::new() })
            .collect();
        Self {
            version,
            format,
            options,
            types,
            sections,
            struct_jobs: Vec::new(),
            struct_queue: VecDeque::new(),
            struct_ids: HashMap::new(),
            array_jobs: Vec::new(),
            array_queue: VecDeque::new(),
            string_jobs: Vec::new(),
            string_queue: VecDeque::new(),
            string_ids: HashMap::new(),
            type_jobs: Vec::new(),
            type_queue: VecDeque::new(),
            type_ids: HashMap::new(),
            fixups: Vec::new(),
            marshal: Vec::new(),
        }
    }

    fn stream_len(&self, placement: Placement) -> usize {
        match placement.area {
            Area::Main => self.sections[placement.section].main.len(),
            Area::Data => self.sections[placement.section].data.len(),
        }
    }

    fn stream_mut(&mut self, placement: Placement) -> &mut Vec<u8> {
        match placement.area {
            Area::Main => &mut self.sections[placement.section].main,
            Area::Data => &mut self.sections[placement.section].data,
        }
    }

    // ==================== enqueueing ====================

    /// Queue a struct node, deduplicated by node identity; shared nodes
    /// serialize once and every pointer to them relocates to the same spot.
    fn enqueue_struct(&mut self, instance: &SharedInstance, placement: Placement) -> usize {
        let key = Rc::as_ptr(instance) as usize;
        if let Some(&id) = self.struct_ids.get(&key) {
            return id;
        }
        let def = Rc::clone(&instance.borrow().definition);
        let id = self.struct_jobs.len();
        self.struct_jobs.push(StructJob {
            instance: Rc::clone(instance),
            def,
            placement,
            offset: None,
        });
        self.struct_ids.insert(key, id);
        self.struct_queue.push_back(id);
        id
    }

    fn enqueue_array(&mut self, payload: ArrayPayload, placement: Placement) -> usize {
        let id = self.array_jobs.len();
        self.array_jobs.push(ArrayJob { payload, placement, offset: None });
        self.array_queue.push_back(id);
        id
    }

    /// Queue a string, deduplicated by content for the whole session.
    fn enqueue_string(&mut self, text: &str, placement: Placement) -> usize {
        if let Some(&id) = self.string_ids.get(text) {
            return id;
        }
        let id = self.string_jobs.len();
        self.string_jobs.push(StringJob {
            text: text.to_string(),
            placement,
            offset: None,
        });
        self.string_ids.insert(text.to_string(), id);
        self.string_queue.push_back(id);
        id
    }

    /// Queue a struct definition for the type section, deduplicated by
    /// definition identity.
    fn enqueue_type(&mut self, def: &Rc<StructDefinition>) -> usize {
        let key = Rc::as_ptr(def) as usize;
        if let Some(&id) = self.type_ids.get(&key) {
            return id;
        }
        let id = self.type_jobs.len();
        self.type_jobs.push(TypeJob { def: Rc::clone(def), offset: None });
        self.type_ids.insert(key, id);
        self.type_queue.push_back(id);
        id
    }

    /// Resolve a member's nested type to an in-memory definition. Address
    /// links resolve through the document's type catalog.
    fn resolve_type(
        &self,
        member: &MemberDefinition,
        type_ref: &TypeRef,
    ) -> Result<Option<Rc<StructDefinition>>> {
        match type_ref {
            TypeRef::None => Ok(None),
            TypeRef::Def(def) => Ok(Some(Rc::clone(def))),
            TypeRef::Address(addr) => self
                .types
                .cached(*addr)
                .map(Some)
                .ok_or_else(|| value_mismatch(member, "type definition not loaded in this session")),
        }
    }

    /// Section and stream a member's payload lands in, relative to the
    /// stream the member itself is being written into.
    fn placement_for(
        &self,
        member: &MemberDefinition,
        value: Option<&Value>,
        parent: Placement,
    ) -> Placement {
        if let (Some(selector), Some(value)) = (self.options.section_selector.as_deref(), value) {
            if let Some(kind) = selector.section_for(member, value) {
                return Placement { section: kind.index(), area: Area::Main };
            }
        }
        if let Some(kind) = member.preferred_section {
            return Placement { section: kind.index(), area: Area::Main };
        }
        if member.data_area {
            return Placement { section: parent.section, area: Area::Data };
        }
        Placement { section: parent.section, area: Area::Main }
    }

    fn serializer_for(&self, member: &MemberDefinition) -> Result<&'a dyn NodeSerializer> {
        self.options
            .serializers
            .get(&member.name)
            .map(AsRef::as_ref)
            .ok_or_else(|| Error::SerializerMissing { member: member.name.clone() })
    }

    // ==================== flush loop ====================

    /// Drain all queues to a fixed point. Draining one job may enqueue more
    /// work on any queue.
    fn flush(&mut self) -> Result<()> {
        loop {
            if let Some(id) = self.struct_queue.pop_front() {
                self.flush_struct(id)?;
            } else if let Some(id) = self.array_queue.pop_front() {
                self.flush_array(id)?;
            } else if let Some(id) = self.string_queue.pop_front() {
                self.flush_string(id);
            } else if let Some(id) = self.type_queue.pop_front() {
                self.flush_type(id)?;
            } else {
                return Ok(());
            }
        }
    }

    fn flush_struct(&mut self, id: usize) -> Result<()> {
        let (instance, def, placement) = {
            let job = &self.struct_jobs[id];
            (Rc::clone(&job.instance), Rc::clone(&job.def), job.placement)
        };
        let base = self.stream_len(placement);
        self.struct_jobs[id].offset = Some(base);

        let mut out = Vec::new();
        {
            let inst = instance.borrow();
            self.serialize_struct(&mut out, base, placement, &inst, &def)?;
        }
        if needs_mixed_marshalling(self.types, &def)? {
            let type_id = self.enqueue_type(&def);
            self.marshal.push(MarshalRecord {
                count: 1,
                location: Location { placement, offset: base },
                type_id,
            });
        }
        self.stream_mut(placement).extend_from_slice(&out);
        Ok(())
    }

    fn flush_array(&mut self, id: usize) -> Result<()> {
        let placement = self.array_jobs[id].placement;
        let base = self.stream_len(placement);
        self.array_jobs[id].offset = Some(base);

        // Payload moved out to appease the borrow of self during
        // serialization; the job only needs its offset afterwards.
        let payload = std::mem::replace(
            &mut self.array_jobs[id].payload,
            ArrayPayload::Pointers { items: Vec::new() },
        );

        let mut out = Vec::new();
        match &payload {
            ArrayPayload::Structs { items, def } => {
                for item in items {
                    let offset = base + out.len();
                    self.register_element(item, placement, offset, def);
                    let inst = item.borrow();
                    self.serialize_struct(&mut out, base, placement, &inst, def)?;
                }
                if !items.is_empty() && needs_mixed_marshalling(self.types, def)? {
                    let type_id = self.enqueue_type(def);
                    self.marshal.push(MarshalRecord {
                        count: items.len() as u32,
                        location: Location { placement, offset: base },
                        type_id,
                    });
                }
            }
            ArrayPayload::Pointers { items } => {
                let ps = self.format.pointer_size();
                for item in items {
                    if let Some(instance) = item {
                        let target = self.enqueue_struct(instance, placement);
                        self.fixups.push(Fixup {
                            site: Location { placement, offset: base + out.len() },
                            target: Target::Struct(target),
                        });
                    }
                    zeros(&mut out, ps);
                }
            }
            ArrayPayload::Custom { member, items } => {
                let serializer = self.serializer_for(member)?;
                for item in items {
                    out.extend_from_slice(&serializer.write(member, item)?);
                }
            }
        }
        self.stream_mut(placement).extend_from_slice(&out);
        Ok(())
    }

    /// Give an array element its own addressable identity, so a standalone
    /// reference to the same node relocates into the array block.
    fn register_element(
        &mut self,
        instance: &SharedInstance,
        placement: Placement,
        offset: usize,
        def: &Rc<StructDefinition>,
    ) {
        let key = Rc::as_ptr(instance) as usize;
        if self.struct_ids.contains_key(&key) {
            return;
        }
        let id = self.struct_jobs.len();
        self.struct_jobs.push(StructJob {
            instance: Rc::clone(instance),
            def: Rc::clone(def),
            placement,
            offset: Some(offset),
        });
        self.struct_ids.insert(key, id);
    }

    fn flush_string(&mut self, id: usize) {
        let placement = self.string_jobs[id].placement;
        let base = self.stream_len(placement);
        self.string_jobs[id].offset = Some(base);
        let bytes = {
            let mut bytes = self.string_jobs[id].text.clone().into_bytes();
            bytes.push(0);
            bytes
        };
        self.stream_mut(placement).extend_from_slice(&bytes);
    }

    /// Emit a definition's member records plus the end sentinel into the
    /// type section.
    fn flush_type(&mut self, id: usize) -> Result<()> {
        let def = Rc::clone(&self.type_jobs[id].def);
        let base = self.stream_len(TYPES);
        self.type_jobs[id].offset = Some(base);

        let ps = self.format.pointer_size();
        let record = MemberDefinition::record_size(self.format);
        let version = self.version;
        let mut out = Vec::new();

        for member in def.members_for(version) {
            out.extend_from_slice(&member.kind.as_u32().to_le_bytes());

            if member.name.is_empty() {
                zeros(&mut out, ps);
            } else {
                let target = self.enqueue_string(&member.name, TYPES);
                self.fixups.push(Fixup {
                    site: Location { placement: TYPES, offset: base + out.len() },
                    target: Target::Str(target),
                });
                zeros(&mut out, ps);
            }

            match self.resolve_type(member, &member.definition)? {
                Some(nested) => {
                    let target = self.enqueue_type(&nested);
                    self.fixups.push(Fixup {
                        site: Location { placement: TYPES, offset: base + out.len() },
                        target: Target::Type(target),
                    });
                    zeros(&mut out, ps);
                }
                None => zeros(&mut out, ps),
            }

            out.extend_from_slice(&member.array_size.to_le_bytes());
            for extra in member.extra {
                out.extend_from_slice(&extra.to_le_bytes());
            }
            zeros(&mut out, ps);
        }
        zeros(&mut out, record);
        self.stream_mut(TYPES).extend_from_slice(&out);
        Ok(())
    }

    // ==================== struct serialization ====================

    fn serialize_struct(
        &mut self,
        out: &mut Vec<u8>,
        base: usize,
        placement: Placement,
        instance: &Instance,
        def: &StructDefinition,
    ) -> Result<()> {
        let version = self.version;
        for member in def.members.iter().filter(|m| m.in_version(version)) {
            let value = instance.fields.get(&member.name);
            self.serialize_member(out, base, placement, member, value)?;
        }
        Ok(())
    }

    fn serialize_member(
        &mut self,
        out: &mut Vec<u8>,
        base: usize,
        placement: Placement,
        member: &MemberDefinition,
        value: Option<&Value>,
    ) -> Result<()> {
        match member.serialization {
            SerializationKind::UserRaw | SerializationKind::UserMember => {
                let serializer = self.serializer_for(member)?;
                let value = value
                    .ok_or_else(|| value_mismatch(member, "custom-serialized member has no value"))?;
                let bytes = serializer.write(member, value)?;
                let expected = self.member_write_size(member)?;
                if bytes.len() != expected {
                    return Err(value_mismatch(
                        member,
                        format!("serializer produced {} bytes, layout needs {expected}", bytes.len()),
                    ));
                }
                out.extend_from_slice(&bytes);
                return Ok(());
            }
            SerializationKind::UserElement | SerializationKind::Builtin => {}
        }

        let ps = self.format.pointer_size();
        let repeat = member.repeat();
        for i in 0..repeat {
            let element = element_at(member, value, repeat, i)?;
            self.serialize_element(out, base, placement, member, element, ps)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn serialize_element(
        &mut self,
        out: &mut Vec<u8>,
        base: usize,
        placement: Placement,
        member: &MemberDefinition,
        value: Option<&Value>,
        ps: usize,
    ) -> Result<()> {
        match member.kind {
            MemberKind::None => Err(value_mismatch(member, "sentinel kind in member list")),

            MemberKind::Inline => {
                let def = self
                    .resolve_type(member, &member.definition)?
                    .ok_or_else(|| value_mismatch(member, "inline member lacks a struct definition"))?;
                match value {
                    Some(Value::Struct(instance)) => {
                        let inst = instance.borrow();
                        self.serialize_struct(out, base, placement, &inst, &def)
                    }
                    None => {
                        let empty = Instance::new(Rc::clone(&def));
                        self.serialize_struct(out, base, placement, &empty, &def)
                    }
                    Some(other) => Err(type_error(member, "struct", other)),
                }
            }

            MemberKind::Reference => match value {
                Some(Value::Reference(Some(instance))) => {
                    let child = self.placement_for(member, value, placement);
                    let target = self.enqueue_struct(instance, child);
                    self.pointer_fixup(out, base, placement, Target::Struct(target), ps);
                    Ok(())
                }
                Some(Value::Reference(None)) | None => {
                    zeros(out, ps);
                    Ok(())
                }
                Some(other) => Err(type_error(member, "reference", other)),
            },

            MemberKind::EmptyReference => match value {
                Some(Value::Reference(Some(_))) => {
                    Err(value_mismatch(member, "empty-reference slot holds a value"))
                }
                _ => {
                    zeros(out, ps);
                    Ok(())
                }
            },

            MemberKind::ReferenceToArray => {
                let items = array_items(member, value)?;
                if member.serialization == SerializationKind::UserElement {
                    return self.write_counted_array(out, base, placement, member, value, items.len(), |w, child| {
                        Ok(Some(w.enqueue_array(
                            ArrayPayload::Custom { member: member.clone(), items: items.to_vec() },
                            child,
                        )))
                    });
                }
                let instances = struct_items(member, items)?;
                let def = match self.resolve_type(member, &member.definition)? {
                    Some(def) => Some(def),
                    None => instances.first().map(|i| Rc::clone(&i.borrow().definition)),
                };
                self.write_counted_array(out, base, placement, member, value, instances.len(), |w, child| {
                    let def = def
                        .clone()
                        .ok_or_else(|| value_mismatch(member, "array member has no element type"))?;
                    Ok(Some(w.enqueue_array(ArrayPayload::Structs { items: instances.clone(), def }, child)))
                })
            }

            MemberKind::ArrayOfReferences => {
                let items = array_items(member, value)?;
                let mut pointers = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::Reference(target) => pointers.push(target.clone()),
                        other => return Err(type_error(member, "reference element", other)),
                    }
                }
                self.write_counted_array(out, base, placement, member, value, pointers.len(), |w, child| {
                    Ok(Some(w.enqueue_array(ArrayPayload::Pointers { items: pointers.clone() }, child)))
                })
            }

            MemberKind::VariantReference => match value {
                Some(Value::Variant { definition, value: variant_value }) => {
                    match definition {
                        Some(def) => {
                            let target = self.enqueue_type(def);
                            self.pointer_fixup(out, base, placement, Target::Type(target), ps);
                        }
                        None => {
                            // A value with no type pointer can never be read
                            // back; refuse to emit it.
                            if variant_value.is_some() {
                                return Err(value_mismatch(
                                    member,
                                    "variant value without a type definition",
                                ));
                            }
                            zeros(out, ps);
                        }
                    }
                    match variant_value {
                        Some(instance) => {
                            let child = self.placement_for(member, value, placement);
                            let target = self.enqueue_struct(instance, child);
                            self.pointer_fixup(out, base, placement, Target::Struct(target), ps);
                        }
                        None => zeros(out, ps),
                    }
                    Ok(())
                }
                None => {
                    zeros(out, 2 * ps);
                    Ok(())
                }
                Some(other) => Err(type_error(member, "variant", other)),
            },

            MemberKind::ReferenceToVariantArray => {
                let items = array_items(member, value)?;
                let instances = struct_items(member, items)?;
                match instances.first() {
                    None => {
                        zeros(out, 2 * ps + 4);
                        Ok(())
                    }
                    Some(first) => {
                        let def = Rc::clone(&first.borrow().definition);
                        let type_target = self.enqueue_type(&def);
                        self.pointer_fixup(out, base, placement, Target::Type(type_target), ps);
                        out.extend_from_slice(&(instances.len() as u32).to_le_bytes());
                        let child = self.placement_for(member, value, placement);
                        let target =
                            self.enqueue_array(ArrayPayload::Structs { items: instances, def }, child);
                        self.pointer_fixup(out, base, placement, Target::Array(target), ps);
                        Ok(())
                    }
                }
            }

            MemberKind::String => match value {
                Some(Value::Str(Some(text))) => {
                    let child = self.placement_for(member, value, placement);
                    let child = Placement { section: child.section, area: Area::Main };
                    let target = self.enqueue_string(text, child);
                    self.pointer_fixup(out, base, placement, Target::Str(target), ps);
                    Ok(())
                }
                Some(Value::Str(None)) | None => {
                    zeros(out, ps);
                    Ok(())
                }
                Some(other) => Err(type_error(member, "string", other)),
            },

            MemberKind::Transform => {
                let transform = match value {
                    Some(Value::Transform(t)) => *t,
                    None => Transform::IDENTITY,
                    Some(other) => return Err(type_error(member, "transform", other)),
                };
                out.extend_from_slice(&transform.to_bytes());
                Ok(())
            }

            _ => self.serialize_scalar(out, member, value),
        }
    }

    /// Write `count` + pointer for an array-like member. The pointer is
    /// null and no payload is queued when the array is empty, so a non-zero
    /// pointer always pairs with a non-zero count.
    fn write_counted_array(
        &mut self,
        out: &mut Vec<u8>,
        base: usize,
        placement: Placement,
        member: &MemberDefinition,
        value: Option<&Value>,
        count: usize,
        enqueue: impl FnOnce(&mut Self, Placement) -> Result<Option<usize>>,
    ) -> Result<()> {
        let ps = self.format.pointer_size();
        out.extend_from_slice(&(count as u32).to_le_bytes());
        if count == 0 {
            zeros(out, ps);
            return Ok(());
        }
        let child = self.placement_for(member, value, placement);
        if let Some(target) = enqueue(self, child)? {
            self.pointer_fixup(out, base, placement, Target::Array(target), ps);
        }
        Ok(())
    }

    fn pointer_fixup(
        &mut self,
        out: &mut Vec<u8>,
        base: usize,
        placement: Placement,
        target: Target,
        ps: usize,
    ) {
        self.fixups.push(Fixup {
            site: Location { placement, offset: base + out.len() },
            target,
        });
        zeros(out, ps);
    }

    fn serialize_scalar(
        &mut self,
        out: &mut Vec<u8>,
        member: &MemberDefinition,
        value: Option<&Value>,
    ) -> Result<()> {
        match member.kind {
            MemberKind::Real32 => match value {
                Some(Value::Real32(v)) => out.extend_from_slice(&v.to_le_bytes()),
                None => out.extend_from_slice(&0.0f32.to_le_bytes()),
                Some(other) => return Err(type_error(member, "real32", other)),
            },
            MemberKind::Real16 => match value {
                Some(Value::Real16(v)) => out.extend_from_slice(&v.to_bits().to_le_bytes()),
                None => out.extend_from_slice(&[0, 0]),
                Some(other) => return Err(type_error(member, "real16", other)),
            },
            MemberKind::Int8 | MemberKind::BinormalInt8 => match value {
                Some(Value::Int8(v)) => out.push(*v as u8),
                None => out.push(0),
                Some(other) => return Err(type_error(member, "int8", other)),
            },
            MemberKind::UInt8 | MemberKind::NormalUInt8 => match value {
                Some(Value::UInt8(v)) => out.push(*v),
                None => out.push(0),
                Some(other) => return Err(type_error(member, "uint8", other)),
            },
            MemberKind::Int16 | MemberKind::BinormalInt16 => match value {
                Some(Value::Int16(v)) => out.extend_from_slice(&v.to_le_bytes()),
                None => out.extend_from_slice(&[0, 0]),
                Some(other) => return Err(type_error(member, "int16", other)),
            },
            MemberKind::UInt16 | MemberKind::NormalUInt16 => match value {
                Some(Value::UInt16(v)) => out.extend_from_slice(&v.to_le_bytes()),
                None => out.extend_from_slice(&[0, 0]),
                Some(other) => return Err(type_error(member, "uint16", other)),
            },
            MemberKind::Int32 => match value {
                Some(Value::Int32(v)) => out.extend_from_slice(&v.to_le_bytes()),
                None => out.extend_from_slice(&0i32.to_le_bytes()),
                Some(other) => return Err(type_error(member, "int32", other)),
            },
            MemberKind::UInt32 | MemberKind::UnsupportedUInt32 => match value {
                Some(Value::UInt32(v)) => out.extend_from_slice(&v.to_le_bytes()),
                None => out.extend_from_slice(&0u32.to_le_bytes()),
                Some(other) => return Err(type_error(member, "uint32", other)),
            },
            _ => return Err(value_mismatch(member, "member kind is not a scalar")),
        }
        Ok(())
    }

    /// Layout size of one member, fixed-array repeat included.
    fn member_write_size(&self, member: &MemberDefinition) -> Result<usize> {
        let inline = if member.kind == MemberKind::Inline {
            match self.resolve_type(member, &member.definition)? {
                Some(def) => self.struct_write_size(&def)?,
                None => 0,
            }
        } else {
            0
        };
        Ok(member.unit_size(self.format, inline) * member.repeat())
    }

    fn struct_write_size(&self, def: &StructDefinition) -> Result<usize> {
        let mut total = 0;
        for member in def.members_for(self.version) {
            total += self.member_write_size(member)?;
        }
        Ok(total)
    }

    // ==================== finalization ====================

    /// Lay out sections, resolve fixups into relocation tables, emit
    /// marshalling tables, frame the file, and backpatch size + CRC.
    fn assemble(
        self,
        document: &Gr2Document,
        root_struct: usize,
        root_type: usize,
    ) -> Result<Vec<u8>> {
        let num_sections = self.sections.len();

        // Final uncompressed section images: main stream, aligned, then the
        // data area.
        let mut data_base = vec![0usize; num_sections];
        let mut images: Vec<Vec<u8>> = Vec::with_capacity(num_sections);
        for (index, section) in self.sections.iter().enumerate() {
            let mut image = section.main.clone();
            if !section.data.is_empty() {
                let aligned = align(image.len(), 4);
                image.resize(aligned, 0);
                data_base[index] = aligned;
                image.extend_from_slice(&section.data);
            }
            images.push(image);
        }

        let locate = |location: Location| -> (u32, u32) {
            let area_base = match location.area() {
                Area::Main => 0,
                Area::Data => data_base[location.placement.section],
            };
            (
                location.placement.section as u32,
                (area_base + location.offset) as u32,
            )
        };
        let target_location = |target: Target| -> Result<Location> {
            let (placement, offset) = match target {
                Target::Struct(id) => (self.struct_jobs[id].placement, self.struct_jobs[id].offset),
                Target::Array(id) => (self.array_jobs[id].placement, self.array_jobs[id].offset),
                Target::Str(id) => (self.string_jobs[id].placement, self.string_jobs[id].offset),
                Target::Type(id) => (TYPES, self.type_jobs[id].offset),
            };
            let offset = offset.ok_or(Error::SectionDataInvalid {
                section: placement.section,
                message: "fixup target was never written".to_string(),
            })?;
            Ok(Location { placement, offset })
        };

        // Pass 1: relocation tables.
        let mut relocations: Vec<Vec<Relocation>> = vec![Vec::new(); num_sections];
        for fixup in &self.fixups {
            let (site_section, site_offset) = locate(fixup.site);
            let (target_section, target_offset) = locate(target_location(fixup.target)?);
            relocations[site_section as usize].push(Relocation {
                offset_in_section: site_offset,
                target: SectionRef { section: target_section, offset: target_offset },
            });
        }

        // Pass 2: mixed-marshalling tables.
        let mut marshalling: Vec<Vec<MixedMarshallingEntry>> = vec![Vec::new(); num_sections];
        for record in &self.marshal {
            let (section, offset) = locate(record.location);
            let (type_section, type_offset) = locate(target_location(Target::Type(record.type_id))?);
            marshalling[section as usize].push(MixedMarshallingEntry {
                count: record.count,
                offset_in_section: offset,
                type_ref: SectionRef { section: type_section, offset: type_offset },
            });
        }

        // Layout: magic, header, section table, then per section its data
        // followed by its relocation and marshalling tables.
        let header_size = Gr2Header::size_for_version(self.version) as usize;
        let data_start = MAGIC_SIZE + header_size + num_sections * SECTION_HEADER_SIZE;
        let compressing = self.options.compression != CompressionMethod::None;

        let mut headers = Vec::with_capacity(num_sections);
        let mut blobs: Vec<Vec<u8>> = Vec::new();
        let mut cursor = data_start;
        for (index, image) in images.iter().enumerate() {
            let mut header = SectionHeader {
                alignment: 4,
                uncompressed_size: image.len() as u32,
                ..SectionHeader::default()
            };

            if image.is_empty() {
                header.offset_in_file = cursor as u32;
            } else {
                let on_disk = if compressing {
                    self.options.codec.compress(
                        self.options.compression,
                        self.options.compression_level,
                        image,
                    )?
                } else {
                    image.clone()
                };
                header.compression = if compressing {
                    self.options.compression.as_u32()
                } else {
                    0
                };
                header.offset_in_file = cursor as u32;
                header.compressed_size = on_disk.len() as u32;
                cursor += on_disk.len();
                blobs.push(on_disk);
            }

            if !relocations[index].is_empty() {
                let table = self.side_table(&relocations[index], compressing, |entry, buf| {
                    entry.write(buf)
                })?;
                header.relocations_offset = cursor as u32;
                header.num_relocations = relocations[index].len() as u32;
                cursor += table.len();
                blobs.push(table);
            }

            if !marshalling[index].is_empty() {
                let table = self.side_table(&marshalling[index], compressing, |entry, buf| {
                    entry.write(buf)
                })?;
                header.mixed_marshalling_offset = cursor as u32;
                header.num_mixed_marshalling = marshalling[index].len() as u32;
                cursor += table.len();
                blobs.push(table);
            }

            headers.push(header);
        }

        let root_node_offset = self.struct_jobs[root_struct].offset.unwrap_or(0);
        let root_type_offset = self.type_jobs[root_type].offset.unwrap_or(0);
        let header = Gr2Header {
            version: self.version,
            file_size: 0,
            crc: 0,
            sections_offset: header_size as u32,
            num_sections: num_sections as u32,
            root_type: SectionRef {
                section: TYPES.section as u32,
                offset: root_type_offset as u32,
            },
            root_node: SectionRef { section: 0, offset: root_node_offset as u32 },
            tag: document.tag,
            extra_tags: document.extra_tags,
            string_table_crc: 0,
        };
        let magic = Gr2Magic {
            signature: self.format.signature(),
            headers_size: data_start as u32,
            header_format: 0,
            reserved: [0, 0],
        };

        let mut out = Vec::with_capacity(cursor);
        magic.write(&mut out)?;
        header.write(&mut out)?;
        for section_header in &headers {
            section_header.write(&mut out)?;
        }
        for blob in &blobs {
            out.extend_from_slice(blob);
        }

        // Backpatch file size, then the payload CRC (computed last so it
        // covers the final bytes).
        let file_size = (out.len() as u32).to_le_bytes();
        out[MAGIC_SIZE + 4..MAGIC_SIZE + 8].copy_from_slice(&file_size);

        let payload_start = MAGIC_SIZE + header_size;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&out[payload_start..]);
        let crc = hasher.finalize().to_le_bytes();
        out[MAGIC_SIZE + 8..MAGIC_SIZE + 12].copy_from_slice(&crc);

        tracing::debug!(bytes = out.len(), sections = num_sections, "file assembled");
        Ok(out)
    }

    /// Serialize a relocation or marshalling table, compressed with a u32
    /// on-disk size prefix when the sections are compressed.
    fn side_table<T>(
        &self,
        entries: &[T],
        compressing: bool,
        write_entry: impl Fn(&T, &mut Vec<u8>) -> Result<()>,
    ) -> Result<Vec<u8>> {
        let mut raw = Vec::new();
        for entry in entries {
            write_entry(entry, &mut raw)?;
        }
        if !compressing {
            return Ok(raw);
        }
        let compressed = self.options.codec.compress(
            self.options.compression,
            self.options.compression_level,
            &raw,
        )?;
        let mut out = Vec::with_capacity(4 + compressed.len());
        out.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        out.extend_from_slice(&compressed);
        Ok(out)
    }
}

impl Location {
    fn area(self) -> Area {
        self.placement.area
    }
}

/// A struct mixes 8-bit and wider members; its data needs a marshalling
/// descriptor for cross-endian consumers. Inline members splice their
/// nested type's layout into the owning block, so their widths count too.
fn needs_mixed_marshalling(types: &TypeCatalog, def: &StructDefinition) -> Result<bool> {
    let mut narrow = false;
    let mut wide = false;
    collect_scalar_widths(types, def, &mut narrow, &mut wide)?;
    Ok(narrow && wide)
}

fn collect_scalar_widths(
    types: &TypeCatalog,
    def: &StructDefinition,
    narrow: &mut bool,
    wide: &mut bool,
) -> Result<()> {
    for member in &def.members {
        match member.kind {
            MemberKind::Inline => {
                let nested = match &member.definition {
                    TypeRef::None => None,
                    TypeRef::Def(def) => Some(Rc::clone(def)),
                    TypeRef::Address(addr) => Some(types.cached(*addr).ok_or_else(|| {
                        value_mismatch(member, "type definition not loaded in this session")
                    })?),
                };
                if let Some(nested) = nested {
                    collect_scalar_widths(types, &nested, narrow, wide)?;
                }
            }
            MemberKind::Transform => *wide = true,
            kind => match kind.scalar_width() {
                1 => *narrow = true,
                w if w > 1 => *wide = true,
                _ => {}
            },
        }
    }
    Ok(())
}

fn align(offset: usize, to: usize) -> usize {
    offset.next_multiple_of(to)
}

fn zeros(out: &mut Vec<u8>, count: usize) {
    out.resize(out.len() + count, 0);
}

/// Pick the i-th element of a fixed-repeat member's value.
fn element_at<'v>(
    member: &MemberDefinition,
    value: Option<&'v Value>,
    repeat: usize,
    index: usize,
) -> Result<Option<&'v Value>> {
    if repeat == 1 {
        return Ok(value);
    }
    match value {
        None => Ok(None),
        Some(Value::Array(items)) => Ok(items.get(index)),
        Some(other) => Err(type_error(member, "array", other)),
    }
}

fn array_items<'v>(member: &MemberDefinition, value: Option<&'v Value>) -> Result<&'v [Value]> {
    match value {
        None => Ok(&[]),
        Some(value) => value.as_array(&member.name),
    }
}

fn struct_items(member: &MemberDefinition, items: &[Value]) -> Result<Vec<SharedInstance>> {
    items
        .iter()
        .map(|item| match item {
            Value::Struct(instance) => Ok(Rc::clone(instance)),
            other => Err(type_error(member, "struct element", other)),
        })
        .collect()
}

fn value_mismatch(member: &MemberDefinition, message: impl Into<String>) -> Error {
    Error::ValueMismatch {
        member: member.name.clone(),
        message: message.into(),
    }
}

fn type_error(member: &MemberDefinition, expected: &str, found: &Value) -> Error {
    value_mismatch(member, format!("expected {expected}, found {}", found.kind_name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment() {
        assert_eq!(align(0, 4), 0);
        assert_eq!(align(1, 4), 4);
        assert_eq!(align(4, 4), 4);
        assert_eq!(align(13, 4), 16);
    }

    #[test]
    fn test_marshalling_detection() {
        let types = TypeCatalog::new();

        let mixed = StructDefinition::new(vec![
            MemberDefinition::new("Flags", MemberKind::UInt8),
            MemberDefinition::new("Count", MemberKind::UInt32),
        ]);
        assert!(needs_mixed_marshalling(&types, &mixed).unwrap());

        let uniform = StructDefinition::new(vec![
            MemberDefinition::new("A", MemberKind::UInt32),
            MemberDefinition::new("B", MemberKind::Real32),
        ]);
        assert!(!needs_mixed_marshalling(&types, &uniform).unwrap());

        let bytes_only = StructDefinition::new(vec![MemberDefinition::new("Raw", MemberKind::UInt8)]);
        assert!(!needs_mixed_marshalling(&types, &bytes_only).unwrap());
    }

    #[test]
    fn test_marshalling_detection_sees_through_inline_members() {
        let types = TypeCatalog::new();

        // The byte lives inside a nested inline struct; the block layout
        // still mixes widths.
        let flags = StructDefinition::new(vec![MemberDefinition::new("Enabled", MemberKind::UInt8)]);
        let inline = MemberDefinition::with_def("Flags", MemberKind::Inline, flags);
        let outer = StructDefinition::new(vec![
            inline.clone(),
            MemberDefinition::new("Count", MemberKind::UInt32),
        ]);
        assert!(needs_mixed_marshalling(&types, &outer).unwrap());

        // All-byte nesting stays uniform.
        let bytes_only = StructDefinition::new(vec![
            inline,
            MemberDefinition::new("Tag", MemberKind::UInt8),
        ]);
        assert!(!needs_mixed_marshalling(&types, &bytes_only).unwrap());
    }
}
