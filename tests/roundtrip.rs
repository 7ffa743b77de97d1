//! End-to-end write/read round-trip tests.

use std::io::Cursor;
use std::rc::Rc;

use half::f16;
use pretty_assertions::assert_eq;

use granary::formats::gr2::{Gr2Header, Gr2Magic, SectionHeader};
use granary::prelude::*;

fn document(
    def: Rc<StructDefinition>,
    root: Instance,
    version: u32,
    format: FileFormat,
) -> Gr2Document {
    Gr2Document {
        version,
        format,
        tag: 0x1234_5678,
        extra_tags: [1, 2, 3, 4],
        root_definition: def,
        root: root.shared(),
        types: TypeCatalog::new(),
    }
}

fn inner_def() -> Rc<StructDefinition> {
    StructDefinition::new(vec![
        MemberDefinition::new("Name", MemberKind::String),
        MemberDefinition::new("Weight", MemberKind::Real32),
        MemberDefinition::new("Flags", MemberKind::UInt8),
        MemberDefinition::new("Count", MemberKind::UInt32),
    ])
}

fn inner_instance(def: &Rc<StructDefinition>, name: &str, weight: f32) -> SharedInstance {
    let mut inst = Instance::new(Rc::clone(def));
    inst.set("Name", Value::Str(Some(Rc::from(name))));
    inst.set("Weight", Value::Real32(weight));
    inst.set("Flags", Value::UInt8(0x7F));
    inst.set("Count", Value::UInt32(9));
    inst.shared()
}

/// A graph exercising strings, shared references, arrays, transforms,
/// fixed repeats and a mixed-width struct (which gets a marshalling table).
fn rich_document() -> Gr2Document {
    let inner = inner_def();
    let element = StructDefinition::new(vec![MemberDefinition::new("V", MemberKind::Int32)]);

    let root_def = StructDefinition::new(vec![
        MemberDefinition::new("Title", MemberKind::String),
        MemberDefinition::with_def("First", MemberKind::Reference, Rc::clone(&inner)),
        MemberDefinition::with_def("Second", MemberKind::Reference, Rc::clone(&inner)),
        MemberDefinition::with_def("Items", MemberKind::ReferenceToArray, Rc::clone(&element)),
        MemberDefinition::with_def("Links", MemberKind::ArrayOfReferences, Rc::clone(&inner)),
        MemberDefinition::new("Pose", MemberKind::Transform),
        MemberDefinition::new("Half", MemberKind::Real16),
        MemberDefinition::new("Hole", MemberKind::EmptyReference),
        {
            let mut pad = MemberDefinition::new("Pad", MemberKind::UInt8);
            pad.array_size = 3;
            pad
        },
    ]);

    let shared = inner_instance(&inner, "bone_pelvis", 2.5);
    let items: Vec<Value> = [10i32, 20, 30]
        .iter()
        .map(|&v| {
            let mut e = Instance::new(Rc::clone(&element));
            e.set("V", Value::Int32(v));
            Value::Struct(e.shared())
        })
        .collect();

    let mut root = Instance::new(Rc::clone(&root_def));
    root.set("Title", Value::Str(Some(Rc::from("scene"))));
    root.set("First", Value::Reference(Some(Rc::clone(&shared))));
    root.set("Second", Value::Reference(Some(Rc::clone(&shared))));
    root.set("Items", Value::Array(items));
    root.set(
        "Links",
        Value::Array(vec![
            Value::Reference(Some(shared)),
            Value::Reference(None),
        ]),
    );
    root.set(
        "Pose",
        Value::Transform(Transform::from_parts(
            [1.0, -2.0, 0.5],
            [0.0, 0.707, 0.0, 0.707],
            Transform::IDENTITY.scale_shear,
        )),
    );
    root.set("Half", Value::Real16(f16::from_f32(1.5)));
    root.set(
        "Pad",
        Value::Array(vec![Value::UInt8(1), Value::UInt8(2), Value::UInt8(3)]),
    );

    document(root_def, root, 7, FileFormat::Le64)
}

#[test]
fn test_write_read_write_is_byte_identical() {
    let doc = rich_document();
    let first = write_gr2(&doc, &WriterOptions::default()).unwrap();
    let read_back = read_gr2(&first, &ReaderOptions::default()).unwrap();
    let second = write_gr2(&read_back, &WriterOptions::default()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_shared_references_stay_shared() {
    let doc = rich_document();
    let bytes = write_gr2(&doc, &WriterOptions::default()).unwrap();
    let read_back = read_gr2(&bytes, &ReaderOptions::default()).unwrap();

    let root = read_back.root.borrow();
    let first = match root.get("First") {
        Some(Value::Reference(Some(node))) => Rc::clone(node),
        other => panic!("unexpected First: {other:?}"),
    };
    let second = match root.get("Second") {
        Some(Value::Reference(Some(node))) => Rc::clone(node),
        other => panic!("unexpected Second: {other:?}"),
    };
    let linked = match root.get("Links") {
        Some(Value::Array(items)) => match &items[0] {
            Value::Reference(Some(node)) => Rc::clone(node),
            other => panic!("unexpected link: {other:?}"),
        },
        other => panic!("unexpected Links: {other:?}"),
    };
    assert!(Rc::ptr_eq(&first, &second));
    assert!(Rc::ptr_eq(&first, &linked));
    assert!(matches!(root.get("Links"), Some(Value::Array(items)) if matches!(items[1], Value::Reference(None))));

    let node = first.borrow();
    assert!(matches!(node.get("Weight"), Some(Value::Real32(w)) if (*w - 2.5).abs() < f32::EPSILON));
    assert!(matches!(node.get("Name"), Some(Value::Str(Some(s))) if s.as_ref() == "bone_pelvis"));
}

#[test]
fn test_transform_survives_roundtrip() {
    let doc = rich_document();
    let bytes = write_gr2(&doc, &WriterOptions::default()).unwrap();
    let read_back = read_gr2(&bytes, &ReaderOptions::default()).unwrap();

    let root = read_back.root.borrow();
    match root.get("Pose") {
        Some(Value::Transform(t)) => {
            assert_eq!(t.flags, 1 | 2);
            assert_eq!(t.translation, [1.0, -2.0, 0.5]);
            assert_eq!(t.rotation, [0.0, 0.707, 0.0, 0.707]);
        }
        other => panic!("unexpected Pose: {other:?}"),
    }
}

#[test]
fn test_crc_detects_payload_corruption() {
    let doc = rich_document();
    let mut bytes = write_gr2(&doc, &WriterOptions::default()).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;

    let err = read_gr2(&bytes, &ReaderOptions::default()).unwrap_err();
    assert!(matches!(err, Error::CrcMismatch { .. }));
}

#[test]
fn test_big_endian_rejected_before_header() {
    let mut bytes = FileFormat::Be64.signature().to_vec();
    bytes.resize(32, 0);
    let err = read_gr2(&bytes, &ReaderOptions::default()).unwrap_err();
    assert!(matches!(err, Error::BigEndianNotSupported));
}

#[test]
fn test_empty_struct_roundtrips() {
    let def = StructDefinition::new(vec![]);
    let root = Instance::new(Rc::clone(&def));
    let doc = document(def, root, 7, FileFormat::Le64);

    let bytes = write_gr2(&doc, &WriterOptions::default()).unwrap();
    let read_back = read_gr2(&bytes, &ReaderOptions::default()).unwrap();
    assert_eq!(read_back.root.borrow().fields.len(), 0);
    assert_eq!(read_back.version, 7);
    assert_eq!(read_back.tag, 0x1234_5678);
    assert_eq!(read_back.extra_tags, [1, 2, 3, 4]);
}

#[test]
fn test_int32_array_layout_and_values() {
    let element = StructDefinition::new(vec![MemberDefinition::new("V", MemberKind::Int32)]);
    let root_def = StructDefinition::new(vec![MemberDefinition::with_def(
        "Items",
        MemberKind::ReferenceToArray,
        Rc::clone(&element),
    )]);

    let items: Vec<Value> = [10i32, 20, 30]
        .iter()
        .map(|&v| {
            let mut e = Instance::new(Rc::clone(&element));
            e.set("V", Value::Int32(v));
            Value::Struct(e.shared())
        })
        .collect();
    let mut root = Instance::new(Rc::clone(&root_def));
    root.set("Items", Value::Array(items));
    let doc = document(root_def, root, 7, FileFormat::Le32);

    let bytes = write_gr2(&doc, &WriterOptions::default()).unwrap();

    // Root struct is count + pointer (8 bytes on 32-bit), the element block
    // is 3 x 4 bytes appended after it.
    let mut cursor = Cursor::new(bytes.as_slice());
    let _ = Gr2Magic::read(&mut cursor).unwrap();
    let header = Gr2Header::read(&mut cursor).unwrap();
    let section0 = SectionHeader::read(&mut cursor).unwrap();
    assert_eq!(header.version, 7);
    assert_eq!(section0.uncompressed_size, 8 + 12);

    let read_back = read_gr2(&bytes, &ReaderOptions::default()).unwrap();
    let root = read_back.root.borrow();
    match root.get("Items") {
        Some(Value::Array(items)) => {
            let values: Vec<i32> = items
                .iter()
                .map(|item| match item {
                    Value::Struct(node) => match node.borrow().get("V") {
                        Some(Value::Int32(v)) => *v,
                        other => panic!("unexpected element: {other:?}"),
                    },
                    other => panic!("unexpected item: {other:?}"),
                })
                .collect();
            assert_eq!(values, vec![10, 20, 30]);
        }
        other => panic!("unexpected Items: {other:?}"),
    }
}

struct SubstituteWith(Rc<StructDefinition>);

impl VariantTypeSelector for SubstituteWith {
    fn select(
        &self,
        _member: &MemberDefinition,
        _declared: &Rc<StructDefinition>,
    ) -> Option<Rc<StructDefinition>> {
        Some(Rc::clone(&self.0))
    }
}

#[test]
fn test_variant_selector_substitutes_concrete_type() {
    let declared = StructDefinition::new(vec![MemberDefinition::new("Value", MemberKind::Int32)]);
    let root_def =
        StructDefinition::new(vec![MemberDefinition::new("Thing", MemberKind::VariantReference)]);

    let mut payload = Instance::new(Rc::clone(&declared));
    payload.set("Value", Value::Int32(42));
    let mut root = Instance::new(Rc::clone(&root_def));
    root.set(
        "Thing",
        Value::Variant {
            definition: Some(Rc::clone(&declared)),
            value: Some(payload.shared()),
        },
    );
    let doc = document(root_def, root, 7, FileFormat::Le64);
    let bytes = write_gr2(&doc, &WriterOptions::default()).unwrap();

    // Same layout, different schema name for the single member.
    let substituted =
        StructDefinition::new(vec![MemberDefinition::new("Number", MemberKind::Int32)]);
    let options = ReaderOptions {
        variant_selector: Some(Box::new(SubstituteWith(Rc::clone(&substituted)))),
        ..ReaderOptions::default()
    };
    let read_back = read_gr2(&bytes, &options).unwrap();

    let root = read_back.root.borrow();
    match root.get("Thing") {
        Some(Value::Variant { definition: Some(def), value: Some(node) }) => {
            assert!(Rc::ptr_eq(def, &substituted));
            assert!(matches!(node.borrow().get("Number"), Some(Value::Int32(42))));
        }
        other => panic!("unexpected Thing: {other:?}"),
    }
}

#[test]
fn test_document_debug_formatting() {
    let doc = rich_document();
    let bytes = write_gr2(&doc, &WriterOptions::default()).unwrap();
    let read_back = read_gr2(&bytes, &ReaderOptions::default()).unwrap();

    let rendered = format!("{read_back:?}");
    assert!(rendered.contains("Gr2Document"));
    assert!(rendered.contains("version: 7"));
}

#[test]
fn test_variant_value_without_type_is_rejected() {
    let payload_def =
        StructDefinition::new(vec![MemberDefinition::new("Value", MemberKind::Int32)]);
    let root_def =
        StructDefinition::new(vec![MemberDefinition::new("Thing", MemberKind::VariantReference)]);

    let mut payload = Instance::new(Rc::clone(&payload_def));
    payload.set("Value", Value::Int32(42));
    let mut root = Instance::new(Rc::clone(&root_def));
    root.set(
        "Thing",
        Value::Variant { definition: None, value: Some(payload.shared()) },
    );
    let doc = document(root_def, root, 7, FileFormat::Le64);

    // A value pointer with no type pointer cannot be read back.
    let err = write_gr2(&doc, &WriterOptions::default()).unwrap_err();
    assert!(matches!(err, Error::ValueMismatch { ref member, .. } if member == "Thing"));
}

#[test]
fn test_inline_nested_byte_gets_marshalling_entry() {
    let flags = StructDefinition::new(vec![MemberDefinition::new("Enabled", MemberKind::UInt8)]);
    let root_def = StructDefinition::new(vec![
        MemberDefinition::with_def("Flags", MemberKind::Inline, Rc::clone(&flags)),
        MemberDefinition::new("Count", MemberKind::UInt32),
    ]);

    let mut nested = Instance::new(flags);
    nested.set("Enabled", Value::UInt8(1));
    let mut root = Instance::new(Rc::clone(&root_def));
    root.set("Flags", Value::Struct(nested.shared()));
    root.set("Count", Value::UInt32(7));
    let doc = document(root_def, root, 7, FileFormat::Le64);

    let bytes = write_gr2(&doc, &WriterOptions::default()).unwrap();

    // The byte is buried in the inline struct, but the root block still
    // mixes 8-bit and 32-bit data and needs a descriptor.
    let mut cursor = Cursor::new(bytes.as_slice());
    let _ = Gr2Magic::read(&mut cursor).unwrap();
    let _ = Gr2Header::read(&mut cursor).unwrap();
    let section0 = SectionHeader::read(&mut cursor).unwrap();
    assert_eq!(section0.num_mixed_marshalling, 1);

    let read_back = read_gr2(&bytes, &ReaderOptions::default()).unwrap();
    let root = read_back.root.borrow();
    match root.get("Flags") {
        Some(Value::Struct(node)) => {
            assert!(matches!(node.borrow().get("Enabled"), Some(Value::UInt8(1))));
        }
        other => panic!("unexpected Flags: {other:?}"),
    }
    assert!(matches!(root.get("Count"), Some(Value::UInt32(7))));
}

#[test]
fn test_empty_array_writes_no_pointer() {
    let element = StructDefinition::new(vec![MemberDefinition::new("V", MemberKind::Int32)]);
    let root_def = StructDefinition::new(vec![MemberDefinition::with_def(
        "Items",
        MemberKind::ReferenceToArray,
        element,
    )]);
    let mut root = Instance::new(Rc::clone(&root_def));
    root.set("Items", Value::Array(vec![]));
    let doc = document(root_def, root, 7, FileFormat::Le64);

    let bytes = write_gr2(&doc, &WriterOptions::default()).unwrap();

    // count + pointer both zero, so the main section needs no relocations.
    let mut cursor = Cursor::new(bytes.as_slice());
    let _ = Gr2Magic::read(&mut cursor).unwrap();
    let _ = Gr2Header::read(&mut cursor).unwrap();
    let section0 = SectionHeader::read(&mut cursor).unwrap();
    assert_eq!(section0.uncompressed_size, 12);
    assert_eq!(section0.num_relocations, 0);

    let read_back = read_gr2(&bytes, &ReaderOptions::default()).unwrap();
    assert!(matches!(
        read_back.root.borrow().get("Items"),
        Some(Value::Array(items)) if items.is_empty()
    ));
}

#[test]
fn test_unknown_compression_method_is_fatal() {
    let doc = rich_document();
    let mut bytes = write_gr2(&doc, &WriterOptions::default()).unwrap();

    // Patch section 0's compression id to an undefined value and re-seal
    // the payload CRC so the corruption is not masked by the CRC check.
    let section0_offset = 0x20 + 0x48;
    bytes[section0_offset..section0_offset + 4].copy_from_slice(&3u32.to_le_bytes());
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes[0x20 + 0x48..]);
    let crc = hasher.finalize().to_le_bytes();
    bytes[0x28..0x2C].copy_from_slice(&crc);

    let err = read_gr2(&bytes, &ReaderOptions::default()).unwrap_err();
    assert!(matches!(
        err,
        Error::UnsupportedCompression { method: 3, section: 0 }
    ));
}

#[test]
fn test_version_gated_member_is_skipped_on_v6() {
    let mut gated = MemberDefinition::new("NewField", MemberKind::UInt32);
    gated.min_version = 7;
    let def = StructDefinition::new(vec![
        MemberDefinition::new("Tag", MemberKind::UInt32),
        gated,
    ]);

    let mut root = Instance::new(Rc::clone(&def));
    root.set("Tag", Value::UInt32(11));
    root.set("NewField", Value::UInt32(99));
    let root = root.shared();

    let v6 = Gr2Document {
        version: 6,
        format: FileFormat::Le32,
        tag: 0,
        extra_tags: [0; 4],
        root_definition: Rc::clone(&def),
        root: Rc::clone(&root),
        types: TypeCatalog::new(),
    };
    let bytes = write_gr2(&v6, &WriterOptions::default()).unwrap();
    let read_back = read_gr2(&bytes, &ReaderOptions::default()).unwrap();
    {
        let node = read_back.root.borrow();
        assert!(matches!(node.get("Tag"), Some(Value::UInt32(11))));
        assert!(node.get("NewField").is_none());
    }

    let v7 = Gr2Document {
        version: 7,
        format: FileFormat::Le32,
        tag: 0,
        extra_tags: [0; 4],
        root_definition: def,
        root,
        types: TypeCatalog::new(),
    };
    let bytes = write_gr2(&v7, &WriterOptions::default()).unwrap();
    let read_back = read_gr2(&bytes, &ReaderOptions::default()).unwrap();
    let node = read_back.root.borrow();
    assert!(matches!(node.get("Tag"), Some(Value::UInt32(11))));
    assert!(matches!(node.get("NewField"), Some(Value::UInt32(99))));
}

#[test]
fn test_all_signatures_classify() {
    use granary::formats::gr2::classify_signature;

    let cases = [
        (FileFormat::Le32, false, 4),
        (FileFormat::Be32, true, 4),
        (FileFormat::Le64, false, 8),
        (FileFormat::Be64, true, 8),
    ];
    for (format, big_endian, pointer_size) in cases {
        let classified = classify_signature(&format.signature()).unwrap();
        assert_eq!(classified, format);
        assert_eq!(classified.is_big_endian(), big_endian);
        assert_eq!(classified.pointer_size(), pointer_size);
    }

    let err = classify_signature(&[0u8; 16]).unwrap_err();
    assert!(matches!(err, Error::InvalidSignature(_)));
}
