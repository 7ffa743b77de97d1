//! GR2 (Granny 3D) container engine.
//!
//! Self-describing binary containers: a type section carries struct
//! definitions for everything in the file, and the object graph is decoded
//! and encoded by walking those definitions. Compression is an external
//! collaborator behind the [`SectionCodec`] seam.

pub mod codec;
pub mod format;
pub mod instance;
pub mod reader;
pub mod section;
pub mod type_system;
pub mod writer;

// Public API exports
pub use codec::{CodecParams, CompressionMethod, NullCodec, SectionCodec};
pub use format::{
    classify_signature, FileFormat, Gr2Header, Gr2Magic, MixedMarshallingEntry, Relocation,
    SectionHeader, SectionKind, SectionRef,
};
pub use instance::{Instance, SharedInstance, Transform, Value};
pub use reader::{read_gr2, Gr2Document, NodeSerializer, ReaderOptions, VariantTypeSelector};
pub use section::Unified;
pub use type_system::{
    MemberDefinition, MemberKind, SerializationKind, StructDefinition, TypeCatalog, TypeRef,
};
pub use writer::{write_gr2, SectionSelector, WriterOptions};
