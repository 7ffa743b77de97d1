//! # granary
//!
//! A pure-Rust engine for the GR2 (Granny2) self-describing binary
//! container format.
//!
//! GR2 files carry their own schema: a dedicated section holds struct
//! definitions for every native type in the file, and the object graph is
//! decoded by walking those definitions. This crate reads such files into a
//! dynamic value model and writes the model back out, reproducing the
//! container's framing (magic, header, sections, relocations, marshalling
//! tables, payload CRC) byte for byte.
//!
//! ## Reading a file
//!
//! ```no_run
//! use granary::prelude::*;
//!
//! let bytes = std::fs::read("model.gr2")?;
//! let document = read_gr2(&bytes, &ReaderOptions::default())?;
//! println!("version {} root fields: {}", document.version, document.root.borrow().fields.len());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Writing a graph
//!
//! ```
//! use granary::prelude::*;
//! use std::rc::Rc;
//!
//! let def = StructDefinition::new(vec![MemberDefinition::new("Count", MemberKind::Int32)]);
//! let mut root = Instance::new(Rc::clone(&def));
//! root.set("Count", Value::Int32(3));
//!
//! let document = Gr2Document {
//!     version: 7,
//!     format: FileFormat::Le64,
//!     tag: 0,
//!     extra_tags: [0; 4],
//!     root_definition: def,
//!     root: root.shared(),
//!     types: TypeCatalog::new(),
//! };
//! let bytes = write_gr2(&document, &WriterOptions::default())?;
//! # Ok::<(), granary::Error>(())
//! ```
//!
//! ## Compressed sections
//!
//! The Oodle0/Oodle1/`BitKnit` section codecs are proprietary and live
//! outside this crate; install one through [`ReaderOptions::codec`] /
//! [`WriterOptions::codec`]. The default [`NullCodec`] handles
//! uncompressed files only.
//!
//! [`ReaderOptions::codec`]: formats::gr2::ReaderOptions
//! [`WriterOptions::codec`]: formats::gr2::WriterOptions
//! [`NullCodec`]: formats::gr2::NullCodec

pub mod error;
pub mod formats;

// Re-exports for convenience
pub use error::{Error, Result};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::formats::gr2::{
        read_gr2, write_gr2, CodecParams, CompressionMethod, FileFormat, Gr2Document, Instance,
        MemberDefinition, MemberKind, NodeSerializer, NullCodec, ReaderOptions, SectionCodec,
        SectionKind, SectionSelector, SerializationKind, SharedInstance, StructDefinition,
        Transform, TypeCatalog, TypeRef, Value, VariantTypeSelector, WriterOptions,
    };
}
