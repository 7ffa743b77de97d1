//! In-memory object model.
//!
//! Decoded files become a graph of [`Instance`] nodes, each pairing a
//! struct definition with an ordered field map. Shared subobjects are real
//! shared nodes: two fields decoded from the same file address hold clones
//! of one [`SharedInstance`], observable through [`Rc::ptr_eq`].

use std::cell::RefCell;
use std::rc::Rc;

use half::f16;
use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::formats::gr2::section::Unified;
use crate::formats::gr2::type_system::StructDefinition;

/// A struct node shared across the graph.
pub type SharedInstance = Rc<RefCell<Instance>>;

/// One decoded struct: its definition plus fields in schema order.
#[derive(Debug, Clone, Default)]
pub struct Instance {
    /// The definition this instance was decoded with (or will be encoded with)
    pub definition: Rc<StructDefinition>,
    /// Field values, keyed by member name, in schema order
    pub fields: IndexMap<String, Value>,
}

impl Instance {
    pub fn new(definition: Rc<StructDefinition>) -> Self {
        Self {
            definition,
            fields: IndexMap::new(),
        }
    }

    /// Wrap in the shared handle used throughout the graph.
    pub fn shared(self) -> SharedInstance {
        Rc::new(RefCell::new(self))
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }
}

/// A decoded member value.
#[derive(Debug, Clone)]
pub enum Value {
    /// 32-bit float
    Real32(f32),
    /// 16-bit half float
    Real16(f16),
    /// Signed 8-bit (plain, binormal-scaled share the representation)
    Int8(i8),
    /// Unsigned 8-bit (plain or normal-scaled)
    UInt8(u8),
    /// Signed 16-bit (plain or binormal-scaled)
    Int16(i16),
    /// Unsigned 16-bit (plain or normal-scaled)
    UInt16(u16),
    /// Signed 32-bit
    Int32(i32),
    /// Unsigned 32-bit (also legacy switchable-type slots)
    UInt32(u32),
    /// String reference; `None` for a null pointer
    Str(Option<Rc<str>>),
    /// Decomposed transform
    Transform(Transform),
    /// Inline struct data
    Struct(SharedInstance),
    /// Pointer to a struct; `None` for null
    Reference(Option<SharedInstance>),
    /// Polymorphic reference carrying its own type
    Variant {
        /// The referenced value's definition; `None` when the value is null
        definition: Option<Rc<StructDefinition>>,
        /// The referenced value
        value: Option<SharedInstance>,
    },
    /// Array member (fixed repeats and counted arrays both decode to this)
    Array(Vec<Value>),
}

impl Value {
    /// The array elements, or an error naming `member` for anything else.
    pub fn as_array(&self, member: &str) -> Result<&[Value]> {
        match self {
            Self::Array(items) => Ok(items),
            other => Err(Error::ValueMismatch {
                member: member.to_string(),
                message: format!("expected array, found {}", other.kind_name()),
            }),
        }
    }

    /// Short name of the variant, for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Real32(_) => "real32",
            Self::Real16(_) => "real16",
            Self::Int8(_) => "int8",
            Self::UInt8(_) => "uint8",
            Self::Int16(_) => "int16",
            Self::UInt16(_) => "uint16",
            Self::Int32(_) => "int32",
            Self::UInt32(_) => "uint32",
            Self::Str(_) => "string",
            Self::Transform(_) => "transform",
            Self::Struct(_) => "struct",
            Self::Reference(_) => "reference",
            Self::Variant { .. } => "variant",
            Self::Array(_) => "array",
        }
    }
}

/// Transform flag: translation differs from zero.
pub const TRANSFORM_HAS_TRANSLATION: u32 = 1;
/// Transform flag: rotation differs from identity.
pub const TRANSFORM_HAS_ROTATION: u32 = 2;
/// Transform flag: scale/shear differs from identity.
pub const TRANSFORM_HAS_SCALE_SHEAR: u32 = 4;

/// Decomposed transform: 17 little-endian 4-byte fields on disk (flags,
/// translation xyz, rotation xyzw, 3x3 scale/shear, row-major).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    /// Which components differ from identity
    pub flags: u32,
    pub translation: [f32; 3],
    /// Quaternion, xyzw order
    pub rotation: [f32; 4],
    /// Row-major 3x3
    pub scale_shear: [[f32; 3]; 3],
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Self = Self {
        flags: 0,
        translation: [0.0; 3],
        rotation: [0.0, 0.0, 0.0, 1.0],
        scale_shear: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
    };

    /// Build a transform from its components, deriving the flags. Components
    /// within tolerance of identity are collapsed to exact identity.
    pub fn from_parts(translation: [f32; 3], rotation: [f32; 4], scale_shear: [[f32; 3]; 3]) -> Self {
        let mut out = Self::IDENTITY;

        if translation.iter().any(|c| c.abs() > 1e-4) {
            out.flags |= TRANSFORM_HAS_TRANSLATION;
            out.translation = translation;
        }

        let rotation_deviation = (rotation[0].abs())
            .max(rotation[1].abs())
            .max(rotation[2].abs())
            .max((rotation[3].abs() - 1.0).abs());
        if rotation_deviation >= 1e-3 {
            out.flags |= TRANSFORM_HAS_ROTATION;
            out.rotation = rotation;
        }

        let mut scale_deviation = 0.0f32;
        for (row, identity_row) in scale_shear.iter().zip(Self::IDENTITY.scale_shear.iter()) {
            for (cell, identity_cell) in row.iter().zip(identity_row.iter()) {
                scale_deviation = scale_deviation.max((cell - identity_cell).abs());
            }
        }
        if scale_deviation > 1e-4 {
            out.flags |= TRANSFORM_HAS_SCALE_SHEAR;
            out.scale_shear = scale_shear;
        }

        out
    }

    /// Decode the 68-byte record at `offset`.
    pub fn read(buf: &Unified, offset: usize) -> Result<Self> {
        let mut fields = [0.0f32; 16];
        let flags = buf.read_u32(offset)?;
        for (i, field) in fields.iter_mut().enumerate() {
            *field = buf.read_f32(offset + 4 + i * 4)?;
        }
        Ok(Self {
            flags,
            translation: [fields[0], fields[1], fields[2]],
            rotation: [fields[3], fields[4], fields[5], fields[6]],
            scale_shear: [
                [fields[7], fields[8], fields[9]],
                [fields[10], fields[11], fields[12]],
                [fields[13], fields[14], fields[15]],
            ],
        })
    }

    /// Encode as the 68-byte on-disk record.
    pub fn to_bytes(self) -> [u8; 68] {
        let mut out = [0u8; 68];
        out[0..4].copy_from_slice(&self.flags.to_le_bytes());
        let fields: [f32; 16] = [
            self.translation[0],
            self.translation[1],
            self.translation[2],
            self.rotation[0],
            self.rotation[1],
            self.rotation[2],
            self.rotation[3],
            self.scale_shear[0][0],
            self.scale_shear[0][1],
            self.scale_shear[0][2],
            self.scale_shear[1][0],
            self.scale_shear[1][1],
            self.scale_shear[1][2],
            self.scale_shear[2][0],
            self.scale_shear[2][1],
            self.scale_shear[2][2],
        ];
        for (i, field) in fields.iter().enumerate() {
            out[4 + i * 4..8 + i * 4].copy_from_slice(&field.to_le_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_identity_collapses_to_no_flags() {
        let t = Transform::from_parts(
            [1e-6, -1e-6, 0.0],
            [0.0, 1e-5, 0.0, 1.0],
            [[1.0, 0.0, 0.0], [0.0, 1.00005, 0.0], [0.0, 0.0, 1.0]],
        );
        assert_eq!(t, Transform::IDENTITY);
    }

    #[test]
    fn test_flags_derive_per_component() {
        let t = Transform::from_parts(
            [0.5, 0.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
            [[2.0, 0.0, 0.0], [0.0, 2.0, 0.0], [0.0, 0.0, 2.0]],
        );
        assert_eq!(t.flags, TRANSFORM_HAS_TRANSLATION | TRANSFORM_HAS_SCALE_SHEAR);
        assert_eq!(t.rotation, [0.0, 0.0, 0.0, 1.0]);

        let r = Transform::from_parts([0.0; 3], [0.0, 0.70710677, 0.0, 0.70710677], Transform::IDENTITY.scale_shear);
        assert_eq!(r.flags, TRANSFORM_HAS_ROTATION);
    }

    #[test]
    fn test_transform_byte_layout() {
        let t = Transform::from_parts(
            [1.0, 2.0, 3.0],
            [0.0, 0.0, 0.0, 1.0],
            Transform::IDENTITY.scale_shear,
        );
        let bytes = t.to_bytes();
        assert_eq!(&bytes[0..4], &TRANSFORM_HAS_TRANSLATION.to_le_bytes());
        assert_eq!(&bytes[4..8], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[12..16], &3.0f32.to_le_bytes());
        // rotation w sits at field index 6
        assert_eq!(&bytes[4 + 6 * 4..4 + 7 * 4], &1.0f32.to_le_bytes());
    }

    #[test]
    fn test_shared_instances_compare_by_pointer() {
        let def = StructDefinition::new(vec![]);
        let a = Instance::new(Rc::clone(&def)).shared();
        let b = Instance::new(def).shared();
        let a2 = Rc::clone(&a);
        assert!(Rc::ptr_eq(&a, &a2));
        assert!(!Rc::ptr_eq(&a, &b));
    }
}
