//! GR2 container framing: magic signatures, headers, section descriptors.
//!
//! Based on RAD Game Tools Granny2 format, version 2.11.8.0, as shipped by
//! Divinity: Original Sin 2 and Baldur's Gate 3.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::io::{Read, Write};

use crate::error::{Error, Result};

/// Size of the magic block at the start of every file.
pub const MAGIC_SIZE: usize = 32;

/// Header size for version 6 files.
pub const HEADER_SIZE_V6: u32 = 0x38;

/// Header size for version 7 files.
pub const HEADER_SIZE_V7: u32 = 0x48;

/// On-disk size of one section header.
pub const SECTION_HEADER_SIZE: usize = 44;

/// On-disk size of one relocation entry.
pub const RELOCATION_SIZE: usize = 12;

/// On-disk size of one mixed-marshalling entry.
pub const MIXED_MARSHALLING_SIZE: usize = 16;

/// Sentinel for an invalid/absent section index in a [`SectionRef`].
pub const INVALID_SECTION: u32 = u32::MAX;

/// Magic signatures for the known GR2 formats.
///
/// Each format has a primary signature and an alternate one; both classify
/// identically. Granny emitted either depending on tool revision.
pub mod magic {
    /// Little-endian 32-bit format
    pub const LE32: [u8; 16] = [
        0x29, 0xDE, 0x6C, 0xC0, 0xBA, 0xA4, 0x53, 0x2B,
        0x25, 0xF5, 0xB7, 0xA5, 0xF6, 0x66, 0xE2, 0xEE,
    ];

    /// Little-endian 32-bit format (alternate signature)
    pub const LE32_ALT: [u8; 16] = [
        0x29, 0x75, 0x31, 0x82, 0xBA, 0x02, 0x11, 0x77,
        0x25, 0x3A, 0x60, 0x2F, 0xF6, 0x6A, 0x8C, 0x2E,
    ];

    /// Big-endian 32-bit format
    pub const BE32: [u8; 16] = [
        0x0E, 0x11, 0x95, 0xB5, 0x6A, 0xA5, 0xB5, 0x4B,
        0xEB, 0x28, 0x28, 0x50, 0x25, 0x78, 0xB3, 0x04,
    ];

    /// Big-endian 32-bit format (alternate signature)
    pub const BE32_ALT: [u8; 16] = [
        0x0E, 0x74, 0xA2, 0x0A, 0x6A, 0xEB, 0xEB, 0x64,
        0xEB, 0x4E, 0x1E, 0xAB, 0x25, 0x91, 0xDB, 0x8F,
    ];

    /// Little-endian 64-bit format
    pub const LE64: [u8; 16] = [
        0xE5, 0x9B, 0x49, 0x5E, 0x6F, 0x63, 0x1F, 0x14,
        0x1E, 0x13, 0xEB, 0xA9, 0x90, 0xBE, 0xED, 0xC4,
    ];

    /// Little-endian 64-bit format (alternate signature)
    pub const LE64_ALT: [u8; 16] = [
        0xE5, 0x2F, 0x4A, 0xE1, 0x6F, 0xC2, 0x8A, 0xEE,
        0x1E, 0xD2, 0xB4, 0x4C, 0x90, 0xD7, 0x55, 0xAF,
    ];

    /// Big-endian 64-bit format
    pub const BE64: [u8; 16] = [
        0x31, 0x95, 0xD4, 0xE3, 0x20, 0xDC, 0x4F, 0x62,
        0xCC, 0x36, 0xD0, 0x3A, 0xB1, 0x82, 0xFF, 0x89,
    ];

    /// Big-endian 64-bit format (alternate signature)
    pub const BE64_ALT: [u8; 16] = [
        0x31, 0xC2, 0x4E, 0x7C, 0x20, 0x40, 0xA3, 0x25,
        0xCC, 0xE1, 0xC2, 0x7A, 0xB1, 0x32, 0x49, 0xF3,
    ];
}

/// Known game tags.
pub mod tags {
    /// Divinity: Original Sin
    pub const DOS: u32 = 0x80000037;
    /// Divinity: Original Sin Enhanced Edition
    pub const DOS_EE: u32 = 0x80000039;
    /// Divinity: Original Sin 2 / Baldur's Gate 3
    pub const DOS2_BG3: u32 = 0xE57F0039;
}

/// Endianness × pointer width, derived from the magic signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileFormat {
    /// Little-endian, 32-bit pointers
    Le32,
    /// Big-endian, 32-bit pointers
    Be32,
    /// Little-endian, 64-bit pointers
    Le64,
    /// Big-endian, 64-bit pointers
    Be64,
}

impl FileFormat {
    /// Pointer width in bytes.
    pub fn pointer_size(self) -> usize {
        match self {
            Self::Le32 | Self::Be32 => 4,
            Self::Le64 | Self::Be64 => 8,
        }
    }

    /// True for the big-endian variants.
    pub fn is_big_endian(self) -> bool {
        matches!(self, Self::Be32 | Self::Be64)
    }

    /// The primary signature for this format.
    pub fn signature(self) -> [u8; 16] {
        match self {
            Self::Le32 => magic::LE32,
            Self::Be32 => magic::BE32,
            Self::Le64 => magic::LE64,
            Self::Be64 => magic::BE64,
        }
    }
}

lazy_static::lazy_static! {
    static ref SIGNATURES: HashMap<[u8; 16], FileFormat> = {
        let mut m = HashMap::new();
        m.insert(magic::LE32, FileFormat::Le32);
        m.insert(magic::LE32_ALT, FileFormat::Le32);
        m.insert(magic::BE32, FileFormat::Be32);
        m.insert(magic::BE32_ALT, FileFormat::Be32);
        m.insert(magic::LE64, FileFormat::Le64);
        m.insert(magic::LE64_ALT, FileFormat::Le64);
        m.insert(magic::BE64, FileFormat::Be64);
        m.insert(magic::BE64_ALT, FileFormat::Be64);
        m
    };
}

/// Classify a 16-byte signature against the canonical constants.
pub fn classify_signature(signature: &[u8; 16]) -> Result<FileFormat> {
    SIGNATURES
        .get(signature)
        .copied()
        .ok_or(Error::InvalidSignature(*signature))
}

/// Magic block (32 bytes at offset 0).
#[derive(Debug, Clone)]
pub struct Gr2Magic {
    /// Format signature (16 bytes)
    pub signature: [u8; 16],
    /// Offset where section data begins
    pub headers_size: u32,
    /// Header format (0 = uncompressed)
    pub header_format: u32,
    /// Reserved fields, must be zero
    pub reserved: [u32; 2],
}

impl Gr2Magic {
    /// Read and validate the magic block.
    ///
    /// Classification happens before the header body is touched: unknown
    /// signatures, big-endian formats and compressed headers all fail here.
    pub fn read<R: Read>(reader: &mut R) -> Result<(Self, FileFormat)> {
        let mut signature = [0u8; 16];
        reader.read_exact(&mut signature)?;

        let format = classify_signature(&signature)?;
        if format.is_big_endian() {
            return Err(Error::BigEndianNotSupported);
        }

        let headers_size = reader.read_u32::<LittleEndian>()?;
        let header_format = reader.read_u32::<LittleEndian>()?;
        if header_format != 0 {
            return Err(Error::CompressedHeaderNotSupported { format: header_format });
        }

        let reserved = [
            reader.read_u32::<LittleEndian>()?,
            reader.read_u32::<LittleEndian>()?,
        ];
        for (i, &value) in reserved.iter().enumerate() {
            if value != 0 {
                return Err(Error::ReservedFieldNotZero { offset: 24 + i * 4, value });
            }
        }

        Ok((
            Self { signature, headers_size, header_format, reserved },
            format,
        ))
    }

    /// Write the magic block.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.signature)?;
        writer.write_u32::<LittleEndian>(self.headers_size)?;
        writer.write_u32::<LittleEndian>(self.header_format)?;
        writer.write_u32::<LittleEndian>(self.reserved[0])?;
        writer.write_u32::<LittleEndian>(self.reserved[1])?;
        Ok(())
    }
}

/// Reference to data in a section, used only in the header before sections
/// are unified into one address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionRef {
    pub section: u32,
    pub offset: u32,
}

impl SectionRef {
    /// The invalid/absent reference.
    pub const INVALID: Self = Self { section: INVALID_SECTION, offset: 0 };

    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            section: reader.read_u32::<LittleEndian>()?,
            offset: reader.read_u32::<LittleEndian>()?,
        })
    }

    pub fn write<W: Write>(self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(self.section)?;
        writer.write_u32::<LittleEndian>(self.offset)?;
        Ok(())
    }

    /// A reference is valid when its section index is not the sentinel.
    pub fn is_valid(self) -> bool {
        self.section != INVALID_SECTION
    }
}

impl Default for SectionRef {
    fn default() -> Self {
        Self::INVALID
    }
}

/// Main file header, starting at offset 0x20.
#[derive(Debug, Clone)]
pub struct Gr2Header {
    /// Format version (6 or 7)
    pub version: u32,
    /// Total file size
    pub file_size: u32,
    /// CRC32 of the payload (everything after the header)
    pub crc: u32,
    /// Offset to section headers, relative to header start
    pub sections_offset: u32,
    /// Number of sections
    pub num_sections: u32,
    /// Reference to the root type definition
    pub root_type: SectionRef,
    /// Reference to the root data node
    pub root_node: SectionRef,
    /// Game version tag
    pub tag: u32,
    /// Extra tags (4 u32 values)
    pub extra_tags: [u32; 4],
    /// String table CRC (v7 only, zero when unused)
    pub string_table_crc: u32,
}

impl Gr2Header {
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let version = reader.read_u32::<LittleEndian>()?;
        if version != 6 && version != 7 {
            return Err(Error::UnsupportedVersion { version });
        }

        let file_size = reader.read_u32::<LittleEndian>()?;
        let crc = reader.read_u32::<LittleEndian>()?;
        let sections_offset = reader.read_u32::<LittleEndian>()?;
        let num_sections = reader.read_u32::<LittleEndian>()?;
        let root_type = SectionRef::read(reader)?;
        let root_node = SectionRef::read(reader)?;
        let tag = reader.read_u32::<LittleEndian>()?;

        let mut extra_tags = [0u32; 4];
        for tag in &mut extra_tags {
            *tag = reader.read_u32::<LittleEndian>()?;
        }

        let string_table_crc = if version == 7 {
            let crc = reader.read_u32::<LittleEndian>()?;
            for i in 0..3u32 {
                let value = reader.read_u32::<LittleEndian>()?;
                if value != 0 {
                    return Err(Error::ReservedFieldNotZero {
                        offset: MAGIC_SIZE + 0x3C + (i as usize) * 4,
                        value,
                    });
                }
            }
            crc
        } else {
            0
        };

        let header = Self {
            version,
            file_size,
            crc,
            sections_offset,
            num_sections,
            root_type,
            root_node,
            tag,
            extra_tags,
            string_table_crc,
        };
        header.validate_roots()?;
        Ok(header)
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(self.version)?;
        writer.write_u32::<LittleEndian>(self.file_size)?;
        writer.write_u32::<LittleEndian>(self.crc)?;
        writer.write_u32::<LittleEndian>(self.sections_offset)?;
        writer.write_u32::<LittleEndian>(self.num_sections)?;
        self.root_type.write(writer)?;
        self.root_node.write(writer)?;
        writer.write_u32::<LittleEndian>(self.tag)?;
        for tag in self.extra_tags {
            writer.write_u32::<LittleEndian>(tag)?;
        }
        if self.version == 7 {
            writer.write_u32::<LittleEndian>(self.string_table_crc)?;
            for _ in 0..3 {
                writer.write_u32::<LittleEndian>(0)?;
            }
        }
        Ok(())
    }

    /// Header size is a pure function of the version.
    pub fn size(&self) -> u32 {
        Self::size_for_version(self.version)
    }

    pub fn size_for_version(version: u32) -> u32 {
        if version == 7 { HEADER_SIZE_V7 } else { HEADER_SIZE_V6 }
    }

    fn validate_roots(&self) -> Result<()> {
        for root in [self.root_type, self.root_node] {
            if root.is_valid() && root.section >= self.num_sections {
                return Err(Error::RootSectionOutOfRange {
                    section: root.section,
                    num_sections: self.num_sections,
                });
            }
        }
        Ok(())
    }
}

/// Role of a section within the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SectionKind {
    /// File info, models, top-level structures
    Main = 0,
    /// Animation track groups
    TrackGroup = 1,
    /// Skeleton data
    Skeleton = 2,
    /// Mesh data
    Mesh = 3,
    /// Struct definitions and other data a consumer may discard after load
    Discardable = 4,
    /// First vertex data section
    FirstVertexData = 5,
}

impl SectionKind {
    /// Number of sections a standard file carries.
    pub const COUNT: usize = 6;

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Section header (11 × u32 = 44 bytes each).
#[derive(Debug, Clone, Default)]
pub struct SectionHeader {
    /// Compression method id (0 = none); interpreted by the codec seam
    pub compression: u32,
    /// Offset to this section's data in the file
    pub offset_in_file: u32,
    /// Size of the on-disk (possibly compressed) data
    pub compressed_size: u32,
    /// Size after decompression
    pub uncompressed_size: u32,
    /// Data alignment
    pub alignment: u32,
    /// Codec stop point: end of 16-bit-swapped prefix
    pub first_16bit: u32,
    /// Codec stop point: end of 8-bit prefix
    pub first_8bit: u32,
    /// Offset to this section's relocation table in the file
    pub relocations_offset: u32,
    /// Number of relocation entries
    pub num_relocations: u32,
    /// Offset to this section's mixed-marshalling table in the file
    pub mixed_marshalling_offset: u32,
    /// Number of mixed-marshalling entries
    pub num_mixed_marshalling: u32,
}

impl SectionHeader {
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            compression: reader.read_u32::<LittleEndian>()?,
            offset_in_file: reader.read_u32::<LittleEndian>()?,
            compressed_size: reader.read_u32::<LittleEndian>()?,
            uncompressed_size: reader.read_u32::<LittleEndian>()?,
            alignment: reader.read_u32::<LittleEndian>()?,
            first_16bit: reader.read_u32::<LittleEndian>()?,
            first_8bit: reader.read_u32::<LittleEndian>()?,
            relocations_offset: reader.read_u32::<LittleEndian>()?,
            num_relocations: reader.read_u32::<LittleEndian>()?,
            mixed_marshalling_offset: reader.read_u32::<LittleEndian>()?,
            num_mixed_marshalling: reader.read_u32::<LittleEndian>()?,
        })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(self.compression)?;
        writer.write_u32::<LittleEndian>(self.offset_in_file)?;
        writer.write_u32::<LittleEndian>(self.compressed_size)?;
        writer.write_u32::<LittleEndian>(self.uncompressed_size)?;
        writer.write_u32::<LittleEndian>(self.alignment)?;
        writer.write_u32::<LittleEndian>(self.first_16bit)?;
        writer.write_u32::<LittleEndian>(self.first_8bit)?;
        writer.write_u32::<LittleEndian>(self.relocations_offset)?;
        writer.write_u32::<LittleEndian>(self.num_relocations)?;
        writer.write_u32::<LittleEndian>(self.mixed_marshalling_offset)?;
        writer.write_u32::<LittleEndian>(self.num_mixed_marshalling)?;
        Ok(())
    }

    /// Check if the section carries data.
    pub fn is_empty(&self) -> bool {
        self.uncompressed_size == 0
    }
}

/// Relocation entry (12 bytes): instructs the loader to resolve the
/// pointer-sized field at `offset_in_section` to the target's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Offset within the owning section of the pointer field
    pub offset_in_section: u32,
    /// Target of the pointer
    pub target: SectionRef,
}

impl Relocation {
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            offset_in_section: reader.read_u32::<LittleEndian>()?,
            target: SectionRef::read(reader)?,
        })
    }

    pub fn write<W: Write>(self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(self.offset_in_section)?;
        self.target.write(writer)
    }
}

/// Mixed-marshalling entry (16 bytes): `count` repetitions of the struct
/// type at `type_ref` live at `offset_in_section` and need byte-swapping
/// when the file and platform endianness differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MixedMarshallingEntry {
    /// Number of struct repetitions at the offset
    pub count: u32,
    /// Offset within the owning section of the data
    pub offset_in_section: u32,
    /// Reference to the struct definition describing the data
    pub type_ref: SectionRef,
}

impl MixedMarshallingEntry {
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            count: reader.read_u32::<LittleEndian>()?,
            offset_in_section: reader.read_u32::<LittleEndian>()?,
            type_ref: SectionRef::read(reader)?,
        })
    }

    pub fn write<W: Write>(self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(self.count)?;
        writer.write_u32::<LittleEndian>(self.offset_in_section)?;
        self.type_ref.write(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_signature_classification() {
        assert_eq!(classify_signature(&magic::LE32).unwrap(), FileFormat::Le32);
        assert_eq!(classify_signature(&magic::LE32_ALT).unwrap(), FileFormat::Le32);
        assert_eq!(classify_signature(&magic::BE32).unwrap(), FileFormat::Be32);
        assert_eq!(classify_signature(&magic::BE32_ALT).unwrap(), FileFormat::Be32);
        assert_eq!(classify_signature(&magic::LE64).unwrap(), FileFormat::Le64);
        assert_eq!(classify_signature(&magic::LE64_ALT).unwrap(), FileFormat::Le64);
        assert_eq!(classify_signature(&magic::BE64).unwrap(), FileFormat::Be64);
        assert_eq!(classify_signature(&magic::BE64_ALT).unwrap(), FileFormat::Be64);

        let junk = [0u8; 16];
        assert!(matches!(
            classify_signature(&junk),
            Err(Error::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_format_properties() {
        assert_eq!(FileFormat::Le32.pointer_size(), 4);
        assert_eq!(FileFormat::Le64.pointer_size(), 8);
        assert!(!FileFormat::Le64.is_big_endian());
        assert!(FileFormat::Be32.is_big_endian());
    }

    #[test]
    fn test_big_endian_rejected_before_header() {
        // Only the 16 signature bytes are present; if classification did not
        // fail first, the read would hit EOF instead.
        let mut cursor = Cursor::new(magic::BE64.to_vec());
        assert!(matches!(
            Gr2Magic::read(&mut cursor),
            Err(Error::BigEndianNotSupported)
        ));
    }

    #[test]
    fn test_compressed_header_rejected() {
        let mut bytes = magic::LE64.to_vec();
        bytes.extend_from_slice(&0x1F4u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes()); // header_format = 1
        bytes.extend_from_slice(&[0u8; 8]);
        let mut cursor = Cursor::new(bytes);
        assert!(matches!(
            Gr2Magic::read(&mut cursor),
            Err(Error::CompressedHeaderNotSupported { format: 1 })
        ));
    }

    #[test]
    fn test_header_size_by_version() {
        assert_eq!(Gr2Header::size_for_version(6), 0x38);
        assert_eq!(Gr2Header::size_for_version(7), 0x48);
    }

    #[test]
    fn test_header_roundtrip_v7() {
        let header = Gr2Header {
            version: 7,
            file_size: 4096,
            crc: 0xDEADBEEF,
            sections_offset: HEADER_SIZE_V7,
            num_sections: 6,
            root_type: SectionRef { section: 4, offset: 0x40 },
            root_node: SectionRef { section: 0, offset: 0 },
            tag: tags::DOS2_BG3,
            extra_tags: [0; 4],
            string_table_crc: 0,
        };

        let mut bytes = Vec::new();
        header.write(&mut bytes).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE_V7 as usize);

        let parsed = Gr2Header::read(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(parsed.version, 7);
        assert_eq!(parsed.crc, 0xDEADBEEF);
        assert_eq!(parsed.root_type, header.root_type);
        assert_eq!(parsed.tag, tags::DOS2_BG3);
    }

    #[test]
    fn test_root_section_out_of_range() {
        let header = Gr2Header {
            version: 6,
            file_size: 0,
            crc: 0,
            sections_offset: HEADER_SIZE_V6,
            num_sections: 2,
            root_type: SectionRef { section: 5, offset: 0 },
            root_node: SectionRef { section: 0, offset: 0 },
            tag: 0,
            extra_tags: [0; 4],
            string_table_crc: 0,
        };
        let mut bytes = Vec::new();
        header.write(&mut bytes).unwrap();
        assert!(matches!(
            Gr2Header::read(&mut Cursor::new(bytes)),
            Err(Error::RootSectionOutOfRange { section: 5, num_sections: 2 })
        ));
    }

    #[test]
    fn test_section_header_roundtrip() {
        let section = SectionHeader {
            compression: 4,
            offset_in_file: 0x200,
            compressed_size: 100,
            uncompressed_size: 300,
            alignment: 4,
            first_16bit: 20,
            first_8bit: 40,
            relocations_offset: 0x400,
            num_relocations: 3,
            mixed_marshalling_offset: 0,
            num_mixed_marshalling: 0,
        };
        let mut bytes = Vec::new();
        section.write(&mut bytes).unwrap();
        assert_eq!(bytes.len(), SECTION_HEADER_SIZE);

        let parsed = SectionHeader::read(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(parsed.compression, 4);
        assert_eq!(parsed.num_relocations, 3);
        assert_eq!(parsed.first_8bit, 40);
    }
}
