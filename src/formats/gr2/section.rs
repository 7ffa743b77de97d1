//! Section resolution: decompression, address-space unification, the
//! relocation side map and the mixed-marshalling byte-swap pass.
//!
//! All sections are decompressed through the codec seam and concatenated
//! into one logical buffer. Relocations are *not* patched into the buffer;
//! they populate a side map from patch-site address to target address that
//! [`read_pointer`](Unified::read_pointer) consults on every dereference.
//! The buffer itself stays immutable during traversal (the marshalling swap
//! is the one pass that mutates it, and it runs before traversal starts).

use std::collections::HashMap;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use half::f16;

use crate::error::{Error, Result};
use crate::formats::gr2::codec::{CodecParams, CompressionMethod, SectionCodec};
use crate::formats::gr2::format::{
    FileFormat, MixedMarshallingEntry, Relocation, SectionHeader,
    MIXED_MARSHALLING_SIZE, RELOCATION_SIZE,
};
use crate::formats::gr2::type_system::{MemberKind, StructDefinition, TypeCatalog};

/// A mixed-marshalling record with its addresses resolved into the unified
/// address space.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedMarshalling {
    /// Number of struct repetitions
    pub count: u32,
    /// Absolute address of the data
    pub data_addr: usize,
    /// Absolute address of the struct definition describing it
    pub type_addr: usize,
}

/// The unified, decompressed address space of one file.
pub struct Unified {
    data: Vec<u8>,
    bases: Vec<usize>,
    relocations: HashMap<usize, usize>,
    marshalling: Vec<ResolvedMarshalling>,
    format: FileFormat,
}

impl Unified {
    /// Decompress every section, concatenate them, and resolve relocation
    /// and mixed-marshalling tables.
    pub fn resolve(
        file_data: &[u8],
        sections: &[SectionHeader],
        format: FileFormat,
        codec: &dyn SectionCodec,
    ) -> Result<Self> {
        let total: usize = sections.iter().map(|s| s.uncompressed_size as usize).sum();
        let mut data = Vec::with_capacity(total);
        let mut bases = Vec::with_capacity(sections.len());

        for (index, section) in sections.iter().enumerate() {
            bases.push(data.len());
            if section.is_empty() {
                continue;
            }

            let method = CompressionMethod::from_u32(section.compression, index)?;
            let raw = file_slice(file_data, section.offset_in_file as usize, section.compressed_size as usize)?;
            let params = CodecParams {
                first_16bit: section.first_16bit,
                first_8bit: section.first_8bit,
            };
            let decompressed =
                codec.decompress(method, params, raw, section.uncompressed_size as usize)?;
            if decompressed.len() != section.uncompressed_size as usize {
                return Err(Error::SectionDataInvalid {
                    section: index,
                    message: format!(
                        "codec produced {} bytes, header declares {}",
                        decompressed.len(),
                        section.uncompressed_size
                    ),
                });
            }
            tracing::debug!(
                section = index,
                method = section.compression,
                size = decompressed.len(),
                "section decompressed"
            );
            data.extend_from_slice(&decompressed);
        }

        let mut unified = Self {
            data,
            bases,
            relocations: HashMap::new(),
            marshalling: Vec::new(),
            format,
        };
        unified.resolve_relocations(file_data, sections, codec)?;
        unified.resolve_marshalling(file_data, sections, codec)?;
        Ok(unified)
    }

    fn resolve_relocations(
        &mut self,
        file_data: &[u8],
        sections: &[SectionHeader],
        codec: &dyn SectionCodec,
    ) -> Result<()> {
        let ps = self.format.pointer_size();

        for (index, section) in sections.iter().enumerate() {
            if section.num_relocations == 0 {
                continue;
            }

            let table = read_side_table(
                file_data,
                section,
                index,
                section.relocations_offset as usize,
                section.num_relocations as usize * RELOCATION_SIZE,
                codec,
            )?;
            let mut cursor = Cursor::new(table.as_slice());

            for _ in 0..section.num_relocations {
                let relocation = Relocation::read(&mut cursor)?;
                let target = relocation.target;
                if target.section as usize >= sections.len() {
                    return Err(Error::RelocationTargetInvalid {
                        section: index,
                        target: target.section,
                    });
                }

                let site_end = relocation.offset_in_section as usize + ps;
                if site_end > sections[index].uncompressed_size as usize {
                    return Err(Error::SectionDataInvalid {
                        section: index,
                        message: format!(
                            "relocation site 0x{:x} outside section bounds",
                            relocation.offset_in_section
                        ),
                    });
                }

                let site = self.bases[index] + relocation.offset_in_section as usize;
                let addr = self.bases[target.section as usize] + target.offset as usize;
                if addr > self.data.len() {
                    return Err(Error::PointerOutOfBounds {
                        offset: site,
                        target: addr,
                        len: self.data.len(),
                    });
                }
                self.relocations.insert(site, addr);
            }
            tracing::debug!(section = index, count = section.num_relocations, "relocations resolved");
        }
        Ok(())
    }

    fn resolve_marshalling(
        &mut self,
        file_data: &[u8],
        sections: &[SectionHeader],
        codec: &dyn SectionCodec,
    ) -> Result<()> {
        for (index, section) in sections.iter().enumerate() {
            if section.num_mixed_marshalling == 0 {
                continue;
            }

            let table = read_side_table(
                file_data,
                section,
                index,
                section.mixed_marshalling_offset as usize,
                section.num_mixed_marshalling as usize * MIXED_MARSHALLING_SIZE,
                codec,
            )?;
            let mut cursor = Cursor::new(table.as_slice());

            for _ in 0..section.num_mixed_marshalling {
                let entry = MixedMarshallingEntry::read(&mut cursor)?;
                if entry.type_ref.section as usize >= sections.len() {
                    return Err(Error::RelocationTargetInvalid {
                        section: index,
                        target: entry.type_ref.section,
                    });
                }
                self.marshalling.push(ResolvedMarshalling {
                    count: entry.count,
                    data_addr: self.bases[index] + entry.offset_in_section as usize,
                    type_addr: self.bases[entry.type_ref.section as usize]
                        + entry.type_ref.offset as usize,
                });
            }
        }
        Ok(())
    }

    /// Length of the unified buffer.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Base address of a section in the unified space.
    pub fn section_base(&self, section: usize) -> Option<usize> {
        self.bases.get(section).copied()
    }

    /// Pointer width of the file this buffer came from.
    pub fn format(&self) -> FileFormat {
        self.format
    }

    /// Resolved mixed-marshalling records.
    pub fn marshalling(&self) -> &[ResolvedMarshalling] {
        &self.marshalling
    }

    fn check(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.data
            .get(offset..offset + len)
            .ok_or(Error::UnexpectedEof { offset })
    }

    pub fn read_u8(&self, offset: usize) -> Result<u8> {
        Ok(self.check(offset, 1)?[0])
    }

    pub fn read_i8(&self, offset: usize) -> Result<i8> {
        Ok(self.read_u8(offset)? as i8)
    }

    pub fn read_u16(&self, offset: usize) -> Result<u16> {
        let b = self.check(offset, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_i16(&self, offset: usize) -> Result<i16> {
        Ok(self.read_u16(offset)? as i16)
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        let b = self.check(offset, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&self, offset: usize) -> Result<i32> {
        Ok(self.read_u32(offset)? as i32)
    }

    pub fn read_f32(&self, offset: usize) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32(offset)?))
    }

    pub fn read_f16(&self, offset: usize) -> Result<f16> {
        Ok(f16::from_bits(self.read_u16(offset)?))
    }

    /// Raw pointer-width little-endian value, uninterpreted.
    pub fn read_raw_pointer(&self, offset: usize) -> Result<u64> {
        if self.format.pointer_size() == 4 {
            return Ok(u64::from(self.read_u32(offset)?));
        }
        let lo = u64::from(self.read_u32(offset)?);
        let hi = u64::from(self.read_u32(offset + 4)?);
        Ok(lo | (hi << 32))
    }

    /// Dereference the pointer field at `offset` through the side map.
    ///
    /// `None` means a null pointer. A non-zero raw value without a
    /// relocation entry is corrupt input.
    pub fn read_pointer(&self, offset: usize) -> Result<Option<usize>> {
        if let Some(&target) = self.relocations.get(&offset) {
            if target > self.data.len() {
                return Err(Error::PointerOutOfBounds {
                    offset,
                    target,
                    len: self.data.len(),
                });
            }
            return Ok(Some(target));
        }
        if self.read_raw_pointer(offset)? != 0 {
            return Err(Error::UnrelocatedPointer { offset });
        }
        Ok(None)
    }

    /// Read the null-terminated UTF-8 string at `offset`.
    pub fn read_cstring(&self, offset: usize) -> Result<String> {
        let mut end = offset;
        while self.read_u8(end)? != 0 {
            end += 1;
        }
        Ok(String::from_utf8(self.data[offset..end].to_vec())?)
    }

    fn swap(&mut self, offset: usize, width: usize) -> Result<()> {
        self.check(offset, width)?;
        self.data[offset..offset + width].reverse();
        Ok(())
    }

    /// Byte-swap every multi-byte scalar covered by the file's
    /// mixed-marshalling tables. Runs after relocation resolution and
    /// before any graph traversal; the one pass that mutates the buffer.
    pub fn apply_mixed_marshalling(&mut self, catalog: &mut TypeCatalog) -> Result<()> {
        if self.marshalling.is_empty() {
            return Ok(());
        }

        let format = self.format;
        let mut spans = Vec::new();
        for entry in self.marshalling.clone() {
            let def = catalog.load(self, entry.type_addr, format)?;
            let stride = catalog.struct_size(self, &def, format)?;
            for i in 0..entry.count as usize {
                collect_swap_spans(self, catalog, &def, entry.data_addr + i * stride, format, &mut spans)?;
            }
        }

        tracing::debug!(spans = spans.len(), "applying mixed-marshalling byte swaps");
        for (offset, width) in spans {
            self.swap(offset, width)?;
        }
        Ok(())
    }
}

/// Record the (offset, width) of every scalar wider than one byte in one
/// struct instance, recursing into inline members with their repeat count.
fn collect_swap_spans(
    buf: &Unified,
    catalog: &mut TypeCatalog,
    def: &StructDefinition,
    at: usize,
    format: FileFormat,
    spans: &mut Vec<(usize, usize)>,
) -> Result<()> {
    let mut pos = at;
    for member in &def.members {
        let size = catalog.member_size(buf, member, format)?;
        match member.kind {
            MemberKind::Inline => {
                if let Some(nested) = catalog.resolve(buf, &member.definition, format)? {
                    let stride = catalog.struct_size(buf, &nested, format)?;
                    for i in 0..member.repeat() {
                        collect_swap_spans(buf, catalog, &nested, pos + i * stride, format, spans)?;
                    }
                }
            }
            MemberKind::Transform => {
                for i in 0..member.repeat() * 17 {
                    spans.push((pos + i * 4, 4));
                }
            }
            kind if kind.is_scalar() => {
                let width = kind.scalar_width();
                if width > 1 {
                    for i in 0..member.repeat() {
                        spans.push((pos + i * width, width));
                    }
                }
            }
            // Pointer-like members are resolved through the side map and
            // never read from the buffer bytes directly.
            _ => {}
        }
        pos += size;
    }
    Ok(())
}

/// Read a section's relocation or marshalling table from the file. For
/// compressed sections the table is stored separately compressed, prefixed
/// with a u32 on-disk size.
fn read_side_table(
    file_data: &[u8],
    section: &SectionHeader,
    index: usize,
    offset: usize,
    uncompressed_size: usize,
    codec: &dyn SectionCodec,
) -> Result<Vec<u8>> {
    let method = CompressionMethod::from_u32(section.compression, index)?;
    if method == CompressionMethod::None {
        return Ok(file_slice(file_data, offset, uncompressed_size)?.to_vec());
    }

    let mut cursor = Cursor::new(file_slice(file_data, offset, 4)?);
    let compressed_size = cursor.read_u32::<LittleEndian>()? as usize;
    let compressed = file_slice(file_data, offset + 4, compressed_size)?;
    codec.decompress(method, CodecParams::default(), compressed, uncompressed_size)
}

fn file_slice(file_data: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    file_data
        .get(offset..offset + len)
        .ok_or(Error::UnexpectedEof { offset })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::gr2::codec::NullCodec;

    fn section(uncompressed: &[u8], offset_in_file: u32) -> SectionHeader {
        SectionHeader {
            compression: 0,
            offset_in_file,
            compressed_size: uncompressed.len() as u32,
            uncompressed_size: uncompressed.len() as u32,
            alignment: 4,
            ..SectionHeader::default()
        }
    }

    #[test]
    fn test_sections_concatenate() {
        let mut file = vec![0u8; 8];
        file.extend_from_slice(&[1, 2, 3, 4]);
        file.extend_from_slice(&[5, 6]);

        let sections = vec![section(&[1, 2, 3, 4], 8), section(&[5, 6], 12)];
        let unified = Unified::resolve(&file, &sections, FileFormat::Le32, &NullCodec).unwrap();

        assert_eq!(unified.len(), 6);
        assert_eq!(unified.section_base(0), Some(0));
        assert_eq!(unified.section_base(1), Some(4));
        assert_eq!(unified.read_u8(4).unwrap(), 5);
    }

    #[test]
    fn test_relocation_side_map() {
        // Section 0: one 4-byte pointer field (raw zero). Section 1: data.
        // The relocation points the field at section 1 offset 2.
        let mut file = vec![0u8; 16];
        file.extend_from_slice(&[0, 0, 0, 0]); // section 0 @16
        file.extend_from_slice(&[9, 9, 9, 9]); // section 1 @20
        let reloc_offset = file.len() as u32;
        file.extend_from_slice(&0u32.to_le_bytes()); // offset_in_section
        file.extend_from_slice(&1u32.to_le_bytes()); // target section
        file.extend_from_slice(&2u32.to_le_bytes()); // target offset

        let mut s0 = section(&[0, 0, 0, 0], 16);
        s0.relocations_offset = reloc_offset;
        s0.num_relocations = 1;
        let s1 = section(&[9, 9, 9, 9], 20);

        let unified = Unified::resolve(&file, &[s0, s1], FileFormat::Le32, &NullCodec).unwrap();
        assert_eq!(unified.read_pointer(0).unwrap(), Some(6));
    }

    #[test]
    fn test_null_and_unrelocated_pointers() {
        let file = [0u8, 0, 0, 0, 0xEF, 0xBE, 0xAD, 0xDE];
        let sections = vec![section(&file, 0)];
        let unified = Unified::resolve(&file, &sections, FileFormat::Le32, &NullCodec).unwrap();

        assert_eq!(unified.read_pointer(0).unwrap(), None);
        assert!(matches!(
            unified.read_pointer(4),
            Err(Error::UnrelocatedPointer { offset: 4 })
        ));
    }

    #[test]
    fn test_relocation_to_bad_section() {
        let mut file = vec![0u8; 4];
        let reloc_offset = file.len() as u32;
        file.extend_from_slice(&0u32.to_le_bytes());
        file.extend_from_slice(&7u32.to_le_bytes());
        file.extend_from_slice(&0u32.to_le_bytes());

        let mut s0 = section(&[0, 0, 0, 0], 0);
        s0.relocations_offset = reloc_offset;
        s0.num_relocations = 1;

        assert!(matches!(
            Unified::resolve(&file, &[s0], FileFormat::Le32, &NullCodec),
            Err(Error::RelocationTargetInvalid { section: 0, target: 7 })
        ));
    }

    #[test]
    fn test_read_cstring() {
        let bytes = b"Bones\0rest\0";
        let sections = vec![section(bytes, 0)];
        let unified = Unified::resolve(bytes, &sections, FileFormat::Le32, &NullCodec).unwrap();
        assert_eq!(unified.read_cstring(0).unwrap(), "Bones");
        assert_eq!(unified.read_cstring(6).unwrap(), "rest".to_string());
    }

    #[test]
    fn test_read_cstring_without_terminator() {
        let bytes = b"Bones\0rest";
        let sections = vec![section(bytes, 0)];
        let unified = Unified::resolve(bytes, &sections, FileFormat::Le32, &NullCodec).unwrap();
        // The string runs off the end of the buffer before a NUL shows up.
        assert!(matches!(
            unified.read_cstring(6),
            Err(Error::UnexpectedEof { offset: 10 })
        ));
    }

    #[test]
    fn test_mixed_marshalling_swap() {
        use crate::formats::gr2::type_system::{MemberDefinition, StructDefinition};

        // Build a unified buffer by hand: a {u16, u8, u32} struct stored
        // big-endian, preceded by nothing. The catalog is primed directly.
        let bytes = [0x12u8, 0x34, 0xAB, 0xDE, 0xAD, 0xBE, 0xEF];
        let sections = vec![section(&bytes, 0)];
        let mut unified = Unified::resolve(&bytes, &sections, FileFormat::Le32, &NullCodec).unwrap();
        unified.marshalling.push(ResolvedMarshalling {
            count: 1,
            data_addr: 0,
            type_addr: 0x1000,
        });

        let def = StructDefinition::new(vec![
            MemberDefinition::new("A", MemberKind::UInt16),
            MemberDefinition::new("B", MemberKind::UInt8),
            MemberDefinition::new("C", MemberKind::UInt32),
        ]);
        let mut catalog = TypeCatalog::new();
        catalog.prime(0x1000, def);

        unified.apply_mixed_marshalling(&mut catalog).unwrap();
        assert_eq!(unified.read_u16(0).unwrap(), 0x1234);
        assert_eq!(unified.read_u8(2).unwrap(), 0xAB);
        assert_eq!(unified.read_u32(3).unwrap(), 0xDEADBEEF);
    }
}
