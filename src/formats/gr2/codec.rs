//! Section compression seam.
//!
//! The GR2 section codecs (Oodle0, Oodle1, `BitKnit`) are external
//! collaborators: the engine hands them an opaque buffer plus the section's
//! codec parameters and gets bytes back. Callers provide a [`SectionCodec`]
//! implementation for the methods their files use; the default [`NullCodec`]
//! handles only uncompressed sections.

use crate::error::{Error, Result};

/// Compression method ids as stored in the section header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CompressionMethod {
    /// No compression
    None = 0,
    /// Oodle0 compression (legacy)
    Oodle0 = 1,
    /// Oodle1 compression (legacy)
    Oodle1 = 2,
    /// `BitKnit` compression (modern, used in DOS2/BG3)
    BitKnit = 4,
}

impl CompressionMethod {
    /// Parse a raw method id; unknown ids are fatal.
    pub fn from_u32(value: u32, section: usize) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Oodle0),
            2 => Ok(Self::Oodle1),
            4 => Ok(Self::BitKnit),
            method => Err(Error::UnsupportedCompression { method, section }),
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Per-section codec parameters from the section header.
///
/// The Oodle codecs switch swap granularity at these stop points; `BitKnit`
/// ignores them.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodecParams {
    /// End of the 16-bit-swapped prefix
    pub first_16bit: u32,
    /// End of the 8-bit prefix
    pub first_8bit: u32,
}

/// Buffer transform capability for compressed sections.
pub trait SectionCodec {
    /// Decompress `input` into exactly `uncompressed_size` bytes.
    fn decompress(
        &self,
        method: CompressionMethod,
        params: CodecParams,
        input: &[u8],
        uncompressed_size: usize,
    ) -> Result<Vec<u8>>;

    /// Compress `input` with the given method and level.
    fn compress(&self, method: CompressionMethod, level: u32, input: &[u8]) -> Result<Vec<u8>>;
}

/// Codec that only passes uncompressed data through.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCodec;

impl SectionCodec for NullCodec {
    fn decompress(
        &self,
        method: CompressionMethod,
        _params: CodecParams,
        input: &[u8],
        uncompressed_size: usize,
    ) -> Result<Vec<u8>> {
        match method {
            CompressionMethod::None => {
                if input.len() != uncompressed_size {
                    return Err(Error::CodecFailed {
                        method: method.as_u32(),
                        message: format!(
                            "uncompressed section size mismatch: {} on disk, {uncompressed_size} declared",
                            input.len(),
                        ),
                    });
                }
                Ok(input.to_vec())
            }
            other => Err(Error::CodecFailed {
                method: other.as_u32(),
                message: "no codec installed for compressed sections".to_string(),
            }),
        }
    }

    fn compress(&self, method: CompressionMethod, _level: u32, input: &[u8]) -> Result<Vec<u8>> {
        match method {
            CompressionMethod::None => Ok(input.to_vec()),
            other => Err(Error::CodecFailed {
                method: other.as_u32(),
                message: "no codec installed for compressed sections".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parsing() {
        assert_eq!(CompressionMethod::from_u32(0, 0).unwrap(), CompressionMethod::None);
        assert_eq!(CompressionMethod::from_u32(4, 0).unwrap(), CompressionMethod::BitKnit);
        assert!(matches!(
            CompressionMethod::from_u32(3, 2),
            Err(Error::UnsupportedCompression { method: 3, section: 2 })
        ));
    }

    #[test]
    fn test_null_codec_passthrough() {
        let data = [1u8, 2, 3, 4];
        let out = NullCodec
            .decompress(CompressionMethod::None, CodecParams::default(), &data, 4)
            .unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_null_codec_rejects_compressed() {
        let err = NullCodec
            .decompress(CompressionMethod::BitKnit, CodecParams::default(), &[], 16)
            .unwrap_err();
        assert!(matches!(err, Error::CodecFailed { method: 4, .. }));
    }
}
