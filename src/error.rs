//! Error types for `granary`

use thiserror::Error;

/// The error type for `granary` operations.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    // ==================== IO Errors ====================
    /// IO error from file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected end of file.
    #[error("unexpected end of file at offset 0x{offset:x}")]
    UnexpectedEof {
        /// Absolute byte offset where more data was expected.
        offset: usize,
    },

    // ==================== Format Errors ====================
    /// The 16-byte signature does not match any known GR2 format.
    #[error("invalid GR2 magic signature: {0:02x?}")]
    InvalidSignature([u8; 16]),

    /// The file version is not supported.
    #[error("unsupported GR2 version: {version} (supported: 6, 7)")]
    UnsupportedVersion {
        /// The version number found in the file.
        version: u32,
    },

    /// A reserved header field holds a non-zero value.
    #[error("reserved header field at offset 0x{offset:x} is non-zero: 0x{value:x}")]
    ReservedFieldNotZero {
        /// Absolute byte offset of the field.
        offset: usize,
        /// The value found.
        value: u32,
    },

    /// The payload CRC32 does not match the header.
    #[error("payload CRC mismatch: header says 0x{expected:08x}, computed 0x{actual:08x}")]
    CrcMismatch {
        /// CRC stored in the header.
        expected: u32,
        /// CRC computed over the payload.
        actual: u32,
    },

    /// A header root reference names a section outside the section table.
    #[error("root reference targets section {section}, but file has {num_sections} sections")]
    RootSectionOutOfRange {
        /// The section index in the root reference.
        section: u32,
        /// Number of sections in the file.
        num_sections: u32,
    },

    /// A relocation or reference targets a section outside the section table.
    #[error("relocation in section {section} targets invalid section {target}")]
    RelocationTargetInvalid {
        /// The section owning the relocation.
        section: usize,
        /// The invalid target section index.
        target: u32,
    },

    /// A pointer resolved outside the unified address space.
    #[error("pointer at offset 0x{offset:x} targets 0x{target:x}, beyond buffer end 0x{len:x}")]
    PointerOutOfBounds {
        /// Absolute offset of the pointer field.
        offset: usize,
        /// The resolved target address.
        target: usize,
        /// Length of the unified buffer.
        len: usize,
    },

    /// A non-zero pointer field has no relocation entry covering it.
    #[error("unrelocated non-zero pointer at offset 0x{offset:x}")]
    UnrelocatedPointer {
        /// Absolute offset of the pointer field.
        offset: usize,
    },

    /// Pointer chains exceeded the traversal depth limit. The format is
    /// supposed to be acyclic; this trips instead of overflowing the stack.
    #[error("recursion limit exceeded at offset 0x{offset:x} (depth {depth})")]
    RecursionLimitExceeded {
        /// Offset of the struct that tripped the limit.
        offset: usize,
        /// The depth limit.
        depth: usize,
    },

    /// A truncated or malformed section body.
    #[error("section {section} data invalid: {message}")]
    SectionDataInvalid {
        /// Section index.
        section: usize,
        /// Description of the problem.
        message: String,
    },

    // ==================== Unsupported Feature Errors ====================
    /// Big-endian files are classified but not decoded.
    #[error("big-endian GR2 files are not supported")]
    BigEndianNotSupported,

    /// Compressed headers (`header_format` != 0) are not supported.
    #[error("compressed GR2 header (format {format}) is not supported")]
    CompressedHeaderNotSupported {
        /// The `header_format` value found.
        format: u32,
    },

    /// A member definition used a type tag beyond the defined range.
    #[error("unknown member type {tag} at offset 0x{offset:x}")]
    UnknownMemberType {
        /// The raw type tag.
        tag: u32,
        /// Absolute offset of the member definition.
        offset: usize,
    },

    /// Unknown or unhandled section compression method.
    #[error("unsupported compression method {method} in section {section}")]
    UnsupportedCompression {
        /// The raw compression method id.
        method: u32,
        /// Section index.
        section: usize,
    },

    /// The installed codec failed to transform a buffer.
    #[error("codec failure (method {method}): {message}")]
    CodecFailed {
        /// The compression method id.
        method: u32,
        /// Codec-reported message.
        message: String,
    },

    // ==================== Writer Errors ====================
    /// A value did not match the member definition it was written through.
    #[error("value for member '{member}' does not match its definition: {message}")]
    ValueMismatch {
        /// The member name.
        member: String,
        /// Description of the mismatch.
        message: String,
    },

    /// A custom serializer was requested but none is registered.
    #[error("no serializer registered for member '{member}'")]
    SerializerMissing {
        /// The member name.
        member: String,
    },

    // ==================== Parsing Errors ====================
    /// UTF-8 conversion error.
    #[error("UTF-8 conversion error: {0}")]
    Utf8Error(#[from] std::string::FromUtf8Error),
}

/// A specialized Result type for `granary` operations.
pub type Result<T> = std::result::Result<T, Error>;
