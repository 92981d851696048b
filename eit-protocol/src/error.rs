//! Error types for SI section decoding.

use thiserror::Error;

/// Errors raised while decoding a raw SI section.
///
/// Any of these rejects the whole section before the engine touches state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SectionError {
    /// Not enough bytes for the structure being decoded.
    #[error("Section too short: need {needed} bytes, got {actual}")]
    TooShort { needed: usize, actual: usize },

    /// Section length field is smaller than the fixed header.
    #[error("Invalid section length: {0}")]
    InvalidLength(u16),

    /// CRC32 over the section does not match the transmitted value.
    #[error("CRC mismatch: expected 0x{expected:08X}, calculated 0x{calculated:08X}")]
    CrcMismatch { expected: u32, calculated: u32 },

    /// Table id does not belong to the table being decoded.
    #[error("Unexpected table id: 0x{0:02X}")]
    UnexpectedTableId(u8),

    /// Long section expected but syntax indicator is cleared.
    #[error("Section syntax indicator not set")]
    NotLongSection,

    /// Event loop entry runs past the end of the section.
    #[error("Truncated event loop at offset {0}")]
    TruncatedEvent(usize),

    /// Section would exceed the 12-bit length field.
    #[error("Section too large to encode: {0} bytes")]
    TooLarge(usize),
}

/// Errors raised while decoding a single descriptor.
///
/// These never abort a section: the offending descriptor is skipped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    /// Descriptor body shorter than its fixed fields.
    #[error("Descriptor 0x{tag:02X} too short: {len} bytes")]
    TooShort { tag: u8, len: usize },

    /// Inner length field points past the descriptor body.
    #[error("Descriptor 0x{tag:02X} has inconsistent inner length")]
    InnerLength { tag: u8 },
}
