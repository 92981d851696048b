//! DVB SI section decoding for the EIT reconciliation engine.
//!
//! This crate turns raw EIT (table ids 0x4E..0x6F) and TDT (0x70) sections
//! into owned records. It does not keep any state: the engine in
//! `eit-engine` decides what to do with the records.
//!
//! # Example
//!
//! ```rust
//! use eit_protocol::{decode_eit_section, encode_eit_section, EitSection, table_id};
//!
//! let section = EitSection {
//!     table_id: table_id::PRESENT_FOLLOWING,
//!     service_id: 0x6D66,
//!     ..Default::default()
//! };
//! let encoded = encode_eit_section(&section).unwrap();
//! assert_eq!(decode_eit_section(&encoded).unwrap(), section);
//! ```

pub mod codec;
pub mod descriptors;
pub mod error;
pub mod psi;
pub mod text;
pub mod types;

pub use codec::{
    decode_eit_section, decode_tdt_section, encode_eit_section, encode_tdt_section,
    MAX_EIT_SECTION_LENGTH,
};
pub use descriptors::{encode_descriptor, parse_descriptor, parse_descriptor_loop};
pub use error::{DescriptorError, SectionError};
pub use psi::{crc32_mpeg2, PsiHeader, PsiSection, SectionCollector};
pub use text::{decode_dvb_string, decode_language_code, encode_dvb_string};
pub use types::{
    descriptor_tag, pid, table_id, ComponentDescriptor, ContentDescriptor, ContentNibble,
    Descriptor, EitEvent, EitSection, ExtendedEventDescriptor, ExtendedEventItem,
    LinkageDescriptor, ParentalRating, ParentalRatingDescriptor, PdcDescriptor, RunningStatus,
    ShortEventDescriptor, TimeShiftedEventDescriptor, LINKAGE_TYPE_PREMIERE, NVOD_START_TIME,
};
