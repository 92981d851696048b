//! Decoded EIT/TDT record types.

use serde::{Deserialize, Serialize};

/// Start time value of an NVOD reference event (all start bits set).
pub const NVOD_START_TIME: i64 = -1;

/// Well-known PIDs carrying SI tables.
pub mod pid {
    /// Event Information Table PID.
    pub const EIT: u16 = 0x0012;
    /// Time and Date Table PID.
    pub const TDT: u16 = 0x0014;
    /// Null packet PID (stuffing).
    pub const NULL: u16 = 0x1FFF;
}

/// Table IDs used on the EIT and TDT PIDs.
pub mod table_id {
    /// Event information, present/following, actual transport stream.
    pub const PRESENT_FOLLOWING: u8 = 0x4E;
    /// Event information, present/following, other transport stream.
    pub const PRESENT_FOLLOWING_OTHER: u8 = 0x4F;
    /// First schedule table, actual transport stream.
    pub const SCHEDULE_ACTUAL_FIRST: u8 = 0x50;
    /// Last schedule table, actual transport stream.
    pub const SCHEDULE_ACTUAL_LAST: u8 = 0x5F;
    /// First schedule table, other transport stream.
    pub const SCHEDULE_OTHER_FIRST: u8 = 0x60;
    /// Last schedule table, other transport stream.
    pub const SCHEDULE_OTHER_LAST: u8 = 0x6F;
    /// Time and Date Section.
    pub const TDT: u8 = 0x70;

    /// True for 0x50..=0x5F.
    pub fn is_schedule_actual(table_id: u8) -> bool {
        table_id & 0xF0 == 0x50
    }

    /// True for 0x60..=0x6F.
    pub fn is_schedule_other(table_id: u8) -> bool {
        table_id & 0xF0 == 0x60
    }

    /// True for every table id the reconciler accepts.
    pub fn is_reconciled(table_id: u8) -> bool {
        table_id == PRESENT_FOLLOWING || (SCHEDULE_ACTUAL_FIRST..=SCHEDULE_OTHER_LAST).contains(&table_id)
    }
}

/// Descriptor tags consumed from the EIT event loop.
pub mod descriptor_tag {
    /// Linkage descriptor.
    pub const LINKAGE: u8 = 0x4A;
    /// Short event descriptor.
    pub const SHORT_EVENT: u8 = 0x4D;
    /// Extended event descriptor.
    pub const EXTENDED_EVENT: u8 = 0x4E;
    /// Time shifted event descriptor.
    pub const TIME_SHIFTED_EVENT: u8 = 0x4F;
    /// Component descriptor.
    pub const COMPONENT: u8 = 0x50;
    /// Content descriptor.
    pub const CONTENT: u8 = 0x54;
    /// Parental rating descriptor.
    pub const PARENTAL_RATING: u8 = 0x55;
    /// PDC descriptor.
    pub const PDC: u8 = 0x69;
}

/// Linkage type used by Premiere for portal/sub-channel pointers.
pub const LINKAGE_TYPE_PREMIERE: u8 = 0xB0;

/// Running status of an event (3-bit field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum RunningStatus {
    #[default]
    Undefined = 0,
    NotRunning = 1,
    StartsInAFewSeconds = 2,
    Pausing = 3,
    Running = 4,
    ServiceOffAir = 5,
}

impl RunningStatus {
    /// Convert the raw 3-bit value. Reserved values map to `Undefined`.
    pub fn from_raw(value: u8) -> Self {
        match value & 0x07 {
            1 => RunningStatus::NotRunning,
            2 => RunningStatus::StartsInAFewSeconds,
            3 => RunningStatus::Pausing,
            4 => RunningStatus::Running,
            5 => RunningStatus::ServiceOffAir,
            _ => RunningStatus::Undefined,
        }
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            RunningStatus::Undefined => "Undefined",
            RunningStatus::NotRunning => "Not running",
            RunningStatus::StartsInAFewSeconds => "Starts in a few seconds",
            RunningStatus::Pausing => "Pausing",
            RunningStatus::Running => "Running",
            RunningStatus::ServiceOffAir => "Service off-air",
        }
    }
}

/// One decoded EIT section.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EitSection {
    /// Table ID (0x4E..0x6F).
    pub table_id: u8,
    /// Service ID (table id extension).
    pub service_id: u16,
    /// Version number (5 bits).
    pub version_number: u8,
    /// Section number.
    pub section_number: u8,
    /// Last section number.
    pub last_section_number: u8,
    /// Transport stream ID.
    pub transport_stream_id: u16,
    /// Original network ID.
    pub original_network_id: u16,
    /// Last section number of the segment this section belongs to.
    pub segment_last_section_number: u8,
    /// Last table ID used for this service.
    pub last_table_id: u8,
    /// Event loop.
    pub events: Vec<EitEvent>,
}

/// One entry of the EIT event loop.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EitEvent {
    /// Event ID.
    pub event_id: u16,
    /// Start time in UNIX seconds (UTC), `NVOD_START_TIME` for NVOD references.
    pub start_time: i64,
    /// Duration in seconds.
    pub duration: i64,
    /// Running status.
    pub running_status: RunningStatus,
    /// Free CA mode.
    pub free_ca_mode: bool,
    /// Decoded descriptors, in transmission order.
    pub descriptors: Vec<Descriptor>,
}

impl EitEvent {
    /// Whether this is an NVOD reference event.
    pub fn is_nvod_reference(&self) -> bool {
        self.start_time < 0
    }
}

/// A decoded descriptor from the event loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Descriptor {
    ShortEvent(ShortEventDescriptor),
    ExtendedEvent(ExtendedEventDescriptor),
    Content(ContentDescriptor),
    ParentalRating(ParentalRatingDescriptor),
    Pdc(PdcDescriptor),
    TimeShiftedEvent(TimeShiftedEventDescriptor),
    Linkage(LinkageDescriptor),
    Component(ComponentDescriptor),
    /// Anything not consumed by the engine, or malformed.
    Unknown { tag: u8, data: Vec<u8> },
}

impl Descriptor {
    /// Descriptor tag this record was decoded from.
    pub fn tag(&self) -> u8 {
        match self {
            Descriptor::ShortEvent(_) => descriptor_tag::SHORT_EVENT,
            Descriptor::ExtendedEvent(_) => descriptor_tag::EXTENDED_EVENT,
            Descriptor::Content(_) => descriptor_tag::CONTENT,
            Descriptor::ParentalRating(_) => descriptor_tag::PARENTAL_RATING,
            Descriptor::Pdc(_) => descriptor_tag::PDC,
            Descriptor::TimeShiftedEvent(_) => descriptor_tag::TIME_SHIFTED_EVENT,
            Descriptor::Linkage(_) => descriptor_tag::LINKAGE,
            Descriptor::Component(_) => descriptor_tag::COMPONENT,
            Descriptor::Unknown { tag, .. } => *tag,
        }
    }
}

/// Short event descriptor (0x4D).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShortEventDescriptor {
    /// ISO 639-2 language code.
    pub language: String,
    /// Event name.
    pub name: String,
    /// Short text.
    pub text: String,
}

/// Item of an extended event descriptor.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExtendedEventItem {
    pub description: String,
    pub item: String,
}

/// Extended event descriptor (0x4E), one fragment of a multi-part text.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExtendedEventDescriptor {
    /// Fragment index (4 bits).
    pub descriptor_number: u8,
    /// Index of the last fragment (4 bits).
    pub last_descriptor_number: u8,
    /// ISO 639-2 language code.
    pub language: String,
    /// Item loop.
    pub items: Vec<ExtendedEventItem>,
    /// Free text.
    pub text: String,
}

/// Content nibble pair from a content descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContentNibble {
    pub level1: u8,
    pub level2: u8,
    pub user_byte: u8,
}

/// Content descriptor (0x54).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContentDescriptor {
    pub nibbles: Vec<ContentNibble>,
}

/// Single rating of a parental rating descriptor.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParentalRating {
    /// ISO 3166 country code, compared as a language code.
    pub language: String,
    /// Raw rating byte.
    pub rating: u8,
}

/// Parental rating descriptor (0x55).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParentalRatingDescriptor {
    pub ratings: Vec<ParentalRating>,
}

/// PDC descriptor (0x69), the programme identification label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PdcDescriptor {
    pub day: u8,
    pub month: u8,
    pub hour: u8,
    pub minute: u8,
}

/// Time shifted event descriptor (0x4F).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeShiftedEventDescriptor {
    pub reference_service_id: u16,
    pub reference_event_id: u16,
}

/// Linkage descriptor (0x4A).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LinkageDescriptor {
    pub transport_stream_id: u16,
    pub original_network_id: u16,
    pub service_id: u16,
    pub linkage_type: u8,
    /// Private data bytes following the fixed fields.
    pub private_data: Vec<u8>,
}

/// Component descriptor (0x50).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ComponentDescriptor {
    /// Stream content extension (upper 4 bits).
    pub stream_content_ext: u8,
    /// Stream content (lower 4 bits).
    pub stream_content: u8,
    pub component_type: u8,
    pub component_tag: u8,
    /// ISO 639-2 language code.
    pub language: String,
    pub description: String,
}
