//! Folding an event's descriptor list into event attributes.

use chrono::{DateTime, Datelike, TimeZone};
use eit_protocol::{
    ComponentDescriptor, Descriptor, ExtendedEventDescriptor, LinkageDescriptor, PdcDescriptor,
    ShortEventDescriptor, TimeShiftedEventDescriptor, LINKAGE_TYPE_PREMIERE,
};

use super::i18n::{is_preferred_language, normalize_language_code};
use crate::store::schedules::MAX_EVENT_CONTENTS;
use crate::store::Component;

/// Fragments of one multi-part extended event text.
#[derive(Debug, Clone, Default)]
pub struct ExtendedEventText {
    parts: Vec<Option<ExtendedEventDescriptor>>,
}

impl ExtendedEventText {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a fragment in its slot. Returns false if its number is out of range.
    pub fn add(&mut self, descriptor: ExtendedEventDescriptor) -> bool {
        if self.parts.is_empty() {
            self.parts.resize(descriptor.last_descriptor_number as usize + 1, None);
        }
        let n = descriptor.descriptor_number as usize;
        match self.parts.get_mut(n) {
            Some(slot) => {
                *slot = Some(descriptor);
                true
            }
            None => false,
        }
    }

    /// All items as `description: item` lines followed by the free text.
    pub fn text(&self) -> String {
        let parts = self.parts.iter().flatten();
        let mut out = String::new();
        for item in parts.clone().flat_map(|d| d.items.iter()) {
            out.push_str(&item.description);
            out.push_str(": ");
            out.push_str(&item.item);
            out.push('\n');
        }
        for d in parts {
            out.push_str(&d.text);
        }
        out
    }
}

/// Attributes collected from one event's descriptor loop.
#[derive(Debug, Clone, Default)]
pub struct EventDescriptors {
    pub short_event: Option<ShortEventDescriptor>,
    pub extended: Option<ExtendedEventText>,
    pub contents: Option<Vec<u8>>,
    pub parental_rating: Option<u8>,
    pub vps: Option<i64>,
    pub time_shifted: Option<TimeShiftedEventDescriptor>,
    /// Premiere linkages, in transmission order.
    pub premiere_links: Vec<LinkageDescriptor>,
    pub components: Option<Vec<Component>>,
}

impl EventDescriptors {
    /// Consume a descriptor list.
    ///
    /// `now` supplies the year and time zone for PDC labels.
    pub fn collect<Tz: TimeZone>(descriptors: Vec<Descriptor>, languages: &[String], now: &DateTime<Tz>) -> Self {
        let mut out = Self::default();
        let mut short_level = None;
        let mut ext_level = None;
        let mut use_extended = false;

        for descriptor in descriptors {
            match descriptor {
                Descriptor::ExtendedEvent(eed) => {
                    if is_preferred_language(languages, &eed.language, &mut ext_level) || out.extended.is_none() {
                        out.extended = Some(ExtendedEventText::new());
                        use_extended = true;
                    }
                    let last = eed.descriptor_number == eed.last_descriptor_number;
                    if use_extended {
                        if let Some(text) = out.extended.as_mut() {
                            text.add(eed);
                        }
                    }
                    if last {
                        use_extended = false;
                    }
                }
                Descriptor::ShortEvent(sed) => {
                    if is_preferred_language(languages, &sed.language, &mut short_level) || out.short_event.is_none() {
                        out.short_event = Some(sed);
                    }
                }
                Descriptor::Content(cd) => {
                    out.contents = Some(
                        cd.nibbles
                            .iter()
                            .take(MAX_EVENT_CONTENTS)
                            .map(|n| ((n.level1 & 0x0F) << 4) | (n.level2 & 0x0F))
                            .collect(),
                    );
                }
                Descriptor::ParentalRating(prd) => {
                    let mut level = None;
                    for rating in &prd.ratings {
                        if is_preferred_language(languages, &rating.language, &mut level) {
                            out.parental_rating = Some(parental_rating_age(rating.rating));
                        }
                    }
                }
                Descriptor::Pdc(pd) => {
                    if let Some(vps) = pdc_time(&pd, now) {
                        out.vps = Some(vps);
                    }
                }
                Descriptor::TimeShiftedEvent(tsed) => {
                    out.time_shifted = Some(tsed);
                }
                Descriptor::Linkage(ld) => {
                    if ld.linkage_type == LINKAGE_TYPE_PREMIERE {
                        out.premiere_links.push(ld);
                    }
                }
                Descriptor::Component(cd) => {
                    if let Some(c) = component(&cd) {
                        out.components.get_or_insert_with(Vec::new).push(c);
                    }
                }
                Descriptor::Unknown { .. } => {}
            }
        }

        out
    }
}

/// Map a raw rating byte to a minimum age.
///
/// 0x01..=0x0F is the DVB encoding (age minus 3); 0x11..=0x13 are used by
/// CSAT for 10, 12 and 16.
pub fn parental_rating_age(raw: u8) -> u8 {
    match raw {
        0x01..=0x0F => raw + 3,
        0x11 => 10,
        0x12 => 12,
        0x13 => 16,
        _ => 0,
    }
}

/// Resolve a PDC label against the current local date.
///
/// The label carries no year; December labels seen in January belong to
/// the previous year and January labels seen in December to the next.
pub fn pdc_time<Tz: TimeZone>(pdc: &PdcDescriptor, now: &DateTime<Tz>) -> Option<i64> {
    let mut year = now.year();
    let month = pdc.month as u32;
    match (now.month(), month) {
        (12, 1) => year += 1,
        (1, 12) => year -= 1,
        _ => {}
    }
    now.timezone()
        .with_ymd_and_hms(year, month, pdc.day as u32, pdc.hour as u32, pdc.minute as u32, 0)
        .earliest()
        .map(|t| t.timestamp())
}

/// Convert a component descriptor, if it describes a stream worth listing.
///
/// Stream content 1..=6 with a non-zero type, or 9 (HEVC video, AC-4
/// audio) with an extension below 2, which is folded into the upper nibble.
pub fn component(cd: &ComponentDescriptor) -> Option<Component> {
    let mut stream = cd.stream_content;
    let ext = cd.stream_content_ext;
    let wanted = ((1..=6).contains(&stream) && cd.component_type != 0) || (stream == 9 && ext < 2);
    if !wanted {
        return None;
    }
    if stream == 9 {
        stream |= ext << 4;
    }
    Some(Component {
        stream,
        component_type: cd.component_type,
        language: normalize_language_code(&cd.language),
        description: cd.description.clone(),
    })
}
