//! Completion tracking for the sections of one table instance.

/// Tracks which sections of the current version of a table have been seen.
///
/// Section numbers are grouped in segments of 8. Sections past a segment's
/// `segment_last_section_number` are never transmitted and are counted as
/// received when the first section of that segment is processed.
#[derive(Debug, Clone)]
pub struct SectionSyncer {
    version: Option<u8>,
    seen: [u64; 4],
    count: u16,
    last_section_number: Option<u8>,
}

impl Default for SectionSyncer {
    fn default() -> Self {
        Self::new()
    }
}

impl SectionSyncer {
    pub fn new() -> Self {
        Self {
            version: None,
            seen: [0; 4],
            count: 0,
            last_section_number: None,
        }
    }

    /// Forget everything, including the version.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Returns true if `section_number` of `version` still needs processing.
    ///
    /// A different version resets the tracker.
    pub fn check(&mut self, version: u8, section_number: u8) -> bool {
        if self.version != Some(version) {
            self.reset();
            self.version = Some(version);
        }
        if self.is_complete() {
            return false;
        }
        !self.is_seen(section_number)
    }

    /// Record a processed section. Returns true once the table is complete.
    pub fn processed(&mut self, section_number: u8, last_section_number: u8, segment_last_section_number: u8) -> bool {
        self.last_section_number = Some(last_section_number);
        // Numbers past the last section would inflate the count
        if section_number > last_section_number {
            return self.is_complete();
        }
        self.mark(section_number);

        let segment_end = (section_number | 0x07).min(last_section_number);
        if segment_last_section_number < segment_end {
            for n in segment_last_section_number + 1..=segment_end {
                self.mark(n);
            }
        }

        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        match self.last_section_number {
            Some(last) => self.count >= last as u16 + 1,
            None => false,
        }
    }

    fn is_seen(&self, n: u8) -> bool {
        self.seen[(n >> 6) as usize] & (1u64 << (n & 0x3F)) != 0
    }

    fn mark(&mut self, n: u8) {
        if !self.is_seen(n) {
            self.seen[(n >> 6) as usize] |= 1u64 << (n & 0x3F);
            self.count += 1;
        }
    }
}
