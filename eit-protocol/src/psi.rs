//! PSI/SI section header parsing, CRC validation and reassembly.

use crate::error::SectionError;

/// Long section header (common to all tables with section syntax).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsiHeader {
    /// Table ID.
    pub table_id: u8,
    /// Section syntax indicator.
    pub section_syntax_indicator: bool,
    /// Section length (12 bits).
    pub section_length: u16,
    /// Table ID extension (service ID for EIT).
    pub table_id_extension: u16,
    /// Version number (5 bits).
    pub version_number: u8,
    /// Current/next indicator.
    pub current_next_indicator: bool,
    /// Section number.
    pub section_number: u8,
    /// Last section number.
    pub last_section_number: u8,
}

/// A parsed long section.
#[derive(Debug, Clone)]
pub struct PsiSection<'a> {
    /// Section header.
    pub header: PsiHeader,
    /// Section body (after header, before CRC).
    pub data: &'a [u8],
    /// CRC32 value as transmitted.
    pub crc32: u32,
}

impl<'a> PsiSection<'a> {
    /// Parse a long section from raw bytes starting at `table_id`.
    ///
    /// The CRC is extracted but not verified; see [`PsiSection::parse_checked`].
    pub fn parse(data: &'a [u8]) -> Result<Self, SectionError> {
        if data.len() < 3 {
            return Err(SectionError::TooShort { needed: 3, actual: data.len() });
        }

        let table_id = data[0];
        let section_syntax_indicator = data[1] & 0x80 != 0;
        let section_length = ((data[1] as u16 & 0x0F) << 8) | data[2] as u16;

        if !section_syntax_indicator {
            return Err(SectionError::NotLongSection);
        }
        // 5 bytes extended header + 4 bytes CRC
        if section_length < 9 {
            return Err(SectionError::InvalidLength(section_length));
        }

        let total_length = 3 + section_length as usize;
        if data.len() < total_length {
            return Err(SectionError::TooShort { needed: total_length, actual: data.len() });
        }

        let header = PsiHeader {
            table_id,
            section_syntax_indicator,
            section_length,
            table_id_extension: ((data[3] as u16) << 8) | data[4] as u16,
            version_number: (data[5] >> 1) & 0x1F,
            current_next_indicator: data[5] & 0x01 != 0,
            section_number: data[6],
            last_section_number: data[7],
        };

        let crc_offset = total_length - 4;
        let crc32 = u32::from_be_bytes([
            data[crc_offset],
            data[crc_offset + 1],
            data[crc_offset + 2],
            data[crc_offset + 3],
        ]);

        Ok(PsiSection {
            header,
            data: &data[8..crc_offset],
            crc32,
        })
    }

    /// Parse a long section and reject it when the CRC does not match.
    pub fn parse_checked(data: &'a [u8]) -> Result<Self, SectionError> {
        let section = Self::parse(data)?;
        let calculated = crc32_mpeg2(&data[..section.total_length() - 4]);
        if calculated != section.crc32 {
            return Err(SectionError::CrcMismatch {
                expected: section.crc32,
                calculated,
            });
        }
        Ok(section)
    }

    /// Get the total section length including header and CRC.
    pub fn total_length(&self) -> usize {
        3 + self.header.section_length as usize
    }
}

/// Reassembles sections from the payloads of TS packets on one PID.
///
/// A single packet may finish one section and start several more; the
/// table id 0xFF marks stuffing up to the end of the packet.
#[derive(Debug, Default)]
pub struct SectionCollector {
    /// Bytes of the section under construction.
    buffer: Vec<u8>,
    /// Last continuity counter.
    last_cc: Option<u8>,
}

impl SectionCollector {
    /// Create a new section collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the collector.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.last_cc = None;
    }

    /// Add the payload of one TS packet.
    ///
    /// Returns every section completed by this payload.
    pub fn add_data(&mut self, payload: &[u8], cc: u8, payload_unit_start: bool) -> Vec<Vec<u8>> {
        let mut sections = Vec::new();

        if let Some(last) = self.last_cc {
            if cc == last && !payload_unit_start {
                // Duplicate packet
                return sections;
            }
            if cc != ((last + 1) & 0x0F) {
                self.buffer.clear();
            }
        }
        self.last_cc = Some(cc);

        if payload_unit_start {
            let Some((&pointer, rest)) = payload.split_first() else {
                return sections;
            };
            let pointer = pointer as usize;
            if pointer > rest.len() {
                self.buffer.clear();
                return sections;
            }
            if !self.buffer.is_empty() {
                self.buffer.extend_from_slice(&rest[..pointer]);
                self.drain_complete(&mut sections);
            }
            self.buffer.clear();
            self.buffer.extend_from_slice(&rest[pointer..]);
        } else if !self.buffer.is_empty() {
            self.buffer.extend_from_slice(payload);
        }

        self.drain_complete(&mut sections);
        sections
    }

    fn drain_complete(&mut self, sections: &mut Vec<Vec<u8>>) {
        while self.buffer.len() >= 3 {
            if self.buffer[0] == 0xFF {
                self.buffer.clear();
                break;
            }
            let length = 3 + (((self.buffer[1] as usize & 0x0F) << 8) | self.buffer[2] as usize);
            if self.buffer.len() < length {
                break;
            }
            sections.push(self.buffer.drain(..length).collect());
        }
    }

    /// Check if collector has data.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Calculate CRC32 for MPEG-2 (polynomial 0x04C11DB7).
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    static CRC_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = (i as u32) << 24;
            let mut j = 0;
            while j < 8 {
                if crc & 0x80000000 != 0 {
                    crc = (crc << 1) ^ 0x04C11DB7;
                } else {
                    crc <<= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFFFFFFu32;
    for &byte in data {
        let index = ((crc >> 24) ^ byte as u32) as usize;
        crc = (crc << 8) ^ CRC_TABLE[index];
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section_with_crc(body: &[u8]) -> Vec<u8> {
        let mut data = body.to_vec();
        let crc = crc32_mpeg2(&data);
        data.extend_from_slice(&crc.to_be_bytes());
        data
    }

    fn sample_section() -> Vec<u8> {
        // table_id=0x4E, section_length=15 (5 header + 6 body + 4 CRC)
        section_with_crc(&[
            0x4E, 0xB0, 0x0F, 0x00, 0x65, 0xC3, 0x00, 0x01, 0x00, 0x01, 0x00, 0x02, 0x01, 0x4E,
        ])
    }

    #[test]
    fn test_crc32_empty() {
        assert_eq!(crc32_mpeg2(&[]), 0xFFFFFFFF);
    }

    #[test]
    fn test_parse_header() {
        let data = sample_section();
        let section = PsiSection::parse_checked(&data).unwrap();
        assert_eq!(section.header.table_id, 0x4E);
        assert_eq!(section.header.table_id_extension, 0x0065);
        assert_eq!(section.header.version_number, 1);
        assert!(section.header.current_next_indicator);
        assert_eq!(section.header.section_number, 0);
        assert_eq!(section.header.last_section_number, 1);
        assert_eq!(section.data.len(), 6);
        assert_eq!(section.total_length(), data.len());
    }

    #[test]
    fn test_crc_mismatch_rejected() {
        let mut data = sample_section();
        data[9] ^= 0xFF;
        assert!(matches!(
            PsiSection::parse_checked(&data),
            Err(SectionError::CrcMismatch { .. })
        ));
        // Unchecked parse still succeeds
        assert!(PsiSection::parse(&data).is_ok());
    }

    #[test]
    fn test_short_section_rejected() {
        assert!(matches!(
            PsiSection::parse(&[0x4E, 0xB0]),
            Err(SectionError::TooShort { .. })
        ));
        assert!(matches!(
            PsiSection::parse(&[0x70, 0x70, 0x05, 0, 0, 0, 0, 0]),
            Err(SectionError::NotLongSection)
        ));
    }

    #[test]
    fn test_collector_split_across_packets() {
        let section = sample_section();
        let mut collector = SectionCollector::new();

        let mut first = vec![0u8];
        first.extend_from_slice(&section[..10]);
        assert!(collector.add_data(&first, 0, true).is_empty());
        assert!(!collector.is_empty());

        let done = collector.add_data(&section[10..], 1, false);
        assert_eq!(done, vec![section]);
        assert!(collector.is_empty());
    }

    #[test]
    fn test_collector_multiple_sections_and_stuffing() {
        let section = sample_section();
        let mut payload = vec![0u8];
        payload.extend_from_slice(&section);
        payload.extend_from_slice(&section);
        payload.extend_from_slice(&[0xFF; 20]);

        let mut collector = SectionCollector::new();
        let done = collector.add_data(&payload, 3, true);
        assert_eq!(done.len(), 2);
        assert!(collector.is_empty());
    }

    #[test]
    fn test_collector_discontinuity_drops_partial() {
        let section = sample_section();
        let mut collector = SectionCollector::new();

        let mut first = vec![0u8];
        first.extend_from_slice(&section[..10]);
        collector.add_data(&first, 0, true);

        // cc jumps from 0 to 2
        assert!(collector.add_data(&section[10..], 2, false).is_empty());
        assert!(collector.is_empty());
    }
}
