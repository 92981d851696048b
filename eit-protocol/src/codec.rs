//! Codec for EIT and TDT sections.
//!
//! EIT section layout after the long section header:
//! ```text
//! +------+------+---------+-----------+--------------------------+-------+
//! | TSID | ONID | SegLast | LastTable | event loop (12 bytes + descriptors)* | CRC32 |
//! | u16  | u16  |   u8    |    u8     |                          |  u32  |
//! +------+------+---------+-----------+--------------------------+-------+
//! ```
//!
//! Times are MJD plus BCD hh:mm:ss in UTC and are converted to UNIX seconds.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::descriptors::{encode_descriptor, parse_descriptor_loop};
use crate::error::SectionError;
use crate::psi::{crc32_mpeg2, PsiSection};
use crate::types::*;

/// MJD of 1970-01-01.
const MJD_UNIX_EPOCH: i64 = 40587;

/// Fixed part of every event loop entry.
const EVENT_HEADER_SIZE: usize = 12;

/// TSID, ONID, segment last section number and last table id.
const EIT_FIXED_SIZE: usize = 6;

/// Largest section_length an EIT may carry.
pub const MAX_EIT_SECTION_LENGTH: usize = 4093;

/// Decode a complete EIT section, CRC included.
pub fn decode_eit_section(data: &[u8]) -> Result<EitSection, SectionError> {
    let section = PsiSection::parse_checked(data)?;
    let header = section.header;

    if !table_id::is_reconciled(header.table_id) && header.table_id != table_id::PRESENT_FOLLOWING_OTHER {
        return Err(SectionError::UnexpectedTableId(header.table_id));
    }
    if section.data.len() < EIT_FIXED_SIZE {
        return Err(SectionError::TooShort {
            needed: 8 + EIT_FIXED_SIZE + 4,
            actual: section.total_length(),
        });
    }

    let mut buf = section.data;
    let transport_stream_id = buf.get_u16();
    let original_network_id = buf.get_u16();
    let segment_last_section_number = buf.get_u8();
    let last_table_id = buf.get_u8();

    let mut events = Vec::new();
    while buf.has_remaining() {
        let offset = section.data.len() - buf.remaining();
        if buf.remaining() < EVENT_HEADER_SIZE {
            return Err(SectionError::TruncatedEvent(offset));
        }

        let event_id = buf.get_u16();
        let mut start = [0u8; 5];
        buf.copy_to_slice(&mut start);
        let mut duration = [0u8; 3];
        buf.copy_to_slice(&mut duration);
        let flags = buf.get_u16();
        let loop_length = (flags & 0x0FFF) as usize;

        if buf.remaining() < loop_length {
            return Err(SectionError::TruncatedEvent(offset));
        }
        let descriptors = parse_descriptor_loop(&buf[..loop_length]);
        buf.advance(loop_length);

        events.push(EitEvent {
            event_id,
            start_time: decode_start_time(&start),
            duration: decode_duration(&duration),
            running_status: RunningStatus::from_raw((flags >> 13) as u8),
            free_ca_mode: flags & 0x1000 != 0,
            descriptors,
        });
    }

    Ok(EitSection {
        table_id: header.table_id,
        service_id: header.table_id_extension,
        version_number: header.version_number,
        section_number: header.section_number,
        last_section_number: header.last_section_number,
        transport_stream_id,
        original_network_id,
        segment_last_section_number,
        last_table_id,
        events,
    })
}

/// Decode a Time and Date section and return UTC as UNIX seconds.
pub fn decode_tdt_section(data: &[u8]) -> Result<i64, SectionError> {
    if data.len() < 8 {
        return Err(SectionError::TooShort { needed: 8, actual: data.len() });
    }
    if data[0] != table_id::TDT {
        return Err(SectionError::UnexpectedTableId(data[0]));
    }
    let section_length = ((data[1] as u16 & 0x0F) << 8) | data[2] as u16;
    if section_length < 5 {
        return Err(SectionError::InvalidLength(section_length));
    }
    let utc: [u8; 5] = [data[3], data[4], data[5], data[6], data[7]];
    Ok(decode_start_time(&utc))
}

/// Encode an EIT section with a valid CRC.
pub fn encode_eit_section(section: &EitSection) -> Result<Bytes, SectionError> {
    let mut body = BytesMut::new();
    body.put_u16(section.transport_stream_id);
    body.put_u16(section.original_network_id);
    body.put_u8(section.segment_last_section_number);
    body.put_u8(section.last_table_id);

    for event in &section.events {
        let descriptors: Vec<u8> = event.descriptors.iter().flat_map(encode_descriptor).collect();
        if descriptors.len() > 0x0FFF {
            return Err(SectionError::TooLarge(descriptors.len()));
        }
        body.put_u16(event.event_id);
        body.put_slice(&encode_start_time(event.start_time));
        body.put_slice(&encode_duration(event.duration));
        let flags = ((event.running_status as u16) << 13)
            | if event.free_ca_mode { 0x1000 } else { 0 }
            | descriptors.len() as u16;
        body.put_u16(flags);
        body.put_slice(&descriptors);
    }

    // 5 bytes extended header + body + CRC
    let section_length = 5 + body.len() + 4;
    if section_length > MAX_EIT_SECTION_LENGTH {
        return Err(SectionError::TooLarge(section_length));
    }

    let mut out = BytesMut::with_capacity(3 + section_length);
    out.put_u8(section.table_id);
    out.put_u16(0xF000 | section_length as u16);
    out.put_u16(section.service_id);
    out.put_u8(0xC1 | ((section.version_number & 0x1F) << 1));
    out.put_u8(section.section_number);
    out.put_u8(section.last_section_number);
    out.put_slice(&body);
    let crc = crc32_mpeg2(&out);
    out.put_u32(crc);

    Ok(out.freeze())
}

/// Encode a Time and Date section.
pub fn encode_tdt_section(utc: i64) -> Bytes {
    let mut out = BytesMut::with_capacity(8);
    out.put_u8(table_id::TDT);
    out.put_u16(0x7005);
    out.put_slice(&encode_start_time(utc));
    out.freeze()
}

fn bcd(b: u8) -> i64 {
    ((b >> 4) as i64) * 10 + (b & 0x0F) as i64
}

fn to_bcd(v: i64) -> u8 {
    let v = v.rem_euclid(100) as u8;
    ((v / 10) << 4) | (v % 10)
}

/// MJD + BCD time to UNIX seconds; all bits set marks an NVOD reference.
fn decode_start_time(raw: &[u8; 5]) -> i64 {
    if raw.iter().all(|&b| b == 0xFF) {
        return NVOD_START_TIME;
    }
    let mjd = u16::from_be_bytes([raw[0], raw[1]]) as i64;
    (mjd - MJD_UNIX_EPOCH) * 86400 + bcd(raw[2]) * 3600 + bcd(raw[3]) * 60 + bcd(raw[4])
}

fn encode_start_time(time: i64) -> [u8; 5] {
    if time < 0 {
        return [0xFF; 5];
    }
    let days = time.div_euclid(86400);
    let secs = time.rem_euclid(86400);
    let mjd = (days + MJD_UNIX_EPOCH) as u16;
    let [hi, lo] = mjd.to_be_bytes();
    [hi, lo, to_bcd(secs / 3600), to_bcd(secs / 60 % 60), to_bcd(secs % 60)]
}

/// BCD duration; all bits set means undefined and decodes to zero.
fn decode_duration(raw: &[u8; 3]) -> i64 {
    if raw.iter().all(|&b| b == 0xFF) {
        return 0;
    }
    bcd(raw[0]) * 3600 + bcd(raw[1]) * 60 + bcd(raw[2])
}

fn encode_duration(duration: i64) -> [u8; 3] {
    let d = duration.clamp(0, 99 * 3600 + 59 * 60 + 59);
    [to_bcd(d / 3600), to_bcd(d / 60 % 60), to_bcd(d % 60)]
}
