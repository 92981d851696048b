//! Descriptor parsing for the EIT event loop.
//!
//! Every descriptor is decoded into an owned [`Descriptor`] value. Tags the
//! engine does not consume, and bodies that fail to parse, become
//! [`Descriptor::Unknown`] so one bad descriptor never costs the event.

use log::trace;

use crate::error::DescriptorError;
use crate::text::{decode_dvb_string, decode_language_code, encode_dvb_string};
use crate::types::*;

/// Parse a descriptor loop.
pub fn parse_descriptor_loop(data: &[u8]) -> Vec<Descriptor> {
    let mut descriptors = Vec::new();
    let mut offset = 0;

    while offset + 2 <= data.len() {
        let tag = data[offset];
        let length = data[offset + 1] as usize;
        offset += 2;

        if offset + length > data.len() {
            trace!("Descriptor 0x{:02X} truncated, dropping rest of loop", tag);
            break;
        }

        let body = &data[offset..offset + length];
        offset += length;

        match parse_descriptor(tag, body) {
            Ok(d) => descriptors.push(d),
            Err(e) => {
                trace!("Skipping descriptor: {}", e);
                descriptors.push(Descriptor::Unknown {
                    tag,
                    data: body.to_vec(),
                });
            }
        }
    }

    descriptors
}

/// Parse a single descriptor body.
pub fn parse_descriptor(tag: u8, data: &[u8]) -> Result<Descriptor, DescriptorError> {
    let too_short = || DescriptorError::TooShort { tag, len: data.len() };
    let inner = || DescriptorError::InnerLength { tag };

    let descriptor = match tag {
        descriptor_tag::SHORT_EVENT => {
            if data.len() < 5 {
                return Err(too_short());
            }
            let language = decode_language_code(&data[0..3]);
            let (name, rest) = length_prefixed(&data[3..]).ok_or_else(inner)?;
            let (text, _) = length_prefixed(rest).ok_or_else(inner)?;
            Descriptor::ShortEvent(ShortEventDescriptor {
                language,
                name: decode_dvb_string(name),
                text: decode_dvb_string(text),
            })
        }
        descriptor_tag::EXTENDED_EVENT => {
            if data.len() < 6 {
                return Err(too_short());
            }
            let descriptor_number = data[0] >> 4;
            let last_descriptor_number = data[0] & 0x0F;
            let language = decode_language_code(&data[1..4]);
            let (mut items_data, rest) = length_prefixed(&data[4..]).ok_or_else(inner)?;
            let mut items = Vec::new();
            while !items_data.is_empty() {
                let (description, after) = length_prefixed(items_data).ok_or_else(inner)?;
                let (item, after) = length_prefixed(after).ok_or_else(inner)?;
                items.push(ExtendedEventItem {
                    description: decode_dvb_string(description),
                    item: decode_dvb_string(item),
                });
                items_data = after;
            }
            let (text, _) = length_prefixed(rest).ok_or_else(inner)?;
            Descriptor::ExtendedEvent(ExtendedEventDescriptor {
                descriptor_number,
                last_descriptor_number,
                language,
                items,
                text: decode_dvb_string(text),
            })
        }
        descriptor_tag::CONTENT => Descriptor::Content(ContentDescriptor {
            nibbles: data
                .chunks_exact(2)
                .map(|c| ContentNibble {
                    level1: c[0] >> 4,
                    level2: c[0] & 0x0F,
                    user_byte: c[1],
                })
                .collect(),
        }),
        descriptor_tag::PARENTAL_RATING => Descriptor::ParentalRating(ParentalRatingDescriptor {
            ratings: data
                .chunks_exact(4)
                .map(|c| ParentalRating {
                    language: decode_language_code(&c[0..3]),
                    rating: c[3],
                })
                .collect(),
        }),
        descriptor_tag::PDC => {
            if data.len() < 3 {
                return Err(too_short());
            }
            let pil = ((data[0] as u32 & 0x0F) << 16) | ((data[1] as u32) << 8) | data[2] as u32;
            Descriptor::Pdc(PdcDescriptor {
                day: ((pil >> 15) & 0x1F) as u8,
                month: ((pil >> 11) & 0x0F) as u8,
                hour: ((pil >> 6) & 0x1F) as u8,
                minute: (pil & 0x3F) as u8,
            })
        }
        descriptor_tag::TIME_SHIFTED_EVENT => {
            if data.len() < 4 {
                return Err(too_short());
            }
            Descriptor::TimeShiftedEvent(TimeShiftedEventDescriptor {
                reference_service_id: u16::from_be_bytes([data[0], data[1]]),
                reference_event_id: u16::from_be_bytes([data[2], data[3]]),
            })
        }
        descriptor_tag::LINKAGE => {
            if data.len() < 7 {
                return Err(too_short());
            }
            Descriptor::Linkage(LinkageDescriptor {
                transport_stream_id: u16::from_be_bytes([data[0], data[1]]),
                original_network_id: u16::from_be_bytes([data[2], data[3]]),
                service_id: u16::from_be_bytes([data[4], data[5]]),
                linkage_type: data[6],
                private_data: data[7..].to_vec(),
            })
        }
        descriptor_tag::COMPONENT => {
            if data.len() < 6 {
                return Err(too_short());
            }
            Descriptor::Component(ComponentDescriptor {
                stream_content_ext: data[0] >> 4,
                stream_content: data[0] & 0x0F,
                component_type: data[1],
                component_tag: data[2],
                language: decode_language_code(&data[3..6]),
                description: decode_dvb_string(&data[6..]),
            })
        }
        _ => Descriptor::Unknown {
            tag,
            data: data.to_vec(),
        },
    };

    Ok(descriptor)
}

/// Split a length-prefixed field off the front of `data`.
fn length_prefixed(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let (&len, rest) = data.split_first()?;
    let len = len as usize;
    if len > rest.len() {
        return None;
    }
    Some(rest.split_at(len))
}

/// Serialize a descriptor including tag and length.
///
/// Strings longer than a length field allows are truncated.
pub fn encode_descriptor(descriptor: &Descriptor) -> Vec<u8> {
    let mut body = Vec::new();

    match descriptor {
        Descriptor::ShortEvent(d) => {
            put_language(&mut body, &d.language);
            put_string(&mut body, &d.name);
            put_string(&mut body, &d.text);
        }
        Descriptor::ExtendedEvent(d) => {
            body.push((d.descriptor_number << 4) | (d.last_descriptor_number & 0x0F));
            put_language(&mut body, &d.language);
            let mut items = Vec::new();
            for item in &d.items {
                put_string(&mut items, &item.description);
                put_string(&mut items, &item.item);
            }
            items.truncate(u8::MAX as usize);
            body.push(items.len() as u8);
            body.extend_from_slice(&items);
            put_string(&mut body, &d.text);
        }
        Descriptor::Content(d) => {
            for n in &d.nibbles {
                body.push((n.level1 << 4) | (n.level2 & 0x0F));
                body.push(n.user_byte);
            }
        }
        Descriptor::ParentalRating(d) => {
            for r in &d.ratings {
                put_language(&mut body, &r.language);
                body.push(r.rating);
            }
        }
        Descriptor::Pdc(d) => {
            let pil = ((d.day as u32 & 0x1F) << 15)
                | ((d.month as u32 & 0x0F) << 11)
                | ((d.hour as u32 & 0x1F) << 6)
                | (d.minute as u32 & 0x3F);
            body.push(0xF0 | ((pil >> 16) as u8 & 0x0F));
            body.push((pil >> 8) as u8);
            body.push(pil as u8);
        }
        Descriptor::TimeShiftedEvent(d) => {
            body.extend_from_slice(&d.reference_service_id.to_be_bytes());
            body.extend_from_slice(&d.reference_event_id.to_be_bytes());
        }
        Descriptor::Linkage(d) => {
            body.extend_from_slice(&d.transport_stream_id.to_be_bytes());
            body.extend_from_slice(&d.original_network_id.to_be_bytes());
            body.extend_from_slice(&d.service_id.to_be_bytes());
            body.push(d.linkage_type);
            body.extend_from_slice(&d.private_data);
        }
        Descriptor::Component(d) => {
            body.push((d.stream_content_ext << 4) | (d.stream_content & 0x0F));
            body.push(d.component_type);
            body.push(d.component_tag);
            put_language(&mut body, &d.language);
            body.extend_from_slice(&encode_dvb_string(&d.description));
        }
        Descriptor::Unknown { data, .. } => body.extend_from_slice(data),
    }

    body.truncate(u8::MAX as usize);
    let mut out = Vec::with_capacity(body.len() + 2);
    out.push(descriptor.tag());
    out.push(body.len() as u8);
    out.extend_from_slice(&body);
    out
}

fn put_language(buf: &mut Vec<u8>, code: &str) {
    let mut bytes = [b' '; 3];
    for (dst, src) in bytes.iter_mut().zip(code.bytes()) {
        *dst = src;
    }
    buf.extend_from_slice(&bytes);
}

fn put_string(buf: &mut Vec<u8>, text: &str) {
    let mut data = encode_dvb_string(text);
    data.truncate(u8::MAX as usize);
    buf.push(data.len() as u8);
    buf.extend_from_slice(&data);
}
