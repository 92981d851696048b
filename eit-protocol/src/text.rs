//! DVB string decoding (EN 300 468 Annex A).
//!
//! The first byte of a string may select a character table. Strings
//! without a selector use the default table, which is approximated here by
//! ISO-8859-1.

use encoding_rs::{
    Encoding, ISO_8859_10, ISO_8859_13, ISO_8859_14, ISO_8859_15, ISO_8859_16, ISO_8859_2,
    ISO_8859_3, ISO_8859_4, ISO_8859_5, ISO_8859_6, ISO_8859_7, ISO_8859_8, UTF_16BE, UTF_8,
    WINDOWS_1252, WINDOWS_1254, WINDOWS_874,
};

/// Map an ISO-8859 part number to an encoding.
fn iso_8859(part: u8) -> Option<&'static Encoding> {
    Some(match part {
        1 => WINDOWS_1252,
        2 => ISO_8859_2,
        3 => ISO_8859_3,
        4 => ISO_8859_4,
        5 => ISO_8859_5,
        6 => ISO_8859_6,
        7 => ISO_8859_7,
        8 => ISO_8859_8,
        9 => WINDOWS_1254,
        10 => ISO_8859_10,
        11 => WINDOWS_874,
        13 => ISO_8859_13,
        14 => ISO_8859_14,
        15 => ISO_8859_15,
        16 => ISO_8859_16,
        _ => return None,
    })
}

/// Split off the character table selector.
fn select_table(data: &[u8]) -> (&'static Encoding, &[u8]) {
    match data.first().copied() {
        Some(b @ 0x01..=0x0B) => (iso_8859(b + 4).unwrap_or(WINDOWS_1252), &data[1..]),
        Some(0x10) if data.len() >= 3 => (iso_8859(data[2]).unwrap_or(WINDOWS_1252), &data[3..]),
        Some(0x11) => (UTF_16BE, &data[1..]),
        Some(0x15) => (UTF_8, &data[1..]),
        // Other selectors (KSX1001, GB2312, Big5, ...) are rare; skip the byte
        Some(0x00..=0x1F) => (WINDOWS_1252, &data[1..]),
        _ => (WINDOWS_1252, data),
    }
}

/// Decode a DVB string to UTF-8.
///
/// Emphasis control codes are removed and the CR/LF code 0x8A becomes `\n`.
pub fn decode_dvb_string(data: &[u8]) -> String {
    if data.is_empty() {
        return String::new();
    }

    let (encoding, body) = select_table(data);

    if encoding == UTF_16BE || encoding == UTF_8 {
        let (text, _) = encoding.decode_without_bom_handling(body);
        return text
            .chars()
            .filter_map(|c| match c as u32 {
                0xE086 | 0xE087 => None,
                0xE08A => Some('\n'),
                _ => Some(c),
            })
            .collect();
    }

    // Single-byte tables: control codes live in 0x80..0x9F
    let mut cleaned = Vec::with_capacity(body.len());
    for &b in body {
        match b {
            0x86 | 0x87 => {}
            0x8A => cleaned.push(b'\n'),
            0x80..=0x9F => {}
            _ => cleaned.push(b),
        }
    }
    let (text, _) = encoding.decode_without_bom_handling(&cleaned);
    text.into_owned()
}

/// Decode a 3-byte ISO 639 language or ISO 3166 country code.
pub fn decode_language_code(data: &[u8]) -> String {
    data.iter()
        .take(3)
        .filter(|b| b.is_ascii_graphic())
        .map(|&b| (b as char).to_ascii_lowercase())
        .collect()
}

/// Encode a UTF-8 string with the UTF-8 table selector.
pub fn encode_dvb_string(text: &str) -> Vec<u8> {
    if text.is_empty() {
        return Vec::new();
    }
    if text.is_ascii() {
        return text.as_bytes().to_vec();
    }
    let mut data = Vec::with_capacity(text.len() + 1);
    data.push(0x15);
    data.extend_from_slice(text.as_bytes());
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        assert_eq!(decode_dvb_string(b"Tagesschau"), "Tagesschau");
        // 0xE9 is e-acute in Latin-1
        assert_eq!(decode_dvb_string(&[b'C', b'a', b'f', 0xE9]), "Café");
    }

    #[test]
    fn test_control_codes() {
        let data = [0x86, b'N', b'e', b'w', b's', 0x87, 0x8A, b'2', b'0', b'h'];
        assert_eq!(decode_dvb_string(&data), "News\n20h");
    }

    #[test]
    fn test_utf8_selector() {
        let data = encode_dvb_string("Größe");
        assert_eq!(data[0], 0x15);
        assert_eq!(decode_dvb_string(&data), "Größe");
    }

    #[test]
    fn test_iso_8859_5_selector() {
        // 0x01 selects ISO-8859-5, 0xB0 is CYRILLIC CAPITAL LETTER A
        assert_eq!(decode_dvb_string(&[0x01, 0xB0]), "А");
    }

    #[test]
    fn test_language_code() {
        assert_eq!(decode_language_code(b"DEU"), "deu");
        assert_eq!(decode_language_code(b"en "), "en");
    }
}
