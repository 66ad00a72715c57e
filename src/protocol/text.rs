//! Legacy text rules of the wire protocol.
//!
//! The protocol is single-byte-per-character on the wire. On encode, control
//! bytes are flattened to spaces. On decode, bytes above 127 are re-escaped
//! as `%XX` tokens and the whole run is pushed through a percent decoder in
//! the configured encoding. Bytes at or below 127 bypass decoding entirely;
//! that asymmetry is observed peer behavior and must not be "fixed" without
//! confirming wire compatibility.

use tracing::warn;

/// Character encoding applied to escaped text runs.
///
/// Only UTF-8 is supported today; the name is validated at configuration
/// load so a typo fails at startup instead of mis-decoding traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TextEncoding {
    #[default]
    Utf8,
}

impl TextEncoding {
    pub fn from_name(name: &str) -> Option<TextEncoding> {
        match name.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Some(TextEncoding::Utf8),
            _ => None,
        }
    }
}

/// Maps a wire byte to its sanitized form: control bytes (<= 31, except
/// tab) and DEL become a space.
pub fn sanitize_byte(b: u8) -> u8 {
    if (b <= 31 && b != 9) || b == 127 {
        b' '
    } else {
        b
    }
}

const HEX: &[u8; 16] = b"0123456789ABCDEF";

/// Decodes a raw length-prefixed text payload.
///
/// Bytes <= 127 pass through verbatim. Any byte above 127 is appended as a
/// `%XX` escape token; if at least one was seen, the accumulated run is
/// percent-decoded in `encoding`.
pub fn decode_text(raw: &[u8], encoding: TextEncoding) -> String {
    let mut scratch = String::with_capacity(raw.len());
    let mut seen_high = false;
    for &b in raw {
        if b > 127 {
            seen_high = true;
            scratch.push('%');
            scratch.push(HEX[(b >> 4) as usize] as char);
            scratch.push(HEX[(b & 0x0F) as usize] as char);
        } else {
            scratch.push(b as char);
        }
    }
    if seen_high {
        percent_decode(&scratch, encoding)
    } else {
        scratch
    }
}

fn percent_decode(escaped: &str, encoding: TextEncoding) -> String {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = hex_value(bytes[i + 1]);
            let lo = hex_value(bytes[i + 2]);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    match encoding {
        TextEncoding::Utf8 => match String::from_utf8(out) {
            Ok(s) => s,
            Err(err) => {
                warn!("undecodable escaped text run, keeping lossy form");
                String::from_utf8_lossy(err.as_bytes()).into_owned()
            }
        },
    }
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'A'..=b'F' => Some(b - b'A' + 10),
        b'a'..=b'f' => Some(b - b'a' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0x00, b' ')]
    #[case(0x1F, b' ')]
    #[case(0x09, 0x09)]
    #[case(0x7F, b' ')]
    #[case(b'A', b'A')]
    #[case(0x20, 0x20)]
    fn sanitize_rules(#[case] input: u8, #[case] expected: u8) {
        assert_eq!(sanitize_byte(input), expected);
    }

    #[test]
    fn sanitize_is_idempotent() {
        for b in 0u8..=0x7F {
            let once = sanitize_byte(b);
            assert_eq!(sanitize_byte(once), once);
        }
    }

    #[test]
    fn plain_ascii_bypasses_decoding() {
        assert_eq!(decode_text(b"hello world", TextEncoding::Utf8), "hello world");
    }

    #[test]
    fn high_bytes_are_escaped_and_decoded() {
        // "é" as two escaped UTF-8 bytes.
        assert_eq!(decode_text(&[0xC3, 0xA9], TextEncoding::Utf8), "é");
        // Mixed ASCII and escaped continuation bytes decode because every
        // high byte was individually escaped.
        assert_eq!(
            decode_text(&[b'c', b'a', b'f', 0xC3, 0xA9], TextEncoding::Utf8),
            "café"
        );
    }

    #[test]
    fn lone_high_byte_falls_back_lossy() {
        let decoded = decode_text(&[0xC3], TextEncoding::Utf8);
        assert_eq!(decoded, "\u{FFFD}");
    }

    #[test]
    fn encoding_names() {
        assert_eq!(TextEncoding::from_name("UTF-8"), Some(TextEncoding::Utf8));
        assert_eq!(TextEncoding::from_name("utf8"), Some(TextEncoding::Utf8));
        assert_eq!(TextEncoding::from_name("latin-9"), None);
    }
}
