//! Static wire code tables for the framed protocol.
//!
//! The protocol compresses well-known method names, request header names and
//! request attribute kinds into small integer codes. The tables here are the
//! single source of truth for both directions; every enum is matched
//! exhaustively so a new variant cannot be added without wiring its code and
//! its text form.

/// Inbound frame marker (front end -> connector).
pub const MAGIC_INBOUND: [u8; 2] = [0x12, 0x34];
/// Outbound frame marker (connector -> front end), ASCII "AB".
pub const MAGIC_OUTBOUND: [u8; 2] = [0x41, 0x42];

/// Frame header: 2 magic bytes + u16 payload length.
pub const FRAME_HEADER_LEN: usize = 4;

/// Default negotiated packet size.
pub const DEFAULT_PACKET_SIZE: usize = 8192;

/// Wire overhead of a GET_BODY_CHUNK reply: frame header + u16 block length.
const READ_OVERHEAD: usize = FRAME_HEADER_LEN + 2;
/// Wire overhead of a SEND_BODY_CHUNK frame: frame header + type byte +
/// u16 length + trailing NUL.
const SEND_OVERHEAD: usize = FRAME_HEADER_LEN + 4;

/// Largest request-body block that may be asked for in one round trip.
pub fn max_read_size(packet_size: usize) -> usize {
    packet_size - READ_OVERHEAD
}

/// Largest response-body block that fits one SEND_BODY_CHUNK frame.
pub fn max_send_size(packet_size: usize) -> usize {
    max_send_size_default() + packet_size - DEFAULT_PACKET_SIZE
}

const fn max_send_size_default() -> usize {
    DEFAULT_PACKET_SIZE - SEND_OVERHEAD
}

/// Declared string length meaning "field absent".
pub const ABSENT_LENGTH: u16 = 0xFFFF;

/// Attribute code closing the attribute block of a forward request.
pub const ATTRIBUTES_DONE: u8 = 0xFF;

/// Method code escape: the method name follows as a string.
pub const METHOD_STORED: u8 = 0xFF;

/// Message type codes appearing as the first payload byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    ForwardRequest = 2,
    SendBodyChunk = 3,
    SendHeaders = 4,
    EndResponse = 5,
    GetBodyChunk = 6,
    Shutdown = 7,
    CPong = 9,
    CPing = 10,
}

impl MessageType {
    pub fn from_code(code: u8) -> Option<MessageType> {
        match code {
            2 => Some(MessageType::ForwardRequest),
            3 => Some(MessageType::SendBodyChunk),
            4 => Some(MessageType::SendHeaders),
            5 => Some(MessageType::EndResponse),
            6 => Some(MessageType::GetBodyChunk),
            7 => Some(MessageType::Shutdown),
            9 => Some(MessageType::CPong),
            10 => Some(MessageType::CPing),
            _ => None,
        }
    }
}

/// Pre-built reply to a CPing probe.
pub const PONG_FRAME: [u8; 5] = [0x41, 0x42, 0x00, 0x01, MessageType::CPong as u8];

/// Pre-built zero-length body chunk, used to force the peer to flush
/// buffered response bytes to the client.
pub const FLUSH_FRAME: [u8; 8] = [
    0x41,
    0x42,
    0x00,
    0x04,
    MessageType::SendBodyChunk as u8,
    0x00,
    0x00,
    0x00,
];

/// Pre-built GET_BODY_CHUNK request for zero bytes, the uncommitted-response
/// keep-alive probe.
pub const PING_PROBE_FRAME: [u8; 7] = [
    0x41,
    0x42,
    0x00,
    0x03,
    MessageType::GetBodyChunk as u8,
    0x00,
    0x00,
];

/// Coded request methods, in wire-code order starting at 1.
const METHOD_NAMES: &[&str] = &[
    "OPTIONS",
    "GET",
    "HEAD",
    "POST",
    "PUT",
    "DELETE",
    "TRACE",
    "PROPFIND",
    "PROPPATCH",
    "MKCOL",
    "COPY",
    "MOVE",
    "LOCK",
    "UNLOCK",
    "ACL",
    "REPORT",
    "VERSION-CONTROL",
    "CHECKIN",
    "CHECKOUT",
    "UNCHECKOUT",
    "SEARCH",
    "MKWORKSPACE",
    "UPDATE",
    "LABEL",
    "MERGE",
    "BASELINE-CONTROL",
    "MKACTIVITY",
];

/// Resolves a coded method to its name. Code 0xFF is the stored-method
/// escape and is handled by the caller before this lookup.
pub fn method_name(code: u8) -> Option<&'static str> {
    if code == 0 {
        return None;
    }
    METHOD_NAMES.get(code as usize - 1).copied()
}

/// Coded request header names. The high byte of a coded name is 0xA0; a
/// leading u16 below 0xA000 is a plain string length instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum HeaderCode {
    Accept = 0xA001,
    AcceptCharset = 0xA002,
    AcceptEncoding = 0xA003,
    AcceptLanguage = 0xA004,
    Authorization = 0xA005,
    Connection = 0xA006,
    ContentType = 0xA007,
    ContentLength = 0xA008,
    Cookie = 0xA009,
    Cookie2 = 0xA00A,
    Host = 0xA00B,
    Pragma = 0xA00C,
    Referer = 0xA00D,
    UserAgent = 0xA00E,
}

impl HeaderCode {
    pub fn from_code(code: u16) -> Option<HeaderCode> {
        match code {
            0xA001 => Some(HeaderCode::Accept),
            0xA002 => Some(HeaderCode::AcceptCharset),
            0xA003 => Some(HeaderCode::AcceptEncoding),
            0xA004 => Some(HeaderCode::AcceptLanguage),
            0xA005 => Some(HeaderCode::Authorization),
            0xA006 => Some(HeaderCode::Connection),
            0xA007 => Some(HeaderCode::ContentType),
            0xA008 => Some(HeaderCode::ContentLength),
            0xA009 => Some(HeaderCode::Cookie),
            0xA00A => Some(HeaderCode::Cookie2),
            0xA00B => Some(HeaderCode::Host),
            0xA00C => Some(HeaderCode::Pragma),
            0xA00D => Some(HeaderCode::Referer),
            0xA00E => Some(HeaderCode::UserAgent),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HeaderCode::Accept => "accept",
            HeaderCode::AcceptCharset => "accept-charset",
            HeaderCode::AcceptEncoding => "accept-encoding",
            HeaderCode::AcceptLanguage => "accept-language",
            HeaderCode::Authorization => "authorization",
            HeaderCode::Connection => "connection",
            HeaderCode::ContentType => "content-type",
            HeaderCode::ContentLength => "content-length",
            HeaderCode::Cookie => "cookie",
            HeaderCode::Cookie2 => "cookie2",
            HeaderCode::Host => "host",
            HeaderCode::Pragma => "pragma",
            HeaderCode::Referer => "referer",
            HeaderCode::UserAgent => "user-agent",
        }
    }

    /// True if a peeked u16 denotes a coded header name rather than a
    /// string length.
    pub fn is_coded(peeked: u16) -> bool {
        peeked & 0xFF00 == 0xA000
    }
}

/// Request attribute kinds carried after the header block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AttributeCode {
    Context = 1,
    ServletPath = 2,
    RemoteUser = 3,
    AuthType = 4,
    QueryString = 5,
    Route = 6,
    SslCert = 7,
    SslCipher = 8,
    SslSession = 9,
    ReqAttribute = 10,
    SslKeySize = 11,
    Secret = 12,
    StoredMethod = 13,
}

impl AttributeCode {
    pub fn from_code(code: u8) -> Option<AttributeCode> {
        match code {
            1 => Some(AttributeCode::Context),
            2 => Some(AttributeCode::ServletPath),
            3 => Some(AttributeCode::RemoteUser),
            4 => Some(AttributeCode::AuthType),
            5 => Some(AttributeCode::QueryString),
            6 => Some(AttributeCode::Route),
            7 => Some(AttributeCode::SslCert),
            8 => Some(AttributeCode::SslCipher),
            9 => Some(AttributeCode::SslSession),
            10 => Some(AttributeCode::ReqAttribute),
            11 => Some(AttributeCode::SslKeySize),
            12 => Some(AttributeCode::Secret),
            13 => Some(AttributeCode::StoredMethod),
            _ => None,
        }
    }
}

/// Out-of-band request attribute name carrying the forwarded remote port.
/// The base protocol has no field for it, so front ends smuggle it through
/// the generic attribute channel under this name.
pub const REMOTE_PORT_ATTRIBUTE: &str = "AJP_REMOTE_PORT";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_table_is_bidirectional() {
        for (i, name) in METHOD_NAMES.iter().enumerate() {
            assert_eq!(method_name(i as u8 + 1), Some(*name));
        }
        assert_eq!(method_name(0), None);
        assert_eq!(method_name(METHOD_NAMES.len() as u8 + 1), None);
    }

    #[test]
    fn header_codes_round_trip() {
        for code in 0xA001u16..=0xA00E {
            let header = HeaderCode::from_code(code).unwrap();
            assert_eq!(header as u16, code);
            assert!(!header.name().is_empty());
        }
        assert_eq!(HeaderCode::from_code(0xA00F), None);
        assert!(HeaderCode::is_coded(0xA001));
        assert!(!HeaderCode::is_coded(0x0005));
    }

    #[test]
    fn attribute_codes_round_trip() {
        for code in 1u8..=13 {
            let attr = AttributeCode::from_code(code).unwrap();
            assert_eq!(attr as u8, code);
        }
        assert_eq!(AttributeCode::from_code(14), None);
        assert_eq!(AttributeCode::from_code(ATTRIBUTES_DONE), None);
    }

    #[test]
    fn chunk_sizes_track_packet_size() {
        assert_eq!(max_read_size(DEFAULT_PACKET_SIZE), 8186);
        assert_eq!(max_send_size(DEFAULT_PACKET_SIZE), 8184);
        // A non-default negotiated packet size shifts both symmetrically.
        assert_eq!(max_read_size(16384), 16378);
        assert_eq!(max_send_size(16384), 16376);
    }

    #[test]
    fn prebuilt_frames_are_wellformed() {
        assert_eq!(&PONG_FRAME[0..2], &MAGIC_OUTBOUND);
        assert_eq!(u16::from_be_bytes([PONG_FRAME[2], PONG_FRAME[3]]), 1);
        assert_eq!(u16::from_be_bytes([FLUSH_FRAME[2], FLUSH_FRAME[3]]), 4);
        assert_eq!(
            u16::from_be_bytes([PING_PROBE_FRAME[2], PING_PROBE_FRAME[3]]),
            3
        );
    }
}
