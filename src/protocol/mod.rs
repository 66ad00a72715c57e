//! Wire protocol layer: the frame codec, the static code tables and the
//! legacy text rules.
//!
//! Everything byte-exact lives here. The connection layer above deals only
//! in typed fields read from or appended to a [`Frame`].

pub use codes::{
    max_read_size, max_send_size, method_name, AttributeCode, HeaderCode, MessageType,
    ABSENT_LENGTH, ATTRIBUTES_DONE, DEFAULT_PACKET_SIZE, FLUSH_FRAME, FRAME_HEADER_LEN,
    MAGIC_INBOUND, MAGIC_OUTBOUND, METHOD_STORED, PING_PROBE_FRAME, PONG_FRAME,
    REMOTE_PORT_ATTRIBUTE,
};
pub use frame::{Frame, FrameError};
pub use text::TextEncoding;

mod codes;
mod frame;
mod text;
