//! Outbound body adapter: splits arbitrary-length response writes into
//! SEND_BODY_CHUNK frames.

use std::sync::Arc;

use crate::network::AjpChannel;
use crate::protocol::{max_send_size, Frame, MessageType, TextEncoding};
use crate::{AppError, AppResult};

#[derive(Debug)]
pub struct SocketOutputBuffer {
    channel: Arc<AjpChannel>,
    /// Dedicated data frame, distinct from the control/header frame, so
    /// body streaming cannot corrupt an in-flight header write.
    frame: Frame,
    chunk_size: usize,
    committed_probe: Arc<std::sync::atomic::AtomicBool>,
}

impl SocketOutputBuffer {
    pub fn new(
        channel: Arc<AjpChannel>,
        committed: Arc<std::sync::atomic::AtomicBool>,
        packet_size: usize,
        encoding: TextEncoding,
    ) -> SocketOutputBuffer {
        SocketOutputBuffer {
            channel,
            frame: Frame::new(packet_size, encoding),
            chunk_size: max_send_size(packet_size),
            committed_probe: committed,
        }
    }

    /// Writes `data` as one or more body-chunk frames under the soft
    /// section. The response headers must already be on the wire.
    pub async fn write(&mut self, data: &[u8]) -> AppResult<usize> {
        if !self
            .committed_probe
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            return Err(AppError::IllegalState(
                "body write before response commit".to_string(),
            ));
        }
        for piece in data.chunks(self.chunk_size.max(1)) {
            self.frame.reset_for_write();
            self.frame.append_byte(MessageType::SendBodyChunk as u8);
            self.frame.append_length_prefixed_bytes(piece);
            self.frame.finalize_write();
            self.channel.soft_write(self.frame.as_written()).await?;
        }
        Ok(data.len())
    }
}
