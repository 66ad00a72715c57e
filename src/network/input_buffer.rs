//! Inbound body adapter: bridges arbitrary-length body reads from the
//! request handler to frame-sized GET_BODY_CHUNK round trips.

use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::trace;

use crate::network::AjpChannel;
use crate::protocol::{max_read_size, Frame, MessageType, TextEncoding, MAGIC_OUTBOUND};
use crate::AppResult;

/// Body-stream state shared between the input adapter and the keep-alive
/// prober: a probe against an uncommitted response may receive body bytes
/// in its reply slot, and those must not be lost.
#[derive(Debug, Default)]
pub struct BodyState {
    pub reserve: BytesMut,
    pub end_of_stream: bool,
    pub first_read_done: bool,
    /// Declared content length still owed to the handler; `None` when the
    /// request carried no content length.
    pub remaining: Option<u64>,
}

impl BodyState {
    /// Resets for a new transaction.
    pub fn begin(&mut self, content_length: Option<u64>) {
        self.reserve.clear();
        self.end_of_stream = content_length == Some(0);
        self.first_read_done = false;
        self.remaining = content_length;
    }

    /// Installs a replayed body, e.g. form-auth replay after an internal
    /// redirect. The stream is complete once the reserve drains.
    pub fn install_replayed(&mut self, bytes: &[u8]) {
        self.reserve.clear();
        self.reserve.extend_from_slice(bytes);
        self.end_of_stream = true;
        self.first_read_done = true;
        self.remaining = None;
    }
}

#[derive(Debug)]
pub struct SocketInputBuffer {
    channel: Arc<AjpChannel>,
    state: Arc<Mutex<BodyState>>,
    /// Dedicated receive frame so body refills never disturb the control
    /// frame the main loop reads into.
    frame: Frame,
    packet_size: usize,
}

impl SocketInputBuffer {
    pub fn new(
        channel: Arc<AjpChannel>,
        state: Arc<Mutex<BodyState>>,
        packet_size: usize,
        encoding: TextEncoding,
    ) -> SocketInputBuffer {
        SocketInputBuffer {
            channel,
            state,
            frame: Frame::new(packet_size, encoding),
            packet_size,
        }
    }

    /// Fills `dest` from the body stream, requesting a chunk from the peer
    /// when the reserve is empty. Returns 0 once end-of-stream has been
    /// observed.
    pub async fn fill(&mut self, dest: &mut [u8]) -> AppResult<usize> {
        if dest.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut state = self.state.lock();
                if !state.reserve.is_empty() {
                    let n = dest.len().min(state.reserve.len());
                    dest[..n].copy_from_slice(&state.reserve[..n]);
                    let _ = state.reserve.split_to(n);
                    if let Some(remaining) = state.remaining.as_mut() {
                        *remaining = remaining.saturating_sub(n as u64);
                        if *remaining == 0 {
                            state.end_of_stream = true;
                        }
                    }
                    return Ok(n);
                }
                if state.end_of_stream {
                    return Ok(0);
                }
            }
            self.refill().await?;
        }
    }

    async fn refill(&mut self) -> AppResult<()> {
        let first_with_length = {
            let mut state = self.state.lock();
            let first = !state.first_read_done;
            state.first_read_done = true;
            first && state.remaining.is_some()
        };
        // The first chunk of a request with a declared content length
        // arrives unsolicited right behind the forward request; everything
        // after that is pulled on demand.
        self.receive_chunk(!first_with_length).await
    }

    async fn receive_chunk(&mut self, request_first: bool) -> AppResult<()> {
        let mut reader = self.channel.reader_lock().await;
        if request_first {
            let ask = max_read_size(self.packet_size) as u16;
            let [hi, lo] = ask.to_be_bytes();
            let get_chunk = [
                MAGIC_OUTBOUND[0],
                MAGIC_OUTBOUND[1],
                0x00,
                0x03,
                MessageType::GetBodyChunk as u8,
                hi,
                lo,
            ];
            self.channel.soft_write(&get_chunk).await?;
        }
        let payload_len = reader.read_frame(&mut self.frame, None).await?;
        drop(reader);

        let mut state = self.state.lock();
        if payload_len == 0 {
            state.end_of_stream = true;
            return Ok(());
        }
        let declared = self.frame.read_int16()? as usize;
        if declared == 0 {
            state.end_of_stream = true;
            return Ok(());
        }
        let data = self.frame.read_slice(declared)?;
        state.reserve.extend_from_slice(data);
        trace!(bytes = declared, "received body chunk");
        Ok(())
    }
}
