//! The per-connection processor: a state machine owning one socket and
//! running the read/parse/dispatch/respond loop, one HTTP transaction at a
//! time.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

use crate::network::channel::AjpChannel;
use crate::network::input_buffer::{BodyState, SocketInputBuffer};
use crate::network::keep_alive::spawn_keep_alive;
use crate::protocol::{
    Frame, MessageType, TextEncoding, FLUSH_FRAME, MAGIC_OUTBOUND, PING_PROBE_FRAME, PONG_FRAME,
};
use crate::request::{
    status_text, Admission, AdmissionControl, AjpRequest, AjpResponse, HandlerError, PathRouter,
    SessionRegistry,
};
use crate::service::{ProtocolSettings, Shutdown};
use crate::utils::CancelHandle;
use crate::{AppError, AppResult};

mod prepare;
#[cfg(test)]
mod tests;

/// The processor's position in the transaction lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Stage {
    Await = 0,
    Prepare = 1,
    Service = 2,
    ServiceEnded = 3,
    Ended = 4,
}

impl Stage {
    fn from_u8(v: u8) -> Stage {
        match v {
            0 => Stage::Await,
            1 => Stage::Prepare,
            2 => Stage::Service,
            3 => Stage::ServiceEnded,
            _ => Stage::Ended,
        }
    }
}

/// Commands issued back into the processor by the request/response objects
/// and the keep-alive prober.
pub enum Action<'a> {
    /// Send the serialized response-headers frame exactly once.
    Commit(&'a Frame),
    /// Push a zero-length body frame so the peer flushes to the client.
    ClientFlush,
    /// Keep-alive probe; hard section when the response is uncommitted.
    ClientPing,
    /// Send the end-of-response frame and mark the transaction finished.
    Close { reuse: bool },
    /// Let the main loop accept further transactions.
    Start,
    /// Stop the main loop after the current transaction.
    Stop,
}

/// Per-connection state shared between the processor, the transaction
/// objects and the keep-alive task.
pub struct TxnShared {
    channel: Arc<AjpChannel>,
    body: Arc<Mutex<BodyState>>,
    committed: Arc<AtomicBool>,
    finished: AtomicBool,
    error: AtomicBool,
    running: AtomicBool,
    stage: AtomicU8,
    /// Reply frame for the uncommitted-response probe round trip.
    probe_frame: tokio::sync::Mutex<Frame>,
}

impl TxnShared {
    pub fn new(
        channel: Arc<AjpChannel>,
        body: Arc<Mutex<BodyState>>,
        packet_size: usize,
        encoding: TextEncoding,
    ) -> Arc<TxnShared> {
        Arc::new(TxnShared {
            channel,
            body,
            committed: Arc::new(AtomicBool::new(false)),
            finished: AtomicBool::new(false),
            error: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stage: AtomicU8::new(Stage::Await as u8),
            probe_frame: tokio::sync::Mutex::new(Frame::new(packet_size, encoding)),
        })
    }

    pub fn channel(&self) -> &Arc<AjpChannel> {
        &self.channel
    }

    pub(crate) fn committed_flag(&self) -> Arc<AtomicBool> {
        self.committed.clone()
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn has_error(&self) -> bool {
        self.error.load(Ordering::SeqCst)
    }

    pub fn mark_error(&self) {
        self.error.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stage(&self) -> Stage {
        Stage::from_u8(self.stage.load(Ordering::SeqCst))
    }

    pub fn set_stage(&self, stage: Stage) {
        self.stage.store(stage as u8, Ordering::SeqCst);
    }

    /// Resets the transaction-scoped flags for the next turn.
    fn begin_transaction(&self) {
        self.committed.store(false, Ordering::SeqCst);
        self.finished.store(false, Ordering::SeqCst);
        self.error.store(false, Ordering::SeqCst);
    }

    pub async fn dispatch(&self, action: Action<'_>) -> AppResult<()> {
        match action {
            Action::Commit(frame) => {
                if self.committed.swap(true, Ordering::SeqCst) {
                    return Ok(());
                }
                self.channel.soft_write(frame.as_written()).await
            }
            Action::ClientFlush => {
                if !self.is_committed() {
                    return Err(AppError::IllegalState(
                        "flush before response commit".to_string(),
                    ));
                }
                self.channel.soft_write(&FLUSH_FRAME).await
            }
            Action::ClientPing => self.client_ping().await,
            Action::Close { reuse } => {
                if self.finished.swap(true, Ordering::SeqCst) {
                    return Ok(());
                }
                let end = [
                    MAGIC_OUTBOUND[0],
                    MAGIC_OUTBOUND[1],
                    0x00,
                    0x02,
                    MessageType::EndResponse as u8,
                    reuse as u8,
                ];
                self.channel.soft_write(&end).await
            }
            Action::Start => {
                self.running.store(true, Ordering::SeqCst);
                Ok(())
            }
            Action::Stop => {
                self.running.store(false, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    /// The keep-alive probe.
    ///
    /// Committed responses only need a cheap flush frame. Before commit the
    /// probe is a full round trip: write a zero-byte body request and block
    /// for the reply, with the whole exchange inside the hard section so no
    /// other frame can interleave. A non-empty reply carries real body
    /// bytes; they are stashed in the reserve so the probe loses nothing.
    async fn client_ping(&self) -> AppResult<()> {
        if self.is_committed() {
            return self.channel.soft_write(&FLUSH_FRAME).await;
        }
        let (mut reader, mut writer) = self.channel.hard_section().await;
        // The transaction may have moved on while we waited for the locks.
        if self.is_finished() || self.stage() != Stage::Service {
            return Ok(());
        }
        if self.is_committed() {
            return writer.write_bytes(&FLUSH_FRAME).await;
        }
        writer.write_bytes(&PING_PROBE_FRAME).await?;
        self.channel.touch_write();

        let mut frame = self.probe_frame.lock().await;
        let payload_len = reader.read_frame(&mut frame, None).await?;
        if payload_len > 0 {
            let declared = frame.read_int16()? as usize;
            if declared > 0 {
                let data = frame.read_slice(declared)?;
                self.body.lock().reserve.extend_from_slice(data);
                debug!(bytes = declared, "probe reply carried body bytes, stashed");
            }
        }
        self.channel.touch_write();
        Ok(())
    }
}

/// Builds a minimal send-headers frame: a status, its reason phrase and no
/// headers. Used for forced responses where the transaction's own response
/// object cannot be consulted.
pub(crate) fn encode_status_frame(
    status: u16,
    packet_size: usize,
    encoding: TextEncoding,
) -> Frame {
    let mut frame = Frame::new(packet_size, encoding);
    frame.reset_for_write();
    frame.append_byte(MessageType::SendHeaders as u8);
    frame.append_int16(status);
    frame.append_length_prefixed_text(status_text(status));
    frame.append_int16(0);
    frame.finalize_write();
    frame
}

/// External cancellation handle for a connection.
///
/// Forces an in-flight transaction to a 503 through the normal action
/// sequence, then closes the socket best-effort and marks the handle so a
/// supervising scheduler will not resubmit the connection.
#[derive(Clone)]
pub struct ConnectionCancel {
    shared: Arc<TxnShared>,
    settings: ProtocolSettings,
    cancelled: Arc<AtomicBool>,
}

impl ConnectionCancel {
    pub async fn cancel(&self) {
        let in_flight = !self.shared.is_finished()
            && matches!(
                self.shared.stage(),
                Stage::Prepare | Stage::Service | Stage::ServiceEnded
            );
        if in_flight {
            if !self.shared.is_committed() {
                let frame =
                    encode_status_frame(503, self.settings.packet_size, self.settings.encoding);
                let _ = self.shared.dispatch(Action::Commit(&frame)).await;
            }
            let _ = self.shared.dispatch(Action::ClientFlush).await;
            let _ = self.shared.dispatch(Action::Close { reuse: false }).await;
        }
        let _ = self.shared.dispatch(Action::Stop).await;
        self.shared.channel().force_close().await;
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub struct Processor {
    id: u64,
    settings: ProtocolSettings,
    channel: Arc<AjpChannel>,
    shared: Arc<TxnShared>,
    /// Control frame for inbound messages; body refills and probe replies
    /// use their own frames.
    frame: Frame,
    request: AjpRequest,
    response: AjpResponse,
    router: Arc<PathRouter>,
    sessions: Arc<dyn SessionRegistry>,
    admission: Arc<AdmissionControl>,
    keep_alive: Option<CancelHandle>,
    cancelled: Arc<AtomicBool>,
}

impl Processor {
    pub fn new(
        id: u64,
        socket: TcpStream,
        settings: ProtocolSettings,
        router: Arc<PathRouter>,
        sessions: Arc<dyn SessionRegistry>,
        admission: Arc<AdmissionControl>,
    ) -> Processor {
        let channel = Arc::new(AjpChannel::new(socket));
        let body_state = Arc::new(Mutex::new(BodyState::default()));
        let shared = TxnShared::new(
            channel.clone(),
            body_state.clone(),
            settings.packet_size,
            settings.encoding,
        );
        let input = SocketInputBuffer::new(
            channel.clone(),
            body_state.clone(),
            settings.packet_size,
            settings.encoding,
        );
        let request = AjpRequest::new(input, body_state, channel.local_addr());
        let response = AjpResponse::new(shared.clone(), settings.packet_size, settings.encoding);
        let frame = Frame::new(settings.packet_size, settings.encoding);
        Processor {
            id,
            settings,
            channel,
            shared,
            frame,
            request,
            response,
            router,
            sessions,
            admission,
            keep_alive: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.id
    }

    pub fn cancel_handle(&self) -> ConnectionCancel {
        ConnectionCancel {
            shared: self.shared.clone(),
            settings: self.settings.clone(),
            cancelled: self.cancelled.clone(),
        }
    }

    /// Runs the connection until the peer goes away, the idle timeout
    /// fires, an unrecoverable error occurs, or shutdown is signalled.
    pub async fn run(&mut self, shutdown: &mut Shutdown) -> AppResult<()> {
        self.shared.dispatch(Action::Start).await?;
        if let Some(tick) = self.settings.keep_alive_tick {
            self.keep_alive = Some(spawn_keep_alive(
                self.shared.clone(),
                tick,
                self.settings.max_write_idle,
            ));
        }
        let result = self.run_loop(shutdown).await;
        self.shared.set_stage(Stage::Ended);
        if let Some(keep_alive) = self.keep_alive.take() {
            keep_alive.cancel();
        }
        result
    }

    async fn run_loop(&mut self, shutdown: &mut Shutdown) -> AppResult<()> {
        while self.shared.is_running() {
            self.shared.set_stage(Stage::Await);
            let read = tokio::select! {
                res = self.channel.read_frame(&mut self.frame, self.settings.await_read_timeout) => res,
                _ = shutdown.recv() => {
                    debug!(connection = self.id, "exit read loop after shutdown signal");
                    return Ok(());
                }
            };
            let payload_len = match read {
                Ok(n) => n,
                Err(AppError::PeerClosed) => {
                    debug!(connection = self.id, "peer closed between transactions");
                    return Ok(());
                }
                Err(AppError::AwaitTimeout) => {
                    debug!(connection = self.id, "idle timeout waiting for next transaction");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            if payload_len == 0 {
                debug!(connection = self.id, "empty frame discarded");
                continue;
            }
            let type_byte = self.frame.read_byte()?;
            match MessageType::from_code(type_byte) {
                Some(MessageType::CPing) if payload_len == 1 => {
                    self.channel.soft_write(&PONG_FRAME).await?;
                }
                Some(MessageType::ForwardRequest) => {
                    self.process_transaction().await?;
                }
                Some(MessageType::Shutdown) => {
                    warn!(connection = self.id, "shutdown message from peer");
                    return Ok(());
                }
                other => {
                    // Usually a leftover body chunk from a handler that did
                    // not drain the previous request.
                    debug!(
                        connection = self.id,
                        code = type_byte,
                        message_type = ?other,
                        "unexpected message discarded"
                    );
                }
            }
        }
        Ok(())
    }

    async fn process_transaction(&mut self) -> AppResult<()> {
        self.shared.begin_transaction();
        self.request.recycle();
        self.response.recycle();
        self.shared.set_stage(Stage::Prepare);

        if let Err(err) = self.parse_forward_request() {
            if err.is_transaction_local() {
                // No valid transaction was established; nothing to answer.
                warn!(connection = self.id, error = %err, "malformed forward request abandoned");
                return Ok(());
            }
            return Err(err);
        }
        let content_length = self.request.content_length;
        self.request.body_begin(content_length);

        if let Some(required) = self.settings.required_secret.clone() {
            if self.request.secret.as_deref() != Some(required.as_str()) {
                warn!(connection = self.id, "forward request without valid shared secret");
                return self.finish_with_status(403).await;
            }
        }
        if self.request.malformed_cookie {
            return self.finish_with_status(400).await;
        }

        let resolved = self
            .router
            .resolve(self.request.normalized_path())
            .map(|(handler, route)| (handler, route.to_string()));
        let Some((handler, route)) = resolved else {
            return self.finish_with_status(404).await;
        };
        self.request.matched_route = route.clone();

        if let Err(err) = self.evaluate_session() {
            error!(connection = self.id, error = %err, "session bookkeeping failed");
        }

        self.shared.set_stage(Stage::Service);

        let permit = match self.admission.try_admit(&self.request, &route) {
            Admission::Granted(permit) => Some(permit),
            Admission::Unrestricted => None,
            Admission::Rejected => {
                warn!(connection = self.id, route = %route, "long-running slot busy");
                return self.finish_with_status(503).await;
            }
        };

        let outcome = handler.handle(&mut self.request, &mut self.response).await;
        // Released whatever the handler did.
        drop(permit);

        if let Err(err) = outcome {
            match err {
                HandlerError::Status { status, message } if !self.response.is_committed() => {
                    let _ = self.response.set_status(status);
                    let _ = self.response.set_message(message);
                }
                err => {
                    error!(connection = self.id, error = %err, "request handler failed");
                    self.shared.mark_error();
                }
            }
        }
        self.finish().await
    }

    /// Policy rejection path: a structured status, no handler involvement.
    async fn finish_with_status(&mut self, status: u16) -> AppResult<()> {
        let _ = self.response.set_status(status);
        let _ = self.response.set_message(status_text(status));
        self.finish().await
    }

    /// Commits the response if nobody has, then sends the terminal
    /// end-of-response frame carrying the reuse flag.
    async fn finish(&mut self) -> AppResult<()> {
        self.shared.set_stage(Stage::ServiceEnded);
        if self.shared.has_error() && !self.response.is_committed() {
            let _ = self.response.set_status(500);
            let _ = self.response.set_message(status_text(500));
        }
        if let Err(err) = self.response.commit().await {
            match err {
                AppError::Frame(crate::protocol::FrameError::TooLarge { len, max }) => {
                    error!(
                        connection = self.id,
                        len, max, "response headers exceed packet size"
                    );
                    self.shared.mark_error();
                    let frame = encode_status_frame(
                        500,
                        self.settings.packet_size,
                        self.settings.encoding,
                    );
                    self.shared.dispatch(Action::Commit(&frame)).await?;
                }
                err => return Err(err),
            }
        }
        let reuse = !self.shared.has_error();
        self.shared.dispatch(Action::Close { reuse }).await?;
        if !reuse {
            self.shared.dispatch(Action::Stop).await?;
        }
        Ok(())
    }

    /// Decides whether to mint, reuse or replace the session cookie. A
    /// request without a session id is left alone; sessions are created by
    /// the application, not the connector.
    fn evaluate_session(&mut self) -> AppResult<()> {
        let Some(full) = self.request.requested_session_id.clone() else {
            return Ok(());
        };
        let route = self.settings.instance_route.clone();
        let raw = if route.is_empty() {
            full.as_str()
        } else {
            full.strip_suffix(&format!(".{}", route))
                .unwrap_or(full.as_str())
        };
        if self.sessions.is_session_valid(raw) {
            self.request.session_id = Some(full.clone());
            if !self.request.session_from_cookie {
                // Id arrived in the URI; move it into a cookie.
                self.add_session_cookie(full)?;
            }
            return Ok(());
        }
        // The presented id is stale: mint a replacement cookie.
        let mut id = self.sessions.new_unique_id();
        if !route.is_empty() {
            id = format!("{}.{}", id, route);
        }
        self.request.session_id = Some(id.clone());
        self.add_session_cookie(id)
    }

    fn add_session_cookie(&mut self, id: String) -> AppResult<()> {
        let path = if self.request.context_path.is_empty() {
            "/".to_string()
        } else {
            self.request.context_path.clone()
        };
        self.response
            .add_cookie(crate::request::Cookie::session(id, path))
    }
}
