//! End-to-end transaction tests over real localhost sockets: one side is
//! the processor under test, the other plays the front-end peer byte for
//! byte.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::request::{
    AdmissionControl, AjpHandler, AjpRequest, AjpResponse, HandlerError, MemorySessionRegistry,
    PathRouter,
};
use crate::service::{ProtocolSettings, Shutdown};
use crate::AppResult;

use super::Processor;

const GET: u8 = 2;

async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();
    (client, server)
}

/// The front-end side of the wire.
struct Peer {
    stream: TcpStream,
}

impl Peer {
    async fn send_payload(&mut self, payload: &[u8]) {
        let mut frame = vec![0x12, 0x34];
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(payload);
        self.stream.write_all(&frame).await.unwrap();
    }

    /// Sends a raw frame with an empty payload.
    async fn send_empty(&mut self) {
        self.stream.write_all(&[0x12, 0x34, 0x00, 0x00]).await.unwrap();
    }

    async fn read_payload(&mut self) -> Vec<u8> {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).await.unwrap();
        assert_eq!(&header[..2], b"AB", "outbound magic");
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut payload = vec![0u8; len];
        if len > 0 {
            self.stream.read_exact(&mut payload).await.unwrap();
        }
        payload
    }
}

fn put_text(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

struct ForwardRequest {
    method_code: u8,
    uri: String,
    headers: Vec<(HeaderName, String)>,
    attributes: Vec<(u8, Vec<String>)>,
}

enum HeaderName {
    Text(String),
    Coded(u16),
}

impl ForwardRequest {
    fn get(uri: &str) -> ForwardRequest {
        ForwardRequest {
            method_code: GET,
            uri: uri.to_string(),
            headers: Vec::new(),
            attributes: Vec::new(),
        }
    }

    fn header(mut self, name: &str, value: &str) -> ForwardRequest {
        self.headers
            .push((HeaderName::Text(name.to_string()), value.to_string()));
        self
    }

    fn coded_header(mut self, code: u16, value: &str) -> ForwardRequest {
        self.headers
            .push((HeaderName::Coded(code), value.to_string()));
        self
    }

    fn attribute(mut self, code: u8, values: &[&str]) -> ForwardRequest {
        self.attributes
            .push((code, values.iter().map(|v| v.to_string()).collect()));
        self
    }

    fn build(&self) -> Vec<u8> {
        let mut p = vec![0x02, self.method_code];
        put_text(&mut p, "HTTP/1.1");
        put_text(&mut p, &self.uri);
        put_text(&mut p, "192.0.2.7"); // remote address
        put_text(&mut p, ""); // remote host unresolved
        put_text(&mut p, "localhost");
        p.extend_from_slice(&8009u16.to_be_bytes());
        p.push(0); // not secure
        p.extend_from_slice(&(self.headers.len() as u16).to_be_bytes());
        for (name, value) in &self.headers {
            match name {
                HeaderName::Text(name) => put_text(&mut p, name),
                HeaderName::Coded(code) => p.extend_from_slice(&code.to_be_bytes()),
            }
            put_text(&mut p, value);
        }
        for (code, values) in &self.attributes {
            p.push(*code);
            for value in values {
                put_text(&mut p, value);
            }
        }
        p.push(0xFF);
        p
    }
}

/// Parses a send-headers payload into status, message and header pairs.
fn parse_send_headers(payload: &[u8]) -> (u16, String, Vec<(String, String)>) {
    assert_eq!(payload[0], 4, "send-headers type");
    let mut pos = 1;
    let mut read_u16 = |pos: &mut usize| {
        let v = u16::from_be_bytes([payload[*pos], payload[*pos + 1]]);
        *pos += 2;
        v
    };
    let status = read_u16(&mut pos);
    let mut read_text = |pos: &mut usize| {
        let len = u16::from_be_bytes([payload[*pos], payload[*pos + 1]]) as usize;
        *pos += 2;
        let text = String::from_utf8(payload[*pos..*pos + len].to_vec()).unwrap();
        *pos += len + 1;
        text
    };
    let message = read_text(&mut pos);
    let count = u16::from_be_bytes([payload[pos], payload[pos + 1]]) as usize;
    pos += 2;
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        let name = read_text(&mut pos);
        let value = read_text(&mut pos);
        headers.push((name, value));
    }
    (status, message, headers)
}

struct OkHandler;

#[async_trait]
impl AjpHandler for OkHandler {
    async fn handle(
        &self,
        _request: &mut AjpRequest,
        _response: &mut AjpResponse,
    ) -> Result<(), HandlerError> {
        Ok(())
    }
}

struct RecordingHandler {
    invoked: Arc<AtomicBool>,
    seen: Arc<Mutex<Option<(String, String, u16)>>>,
}

#[async_trait]
impl AjpHandler for RecordingHandler {
    async fn handle(
        &self,
        request: &mut AjpRequest,
        _response: &mut AjpResponse,
    ) -> Result<(), HandlerError> {
        self.invoked.store(true, Ordering::SeqCst);
        *self.seen.lock() = Some((
            request.uri().to_string(),
            request.server_name().to_string(),
            request.server_port(),
        ));
        Ok(())
    }
}

struct BodyDrainHandler {
    total: Arc<AtomicUsize>,
}

#[async_trait]
impl AjpHandler for BodyDrainHandler {
    async fn handle(
        &self,
        request: &mut AjpRequest,
        _response: &mut AjpResponse,
    ) -> Result<(), HandlerError> {
        let mut buf = [0u8; 1000];
        loop {
            let n = request
                .read_body(&mut buf)
                .await
                .map_err(|e| HandlerError::Internal(e.to_string()))?;
            if n == 0 {
                break;
            }
            self.total.fetch_add(n, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct BodyWriteHandler;

#[async_trait]
impl AjpHandler for BodyWriteHandler {
    async fn handle(
        &self,
        _request: &mut AjpRequest,
        response: &mut AjpResponse,
    ) -> Result<(), HandlerError> {
        response
            .write_body(b"hello")
            .await
            .map_err(|e| HandlerError::Internal(e.to_string()))?;
        Ok(())
    }
}

struct BigHeaderHandler;

#[async_trait]
impl AjpHandler for BigHeaderHandler {
    async fn handle(
        &self,
        _request: &mut AjpRequest,
        response: &mut AjpResponse,
    ) -> Result<(), HandlerError> {
        let value = "x".repeat(9000);
        response
            .add_header("x-giant", value)
            .map_err(|e| HandlerError::Internal(e.to_string()))?;
        Ok(())
    }
}

struct SlowHandler {
    delay: Duration,
}

#[async_trait]
impl AjpHandler for SlowHandler {
    async fn handle(
        &self,
        _request: &mut AjpRequest,
        _response: &mut AjpResponse,
    ) -> Result<(), HandlerError> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

fn build_processor(
    socket: TcpStream,
    settings: ProtocolSettings,
    handler: Arc<dyn AjpHandler>,
) -> Processor {
    let admission = Arc::new(AdmissionControl::from_settings(&settings));
    build_processor_with_admission(socket, settings, handler, admission)
}

fn build_processor_with_admission(
    socket: TcpStream,
    settings: ProtocolSettings,
    handler: Arc<dyn AjpHandler>,
    admission: Arc<AdmissionControl>,
) -> Processor {
    let mut router = PathRouter::new();
    router.add_route("/", handler);
    let sessions = Arc::new(MemorySessionRegistry::new(64));
    Processor::new(1, socket, settings, Arc::new(router), sessions, admission)
}

fn spawn(mut processor: Processor) -> (JoinHandle<AppResult<()>>, broadcast::Sender<()>) {
    let (tx, rx) = broadcast::channel(1);
    let handle = tokio::spawn(async move {
        let mut shutdown = Shutdown::new(rx);
        processor.run(&mut shutdown).await
    });
    (handle, tx)
}

#[tokio::test]
async fn minimal_ping_gets_prebuilt_pong() {
    let (client, server) = socket_pair().await;
    let processor = build_processor(server, ProtocolSettings::default(), Arc::new(OkHandler));
    let (handle, _tx) = spawn(processor);
    let mut peer = Peer { stream: client };

    peer.send_payload(&[10]).await;
    assert_eq!(peer.read_payload().await, vec![9]);

    // The processor stayed in AWAIT: a second ping works the same.
    peer.send_payload(&[10]).await;
    assert_eq!(peer.read_payload().await, vec![9]);

    drop(peer);
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn simple_get_round_trip() {
    let (client, server) = socket_pair().await;
    let invoked = Arc::new(AtomicBool::new(false));
    let seen = Arc::new(Mutex::new(None));
    let handler = Arc::new(RecordingHandler {
        invoked: invoked.clone(),
        seen: seen.clone(),
    });
    let processor = build_processor(server, ProtocolSettings::default(), handler);
    let (handle, _tx) = spawn(processor);
    let mut peer = Peer { stream: client };

    peer.send_payload(&ForwardRequest::get("/x").build()).await;

    // Exactly: send-headers with status 200, empty message, 0 headers.
    let headers_payload = peer.read_payload().await;
    assert_eq!(
        headers_payload,
        vec![0x04, 0x00, 0xC8, 0x00, 0x00, 0x00, 0x00, 0x00]
    );
    // Then: end-response with reuse = 1.
    assert_eq!(peer.read_payload().await, vec![0x05, 0x01]);
    assert!(invoked.load(Ordering::SeqCst));

    drop(peer);
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn connection_is_reused_across_transactions() {
    let (client, server) = socket_pair().await;
    let processor = build_processor(server, ProtocolSettings::default(), Arc::new(OkHandler));
    let (_handle, _tx) = spawn(processor);
    let mut peer = Peer { stream: client };

    for _ in 0..3 {
        peer.send_payload(&ForwardRequest::get("/x").build()).await;
        let (status, _, _) = parse_send_headers(&peer.read_payload().await);
        assert_eq!(status, 200);
        assert_eq!(peer.read_payload().await, vec![0x05, 0x01]);
    }
}

#[tokio::test]
async fn missing_secret_rejected_with_403() {
    let (client, server) = socket_pair().await;
    let invoked = Arc::new(AtomicBool::new(false));
    let handler = Arc::new(RecordingHandler {
        invoked: invoked.clone(),
        seen: Arc::new(Mutex::new(None)),
    });
    let settings = ProtocolSettings {
        required_secret: Some("s3cr3t".to_string()),
        ..ProtocolSettings::default()
    };
    let processor = build_processor(server, settings, handler);
    let (_handle, _tx) = spawn(processor);
    let mut peer = Peer { stream: client };

    peer.send_payload(&ForwardRequest::get("/x").build()).await;

    let (status, _, _) = parse_send_headers(&peer.read_payload().await);
    assert_eq!(status, 403);
    // The end frame still arrives, connection stays reusable.
    assert_eq!(peer.read_payload().await, vec![0x05, 0x01]);
    assert!(!invoked.load(Ordering::SeqCst), "handler must not run");
}

#[tokio::test]
async fn valid_secret_admits_the_request() {
    let (client, server) = socket_pair().await;
    let settings = ProtocolSettings {
        required_secret: Some("s3cr3t".to_string()),
        ..ProtocolSettings::default()
    };
    let processor = build_processor(server, settings, Arc::new(OkHandler));
    let (_handle, _tx) = spawn(processor);
    let mut peer = Peer { stream: client };

    // Attribute 12 = secret.
    peer.send_payload(&ForwardRequest::get("/x").attribute(12, &["s3cr3t"]).build())
        .await;
    let (status, _, _) = parse_send_headers(&peer.read_payload().await);
    assert_eq!(status, 200);
}

#[tokio::test]
async fn declared_body_consumed_without_extra_round_trip() {
    let (client, server) = socket_pair().await;
    let total = Arc::new(AtomicUsize::new(0));
    let handler = Arc::new(BodyDrainHandler {
        total: total.clone(),
    });
    let processor = build_processor(server, ProtocolSettings::default(), handler);
    let (_handle, _tx) = spawn(processor);
    let mut peer = Peer { stream: client };

    // content-length via the coded header table (0xA008).
    peer.send_payload(
        &ForwardRequest::get("/upload")
            .coded_header(0xA008, "5000")
            .build(),
    )
    .await;
    // First chunk arrives unsolicited: u16 block length + raw bytes.
    let mut body = Vec::with_capacity(5002);
    body.extend_from_slice(&5000u16.to_be_bytes());
    body.extend_from_slice(&vec![0xABu8; 5000]);
    peer.send_payload(&body).await;

    // The very next outbound frame is the response; the adapter never
    // asked for another chunk (5000 fits one receive).
    let payload = peer.read_payload().await;
    let (status, _, _) = parse_send_headers(&payload);
    assert_eq!(status, 200);
    assert_eq!(peer.read_payload().await, vec![0x05, 0x01]);
    assert_eq!(total.load(Ordering::SeqCst), 5000);
}

#[tokio::test]
async fn unknown_length_body_pulled_on_demand() {
    let (client, server) = socket_pair().await;
    let total = Arc::new(AtomicUsize::new(0));
    let handler = Arc::new(BodyDrainHandler {
        total: total.clone(),
    });
    let processor = build_processor(server, ProtocolSettings::default(), handler);
    let (_handle, _tx) = spawn(processor);
    let mut peer = Peer { stream: client };

    peer.send_payload(&ForwardRequest::get("/stream").build()).await;

    // No content length: the adapter must ask.
    let probe = peer.read_payload().await;
    assert_eq!(probe[0], 6, "get-body-chunk request");
    let mut chunk = Vec::new();
    chunk.extend_from_slice(&11u16.to_be_bytes());
    chunk.extend_from_slice(b"hello world");
    peer.send_payload(&chunk).await;

    // Second ask answered with an empty frame: end of stream.
    let probe = peer.read_payload().await;
    assert_eq!(probe[0], 6);
    peer.send_empty().await;

    let (status, _, _) = parse_send_headers(&peer.read_payload().await);
    assert_eq!(status, 200);
    assert_eq!(peer.read_payload().await, vec![0x05, 0x01]);
    assert_eq!(total.load(Ordering::SeqCst), 11);
}

#[tokio::test]
async fn headers_precede_body_chunks() {
    let (client, server) = socket_pair().await;
    let processor = build_processor(server, ProtocolSettings::default(), Arc::new(BodyWriteHandler));
    let (_handle, _tx) = spawn(processor);
    let mut peer = Peer { stream: client };

    peer.send_payload(&ForwardRequest::get("/x").build()).await;

    let first = peer.read_payload().await;
    assert_eq!(first[0], 4, "headers frame first");
    let second = peer.read_payload().await;
    assert_eq!(second[0], 3, "then the body chunk");
    assert_eq!(&second[1..3], &5u16.to_be_bytes());
    assert_eq!(&second[3..8], b"hello");
    assert_eq!(second[8], 0, "chunk terminator");
    let third = peer.read_payload().await;
    assert_eq!(third, vec![0x05, 0x01]);
}

#[tokio::test]
async fn oversized_response_headers_fail_closed() {
    let (client, server) = socket_pair().await;
    let processor = build_processor(server, ProtocolSettings::default(), Arc::new(BigHeaderHandler));
    let (_handle, _tx) = spawn(processor);
    let mut peer = Peer { stream: client };

    peer.send_payload(&ForwardRequest::get("/x").build()).await;

    // No partial frame: the peer sees a clean minimal 500 instead.
    let (status, _, headers) = parse_send_headers(&peer.read_payload().await);
    assert_eq!(status, 500);
    assert!(headers.is_empty());
    // And the connection is not offered for reuse.
    assert_eq!(peer.read_payload().await, vec![0x05, 0x00]);
}

#[tokio::test]
async fn malformed_request_abandoned_connection_survives() {
    let (client, server) = socket_pair().await;
    let invoked = Arc::new(AtomicBool::new(false));
    let handler = Arc::new(RecordingHandler {
        invoked: invoked.clone(),
        seen: Arc::new(Mutex::new(None)),
    });
    let processor = build_processor(server, ProtocolSettings::default(), handler);
    let (_handle, _tx) = spawn(processor);
    let mut peer = Peer { stream: client };

    // Attribute code 99 does not exist.
    peer.send_payload(&ForwardRequest::get("/x").attribute(99, &["?"]).build())
        .await;
    // No response for the abandoned transaction; the connection loops
    // back to AWAIT and still answers pings.
    peer.send_payload(&[10]).await;
    assert_eq!(peer.read_payload().await, vec![9]);
    assert!(!invoked.load(Ordering::SeqCst));
}

#[tokio::test]
async fn absolute_uri_normalized_and_virtual_host_derived() {
    let (client, server) = socket_pair().await;
    let seen = Arc::new(Mutex::new(None));
    let handler = Arc::new(RecordingHandler {
        invoked: Arc::new(AtomicBool::new(false)),
        seen: seen.clone(),
    });
    let processor = build_processor(server, ProtocolSettings::default(), handler);
    let (_handle, _tx) = spawn(processor);
    let mut peer = Peer { stream: client };

    peer.send_payload(
        &ForwardRequest::get("http://vhost.example:8081/a/b")
            .header("host", "ignored.example")
            .build(),
    )
    .await;
    let (status, _, _) = parse_send_headers(&peer.read_payload().await);
    assert_eq!(status, 200);
    peer.read_payload().await;

    let (uri, server_name, server_port) = seen.lock().clone().unwrap();
    assert_eq!(uri, "/a/b");
    // The Host header was rewritten to the absolute-form authority before
    // the virtual host was derived.
    assert_eq!(server_name, "vhost.example");
    assert_eq!(server_port, 8081);
}

#[tokio::test]
async fn stale_session_id_gets_replacement_cookie() {
    let (client, server) = socket_pair().await;
    let processor = build_processor(server, ProtocolSettings::default(), Arc::new(OkHandler));
    let (_handle, _tx) = spawn(processor);
    let mut peer = Peer { stream: client };

    peer.send_payload(&ForwardRequest::get("/x;jsessionid=DEADBEEF").build())
        .await;
    let (status, _, headers) = parse_send_headers(&peer.read_payload().await);
    assert_eq!(status, 200);
    let set_cookie = headers
        .iter()
        .find(|(name, _)| name == "Set-Cookie")
        .expect("replacement session cookie");
    assert!(set_cookie.1.starts_with("JSESSIONID="));
    assert!(!set_cookie.1.contains("DEADBEEF"));
}

#[tokio::test]
async fn keep_alive_probes_uncommitted_response() {
    let (client, server) = socket_pair().await;
    let settings = ProtocolSettings {
        keep_alive_tick: Some(Duration::from_millis(50)),
        max_write_idle: Duration::from_millis(1),
        ..ProtocolSettings::default()
    };
    let handler = Arc::new(SlowHandler {
        delay: Duration::from_millis(400),
    });
    let processor = build_processor(server, settings, handler);
    let (_handle, _tx) = spawn(processor);
    let mut peer = Peer { stream: client };

    peer.send_payload(&ForwardRequest::get("/slow").build()).await;

    // While the handler blocks, probes arrive as zero-byte body requests;
    // answer each until the real response shows up.
    let mut probes = 0;
    let headers_payload = loop {
        let payload = peer.read_payload().await;
        if payload[0] == 6 {
            assert_eq!(payload, vec![6, 0, 0], "zero-byte probe");
            probes += 1;
            peer.send_empty().await;
            continue;
        }
        break payload;
    };
    assert!(probes >= 1, "at least one probe during the slow handler");
    let (status, _, _) = parse_send_headers(&headers_payload);
    assert_eq!(status, 200);
    assert_eq!(peer.read_payload().await, vec![0x05, 0x01]);
}

#[tokio::test]
async fn long_running_slot_enforced_per_route() {
    let settings = ProtocolSettings {
        restrict_long_running: true,
        long_running_path: "/slow".to_string(),
        long_running_param: String::new(),
        ..ProtocolSettings::default()
    };
    let admission = Arc::new(AdmissionControl::from_settings(&settings));
    let handler = Arc::new(SlowHandler {
        delay: Duration::from_millis(300),
    });

    let (client_a, server_a) = socket_pair().await;
    let (client_b, server_b) = socket_pair().await;
    let proc_a = build_processor_with_admission(
        server_a,
        settings.clone(),
        handler.clone(),
        admission.clone(),
    );
    let proc_b = build_processor_with_admission(server_b, settings, handler, admission);
    let (_ha, _ta) = spawn(proc_a);
    let (_hb, _tb) = spawn(proc_b);
    let mut peer_a = Peer { stream: client_a };
    let mut peer_b = Peer { stream: client_b };

    peer_a.send_payload(&ForwardRequest::get("/slow/x").build()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    peer_b.send_payload(&ForwardRequest::get("/slow/y").build()).await;

    let (status_b, _, _) = parse_send_headers(&peer_b.read_payload().await);
    assert_eq!(status_b, 503, "second long-running transaction rejected");
    assert_eq!(peer_b.read_payload().await, vec![0x05, 0x01]);

    let (status_a, _, _) = parse_send_headers(&peer_a.read_payload().await);
    assert_eq!(status_a, 200, "first transaction completes");
}

#[tokio::test]
async fn await_timeout_ends_idle_connection() {
    let (client, server) = socket_pair().await;
    let settings = ProtocolSettings {
        await_read_timeout: Some(Duration::from_millis(50)),
        ..ProtocolSettings::default()
    };
    let processor = build_processor(server, settings, Arc::new(OkHandler));
    let (handle, _tx) = spawn(processor);

    // Send nothing; the processor must give up on its own.
    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("processor should exit on idle timeout")
        .unwrap();
    assert!(result.is_ok());
    drop(client);
}

#[tokio::test]
async fn cancellation_forces_503_and_closes() {
    let (client, server) = socket_pair().await;
    let handler = Arc::new(SlowHandler {
        delay: Duration::from_millis(500),
    });
    let processor = build_processor(server, ProtocolSettings::default(), handler);
    let cancel = processor.cancel_handle();
    let (_handle, _tx) = spawn(processor);
    let mut peer = Peer { stream: client };

    peer.send_payload(&ForwardRequest::get("/slow").build()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel().await;
    assert!(cancel.is_cancelled());

    let (status, _, _) = parse_send_headers(&peer.read_payload().await);
    assert_eq!(status, 503);
    // Flush frame, then a no-reuse end frame.
    assert_eq!(peer.read_payload().await, vec![3, 0, 0, 0]);
    assert_eq!(peer.read_payload().await, vec![0x05, 0x00]);
}

#[tokio::test]
async fn shutdown_signal_stops_the_loop() {
    let (client, server) = socket_pair().await;
    let processor = build_processor(server, ProtocolSettings::default(), Arc::new(OkHandler));
    let (handle, tx) = spawn(processor);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let _ = tx.send(());
    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("processor should exit on shutdown")
        .unwrap();
    assert!(result.is_ok());
    drop(client);
}
