//! The per-transaction request object.
//!
//! One instance lives per connection and is recycled between transactions;
//! the PREPARE stage of the processor fills it from a parsed forward
//! request.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use url::form_urlencoded;

use crate::network::{BodyState, SocketInputBuffer};
use crate::AppResult;

/// Session id cookie name understood by sticky front ends.
pub const SESSION_COOKIE_NAME: &str = "JSESSIONID";
/// Path marker carrying a session id inside the request URI.
pub const SESSION_URI_MARKER: &str = ";jsessionid=";

pub struct AjpRequest {
    pub(crate) method: String,
    pub(crate) protocol: String,
    pub(crate) uri: String,
    pub(crate) remote_addr: String,
    pub(crate) remote_host: String,
    pub(crate) server_name: String,
    pub(crate) server_port: u16,
    pub(crate) secure: bool,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) attributes: Vec<(String, String)>,
    pub(crate) context_path: String,
    pub(crate) route_path: String,
    pub(crate) remote_user: Option<String>,
    pub(crate) auth_type: Option<String>,
    pub(crate) query_string: Option<String>,
    pub(crate) parameters: Vec<(String, String)>,
    pub(crate) instance_route: Option<String>,
    pub(crate) ssl_cert: Option<Vec<u8>>,
    pub(crate) ssl_cipher: Option<String>,
    pub(crate) ssl_session: Option<String>,
    pub(crate) ssl_key_size: Option<u16>,
    pub(crate) stored_method: Option<String>,
    pub(crate) secret: Option<String>,
    pub(crate) remote_port: Option<u16>,
    pub(crate) content_length: Option<u64>,
    pub(crate) requested_session_id: Option<String>,
    pub(crate) session_from_cookie: bool,
    pub(crate) session_id: Option<String>,
    pub(crate) malformed_cookie: bool,
    pub(crate) matched_route: String,
    local_addr: Option<SocketAddr>,
    body: SocketInputBuffer,
    body_state: Arc<Mutex<BodyState>>,
}

impl AjpRequest {
    pub(crate) fn new(
        body: SocketInputBuffer,
        body_state: Arc<Mutex<BodyState>>,
        local_addr: Option<SocketAddr>,
    ) -> AjpRequest {
        AjpRequest {
            method: String::new(),
            protocol: String::new(),
            uri: String::new(),
            remote_addr: String::new(),
            remote_host: String::new(),
            server_name: String::new(),
            server_port: 0,
            secure: false,
            headers: Vec::new(),
            attributes: Vec::new(),
            context_path: String::new(),
            route_path: String::new(),
            remote_user: None,
            auth_type: None,
            query_string: None,
            parameters: Vec::new(),
            instance_route: None,
            ssl_cert: None,
            ssl_cipher: None,
            ssl_session: None,
            ssl_key_size: None,
            stored_method: None,
            secret: None,
            remote_port: None,
            content_length: None,
            requested_session_id: None,
            session_from_cookie: false,
            session_id: None,
            malformed_cookie: false,
            matched_route: String::new(),
            local_addr,
            body,
            body_state,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// The request URI as received, session marker stripped.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The path used for routing: the URI after absolute-form
    /// normalization.
    pub fn normalized_path(&self) -> &str {
        &self.uri
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Remote host name. Falls back to the forwarded remote address when
    /// the front end did not resolve one.
    pub fn remote_host(&self) -> &str {
        if self.remote_host.is_empty() {
            &self.remote_addr
        } else {
            &self.remote_host
        }
    }

    pub fn remote_port(&self) -> Option<u16> {
        self.remote_port
    }

    /// Local (connector-side) socket address of this connection.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn server_port(&self) -> u16 {
        self.server_port
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First header with the given name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn context_path(&self) -> &str {
        &self.context_path
    }

    pub fn route_path(&self) -> &str {
        &self.route_path
    }

    pub fn remote_user(&self) -> Option<&str> {
        self.remote_user.as_deref()
    }

    pub fn auth_type(&self) -> Option<&str> {
        self.auth_type.as_deref()
    }

    pub fn query_string(&self) -> Option<&str> {
        self.query_string.as_deref()
    }

    pub fn parameters(&self) -> &[(String, String)] {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn ssl_cipher(&self) -> Option<&str> {
        self.ssl_cipher.as_deref()
    }

    /// Raw certificate bytes as forwarded; extraction is deferred to the
    /// consumer.
    pub fn ssl_cert(&self) -> Option<&[u8]> {
        self.ssl_cert.as_deref()
    }

    pub fn ssl_session(&self) -> Option<&str> {
        self.ssl_session.as_deref()
    }

    pub fn ssl_key_size(&self) -> Option<u16> {
        self.ssl_key_size
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn requested_session_id(&self) -> Option<&str> {
        self.requested_session_id.as_deref()
    }

    /// Effective session id after the mint/reuse decision.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn matched_route(&self) -> &str {
        &self.matched_route
    }

    /// Reads request-body bytes, pulling chunks from the peer on demand.
    /// Returns 0 at end of stream.
    pub async fn read_body(&mut self, dest: &mut [u8]) -> AppResult<usize> {
        self.body.fill(dest).await
    }

    /// Replaces the body stream with already-buffered bytes, e.g. to
    /// replay a form-auth body after an internal redirect.
    pub fn install_replayed_body(&mut self, bytes: &[u8]) {
        self.body_state.lock().install_replayed(bytes);
    }

    /// Arms the body stream for a new transaction.
    pub(crate) fn body_begin(&mut self, content_length: Option<u64>) {
        self.body_state.lock().begin(content_length);
    }

    /// Populates the query string and its decoded parameters.
    pub(crate) fn set_query_string(&mut self, raw: String) {
        self.parameters = form_urlencoded::parse(raw.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        self.query_string = Some(raw);
    }

    /// Scans Cookie headers for the session cookie. A nameless pair marks
    /// the header malformed and is reported as a policy rejection.
    pub(crate) fn extract_session_cookie(&mut self) {
        let mut found: Option<String> = None;
        for (name, value) in &self.headers {
            if !name.eq_ignore_ascii_case("cookie") {
                continue;
            }
            for pair in value.split(';') {
                let pair = pair.trim();
                if pair.is_empty() {
                    continue;
                }
                match pair.split_once('=') {
                    Some((key, val)) if !key.trim().is_empty() => {
                        if key.trim() == SESSION_COOKIE_NAME {
                            found = Some(val.trim().to_string());
                        }
                    }
                    _ => {
                        self.malformed_cookie = true;
                        return;
                    }
                }
            }
        }
        if let Some(id) = found {
            // A cookie takes precedence over a URI marker.
            self.requested_session_id = Some(id);
            self.session_from_cookie = true;
        }
    }

    /// Clears all transaction-local state for the next turn on this
    /// connection. Buffers shrink back lazily; nothing reallocates on the
    /// hot path.
    pub(crate) fn recycle(&mut self) {
        self.method.clear();
        self.protocol.clear();
        self.uri.clear();
        self.remote_addr.clear();
        self.remote_host.clear();
        self.server_name.clear();
        self.server_port = 0;
        self.secure = false;
        self.headers.clear();
        self.attributes.clear();
        self.context_path.clear();
        self.route_path.clear();
        self.remote_user = None;
        self.auth_type = None;
        self.query_string = None;
        self.parameters.clear();
        self.instance_route = None;
        self.ssl_cert = None;
        self.ssl_cipher = None;
        self.ssl_session = None;
        self.ssl_key_size = None;
        self.stored_method = None;
        self.secret = None;
        self.remote_port = None;
        self.content_length = None;
        self.requested_session_id = None;
        self.session_from_cookie = false;
        self.session_id = None;
        self.malformed_cookie = false;
        self.matched_route.clear();
    }
}
