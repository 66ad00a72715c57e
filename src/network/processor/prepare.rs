//! PREPARE stage: parsing a forward-request payload into the request
//! object, plus the normalization passes that follow.
//!
//! The field order is fixed by the wire format: method code, protocol,
//! URI, remote address/host, server name/port, secure flag, the coded
//! header block, then the attribute block terminated by the reserved done
//! code. A malformed or truncated stream raises a structured parse error;
//! the caller abandons the transaction without answering.

use tracing::trace;

use crate::protocol::{
    method_name, AttributeCode, Frame, FrameError, HeaderCode, ABSENT_LENGTH, ATTRIBUTES_DONE,
    METHOD_STORED, REMOTE_PORT_ATTRIBUTE,
};
use crate::request::{AjpRequest, SESSION_URI_MARKER};
use crate::{AppError, AppResult};

use super::Processor;

impl Processor {
    /// Parses the forward-request payload sitting in the control frame.
    /// The message type byte has already been consumed by the main loop.
    pub(super) fn parse_forward_request(&mut self) -> AppResult<()> {
        let enforce_secure = self.settings.enforce_secure_scheme;
        let frame = &mut self.frame;
        let request = &mut self.request;

        let method_code = frame.read_byte()?;
        if method_code != METHOD_STORED {
            request.method = method_name(method_code)
                .ok_or_else(|| {
                    AppError::MalformedProtocol(format!("unknown method code {}", method_code))
                })?
                .to_string();
        }
        request.protocol = frame.read_length_prefixed_text()?;
        let mut uri = frame.read_length_prefixed_text()?;
        request.remote_addr = frame.read_length_prefixed_text()?;
        request.remote_host = frame.read_length_prefixed_text()?;
        request.server_name = frame.read_length_prefixed_text()?;
        request.server_port = frame.read_int16()?;
        request.secure = frame.read_byte()? != 0;

        let header_count = frame.read_int16()?;
        for _ in 0..header_count {
            let peeked = frame.peek_int16()?;
            let name = if HeaderCode::is_coded(peeked) {
                let code = frame.read_int16()?;
                HeaderCode::from_code(code)
                    .ok_or_else(|| {
                        AppError::MalformedProtocol(format!("unknown header code {:#06x}", code))
                    })?
                    .name()
                    .to_string()
            } else {
                frame.read_length_prefixed_text()?
            };
            let value = frame.read_length_prefixed_text()?;
            if name.eq_ignore_ascii_case("content-length") {
                let parsed = value.trim().parse::<u64>().map_err(|_| {
                    AppError::MalformedProtocol(format!("invalid content-length: {}", value))
                })?;
                request.content_length = Some(parsed);
            }
            request.headers.push((name, value));
        }

        loop {
            let code = frame.read_byte()?;
            if code == ATTRIBUTES_DONE {
                break;
            }
            let attribute = AttributeCode::from_code(code).ok_or_else(|| {
                AppError::MalformedProtocol(format!("unknown attribute code {}", code))
            })?;
            match attribute {
                AttributeCode::Context => request.context_path = frame.read_length_prefixed_text()?,
                AttributeCode::ServletPath => {
                    request.route_path = frame.read_length_prefixed_text()?
                }
                AttributeCode::RemoteUser => {
                    request.remote_user = Some(frame.read_length_prefixed_text()?)
                }
                AttributeCode::AuthType => {
                    request.auth_type = Some(frame.read_length_prefixed_text()?)
                }
                AttributeCode::QueryString => {
                    let raw = frame.read_length_prefixed_text()?;
                    request.set_query_string(raw);
                }
                AttributeCode::Route => {
                    request.instance_route = Some(frame.read_length_prefixed_text()?)
                }
                AttributeCode::SslCert => {
                    // Raw certificate bytes; extraction is deferred.
                    request.ssl_cert = read_bytes_field(frame)?;
                }
                AttributeCode::SslCipher => {
                    request.ssl_cipher = Some(frame.read_length_prefixed_text()?)
                }
                AttributeCode::SslSession => {
                    request.ssl_session = Some(frame.read_length_prefixed_text()?)
                }
                AttributeCode::SslKeySize => {
                    request.ssl_key_size = Some(frame.read_int16()?);
                }
                AttributeCode::ReqAttribute => {
                    let name = frame.read_length_prefixed_text()?;
                    let value = frame.read_length_prefixed_text()?;
                    if name == REMOTE_PORT_ATTRIBUTE {
                        // Private convention recovering what the base
                        // protocol does not carry.
                        request.remote_port = value.trim().parse().ok();
                    } else {
                        request.attributes.push((name, value));
                    }
                }
                AttributeCode::Secret => {
                    request.secret = Some(frame.read_length_prefixed_text()?)
                }
                AttributeCode::StoredMethod => {
                    request.stored_method = Some(frame.read_length_prefixed_text()?)
                }
            }
        }

        if request.method.is_empty() {
            match request.stored_method.clone() {
                Some(stored) if !stored.is_empty() => request.method = stored,
                _ => {
                    return Err(AppError::MalformedProtocol(
                        "stored-method escape without a stored method attribute".to_string(),
                    ))
                }
            }
        }

        extract_uri_session_marker(&mut uri, request);
        normalize_absolute_uri(&mut uri, request);
        request.uri = uri;
        apply_virtual_host(request);

        if enforce_secure {
            request.secure = true;
        }
        request.extract_session_cookie();

        trace!(
            method = %request.method,
            uri = %request.uri,
            headers = request.headers.len(),
            "forward request parsed"
        );
        Ok(())
    }
}

fn read_bytes_field(frame: &mut Frame) -> Result<Option<Vec<u8>>, FrameError> {
    let declared = frame.read_int16()?;
    if declared == ABSENT_LENGTH {
        return Ok(None);
    }
    let data = frame.read_slice(declared as usize)?.to_vec();
    frame.read_byte()?; // terminator
    Ok(Some(data))
}

/// Pulls an embedded `;jsessionid=` marker out of the URI.
fn extract_uri_session_marker(uri: &mut String, request: &mut AjpRequest) {
    let Some(start) = uri.find(SESSION_URI_MARKER) else {
        return;
    };
    let rest = &uri[start + SESSION_URI_MARKER.len()..];
    let id_end = rest.find(';').unwrap_or(rest.len());
    request.requested_session_id = Some(rest[..id_end].to_string());
    let tail = rest[id_end..].to_string();
    uri.truncate(start);
    uri.push_str(&tail);
}

/// Strips a redundant absolute-form prefix: `scheme://host[:port]/path`
/// becomes `/path`, with the Host header rewritten to match.
fn normalize_absolute_uri(uri: &mut String, request: &mut AjpRequest) {
    for scheme in ["http://", "https://"] {
        let Some(rest) = uri.strip_prefix(scheme) else {
            continue;
        };
        let (authority, path) = match rest.find('/') {
            Some(slash) => (rest[..slash].to_string(), rest[slash..].to_string()),
            None => (rest.to_string(), "/".to_string()),
        };
        *uri = path;
        if let Some(host) = request
            .headers
            .iter_mut()
            .find(|(name, _)| name.eq_ignore_ascii_case("host"))
        {
            host.1 = authority;
        } else {
            request.headers.push(("host".to_string(), authority));
        }
        return;
    }
}

/// Derives the effective virtual host from the Host header when present;
/// otherwise the already-parsed server name/port stand (HTTP/1.0
/// behavior).
fn apply_virtual_host(request: &mut AjpRequest) {
    let Some(host) = request.header("host").map(str::to_string) else {
        return;
    };
    let default_port = if request.secure { 443 } else { 80 };
    let (name, port) = match host.rsplit_once(':') {
        Some((name, port_str))
            if !port_str.is_empty() && port_str.bytes().all(|b| b.is_ascii_digit()) =>
        {
            (name.to_string(), port_str.parse().unwrap_or(default_port))
        }
        _ => (host, default_port),
    };
    request.server_name = name.trim_start_matches('[').trim_end_matches(']').to_string();
    request.server_port = port;
}
