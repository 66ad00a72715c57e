//! The per-transaction response object and its commit serialization.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};

use crate::network::{Action, SocketOutputBuffer, TxnShared};
use crate::protocol::{Frame, FrameError, MessageType, TextEncoding, FRAME_HEADER_LEN};
use crate::{AppError, AppResult};

/// Reason phrase for the common status codes; empty for the rest, the
/// wire format allows an empty message.
pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "",
    }
}

#[derive(Debug, Clone)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub max_age: Option<i64>,
    pub http_only: bool,
    pub secure: bool,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Cookie {
        Cookie {
            name: name.into(),
            value: value.into(),
            path: None,
            domain: None,
            max_age: None,
            http_only: false,
            secure: false,
        }
    }

    /// A session cookie scoped to the given path.
    pub fn session(id: impl Into<String>, path: impl Into<String>) -> Cookie {
        let mut cookie = Cookie::new(crate::request::SESSION_COOKIE_NAME, id);
        cookie.path = Some(path.into());
        cookie.http_only = true;
        cookie
    }

    fn to_header_value(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if let Some(path) = &self.path {
            out.push_str("; Path=");
            out.push_str(path);
        }
        if let Some(domain) = &self.domain {
            out.push_str("; Domain=");
            out.push_str(domain);
        }
        if let Some(max_age) = self.max_age {
            out.push_str(&format!("; Max-Age={}", max_age));
            let expires = Utc::now() + ChronoDuration::seconds(max_age);
            out.push_str(&format!(
                "; Expires={}",
                expires.format("%a, %d %b %Y %H:%M:%S GMT")
            ));
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        if self.secure {
            out.push_str("; Secure");
        }
        out
    }
}

pub struct AjpResponse {
    status: u16,
    message: Option<String>,
    headers: Vec<(String, String)>,
    cookies: Vec<Cookie>,
    shared: Arc<TxnShared>,
    /// Control/header frame, distinct from the body-chunk frame inside
    /// the output adapter.
    frame: Frame,
    out: SocketOutputBuffer,
    packet_size: usize,
}

impl AjpResponse {
    pub(crate) fn new(
        shared: Arc<TxnShared>,
        packet_size: usize,
        encoding: TextEncoding,
    ) -> AjpResponse {
        let out = SocketOutputBuffer::new(
            shared.channel().clone(),
            shared.committed_flag(),
            packet_size,
            encoding,
        );
        AjpResponse {
            status: 200,
            message: None,
            headers: Vec::new(),
            cookies: Vec::new(),
            shared,
            frame: Frame::new(packet_size, encoding),
            out,
            packet_size,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_committed(&self) -> bool {
        self.shared.is_committed()
    }

    pub fn set_status(&mut self, status: u16) -> AppResult<()> {
        self.mutation_guard("status")?;
        if !(100..=599).contains(&status) {
            return Err(AppError::InvalidValue(format!("status {}", status)));
        }
        self.status = status;
        Ok(())
    }

    pub fn set_message(&mut self, message: impl Into<String>) -> AppResult<()> {
        self.mutation_guard("status message")?;
        self.message = Some(message.into());
        Ok(())
    }

    /// Appends a header. Repeated names are allowed; values may not carry
    /// control characters.
    pub fn add_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> AppResult<()> {
        self.mutation_guard("header")?;
        let name = name.into();
        let value = value.into();
        if value
            .bytes()
            .any(|b| (b <= 31 && b != 9) || b == 127)
        {
            return Err(AppError::InvalidValue(format!(
                "control character in value of header {}",
                name
            )));
        }
        self.headers.push((name, value));
        Ok(())
    }

    /// Replaces every header of the given name with a single value.
    pub fn set_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> AppResult<()> {
        let name = name.into();
        self.mutation_guard("header")?;
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.add_header(name, value)
    }

    pub fn add_cookie(&mut self, cookie: Cookie) -> AppResult<()> {
        self.mutation_guard("cookie")?;
        self.cookies.push(cookie);
        Ok(())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    fn mutation_guard(&self, what: &str) -> AppResult<()> {
        if self.is_committed() {
            return Err(AppError::IllegalState(format!(
                "{} mutation after response commit",
                what
            )));
        }
        Ok(())
    }

    /// Serializes and sends the response headers exactly once. A second
    /// call is a no-op.
    pub async fn commit(&mut self) -> AppResult<()> {
        if self.is_committed() {
            return Ok(());
        }
        self.encode_headers()?;
        self.shared.dispatch(Action::Commit(&self.frame)).await
    }

    /// Writes body bytes, committing the headers first if needed.
    pub async fn write_body(&mut self, data: &[u8]) -> AppResult<usize> {
        self.commit().await?;
        self.out.write(data).await
    }

    /// Commits if needed, then pushes a zero-length body frame so the peer
    /// forwards everything it has buffered to the client.
    pub async fn flush(&mut self) -> AppResult<()> {
        self.commit().await?;
        self.shared.dispatch(Action::ClientFlush).await
    }

    /// Ends the transaction early, keeping the connection reusable.
    pub async fn close(&mut self) -> AppResult<()> {
        self.commit().await?;
        self.shared.dispatch(Action::Close { reuse: true }).await
    }

    /// Builds the send-headers frame: status, message, combined
    /// header+cookie count, then name/value text pairs. Fails before
    /// anything reaches the socket when the result would not fit one
    /// frame.
    fn encode_headers(&mut self) -> AppResult<()> {
        let wire_headers = self.wire_headers();
        let message = self.message.as_deref().unwrap_or("");

        let mut needed = 1 + 2 + (2 + message.len() + 1) + 2;
        for (name, value) in &wire_headers {
            needed += 2 + name.len() + 1 + 2 + value.len() + 1;
        }
        if FRAME_HEADER_LEN + needed > self.packet_size {
            return Err(FrameError::TooLarge {
                len: FRAME_HEADER_LEN + needed,
                max: self.packet_size,
            }
            .into());
        }

        let frame = &mut self.frame;
        frame.reset_for_write();
        frame.append_byte(MessageType::SendHeaders as u8);
        frame.append_int16(self.status);
        frame.append_length_prefixed_text(message);
        frame.append_int16(wire_headers.len() as u16);
        for (name, value) in &wire_headers {
            frame.append_length_prefixed_text(name);
            frame.append_length_prefixed_text(value);
        }
        frame.finalize_write();
        Ok(())
    }

    /// Ordinary headers followed by cookie headers. Cookies beyond the
    /// first sharing one logical name get a numeric suffix on the wire
    /// header name: Set-Cookie, Set-Cookie2, Set-Cookie3, ...
    fn wire_headers(&self) -> Vec<(String, String)> {
        let mut all = self.headers.clone();
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for cookie in &self.cookies {
            let count = counts.entry(cookie.name.as_str()).or_insert(0);
            *count += 1;
            let wire_name = if *count == 1 {
                "Set-Cookie".to_string()
            } else {
                format!("Set-Cookie{}", count)
            };
            all.push((wire_name, cookie.to_header_value()));
        }
        all
    }

    pub(crate) fn recycle(&mut self) {
        self.status = 200;
        self.message = None;
        self.headers.clear();
        self.cookies.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_header_value() {
        let mut cookie = Cookie::new("a", "b");
        cookie.path = Some("/app".to_string());
        cookie.http_only = true;
        let value = cookie.to_header_value();
        assert!(value.starts_with("a=b; Path=/app"));
        assert!(value.ends_with("HttpOnly"));
    }

    #[test]
    fn session_cookie_shape() {
        let cookie = Cookie::session("ABC123", "/");
        assert_eq!(cookie.name, crate::request::SESSION_COOKIE_NAME);
        assert!(cookie.http_only);
    }

    #[test]
    fn status_texts() {
        assert_eq!(status_text(200), "OK");
        assert_eq!(status_text(503), "Service Unavailable");
        assert_eq!(status_text(299), "");
    }
}
