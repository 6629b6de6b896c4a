//! HTTP/1.1 message writer.
//!
//! Turns a header block with pseudo headers into a start line plus headers,
//! and picks the body framing: an explicit `content-length` is honoured,
//! otherwise a message that does not end with its headers is sent chunked so
//! that data and trailers can follow in any number of pieces. Responses whose
//! status forbids a body (1xx, 204, 304) never get framing; bytes written to
//! them are dropped.

use crate::headers::{AUTHORITY, HeaderMap, METHOD, PATH, STATUS};
use crate::parser::status_has_body;

/// Which side of the exchange this writer produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Writes responses (and decodes requests).
    Server,
    /// Writes requests (and decodes responses).
    Client,
}

/// Errors produced while encoding a head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// A required pseudo header is absent.
    MissingPseudoHeader(&'static str),
    /// `:status` is not a three digit code.
    InvalidStatus(String),
    /// Data or trailers were written with no message in progress.
    NoMessageInProgress,
    /// A new head was written while the previous body was still open.
    MessageInProgress,
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingPseudoHeader(name) => write!(f, "missing pseudo header {name}"),
            Self::InvalidStatus(value) => write!(f, "invalid :status value {value:?}"),
            Self::NoMessageInProgress => write!(f, "no message in progress"),
            Self::MessageInProgress => write!(f, "previous message body still open"),
        }
    }
}

impl std::error::Error for EncodeError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Length,
    Chunked,
    /// The status forbids a body; the message stays open until ended.
    Bodiless,
}

/// Writes one outbound message at a time.
#[derive(Debug)]
pub struct MessageEncoder {
    role: Role,
    buffer: Vec<u8>,
    framing: Option<Framing>,
}

impl MessageEncoder {
    /// Create a new writer for `role`.
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            role,
            buffer: Vec::with_capacity(4096),
            framing: None,
        }
    }

    /// Returns true while a message body is still open.
    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.framing.is_some()
    }

    /// Encode a message head.
    pub fn encode_headers(
        &mut self,
        headers: &HeaderMap,
        end_stream: bool,
    ) -> Result<Vec<u8>, EncodeError> {
        if matches!(self.framing, Some(Framing::Length | Framing::Chunked)) {
            return Err(EncodeError::MessageInProgress);
        }
        self.buffer.clear();

        let body_allowed = match self.role {
            Role::Server => {
                let status = self.write_status_line(headers)?;
                status_has_body(status)
            }
            Role::Client => {
                self.write_request_line(headers)?;
                true
            }
        };

        for (name, value) in headers.regular() {
            if self.role == Role::Client && name == "host" && headers.contains(AUTHORITY) {
                continue;
            }
            self.write_header(name, value);
        }

        let has_length = headers.contains("content-length");
        let has_chunked = headers
            .get_all("transfer-encoding")
            .any(|v| v.to_ascii_lowercase().contains("chunked"));

        if end_stream {
            if body_allowed && !has_length && !has_chunked && self.needs_empty_length(headers) {
                self.write_header("content-length", "0");
            }
            self.framing = None;
        } else if !body_allowed {
            self.framing = Some(Framing::Bodiless);
        } else if has_length {
            self.framing = Some(Framing::Length);
        } else {
            if !has_chunked {
                self.write_header("transfer-encoding", "chunked");
            }
            self.framing = Some(Framing::Chunked);
        }

        self.buffer.extend_from_slice(b"\r\n");
        Ok(self.take_buffer())
    }

    /// Encode body bytes for the message in progress.
    pub fn encode_data(&mut self, data: &[u8], end_stream: bool) -> Result<Vec<u8>, EncodeError> {
        let framing = self.framing.ok_or(EncodeError::NoMessageInProgress)?;
        let mut out = match framing {
            Framing::Length => data.to_vec(),
            Framing::Bodiless => Vec::new(),
            Framing::Chunked if data.is_empty() => Vec::new(),
            Framing::Chunked => encode_chunk(data),
        };
        if end_stream {
            if framing == Framing::Chunked {
                out.extend_from_slice(b"0\r\n\r\n");
            }
            self.framing = None;
        }
        Ok(out)
    }

    /// Encode trailers, ending the message in progress.
    ///
    /// Only chunked messages carry trailers; any other message is simply
    /// ended and the trailers are dropped.
    pub fn encode_trailers(&mut self, trailers: &HeaderMap) -> Result<Vec<u8>, EncodeError> {
        let framing = self
            .framing
            .take()
            .ok_or(EncodeError::NoMessageInProgress)?;
        if framing != Framing::Chunked {
            return Ok(Vec::new());
        }
        self.buffer.clear();
        self.buffer.extend_from_slice(b"0\r\n");
        for (name, value) in trailers.regular() {
            self.write_header(name, value);
        }
        self.buffer.extend_from_slice(b"\r\n");
        Ok(self.take_buffer())
    }

    fn needs_empty_length(&self, headers: &HeaderMap) -> bool {
        match self.role {
            Role::Server => true,
            Role::Client => !matches!(
                headers.get(METHOD),
                Some("GET" | "HEAD" | "DELETE" | "OPTIONS" | "TRACE" | "CONNECT")
            ),
        }
    }

    fn write_status_line(&mut self, headers: &HeaderMap) -> Result<u16, EncodeError> {
        let raw = headers
            .get(STATUS)
            .ok_or(EncodeError::MissingPseudoHeader(STATUS))?;
        let code = headers
            .status()
            .filter(|c| (100..1000).contains(c))
            .ok_or_else(|| EncodeError::InvalidStatus(raw.to_string()))?;

        self.buffer.extend_from_slice(b"HTTP/1.1 ");
        self.buffer.extend_from_slice(code.to_string().as_bytes());
        self.buffer.extend_from_slice(b" ");
        self.buffer
            .extend_from_slice(canonical_reason(code).as_bytes());
        self.buffer.extend_from_slice(b"\r\n");
        Ok(code)
    }

    fn write_request_line(&mut self, headers: &HeaderMap) -> Result<(), EncodeError> {
        let method = headers
            .get(METHOD)
            .ok_or(EncodeError::MissingPseudoHeader(METHOD))?;
        let path = headers
            .get(PATH)
            .ok_or(EncodeError::MissingPseudoHeader(PATH))?;

        self.buffer.extend_from_slice(method.as_bytes());
        self.buffer.extend_from_slice(b" ");
        self.buffer.extend_from_slice(path.as_bytes());
        self.buffer.extend_from_slice(b" HTTP/1.1\r\n");
        if let Some(authority) = headers.get(AUTHORITY) {
            self.write_header("host", authority);
        }
        Ok(())
    }

    fn write_header(&mut self, name: &str, value: &str) {
        self.buffer.extend_from_slice(name.as_bytes());
        self.buffer.extend_from_slice(b": ");
        self.buffer.extend_from_slice(value.as_bytes());
        self.buffer.extend_from_slice(b"\r\n");
    }

    fn take_buffer(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        std::mem::swap(&mut out, &mut self.buffer);
        self.buffer = Vec::with_capacity(out.capacity());
        out
    }
}

fn encode_chunk(chunk: &[u8]) -> Vec<u8> {
    let size = format!("{:x}", chunk.len());
    let mut out = Vec::with_capacity(size.len() + 2 + chunk.len() + 2);
    out.extend_from_slice(size.as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(chunk);
    out.extend_from_slice(b"\r\n");
    out
}

/// Reason phrase for common status codes.
#[must_use]
pub fn canonical_reason(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).into_owned()
    }

    #[test]
    fn response_with_content_length_passes_body_through() {
        let mut encoder = MessageEncoder::new(Role::Server);
        let head = encoder
            .encode_headers(
                &HeaderMap::from([(":status", "200"), ("content-length", "5")]),
                false,
            )
            .unwrap();
        assert_eq!(text(&head), "HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\n");

        let body = encoder.encode_data(b"hello", true).unwrap();
        assert_eq!(body, b"hello");
        assert!(!encoder.in_progress());
    }

    #[test]
    fn response_without_length_is_chunked() {
        let mut encoder = MessageEncoder::new(Role::Server);
        let head = encoder
            .encode_headers(&HeaderMap::from([(":status", "200")]), false)
            .unwrap();
        assert_eq!(
            text(&head),
            "HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n"
        );
        assert_eq!(encoder.encode_data(b"hello", false).unwrap(), b"5\r\nhello\r\n");

        let trailers = encoder
            .encode_trailers(&HeaderMap::from([("grpc-status", "0")]))
            .unwrap();
        assert_eq!(text(&trailers), "0\r\ngrpc-status: 0\r\n\r\n");
    }

    #[test]
    fn chunked_end_stream_writes_last_chunk() {
        let mut encoder = MessageEncoder::new(Role::Server);
        encoder
            .encode_headers(&HeaderMap::from([(":status", "200")]), false)
            .unwrap();
        assert_eq!(
            encoder.encode_data(b"abc", true).unwrap(),
            b"3\r\nabc\r\n0\r\n\r\n"
        );
    }

    #[test]
    fn header_only_response_gets_empty_length() {
        let mut encoder = MessageEncoder::new(Role::Server);
        let head = encoder
            .encode_headers(&HeaderMap::from([(":status", "503")]), true)
            .unwrap();
        assert_eq!(
            text(&head),
            "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\n\r\n"
        );

        let head = encoder
            .encode_headers(&HeaderMap::from([(":status", "204")]), true)
            .unwrap();
        assert_eq!(text(&head), "HTTP/1.1 204 No Content\r\n\r\n");
    }

    #[test]
    fn bodiless_status_never_goes_chunked() {
        let mut encoder = MessageEncoder::new(Role::Server);
        let head = encoder
            .encode_headers(&HeaderMap::from([(":status", "304")]), false)
            .unwrap();
        assert_eq!(text(&head), "HTTP/1.1 304 Not Modified\r\n\r\n");
        assert!(encoder.in_progress());
        assert_eq!(encoder.encode_data(b"ignored", false).unwrap(), b"");
        assert_eq!(
            encoder
                .encode_trailers(&HeaderMap::from([("x-t", "1")]))
                .unwrap(),
            b""
        );
        assert!(!encoder.in_progress());
    }

    #[test]
    fn informational_head_can_be_followed_by_the_final_one() {
        let mut encoder = MessageEncoder::new(Role::Server);
        encoder
            .encode_headers(&HeaderMap::from([(":status", "100")]), false)
            .unwrap();
        let head = encoder
            .encode_headers(&HeaderMap::from([(":status", "200")]), true)
            .unwrap();
        assert_eq!(text(&head), "HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n");
    }

    #[test]
    fn new_head_while_body_open_is_an_error() {
        let mut encoder = MessageEncoder::new(Role::Server);
        encoder
            .encode_headers(&HeaderMap::from([(":status", "200")]), false)
            .unwrap();
        assert_eq!(
            encoder.encode_headers(&HeaderMap::from([(":status", "204")]), true),
            Err(EncodeError::MessageInProgress)
        );
        assert_eq!(encoder.encode_data(b"rest", true).unwrap(), b"4\r\nrest\r\n0\r\n\r\n");
    }

    #[test]
    fn request_line_and_host_from_pseudo_headers() {
        let mut encoder = MessageEncoder::new(Role::Client);
        let head = encoder
            .encode_headers(
                &HeaderMap::from([
                    (":method", "GET"),
                    (":path", "/test"),
                    (":authority", "host"),
                    ("x-lyft-user-id", "123"),
                ]),
                true,
            )
            .unwrap();
        assert_eq!(
            text(&head),
            "GET /test HTTP/1.1\r\nhost: host\r\nx-lyft-user-id: 123\r\n\r\n"
        );
    }

    #[test]
    fn missing_or_bad_status_is_an_error() {
        let mut encoder = MessageEncoder::new(Role::Server);
        assert_eq!(
            encoder.encode_headers(&HeaderMap::new(), true),
            Err(EncodeError::MissingPseudoHeader(":status"))
        );
        assert_eq!(
            encoder.encode_headers(&HeaderMap::from([(":status", "ok")]), true),
            Err(EncodeError::InvalidStatus("ok".to_string()))
        );
        assert_eq!(
            encoder.encode_data(b"x", true),
            Err(EncodeError::NoMessageInProgress)
        );
    }
}
