//! HTTP/1.1 message head parsing.
//!
//! Parses a request line or status line plus the header block into a
//! [`MessageHead`]. The request target becomes `:path`, the method `:method`,
//! the `Host` header `:authority` and the status code `:status`, so decoded
//! heads line up with HTTP/2 header blocks.

use crate::headers::{AUTHORITY, HeaderMap, METHOD, PATH, STATUS};

/// Default limit for a message head (start line + headers).
pub const DEFAULT_MAX_HEAD_BYTES: usize = 64 * 1024;

/// Default limit for the number of header lines in one head.
pub const DEFAULT_MAX_HEADERS: usize = 128;

/// Limits applied while parsing a message head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseLimits {
    max_head_bytes: usize,
    max_headers: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_head_bytes: DEFAULT_MAX_HEAD_BYTES,
            max_headers: DEFAULT_MAX_HEADERS,
        }
    }
}

impl ParseLimits {
    /// Create limits with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum head size in bytes.
    #[must_use]
    pub fn with_max_head_bytes(mut self, size: usize) -> Self {
        self.max_head_bytes = size;
        self
    }

    /// Set the maximum number of header lines.
    #[must_use]
    pub fn with_max_headers(mut self, count: usize) -> Self {
        self.max_headers = count;
        self
    }

    /// Returns the maximum head size in bytes.
    #[must_use]
    pub fn max_head_bytes(&self) -> usize {
        self.max_head_bytes
    }

    /// Returns the maximum number of header lines.
    #[must_use]
    pub fn max_headers(&self) -> usize {
        self.max_headers
    }
}

/// How the body following a head is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    /// No body follows.
    None,
    /// Exactly this many bytes follow.
    ContentLength(usize),
    /// Chunked transfer encoding.
    Chunked,
    /// Body runs until the peer closes (responses only).
    UntilClose,
    /// Both Content-Length and chunked, or disagreeing Content-Length values.
    Conflicting,
}

/// A parsed message head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHead {
    /// Pseudo headers followed by regular headers.
    pub headers: HeaderMap,
    /// Body delimitation derived from the headers.
    pub body_length: BodyLength,
}

/// Result of an attempt to parse a head from a partial buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStatus<T> {
    /// A value was parsed from the first `consumed` bytes.
    Complete {
        /// The parsed value.
        value: T,
        /// Number of bytes the value occupied.
        consumed: usize,
    },
    /// More bytes are needed.
    Incomplete,
}

/// Errors produced while parsing a head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The head exceeds the configured limit.
    HeadTooLarge {
        /// Bytes buffered so far.
        size: usize,
        /// The configured maximum.
        max: usize,
    },
    /// Too many header lines.
    TooManyHeaders {
        /// The configured maximum.
        max: usize,
    },
    /// Malformed request or status line.
    InvalidStartLine(&'static str),
    /// Malformed header line.
    InvalidHeader(&'static str),
    /// Content-Length is not a decimal number.
    InvalidContentLength,
    /// Neither HTTP/1.0 nor HTTP/1.1.
    UnsupportedVersion,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HeadTooLarge { size, max } => {
                write!(f, "message head too large: {size} bytes exceeds limit of {max}")
            }
            Self::TooManyHeaders { max } => write!(f, "more than {max} header lines"),
            Self::InvalidStartLine(detail) => write!(f, "invalid start line: {detail}"),
            Self::InvalidHeader(detail) => write!(f, "invalid header: {detail}"),
            Self::InvalidContentLength => write!(f, "invalid content-length value"),
            Self::UnsupportedVersion => write!(f, "unsupported HTTP version"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Parse a request head (`METHOD target HTTP/1.x` + headers).
pub fn parse_request_head(
    buffer: &[u8],
    limits: &ParseLimits,
) -> Result<ParseStatus<MessageHead>, ParseError> {
    let Some((head, consumed)) = split_head(buffer, limits)? else {
        return Ok(ParseStatus::Incomplete);
    };
    let mut lines = head.split(|&b| b == b'\n').map(trim_cr);
    let start = lines.next().unwrap_or_default();

    let mut parts = start.split(|&b| b == b' ').filter(|p| !p.is_empty());
    let method = parts
        .next()
        .ok_or(ParseError::InvalidStartLine("missing method"))?;
    let target = parts
        .next()
        .ok_or(ParseError::InvalidStartLine("missing request target"))?;
    let version = parts
        .next()
        .ok_or(ParseError::InvalidStartLine("missing version"))?;
    check_version(version)?;
    if !method.iter().all(u8::is_ascii_alphabetic) {
        return Err(ParseError::InvalidStartLine("method must be alphabetic"));
    }

    let mut headers = HeaderMap::new();
    headers.add(METHOD, lossy(method));
    headers.add(PATH, lossy(target));
    let regular = parse_header_lines(lines, limits)?;
    for (name, value) in regular.iter() {
        if name == "host" {
            headers.add(AUTHORITY, value);
        }
    }
    for (name, value) in regular.iter().filter(|(n, _)| *n != "host") {
        headers.add(name, value);
    }

    let body_length = match framing(&regular)? {
        BodyLength::UntilClose => BodyLength::None,
        other => other,
    };

    Ok(ParseStatus::Complete {
        value: MessageHead {
            headers,
            body_length,
        },
        consumed,
    })
}

/// Parse a response head (`HTTP/1.x status reason` + headers).
///
/// `head_request` must be true when the response answers a HEAD request,
/// in which case no body follows regardless of the framing headers.
pub fn parse_response_head(
    buffer: &[u8],
    limits: &ParseLimits,
    head_request: bool,
) -> Result<ParseStatus<MessageHead>, ParseError> {
    let Some((head, consumed)) = split_head(buffer, limits)? else {
        return Ok(ParseStatus::Incomplete);
    };
    let mut lines = head.split(|&b| b == b'\n').map(trim_cr);
    let start = lines.next().unwrap_or_default();

    let mut parts = start.splitn(3, |&b| b == b' ');
    let version = parts
        .next()
        .ok_or(ParseError::InvalidStartLine("missing version"))?;
    check_version(version)?;
    let code = parts
        .next()
        .filter(|c| c.len() == 3 && c.iter().all(u8::is_ascii_digit))
        .ok_or(ParseError::InvalidStartLine("status code must be three digits"))?;
    let status: u16 = lossy(code)
        .parse()
        .map_err(|_| ParseError::InvalidStartLine("status code must be three digits"))?;

    let mut headers = HeaderMap::new();
    headers.add(STATUS, status.to_string());
    let regular = parse_header_lines(lines, limits)?;
    for (name, value) in regular.iter() {
        headers.add(name, value);
    }

    let body_length = if head_request || !status_has_body(status) {
        BodyLength::None
    } else {
        framing(&regular)?
    };

    Ok(ParseStatus::Complete {
        value: MessageHead {
            headers,
            body_length,
        },
        consumed,
    })
}

/// Returns false for status codes that never carry a body.
#[must_use]
pub fn status_has_body(status: u16) -> bool {
    !(100..200).contains(&status) && status != 204 && status != 304
}

/// Locate the end of the head. Returns the head without the final blank line
/// and the number of bytes consumed including it.
fn split_head<'a>(
    buffer: &'a [u8],
    limits: &ParseLimits,
) -> Result<Option<(&'a [u8], usize)>, ParseError> {
    match memchr::memmem::find(buffer, b"\r\n\r\n") {
        Some(end) if end + 4 > limits.max_head_bytes => Err(ParseError::HeadTooLarge {
            size: end + 4,
            max: limits.max_head_bytes,
        }),
        Some(end) => Ok(Some((&buffer[..end], end + 4))),
        None if buffer.len() > limits.max_head_bytes => Err(ParseError::HeadTooLarge {
            size: buffer.len(),
            max: limits.max_head_bytes,
        }),
        None => Ok(None),
    }
}

pub(crate) fn parse_header_lines<'a>(
    lines: impl Iterator<Item = &'a [u8]>,
    limits: &ParseLimits,
) -> Result<HeaderMap, ParseError> {
    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if headers.len() == limits.max_headers {
            return Err(ParseError::TooManyHeaders {
                max: limits.max_headers,
            });
        }
        let (name, value) = parse_header_line(line)?;
        headers.add(name, value);
    }
    Ok(headers)
}

pub(crate) fn parse_header_line(line: &[u8]) -> Result<(String, String), ParseError> {
    if line[0] == b' ' || line[0] == b'\t' {
        return Err(ParseError::InvalidHeader("obsolete line folding"));
    }
    let colon = memchr::memchr(b':', line).ok_or(ParseError::InvalidHeader("missing colon"))?;
    let name = &line[..colon];
    if name.is_empty() || name.iter().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        return Err(ParseError::InvalidHeader("invalid header name"));
    }
    let value = lossy(&line[colon + 1..]);
    Ok((lossy(name), value.trim().to_string()))
}

fn framing(headers: &HeaderMap) -> Result<BodyLength, ParseError> {
    let chunked = headers.get_all("transfer-encoding").any(|v| {
        v.rsplit(',')
            .next()
            .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"))
    });

    let mut content_length: Option<usize> = None;
    for value in headers.get_all("content-length") {
        for item in value.split(',') {
            let parsed = item
                .trim()
                .parse::<usize>()
                .map_err(|_| ParseError::InvalidContentLength)?;
            match content_length {
                Some(existing) if existing != parsed => return Ok(BodyLength::Conflicting),
                _ => content_length = Some(parsed),
            }
        }
    }

    Ok(match (chunked, content_length) {
        (true, Some(_)) => BodyLength::Conflicting,
        (true, None) => BodyLength::Chunked,
        (false, Some(0)) => BodyLength::None,
        (false, Some(len)) => BodyLength::ContentLength(len),
        (false, None) => BodyLength::UntilClose,
    })
}

fn check_version(version: &[u8]) -> Result<(), ParseError> {
    match version {
        b"HTTP/1.1" | b"HTTP/1.0" => Ok(()),
        _ => Err(ParseError::UnsupportedVersion),
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
