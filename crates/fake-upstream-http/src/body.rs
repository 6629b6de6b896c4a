//! Incremental HTTP/1.1 body decoding.
//!
//! Bodies arrive in arbitrary socket-sized pieces, so every decoder here
//! consumes whatever prefix of its input it can and reports how many bytes it
//! used. Decoded bytes are handed out as soon as they are available instead of
//! after the whole body has been buffered.
//!
//! Supported framings:
//! - Content-Length with a size limit
//! - Chunked transfer encoding, including trailers
//! - Read-until-close (responses without framing headers)
//!
//! # Example
//!
//! ```
//! use fake_upstream_http::body::{BodyConfig, BodyDecoder};
//! use fake_upstream_http::BodyLength;
//!
//! let config = BodyConfig::default();
//! let mut decoder = BodyDecoder::new(BodyLength::Chunked, &config).unwrap().unwrap();
//!
//! let first = decoder.decode(b"5\r\nHel").unwrap();
//! assert_eq!(first.data, b"Hel");
//! let rest = decoder.decode(&b"5\r\nHel"[first.consumed..]).unwrap();
//! assert!(rest.data.is_empty());
//! ```

use crate::headers::HeaderMap;
use crate::parser::{BodyLength, ParseError, ParseLimits, parse_header_line};

/// Default maximum body size (16MB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Configuration for body reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyConfig {
    /// Maximum body size in bytes.
    max_size: usize,
    /// Maximum size of the chunked trailer section.
    max_trailer_bytes: usize,
}

impl Default for BodyConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_BODY_SIZE,
            max_trailer_bytes: 16 * 1024,
        }
    }
}

impl BodyConfig {
    /// Create a new body configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum body size.
    #[must_use]
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set the maximum trailer section size.
    #[must_use]
    pub fn with_max_trailer_bytes(mut self, size: usize) -> Self {
        self.max_trailer_bytes = size;
        self
    }

    /// Returns the maximum body size.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Returns the maximum trailer section size.
    #[must_use]
    pub fn max_trailer_bytes(&self) -> usize {
        self.max_trailer_bytes
    }
}

/// Error types for body reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyError {
    /// Body exceeds maximum allowed size.
    TooLarge {
        /// The declared or actual size.
        size: usize,
        /// The maximum allowed size.
        max: usize,
    },
    /// Invalid chunked encoding.
    InvalidChunkedEncoding {
        /// Description of the error.
        detail: &'static str,
    },
    /// The framing headers contradict each other.
    ConflictingLength,
    /// The connection ended before the body did.
    UnexpectedEof,
    /// A trailer line failed to parse.
    Parse(ParseError),
}

impl std::fmt::Display for BodyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooLarge { size, max } => {
                write!(f, "body too large: {size} bytes exceeds limit of {max}")
            }
            Self::InvalidChunkedEncoding { detail } => {
                write!(f, "invalid chunked encoding: {detail}")
            }
            Self::ConflictingLength => write!(f, "conflicting body length indicators"),
            Self::UnexpectedEof => write!(f, "unexpected end of body"),
            Self::Parse(e) => write!(f, "parse error: {e}"),
        }
    }
}

impl std::error::Error for BodyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parse(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ParseError> for BodyError {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

/// Output of one [`BodyDecoder::decode`] call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// Body bytes decoded from the input.
    pub data: Vec<u8>,
    /// Trailers, present only when the body completed with a non-empty trailer section.
    pub trailers: Option<HeaderMap>,
    /// True once the body is complete.
    pub complete: bool,
    /// Number of input bytes consumed.
    pub consumed: usize,
}

// ============================================================================
// Body Decoder
// ============================================================================

/// Incremental decoder for one message body.
#[derive(Debug)]
pub enum BodyDecoder {
    /// Content-Length delimited body.
    ContentLength {
        /// Bytes still expected.
        remaining: usize,
    },
    /// Chunked body.
    Chunked(ChunkedDecoder),
    /// Body delimited by connection close.
    UntilClose {
        /// Bytes received so far.
        received: usize,
        /// Size limit.
        max: usize,
    },
}

impl BodyDecoder {
    /// Create a decoder for the given framing.
    ///
    /// Returns `Ok(None)` when no body follows.
    ///
    /// # Errors
    ///
    /// Returns `BodyError::TooLarge` if a declared length exceeds the limit and
    /// `BodyError::ConflictingLength` for contradicting framing headers.
    pub fn new(body_length: BodyLength, config: &BodyConfig) -> Result<Option<Self>, BodyError> {
        match body_length {
            BodyLength::None | BodyLength::ContentLength(0) => Ok(None),
            BodyLength::ContentLength(len) => {
                validate_content_length(len, config)?;
                Ok(Some(Self::ContentLength { remaining: len }))
            }
            BodyLength::Chunked => Ok(Some(Self::Chunked(ChunkedDecoder::new(config)))),
            BodyLength::UntilClose => Ok(Some(Self::UntilClose {
                received: 0,
                max: config.max_size,
            })),
            BodyLength::Conflicting => Err(BodyError::ConflictingLength),
        }
    }

    /// Decode as much of `input` as possible.
    pub fn decode(&mut self, input: &[u8]) -> Result<Decoded, BodyError> {
        match self {
            Self::ContentLength { remaining } => {
                let take = input.len().min(*remaining);
                *remaining -= take;
                Ok(Decoded {
                    data: input[..take].to_vec(),
                    trailers: None,
                    complete: *remaining == 0,
                    consumed: take,
                })
            }
            Self::Chunked(chunked) => chunked.decode(input),
            Self::UntilClose { received, max } => {
                let total = received.saturating_add(input.len());
                if total > *max {
                    return Err(BodyError::TooLarge {
                        size: total,
                        max: *max,
                    });
                }
                *received = total;
                Ok(Decoded {
                    data: input.to_vec(),
                    trailers: None,
                    complete: false,
                    consumed: input.len(),
                })
            }
        }
    }

    /// Signal that the peer closed the connection.
    ///
    /// Read-until-close bodies complete here; every other framing is truncated.
    pub fn finish(&mut self) -> Result<(), BodyError> {
        match self {
            Self::UntilClose { .. } => Ok(()),
            _ => Err(BodyError::UnexpectedEof),
        }
    }
}

// ============================================================================
// Chunked Transfer Encoding
// ============================================================================

/// State machine for chunked encoding parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedState {
    /// Expecting chunk size line.
    ChunkSize,
    /// Reading chunk data.
    ChunkData { remaining: usize },
    /// Expecting CRLF after chunk data.
    ChunkDataEnd,
    /// Reading trailers (after final chunk).
    Trailers,
    /// Complete.
    Complete,
}

/// Incremental chunked transfer-encoding decoder.
///
/// Chunked encoding format:
/// ```text
/// chunk-size CRLF
/// chunk-data CRLF
/// ...
/// 0 CRLF
/// [trailers] CRLF
/// ```
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkedState,
    total_size: usize,
    trailer_bytes: usize,
    trailers: HeaderMap,
    config: BodyConfig,
}

impl ChunkedDecoder {
    /// Create a new chunked decoder.
    #[must_use]
    pub fn new(config: &BodyConfig) -> Self {
        Self {
            state: ChunkedState::ChunkSize,
            total_size: 0,
            trailer_bytes: 0,
            trailers: HeaderMap::new(),
            config: *config,
        }
    }

    /// Returns true if the terminating chunk and trailers were consumed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state == ChunkedState::Complete
    }

    /// Returns the total decoded body size so far.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Parse a chunk size line, ignoring chunk extensions.
    fn parse_chunk_size(line: &[u8]) -> Result<usize, BodyError> {
        let size = match memchr::memchr(b';', line) {
            Some(semi) => &line[..semi],
            None => line,
        };
        let size = std::str::from_utf8(size).map_err(|_| BodyError::InvalidChunkedEncoding {
            detail: "invalid UTF-8 in chunk size",
        })?;
        usize::from_str_radix(size.trim(), 16).map_err(|_| BodyError::InvalidChunkedEncoding {
            detail: "invalid hex chunk size",
        })
    }

    /// Decode as much of `input` as possible.
    pub fn decode(&mut self, input: &[u8]) -> Result<Decoded, BodyError> {
        let mut out = Decoded::default();
        let mut position = 0;

        loop {
            let remaining = &input[position..];
            match self.state {
                ChunkedState::ChunkSize => {
                    let Some(line_end) = memchr::memmem::find(remaining, b"\r\n") else {
                        break;
                    };
                    let size = Self::parse_chunk_size(&remaining[..line_end])?;
                    position += line_end + 2;

                    let new_total = self.total_size.saturating_add(size);
                    if new_total > self.config.max_size {
                        return Err(BodyError::TooLarge {
                            size: new_total,
                            max: self.config.max_size,
                        });
                    }

                    self.state = if size == 0 {
                        ChunkedState::Trailers
                    } else {
                        ChunkedState::ChunkData { remaining: size }
                    };
                }
                ChunkedState::ChunkData { remaining: left } => {
                    if remaining.is_empty() {
                        break;
                    }
                    let take = remaining.len().min(left);
                    out.data.extend_from_slice(&remaining[..take]);
                    position += take;
                    self.total_size += take;
                    self.state = if take == left {
                        ChunkedState::ChunkDataEnd
                    } else {
                        ChunkedState::ChunkData {
                            remaining: left - take,
                        }
                    };
                }
                ChunkedState::ChunkDataEnd => {
                    if remaining.len() < 2 {
                        break;
                    }
                    if &remaining[..2] != b"\r\n" {
                        return Err(BodyError::InvalidChunkedEncoding {
                            detail: "expected CRLF after chunk data",
                        });
                    }
                    position += 2;
                    self.state = ChunkedState::ChunkSize;
                }
                ChunkedState::Trailers => {
                    let Some(line_end) = memchr::memmem::find(remaining, b"\r\n") else {
                        if self.trailer_bytes + remaining.len() > self.config.max_trailer_bytes {
                            return Err(BodyError::TooLarge {
                                size: self.trailer_bytes + remaining.len(),
                                max: self.config.max_trailer_bytes,
                            });
                        }
                        break;
                    };
                    position += line_end + 2;
                    if line_end == 0 {
                        self.state = ChunkedState::Complete;
                        continue;
                    }
                    self.trailer_bytes += line_end + 2;
                    let (name, value) = parse_header_line(&remaining[..line_end])?;
                    self.trailers.add(name, value);
                    if self.trailers.len() > ParseLimits::default().max_headers() {
                        return Err(BodyError::Parse(ParseError::TooManyHeaders {
                            max: ParseLimits::default().max_headers(),
                        }));
                    }
                }
                ChunkedState::Complete => {
                    out.complete = true;
                    if !self.trailers.is_empty() {
                        out.trailers = Some(std::mem::take(&mut self.trailers));
                    }
                    break;
                }
            }
        }

        out.consumed = position;
        Ok(out)
    }
}

/// Validates body size against Content-Length header before reading.
///
/// # Errors
///
/// Returns `BodyError::TooLarge` if the content length exceeds the limit.
pub fn validate_content_length(
    content_length: usize,
    config: &BodyConfig,
) -> Result<(), BodyError> {
    if content_length > config.max_size {
        return Err(BodyError::TooLarge {
            size: content_length,
            max: config.max_size,
        });
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
