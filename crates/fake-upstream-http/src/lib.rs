//! Incremental HTTP/1.1 codec for the fake upstream.
//!
//! This crate is sans-io: it never touches a socket. The fake upstream feeds
//! it bytes read from a connection and writes back the bytes it produces.
//! The same codec runs in the client role inside tests, so a test can speak
//! HTTP/1.1 to the fake upstream over a plain `TcpStream`.
//!
//! # Features
//!
//! - Request and response head parsing into pseudo headers (`:method`,
//!   `:path`, `:authority`, `:status`) shared with HTTP/2
//! - Content-Length, chunked, and read-until-close bodies
//! - Trailers in both directions
//! - Pipelined messages on one connection
//!
//! # Example
//!
//! ```
//! use fake_upstream_http::{BodyConfig, CodecEvent, Http1Codec, ParseLimits};
//!
//! let mut codec = Http1Codec::server(ParseLimits::default(), BodyConfig::default());
//! let events = codec
//!     .feed(b"GET /path HTTP/1.1\r\nHost: example.com\r\n\r\n")
//!     .unwrap();
//! assert!(matches!(events[0], CodecEvent::MessageBegin { end_stream: true, .. }));
//! ```

#![deny(unsafe_code)]

pub mod body;
mod codec;
mod encoder;
mod headers;
mod parser;

pub use body::{
    BodyConfig, BodyDecoder, BodyError, ChunkedDecoder, DEFAULT_MAX_BODY_SIZE, Decoded,
    validate_content_length,
};
pub use codec::{CodecError, CodecEvent, Http1Codec};
pub use encoder::{EncodeError, MessageEncoder, Role, canonical_reason};
pub use headers::{AUTHORITY, HeaderMap, METHOD, PATH, SCHEME, STATUS};
pub use parser::{
    BodyLength, DEFAULT_MAX_HEAD_BYTES, DEFAULT_MAX_HEADERS, MessageHead, ParseError, ParseLimits,
    ParseStatus, parse_request_head, parse_response_head, status_has_body,
};
