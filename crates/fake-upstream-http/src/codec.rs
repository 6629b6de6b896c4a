//! Sans-io HTTP/1.1 connection codec.
//!
//! [`Http1Codec`] owns one direction of decoding and one of encoding for a
//! connection. Feed it raw bytes as they arrive and it yields
//! [`CodecEvent`]s: the start of a message, body data as soon as it is
//! decoded, and trailers. A server codec decodes requests and encodes
//! responses; a client codec does the reverse.

use std::collections::VecDeque;

use crate::body::{BodyConfig, BodyDecoder, BodyError};
use crate::encoder::{EncodeError, MessageEncoder, Role};
use crate::headers::{HeaderMap, METHOD};
use crate::parser::{
    MessageHead, ParseError, ParseLimits, ParseStatus, parse_request_head, parse_response_head,
};

/// Something the peer sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecEvent {
    /// A new message head. `end_stream` is true when no body follows.
    MessageBegin {
        /// Pseudo and regular headers.
        headers: HeaderMap,
        /// True when the message has no body.
        end_stream: bool,
    },
    /// Decoded body bytes. An empty final chunk carries only `end_stream`.
    Data {
        /// Body bytes.
        data: Vec<u8>,
        /// True when this is the last body piece.
        end_stream: bool,
    },
    /// Trailers; always end the message.
    Trailers(HeaderMap),
}

/// Errors surfaced by the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The message head is malformed.
    Parse(ParseError),
    /// The body is malformed or truncated.
    Body(BodyError),
    /// An outbound message could not be encoded.
    Encode(EncodeError),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(e) => write!(f, "http/1.1 parse error: {e}"),
            Self::Body(e) => write!(f, "http/1.1 body error: {e}"),
            Self::Encode(e) => write!(f, "http/1.1 encode error: {e}"),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parse(e) => Some(e),
            Self::Body(e) => Some(e),
            Self::Encode(e) => Some(e),
        }
    }
}

impl From<ParseError> for CodecError {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

impl From<BodyError> for CodecError {
    fn from(e: BodyError) -> Self {
        Self::Body(e)
    }
}

impl From<EncodeError> for CodecError {
    fn from(e: EncodeError) -> Self {
        Self::Encode(e)
    }
}

/// HTTP/1.1 connection codec.
#[derive(Debug)]
pub struct Http1Codec {
    role: Role,
    limits: ParseLimits,
    body_config: BodyConfig,
    buffer: Vec<u8>,
    body: Option<BodyDecoder>,
    encoder: MessageEncoder,
    /// Methods of requests sent by a client codec, oldest first.
    sent_methods: VecDeque<String>,
}

impl Http1Codec {
    /// Create a codec that decodes requests and encodes responses.
    #[must_use]
    pub fn server(limits: ParseLimits, body_config: BodyConfig) -> Self {
        Self::new(Role::Server, limits, body_config)
    }

    /// Create a codec that encodes requests and decodes responses.
    #[must_use]
    pub fn client(limits: ParseLimits, body_config: BodyConfig) -> Self {
        Self::new(Role::Client, limits, body_config)
    }

    fn new(role: Role, limits: ParseLimits, body_config: BodyConfig) -> Self {
        Self {
            role,
            limits,
            body_config,
            buffer: Vec::new(),
            body: None,
            encoder: MessageEncoder::new(role),
            sent_methods: VecDeque::new(),
        }
    }

    /// Returns the codec role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns true while an inbound message body is only partially decoded.
    #[must_use]
    pub fn message_in_progress(&self) -> bool {
        self.body.is_some()
    }

    /// Feed bytes read from the transport and collect the resulting events.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<CodecEvent>, CodecError> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        loop {
            if let Some(body) = self.body.as_mut() {
                let decoded = body.decode(&self.buffer)?;
                self.buffer.drain(..decoded.consumed);
                let complete = decoded.complete;
                match decoded.trailers {
                    Some(trailers) => {
                        if !decoded.data.is_empty() {
                            events.push(CodecEvent::Data {
                                data: decoded.data,
                                end_stream: false,
                            });
                        }
                        events.push(CodecEvent::Trailers(trailers));
                    }
                    None if !decoded.data.is_empty() || complete => {
                        events.push(CodecEvent::Data {
                            data: decoded.data,
                            end_stream: complete,
                        });
                    }
                    None => {}
                }
                if !complete {
                    break;
                }
                self.body = None;
            }

            let Some(head) = self.parse_head()? else {
                break;
            };
            self.body = BodyDecoder::new(head.body_length, &self.body_config)?;
            events.push(CodecEvent::MessageBegin {
                headers: head.headers,
                end_stream: self.body.is_none(),
            });
        }

        Ok(events)
    }

    /// Tell the codec that the peer closed the connection.
    ///
    /// Completes a read-until-close body; a partially received message of any
    /// other framing is an error.
    pub fn finish(&mut self) -> Result<Vec<CodecEvent>, CodecError> {
        match self.body.take() {
            Some(mut body) => {
                body.finish()?;
                Ok(vec![CodecEvent::Data {
                    data: Vec::new(),
                    end_stream: true,
                }])
            }
            None if self.buffer.is_empty() => Ok(Vec::new()),
            None => Err(CodecError::Body(BodyError::UnexpectedEof)),
        }
    }

    /// Encode an outbound message head.
    pub fn encode_headers(
        &mut self,
        headers: &HeaderMap,
        end_stream: bool,
    ) -> Result<Vec<u8>, CodecError> {
        let bytes = self.encoder.encode_headers(headers, end_stream)?;
        if self.role == Role::Client {
            self.sent_methods
                .push_back(headers.get(METHOD).unwrap_or_default().to_string());
        }
        Ok(bytes)
    }

    /// Encode outbound body bytes.
    pub fn encode_data(&mut self, data: &[u8], end_stream: bool) -> Result<Vec<u8>, CodecError> {
        Ok(self.encoder.encode_data(data, end_stream)?)
    }

    /// Encode outbound trailers.
    pub fn encode_trailers(&mut self, trailers: &HeaderMap) -> Result<Vec<u8>, CodecError> {
        Ok(self.encoder.encode_trailers(trailers)?)
    }

    fn parse_head(&mut self) -> Result<Option<MessageHead>, CodecError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let status = match self.role {
            Role::Server => parse_request_head(&self.buffer, &self.limits)?,
            Role::Client => {
                let head_request = self.sent_methods.front().is_some_and(|m| m == "HEAD");
                parse_response_head(&self.buffer, &self.limits, head_request)?
            }
        };
        match status {
            ParseStatus::Complete { value, consumed } => {
                self.buffer.drain(..consumed);
                if self.role == Role::Client && !is_interim(&value) {
                    self.sent_methods.pop_front();
                }
                Ok(Some(value))
            }
            ParseStatus::Incomplete => Ok(None),
        }
    }
}

fn is_interim(head: &MessageHead) -> bool {
    head.headers.status().is_some_and(|s| (100..200).contains(&s))
}
