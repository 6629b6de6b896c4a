//! HTTP/2 connection driver built on the `h2` server.
//!
//! The connection future is polled through `accept()` while reads are
//! enabled. Each accepted request gets a receive task that records body
//! bytes and releases flow-control capacity at once, so the peer keeps
//! receiving WINDOW_UPDATE frames. Send handles stay on the driver, which
//! also watches them for peer resets.

use std::collections::HashMap;
use std::future::poll_fn;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use fake_upstream_http::{AUTHORITY, HeaderMap, METHOD, PATH, SCHEME};
use h2::server::{Builder, SendResponse};
use h2::{Reason, RecvStream, SendStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, trace, warn};

use crate::config::UpstreamConfig;
use crate::connection::{ConnectionCommand, ConnectionShared, EncodeOp};
use crate::stream::{FakeStream, StreamEncoder, StreamShared};
use crate::transport::{Backlog, BoxedIo};

/// How long a close waits for GOAWAY to flush.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection-specific headers HTTP/2 forbids.
const CONNECTION_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

struct H2Stream {
    shared: Arc<StreamShared>,
    respond: SendResponse<Bytes>,
    send: Option<SendStream<Bytes>>,
}

impl H2Stream {
    fn poll_reset(&mut self, cx: &mut Context<'_>) -> Poll<Result<Reason, h2::Error>> {
        match self.send.as_mut() {
            Some(send) => send.poll_reset(cx),
            None => self.respond.poll_reset(cx),
        }
    }

    /// Apply one encode; returns true once the response side has ended.
    fn encode(&mut self, op: EncodeOp) -> Result<bool, h2::Error> {
        match op {
            EncodeOp::Headers {
                headers,
                end_stream,
            } => {
                let response = match to_response(&headers) {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(error = %e, "unencodable response headers");
                        return Ok(false);
                    }
                };
                let send = self.respond.send_response(response, end_stream)?;
                self.send = Some(send);
                Ok(end_stream)
            }
            EncodeOp::Data { data, end_stream } => {
                let Some(send) = self.send.as_mut() else {
                    warn!("data encoded before response headers");
                    return Ok(false);
                };
                send.send_data(data, end_stream)?;
                Ok(end_stream)
            }
            EncodeOp::Trailers(trailers) => {
                let Some(send) = self.send.as_mut() else {
                    warn!("trailers encoded before response headers");
                    return Ok(false);
                };
                send.send_trailers(to_http_headers(&trailers))?;
                Ok(true)
            }
            EncodeOp::Reset => {
                match self.send.as_mut() {
                    Some(send) => send.send_reset(Reason::CANCEL),
                    None => self.respond.send_reset(Reason::CANCEL),
                }
                self.shared.on_reset();
                Ok(true)
            }
        }
    }
}

/// Send handles by stream id. Whatever is still open when the connection
/// ends, including when the event loop drops the task, is reset.
#[derive(Default)]
struct OpenStreams(HashMap<u64, H2Stream>);

impl Drop for OpenStreams {
    fn drop(&mut self) {
        for stream in self.0.values() {
            stream.shared.on_reset();
        }
    }
}

fn poll_resets(streams: &mut HashMap<u64, H2Stream>, cx: &mut Context<'_>) -> Poll<u64> {
    for (id, stream) in streams.iter_mut() {
        if stream.poll_reset(cx).is_ready() {
            return Poll::Ready(*id);
        }
    }
    Poll::Pending
}

pub(crate) async fn drive(
    io: BoxedIo,
    shared: &ConnectionShared,
    mut backlog: Backlog,
    commands: &mut UnboundedReceiver<ConnectionCommand>,
    config: &UpstreamConfig,
) {
    let settings = &config.http2;
    let mut builder = Builder::new();
    builder
        .initial_window_size(settings.initial_window_size)
        .initial_connection_window_size(settings.initial_connection_window_size);
    if let Some(max) = settings.max_concurrent_streams {
        builder.max_concurrent_streams(max);
    }

    let mut read_enabled = true;
    let handshake = builder.handshake::<_, Bytes>(io);
    tokio::pin!(handshake);
    let mut conn = loop {
        tokio::select! {
            result = &mut handshake => match result {
                Ok(conn) => break conn,
                Err(e) => {
                    debug!(connection = shared.id(), error = %e, "http/2 handshake failed");
                    return;
                }
            },
            command = commands.recv() => match command {
                Some(ConnectionCommand::Close) | None => return,
                Some(ConnectionCommand::ReadDisable(disable)) => read_enabled = !disable,
                Some(other) => backlog.push(other),
            },
        }
    };
    trace!(connection = shared.id(), "http/2 handshake complete");

    let wait_slice = config.wait_slice();
    let mut streams = OpenStreams::default();

    loop {
        tokio::select! {
            command = backlog.next(commands) => match command {
                Some(ConnectionCommand::Stream { id, op }) => {
                    let Some(stream) = streams.0.get_mut(&id) else {
                        debug!(connection = shared.id(), stream = id, "encode on closed stream ignored");
                        continue;
                    };
                    match stream.encode(op) {
                        Ok(false) => {}
                        Ok(true) => {
                            streams.0.remove(&id);
                        }
                        Err(e) => {
                            debug!(connection = shared.id(), stream = id, error = %e, "http/2 encode failed");
                            if let Some(stream) = streams.0.remove(&id) {
                                stream.shared.on_reset();
                            }
                        }
                    }
                }
                Some(ConnectionCommand::ReadDisable(disable)) => read_enabled = !disable,
                Some(ConnectionCommand::Close) | None => {
                    conn.abrupt_shutdown(Reason::NO_ERROR);
                    let closed = poll_fn(|cx| conn.poll_closed(cx));
                    if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, closed).await.is_err() {
                        debug!(connection = shared.id(), "goaway flush timed out");
                    }
                    break;
                }
                Some(ConnectionCommand::Write(_)) => {
                    warn!(connection = shared.id(), "raw write ignored on http/2 connection");
                }
                Some(ConnectionCommand::Install(_)) => {}
            },
            accepted = conn.accept(), if read_enabled => match accepted {
                Some(Ok((request, respond))) => {
                    let id = u64::from(u32::from(respond.stream_id()));
                    let (parts, body) = request.into_parts();
                    let stream_shared = Arc::new(StreamShared::default());
                    let end_stream = body.is_end_stream();
                    stream_shared.decode_headers(request_headers(&parts), end_stream);
                    if !end_stream {
                        tokio::spawn(receive(body, Arc::clone(&stream_shared)));
                    }
                    streams.0.insert(
                        id,
                        H2Stream {
                            shared: Arc::clone(&stream_shared),
                            respond,
                            send: None,
                        },
                    );
                    let encoder = StreamEncoder::new(id, shared.commands());
                    shared.push_stream(FakeStream::new(id, stream_shared, encoder, wait_slice));
                }
                Some(Err(e)) => {
                    debug!(connection = shared.id(), error = %e, "http/2 connection error");
                    break;
                }
                None => {
                    debug!(connection = shared.id(), "http/2 connection closed by peer");
                    break;
                }
            },
            id = poll_fn(|cx| poll_resets(&mut streams.0, cx)) => {
                trace!(connection = shared.id(), stream = id, "peer reset");
                if let Some(stream) = streams.0.remove(&id) {
                    stream.shared.on_reset();
                }
            },
        }
    }
}

/// Record the request body, trailers and end of stream.
async fn receive(mut body: RecvStream, stream: Arc<StreamShared>) {
    while let Some(chunk) = body.data().await {
        match chunk {
            Ok(data) => {
                let _ = body.flow_control().release_capacity(data.len());
                stream.decode_data(&data, body.is_end_stream());
            }
            Err(e) => {
                trace!(error = %e, "request body aborted");
                stream.on_reset();
                return;
            }
        }
    }
    match body.trailers().await {
        Ok(Some(trailers)) => stream.decode_trailers(from_http_headers(&trailers)),
        Ok(None) => {
            if !stream.is_complete() {
                stream.finish();
            }
        }
        Err(e) => {
            trace!(error = %e, "request trailers aborted");
            stream.on_reset();
        }
    }
}

fn request_headers(parts: &http::request::Parts) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.add(METHOD, parts.method.as_str());
    headers.add(
        PATH,
        parts.uri.path_and_query().map_or("/", |p| p.as_str()),
    );
    if let Some(authority) = parts.uri.authority() {
        headers.add(AUTHORITY, authority.as_str());
    }
    if let Some(scheme) = parts.uri.scheme_str() {
        headers.add(SCHEME, scheme);
    }
    for (name, value) in from_http_headers(&parts.headers).iter() {
        headers.add(name, value);
    }
    headers
}

fn from_http_headers(headers: &http::HeaderMap) -> HeaderMap {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

fn to_http_headers(headers: &HeaderMap) -> http::HeaderMap {
    let mut out = http::HeaderMap::new();
    for (name, value) in headers.regular() {
        if CONNECTION_HEADERS.contains(&name) {
            continue;
        }
        match (
            http::HeaderName::from_bytes(name.as_bytes()),
            http::HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                out.append(name, value);
            }
            _ => warn!(header = name, "skipping header not representable in http/2"),
        }
    }
    out
}

fn to_response(headers: &HeaderMap) -> Result<http::Response<()>, http::Error> {
    let mut response = http::Response::builder().status(headers.status().unwrap_or(500));
    if let Some(map) = response.headers_mut() {
        *map = to_http_headers(headers);
    }
    response.body(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_pseudo_headers_come_first() {
        let request = http::Request::builder()
            .method("POST")
            .uri("https://host:8443/a?b=c")
            .header("x-custom", "v")
            .body(())
            .unwrap();
        let (parts, ()) = request.into_parts();
        let headers = request_headers(&parts);
        let pairs: Vec<_> = headers.iter().collect();
        assert_eq!(
            pairs,
            vec![
                (":method", "POST"),
                (":path", "/a?b=c"),
                (":authority", "host:8443"),
                (":scheme", "https"),
                ("x-custom", "v"),
            ]
        );
    }

    #[test]
    fn response_drops_connection_headers() {
        let headers = HeaderMap::from([
            (":status", "201"),
            ("connection", "close"),
            ("x-a", "1"),
            ("x-a", "2"),
        ]);
        let response = to_response(&headers).unwrap();
        assert_eq!(response.status(), http::StatusCode::CREATED);
        assert!(response.headers().get("connection").is_none());
        assert_eq!(response.headers().get_all("x-a").iter().count(), 2);
    }
}
