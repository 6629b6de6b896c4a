//! HTTP/1.1 connection driver.
//!
//! Inbound bytes go through a server-role [`Http1Codec`]; each request head
//! opens a new stream, body bytes reach the stream as soon as they are
//! decoded. Responses leave in request order; encodes for a pipelined
//! stream wait until every earlier response has ended. HTTP/1.1 has no
//! per-stream reset, so resetting a stream closes the connection.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use fake_upstream_http::{CodecEvent, Http1Codec};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, trace, warn};

use crate::config::UpstreamConfig;
use crate::connection::{ConnectionCommand, ConnectionShared, EncodeOp};
use crate::stream::{FakeStream, StreamEncoder, StreamShared};
use crate::transport::{Backlog, BoxedIo};

struct OpenStream {
    shared: Arc<StreamShared>,
    response_done: bool,
    /// Encodes posted before earlier responses finished.
    queued: VecDeque<EncodeOp>,
}

enum Outbound {
    Write(Vec<u8>),
    Reset,
    Nothing,
}

/// Streams of one connection, keyed by id.
///
/// Responses leave in request order: only the oldest stream whose response
/// has not ended writes, and encodes for later streams wait in their queue.
/// Whatever is still open when the connection ends is reset.
struct Streams<'a> {
    connection: &'a ConnectionShared,
    wait_slice: Duration,
    next_id: u64,
    inbound: Option<Arc<StreamShared>>,
    open: BTreeMap<u64, OpenStream>,
}

impl<'a> Streams<'a> {
    fn new(connection: &'a ConnectionShared, wait_slice: Duration) -> Self {
        Self {
            connection,
            wait_slice,
            next_id: 0,
            inbound: None,
            open: BTreeMap::new(),
        }
    }

    fn dispatch(&mut self, events: Vec<CodecEvent>) {
        for event in events {
            match event {
                CodecEvent::MessageBegin {
                    headers,
                    end_stream,
                } => {
                    self.next_id += 1;
                    let id = self.next_id;
                    let shared = Arc::new(StreamShared::default());
                    shared.decode_headers(headers, end_stream);
                    if !end_stream {
                        self.inbound = Some(Arc::clone(&shared));
                    }
                    self.open.insert(
                        id,
                        OpenStream {
                            shared: Arc::clone(&shared),
                            response_done: false,
                            queued: VecDeque::new(),
                        },
                    );
                    let encoder = StreamEncoder::new(id, self.connection.commands());
                    self.connection
                        .push_stream(FakeStream::new(id, shared, encoder, self.wait_slice));
                }
                CodecEvent::Data { data, end_stream } => {
                    if let Some(stream) = &self.inbound {
                        trace!(
                            connection = self.connection.id(),
                            len = data.len(),
                            end_stream,
                            "request data"
                        );
                        stream.decode_data(&data, end_stream);
                    }
                    if end_stream {
                        self.inbound = None;
                    }
                }
                CodecEvent::Trailers(trailers) => {
                    if let Some(stream) = self.inbound.take() {
                        stream.decode_trailers(trailers);
                    }
                }
            }
        }
        self.retire_finished();
    }

    fn encode(&mut self, codec: &mut Http1Codec, id: u64, op: EncodeOp) -> Outbound {
        let connection = self.connection.id();
        let Some(stream) = self.open.get_mut(&id) else {
            debug!(connection, stream = id, "encode on closed stream ignored");
            return Outbound::Nothing;
        };
        if matches!(op, EncodeOp::Reset) {
            stream.shared.on_reset();
            return Outbound::Reset;
        }
        stream.queued.push_back(op);

        let mut out = Vec::new();
        while let Some((id, stream)) = self.open.iter_mut().find(|(_, s)| !s.response_done) {
            let Some(op) = stream.queued.pop_front() else {
                break;
            };
            let encoded = match op {
                EncodeOp::Headers {
                    headers,
                    end_stream,
                } => {
                    stream.response_done |= end_stream;
                    codec.encode_headers(&headers, end_stream)
                }
                EncodeOp::Data { data, end_stream } => {
                    stream.response_done |= end_stream;
                    codec.encode_data(&data, end_stream)
                }
                EncodeOp::Trailers(trailers) => {
                    stream.response_done = true;
                    codec.encode_trailers(&trailers)
                }
                // Applied above, never queued.
                EncodeOp::Reset => continue,
            };
            match encoded {
                Ok(bytes) => out.extend_from_slice(&bytes),
                Err(e) => warn!(connection, stream = *id, error = %e, "http/1.1 encode failed"),
            }
        }
        self.retire_finished();

        if out.is_empty() {
            Outbound::Nothing
        } else {
            Outbound::Write(out)
        }
    }

    fn reset_inbound(&mut self) {
        if let Some(stream) = self.inbound.take() {
            stream.on_reset();
        }
    }

    /// Drop streams whose request and response have both ended.
    fn retire_finished(&mut self) {
        let connection = self.connection.id();
        self.open.retain(|&id, stream| {
            let finished = stream.response_done && stream.shared.is_complete();
            if finished && !stream.queued.is_empty() {
                debug!(
                    connection,
                    stream = id,
                    dropped = stream.queued.len(),
                    "encodes after end of response ignored"
                );
            }
            !finished
        });
    }
}

impl Drop for Streams<'_> {
    fn drop(&mut self) {
        for stream in self.open.values() {
            stream.shared.on_reset();
        }
    }
}

pub(crate) async fn drive(
    mut io: BoxedIo,
    shared: &ConnectionShared,
    mut backlog: Backlog,
    commands: &mut UnboundedReceiver<ConnectionCommand>,
    config: &UpstreamConfig,
) {
    let mut codec = Http1Codec::server(config.http1.parse_limits(), config.http1.body_config());
    let mut streams = Streams::new(shared, config.wait_slice());
    let mut buffer = vec![0u8; config.read_buffer_size];
    let mut read_enabled = true;

    loop {
        tokio::select! {
            command = backlog.next(commands) => match command {
                Some(ConnectionCommand::Stream { id, op }) => match streams.encode(&mut codec, id, op) {
                    Outbound::Write(bytes) => {
                        if let Err(e) = io.write_all(&bytes).await {
                            debug!(connection = shared.id(), error = %e, "write failed");
                            break;
                        }
                    }
                    Outbound::Reset => {
                        debug!(connection = shared.id(), stream = id, "stream reset closes connection");
                        let _ = io.shutdown().await;
                        break;
                    }
                    Outbound::Nothing => {}
                },
                Some(ConnectionCommand::Write(data)) => {
                    if let Err(e) = io.write_all(&data).await {
                        debug!(connection = shared.id(), error = %e, "write failed");
                        break;
                    }
                }
                Some(ConnectionCommand::ReadDisable(disable)) => read_enabled = !disable,
                Some(ConnectionCommand::Close) | None => {
                    let _ = io.flush().await;
                    let _ = io.shutdown().await;
                    break;
                }
                Some(ConnectionCommand::Install(_)) => {}
            },
            read = io.read(&mut buffer), if read_enabled => match read {
                Ok(0) => {
                    match codec.finish() {
                        Ok(events) => streams.dispatch(events),
                        Err(e) => {
                            debug!(connection = shared.id(), error = %e, "remote close mid-request");
                            streams.reset_inbound();
                        }
                    }
                    break;
                }
                Ok(n) => match codec.feed(&buffer[..n]) {
                    Ok(events) => streams.dispatch(events),
                    Err(e) => {
                        warn!(connection = shared.id(), error = %e, "malformed request");
                        streams.reset_inbound();
                        let _ = io.shutdown().await;
                        break;
                    }
                },
                Err(e) => {
                    debug!(connection = shared.id(), error = %e, "read failed");
                    break;
                }
            },
        }
    }
}
