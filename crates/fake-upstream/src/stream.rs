//! One HTTP request/response exchange as seen by the fake upstream.
//!
//! The connection task records inbound headers, body bytes, trailers and
//! resets into a shared [`StreamState`]; the driver thread waits on it and
//! queues outbound encodes that the task performs in order.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fake_upstream_http::{HeaderMap, STATUS};
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

use crate::connection::{ConnectionCommand, EncodeOp};
use crate::sync::{PeerLoop, Signal};

/// Inbound half of a stream.
#[derive(Debug, Default)]
pub(crate) struct StreamState {
    headers: Option<HeaderMap>,
    body: Vec<u8>,
    trailers: Option<HeaderMap>,
    end_stream: bool,
    reset: bool,
}

/// Loop-side recorder for inbound stream events.
#[derive(Debug, Default)]
pub(crate) struct StreamShared {
    state: Signal<StreamState>,
}

impl StreamShared {
    pub(crate) fn decode_headers(&self, headers: HeaderMap, end_stream: bool) {
        self.state.update(|state| {
            state.headers = Some(headers);
            state.end_stream |= end_stream;
        });
    }

    pub(crate) fn decode_data(&self, data: &[u8], end_stream: bool) {
        self.state.update(|state| {
            state.body.extend_from_slice(data);
            state.end_stream |= end_stream;
        });
    }

    /// Trailers always end the inbound side.
    pub(crate) fn decode_trailers(&self, trailers: HeaderMap) {
        self.state.update(|state| {
            state.trailers = Some(trailers);
            state.end_stream = true;
        });
    }

    /// Mark the inbound side ended if nothing has yet.
    pub(crate) fn finish(&self) {
        self.state.update(|state| state.end_stream = true);
    }

    pub(crate) fn on_reset(&self) {
        self.state.update(|state| state.reset = true);
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.state.read(|state| state.end_stream)
    }

    pub(crate) fn is_reset(&self) -> bool {
        self.state.read(|state| state.reset)
    }
}

/// Routes encodes for one stream to its connection task.
#[derive(Debug, Clone)]
pub(crate) struct StreamEncoder {
    id: u64,
    commands: UnboundedSender<ConnectionCommand>,
}

impl StreamEncoder {
    pub(crate) fn new(id: u64, commands: UnboundedSender<ConnectionCommand>) -> Self {
        Self { id, commands }
    }

    fn send(&self, op: EncodeOp) {
        if self
            .commands
            .send(ConnectionCommand::Stream { id: self.id, op })
            .is_err()
        {
            trace!(stream = self.id, "encode dropped, connection task gone");
        }
    }
}

/// Driver-side handle to one HTTP exchange.
///
/// Accessors return snapshots; body and flags only ever grow, so a value
/// observed once stays true.
#[derive(Debug)]
pub struct FakeStream {
    id: u64,
    shared: Arc<StreamShared>,
    encoder: StreamEncoder,
    wait_slice: Duration,
}

impl FakeStream {
    pub(crate) fn new(
        id: u64,
        shared: Arc<StreamShared>,
        encoder: StreamEncoder,
        wait_slice: Duration,
    ) -> Self {
        Self {
            id,
            shared,
            encoder,
            wait_slice,
        }
    }

    /// Stream number within its connection.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Send response headers.
    ///
    /// # Panics
    ///
    /// Panics if `:status` is missing or not a three digit code.
    pub fn encode_headers(&self, headers: &HeaderMap, end_stream: bool) {
        let status = headers
            .get(STATUS)
            .unwrap_or_else(|| panic!("response headers on stream {} lack :status", self.id));
        assert!(
            headers.status().is_some_and(|code| (100..1000).contains(&code)),
            "response headers on stream {} carry invalid :status {status:?}",
            self.id
        );
        self.encoder.send(EncodeOp::Headers {
            headers: headers.clone(),
            end_stream,
        });
    }

    /// Send body bytes.
    pub fn encode_data(&self, data: &[u8], end_stream: bool) {
        self.encoder.send(EncodeOp::Data {
            data: Bytes::copy_from_slice(data),
            end_stream,
        });
    }

    /// Send `size` bytes of `'a'`.
    pub fn encode_data_size(&self, size: usize, end_stream: bool) {
        self.encoder.send(EncodeOp::Data {
            data: Bytes::from(vec![b'a'; size]),
            end_stream,
        });
    }

    /// Send trailers, ending the response.
    pub fn encode_trailers(&self, trailers: &HeaderMap) {
        self.encoder.send(EncodeOp::Trailers(trailers.clone()));
    }

    /// Reset the stream. Over HTTP/1.1 this closes the connection.
    pub fn encode_reset_stream(&self) {
        self.encoder.send(EncodeOp::Reset);
    }

    // ========================================================================
    // Waits
    // ========================================================================

    /// Block until request headers have arrived.
    pub fn wait_for_headers_complete(&self) {
        self.shared
            .state
            .wait_until(|state| state.headers.is_some().then_some(()));
    }

    /// Block until exactly `length` body bytes have arrived, pumping `peer`.
    ///
    /// More bytes than `length` never satisfy the wait.
    pub fn wait_for_data<P>(&self, peer: &mut P, length: usize)
    where
        P: PeerLoop + ?Sized,
    {
        self.shared.state.wait_until_pumping(
            |state| (state.body.len() == length).then_some(()),
            self.wait_slice,
            peer,
        );
    }

    /// Block until the inbound side has ended, pumping `peer`.
    pub fn wait_for_end_stream<P>(&self, peer: &mut P)
    where
        P: PeerLoop + ?Sized,
    {
        self.shared.state.wait_until_pumping(
            |state| state.end_stream.then_some(()),
            self.wait_slice,
            peer,
        );
    }

    /// Block until the stream is reset by either side.
    pub fn wait_for_reset(&self) {
        self.shared
            .state
            .wait_until(|state| state.reset.then_some(()));
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Request headers; empty until they arrive.
    #[must_use]
    pub fn headers(&self) -> HeaderMap {
        self.shared
            .state
            .read(|state| state.headers.clone().unwrap_or_default())
    }

    /// Request body received so far.
    #[must_use]
    pub fn body(&self) -> Vec<u8> {
        self.shared.state.read(|state| state.body.clone())
    }

    /// Number of body bytes received so far.
    #[must_use]
    pub fn body_length(&self) -> usize {
        self.shared.state.read(|state| state.body.len())
    }

    /// Request trailers, if any arrived.
    #[must_use]
    pub fn trailers(&self) -> Option<HeaderMap> {
        self.shared.state.read(|state| state.trailers.clone())
    }

    /// Returns true once the inbound side has ended.
    #[must_use]
    pub fn complete(&self) -> bool {
        self.shared.is_complete()
    }

    /// Returns true once the stream was reset.
    #[must_use]
    pub fn reset(&self) -> bool {
        self.shared.is_reset()
    }
}
