//! Connection handles shared by the raw and HTTP flavours.
//!
//! A connection is owned by one task on the event loop. The driver thread
//! holds an `Arc<ConnectionShared>`: it reads event state through a
//! [`Signal`] and talks to the task only by sending [`ConnectionCommand`]s,
//! which the task executes in send order.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fake_upstream_http::HeaderMap;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};

use crate::config::CodecType;
use crate::stream::FakeStream;
use crate::sync::Signal;
use crate::transport::UpstreamAddress;

/// Lifecycle of a connection. The only transition is `Open -> Disconnected`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// The transport is up.
    #[default]
    Open,
    /// The transport closed, locally or remotely.
    Disconnected,
}

/// What the connection task runs once the connection is claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Protocol {
    Raw,
    Http(CodecType),
}

/// Outbound work for one stream.
#[derive(Debug)]
pub(crate) enum EncodeOp {
    Headers { headers: HeaderMap, end_stream: bool },
    Data { data: Bytes, end_stream: bool },
    Trailers(HeaderMap),
    Reset,
}

/// Work posted from the driver thread to a connection task.
#[derive(Debug)]
pub(crate) enum ConnectionCommand {
    Install(Protocol),
    ReadDisable(bool),
    Write(Bytes),
    Close,
    Stream { id: u64, op: EncodeOp },
}

/// Everything a wait on a connection can observe.
#[derive(Debug, Default)]
pub(crate) struct ConnectionEvents {
    pub(crate) state: ConnectionState,
    pub(crate) raw_data: Vec<u8>,
    pub(crate) new_streams: VecDeque<FakeStream>,
}

/// State shared between a connection task and its driver-side handles.
#[derive(Debug)]
pub(crate) struct ConnectionShared {
    id: u64,
    peer: UpstreamAddress,
    commands: UnboundedSender<ConnectionCommand>,
    pub(crate) events: Signal<ConnectionEvents>,
    pub(crate) wait_slice: Duration,
}

impl ConnectionShared {
    pub(crate) fn new(
        id: u64,
        peer: UpstreamAddress,
        commands: UnboundedSender<ConnectionCommand>,
        wait_slice: Duration,
    ) -> Self {
        Self {
            id,
            peer,
            commands,
            events: Signal::new(ConnectionEvents::default()),
            wait_slice,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn commands(&self) -> UnboundedSender<ConnectionCommand> {
        self.commands.clone()
    }

    /// Queue a command. Commands for a finished connection are dropped.
    pub(crate) fn send(&self, command: ConnectionCommand) {
        if self.commands.send(command).is_err() {
            trace!(connection = self.id, "command dropped, connection task gone");
        }
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.events
            .read(|events| events.state == ConnectionState::Disconnected)
    }

    // Loop-side notifications.

    pub(crate) fn append_raw(&self, bytes: &[u8]) {
        trace!(connection = self.id, len = bytes.len(), "raw data");
        self.events
            .update(|events| events.raw_data.extend_from_slice(bytes));
    }

    pub(crate) fn push_stream(&self, stream: FakeStream) {
        debug!(connection = self.id, stream = stream.id(), "new stream");
        self.events
            .update(|events| events.new_streams.push_back(stream));
    }

    pub(crate) fn mark_disconnected(&self) {
        let changed = self.events.update(|events| {
            let changed = events.state == ConnectionState::Open;
            events.state = ConnectionState::Disconnected;
            changed
        });
        if changed {
            debug!(connection = self.id, peer = %self.peer, "disconnected");
        }
    }
}

/// Held by a connection task; marks the connection disconnected when the
/// task ends, including when the event loop drops it unpolled or mid-await
/// at shutdown.
#[derive(Debug)]
pub(crate) struct DisconnectGuard(Arc<ConnectionShared>);

impl DisconnectGuard {
    pub(crate) fn new(shared: Arc<ConnectionShared>) -> Self {
        Self(shared)
    }
}

impl Deref for DisconnectGuard {
    type Target = ConnectionShared;

    fn deref(&self) -> &ConnectionShared {
        &self.0
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.0.mark_disconnected();
    }
}

/// An accepted connection that no driver call has claimed yet.
#[derive(Debug)]
pub(crate) struct PendingConnection {
    pub(crate) shared: Arc<ConnectionShared>,
}

/// Driver-side handle to a live connection.
#[derive(Debug)]
pub struct FakeConnection {
    shared: Arc<ConnectionShared>,
}

impl FakeConnection {
    /// Claim a pending connection: install `protocol` on its task, then
    /// enable reads.
    pub(crate) fn claim(pending: PendingConnection, protocol: Protocol) -> Self {
        let shared = pending.shared;
        debug!(connection = shared.id(), ?protocol, "connection claimed");
        shared.send(ConnectionCommand::Install(protocol));
        shared.send(ConnectionCommand::ReadDisable(false));
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<ConnectionShared> {
        &self.shared
    }

    /// Per-upstream connection number, starting at 1 in accept order.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Address of the connecting peer.
    #[must_use]
    pub fn peer_address(&self) -> &UpstreamAddress {
        &self.shared.peer
    }

    /// Returns true once the transport has closed.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.shared.is_disconnected()
    }

    /// Close the connection after flushing queued writes. Idempotent.
    pub fn close(&self) {
        if !self.shared.is_disconnected() {
            self.shared.send(ConnectionCommand::Close);
        }
    }

    /// Stop (`true`) or resume (`false`) reading from the transport.
    ///
    /// # Panics
    ///
    /// Panics if the connection is already disconnected.
    pub fn read_disable(&self, disable: bool) {
        assert!(
            !self.shared.is_disconnected(),
            "read_disable({disable}) on disconnected connection {}",
            self.shared.id
        );
        self.shared.send(ConnectionCommand::ReadDisable(disable));
    }

    /// Block until the connection is disconnected.
    ///
    /// With `ignore_other_events` set, inbound data and new streams are
    /// ignored. Without it, the first connection event of any kind ends the
    /// wait and must be the disconnect: a stream or data arriving first
    /// fails the test. Returns at once if already disconnected.
    ///
    /// # Panics
    ///
    /// Panics in strict mode when another event arrives first.
    pub fn wait_for_disconnect(&self, ignore_other_events: bool) {
        let disconnected =
            |events: &ConnectionEvents| events.state == ConnectionState::Disconnected;
        if ignore_other_events {
            self.shared
                .events
                .wait_until(|events| disconnected(events).then_some(()));
            return;
        }
        let state = self
            .shared
            .events
            .wait_for_event(disconnected, |events| events.state);
        assert_eq!(
            state,
            ConnectionState::Disconnected,
            "connection {} saw another event while waiting for disconnect",
            self.shared.id
        );
    }
}
