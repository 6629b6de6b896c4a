//! HTTP connections.

use std::ops::Deref;

use crate::config::CodecType;
use crate::connection::FakeConnection;
use crate::stream::FakeStream;
use crate::sync::PeerLoop;

/// A connection with a server-role HTTP codec installed.
///
/// Every request the peer starts becomes a [`FakeStream`], queued until
/// [`wait_for_new_stream`](Self::wait_for_new_stream) claims it.
#[derive(Debug)]
pub struct FakeHttpConnection {
    connection: FakeConnection,
    codec: CodecType,
}

impl FakeHttpConnection {
    pub(crate) fn new(connection: FakeConnection, codec: CodecType) -> Self {
        Self { connection, codec }
    }

    /// Protocol spoken on this connection.
    #[must_use]
    pub fn codec_type(&self) -> CodecType {
        self.codec
    }

    /// Block until the peer starts a request and return its stream.
    pub fn wait_for_new_stream(&self) -> FakeStream {
        self.connection
            .shared()
            .events
            .wait_until(|events| events.new_streams.pop_front())
    }

    /// Like [`wait_for_new_stream`](Self::wait_for_new_stream), pumping
    /// `peer` while waiting.
    pub fn wait_for_new_stream_pumping<P>(&self, peer: &mut P) -> FakeStream
    where
        P: PeerLoop + ?Sized,
    {
        let shared = self.connection.shared();
        shared.events.wait_until_pumping(
            |events| events.new_streams.pop_front(),
            shared.wait_slice,
            peer,
        )
    }
}

impl Deref for FakeHttpConnection {
    type Target = FakeConnection;

    fn deref(&self) -> &FakeConnection {
        &self.connection
    }
}
