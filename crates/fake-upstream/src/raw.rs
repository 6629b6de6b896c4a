//! Byte-level connections.

use std::ops::Deref;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, trace};

use crate::config::UpstreamConfig;
use crate::connection::{ConnectionCommand, ConnectionShared, FakeConnection};
use crate::transport::{Backlog, BoxedIo};

/// A connection whose inbound bytes are accumulated, not decoded.
#[derive(Debug)]
pub struct FakeRawConnection {
    connection: FakeConnection,
}

impl FakeRawConnection {
    pub(crate) fn new(connection: FakeConnection) -> Self {
        Self { connection }
    }

    /// Block until exactly `length` bytes have been received in total.
    ///
    /// The wait re-checks on every arrival and only returns on an exact
    /// match; use [`wait_for_data_matching`](Self::wait_for_data_matching)
    /// when the total is not known up front.
    pub fn wait_for_data(&self, length: usize) -> Vec<u8> {
        self.wait_for_data_matching(|data| data.len() == length)
    }

    /// Block until `ready` accepts the bytes received so far; returns them.
    pub fn wait_for_data_matching(&self, mut ready: impl FnMut(&[u8]) -> bool) -> Vec<u8> {
        self.connection
            .shared()
            .events
            .wait_until(|events| ready(&events.raw_data).then(|| events.raw_data.clone()))
    }

    /// Queue `data` for writing. Writes are sent in call order.
    pub fn write(&self, data: impl Into<Bytes>) {
        self.connection
            .shared()
            .send(ConnectionCommand::Write(data.into()));
    }

    /// Bytes received so far.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.connection
            .shared()
            .events
            .read(|events| events.raw_data.clone())
    }
}

impl Deref for FakeRawConnection {
    type Target = FakeConnection;

    fn deref(&self) -> &FakeConnection {
        &self.connection
    }
}

/// Loop side: copy inbound bytes into the shared buffer and execute writes.
pub(crate) async fn drive(
    mut io: BoxedIo,
    shared: &ConnectionShared,
    mut backlog: Backlog,
    commands: &mut UnboundedReceiver<ConnectionCommand>,
    config: &UpstreamConfig,
) {
    let mut buffer = vec![0u8; config.read_buffer_size];
    let mut read_enabled = true;

    loop {
        tokio::select! {
            command = backlog.next(commands) => match command {
                Some(ConnectionCommand::Write(data)) => {
                    trace!(connection = shared.id(), len = data.len(), "raw write");
                    if let Err(e) = io.write_all(&data).await {
                        debug!(connection = shared.id(), error = %e, "raw write failed");
                        return;
                    }
                }
                Some(ConnectionCommand::ReadDisable(disable)) => read_enabled = !disable,
                Some(ConnectionCommand::Close) | None => {
                    let _ = io.flush().await;
                    let _ = io.shutdown().await;
                    return;
                }
                Some(other) => debug!(connection = shared.id(), ?other, "ignored on raw connection"),
            },
            read = io.read(&mut buffer), if read_enabled => match read {
                Ok(0) => {
                    debug!(connection = shared.id(), "remote close");
                    return;
                }
                Ok(n) => shared.append_raw(&buffer[..n]),
                Err(e) => {
                    debug!(connection = shared.id(), error = %e, "raw read failed");
                    return;
                }
            },
        }
    }
}
