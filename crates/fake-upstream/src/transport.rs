//! Listeners, byte streams and the per-connection task.
//!
//! Every accepted connection gets one task on the event loop. The task starts
//! with reads disabled and only executes commands until the driver thread
//! claims the connection (installs a protocol and enables reads). It then
//! hands the transport to the raw, HTTP/1.1 or HTTP/2 driver. The connection
//! is marked disconnected when the task ends or is dropped with the loop.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::config::{CodecType, ListenAddress, UpstreamConfig};
use crate::connection::{ConnectionCommand, ConnectionShared, DisconnectGuard, Protocol};
use crate::{http1, http2, raw};

/// Byte stream a connection driver reads and writes.
pub(crate) trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

pub(crate) type BoxedIo = Box<dyn Io>;

/// Address of a listener or of a connected peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UpstreamAddress {
    /// TCP endpoint.
    Tcp(SocketAddr),
    /// Unix-domain socket path; empty for unnamed peer sockets.
    Unix(PathBuf),
}

impl UpstreamAddress {
    /// The TCP address, if this is one.
    #[must_use]
    pub fn as_tcp(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(addr) => Some(*addr),
            Self::Unix(_) => None,
        }
    }

    /// The socket path, if this is a Unix address.
    #[must_use]
    pub fn as_unix(&self) -> Option<&Path> {
        match self {
            Self::Tcp(_) => None,
            Self::Unix(path) => Some(path),
        }
    }
}

impl fmt::Display for UpstreamAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Bound listening socket.
#[derive(Debug)]
pub(crate) enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    /// Bind per `address`. Must run inside the event loop's runtime.
    pub(crate) async fn bind(address: &ListenAddress) -> io::Result<Self> {
        match address {
            ListenAddress::Tcp { port, ip_version } => {
                let addr = SocketAddr::new(ip_version.loopback(), *port);
                Ok(Self::Tcp(TcpListener::bind(addr).await?))
            }
            ListenAddress::Unix { path } => {
                remove_stale_socket(path);
                Ok(Self::Unix(UnixListener::bind(path)?))
            }
        }
    }

    pub(crate) fn local_address(&self) -> io::Result<UpstreamAddress> {
        match self {
            Self::Tcp(listener) => listener.local_addr().map(UpstreamAddress::Tcp),
            Self::Unix(listener) => {
                let addr = listener.local_addr()?;
                Ok(UpstreamAddress::Unix(
                    addr.as_pathname().map(Path::to_path_buf).unwrap_or_default(),
                ))
            }
        }
    }

    pub(crate) async fn accept(&self) -> io::Result<(BoxedIo, UpstreamAddress)> {
        match self {
            Self::Tcp(listener) => {
                let (socket, peer) = listener.accept().await?;
                let _ = socket.set_nodelay(true);
                Ok((Box::new(socket), UpstreamAddress::Tcp(peer)))
            }
            Self::Unix(listener) => {
                let (socket, peer) = listener.accept().await?;
                let path = peer.as_pathname().map(Path::to_path_buf).unwrap_or_default();
                Ok((Box::new(socket), UpstreamAddress::Unix(path)))
            }
        }
    }
}

pub(crate) fn remove_stale_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale socket file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "could not remove socket file"),
    }
}

/// Run one connection from accept to disconnect.
pub(crate) async fn run_connection(
    io: BoxedIo,
    tls: Option<TlsAcceptor>,
    shared: DisconnectGuard,
    mut commands: UnboundedReceiver<ConnectionCommand>,
    config: Arc<UpstreamConfig>,
) {
    let io = match tls {
        Some(acceptor) => match acceptor.accept(io).await {
            Ok(stream) => Box::new(stream) as BoxedIo,
            Err(e) => {
                warn!(connection = shared.id(), error = %e, "tls handshake failed");
                return;
            }
        },
        None => io,
    };

    if let Some((io, protocol, backlog)) = await_claim(io, &shared, &mut commands).await {
        match protocol {
            Protocol::Raw => {
                raw::drive(io, &shared, backlog, &mut commands, &config).await;
            }
            Protocol::Http(CodecType::Http1) => {
                http1::drive(io, &shared, backlog, &mut commands, &config).await;
            }
            Protocol::Http(CodecType::Http2) => {
                http2::drive(io, &shared, backlog, &mut commands, &config).await;
            }
        }
    } else {
        debug!(connection = shared.id(), "closed before claim");
    }
}

/// Commands queued while a driver was busy, replayed before new ones.
pub(crate) struct Backlog {
    commands: VecDeque<ConnectionCommand>,
}

impl Backlog {
    pub(crate) fn new() -> Self {
        Self {
            commands: VecDeque::new(),
        }
    }

    pub(crate) fn push(&mut self, command: ConnectionCommand) {
        self.commands.push_back(command);
    }

    /// Next command, backlog first. `None` once every sender is gone.
    pub(crate) async fn next(
        &mut self,
        commands: &mut UnboundedReceiver<ConnectionCommand>,
    ) -> Option<ConnectionCommand> {
        match self.commands.pop_front() {
            Some(command) => Some(command),
            None => commands.recv().await,
        }
    }
}

/// Wait until the connection has a protocol and reads are enabled.
///
/// Reads stay disabled until then, so nothing is consumed from the
/// transport. A close before claim shuts the transport down.
async fn await_claim(
    mut io: BoxedIo,
    shared: &ConnectionShared,
    commands: &mut UnboundedReceiver<ConnectionCommand>,
) -> Option<(BoxedIo, Protocol, Backlog)> {
    let mut protocol = None;
    let mut read_enabled = false;
    let mut backlog = Backlog::new();

    while protocol.is_none() || !read_enabled {
        match commands.recv().await {
            Some(ConnectionCommand::Install(installed)) => protocol = Some(installed),
            Some(ConnectionCommand::ReadDisable(disable)) => read_enabled = !disable,
            Some(ConnectionCommand::Close) | None => {
                let _ = io.shutdown().await;
                return None;
            }
            Some(other) => backlog.push(other),
        }
    }
    debug!(connection = shared.id(), ?protocol, "reads enabled");
    protocol.map(|protocol| (io, protocol, backlog))
}
