//! The fake upstream server and its background event-loop thread.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::mpsc::unbounded_channel;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::config::{CodecType, IpVersion, ListenAddress, UpstreamConfig};
use crate::connection::{
    ConnectionShared, DisconnectGuard, FakeConnection, PendingConnection, Protocol,
};
use crate::error::{Result, UpstreamError};
use crate::event_loop::{EventLoop, LoopHandle, RunType};
use crate::http::FakeHttpConnection;
use crate::queue::RendezvousQueue;
use crate::raw::FakeRawConnection;
use crate::sync::PeerLoop;
use crate::transport::{self, Listener, UpstreamAddress};

/// Decides whether an accepted connection is kept. Rejected sockets are
/// closed without ever being queued.
pub type AcceptFilter = Arc<dyn Fn(&UpstreamAddress) -> bool + Send + Sync>;

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Everything the accept task needs.
struct AcceptContext {
    config: Arc<UpstreamConfig>,
    tls: Option<TlsAcceptor>,
    accept_filter: Option<AcceptFilter>,
    pending: Arc<RendezvousQueue<PendingConnection>>,
}

/// A listening test server with a blocking API.
///
/// The constructor returns once the listener is bound, so clients may
/// connect immediately. Dropping the upstream stops its event loop and
/// closes every connection; handles that outlive it report disconnected and
/// their open streams report reset.
pub struct FakeUpstream {
    address: UpstreamAddress,
    codec: CodecType,
    wait_slice: Duration,
    pending: Arc<RendezvousQueue<PendingConnection>>,
    handle: LoopHandle,
    thread: Option<JoinHandle<()>>,
    socket_path: Option<PathBuf>,
}

impl std::fmt::Debug for FakeUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeUpstream")
            .field("address", &self.address)
            .field("codec", &self.codec)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl FakeUpstream {
    /// Start an upstream described by `config`.
    pub fn new(config: UpstreamConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    /// Plain TCP upstream on the loopback address. Port 0 picks a free port.
    pub fn tcp(port: u16, codec: CodecType, ip_version: IpVersion) -> Result<Self> {
        Self::new(UpstreamConfig::tcp(port, codec, ip_version))
    }

    /// Unix-domain upstream at `path`.
    pub fn unix(path: impl Into<PathBuf>, codec: CodecType) -> Result<Self> {
        Self::new(UpstreamConfig::unix(path, codec))
    }

    /// TLS upstream on the loopback address.
    pub fn tls(
        tls: Arc<rustls::ServerConfig>,
        port: u16,
        codec: CodecType,
        ip_version: IpVersion,
    ) -> Result<Self> {
        Self::builder()
            .config(UpstreamConfig::tcp(port, codec, ip_version))
            .with_tls(tls)
            .build()
    }

    /// Builder for upstreams that need TLS or an accept filter.
    pub fn builder() -> FakeUpstreamBuilder {
        FakeUpstreamBuilder::default()
    }

    fn start(
        config: UpstreamConfig,
        tls: Option<Arc<rustls::ServerConfig>>,
        accept_filter: Option<AcceptFilter>,
    ) -> Result<Self> {
        crate::logging::init();
        config.validate()?;
        let config = Arc::new(config);
        let tls_enabled = tls.is_some();
        let pending = Arc::new(RendezvousQueue::new());
        let context = AcceptContext {
            config: Arc::clone(&config),
            tls: tls.map(TlsAcceptor::from),
            accept_filter,
            pending: Arc::clone(&pending),
        };

        let (ready_tx, ready_rx) = mpsc::channel::<Result<(UpstreamAddress, LoopHandle)>>();
        let thread = thread::Builder::new()
            .name("fake-upstream".to_string())
            .spawn(move || run_loop(context, &ready_tx))?;

        let Ok(ready) = ready_rx.recv() else {
            let _ = thread.join();
            return Err(UpstreamError::Startup);
        };
        let (address, handle) = match ready {
            Ok(ready) => ready,
            Err(e) => {
                let _ = thread.join();
                return Err(e);
            }
        };
        info!(%address, codec = ?config.codec, tls = tls_enabled, "fake upstream listening");

        let socket_path = match &config.listen {
            ListenAddress::Unix { path } => Some(path.clone()),
            ListenAddress::Tcp { .. } => None,
        };
        Ok(Self {
            address,
            codec: config.codec,
            wait_slice: config.wait_slice(),
            pending,
            handle,
            thread: Some(thread),
            socket_path,
        })
    }

    /// Bound listener address (with the real port when 0 was requested).
    #[must_use]
    pub fn local_address(&self) -> &UpstreamAddress {
        &self.address
    }

    /// Protocol used for HTTP connections.
    #[must_use]
    pub fn codec_type(&self) -> CodecType {
        self.codec
    }

    /// Number of accepted connections not yet claimed.
    #[must_use]
    pub fn pending_connections(&self) -> usize {
        self.pending.len()
    }

    /// Block until a connection is accepted and claim it as raw bytes.
    pub fn wait_for_raw_connection(&self) -> FakeRawConnection {
        let pending = self.pending.wait_and_pop();
        FakeRawConnection::new(FakeConnection::claim(pending, Protocol::Raw))
    }

    /// Block until a connection is accepted and claim it with the
    /// upstream's HTTP codec, pumping `peer` while waiting.
    pub fn wait_for_http_connection<P>(&self, peer: &mut P) -> FakeHttpConnection
    where
        P: PeerLoop + ?Sized,
    {
        let pending = self.pending.wait_and_pop_pumping(peer, self.wait_slice);
        let connection = FakeConnection::claim(pending, Protocol::Http(self.codec));
        FakeHttpConnection::new(connection, self.codec)
    }
}

impl Drop for FakeUpstream {
    fn drop(&mut self) {
        self.handle.exit();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(address = %self.address, "fake upstream thread panicked");
            }
        }
        if let Some(path) = &self.socket_path {
            transport::remove_stale_socket(path);
        }
        debug!(address = %self.address, "fake upstream stopped");
    }
}

/// Body of the background thread: bind, report readiness, run until exit.
fn run_loop(context: AcceptContext, ready: &mpsc::Sender<Result<(UpstreamAddress, LoopHandle)>>) {
    let mut event_loop = match EventLoop::new() {
        Ok(event_loop) => event_loop,
        Err(e) => {
            let _ = ready.send(Err(UpstreamError::Io(e)));
            return;
        }
    };

    let listen = context.config.listen.clone();
    let bound = event_loop.block_on(async {
        let listener = Listener::bind(&listen).await?;
        let address = listener.local_address()?;
        Ok::<_, std::io::Error>((listener, address))
    });
    let (listener, address) = match bound {
        Ok(bound) => bound,
        Err(source) => {
            let _ = ready.send(Err(UpstreamError::Bind {
                address: describe(&listen),
                source,
            }));
            return;
        }
    };

    let handle = event_loop.handle();
    handle.spawn(accept_loop(listener, context));
    if ready.send(Ok((address, handle))).is_err() {
        return;
    }
    event_loop.run(RunType::Block);
}

fn describe(listen: &ListenAddress) -> String {
    match listen {
        ListenAddress::Tcp { port, ip_version } => {
            std::net::SocketAddr::new(ip_version.loopback(), *port).to_string()
        }
        ListenAddress::Unix { path } => format!("unix:{}", path.display()),
    }
}

async fn accept_loop(listener: Listener, context: AcceptContext) {
    let mut next_id = 0u64;
    loop {
        let (io, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };
        if let Some(filter) = &context.accept_filter {
            if !filter(&peer) {
                debug!(%peer, "connection rejected by accept filter");
                continue;
            }
        }

        next_id += 1;
        debug!(connection = next_id, %peer, "accepted");
        let (commands_tx, commands_rx) = unbounded_channel();
        let shared = Arc::new(ConnectionShared::new(
            next_id,
            peer,
            commands_tx,
            context.config.wait_slice(),
        ));
        tokio::spawn(transport::run_connection(
            io,
            context.tls.clone(),
            DisconnectGuard::new(Arc::clone(&shared)),
            commands_rx,
            Arc::clone(&context.config),
        ));
        context.pending.push(PendingConnection { shared });
    }
}

/// Builds a [`FakeUpstream`] with settings that cannot live in
/// [`UpstreamConfig`].
#[derive(Default)]
#[must_use]
pub struct FakeUpstreamBuilder {
    config: UpstreamConfig,
    tls: Option<Arc<rustls::ServerConfig>>,
    accept_filter: Option<AcceptFilter>,
}

impl std::fmt::Debug for FakeUpstreamBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeUpstreamBuilder")
            .field("config", &self.config)
            .field("tls", &self.tls.is_some())
            .field("accept_filter", &self.accept_filter.is_some())
            .finish()
    }
}

impl FakeUpstreamBuilder {
    /// Replace the configuration.
    pub fn config(mut self, config: UpstreamConfig) -> Self {
        self.config = config;
        self
    }

    /// Terminate TLS on every accepted connection. Set `alpn_protocols` on
    /// the server config to negotiate `h2`.
    pub fn with_tls(mut self, tls: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Drop connections for which `filter` returns false.
    pub fn with_accept_filter(
        mut self,
        filter: impl Fn(&UpstreamAddress) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.accept_filter = Some(Arc::new(filter));
        self
    }

    /// Bind the listener and start the event-loop thread.
    pub fn build(self) -> Result<FakeUpstream> {
        FakeUpstream::start(self.config, self.tls, self.accept_filter)
    }
}
