//! Shared client-side helpers for the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fake_upstream::codec::{BodyConfig, CodecEvent, Http1Codec, ParseLimits};
use fake_upstream::{
    CodecType, EventLoop, FakeHttpConnection, FakeUpstream, HeaderMap, IpVersion, RunType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio::io::{AsyncRead, AsyncWrite};

pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

pub fn upstream(codec: CodecType) -> FakeUpstream {
    fake_upstream::logging::init();
    FakeUpstream::tcp(0, codec, IpVersion::V4).expect("upstream must start")
}

pub fn tcp_address(upstream: &FakeUpstream) -> SocketAddr {
    upstream
        .local_address()
        .as_tcp()
        .expect("tcp upstream has a socket address")
}

pub fn connect(upstream: &FakeUpstream) -> TcpStream {
    let stream = TcpStream::connect(tcp_address(upstream)).expect("connect must succeed");
    stream
        .set_read_timeout(Some(IO_TIMEOUT))
        .expect("set read timeout");
    stream.set_nodelay(true).expect("set nodelay");
    stream
}

pub fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
    pairs.iter().copied().collect()
}

// ============================================================================
// HTTP/1.1 client
// ============================================================================

/// A response as seen by the HTTP/1.1 test client.
#[derive(Debug, Default)]
pub struct Response {
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub trailers: Option<HeaderMap>,
}

/// Blocking HTTP/1.1 client over a std socket, framed by the client codec.
pub struct Http1Client {
    pub stream: TcpStream,
    codec: Http1Codec,
    events: VecDeque<CodecEvent>,
}

impl Http1Client {
    pub fn connect(upstream: &FakeUpstream) -> Self {
        Self {
            stream: connect(upstream),
            codec: Http1Codec::client(ParseLimits::default(), BodyConfig::default()),
            events: VecDeque::new(),
        }
    }

    pub fn send_headers(&mut self, headers: &HeaderMap, end_stream: bool) {
        let bytes = self
            .codec
            .encode_headers(headers, end_stream)
            .expect("request head must encode");
        self.stream.write_all(&bytes).expect("write request head");
    }

    pub fn send_data(&mut self, data: &[u8], end_stream: bool) {
        let bytes = self
            .codec
            .encode_data(data, end_stream)
            .expect("request body must encode");
        self.stream.write_all(&bytes).expect("write request body");
    }

    pub fn send_trailers(&mut self, trailers: &HeaderMap) {
        let bytes = self
            .codec
            .encode_trailers(trailers)
            .expect("request trailers must encode");
        self.stream.write_all(&bytes).expect("write request trailers");
    }

    /// GET with no body.
    pub fn get(&mut self, path: &str) {
        self.send_headers(
            &headers(&[(":method", "GET"), (":path", path), (":authority", "upstream")]),
            true,
        );
    }

    /// Read until one complete response has been decoded.
    pub fn read_response(&mut self) -> Response {
        let mut response = Response::default();
        let mut buf = [0u8; 4096];
        loop {
            while let Some(event) = self.events.pop_front() {
                match event {
                    CodecEvent::MessageBegin {
                        headers,
                        end_stream,
                    } => {
                        response.headers = headers;
                        if end_stream {
                            return response;
                        }
                    }
                    CodecEvent::Data { data, end_stream } => {
                        response.body.extend_from_slice(&data);
                        if end_stream {
                            return response;
                        }
                    }
                    CodecEvent::Trailers(trailers) => {
                        response.trailers = Some(trailers);
                        return response;
                    }
                }
            }
            let n = self.stream.read(&mut buf).expect("read response");
            let events = if n == 0 {
                self.codec.finish()
            } else {
                self.codec.feed(&buf[..n])
            };
            self.events.extend(events.expect("response must decode"));
            assert!(
                n > 0 || !self.events.is_empty(),
                "connection closed before the response completed"
            );
        }
    }

    /// True once the server has closed the socket.
    pub fn read_eof(&mut self) -> bool {
        let mut buf = [0u8; 64];
        matches!(self.stream.read(&mut buf), Ok(0) | Err(_))
    }
}

// ============================================================================
// HTTP/2 client
// ============================================================================

type HandshakeTask<T> = tokio::task::JoinHandle<
    std::io::Result<(
        h2::client::SendRequest<Bytes>,
        h2::client::Connection<T, Bytes>,
    )>,
>;

/// A response as seen by the HTTP/2 test client.
#[derive(Debug)]
pub struct H2Response {
    pub status: http::StatusCode,
    pub headers: http::HeaderMap,
    pub body: Vec<u8>,
    pub trailers: Option<http::HeaderMap>,
}

/// An `h2` client whose connection runs on a test-owned event loop.
///
/// The loop is the peer handed to pumping waits: while the test thread
/// blocks on the upstream, the client keeps flushing frames and sending
/// WINDOW_UPDATEs.
pub struct H2Client {
    pub event_loop: EventLoop,
    send_request: h2::client::SendRequest<Bytes>,
}

impl H2Client {
    /// Connect over plain TCP, claim the connection on the upstream and
    /// finish the handshake.
    pub fn connect(upstream: &FakeUpstream) -> (Self, FakeHttpConnection) {
        let event_loop = EventLoop::new().expect("client loop must build");
        let addr = tcp_address(upstream);
        let handshake = event_loop.spawn(async move {
            let tcp = tokio::net::TcpStream::connect(addr).await?;
            tcp.set_nodelay(true)?;
            h2::client::handshake(tcp)
                .await
                .map_err(std::io::Error::other)
        });
        Self::finish(event_loop, upstream, handshake)
    }

    /// Like [`connect`](Self::connect), negotiating `h2` over TLS first.
    pub fn connect_tls(
        upstream: &FakeUpstream,
        tls: Arc<rustls::ClientConfig>,
    ) -> (Self, FakeHttpConnection) {
        let event_loop = EventLoop::new().expect("client loop must build");
        let addr = tcp_address(upstream);
        let handshake = event_loop.spawn(async move {
            let tcp = tokio::net::TcpStream::connect(addr).await?;
            let name = ServerName::try_from("localhost").map_err(std::io::Error::other)?;
            let stream = tokio_rustls::TlsConnector::from(tls).connect(name, tcp).await?;
            let (_, session) = stream.get_ref();
            assert_eq!(session.alpn_protocol(), Some(&b"h2"[..]));
            h2::client::handshake(stream)
                .await
                .map_err(std::io::Error::other)
        });
        Self::finish(event_loop, upstream, handshake)
    }

    fn finish<T>(
        mut event_loop: EventLoop,
        upstream: &FakeUpstream,
        handshake: HandshakeTask<T>,
    ) -> (Self, FakeHttpConnection)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection = upstream.wait_for_http_connection(&mut event_loop);
        let (send_request, driver) = event_loop
            .block_on(handshake)
            .expect("handshake task must not panic")
            .expect("h2 handshake must succeed");
        event_loop.spawn(async move {
            let _ = driver.await;
        });
        let send_request = event_loop
            .block_on(send_request.ready())
            .expect("connection must accept streams");
        (
            Self {
                event_loop,
                send_request,
            },
            connection,
        )
    }

    /// Open a request stream. Nothing is flushed until the loop runs.
    pub fn request(
        &mut self,
        method: &str,
        path: &str,
        end_stream: bool,
    ) -> (h2::client::ResponseFuture, h2::SendStream<Bytes>) {
        let request = http::Request::builder()
            .method(method)
            .uri(format!("http://upstream{path}"))
            .body(())
            .expect("request must build");
        self.send_request
            .send_request(request, end_stream)
            .expect("stream must open")
    }

    pub fn pump(&mut self) {
        self.event_loop.run(RunType::NonBlock);
    }

    /// Await the response head, then collect the whole body and trailers.
    pub fn read_response(
        &mut self,
        response: h2::client::ResponseFuture,
    ) -> Result<H2Response, h2::Error> {
        self.event_loop.block_on(async move {
            let response = response.await?;
            let (parts, mut body) = response.into_parts();
            let mut data = Vec::new();
            while let Some(chunk) = body.data().await {
                let chunk = chunk?;
                let _ = body.flow_control().release_capacity(chunk.len());
                data.extend_from_slice(&chunk);
            }
            let trailers = body.trailers().await?;
            Ok(H2Response {
                status: parts.status,
                headers: parts.headers,
                body: data,
                trailers,
            })
        })
    }
}

// ============================================================================
// TLS
// ============================================================================

pub fn self_signed() -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
    (vec![CertificateDer::from(cert.cert)], key.into())
}

pub fn server_tls_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    alpn: &[&[u8]],
) -> Arc<rustls::ServerConfig> {
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Arc::new(config)
}

pub fn client_tls_config(
    certs: &[CertificateDer<'static>],
    alpn: &[&[u8]],
) -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in certs {
        roots.add(cert.clone()).unwrap();
    }
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Arc::new(config)
}
