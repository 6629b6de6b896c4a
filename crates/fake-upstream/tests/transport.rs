//! Listener flavors, TLS, accept filtering and startup configuration.

mod common;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{
    H2Client, Http1Client, IO_TIMEOUT, client_tls_config, connect, headers, self_signed,
    server_tls_config,
};
use fake_upstream::{
    CodecType, FakeUpstream, IpVersion, ListenAddress, NoPeer, UpstreamConfig, UpstreamError,
};

fn socket_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("fake-upstream-{}-{name}.sock", std::process::id()))
}

#[test]
fn unix_socket_round_trip() {
    let path = socket_path("raw");
    let upstream = FakeUpstream::unix(&path, CodecType::Http1).unwrap();
    assert_eq!(upstream.local_address().as_unix(), Some(path.as_path()));
    assert_eq!(upstream.local_address().as_tcp(), None);

    let mut client = UnixStream::connect(&path).unwrap();
    client.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    client.write_all(b"ping").unwrap();

    let conn = upstream.wait_for_raw_connection();
    assert_eq!(conn.wait_for_data(4), b"ping");
    conn.write(&b"pong"[..]);
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"pong");

    drop(conn);
    drop(upstream);
    assert!(!path.exists());
}

#[test]
fn stale_socket_file_is_replaced() {
    let path = socket_path("stale");
    std::fs::write(&path, b"left behind").unwrap();

    let upstream = FakeUpstream::unix(&path, CodecType::Http1).unwrap();
    let _client = UnixStream::connect(&path).unwrap();
    let conn = upstream.wait_for_raw_connection();
    assert!(!conn.is_disconnected());
}

#[test]
fn tls_raw_connection() {
    let (certs, key) = self_signed();
    let upstream = FakeUpstream::tls(
        server_tls_config(certs.clone(), key, &[]),
        0,
        CodecType::Http1,
        IpVersion::V4,
    )
    .unwrap();

    let tcp = connect(&upstream);
    let session = rustls::ClientConnection::new(
        client_tls_config(&certs, &[]),
        "localhost".try_into().unwrap(),
    )
    .unwrap();
    let mut tls = rustls::StreamOwned::new(session, tcp);
    tls.write_all(b"secret").unwrap();

    let conn = upstream.wait_for_raw_connection();
    assert_eq!(conn.wait_for_data(6), b"secret");
    conn.write(&b"sealed"[..]);
    let mut reply = [0u8; 6];
    tls.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"sealed");
}

#[test]
fn tls_http2_with_alpn() {
    let (certs, key) = self_signed();
    let upstream = FakeUpstream::builder()
        .config(UpstreamConfig::tcp(0, CodecType::Http2, IpVersion::V4))
        .with_tls(server_tls_config(certs.clone(), key, &[b"h2"]))
        .build()
        .unwrap();

    let (mut client, conn) = H2Client::connect_tls(&upstream, client_tls_config(&certs, &[b"h2"]));
    let (response, _body) = client.request("GET", "/secure", true);
    let stream = conn.wait_for_new_stream_pumping(&mut client.event_loop);
    assert_eq!(stream.headers().get(":path"), Some("/secure"));

    stream.encode_headers(&headers(&[(":status", "200")]), false);
    stream.encode_data(b"over tls", true);
    let response = client.read_response(response).unwrap();
    assert_eq!(response.body, b"over tls");
}

#[test]
fn failed_tls_handshake_disconnects() {
    let (certs, key) = self_signed();
    let upstream =
        FakeUpstream::tls(server_tls_config(certs, key, &[]), 0, CodecType::Http1, IpVersion::V4)
            .unwrap();

    let mut client = connect(&upstream);
    client
        .write_all(b"GET / HTTP/1.1\r\nhost: plain\r\n\r\n")
        .unwrap();

    let conn = upstream.wait_for_raw_connection();
    conn.wait_for_disconnect(true);
    assert!(conn.data().is_empty());
}

#[test]
fn accept_filter_drops_rejected_peers() {
    let seen = AtomicUsize::new(0);
    let upstream = FakeUpstream::builder()
        .with_accept_filter(move |peer| {
            assert!(peer.as_tcp().is_some());
            seen.fetch_add(1, Ordering::SeqCst) > 0
        })
        .build()
        .unwrap();

    let mut rejected = connect(&upstream);
    let mut buf = [0u8; 1];
    assert!(matches!(rejected.read(&mut buf), Ok(0) | Err(_)));
    assert_eq!(upstream.pending_connections(), 0);

    let mut accepted = connect(&upstream);
    accepted.write_all(b"in").unwrap();
    let conn = upstream.wait_for_raw_connection();
    assert_eq!(conn.id(), 1);
    assert_eq!(conn.wait_for_data(2), b"in");
}

#[test]
fn peer_address_is_the_client_socket() {
    let upstream = common::upstream(CodecType::Http1);
    let client = connect(&upstream);
    let conn = upstream.wait_for_raw_connection();
    assert_eq!(
        conn.peer_address().as_tcp(),
        Some(client.local_addr().unwrap())
    );
}

#[test]
fn json_config_starts_an_upstream() {
    let config = UpstreamConfig::from_json(
        r#"{
            "listen": { "type": "tcp", "port": 0, "ip_version": "v4" },
            "codec": "http2",
            "wait_slice_ms": 2,
            "http2": { "initial_window_size": 1048576 }
        }"#,
    )
    .unwrap();
    assert_eq!(config.listen, ListenAddress::Tcp { port: 0, ip_version: IpVersion::V4 });
    assert_eq!(config.http2.initial_connection_window_size, 65_535);

    let upstream = FakeUpstream::new(config).unwrap();
    assert_eq!(upstream.codec_type(), CodecType::Http2);
    assert_ne!(upstream.local_address().as_tcp().unwrap().port(), 0);
}

#[test]
fn busy_port_is_a_bind_error() {
    let first = common::upstream(CodecType::Http1);
    let port = first.local_address().as_tcp().unwrap().port();

    let err = FakeUpstream::tcp(port, CodecType::Http1, IpVersion::V4).unwrap_err();
    assert!(matches!(err, UpstreamError::Bind { .. }), "{err}");
    assert!(err.to_string().contains(&port.to_string()));
}

#[test]
fn invalid_config_is_rejected_before_binding() {
    let err = FakeUpstream::new(UpstreamConfig::default().with_read_buffer_size(0)).unwrap_err();
    assert!(matches!(err, UpstreamError::InvalidConfig(_)));

    let err = UpstreamConfig::from_json("{\"codec\": \"http3\"}").unwrap_err();
    assert!(matches!(err, UpstreamError::Config(_)));
}

#[test]
fn dropping_the_upstream_disconnects_live_handles() {
    let upstream = common::upstream(CodecType::Http1);
    let mut client: TcpStream = connect(&upstream);
    let conn = upstream.wait_for_raw_connection();
    let mut idle: TcpStream = connect(&upstream);
    while upstream.pending_connections() == 0 {
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    drop(upstream);

    assert!(conn.is_disconnected());
    conn.wait_for_disconnect(true);
    conn.close();
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).unwrap(), 0);
    assert_eq!(idle.read(&mut buf).unwrap(), 0);
}

#[test]
fn dropping_the_upstream_resets_open_streams() {
    let upstream = common::upstream(CodecType::Http1);
    let mut client = Http1Client::connect(&upstream);
    let conn = upstream.wait_for_http_connection(&mut NoPeer);
    client.get("/pending");
    let stream = conn.wait_for_new_stream();
    drop(upstream);

    assert!(conn.is_disconnected());
    assert!(stream.reset());
    stream.wait_for_reset();
    assert!(client.read_eof());
}
