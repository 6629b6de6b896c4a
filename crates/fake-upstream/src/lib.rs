//! Synchronous test double for an asynchronous upstream server.
//!
//! A [`FakeUpstream`] listens on a background thread running a single-threaded
//! event loop. Tests drive it from their own thread with blocking calls that
//! read like a synchronous server:
//!
//! - **Connections**: [`wait_for_raw_connection`](FakeUpstream::wait_for_raw_connection)
//!   and [`wait_for_http_connection`](FakeUpstream::wait_for_http_connection)
//!   claim accepted connections in accept order
//! - **Streams**: [`FakeHttpConnection::wait_for_new_stream`] yields one
//!   [`FakeStream`] per request, HTTP/1.1 or HTTP/2
//! - **Bytes**: [`FakeRawConnection`] accumulates inbound data and writes
//!   whatever the test asks for
//!
//! The event-loop thread is the only one that touches sockets and codecs.
//! Handles post commands to it and wait on shared state guarded by a mutex
//! and condition variable. Waits that depend on the test's own client making
//! progress (an HTTP/2 body larger than the flow-control window, say) take a
//! [`PeerLoop`] and pump it between short waits.
//!
//! # Example
//!
//! ```no_run
//! use std::io::{Read, Write};
//! use std::net::TcpStream;
//!
//! use fake_upstream::{CodecType, FakeUpstream, IpVersion};
//!
//! let upstream = FakeUpstream::tcp(0, CodecType::Http1, IpVersion::V4).unwrap();
//! let addr = upstream.local_address().as_tcp().unwrap();
//!
//! let mut client = TcpStream::connect(addr).unwrap();
//! client.write_all(b"hello").unwrap();
//!
//! let conn = upstream.wait_for_raw_connection();
//! assert_eq!(conn.wait_for_data(5), b"hello");
//! conn.write(&b"world"[..]);
//!
//! let mut reply = [0u8; 5];
//! client.read_exact(&mut reply).unwrap();
//! conn.close();
//! conn.wait_for_disconnect(true);
//! ```
//!
//! # Crate Structure
//!
//! - [`FakeUpstream`] / [`FakeUpstreamBuilder`]: listener and event-loop thread
//! - [`FakeConnection`], [`FakeRawConnection`], [`FakeHttpConnection`]: connection handles
//! - [`FakeStream`]: one HTTP exchange
//! - [`EventLoop`], [`PeerLoop`]: the reactor and the pump used by bounded waits
//! - [`fake_upstream_http`]: the sans-io HTTP/1.1 codec

#![forbid(unsafe_code)]

mod config;
mod connection;
mod error;
mod event_loop;
mod http;
mod http1;
mod http2;
pub mod logging;
mod queue;
mod raw;
mod server;
mod stream;
mod sync;
mod transport;

pub use config::{
    CodecType, DEFAULT_READ_BUFFER_SIZE, DEFAULT_WAIT_SLICE, Http1Settings, Http2Settings,
    IpVersion, ListenAddress, UpstreamConfig,
};
pub use connection::{ConnectionState, FakeConnection};
pub use error::{Result, UpstreamError};
pub use event_loop::{EventLoop, LoopHandle, RunType};
pub use http::FakeHttpConnection;
pub use queue::RendezvousQueue;
pub use raw::FakeRawConnection;
pub use server::{AcceptFilter, FakeUpstream, FakeUpstreamBuilder};
pub use stream::FakeStream;
pub use sync::{NoPeer, PeerLoop, Signal};
pub use transport::UpstreamAddress;

pub use fake_upstream_http as codec;
pub use fake_upstream_http::HeaderMap;
