//! Fake upstream configuration.
//!
//! [`UpstreamConfig`] is plain data: it can be built in code with the
//! `with_*` methods or loaded from JSON. TLS material and accept filters are
//! not serializable and are attached through
//! [`FakeUpstreamBuilder`](crate::FakeUpstreamBuilder) instead.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::time::Duration;

use fake_upstream_http::{
    BodyConfig, DEFAULT_MAX_BODY_SIZE, DEFAULT_MAX_HEAD_BYTES, DEFAULT_MAX_HEADERS, ParseLimits,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, UpstreamError};

/// Default interval between peer pumps in a bounded wait.
pub const DEFAULT_WAIT_SLICE: Duration = Duration::from_millis(5);

/// Default size of the per-connection read buffer.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 16 * 1024;

/// Largest flow-control window HTTP/2 allows.
const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;

/// Application protocol spoken on HTTP connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecType {
    /// HTTP/1.1.
    #[default]
    Http1,
    /// HTTP/2 with prior knowledge (or ALPN `h2` over TLS).
    Http2,
}

/// IP family of a TCP listener. Listeners bind the loopback address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    /// `127.0.0.1`.
    #[default]
    V4,
    /// `::1`.
    V6,
}

impl IpVersion {
    /// Loopback address for this family.
    #[must_use]
    pub fn loopback(self) -> IpAddr {
        match self {
            Self::V4 => IpAddr::V4(Ipv4Addr::LOCALHOST),
            Self::V6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
        }
    }
}

/// Where the listener binds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ListenAddress {
    /// TCP on the loopback address. Port 0 picks a free port.
    Tcp {
        /// Port to bind.
        port: u16,
        /// Address family.
        #[serde(default)]
        ip_version: IpVersion,
    },
    /// Unix-domain stream socket at `path`.
    Unix {
        /// Socket path; a stale file at this path is removed before binding.
        path: PathBuf,
    },
}

impl Default for ListenAddress {
    fn default() -> Self {
        Self::Tcp {
            port: 0,
            ip_version: IpVersion::V4,
        }
    }
}

/// HTTP/1.1 codec limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Http1Settings {
    /// Maximum request head size in bytes.
    pub max_head_bytes: usize,
    /// Maximum number of request header lines.
    pub max_headers: usize,
    /// Maximum request body size in bytes.
    pub max_body_size: usize,
}

impl Default for Http1Settings {
    fn default() -> Self {
        Self {
            max_head_bytes: DEFAULT_MAX_HEAD_BYTES,
            max_headers: DEFAULT_MAX_HEADERS,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl Http1Settings {
    pub(crate) fn parse_limits(&self) -> ParseLimits {
        ParseLimits::new()
            .with_max_head_bytes(self.max_head_bytes)
            .with_max_headers(self.max_headers)
    }

    pub(crate) fn body_config(&self) -> BodyConfig {
        BodyConfig::new().with_max_size(self.max_body_size)
    }
}

/// HTTP/2 connection settings advertised to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Http2Settings {
    /// Initial per-stream receive window.
    pub initial_window_size: u32,
    /// Initial connection-level receive window.
    pub initial_connection_window_size: u32,
    /// Limit on concurrent streams opened by the peer.
    pub max_concurrent_streams: Option<u32>,
}

impl Default for Http2Settings {
    fn default() -> Self {
        Self {
            initial_window_size: 65_535,
            initial_connection_window_size: 65_535,
            max_concurrent_streams: None,
        }
    }
}

/// Configuration for one fake upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Listener address.
    pub listen: ListenAddress,
    /// Protocol used by [`wait_for_http_connection`](crate::FakeUpstream::wait_for_http_connection).
    pub codec: CodecType,
    /// Slice length of bounded waits, in milliseconds.
    pub wait_slice_ms: u64,
    /// Per-connection read buffer size.
    pub read_buffer_size: usize,
    /// HTTP/1.1 limits.
    pub http1: Http1Settings,
    /// HTTP/2 settings.
    pub http2: Http2Settings,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            listen: ListenAddress::default(),
            codec: CodecType::default(),
            wait_slice_ms: 5,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            http1: Http1Settings::default(),
            http2: Http2Settings::default(),
        }
    }
}

impl UpstreamConfig {
    /// TCP listener on the loopback address of `ip_version`.
    #[must_use]
    pub fn tcp(port: u16, codec: CodecType, ip_version: IpVersion) -> Self {
        Self {
            listen: ListenAddress::Tcp { port, ip_version },
            codec,
            ..Self::default()
        }
    }

    /// Unix-domain listener at `path`.
    #[must_use]
    pub fn unix(path: impl Into<PathBuf>, codec: CodecType) -> Self {
        Self {
            listen: ListenAddress::Unix { path: path.into() },
            codec,
            ..Self::default()
        }
    }

    /// Parse a JSON configuration document. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the bounded-wait slice.
    #[must_use]
    pub fn with_wait_slice(mut self, slice: Duration) -> Self {
        self.wait_slice_ms = u64::try_from(slice.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the per-connection read buffer size.
    #[must_use]
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Replace the HTTP/1.1 limits.
    #[must_use]
    pub fn with_http1(mut self, settings: Http1Settings) -> Self {
        self.http1 = settings;
        self
    }

    /// Replace the HTTP/2 settings.
    #[must_use]
    pub fn with_http2(mut self, settings: Http2Settings) -> Self {
        self.http2 = settings;
        self
    }

    /// Returns the bounded-wait slice.
    #[must_use]
    pub fn wait_slice(&self) -> Duration {
        Duration::from_millis(self.wait_slice_ms)
    }

    /// Reject values the event loop cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.wait_slice_ms == 0 {
            return Err(UpstreamError::InvalidConfig("wait_slice_ms must be positive"));
        }
        if self.read_buffer_size == 0 {
            return Err(UpstreamError::InvalidConfig("read_buffer_size must be positive"));
        }
        if self.http2.initial_window_size > MAX_WINDOW_SIZE
            || self.http2.initial_connection_window_size > MAX_WINDOW_SIZE
        {
            return Err(UpstreamError::InvalidConfig("http2 window exceeds 2^31-1"));
        }
        if let ListenAddress::Unix { path } = &self.listen {
            if path.as_os_str().is_empty() {
                return Err(UpstreamError::InvalidConfig("unix socket path is empty"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_listen_on_ephemeral_v4_port() {
        let config = UpstreamConfig::default();
        assert_eq!(
            config.listen,
            ListenAddress::Tcp {
                port: 0,
                ip_version: IpVersion::V4
            }
        );
        assert_eq!(config.wait_slice(), DEFAULT_WAIT_SLICE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn from_json_fills_missing_fields() {
        let config = UpstreamConfig::from_json(
            r#"{"listen": {"type": "tcp", "port": 0, "ip_version": "v6"}, "codec": "http2", "http2": {"initial_window_size": 1048576}}"#,
        )
        .unwrap();
        assert_eq!(config.codec, CodecType::Http2);
        assert_eq!(config.http2.initial_window_size, 1_048_576);
        assert_eq!(config.http2.initial_connection_window_size, 65_535);
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert_eq!(
            config.listen,
            ListenAddress::Tcp {
                port: 0,
                ip_version: IpVersion::V6
            }
        );
    }

    #[test]
    fn from_json_rejects_bad_documents() {
        assert!(matches!(
            UpstreamConfig::from_json("{"),
            Err(UpstreamError::Config(_))
        ));
        assert!(matches!(
            UpstreamConfig::from_json(r#"{"wait_slice_ms": 0}"#),
            Err(UpstreamError::InvalidConfig(_))
        ));
    }

    #[test]
    fn builder_methods_chain() {
        let config = UpstreamConfig::unix("/tmp/fake.sock", CodecType::Http1)
            .with_wait_slice(Duration::from_millis(20))
            .with_read_buffer_size(1024);
        assert_eq!(config.wait_slice_ms, 20);
        assert_eq!(config.read_buffer_size, 1024);
        assert!(matches!(config.listen, ListenAddress::Unix { .. }));
    }

    #[test]
    fn loopback_per_family() {
        assert!(IpVersion::V4.loopback().is_loopback());
        assert!(IpVersion::V6.loopback().is_ipv6());
    }
}
