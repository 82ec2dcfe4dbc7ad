//! Configuration for the transport server and station client

use std::net::SocketAddr;
use std::time::Duration;

/// Sub-protocols accepted during the upgrade, in server preference order
pub const DEFAULT_PROTOCOLS: [&str; 3] = ["ocpp1.6", "ocpp2.0", "ocpp2.0.1"];

/// Transport server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address
    pub bind_addr: SocketAddr,

    /// Path prefix in front of `/<tenant>/<station>/<siteArea>/<site>/<company>`
    pub base_path: String,

    /// Supported sub-protocol tokens
    pub protocols: Vec<String>,

    /// Keepalive ping interval
    pub ping_interval: Duration,

    /// Idle intervals tolerated before a connection is terminated
    pub max_missed_pings: u32,

    /// Default timeout for outbound calls
    pub call_timeout: Duration,

    /// How often overdue pending calls are swept
    pub call_sweep_interval: Duration,

    /// Maximum inbound message size in bytes
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8010)),
            base_path: "/ocpp".to_string(),
            protocols: DEFAULT_PROTOCOLS.iter().map(|p| p.to_string()).collect(),
            ping_interval: Duration::from_secs(30),
            max_missed_pings: 2,
            call_timeout: Duration::from_secs(30),
            call_sweep_interval: Duration::from_secs(1),
            max_message_size: 64 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Set the path prefix (leading/trailing slashes are ignored)
    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }

    /// Replace the supported sub-protocols
    pub fn with_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_max_missed_pings(mut self, max_missed: u32) -> Self {
        self.max_missed_pings = max_missed.max(1);
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_call_sweep_interval(mut self, interval: Duration) -> Self {
        self.call_sweep_interval = interval;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Pick the first client-offered protocol this server supports
    pub fn negotiate_protocol<'a>(&self, offered: impl IntoIterator<Item = &'a str>) -> Option<String> {
        offered
            .into_iter()
            .map(str::trim)
            .find(|offer| self.protocols.iter().any(|p| p.eq_ignore_ascii_case(offer)))
            .map(str::to_string)
    }
}
