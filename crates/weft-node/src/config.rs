//! Node configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default ack wait for `send`.
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;
/// Default period of the state announcement timer.
pub const DEFAULT_MSA_TIMEOUT_SECS: u64 = 10;
/// Default hop budget for outbound messages. Callers typically raise this
/// before sending beyond direct neighbors.
pub const DEFAULT_TTL: i32 = 1;
/// Capacity of the receive channel, the message pump, and each peer's
/// outbox and ack channel.
pub const RECEIVE_BUFFER: usize = 1024;
/// Capacity of the asynchronous error channel. Errors are try-sent and
/// dropped when no one is draining them.
pub const ERROR_BUFFER: usize = 64;

/// Configuration for a weft node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Node name; must be unique on the network.
    pub name: String,

    /// Target number of peer connections. 0 means never solicit, but still
    /// accept inbound connections.
    pub degree: u32,

    /// Port shared by the TCP peer listener and the UDP discovery socket.
    /// 0 lets the OS pick; the chosen port is used for both.
    pub port: u16,

    /// How long `send` waits for an ack.
    pub timeout: Duration,

    /// Period of the state announcement timer, in seconds.
    pub msa_timeout: u64,

    /// Default hop budget for outbound unicasts and broadcasts.
    pub ttl: i32,

    /// Where solicitation datagrams are sent. `None` means the limited
    /// broadcast address on the node's own port; tests point this at a
    /// loopback listener instead.
    pub broadcast_addr: Option<SocketAddr>,
}

impl NodeConfig {
    /// A config with the given identity and defaults for everything else.
    pub fn new(name: impl Into<String>, degree: u32, port: u16) -> Self {
        Self {
            name: name.into(),
            degree,
            port,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            msa_timeout: DEFAULT_MSA_TIMEOUT_SECS,
            ttl: DEFAULT_TTL,
            broadcast_addr: None,
        }
    }

    /// Create config from environment variables with sensible defaults.
    pub fn from_env() -> Self {
        let name = std::env::var("WEFT_NAME").unwrap_or_else(|_| "weft".to_string());

        let degree = std::env::var("WEFT_DEGREE")
            .unwrap_or_else(|_| "2".to_string())
            .parse()
            .expect("Invalid WEFT_DEGREE");

        let port = std::env::var("WEFT_PORT")
            .unwrap_or_else(|_| "9700".to_string())
            .parse()
            .expect("Invalid WEFT_PORT");

        let mut config = Self::new(name, degree, port);

        if let Ok(v) = std::env::var("WEFT_MSA_TIMEOUT") {
            config.msa_timeout = v.parse().expect("Invalid WEFT_MSA_TIMEOUT");
        }
        if let Ok(v) = std::env::var("WEFT_TTL") {
            config.ttl = v.parse().expect("Invalid WEFT_TTL");
        }
        if let Ok(v) = std::env::var("WEFT_TIMEOUT") {
            config.timeout = Duration::from_secs(v.parse().expect("Invalid WEFT_TIMEOUT"));
        }

        config
    }

    /// The solicitation target for a node whose socket ended up on `port`.
    pub fn solicit_target(&self, port: u16) -> SocketAddr {
        self.broadcast_addr
            .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port))
    }
}
