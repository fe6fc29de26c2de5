//! CLI-driven configuration surface for the gateway.
//!
//! Mirrors the derive-based pattern every `rama-cli` subcommand uses for
//! its own `clap::Args` struct (e.g. `CliCommandProxy`, `CliCommandDiscard`).

use std::time::Duration;

use clap::{Args, ValueEnum};
use rama_net::address::SocketAddress;

/// `udpgw`: a BadVPN/tun2socks-compatible UDP-over-TCP gateway server.
#[derive(Debug, Args)]
pub struct Config {
    /// address to bind the TCP listener to
    #[arg(long, default_value = "0.0.0.0:7300")]
    pub listen_addr: SocketAddress,

    /// hard cap on concurrent TCP client sessions; excess accepts are
    /// closed immediately with no bytes written
    #[arg(long, default_value_t = 1000)]
    pub max_clients: usize,

    /// hard cap on active port forwards per client session; excess frames
    /// are dropped silently and the session stays open
    #[arg(long, default_value_t = 10)]
    pub max_connections_for_client: usize,

    /// TCP read idle timeout per session, in seconds (0 = no timeout)
    #[arg(long, default_value_t = 300)]
    pub client_timeout: u64,

    /// remote UDP receive timeout, in seconds — a liveness probe only,
    /// never closes a port forward by itself
    #[arg(long, default_value_t = 30)]
    pub udp_timeout: u64,

    /// TCP socket buffer size in bytes, best-effort (0 = OS default)
    #[arg(long, default_value_t = 0)]
    pub tcp_buffer: usize,

    /// UDP socket buffer size in bytes, best-effort (0 = OS default)
    #[arg(long, default_value_t = 0)]
    pub udp_buffer: usize,

    /// enable TCP_NODELAY on accepted client connections, best-effort
    #[arg(long, default_value_t = true)]
    pub tcp_nodelay: bool,

    /// enable SO_KEEPALIVE on accepted client connections, best-effort
    #[arg(long, default_value_t = true)]
    pub tcp_keepalive: bool,

    /// observability verbosity
    #[arg(long, value_enum, default_value_t = LogLevel::Error)]
    pub loglevel: LogLevel,

    /// interval, in seconds, between periodic active/total stats log lines
    /// (0 = disabled)
    #[arg(long, default_value_t = 0)]
    pub stats_interval: u64,
}

impl Config {
    /// `None` means "no timeout" (spec: `client_timeout = 0`).
    #[must_use]
    pub fn client_timeout(&self) -> Option<Duration> {
        (self.client_timeout > 0).then(|| Duration::from_secs(self.client_timeout))
    }

    #[must_use]
    pub fn udp_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_timeout)
    }

    #[must_use]
    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval > 0).then(|| Duration::from_secs(self.stats_interval))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    None,
}

impl LogLevel {
    /// The `tracing` default directive this level maps to, or `None` when
    /// logging is disabled entirely.
    #[must_use]
    pub fn as_filter_directive(self) -> Option<&'static str> {
        match self {
            Self::Debug => Some("debug"),
            Self::Info => Some("info"),
            Self::Warning => Some("warn"),
            Self::Error => Some("error"),
            Self::None => None,
        }
    }
}
