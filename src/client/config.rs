//! Tunnel client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::proxy::RelayConfig;

/// Configuration for a tunnel client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Tunnel server address
    pub server_addr: String,

    /// Tunnel server port
    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// Local SOCKS5 listener port, bound on 127.0.0.1 (0 picks a free port)
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// Bound on connecting and on each handshake read (seconds)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Bound on waiting for the hand-off verdict (seconds)
    #[serde(default = "default_handoff_timeout")]
    pub handoff_timeout_secs: u64,

    /// Heartbeat period on the control connection (seconds)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Attempts at opening the control connection
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// Pause between control connection attempts (seconds)
    #[serde(default = "default_connect_retry_delay")]
    pub connect_retry_delay_secs: u64,

    /// Relay buffer size
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Relay idle wake-up (seconds)
    #[serde(default = "default_relay_idle_poll")]
    pub relay_idle_poll_secs: u64,

    /// Shell command that logs this host in before connecting
    #[serde(default)]
    pub login_command: Option<String>,
}

fn default_server_port() -> u16 {
    crate::DEFAULT_SERVER_PORT
}

fn default_proxy_port() -> u16 {
    crate::DEFAULT_PROXY_PORT
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_handoff_timeout() -> u64 {
    300
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_connect_retries() -> u32 {
    10
}

fn default_connect_retry_delay() -> u64 {
    5
}

fn default_buffer_size() -> usize {
    8192
}

fn default_relay_idle_poll() -> u64 {
    60
}

impl ClientConfig {
    /// Create a configuration for `server_addr` with defaults everywhere else.
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            server_port: default_server_port(),
            proxy_port: default_proxy_port(),
            connect_timeout_secs: default_connect_timeout(),
            handoff_timeout_secs: default_handoff_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            connect_retries: default_connect_retries(),
            connect_retry_delay_secs: default_connect_retry_delay(),
            buffer_size: default_buffer_size(),
            relay_idle_poll_secs: default_relay_idle_poll(),
            login_command: None,
        }
    }

    /// `host:port` of the tunnel server.
    pub fn server_endpoint(&self) -> String {
        format!("{}:{}", self.server_addr, self.server_port)
    }

    /// Connect and handshake timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Hand-off verdict timeout. The server may retry its login several times.
    pub fn handoff_timeout(&self) -> Duration {
        Duration::from_secs(self.handoff_timeout_secs)
    }

    /// Control connection heartbeat period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Pause between connect attempts.
    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_secs(self.connect_retry_delay_secs)
    }

    /// Relay settings for local streams.
    pub fn relay(&self) -> RelayConfig {
        RelayConfig {
            buffer_size: self.buffer_size,
            idle_poll: Duration::from_secs(self.relay_idle_poll_secs),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.server_addr.is_empty() {
            return Err("server_addr cannot be empty".to_string());
        }
        if self.server_port == 0 {
            return Err("server_port cannot be 0".to_string());
        }
        if self.connect_timeout_secs == 0
            || self.handoff_timeout_secs == 0
            || self.heartbeat_interval_secs == 0
        {
            return Err("timeouts must be positive".to_string());
        }
        if self.connect_retries == 0 {
            return Err("connect_retries must be at least 1".to_string());
        }
        if self.buffer_size == 0 {
            return Err("buffer_size must be positive".to_string());
        }
        Ok(())
    }
}
