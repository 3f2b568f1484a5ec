//! Server configuration.

use std::net::{Ipv6Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::RetryPolicy;
use crate::proxy::{RelayConfig, Socks5Config};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address
    pub listen_addr: String,
    /// Listen port
    pub listen_port: u16,
    /// Bound on dialing SOCKS5 targets
    pub connect_timeout: Duration,
    /// Bound on each handshake read
    pub handshake_timeout: Duration,
    /// Liveness sweep period; connections idle for two periods are evicted
    pub heartbeat_interval: Duration,
    /// Relay buffer size
    pub buffer_size: usize,
    /// Relay idle wake-up period
    pub relay_idle_poll: Duration,
    /// Retry policy around the login command
    pub auth_retry: RetryPolicy,
    /// Shell command that logs this host in
    pub login_command: Option<String>,
    /// Shell command that logs this host out
    pub logout_command: Option<String>,
    /// Acquire the identity before listening
    pub login_on_start: bool,
    /// Release the identity on shutdown
    pub release_on_shutdown: bool,
}

impl ServerConfig {
    /// Create a configuration with default timings.
    pub fn new(listen_addr: impl Into<String>, listen_port: u16) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            listen_port,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            buffer_size: 8192,
            relay_idle_poll: Duration::from_secs(60),
            auth_retry: RetryPolicy::default(),
            login_command: None,
            logout_command: None,
            login_on_start: true,
            release_on_shutdown: false,
        }
    }

    /// Address string passed to `bind`.
    pub fn bind_addr(&self) -> String {
        match self.listen_addr.parse::<Ipv6Addr>() {
            Ok(ip) => SocketAddr::from((ip, self.listen_port)).to_string(),
            Err(_) => format!("{}:{}", self.listen_addr, self.listen_port),
        }
    }

    /// Connections not refreshed within this window are evicted.
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval * 2
    }

    /// Settings for the SOCKS5 engine.
    pub fn socks5(&self) -> Socks5Config {
        Socks5Config {
            handshake_timeout: self.handshake_timeout,
            connect_timeout: self.connect_timeout,
            relay: RelayConfig {
                buffer_size: self.buffer_size,
                idle_poll: self.relay_idle_poll,
            },
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.listen_addr.is_empty() {
            return Err("listen_addr cannot be empty".into());
        }
        if self.heartbeat_interval.is_zero() {
            return Err("heartbeat_interval must be positive".into());
        }
        if self.handshake_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err("timeouts must be positive".into());
        }
        if self.buffer_size == 0 {
            return Err("buffer_size must be positive".into());
        }
        if self.login_on_start && self.login_command.is_none() {
            return Err("login_on_start requires login_command".into());
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("0.0.0.0", crate::DEFAULT_SERVER_PORT)
    }
}

/// Configuration file format for serialization.
#[derive(Debug, Serialize, Deserialize)]
pub struct ServerConfigFile {
    /// Listen address
    pub listen_addr: String,
    /// Listen port
    pub listen_port: u16,
    /// Target dial timeout (seconds)
    pub connect_timeout_secs: u64,
    /// Handshake read timeout (seconds); defaults to the connect timeout
    #[serde(default)]
    pub handshake_timeout_secs: Option<u64>,
    /// Heartbeat / sweep interval (seconds)
    pub heartbeat_interval_secs: u64,
    /// Relay buffer size
    pub buffer_size: usize,
    /// Relay idle wake-up (seconds)
    pub relay_idle_poll_secs: u64,
    /// Login attempts per hand-off
    pub login_retries: u32,
    /// Delay between login attempts (seconds)
    pub login_retry_delay_secs: u64,
    /// Login shell command
    #[serde(default)]
    pub login_command: Option<String>,
    /// Logout shell command
    #[serde(default)]
    pub logout_command: Option<String>,
    /// Acquire the identity before listening
    pub login_on_start: bool,
    /// Release the identity on shutdown
    #[serde(default)]
    pub release_on_shutdown: bool,
}

impl ServerConfigFile {
    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<ServerConfig, String> {
        let connect_timeout = Duration::from_secs(self.connect_timeout_secs);
        let config = ServerConfig {
            listen_addr: self.listen_addr.clone(),
            listen_port: self.listen_port,
            connect_timeout,
            handshake_timeout: self
                .handshake_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(connect_timeout),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            buffer_size: self.buffer_size,
            relay_idle_poll: Duration::from_secs(self.relay_idle_poll_secs),
            auth_retry: RetryPolicy {
                max_attempts: self.login_retries,
                delay: Duration::from_secs(self.login_retry_delay_secs),
            },
            login_command: self.login_command.clone(),
            logout_command: self.logout_command.clone(),
            login_on_start: self.login_on_start,
            release_on_shutdown: self.release_on_shutdown,
        };
        config.validate()?;
        Ok(config)
    }

    /// Create from runtime configuration.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            listen_addr: config.listen_addr.clone(),
            listen_port: config.listen_port,
            connect_timeout_secs: config.connect_timeout.as_secs(),
            handshake_timeout_secs: Some(config.handshake_timeout.as_secs()),
            heartbeat_interval_secs: config.heartbeat_interval.as_secs(),
            buffer_size: config.buffer_size,
            relay_idle_poll_secs: config.relay_idle_poll.as_secs(),
            login_retries: config.auth_retry.max_attempts,
            login_retry_delay_secs: config.auth_retry.delay.as_secs(),
            login_command: config.login_command.clone(),
            logout_command: config.logout_command.clone(),
            login_on_start: config.login_on_start,
            release_on_shutdown: config.release_on_shutdown,
        }
    }
}
