//! # Linkshare
//!
//! Shares one authenticated network session between hosts. The host that
//! owns the session runs the tunnel server; a peer that temporarily took the
//! session over runs the tunnel client, asks the owner to take it back, and
//! then reaches the internet through the owner over a TCP tunnel carrying
//! plain SOCKS5.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────┐  SOCKS5   ┌───────────────┐  tunnel (TCP)  ┌───────────────┐
//! │  Application  │──────────▶│ Tunnel Client │═══════════════▶│ Tunnel Server │──▶ Internet
//! └───────────────┘ 127.0.0.1 └───────────────┘  HELLO / OK    └───────┬───────┘
//!                                                 REPORT_IP            │ once per
//!                                                                      ▼ hand-off
//!                                                             ┌─────────────────┐
//!                                                             │  Authenticator  │
//!                                                             └─────────────────┘
//! ```
//!
//! ## Layers
//!
//! 1. **Protocol**: newline-terminated handshake tokens and the per-connection state machine
//! 2. **Hand-off**: single-flight re-acquisition of the shared identity
//! 3. **Proxy**: SOCKS5 engine and the bidirectional relay loop
//! 4. **Server / Client**: connection lifecycle, liveness sweep, heartbeats

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod auth;
pub mod error;
pub mod protocol;
pub mod proxy;

#[cfg(feature = "server")]
pub mod server;

#[cfg(feature = "client")]
pub mod client;

pub use auth::{AuthOutcome, Authenticator};
pub use error::{Error, Result};

/// Default tunnel server port
pub const DEFAULT_SERVER_PORT: u16 = 8888;

/// Default local SOCKS5 port on the client
pub const DEFAULT_PROXY_PORT: u16 = 1080;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ports_match_configs() {
        #[cfg(feature = "server")]
        assert_eq!(server::ServerConfig::default().listen_port, DEFAULT_SERVER_PORT);
        #[cfg(feature = "client")]
        {
            let config = client::ClientConfig::new("10.0.0.9");
            assert_eq!(config.server_port, DEFAULT_SERVER_PORT);
            assert_eq!(config.proxy_port, DEFAULT_PROXY_PORT);
        }
    }
}
