//! SOCKS5 engine and relay loop.
//!
//! Server side: each tunnelled stream is terminated by the SOCKS5 engine and
//! relayed to the public target. Client side: local application sockets are
//! pumped into tunnel data connections by the same relay loop.

pub mod relay;
pub mod socks5;

pub use relay::{relay, RelayConfig, RelayEnd, RelayStats};
pub use socks5::{Reply, Socks5Config, Socks5Request, TargetAddr};
