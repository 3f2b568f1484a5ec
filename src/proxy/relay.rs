//! Bidirectional byte relay between two live sockets.
//!
//! One task multiplexes readiness on both sides with `select!`, forwards each
//! chunk verbatim to the opposite side and reports activity to a liveness
//! hook. Either side closing, any I/O error, or cancellation ends the relay.
//! Idle periods are not errors: the loop wakes every `idle_poll` and keeps
//! waiting, leaving idle reaping to the server's liveness sweep.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Default relay buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default idle wake-up period.
pub const DEFAULT_IDLE_POLL: Duration = Duration::from_secs(60);

/// Relay tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    /// Per-direction read buffer size
    pub buffer_size: usize,
    /// How long to wait with no readable socket before a no-op wake-up
    pub idle_poll: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_poll: DEFAULT_IDLE_POLL,
        }
    }
}

/// Why a relay finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// Local side sent EOF
    LocalClosed,
    /// Remote side sent EOF
    RemoteClosed,
    /// Cancellation token fired
    Cancelled,
}

/// Byte counters for one finished relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes copied local → remote
    pub uplink: u64,
    /// Bytes copied remote → local
    pub downlink: u64,
    /// How the relay ended
    pub end: RelayEnd,
}

/// Relay bytes between `local` and `remote` until one side closes.
///
/// `on_activity` runs after every forwarded chunk; tunnel connections use it to
/// refresh their liveness timestamp so long-lived streams are never evicted
/// while traffic flows. Both streams are shut down before returning.
pub async fn relay<L, R, F>(
    local: L,
    remote: R,
    config: RelayConfig,
    cancel: &CancellationToken,
    mut on_activity: F,
) -> Result<RelayStats>
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(usize),
{
    let (mut local_reader, mut local_writer) = tokio::io::split(local);
    let (mut remote_reader, mut remote_writer) = tokio::io::split(remote);

    let mut up_buf = vec![0u8; config.buffer_size.max(1)];
    let mut down_buf = vec![0u8; config.buffer_size.max(1)];
    let mut uplink = 0u64;
    let mut downlink = 0u64;

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(RelayEnd::Cancelled),
            read = local_reader.read(&mut up_buf) => match read {
                Ok(0) => break Ok(RelayEnd::LocalClosed),
                Ok(n) => {
                    if let Err(e) = remote_writer.write_all(&up_buf[..n]).await {
                        break Err(Error::Network(e));
                    }
                    uplink += n as u64;
                    on_activity(n);
                }
                Err(e) => break Err(Error::Network(e)),
            },
            read = remote_reader.read(&mut down_buf) => match read {
                Ok(0) => break Ok(RelayEnd::RemoteClosed),
                Ok(n) => {
                    if let Err(e) = local_writer.write_all(&down_buf[..n]).await {
                        break Err(Error::Network(e));
                    }
                    downlink += n as u64;
                    on_activity(n);
                }
                Err(e) => break Err(Error::Network(e)),
            },
            _ = tokio::time::sleep(config.idle_poll) => {
                tracing::trace!("relay idle for {:?}", config.idle_poll);
            }
        }
    };

    let _ = local_writer.shutdown().await;
    let _ = remote_writer.shutdown().await;

    result.map(|end| RelayStats {
        uplink,
        downlink,
        end,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_relay_both_directions_in_order() {
        let (local, mut app) = tokio::io::duplex(1024);
        let (remote, mut target) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(async move {
            let mut touches = 0usize;
            let stats = relay(local, remote, RelayConfig::default(), &cancel, |_| touches += 1)
                .await
                .unwrap();
            (stats, touches)
        });

        app.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut req = [0u8; 18];
        target.read_exact(&mut req).await.unwrap();
        assert_eq!(&req, b"GET / HTTP/1.1\r\n\r\n");

        target.write_all(b"HTTP/1.1 200 OK\r\n").await.unwrap();
        target.write_all(b"\r\nbody").await.unwrap();
        let mut resp = [0u8; 23];
        app.read_exact(&mut resp).await.unwrap();
        assert_eq!(&resp, b"HTTP/1.1 200 OK\r\n\r\nbody");

        drop(target);
        let (stats, touches) = handle.await.unwrap();
        assert_eq!(stats.uplink, 18);
        assert_eq!(stats.downlink, 23);
        assert_eq!(stats.end, RelayEnd::RemoteClosed);
        assert!(touches >= 2);
    }

    #[tokio::test]
    async fn test_relay_local_close_ends_loop() {
        let (local, app) = tokio::io::duplex(64);
        let (remote, mut target) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();

        drop(app);
        let stats = relay(local, remote, RelayConfig::default(), &cancel, |_| {})
            .await
            .unwrap();
        assert_eq!(stats.end, RelayEnd::LocalClosed);

        // Remote side observes the shutdown
        let mut buf = [0u8; 1];
        assert_eq!(target.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_relay_idle_is_not_an_error() {
        let (local, _app) = tokio::io::duplex(64);
        let (remote, _target) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        let config = RelayConfig {
            buffer_size: 64,
            idle_poll: Duration::from_millis(5),
        };

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let stats = relay(local, remote, config, &cancel, |_| {}).await.unwrap();
        assert_eq!(stats.end, RelayEnd::Cancelled);
        assert_eq!(stats.uplink + stats.downlink, 0);
    }
}
