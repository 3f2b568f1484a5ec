//! Tunnel server, run on the host that owns the network identity.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Tunnel Server                          │
//! │  ┌────────────────┐   ┌──────────────────┐   ┌─────────────┐ │
//! │  │  TCP Listener  │──▶│  Handshake       │──▶│  Hand-off   │ │
//! │  │  (port 8888)   │   │  HELLO / OK      │   │ Coordinator │ │
//! │  └────────────────┘   └────────┬─────────┘   └──────┬──────┘ │
//! │                                │ data               │ once   │
//! │                                ▼                    ▼        │
//! │  ┌───────────────────────────────────┐   ┌────────────────┐  │
//! │  │  SOCKS5 engine + relay            │   │ Authenticator  │  │
//! │  │  (refreshes liveness per chunk)   │   │ (external)     │  │
//! │  └───────────────────────────────────┘   └────────────────┘  │
//! │                                                              │
//! │  Connection registry ◀── liveness sweep (every heartbeat)    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! A connection whose `HELLO` carries no session token is a control
//! connection: it reports its IP and session token, drives exactly one
//! hand-off, and then stays open for heartbeats or carries a SOCKS5 stream
//! itself. Every other connection names that session and goes straight to
//! SOCKS5.

pub mod config;
mod handoff;
mod metrics;
mod registry;

pub use config::{ServerConfig, ServerConfigFile};
pub use handoff::{HandoffCoordinator, HandoffOutcome, HandoffRequest, Identity};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use registry::{
    connection_id, ConnectionId, ConnectionRegistry, ConnectionStats, TunnelConnection,
};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::auth::Authenticator;
use crate::error::{Error, Result};
use crate::protocol::{
    read_message_timeout, write_message, ConnectionRole, HandshakeState, Message,
};
use crate::proxy::socks5::{self, SOCKS_VERSION};

/// State shared by the accept loop and every connection task.
struct Shared {
    config: Arc<ServerConfig>,
    registry: Arc<ConnectionRegistry>,
    coordinator: HandoffCoordinator,
    metrics: Arc<ServerMetrics>,
}

/// Main server instance.
pub struct TunnelServer {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl TunnelServer {
    /// Create a new server with the given configuration and authenticator.
    pub fn new(config: ServerConfig, authenticator: Arc<dyn Authenticator>) -> Self {
        let cancel = CancellationToken::new();

        Self {
            shared: Arc::new(Shared {
                config: Arc::new(config),
                registry: Arc::new(ConnectionRegistry::new(cancel.child_token())),
                coordinator: HandoffCoordinator::new(authenticator),
                metrics: Arc::new(ServerMetrics::new()),
            }),
            cancel,
        }
    }

    /// Acquire the identity if configured to, then listen and serve until stopped.
    pub async fn run(&self) -> Result<()> {
        if self.shared.config.login_on_start {
            let outcome = self.shared.coordinator.acquire().await;
            if !outcome.granted {
                return Err(Error::HandoffFailed(outcome.message));
            }
        }

        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.shared.config.bind_addr();
        let listener = TcpListener::bind(&addr).await?;
        Ok(listener)
    }

    /// Serve tunnel connections on `listener` until [`stop`](Self::stop) is called.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let config = &self.shared.config;
        tracing::info!("Tunnel server listening on {}", listener.local_addr()?);

        let registry = Arc::clone(&self.shared.registry);
        let metrics = Arc::clone(&self.shared.metrics);
        let interval = config.heartbeat_interval;
        let max_idle = config.liveness_timeout();
        let sweep_cancel = self.cancel.child_token();
        tokio::spawn(async move {
            registry
                .run_sweeper(interval, max_idle, sweep_cancel, |ids| {
                    metrics.add_evictions(ids.len() as u64)
                })
                .await;
        });

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let shared = Arc::clone(&self.shared);
                        tokio::spawn(async move {
                            Self::handle_connection(shared, stream, peer_addr).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Accept error: {}", e);
                    }
                },
            }
        }

        let closed = self.shared.registry.close_all();
        tracing::info!("Tunnel server stopped, closed {} connections", closed);
        Ok(())
    }

    /// Stop listening, close every connection and optionally release the identity.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.shared.registry.close_all();

        if self.shared.config.release_on_shutdown {
            self.shared.coordinator.release().await;
        }
    }

    async fn handle_connection(shared: Arc<Shared>, stream: TcpStream, peer_addr: SocketAddr) {
        let conn = shared.registry.add(connection_id(peer_addr));
        shared.metrics.increment_connections();
        tracing::debug!("[{}] accepted", conn.id());

        let cancel = conn.cancel_token().clone();
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = Self::run_connection(&shared, &conn, stream) => result,
        };

        conn.set_state(HandshakeState::Closed);
        shared.registry.remove(&conn);
        shared.metrics.decrement_connections();

        match result {
            Ok(()) => tracing::debug!("[{}] closed", conn.id()),
            Err(e) if e.is_protocol_violation() => {
                shared.metrics.increment_protocol_violations();
                tracing::warn!("[{}] protocol violation: {}", conn.id(), e);
            }
            Err(Error::Timeout(ms)) => {
                shared.metrics.increment_handshake_timeouts();
                tracing::debug!("[{}] handshake timed out after {}ms", conn.id(), ms);
            }
            Err(e @ Error::TargetUnreachable { .. }) => {
                shared.metrics.increment_target_failures();
                tracing::debug!("[{}] {}", conn.id(), e);
            }
            Err(e) => tracing::debug!("Connection error from {}: {}", conn.id(), e),
        }
    }

    async fn run_connection(
        shared: &Shared,
        conn: &Arc<TunnelConnection>,
        mut stream: TcpStream,
    ) -> Result<()> {
        stream.set_nodelay(true)?;
        let timeout = shared.config.handshake_timeout;

        let hello = read_message_timeout(&mut stream, timeout).await?;
        let state = conn.state().on_message(&hello)?;
        let Message::Hello { ip, session } = hello else {
            return Err(Error::protocol("expected HELLO"));
        };
        conn.set_peer_ip(ip);

        match session {
            Some(session) => {
                if shared.registry.session(&session).is_none() {
                    return Err(Error::UnknownSession(session));
                }
                conn.set_state(state);
                write_message(&mut stream, &Message::Ok).await?;
                shared.metrics.record_role(ConnectionRole::Data);
                tracing::debug!("[{}] data connection for session {}", conn.id(), session);

                Self::serve_socks5(shared, conn, stream).await
            }
            None => {
                conn.set_state(state);
                write_message(&mut stream, &Message::Ok).await?;
                shared.metrics.record_role(ConnectionRole::Control);
                tracing::info!("[{}] control connection from {}", conn.id(), ip);

                Self::run_control(shared, conn, stream).await
            }
        }
    }

    async fn run_control(
        shared: &Shared,
        conn: &Arc<TunnelConnection>,
        mut stream: TcpStream,
    ) -> Result<()> {
        let timeout = shared.config.handshake_timeout;

        let report = read_message_timeout(&mut stream, timeout).await?;
        let state = conn.state().on_message(&report)?;
        let Message::ReportIp {
            ip: reported,
            session,
        } = report
        else {
            return Err(Error::protocol("expected REPORT_IP"));
        };
        conn.set_state(state);
        if Some(reported) != conn.peer_ip() {
            tracing::debug!("[{}] reported IP {} differs from HELLO", conn.id(), reported);
        }
        let session = session.unwrap_or_else(|| conn.id().to_string());

        // The authenticator may retry for longer than the liveness window
        let handoff = shared.coordinator.request_handoff(HandoffRequest {
            peer_ip: reported,
            connection_id: conn.id().to_string(),
        });
        tokio::pin!(handoff);
        let keepalive = (shared.config.heartbeat_interval / 2).max(Duration::from_millis(1));
        let mut keepalive = tokio::time::interval(keepalive);
        let outcome = loop {
            tokio::select! {
                outcome = &mut handoff => break outcome,
                _ = keepalive.tick() => conn.touch(),
            }
        };
        shared.metrics.record_handoff(outcome.granted);
        conn.set_state(conn.state().on_handoff(outcome.granted)?);

        if !outcome.granted {
            write_message(&mut stream, &Message::LoginFailed).await?;
            return Err(Error::HandoffFailed(outcome.message));
        }

        if !shared.registry.open_session(conn, session.as_str(), reported) {
            return Err(Error::Cancelled);
        }
        conn.touch();
        write_message(&mut stream, &Message::LoginSuccess).await?;
        tracing::info!("[{}] hand-off complete, session {} open", conn.id(), session);

        // Idle control connection: heartbeats, or a SOCKS5 greeting on this socket
        let mut first = [0u8; 1];
        loop {
            if stream.peek(&mut first).await? == 0 {
                return Ok(());
            }

            if first[0] == SOCKS_VERSION {
                conn.begin_relaying();
                shared.metrics.record_role(ConnectionRole::Data);
                tracing::debug!("[{}] control connection carrying SOCKS5", conn.id());
                return Self::serve_socks5(shared, conn, stream).await;
            }

            if !first[0].is_ascii_uppercase() {
                return Err(Error::protocol(format!(
                    "unexpected byte 0x{:02x} after hand-off",
                    first[0]
                )));
            }

            let message = read_message_timeout(&mut stream, timeout).await?;
            conn.set_state(conn.state().on_message(&message)?);
            conn.touch();
            write_message(&mut stream, &Message::HeartbeatAck).await?;
            tracing::trace!("[{}] heartbeat", conn.id());
        }
    }

    async fn serve_socks5(
        shared: &Shared,
        conn: &Arc<TunnelConnection>,
        stream: TcpStream,
    ) -> Result<()> {
        let stats = socks5::serve(
            stream,
            conn.id(),
            shared.config.socks5(),
            conn.cancel_token(),
            |n| conn.record_traffic(n),
        )
        .await?;

        shared.metrics.add_relayed(stats.uplink, stats.downlink);
        Ok(())
    }

    /// Get server metrics.
    pub fn metrics(&self) -> &ServerMetrics {
        &self.shared.metrics
    }

    /// Get the hand-off coordinator.
    pub fn coordinator(&self) -> &HandoffCoordinator {
        &self.shared.coordinator
    }

    /// Get live connection count.
    pub fn connection_count(&self) -> usize {
        self.shared.registry.count()
    }

    /// Get established session count.
    pub fn session_count(&self) -> usize {
        self.shared.registry.session_count()
    }

    /// Statistics for every live connection.
    pub fn connections(&self) -> Vec<ConnectionStats> {
        self.shared.registry.all_stats()
    }

    /// Token that stops the server when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
