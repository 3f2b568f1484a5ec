//! Live tunnel connection registry.
//!
//! One map of connections keyed by connection id (canonical remote endpoint)
//! plus the set of established client sessions keyed by the client's session
//! token, both behind a single lock.
//! `add`, `remove`, `open_session` and `sweep` are the only mutators.
//! Liveness timestamps live on each connection and are refreshed without
//! touching the registry lock.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::protocol::{ConnectionRole, HandshakeState};

/// Connection identifier: the peer's `ip:port` as seen by the server, with
/// IPv4-mapped IPv6 addresses folded back to IPv4.
pub type ConnectionId = String;

/// Build the connection id for a peer address.
pub fn connection_id(peer: SocketAddr) -> ConnectionId {
    SocketAddr::new(peer.ip().to_canonical(), peer.port()).to_string()
}

/// One physical tunnel connection.
#[derive(Debug)]
pub struct TunnelConnection {
    id: ConnectionId,
    created_at: Instant,
    last_seen: Mutex<Instant>,
    state: Mutex<HandshakeState>,
    peer_ip: Mutex<Option<IpAddr>>,
    session: Mutex<Option<String>>,
    /// Set when this connection switches from control to carrying a stream
    relaying: Mutex<bool>,
    cancel: CancellationToken,
    bytes_relayed: AtomicU64,
}

impl TunnelConnection {
    fn new(id: ConnectionId, cancel: CancellationToken) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_seen: Mutex::new(now),
            state: Mutex::new(HandshakeState::AwaitHello),
            peer_ip: Mutex::new(None),
            session: Mutex::new(None),
            relaying: Mutex::new(false),
            cancel,
            bytes_relayed: AtomicU64::new(0),
        }
    }

    /// Connection id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Token cancelled when the connection is force-closed.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Refresh the liveness timestamp.
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Record relayed traffic and refresh liveness.
    pub fn record_traffic(&self, bytes: usize) {
        self.bytes_relayed.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    /// Time since the last refresh.
    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Current handshake state.
    pub fn state(&self) -> HandshakeState {
        *self.state.lock()
    }

    /// Store a new handshake state.
    pub fn set_state(&self, state: HandshakeState) {
        *self.state.lock() = state;
    }

    /// Role, once the `HELLO` has been seen.
    pub fn role(&self) -> Option<ConnectionRole> {
        if *self.relaying.lock() {
            return Some(ConnectionRole::Data);
        }
        self.state().role()
    }

    /// Mark a control connection as now carrying a SOCKS5 stream.
    pub fn begin_relaying(&self) {
        *self.relaying.lock() = true;
    }

    /// IP claimed in `HELLO`.
    pub fn peer_ip(&self) -> Option<IpAddr> {
        *self.peer_ip.lock()
    }

    /// Record the IP claimed in `HELLO`.
    pub fn set_peer_ip(&self, ip: IpAddr) {
        *self.peer_ip.lock() = Some(ip);
    }

    /// Session opened by this control connection.
    pub fn session(&self) -> Option<String> {
        self.session.lock().clone()
    }

    /// Snapshot for diagnostics.
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            id: self.id.clone(),
            role: self.role(),
            state: self.state(),
            peer_ip: self.peer_ip(),
            session: self.session(),
            age: self.created_at.elapsed(),
            idle: self.idle_for(),
            bytes_relayed: self.bytes_relayed.load(Ordering::Relaxed),
        }
    }
}

/// Connection statistics.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// Connection id
    pub id: ConnectionId,
    /// Role, once known
    pub role: Option<ConnectionRole>,
    /// Handshake state
    pub state: HandshakeState,
    /// IP claimed in `HELLO`
    pub peer_ip: Option<IpAddr>,
    /// Session this control connection opened
    pub session: Option<String>,
    /// Time since accept
    pub age: Duration,
    /// Time since the last liveness refresh
    pub idle: Duration,
    /// Bytes relayed in both directions
    pub bytes_relayed: u64,
}

#[derive(Debug, Clone)]
struct Session {
    control: ConnectionId,
    peer_ip: IpAddr,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Arc<TunnelConnection>>,
    /// Session token → owning control connection, for sessions past the hand-off
    sessions: HashMap<String, Session>,
}

impl Inner {
    fn drop_connection(&mut self, id: &str) -> Option<Arc<TunnelConnection>> {
        let conn = self.connections.remove(id)?;
        if let Some(token) = conn.session() {
            // A reconnected control may have taken the token over
            if self.sessions.get(&token).is_some_and(|s| s.control == id) {
                self.sessions.remove(&token);
            }
        }
        Some(conn)
    }
}

/// Registry of all live tunnel connections.
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
    root: CancellationToken,
}

impl ConnectionRegistry {
    /// Create an empty registry. Connection tokens are children of `root`.
    pub fn new(root: CancellationToken) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            root,
        }
    }

    /// Register a freshly accepted connection.
    pub fn add(&self, id: impl Into<ConnectionId>) -> Arc<TunnelConnection> {
        let id = id.into();
        let conn = Arc::new(TunnelConnection::new(id.clone(), self.root.child_token()));

        let replaced = self.inner.write().connections.insert(id, Arc::clone(&conn));
        if let Some(old) = replaced {
            old.cancel.cancel();
        }
        conn
    }

    /// Remove a connection. Ends its session if it was a control connection.
    ///
    /// `conn` must be the registered instance; a newer connection that reused
    /// the same id is left alone.
    pub fn remove(&self, conn: &TunnelConnection) {
        let mut inner = self.inner.write();
        let current = inner
            .connections
            .get(&conn.id)
            .is_some_and(|c| std::ptr::eq(c.as_ref(), conn));
        if current {
            inner.drop_connection(&conn.id);
        }
    }

    /// Record that `control` completed its hand-off and now owns `token`.
    ///
    /// Returns `false` if `control` is no longer registered.
    pub fn open_session(
        &self,
        control: &TunnelConnection,
        token: impl Into<String>,
        peer_ip: IpAddr,
    ) -> bool {
        let token = token.into();
        let mut inner = self.inner.write();
        if !inner.connections.contains_key(&control.id) {
            return false;
        }
        *control.session.lock() = Some(token.clone());
        let session = Session {
            control: control.id.clone(),
            peer_ip,
        };
        if let Some(old) = inner.sessions.insert(token, session) {
            if old.control != control.id {
                tracing::debug!("[{}] session taken over from {}", control.id, old.control);
            }
        }
        true
    }

    /// Peer IP of an established session.
    pub fn session(&self, token: &str) -> Option<IpAddr> {
        self.inner.read().sessions.get(token).map(|s| s.peer_ip)
    }

    /// Get a connection by id.
    pub fn get(&self, id: &str) -> Option<Arc<TunnelConnection>> {
        self.inner.read().connections.get(id).cloned()
    }

    /// Number of live connections.
    pub fn count(&self) -> usize {
        self.inner.read().connections.len()
    }

    /// Number of established sessions.
    pub fn session_count(&self) -> usize {
        self.inner.read().sessions.len()
    }

    /// Force-close and remove every connection idle for longer than `max_idle`.
    ///
    /// Returns the evicted ids.
    pub fn sweep(&self, max_idle: Duration) -> Vec<ConnectionId> {
        let expired: Vec<ConnectionId> = {
            let inner = self.inner.read();
            inner
                .connections
                .values()
                .filter(|c| c.idle_for() > max_idle)
                .map(|c| c.id.clone())
                .collect()
        };

        if expired.is_empty() {
            return expired;
        }

        let mut inner = self.inner.write();
        let mut evicted = Vec::with_capacity(expired.len());
        for id in expired {
            // Re-check under the write lock; traffic may have refreshed it
            let still_idle = inner
                .connections
                .get(&id)
                .is_some_and(|c| c.idle_for() > max_idle);
            if !still_idle {
                continue;
            }
            if let Some(conn) = inner.drop_connection(&id) {
                conn.cancel.cancel();
                evicted.push(id);
            }
        }
        evicted
    }

    /// Periodically sweep until `cancel` fires, reporting each batch of evictions.
    pub async fn run_sweeper<F>(
        &self,
        interval: Duration,
        max_idle: Duration,
        cancel: CancellationToken,
        mut on_evict: F,
    ) where
        F: FnMut(&[ConnectionId]),
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let evicted = self.sweep(max_idle);
                    for id in &evicted {
                        tracing::warn!("[{}] liveness timeout, closing", id);
                    }
                    if !evicted.is_empty() {
                        on_evict(&evicted);
                    }
                    let count = self.count();
                    if count > 0 {
                        tracing::debug!("{} live tunnel connections", count);
                    }
                }
            }
        }
    }

    /// Close every connection and clear the registry.
    pub fn close_all(&self) -> usize {
        let mut inner = self.inner.write();
        let closed = inner.connections.len();
        for conn in inner.connections.values() {
            conn.cancel.cancel();
        }
        inner.connections.clear();
        inner.sessions.clear();
        closed
    }

    /// Statistics for all connections.
    pub fn all_stats(&self) -> Vec<ConnectionStats> {
        self.inner
            .read()
            .connections
            .values()
            .map(|c| c.stats())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(CancellationToken::new())
    }

    #[test]
    fn test_add_and_remove() {
        let registry = registry();
        let conn = registry.add("10.0.0.5:40000");
        assert_eq!(registry.count(), 1);
        assert_eq!(conn.state(), HandshakeState::AwaitHello);
        assert_eq!(conn.role(), None);

        registry.remove(&conn);
        assert_eq!(registry.count(), 0);
        assert!(registry.get("10.0.0.5:40000").is_none());
    }

    #[test]
    fn test_remove_ignores_replaced_instance() {
        let registry = registry();
        let old = registry.add("10.0.0.5:40000");
        let new = registry.add("10.0.0.5:40000");
        assert!(old.cancel_token().is_cancelled());

        registry.remove(&old);
        assert!(registry.get("10.0.0.5:40000").is_some());
        registry.remove(&new);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_session_lifetime_follows_control() {
        let registry = registry();
        let control = registry.add("10.0.0.5:40000");
        let ip: IpAddr = "10.0.0.5".parse().unwrap();

        assert!(registry.session("5be0c2a19d7f3e64").is_none());
        assert!(registry.open_session(&control, "5be0c2a19d7f3e64", ip));
        assert_eq!(registry.session("5be0c2a19d7f3e64"), Some(ip));
        assert!(registry.session(control.id()).is_none());
        assert_eq!(control.stats().session.as_deref(), Some("5be0c2a19d7f3e64"));
        assert_eq!(registry.session_count(), 1);

        registry.remove(&control);
        assert!(registry.session("5be0c2a19d7f3e64").is_none());
        assert!(!registry.open_session(&control, "5be0c2a19d7f3e64", ip));
        assert_eq!(registry.session_count(), 0);
    }

    #[test]
    fn test_reconnected_control_keeps_session() {
        let registry = registry();
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        let first = registry.add("10.0.0.5:40000");
        let second = registry.add("10.0.0.5:40001");

        registry.open_session(&first, "5be0c2a19d7f3e64", ip);
        registry.open_session(&second, "5be0c2a19d7f3e64", ip);
        registry.remove(&first);
        assert_eq!(registry.session("5be0c2a19d7f3e64"), Some(ip));

        registry.remove(&second);
        assert_eq!(registry.session_count(), 0);
    }

    #[test]
    fn test_connection_id_folds_mapped_ipv4() {
        let mapped: SocketAddr = "[::ffff:127.0.0.1]:51000".parse().unwrap();
        let plain: SocketAddr = "127.0.0.1:51000".parse().unwrap();
        let v6: SocketAddr = "[fe80::1]:51000".parse().unwrap();

        assert_eq!(connection_id(mapped), "127.0.0.1:51000");
        assert_eq!(connection_id(plain), connection_id(mapped));
        assert_eq!(connection_id(v6), "[fe80::1]:51000");
    }

    #[test]
    fn test_relaying_control_reports_data_role() {
        let registry = registry();
        let conn = registry.add("10.0.0.5:40000");
        conn.set_state(HandshakeState::HandoffDone);
        assert_eq!(conn.role(), Some(ConnectionRole::Control));
        conn.begin_relaying();
        assert_eq!(conn.role(), Some(ConnectionRole::Data));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refreshed_connection_survives_sweeps() {
        let registry = registry();
        let interval = Duration::from_secs(30);
        let conn = registry.add("10.0.0.5:40000");

        for _ in 0..10 {
            tokio::time::advance(interval / 2).await;
            conn.record_traffic(512);
            assert!(registry.sweep(interval * 2).is_empty());
        }
        assert!(!conn.cancel_token().is_cancelled());
        assert_eq!(conn.stats().bytes_relayed, 5120);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_connection_evicted_within_two_periods() {
        let registry = registry();
        let interval = Duration::from_secs(30);
        let silent = registry.add("10.0.0.5:40000");
        let chatty = registry.add("10.0.0.5:40001");

        tokio::time::advance(interval).await;
        chatty.touch();
        assert!(registry.sweep(interval * 2).is_empty());

        tokio::time::advance(interval + Duration::from_millis(1)).await;
        chatty.touch();
        let evicted = registry.sweep(interval * 2);
        assert_eq!(evicted, vec!["10.0.0.5:40000".to_string()]);
        assert!(silent.cancel_token().is_cancelled());
        assert!(!chatty.cancel_token().is_cancelled());
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_evicts() {
        let registry = Arc::new(registry());
        let interval = Duration::from_secs(30);
        let conn = registry.add("10.0.0.5:40000");
        let cancel = CancellationToken::new();

        let sweeper = {
            let registry = Arc::clone(&registry);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut evicted = 0;
                registry
                    .run_sweeper(interval, interval * 2, cancel, |ids| evicted += ids.len())
                    .await;
                evicted
            })
        };

        tokio::time::sleep(interval * 3 + Duration::from_secs(1)).await;
        assert!(conn.cancel_token().is_cancelled());
        assert_eq!(registry.count(), 0);

        cancel.cancel();
        assert_eq!(sweeper.await.unwrap(), 1);
    }

    #[test]
    fn test_close_all() {
        let root = CancellationToken::new();
        let registry = ConnectionRegistry::new(root.clone());
        let a = registry.add("10.0.0.5:1");
        let b = registry.add("10.0.0.6:2");
        registry.open_session(&a, "5be0c2a19d7f3e64", "10.0.0.5".parse().unwrap());

        assert_eq!(registry.close_all(), 2);
        assert!(a.cancel_token().is_cancelled());
        assert!(b.cancel_token().is_cancelled());
        assert_eq!(registry.count(), 0);
        assert_eq!(registry.session_count(), 0);
        assert!(!root.is_cancelled());
    }
}
