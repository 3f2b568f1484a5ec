//! Session hand-off coordinator.
//!
//! Owns the single shared network identity. Every path that needs the
//! upstream authenticator goes through here, and concurrent requests are
//! collapsed into one authentication run: the first caller starts it, later
//! callers wait for the same outcome.
//!
//! The authentication run is spawned as its own task, so a waiter that gets
//! cancelled (its connection dropped) never leaves the coordinator stuck
//! with a half-finished run.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::auth::Authenticator;

/// Hand-off request produced by a control connection's `REPORT_IP`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffRequest {
    /// IP the peer reported
    pub peer_ip: IpAddr,
    /// Control connection that asked
    pub connection_id: String,
}

/// Outcome of one hand-off, shared by every caller that waited on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffOutcome {
    /// Whether the identity is held by this host again
    pub granted: bool,
    /// Authenticator message, passed through verbatim
    pub message: String,
    /// Address the upstream system assigned, if reported
    pub assigned_ip: Option<String>,
}

impl HandoffOutcome {
    fn aborted() -> Self {
        Self {
            granted: false,
            message: "hand-off aborted".into(),
            assigned_ip: None,
        }
    }
}

/// The identity currently held by this host.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Address assigned by the upstream system
    pub owner_ip: Option<String>,
    /// Peer whose request caused the last acquisition, if any
    pub requested_by: Option<IpAddr>,
    /// When it was acquired
    pub acquired_at: Instant,
    /// Increases by one on every successful acquisition
    pub generation: u64,
}

#[derive(Debug, Clone)]
enum Reason {
    Startup,
    Handoff(HandoffRequest),
}

type Flight = watch::Receiver<Option<HandoffOutcome>>;

/// Serializes identity acquisition.
#[derive(Clone)]
pub struct HandoffCoordinator {
    authenticator: Arc<dyn Authenticator>,
    in_flight: Arc<Mutex<Option<Flight>>>,
    identity: Arc<Mutex<Option<Identity>>>,
    generation: Arc<AtomicU64>,
    runs: Arc<AtomicU64>,
}

impl HandoffCoordinator {
    /// Create a coordinator around `authenticator`.
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            authenticator,
            in_flight: Arc::new(Mutex::new(None)),
            identity: Arc::new(Mutex::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
            runs: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Re-acquire the identity on behalf of a control connection.
    pub async fn request_handoff(&self, request: HandoffRequest) -> HandoffOutcome {
        self.single_flight(Reason::Handoff(request)).await
    }

    /// Acquire the identity at start-up.
    pub async fn acquire(&self) -> HandoffOutcome {
        self.single_flight(Reason::Startup).await
    }

    /// Release the identity upstream and forget it locally.
    pub async fn release(&self) -> bool {
        let released = self.authenticator.deauthenticate().await;
        if let Some(identity) = self.identity.lock().take() {
            tracing::info!(
                "released identity (generation {}, held {:?})",
                identity.generation,
                identity.acquired_at.elapsed()
            );
        }
        if !released {
            tracing::warn!("upstream did not confirm logout");
        }
        released
    }

    /// Currently held identity.
    pub fn identity(&self) -> Option<Identity> {
        self.identity.lock().clone()
    }

    /// Number of authentication runs started so far.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    /// Whether an authentication run is in progress.
    pub fn is_busy(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    async fn single_flight(&self, reason: Reason) -> HandoffOutcome {
        let mut flight = {
            let mut slot = self.in_flight.lock();
            match slot.as_ref() {
                Some(flight) => {
                    tracing::debug!("{}: joining hand-off in progress", describe(&reason));
                    flight.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx.clone());
                    self.start_run(reason, tx);
                    rx
                }
            }
        };

        let outcome = match flight.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or_else(HandoffOutcome::aborted),
            Err(_) => HandoffOutcome::aborted(),
        };
        outcome
    }

    fn start_run(&self, reason: Reason, tx: watch::Sender<Option<HandoffOutcome>>) {
        let run = self.runs.fetch_add(1, Ordering::Relaxed) + 1;
        let authenticator = Arc::clone(&self.authenticator);
        let in_flight = Arc::clone(&self.in_flight);
        let identity = Arc::clone(&self.identity);
        let generation = Arc::clone(&self.generation);

        tracing::info!("{}: acquiring identity (run {})", describe(&reason), run);

        tokio::spawn(async move {
            let auth = authenticator.authenticate().await;
            let outcome = HandoffOutcome {
                granted: auth.success,
                message: auth.message,
                assigned_ip: auth.ip,
            };

            if outcome.granted {
                let generation = generation.fetch_add(1, Ordering::Relaxed) + 1;
                let requested_by = match &reason {
                    Reason::Startup => None,
                    Reason::Handoff(request) => Some(request.peer_ip),
                };
                *identity.lock() = Some(Identity {
                    owner_ip: outcome.assigned_ip.clone(),
                    requested_by,
                    acquired_at: Instant::now(),
                    generation,
                });
                tracing::info!(
                    "{}: identity acquired (ip {})",
                    describe(&reason),
                    outcome.assigned_ip.as_deref().unwrap_or("unknown")
                );
            } else {
                identity.lock().take();
                tracing::error!("{}: identity not acquired: {}", describe(&reason), outcome.message);
            }

            // Clear before publishing so callers arriving later start a new run
            in_flight.lock().take();
            let _ = tx.send(Some(outcome));
        });
    }
}

fn describe(reason: &Reason) -> String {
    match reason {
        Reason::Startup => "startup login".to_string(),
        Reason::Handoff(request) => format!(
            "[{}] hand-off for {}",
            request.connection_id, request.peer_ip
        ),
    }
}
