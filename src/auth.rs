//! Upstream authenticator seam.
//!
//! The portal walker that actually logs a host in is an external
//! collaborator. The core only sees [`Authenticator`]; this module adds a
//! retry wrapper and a shell-command adapter the binaries use.

use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

/// Result of one `authenticate()` call, passed through verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    /// Whether the identity is now held by this host
    pub success: bool,
    /// Address assigned by the upstream system, if reported
    pub ip: Option<String>,
    /// Human-readable detail
    pub message: String,
}

impl AuthOutcome {
    /// Successful outcome.
    pub fn success(ip: Option<String>, message: impl Into<String>) -> Self {
        Self {
            success: true,
            ip,
            message: message.into(),
        }
    }

    /// Failed outcome.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            ip: None,
            message: message.into(),
        }
    }
}

/// Logs this host in to / out of the upstream access-control system.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Acquire the shared identity for this host.
    async fn authenticate(&self) -> AuthOutcome;

    /// Release the identity. Returns whether the upstream confirmed it.
    async fn deauthenticate(&self) -> bool;
}

/// Fixed-delay retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Pause between attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(30),
        }
    }
}

/// Retries an inner authenticator until it succeeds or the policy runs out.
pub struct RetryingAuthenticator<A> {
    inner: A,
    policy: RetryPolicy,
}

impl<A: Authenticator> RetryingAuthenticator<A> {
    /// Wrap `inner` with `policy`.
    pub fn new(inner: A, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<A: Authenticator> Authenticator for RetryingAuthenticator<A> {
    async fn authenticate(&self) -> AuthOutcome {
        let attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=attempts {
            tracing::info!("login attempt {}/{}", attempt, attempts);
            let outcome = self.inner.authenticate().await;
            if outcome.success {
                return outcome;
            }

            if attempt < attempts {
                tracing::warn!(
                    "login failed: {}, retrying in {:?}",
                    outcome.message,
                    self.policy.delay
                );
                tokio::time::sleep(self.policy.delay).await;
            } else {
                tracing::error!("login failed: {}, giving up", outcome.message);
            }
        }

        AuthOutcome::failure(format!("login failed after {} attempts", attempts))
    }

    async fn deauthenticate(&self) -> bool {
        self.inner.deauthenticate().await
    }
}

/// Runs operator-supplied shell commands for login and logout.
///
/// Exit status 0 means success. The first stdout line that parses as an IP
/// address is reported as the assigned address.
#[derive(Debug, Clone)]
pub struct CommandAuthenticator {
    login: String,
    logout: Option<String>,
}

impl CommandAuthenticator {
    /// Create an adapter around `login` and an optional `logout` command.
    pub fn new(login: impl Into<String>, logout: Option<String>) -> Self {
        Self {
            login: login.into(),
            logout,
        }
    }
}

async fn run_shell(command: &str) -> std::io::Result<std::process::Output> {
    Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
}

#[async_trait]
impl Authenticator for CommandAuthenticator {
    async fn authenticate(&self) -> AuthOutcome {
        let output = match run_shell(&self.login).await {
            Ok(output) => output,
            Err(e) => return AuthOutcome::failure(format!("cannot run login command: {}", e)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let detail = stderr.trim();
            let detail = if detail.is_empty() { stdout.trim() } else { detail };
            return AuthOutcome::failure(format!("login command {}: {}", output.status, detail));
        }

        let ip = stdout
            .lines()
            .map(str::trim)
            .find(|line| line.parse::<IpAddr>().is_ok())
            .map(str::to_string);

        AuthOutcome::success(ip, stdout.trim().to_string())
    }

    async fn deauthenticate(&self) -> bool {
        let Some(logout) = &self.logout else {
            return false;
        };
        match run_shell(logout).await {
            Ok(output) => output.status.success(),
            Err(e) => {
                tracing::warn!("cannot run logout command: {}", e);
                false
            }
        }
    }
}
