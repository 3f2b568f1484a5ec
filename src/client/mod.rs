//! Tunnel client, run on the host that borrows the network identity.
//!
//! The client opens one control connection, asks the server to take the
//! identity back, and then exposes a local SOCKS5 port. Each local
//! application connection gets its own tunnel data connection; the bytes
//! are pumped untouched, so the SOCKS5 dialogue itself happens between the
//! application and the server's engine.
//!
//! Data connections are tied to the control connection by a random session
//! token that the client announces in its `REPORT_IP`.

pub mod config;

pub use config::ClientConfig;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::protocol::{read_message_timeout, write_message, Message};
use crate::proxy::relay;

/// Tunnel client with an established control connection.
pub struct TunnelClient {
    config: Arc<ClientConfig>,
    hello_ip: IpAddr,
    session: String,
    control: TcpStream,
    listener: TcpListener,
    cancel: CancellationToken,
}

impl TunnelClient {
    /// Open the control connection, complete the hand-off and bind the local
    /// SOCKS5 listener.
    ///
    /// `hello_ip` is the address announced in `HELLO`; when `None`, the local
    /// address of the control socket is used. Opening the control connection
    /// is retried per the configuration; a refused hand-off is not.
    pub async fn connect(config: ClientConfig, hello_ip: Option<IpAddr>) -> Result<Self> {
        config.validate().map_err(Error::config)?;

        let (mut control, hello_ip) = Self::open_control(&config, hello_ip).await?;
        let session = new_session_token();
        Self::handoff(&config, &mut control, hello_ip, &session).await?;

        let listener = TcpListener::bind(("127.0.0.1", config.proxy_port)).await?;
        tracing::info!(
            "Hand-off complete, SOCKS5 proxy on {}",
            listener.local_addr()?
        );

        Ok(Self {
            config: Arc::new(config),
            hello_ip,
            session,
            control,
            listener,
            cancel: CancellationToken::new(),
        })
    }

    /// Address of the local SOCKS5 listener.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Session token sent on data connections.
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the client.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Serve local applications until stopped or the control connection fails.
    pub async fn run(self) -> Result<()> {
        let TunnelClient {
            config,
            hello_ip,
            session,
            control,
            listener,
            cancel,
        } = self;
        let session: Arc<str> = session.into();

        let heartbeat = tokio::spawn(heartbeat_loop(
            control,
            config.heartbeat_interval(),
            config.connect_timeout(),
            cancel.clone(),
        ));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((local, peer)) => {
                        let config = Arc::clone(&config);
                        let session = Arc::clone(&session);
                        let cancel = cancel.child_token();
                        tokio::spawn(async move {
                            if let Err(e) =
                                Self::handle_local(&config, hello_ip, &session, local, &cancel).await
                            {
                                tracing::debug!("Local connection error from {}: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Accept error: {}", e);
                    }
                },
            }
        }

        drop(listener);
        cancel.cancel();
        tracing::info!("Tunnel client stopped");

        match heartbeat.await {
            Ok(result) => result,
            Err(_) => Err(Error::Cancelled),
        }
    }

    async fn open_control(
        config: &ClientConfig,
        hello_ip: Option<IpAddr>,
    ) -> Result<(TcpStream, IpAddr)> {
        let attempts = config.connect_retries.max(1);

        for attempt in 1..=attempts {
            match Self::try_open_control(config, hello_ip).await {
                Ok(opened) => return Ok(opened),
                Err(e) if e.is_recoverable() && attempt < attempts => {
                    tracing::warn!(
                        "Connection attempt {}/{} to {} failed: {}, retrying in {:?}",
                        attempt,
                        attempts,
                        config.server_endpoint(),
                        e,
                        config.connect_retry_delay()
                    );
                    tokio::time::sleep(config.connect_retry_delay()).await;
                }
                Err(e) if e.is_recoverable() => {
                    tracing::error!("Connection attempt {}/{} failed: {}", attempt, attempts, e);
                    return Err(Error::RetriesExhausted(attempts));
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::RetriesExhausted(attempts))
    }

    async fn try_open_control(
        config: &ClientConfig,
        hello_ip: Option<IpAddr>,
    ) -> Result<(TcpStream, IpAddr)> {
        let mut stream = dial(config).await?;
        let ip = match hello_ip {
            Some(ip) => ip,
            None => stream.local_addr()?.ip(),
        };

        write_message(&mut stream, &Message::control_hello(ip)).await?;
        expect(&mut stream, Message::Ok, config.connect_timeout()).await?;
        tracing::debug!("Control connection open as {}", ip);
        Ok((stream, ip))
    }

    async fn handoff(
        config: &ClientConfig,
        control: &mut TcpStream,
        ip: IpAddr,
        session: &str,
    ) -> Result<()> {
        write_message(control, &Message::report_ip(ip, session)).await?;

        match read_message_timeout(control, config.handoff_timeout()).await? {
            Message::LoginSuccess => Ok(()),
            Message::LoginFailed => Err(Error::HandoffFailed(
                "server could not reclaim the identity".to_string(),
            )),
            other => Err(Error::protocol(format!(
                "expected LOGIN_SUCCESS or LOGIN_FAILED, got {}",
                other.name()
            ))),
        }
    }

    async fn handle_local(
        config: &ClientConfig,
        hello_ip: IpAddr,
        session: &str,
        local: TcpStream,
        cancel: &CancellationToken,
    ) -> Result<()> {
        local.set_nodelay(true)?;

        let mut tunnel = dial(config).await?;
        write_message(&mut tunnel, &Message::data_hello(hello_ip, session)).await?;
        expect(&mut tunnel, Message::Ok, config.connect_timeout()).await?;

        let stats = relay(local, tunnel, config.relay(), cancel, |_| {}).await?;
        tracing::debug!(
            "Stream finished ({:?}): {} bytes up, {} bytes down",
            stats.end,
            stats.uplink,
            stats.downlink
        );
        Ok(())
    }
}

async fn dial(config: &ClientConfig) -> Result<TcpStream> {
    let limit = config.connect_timeout();
    let stream = timeout(limit, TcpStream::connect(config.server_endpoint()))
        .await
        .map_err(|_| Error::Timeout(limit.as_millis() as u64))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn expect(stream: &mut TcpStream, wanted: Message, limit: Duration) -> Result<()> {
    let got = read_message_timeout(stream, limit).await?;
    if got != wanted {
        return Err(Error::protocol(format!(
            "expected {}, got {}",
            wanted.name(),
            got.name()
        )));
    }
    Ok(())
}

/// Keep the idle control connection alive. A missed acknowledgement is
/// tolerated; an I/O failure ends the session.
async fn heartbeat_loop(
    mut control: TcpStream,
    period: Duration,
    limit: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }

        let result = async {
            write_message(&mut control, &Message::Heartbeat).await?;
            read_message_timeout(&mut control, limit).await
        }
        .await;

        match result {
            Ok(Message::HeartbeatAck) => tracing::trace!("heartbeat acknowledged"),
            Ok(other) => {
                cancel.cancel();
                return Err(Error::protocol(format!(
                    "expected HEARTBEAT_ACK, got {}",
                    other.name()
                )));
            }
            Err(Error::Timeout(ms)) => {
                tracing::warn!("Heartbeat not acknowledged within {}ms", ms);
            }
            Err(e) => {
                tracing::error!("Control connection lost: {}", e);
                cancel.cancel();
                return Err(e);
            }
        }
    }
}

/// Random token naming this client's session on the server.
fn new_session_token() -> String {
    format!("{:016x}", rand::thread_rng().gen::<u64>())
}
