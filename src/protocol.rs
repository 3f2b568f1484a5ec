//! Tunnel handshake protocol.
//!
//! Every tunnel connection opens with a short exchange of newline-terminated
//! UTF-8 tokens before any SOCKS5 bytes flow:
//!
//! ```text
//! control:  HELLO:<ip>                ->  OK
//!           REPORT_IP:<ip>@<session>  ->  LOGIN_SUCCESS | LOGIN_FAILED
//!           HEARTBEAT                 ->  HEARTBEAT_ACK   (repeated, idle control only)
//!
//! data:     HELLO:<ip>@<session>      ->  OK, then raw SOCKS5
//! ```
//!
//! The session token is chosen by the client and announced on the control
//! connection, so it does not depend on how either side sees the other's
//! address. A `REPORT_IP` without a token names the session after the
//! control connection's id on the server.
//!
//! Messages are read one byte at a time so that nothing past the terminator
//! is consumed from the socket.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Message terminator on the wire.
pub const MESSAGE_TERMINATOR: u8 = b'\n';

/// Longest accepted message, terminator included.
pub const MAX_MESSAGE_LEN: usize = 256;

/// Separates the IP from the session token in `HELLO` and `REPORT_IP`.
pub const SESSION_SEPARATOR: char = '@';

const HELLO: &str = "HELLO:";
const REPORT_IP: &str = "REPORT_IP:";
const OK: &str = "OK";
const LOGIN_SUCCESS: &str = "LOGIN_SUCCESS";
const LOGIN_FAILED: &str = "LOGIN_FAILED";
const HEARTBEAT: &str = "HEARTBEAT";
const HEARTBEAT_ACK: &str = "HEARTBEAT_ACK";

/// A tunnel handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Client opens a connection. `session` is present only on data connections.
    Hello {
        /// IP the client claims.
        ip: IpAddr,
        /// Session the data connection belongs to.
        session: Option<String>,
    },
    /// Server accepts the `HELLO`.
    Ok,
    /// Control connection asks for the identity hand-off and names its session.
    ReportIp {
        /// IP the client currently holds the session from.
        ip: IpAddr,
        /// Token that later data connections present in their `HELLO`.
        session: Option<String>,
    },
    /// Hand-off completed; the tunnel is usable.
    LoginSuccess,
    /// Hand-off failed; the server closes the connection.
    LoginFailed,
    /// Keepalive on an idle control connection.
    Heartbeat,
    /// Reply to [`Message::Heartbeat`].
    HeartbeatAck,
}

impl Message {
    /// Build the `HELLO` for a control connection.
    pub fn control_hello(ip: IpAddr) -> Self {
        Message::Hello { ip, session: None }
    }

    /// Build the `HELLO` for a data connection bound to `session`.
    pub fn data_hello(ip: IpAddr, session: impl Into<String>) -> Self {
        Message::Hello {
            ip,
            session: Some(session.into()),
        }
    }

    /// Build the `REPORT_IP` that opens `session` once the hand-off succeeds.
    pub fn report_ip(ip: IpAddr, session: impl Into<String>) -> Self {
        Message::ReportIp {
            ip,
            session: Some(session.into()),
        }
    }

    /// Encode the message, terminator included.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.to_string().into_bytes();
        buf.push(MESSAGE_TERMINATOR);
        buf
    }

    /// Decode one message from a line with the terminator already stripped.
    pub fn decode(line: &str) -> Result<Self> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if let Some(rest) = line.strip_prefix(HELLO) {
            let (ip, session) = split_session(rest, "HELLO")?;
            return Ok(Message::Hello { ip, session });
        }

        if let Some(rest) = line.strip_prefix(REPORT_IP) {
            let (ip, session) = split_session(rest, "REPORT_IP")?;
            return Ok(Message::ReportIp { ip, session });
        }

        match line {
            OK => Ok(Message::Ok),
            LOGIN_SUCCESS => Ok(Message::LoginSuccess),
            LOGIN_FAILED => Ok(Message::LoginFailed),
            HEARTBEAT => Ok(Message::Heartbeat),
            HEARTBEAT_ACK => Ok(Message::HeartbeatAck),
            other => Err(Error::protocol(format!("unknown message {:?}", other))),
        }
    }

    /// Short name used in logs and violation reports.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "HELLO",
            Message::Ok => "OK",
            Message::ReportIp { .. } => "REPORT_IP",
            Message::LoginSuccess => "LOGIN_SUCCESS",
            Message::LoginFailed => "LOGIN_FAILED",
            Message::Heartbeat => "HEARTBEAT",
            Message::HeartbeatAck => "HEARTBEAT_ACK",
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Hello { ip, session: None } => write!(f, "{}{}", HELLO, ip),
            Message::Hello {
                ip,
                session: Some(session),
            } => write!(f, "{}{}{}{}", HELLO, ip, SESSION_SEPARATOR, session),
            Message::Ok => f.write_str(OK),
            Message::ReportIp { ip, session: None } => write!(f, "{}{}", REPORT_IP, ip),
            Message::ReportIp {
                ip,
                session: Some(session),
            } => write!(f, "{}{}{}{}", REPORT_IP, ip, SESSION_SEPARATOR, session),
            Message::LoginSuccess => f.write_str(LOGIN_SUCCESS),
            Message::LoginFailed => f.write_str(LOGIN_FAILED),
            Message::Heartbeat => f.write_str(HEARTBEAT),
            Message::HeartbeatAck => f.write_str(HEARTBEAT_ACK),
        }
    }
}

fn split_session(rest: &str, token: &str) -> Result<(IpAddr, Option<String>)> {
    match rest.split_once(SESSION_SEPARATOR) {
        Some((ip, session)) => {
            if session.is_empty() || session.contains(char::is_whitespace) {
                return Err(Error::protocol(format!(
                    "invalid session token in {}",
                    token
                )));
            }
            Ok((parse_ip(ip)?, Some(session.to_string())))
        }
        None => Ok((parse_ip(rest)?, None)),
    }
}

fn parse_ip(s: &str) -> Result<IpAddr> {
    s.trim()
        .parse()
        .map_err(|_| Error::protocol(format!("invalid IP address {:?}", s)))
}

/// Read one message. EOF before the terminator is a protocol violation.
pub async fn read_message<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(32);
    let mut byte = [0u8; 1];

    loop {
        if reader.read(&mut byte).await? == 0 {
            return Err(Error::protocol(format!(
                "connection closed mid-message after {} bytes",
                line.len()
            )));
        }
        if byte[0] == MESSAGE_TERMINATOR {
            break;
        }
        if line.len() + 1 >= MAX_MESSAGE_LEN {
            return Err(Error::protocol("message too long"));
        }
        line.push(byte[0]);
    }

    let line = std::str::from_utf8(&line).map_err(|_| Error::protocol("message is not UTF-8"))?;
    Message::decode(line)
}

/// Read one message, giving up after `limit`.
pub async fn read_message_timeout<R>(reader: &mut R, limit: Duration) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    tokio::time::timeout(limit, read_message(reader))
        .await
        .map_err(|_| Error::Timeout(limit.as_millis() as u64))?
}

/// Write one message.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&message.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Role of a tunnel connection, fixed by its `HELLO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// First connection of a client session; the only one allowed to hand off.
    Control,
    /// Carries one relayed SOCKS5 stream.
    Data,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionRole::Control => f.write_str("control"),
            ConnectionRole::Data => f.write_str("data"),
        }
    }
}

/// Server-side handshake state of one tunnel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Waiting for `HELLO`
    AwaitHello,
    /// Control connection, `OK` sent, waiting for `REPORT_IP`
    AwaitIpReport,
    /// Coordinator is working on the hand-off
    HandoffPending,
    /// `LOGIN_SUCCESS` sent
    HandoffDone,
    /// SOCKS5 negotiation may start
    ReadyForSocks5,
    /// Connection is finished
    Closed,
}

impl HandshakeState {
    /// Advance on a received message. Anything unexpected is a protocol violation.
    pub fn on_message(self, message: &Message) -> Result<Self> {
        match (self, message) {
            (HandshakeState::AwaitHello, Message::Hello { session: None, .. }) => {
                Ok(HandshakeState::AwaitIpReport)
            }
            (HandshakeState::AwaitHello, Message::Hello { session: Some(_), .. }) => {
                Ok(HandshakeState::ReadyForSocks5)
            }
            (HandshakeState::AwaitIpReport, Message::ReportIp { .. }) => {
                Ok(HandshakeState::HandoffPending)
            }
            (HandshakeState::HandoffDone, Message::Heartbeat) => Ok(HandshakeState::HandoffDone),
            (state, message) => Err(Error::protocol(format!(
                "unexpected {} in state {:?}",
                message.name(),
                state
            ))),
        }
    }

    /// Advance on the coordinator's verdict.
    pub fn on_handoff(self, granted: bool) -> Result<Self> {
        match self {
            HandshakeState::HandoffPending if granted => Ok(HandshakeState::HandoffDone),
            HandshakeState::HandoffPending => Ok(HandshakeState::Closed),
            state => Err(Error::protocol(format!(
                "hand-off outcome in state {:?}",
                state
            ))),
        }
    }

    /// Role implied by the state, once known.
    pub fn role(self) -> Option<ConnectionRole> {
        match self {
            HandshakeState::AwaitHello | HandshakeState::Closed => None,
            HandshakeState::AwaitIpReport
            | HandshakeState::HandoffPending
            | HandshakeState::HandoffDone => Some(ConnectionRole::Control),
            HandshakeState::ReadyForSocks5 => Some(ConnectionRole::Data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_encode_wire_tokens() {
        assert_eq!(Message::control_hello(ip("10.0.0.5")).encode(), b"HELLO:10.0.0.5\n");
        assert_eq!(
            Message::data_hello(ip("10.0.0.5"), "10.0.0.5:40112").encode(),
            b"HELLO:10.0.0.5@10.0.0.5:40112\n"
        );
        assert_eq!(
            Message::report_ip(ip("10.0.0.5"), "9f2c41d07a3be815").encode(),
            b"REPORT_IP:10.0.0.5@9f2c41d07a3be815\n"
        );
        assert_eq!(Message::LoginSuccess.encode(), b"LOGIN_SUCCESS\n");
        assert_eq!(Message::LoginFailed.encode(), b"LOGIN_FAILED\n");
    }

    #[test]
    fn test_decode_hello_variants() {
        assert_eq!(
            Message::decode("HELLO:10.0.0.5").unwrap(),
            Message::control_hello(ip("10.0.0.5"))
        );
        assert_eq!(
            Message::decode("HELLO:fe80::1@[fe80::1]:5000\r").unwrap(),
            Message::data_hello(ip("fe80::1"), "[fe80::1]:5000")
        );
        assert!(Message::decode("HELLO:not-an-ip").is_err());
        assert!(Message::decode("HELLO:10.0.0.5@").is_err());
    }

    #[test]
    fn test_decode_report_ip_with_and_without_session() {
        assert_eq!(
            Message::decode("REPORT_IP:10.0.0.5@9f2c41d07a3be815").unwrap(),
            Message::report_ip(ip("10.0.0.5"), "9f2c41d07a3be815")
        );
        assert_eq!(
            Message::decode("REPORT_IP:fe80::1").unwrap(),
            Message::ReportIp {
                ip: ip("fe80::1"),
                session: None
            }
        );
        assert!(Message::decode("REPORT_IP:10.0.0.5@").is_err());
        assert!(Message::decode("REPORT_IP:10.0.0.5@two words").is_err());
    }

    #[test]
    fn test_decode_rejects_unknown() {
        let err = Message::decode("GOODBYE").unwrap_err();
        assert!(err.is_protocol_violation());
        assert!(Message::decode("ok").is_err());
    }

    #[tokio::test]
    async fn test_read_stops_at_terminator() {
        let mut input: &[u8] = b"HELLO:10.0.0.5\n\x05\x01\x00";
        let msg = read_message(&mut input).await.unwrap();
        assert_eq!(msg, Message::control_hello(ip("10.0.0.5")));
        // SOCKS5 bytes after the handshake stay unread
        assert_eq!(input, b"\x05\x01\x00");
    }

    #[tokio::test]
    async fn test_read_truncated_and_oversized() {
        let mut truncated: &[u8] = b"REPORT_IP:10.0";
        assert!(read_message(&mut truncated).await.unwrap_err().is_protocol_violation());

        let long = vec![b'A'; MAX_MESSAGE_LEN * 2];
        let mut oversized: &[u8] = &long;
        assert!(read_message(&mut oversized).await.is_err());
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (mut client, _server) = tokio::io::duplex(64);
        let err = read_message_timeout(&mut client, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(20)));
    }

    #[test]
    fn test_control_state_machine() {
        let hello = Message::control_hello(ip("10.0.0.5"));
        let state = HandshakeState::AwaitHello.on_message(&hello).unwrap();
        assert_eq!(state, HandshakeState::AwaitIpReport);
        assert_eq!(state.role(), Some(ConnectionRole::Control));

        let state = state.on_message(&Message::report_ip(ip("10.0.0.5"), "a1")).unwrap();
        assert_eq!(state, HandshakeState::HandoffPending);
        assert_eq!(state.on_handoff(false).unwrap(), HandshakeState::Closed);

        let state = state.on_handoff(true).unwrap();
        assert_eq!(state, HandshakeState::HandoffDone);
        assert_eq!(state.on_message(&Message::Heartbeat).unwrap(), state);
    }

    #[test]
    fn test_repeated_hello_is_violation() {
        let hello = Message::control_hello(ip("10.0.0.5"));
        let state = HandshakeState::AwaitHello.on_message(&hello).unwrap();
        assert!(state.on_message(&hello).unwrap_err().is_protocol_violation());

        let data = Message::data_hello(ip("10.0.0.5"), "10.0.0.5:1");
        let state = HandshakeState::AwaitHello.on_message(&data).unwrap();
        assert_eq!(state.role(), Some(ConnectionRole::Data));
        assert!(state.on_message(&data).is_err());
        assert!(state.on_message(&Message::report_ip(ip("10.0.0.5"), "a1")).is_err());
    }

    #[test]
    fn test_report_before_hello_is_violation() {
        let err = HandshakeState::AwaitHello
            .on_message(&Message::report_ip(ip("10.0.0.5"), "a1"))
            .unwrap_err();
        assert!(err.to_string().contains("REPORT_IP"));
    }
}
