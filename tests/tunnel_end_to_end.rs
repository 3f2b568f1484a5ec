//! Client → server → target path over loopback sockets.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use linkshare::client::{ClientConfig, TunnelClient};
use linkshare::proxy::TargetAddr;
use linkshare::server::{ServerConfig, TunnelServer};
use linkshare::{AuthOutcome, Authenticator, Error};

const HTTP_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello";

struct CountingAuthenticator {
    calls: AtomicU32,
    succeed: bool,
}

#[async_trait]
impl Authenticator for CountingAuthenticator {
    async fn authenticate(&self) -> AuthOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        if self.succeed {
            AuthOutcome::success(Some("10.0.0.9".into()), "online")
        } else {
            AuthOutcome::failure("portal rejected credentials")
        }
    }

    async fn deauthenticate(&self) -> bool {
        true
    }
}

async fn start_server(succeed: bool) -> (Arc<TunnelServer>, SocketAddr, Arc<CountingAuthenticator>) {
    start_server_on("127.0.0.1", succeed).await
}

async fn start_server_on(
    listen_addr: &str,
    succeed: bool,
) -> (Arc<TunnelServer>, SocketAddr, Arc<CountingAuthenticator>) {
    let auth = Arc::new(CountingAuthenticator {
        calls: AtomicU32::new(0),
        succeed,
    });
    let mut config = ServerConfig::new(listen_addr, 0);
    config.login_on_start = false;
    config.connect_timeout = Duration::from_secs(2);
    config.handshake_timeout = Duration::from_secs(2);

    let server = Arc::new(TunnelServer::new(config, auth.clone()));
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let runner = Arc::clone(&server);
    tokio::spawn(async move { runner.serve(listener).await });
    (server, addr, auth)
}

/// Answers every request with a fixed HTTP response.
async fn start_http_target() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let mut request = Vec::new();
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = sock.write_all(HTTP_RESPONSE).await;
            });
        }
    });
    addr
}

fn client_config(server: SocketAddr) -> ClientConfig {
    let mut config = ClientConfig::new(server.ip().to_string());
    config.server_port = server.port();
    config.proxy_port = 0;
    config.connect_timeout_secs = 2;
    config.connect_retries = 1;
    config
}

/// Whether an IPv6 wildcard listener also accepts IPv4 clients here.
fn dual_stack_available() -> bool {
    let Ok(listener) = std::net::TcpListener::bind("[::]:0") else {
        return false;
    };
    let Ok(addr) = listener.local_addr() else {
        return false;
    };
    std::net::TcpStream::connect(("127.0.0.1", addr.port())).is_ok()
}

/// Run a SOCKS5 CONNECT on `stream` and return the reply code.
async fn socks5_connect(stream: &mut TcpStream, target: TargetAddr) -> u8 {
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    let mut request = BytesMut::from(&[0x05u8, 0x01, 0x00][..]);
    target.write_to(&mut request);
    stream.write_all(&request).await.unwrap();

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await.unwrap();
    let rest = match head[3] {
        0x01 => 6,
        0x04 => 18,
        other => panic!("unexpected bound address type {}", other),
    };
    let mut bound = vec![0u8; rest];
    stream.read_exact(&mut bound).await.unwrap();
    head[1]
}

async fn http_get(stream: &mut TcpStream) -> Vec<u8> {
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}

#[tokio::test]
async fn test_streams_share_one_handoff() {
    let (server, server_addr, auth) = start_server(true).await;
    let target = start_http_target().await;

    let client = TunnelClient::connect(client_config(server_addr), None).await.unwrap();
    let proxy = client.local_addr().unwrap();
    let cancel = client.cancel_token();
    let runner = tokio::spawn(client.run());

    let mut apps = Vec::new();
    for i in 0..4 {
        apps.push(tokio::spawn(async move {
            let mut app = TcpStream::connect(proxy).await.unwrap();
            let dest = if i % 2 == 0 {
                TargetAddr::Ip(target)
            } else {
                TargetAddr::Domain("localhost".into(), target.port())
            };
            assert_eq!(socks5_connect(&mut app, dest).await, 0x00);
            http_get(&mut app).await
        }));
    }

    for app in apps {
        assert_eq!(app.await.unwrap(), HTTP_RESPONSE);
    }

    assert_eq!(auth.calls.load(Ordering::SeqCst), 1);
    assert_eq!(server.metrics().handoffs_granted(), 1);
    assert_eq!(server.session_count(), 1);

    cancel.cancel();
    runner.await.unwrap().unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_dual_stack_server_accepts_client_sessions() {
    if !dual_stack_available() {
        return;
    }
    let (server, listen_addr, _auth) = start_server_on("::", true).await;
    let server_addr = SocketAddr::from(([127, 0, 0, 1], listen_addr.port()));
    let target = start_http_target().await;

    let client = TunnelClient::connect(client_config(server_addr), None).await.unwrap();
    let proxy = client.local_addr().unwrap();
    let cancel = client.cancel_token();
    let runner = tokio::spawn(client.run());

    let mut app = TcpStream::connect(proxy).await.unwrap();
    assert_eq!(socks5_connect(&mut app, TargetAddr::Ip(target)).await, 0x00);
    assert_eq!(http_get(&mut app).await, HTTP_RESPONSE);
    assert_eq!(server.metrics().protocol_violations(), 0);

    cancel.cancel();
    runner.await.unwrap().unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_login_failed_surfaces_without_retry() {
    let (server, server_addr, auth) = start_server(false).await;

    let mut config = client_config(server_addr);
    config.connect_retries = 5;
    let err = TunnelClient::connect(config, None).await.err().unwrap();

    assert!(matches!(err, Error::HandoffFailed(_)));
    assert_eq!(auth.calls.load(Ordering::SeqCst), 1);
    assert_eq!(server.metrics().handoffs_failed(), 1);
    server.stop().await;
}

#[tokio::test]
async fn test_unreachable_targets_get_reply_codes() {
    let (server, server_addr, _auth) = start_server(true).await;
    let client = TunnelClient::connect(client_config(server_addr), None).await.unwrap();
    let proxy = client.local_addr().unwrap();
    let cancel = client.cancel_token();
    let runner = tokio::spawn(client.run());

    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed_addr = closed.local_addr().unwrap();
    drop(closed);

    let mut app = TcpStream::connect(proxy).await.unwrap();
    assert_eq!(socks5_connect(&mut app, TargetAddr::Ip(closed_addr)).await, 0x05);
    let mut rest = Vec::new();
    app.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty(), "no data relayed after a failed CONNECT");

    let mut app = TcpStream::connect(proxy).await.unwrap();
    let unknown = TargetAddr::Domain("no-such-host.invalid".into(), 80);
    assert_eq!(socks5_connect(&mut app, unknown).await, 0x04);

    cancel.cancel();
    runner.await.unwrap().unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_control_connection_carries_socks5() {
    use linkshare::protocol::{read_message_timeout, write_message, Message};

    let (server, server_addr, auth) = start_server(true).await;
    let target = start_http_target().await;
    let ip = "10.0.0.5".parse().unwrap();

    let mut control = TcpStream::connect(server_addr).await.unwrap();
    write_message(&mut control, &Message::control_hello(ip)).await.unwrap();
    let limit = Duration::from_secs(2);
    assert_eq!(read_message_timeout(&mut control, limit).await.unwrap(), Message::Ok);
    write_message(&mut control, &Message::report_ip(ip, "c0ffee0ddba11fee"))
        .await
        .unwrap();
    assert_eq!(
        read_message_timeout(&mut control, limit).await.unwrap(),
        Message::LoginSuccess
    );

    assert_eq!(socks5_connect(&mut control, TargetAddr::Ip(target)).await, 0x00);
    assert_eq!(http_get(&mut control).await, HTTP_RESPONSE);
    assert_eq!(auth.calls.load(Ordering::SeqCst), 1);
    server.stop().await;
}
