//! End-to-end scenario tests driving a real `Server` over loopback sockets.
//!
//! Each test binds an ephemeral proxy, spawns its accept loop, then speaks
//! the wire protocol as a real client would — no internal functions are
//! called directly.

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use triproxy_core::{AuthConfig, ProxyConfig, Server};

async fn spawn_proxy(config: ProxyConfig) -> std::net::SocketAddr {
    let server = Server::bind(config).await.expect("bind");
    let addr = server.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    addr
}

async fn read_until(stream: &mut TcpStream, needle: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await.expect("read");
        if n == 0 {
            break;
        }
        buf.push(byte[0]);
        if buf.len() >= needle.len() && &buf[buf.len() - needle.len()..] == needle {
            break;
        }
    }
    buf
}

#[tokio::test]
async fn http_forward_rewrites_absolute_uri_and_strips_proxy_headers() {
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target.local_addr().unwrap();

    let proxy_addr = spawn_proxy(ProxyConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..ProxyConfig::default()
    })
    .await;

    let target_task = tokio::spawn(async move {
        let (mut sock, _) = target.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = sock.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).to_string()
    });

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let request = format!(
        "GET http://{}/p?q=1 HTTP/1.1\r\nHost: {}\r\nProxy-Connection: keep-alive\r\n\r\n",
        target_addr, target_addr
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let received = target_task.await.unwrap();
    let expected = format!("GET /p?q=1 HTTP/1.1\r\nHost: {}\r\n\r\n", target_addr);
    assert_eq!(received, expected);
}

#[tokio::test]
async fn connect_happy_path_relays_after_200() {
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target.local_addr().unwrap();

    let proxy_addr = spawn_proxy(ProxyConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..ProxyConfig::default()
    })
    .await;

    let target_task = tokio::spawn(async move {
        let (mut sock, _) = target.accept().await.unwrap();
        let mut buf = [0u8; 5];
        sock.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        sock.write_all(b"world").await.unwrap();
    });

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let connect_req = format!("CONNECT {} HTTP/1.1\r\n\r\n", target_addr);
    client.write_all(connect_req.as_bytes()).await.unwrap();

    let response = read_until(&mut client, b"\r\n\r\n").await;
    assert_eq!(response, b"HTTP/1.1 200 Connection Established\r\n\r\n");

    client.write_all(b"hello").await.unwrap();
    target_task.await.unwrap();

    let mut echoed = [0u8; 5];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"world");
}

#[tokio::test]
async fn connect_dial_failure_returns_502() {
    // Bind then immediately drop to get a port nothing listens on.
    let doomed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let doomed_addr = doomed.local_addr().unwrap();
    drop(doomed);

    let proxy_addr = spawn_proxy(ProxyConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..ProxyConfig::default()
    })
    .await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let connect_req = format!("CONNECT {} HTTP/1.1\r\n\r\n", doomed_addr);
    client.write_all(connect_req.as_bytes()).await.unwrap();

    let response = read_until(&mut client, b"\r\n\r\n").await;
    assert_eq!(response, b"HTTP/1.1 502 Bad Gateway\r\n\r\n");
}

#[tokio::test]
async fn auth_required_without_credentials_returns_407() {
    let mut users = HashMap::new();
    users.insert("alice".to_string(), "hunter2".to_string());

    let proxy_addr = spawn_proxy(ProxyConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        auth: Some(AuthConfig {
            enabled: true,
            users,
            ..Default::default()
        }),
        ..ProxyConfig::default()
    })
    .await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();

    let mut buf = Vec::new();
    let response = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut buf))
        .await
        .unwrap();
    response.unwrap();
    let response = String::from_utf8_lossy(&buf);
    assert!(response.starts_with("HTTP/1.1 407 Proxy Authentication Required\r\n"));
    assert!(response.ends_with("Proxy Authentication Required\r\n"));
}

#[tokio::test]
async fn socks5_no_auth_connect_to_ipv4_target() {
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target.local_addr().unwrap();
    let target_port = target_addr.port();

    let proxy_addr = spawn_proxy(ProxyConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..ProxyConfig::default()
    })
    .await;

    let target_task = tokio::spawn(async move {
        let (mut sock, _) = target.accept().await.unwrap();
        let mut buf = [0u8; 3];
        sock.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hey");
        sock.write_all(b"yo").await.unwrap();
    });

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method_reply = [0u8; 2];
    client.read_exact(&mut method_reply).await.unwrap();
    assert_eq!(method_reply, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&[127, 0, 0, 1]);
    request.extend_from_slice(&target_port.to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut connect_reply = [0u8; 10];
    client.read_exact(&mut connect_reply).await.unwrap();
    assert_eq!(
        connect_reply,
        [0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
    );

    client.write_all(b"hey").await.unwrap();
    target_task.await.unwrap();

    let mut echoed = [0u8; 2];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"yo");
}

#[tokio::test]
async fn socks5_auth_wrong_password_closes_connection() {
    let mut users = HashMap::new();
    users.insert("alice".to_string(), "hunter2".to_string());

    let proxy_addr = spawn_proxy(ProxyConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        auth: Some(AuthConfig {
            enabled: true,
            users,
            ..Default::default()
        }),
        ..ProxyConfig::default()
    })
    .await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();

    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut method_reply = [0u8; 2];
    client.read_exact(&mut method_reply).await.unwrap();
    assert_eq!(method_reply, [0x05, 0x02]);

    let mut subauth = vec![0x01u8];
    subauth.push(b"alice".len() as u8);
    subauth.extend_from_slice(b"alice");
    subauth.push(b"wrongpass".len() as u8);
    subauth.extend_from_slice(b"wrongpass");
    client.write_all(&subauth).await.unwrap();

    let mut auth_reply = [0u8; 2];
    client.read_exact(&mut auth_reply).await.unwrap();
    assert_eq!(auth_reply, [0x01, 0x01]);

    let mut trailing = [0u8; 1];
    let n = client.read(&mut trailing).await.unwrap();
    assert_eq!(n, 0);
}
