//! HTTP forwarding and CONNECT tunneling
//!
//! Parses a request line plus headers already buffered by the dispatcher
//! (with the one sniff byte prepended), applies the optional Proxy-Auth
//! gate, then either tunnels (`CONNECT`) or rewrites and forwards the
//! request to the origin (everything else).

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::auth::Authenticator;
use crate::error::ConnectionError;
use crate::pump::{dial_with_timeout, pump, DialError, PumpResult};
use crate::stats::{ConnectionRecord, Dialect, Stats};

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";
const GATEWAY_TIMEOUT: &[u8] = b"HTTP/1.1 504 Gateway Timeout\r\n\r\n";

struct Request {
    method: String,
    uri: String,
    version: String,
    headers: Vec<(String, String)>,
    proxy_authorization: Option<String>,
}

/// Handle one HTTP-dialect connection. `sniffed_byte` is the single byte
/// the dispatcher already consumed while choosing a dialect and must be
/// treated as the first byte of the request line.
pub async fn handle(
    mut client: TcpStream,
    sniffed_byte: u8,
    authenticator: &Authenticator,
    stats: &Stats,
    connect_timeout: Duration,
    idle_timeout: Option<Duration>,
    buffer_size: usize,
    record: &mut ConnectionRecord,
) -> Result<PumpResult, ConnectionError> {
    let request = match read_request(&mut client, sniffed_byte).await? {
        Some(req) => req,
        None => {
            return Err(ConnectionError::ClientClosedEarly);
        }
    };

    let dialect = if request.method.eq_ignore_ascii_case("CONNECT") {
        Dialect::Connect
    } else {
        Dialect::Http
    };
    record.dialect = Some(dialect);
    let _active_guard = stats.record_accepted(dialect);

    if authenticator.enabled() {
        match authenticator.authenticate_http(request.proxy_authorization.as_deref()) {
            Ok(Some(username)) => {
                info!(username, "http proxy authentication succeeded");
            }
            Ok(None) => unreachable!("authenticate_http only returns Ok(None) when disabled"),
            Err(err) => {
                warn!(error = %err, "http proxy authentication failed");
                let response = authenticator.build_407();
                let _ = client.write_all(&response).await;
                let _ = client.flush().await;
                return Err(ConnectionError::Auth(err));
            }
        }
    }

    if dialect == Dialect::Connect {
        handle_connect(client, &request, connect_timeout, idle_timeout, buffer_size, record).await
    } else {
        handle_forward(client, &request, connect_timeout, idle_timeout, buffer_size, record).await
    }
}

/// Read the request line and headers, prepending `sniffed_byte` as the
/// first byte of the stream. Returns `Ok(None)` if the client closed
/// before a full request line could be read.
async fn read_request(
    client: &mut TcpStream,
    sniffed_byte: u8,
) -> Result<Option<Request>, ConnectionError> {
    let mut raw = vec![sniffed_byte];
    read_until_double_crlf(client, &mut raw).await?;

    let text = String::from_utf8_lossy(&raw);
    let mut lines = text.split("\r\n");

    let request_line = match lines.next() {
        Some(line) if !line.is_empty() => line,
        _ => return Ok(None),
    };

    let tokens: Vec<&str> = request_line.split_whitespace().collect();
    if tokens.len() < 3 {
        return Err(ConnectionError::MalformedHttpRequest(request_line.to_string()));
    }

    let method = tokens[0].to_string();
    let uri = tokens[1].to_string();
    let version = tokens[2].to_string();

    let mut headers = Vec::new();
    let mut proxy_authorization = None;
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().to_string();
        let value = value.trim().to_string();
        if name.eq_ignore_ascii_case("proxy-authorization") {
            proxy_authorization = Some(value.clone());
        }
        headers.push((name, value));
    }

    Ok(Some(Request {
        method,
        uri,
        version,
        headers,
        proxy_authorization,
    }))
}

/// Read from `client` into `buf` until the CRLFCRLF header terminator is
/// seen, one byte at a time. Request lines and headers are small and
/// bounded in practice; a byte-at-a-time read keeps the implementation
/// simple and avoids over-reading into what would be tunneled body bytes.
async fn read_until_double_crlf(client: &mut TcpStream, buf: &mut Vec<u8>) -> Result<(), ConnectionError> {
    let mut byte = [0u8; 1];
    loop {
        if buf.len() >= 4 && &buf[buf.len() - 4..] == b"\r\n\r\n" {
            return Ok(());
        }
        let n = client.read(&mut byte).await?;
        if n == 0 {
            if buf.len() == 1 {
                return Err(ConnectionError::ClientClosedEarly);
            }
            return Ok(());
        }
        buf.push(byte[0]);
    }
}

async fn handle_connect(
    mut client: TcpStream,
    request: &Request,
    connect_timeout: Duration,
    idle_timeout: Option<Duration>,
    buffer_size: usize,
    record: &mut ConnectionRecord,
) -> Result<PumpResult, ConnectionError> {
    let (host, port) = match split_host_port(&request.uri, 443) {
        Some(pair) => pair,
        None => {
            return Err(ConnectionError::MalformedHttpRequest(request.uri.clone()));
        }
    };
    record.target = Some((host.clone(), port));

    let target = match dial_with_timeout(&host, port, connect_timeout).await {
        Ok(stream) => stream,
        Err(DialError::Timeout) => {
            let _ = client.write_all(GATEWAY_TIMEOUT).await;
            let _ = client.flush().await;
            return Err(ConnectionError::UpstreamConnect {
                host,
                port,
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            });
        }
        Err(DialError::Refused(err)) => {
            let _ = client.write_all(BAD_GATEWAY).await;
            let _ = client.flush().await;
            return Err(err);
        }
    };

    client.write_all(CONNECT_ESTABLISHED).await?;
    client.flush().await?;

    Ok(pump(client, target, buffer_size, idle_timeout).await)
}

async fn handle_forward(
    mut client: TcpStream,
    request: &Request,
    connect_timeout: Duration,
    idle_timeout: Option<Duration>,
    buffer_size: usize,
    record: &mut ConnectionRecord,
) -> Result<PumpResult, ConnectionError> {
    let parsed = match parse_absolute_uri(&request.uri) {
        Some(parsed) => parsed,
        None => {
            return Err(ConnectionError::MalformedHttpRequest(request.uri.clone()));
        }
    };
    record.target = Some((parsed.host.clone(), parsed.port));

    let mut target = match dial_with_timeout(&parsed.host, parsed.port, connect_timeout).await {
        Ok(stream) => stream,
        Err(DialError::Timeout) => {
            let _ = client.write_all(GATEWAY_TIMEOUT).await;
            let _ = client.flush().await;
            return Err(ConnectionError::UpstreamConnect {
                host: parsed.host,
                port: parsed.port,
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            });
        }
        Err(DialError::Refused(err)) => {
            return Err(err);
        }
    };

    let rewritten = rewrite_request(request, &parsed.path_and_query);
    target.write_all(rewritten.as_bytes()).await?;
    target.flush().await?;

    Ok(pump(client, target, buffer_size, idle_timeout).await)
}

/// Rewrite an absolute-form request line to origin-form and strip every
/// `Proxy-*` header before forwarding.
fn rewrite_request(request: &Request, path_and_query: &str) -> String {
    let mut out = format!("{} {} {}\r\n", request.method, path_and_query, request.version);
    for (name, value) in &request.headers {
        if name.to_ascii_lowercase().starts_with("proxy-") {
            continue;
        }
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out
}

struct AbsoluteUri {
    host: String,
    port: u16,
    path_and_query: String,
}

/// Parse `http://host[:port]/path?query`. Host is required; port defaults
/// to 80; path defaults to `/`.
fn parse_absolute_uri(uri: &str) -> Option<AbsoluteUri> {
    let rest = uri.strip_prefix("http://").or_else(|| uri.strip_prefix("HTTP://"))?;
    let (authority, path_and_query) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    if authority.is_empty() {
        return None;
    }
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port_str)) => {
            let port = port_str.parse().ok()?;
            (host.to_string(), port)
        }
        None => (authority.to_string(), 80),
    };
    if host.is_empty() {
        return None;
    }
    let path_and_query = if path_and_query.is_empty() {
        "/".to_string()
    } else {
        path_and_query.to_string()
    };
    Some(AbsoluteUri {
        host,
        port,
        path_and_query,
    })
}

/// Split a CONNECT target `host:port` on the last colon, defaulting port
/// to `default_port` when no colon is present (bare IPv6 literals are not
/// expected here — clients send `host:port` or `[v6]:port`).
fn split_host_port(target: &str, default_port: u16) -> Option<(String, u16)> {
    match target.rsplit_once(':') {
        Some((host, port_str)) => {
            let port: u16 = port_str.parse().ok()?;
            if host.is_empty() {
                None
            } else {
                Some((host.to_string(), port))
            }
        }
        None => {
            if target.is_empty() {
                None
            } else {
                Some((target.to_string(), default_port))
            }
        }
    }
}
