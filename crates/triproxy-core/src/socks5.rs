//! SOCKS5 negotiation, subauth, and request handling
//!
//! Picks up immediately after the dispatcher has consumed the leading
//! `0x05` version byte as a dialect tag; every read below starts at
//! NMETHODS.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::auth::Authenticator;
use crate::error::ConnectionError;
use crate::pump::{dial_with_timeout, pump, DialError, PumpResult};
use crate::stats::{ConnectionRecord, Dialect, Stats};

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NO_AUTH: u8 = 0x00;
const AUTH_USER_PASS: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCESS: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_TTL_EXPIRED: u8 = 0x06;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// A fixed reply with ATYP=IPv4, BND.ADDR=0.0.0.0, BND.PORT=0 — used for
/// every SOCKS5 reply, success or failure, whose bound address has no
/// meaningful value here.
fn reply(code: u8) -> [u8; 10] {
    [SOCKS5_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

enum Target {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl Target {
    fn host(&self) -> String {
        match self {
            Target::Ipv4(addr) => addr.to_string(),
            Target::Ipv6(addr) => addr.to_string(),
            Target::Domain(name) => name.clone(),
        }
    }
}

/// Handle one SOCKS5-dialect connection from NMETHODS onward.
pub async fn handle(
    mut client: TcpStream,
    authenticator: &Authenticator,
    stats: &Stats,
    connect_timeout: Duration,
    idle_timeout: Option<Duration>,
    buffer_size: usize,
    record: &mut ConnectionRecord,
) -> Result<PumpResult, ConnectionError> {
    record.dialect = Some(Dialect::Socks5);
    let _active_guard = stats.record_accepted(Dialect::Socks5);

    negotiate_method(&mut client, authenticator).await?;

    if authenticator.enabled() {
        subauth(&mut client, authenticator).await?;
    }

    let (host, port) = read_request(&mut client).await?;
    record.target = Some((host.clone(), port));

    let target = match dial_with_timeout(&host, port, connect_timeout).await {
        Ok(stream) => stream,
        Err(DialError::Timeout) => {
            let _ = client.write_all(&reply(REPLY_TTL_EXPIRED)).await;
            return Err(ConnectionError::UpstreamConnect {
                host,
                port,
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            });
        }
        Err(DialError::Refused(err)) => {
            let _ = client.write_all(&reply(REPLY_CONNECTION_REFUSED)).await;
            return Err(err);
        }
    };

    client.write_all(&reply(REPLY_SUCCESS)).await?;
    client.flush().await?;

    Ok(pump(client, target, buffer_size, idle_timeout).await)
}

/// S0: read NMETHODS + METHODS, pick a method, reply.
async fn negotiate_method(
    client: &mut TcpStream,
    authenticator: &Authenticator,
) -> Result<(), ConnectionError> {
    let nmethods = client.read_u8().await? as usize;
    let mut methods = vec![0u8; nmethods];
    client.read_exact(&mut methods).await?;

    if authenticator.enabled() {
        if !methods.contains(&AUTH_USER_PASS) {
            client
                .write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPTABLE])
                .await?;
            return Err(ConnectionError::Socks5AuthMethodRejected);
        }
        client
            .write_all(&[SOCKS5_VERSION, AUTH_USER_PASS])
            .await?;
    } else {
        client.write_all(&[SOCKS5_VERSION, AUTH_NO_AUTH]).await?;
    }
    Ok(())
}

/// S1: RFC 1929 username/password subnegotiation.
async fn subauth(client: &mut TcpStream, authenticator: &Authenticator) -> Result<(), ConnectionError> {
    let _ver = client.read_u8().await?;
    let ulen = client.read_u8().await? as usize;
    let mut uname = vec![0u8; ulen];
    client.read_exact(&mut uname).await?;
    let plen = client.read_u8().await? as usize;
    let mut passwd = vec![0u8; plen];
    client.read_exact(&mut passwd).await?;

    let username = String::from_utf8_lossy(&uname).to_string();
    let password = String::from_utf8_lossy(&passwd).to_string();

    if authenticator.socks5_auth(&username, &password) {
        client.write_all(&[0x01, 0x00]).await?;
        info!(username, "socks5 subauth succeeded");
        Ok(())
    } else {
        client.write_all(&[0x01, 0x01]).await?;
        warn!(username, "socks5 subauth failed");
        Err(ConnectionError::Socks5AuthFailed)
    }
}

/// S2/S3: `VER CMD RSV ATYP` then address/port, enforcing CONNECT-only and
/// the three supported address types.
async fn read_request(client: &mut TcpStream) -> Result<(String, u16), ConnectionError> {
    let mut header = [0u8; 4];
    client.read_exact(&mut header).await?;
    let [ver, cmd, _rsv, atyp] = header;

    if ver != SOCKS5_VERSION {
        return Err(ConnectionError::MalformedSocks5Request(format!(
            "unexpected VER byte 0x{ver:02x}"
        )));
    }
    if cmd != CMD_CONNECT {
        let _ = client.write_all(&reply(REPLY_COMMAND_NOT_SUPPORTED)).await;
        return Err(ConnectionError::UnsupportedSocks5Command(cmd));
    }

    let target = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            client.read_exact(&mut octets).await?;
            Target::Ipv4(Ipv4Addr::from(octets))
        }
        ATYP_DOMAIN => {
            let len = client.read_u8().await? as usize;
            let mut domain = vec![0u8; len];
            client.read_exact(&mut domain).await?;
            let domain = String::from_utf8(domain).map_err(|_| {
                ConnectionError::MalformedSocks5Request("domain is not valid UTF-8".to_string())
            })?;
            Target::Domain(domain)
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            client.read_exact(&mut octets).await?;
            Target::Ipv6(Ipv6Addr::from(octets))
        }
        other => {
            let _ = client
                .write_all(&reply(REPLY_ADDRESS_TYPE_NOT_SUPPORTED))
                .await;
            return Err(ConnectionError::MalformedSocks5Request(format!(
                "unsupported ATYP 0x{other:02x}"
            )));
        }
    };

    let mut port_bytes = [0u8; 2];
    client.read_exact(&mut port_bytes).await?;
    let port = u16::from_be_bytes(port_bytes);

    Ok((target.host(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_command_reply_is_exact_bytes() {
        assert_eq!(
            reply(REPLY_COMMAND_NOT_SUPPORTED),
            [0x05, 0x07, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn success_reply_is_exact_bytes() {
        assert_eq!(
            reply(REPLY_SUCCESS),
            [0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn general_failure_reply_uses_standard_bound_address() {
        let r = reply(REPLY_GENERAL_FAILURE);
        assert_eq!(r[0], SOCKS5_VERSION);
        assert_eq!(r[1], REPLY_GENERAL_FAILURE);
        assert_eq!(&r[3..], &[0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn target_host_formats_each_address_type() {
        assert_eq!(Target::Ipv4(Ipv4Addr::new(127, 0, 0, 1)).host(), "127.0.0.1");
        assert_eq!(Target::Domain("example.com".to_string()).host(), "example.com");
        assert_eq!(
            Target::Ipv6(Ipv6Addr::LOCALHOST).host(),
            "::1"
        );
    }
}
