//! Bidirectional traffic pump
//!
//! Once a handler has a client stream and a dialed target stream, both
//! directions are relayed concurrently until either side reaches EOF.
//! Each direction half-closes its destination on exit so the peer still
//! drains whatever is left in flight, rather than the whole socket being
//! torn down the moment one direction finishes. An idle timeout or I/O
//! error, unlike a clean EOF, leaves the peer with no signal of its own
//! to notice by — a shared `Notify` lets that direction wake the other
//! immediately instead of leaving it to wait out its own timer.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::debug;

use crate::error::ConnectionError;

/// Byte counts produced by a completed pump, one counter per direction.
/// `had_error` is set when either direction exited via a genuine I/O
/// error rather than a clean EOF or an idle timeout — the latter two are
/// reported as an ordinary successful close per the pump's idle-timeout
/// contract.
#[derive(Debug, Clone, Copy, Default)]
pub struct PumpResult {
    pub bytes_client_to_target: u64,
    pub bytes_target_to_client: u64,
    pub had_error: bool,
}

/// Relay `client` <-> `target` until both directions have reached EOF or
/// errored. `idle_timeout` of `None` disables the per-read deadline.
pub async fn pump(
    client: TcpStream,
    target: TcpStream,
    buffer_size: usize,
    idle_timeout: Option<Duration>,
) -> PumpResult {
    let (client_rd, client_wr) = tokio::io::split(client);
    let (target_rd, target_wr) = tokio::io::split(target);
    let cancel = Arc::new(Notify::new());

    let (c2t, t2c) = tokio::join!(
        copy_direction(
            client_rd,
            target_wr,
            buffer_size,
            idle_timeout,
            "client->target",
            cancel.clone(),
        ),
        copy_direction(
            target_rd,
            client_wr,
            buffer_size,
            idle_timeout,
            "target->client",
            cancel,
        ),
    );

    PumpResult {
        bytes_client_to_target: c2t.bytes,
        bytes_target_to_client: t2c.bytes,
        had_error: c2t.had_error || t2c.had_error,
    }
}

struct DirectionResult {
    bytes: u64,
    had_error: bool,
}

/// Copy bytes from `src` to `dst` until EOF, any I/O error, an idle read
/// exceeding `idle_timeout`, or `cancel` being signaled by the peer
/// direction. Always attempts to shut down the destination's write half
/// on exit so the peer observes EOF promptly. Signals `cancel` only when
/// this direction ends abnormally (idle timeout or I/O error) — a clean
/// EOF already reaches the peer via the write-half shutdown below, so it
/// does not need to force an early cancel.
async fn copy_direction(
    mut src: ReadHalf<TcpStream>,
    mut dst: WriteHalf<TcpStream>,
    buffer_size: usize,
    idle_timeout: Option<Duration>,
    label: &'static str,
    cancel: Arc<Notify>,
) -> DirectionResult {
    let mut buf = vec![0u8; buffer_size];
    let mut total = 0u64;
    let mut had_error = false;
    let mut cancel_peer = false;

    loop {
        let read_result = tokio::select! {
            biased;
            _ = cancel.notified() => {
                debug!(direction = label, "pump direction cancelled after peer teardown");
                break;
            }
            result = read_once(&mut src, &mut buf, idle_timeout) => result,
        };

        let n = match read_result {
            ReadOutcome::Eof => break,
            ReadOutcome::Data(n) => n,
            ReadOutcome::IoError(err) => {
                debug!(direction = label, error = %err, "pump direction read failed");
                had_error = true;
                cancel_peer = true;
                break;
            }
            ReadOutcome::IdleTimeout => {
                debug!(direction = label, "pump direction idle timed out");
                cancel_peer = true;
                break;
            }
        };

        if let Err(err) = dst.write_all(&buf[..n]).await {
            debug!(direction = label, error = %err, "pump direction write failed");
            had_error = true;
            cancel_peer = true;
            break;
        }
        total += n as u64;
    }

    if cancel_peer {
        cancel.notify_one();
    }
    let _ = dst.shutdown().await;
    DirectionResult {
        bytes: total,
        had_error,
    }
}

enum ReadOutcome {
    Data(usize),
    Eof,
    IoError(std::io::Error),
    IdleTimeout,
}

async fn read_once(
    src: &mut ReadHalf<TcpStream>,
    buf: &mut [u8],
    idle_timeout: Option<Duration>,
) -> ReadOutcome {
    let read_result = match idle_timeout {
        Some(dur) => match timeout(dur, src.read(buf)).await {
            Ok(result) => result,
            Err(_) => return ReadOutcome::IdleTimeout,
        },
        None => src.read(buf).await,
    };

    match read_result {
        Ok(0) => ReadOutcome::Eof,
        Ok(n) => ReadOutcome::Data(n),
        Err(err) => ReadOutcome::IoError(err),
    }
}

/// Dial `host:port` with a bounded timeout, mapping both the timeout and
/// the connect failure onto the caller's error space via the closures
/// provided — each dialect formats its own wire-level failure reply.
pub async fn dial_with_timeout(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, DialError> {
    match timeout(connect_timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(DialError::Refused(ConnectionError::UpstreamConnect {
            host: host.to_string(),
            port,
            source,
        })),
        Err(_) => Err(DialError::Timeout),
    }
}

#[derive(Debug)]
pub enum DialError {
    Timeout,
    Refused(ConnectionError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn pump_relays_bytes_in_both_directions() {
        let client_side = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_side_addr = client_side.local_addr().unwrap();
        let target_side = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_side_addr = target_side.local_addr().unwrap();

        // "real client": sends "hello" to the proxy, expects "world" back.
        let real_client = tokio::spawn(async move {
            let mut sock = TcpStream::connect(client_side_addr).await.unwrap();
            sock.write_all(b"hello").await.unwrap();
            sock.shutdown().await.unwrap();
            let mut received = Vec::new();
            sock.read_to_end(&mut received).await.unwrap();
            received
        });

        // "real target": echoes whatever it receives back reversed-case,
        // here just echoes "world" unconditionally after reading "hello".
        let real_target = tokio::spawn(async move {
            let (mut sock, _) = target_side.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            sock.write_all(b"world").await.unwrap();
            sock.shutdown().await.unwrap();
        });

        let (client_proxy_side, _) = client_side.accept().await.unwrap();
        let target_proxy_side = TcpStream::connect(target_side_addr).await.unwrap();

        let result = pump(client_proxy_side, target_proxy_side, 4096, None).await;

        real_target.await.unwrap();
        let received = real_client.await.unwrap();

        assert_eq!(received, b"world");
        assert_eq!(result.bytes_client_to_target, 5);
        assert_eq!(result.bytes_target_to_client, 5);
        assert!(!result.had_error);
    }

    #[tokio::test]
    async fn idle_timeout_in_one_direction_cancels_the_other() {
        let client_side = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_side_addr = client_side.local_addr().unwrap();
        let target_side = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_side_addr = target_side.local_addr().unwrap();

        // Never sends anything, so client->target idles immediately.
        let real_client = tokio::spawn(async move {
            let sock = TcpStream::connect(client_side_addr).await.unwrap();
            sock
        });

        // Keeps target->client continuously busy, far longer than the
        // test's own deadline, so it would never idle out on its own.
        let real_target = tokio::spawn(async move {
            let (mut sock, _) = target_side.accept().await.unwrap();
            for _ in 0..200u32 {
                if sock.write_all(b"x").await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        let (client_proxy_side, _) = client_side.accept().await.unwrap();
        let target_proxy_side = TcpStream::connect(target_side_addr).await.unwrap();

        let pump_result = tokio::time::timeout(
            Duration::from_millis(1500),
            pump(
                client_proxy_side,
                target_proxy_side,
                4096,
                Some(Duration::from_millis(100)),
            ),
        )
        .await;

        assert!(
            pump_result.is_ok(),
            "pump should end once one direction idles out, without waiting on the other's own timer"
        );
        drop(real_client.await.unwrap());
        let _ = real_target.await;
    }

    #[tokio::test]
    async fn dial_with_timeout_succeeds_against_loopback_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let result = dial_with_timeout(
            &addr.ip().to_string(),
            addr.port(),
            Duration::from_secs(1),
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn dial_with_timeout_reports_refusal() {
        // Bind then drop to get a port nothing is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = dial_with_timeout(
            &addr.ip().to_string(),
            addr.port(),
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(DialError::Refused(_))));
    }
}
