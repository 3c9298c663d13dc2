//! Connection dispatcher and listener loop
//!
//! Owns the single listening socket. For every accepted client it peeks
//! one byte to choose a dialect, then hands off to the matching handler.
//! Graceful shutdown is a shared `Arc<AtomicBool>` "running" flag checked
//! by the accept loop and combined with `tokio::select!` against
//! `ctrl_c`, rather than a cancellation token.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::stats::{ConnectionRecord, Stats};
use crate::{http, socks5};

/// The bidirectional proxy server: a bound listener plus the shared,
/// read-only state every connection handler needs.
pub struct Server {
    config: Arc<ProxyConfig>,
    authenticator: Arc<Authenticator>,
    stats: Arc<Stats>,
    listener: TcpListener,
    running: Arc<AtomicBool>,
}

impl Server {
    /// Bind the listening socket. No connection is accepted until
    /// [`Server::run`] is called.
    pub async fn bind(config: ProxyConfig) -> Result<Self, ProxyError> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(
            host = %config.host,
            port = config.port,
            protocols = ?config.protocols,
            max_connections = config.max_connections,
            "proxy listening"
        );

        let authenticator = Authenticator::from_config(config.auth.as_ref());
        Ok(Self {
            config: Arc::new(config),
            authenticator: Arc::new(authenticator),
            stats: Stats::new(),
            listener,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    /// A clonable handle that, when `store(false, ...)`d, stops the accept
    /// loop after its current iteration.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Accept connections until `shutdown_handle` is cleared or `Ctrl-C`
    /// is received. Each accepted connection runs in its own task and is
    /// admitted only once an owned semaphore permit is available, bounding
    /// concurrency at `config.max_connections`.
    pub async fn run(self) -> Result<(), ProxyError> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_connections));

        loop {
            if !self.running.load(Ordering::Relaxed) {
                break;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => {
                    permit.expect("semaphore never closed while server runs")
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("received shutdown signal, stopping accept loop");
                    self.running.store(false, Ordering::Relaxed);
                    break;
                }
            };

            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = tokio::signal::ctrl_c() => {
                    info!("received shutdown signal, stopping accept loop");
                    self.running.store(false, Ordering::Relaxed);
                    drop(permit);
                    break;
                }
            };

            match accepted {
                Ok((stream, addr)) => {
                    let config = self.config.clone();
                    let authenticator = self.authenticator.clone();
                    let stats = self.stats.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, addr, config, authenticator, stats).await;
                        drop(permit);
                    });
                }
                Err(err) => {
                    warn!(error = %err, "accept failed, stopping accept loop");
                    self.running.store(false, Ordering::Relaxed);
                    drop(permit);
                    return Err(ProxyError::AcceptFailed(err));
                }
            }
        }

        Ok(())
    }
}

/// Per-connection entry point: sniff the first byte, route to a handler,
/// then unconditionally emit the access-log record and stats update
/// regardless of which path the handler took or how it failed.
async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    config: Arc<ProxyConfig>,
    authenticator: Arc<Authenticator>,
    stats: Arc<Stats>,
) {
    use tokio::io::AsyncReadExt;

    let mut record = ConnectionRecord::new(addr);

    let mut sniff = [0u8; 1];
    let n = match stream.read(&mut sniff).await {
        Ok(n) => n,
        Err(err) => {
            debug!(client = %addr, error = %err, "failed to read sniff byte");
            return;
        }
    };
    if n == 0 {
        debug!(client = %addr, "client closed before sending any bytes");
        return;
    }

    let connect_timeout = Duration::from_secs(config.connection_timeout);
    let idle_timeout = Some(Duration::from_secs(config.idle_timeout));
    let buffer_size = config.buffer_size;

    let result = if sniff[0] == 0x05 && config.socks5_enabled() {
        socks5::handle(
            stream,
            &authenticator,
            &stats,
            connect_timeout,
            idle_timeout,
            buffer_size,
            &mut record,
        )
        .await
    } else {
        http::handle(
            stream,
            sniff[0],
            &authenticator,
            &stats,
            connect_timeout,
            idle_timeout,
            buffer_size,
            &mut record,
        )
        .await
    };

    match result {
        Ok(pump_result) => {
            record.bytes_client_to_target = pump_result.bytes_client_to_target;
            record.bytes_target_to_client = pump_result.bytes_target_to_client;
            stats.add_traffic(
                pump_result.bytes_client_to_target,
                pump_result.bytes_target_to_client,
            );
            if pump_result.had_error {
                stats.record_error();
                record.mark_error("relay I/O error");
            }
        }
        Err(err) => {
            if !err.is_client_closed_early() {
                stats.record_error();
            }
            record.mark_error(err.to_string());
        }
    }

    record.log(config.access_log);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_picks_an_ephemeral_port_and_reports_it() {
        let mut config = ProxyConfig::default();
        config.port = 0;
        let server = Server::bind(config).await.unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert_eq!(server.stats().total(), 0);
    }

    #[tokio::test]
    async fn shutdown_handle_stops_the_accept_loop() {
        let mut config = ProxyConfig::default();
        config.port = 0;
        let server = Server::bind(config).await.unwrap();
        let shutdown = server.shutdown_handle();
        shutdown.store(false, Ordering::Relaxed);

        let result = server.run().await;
        assert!(result.is_ok());
    }
}
