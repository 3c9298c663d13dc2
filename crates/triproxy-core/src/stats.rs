//! Aggregate statistics and per-connection access-log records
//!
//! `Stats` is the only multi-writer shared state in the engine; every field
//! is an atomic, with per-direction counters summed at report time rather
//! than incremented from many call sites mid-transfer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use tracing::info;

/// The dialect a connection turned out to be, once the sniff/parse
/// succeeded. Distinct from `config::Protocol`: `Connect` here corresponds
/// to the `https` protocol token, and a connection never appears in more
/// than one of these buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Http,
    Connect,
    Socks5,
}

impl Dialect {
    fn as_str(&self) -> &'static str {
        match self {
            Dialect::Http => "http",
            Dialect::Connect => "https",
            Dialect::Socks5 => "socks5",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Error,
}

/// Process-wide, concurrently-mutated counters.
#[derive(Debug, Default)]
pub struct Stats {
    total: AtomicU64,
    active: AtomicUsize,
    http: AtomicU64,
    connect: AtomicU64,
    socks5: AtomicU64,
    errors: AtomicU64,
    bytes_client_to_target: AtomicU64,
    bytes_target_to_client: AtomicU64,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Called the moment a connection's dialect becomes known. Returns an
    /// `ActiveGuard` whose `Drop` decrements `active` exactly once,
    /// regardless of which error branch the connection handler exits
    /// through.
    pub fn record_accepted(&self, dialect: Dialect) -> ActiveGuard<'_> {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        match dialect {
            Dialect::Http => self.http.fetch_add(1, Ordering::Relaxed),
            Dialect::Connect => self.connect.fetch_add(1, Ordering::Relaxed),
            Dialect::Socks5 => self.socks5.fetch_add(1, Ordering::Relaxed),
        };
        ActiveGuard { stats: self }
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_traffic(&self, client_to_target: u64, target_to_client: u64) {
        self.bytes_client_to_target
            .fetch_add(client_to_target, Ordering::Relaxed);
        self.bytes_target_to_client
            .fetch_add(target_to_client, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn bytes_client_to_target(&self) -> u64 {
        self.bytes_client_to_target.load(Ordering::Relaxed)
    }

    pub fn bytes_target_to_client(&self) -> u64 {
        self.bytes_target_to_client.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total: self.total(),
            active: self.active(),
            http: self.http.load(Ordering::Relaxed),
            connect: self.connect.load(Ordering::Relaxed),
            socks5: self.socks5.load(Ordering::Relaxed),
            errors: self.error_count(),
            bytes_client_to_target: self.bytes_client_to_target(),
            bytes_target_to_client: self.bytes_target_to_client(),
        }
    }

    pub fn log_snapshot(&self) {
        let s = self.snapshot();
        info!(
            total = s.total,
            active = s.active,
            http = s.http,
            https = s.connect,
            socks5 = s.socks5,
            errors = s.errors,
            bytes_client_to_target = s.bytes_client_to_target,
            bytes_target_to_client = s.bytes_target_to_client,
            "connection_stats"
        );
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub total: u64,
    pub active: usize,
    pub http: u64,
    pub connect: u64,
    pub socks5: u64,
    pub errors: u64,
    pub bytes_client_to_target: u64,
    pub bytes_target_to_client: u64,
}

/// RAII guard returned by [`Stats::record_accepted`]. Ensures `active` is
/// decremented exactly once per accepted connection, on every exit path
/// (early return, error, or normal completion) without a `finally` block.
pub struct ActiveGuard<'a> {
    stats: &'a Stats,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Per-connection record, built up over the life of a handler and emitted
/// as a single structured access-log event on teardown.
#[derive(Debug)]
pub struct ConnectionRecord {
    pub client_addr: SocketAddr,
    pub start: Instant,
    pub dialect: Option<Dialect>,
    pub target: Option<(String, u16)>,
    pub bytes_client_to_target: u64,
    pub bytes_target_to_client: u64,
    pub status: Status,
    pub error: Option<String>,
}

impl ConnectionRecord {
    pub fn new(client_addr: SocketAddr) -> Self {
        Self {
            client_addr,
            start: Instant::now(),
            dialect: None,
            target: None,
            bytes_client_to_target: 0,
            bytes_target_to_client: 0,
            status: Status::Success,
            error: None,
        }
    }

    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.status = Status::Error;
        self.error = Some(message.into());
    }

    /// Emit the single access-log event for this connection. Always called
    /// exactly once per accepted connection by the dispatcher, regardless
    /// of the handler's exit path.
    pub fn log(&self, access_log_enabled: bool) {
        if !access_log_enabled {
            return;
        }
        let duration_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        let dialect = self.dialect.map(|d| d.as_str()).unwrap_or("unknown");
        let (target_host, target_port) = self
            .target
            .as_ref()
            .map(|(h, p)| (h.as_str(), *p))
            .unwrap_or(("unknown", 0));

        match (&self.status, &self.error) {
            (Status::Error, Some(err)) => {
                tracing::warn!(
                    target: "access",
                    client = %self.client_addr,
                    protocol = dialect,
                    target_host,
                    target_port,
                    status = "error",
                    bytes_client_to_target = self.bytes_client_to_target,
                    bytes_target_to_client = self.bytes_target_to_client,
                    duration_ms,
                    error = %err,
                    "proxy_request_failed"
                );
            }
            _ => {
                tracing::info!(
                    target: "access",
                    client = %self.client_addr,
                    protocol = dialect,
                    target_host,
                    target_port,
                    status = "success",
                    bytes_client_to_target = self.bytes_client_to_target,
                    bytes_target_to_client = self.bytes_target_to_client,
                    duration_ms,
                    "proxy_request"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_returns_to_baseline_after_guard_drops() {
        let stats = Stats::new();
        assert_eq!(stats.active(), 0);
        {
            let _guard = stats.record_accepted(Dialect::Http);
            assert_eq!(stats.active(), 1);
            assert_eq!(stats.total(), 1);
        }
        assert_eq!(stats.active(), 0);
        assert_eq!(stats.total(), 1);
    }

    #[test]
    fn active_never_exceeds_total_and_never_negative() {
        let stats = Stats::new();
        let g1 = stats.record_accepted(Dialect::Http);
        let g2 = stats.record_accepted(Dialect::Socks5);
        assert!(stats.active() <= stats.total() as usize);
        drop(g1);
        drop(g2);
        assert_eq!(stats.active(), 0);
    }

    #[test]
    fn traffic_accumulates() {
        let stats = Stats::new();
        stats.add_traffic(100, 200);
        stats.add_traffic(50, 25);
        assert_eq!(stats.bytes_client_to_target(), 150);
        assert_eq!(stats.bytes_target_to_client(), 225);
    }
}
