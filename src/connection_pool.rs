//! Host-keyed HTTP client pool.
//!
//! One tuned `reqwest::blocking::Client` per registry host, shared by every
//! transfer touching that host so TLS sessions and idle connections get
//! reused. A sweeper thread reaps clients past their TTL.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::error_handling::{utils as errors, TransferError};
use crate::utils::{env_u64, log};

/// Configuration for the connection pool
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Clients older than this are evicted regardless of activity
    pub connection_ttl: Duration,
    /// Sweeper period
    pub cleanup_interval: Duration,
    /// Idle connections kept per host by the transport
    pub max_idle_per_host: usize,
    /// Transport idle connection timeout
    pub idle_timeout: Duration,
    /// Dial timeout covering TCP connect and TLS handshake
    pub connect_timeout: Duration,
    /// Read inactivity timeout while waiting on response bytes
    pub read_timeout: Duration,
    /// TCP keep-alive interval
    pub keep_alive: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection_ttl: Duration::from_secs(5 * 60),
            cleanup_interval: Duration::from_secs(60),
            max_idle_per_host: 100,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    /// Defaults with GANTRY_CONN_TTL_SECS / GANTRY_CONN_SWEEP_SECS overrides.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            connection_ttl: Duration::from_secs(env_u64("GANTRY_CONN_TTL_SECS", 5 * 60)),
            cleanup_interval: Duration::from_secs(env_u64("GANTRY_CONN_SWEEP_SECS", 60)),
            ..defaults
        }
    }
}

/// One pooled client plus its usage accounting.
pub struct PooledClient {
    client: reqwest::blocking::Client,
    created_at: Instant,
    last_used_ms: AtomicU64,
    request_count: AtomicU64,
}

impl PooledClient {
    pub fn client(&self) -> &reqwest::blocking::Client {
        &self.client
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    fn mark_used(&self, epoch: Instant) {
        self.last_used_ms
            .store(epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Pool counters, all updated with relaxed atomics
#[derive(Debug, Default)]
pub struct PoolMetrics {
    total_requests: AtomicU64,
    connection_reuses: AtomicU64,
    new_connections: AtomicU64,
    expired_connections: AtomicU64,
    failed_connections: AtomicU64,
}

/// Point-in-time metrics view
#[derive(Clone, Copy, Debug)]
pub struct PoolMetricsSnapshot {
    pub active_clients: usize,
    pub total_requests: u64,
    pub connection_reuses: u64,
    pub new_connections: u64,
    pub expired_connections: u64,
    pub failed_connections: u64,
}

impl PoolMetricsSnapshot {
    /// Fraction of requests served by an existing client.
    pub fn reuse_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.connection_reuses as f64 / self.total_requests as f64
    }
}

/// Host-keyed client cache with TTL-based reaping.
pub struct ConnectionPool {
    config: PoolConfig,
    clients: Arc<DashMap<String, Arc<PooledClient>>>,
    metrics: Arc<PoolMetrics>,
    epoch: Instant,
    shutdown: Arc<AtomicBool>,
    sweeper: Option<JoinHandle<()>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let clients: Arc<DashMap<String, Arc<PooledClient>>> = Arc::new(DashMap::new());
        let metrics = Arc::new(PoolMetrics::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let sweeper = Some(spawn_sweeper(
            Arc::clone(&clients),
            Arc::clone(&metrics),
            Arc::clone(&shutdown),
            config.connection_ttl,
            config.cleanup_interval,
        ));

        Self {
            config,
            clients,
            metrics,
            epoch: Instant::now(),
            shutdown,
            sweeper,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(PoolConfig::default())
    }

    /// Get the client for `host`, creating or replacing as needed. The key is
    /// whatever the caller uses consistently; `host_key_for_url` derives one
    /// from a full URL.
    pub fn get_client(&self, host: &str) -> Result<Arc<PooledClient>, TransferError> {
        if host.is_empty() {
            return Err(errors::invalid_input("get_client", "empty host"));
        }

        let existing = self.clients.get(host).map(|entry| Arc::clone(entry.value()));
        if let Some(pooled) = existing {
            if pooled.age() <= self.config.connection_ttl {
                pooled.mark_used(self.epoch);
                self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);
                self.metrics.connection_reuses.fetch_add(1, Ordering::Relaxed);
                return Ok(pooled);
            }
            self.clients.remove(host);
            self.metrics.expired_connections.fetch_add(1, Ordering::Relaxed);
        }

        let client = self.build_client().map_err(|e| {
            self.metrics.failed_connections.fetch_add(1, Ordering::Relaxed);
            errors::network_error(
                "create_client",
                Some(host),
                format!("failed to build HTTP client: {}", e),
            )
        })?;
        let pooled = Arc::new(PooledClient {
            client,
            created_at: Instant::now(),
            last_used_ms: AtomicU64::new(0),
            request_count: AtomicU64::new(0),
        });
        pooled.mark_used(self.epoch);
        self.clients.insert(host.to_string(), Arc::clone(&pooled));
        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);
        self.metrics.new_connections.fetch_add(1, Ordering::Relaxed);
        Ok(pooled)
    }

    /// Get the client for the host of `url`.
    pub fn get_client_for_url(&self, url: &str) -> Result<Arc<PooledClient>, TransferError> {
        let key = host_key_for_url(url)?;
        self.get_client(&key)
    }

    fn build_client(&self) -> reqwest::Result<reqwest::blocking::Client> {
        // HTTP/2 is preferred via ALPN; rustls resumes TLS sessions on its own.
        reqwest::blocking::Client::builder()
            .pool_max_idle_per_host(self.config.max_idle_per_host)
            .pool_idle_timeout(self.config.idle_timeout)
            .connect_timeout(self.config.connect_timeout)
            .read_timeout(self.config.read_timeout)
            .tcp_keepalive(self.config.keep_alive)
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .build()
    }

    pub fn metrics(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            active_clients: self.clients.len(),
            total_requests: self.metrics.total_requests.load(Ordering::Relaxed),
            connection_reuses: self.metrics.connection_reuses.load(Ordering::Relaxed),
            new_connections: self.metrics.new_connections.load(Ordering::Relaxed),
            expired_connections: self.metrics.expired_connections.load(Ordering::Relaxed),
            failed_connections: self.metrics.failed_connections.load(Ordering::Relaxed),
        }
    }

    /// Drop every pooled client immediately (mainly for tests and shutdown).
    pub fn clear(&self) {
        self.clients.clear();
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.sweeper.take() {
            let _ = handle.join();
        }
    }
}

fn spawn_sweeper(
    clients: Arc<DashMap<String, Arc<PooledClient>>>,
    metrics: Arc<PoolMetrics>,
    shutdown: Arc<AtomicBool>,
    ttl: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    thread::spawn(move || {
        const TICK: Duration = Duration::from_millis(100);
        loop {
            let mut waited = Duration::ZERO;
            while waited < interval {
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                thread::sleep(TICK.min(interval - waited));
                waited += TICK;
            }

            let before = clients.len();
            clients.retain(|_, pooled| pooled.age() <= ttl);
            let evicted = before.saturating_sub(clients.len());
            if evicted > 0 {
                metrics
                    .expired_connections
                    .fetch_add(evicted as u64, Ordering::Relaxed);
                log(&format!("connection pool evicted {} expired client(s)", evicted));
            }
        }
    })
}

/// `scheme://host[:port]` key for a URL, the pool's natural granularity.
pub fn host_key_for_url(url: &str) -> Result<String, TransferError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| errors::invalid_input("parse_url", &format!("{}: {}", url, e)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| errors::invalid_input("parse_url", &format!("no host in {}", url)))?;
    Ok(match parsed.port() {
        Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
        None => format!("{}://{}", parsed.scheme(), host),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_key_extraction() {
        assert_eq!(
            host_key_for_url("https://registry.example.com/v2/app/blobs/sha256:aa").unwrap(),
            "https://registry.example.com"
        );
        assert_eq!(
            host_key_for_url("http://127.0.0.1:5000/v2/").unwrap(),
            "http://127.0.0.1:5000"
        );
        assert!(host_key_for_url("not a url").is_err());
    }

    #[test]
    fn test_clients_are_reused_per_host() {
        let pool = ConnectionPool::with_defaults();
        let first = pool.get_client("https://registry-1.example.com").unwrap();
        let second = pool.get_client("https://registry-1.example.com").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = pool.get_client("https://registry-2.example.com").unwrap();
        assert!(!Arc::ptr_eq(&first, &other));

        let metrics = pool.metrics();
        assert_eq!(metrics.active_clients, 2);
        assert_eq!(metrics.new_connections, 2);
        assert_eq!(metrics.connection_reuses, 1);
        assert_eq!(metrics.total_requests, 3);
    }

    #[test]
    fn test_reuse_rate_grows_on_fixed_hosts() {
        let pool = ConnectionPool::with_defaults();
        for _ in 0..50 {
            pool.get_client("https://a.example.com").unwrap();
            pool.get_client("https://b.example.com").unwrap();
        }
        let metrics = pool.metrics();
        assert_eq!(metrics.total_requests, 100);
        assert_eq!(metrics.new_connections, 2);
        assert!(metrics.reuse_rate() > 0.95);
    }

    #[test]
    fn test_expired_client_is_replaced() {
        let config = PoolConfig {
            connection_ttl: Duration::from_millis(0),
            // Long interval: expiry in this test happens on access, not sweep.
            cleanup_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let pool = ConnectionPool::new(config);
        let first = pool.get_client("https://c.example.com").unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let second = pool.get_client("https://c.example.com").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        let metrics = pool.metrics();
        assert_eq!(metrics.expired_connections, 1);
        assert_eq!(metrics.new_connections, 2);
    }

    #[test]
    fn test_sweeper_reaps_idle_clients() {
        let config = PoolConfig {
            connection_ttl: Duration::from_millis(50),
            cleanup_interval: Duration::from_millis(100),
            ..Default::default()
        };
        let pool = ConnectionPool::new(config);
        pool.get_client("https://d.example.com").unwrap();
        assert_eq!(pool.metrics().active_clients, 1);

        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(pool.metrics().active_clients, 0);
        assert!(pool.metrics().expired_connections >= 1);
    }

    #[test]
    fn test_empty_host_rejected() {
        let pool = ConnectionPool::with_defaults();
        assert_eq!(pool.get_client("").unwrap_err().kind(), "invalid_input");
    }
}
