//! Bounded parallel layer downloader.
//!
//! Layers dispatch highest-priority first, at most `max_streams` in flight,
//! each with its own bounded retry and per-request timeout. Downloaded bytes
//! are digest-verified in memory before they touch the caller's sink, so a
//! retried layer never leaves a partial write behind.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use crate::cancel::CancellationToken;
use crate::connection_pool::ConnectionPool;
use crate::digest::digest_bytes;
use crate::error_handling::{utils as errors, TransferError};
use crate::task_group::ConcurrencyLimit;
use crate::utils::{env_usize, log};

/// Smoothing factor for the latency moving average.
const LATENCY_EMA_ALPHA: f64 = 0.2;

/// Configuration for the multiplexer
#[derive(Clone, Copy, Debug)]
pub struct MultiplexerConfig {
    /// Maximum simultaneous downloads
    pub max_streams: usize,
    /// Retries per layer beyond the first attempt
    pub retry_attempts: u32,
    /// Per-layer request timeout
    pub layer_timeout: Duration,
    /// Sort by priority before dispatch
    pub priority_enabled: bool,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            max_streams: 100,
            retry_attempts: 3,
            layer_timeout: Duration::from_secs(30),
            priority_enabled: true,
        }
    }
}

impl MultiplexerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_streams: env_usize("GANTRY_MAX_STREAMS", defaults.max_streams).max(1),
            ..defaults
        }
    }
}

/// One layer to download.
pub struct LayerDescriptor {
    pub url: String,
    /// Expected content digest; verified when present
    pub digest: Option<String>,
    /// Size hint for buffer pre-allocation
    pub size: u64,
    /// Higher runs earlier; ties keep submission order
    pub priority: i32,
    pub sink: Box<dyn Write + Send>,
}

/// Download counters. Min/max/average latency use compare-and-set loops so
/// concurrent layer completions never lose an update.
#[derive(Debug)]
pub struct MuxStats {
    total_layers: AtomicU64,
    completed_layers: AtomicU64,
    failed_layers: AtomicU64,
    retried_attempts: AtomicU64,
    bytes_downloaded: AtomicU64,
    ema_latency_bits: AtomicU64,
    min_latency_ms: AtomicU64,
    max_latency_ms: AtomicU64,
}

impl Default for MuxStats {
    fn default() -> Self {
        Self {
            total_layers: AtomicU64::new(0),
            completed_layers: AtomicU64::new(0),
            failed_layers: AtomicU64::new(0),
            retried_attempts: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
            ema_latency_bits: AtomicU64::new(0f64.to_bits()),
            min_latency_ms: AtomicU64::new(u64::MAX),
            max_latency_ms: AtomicU64::new(0),
        }
    }
}

impl MuxStats {
    fn record_layer(&self, bytes: u64, latency: Duration) {
        self.completed_layers.fetch_add(1, Ordering::Relaxed);
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
        let millis = latency.as_millis() as u64;

        let mut min = self.min_latency_ms.load(Ordering::Relaxed);
        while millis < min {
            match self.min_latency_ms.compare_exchange(
                min,
                millis,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => min = observed,
            }
        }

        let mut max = self.max_latency_ms.load(Ordering::Relaxed);
        while millis > max {
            match self.max_latency_ms.compare_exchange(
                max,
                millis,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => max = observed,
            }
        }

        let sample = millis as f64;
        let mut bits = self.ema_latency_bits.load(Ordering::Relaxed);
        loop {
            let current = f64::from_bits(bits);
            let next = if self.completed_layers.load(Ordering::Relaxed) <= 1 {
                sample
            } else {
                current * (1.0 - LATENCY_EMA_ALPHA) + sample * LATENCY_EMA_ALPHA
            };
            match self.ema_latency_bits.compare_exchange(
                bits,
                next.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => bits = observed,
            }
        }
    }

    pub fn snapshot(&self) -> MuxStatsSnapshot {
        let min = self.min_latency_ms.load(Ordering::Relaxed);
        MuxStatsSnapshot {
            total_layers: self.total_layers.load(Ordering::Relaxed),
            completed_layers: self.completed_layers.load(Ordering::Relaxed),
            failed_layers: self.failed_layers.load(Ordering::Relaxed),
            retried_attempts: self.retried_attempts.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            avg_latency_ms: f64::from_bits(self.ema_latency_bits.load(Ordering::Relaxed)),
            min_latency_ms: if min == u64::MAX { 0 } else { min },
            max_latency_ms: self.max_latency_ms.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time stats view
#[derive(Clone, Copy, Debug)]
pub struct MuxStatsSnapshot {
    pub total_layers: u64,
    pub completed_layers: u64,
    pub failed_layers: u64,
    pub retried_attempts: u64,
    pub bytes_downloaded: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
}

/// Bounded parallel downloader over the shared connection pool.
pub struct StreamMultiplexer {
    config: MultiplexerConfig,
    pool: Arc<ConnectionPool>,
    stats: Arc<MuxStats>,
}

impl StreamMultiplexer {
    pub fn new(pool: Arc<ConnectionPool>, config: MultiplexerConfig) -> Self {
        Self {
            config,
            pool,
            stats: Arc::new(MuxStats::default()),
        }
    }

    pub fn with_defaults(pool: Arc<ConnectionPool>) -> Self {
        Self::new(pool, MultiplexerConfig::default())
    }

    pub fn stats(&self) -> MuxStatsSnapshot {
        self.stats.snapshot()
    }

    /// Dispatch order under the configured priority policy: stable descending
    /// by priority, ties in submission order.
    pub fn dispatch_order(&self, layers: &mut [LayerDescriptor]) {
        if self.config.priority_enabled {
            layers.sort_by(|a, b| b.priority.cmp(&a.priority));
        }
    }

    /// Download every layer. Returns Ok only when all layers completed;
    /// otherwise an error naming the first failure and the failure count.
    pub fn download_layers(
        &self,
        ctx: &CancellationToken,
        mut layers: Vec<LayerDescriptor>,
    ) -> Result<(), TransferError> {
        if layers.is_empty() {
            return Ok(());
        }
        self.dispatch_order(&mut layers);
        self.stats
            .total_layers
            .fetch_add(layers.len() as u64, Ordering::Relaxed);

        let limit = Arc::new(ConcurrencyLimit::new(self.config.max_streams));
        let (tx, rx) = mpsc::channel::<Result<(), TransferError>>();
        let mut handles = Vec::with_capacity(layers.len());

        for layer in layers {
            let limit = Arc::clone(&limit);
            let ctx = ctx.clone();
            let pool = Arc::clone(&self.pool);
            let stats = Arc::clone(&self.stats);
            let config = self.config;
            let tx = tx.clone();
            handles.push(thread::spawn(move || {
                let _slot = limit.acquire();
                let result = download_one(&ctx, &pool, &stats, &config, layer);
                let _ = tx.send(result);
            }));
        }
        drop(tx);

        let mut failures = 0u64;
        let mut first_error: Option<TransferError> = None;
        for result in rx {
            if let Err(error) = result {
                if error.is_cancellation() {
                    // Let remaining workers observe the token and drain.
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(error);
                }
                failures += 1;
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
        }
        for handle in handles {
            let _ = handle.join();
        }

        match first_error {
            None => Ok(()),
            Some(error) => {
                log(&format!("{} layer download(s) failed; first: {}", failures, error));
                Err(error)
            }
        }
    }
}

fn download_one(
    ctx: &CancellationToken,
    pool: &Arc<ConnectionPool>,
    stats: &Arc<MuxStats>,
    config: &MultiplexerConfig,
    mut layer: LayerDescriptor,
) -> Result<(), TransferError> {
    let started = Instant::now();
    let mut attempt = 0u32;
    loop {
        ctx.check("download_layer")?;
        attempt += 1;
        match fetch_layer(pool, config, &layer) {
            Ok(bytes) => {
                layer
                    .sink
                    .write_all(&bytes)
                    .and_then(|_| layer.sink.flush())
                    .map_err(|e| errors::io_error("download_layer", Some(&layer.url), e))
                    .map_err(|error| {
                        stats.failed_layers.fetch_add(1, Ordering::Relaxed);
                        error
                    })?;
                stats.record_layer(bytes.len() as u64, started.elapsed());
                return Ok(());
            }
            Err(error) if error.is_retryable() && attempt <= config.retry_attempts => {
                stats.retried_attempts.fetch_add(1, Ordering::Relaxed);
                // Quadratic backoff: attempt^2 * 100ms.
                let wait = Duration::from_millis(100).saturating_mul(attempt * attempt);
                ctx.sleep("download_layer", wait)?;
            }
            Err(error) => {
                stats.failed_layers.fetch_add(1, Ordering::Relaxed);
                return Err(error);
            }
        }
    }
}

/// One GET attempt, fully buffered then digest-checked.
fn fetch_layer(
    pool: &Arc<ConnectionPool>,
    config: &MultiplexerConfig,
    layer: &LayerDescriptor,
) -> Result<Vec<u8>, TransferError> {
    let pooled = pool.get_client_for_url(&layer.url)?;
    let response = pooled
        .client()
        .get(&layer.url)
        .timeout(config.layer_timeout)
        .send()
        .map_err(|e| {
            if e.is_timeout() {
                errors::timeout_error(
                    "download_layer",
                    config.layer_timeout.as_millis() as u64,
                    config.layer_timeout.as_millis() as u64,
                )
            } else {
                errors::network_error("download_layer", Some(&layer.url), e.to_string())
            }
        })?;

    let status = response.status().as_u16();
    if status != 200 {
        return Err(errors::network_error_with_status(
            "download_layer",
            Some(&layer.url),
            status,
            "layer fetch failed",
        ));
    }

    let bytes = response
        .bytes()
        .map_err(|e| errors::network_error("download_layer", Some(&layer.url), e.to_string()))?
        .to_vec();

    if layer.size > 0 && bytes.len() as u64 != layer.size {
        return Err(errors::integrity_error(
            "download_layer",
            &format!("{} bytes", layer.size),
            &format!("{} bytes", bytes.len()),
        ));
    }
    if let Some(expected) = &layer.digest {
        let actual = digest_bytes(&bytes);
        if &actual != expected {
            return Err(errors::integrity_error("download_layer", expected, &actual));
        }
    }
    Ok(bytes)
}
