//! Transfer manager: per-blob and per-image orchestration.
//!
//! A blob moves as source reader -> optional streaming compression (producer
//! thread feeding a bounded pipe, decompressed again at the destination
//! boundary) -> digest-verified destination write, all inside a retry
//! envelope with exponential backoff. Images transfer layers in bounded
//! parallel, then the config blob, and push the manifest last so nothing it
//! references can be missing at the destination.

use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::blob_mount::{BlobMounter, MountRequest};
use crate::buffer_pool::{global_pool, BufferPool};
use crate::buffered_io::copy_cancellable;
use crate::cancel::CancellationToken;
use crate::compression::{CompressingWriter, CompressionOptions, CompressionType, DecompressingReader};
use crate::delta_manager::{DeltaManager, DeltaOutcome};
use crate::digest::is_valid_digest;
use crate::error_handling::{utils as errors, TransferError};
use crate::pipe::{pipe, DEFAULT_PIPE_CAPACITY};
use crate::repository::{parse_manifest_refs, DeltaReceiver, Repository};
use crate::task_group::run_bounded;
use crate::utils::{env_usize, format_bytes, log};

/// Retry envelope settings
#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    /// Retries beyond the first attempt
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Delay multiplier between attempts
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

/// Configuration for the transfer manager
#[derive(Clone, Debug)]
pub struct TransferConfig {
    pub retry: RetryConfig,
    /// In-flight compression; None ships raw bytes
    pub compression: Option<CompressionOptions>,
    /// Delta policy for delta-capable destinations
    pub delta: crate::delta_manager::DeltaConfig,
    /// Parallel layer transfers per image
    pub layer_concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            compression: None,
            delta: crate::delta_manager::DeltaConfig::default(),
            layer_concurrency: 8,
        }
    }
}

impl TransferConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            layer_concurrency: env_usize("GANTRY_LAYER_CONCURRENCY", defaults.layer_concurrency)
                .max(1),
            ..defaults
        }
    }

    pub fn with_compression(mut self, options: CompressionOptions) -> Self {
        self.compression = Some(options);
        self
    }
}

/// Process-lifetime transfer counters, atomically updated.
#[derive(Debug, Default)]
pub struct TransferStats {
    blobs_completed: AtomicU64,
    blobs_skipped: AtomicU64,
    bytes_transferred: AtomicU64,
    bytes_raw: AtomicU64,
    bytes_compressed: AtomicU64,
    delta_bytes_saved: AtomicU64,
    retry_count: AtomicU64,
    transfer_duration_ms: AtomicU64,
    compression_duration_ms: AtomicU64,
}

/// Serializable point-in-time stats view
#[derive(Clone, Copy, Debug, Serialize)]
pub struct TransferStatsSnapshot {
    pub blobs_completed: u64,
    pub blobs_skipped: u64,
    pub bytes_transferred: u64,
    pub bytes_raw: u64,
    pub bytes_compressed: u64,
    pub delta_bytes_saved: u64,
    pub retry_count: u64,
    pub transfer_duration_ms: u64,
    pub compression_duration_ms: u64,
    /// compressed-to-raw size ratio, 0 when no compression ran
    pub compression_ratio: f64,
    /// percentage of raw bytes avoided by delta transfers
    pub delta_reduction: f64,
}

impl TransferStats {
    pub fn snapshot(&self) -> TransferStatsSnapshot {
        let raw = self.bytes_raw.load(Ordering::Relaxed);
        let compressed = self.bytes_compressed.load(Ordering::Relaxed);
        let saved = self.delta_bytes_saved.load(Ordering::Relaxed);
        TransferStatsSnapshot {
            blobs_completed: self.blobs_completed.load(Ordering::Relaxed),
            blobs_skipped: self.blobs_skipped.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            bytes_raw: raw,
            bytes_compressed: compressed,
            delta_bytes_saved: saved,
            retry_count: self.retry_count.load(Ordering::Relaxed),
            transfer_duration_ms: self.transfer_duration_ms.load(Ordering::Relaxed),
            compression_duration_ms: self.compression_duration_ms.load(Ordering::Relaxed),
            compression_ratio: if raw > 0 && compressed > 0 {
                compressed as f64 / raw as f64
            } else {
                0.0
            },
            delta_reduction: if raw > 0 {
                saved as f64 / raw as f64 * 100.0
            } else {
                0.0
            },
        }
    }
}

/// Outcome of one blob transfer.
#[derive(Clone, Debug)]
pub struct BlobTransferSummary {
    pub digest: String,
    /// Bytes that crossed the wire boundary
    pub bytes_transferred: u64,
    /// Original blob size
    pub bytes_raw: u64,
    pub skipped: bool,
    pub used_delta: bool,
    pub savings_percent: f64,
    pub duration: Duration,
}

/// Outcome of one image transfer.
#[derive(Clone, Debug)]
pub struct ImageTransferSummary {
    pub tag: String,
    pub layers_transferred: usize,
    pub layers_skipped: usize,
    pub bytes_transferred: u64,
    pub duration: Duration,
}

/// Orchestrates blob and image transfers between repository handles.
pub struct TransferManager {
    config: TransferConfig,
    buffers: Arc<BufferPool>,
    delta: DeltaManager,
    stats: Arc<TransferStats>,
}

impl TransferManager {
    pub fn new(config: TransferConfig) -> Self {
        let delta = DeltaManager::new(config.delta);
        Self {
            config,
            buffers: global_pool(),
            delta,
            stats: Arc::new(TransferStats::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(TransferConfig::default())
    }

    pub fn stats(&self) -> TransferStatsSnapshot {
        self.stats.snapshot()
    }

    /// Log the counters as one JSON line for operational visibility.
    pub fn log_stats(&self) {
        if let Ok(json) = serde_json::to_string(&self.stats.snapshot()) {
            log(&format!("transfer stats: {}", json));
        }
    }

    /// Move one blob from `src` to `dst`, honoring the retry envelope.
    pub fn transfer_blob(
        &self,
        ctx: &CancellationToken,
        src: &dyn Repository,
        dst: &dyn Repository,
        digest: &str,
    ) -> Result<BlobTransferSummary, TransferError> {
        if !is_valid_digest(digest) {
            return Err(errors::invalid_input(
                "transfer_blob",
                &format!("malformed digest: {}", digest),
            ));
        }
        self.with_retries(ctx, "transfer_blob", || {
            self.transfer_blob_once(ctx, src, dst, digest)
        })
    }

    /// Try a cross-repo mount first; fall back to byte transfer when the
    /// registry cannot mount. Only useful when both repositories live on the
    /// registry behind `registry_url`.
    pub fn transfer_blob_with_mount(
        &self,
        ctx: &CancellationToken,
        src: &dyn Repository,
        dst: &dyn Repository,
        digest: &str,
        mounter: &BlobMounter,
        registry_url: &str,
    ) -> Result<BlobTransferSummary, TransferError> {
        let request = MountRequest {
            digest: digest.to_string(),
            source_repository: src.name(),
            target_repository: dst.name(),
        };
        match mounter.mount(ctx, registry_url, &request) {
            Ok(outcome) if outcome.succeeded() => {
                self.stats.blobs_skipped.fetch_add(1, Ordering::Relaxed);
                log(&format!("mounted {} into {} without transfer", digest, dst.name()));
                Ok(BlobTransferSummary {
                    digest: digest.to_string(),
                    bytes_transferred: 0,
                    bytes_raw: 0,
                    skipped: true,
                    used_delta: false,
                    savings_percent: 100.0,
                    duration: Duration::ZERO,
                })
            }
            Ok(_) => self.transfer_blob(ctx, src, dst, digest),
            Err(error) if error.is_cancellation() => Err(error),
            Err(error) => {
                log(&format!("mount failed, falling back to bytes: {}", error));
                self.transfer_blob(ctx, src, dst, digest)
            }
        }
    }

    /// Delta-capable path: ship a framed delta against `base_digest`, which
    /// the destination already holds, falling back to full bytes whenever the
    /// policy says the delta is not worth it.
    pub fn transfer_blob_delta(
        &self,
        ctx: &CancellationToken,
        src: &dyn Repository,
        dst: &dyn DeltaReceiver,
        digest: &str,
        base_digest: &str,
    ) -> Result<BlobTransferSummary, TransferError> {
        if !is_valid_digest(digest) || !is_valid_digest(base_digest) {
            return Err(errors::invalid_input(
                "transfer_blob_delta",
                "malformed digest",
            ));
        }
        let dst_repo: &dyn Repository = dst;
        if !self.delta.config().delta_enabled() {
            return self.transfer_blob(ctx, src, dst_repo, digest);
        }

        self.with_retries(ctx, "transfer_blob_delta", || {
            let started = Instant::now();
            ctx.check("transfer_blob_delta")?;

            if dst_repo.has_blob(ctx, digest)? {
                self.stats.blobs_skipped.fetch_add(1, Ordering::Relaxed);
                return Ok(skipped_summary(digest, started.elapsed()));
            }

            let mut base_reader = dst_repo.get_layer_reader(ctx, base_digest)?;
            let mut base = Vec::new();
            base_reader
                .read_to_end(&mut base)
                .map_err(|e| errors::io_error("transfer_blob_delta", Some(base_digest), e))?;

            let mut target_reader = src.get_layer_reader(ctx, digest)?;
            let mut target = Vec::new();
            target_reader
                .read_to_end(&mut target)
                .map_err(|e| errors::io_error("transfer_blob_delta", Some(digest), e))?;

            ctx.check("transfer_blob_delta")?;
            let outcome = self.delta.plan(&base, &target)?;
            let raw_len = target.len() as u64;
            match outcome {
                DeltaOutcome::Identical => {
                    // Same content under a different digest name cannot
                    // happen; equal digests mean an identical-format delta
                    // whose application is a local copy at the destination.
                    let identical = crate::delta_codec::create_delta(
                        &base,
                        &target,
                        crate::delta_codec::DeltaFormat::Identical,
                    )?;
                    dst.put_layer_delta(ctx, digest, base_digest, &identical)?;
                    self.record_blob(0, raw_len, started.elapsed());
                    self.stats.delta_bytes_saved.fetch_add(raw_len, Ordering::Relaxed);
                    Ok(BlobTransferSummary {
                        digest: digest.to_string(),
                        bytes_transferred: 0,
                        bytes_raw: raw_len,
                        skipped: false,
                        used_delta: true,
                        savings_percent: 100.0,
                        duration: started.elapsed(),
                    })
                }
                DeltaOutcome::Delta { bytes, format } => {
                    let wire = dst.put_layer_delta(ctx, digest, base_digest, &bytes)?;
                    let saved = raw_len.saturating_sub(wire);
                    self.record_blob(wire, raw_len, started.elapsed());
                    self.stats.delta_bytes_saved.fetch_add(saved, Ordering::Relaxed);
                    log(&format!(
                        "delta({}) shipped {} for {} ({} raw)",
                        format.name(),
                        format_bytes(wire),
                        digest,
                        format_bytes(raw_len)
                    ));
                    Ok(BlobTransferSummary {
                        digest: digest.to_string(),
                        bytes_transferred: wire,
                        bytes_raw: raw_len,
                        skipped: false,
                        used_delta: true,
                        savings_percent: if raw_len > 0 {
                            saved as f64 / raw_len as f64 * 100.0
                        } else {
                            0.0
                        },
                        duration: started.elapsed(),
                    })
                }
                DeltaOutcome::Full { reason } => {
                    log(&format!("delta skipped for {}: {}", digest, reason));
                    drop(base);
                    let mut cursor = std::io::Cursor::new(target);
                    let written = dst_repo.put_layer(ctx, digest, &mut cursor)?;
                    self.record_blob(written, raw_len, started.elapsed());
                    Ok(BlobTransferSummary {
                        digest: digest.to_string(),
                        bytes_transferred: written,
                        bytes_raw: raw_len,
                        skipped: false,
                        used_delta: false,
                        savings_percent: 0.0,
                        duration: started.elapsed(),
                    })
                }
            }
        })
    }

    /// Move an image: layers in bounded parallel, then the config blob, and
    /// the manifest strictly last.
    pub fn transfer_image(
        &self,
        ctx: &CancellationToken,
        src: &dyn Repository,
        dst: &dyn Repository,
        tag: &str,
    ) -> Result<ImageTransferSummary, TransferError> {
        if tag.is_empty() {
            return Err(errors::invalid_input("transfer_image", "empty tag"));
        }
        let started = Instant::now();
        let manifest = src.get_manifest(ctx, tag)?;
        let refs = parse_manifest_refs(&manifest.content)?;

        let layer_tasks: Vec<_> = refs
            .layer_digests
            .iter()
            .map(|digest| move || self.transfer_blob(ctx, src, dst, digest))
            .collect();
        let results = run_bounded(
            ctx,
            "transfer_image",
            self.config.layer_concurrency,
            layer_tasks,
        );

        let mut layers_transferred = 0usize;
        let mut layers_skipped = 0usize;
        let mut bytes = 0u64;
        for result in results {
            let summary = result?;
            if summary.skipped {
                layers_skipped += 1;
            } else {
                layers_transferred += 1;
            }
            bytes += summary.bytes_transferred;
        }

        if let Some(config_digest) = &refs.config_digest {
            let summary = self.transfer_blob(ctx, src, dst, config_digest)?;
            if summary.skipped {
                layers_skipped += 1;
            } else {
                layers_transferred += 1;
            }
            bytes += summary.bytes_transferred;
        }

        // Manifest last: everything it references now exists at dst.
        dst.put_manifest(ctx, tag, &manifest)?;
        log(&format!(
            "transferred {}:{} ({} layer(s), {})",
            dst.name(),
            tag,
            layers_transferred,
            format_bytes(bytes)
        ));
        Ok(ImageTransferSummary {
            tag: tag.to_string(),
            layers_transferred,
            layers_skipped,
            bytes_transferred: bytes,
            duration: started.elapsed(),
        })
    }

    fn transfer_blob_once(
        &self,
        ctx: &CancellationToken,
        src: &dyn Repository,
        dst: &dyn Repository,
        digest: &str,
    ) -> Result<BlobTransferSummary, TransferError> {
        let started = Instant::now();
        ctx.check("transfer_blob")?;

        // Identical-content shortcut: the destination already has these bytes.
        if dst.has_blob(ctx, digest)? {
            self.stats.blobs_skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(skipped_summary(digest, started.elapsed()));
        }

        let reader = src.get_layer_reader(ctx, digest)?;
        match self.config.compression {
            Some(options) if options.ctype != CompressionType::None => {
                self.stream_compressed(ctx, dst, digest, reader, options, started)
            }
            _ => self.stream_raw(ctx, dst, digest, reader, started),
        }
    }

    fn stream_raw(
        &self,
        ctx: &CancellationToken,
        dst: &dyn Repository,
        digest: &str,
        mut reader: Box<dyn Read + Send>,
        started: Instant,
    ) -> Result<BlobTransferSummary, TransferError> {
        let counter = Arc::new(AtomicU64::new(0));
        let mut counting = CountingReader {
            inner: CancellableReader {
                inner: &mut reader,
                ctx: ctx.clone(),
                operation: "transfer_blob",
            },
            count: Arc::clone(&counter),
        };
        let written = dst.put_layer(ctx, digest, &mut counting)?;
        let wire = counter.load(Ordering::Relaxed);
        self.record_blob(wire, written, started.elapsed());
        Ok(BlobTransferSummary {
            digest: digest.to_string(),
            bytes_transferred: wire,
            bytes_raw: written,
            skipped: false,
            used_delta: false,
            savings_percent: 0.0,
            duration: started.elapsed(),
        })
    }

    /// Pipe-based streaming compression: a producer thread compresses into a
    /// bounded pipe while the destination consumes, so compressed bytes flow
    /// as they are produced instead of after a full buffering pass.
    fn stream_compressed(
        &self,
        ctx: &CancellationToken,
        dst: &dyn Repository,
        digest: &str,
        mut reader: Box<dyn Read + Send>,
        options: CompressionOptions,
        started: Instant,
    ) -> Result<BlobTransferSummary, TransferError> {
        let (pipe_writer, pipe_reader) = pipe(DEFAULT_PIPE_CAPACITY);
        let producer_ctx = ctx.clone();
        let buffers = Arc::clone(&self.buffers);
        let producer = thread::spawn(move || -> Result<(u64, Duration), TransferError> {
            let compress_started = Instant::now();
            let mut compressor = CompressingWriter::new(pipe_writer, &options);
            let copied = copy_cancellable(
                &producer_ctx,
                "compress_blob",
                &buffers,
                &mut reader,
                &mut compressor,
            )?;
            compressor.finish()?;
            Ok((copied, compress_started.elapsed()))
        });

        // Wire accounting sits on the compressed side of the pipe; the
        // destination sees decompressed bytes and verifies the digest.
        let wire_counter = Arc::new(AtomicU64::new(0));
        let counting = CountingReader {
            inner: pipe_reader,
            count: Arc::clone(&wire_counter),
        };
        let mut decompressed = DecompressingReader::new(counting, options.ctype);
        let put_result = dst.put_layer(ctx, digest, &mut decompressed);
        // Close the read side before joining: a producer blocked on a full
        // pipe unblocks with a broken-pipe write error instead of hanging.
        drop(decompressed);

        let produced = producer.join().unwrap_or_else(|_| {
            Err(errors::resource_error("compress_blob", "compression worker panicked"))
        });

        let (compress_time, written) = match (produced, put_result) {
            (Ok((_, compress_time)), Ok(written)) => (compress_time, written),
            // A genuine producer failure explains the short stream better
            // than the digest mismatch it causes downstream.
            (Err(producer_error), Err(_)) if !is_pipe_close(&producer_error) => {
                return Err(producer_error)
            }
            (Err(_), Err(consumer_error)) => return Err(consumer_error),
            (Err(producer_error), Ok(_)) => return Err(producer_error),
            (Ok(_), Err(consumer_error)) => return Err(consumer_error),
        };
        let wire = wire_counter.load(Ordering::Relaxed);

        self.stats
            .compression_duration_ms
            .fetch_add(compress_time.as_millis() as u64, Ordering::Relaxed);
        self.stats.bytes_compressed.fetch_add(wire, Ordering::Relaxed);
        self.record_blob(wire, written, started.elapsed());

        Ok(BlobTransferSummary {
            digest: digest.to_string(),
            bytes_transferred: wire,
            bytes_raw: written,
            skipped: false,
            used_delta: false,
            savings_percent: if written > 0 && wire < written {
                (written - wire) as f64 / written as f64 * 100.0
            } else {
                0.0
            },
            duration: started.elapsed(),
        })
    }

    fn record_blob(&self, wire: u64, raw: u64, duration: Duration) {
        self.stats.blobs_completed.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_transferred.fetch_add(wire, Ordering::Relaxed);
        self.stats.bytes_raw.fetch_add(raw, Ordering::Relaxed);
        self.stats
            .transfer_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Retry envelope: exponential backoff from `initial_delay` with ratio
    /// `factor`, capped at `max_delay`. Cancellation aborts, never retries.
    fn with_retries<T>(
        &self,
        ctx: &CancellationToken,
        operation: &str,
        mut attempt_fn: impl FnMut() -> Result<T, TransferError>,
    ) -> Result<T, TransferError> {
        let retry = self.config.retry;
        let mut delay = retry.initial_delay;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match attempt_fn() {
                Ok(value) => return Ok(value),
                Err(error) if error.is_cancellation() => return Err(error),
                Err(error) if error.is_retryable() && attempt <= retry.attempts => {
                    self.stats.retry_count.fetch_add(1, Ordering::Relaxed);
                    log(&format!(
                        "{} attempt {} failed, retrying in {:?}: {}",
                        operation, attempt, delay, error
                    ));
                    ctx.sleep(operation, delay)?;
                    let next = delay.mul_f64(retry.factor);
                    delay = next.min(retry.max_delay);
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// The write error a producer sees when the consumer closed the pipe first;
/// in that case the consumer's own error is the interesting one.
fn is_pipe_close(error: &TransferError) -> bool {
    matches!(error, TransferError::Io { source, .. } if source.contains("pipe reader closed"))
}

fn skipped_summary(digest: &str, duration: Duration) -> BlobTransferSummary {
    BlobTransferSummary {
        digest: digest.to_string(),
        bytes_transferred: 0,
        bytes_raw: 0,
        skipped: true,
        used_delta: false,
        savings_percent: 100.0,
        duration,
    }
}

struct CountingReader<R: Read> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(out)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

/// Reader that surfaces ambient cancellation as an I/O error on every read,
/// so a destination mid-upload aborts at its next suspension point.
struct CancellableReader<R: Read> {
    inner: R,
    ctx: CancellationToken,
    operation: &'static str,
}

impl<R: Read> Read for CancellableReader<R> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if self.ctx.is_cancelled() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                format!("{} cancelled", self.operation),
            ));
        }
        self.inner.read(out)
    }
}
