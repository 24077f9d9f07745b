//! Delta policy: when to delta, which format, and when to give up.
//!
//! The thresholds are a contract, not a heuristic. Changing any of them
//! changes observable network behavior:
//! - equal digests skip the transfer outright
//! - sources below `min_delta_size` ship whole
//! - sources over `format_threshold` use the chunk format
//! - deltas larger than `max_delta_ratio` of the target fall back to a full send

use crate::delta_codec::{self, DeltaFormat, DEFAULT_CODEC_CHUNK_SIZE};
use crate::digest::digest_bytes;
use crate::error_handling::TransferError;
use crate::utils::{env_f64, env_usize};

pub const DEFAULT_MIN_DELTA_SIZE: usize = 1024;
pub const DEFAULT_MAX_DELTA_RATIO: f64 = 0.8;
/// Sources above this size diff chunk-wise instead of prefix/suffix.
pub const DEFAULT_FORMAT_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Configuration for delta decisions
#[derive(Clone, Copy, Debug)]
pub struct DeltaConfig {
    /// Sources below this are not worth diffing
    pub min_delta_size: usize,
    /// Delta-to-target size ratio above which a full transfer wins.
    /// Zero or negative disables delta entirely.
    pub max_delta_ratio: f64,
    /// Source size above which the chunk format is selected
    pub format_threshold: u64,
    /// Chunk size handed to the chunk codec
    pub chunk_size: usize,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            min_delta_size: DEFAULT_MIN_DELTA_SIZE,
            max_delta_ratio: DEFAULT_MAX_DELTA_RATIO,
            format_threshold: DEFAULT_FORMAT_THRESHOLD,
            chunk_size: DEFAULT_CODEC_CHUNK_SIZE,
        }
    }
}

impl DeltaConfig {
    /// Defaults with GANTRY_DELTA_* environment overrides.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            min_delta_size: env_usize("GANTRY_DELTA_MIN_SIZE", defaults.min_delta_size),
            max_delta_ratio: env_f64("GANTRY_DELTA_MAX_RATIO", defaults.max_delta_ratio),
            format_threshold: defaults.format_threshold,
            chunk_size: env_usize("GANTRY_DELTA_CHUNK_SIZE", defaults.chunk_size),
        }
    }

    pub fn delta_enabled(&self) -> bool {
        self.max_delta_ratio > 0.0
    }
}

/// What the policy decided for one source/target pair.
#[derive(Debug)]
pub enum DeltaOutcome {
    /// Digests are equal, nothing to send
    Identical,
    /// Ship this framed delta instead of the target bytes
    Delta { bytes: Vec<u8>, format: DeltaFormat },
    /// Ship the target whole
    Full { reason: &'static str },
}

impl DeltaOutcome {
    /// Bytes that would go over the wire under this outcome.
    pub fn wire_size(&self, target_len: usize) -> usize {
        match self {
            DeltaOutcome::Identical => 0,
            DeltaOutcome::Delta { bytes, .. } => bytes.len(),
            DeltaOutcome::Full { .. } => target_len,
        }
    }

    /// Percentage saved against shipping the target whole.
    pub fn reduction_percent(&self, target_len: usize) -> f64 {
        if target_len == 0 {
            return 0.0;
        }
        let wire = self.wire_size(target_len) as f64;
        ((target_len as f64 - wire) / target_len as f64 * 100.0).max(0.0)
    }
}

/// Applies the delta policy for the transfer manager.
pub struct DeltaManager {
    config: DeltaConfig,
}

impl DeltaManager {
    pub fn new(config: DeltaConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(DeltaConfig::default())
    }

    pub fn config(&self) -> &DeltaConfig {
        &self.config
    }

    /// Format selection by source size.
    pub fn select_format(&self, source_len: u64) -> DeltaFormat {
        if source_len > self.config.format_threshold {
            DeltaFormat::Chunk
        } else {
            DeltaFormat::Bsdiff
        }
    }

    /// Run the full policy: identical shortcut, enable/size gates, format
    /// selection, codec invocation, ratio fallback.
    pub fn plan(&self, source: &[u8], target: &[u8]) -> Result<DeltaOutcome, TransferError> {
        if !target.is_empty() && !source.is_empty() && digest_bytes(source) == digest_bytes(target) {
            return Ok(DeltaOutcome::Identical);
        }
        if !self.config.delta_enabled() {
            return Ok(DeltaOutcome::Full { reason: "delta disabled" });
        }
        if source.len() < self.config.min_delta_size {
            return Ok(DeltaOutcome::Full { reason: "source below minimum delta size" });
        }
        if target.is_empty() {
            return Ok(DeltaOutcome::Full { reason: "empty target" });
        }

        let format = self.select_format(source.len() as u64);
        let bytes = delta_codec::create_delta_with_chunk_size(
            source,
            target,
            format,
            self.config.chunk_size,
        )?;

        let ratio = bytes.len() as f64 / target.len() as f64;
        if ratio > self.config.max_delta_ratio {
            return Ok(DeltaOutcome::Full { reason: "delta exceeded savings threshold" });
        }
        Ok(DeltaOutcome::Delta { bytes, format })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta_codec::apply_delta;

    #[test]
    fn test_identical_sources_skip() {
        let manager = DeltaManager::with_defaults();
        let data = vec![65u8; 4096];
        let outcome = manager.plan(&data, &data).unwrap();
        assert!(matches!(outcome, DeltaOutcome::Identical));
        assert_eq!(outcome.wire_size(data.len()), 0);
        assert!((outcome.reduction_percent(data.len()) - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_disabled_ratio_means_full() {
        let manager = DeltaManager::new(DeltaConfig {
            max_delta_ratio: 0.0,
            ..Default::default()
        });
        let source = vec![1u8; 4096];
        let target = vec![2u8; 4096];
        assert!(matches!(
            manager.plan(&source, &target).unwrap(),
            DeltaOutcome::Full { reason: "delta disabled" }
        ));
    }

    #[test]
    fn test_small_source_skips_delta() {
        let manager = DeltaManager::with_defaults();
        let source = b"tiny config blob".to_vec();
        let target = b"tiny config blot".to_vec();
        assert!(matches!(
            manager.plan(&source, &target).unwrap(),
            DeltaOutcome::Full { reason: "source below minimum delta size" }
        ));
    }

    #[test]
    fn test_format_selection_by_size() {
        let manager = DeltaManager::with_defaults();
        assert_eq!(manager.select_format(1024), DeltaFormat::Bsdiff);
        assert_eq!(manager.select_format(10 * 1024 * 1024), DeltaFormat::Bsdiff);
        assert_eq!(manager.select_format(10 * 1024 * 1024 + 1), DeltaFormat::Chunk);
    }

    #[test]
    fn test_near_identical_content_produces_small_delta() {
        let manager = DeltaManager::with_defaults();
        let source: Vec<u8> = (0..100_000u32).map(|i| (i % 199) as u8).collect();
        let mut target = source.clone();
        target[60_000] ^= 0xff;

        let outcome = manager.plan(&source, &target).unwrap();
        match &outcome {
            DeltaOutcome::Delta { bytes, format } => {
                assert_eq!(*format, DeltaFormat::Bsdiff);
                assert!(bytes.len() < target.len() / 2);
                assert_eq!(apply_delta(bytes, &source).unwrap(), target);
            }
            other => panic!("expected delta, got {:?}", other),
        }
    }

    #[test]
    fn test_unrelated_content_falls_back_to_full() {
        let manager = DeltaManager::with_defaults();
        // High-entropy-ish unrelated contents: prefix/suffix finds nothing.
        let source: Vec<u8> = (0..50_000usize).map(|i| ((i * 31) % 251) as u8).collect();
        let target: Vec<u8> = (0..50_000usize).map(|i| ((i * i + 13) % 241) as u8).collect();
        assert!(matches!(
            manager.plan(&source, &target).unwrap(),
            DeltaOutcome::Full { reason: "delta exceeded savings threshold" }
        ));
    }
}
