//! Chunk-parallel gzip.
//!
//! The input splits into fixed chunks, each compressed as an independent gzip
//! member on the worker pool, and the members concatenate in input order.
//! Multi-member streams are valid gzip, so any decoder that handles members
//! (see `compression::DecompressingReader`) reads the result as one stream.

use libdeflater::{CompressionLvl, Compressor};
use rayon::prelude::*;

use crate::error_handling::{utils as errors, TransferError};
use crate::utils::env_usize;

pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;
pub const MIN_CHUNK_SIZE: usize = 64 * 1024;
pub const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Configuration for the parallel compressor
#[derive(Clone, Copy, Debug)]
pub struct ParallelGzipConfig {
    /// Chunk size in bytes, clamped to [64 KiB, 4 MiB]
    pub chunk_size: usize,
    /// Worker count, defaults to the host CPU count
    pub workers: usize,
    /// gzip level, 1..=12 in libdeflate terms
    pub level: u32,
}

impl Default for ParallelGzipConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            workers: num_cpus::get().max(1),
            level: 6,
        }
    }
}

impl ParallelGzipConfig {
    /// Defaults with GANTRY_GZIP_CHUNK_SIZE / GANTRY_GZIP_WORKERS overrides.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            chunk_size: env_usize("GANTRY_GZIP_CHUNK_SIZE", defaults.chunk_size),
            workers: env_usize("GANTRY_GZIP_WORKERS", defaults.workers).max(1),
            level: defaults.level,
        }
    }

    fn effective_chunk_size(&self) -> usize {
        self.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
    }
}

/// Order-preserving chunk-parallel gzip compressor with a dedicated worker pool.
pub struct ParallelGzipCompressor {
    config: ParallelGzipConfig,
    pool: rayon::ThreadPool,
}

impl ParallelGzipCompressor {
    pub fn new(config: ParallelGzipConfig) -> Result<Self, TransferError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers.max(1))
            .build()
            .map_err(|e| errors::resource_error("build_gzip_pool", &e.to_string()))?;
        Ok(Self { config, pool })
    }

    pub fn with_defaults() -> Result<Self, TransferError> {
        Self::new(ParallelGzipConfig::default())
    }

    /// Compress `data` as concatenated gzip members, one per chunk, in input
    /// order. Inputs shorter than two chunks are compressed single-threaded.
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, TransferError> {
        let chunk_size = self.config.effective_chunk_size();
        let level = compression_level(self.config.level)?;

        if data.len() < 2 * chunk_size {
            return compress_gzip_member(data, level);
        }

        let members: Result<Vec<Vec<u8>>, TransferError> = self.pool.install(|| {
            data.par_chunks(chunk_size)
                .map(|chunk| compress_gzip_member(chunk, level))
                .collect()
        });
        let members = members?;

        let total: usize = members.iter().map(|m| m.len()).sum();
        let mut out = Vec::with_capacity(total);
        for member in members {
            out.extend_from_slice(&member);
        }
        Ok(out)
    }
}

fn compression_level(level: u32) -> Result<CompressionLvl, TransferError> {
    CompressionLvl::new(level as i32).map_err(|e| {
        errors::invalid_input(
            "parallel_gzip_level",
            &format!("bad gzip level {}: {:?}", level, e),
        )
    })
}

fn compress_gzip_member(chunk: &[u8], level: CompressionLvl) -> Result<Vec<u8>, TransferError> {
    let mut compressor = Compressor::new(level);
    let bound = compressor.gzip_compress_bound(chunk.len());
    let mut out = vec![0u8; bound];
    let written = compressor
        .gzip_compress(chunk, &mut out)
        .map_err(|e| errors::resource_error("gzip_compress_chunk", &format!("{:?}", e)))?;
    out.truncate(written);
    Ok(out)
}
