//! Core library for gantry: moves blobs and images between OCI/Docker V2
//! registries with bandwidth minimization, bounded concurrency, and failure
//! tolerance. Used by replication tooling; carries no CLI of its own.

pub mod blob_mount;
pub mod buffer_pool;
pub mod buffered_io;
pub mod cancel;
pub mod compression;
pub mod connection_pool;
pub mod delta_codec;  // Framed delta wire formats
pub mod delta_manager;  // Delta policy (thresholds, format selection)
pub mod delta_sync;  // Rolling-hash rsync engine
pub mod digest;
pub mod error_handling;
pub mod multiplexer;
pub mod parallel_compress;  // Chunk-parallel gzip
pub mod pipe;
pub mod registry_client;  // Generic OCI V2 registry-backed Repository
pub mod repository;
pub mod task_group;  // Condvar semaphore + bounded batch runner
pub mod transfer;
pub mod utils;

#[cfg(test)]
mod test_support;


// Re-export main API for consumers
pub use blob_mount::{BlobMounter, MountConfig, MountOutcome, MountRequest};
pub use buffer_pool::{global_pool, BufferPool, PooledBuffer};
pub use cancel::CancellationToken;
pub use compression::{CompressionOptions, CompressionType};
pub use connection_pool::{ConnectionPool, PoolConfig};
pub use delta_codec::{apply_delta, create_delta, DeltaFormat, DeltaHeader};
pub use delta_manager::{DeltaConfig, DeltaManager, DeltaOutcome};
pub use delta_sync::{SyncConfig, WeakHashKind};
pub use digest::{digest_bytes, validate_digest};
pub use error_handling::TransferError;
pub use multiplexer::{LayerDescriptor, MultiplexerConfig, StreamMultiplexer};
pub use parallel_compress::{ParallelGzipCompressor, ParallelGzipConfig};
pub use registry_client::RegistryRepository;
pub use repository::{DeltaReceiver, Manifest, MemoryRepository, Repository};
pub use transfer::{RetryConfig, TransferConfig, TransferManager};
