//! Size-class buffer pools tuned to registry workloads.
//!
//! Blob sizes are bimodal: manifests and configs are a few KiB, layers run to
//! hundreds of MiB. Pooling per size class removes most steady-state
//! allocations. Returned buffers are zeroed over their full capacity so no
//! consumer ever observes another transfer's bytes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;

/// Pool size classes in bytes, smallest first.
pub const SIZE_CLASSES: [usize; 11] = [
    1024,
    4 * 1024,
    16 * 1024,
    64 * 1024,
    256 * 1024,
    1024 * 1024,
    4 * 1024 * 1024,
    16 * 1024 * 1024,
    50 * 1024 * 1024,
    100 * 1024 * 1024,
    200 * 1024 * 1024,
];

/// How many idle buffers each class retains. Large classes keep almost none:
/// a handful of 200 MiB buffers would pin more memory than the rest of the
/// process combined.
fn retention_cap(class_size: usize) -> usize {
    if class_size <= 64 * 1024 {
        32
    } else if class_size <= 1024 * 1024 {
        8
    } else {
        2
    }
}

/// Pool counters for monitoring and sizing
#[derive(Debug, Default)]
pub struct PoolCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    returned: AtomicU64,
    dropped: AtomicU64,
}

impl PoolCounters {
    /// (hits, misses, returned, dropped)
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.returned.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
        )
    }
}

/// Thread-safe pool of reusable byte buffers grouped by size class.
pub struct BufferPool {
    classes: Vec<Mutex<Vec<Vec<u8>>>>,
    counters: PoolCounters,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            classes: SIZE_CLASSES.iter().map(|_| Mutex::new(Vec::new())).collect(),
            counters: PoolCounters::default(),
        }
    }

    /// Smallest class index that fits `n`, or None when `n` exceeds the largest class.
    fn class_for(n: usize) -> Option<usize> {
        SIZE_CLASSES.iter().position(|&size| size >= n)
    }

    /// Get a buffer of length >= n. Requests beyond the largest class get an
    /// exact power-of-two allocation that bypasses pooling entirely.
    pub fn get(self: &Arc<Self>, n: usize) -> PooledBuffer {
        match Self::class_for(n) {
            Some(class) => {
                let reused = self.classes[class].lock().unwrap().pop();
                let data = match reused {
                    Some(buf) => {
                        self.counters.hits.fetch_add(1, Ordering::Relaxed);
                        buf
                    }
                    None => {
                        self.counters.misses.fetch_add(1, Ordering::Relaxed);
                        vec![0u8; SIZE_CLASSES[class]]
                    }
                };
                PooledBuffer {
                    data: Some(data),
                    class: Some(class),
                    pool: Arc::clone(self),
                }
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                let size = n.next_power_of_two();
                PooledBuffer {
                    data: Some(vec![0u8; size]),
                    class: None,
                    pool: Arc::clone(self),
                }
            }
        }
    }

    /// Zero the buffer and return it to its class. Buffers over the class
    /// retention cap, and unpooled oversize buffers, are dropped for the allocator.
    fn put(&self, mut data: Vec<u8>, class: Option<usize>) {
        data.fill(0);
        match class {
            Some(class) if class < self.classes.len() => {
                let mut idle = self.classes[class].lock().unwrap();
                if idle.len() < retention_cap(SIZE_CLASSES[class]) {
                    idle.push(data);
                    self.counters.returned.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            _ => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn counters(&self) -> &PoolCounters {
        &self.counters
    }

    /// Idle buffer count for one class (for tests and diagnostics).
    pub fn idle_in_class(&self, class: usize) -> usize {
        self.classes[class].lock().unwrap().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusively-owned buffer leased from a [`BufferPool`].
///
/// Ownership transfers back to the pool exactly once, either through
/// [`release`](Self::release) or on drop; the inner `Option` is the one-shot
/// latch, so a double release cannot exist.
pub struct PooledBuffer {
    data: Option<Vec<u8>>,
    class: Option<usize>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    pub fn len(&self) -> usize {
        self.data.as_ref().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }

    /// Explicitly return the buffer to the pool.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.put(data, self.class);
        }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.release_inner();
    }
}

lazy_static! {
    static ref GLOBAL_POOL: Arc<BufferPool> = Arc::new(BufferPool::new());
}

/// Process-wide shared pool. All transfer pipelines draw from it by default.
pub fn global_pool() -> Arc<BufferPool> {
    Arc::clone(&GLOBAL_POOL)
}
