//! Buffered reader/writer adapters backed by pooled 64 KiB buffers.
//! Other components wrap raw network or pipe endpoints in these so every
//! transfer boundary reads and writes in pool-sized strides.

use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::error_handling::{utils as errors, TransferError};

/// Stride used by the streaming adapters and network copy loops.
pub const NETWORK_BUFFER_SIZE: usize = 64 * 1024;

/// Buffered reader over a pooled buffer. `release` hands the buffer back at
/// most once; reads after release fall through to the inner reader unbuffered.
pub struct PooledBufReader<R: Read> {
    inner: R,
    buffer: Option<PooledBuffer>,
    pos: usize,
    filled: usize,
}

impl<R: Read> PooledBufReader<R> {
    pub fn new(pool: &Arc<BufferPool>, inner: R) -> Self {
        Self {
            inner,
            buffer: Some(pool.get(NETWORK_BUFFER_SIZE)),
            pos: 0,
            filled: 0,
        }
    }

    /// Return the buffer to its pool. Idempotent.
    pub fn release(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            buffer.release();
        }
        self.pos = 0;
        self.filled = 0;
    }

    /// Unwrap the inner reader, releasing the buffer first. Buffered but
    /// unconsumed bytes are discarded, so callers do this only at EOF.
    pub fn into_inner(mut self) -> R {
        self.release();
        // SAFETY: `self` is forgotten immediately after, so `inner` is read
        // exactly once and its `Drop` (if any) never runs twice.
        let inner = unsafe { std::ptr::read(&self.inner) };
        std::mem::forget(self);
        inner
    }
}

impl<R: Read> Read for PooledBufReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let buffer = match self.buffer.as_mut() {
            Some(buffer) => buffer,
            None => return self.inner.read(out),
        };
        if self.pos == self.filled {
            // Large reads bypass the buffer entirely.
            if out.len() >= buffer.len() {
                return self.inner.read(out);
            }
            self.filled = self.inner.read(buffer.as_mut_slice())?;
            self.pos = 0;
            if self.filled == 0 {
                return Ok(0);
            }
        }
        let n = (self.filled - self.pos).min(out.len());
        out[..n].copy_from_slice(&buffer.as_slice()[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl<R: Read> Drop for PooledBufReader<R> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Buffered writer over a pooled buffer. `release` flushes then hands the
/// buffer back at most once; writes after release go straight through.
pub struct PooledBufWriter<W: Write> {
    inner: Option<W>,
    buffer: Option<PooledBuffer>,
    used: usize,
}

impl<W: Write> PooledBufWriter<W> {
    pub fn new(pool: &Arc<BufferPool>, inner: W) -> Self {
        Self {
            inner: Some(inner),
            buffer: Some(pool.get(NETWORK_BUFFER_SIZE)),
            used: 0,
        }
    }

    fn flush_buffer(&mut self) -> io::Result<()> {
        if self.used > 0 {
            if let (Some(inner), Some(buffer)) = (self.inner.as_mut(), self.buffer.as_ref()) {
                inner.write_all(&buffer.as_slice()[..self.used])?;
                self.used = 0;
            }
        }
        Ok(())
    }

    /// Flush buffered bytes and return the buffer to its pool. Idempotent;
    /// the first call does the work, later calls are no-ops.
    pub fn release(&mut self) -> Result<(), TransferError> {
        self.flush_buffer()
            .map_err(|e| errors::io_error("release_writer", None, e))?;
        if let Some(buffer) = self.buffer.take() {
            buffer.release();
        }
        Ok(())
    }

    /// Flush, release the buffer and unwrap the inner writer.
    pub fn into_inner(mut self) -> Result<W, TransferError> {
        self.release()?;
        self.inner
            .take()
            .ok_or_else(|| errors::resource_error("into_inner", "writer already taken"))
    }
}

impl<W: Write> Write for PooledBufWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let capacity = match self.buffer.as_ref() {
            Some(buffer) => buffer.len(),
            None => {
                return match self.inner.as_mut() {
                    Some(inner) => inner.write(data),
                    None => Ok(0),
                }
            }
        };
        if self.used + data.len() > capacity {
            self.flush_buffer()?;
        }
        // Oversized writes skip the buffer once it is drained.
        if data.len() >= capacity {
            return match self.inner.as_mut() {
                Some(inner) => inner.write(data),
                None => Ok(0),
            };
        }
        let buffer = self.buffer.as_mut().unwrap();
        buffer.as_mut_slice()[self.used..self.used + data.len()].copy_from_slice(data);
        self.used += data.len();
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer()?;
        match self.inner.as_mut() {
            Some(inner) => inner.flush(),
            None => Ok(()),
        }
    }
}

impl<W: Write> Drop for PooledBufWriter<W> {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Copy everything from `reader` to `writer` through a pooled buffer,
/// checking the cancellation token on every read. Returns bytes copied.
pub fn copy_cancellable<R: Read, W: Write>(
    ctx: &crate::cancel::CancellationToken,
    operation: &str,
    pool: &Arc<BufferPool>,
    reader: &mut R,
    writer: &mut W,
) -> Result<u64, TransferError> {
    let mut buffer = pool.get(NETWORK_BUFFER_SIZE);
    let mut total = 0u64;
    loop {
        ctx.check(operation)?;
        let n = reader
            .read(buffer.as_mut_slice())
            .map_err(|e| errors::io_error(operation, Some("read"), e))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buffer.as_slice()[..n])
            .map_err(|e| errors::io_error(operation, Some("write"), e))?;
        total += n as u64;
    }
    writer
        .flush()
        .map_err(|e| errors::io_error(operation, Some("flush"), e))?;
    buffer.release();
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use std::io::Cursor;

    #[test]
    fn test_reader_round_trip() {
        let pool = Arc::new(BufferPool::new());
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut reader = PooledBufReader::new(&pool, Cursor::new(data.clone()));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_reader_release_is_idempotent() {
        let pool = Arc::new(BufferPool::new());
        let mut reader = PooledBufReader::new(&pool, Cursor::new(vec![1u8; 100]));
        let mut buf = [0u8; 10];
        reader.read(&mut buf).unwrap();
        reader.release();
        reader.release();
        // Reads still work unbuffered after release.
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(n, 10);
    }

    #[test]
    fn test_writer_flushes_on_release() {
        let pool = Arc::new(BufferPool::new());
        let mut writer = PooledBufWriter::new(&pool, Vec::new());
        writer.write_all(b"buffered bytes").unwrap();
        let sink = writer.into_inner().unwrap();
        assert_eq!(sink, b"buffered bytes");
    }

    #[test]
    fn test_writer_large_write_passthrough() {
        let pool = Arc::new(BufferPool::new());
        let data = vec![9u8; NETWORK_BUFFER_SIZE * 2];
        let mut writer = PooledBufWriter::new(&pool, Vec::new());
        writer.write_all(b"small").unwrap();
        writer.write_all(&data).unwrap();
        let sink = writer.into_inner().unwrap();
        assert_eq!(sink.len(), 5 + data.len());
        assert_eq!(&sink[..5], b"small");
    }

    #[test]
    fn test_copy_cancellable_moves_all_bytes() {
        let pool = Arc::new(BufferPool::new());
        let ctx = CancellationToken::new();
        let data = vec![42u8; 300_000];
        let mut src = Cursor::new(data.clone());
        let mut dst = Vec::new();
        let copied = copy_cancellable(&ctx, "test_copy", &pool, &mut src, &mut dst).unwrap();
        assert_eq!(copied, data.len() as u64);
        assert_eq!(dst, data);
    }

    #[test]
    fn test_copy_cancellable_aborts_when_cancelled() {
        let pool = Arc::new(BufferPool::new());
        let ctx = CancellationToken::new();
        ctx.cancel();
        let mut src = Cursor::new(vec![1u8; 1000]);
        let mut dst = Vec::new();
        let err = copy_cancellable(&ctx, "test_copy", &pool, &mut src, &mut dst).unwrap_err();
        assert!(err.is_cancellation());
        assert!(dst.is_empty());
    }
}
