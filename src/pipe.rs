//! Bounded in-memory byte pipe.
//!
//! The transfer manager compresses on a producer thread while the consumer
//! streams compressed bytes to the destination as they are produced. The pipe
//! is the seam between the two: a fixed-capacity ring guarded by a mutex,
//! with condvar wakeups on both sides.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};

/// Default in-flight capacity between producer and consumer.
pub const DEFAULT_PIPE_CAPACITY: usize = 256 * 1024;

struct PipeState {
    buffer: VecDeque<u8>,
    capacity: usize,
    writer_closed: bool,
    reader_closed: bool,
    failure: Option<String>,
}

struct PipeShared {
    state: Mutex<PipeState>,
    condvar: Condvar,
}

/// Create a connected (writer, reader) pair with the given capacity.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let shared = Arc::new(PipeShared {
        state: Mutex::new(PipeState {
            buffer: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            writer_closed: false,
            reader_closed: false,
            failure: None,
        }),
        condvar: Condvar::new(),
    });
    (
        PipeWriter { shared: Arc::clone(&shared) },
        PipeReader { shared },
    )
}

/// Write half. Dropping it closes the pipe; the reader then drains what is
/// buffered and sees EOF.
pub struct PipeWriter {
    shared: Arc<PipeShared>,
}

impl PipeWriter {
    /// Mark the stream as failed. The reader's next read returns an error
    /// carrying `message` instead of a silent short stream.
    pub fn fail(&self, message: &str) {
        let mut state = self.shared.state.lock().unwrap();
        state.failure = Some(message.to_string());
        state.writer_closed = true;
        self.shared.condvar.notify_all();
    }
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if state.reader_closed {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "pipe reader closed",
                ));
            }
            let free = state.capacity - state.buffer.len();
            if free > 0 {
                let n = free.min(data.len());
                state.buffer.extend(&data[..n]);
                self.shared.condvar.notify_all();
                return Ok(n);
            }
            state = self.shared.condvar.wait(state).unwrap();
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        state.writer_closed = true;
        self.shared.condvar.notify_all();
    }
}

/// Read half. EOF once the writer is closed and the buffer is drained.
pub struct PipeReader {
    shared: Arc<PipeShared>,
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if !state.buffer.is_empty() {
                let n = out.len().min(state.buffer.len());
                for slot in out.iter_mut().take(n) {
                    *slot = state.buffer.pop_front().unwrap();
                }
                self.shared.condvar.notify_all();
                return Ok(n);
            }
            if state.writer_closed {
                if let Some(message) = state.failure.take() {
                    return Err(io::Error::new(io::ErrorKind::Other, message));
                }
                return Ok(0);
            }
            state = self.shared.condvar.wait(state).unwrap();
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        state.reader_closed = true;
        self.shared.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_bytes_cross_the_pipe_in_order() {
        let (mut writer, mut reader) = pipe(64);
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
        let expected = data.clone();
        let producer = thread::spawn(move || {
            writer.write_all(&data).unwrap();
        });
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        producer.join().unwrap();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_reader_sees_eof_after_writer_drop() {
        let (writer, mut reader) = pipe(16);
        drop(writer);
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_writer_errors_when_reader_gone() {
        let (mut writer, reader) = pipe(4);
        drop(reader);
        // First write may fit nothing: reader closed is checked before space.
        let err = writer.write(b"abcdef").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_failure_propagates_to_reader() {
        let (writer, mut reader) = pipe(16);
        writer.fail("gzip worker died");
        drop(writer);
        let mut buf = [0u8; 8];
        let err = reader.read(&mut buf).unwrap_err();
        assert!(err.to_string().contains("gzip worker died"));
    }

    #[test]
    fn test_bounded_capacity_blocks_producer() {
        let (mut writer, mut reader) = pipe(8);
        // Fill beyond capacity from another thread; it must block until drained.
        let producer = thread::spawn(move || {
            writer.write_all(&[1u8; 64]).unwrap();
            64u64
        });
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(producer.join().unwrap(), 64);
        assert_eq!(out.len(), 64);
    }
}
