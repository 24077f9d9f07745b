//! Content digests in canonical `sha256:<hex>` form.

use std::io::{Read, Write};

use sha2::{Digest, Sha256};

use crate::error_handling::{utils as errors, TransferError};

pub const DIGEST_PREFIX: &str = "sha256:";
const HEX_LEN: usize = 64;

/// Compute the canonical digest of a byte slice.
pub fn digest_bytes(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{}{:x}", DIGEST_PREFIX, hash)
}

/// Compute the canonical digest of everything a reader yields.
/// Returns (digest, byte count).
pub fn digest_reader<R: Read>(reader: &mut R) -> Result<(String, u64), TransferError> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| errors::io_error("digest_reader", None, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((format!("{}{:x}", DIGEST_PREFIX, hasher.finalize()), total))
}

/// Syntactic check: `sha256:` prefix plus 64 lowercase hex characters.
pub fn is_valid_digest(digest: &str) -> bool {
    match digest.strip_prefix(DIGEST_PREFIX) {
        Some(hex) => {
            hex.len() == HEX_LEN
                && hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        }
        None => false,
    }
}

/// Verify content against an expected digest. Returns a plain bool; callers
/// that need an error use [`verify_digest`].
pub fn validate_digest(data: &[u8], expected: &str) -> bool {
    digest_bytes(data) == expected
}

/// Verify content against an expected digest, surfacing an integrity error
/// with both values on mismatch and an invalid-input error on a malformed digest.
pub fn verify_digest(operation: &str, data: &[u8], expected: &str) -> Result<(), TransferError> {
    if !is_valid_digest(expected) {
        return Err(errors::invalid_input(
            operation,
            &format!("malformed digest: {}", expected),
        ));
    }
    let actual = digest_bytes(data);
    if actual != expected {
        return Err(errors::integrity_error(operation, expected, &actual));
    }
    Ok(())
}

/// Writer wrapper that hashes everything passing through it, so pipelines can
/// verify content while streaming instead of buffering whole blobs.
pub struct DigestingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    bytes_written: u64,
}

impl<W: Write> DigestingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes_written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Finish hashing and return (inner writer, canonical digest).
    pub fn finalize(self) -> (W, String) {
        let digest = format!("{}{:x}", DIGEST_PREFIX, self.hasher.finalize());
        (self.inner, digest)
    }
}

impl<W: Write> Write for DigestingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes_written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
