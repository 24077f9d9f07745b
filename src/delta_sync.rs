//! Rolling-hash delta synchronization.
//!
//! Two passes: a signature pass over the destination's current bytes (weak +
//! strong hash per block), then a match pass sliding a window over the new
//! content. Matches become `COPY(offset, size)` records against the old bytes;
//! everything else accumulates into `DATA` literals. Applying the op stream to
//! the old bytes reproduces the new content exactly.
//!
//! Op stream layout (little-endian): tag `1` = COPY `{offset u64, size u32}`,
//! tag `2` = DATA `{size u32, bytes}`.

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom, Write};

use sha2::{Digest, Sha256};

use crate::error_handling::{utils as errors, TransferError};

pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;
/// Literal runs flush as DATA records at this size to bound memory.
const MAX_LITERAL_RUN: usize = 1024 * 1024;

const OP_COPY: u8 = 1;
const OP_DATA: u8 = 2;

/// Weak hash selection for the signature and match passes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WeakHashKind {
    /// XXH64 over the window, recomputed per position
    Xxh64,
    /// Adler-style rolling checksum, updated in O(1) per shift
    Adler32,
}

/// Configuration for the sync engine
#[derive(Clone, Copy, Debug)]
pub struct SyncConfig {
    /// Block size for signatures and the match window. A window can only
    /// match a block of the same length, so one knob drives both passes.
    pub block_size: usize,
    pub weak_hash: WeakHashKind,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            weak_hash: WeakHashKind::Xxh64,
        }
    }
}

/// Signature of one source block.
#[derive(Clone, Debug)]
pub struct ChunkSignature {
    pub offset: u64,
    pub size: usize,
    pub weak: u64,
    pub strong: [u8; 32],
}

/// All source block signatures, indexed by weak hash.
pub struct SignatureIndex {
    signatures: Vec<ChunkSignature>,
    by_weak: HashMap<u64, Vec<usize>>,
    total_bytes: u64,
}

impl SignatureIndex {
    /// Signature pass: read non-overlapping blocks and hash each one.
    pub fn from_reader<R: Read>(source: &mut R, config: &SyncConfig) -> Result<Self, TransferError> {
        if config.block_size == 0 {
            return Err(errors::invalid_input("compute_signatures", "non-positive block size"));
        }
        let mut signatures = Vec::new();
        let mut by_weak: HashMap<u64, Vec<usize>> = HashMap::new();
        let mut block = vec![0u8; config.block_size];
        let mut offset = 0u64;
        loop {
            let filled = read_up_to(source, &mut block)
                .map_err(|e| errors::io_error("compute_signatures", None, e))?;
            if filled == 0 {
                break;
            }
            let bytes = &block[..filled];
            let signature = ChunkSignature {
                offset,
                size: filled,
                weak: weak_hash(config.weak_hash, bytes),
                strong: strong_hash(bytes),
            };
            by_weak.entry(signature.weak).or_default().push(signatures.len());
            signatures.push(signature);
            offset += filled as u64;
        }
        Ok(Self {
            signatures,
            by_weak,
            total_bytes: offset,
        })
    }

    pub fn block_count(&self) -> usize {
        self.signatures.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Weak-hash bucket hit, confirmed by size and strong hash.
    fn lookup(&self, weak: u64, window: &[u8]) -> Option<&ChunkSignature> {
        let candidates = self.by_weak.get(&weak)?;
        let strong = strong_hash(window);
        candidates
            .iter()
            .map(|&index| &self.signatures[index])
            .find(|sig| sig.size == window.len() && sig.strong == strong)
    }
}

/// One reconstruction instruction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeltaOp {
    Copy { offset: u64, size: u32 },
    Data(Vec<u8>),
}

/// Outcome counters from a generate pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncSummary {
    pub matched_bytes: u64,
    pub literal_bytes: u64,
    pub copy_ops: u64,
    pub data_ops: u64,
}

impl SyncSummary {
    /// Percentage of target bytes served from the existing source.
    pub fn savings_percent(&self) -> f64 {
        let total = self.matched_bytes + self.literal_bytes;
        if total == 0 {
            return 0.0;
        }
        self.matched_bytes as f64 / total as f64 * 100.0
    }
}

/// Generate the op stream turning `source` content into `target` content,
/// writing records to `out`.
pub fn generate_delta<S: Read, T: Read, W: Write>(
    source: &mut S,
    target: &mut T,
    out: &mut W,
    config: &SyncConfig,
) -> Result<SyncSummary, TransferError> {
    let index = SignatureIndex::from_reader(source, config)?;
    generate_against_index(&index, target, out, config)
}

/// Match pass against precomputed signatures. Useful when the same source
/// serves several targets.
pub fn generate_against_index<T: Read, W: Write>(
    index: &SignatureIndex,
    target: &mut T,
    out: &mut W,
    config: &SyncConfig,
) -> Result<SyncSummary, TransferError> {
    let block = config.block_size;
    if block == 0 {
        return Err(errors::invalid_input("generate_delta", "non-positive block size"));
    }

    let mut window = WindowBuffer::new(target, block * 2 + 1);
    let mut literal: Vec<u8> = Vec::new();
    let mut summary = SyncSummary::default();
    // Rolling state is only valid while the window stays at full block size.
    let mut rolling: Option<RollingAdler32> = None;

    loop {
        // One byte of lookahead keeps the rolling update possible.
        window
            .fill(block + 1)
            .map_err(|e| errors::io_error("generate_delta", Some("read target"), e))?;
        let avail = window.len();
        if avail == 0 {
            break;
        }
        let wlen = avail.min(block);
        let bytes = window.window(wlen);

        let weak = match config.weak_hash {
            WeakHashKind::Xxh64 => xxh64(bytes, 0),
            WeakHashKind::Adler32 => {
                if wlen < block {
                    rolling = None;
                }
                if let Some(state) = &rolling {
                    state.digest()
                } else {
                    let state = RollingAdler32::from_bytes(bytes);
                    let digest = state.digest();
                    if wlen == block {
                        rolling = Some(state);
                    }
                    digest
                }
            }
        };

        if let Some(signature) = index.lookup(weak, bytes) {
            flush_literal(&mut literal, out, &mut summary)?;
            write_copy(out, signature.offset, signature.size as u32)?;
            summary.copy_ops += 1;
            summary.matched_bytes += signature.size as u64;
            window.advance(wlen);
            rolling = None;
        } else {
            let outgoing = bytes[0];
            // Roll before the shift while the incoming byte is still in view.
            if config.weak_hash == WeakHashKind::Adler32 && avail > block {
                if let Some(state) = rolling.as_mut() {
                    state.roll(outgoing, window.byte_at(block));
                }
            } else {
                rolling = None;
            }
            literal.push(outgoing);
            summary.literal_bytes += 1;
            window.advance(1);
            if literal.len() >= MAX_LITERAL_RUN {
                flush_literal(&mut literal, out, &mut summary)?;
            }
        }
    }

    flush_literal(&mut literal, out, &mut summary)?;
    out.flush()
        .map_err(|e| errors::io_error("generate_delta", Some("flush"), e))?;
    Ok(summary)
}

/// Estimate the transferable savings without emitting any records.
pub fn estimate_savings<S: Read, T: Read>(
    source: &mut S,
    target: &mut T,
    config: &SyncConfig,
) -> Result<f64, TransferError> {
    let summary = generate_delta(source, target, &mut io::sink(), config)?;
    Ok(summary.savings_percent())
}

/// Apply an op stream to a seekable source, writing the reconstruction to
/// `out`. Returns bytes written.
pub fn apply_delta<D: Read, S: Read + Seek, W: Write>(
    delta: &mut D,
    source: &mut S,
    out: &mut W,
) -> Result<u64, TransferError> {
    let mut total = 0u64;
    let mut copy_buf = vec![0u8; 64 * 1024];
    while let Some(op) = read_op(delta)? {
        match op {
            DeltaOp::Copy { offset, size } => {
                source
                    .seek(SeekFrom::Start(offset))
                    .map_err(|e| errors::io_error("apply_delta", Some("seek source"), e))?;
                let mut remaining = size as usize;
                while remaining > 0 {
                    let want = remaining.min(copy_buf.len());
                    source
                        .read_exact(&mut copy_buf[..want])
                        .map_err(|e| errors::io_error("apply_delta", Some("read source"), e))?;
                    out.write_all(&copy_buf[..want])
                        .map_err(|e| errors::io_error("apply_delta", Some("write"), e))?;
                    remaining -= want;
                }
                total += size as u64;
            }
            DeltaOp::Data(bytes) => {
                out.write_all(&bytes)
                    .map_err(|e| errors::io_error("apply_delta", Some("write"), e))?;
                total += bytes.len() as u64;
            }
        }
    }
    out.flush()
        .map_err(|e| errors::io_error("apply_delta", Some("flush"), e))?;
    Ok(total)
}

/// Apply while hashing the output, failing on a digest mismatch.
pub fn apply_delta_verified<D: Read, S: Read + Seek, W: Write>(
    delta: &mut D,
    source: &mut S,
    out: &mut W,
    expected_digest: &str,
) -> Result<u64, TransferError> {
    let mut digesting = crate::digest::DigestingWriter::new(out);
    let total = apply_delta(delta, source, &mut digesting)?;
    let (_, actual) = digesting.finalize();
    if actual != expected_digest {
        return Err(errors::integrity_error("apply_delta", expected_digest, &actual));
    }
    Ok(total)
}

fn flush_literal<W: Write>(
    literal: &mut Vec<u8>,
    out: &mut W,
    summary: &mut SyncSummary,
) -> Result<(), TransferError> {
    if literal.is_empty() {
        return Ok(());
    }
    write_data(out, literal)?;
    summary.data_ops += 1;
    literal.clear();
    Ok(())
}

fn write_copy<W: Write>(out: &mut W, offset: u64, size: u32) -> Result<(), TransferError> {
    let mut record = [0u8; 13];
    record[0] = OP_COPY;
    record[1..9].copy_from_slice(&offset.to_le_bytes());
    record[9..13].copy_from_slice(&size.to_le_bytes());
    out.write_all(&record)
        .map_err(|e| errors::io_error("write_delta_op", Some("copy"), e))
}

fn write_data<W: Write>(out: &mut W, bytes: &[u8]) -> Result<(), TransferError> {
    let mut header = [0u8; 5];
    header[0] = OP_DATA;
    header[1..5].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.write_all(&header)
        .and_then(|_| out.write_all(bytes))
        .map_err(|e| errors::io_error("write_delta_op", Some("data"), e))
}

/// Read the next record, or None at a clean end of stream. A stream ending
/// mid-record is an invalid-input error.
pub fn read_op<R: Read>(reader: &mut R) -> Result<Option<DeltaOp>, TransferError> {
    let mut tag = [0u8; 1];
    let n = reader
        .read(&mut tag)
        .map_err(|e| errors::io_error("read_delta_op", None, e))?;
    if n == 0 {
        return Ok(None);
    }
    match tag[0] {
        OP_COPY => {
            let mut fields = [0u8; 12];
            reader
                .read_exact(&mut fields)
                .map_err(|_| errors::invalid_input("read_delta_op", "truncated copy record"))?;
            let offset = u64::from_le_bytes(fields[..8].try_into().unwrap());
            let size = u32::from_le_bytes(fields[8..].try_into().unwrap());
            Ok(Some(DeltaOp::Copy { offset, size }))
        }
        OP_DATA => {
            let mut size_field = [0u8; 4];
            reader
                .read_exact(&mut size_field)
                .map_err(|_| errors::invalid_input("read_delta_op", "truncated data record"))?;
            let size = u32::from_le_bytes(size_field) as usize;
            let mut bytes = vec![0u8; size];
            reader
                .read_exact(&mut bytes)
                .map_err(|_| errors::invalid_input("read_delta_op", "truncated data payload"))?;
            Ok(Some(DeltaOp::Data(bytes)))
        }
        other => Err(errors::invalid_input(
            "read_delta_op",
            &format!("unknown op tag {}", other),
        )),
    }
}

fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn strong_hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn weak_hash(kind: WeakHashKind, data: &[u8]) -> u64 {
    match kind {
        WeakHashKind::Xxh64 => xxh64(data, 0),
        WeakHashKind::Adler32 => RollingAdler32::from_bytes(data).digest(),
    }
}

/// Sliding window over a reader: compacting refill, O(1) advance.
struct WindowBuffer<'a, R: Read> {
    inner: &'a mut R,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    eof: bool,
}

impl<'a, R: Read> WindowBuffer<'a, R> {
    fn new(inner: &'a mut R, capacity: usize) -> Self {
        Self {
            inner,
            buf: vec![0u8; capacity],
            start: 0,
            end: 0,
            eof: false,
        }
    }

    fn fill(&mut self, want: usize) -> io::Result<()> {
        while self.end - self.start < want && !self.eof {
            if self.end == self.buf.len() {
                self.buf.copy_within(self.start..self.end, 0);
                self.end -= self.start;
                self.start = 0;
            }
            let n = self.inner.read(&mut self.buf[self.end..])?;
            if n == 0 {
                self.eof = true;
            } else {
                self.end += n;
            }
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.end - self.start
    }

    fn window(&self, wlen: usize) -> &[u8] {
        &self.buf[self.start..self.start + wlen]
    }

    fn byte_at(&self, offset: usize) -> u8 {
        self.buf[self.start + offset]
    }

    fn advance(&mut self, n: usize) {
        self.start += n;
    }
}

/// Rolling checksum in the rsync style: `s1` sums bytes, `s2` sums prefix
/// sums, both truncated to 16 bits in the digest.
#[derive(Clone, Debug)]
pub struct RollingAdler32 {
    s1: u32,
    s2: u32,
    len: usize,
}

impl RollingAdler32 {
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut s1 = 0u32;
        let mut s2 = 0u32;
        for &byte in data {
            s1 = s1.wrapping_add(byte as u32);
            s2 = s2.wrapping_add(s1);
        }
        Self { s1, s2, len: data.len() }
    }

    /// Slide the window one byte: drop `outgoing`, append `incoming`.
    pub fn roll(&mut self, outgoing: u8, incoming: u8) {
        self.s1 = self.s1.wrapping_sub(outgoing as u32).wrapping_add(incoming as u32);
        self.s2 = self
            .s2
            .wrapping_sub((self.len as u32).wrapping_mul(outgoing as u32))
            .wrapping_add(self.s1);
    }

    pub fn digest(&self) -> u64 {
        ((self.s1 & 0xffff) as u64) | (((self.s2 & 0xffff) as u64) << 16)
    }
}

/// XXH64, the default weak hash. Implemented in-crate; the delta stream only
/// needs both passes to agree on the function.
pub fn xxh64(data: &[u8], seed: u64) -> u64 {
    const P1: u64 = 0x9E37_79B1_85EB_CA87;
    const P2: u64 = 0xC2B2_AE3D_27D4_EB4F;
    const P3: u64 = 0x1656_67B1_9E37_79F9;
    const P4: u64 = 0x85EB_CA77_C2B2_AE63;
    const P5: u64 = 0x27D4_EB2F_1656_67C5;

    #[inline]
    fn round(acc: u64, input: u64) -> u64 {
        acc.wrapping_add(input.wrapping_mul(P2))
            .rotate_left(31)
            .wrapping_mul(P1)
    }

    #[inline]
    fn merge_round(acc: u64, val: u64) -> u64 {
        (acc ^ round(0, val)).wrapping_mul(P1).wrapping_add(P4)
    }

    #[inline]
    fn read_u64(data: &[u8], at: usize) -> u64 {
        u64::from_le_bytes(data[at..at + 8].try_into().unwrap())
    }

    let len = data.len() as u64;
    let mut rest = data;
    let mut hash;

    if rest.len() >= 32 {
        let mut v1 = seed.wrapping_add(P1).wrapping_add(P2);
        let mut v2 = seed.wrapping_add(P2);
        let mut v3 = seed;
        let mut v4 = seed.wrapping_sub(P1);
        while rest.len() >= 32 {
            v1 = round(v1, read_u64(rest, 0));
            v2 = round(v2, read_u64(rest, 8));
            v3 = round(v3, read_u64(rest, 16));
            v4 = round(v4, read_u64(rest, 24));
            rest = &rest[32..];
        }
        hash = v1
            .rotate_left(1)
            .wrapping_add(v2.rotate_left(7))
            .wrapping_add(v3.rotate_left(12))
            .wrapping_add(v4.rotate_left(18));
        hash = merge_round(hash, v1);
        hash = merge_round(hash, v2);
        hash = merge_round(hash, v3);
        hash = merge_round(hash, v4);
    } else {
        hash = seed.wrapping_add(P5);
    }

    hash = hash.wrapping_add(len);

    while rest.len() >= 8 {
        hash ^= round(0, read_u64(rest, 0));
        hash = hash.rotate_left(27).wrapping_mul(P1).wrapping_add(P4);
        rest = &rest[8..];
    }
    if rest.len() >= 4 {
        let word = u32::from_le_bytes(rest[..4].try_into().unwrap()) as u64;
        hash ^= word.wrapping_mul(P1);
        hash = hash.rotate_left(23).wrapping_mul(P2).wrapping_add(P3);
        rest = &rest[4..];
    }
    for &byte in rest {
        hash ^= (byte as u64).wrapping_mul(P5);
        hash = hash.rotate_left(11).wrapping_mul(P1);
    }

    hash ^= hash >> 33;
    hash = hash.wrapping_mul(P2);
    hash ^= hash >> 29;
    hash = hash.wrapping_mul(P3);
    hash ^= hash >> 32;
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn round_trip(source: &[u8], target: &[u8], config: &SyncConfig) -> (Vec<u8>, SyncSummary) {
        let mut delta = Vec::new();
        let summary = generate_delta(
            &mut Cursor::new(source),
            &mut Cursor::new(target),
            &mut delta,
            config,
        )
        .unwrap();
        let mut out = Vec::new();
        apply_delta(&mut Cursor::new(&delta), &mut Cursor::new(source), &mut out).unwrap();
        assert_eq!(out, target, "reconstruction mismatch");
        (delta, summary)
    }

    fn patterned(len: usize, phase: u8) -> Vec<u8> {
        (0..len).map(|i| ((i as u64 * 31 + phase as u64) % 251) as u8).collect()
    }

    #[test]
    fn test_identical_streams_are_all_copies() {
        let config = SyncConfig {
            block_size: 1024,
            weak_hash: WeakHashKind::Xxh64,
        };
        let data = patterned(10 * 1024, 0);
        let (delta, summary) = round_trip(&data, &data, &config);
        assert_eq!(summary.literal_bytes, 0);
        assert_eq!(summary.matched_bytes, data.len() as u64);
        assert_eq!(summary.copy_ops, 10);
        // 10 copy records of 13 bytes each.
        assert_eq!(delta.len(), 130);
        assert!((summary.savings_percent() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_disjoint_streams_are_all_literals() {
        let config = SyncConfig {
            block_size: 512,
            weak_hash: WeakHashKind::Xxh64,
        };
        let source = patterned(4096, 0);
        // Quadratic generator: shares no 512-byte window with the linear source.
        let target: Vec<u8> = (0..4096usize).map(|i| ((i * i + 13) % 241) as u8).collect();
        let (delta, summary) = round_trip(&source, &target, &config);
        assert_eq!(summary.matched_bytes, 0);
        assert_eq!(summary.literal_bytes, target.len() as u64);
        // Bounded overhead: one DATA header per literal run.
        assert!(delta.len() <= target.len() + 5 * (summary.data_ops as usize));
    }

    #[test]
    fn test_insertion_in_the_middle() {
        for weak_hash in [WeakHashKind::Xxh64, WeakHashKind::Adler32] {
            let config = SyncConfig {
                block_size: 256,
                weak_hash,
            };
            let source = patterned(8 * 256, 0);
            let mut target = source[..1024].to_vec();
            target.extend_from_slice(b"inserted run that matches nothing");
            target.extend_from_slice(&source[1024..]);

            let (_, summary) = round_trip(&source, &target, &config);
            // Everything before and after the insertion still matches block-wise.
            assert!(summary.matched_bytes >= (source.len() - 256) as u64, "{:?}", weak_hash);
            assert!(summary.literal_bytes < 512, "{:?}", weak_hash);
        }
    }

    #[test]
    fn test_short_tail_block_matches() {
        let config = SyncConfig {
            block_size: 1000,
            weak_hash: WeakHashKind::Adler32,
        };
        // 2.5 blocks: the tail signature is 500 bytes and must still match.
        let data = patterned(2500, 3);
        let (_, summary) = round_trip(&data, &data, &config);
        assert_eq!(summary.matched_bytes, 2500);
        assert_eq!(summary.copy_ops, 3);
    }

    #[test]
    fn test_empty_target_yields_empty_stream() {
        let config = SyncConfig::default();
        let source = patterned(1000, 0);
        let mut delta = Vec::new();
        let summary = generate_delta(
            &mut Cursor::new(&source),
            &mut Cursor::new(Vec::<u8>::new()),
            &mut delta,
            &config,
        )
        .unwrap();
        assert!(delta.is_empty());
        assert_eq!(summary.matched_bytes + summary.literal_bytes, 0);
    }

    #[test]
    fn test_rolling_adler_agrees_with_fresh() {
        let data = patterned(300, 9);
        let window = 64;
        let mut state = RollingAdler32::from_bytes(&data[..window]);
        for start in 1..(data.len() - window) {
            state.roll(data[start - 1], data[start + window - 1]);
            let fresh = RollingAdler32::from_bytes(&data[start..start + window]);
            assert_eq!(state.digest(), fresh.digest(), "window at {}", start);
        }
    }

    #[test]
    fn test_xxh64_reference_and_determinism() {
        // The empty-input value is the canonical XXH64 constant.
        assert_eq!(xxh64(b"", 0), 0xEF46_DB37_51D8_E999);
        // Deterministic, seed-sensitive, content-sensitive.
        let data = patterned(100, 0);
        assert_eq!(xxh64(&data, 0), xxh64(&data, 0));
        assert_ne!(xxh64(&data, 0), xxh64(&data, 1));
        assert_ne!(xxh64(&data[..99], 0), xxh64(&data, 0));
        // All length branches (stripes, 8-byte, 4-byte, tail) stay consistent.
        for len in [0usize, 3, 4, 7, 8, 31, 32, 33, 63, 64, 100] {
            assert_eq!(xxh64(&data[..len], 0), xxh64(&data[..len].to_vec(), 0));
        }
    }

    #[test]
    fn test_truncated_op_stream_rejected() {
        let mut delta = Vec::new();
        write_copy(&mut delta, 0, 100).unwrap();
        let err = read_op(&mut Cursor::new(&delta[..5])).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");

        let err = read_op(&mut Cursor::new(&[9u8])).unwrap_err();
        assert!(format!("{}", err).contains("unknown op tag"));
    }

    #[test]
    fn test_apply_verified_catches_corruption() {
        let config = SyncConfig {
            block_size: 128,
            weak_hash: WeakHashKind::Xxh64,
        };
        let source = patterned(1024, 0);
        let target = patterned(1024, 1);
        let mut delta = Vec::new();
        generate_delta(
            &mut Cursor::new(&source),
            &mut Cursor::new(&target),
            &mut delta,
            &config,
        )
        .unwrap();

        let expected = crate::digest::digest_bytes(&target);
        let mut out = Vec::new();
        apply_delta_verified(
            &mut Cursor::new(&delta),
            &mut Cursor::new(&source),
            &mut out,
            &expected,
        )
        .unwrap();

        let wrong = crate::digest::digest_bytes(b"other");
        let mut out = Vec::new();
        let err = apply_delta_verified(
            &mut Cursor::new(&delta),
            &mut Cursor::new(&source),
            &mut out,
            &wrong,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "integrity");
    }

    #[test]
    fn test_estimate_savings_without_output() {
        let config = SyncConfig {
            block_size: 256,
            weak_hash: WeakHashKind::Xxh64,
        };
        let data = patterned(4096, 0);
        let savings = estimate_savings(
            &mut Cursor::new(&data),
            &mut Cursor::new(&data),
            &config,
        )
        .unwrap();
        assert!((savings - 100.0).abs() < f64::EPSILON);
    }
}
