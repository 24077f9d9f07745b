//! Framed binary delta formats.
//!
//! Wire layout: a big-endian u32 header length, a JSON header describing the
//! format and both endpoints, then a format-specific payload:
//!
//! - `identical`: empty payload, source and target digests are equal
//! - `bsdiff` / `simple`: `u32 prefix_len | u32 suffix_len | middle bytes`
//! - `chunk`: `i32[chunk_count] chunk map | literal chunks in order`
//! - `none`: the raw target bytes
//!
//! The `bsdiff` name is historical; the payload is the prefix/suffix/middle
//! layout above, not a bsdiff-1.x patch.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::digest::{digest_bytes, verify_digest};
use crate::error_handling::{utils as errors, TransferError};

/// Chunk size used by the `chunk` format unless overridden.
pub const DEFAULT_CODEC_CHUNK_SIZE: usize = 1024 * 1024;

/// Delta wire formats.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaFormat {
    Bsdiff,
    Simple,
    Chunk,
    None,
    Identical,
}

impl DeltaFormat {
    pub fn name(&self) -> &'static str {
        match self {
            DeltaFormat::Bsdiff => "bsdiff",
            DeltaFormat::Simple => "simple",
            DeltaFormat::Chunk => "chunk",
            DeltaFormat::None => "none",
            DeltaFormat::Identical => "identical",
        }
    }

    pub fn parse(name: &str) -> Result<Self, TransferError> {
        match name {
            "bsdiff" => Ok(DeltaFormat::Bsdiff),
            "simple" => Ok(DeltaFormat::Simple),
            "chunk" => Ok(DeltaFormat::Chunk),
            "none" => Ok(DeltaFormat::None),
            "identical" => Ok(DeltaFormat::Identical),
            other => Err(errors::invalid_input(
                "parse_delta_format",
                &format!("unknown delta format: {}", other),
            )),
        }
    }
}

/// Self-describing delta header, JSON-serialized on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeltaHeader {
    pub format: DeltaFormat,
    pub source_size: u64,
    pub target_size: u64,
    pub delta_size: u64,
    pub chunk_size: u64,
    pub chunk_count: u32,
    pub source_digest: String,
    pub target_digest: String,
}

/// Create a delta that turns `source` into `target` using `format`.
/// Identical inputs always yield the `identical` format regardless of the
/// requested one.
pub fn create_delta(
    source: &[u8],
    target: &[u8],
    format: DeltaFormat,
) -> Result<Vec<u8>, TransferError> {
    create_delta_with_chunk_size(source, target, format, DEFAULT_CODEC_CHUNK_SIZE)
}

/// As [`create_delta`] with an explicit chunk size for the `chunk` format.
pub fn create_delta_with_chunk_size(
    source: &[u8],
    target: &[u8],
    format: DeltaFormat,
    chunk_size: usize,
) -> Result<Vec<u8>, TransferError> {
    if source.is_empty() {
        return Err(errors::invalid_input("create_delta", "empty source"));
    }
    if target.is_empty() {
        return Err(errors::invalid_input("create_delta", "empty target"));
    }
    if chunk_size == 0 {
        return Err(errors::invalid_input("create_delta", "non-positive chunk size"));
    }

    let source_digest = digest_bytes(source);
    let target_digest = digest_bytes(target);

    if source_digest == target_digest {
        let header = DeltaHeader {
            format: DeltaFormat::Identical,
            source_size: source.len() as u64,
            target_size: target.len() as u64,
            delta_size: 0,
            chunk_size: 0,
            chunk_count: 0,
            source_digest,
            target_digest,
        };
        return frame(&header, &[]);
    }

    match format {
        DeltaFormat::Identical => Err(errors::invalid_input(
            "create_delta",
            "identical format requested for differing inputs",
        )),
        DeltaFormat::Bsdiff | DeltaFormat::Simple => {
            let payload = encode_prefix_suffix(source, target);
            let header = DeltaHeader {
                format,
                source_size: source.len() as u64,
                target_size: target.len() as u64,
                delta_size: payload.len() as u64,
                chunk_size: 0,
                chunk_count: 0,
                source_digest,
                target_digest,
            };
            frame(&header, &payload)
        }
        DeltaFormat::Chunk => {
            let (payload, chunk_count) = encode_chunked(source, target, chunk_size);
            let header = DeltaHeader {
                format,
                source_size: source.len() as u64,
                target_size: target.len() as u64,
                delta_size: payload.len() as u64,
                chunk_size: chunk_size as u64,
                chunk_count,
                source_digest,
                target_digest,
            };
            frame(&header, &payload)
        }
        DeltaFormat::None => {
            let header = DeltaHeader {
                format,
                source_size: source.len() as u64,
                target_size: target.len() as u64,
                delta_size: target.len() as u64,
                chunk_size: 0,
                chunk_count: 0,
                source_digest,
                target_digest,
            };
            frame(&header, target)
        }
    }
}

/// Apply a framed delta to `source`, reproducing the target. Verifies the
/// source digest precondition, declared sizes, and the target digest.
pub fn apply_delta(delta: &[u8], source: &[u8]) -> Result<Vec<u8>, TransferError> {
    let (header, payload) = read_frame(delta)?;

    if header.source_size != source.len() as u64 {
        return Err(errors::invalid_input(
            "apply_delta",
            &format!(
                "source size mismatch: header says {}, got {}",
                header.source_size,
                source.len()
            ),
        ));
    }
    if !header.source_digest.is_empty() {
        let actual = digest_bytes(source);
        if actual != header.source_digest {
            return Err(errors::invalid_input(
                "apply_delta",
                &format!(
                    "source digest mismatch: header says {}, got {}",
                    header.source_digest, actual
                ),
            ));
        }
    }
    if header.delta_size != payload.len() as u64 {
        return Err(errors::invalid_input(
            "apply_delta",
            &format!(
                "truncated payload: header says {} bytes, got {}",
                header.delta_size,
                payload.len()
            ),
        ));
    }

    let result = match header.format {
        DeltaFormat::Identical => source.to_vec(),
        DeltaFormat::Bsdiff | DeltaFormat::Simple => apply_prefix_suffix(payload, source)?,
        DeltaFormat::Chunk => apply_chunked(&header, payload, source)?,
        DeltaFormat::None => payload.to_vec(),
    };

    if result.len() as u64 != header.target_size {
        return Err(errors::invalid_input(
            "apply_delta",
            &format!(
                "result size mismatch: header says {}, got {}",
                header.target_size,
                result.len()
            ),
        ));
    }
    if !header.target_digest.is_empty() {
        verify_digest("apply_delta", &result, &header.target_digest)?;
    }
    Ok(result)
}

/// Parse the frame into (header, payload) without applying anything.
pub fn read_frame(delta: &[u8]) -> Result<(DeltaHeader, &[u8]), TransferError> {
    if delta.len() < 4 {
        return Err(errors::invalid_input("read_delta_header", "truncated length prefix"));
    }
    let header_len = u32::from_be_bytes([delta[0], delta[1], delta[2], delta[3]]) as usize;
    if delta.len() < 4 + header_len {
        return Err(errors::invalid_input("read_delta_header", "truncated header"));
    }
    let header: DeltaHeader = serde_json::from_slice(&delta[4..4 + header_len])
        .map_err(|e| errors::invalid_input("read_delta_header", &format!("bad header JSON: {}", e)))?;
    Ok((header, &delta[4 + header_len..]))
}

fn frame(header: &DeltaHeader, payload: &[u8]) -> Result<Vec<u8>, TransferError> {
    let header_json = serde_json::to_vec(header)
        .map_err(|e| errors::invalid_input("write_delta_header", &e.to_string()))?;
    let mut out = Vec::with_capacity(4 + header_json.len() + payload.len());
    out.extend_from_slice(&(header_json.len() as u32).to_be_bytes());
    out.extend_from_slice(&header_json);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Longest common prefix, then longest common suffix of the remainder; the
/// differing middle is stored literally.
fn encode_prefix_suffix(source: &[u8], target: &[u8]) -> Vec<u8> {
    let max_prefix = source.len().min(target.len());
    let mut prefix = 0usize;
    while prefix < max_prefix && source[prefix] == target[prefix] {
        prefix += 1;
    }

    let max_suffix = (source.len() - prefix).min(target.len() - prefix);
    let mut suffix = 0usize;
    while suffix < max_suffix
        && source[source.len() - 1 - suffix] == target[target.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let middle = &target[prefix..target.len() - suffix];
    let mut payload = Vec::with_capacity(8 + middle.len());
    payload.extend_from_slice(&(prefix as u32).to_be_bytes());
    payload.extend_from_slice(&(suffix as u32).to_be_bytes());
    payload.extend_from_slice(middle);
    payload
}

fn apply_prefix_suffix(payload: &[u8], source: &[u8]) -> Result<Vec<u8>, TransferError> {
    if payload.len() < 8 {
        return Err(errors::invalid_input("apply_delta", "truncated prefix/suffix payload"));
    }
    let prefix = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    let suffix = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]) as usize;
    let middle = &payload[8..];

    if prefix + suffix > source.len() {
        return Err(errors::invalid_input(
            "apply_delta",
            &format!(
                "prefix {} + suffix {} exceed source length {}",
                prefix,
                suffix,
                source.len()
            ),
        ));
    }

    let mut result = Vec::with_capacity(prefix + middle.len() + suffix);
    result.extend_from_slice(&source[..prefix]);
    result.extend_from_slice(middle);
    result.extend_from_slice(&source[source.len() - suffix..]);
    Ok(result)
}

fn chunk_hash(chunk: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(chunk);
    hasher.finalize().into()
}

/// Map every target chunk to a matching source chunk index, or -1 with the
/// chunk bytes appended literally.
fn encode_chunked(source: &[u8], target: &[u8], chunk_size: usize) -> (Vec<u8>, u32) {
    let source_chunks: Vec<&[u8]> = source.chunks(chunk_size).collect();
    let mut by_hash: HashMap<[u8; 32], usize> = HashMap::with_capacity(source_chunks.len());
    for (index, chunk) in source_chunks.iter().enumerate() {
        by_hash.entry(chunk_hash(chunk)).or_insert(index);
    }

    let target_chunks: Vec<&[u8]> = target.chunks(chunk_size).collect();
    let mut map = Vec::with_capacity(4 * target_chunks.len());
    let mut literals = Vec::new();
    for chunk in &target_chunks {
        let matched = by_hash
            .get(&chunk_hash(chunk))
            // Hash match is not enough; confirm bytes before trusting it.
            .filter(|&&index| source_chunks[index] == *chunk)
            .copied();
        match matched {
            Some(index) => map.extend_from_slice(&(index as i32).to_be_bytes()),
            None => {
                map.extend_from_slice(&(-1i32).to_be_bytes());
                literals.extend_from_slice(chunk);
            }
        }
    }

    let mut payload = Vec::with_capacity(map.len() + literals.len());
    payload.extend_from_slice(&map);
    payload.extend_from_slice(&literals);
    (payload, target_chunks.len() as u32)
}

fn apply_chunked(
    header: &DeltaHeader,
    payload: &[u8],
    source: &[u8],
) -> Result<Vec<u8>, TransferError> {
    let chunk_size = header.chunk_size as usize;
    if chunk_size == 0 {
        return Err(errors::invalid_input("apply_delta", "chunk format with zero chunk size"));
    }
    let chunk_count = header.chunk_count as usize;
    let map_len = chunk_count * 4;
    if payload.len() < map_len {
        return Err(errors::invalid_input("apply_delta", "truncated chunk map"));
    }

    let source_chunks: Vec<&[u8]> = source.chunks(chunk_size).collect();
    let mut literals = &payload[map_len..];
    let mut result = Vec::with_capacity(header.target_size as usize);

    for entry in 0..chunk_count {
        let offset = entry * 4;
        let index = i32::from_be_bytes([
            payload[offset],
            payload[offset + 1],
            payload[offset + 2],
            payload[offset + 3],
        ]);
        if index >= 0 {
            let index = index as usize;
            if index >= source_chunks.len() {
                return Err(errors::invalid_input(
                    "apply_delta",
                    &format!("chunk map references source chunk {} of {}", index, source_chunks.len()),
                ));
            }
            result.extend_from_slice(source_chunks[index]);
        } else {
            // Literal target chunk; only the final one may run short.
            let remaining_target = (header.target_size as usize).saturating_sub(result.len());
            let want = chunk_size.min(remaining_target);
            if literals.len() < want {
                return Err(errors::invalid_input("apply_delta", "truncated literal chunk"));
            }
            result.extend_from_slice(&literals[..want]);
            literals = &literals[want..];
        }
    }
    Ok(result)
}
