//! Repository capability surface consumed by the transfer manager.
//!
//! Registry variants (ECR, GCR, Quay, generic OCI) live outside this crate;
//! the core only exercises these operations. `MemoryRepository` is the
//! in-crate implementation used by tests and local staging.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::Mutex;

use serde::Deserialize;

use crate::cancel::CancellationToken;
use crate::digest::{digest_bytes, verify_digest};
use crate::error_handling::{utils as errors, TransferError};

pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// A fetched manifest: raw bytes plus how the registry described them.
#[derive(Clone, Debug)]
pub struct Manifest {
    pub content: Vec<u8>,
    pub media_type: String,
    pub digest: String,
}

impl Manifest {
    pub fn new(content: Vec<u8>, media_type: &str) -> Self {
        let digest = digest_bytes(&content);
        Self {
            content,
            media_type: media_type.to_string(),
            digest,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ManifestDescriptor {
    digest: String,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ManifestDocument {
    #[serde(default)]
    config: Option<ManifestDescriptor>,
    #[serde(default)]
    layers: Vec<ManifestDescriptor>,
}

/// Digests referenced by a manifest, in document order.
#[derive(Clone, Debug, Default)]
pub struct ManifestRefs {
    pub config_digest: Option<String>,
    pub layer_digests: Vec<String>,
    pub layer_sizes: Vec<Option<u64>>,
}

/// Parse the config and layer references out of a manifest document.
pub fn parse_manifest_refs(content: &[u8]) -> Result<ManifestRefs, TransferError> {
    let document: ManifestDocument = serde_json::from_slice(content)
        .map_err(|e| errors::invalid_input("parse_manifest", &format!("bad manifest JSON: {}", e)))?;
    Ok(ManifestRefs {
        config_digest: document.config.map(|descriptor| descriptor.digest),
        layer_sizes: document.layers.iter().map(|descriptor| descriptor.size).collect(),
        layer_digests: document
            .layers
            .into_iter()
            .map(|descriptor| descriptor.digest)
            .collect(),
    })
}

/// Capability set the transfer core needs from each side of a transfer.
pub trait Repository: Send + Sync {
    /// Repository name, e.g. `library/nginx`
    fn name(&self) -> String;

    fn list_tags(&self, ctx: &CancellationToken) -> Result<Vec<String>, TransferError>;

    fn get_manifest(&self, ctx: &CancellationToken, tag: &str) -> Result<Manifest, TransferError>;

    fn put_manifest(
        &self,
        ctx: &CancellationToken,
        tag: &str,
        manifest: &Manifest,
    ) -> Result<(), TransferError>;

    fn delete_manifest(&self, ctx: &CancellationToken, tag: &str) -> Result<(), TransferError>;

    /// Open a streaming reader over one blob.
    fn get_layer_reader(
        &self,
        ctx: &CancellationToken,
        digest: &str,
    ) -> Result<Box<dyn Read + Send>, TransferError>;

    fn has_blob(&self, ctx: &CancellationToken, digest: &str) -> Result<bool, TransferError>;

    /// Store a blob under `digest`, verifying content against it before the
    /// upload is considered complete. Returns bytes written.
    fn put_layer(
        &self,
        ctx: &CancellationToken,
        digest: &str,
        reader: &mut dyn Read,
    ) -> Result<u64, TransferError>;
}

/// Destinations that can accept a framed delta instead of full blob bytes.
/// The receiving side reconstructs the blob against a base it already holds;
/// plain registries without this capability take the full-transfer path.
pub trait DeltaReceiver: Repository {
    /// Store the blob `digest` by applying `delta` to the already-held
    /// `base_digest` blob. Returns the wire size (the delta's length).
    fn put_layer_delta(
        &self,
        ctx: &CancellationToken,
        digest: &str,
        base_digest: &str,
        delta: &[u8],
    ) -> Result<u64, TransferError>;
}

/// In-memory repository: blobs and manifests in maps, digest-verified writes.
pub struct MemoryRepository {
    name: String,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    manifests: Mutex<HashMap<String, Manifest>>,
}

impl MemoryRepository {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            blobs: Mutex::new(HashMap::new()),
            manifests: Mutex::new(HashMap::new()),
        }
    }

    /// Seed a blob directly, computing its digest. Returns the digest.
    pub fn seed_blob(&self, content: &[u8]) -> String {
        let digest = digest_bytes(content);
        self.blobs.lock().unwrap().insert(digest.clone(), content.to_vec());
        digest
    }

    pub fn blob(&self, digest: &str) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(digest).cloned()
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    pub fn manifest_count(&self) -> usize {
        self.manifests.lock().unwrap().len()
    }
}

impl Repository for MemoryRepository {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn list_tags(&self, ctx: &CancellationToken) -> Result<Vec<String>, TransferError> {
        ctx.check("list_tags")?;
        let mut tags: Vec<String> = self.manifests.lock().unwrap().keys().cloned().collect();
        tags.sort();
        Ok(tags)
    }

    fn get_manifest(&self, ctx: &CancellationToken, tag: &str) -> Result<Manifest, TransferError> {
        ctx.check("get_manifest")?;
        self.manifests
            .lock()
            .unwrap()
            .get(tag)
            .cloned()
            .ok_or_else(|| {
                errors::registry_error(
                    "get_manifest",
                    Some(&self.name),
                    None,
                    &format!("no manifest for tag {}", tag),
                )
            })
    }

    fn put_manifest(
        &self,
        ctx: &CancellationToken,
        tag: &str,
        manifest: &Manifest,
    ) -> Result<(), TransferError> {
        ctx.check("put_manifest")?;
        self.manifests
            .lock()
            .unwrap()
            .insert(tag.to_string(), manifest.clone());
        Ok(())
    }

    fn delete_manifest(&self, ctx: &CancellationToken, tag: &str) -> Result<(), TransferError> {
        ctx.check("delete_manifest")?;
        match self.manifests.lock().unwrap().remove(tag) {
            Some(_) => Ok(()),
            None => Err(errors::registry_error(
                "delete_manifest",
                Some(&self.name),
                None,
                &format!("no manifest for tag {}", tag),
            )),
        }
    }

    fn get_layer_reader(
        &self,
        ctx: &CancellationToken,
        digest: &str,
    ) -> Result<Box<dyn Read + Send>, TransferError> {
        ctx.check("get_layer_reader")?;
        let content = self.blob(digest).ok_or_else(|| {
            errors::registry_error(
                "get_layer_reader",
                Some(&self.name),
                Some(digest),
                "blob not found",
            )
        })?;
        Ok(Box::new(Cursor::new(content)))
    }

    fn has_blob(&self, ctx: &CancellationToken, digest: &str) -> Result<bool, TransferError> {
        ctx.check("has_blob")?;
        Ok(self.blobs.lock().unwrap().contains_key(digest))
    }

    fn put_layer(
        &self,
        ctx: &CancellationToken,
        digest: &str,
        reader: &mut dyn Read,
    ) -> Result<u64, TransferError> {
        ctx.check("put_layer")?;
        let mut content = Vec::new();
        reader
            .read_to_end(&mut content)
            .map_err(|e| errors::io_error("put_layer", Some(digest), e))?;
        // The upload is complete only once content matches the digest.
        verify_digest("put_layer", &content, digest)?;
        let written = content.len() as u64;
        self.blobs.lock().unwrap().insert(digest.to_string(), content);
        Ok(written)
    }
}

impl DeltaReceiver for MemoryRepository {
    fn put_layer_delta(
        &self,
        ctx: &CancellationToken,
        digest: &str,
        base_digest: &str,
        delta: &[u8],
    ) -> Result<u64, TransferError> {
        ctx.check("put_layer_delta")?;
        let base = self.blob(base_digest).ok_or_else(|| {
            errors::registry_error(
                "put_layer_delta",
                Some(&self.name),
                Some(base_digest),
                "base blob not found",
            )
        })?;
        let content = crate::delta_codec::apply_delta(delta, &base)?;
        verify_digest("put_layer_delta", &content, digest)?;
        self.blobs.lock().unwrap().insert(digest.to_string(), content);
        Ok(delta.len() as u64)
    }
}
