//! Generic OCI/Docker V2 registry-backed repository.
//!
//! Speaks the distribution HTTP API over the shared connection pool and
//! implements the `Repository` capability set, so the transfer manager can
//! move blobs between real registries. Cloud-specific credential exchange
//! stays outside; callers hand in a ready bearer token when the registry
//! wants one.

use std::io::Read;
use std::sync::Arc;

use serde::Deserialize;

use crate::cancel::CancellationToken;
use crate::connection_pool::ConnectionPool;
use crate::digest::{digest_bytes, is_valid_digest};
use crate::error_handling::{utils as errors, TransferError};
use crate::repository::{Manifest, Repository};

const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";
/// Manifest types we accept, OCI first, Docker schema 2 as fallback.
const ACCEPTED_MANIFESTS: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json";

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// One repository on a V2 registry, e.g. `library/nginx` on
/// `https://registry.example.com`.
pub struct RegistryRepository {
    pool: Arc<ConnectionPool>,
    registry_url: String,
    repository: String,
    bearer_token: Option<String>,
}

impl RegistryRepository {
    pub fn new(pool: Arc<ConnectionPool>, registry_url: &str, repository: &str) -> Self {
        Self {
            pool,
            registry_url: registry_url.trim_end_matches('/').to_string(),
            repository: repository.to_string(),
            bearer_token: None,
        }
    }

    pub fn with_bearer_token(mut self, token: &str) -> Self {
        if !token.is_empty() {
            self.bearer_token = Some(token.to_string());
        }
        self
    }

    pub fn registry_url(&self) -> &str {
        &self.registry_url
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/v2/{}/{}", self.registry_url, self.repository, suffix)
    }

    fn authorize(
        &self,
        request: reqwest::blocking::RequestBuilder,
    ) -> reqwest::blocking::RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.header(reqwest::header::AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }

    fn send(
        &self,
        operation: &str,
        request: reqwest::blocking::RequestBuilder,
        url: &str,
    ) -> Result<reqwest::blocking::Response, TransferError> {
        self.authorize(request)
            .send()
            .map_err(|e| errors::network_error(operation, Some(url), e.to_string()))
    }
}

impl Repository for RegistryRepository {
    fn name(&self) -> String {
        self.repository.clone()
    }

    fn list_tags(&self, ctx: &CancellationToken) -> Result<Vec<String>, TransferError> {
        ctx.check("list_tags")?;
        let url = self.url("tags/list");
        let client = self.pool.get_client_for_url(&url)?;
        let response = self.send("list_tags", client.client().get(&url), &url)?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(errors::network_error_with_status(
                "list_tags",
                Some(&url),
                status,
                "tag listing failed",
            ));
        }
        let body = response
            .bytes()
            .map_err(|e| errors::network_error("list_tags", Some(&url), e.to_string()))?;
        let list: TagList = serde_json::from_slice(&body)
            .map_err(|e| errors::invalid_input("list_tags", &format!("bad tag list JSON: {}", e)))?;
        Ok(list.tags.unwrap_or_default())
    }

    fn get_manifest(&self, ctx: &CancellationToken, tag: &str) -> Result<Manifest, TransferError> {
        ctx.check("get_manifest")?;
        let url = self.url(&format!("manifests/{}", tag));
        let client = self.pool.get_client_for_url(&url)?;
        let response = self.send(
            "get_manifest",
            client
                .client()
                .get(&url)
                .header(reqwest::header::ACCEPT, ACCEPTED_MANIFESTS),
            &url,
        )?;
        let status = response.status().as_u16();
        if status == 404 {
            return Err(errors::registry_error(
                "get_manifest",
                Some(&self.repository),
                None,
                &format!("no manifest for tag {}", tag),
            ));
        }
        if status != 200 {
            return Err(errors::network_error_with_status(
                "get_manifest",
                Some(&url),
                status,
                "manifest fetch failed",
            ));
        }

        let media_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or(crate::repository::MEDIA_TYPE_MANIFEST)
            .to_string();
        let reported_digest = response
            .headers()
            .get(DOCKER_CONTENT_DIGEST)
            .and_then(|value| value.to_str().ok())
            .map(String::from);
        let content = response
            .bytes()
            .map_err(|e| errors::network_error("get_manifest", Some(&url), e.to_string()))?
            .to_vec();

        let computed = digest_bytes(&content);
        if let Some(reported) = reported_digest {
            // Registries that report a digest must report the right one.
            if is_valid_digest(&reported) && reported != computed {
                return Err(errors::integrity_error("get_manifest", &reported, &computed));
            }
        }
        Ok(Manifest {
            content,
            media_type,
            digest: computed,
        })
    }

    fn put_manifest(
        &self,
        ctx: &CancellationToken,
        tag: &str,
        manifest: &Manifest,
    ) -> Result<(), TransferError> {
        ctx.check("put_manifest")?;
        let url = self.url(&format!("manifests/{}", tag));
        let client = self.pool.get_client_for_url(&url)?;
        let response = self.send(
            "put_manifest",
            client
                .client()
                .put(&url)
                .header(reqwest::header::CONTENT_TYPE, manifest.media_type.clone())
                .body(manifest.content.clone()),
            &url,
        )?;
        match response.status().as_u16() {
            200 | 201 | 202 => Ok(()),
            status => Err(errors::network_error_with_status(
                "put_manifest",
                Some(&url),
                status,
                "manifest push rejected",
            )),
        }
    }

    fn delete_manifest(&self, ctx: &CancellationToken, tag: &str) -> Result<(), TransferError> {
        ctx.check("delete_manifest")?;
        let url = self.url(&format!("manifests/{}", tag));
        let client = self.pool.get_client_for_url(&url)?;
        let response = self.send("delete_manifest", client.client().delete(&url), &url)?;
        match response.status().as_u16() {
            200 | 202 | 204 => Ok(()),
            404 => Err(errors::registry_error(
                "delete_manifest",
                Some(&self.repository),
                None,
                &format!("no manifest for tag {}", tag),
            )),
            status => Err(errors::network_error_with_status(
                "delete_manifest",
                Some(&url),
                status,
                "manifest delete rejected",
            )),
        }
    }

    fn get_layer_reader(
        &self,
        ctx: &CancellationToken,
        digest: &str,
    ) -> Result<Box<dyn Read + Send>, TransferError> {
        ctx.check("get_layer_reader")?;
        let url = self.url(&format!("blobs/{}", digest));
        let client = self.pool.get_client_for_url(&url)?;
        let response = self.send("get_layer_reader", client.client().get(&url), &url)?;
        match response.status().as_u16() {
            // The response body streams; no buffering here.
            200 => Ok(Box::new(response)),
            404 => Err(errors::registry_error(
                "get_layer_reader",
                Some(&self.repository),
                Some(digest),
                "blob not found",
            )),
            status => Err(errors::network_error_with_status(
                "get_layer_reader",
                Some(&url),
                status,
                "blob fetch failed",
            )),
        }
    }

    fn has_blob(&self, ctx: &CancellationToken, digest: &str) -> Result<bool, TransferError> {
        ctx.check("has_blob")?;
        let url = self.url(&format!("blobs/{}", digest));
        let client = self.pool.get_client_for_url(&url)?;
        let response = self.send("has_blob", client.client().head(&url), &url)?;
        match response.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            status => Err(errors::network_error_with_status(
                "has_blob",
                Some(&url),
                status,
                "existence check failed",
            )),
        }
    }

    /// Monolithic upload: start an upload session, then PUT the whole blob
    /// with the digest in the query. The content is verified against the
    /// digest before any bytes leave the process.
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
        let actual = digest_bytes(&content);
        if actual != digest {
            return Err(errors::integrity_error("put_layer", digest, &actual));
        }

        let start_url = self.url("blobs/uploads/");
        let client = self.pool.get_client_for_url(&start_url)?;
        let response = self.send(
            "start_upload",
            client
                .client()
                .post(&start_url)
                .header(reqwest::header::CONTENT_LENGTH, "0"),
            &start_url,
        )?;
        let status = response.status().as_u16();
        if status != 202 {
            return Err(errors::network_error_with_status(
                "start_upload",
                Some(&start_url),
                status,
                "upload session rejected",
            ));
        }
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(String::from)
            .ok_or_else(|| {
                errors::network_error_with_status(
                    "start_upload",
                    Some(&start_url),
                    202,
                    "202 without Location header",
                )
            })?;

        let base = reqwest::Url::parse(&start_url)
            .map_err(|e| errors::invalid_input("parse_url", &e.to_string()))?;
        let mut put_url = base
            .join(&location)
            .map_err(|e| errors::invalid_input("parse_url", &format!("{}: {}", location, e)))?;
        put_url
            .query_pairs_mut()
            .append_pair("digest", digest);
        let put_url = put_url.to_string();

        ctx.check("put_layer")?;
        let written = content.len() as u64;
        let client = self.pool.get_client_for_url(&put_url)?;
        let response = self.send(
            "put_layer",
            client
                .client()
                .put(&put_url)
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(content),
            &put_url,
        )?;
        match response.status().as_u16() {
            201 | 204 => Ok(written),
            status => Err(errors::network_error_with_status(
                "put_layer",
                Some(&put_url),
                status,
                "blob upload rejected",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_pool::PoolConfig;
    use crate::repository::MEDIA_TYPE_MANIFEST;
    use crate::test_support::{StubResponse, StubServer};

    fn repo(server: &StubServer) -> RegistryRepository {
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
        RegistryRepository::new(pool, server.base_url(), "library/app")
    }

    #[test]
    fn test_list_tags() {
        let server = StubServer::start(vec![(
            "/v2/library/app/tags/list",
            vec![StubResponse::new(200)
                .with_header("Content-Type", "application/json")
                .with_body(br#"{"name":"library/app","tags":["v1","v2"]}"#)],
        )]);
        let ctx = CancellationToken::new();
        assert_eq!(repo(&server).list_tags(&ctx).unwrap(), vec!["v1", "v2"]);
    }

    #[test]
    fn test_get_manifest_verifies_reported_digest() {
        let body = br#"{"schemaVersion":2,"layers":[]}"#.to_vec();
        let good = digest_bytes(&body);
        let server = StubServer::start(vec![(
            "/v2/library/app/manifests/v1",
            vec![
                StubResponse::new(200)
                    .with_header("Content-Type", MEDIA_TYPE_MANIFEST)
                    .with_header("Docker-Content-Digest", &good)
                    .with_body(&body),
            ],
        )]);
        let ctx = CancellationToken::new();
        let manifest = repo(&server).get_manifest(&ctx, "v1").unwrap();
        assert_eq!(manifest.digest, good);
        assert_eq!(manifest.media_type, MEDIA_TYPE_MANIFEST);
        assert_eq!(manifest.content, body);
    }

    #[test]
    fn test_get_manifest_digest_mismatch() {
        let body = br#"{"schemaVersion":2,"layers":[]}"#.to_vec();
        let wrong = digest_bytes(b"something else");
        let server = StubServer::start(vec![(
            "/v2/library/app/manifests/v1",
            vec![
                StubResponse::new(200)
                    .with_header("Docker-Content-Digest", &wrong)
                    .with_body(&body),
            ],
        )]);
        let ctx = CancellationToken::new();
        let err = repo(&server).get_manifest(&ctx, "v1").unwrap_err();
        assert_eq!(err.kind(), "integrity");
    }

    #[test]
    fn test_blob_existence_and_read() {
        let content = b"layer payload".to_vec();
        let digest = digest_bytes(&content);
        let blob_path = format!("/v2/library/app/blobs/{}", digest);
        let server = StubServer::start(vec![(
            blob_path.as_str(),
            vec![StubResponse::new(200).with_body(&content)],
        )]);
        let ctx = CancellationToken::new();
        let repository = repo(&server);

        assert!(repository.has_blob(&ctx, &digest).unwrap());
        let mut reader = repository.get_layer_reader(&ctx, &digest).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, content);
    }

    #[test]
    fn test_put_layer_upload_flow() {
        let content = b"upload me".to_vec();
        let digest = digest_bytes(&content);
        let session = "/v2/library/app/blobs/uploads/session-9";
        let put_path = format!("{}?digest={}", session, urlencode_digest(&digest));
        let server = StubServer::start(vec![
            (
                "/v2/library/app/blobs/uploads/",
                vec![StubResponse::new(202).with_header("Location", session)],
            ),
            (put_path.as_str(), vec![StubResponse::new(201)]),
        ]);
        let ctx = CancellationToken::new();
        let written = repo(&server)
            .put_layer(&ctx, &digest, &mut &content[..])
            .unwrap();
        assert_eq!(written, content.len() as u64);

        let methods: Vec<String> = server.requests().into_iter().map(|(m, _)| m).collect();
        assert_eq!(methods, vec!["POST".to_string(), "PUT".to_string()]);
    }

    #[test]
    fn test_put_layer_rejects_corrupt_content() {
        let server = StubServer::start(vec![]);
        let ctx = CancellationToken::new();
        let digest = digest_bytes(b"expected");
        let err = repo(&server)
            .put_layer(&ctx, &digest, &mut &b"different"[..])
            .unwrap_err();
        assert_eq!(err.kind(), "integrity");
        // Nothing reached the registry.
        assert!(server.requests().is_empty());
    }

    #[test]
    fn test_missing_manifest_is_registry_error() {
        let server = StubServer::start(vec![(
            "/v2/library/app/manifests/gone",
            vec![StubResponse::new(404)],
        )]);
        let ctx = CancellationToken::new();
        let err = repo(&server).get_manifest(&ctx, "gone").unwrap_err();
        assert_eq!(err.kind(), "registry");
    }

    /// Percent-encoding reqwest's query serializer applies to `sha256:`.
    fn urlencode_digest(digest: &str) -> String {
        digest.replace(':', "%3A")
    }
}
