//! OCI Registry V2 cross-repository blob mounts.
//!
//! When source and destination repositories live on the same registry, a
//! mount request associates the existing blob with the destination repo and
//! no bytes move at all. A 404 means the registry cannot mount (unsupported
//! feature or unknown blob) and the caller falls back to a byte transfer.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::cancel::CancellationToken;
use crate::connection_pool::ConnectionPool;
use crate::digest::is_valid_digest;
use crate::error_handling::{utils as errors, TransferError};
use crate::utils::log;

const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";
const DOCKER_UPLOAD_UUID: &str = "Docker-Upload-UUID";
const MOUNT_CONCURRENCY: usize = 8;

/// Configuration for mount attempts
#[derive(Clone, Copy, Debug)]
pub struct MountConfig {
    /// Transient-error retries per mount request
    pub max_retries: u32,
    /// Initial backoff between retries, doubling up to 5s
    pub retry_backoff: Duration,
    /// HEAD the blob after a successful mount to confirm it landed
    pub verify: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::from_millis(250),
            verify: false,
        }
    }
}

/// One cross-repo mount request.
#[derive(Clone, Debug)]
pub struct MountRequest {
    pub digest: String,
    pub source_repository: String,
    pub target_repository: String,
}

/// How a mount request concluded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MountOutcome {
    /// 201: mounted directly, zero bytes transferred
    Mounted,
    /// 202 + Location, completed with an empty PUT
    MountedViaUpload,
    /// 404: registry cannot mount this blob, fall back to bytes
    NotMountable,
}

impl MountOutcome {
    pub fn succeeded(&self) -> bool {
        !matches!(self, MountOutcome::NotMountable)
    }
}

/// Result of a bulk mount for one request.
pub struct MountCompletion {
    pub request: MountRequest,
    pub result: Result<MountOutcome, TransferError>,
}

/// Cross-repo mount client over the shared connection pool.
pub struct BlobMounter {
    pool: Arc<ConnectionPool>,
    config: MountConfig,
}

impl BlobMounter {
    pub fn new(pool: Arc<ConnectionPool>, config: MountConfig) -> Self {
        Self { pool, config }
    }

    pub fn with_defaults(pool: Arc<ConnectionPool>) -> Self {
        Self::new(pool, MountConfig::default())
    }

    /// Attempt the cross-repo mount on `registry` (base URL without /v2).
    pub fn mount(
        &self,
        ctx: &CancellationToken,
        registry: &str,
        request: &MountRequest,
    ) -> Result<MountOutcome, TransferError> {
        if !is_valid_digest(&request.digest) {
            return Err(errors::invalid_input(
                "mount_blob",
                &format!("malformed digest: {}", request.digest),
            ));
        }
        if request.source_repository.is_empty() || request.target_repository.is_empty() {
            return Err(errors::invalid_input("mount_blob", "empty repository name"));
        }

        let url = format!(
            "{}/v2/{}/blobs/uploads/?mount={}&from={}",
            registry.trim_end_matches('/'),
            request.target_repository,
            request.digest,
            request.source_repository,
        );

        let mut attempt = 0u32;
        let mut backoff = self.config.retry_backoff;
        loop {
            ctx.check("mount_blob")?;
            attempt += 1;
            match self.mount_once(&url, request) {
                Ok(outcome) => {
                    if outcome.succeeded() && self.config.verify {
                        self.verify_mounted(ctx, registry, request)?;
                    }
                    return Ok(outcome);
                }
                Err(error) if error.is_retryable() && attempt <= self.config.max_retries => {
                    log(&format!(
                        "mount retry {} for {} after: {}",
                        attempt, request.digest, error
                    ));
                    ctx.sleep("mount_blob", backoff)?;
                    backoff = backoff.saturating_mul(2).min(Duration::from_secs(5));
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn mount_once(&self, url: &str, request: &MountRequest) -> Result<MountOutcome, TransferError> {
        let pooled = self.pool.get_client_for_url(url)?;
        let response = pooled
            .client()
            .post(url)
            .header(reqwest::header::CONTENT_LENGTH, "0")
            .send()
            .map_err(|e| errors::network_error("mount_blob", Some(url), e.to_string()))?;

        match response.status().as_u16() {
            201 => Ok(MountOutcome::Mounted),
            202 => {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .map(String::from)
                    .ok_or_else(|| {
                        errors::network_error_with_status(
                            "mount_blob",
                            Some(url),
                            202,
                            "202 without Location header",
                        )
                    })?;
                self.complete_upload(url, &location)?;
                Ok(MountOutcome::MountedViaUpload)
            }
            404 => Ok(MountOutcome::NotMountable),
            status => Err(errors::network_error_with_status(
                "mount_blob",
                Some(url),
                status,
                &format!("unexpected mount status for {}", request.digest),
            )),
        }
    }

    /// Some registries accept the mount but still demand the upload session
    /// be closed: PUT the Location with an empty body.
    fn complete_upload(&self, mount_url: &str, location: &str) -> Result<(), TransferError> {
        let put_url = absolutize(mount_url, location)?;
        let pooled = self.pool.get_client_for_url(&put_url)?;
        let response = pooled
            .client()
            .put(&put_url)
            .header(reqwest::header::CONTENT_LENGTH, "0")
            .send()
            .map_err(|e| errors::network_error("complete_mount", Some(&put_url), e.to_string()))?;
        match response.status().as_u16() {
            201 | 204 => Ok(()),
            status => Err(errors::network_error_with_status(
                "complete_mount",
                Some(&put_url),
                status,
                "upload completion rejected",
            )),
        }
    }

    /// Probe whether the destination advertises upload (and therefore mount)
    /// support: an empty upload POST answered with 202 plus an upload UUID.
    pub fn supports_mounting(
        &self,
        ctx: &CancellationToken,
        registry: &str,
        repository: &str,
    ) -> Result<bool, TransferError> {
        ctx.check("probe_mount_support")?;
        let url = format!(
            "{}/v2/{}/blobs/uploads/",
            registry.trim_end_matches('/'),
            repository
        );
        let pooled = self.pool.get_client_for_url(&url)?;
        let response = pooled
            .client()
            .post(&url)
            .header(reqwest::header::CONTENT_LENGTH, "0")
            .send()
            .map_err(|e| errors::network_error("probe_mount_support", Some(&url), e.to_string()))?;
        Ok(response.status().as_u16() == 202 && response.headers().contains_key(DOCKER_UPLOAD_UUID))
    }

    /// HEAD the blob under the target repository; when the registry returns
    /// a Docker-Content-Digest it must match.
    pub fn blob_exists(
        &self,
        ctx: &CancellationToken,
        registry: &str,
        repository: &str,
        digest: &str,
    ) -> Result<bool, TransferError> {
        ctx.check("head_blob")?;
        let url = format!(
            "{}/v2/{}/blobs/{}",
            registry.trim_end_matches('/'),
            repository,
            digest
        );
        let pooled = self.pool.get_client_for_url(&url)?;
        let response = pooled
            .client()
            .head(&url)
            .send()
            .map_err(|e| errors::network_error("head_blob", Some(&url), e.to_string()))?;
        match response.status().as_u16() {
            200 => {
                if let Some(reported) = response
                    .headers()
                    .get(DOCKER_CONTENT_DIGEST)
                    .and_then(|value| value.to_str().ok())
                {
                    if reported != digest {
                        return Err(errors::integrity_error("head_blob", digest, reported));
                    }
                }
                Ok(true)
            }
            404 => Ok(false),
            status => Err(errors::network_error_with_status(
                "head_blob",
                Some(&url),
                status,
                "unexpected existence-check status",
            )),
        }
    }

    fn verify_mounted(
        &self,
        ctx: &CancellationToken,
        registry: &str,
        request: &MountRequest,
    ) -> Result<(), TransferError> {
        let exists =
            self.blob_exists(ctx, registry, &request.target_repository, &request.digest)?;
        if exists {
            Ok(())
        } else {
            Err(errors::registry_error(
                "verify_mount",
                Some(&request.target_repository),
                Some(&request.digest),
                "blob missing after successful mount",
            ))
        }
    }

    /// Mount many blobs, fanning out up to MOUNT_CONCURRENCY at a time.
    /// Every request gets an individual result; errors do not stop the batch.
    pub fn mount_all(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        registry: &str,
        requests: Vec<MountRequest>,
    ) -> Vec<MountCompletion> {
        let mut completions = Vec::with_capacity(requests.len());
        for batch in requests.chunks(MOUNT_CONCURRENCY) {
            let (tx, rx) = mpsc::channel();
            for request in batch {
                let mounter = Arc::clone(self);
                let ctx = ctx.clone();
                let registry = registry.to_string();
                let request = request.clone();
                let tx = tx.clone();
                thread::spawn(move || {
                    let result = mounter.mount(&ctx, &registry, &request);
                    let _ = tx.send(MountCompletion { request, result });
                });
            }
            drop(tx);
            for completion in rx {
                completions.push(completion);
            }
        }
        completions
    }
}

fn absolutize(base_url: &str, location: &str) -> Result<String, TransferError> {
    if location.starts_with("http://") || location.starts_with("https://") {
        return Ok(location.to_string());
    }
    let base = reqwest::Url::parse(base_url)
        .map_err(|e| errors::invalid_input("parse_url", &format!("{}: {}", base_url, e)))?;
    base.join(location)
        .map(|joined| joined.to_string())
        .map_err(|e| errors::invalid_input("parse_url", &format!("{}: {}", location, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_pool::PoolConfig;
    use crate::test_support::{StubResponse, StubServer};

    fn digest_of(data: &[u8]) -> String {
        crate::digest::digest_bytes(data)
    }

    fn mounter() -> Arc<BlobMounter> {
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
        Arc::new(BlobMounter::with_defaults(pool))
    }

    #[test]
    fn test_mount_created_directly() {
        let digest = digest_of(b"layer");
        let path = format!("/v2/app/blobs/uploads/?mount={}&from=base", digest);
        let server = StubServer::start(vec![(path.as_str(), vec![StubResponse::new(201)])]);

        let ctx = CancellationToken::new();
        let request = MountRequest {
            digest,
            source_repository: "base".into(),
            target_repository: "app".into(),
        };
        let outcome = mounter().mount(&ctx, server.base_url(), &request).unwrap();
        assert_eq!(outcome, MountOutcome::Mounted);
        assert_eq!(server.requests(), vec![("POST".to_string(), path)]);
    }

    #[test]
    fn test_mount_completes_via_put() {
        let digest = digest_of(b"layer-2");
        let mount_path = format!("/v2/app/blobs/uploads/?mount={}&from=base", digest);
        let server = StubServer::start(vec![
            (
                mount_path.as_str(),
                vec![StubResponse::new(202).with_header("Location", "/v2/app/blobs/uploads/session-1")],
            ),
            ("/v2/app/blobs/uploads/session-1", vec![StubResponse::new(201)]),
        ]);

        let ctx = CancellationToken::new();
        let request = MountRequest {
            digest,
            source_repository: "base".into(),
            target_repository: "app".into(),
        };
        let outcome = mounter().mount(&ctx, server.base_url(), &request).unwrap();
        assert_eq!(outcome, MountOutcome::MountedViaUpload);

        let methods: Vec<String> = server.requests().into_iter().map(|(m, _)| m).collect();
        assert_eq!(methods, vec!["POST".to_string(), "PUT".to_string()]);
    }

    #[test]
    fn test_mount_404_is_not_mountable_and_not_retried() {
        let digest = digest_of(b"layer-3");
        let path = format!("/v2/app/blobs/uploads/?mount={}&from=base", digest);
        let server = StubServer::start(vec![(path.as_str(), vec![StubResponse::new(404)])]);

        let ctx = CancellationToken::new();
        let request = MountRequest {
            digest,
            source_repository: "base".into(),
            target_repository: "app".into(),
        };
        let outcome = mounter().mount(&ctx, server.base_url(), &request).unwrap();
        assert_eq!(outcome, MountOutcome::NotMountable);
        assert!(!outcome.succeeded());
        assert_eq!(server.requests().len(), 1);
    }

    #[test]
    fn test_mount_retries_transient_errors() {
        let digest = digest_of(b"layer-4");
        let path = format!("/v2/app/blobs/uploads/?mount={}&from=base", digest);
        let server = StubServer::start(vec![(
            path.as_str(),
            vec![
                StubResponse::new(503),
                StubResponse::new(500),
                StubResponse::new(201),
            ],
        )]);

        let pool = Arc::new(ConnectionPool::with_defaults());
        let mounter = BlobMounter::new(
            Arc::clone(&pool),
            MountConfig {
                retry_backoff: Duration::from_millis(10),
                ..Default::default()
            },
        );
        let ctx = CancellationToken::new();
        let request = MountRequest {
            digest,
            source_repository: "base".into(),
            target_repository: "app".into(),
        };
        let outcome = mounter.mount(&ctx, server.base_url(), &request).unwrap();
        assert_eq!(outcome, MountOutcome::Mounted);
        assert_eq!(server.requests().len(), 3);
    }

    #[test]
    fn test_malformed_digest_rejected_before_network() {
        let ctx = CancellationToken::new();
        let request = MountRequest {
            digest: "sha256:nope".into(),
            source_repository: "base".into(),
            target_repository: "app".into(),
        };
        let err = mounter().mount(&ctx, "http://127.0.0.1:1", &request).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[test]
    fn test_probe_needs_202_and_upload_uuid() {
        let server = StubServer::start(vec![(
            "/v2/app/blobs/uploads/",
            vec![
                StubResponse::new(202).with_header("Docker-Upload-UUID", "abc-123"),
                StubResponse::new(202),
            ],
        )]);
        let ctx = CancellationToken::new();
        let mounter = mounter();
        assert!(mounter.supports_mounting(&ctx, server.base_url(), "app").unwrap());
        // Second canned response drops the UUID header.
        assert!(!mounter.supports_mounting(&ctx, server.base_url(), "app").unwrap());
    }

    #[test]
    fn test_blob_exists_checks_content_digest() {
        let digest = digest_of(b"present");
        let path = format!("/v2/app/blobs/{}", digest);
        let server = StubServer::start(vec![(
            path.as_str(),
            vec![StubResponse::new(200).with_header("Docker-Content-Digest", &digest)],
        )]);
        let ctx = CancellationToken::new();
        assert!(mounter()
            .blob_exists(&ctx, server.base_url(), "app", &digest)
            .unwrap());
    }

    #[test]
    fn test_blob_exists_digest_mismatch_is_integrity_error() {
        let digest = digest_of(b"present");
        let other = digest_of(b"other");
        let path = format!("/v2/app/blobs/{}", digest);
        let server = StubServer::start(vec![(
            path.as_str(),
            vec![StubResponse::new(200).with_header("Docker-Content-Digest", &other)],
        )]);
        let ctx = CancellationToken::new();
        let err = mounter()
            .blob_exists(&ctx, server.base_url(), "app", &digest)
            .unwrap_err();
        assert_eq!(err.kind(), "integrity");
    }

    #[test]
    fn test_bulk_mount_aggregates_outcomes() {
        let good = digest_of(b"bulk-a");
        let missing = digest_of(b"bulk-b");
        let good_path = format!("/v2/app/blobs/uploads/?mount={}&from=base", good);
        let missing_path = format!("/v2/app/blobs/uploads/?mount={}&from=base", missing);
        let server = StubServer::start(vec![
            (good_path.as_str(), vec![StubResponse::new(201)]),
            (missing_path.as_str(), vec![StubResponse::new(404)]),
        ]);

        let ctx = CancellationToken::new();
        let requests = vec![
            MountRequest {
                digest: good,
                source_repository: "base".into(),
                target_repository: "app".into(),
            },
            MountRequest {
                digest: missing,
                source_repository: "base".into(),
                target_repository: "app".into(),
            },
        ];
        let completions = mounter().mount_all(&ctx, server.base_url(), requests);
        assert_eq!(completions.len(), 2);
        let mounted = completions
            .iter()
            .filter(|completion| {
                matches!(completion.result, Ok(MountOutcome::Mounted))
            })
            .count();
        let unmountable = completions
            .iter()
            .filter(|completion| {
                matches!(completion.result, Ok(MountOutcome::NotMountable))
            })
            .count();
        assert_eq!(mounted, 1);
        assert_eq!(unmountable, 1);
    }
}
