//! Structured error types for transfer operations.
//! Every layer wraps lower-level failures with the operation it was performing
//! plus the identifier it was working on (digest, URL, repository).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Main error type for gantry operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransferError {
    /// Malformed input: bad digest, empty handle, unknown format, bad header
    InvalidInput {
        operation: String,
        detail: String,
    },
    /// Content hash or size did not match what was declared
    Integrity {
        operation: String,
        expected: String,
        actual: String,
    },
    /// Network/HTTP errors
    Network {
        operation: String,
        url: Option<String>,
        status: Option<u16>,
        source: String,
    },
    /// Local I/O errors (reader, writer, pipe endpoints)
    Io {
        operation: String,
        context: Option<String>,
        source: String,
    },
    /// Registry-level failures tied to a repository or blob
    Registry {
        operation: String,
        repository: Option<String>,
        digest: Option<String>,
        source: String,
    },
    /// Buffer or pool resource exhaustion
    Resource {
        operation: String,
        detail: String,
    },
    /// Feature not wired for this path
    Unsupported {
        operation: String,
        detail: String,
    },
    /// The ambient cancellation token fired
    Cancelled {
        operation: String,
    },
    /// A per-request or per-layer deadline fired
    Timeout {
        operation: String,
        elapsed_ms: Option<u64>,
        limit_ms: Option<u64>,
    },
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::InvalidInput { operation, detail } => {
                write!(f, "Invalid input in {}: {}", operation, detail)
            }
            TransferError::Integrity { operation, expected, actual } => {
                write!(
                    f,
                    "Integrity error in {}: expected {}, got {}",
                    operation, expected, actual
                )
            }
            TransferError::Network { operation, url, status, source } => {
                write!(f, "Network error in {}: {}", operation, source)?;
                if let Some(url) = url {
                    write!(f, " (url: {})", url)?;
                }
                if let Some(status) = status {
                    write!(f, " (status: {})", status)?;
                }
                Ok(())
            }
            TransferError::Io { operation, context, source } => {
                write!(f, "I/O error in {}: {}", operation, source)?;
                if let Some(context) = context {
                    write!(f, " ({})", context)?;
                }
                Ok(())
            }
            TransferError::Registry { operation, repository, digest, source } => {
                write!(f, "Registry error in {}: {}", operation, source)?;
                if let Some(repository) = repository {
                    write!(f, " (repository: {})", repository)?;
                }
                if let Some(digest) = digest {
                    write!(f, " (digest: {})", digest)?;
                }
                Ok(())
            }
            TransferError::Resource { operation, detail } => {
                write!(f, "Resource error in {}: {}", operation, detail)
            }
            TransferError::Unsupported { operation, detail } => {
                write!(f, "Unsupported operation {}: {}", operation, detail)
            }
            TransferError::Cancelled { operation } => {
                write!(f, "Operation {} cancelled", operation)
            }
            TransferError::Timeout { operation, elapsed_ms, limit_ms } => {
                write!(f, "Timeout in {}", operation)?;
                if let Some(elapsed) = elapsed_ms {
                    write!(f, " (elapsed: {}ms)", elapsed)?;
                }
                if let Some(limit) = limit_ms {
                    write!(f, " (limit: {}ms)", limit)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for TransferError {}

impl TransferError {
    /// Whether the retry envelope should attempt this error again.
    /// Connection-level failures, 5xx, 429 and request timeouts are transient;
    /// integrity, invalid input and cancellation never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Network { status, .. } => match status {
                Some(code) => *code >= 500 || *code == 429,
                None => true,
            },
            TransferError::Io { .. } => true,
            TransferError::Timeout { .. } => true,
            TransferError::Registry { .. } => true,
            TransferError::InvalidInput { .. }
            | TransferError::Integrity { .. }
            | TransferError::Resource { .. }
            | TransferError::Unsupported { .. }
            | TransferError::Cancelled { .. } => false,
        }
    }

    /// Whether this error came from the ambient cancellation token.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, TransferError::Cancelled { .. })
    }

    /// Short stable name for classification in logs and stats.
    pub fn kind(&self) -> &'static str {
        match self {
            TransferError::InvalidInput { .. } => "invalid_input",
            TransferError::Integrity { .. } => "integrity",
            TransferError::Network { .. } => "network",
            TransferError::Io { .. } => "io",
            TransferError::Registry { .. } => "registry",
            TransferError::Resource { .. } => "resource",
            TransferError::Unsupported { .. } => "unsupported",
            TransferError::Cancelled { .. } => "cancelled",
            TransferError::Timeout { .. } => "timeout",
        }
    }
}

/// Utility constructors for common error patterns
pub mod utils {
    use super::*;

    pub fn invalid_input(operation: &str, detail: &str) -> TransferError {
        TransferError::InvalidInput {
            operation: operation.to_string(),
            detail: detail.to_string(),
        }
    }

    pub fn integrity_error(operation: &str, expected: &str, actual: &str) -> TransferError {
        TransferError::Integrity {
            operation: operation.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub fn network_error(operation: &str, url: Option<&str>, source: String) -> TransferError {
        TransferError::Network {
            operation: operation.to_string(),
            url: url.map(String::from),
            status: None,
            source,
        }
    }

    pub fn network_error_with_status(
        operation: &str,
        url: Option<&str>,
        status: u16,
        source: &str,
    ) -> TransferError {
        TransferError::Network {
            operation: operation.to_string(),
            url: url.map(String::from),
            status: Some(status),
            source: source.to_string(),
        }
    }

    /// Convert std::io::Error to TransferError
    pub fn io_error(operation: &str, context: Option<&str>, source: std::io::Error) -> TransferError {
        TransferError::Io {
            operation: operation.to_string(),
            context: context.map(String::from),
            source: source.to_string(),
        }
    }

    pub fn registry_error(
        operation: &str,
        repository: Option<&str>,
        digest: Option<&str>,
        source: &str,
    ) -> TransferError {
        TransferError::Registry {
            operation: operation.to_string(),
            repository: repository.map(String::from),
            digest: digest.map(String::from),
            source: source.to_string(),
        }
    }

    pub fn resource_error(operation: &str, detail: &str) -> TransferError {
        TransferError::Resource {
            operation: operation.to_string(),
            detail: detail.to_string(),
        }
    }

    pub fn unsupported(operation: &str, detail: &str) -> TransferError {
        TransferError::Unsupported {
            operation: operation.to_string(),
            detail: detail.to_string(),
        }
    }

    pub fn cancelled(operation: &str) -> TransferError {
        TransferError::Cancelled {
            operation: operation.to_string(),
        }
    }

    pub fn timeout_error(operation: &str, elapsed_ms: u64, limit_ms: u64) -> TransferError {
        TransferError::Timeout {
            operation: operation.to_string(),
            elapsed_ms: Some(elapsed_ms),
            limit_ms: Some(limit_ms),
        }
    }
}
