//! Error types for the baking pipeline.

use std::io;
use std::path::PathBuf;

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors that can occur while acquiring and repackaging firmware.
#[derive(Debug)]
pub enum PipelineError {
    /// Network-level failure (connection dropped, timeout) during a fetch.
    Network { url: String, reason: String },

    /// Non-2xx HTTP response from a remote endpoint.
    Fetch {
        url: String,
        status: u16,
        reason: String,
    },

    /// A downloaded or packaged file did not match its expected digest.
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// A persisted ledger file exists but is not valid JSON.
    MalformedLedger { path: PathBuf, reason: String },

    /// The external archive tool exited non-zero.
    Extraction { path: PathBuf, reason: String },

    /// The external decryption tool exited non-zero.
    Decryption { path: PathBuf, reason: String },

    /// No key material was produced for an encrypted disk image.
    NoKeyFound { image: PathBuf },

    /// Failed to fetch or parse a device catalog entry.
    Catalog { model: String, reason: String },

    /// One-time installation of an external tool failed.
    ToolInstall { tool: String, reason: String },

    /// A filesystem operation failed.
    Io { path: PathBuf, source: io::Error },
}

impl PipelineError {
    /// Wrap an `io::Error` with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network { url, reason } => {
                write!(f, "network error fetching {}: {}", url, reason)
            }
            Self::Fetch {
                url,
                status,
                reason,
            } => {
                write!(f, "failed to download {}: {} {}", url, status, reason)
            }
            Self::HashMismatch {
                path,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "hash mismatch for {}: expected {}, got {}",
                    path.display(),
                    expected,
                    actual
                )
            }
            Self::MalformedLedger { path, reason } => {
                write!(f, "malformed ledger {}: {}", path.display(), reason)
            }
            Self::Extraction { path, reason } => {
                write!(f, "failed to extract {}: {}", path.display(), reason)
            }
            Self::Decryption { path, reason } => {
                write!(f, "failed to decrypt {}: {}", path.display(), reason)
            }
            Self::NoKeyFound { image } => {
                write!(f, "no key material found for {}", image.display())
            }
            Self::Catalog { model, reason } => {
                write!(f, "failed to fetch catalog for {}: {}", model, reason)
            }
            Self::ToolInstall { tool, reason } => {
                write!(f, "failed to install {}: {}", tool, reason)
            }
            Self::Io { path, source } => {
                write!(f, "I/O error on {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
