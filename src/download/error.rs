use thiserror::Error;

use crate::gateway::GatewayError;
use crate::state::StateError;

/// Typed download errors enabling retry classification.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Download of {path} failed: {source}")]
    Gateway {
        path: String,
        #[source]
        source: GatewayError,
    },

    #[error("Checksum mismatch for {0}")]
    ChecksumMismatch(String),

    #[error("Size mismatch for {path}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("Asset {id} has no {size} version")]
    VersionMissing { id: String, size: &'static str },

    #[error("Disk error: {0}")]
    Disk(#[from] std::io::Error),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("{failures} download failures exceed the budget of {budget}")]
    BudgetExhausted { failures: u64, budget: u64 },
}

impl DownloadError {
    /// Whether this error is transient and worth retrying in place.
    ///
    /// Length and checksum mismatches count as transient: they come from
    /// truncated transfers, not corrupt data.
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Gateway { source, .. } => source.is_timeout(),
            DownloadError::ChecksumMismatch(_) | DownloadError::SizeMismatch { .. } => true,
            _ => false,
        }
    }

    /// The remote no longer has this asset.
    pub fn is_resource_gone(&self) -> bool {
        matches!(self, DownloadError::Gateway { source, .. } if source.is_resource_gone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(source: GatewayError) -> DownloadError {
        DownloadError::Gateway {
            path: "x".into(),
            source,
        }
    }

    #[test]
    fn test_timeouts_are_retryable() {
        assert!(gateway(GatewayError::Timeout("GET x".into())).is_retryable());
    }

    #[test]
    fn test_unexpected_status_is_not_retryable() {
        let e = gateway(GatewayError::UnexpectedStatus {
            method: reqwest::Method::GET,
            url: "x".into(),
            expected: vec![200],
            status: 500,
            body: String::new(),
        });
        assert!(!e.is_retryable());
        assert!(!e.is_resource_gone());
    }

    #[test]
    fn test_gone_is_classified_and_not_retried() {
        let e = gateway(GatewayError::ResourceGone { url: "x".into() });
        assert!(e.is_resource_gone());
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_mismatches_are_retryable() {
        assert!(DownloadError::ChecksumMismatch("x".into()).is_retryable());
        assert!(DownloadError::SizeMismatch {
            path: "x".into(),
            expected: 2,
            actual: 1
        }
        .is_retryable());
    }

    #[test]
    fn test_disk_not_retryable() {
        let e = DownloadError::Disk(std::io::Error::other("disk full"));
        assert!(!e.is_retryable());
    }
}
