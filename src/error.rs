use std::path::PathBuf;
use thiserror::Error;

use crate::layout::LayoutViolations;
use crate::metadata::MetadataError;
use crate::registry::PropertyError;

pub type Result<T> = std::result::Result<T, IngestError>;

/// Everything that can go wrong while validating a batch or ingesting one object.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    LayoutInvalid(#[from] LayoutViolations),

    #[error(transparent)]
    MetadataInvalid(#[from] MetadataError),

    #[error(transparent)]
    PropertyInvalid(#[from] PropertyError),

    #[error("failed to commit version {version} of object {object_id}: {source:#}")]
    CommitFailed {
        object_id: String,
        version: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl IngestError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn infrastructure<E: std::fmt::Display>(e: E) -> Self {
        Self::Infrastructure(e.to_string())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            IngestError::LayoutInvalid(_) => ErrorCategory::Layout,
            IngestError::MetadataInvalid(_) | IngestError::PropertyInvalid(_) => {
                ErrorCategory::Validation
            }
            IngestError::CommitFailed { .. } => ErrorCategory::Commit,
            IngestError::Infrastructure(_) | IngestError::Io { .. } => {
                ErrorCategory::Infrastructure
            }
        }
    }
}

/// Coarse classification used in logs so operators know where to look.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Batch-wide pre-flight rejection; input left in place.
    Layout,
    /// Bad provenance or custom properties; see the outbox error document.
    Validation,
    /// The store refused a version.
    Commit,
    /// Disk, pool or runtime trouble; check system health.
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Layout => "layout",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Commit => "commit",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_separate_business_from_infrastructure() {
        let e = IngestError::PropertyInvalid(PropertyError::new("Unknown property per property-registry: x"));
        assert_eq!(e.category(), ErrorCategory::Validation);

        let e = IngestError::infrastructure("semaphore closed");
        assert_eq!(e.category(), ErrorCategory::Infrastructure);
        assert_eq!(e.to_string(), "infrastructure error: semaphore closed");
    }

    #[test]
    fn commit_failure_message_includes_cause() {
        let e = IngestError::CommitFailed {
            object_id: "obj-A".into(),
            version: "v2".into(),
            source: anyhow::anyhow!("disk full"),
        };
        assert_eq!(
            e.to_string(),
            "failed to commit version v2 of object obj-A: disk full"
        );
        assert_eq!(e.category(), ErrorCategory::Commit);
    }
}
