//! Error taxonomy for the answer pipeline.
//!
//! Library components return [`RagError`]; the CLI layers `anyhow` context
//! on top. Generation and judge-parsing failures never surface here: the
//! generator degrades to sentinel strings and the validator to failing
//! scores.

use std::path::PathBuf;

/// Errors raised by the index, template store, and orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    /// Fatal setup problem: missing embedder, empty template store, bad config.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The corpus produced no chunks to index.
    #[error("no documents to index")]
    NoDocuments,

    /// Embedding width differs from what the index expects.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A corpus file or item could not be loaded.
    #[error("ingestion failed for {}: {reason}", path.display())]
    Ingestion { path: PathBuf, reason: String },

    /// Index or template state could not be written or read back.
    #[error("persistence failed: {0}")]
    Persistence(String),

    /// The embedding backend failed.
    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RagError {
    /// Whether startup must abort on this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RagError::Configuration(_) | RagError::DimensionMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(RagError::Configuration("x".into()).is_fatal());
        assert!(RagError::DimensionMismatch {
            expected: 384,
            actual: 768
        }
        .is_fatal());
        assert!(!RagError::NoDocuments.is_fatal());
        assert!(!RagError::Persistence("disk full".into()).is_fatal());
    }

    #[test]
    fn test_display_includes_path() {
        let err = RagError::Ingestion {
            path: PathBuf::from("docs/a.json"),
            reason: "missing text".into(),
        };
        assert_eq!(
            err.to_string(),
            "ingestion failed for docs/a.json: missing text"
        );
    }
}
