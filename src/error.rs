//! Error types for the knowledge engine.
//!
//! Library code returns [`KbError`] directly; the `kb` binary converts to
//! `anyhow::Error` at the boundary. Every variant carries enough structured
//! detail (affected path, numeric budget figures, expected vs. found
//! dimensions) for a caller to decide whether to retry, prompt the user,
//! or give up.

/// Errors that can occur in the knowledge index and retrieval pipeline.
#[derive(Debug, thiserror::Error)]
pub enum KbError {
    /// The embedding model has not finished initializing.
    #[error("embedding model is not ready")]
    ModelNotReady,

    /// The embedding backend returned a runtime error.
    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),

    /// An `embed()` call exceeded its configured timeout.
    #[error("embedding timed out after {timeout_secs}s")]
    EmbeddingTimeout { timeout_secs: u64 },

    /// Inserting an entry would push usage to or past the memory budget.
    ///
    /// Recoverable: the caller can remove documents or accept the partial
    /// indexing already performed.
    #[error(
        "memory budget exceeded for '{document_path}': \
         {used_bytes} used + {projected_bytes} projected of {budget_bytes} bytes"
    )]
    BudgetExceeded {
        document_path: String,
        used_bytes: u64,
        projected_bytes: u64,
        budget_bytes: u64,
    },

    /// The index file failed schema or per-entry validation.
    ///
    /// Fatal to the load; the caller falls back to an empty index and
    /// surfaces a warning. The file on disk is never deleted.
    #[error("index file is corrupted: {0}")]
    IndexCorrupted(String),

    /// The index file was written with a different embedding dimension
    /// than the active model produces.
    #[error("index dimension {found} does not match the active embedding model ({expected})")]
    IndexIncompatible { expected: usize, found: usize },

    /// A save is already in flight for this index path.
    #[error("a save is already in progress for this index")]
    SaveInProgress,

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, KbError>;
