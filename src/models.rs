//! Core data types used throughout the knowledge engine.
//!
//! These types represent the chunks, index entries, search results, and
//! reports that flow through the ingestion and retrieval pipeline.

use serde::{Deserialize, Serialize};

/// A bounded, line-addressed slice of a document's text — the atomic unit
/// of indexing.
///
/// Line numbers are 1-indexed and inclusive, matching the source file.
/// The id is derived from `(document_path, start_line, end_line)` and is
/// unique within an index; re-ingesting the same path replaces all prior
/// chunks for that path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub start_line: u32,
    pub end_line: u32,
    pub document_path: String,
    /// Ingestion timestamp (Unix seconds).
    pub created_at: i64,
}

impl Chunk {
    /// Derive the stable chunk id from its source coordinates.
    pub fn make_id(document_path: &str, start_line: u32, end_line: u32) -> String {
        format!("{}:{}-{}", document_path, start_line, end_line)
    }
}

/// A chunk plus its embedding and the byte cost charged against the budget.
///
/// `embedding.len()` equals the index dimension; an index holds entries from
/// exactly one embedding model at a time. `estimated_bytes` is recorded at
/// insertion and reversed exactly on removal, never re-estimated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
    pub estimated_bytes: u64,
}

/// Per-document bookkeeping kept alongside the entries.
///
/// The content hash lets re-ingestion of an unchanged document short-circuit
/// into a no-op, and survives restarts via the index file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_path: String,
    pub content_hash: String,
    pub indexed_at: i64,
}

/// Memory pressure classification derived from budget usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPressure {
    /// Under 80% of budget.
    Healthy,
    /// 80% to under 95%.
    Warning,
    /// 95% and above; new insertions are about to be rejected.
    Critical,
}

impl MemoryPressure {
    /// Short human label, used by the status command.
    pub fn label(&self) -> &'static str {
        match self {
            MemoryPressure::Healthy => "healthy",
            MemoryPressure::Warning => "warning",
            MemoryPressure::Critical => "critical",
        }
    }
}

/// Snapshot of budget usage. Derived on demand, never stored.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStatus {
    pub used_bytes: u64,
    pub budget_bytes: u64,
    pub percent_used: f64,
    pub entry_count: usize,
    pub document_count: usize,
    pub pressure: MemoryPressure,
}

/// A ranked hybrid-search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    /// Cosine similarity in `[-1, 1]` (typically `[0, 1]` for normalized
    /// embeddings).
    pub semantic_score: f64,
    /// Normalized term-overlap score in `[0, 1]`.
    pub keyword_score: f64,
    /// `semantic_weight * semantic + keyword_weight * keyword`.
    pub combined_score: f64,
    pub chunk: Chunk,
}

/// Source attribution for one excerpt that made it into assembled context.
#[derive(Debug, Clone, Serialize)]
pub struct SourceRef {
    pub document_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub score: f64,
}

/// Context assembled for prompt augmentation.
///
/// `sources` corresponds one-to-one with the chunks whose text was appended
/// to `context_text` — never more, never fewer. Downstream UIs rely on this
/// to let a user jump to the exact text that informed a response.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedContext {
    /// All ranked hits returned by the search, highest combined score first.
    pub hits: Vec<SearchHit>,
    pub context_text: String,
    pub sources: Vec<SourceRef>,
}

impl RetrievedContext {
    /// The normal, non-error outcome for a query with no matches: the caller
    /// falls back to non-augmented behavior.
    pub fn empty() -> Self {
        Self {
            hits: Vec::new(),
            context_text: String::new(),
            sources: Vec::new(),
        }
    }
}

/// Details of a budget rejection that stopped a document partway.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetStop {
    pub used_bytes: u64,
    pub budget_bytes: u64,
    /// Byte cost of the chunk that was rejected.
    pub projected_bytes: u64,
    /// Chunks of this document that did not make it into the index.
    pub chunks_skipped: usize,
}

/// Outcome of a single `add_document` call.
///
/// Partial success is reported, not rolled back: chunks indexed before a
/// budget stop remain in the index.
#[derive(Debug, Clone, Serialize)]
pub struct AddReport {
    pub document_path: String,
    /// Chunks produced by the chunker.
    pub chunks_created: usize,
    /// Chunks actually embedded and inserted.
    pub chunks_indexed: usize,
    /// True when the document's content hash matched the indexed version
    /// and the call was a no-op.
    pub unchanged: bool,
    /// Present when the budget check stopped this document partway.
    pub budget_stop: Option<BudgetStop>,
    /// Present when a file in a batch failed (e.g. embedding error) and the
    /// batch carried on.
    pub error: Option<String>,
}

impl AddReport {
    /// True when every chunk of the document was indexed (or the document
    /// was unchanged).
    pub fn is_complete(&self) -> bool {
        self.budget_stop.is_none() && self.error.is_none()
    }
}

/// Outcome of `remove_document`. Removing an unknown path is non-fatal and
/// reports `removed: 0`.
#[derive(Debug, Clone, Serialize)]
pub struct RemoveReport {
    pub document_path: String,
    pub removed: usize,
}

/// Why a batch ingestion stopped before processing every file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStop {
    /// The memory budget was hit; the rest of the batch was not attempted.
    Budget,
    /// Cooperative cancellation was observed between files.
    Cancelled,
}

/// Per-file results for a batch ingestion, in the order attempted.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub files: Vec<AddReport>,
    pub stopped: Option<SyncStop>,
}

/// Outcome of loading the index file at startup.
#[derive(Debug, Clone)]
pub struct LoadReport {
    pub entries_loaded: usize,
    pub documents_loaded: usize,
    /// Set when the file was corrupt or incompatible and the store fell
    /// back to an empty index. The file on disk is left untouched.
    pub warning: Option<String>,
}
