//! Knowledge store orchestration.
//!
//! [`KnowledgeStore`] composes the chunker, embedding provider, budget
//! monitor, vector index, and persistence behind one API: add, remove,
//! search, status, save, load. It owns the [`VectorIndex`] exclusively —
//! no other component holds a reference to it — and runs every mutation
//! under a single write lock per index instance, so two concurrent
//! ingestions can never both pass a budget check before either records
//! its charge.
//!
//! # Lifecycle
//!
//! `Uninitialized → Initializing (model loading + index load) → Ready`.
//! Only `load_index` and status queries are valid before `Ready`; other
//! operations fail with `ModelNotReady`.
//!
//! # Ingestion flow
//!
//! ```text
//! add_document → chunker → per chunk: embed (no lock held)
//!              → write lock: budget.can_add → index.insert → budget.record
//! ```
//!
//! Within one call chunks are inserted in order, so an interrupted
//! document keeps its earliest chunks. A budget rejection stops the rest
//! of that document; what was already inserted stays (partial success is
//! reported, not rolled back).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::budget::{estimate_entry_bytes, MemoryBudgetMonitor};
use crate::chunk::chunk_lines;
use crate::config::Config;
use crate::embedding::{embed_with_timeout, EmbeddingProvider};
use crate::error::{KbError, Result};
use crate::index::{SearchOptions, VectorIndex};
use crate::models::{
    AddReport, BudgetStop, DocumentRecord, IndexEntry, LoadReport, MemoryStatus, RemoveReport,
    SearchHit, SyncReport, SyncStop,
};
use crate::persist::{IndexFile, IndexPersistence, INDEX_FORMAT_VERSION};
use crate::progress::{ProgressEvent, ProgressReporter};

/// Store lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Uninitialized,
    Initializing,
    Ready,
}

/// Cooperative cancellation for batch ingestion.
///
/// Checked between files, never mid-chunk: an in-flight embedding call is
/// allowed to complete before cancellation takes effect.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct Inner {
    state: StoreState,
    index: VectorIndex,
    budget: MemoryBudgetMonitor,
    created_at: i64,
}

/// Orchestrates the indexing and retrieval pipeline for one project index.
pub struct KnowledgeStore {
    provider: Arc<dyn EmbeddingProvider>,
    persistence: Arc<IndexPersistence>,
    inner: RwLock<Inner>,
    chunk_size_tokens: usize,
    overlap_tokens: usize,
    embed_timeout: Duration,
}

impl KnowledgeStore {
    pub fn new(config: &Config, provider: Arc<dyn EmbeddingProvider>) -> Self {
        let dims = provider.dims();
        Self {
            persistence: Arc::new(IndexPersistence::new(config.index.path.clone())),
            inner: RwLock::new(Inner {
                state: StoreState::Uninitialized,
                index: VectorIndex::new(dims),
                budget: MemoryBudgetMonitor::new(config.index.memory_budget_bytes()),
                created_at: Utc::now().timestamp(),
            }),
            chunk_size_tokens: config.chunking.chunk_size_tokens,
            overlap_tokens: config.chunking.overlap_tokens,
            embed_timeout: Duration::from_secs(config.embedding.timeout_secs),
            provider,
        }
    }

    /// Load the embedding model and the persisted index, then transition
    /// to `Ready`.
    ///
    /// A corrupt or incompatible index file is reported through
    /// [`LoadReport::warning`] and the store starts empty; the file on
    /// disk is never deleted.
    pub async fn initialize(&self) -> Result<LoadReport> {
        self.inner.write().await.state = StoreState::Initializing;

        self.provider.initialize().await?;
        let report = self.load_index().await?;

        self.inner.write().await.state = StoreState::Ready;
        Ok(report)
    }

    pub async fn state(&self) -> StoreState {
        self.inner.read().await.state
    }

    /// Rebuild the in-memory index from the persisted file.
    ///
    /// Valid in any lifecycle state. Budget accounting is reconstructed by
    /// summing each entry's `estimated_bytes` as recorded at save time,
    /// preserving historical accounting exactly.
    pub async fn load_index(&self) -> Result<LoadReport> {
        let persistence = Arc::clone(&self.persistence);
        let dims = self.provider.dims();
        let loaded = tokio::task::spawn_blocking(move || persistence.load(dims))
            .await
            .map_err(|e| KbError::Io(std::io::Error::other(e.to_string())))?;

        match loaded {
            Ok(Some(file)) => {
                let mut index = VectorIndex::new(dims);
                let mut inner = self.inner.write().await;
                let mut budget = MemoryBudgetMonitor::new(inner.budget.budget_bytes());
                for entry in file.entries {
                    budget.record_addition(&entry.chunk.id, entry.estimated_bytes);
                    index.insert(entry);
                }
                let documents_loaded = file.documents.len();
                for record in file.documents {
                    index.upsert_document_record(record);
                }
                let entries_loaded = index.len();
                inner.index = index;
                inner.budget = budget;
                inner.created_at = file.created_at;
                Ok(LoadReport {
                    entries_loaded,
                    documents_loaded,
                    warning: None,
                })
            }
            Ok(None) => Ok(LoadReport {
                entries_loaded: 0,
                documents_loaded: 0,
                warning: None,
            }),
            Err(err @ (KbError::IndexCorrupted(_) | KbError::IndexIncompatible { .. })) => {
                Ok(LoadReport {
                    entries_loaded: 0,
                    documents_loaded: 0,
                    warning: Some(err.to_string()),
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Atomically persist the current index to the configured path.
    ///
    /// Fails fast with [`KbError::SaveInProgress`] if another save is in
    /// flight. A failed save leaves the in-memory index fully usable.
    pub async fn save_index(&self) -> Result<()> {
        self.ensure_ready().await?;

        let file = {
            let inner = self.inner.read().await;
            let mut entries: Vec<IndexEntry> = inner.index.entries().cloned().collect();
            entries.sort_by(|a, b| a.chunk.id.cmp(&b.chunk.id));
            let mut documents: Vec<DocumentRecord> =
                inner.index.document_records().cloned().collect();
            documents.sort_by(|a, b| a.document_path.cmp(&b.document_path));
            IndexFile {
                version: INDEX_FORMAT_VERSION,
                model_name: self.provider.model_name().to_string(),
                dimension: self.provider.dims(),
                created_at: inner.created_at,
                modified_at: Utc::now().timestamp(),
                document_count: inner.index.document_count(),
                total_entries: entries.len(),
                documents,
                entries,
            }
        };

        let persistence = Arc::clone(&self.persistence);
        tokio::task::spawn_blocking(move || persistence.save(&file))
            .await
            .map_err(|e| KbError::Io(std::io::Error::other(e.to_string())))?
    }

    /// Chunk, embed, and index one document, replacing any previous
    /// version of the same path.
    ///
    /// Returns a report rather than an error for budget stops: chunks
    /// indexed before the stop remain in place. Embedding failures abort
    /// this document's remaining chunks only.
    pub async fn add_document(&self, document_path: &str, raw_text: &str) -> Result<AddReport> {
        self.ensure_ready().await?;
        self.add_document_inner(document_path, raw_text, None).await
    }

    async fn add_document_inner(
        &self,
        document_path: &str,
        raw_text: &str,
        progress: Option<(&dyn ProgressReporter, u64, u64)>,
    ) -> Result<AddReport> {
        let content_hash = hash_content(raw_text);

        {
            let inner = self.inner.read().await;
            if inner.index.document_hash(document_path) == Some(content_hash.as_str()) {
                return Ok(AddReport {
                    document_path: document_path.to_string(),
                    chunks_created: 0,
                    chunks_indexed: 0,
                    unchanged: true,
                    budget_stop: None,
                    error: None,
                });
            }
        }

        if let Some((reporter, current, total)) = progress {
            reporter.report(ProgressEvent::Chunking {
                current,
                total,
                file: document_path.to_string(),
            });
        }

        let chunks = chunk_lines(
            document_path,
            raw_text,
            self.chunk_size_tokens,
            self.overlap_tokens,
        );
        let chunks_created = chunks.len();

        // Full replacement, no partial edits: old entries out first.
        {
            let mut inner = self.inner.write().await;
            let removed = inner.index.remove_by_document(document_path);
            for id in &removed {
                inner.budget.record_removal(id);
            }
        }

        if let Some((reporter, current, total)) = progress {
            reporter.report(ProgressEvent::Embedding {
                current,
                total,
                file: document_path.to_string(),
            });
        }

        let dims = self.provider.dims();
        let mut chunks_indexed = 0usize;
        let mut budget_stop = None;

        for (i, chunk) in chunks.into_iter().enumerate() {
            // Embedding runs without the lock; the check-then-act triple
            // below holds it so concurrent ingestions cannot jointly
            // overshoot the budget.
            let embedding =
                embed_with_timeout(self.provider.as_ref(), &chunk.text, self.embed_timeout)
                    .await?;
            let projected = estimate_entry_bytes(&chunk, dims);

            let mut inner = self.inner.write().await;
            let check = inner.budget.can_add(document_path, projected);
            if !check.allowed {
                budget_stop = Some(BudgetStop {
                    used_bytes: inner.budget.current_bytes(),
                    budget_bytes: inner.budget.budget_bytes(),
                    projected_bytes: projected,
                    chunks_skipped: chunks_created - i,
                });
                break;
            }

            inner.budget.record_addition(&chunk.id, projected);
            inner.index.insert(IndexEntry {
                chunk,
                embedding,
                estimated_bytes: projected,
            });
            chunks_indexed += 1;
        }

        if budget_stop.is_none() {
            // Only a fully indexed document earns the unchanged-skip hash.
            let mut inner = self.inner.write().await;
            inner.index.upsert_document_record(DocumentRecord {
                document_path: document_path.to_string(),
                content_hash,
                indexed_at: Utc::now().timestamp(),
            });
        }

        Ok(AddReport {
            document_path: document_path.to_string(),
            chunks_created,
            chunks_indexed,
            unchanged: false,
            budget_stop,
            error: None,
        })
    }

    /// Ingest a batch of `(path, body)` items in order.
    ///
    /// The whole batch stops at the first budget rejection (per-file
    /// results cover everything attempted so far) and cancellation is
    /// honored between files. A file that fails to embed is recorded and
    /// the batch carries on.
    pub async fn add_documents(
        &self,
        items: &[(String, String)],
        cancel: &CancelFlag,
        reporter: &dyn ProgressReporter,
    ) -> Result<SyncReport> {
        self.ensure_ready().await?;

        let total = items.len() as u64;
        let mut files = Vec::new();
        let mut stopped = None;

        for (i, (path, text)) in items.iter().enumerate() {
            if cancel.is_cancelled() {
                stopped = Some(SyncStop::Cancelled);
                break;
            }

            let progress = Some((reporter, (i + 1) as u64, total));
            match self.add_document_inner(path, text, progress).await {
                Ok(report) => {
                    let hit_budget = report.budget_stop.is_some();
                    files.push(report);
                    if hit_budget {
                        stopped = Some(SyncStop::Budget);
                        break;
                    }
                }
                Err(err) => {
                    files.push(AddReport {
                        document_path: path.clone(),
                        chunks_created: 0,
                        chunks_indexed: 0,
                        unchanged: false,
                        budget_stop: None,
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        reporter.report(ProgressEvent::Done { total });
        Ok(SyncReport { files, stopped })
    }

    /// Remove every chunk of a document. Unknown paths are non-fatal and
    /// report `removed: 0`.
    pub async fn remove_document(&self, document_path: &str) -> Result<RemoveReport> {
        self.ensure_ready().await?;

        let mut inner = self.inner.write().await;
        let removed = inner.index.remove_by_document(document_path);
        for id in &removed {
            inner.budget.record_removal(id);
        }
        Ok(RemoveReport {
            document_path: document_path.to_string(),
            removed: removed.len(),
        })
    }

    /// Embed the query and rank all live entries.
    pub async fn search(&self, query: &str, opts: &SearchOptions) -> Result<Vec<SearchHit>> {
        self.ensure_ready().await?;

        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let query_embedding =
            embed_with_timeout(self.provider.as_ref(), query, self.embed_timeout).await?;

        let inner = self.inner.read().await;
        Ok(inner.index.hybrid_search(query, &query_embedding, opts))
    }

    /// Current budget usage snapshot. Valid in any lifecycle state.
    pub async fn memory_status(&self) -> MemoryStatus {
        let inner = self.inner.read().await;
        inner.budget.status(inner.index.document_count())
    }

    async fn ensure_ready(&self) -> Result<()> {
        match self.inner.read().await.state {
            StoreState::Ready => Ok(()),
            _ => Err(KbError::ModelNotReady),
        }
    }
}

fn hash_content(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkingConfig, IndexConfig};
    use crate::embedding::HashProvider;
    use crate::progress::NoProgress;
    use tempfile::TempDir;

    fn test_config(tmp: &TempDir, budget_mb: u64, chunk_size: usize) -> Config {
        Config {
            index: IndexConfig {
                path: tmp.path().join("index.json"),
                memory_budget_mb: budget_mb,
            },
            chunking: ChunkingConfig {
                chunk_size_tokens: chunk_size,
                overlap_tokens: chunk_size / 10,
            },
            retrieval: Default::default(),
            embedding: Default::default(),
            sources: Default::default(),
        }
    }

    fn store_with_budget_bytes(tmp: &TempDir, budget_bytes: u64, chunk_size: usize) -> KnowledgeStore {
        let config = test_config(tmp, 1, chunk_size);
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(HashProvider::new(16));
        let mut store = KnowledgeStore::new(&config, provider);
        store.inner = RwLock::new(Inner {
            state: StoreState::Uninitialized,
            index: VectorIndex::new(16),
            budget: MemoryBudgetMonitor::new(budget_bytes),
            created_at: Utc::now().timestamp(),
        });
        store
    }

    fn store_in(tmp: &TempDir) -> KnowledgeStore {
        let config = test_config(tmp, 10, 500);
        KnowledgeStore::new(&config, Arc::new(HashProvider::new(16)))
    }

    fn long_document(lines: usize) -> String {
        (1..=lines)
            .map(|i| format!("line {} about budget enforcement and retrieval", i))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[tokio::test]
    async fn operations_require_ready_state() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);

        assert_eq!(store.state().await, StoreState::Uninitialized);
        assert!(matches!(
            store.add_document("a.md", "text").await,
            Err(KbError::ModelNotReady)
        ));
        assert!(matches!(
            store.search("query", &SearchOptions::default()).await,
            Err(KbError::ModelNotReady)
        ));

        // Status queries are valid before Ready.
        assert_eq!(store.memory_status().await.entry_count, 0);

        store.initialize().await.unwrap();
        assert_eq!(store.state().await, StoreState::Ready);
        store.add_document("a.md", "text").await.unwrap();
    }

    #[tokio::test]
    async fn long_document_chunks_and_usage_returns_after_remove() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        store.initialize().await.unwrap();

        store
            .add_document("small.md", "a small anchor document")
            .await
            .unwrap();
        let before = store.memory_status().await;

        let report = store
            .add_document("big.md", &long_document(1200))
            .await
            .unwrap();
        assert!(report.chunks_created >= 2);
        assert_eq!(report.chunks_indexed, report.chunks_created);

        let during = store.memory_status().await;
        assert_eq!(during.document_count, 2);
        assert!(during.used_bytes > before.used_bytes);

        let removed = store.remove_document("big.md").await.unwrap();
        assert_eq!(removed.removed, report.chunks_created);

        let after = store.memory_status().await;
        assert_eq!(after.used_bytes, before.used_bytes);
        assert_eq!(after.document_count, 1);
    }

    #[tokio::test]
    async fn removing_unknown_path_is_nonfatal() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        store.initialize().await.unwrap();

        let report = store.remove_document("ghost.md").await.unwrap();
        assert_eq!(report.removed, 0);
    }

    #[tokio::test]
    async fn budget_stop_keeps_earlier_chunks() {
        let tmp = TempDir::new().unwrap();
        let store = store_with_budget_bytes(&tmp, 1_000, 20);
        store.initialize().await.unwrap();

        let report = store
            .add_document("doc.md", &long_document(30))
            .await
            .unwrap();

        assert!(report.chunks_created > report.chunks_indexed);
        assert!(report.chunks_indexed > 0, "earlier chunks must survive");
        let stop = report.budget_stop.expect("budget stop must be reported");
        assert_eq!(
            stop.chunks_skipped,
            report.chunks_created - report.chunks_indexed
        );
        assert!(stop.used_bytes + stop.projected_bytes >= stop.budget_bytes);

        let status = store.memory_status().await;
        assert_eq!(status.entry_count, report.chunks_indexed);
        assert!(status.used_bytes < status.budget_bytes);
    }

    #[tokio::test]
    async fn budget_accounting_matches_ledger_across_operations() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        store.initialize().await.unwrap();

        store.add_document("a.md", &long_document(100)).await.unwrap();
        store.add_document("b.md", &long_document(50)).await.unwrap();
        store.remove_document("a.md").await.unwrap();
        store.add_document("c.md", &long_document(25)).await.unwrap();

        let status = store.memory_status().await;
        let inner = store.inner.read().await;
        let entry_sum: u64 = inner.index.entries().map(|e| e.estimated_bytes).sum();
        assert_eq!(status.used_bytes, entry_sum);
        assert_eq!(status.entry_count, inner.index.len());
    }

    #[tokio::test]
    async fn unchanged_document_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        store.initialize().await.unwrap();

        let first = store.add_document("a.md", "same content").await.unwrap();
        assert!(!first.unchanged);
        assert!(first.chunks_indexed > 0);

        let second = store.add_document("a.md", "same content").await.unwrap();
        assert!(second.unchanged);
        assert_eq!(second.chunks_indexed, 0);

        let third = store.add_document("a.md", "different content").await.unwrap();
        assert!(!third.unchanged);
    }

    #[tokio::test]
    async fn reingest_replaces_rather_than_duplicates() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        store.initialize().await.unwrap();

        store.add_document("a.md", &long_document(100)).await.unwrap();
        let first = store.memory_status().await;

        store.add_document("a.md", &long_document(40)).await.unwrap();
        let second = store.memory_status().await;

        assert_eq!(second.document_count, 1);
        assert!(second.used_bytes < first.used_bytes);
    }

    #[tokio::test]
    async fn save_then_load_preserves_search_and_usage() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        store.initialize().await.unwrap();

        store
            .add_document("rust.md", "rust ownership and borrowing rules")
            .await
            .unwrap();
        store
            .add_document("py.md", "python garbage collection details")
            .await
            .unwrap();

        let opts = SearchOptions {
            min_score: 0.0,
            ..SearchOptions::default()
        };
        let hits_before = store.search("rust ownership", &opts).await.unwrap();
        let usage_before = store.memory_status().await.used_bytes;

        store.save_index().await.unwrap();

        let reloaded = store_in(&tmp);
        let report = reloaded.initialize().await.unwrap();
        assert!(report.warning.is_none());
        assert_eq!(report.entries_loaded, 2);

        let hits_after = reloaded.search("rust ownership", &opts).await.unwrap();
        assert_eq!(hits_before.len(), hits_after.len());
        for (a, b) in hits_before.iter().zip(hits_after.iter()) {
            assert_eq!(a.chunk_id, b.chunk_id);
            assert_eq!(a.semantic_score, b.semantic_score);
            assert_eq!(a.keyword_score, b.keyword_score);
            assert_eq!(a.combined_score, b.combined_score);
        }
        assert_eq!(reloaded.memory_status().await.used_bytes, usage_before);
    }

    #[tokio::test]
    async fn corrupt_index_file_falls_back_to_empty() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("index.json"), "{ not json").unwrap();

        let store = store_in(&tmp);
        let report = store.initialize().await.unwrap();
        assert!(report.warning.is_some());
        assert_eq!(report.entries_loaded, 0);
        assert_eq!(store.state().await, StoreState::Ready);

        // The corrupt file was not deleted.
        assert!(tmp.path().join("index.json").exists());

        // The store is usable and the next save repairs the file.
        store.add_document("a.md", "fresh content").await.unwrap();
        store.save_index().await.unwrap();
        let reloaded = store_in(&tmp);
        assert!(reloaded.initialize().await.unwrap().warning.is_none());
    }

    #[tokio::test]
    async fn batch_stops_at_budget_and_reports_attempted_files() {
        let tmp = TempDir::new().unwrap();
        let store = store_with_budget_bytes(&tmp, 2_000, 20);
        store.initialize().await.unwrap();

        let items: Vec<(String, String)> = (1..=5)
            .map(|i| (format!("doc{}.md", i), long_document(30)))
            .collect();

        let report = store
            .add_documents(&items, &CancelFlag::new(), &NoProgress)
            .await
            .unwrap();

        assert_eq!(report.stopped, Some(SyncStop::Budget));
        assert!(report.files.len() < items.len());
        let last = report.files.last().unwrap();
        assert!(last.budget_stop.is_some());
        // Files are attempted in the order provided.
        for (i, file) in report.files.iter().enumerate() {
            assert_eq!(file.document_path, format!("doc{}.md", i + 1));
        }
    }

    #[tokio::test]
    async fn cancellation_is_checked_between_files() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        store.initialize().await.unwrap();

        let cancel = CancelFlag::new();
        cancel.cancel();

        let items = vec![("a.md".to_string(), "content".to_string())];
        let report = store
            .add_documents(&items, &cancel, &NoProgress)
            .await
            .unwrap();

        assert_eq!(report.stopped, Some(SyncStop::Cancelled));
        assert!(report.files.is_empty());
        assert_eq!(store.memory_status().await.entry_count, 0);
    }

    #[tokio::test]
    async fn blank_query_returns_no_hits() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        store.initialize().await.unwrap();
        store.add_document("a.md", "some content").await.unwrap();

        let hits = store
            .search("   ", &SearchOptions::default())
            .await
            .unwrap();
        assert!(hits.is_empty());
    }
}
