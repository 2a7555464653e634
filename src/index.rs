//! In-memory vector index with hybrid (semantic + keyword) search.
//!
//! Search is a full linear scan by design at the intended scale (up to
//! ~10,000 chunks); the method signature leaves room to swap in an
//! approximate-nearest-neighbor structure later without changing callers.
//!
//! # Hybrid scoring
//!
//! For every live entry:
//!
//! 1. `semantic = cosine_similarity(query_embedding, entry.embedding)`
//! 2. `keyword = |query_tokens ∩ chunk_tokens| / max(1, |query_tokens|)`
//!    (lowercase tokens split on non-alphanumeric boundaries, both sides
//!    treated as sets)
//! 3. `combined = semantic_weight * semantic + keyword_weight * keyword`
//! 4. Drop entries with `combined < min_score`.
//! 5. Sort by combined (desc), then semantic (desc), then chunk id (asc)
//!    for deterministic ordering.
//! 6. Truncate to `top_k`.

use std::collections::{HashMap, HashSet};

use crate::embedding::cosine_similarity;
use crate::models::{DocumentRecord, IndexEntry, SearchHit};

/// Retrieval tuning parameters, caller-supplied per query.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub top_k: usize,
    /// Minimum combined score a hit must reach to be returned.
    pub min_score: f64,
    pub semantic_weight: f64,
    pub keyword_weight: f64,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_score: 0.3,
            semantic_weight: 0.7,
            keyword_weight: 0.3,
        }
    }
}

/// Chunk id → entry map plus per-document bookkeeping.
///
/// Owned exclusively by the `KnowledgeStore`; all mutation goes through it
/// under a single write lock per index instance.
#[derive(Debug)]
pub struct VectorIndex {
    dimension: usize,
    entries: HashMap<String, IndexEntry>,
    documents: HashMap<String, DocumentRecord>,
}

impl VectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            entries: HashMap::new(),
            documents: HashMap::new(),
        }
    }

    /// Embedding dimensionality this index was built for.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct `document_path` values across live entries.
    pub fn document_count(&self) -> usize {
        self.entries
            .values()
            .map(|e| e.chunk.document_path.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Insert an entry, overwriting any existing entry with the same id.
    pub fn insert(&mut self, entry: IndexEntry) {
        debug_assert_eq!(entry.embedding.len(), self.dimension);
        self.entries.insert(entry.chunk.id.clone(), entry);
    }

    /// Remove one entry by id. No-op (not an error) if absent.
    pub fn remove(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Remove every entry belonging to `document_path`, returning the ids
    /// removed so the budget monitor can reverse their exact charges.
    pub fn remove_by_document(&mut self, document_path: &str) -> Vec<String> {
        let ids: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.chunk.document_path == document_path)
            .map(|e| e.chunk.id.clone())
            .collect();
        for id in &ids {
            self.entries.remove(id);
        }
        self.documents.remove(document_path);
        ids
    }

    /// Record or refresh the per-document content hash.
    pub fn upsert_document_record(&mut self, record: DocumentRecord) {
        self.documents.insert(record.document_path.clone(), record);
    }

    /// Content hash last recorded for a fully indexed document.
    pub fn document_hash(&self, document_path: &str) -> Option<&str> {
        self.documents
            .get(document_path)
            .map(|r| r.content_hash.as_str())
    }

    pub fn entries(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.values()
    }

    pub fn document_records(&self) -> impl Iterator<Item = &DocumentRecord> {
        self.documents.values()
    }

    /// Rank all live entries against a query. See the module docs for the
    /// scoring and tie-break rules.
    pub fn hybrid_search(
        &self,
        query_text: &str,
        query_embedding: &[f32],
        opts: &SearchOptions,
    ) -> Vec<SearchHit> {
        let query_tokens = keyword_tokens(query_text);

        let mut hits: Vec<SearchHit> = self
            .entries
            .values()
            .map(|entry| {
                let semantic = cosine_similarity(query_embedding, &entry.embedding) as f64;
                let keyword = keyword_overlap(&query_tokens, &entry.chunk.text);
                let combined =
                    opts.semantic_weight * semantic + opts.keyword_weight * keyword;
                SearchHit {
                    chunk_id: entry.chunk.id.clone(),
                    semantic_score: semantic,
                    keyword_score: keyword,
                    combined_score: combined,
                    chunk: entry.chunk.clone(),
                }
            })
            .filter(|hit| hit.combined_score >= opts.min_score)
            .collect();

        hits.sort_by(|a, b| {
            b.combined_score
                .partial_cmp(&a.combined_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.semantic_score
                        .partial_cmp(&a.semantic_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });

        hits.truncate(opts.top_k);
        hits
    }
}

/// Lowercase tokens split on non-alphanumeric boundaries, deduplicated.
pub(crate) fn keyword_tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

fn keyword_overlap(query_tokens: &HashSet<String>, chunk_text: &str) -> f64 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let chunk_tokens = keyword_tokens(chunk_text);
    let overlap = query_tokens
        .iter()
        .filter(|t| chunk_tokens.contains(*t))
        .count();
    overlap as f64 / query_tokens.len().max(1) as f64
}
