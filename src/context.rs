//! Token-bounded context assembly with source attribution.
//!
//! Turns a query into a prompt-ready context block: search the store,
//! then append ranked chunks (each under a separator header naming its
//! file and line range) until the token budget would be exceeded. A chunk
//! is never truncated mid-text — the first chunk that does not fit ends
//! assembly.
//!
//! The `sources` list of the result corresponds one-to-one with the
//! chunks that were appended. Zero search hits is a normal outcome: the
//! caller gets an empty context and falls back to non-augmented behavior.

use crate::chunk::estimate_tokens;
use crate::error::Result;
use crate::index::SearchOptions;
use crate::models::{RetrievedContext, SourceRef};
use crate::store::KnowledgeStore;

/// Tuning for one retrieval call.
#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Budget for the assembled context, in estimated tokens (headers
    /// included).
    pub max_context_tokens: usize,
    pub search: SearchOptions,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            max_context_tokens: 4000,
            search: SearchOptions::default(),
        }
    }
}

/// Retrieve and assemble context for a query.
pub async fn retrieve_context(
    store: &KnowledgeStore,
    query: &str,
    opts: &ContextOptions,
) -> Result<RetrievedContext> {
    let hits = store.search(query, &opts.search).await?;
    if hits.is_empty() {
        return Ok(RetrievedContext::empty());
    }

    let mut context_text = String::new();
    let mut sources = Vec::new();
    let mut used_tokens = 0usize;

    for hit in &hits {
        let header = format!(
            "--- {} (lines {}-{}) ---\n",
            hit.chunk.document_path, hit.chunk.start_line, hit.chunk.end_line
        );
        let cost = estimate_tokens(&header) + estimate_tokens(&hit.chunk.text);
        if used_tokens + cost > opts.max_context_tokens {
            break;
        }
        used_tokens += cost;

        context_text.push_str(&header);
        context_text.push_str(&hit.chunk.text);
        context_text.push_str("\n\n");

        sources.push(SourceRef {
            document_path: hit.chunk.document_path.clone(),
            start_line: hit.chunk.start_line,
            end_line: hit.chunk.end_line,
            score: hit.combined_score,
        });
    }

    Ok(RetrievedContext {
        hits,
        context_text,
        sources,
    })
}
