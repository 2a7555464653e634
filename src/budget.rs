//! Memory budget accounting and pre-insertion enforcement.
//!
//! The engine never polls the OS for live memory usage: every indexed entry
//! is charged a deterministic byte estimate, and the check-then-act sequence
//! runs before any mutation is allowed to proceed. Removal reverses the
//! exact charge recorded at insertion so the ledger never drifts.
//!
//! # Estimation formula
//!
//! ```text
//! projected = embedding_bytes (dims * 4)
//!           + metadata_bytes  (UTF-8 length of the JSON-encoded chunk metadata)
//!           + content_bytes   (UTF-8 length of the chunk text * 2,
//!                              accounting for in-memory UTF-16-equivalent overhead)
//! ```

use std::collections::HashMap;

use crate::error::KbError;
use crate::models::{Chunk, MemoryPressure, MemoryStatus};

/// Usage ratio at which a non-fatal warning is attached to budget checks.
const WARNING_RATIO: f64 = 0.80;

/// Result of a pre-insertion budget check.
#[derive(Debug)]
pub struct BudgetCheck {
    pub allowed: bool,
    /// `(current + projected) / budget`, as a percentage.
    pub projected_percent: f64,
    /// Non-fatal: the projected ratio is at or past 80%.
    pub warning: bool,
    /// [`KbError::BudgetExceeded`] when the check failed.
    pub reason: Option<KbError>,
}

/// Estimate the byte cost an entry for this chunk would be charged.
///
/// The metadata term serializes every chunk field except the text, which is
/// accounted separately.
pub fn estimate_entry_bytes(chunk: &Chunk, dims: usize) -> u64 {
    let embedding_bytes = (dims * 4) as u64;
    let metadata = serde_json::json!({
        "id": chunk.id,
        "document_path": chunk.document_path,
        "start_line": chunk.start_line,
        "end_line": chunk.end_line,
        "created_at": chunk.created_at,
    });
    let metadata_bytes = metadata.to_string().len() as u64;
    let content_bytes = (chunk.text.len() * 2) as u64;
    embedding_bytes + metadata_bytes + content_bytes
}

/// Tracks estimated byte cost of every indexed entry against a hard ceiling.
///
/// `current_bytes` is always exactly the sum of the per-id charges; callers
/// pair [`can_add`](Self::can_add) and [`record_addition`](Self::record_addition)
/// under the index's write lock so two concurrent insertions cannot both
/// pass a check before either records its charge.
#[derive(Debug)]
pub struct MemoryBudgetMonitor {
    budget_bytes: u64,
    current_bytes: u64,
    charges: HashMap<String, u64>,
}

impl MemoryBudgetMonitor {
    pub fn new(budget_bytes: u64) -> Self {
        Self {
            budget_bytes,
            current_bytes: 0,
            charges: HashMap::new(),
        }
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    pub fn current_bytes(&self) -> u64 {
        self.current_bytes
    }

    /// Check whether an addition of `projected_bytes` may proceed.
    ///
    /// Allowed iff `(current + projected) / budget < 1.0`.
    pub fn can_add(&self, document_path: &str, projected_bytes: u64) -> BudgetCheck {
        let ratio = (self.current_bytes + projected_bytes) as f64 / self.budget_bytes.max(1) as f64;
        let allowed = ratio < 1.0;
        BudgetCheck {
            allowed,
            projected_percent: ratio * 100.0,
            warning: ratio >= WARNING_RATIO,
            reason: if allowed {
                None
            } else {
                Some(KbError::BudgetExceeded {
                    document_path: document_path.to_string(),
                    used_bytes: self.current_bytes,
                    projected_bytes,
                    budget_bytes: self.budget_bytes,
                })
            },
        }
    }

    /// Record the charge for a newly inserted entry.
    ///
    /// Replacing an id first reverses its previous charge, keeping the
    /// ledger-sum invariant intact.
    pub fn record_addition(&mut self, id: &str, bytes: u64) {
        if let Some(old) = self.charges.insert(id.to_string(), bytes) {
            self.current_bytes -= old;
        }
        self.current_bytes += bytes;
    }

    /// Reverse the exact charge recorded at insertion. No-op for unknown ids.
    pub fn record_removal(&mut self, id: &str) {
        if let Some(bytes) = self.charges.remove(id) {
            self.current_bytes -= bytes;
        }
    }

    /// Derive the current status snapshot. `document_count` comes from the
    /// index, which owns document identity.
    pub fn status(&self, document_count: usize) -> MemoryStatus {
        let percent_used = self.current_bytes as f64 / self.budget_bytes.max(1) as f64 * 100.0;
        MemoryStatus {
            used_bytes: self.current_bytes,
            budget_bytes: self.budget_bytes,
            percent_used,
            entry_count: self.charges.len(),
            document_count,
            pressure: classify(percent_used),
        }
    }
}

fn classify(percent_used: f64) -> MemoryPressure {
    if percent_used < 80.0 {
        MemoryPressure::Healthy
    } else if percent_used < 95.0 {
        MemoryPressure::Warning
    } else {
        MemoryPressure::Critical
    }
}
