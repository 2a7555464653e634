//! Durable single-file index persistence.
//!
//! The whole index is serialized to one JSON file: a header describing the
//! embedding model and counts, the per-document records, and the entries
//! array. Saves are atomic — the content is written to a sibling temporary
//! file in the same directory, synced, then renamed over the target — so a
//! crash mid-save can never leave a half-written index behind.
//!
//! Loads validate the schema, the header dimension against the active
//! embedding model, and every entry's embedding length. A single bad entry
//! fails the whole load: partial recovery risks silent relevance
//! degradation. Load failures never delete the file on disk.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{KbError, Result};
use crate::models::{DocumentRecord, IndexEntry};

/// Bumped when the on-disk schema changes shape.
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// The serialized index file: header, document records, entries.
#[derive(Debug, Serialize, Deserialize)]
pub struct IndexFile {
    pub version: u32,
    pub model_name: String,
    pub dimension: usize,
    pub created_at: i64,
    pub modified_at: i64,
    pub document_count: usize,
    pub total_entries: usize,
    pub documents: Vec<DocumentRecord>,
    pub entries: Vec<IndexEntry>,
}

/// Owns the on-disk index file at one path.
///
/// Only one save may be in flight at a time per instance; a second
/// concurrent save fails fast with [`KbError::SaveInProgress`] rather than
/// silently racing on the temp-file name.
#[derive(Debug)]
pub struct IndexPersistence {
    path: PathBuf,
    saving: AtomicBool,
}

impl IndexPersistence {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            saving: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically write the serialized index to the configured path.
    pub fn save(&self, file: &IndexFile) -> Result<()> {
        if self
            .saving
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(KbError::SaveInProgress);
        }
        let result = self.save_locked(file);
        self.saving.store(false, Ordering::Release);
        result
    }

    fn save_locked(&self, file: &IndexFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = temp_path(&self.path);
        let bytes = serde_json::to_vec(file)?;

        let mut out = fs::File::create(&tmp_path)?;
        out.write_all(&bytes)?;
        out.sync_all()?;
        drop(out);

        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Load and validate the index file.
    ///
    /// Returns `Ok(None)` when no file exists yet (a fresh index).
    ///
    /// # Errors
    ///
    /// - [`KbError::IndexCorrupted`] — unparseable content, unsupported
    ///   version, or any entry whose embedding length or line range is
    ///   invalid.
    /// - [`KbError::IndexIncompatible`] — the header dimension does not
    ///   match `expected_dims`. This is a hard stop, not an auto-migration.
    pub fn load(&self, expected_dims: usize) -> Result<Option<IndexFile>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path)?;
        let file: IndexFile = serde_json::from_str(&content)
            .map_err(|e| KbError::IndexCorrupted(e.to_string()))?;

        if file.version != INDEX_FORMAT_VERSION {
            return Err(KbError::IndexCorrupted(format!(
                "unsupported index version {} (expected {})",
                file.version, INDEX_FORMAT_VERSION
            )));
        }

        if file.dimension != expected_dims {
            return Err(KbError::IndexIncompatible {
                expected: expected_dims,
                found: file.dimension,
            });
        }

        for entry in &file.entries {
            if entry.embedding.len() != file.dimension {
                return Err(KbError::IndexCorrupted(format!(
                    "entry '{}' has {} embedding dims, header says {}",
                    entry.chunk.id,
                    entry.embedding.len(),
                    file.dimension
                )));
            }
            if entry.chunk.end_line < entry.chunk.start_line {
                return Err(KbError::IndexCorrupted(format!(
                    "entry '{}' has inverted line range {}-{}",
                    entry.chunk.id, entry.chunk.start_line, entry.chunk.end_line
                )));
            }
        }

        Ok(Some(file))
    }
}

fn temp_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "index.json".into());
    name.push(".tmp");
    target.with_file_name(name)
}
