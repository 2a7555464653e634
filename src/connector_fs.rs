//! Filesystem scan feeding batch ingestion.
//!
//! Walks the configured root, applies include/exclude globs, and returns
//! `(relative path, body)` items in a deterministic order. The engine's
//! path handling stops at the project root: every `document_path` stored
//! in the index is relative to it.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{KbError, Result};

/// One file ready for ingestion.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Path relative to the configured root; used as the `document_path`.
    pub relative_path: String,
    pub body: String,
}

/// Scan the configured filesystem root for ingestable files.
///
/// Results are sorted by relative path so batch ingestion order (and hence
/// which files survive a budget stop) is deterministic.
pub fn scan_filesystem(config: &Config) -> Result<Vec<SourceFile>> {
    let fs_config = config
        .sources
        .filesystem
        .as_ref()
        .ok_or_else(|| KbError::Config("filesystem source not configured".into()))?;

    let root = &fs_config.root;
    if !root.exists() {
        return Err(KbError::Config(format!(
            "filesystem source root does not exist: {}",
            root.display()
        )));
    }

    let include_set = build_globset(&fs_config.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(fs_config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut items = Vec::new();

    let walker = WalkDir::new(root).follow_links(fs_config.follow_symlinks);
    for entry in walker {
        let entry = entry.map_err(|e| KbError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if exclude_set.is_match(&rel_str) {
            continue;
        }
        if !include_set.is_match(&rel_str) {
            continue;
        }

        // Binary or non-UTF-8 files are skipped rather than indexed as noise.
        let body = match std::fs::read_to_string(path) {
            Ok(body) => body,
            Err(_) => continue,
        };

        items.push(SourceFile {
            relative_path: rel_str,
            body,
        });
    }

    items.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    Ok(items)
}

/// Read a single file under the root, returning its root-relative path.
pub fn read_single_file(root: &Path, file: &Path) -> Result<SourceFile> {
    let body = std::fs::read_to_string(file)?;
    let relative = file.strip_prefix(root).unwrap_or(file);
    Ok(SourceFile {
        relative_path: relative.to_string_lossy().to_string(),
        body,
    })
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).map_err(|e| KbError::Config(e.to_string()))?);
    }
    builder.build().map_err(|e| KbError::Config(e.to_string()))
}
