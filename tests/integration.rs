use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn kb_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("kb");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.md"),
        "# Beta Document\n\nThis document discusses Python and machine learning.\n\nDeep learning frameworks like PyTorch are covered.",
    )
    .unwrap();
    fs::write(
        files_dir.join("gamma.txt"),
        "Gamma plain text file.\n\nContains notes about deployment and infrastructure.\n\nKubernetes and Docker are mentioned here.",
    )
    .unwrap();

    let config_content = format!(
        r#"[index]
path = "{root}/data/index.json"
memory_budget_mb = 10

[chunking]
chunk_size_tokens = 200
overlap_tokens = 20

[retrieval]
top_k = 5
min_score = 0.0

[embedding]
provider = "hash"
dims = 64

[sources.filesystem]
root = "{root}/files"
include_globs = ["**/*.md", "**/*.txt"]
exclude_globs = []
follow_symlinks = false
"#,
        root = root.display()
    );

    let config_path = root.join("kb.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_kb(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = kb_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run kb binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_index_directory() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_kb(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data").exists());

    // Idempotent.
    let (_, _, success2) = run_kb(&config_path, &["init"]);
    assert!(success2, "second init failed (not idempotent)");
}

#[test]
fn test_sync_indexes_all_files() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_kb(&config_path, &["sync", "--progress", "off"]);
    assert!(success, "sync failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("files found: 3"));
    assert!(stdout.contains("files indexed: 3"));
    assert!(stdout.contains("ok"));
}

#[test]
fn test_sync_skips_unchanged_files() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout1, _, _) = run_kb(&config_path, &["sync", "--progress", "off"]);
    assert!(stdout1.contains("files indexed: 3"));

    let (stdout2, _, _) = run_kb(&config_path, &["sync", "--progress", "off"]);
    assert!(
        stdout2.contains("unchanged: 3"),
        "expected content-hash skip on second sync, got: {}",
        stdout2
    );

    // --full re-ingests everything.
    let (stdout3, _, _) = run_kb(&config_path, &["sync", "--full", "--progress", "off"]);
    assert!(stdout3.contains("files indexed: 3"));
}

#[test]
fn test_search_finds_relevant_document() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["sync", "--progress", "off"]);

    let (stdout, stderr, success) =
        run_kb(&config_path, &["search", "Rust cargo crates", "--json"]);
    assert!(success, "search failed: stdout={}, stderr={}", stdout, stderr);

    let hits: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let hits = hits.as_array().unwrap();
    assert!(!hits.is_empty());
    assert!(
        hits[0]["chunk"]["document_path"]
            .as_str()
            .unwrap()
            .contains("alpha"),
        "the Rust document should rank first, got: {}",
        hits[0]
    );
}

#[test]
fn test_search_is_deterministic() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["sync", "--progress", "off"]);

    let (first, _, _) = run_kb(&config_path, &["search", "deployment", "--json"]);
    let (second, _, _) = run_kb(&config_path, &["search", "deployment", "--json"]);
    assert_eq!(first, second, "repeated searches must return identical output");
}

#[test]
fn test_context_reports_sources() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["sync", "--progress", "off"]);

    let (stdout, _, success) = run_kb(
        &config_path,
        &["context", "Kubernetes deployment", "--json"],
    );
    assert!(success);

    let ctx: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let context_text = ctx["context_text"].as_str().unwrap();
    let sources = ctx["sources"].as_array().unwrap();

    assert!(!sources.is_empty());
    let header_count = context_text
        .lines()
        .filter(|l| l.starts_with("--- ") && l.ends_with(" ---"))
        .count();
    assert_eq!(sources.len(), header_count);
}

#[test]
fn test_context_with_no_matches_is_empty_not_error() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["sync", "--progress", "off"]);

    let (stdout, _, success) = run_kb(
        &config_path,
        &[
            "context",
            "xylophone quasar nonsense",
            "--min-score",
            "0.9",
            "--json",
        ],
    );
    assert!(success, "no matches must not be an error");

    let ctx: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(ctx["context_text"].as_str().unwrap(), "");
    assert!(ctx["sources"].as_array().unwrap().is_empty());
}

#[test]
fn test_remove_restores_usage() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["sync", "--progress", "off"]);

    let (before, _, _) = run_kb(&config_path, &["status", "--json"]);
    let before: serde_json::Value = serde_json::from_str(&before).unwrap();
    assert_eq!(before["document_count"].as_u64().unwrap(), 3);

    let (stdout, _, success) = run_kb(&config_path, &["remove", "alpha.md"]);
    assert!(success);
    assert!(stdout.contains("chunks removed: 1"));

    let (after, _, _) = run_kb(&config_path, &["status", "--json"]);
    let after: serde_json::Value = serde_json::from_str(&after).unwrap();
    assert_eq!(after["document_count"].as_u64().unwrap(), 2);
    assert!(
        after["used_bytes"].as_u64().unwrap() < before["used_bytes"].as_u64().unwrap()
    );

    // Removing an unknown path is non-fatal.
    let (stdout, _, success) = run_kb(&config_path, &["remove", "ghost.md"]);
    assert!(success);
    assert!(stdout.contains("chunks removed: 0"));
}

#[test]
fn test_index_persists_across_runs() {
    let (tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["sync", "--progress", "off"]);

    let (status, _, _) = run_kb(&config_path, &["status", "--json"]);
    let status: serde_json::Value = serde_json::from_str(&status).unwrap();
    let used_before = status["used_bytes"].as_u64().unwrap();
    assert!(used_before > 0, "sync should have charged the budget");

    // A fresh process reloads the file and reconstructs the accounting.
    let (status2, _, _) = run_kb(&config_path, &["status", "--json"]);
    let status2: serde_json::Value = serde_json::from_str(&status2).unwrap();
    assert_eq!(status2["used_bytes"].as_u64().unwrap(), used_before);

    assert!(tmp.path().join("data/index.json").exists());
}

#[test]
fn test_corrupt_index_warns_and_continues() {
    let (tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["sync", "--progress", "off"]);

    fs::write(tmp.path().join("data/index.json"), "{ definitely not json").unwrap();

    let (stdout, stderr, success) = run_kb(&config_path, &["status", "--json"]);
    assert!(success, "corrupt index must not crash status");
    assert!(stderr.contains("warning"), "expected a warning on stderr: {}", stderr);

    let status: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(status["entry_count"].as_u64().unwrap(), 0);

    // The corrupt file is left in place.
    let content = fs::read_to_string(tmp.path().join("data/index.json")).unwrap();
    assert_eq!(content, "{ definitely not json");
}

#[test]
fn test_status_human_output() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["sync", "--progress", "off"]);

    let (stdout, _, success) = run_kb(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("documents: 3"));
    assert!(stdout.contains("healthy"));
}
