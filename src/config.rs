use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{KbError, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub index: IndexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Where the serialized index lives (e.g. `.knowledge/index.json`).
    pub path: PathBuf,
    #[serde(default = "default_budget_mb")]
    pub memory_budget_mb: u64,
}

impl IndexConfig {
    pub fn memory_budget_bytes(&self) -> u64 {
        self.memory_budget_mb * 1024 * 1024
    }
}

fn default_budget_mb() -> u64 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size_tokens: default_chunk_size(),
            overlap_tokens: default_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    crate::chunk::DEFAULT_CHUNK_SIZE_TOKENS
}
fn default_overlap() -> usize {
    crate::chunk::DEFAULT_OVERLAP_TOKENS
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f64,
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            semantic_weight: default_semantic_weight(),
            keyword_weight: default_keyword_weight(),
            top_k: default_top_k(),
            min_score: default_min_score(),
            max_context_tokens: default_max_context_tokens(),
        }
    }
}

fn default_semantic_weight() -> f64 {
    0.7
}
fn default_keyword_weight() -> f64 {
    0.3
}
fn default_top_k() -> usize {
    5
}
fn default_min_score() -> f64 {
    0.3
}
fn default_max_context_tokens() -> usize {
    4000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Ollama base URL override.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            max_retries: 5,
            timeout_secs: 10,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    10
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourcesConfig {
    pub filesystem: Option<FilesystemSourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemSourceConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        KbError::Config(format!("failed to read config file {}: {}", path.display(), e))
    })?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| KbError::Config(format!("failed to parse config file: {}", e)))?;

    // Validate index
    if config.index.memory_budget_mb == 0 {
        return Err(KbError::Config("index.memory_budget_mb must be > 0".into()));
    }

    // Validate chunking
    if config.chunking.chunk_size_tokens == 0 {
        return Err(KbError::Config("chunking.chunk_size_tokens must be > 0".into()));
    }
    if config.chunking.overlap_tokens >= config.chunking.chunk_size_tokens {
        return Err(KbError::Config(
            "chunking.overlap_tokens must be < chunking.chunk_size_tokens".into(),
        ));
    }

    // Validate retrieval
    if config.retrieval.top_k < 1 {
        return Err(KbError::Config("retrieval.top_k must be >= 1".into()));
    }
    if !(0.0..=1.0).contains(&config.retrieval.semantic_weight)
        || !(0.0..=1.0).contains(&config.retrieval.keyword_weight)
    {
        return Err(KbError::Config(
            "retrieval.semantic_weight and retrieval.keyword_weight must be in [0.0, 1.0]".into(),
        ));
    }
    if !(0.0..=1.0).contains(&config.retrieval.min_score) {
        return Err(KbError::Config("retrieval.min_score must be in [0.0, 1.0]".into()));
    }
    if config.retrieval.max_context_tokens == 0 {
        return Err(KbError::Config("retrieval.max_context_tokens must be > 0".into()));
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "disabled" | "hash" | "ollama" | "local" => {}
        other => {
            return Err(KbError::Config(format!(
                "unknown embedding provider: '{}'. Must be disabled, hash, ollama, or local.",
                other
            )))
        }
    }
    if config.embedding.provider == "ollama" {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            return Err(KbError::Config(
                "embedding.dims must be > 0 when provider is 'ollama'".into(),
            ));
        }
        if config.embedding.model.is_none() {
            return Err(KbError::Config(
                "embedding.model must be specified when provider is 'ollama'".into(),
            ));
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(body: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let f = write_config(
            r#"[index]
path = ".knowledge/index.json"
"#,
        );
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.index.memory_budget_mb, 100);
        assert_eq!(cfg.chunking.chunk_size_tokens, 500);
        assert_eq!(cfg.chunking.overlap_tokens, 50);
        assert_eq!(cfg.retrieval.top_k, 5);
        assert!((cfg.retrieval.semantic_weight - 0.7).abs() < 1e-9);
        assert_eq!(cfg.embedding.provider, "disabled");
        assert_eq!(cfg.embedding.timeout_secs, 10);
    }

    #[test]
    fn overlap_must_stay_below_chunk_size() {
        let f = write_config(
            r#"[index]
path = "index.json"

[chunking]
chunk_size_tokens = 100
overlap_tokens = 100
"#,
        );
        assert!(matches!(load_config(f.path()), Err(KbError::Config(_))));
    }

    #[test]
    fn ollama_requires_model_and_dims() {
        let f = write_config(
            r#"[index]
path = "index.json"

[embedding]
provider = "ollama"
"#,
        );
        assert!(matches!(load_config(f.path()), Err(KbError::Config(_))));
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let f = write_config(
            r#"[index]
path = "index.json"

[embedding]
provider = "openai"
"#,
        );
        assert!(matches!(load_config(f.path()), Err(KbError::Config(_))));
    }

    #[test]
    fn weights_out_of_range_are_rejected() {
        let f = write_config(
            r#"[index]
path = "index.json"

[retrieval]
semantic_weight = 1.5
"#,
        );
        assert!(matches!(load_config(f.path()), Err(KbError::Config(_))));
    }
}
