//! # Knowledge Base CLI (`kb`)
//!
//! The `kb` binary is the primary interface for the knowledge index. It
//! wires the configuration, embedding provider, and store together and
//! exposes commands for ingestion, search, context retrieval, and status.
//!
//! ## Usage
//!
//! ```bash
//! kb --config ./kb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kb init` | Create the index directory |
//! | `kb sync` | Ingest the configured filesystem root |
//! | `kb add <file>` | Index a single file |
//! | `kb remove <path>` | Drop every chunk of a document |
//! | `kb search "<query>"` | Ranked hybrid search |
//! | `kb context "<query>"` | Assemble token-bounded context with sources |
//! | `kb status` | Budget usage and index counts |
//!
//! ## Examples
//!
//! ```bash
//! # Ingest the docs tree configured in kb.toml
//! kb sync --config ./kb.toml
//!
//! # Hybrid search with custom weighting
//! kb search "deployment rollback" --semantic-weight 0.5 --keyword-weight 0.5
//!
//! # Context for prompt augmentation, as JSON
//! kb context "how are releases cut" --max-tokens 2000 --json
//! ```

use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};

use knowledge_base::config::{self, Config};
use knowledge_base::connector_fs;
use knowledge_base::context::{retrieve_context, ContextOptions};
use knowledge_base::embedding::create_provider;
use knowledge_base::index::SearchOptions;
use knowledge_base::models::SyncStop;
use knowledge_base::progress::{format_number, ProgressMode};
use knowledge_base::store::{CancelFlag, KnowledgeStore};

/// Knowledge Base CLI — a memory-bounded local knowledge index with hybrid
/// search and source-attributed context retrieval.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file with `[index]`, `[chunking]`, `[retrieval]`, `[embedding]`, and
/// `[sources.filesystem]` sections.
#[derive(Parser)]
#[command(
    name = "kb",
    about = "Knowledge Base — a memory-bounded local knowledge index with hybrid search",
    version,
    long_about = "Knowledge Base ingests project documents, embeds them with a local model, \
    enforces a hard memory budget before every insertion, persists the index atomically, \
    and serves hybrid search plus token-bounded, source-attributed context retrieval."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./kb.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Progress output mode for ingestion.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProgressArg {
    Auto,
    Off,
    Human,
    Json,
}

impl ProgressArg {
    fn mode(self) -> ProgressMode {
        match self {
            ProgressArg::Auto => ProgressMode::default_for_tty(),
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Create the index directory.
    ///
    /// Ensures the parent directory of the configured index path exists.
    /// This command is idempotent — running it multiple times is safe.
    Init,

    /// Ingest the configured filesystem root.
    ///
    /// Walks the source root, applies include/exclude globs, chunks and
    /// embeds every file, and saves the index. Unchanged files (by content
    /// hash) are skipped. The whole batch stops at the first budget
    /// rejection; Ctrl-C cancels between files.
    Sync {
        /// Re-ingest every file, ignoring content-hash skip.
        #[arg(long)]
        full: bool,

        /// Maximum number of files to process.
        #[arg(long)]
        limit: Option<usize>,

        /// Progress output on stderr.
        #[arg(long, value_enum, default_value = "auto")]
        progress: ProgressArg,
    },

    /// Index a single file from the configured root.
    Add {
        /// Path to the file (absolute or relative to the working directory).
        file: PathBuf,
    },

    /// Remove every chunk of a document from the index.
    ///
    /// Removing an unknown path is not an error and reports `removed: 0`.
    Remove {
        /// The document path as stored in the index (root-relative).
        path: String,
    },

    /// Search indexed documents.
    ///
    /// Ranks every live chunk by a weighted combination of embedding
    /// cosine similarity and keyword overlap.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results to return.
        #[arg(long)]
        top_k: Option<usize>,

        /// Minimum combined score a hit must reach.
        #[arg(long)]
        min_score: Option<f64>,

        /// Weight of the semantic (cosine) score.
        #[arg(long)]
        semantic_weight: Option<f64>,

        /// Weight of the keyword (overlap) score.
        #[arg(long)]
        keyword_weight: Option<f64>,

        /// Emit results as JSON on stdout.
        #[arg(long)]
        json: bool,
    },

    /// Assemble token-bounded context for a query.
    ///
    /// Prints the context block and one source attribution per included
    /// excerpt. No matches is a normal outcome with empty output.
    Context {
        /// The query to retrieve context for.
        query: String,

        /// Token budget for the assembled context.
        #[arg(long)]
        max_tokens: Option<usize>,

        /// Maximum number of chunks to consider.
        #[arg(long)]
        top_k: Option<usize>,

        /// Minimum combined score a chunk must reach.
        #[arg(long)]
        min_score: Option<f64>,

        /// Emit the full result as JSON on stdout.
        #[arg(long)]
        json: bool,
    },

    /// Show budget usage and index counts.
    Status {
        /// Emit the status as JSON on stdout.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            if let Some(parent) = cfg.index.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("failed to create index directory {}", parent.display())
                    })?;
                }
            }
            println!("Knowledge base initialized at {}", cfg.index.path.display());
        }
        Commands::Sync {
            full,
            limit,
            progress,
        } => {
            let store = open_store(&cfg).await?;
            run_sync(&cfg, &store, full, limit, progress.mode()).await?;
        }
        Commands::Add { file } => {
            let store = open_store(&cfg).await?;
            let root = cfg
                .sources
                .filesystem
                .as_ref()
                .map(|fs| fs.root.clone())
                .unwrap_or_else(|| PathBuf::from("."));
            let item = connector_fs::read_single_file(&root, &file)?;
            let report = store.add_document(&item.relative_path, &item.body).await?;
            store.save_index().await?;

            println!("add {}", report.document_path);
            if report.unchanged {
                println!("  unchanged, skipped");
            } else {
                println!("  chunks indexed: {}", report.chunks_indexed);
                if let Some(stop) = &report.budget_stop {
                    println!(
                        "  stopped by budget: {} of {} bytes used, {} chunks skipped",
                        format_number(stop.used_bytes),
                        format_number(stop.budget_bytes),
                        stop.chunks_skipped
                    );
                }
            }
            println!("ok");
        }
        Commands::Remove { path } => {
            let store = open_store(&cfg).await?;
            let report = store.remove_document(&path).await?;
            store.save_index().await?;
            println!("remove {}", report.document_path);
            println!("  chunks removed: {}", report.removed);
            println!("ok");
        }
        Commands::Search {
            query,
            top_k,
            min_score,
            semantic_weight,
            keyword_weight,
            json,
        } => {
            let store = open_store(&cfg).await?;
            let opts = search_options(&cfg, top_k, min_score, semantic_weight, keyword_weight);
            let hits = store.search(&query, &opts).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else if hits.is_empty() {
                println!("no results");
            } else {
                for (i, hit) in hits.iter().enumerate() {
                    println!(
                        "{}. {:.3}  {}  (semantic {:.3}, keyword {:.3})",
                        i + 1,
                        hit.combined_score,
                        hit.chunk_id,
                        hit.semantic_score,
                        hit.keyword_score
                    );
                    let snippet: String = hit.chunk.text.chars().take(160).collect();
                    println!("   {}", snippet.replace('\n', " "));
                }
            }
        }
        Commands::Context {
            query,
            max_tokens,
            top_k,
            min_score,
            json,
        } => {
            let store = open_store(&cfg).await?;
            let opts = ContextOptions {
                max_context_tokens: max_tokens.unwrap_or(cfg.retrieval.max_context_tokens),
                search: search_options(&cfg, top_k, min_score, None, None),
            };
            let ctx = retrieve_context(&store, &query, &opts).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&ctx)?);
            } else if ctx.sources.is_empty() {
                println!("no context above the score threshold");
            } else {
                println!("{}", ctx.context_text);
                println!("sources:");
                for source in &ctx.sources {
                    println!(
                        "  {}:{}-{}  ({:.3})",
                        source.document_path, source.start_line, source.end_line, source.score
                    );
                }
            }
        }
        Commands::Status { json } => {
            let store = open_store(&cfg).await?;
            let status = store.memory_status().await;

            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("index status");
                println!("  entries: {}", format_number(status.entry_count as u64));
                println!("  documents: {}", format_number(status.document_count as u64));
                println!(
                    "  memory: {} / {} bytes ({:.1}%)  {}",
                    format_number(status.used_bytes),
                    format_number(status.budget_bytes),
                    status.percent_used,
                    status.pressure.label()
                );
            }
        }
    }

    Ok(())
}

/// Build the provider and store from config, initialize, and surface any
/// load-time warning (corrupt or incompatible index file) on stderr.
async fn open_store(cfg: &Config) -> anyhow::Result<KnowledgeStore> {
    let provider = create_provider(&cfg.embedding)?;
    let store = KnowledgeStore::new(cfg, provider);
    let report = store.initialize().await?;
    if let Some(warning) = report.warning {
        eprintln!("warning: starting with an empty index: {}", warning);
        eprintln!("warning: the existing file was left in place for inspection");
    }
    Ok(store)
}

fn search_options(
    cfg: &Config,
    top_k: Option<usize>,
    min_score: Option<f64>,
    semantic_weight: Option<f64>,
    keyword_weight: Option<f64>,
) -> SearchOptions {
    SearchOptions {
        top_k: top_k.unwrap_or(cfg.retrieval.top_k),
        min_score: min_score.unwrap_or(cfg.retrieval.min_score),
        semantic_weight: semantic_weight.unwrap_or(cfg.retrieval.semantic_weight),
        keyword_weight: keyword_weight.unwrap_or(cfg.retrieval.keyword_weight),
    }
}

async fn run_sync(
    cfg: &Config,
    store: &KnowledgeStore,
    full: bool,
    limit: Option<usize>,
    progress: ProgressMode,
) -> anyhow::Result<()> {
    let mut items = connector_fs::scan_filesystem(cfg)?;
    if let Some(lim) = limit {
        items.truncate(lim);
    }

    if full {
        // Dropping each document clears its content hash, forcing a full
        // re-ingest below.
        for item in &items {
            store.remove_document(&item.relative_path).await?;
        }
    }

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let pairs: Vec<(String, String)> = items
        .into_iter()
        .map(|item| (item.relative_path, item.body))
        .collect();

    let reporter = progress.reporter();
    let report = store.add_documents(&pairs, &cancel, reporter.as_ref()).await?;
    store.save_index().await?;

    let indexed = report.files.iter().filter(|f| !f.unchanged && f.error.is_none()).count();
    let unchanged = report.files.iter().filter(|f| f.unchanged).count();
    let failed = report.files.iter().filter(|f| f.error.is_some()).count();
    let chunks: usize = report.files.iter().map(|f| f.chunks_indexed).sum();

    println!("sync filesystem");
    println!("  files found: {}", pairs.len());
    println!("  files indexed: {}", indexed);
    println!("  unchanged: {}", unchanged);
    if failed > 0 {
        println!("  failed: {}", failed);
        for file in report.files.iter().filter(|f| f.error.is_some()) {
            println!(
                "    {}: {}",
                file.document_path,
                file.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    println!("  chunks written: {}", chunks);
    match report.stopped {
        Some(SyncStop::Budget) => println!("  stopped: memory budget reached"),
        Some(SyncStop::Cancelled) => println!("  stopped: cancelled"),
        None => {}
    }

    let status = store.memory_status().await;
    println!(
        "  memory: {} / {} bytes ({:.1}%)",
        format_number(status.used_bytes),
        format_number(status.budget_bytes),
        status.percent_used
    );
    println!("ok");

    Ok(())
}
