//! # RAG Harness CLI (`rag`)
//!
//! The `rag` binary builds and maintains the document index, answers
//! questions through the full retrieve/generate/validate pipeline, and
//! manages the instruction template store.
//!
//! ## Usage
//!
//! ```bash
//! rag --config ./config/rag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rag index create` | Build the index from the whole corpus |
//! | `rag index update <file>` | Re-ingest one corpus file |
//! | `rag watch` | Keep the index in sync with the corpus until Ctrl-C |
//! | `rag ask "<question>"` | Answer one question (`--feedback` saves an ideal answer) |
//! | `rag batch <file>` | Answer one question per line, save JSON results |
//! | `rag templates list` | Show the template store |
//! | `rag templates add <text>` | Add a template |
//! | `rag templates remove <N>` | Remove template number N (1-based) |
//! | `rag templates reset` | Restore the default template only |
//! | `rag status` | Index, corpus, and template summary |
//!
//! Logs go to stderr; set `RAG_LOG` (e.g. `RAG_LOG=debug`) to change the level.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use rag_harness::config::{self, Config};
use rag_harness::corpus::scan_corpus;
use rag_harness::embedding::{create_embedder, Embedder};
use rag_harness::generation::HttpGenerator;
use rag_harness::index_manager::DocumentIndexManager;
use rag_harness::logging;
use rag_harness::models::QueryOutcome;
use rag_harness::orchestrator::QueryOrchestrator;
use rag_harness::templates::{TemplateSelector, DEFAULT_TEMPLATE};
use rag_harness::watcher::IndexWatcher;

/// RAG Harness CLI: retrieval-augmented answers with template selection
/// and rubric validation.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/rag.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "rag",
    about = "RAG Harness: retrieval-augmented answers with rubric validation",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rag.toml")]
    config: PathBuf,

    /// Log at debug level unless `RAG_LOG` says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build or update the document index.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Watch the corpus directory and apply changes until interrupted.
    ///
    /// Builds the index first if none exists.
    Watch,

    /// Answer a single question.
    Ask {
        /// The question.
        query: String,

        /// Print the answer, validation scores, and recommendation as JSON.
        #[arg(long)]
        json: bool,

        /// Save an ideal answer for this question to the feedback file
        /// (`[feedback].path`) after answering it.
        #[arg(long)]
        feedback: Option<String>,
    },

    /// Answer every line of a questions file and save the results as JSON.
    Batch {
        /// File with one question per line; blank lines are skipped.
        file: PathBuf,

        /// Directory for `batch_results_*.json` (default: `[batch].output_dir`).
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Manage the instruction template store.
    Templates {
        #[command(subcommand)]
        action: TemplateAction,
    },

    /// Show index, corpus, and template status.
    Status,
}

#[derive(Subcommand)]
enum IndexAction {
    /// Rebuild the index from every corpus file.
    Create,
    /// Re-ingest one corpus file and merge it into the index.
    Update {
        /// Path of the changed corpus file.
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum TemplateAction {
    /// List all templates with their numbers.
    List,
    /// Add a template. It may use `{context}` and `{query}` placeholders.
    Add {
        /// Template text; omit when using `--file`.
        text: Option<String>,
        /// Read the template text from a file.
        #[arg(long, conflicts_with = "text")]
        file: Option<PathBuf>,
    },
    /// Remove a template by its 1-based number.
    Remove {
        number: usize,
    },
    /// Replace every template with the default one.
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Index { action } => {
            let manager = index_manager(&cfg)?;
            match action {
                IndexAction::Create => {
                    let chunks = manager.create_index().await?;
                    println!("Indexed {} chunks.", chunks);
                }
                IndexAction::Update { path } => {
                    let chunks = manager.handle_document_update(&path).await?;
                    println!(
                        "Updated {}: {} chunks (index now holds {}).",
                        path.display(),
                        chunks,
                        manager.chunk_count()
                    );
                }
            }
        }
        Commands::Watch => {
            let manager = Arc::new(index_manager(&cfg)?);
            let chunks = manager.ensure_index().await?;
            eprintln!("Index holds {} chunks. Watching for changes (Ctrl-C to stop)...", chunks);

            let watcher = IndexWatcher::start(Arc::clone(&manager))?;
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            let applied = watcher.stop().await;
            eprintln!("Stopped after applying {} updates.", applied);
        }
        Commands::Ask {
            query,
            json,
            feedback,
        } => {
            let orchestrator = orchestrator(&cfg).await?;
            let outcome = orchestrator.process_query(&query).await;

            match (&outcome, json) {
                (
                    QueryOutcome::Answered {
                        answer,
                        response,
                        validation,
                        recommendation,
                    },
                    true,
                ) => {
                    let out = serde_json::json!({
                        "question": &query,
                        "answer": answer,
                        "response": response,
                        "validation": validation,
                        "recommendation": recommendation,
                    });
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
                (QueryOutcome::Answered { answer, .. }, false) => println!("{}", answer),
                (QueryOutcome::Failed { error }, _) => anyhow::bail!("Query failed: {}", error),
            }

            if let Some(ideal) = feedback {
                let example = orchestrator
                    .add_feedback(&query, &ideal)
                    .then(|| orchestrator.feedback_examples().pop())
                    .flatten()
                    .context("No dialog turn to attach feedback to")?;
                rag_harness::batch::append_feedback(&cfg.feedback.path, &example)?;
                eprintln!("Feedback saved to {}", cfg.feedback.path.display());
            }
        }
        Commands::Batch { file, output_dir } => {
            let orchestrator = orchestrator(&cfg).await?;
            let output_dir = output_dir.unwrap_or_else(|| cfg.batch.output_dir.clone());
            let path = rag_harness::batch::run_batch(&orchestrator, &file, &output_dir).await?;
            println!("{}", path.display());
        }
        Commands::Templates { action } => {
            let mut selector = template_selector(&cfg).await?;
            match action {
                TemplateAction::List => {
                    for (i, template) in selector.templates().iter().enumerate() {
                        println!("── Template #{} ──\n{}\n", i + 1, template);
                    }
                }
                TemplateAction::Add { text, file } => {
                    let text = match (text, file) {
                        (Some(text), _) => text,
                        (None, Some(path)) => std::fs::read_to_string(&path).with_context(|| {
                            format!("Failed to read template file: {}", path.display())
                        })?,
                        (None, None) => anyhow::bail!("Provide template text or --file"),
                    };
                    let text = text.trim();
                    if text.is_empty() {
                        anyhow::bail!("Template text is empty");
                    }
                    let count = selector.add(text).await?;
                    println!("Template added. Total templates: {}", count);
                }
                TemplateAction::Remove { number } => {
                    let removed = number
                        .checked_sub(1)
                        .map(|index| selector.remove(index))
                        .transpose()?
                        .unwrap_or(false);
                    if removed {
                        println!("Template #{} removed.", number);
                    } else {
                        println!("No template #{}; nothing removed.", number);
                    }
                }
                TemplateAction::Reset => {
                    selector.reset(DEFAULT_TEMPLATE).await?;
                    println!("Templates reset to the default.");
                }
            }
        }
        Commands::Status => {
            let manager = index_manager(&cfg)?;
            let selector = template_selector(&cfg).await?;
            let corpus_files = scan_corpus(&cfg.corpus).map(|f| f.len()).unwrap_or(0);

            println!("Corpus:     {} ({} files)", cfg.corpus.dir.display(), corpus_files);
            println!(
                "Index:      {} ({})",
                cfg.index.dir.display(),
                if manager.is_loaded() {
                    format!("{} chunks", manager.chunk_count())
                } else {
                    "not built".to_string()
                }
            );
            println!("Embeddings: {} ({} dims)", cfg.embedding.provider, cfg.embedding.dims);
            println!("Generator:  {} @ {}", cfg.generation.model, cfg.generation.base_url);
            println!("Templates:  {} in {}", selector.len(), cfg.templates.path.display());
            if let Some(last) = selector.templates().last() {
                let preview: String = last.chars().take(200).collect();
                println!("Last template:\n{}", preview);
            }
        }
    }

    Ok(())
}

fn embedder(cfg: &Config) -> Result<Arc<dyn Embedder>> {
    create_embedder(&cfg.embedding).context("Failed to initialize embedding backend")
}

fn index_manager(cfg: &Config) -> Result<DocumentIndexManager> {
    DocumentIndexManager::new(cfg, embedder(cfg)?).context("Failed to open the document index")
}

async fn template_selector(cfg: &Config) -> Result<TemplateSelector> {
    let mut selector = TemplateSelector::open(&cfg.templates.path, embedder(cfg)?)
        .await
        .context("Failed to open the template store")?;
    selector.ensure_default(DEFAULT_TEMPLATE).await?;
    Ok(selector)
}

async fn orchestrator(cfg: &Config) -> Result<QueryOrchestrator> {
    let generator = Arc::new(HttpGenerator::new(&cfg.generation)?);
    QueryOrchestrator::bootstrap(cfg, embedder(cfg)?, generator)
        .await
        .context("Failed to start the query pipeline")
}
