//! TOML configuration for the answer pipeline.
//!
//! Every component receives the parts of [`Config`] it needs at
//! construction time; nothing reads settings from global state.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Embedding width the index is built for.
pub const EXPECTED_DIMS: usize = 384;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub corpus: CorpusConfig,
    pub index: IndexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub templates: TemplatesConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorpusConfig {
    pub dir: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.json".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    pub dir: PathBuf,
    #[serde(default = "default_error_log")]
    pub error_log: PathBuf,
    #[serde(default = "default_expected_dims")]
    pub expected_dims: usize,
}

fn default_error_log() -> PathBuf {
    PathBuf::from("index_errors.log")
}
fn default_expected_dims() -> usize {
    EXPECTED_DIMS
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1024
}
fn default_overlap() -> usize {
    128
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_result_count")]
    pub result_count: usize,
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            result_count: default_result_count(),
            candidate_multiplier: default_candidate_multiplier(),
            min_score: default_min_score(),
        }
    }
}

impl RetrievalConfig {
    /// Number of neighbours requested from the index for one query.
    pub fn top_k(&self) -> usize {
        self.result_count * self.candidate_multiplier
    }
}

fn default_result_count() -> usize {
    5
}
fn default_candidate_multiplier() -> usize {
    3
}
fn default_min_score() -> f32 {
    0.6
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_expected_dims")]
    pub dims: usize,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: EXPECTED_DIMS,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "local".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_embedding_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_stop")]
    pub stop: Vec<String>,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_generation_model(),
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
            stop: default_stop(),
            timeout_secs: default_generation_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.mistral.ai/v1".to_string()
}
fn default_generation_model() -> String {
    "mistral-medium".to_string()
}
fn default_api_key_env() -> String {
    "MISTRAL_API_KEY".to_string()
}
fn default_temperature() -> f32 {
    0.4
}
fn default_top_p() -> f32 {
    0.9
}
fn default_max_tokens() -> u32 {
    4000
}
fn default_stop() -> Vec<String> {
    vec!["\n##".to_string(), "```".to_string()]
}
fn default_generation_timeout_secs() -> u64 {
    60
}
fn default_max_attempts() -> u32 {
    5
}
fn default_backoff_base_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct TemplatesConfig {
    #[serde(default = "default_templates_path")]
    pub path: PathBuf,
}

impl Default for TemplatesConfig {
    fn default() -> Self {
        Self {
            path: default_templates_path(),
        }
    }
}

fn default_templates_path() -> PathBuf {
    PathBuf::from("prompts_db.json")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ValidationConfig {
    /// Regulatory documents the judge checks answers against.
    #[serde(default = "default_references")]
    pub references: Vec<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            references: default_references(),
        }
    }
}

fn default_references() -> Vec<String> {
    [
        "SP 112.13330.2022",
        "EMERCOM Order No. 632",
        "GOST R 22.9.19-2022",
        "Federal Law No. 123-FZ",
        "NPB 101-03",
        "SP 5.13130.2009",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatchConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedbackConfig {
    /// JSON-lines file that `ask --feedback` appends ideal answers to.
    #[serde(default = "default_feedback_path")]
    pub path: PathBuf,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            path: default_feedback_path(),
        }
    }
}

fn default_feedback_path() -> PathBuf {
    PathBuf::from("feedback.jsonl")
}

impl Config {
    /// Configuration rooted at `root`, with every other setting defaulted.
    pub fn with_root(root: &Path) -> Self {
        Self {
            corpus: CorpusConfig {
                dir: root.join("documents"),
                include_globs: default_include_globs(),
                exclude_globs: Vec::new(),
                follow_symlinks: false,
            },
            index: IndexConfig {
                dir: root.join("index"),
                error_log: root.join("index_errors.log"),
                expected_dims: EXPECTED_DIMS,
            },
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            templates: TemplatesConfig {
                path: root.join("prompts_db.json"),
            },
            validation: ValidationConfig::default(),
            batch: BatchConfig {
                output_dir: root.to_path_buf(),
            },
            feedback: FeedbackConfig {
                path: root.join("feedback.jsonl"),
            },
        }
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        if self.chunking.chunk_size == 0 {
            anyhow::bail!("chunking.chunk_size must be > 0");
        }
        if self.chunking.overlap >= self.chunking.chunk_size {
            anyhow::bail!("chunking.overlap must be smaller than chunking.chunk_size");
        }

        if self.retrieval.result_count < 1 {
            anyhow::bail!("retrieval.result_count must be >= 1");
        }
        if self.retrieval.candidate_multiplier < 1 {
            anyhow::bail!("retrieval.candidate_multiplier must be >= 1");
        }
        if !(-1.0..=1.0).contains(&self.retrieval.min_score) {
            anyhow::bail!("retrieval.min_score must be in [-1.0, 1.0]");
        }

        if self.generation.max_attempts < 1 {
            anyhow::bail!("generation.max_attempts must be >= 1");
        }

        match self.embedding.provider.as_str() {
            "openai" | "ollama" | "local" => {}
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be openai, ollama, or local.",
                other
            ),
        }

        if self.embedding.dims != self.index.expected_dims {
            anyhow::bail!(
                "embedding.dims ({}) must equal index.expected_dims ({})",
                self.embedding.dims,
                self.index.expected_dims
            );
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
