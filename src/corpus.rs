//! Corpus discovery and corpus-file parsing.
//!
//! A corpus file is JSON holding either one item or an array of items of
//! shape `{"text": string, "metadata": object}`. Items that do not match
//! are skipped with a warning; a file that cannot be read or parsed at all
//! is an ingestion error for that file only.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::CorpusConfig;
use crate::error::{RagError, Result};
use crate::models::Document;

/// Include/exclude rules for corpus files, relative to the corpus root.
pub struct CorpusFilter {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
}

impl CorpusFilter {
    pub fn new(config: &CorpusConfig) -> Result<Self> {
        let mut default_excludes = vec!["**/.git/**".to_string(), "**/.*".to_string()];
        default_excludes.extend(config.exclude_globs.clone());

        Ok(Self {
            root: config.dir.clone(),
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&default_excludes)?,
        })
    }

    /// Whether `path` is a corpus file under the root.
    pub fn matches(&self, path: &Path) -> bool {
        let Some(relative) = relative_to_root(path, &self.root) else {
            return false;
        };
        let rel_str = relative.to_string_lossy();
        !self.exclude.is_match(rel_str.as_ref()) && self.include.is_match(rel_str.as_ref())
    }
}

/// List corpus files under the configured root, sorted for deterministic order.
pub fn scan_corpus(config: &CorpusConfig) -> Result<Vec<PathBuf>> {
    let root = &config.dir;
    if !root.exists() {
        return Err(RagError::Configuration(format!(
            "corpus directory does not exist: {}",
            root.display()
        )));
    }

    let filter = CorpusFilter::new(config)?;
    let mut files = Vec::new();

    for entry in WalkDir::new(root).follow_links(config.follow_symlinks) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable corpus entry");
                continue;
            }
        };
        if entry.file_type().is_file() && filter.matches(entry.path()) {
            files.push(entry.into_path());
        }
    }

    files.sort();
    Ok(files)
}

/// `path` relative to the corpus `root`, `/`-separated.
///
/// Every chunk of a file carries this key, and a file update replaces
/// exactly the chunks stored under it. A path outside the root falls back
/// to its file name.
pub fn source_key(path: &Path, root: &Path) -> String {
    match relative_to_root(path, root) {
        Some(relative) => slash_joined(&relative),
        None => path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string()),
    }
}

/// Parse one corpus file under `root` into documents.
///
/// Items without a `doc_id` get `{source key without extension}_{position}`,
/// so same-named files in different directories never share ids.
pub fn load_corpus_file(path: &Path, root: &Path) -> Result<Vec<Document>> {
    let ingestion = |reason: String| RagError::Ingestion {
        path: path.to_path_buf(),
        reason,
    };

    let raw = std::fs::read_to_string(path).map_err(|e| ingestion(e.to_string()))?;
    let content = raw.strip_prefix('\u{feff}').unwrap_or(&raw);
    let value: Value = serde_json::from_str(content).map_err(|e| ingestion(e.to_string()))?;

    let items = match value {
        Value::Array(items) => items,
        other => vec![other],
    };

    let source_file = source_key(path, root);
    let stem = slash_joined(&Path::new(&source_file).with_extension(""));

    let mut documents = Vec::with_capacity(items.len());
    for (i, item) in items.into_iter().enumerate() {
        match item_to_document(item, &stem, i, &source_file) {
            Ok(doc) => documents.push(doc),
            Err(reason) => {
                tracing::warn!(file = %path.display(), item = i, "skipping corpus item: {}", reason);
            }
        }
    }

    Ok(documents)
}

fn item_to_document(
    item: Value,
    stem: &str,
    position: usize,
    source_file: &str,
) -> std::result::Result<Document, String> {
    let mut object = match item {
        Value::Object(object) => object,
        _ => return Err("item is not a JSON object".to_string()),
    };

    let text = match object.remove("text") {
        Some(Value::String(text)) => text,
        Some(_) => return Err("'text' is not a string".to_string()),
        None => return Err("missing 'text'".to_string()),
    };

    let metadata: Map<String, Value> = match object.remove("metadata") {
        Some(Value::Object(metadata)) => metadata,
        Some(_) => return Err("'metadata' is not an object".to_string()),
        None => return Err("missing 'metadata'".to_string()),
    };

    let id = metadata
        .get("doc_id")
        .and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| format!("{}_{}", stem, position));

    Ok(Document {
        id,
        raw_text: text,
        source_file: source_file.to_string(),
        source_metadata: metadata,
    })
}

fn relative_to_root(path: &Path, root: &Path) -> Option<PathBuf> {
    if let Ok(relative) = path.strip_prefix(root) {
        return Some(relative.to_path_buf());
    }
    let root = root.canonicalize().ok()?;
    if let Ok(relative) = path.strip_prefix(&root) {
        return Some(relative.to_path_buf());
    }
    let path = path.canonicalize().ok()?;
    path.strip_prefix(&root).ok().map(Path::to_path_buf)
}

fn slash_joined(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| {
            RagError::Configuration(format!("invalid glob '{}': {}", pattern, e))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| RagError::Configuration(format!("invalid glob set: {}", e)))
}
