//! Instruction templates and nearest-neighbour template selection.
//!
//! Templates live in a JSON store file of shape
//! `{"prompts": [text, ...], "embeddings": [[f32, ...], ...]}` with the two
//! arrays in lockstep. A template's text may contain the placeholders
//! `{context}` and `{query}`, filled in by [`fill_template`].

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use crate::embedding::{embed_in_batches, inner_product, Embedder};
use crate::error::{RagError, Result};

/// Template installed when the store is empty.
pub const DEFAULT_TEMPLATE: &str = "You are an emergency-response assistant. Follow these rules STRICTLY:
1. Use ONLY the provided context.
2. Answer format:
- A numbered step-by-step procedure
- References to regulatory documents in square brackets
- Warnings about dangerous actions in a ⚠️ block

Context: {context}

Question: {query}

If the information is insufficient, answer \"Clarification from the operator is required\".";

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-z_]+)\}").expect("placeholder pattern"));

#[derive(Debug, Default, Serialize, Deserialize)]
struct TemplateStore {
    #[serde(default)]
    prompts: Vec<String>,
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

pub struct TemplateSelector {
    path: PathBuf,
    embedder: Arc<dyn Embedder>,
    templates: Vec<String>,
    embeddings: Vec<Vec<f32>>,
}

impl TemplateSelector {
    /// Open the store at `path`, creating an empty one if it is missing.
    ///
    /// Embeddings that are missing or out of step with the templates are
    /// recomputed from the template texts and written back.
    pub async fn open(path: &Path, embedder: Arc<dyn Embedder>) -> Result<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            write_store(path, &TemplateStore::default())?;
        }

        let store = match fs::read_to_string(path)
            .map_err(RagError::from)
            .and_then(|raw| serde_json::from_str::<TemplateStore>(&raw).map_err(RagError::from))
        {
            Ok(store) => store,
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "template store unreadable, starting empty");
                TemplateStore::default()
            }
        };

        let mut selector = Self {
            path: path.to_path_buf(),
            embedder,
            templates: store.prompts,
            embeddings: store.embeddings,
        };

        if !selector.templates.is_empty() && !selector.in_lockstep() {
            tracing::info!(
                templates = selector.templates.len(),
                "recomputing template embeddings"
            );
            selector.embeddings = embed_in_batches(
                selector.embedder.as_ref(),
                &selector.templates,
                selector.templates.len(),
            )
            .await?;
            selector.persist()?;
        }

        Ok(selector)
    }

    pub fn templates(&self) -> &[String] {
        &self.templates
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Append a template and persist. Returns the new template count.
    pub async fn add(&mut self, text: &str) -> Result<usize> {
        let embedding = self.embedder.embed_one(text).await?;
        self.templates.push(text.to_string());
        self.embeddings.push(embedding);
        self.persist()?;
        Ok(self.templates.len())
    }

    /// Remove the template at `index`. Out-of-range indices are ignored.
    ///
    /// The last remaining template cannot be removed.
    pub fn remove(&mut self, index: usize) -> Result<bool> {
        if index >= self.templates.len() {
            return Ok(false);
        }
        if self.templates.len() == 1 {
            return Err(RagError::Configuration(
                "cannot remove the only template".to_string(),
            ));
        }

        self.templates.remove(index);
        self.embeddings.remove(index);
        self.persist()?;
        Ok(true)
    }

    /// The template whose embedding is closest to the query's.
    ///
    /// Ties go to the earliest template. `None` when the store is empty.
    pub async fn select(&self, query: &str) -> Result<Option<String>> {
        if self.templates.is_empty() {
            return Ok(None);
        }

        let query_embedding = self.embedder.embed_one(query).await?;
        let mut best: Option<(usize, f32)> = None;
        for (i, embedding) in self.embeddings.iter().enumerate() {
            let score = inner_product(&query_embedding, embedding);
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((i, score));
            }
        }

        Ok(best.map(|(i, _)| self.templates[i].clone()))
    }

    /// Add `default` if the store holds no templates. Returns whether it was added.
    pub async fn ensure_default(&mut self, default: &str) -> Result<bool> {
        if !self.templates.is_empty() {
            return Ok(false);
        }
        self.add(default).await?;
        Ok(true)
    }

    /// Replace every template with `default`.
    pub async fn reset(&mut self, default: &str) -> Result<()> {
        let embedding = self.embedder.embed_one(default).await?;
        self.templates = vec![default.to_string()];
        self.embeddings = vec![embedding];
        self.persist()
    }

    fn in_lockstep(&self) -> bool {
        let dims = self.embedder.dims();
        self.embeddings.len() == self.templates.len()
            && self.embeddings.iter().all(|e| e.len() == dims)
    }

    fn persist(&self) -> Result<()> {
        let store = TemplateStore {
            prompts: self.templates.clone(),
            embeddings: self.embeddings.clone(),
        };
        write_store(&self.path, &store)
    }
}

/// Substitute `{context}` and `{query}` into a template.
pub fn fill_template(template: &str, context: &str, query: &str) -> String {
    substitute(template, &[("context", context), ("query", query)])
}

/// Replace every `{name}` placeholder of `template` named in `values`.
///
/// Substitution is a single pass over the template: placeholder-like text
/// inside a substituted value is left as is. Unknown names are kept verbatim.
pub fn substitute(template: &str, values: &[(&str, &str)]) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &Captures| {
            let name = &caps[1];
            values
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn write_store(path: &Path, store: &TemplateStore) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(store)?)?;
    fs::rename(&tmp, path)
        .map_err(|e| RagError::Persistence(format!("template store {}: {}", path.display(), e)))
}
