//! In-process embedding via fastembed.
//!
//! The model is downloaded from Hugging Face on first use and cached;
//! afterwards embeddings run entirely offline. Inference is blocking, so
//! it runs on tokio's blocking pool.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use super::{normalize, Embedder};
use crate::config::EmbeddingConfig;
use crate::error::{RagError, Result};

const DEFAULT_MODEL: &str = "all-minilm-l6-v2";

pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: Arc<Mutex<fastembed::TextEmbedding>>,
}

impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let (fastembed_model, native_dims) = resolve_model(&model_name)?;

        if native_dims != config.dims {
            return Err(RagError::DimensionMismatch {
                expected: config.dims,
                actual: native_dims,
            });
        }

        let model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(fastembed_model).with_show_download_progress(true),
        )
        .map_err(|e| {
            RagError::Configuration(format!("failed to initialize local embedding model: {}", e))
        })?;

        tracing::info!(model = %model_name, dims = native_dims, "local embedder ready");

        Ok(Self {
            model_name,
            dims: native_dims,
            batch_size: config.batch_size,
            model: Arc::new(Mutex::new(model)),
        })
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = Arc::clone(&self.model);
        let texts = texts.to_vec();
        let batch_size = self.batch_size;

        let mut vectors = tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| RagError::Embedding("local model lock poisoned".to_string()))?;
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| RagError::Embedding(format!("local embedding failed: {}", e)))
        })
        .await
        .map_err(|e| RagError::Embedding(format!("embedding task failed: {}", e)))??;

        for v in vectors.iter_mut() {
            normalize(v);
        }
        Ok(vectors)
    }
}

fn resolve_model(name: &str) -> Result<(fastembed::EmbeddingModel, usize)> {
    match name {
        "all-minilm-l6-v2" => Ok((fastembed::EmbeddingModel::AllMiniLML6V2, 384)),
        "bge-small-en-v1.5" => Ok((fastembed::EmbeddingModel::BGESmallENV15, 384)),
        "multilingual-e5-small" => Ok((fastembed::EmbeddingModel::MultilingualE5Small, 384)),
        "paraphrase-multilingual-minilm-l12-v2" => {
            Ok((fastembed::EmbeddingModel::ParaphraseMLMiniLML12V2, 384))
        }
        "bge-base-en-v1.5" => Ok((fastembed::EmbeddingModel::BGEBaseENV15, 768)),
        "multilingual-e5-base" => Ok((fastembed::EmbeddingModel::MultilingualE5Base, 768)),
        other => Err(RagError::Configuration(format!(
            "unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, multilingual-e5-small, \
             paraphrase-multilingual-minilm-l12-v2, bge-base-en-v1.5, multilingual-e5-base",
            other
        ))),
    }
}
