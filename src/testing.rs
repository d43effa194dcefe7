//! Test doubles shared by unit tests.

use async_trait::async_trait;
use std::sync::Mutex;

use crate::embedding::Embedder;
use crate::error::Result;
use crate::generation::Generator;

/// Replies with the response of the first rule whose key occurs in the prompt.
pub struct ScriptedGenerator {
    rules: Vec<(String, String)>,
    fallback: String,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(fallback: &str) -> Self {
        Self {
            rules: Vec::new(),
            fallback: fallback.to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn rule(mut self, needle: &str, reply: &str) -> Self {
        self.rules.push((needle.to_string(), reply.to_string()));
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, prompt: &str) -> String {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.rules
            .iter()
            .find(|(needle, _)| prompt.contains(needle.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Embeds every text to the same unit vector.
pub struct ConstantEmbedder {
    pub dims: usize,
}

#[async_trait]
impl Embedder for ConstantEmbedder {
    fn model_name(&self) -> &str {
        "constant"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut unit = vec![0.0; self.dims];
        if let Some(first) = unit.first_mut() {
            *first = 1.0;
        }
        Ok(texts.iter().map(|_| unit.clone()).collect())
    }
}
