//! Query pipeline: retrieve → select template → generate → validate → recommend.
//!
//! [`QueryOrchestrator::process_query`] never panics or returns an error;
//! a failed pipeline run is reported as [`QueryOutcome::Failed`]. Dialog,
//! feedback, and validation history live in memory for the lifetime of the
//! orchestrator.

use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::RwLock;

use crate::config::{Config, RetrievalConfig};
use crate::embedding::Embedder;
use crate::error::{RagError, Result};
use crate::generation::Generator;
use crate::index_manager::DocumentIndexManager;
use crate::models::{DialogTurn, FeedbackExample, QueryOutcome, ValidationRecord};
use crate::templates::{fill_template, TemplateSelector, DEFAULT_TEMPLATE};
use crate::validation::ResponseValidator;

/// Returned when generation produced nothing and no recommendation was made.
pub const NO_ANSWER: &str = "Could not form an answer";

const RECOMMENDATION_HEADER: &str = "\n\n---\n🔍 Recommendation:\n";

/// Aggregates over the validation history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationStats {
    pub count: usize,
    pub mean_relevance: f32,
    pub mean_completeness: f32,
    pub accuracy_rate: f32,
    pub safety_violation_rate: f32,
    pub structure_rate: f32,
    pub sources_rate: f32,
    pub recommendation_rate: f32,
}

pub struct QueryOrchestrator {
    index: Arc<DocumentIndexManager>,
    selector: RwLock<TemplateSelector>,
    generator: Arc<dyn Generator>,
    validator: ResponseValidator,
    retrieval: RetrievalConfig,
    dialog_history: Mutex<Vec<DialogTurn>>,
    feedback_examples: Mutex<Vec<FeedbackExample>>,
    validation_history: Mutex<Vec<ValidationRecord>>,
}

impl QueryOrchestrator {
    pub fn new(
        config: &Config,
        index: Arc<DocumentIndexManager>,
        selector: TemplateSelector,
        generator: Arc<dyn Generator>,
    ) -> Self {
        Self {
            index,
            selector: RwLock::new(selector),
            validator: ResponseValidator::new(Arc::clone(&generator), &config.validation),
            generator,
            retrieval: config.retrieval.clone(),
            dialog_history: Mutex::new(Vec::new()),
            feedback_examples: Mutex::new(Vec::new()),
            validation_history: Mutex::new(Vec::new()),
        }
    }

    /// Wire up every component from configuration.
    ///
    /// Loads or builds the index and makes sure the template store holds at
    /// least the default template. An empty corpus is not fatal: queries
    /// then run without retrieved context.
    pub async fn bootstrap(
        config: &Config,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
    ) -> Result<Self> {
        let index = Arc::new(DocumentIndexManager::new(config, Arc::clone(&embedder))?);
        match index.ensure_index().await {
            Ok(chunks) => tracing::info!(chunks, "index ready"),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => tracing::warn!(error = %e, "continuing without an index"),
        }

        let mut selector = TemplateSelector::open(&config.templates.path, embedder).await?;
        if selector.ensure_default(DEFAULT_TEMPLATE).await? {
            tracing::info!("installed default template");
        }

        Ok(Self::new(config, index, selector, generator))
    }

    pub fn index(&self) -> &Arc<DocumentIndexManager> {
        &self.index
    }

    pub fn default_template(&self) -> &'static str {
        DEFAULT_TEMPLATE
    }

    /// Answer one query.
    pub async fn process_query(&self, query: &str) -> QueryOutcome {
        match self.run_pipeline(query).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "query pipeline failed");
                QueryOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn run_pipeline(&self, query: &str) -> Result<QueryOutcome> {
        let hits = self
            .index
            .search(query, self.retrieval.top_k(), self.retrieval.min_score)
            .await;
        let context = hits
            .iter()
            .map(|hit| hit.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        tracing::debug!(hits = hits.len(), "context retrieved");

        let template = self
            .selector
            .read()
            .await
            .select(query)
            .await?
            .ok_or_else(|| RagError::Configuration("no templates available".to_string()))?;
        let prompt = fill_template(&template, &context, query);

        let response = self.generator.generate(&prompt).await;
        let validation = self
            .validator
            .validate(query, &context, &response, &template)
            .await;

        let recommendation = if validation.needs_recommendation() {
            Some(self.validator.recommend(query, &context, &validation).await)
        } else {
            None
        };
        let answer = compose_answer(&response, recommendation.as_deref());

        let now = Utc::now();
        lock(&self.validation_history).push(ValidationRecord {
            timestamp: now,
            query: query.to_string(),
            response: response.clone(),
            validation,
            recommendation: recommendation.clone(),
        });
        lock(&self.dialog_history).push(DialogTurn {
            timestamp: now,
            query: query.to_string(),
            context,
            prompt,
            response: response.clone(),
        });

        Ok(QueryOutcome::Answered {
            answer,
            response,
            validation,
            recommendation,
        })
    }

    /// Attach an ideal answer to the most recent turn asking `query` verbatim.
    ///
    /// Returns `false` when no such turn exists.
    pub fn add_feedback(&self, query: &str, ideal_answer: &str) -> bool {
        let turn = lock(&self.dialog_history)
            .iter()
            .rev()
            .find(|turn| turn.query == query)
            .cloned();

        match turn {
            Some(turn) => {
                lock(&self.feedback_examples).push(FeedbackExample {
                    turn,
                    ideal_answer: ideal_answer.to_string(),
                });
                true
            }
            None => false,
        }
    }

    pub async fn add_template(&self, text: &str) -> Result<usize> {
        self.selector.write().await.add(text).await
    }

    pub async fn remove_template(&self, index: usize) -> Result<bool> {
        self.selector.write().await.remove(index)
    }

    pub async fn reset_templates(&self) -> Result<()> {
        self.selector.write().await.reset(DEFAULT_TEMPLATE).await
    }

    pub async fn templates(&self) -> Vec<String> {
        self.selector.read().await.templates().to_vec()
    }

    pub fn dialog_history(&self) -> Vec<DialogTurn> {
        lock(&self.dialog_history).clone()
    }

    pub fn feedback_examples(&self) -> Vec<FeedbackExample> {
        lock(&self.feedback_examples).clone()
    }

    pub fn validation_history(&self) -> Vec<ValidationRecord> {
        lock(&self.validation_history).clone()
    }

    pub fn validation_stats(&self) -> ValidationStats {
        let history = lock(&self.validation_history);
        if history.is_empty() {
            return ValidationStats::default();
        }

        let n = history.len() as f32;
        let rate = |pred: &dyn Fn(&ValidationRecord) -> bool| {
            history.iter().filter(|r| pred(r)).count() as f32 / n
        };
        let mean = |value: &dyn Fn(&ValidationRecord) -> u8| {
            history.iter().map(|r| value(r) as f32).sum::<f32>() / n
        };

        ValidationStats {
            count: history.len(),
            mean_relevance: mean(&|r| r.validation.relevance),
            mean_completeness: mean(&|r| r.validation.completeness),
            accuracy_rate: rate(&|r| r.validation.accuracy),
            safety_violation_rate: rate(&|r| r.validation.safety),
            structure_rate: rate(&|r| r.validation.structure),
            sources_rate: rate(&|r| r.validation.sources),
            recommendation_rate: rate(&|r| r.recommendation.is_some()),
        }
    }
}

fn compose_answer(response: &str, recommendation: Option<&str>) -> String {
    let mut answer = response.to_string();
    if let Some(recommendation) = recommendation {
        answer.push_str(RECOMMENDATION_HEADER);
        answer.push_str(recommendation);
    }
    if answer.trim().is_empty() {
        NO_ANSWER.to_string()
    } else {
        answer
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
