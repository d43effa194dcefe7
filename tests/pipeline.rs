//! End-to-end tests of the answer pipeline with in-process test doubles.
//!
//! The embedder maps texts onto fixed directions by keyword and the
//! generator replies according to substrings of the prompt, so every run
//! is deterministic and offline.

use async_trait::async_trait;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rag_harness::config::Config;
use rag_harness::embedding::Embedder;
use rag_harness::error::{RagError, Result};
use rag_harness::generation::Generator;
use rag_harness::index_manager::DocumentIndexManager;
use rag_harness::models::QueryOutcome;
use rag_harness::orchestrator::QueryOrchestrator;
use rag_harness::templates::{TemplateSelector, DEFAULT_TEMPLATE};
use rag_harness::watcher::{IndexEvent, IndexWatcher};

const FIRE_TEXT: &str = "Fire exits are on the north side of the building.";
const FLOOD_TEXT: &str = "Flood barriers are stored in the basement.";

/// `fire` → x axis, `flood` → y axis, anything else in between.
struct KeywordEmbedder;

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword"
    }

    fn dims(&self) -> usize {
        2
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts
            .iter()
            .map(|text| {
                let lower = text.to_lowercase();
                if lower.contains("unembeddable") {
                    Err(RagError::Embedding("backend rejected input".to_string()))
                } else if lower.contains("fire") {
                    Ok(vec![1.0, 0.0])
                } else if lower.contains("flood") {
                    Ok(vec![0.0, 1.0])
                } else {
                    Ok(vec![0.6, 0.8])
                }
            })
            .collect()
    }
}

/// Replies with the first rule whose needle occurs in the prompt.
struct Script {
    rules: Vec<(&'static str, &'static str)>,
    prompts: Mutex<Vec<String>>,
}

impl Script {
    fn new(rules: Vec<(&'static str, &'static str)>) -> Self {
        Self {
            rules,
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for Script {
    async fn generate(&self, prompt: &str) -> String {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.rules
            .iter()
            .find(|(needle, _)| prompt.contains(needle))
            .map(|(_, reply)| reply.to_string())
            .unwrap_or_default()
    }
}

fn judge_rules(relevance: &'static str) -> Vec<(&'static str, &'static str)> {
    vec![
        ("Rewrite the answer", "1. Use the north exit [SP 112.13330.2022]."),
        ("Rate how relevant", relevance),
        ("Does the answer comply", "yes"),
        ("checklist", "4"),
        ("safety violations", "no"),
        ("service instruction", "yes"),
        ("mandatory references", "no"),
        ("emergency-response assistant", "1. Walk to the north side."),
    ]
}

fn setup(root: &Path) -> Config {
    let mut config = Config::with_root(root);
    config.index.expected_dims = 2;
    config.embedding.dims = 2;
    fs::create_dir_all(&config.corpus.dir).unwrap();
    fs::write(
        config.corpus.dir.join("fire.json"),
        serde_json::json!([{"text": FIRE_TEXT, "metadata": {"source": "drill"}}]).to_string(),
    )
    .unwrap();
    fs::write(
        config.corpus.dir.join("flood.json"),
        serde_json::json!({"text": FLOOD_TEXT, "metadata": {}}).to_string(),
    )
    .unwrap();
    config
}

async fn bootstrap(config: &Config, script: Arc<Script>) -> QueryOrchestrator {
    QueryOrchestrator::bootstrap(config, Arc::new(KeywordEmbedder), script)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_bootstrap_builds_index_and_answers() {
    let tmp = tempfile::tempdir().unwrap();
    let config = setup(tmp.path());
    let script = Arc::new(Script::new(judge_rules("5")));
    let orch = bootstrap(&config, Arc::clone(&script)).await;

    assert!(orch.index().index_exists());
    assert_eq!(orch.index().chunk_count(), 2);
    assert_eq!(orch.templates().await, vec![DEFAULT_TEMPLATE.to_string()]);

    let outcome = orch.process_query("Where are the fire exits?").await;
    match &outcome {
        QueryOutcome::Answered {
            answer,
            validation,
            recommendation,
            ..
        } => {
            assert_eq!(answer, "1. Walk to the north side.");
            assert_eq!(validation.relevance, 5);
            assert!(validation.accuracy);
            assert_eq!(validation.completeness, 4);
            assert!(!validation.sources);
            assert!(recommendation.is_none());
        }
        QueryOutcome::Failed { error } => panic!("pipeline failed: {}", error),
    }

    // Only the matching passage clears the similarity floor.
    let history = orch.dialog_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].context, FIRE_TEXT);
    assert!(history[0].prompt.contains("Question: Where are the fire exits?"));

    // One generation plus six judges, no rewrite.
    assert_eq!(script.prompts().len(), 7);

    assert!(orch.add_feedback("Where are the fire exits?", "Use the north exit."));
    assert!(!orch.add_feedback("Never asked", "Anything."));
    assert_eq!(orch.feedback_examples()[0].ideal_answer, "Use the north exit.");

    // Feedback survives the orchestrator through the feedback file.
    let example = orch.feedback_examples().pop().unwrap();
    rag_harness::batch::append_feedback(&config.feedback.path, &example).unwrap();
    drop(orch);
    let saved: serde_json::Value = serde_json::from_str(
        fs::read_to_string(&config.feedback.path)
            .unwrap()
            .lines()
            .next()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(saved["query"], "Where are the fire exits?");
    assert_eq!(saved["ideal_answer"], "Use the north exit.");
    assert_eq!(saved["context"], FIRE_TEXT);
}

#[tokio::test]
async fn test_low_relevance_appends_recommendation() {
    let tmp = tempfile::tempdir().unwrap();
    let config = setup(tmp.path());
    let script = Arc::new(Script::new(judge_rules("2")));
    let orch = bootstrap(&config, Arc::clone(&script)).await;

    let outcome = orch.process_query("Where are the fire exits?").await;
    let answer = outcome.answer().unwrap();
    assert!(answer.starts_with("1. Walk to the north side."));
    assert!(answer.contains("Recommendation:"));
    assert!(answer.ends_with("1. Use the north exit [SP 112.13330.2022]."));

    let stats = orch.validation_stats();
    assert_eq!(stats.count, 1);
    assert!((stats.recommendation_rate - 1.0).abs() < f32::EPSILON);
    assert!((stats.mean_relevance - 2.0).abs() < f32::EPSILON);
}

#[tokio::test]
async fn test_batch_writes_results_with_empty_answer_for_failures() {
    let tmp = tempfile::tempdir().unwrap();
    let config = setup(tmp.path());
    let orch = bootstrap(&config, Arc::new(Script::new(judge_rules("5")))).await;

    let questions = tmp.path().join("questions.txt");
    fs::write(
        &questions,
        "Where are the fire exits?\n\nThis one is unembeddable\n",
    )
    .unwrap();

    let out_dir = tmp.path().join("results");
    let path = rag_harness::batch::run_batch(&orch, &questions, &out_dir)
        .await
        .unwrap();

    let file_name = path.file_name().unwrap().to_string_lossy().to_string();
    assert!(file_name.starts_with("batch_results_"));
    assert!(file_name.ends_with(".json"));

    let results: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(
        results,
        serde_json::json!([
            {"question": "Where are the fire exits?", "answer": "1. Walk to the north side."},
            {"question": "This one is unembeddable", "answer": ""},
        ])
    );
}

#[tokio::test]
async fn test_templates_persist_and_select_closest() {
    let tmp = tempfile::tempdir().unwrap();
    let store = tmp.path().join("prompts_db.json");

    {
        let mut selector = TemplateSelector::open(&store, Arc::new(KeywordEmbedder))
            .await
            .unwrap();
        selector.ensure_default(DEFAULT_TEMPLATE).await.unwrap();
        selector
            .add("Fire procedure. Context: {context} Question: {query}")
            .await
            .unwrap();
        selector
            .add("Flood procedure. Context: {context} Question: {query}")
            .await
            .unwrap();
    }

    let reopened = TemplateSelector::open(&store, Arc::new(KeywordEmbedder))
        .await
        .unwrap();
    assert_eq!(reopened.len(), 3);

    let chosen = reopened.select("flood in the basement").await.unwrap();
    assert!(chosen.unwrap().starts_with("Flood procedure."));
    let chosen = reopened.select("general question").await.unwrap();
    assert_eq!(chosen.as_deref(), Some(DEFAULT_TEMPLATE));
}

#[tokio::test]
async fn test_watcher_applies_corpus_changes() {
    let tmp = tempfile::tempdir().unwrap();
    let config = setup(tmp.path());
    let manager =
        Arc::new(DocumentIndexManager::new(&config, Arc::new(KeywordEmbedder)).unwrap());
    manager.create_index().await.unwrap();

    let watcher = IndexWatcher::detached(Arc::clone(&manager));
    let fire_file = config.corpus.dir.join("fire.json");
    fs::write(
        &fire_file,
        serde_json::json!([
            {"text": FIRE_TEXT, "metadata": {}},
            {"text": "Fire extinguishers hang by every staircase.", "metadata": {}},
        ])
        .to_string(),
    )
    .unwrap();
    watcher.sender().send(IndexEvent::Updated(fire_file)).unwrap();
    assert_eq!(watcher.stop().await, 1);

    assert_eq!(manager.chunk_count(), 3);
    let hits = manager.search("fire", 10, 0.6).await;
    assert_eq!(hits.len(), 2);

    // The update is durable.
    let reopened = DocumentIndexManager::new(&config, Arc::new(KeywordEmbedder)).unwrap();
    assert_eq!(reopened.chunk_count(), 3);
}
