//! Background corpus watcher.
//!
//! File-system notifications are filtered down to corpus files and sent as
//! [`IndexEvent`]s over an unbounded channel. One consumer task applies them
//! in arrival order through
//! [`DocumentIndexManager::handle_document_update`], which takes the same
//! write lock as every other index mutation. Failed updates are logged by
//! the manager and not retried.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::corpus::CorpusFilter;
use crate::error::{RagError, Result};
use crate::index_manager::DocumentIndexManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexEvent {
    /// A corpus file was created or modified.
    Updated(PathBuf),
    /// Stop the consumer once earlier events are applied.
    Shutdown,
}

pub struct IndexWatcher {
    watcher: Option<RecommendedWatcher>,
    sender: mpsc::UnboundedSender<IndexEvent>,
    consumer: Option<JoinHandle<usize>>,
}

impl IndexWatcher {
    /// Watch the manager's corpus directory recursively.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(manager: Arc<DocumentIndexManager>) -> Result<Self> {
        let root = manager.corpus_config().dir.clone();
        let filter = CorpusFilter::new(manager.corpus_config())?;
        let (sender, receiver) = mpsc::unbounded_channel();

        let events = sender.clone();
        let mut watcher = RecommendedWatcher::new(
            move |event: notify::Result<Event>| match event {
                Ok(event) => {
                    for path in changed_corpus_files(&event, &filter) {
                        tracing::debug!(file = %path.display(), "corpus file changed");
                        let _ = events.send(IndexEvent::Updated(path));
                    }
                }
                Err(e) => tracing::warn!(error = %e, "file watch error"),
            },
            notify::Config::default(),
        )
        .map_err(|e| RagError::Configuration(format!("failed to create file watcher: {}", e)))?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| {
                RagError::Configuration(format!("failed to watch {}: {}", root.display(), e))
            })?;
        tracing::info!(dir = %root.display(), "watching corpus for changes");

        Ok(Self {
            watcher: Some(watcher),
            sender,
            consumer: Some(spawn_consumer(manager, receiver)),
        })
    }

    /// A consumer with no file-system watch; events arrive only via [`sender`](Self::sender).
    pub fn detached(manager: Arc<DocumentIndexManager>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            watcher: None,
            sender,
            consumer: Some(spawn_consumer(manager, receiver)),
        }
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<IndexEvent> {
        self.sender.clone()
    }

    /// Stop watching and wait for the consumer to finish queued events.
    ///
    /// Returns how many updates were applied successfully.
    pub async fn stop(mut self) -> usize {
        self.watcher.take();
        let _ = self.sender.send(IndexEvent::Shutdown);

        match self.consumer.take() {
            Some(handle) => match handle.await {
                Ok(applied) => applied,
                Err(e) => {
                    tracing::error!(error = %e, "index watcher task failed");
                    0
                }
            },
            None => 0,
        }
    }
}

fn spawn_consumer(
    manager: Arc<DocumentIndexManager>,
    mut receiver: mpsc::UnboundedReceiver<IndexEvent>,
) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut applied = 0usize;
        while let Some(event) = receiver.recv().await {
            match event {
                IndexEvent::Updated(path) => {
                    if manager.handle_document_update(&path).await.is_ok() {
                        applied += 1;
                    }
                }
                IndexEvent::Shutdown => break,
            }
        }
        tracing::info!(applied, "index watcher stopped");
        applied
    })
}

/// Corpus files touched by a create or modify event.
fn changed_corpus_files(event: &Event, filter: &CorpusFilter) -> Vec<PathBuf> {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return Vec::new();
    }
    event
        .paths
        .iter()
        .filter(|path| path.is_file() && filter.matches(path))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testing::ConstantEmbedder;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};
    use std::fs;
    use std::path::Path;

    fn setup(root: &Path) -> (Config, Arc<DocumentIndexManager>) {
        let mut config = Config::with_root(root);
        config.index.expected_dims = 2;
        config.embedding.dims = 2;
        fs::create_dir_all(&config.corpus.dir).unwrap();
        fs::write(
            config.corpus.dir.join("seed.json"),
            r#"{"text": "Seed text.", "metadata": {"doc_id": "seed"}}"#,
        )
        .unwrap();
        let manager = DocumentIndexManager::new(&config, Arc::new(ConstantEmbedder { dims: 2 })).unwrap();
        (config, Arc::new(manager))
    }

    #[tokio::test]
    async fn test_injected_events_are_applied_before_stop_returns() {
        let dir = tempfile::tempdir().unwrap();
        let (config, manager) = setup(dir.path());
        manager.create_index().await.unwrap();

        let path = config.corpus.dir.join("new.json");
        fs::write(
            &path,
            r#"[{"text": "First.", "metadata": {"doc_id": "n1"}},
                {"text": "Second.", "metadata": {"doc_id": "n2"}}]"#,
        )
        .unwrap();

        let watcher = IndexWatcher::detached(Arc::clone(&manager));
        let sender = watcher.sender();
        sender.send(IndexEvent::Updated(path.clone())).unwrap();
        sender.send(IndexEvent::Updated(path)).unwrap();

        assert_eq!(watcher.stop().await, 2);
        assert_eq!(manager.chunk_count(), 3);
    }

    #[tokio::test]
    async fn test_failed_update_does_not_stop_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let (config, manager) = setup(dir.path());
        manager.create_index().await.unwrap();

        let broken = config.corpus.dir.join("broken.json");
        fs::write(&broken, "[").unwrap();
        let good = config.corpus.dir.join("good.json");
        fs::write(&good, r#"{"text": "Good.", "metadata": {}}"#).unwrap();

        let watcher = IndexWatcher::detached(Arc::clone(&manager));
        let sender = watcher.sender();
        sender.send(IndexEvent::Updated(broken)).unwrap();
        sender.send(IndexEvent::Updated(good)).unwrap();

        assert_eq!(watcher.stop().await, 1);
        assert_eq!(manager.chunk_count(), 2);
    }

    #[test]
    fn test_only_created_or_modified_corpus_files_pass() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::with_root(dir.path());
        config.corpus.dir = dir.path().to_path_buf();
        let filter = CorpusFilter::new(&config.corpus).unwrap();

        let json = dir.path().join("doc.json");
        let text = dir.path().join("notes.txt");
        fs::write(&json, "{}").unwrap();
        fs::write(&text, "x").unwrap();

        let created = Event::new(EventKind::Create(CreateKind::File))
            .add_path(json.clone())
            .add_path(text);
        assert_eq!(changed_corpus_files(&created, &filter), vec![json.clone()]);

        let modified = Event::new(EventKind::Modify(ModifyKind::Any)).add_path(json.clone());
        assert_eq!(changed_corpus_files(&modified, &filter), vec![json.clone()]);

        let removed = Event::new(EventKind::Remove(RemoveKind::File)).add_path(json);
        assert!(changed_corpus_files(&removed, &filter).is_empty());
    }
}
