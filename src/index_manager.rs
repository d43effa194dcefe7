//! Document index lifecycle: build, incremental update, persistence, search.
//!
//! [`DocumentIndexManager`] owns the in-memory [`VectorIndex`] and the index
//! directory. Mutations (full build, per-file update, persistence) are
//! serialised by one async mutex. Readers take an `Arc` snapshot of the
//! current index and search it without waiting on the writer; a writer
//! mutates a copy and swaps it in when the mutation is complete.
//!
//! # Persistence
//!
//! Artifacts are first written into `index_dir/temp_{unix_millis}`, then
//! moved into place one file at a time (delete destination, rename). Every
//! write stamps the three artifacts with one generation id, so a directory
//! interrupted between two moves fails to load and is rebuilt rather than
//! served half-old, half-new.

use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

use crate::chunk::chunk_document;
use crate::config::{Config, CorpusConfig};
use crate::corpus::{load_corpus_file, scan_corpus, source_key};
use crate::embedding::{embed_in_batches, Embedder};
use crate::error::{RagError, Result};
use crate::models::{Chunk, IndexEntry, SearchHit};
use crate::vector_index::{artifacts_present, VectorIndex, ARTIFACTS};

const TEMP_PREFIX: &str = "temp_";

pub struct DocumentIndexManager {
    config: Config,
    embedder: Arc<dyn Embedder>,
    index: RwLock<Option<Arc<VectorIndex>>>,
    write_lock: Mutex<()>,
}

impl DocumentIndexManager {
    /// Prepare directories and load a persisted index if one is present.
    ///
    /// A corrupted index is deleted here, leaving the manager unloaded so
    /// the caller can rebuild with [`create_index`](Self::create_index).
    pub fn new(config: &Config, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let expected = config.index.expected_dims;
        if embedder.dims() != expected {
            return Err(RagError::DimensionMismatch {
                expected,
                actual: embedder.dims(),
            });
        }

        fs::create_dir_all(&config.corpus.dir)?;
        fs::create_dir_all(&config.index.dir)?;
        if let Some(parent) = config.index.error_log.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let manager = Self {
            config: config.clone(),
            embedder,
            index: RwLock::new(None),
            write_lock: Mutex::new(()),
        };
        manager.load_index()?;
        Ok(manager)
    }

    pub fn corpus_config(&self) -> &CorpusConfig {
        &self.config.corpus
    }

    pub fn index_dir(&self) -> &Path {
        &self.config.index.dir
    }

    /// Whether every index artifact exists on disk.
    pub fn index_exists(&self) -> bool {
        artifacts_present(&self.config.index.dir)
    }

    /// Whether an index is loaded in memory and searchable.
    pub fn is_loaded(&self) -> bool {
        self.snapshot().is_some()
    }

    pub fn chunk_count(&self) -> usize {
        self.snapshot().map(|index| index.len()).unwrap_or(0)
    }

    /// Load the persisted index. Returns whether an index is now loaded.
    pub fn load_index(&self) -> Result<bool> {
        self.remove_stale_temp_dirs();

        if !self.index_exists() {
            tracing::info!(dir = %self.config.index.dir.display(), "no persisted index found");
            self.install(None);
            return Ok(false);
        }

        let expected = self.config.index.expected_dims;
        match VectorIndex::read_from(&self.config.index.dir) {
            Ok(index) if index.dims() == expected => {
                tracing::info!(chunks = index.len(), "index loaded");
                self.install(Some(Arc::new(index)));
                Ok(true)
            }
            Ok(index) => {
                tracing::warn!(
                    found = index.dims(),
                    expected,
                    "persisted index has a different embedding width, discarding it"
                );
                self.delete_corrupted_index()?;
                Ok(false)
            }
            Err(e) => {
                tracing::warn!(error = %e, "persisted index is unreadable, deleting it");
                self.delete_corrupted_index()?;
                Ok(false)
            }
        }
    }

    /// Build the index from scratch when none is loaded. Returns the chunk count.
    pub async fn ensure_index(&self) -> Result<usize> {
        if let Some(index) = self.snapshot() {
            return Ok(index.len());
        }
        self.create_index().await
    }

    /// Rebuild the whole index from the corpus and persist it.
    pub async fn create_index(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        self.rebuild_locked().await
    }

    /// Re-ingest one corpus file and merge its chunks into the index.
    ///
    /// Failures are appended to the error log and returned; the previously
    /// persisted index is left untouched.
    pub async fn handle_document_update(&self, path: &Path) -> Result<usize> {
        tracing::info!(file = %path.display(), "document changed, updating index");

        let result = self.apply_update(path).await;
        match &result {
            Ok(chunks) => tracing::info!(file = %path.display(), chunks, "index updated"),
            Err(e) => {
                tracing::error!(file = %path.display(), error = %e, "index update failed");
                self.log_error(path, &e.to_string());
            }
        }
        result
    }

    /// Nearest chunks to `query` scoring at least `min_score`, best first.
    ///
    /// Never fails: with no index loaded, or when the query cannot be
    /// embedded, the result is empty.
    pub async fn search(&self, query: &str, top_k: usize, min_score: f32) -> Vec<SearchHit> {
        let Some(index) = self.snapshot() else {
            tracing::debug!("search requested before an index was loaded");
            return Vec::new();
        };

        let embedding = match self.embedder.embed_one(query).await {
            Ok(embedding) => embedding,
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed");
                return Vec::new();
            }
        };

        match index.search(&embedding, top_k) {
            Ok(results) => results
                .into_iter()
                .filter(|(score, _)| *score >= min_score)
                .map(|(score, entry)| SearchHit {
                    text: entry.text.clone(),
                    score,
                })
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "index search failed");
                Vec::new()
            }
        }
    }

    /// Write `index` to the index directory via a temporary directory.
    pub fn atomic_persist(&self, index: &VectorIndex) -> Result<()> {
        let temp_dir = self.config.index.dir.join(format!(
            "{}{}",
            TEMP_PREFIX,
            Utc::now().timestamp_millis()
        ));

        let result = self.persist_via(&temp_dir, index, None);

        if temp_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&temp_dir) {
                tracing::warn!(dir = %temp_dir.display(), error = %e, "failed to remove temp dir");
            }
        }

        result.map_err(|e| match e {
            RagError::Persistence(_) => e,
            other => RagError::Persistence(other.to_string()),
        })
    }

    /// Append `{timestamp} | {file name} | {message}` to the error log.
    pub fn log_error(&self, path: &Path, message: &str) {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        let line = format!(
            "{} | {} | {}\n",
            Utc::now().to_rfc3339(),
            file_name,
            message.replace('\n', " ")
        );

        let log_path = &self.config.index.error_log;
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(e) = written {
            tracing::error!(log = %log_path.display(), error = %e, "failed to write error log");
        }
    }

    async fn rebuild_locked(&self) -> Result<usize> {
        tracing::info!(corpus = %self.config.corpus.dir.display(), "building index");

        let files = scan_corpus(&self.config.corpus)?;
        let mut chunks = Vec::new();
        for path in &files {
            match load_corpus_file(path, &self.config.corpus.dir) {
                Ok(documents) => {
                    for doc in &documents {
                        chunks.extend(chunk_document(doc, &self.config.chunking));
                    }
                }
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "skipping corpus file");
                    self.log_error(path, &e.to_string());
                }
            }
        }

        if chunks.is_empty() {
            return Err(RagError::NoDocuments);
        }

        let previous = self.snapshot();
        let entries = self.embed_chunks(&chunks, previous.as_deref()).await?;

        let mut index = VectorIndex::new(self.config.index.expected_dims);
        for entry in entries {
            index.upsert(entry)?;
        }

        let index = Arc::new(index);
        self.install(Some(Arc::clone(&index)));
        self.atomic_persist(&index)?;

        tracing::info!(files = files.len(), chunks = index.len(), "index built");
        Ok(index.len())
    }

    async fn apply_update(&self, path: &Path) -> Result<usize> {
        let _guard = self.write_lock.lock().await;

        let Some(current) = self.snapshot() else {
            tracing::info!("no index loaded, building from the whole corpus");
            return self.rebuild_locked().await;
        };

        let documents = load_corpus_file(path, &self.config.corpus.dir)?;
        let chunks: Vec<Chunk> = documents
            .iter()
            .flat_map(|doc| chunk_document(doc, &self.config.chunking))
            .collect();
        let entries = self.embed_chunks(&chunks, Some(current.as_ref())).await?;

        // The file's new contents replace everything it contributed before.
        let mut next = (*current).clone();
        let removed = next.remove_source(&source_key(path, &self.config.corpus.dir));
        tracing::debug!(removed, added = entries.len(), "replacing file chunks");
        for entry in entries {
            next.upsert(entry)?;
        }

        let next = Arc::new(next);
        self.install(Some(Arc::clone(&next)));
        self.atomic_persist(&next)?;

        Ok(chunks.len())
    }

    /// Embed chunks, reusing stored vectors for chunks whose text is unchanged.
    async fn embed_chunks(
        &self,
        chunks: &[Chunk],
        previous: Option<&VectorIndex>,
    ) -> Result<Vec<IndexEntry>> {
        let reused: Vec<Option<Vec<f32>>> = chunks
            .iter()
            .map(|chunk| {
                previous
                    .and_then(|index| index.get(&chunk.id))
                    .filter(|entry| entry.hash == chunk.hash)
                    .map(|entry| entry.embedding.clone())
            })
            .collect();

        let pending: Vec<String> = chunks
            .iter()
            .zip(&reused)
            .filter(|(_, reused)| reused.is_none())
            .map(|(chunk, _)| chunk.text.clone())
            .collect();
        tracing::debug!(
            total = chunks.len(),
            embedding = pending.len(),
            "embedding chunks"
        );

        let mut fresh = embed_in_batches(
            self.embedder.as_ref(),
            &pending,
            self.config.embedding.batch_size,
        )
        .await?
        .into_iter();

        let expected = self.config.index.expected_dims;
        let mut entries = Vec::with_capacity(chunks.len());
        for (chunk, reused) in chunks.iter().zip(reused) {
            let embedding = match reused {
                Some(embedding) => embedding,
                None => fresh.next().ok_or_else(|| {
                    RagError::Embedding("backend returned too few vectors".to_string())
                })?,
            };
            if embedding.len() != expected {
                return Err(RagError::DimensionMismatch {
                    expected,
                    actual: embedding.len(),
                });
            }
            entries.push(IndexEntry {
                chunk_id: chunk.id.clone(),
                embedding,
                text: chunk.text.clone(),
                hash: chunk.hash.clone(),
                metadata: chunk.metadata.clone(),
            });
        }
        Ok(entries)
    }

    /// Write into `temp_dir`, then move each artifact into place.
    ///
    /// `stop_after` abandons the move after that many file operations,
    /// leaving the directory as a crash at that point would.
    fn persist_via(
        &self,
        temp_dir: &Path,
        index: &VectorIndex,
        stop_after: Option<usize>,
    ) -> Result<()> {
        fs::create_dir_all(temp_dir)?;
        index.write_to(temp_dir)?;

        let interrupted = || RagError::Persistence("persist interrupted".to_string());
        let mut steps = 0usize;
        for name in ARTIFACTS {
            let dest = self.config.index.dir.join(name);
            if dest.exists() {
                if stop_after == Some(steps) {
                    return Err(interrupted());
                }
                fs::remove_file(&dest)?;
                steps += 1;
            }
            if stop_after == Some(steps) {
                return Err(interrupted());
            }
            fs::rename(temp_dir.join(name), &dest)?;
            steps += 1;
        }
        Ok(())
    }

    fn delete_corrupted_index(&self) -> Result<()> {
        for name in ARTIFACTS {
            let path = self.config.index.dir.join(name);
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        self.install(None);
        Ok(())
    }

    fn remove_stale_temp_dirs(&self) {
        let Ok(entries) = fs::read_dir(&self.config.index.dir) else {
            return;
        };
        let stale: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX))
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();

        for dir in stale {
            tracing::debug!(dir = %dir.display(), "removing leftover temp dir");
            if let Err(e) = fs::remove_dir_all(&dir) {
                tracing::warn!(dir = %dir.display(), error = %e, "failed to remove temp dir");
            }
        }
    }

    fn snapshot(&self) -> Option<Arc<VectorIndex>> {
        match self.index.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn install(&self, index: Option<Arc<VectorIndex>>) {
        match self.index.write() {
            Ok(mut guard) => *guard = index,
            Err(poisoned) => *poisoned.into_inner() = index,
        }
    }
}
