//! Core data models used throughout the answer pipeline.
//!
//! These types represent the documents, chunks, index hits, validation
//! verdicts, and dialog records that flow from ingestion to answer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One item of a corpus file, before chunking.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub raw_text: String,
    /// Path of the corpus file relative to the corpus root, `/`-separated.
    pub source_file: String,
    pub source_metadata: Map<String, Value>,
}

/// A bounded slice of a document's text; the unit of embedding and retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// `{doc_id}_part_{chunk_index}`.
    pub id: String,
    pub text: String,
    /// SHA-256 of `text`, used to skip re-embedding unchanged chunks.
    pub hash: String,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub doc_id: String,
    pub chunk_index: usize,
    /// Corpus file the chunk came from; an update of that file replaces all of them.
    #[serde(default)]
    pub source_file: String,
    /// Length of the whole document text, in characters.
    pub original_length: usize,
    /// Source item metadata, carried through verbatim.
    #[serde(default)]
    pub extra: Map<String, Value>,
}

/// A stored vector together with the chunk it was computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub chunk_id: String,
    pub embedding: Vec<f32>,
    pub text: String,
    pub hash: String,
    pub metadata: ChunkMetadata,
}

/// A retrieval result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub text: String,
    pub score: f32,
}

/// Rubric verdict for one (query, context, response) triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    /// 1–5; 0 when the judge reply was unreadable.
    pub relevance: u8,
    pub accuracy: bool,
    /// Number of checklist items satisfied, 0–5.
    pub completeness: u8,
    /// `true` when the judge reported safety violations.
    pub safety: bool,
    pub structure: bool,
    pub sources: bool,
}

impl ValidationResult {
    /// Whether a corrective rewrite is requested.
    ///
    /// Only relevance and accuracy trigger it; the other axes are recorded
    /// but never cause regeneration on their own.
    pub fn needs_recommendation(&self) -> bool {
        self.relevance < 3 || !self.accuracy
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DialogTurn {
    pub timestamp: DateTime<Utc>,
    pub query: String,
    pub context: String,
    pub prompt: String,
    pub response: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackExample {
    #[serde(flatten)]
    pub turn: DialogTurn,
    pub ideal_answer: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationRecord {
    pub timestamp: DateTime<Utc>,
    pub query: String,
    pub response: String,
    pub validation: ValidationResult,
    pub recommendation: Option<String>,
}

/// Result of one pass through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Answered {
        /// Response plus the appended recommendation, if any.
        answer: String,
        response: String,
        validation: ValidationResult,
        recommendation: Option<String>,
    },
    Failed {
        error: String,
    },
}

impl QueryOutcome {
    pub fn answer(&self) -> Option<&str> {
        match self {
            QueryOutcome::Answered { answer, .. } => Some(answer),
            QueryOutcome::Failed { .. } => None,
        }
    }

    pub fn is_answered(&self) -> bool {
        matches!(self, QueryOutcome::Answered { .. })
    }
}
