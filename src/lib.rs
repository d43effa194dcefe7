//! # RAG Harness
//!
//! A retrieval-augmented answer pipeline for domain questions.
//!
//! Questions are answered by retrieving passages from an indexed JSON
//! corpus, picking the closest instruction template, calling a
//! chat-completions service, and judging the answer against a six-axis
//! rubric. Answers that score poorly get a generated rewrite appended.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌───────────────┐
//! │ Corpus JSON │──▶│ Chunk+Embed  │──▶│  VectorIndex   │
//! │  + watcher  │   │ (index mgr)  │   │ (3 artifacts)  │
//! └─────────────┘   └──────────────┘   └───────┬───────┘
//!                                              │ search
//!  query ──▶ ┌──────────────┐  template  ┌──────▼───────┐
//!            │  Template    │───────────▶│ Orchestrator │──▶ answer
//!            │  selector    │            └──────┬───────┘
//!            └──────────────┘          generate │ validate
//!                                        ┌──────▼───────┐
//!                                        │ LLM + judge  │
//!                                        └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rag index create                   # build the index from ./documents
//! rag ask "How do I evacuate floor 3?"
//! rag batch questions.txt            # answer a list, write JSON results
//! rag watch                          # keep the index in sync with the corpus
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`logging`] | Tracing subscriber setup |
//! | [`models`] | Core data types |
//! | [`corpus`] | Corpus discovery and JSON parsing |
//! | [`chunk`] | Sentence-aware chunking |
//! | [`embedding`] | Embedding backends |
//! | [`vector_index`] | Flat vector index and its on-disk artifacts |
//! | [`index_manager`] | Index build, update, persistence, search |
//! | [`watcher`] | Background corpus watcher |
//! | [`templates`] | Template store and selection |
//! | [`generation`] | Chat-completions client with retry |
//! | [`validation`] | Rubric judge and recommendations |
//! | [`orchestrator`] | The query pipeline |
//! | [`batch`] | Batch answering |

pub mod batch;
pub mod chunk;
pub mod config;
pub mod corpus;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod index_manager;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod templates;
pub mod validation;
pub mod vector_index;
pub mod watcher;

#[cfg(test)]
mod testing;
