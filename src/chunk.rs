//! Sentence-aware text chunker.
//!
//! Packs whole sentences into [`Chunk`]s of at most `chunk_size` units,
//! carrying the trailing sentences of each chunk (up to `overlap` units)
//! into the next one for continuity. Sentences longer than a whole chunk
//! are hard-split on whitespace.
//!
//! The splitter is a pure function of its input, so re-ingesting the same
//! document always yields the same chunk ids and texts.

use sha2::{Digest, Sha256};

use crate::config::ChunkingConfig;
use crate::models::{Chunk, ChunkMetadata, Document};

/// Approximate chars-per-token ratio; one unit is one approximate token.
const CHARS_PER_TOKEN: usize = 4;

/// Split a document into chunks with ids `{doc_id}_part_{index}`.
pub fn chunk_document(doc: &Document, config: &ChunkingConfig) -> Vec<Chunk> {
    let original_length = doc.raw_text.chars().count();

    split_text(&doc.raw_text, config.chunk_size, config.overlap)
        .into_iter()
        .enumerate()
        .map(|(index, text)| Chunk {
            id: format!("{}_part_{}", doc.id, index),
            hash: hash_text(&text),
            text,
            metadata: ChunkMetadata {
                doc_id: doc.id.clone(),
                chunk_index: index,
                source_file: doc.source_file.clone(),
                original_length,
                extra: doc.source_metadata.clone(),
            },
        })
        .collect()
}

/// Split text into chunk strings. Whitespace-only input yields no chunks.
pub fn split_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let max_chars = chunk_size.max(1) * CHARS_PER_TOKEN;
    let overlap_chars = overlap * CHARS_PER_TOKEN;

    let mut pieces: Vec<&str> = Vec::new();
    for sentence in split_sentences(text) {
        if char_len(sentence) > max_chars {
            pieces.extend(hard_split(sentence, max_chars));
        } else {
            pieces.push(sentence);
        }
    }

    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_len = 0usize;

    for piece in pieces {
        let piece_len = char_len(piece);

        if current_len + piece_len > max_chars && !current.is_empty() {
            push_chunk(&mut chunks, &current);

            // Carry trailing sentences into the next chunk
            let mut tail_start = current.len();
            let mut tail_len = 0usize;
            while tail_start > 0 {
                let len = char_len(current[tail_start - 1]);
                if tail_len + len > overlap_chars {
                    break;
                }
                tail_len += len;
                tail_start -= 1;
            }
            current.drain(..tail_start);
            current_len = tail_len;

            if current_len + piece_len > max_chars {
                current.clear();
                current_len = 0;
            }
        }

        current.push(piece);
        current_len += piece_len;
    }

    if !current.is_empty() {
        push_chunk(&mut chunks, &current);
    }

    chunks
}

fn push_chunk(chunks: &mut Vec<String>, pieces: &[&str]) {
    let joined = pieces.concat();
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

/// Split text into sentence segments, dropping leading whitespace.
///
/// A sentence ends after `.`, `!`, `?` or `…` followed by whitespace, or
/// at a newline. Trailing whitespace stays with the sentence it follows.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut start = 0usize;
    let mut chars = text.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        let at_boundary = match c {
            '\n' => true,
            '.' | '!' | '?' | '…' => {
                let followed_by_space =
                    chars.peek().map_or(true, |(_, next)| next.is_whitespace());
                followed_by_space && !is_list_marker(&text[start..idx])
            }
            _ => false,
        };
        if !at_boundary {
            continue;
        }

        let mut end = idx + c.len_utf8();
        while let Some(&(next_idx, next)) = chars.peek() {
            if !next.is_whitespace() {
                break;
            }
            end = next_idx + next.len_utf8();
            chars.next();
        }

        if !text[start..end].trim().is_empty() {
            segments.push(&text[start..end]);
        }
        start = end;
    }

    if start < text.len() && !text[start..].trim().is_empty() {
        segments.push(&text[start..]);
    }

    segments
}

/// Split an over-long sentence at whitespace so each piece fits `max_chars`.
fn hard_split(sentence: &str, max_chars: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut remaining = sentence;

    while char_len(remaining) > max_chars {
        let limit = remaining
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());
        let window = &remaining[..limit];
        let split_at = window
            .rfind(char::is_whitespace)
            .filter(|&pos| pos > 0)
            .map(|pos| pos + window[pos..].chars().next().map_or(1, char::len_utf8))
            .unwrap_or(limit);
        pieces.push(&remaining[..split_at]);
        remaining = &remaining[split_at..];
    }

    if !remaining.is_empty() {
        pieces.push(remaining);
    }
    pieces
}

/// `"1"` in `"1. Call dispatch"` does not end a sentence.
fn is_list_marker(prefix: &str) -> bool {
    let prefix = prefix.trim();
    !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_digit())
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn doc(id: &str, text: &str) -> Document {
        Document {
            id: id.to_string(),
            raw_text: text.to_string(),
            source_file: format!("{}.json", id),
            source_metadata: Map::new(),
        }
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = split_text("Hello, world!", 1024, 128);
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn test_empty_text_no_chunks() {
        assert!(split_text("", 1024, 128).is_empty());
        assert!(split_text("   \n\n ", 1024, 128).is_empty());
    }

    #[test]
    fn test_sentences_kept_whole() {
        // chunk_size=5 => 20 chars
        let text = "One two three. Four five six. Seven eight.";
        let chunks = split_text(text, 5, 0);
        assert_eq!(
            chunks,
            vec!["One two three.", "Four five six.", "Seven eight."]
        );
    }

    #[test]
    fn test_overlap_repeats_trailing_sentence() {
        // chunk_size=10 => 40 chars, overlap=4 => 16 chars
        let text = "Alpha is first. Beta is next. Gamma is third. Delta is last.";
        let chunks = split_text(text, 10, 4);
        assert!(chunks.len() > 1);
        assert!(chunks[0].ends_with("Beta is next."));
        assert!(chunks[1].starts_with("Beta is next."));
    }

    #[test]
    fn test_chunks_respect_size() {
        let text = (0..200)
            .map(|i| format!("Sentence number {} is here.", i))
            .collect::<Vec<_>>()
            .join(" ");
        for chunk in split_text(&text, 16, 4) {
            assert!(chunk.chars().count() <= 64, "oversized chunk: {}", chunk);
        }
    }

    #[test]
    fn test_long_sentence_hard_split() {
        let text = "word ".repeat(100);
        let chunks = split_text(&text, 5, 0);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 20);
        }
    }

    #[test]
    fn test_cyrillic_counted_by_chars() {
        let text = "Пожар в здании. Эвакуация людей. Проверка выходов.";
        let chunks = split_text(text, 5, 0);
        assert_eq!(chunks[0], "Пожар в здании.");
    }

    #[test]
    fn test_newline_is_boundary() {
        let text = "1. Call dispatch\n2. Evacuate\n3. Report";
        let chunks = split_text(text, 1024, 0);
        assert_eq!(chunks, vec![text.to_string()]);
        let small = split_text(text, 5, 0);
        assert_eq!(small[0], "1. Call dispatch");
    }

    #[test]
    fn test_chunk_ids_and_metadata() {
        let d = doc("manual", "First. Second. Third.");
        let chunks = chunk_document(
            &d,
            &ChunkingConfig {
                chunk_size: 2,
                overlap: 0,
            },
        );
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.id, format!("manual_part_{}", i));
            assert_eq!(c.metadata.chunk_index, i);
            assert_eq!(c.metadata.doc_id, "manual");
            assert_eq!(c.metadata.original_length, 21);
        }
    }

    #[test]
    fn test_deterministic() {
        let d = doc("doc1", "Alpha beta. Gamma delta! Epsilon? Zeta eta theta.");
        let config = ChunkingConfig {
            chunk_size: 4,
            overlap: 2,
        };
        let c1 = chunk_document(&d, &config);
        let c2 = chunk_document(&d, &config);
        assert_eq!(c1, c2);
    }
}
