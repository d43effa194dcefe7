//! Batch answering of a question list, and feedback export.
//!
//! Reads one question per line, answers each through the orchestrator, and
//! writes `[{"question": ..., "answer": ...}]` as pretty JSON to
//! `batch_results_{YYYYMMDD_HHMM}.json` in the output directory. Questions
//! whose pipeline run failed are written with an empty answer.
//!
//! Feedback examples are appended one JSON object per line to a feedback
//! file, so they outlive the process that recorded them.

use anyhow::{Context, Result};
use chrono::Local;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::models::FeedbackExample;
use crate::orchestrator::QueryOrchestrator;

#[derive(Debug, Serialize)]
pub struct BatchEntry {
    pub question: String,
    pub answer: String,
}

/// Non-blank, trimmed lines of a question file.
pub fn read_questions(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read questions file: {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Answer every question in order. Failed runs yield an empty answer.
pub async fn answer_all(orchestrator: &QueryOrchestrator, questions: &[String]) -> Vec<BatchEntry> {
    let mut entries = Vec::with_capacity(questions.len());
    for (i, question) in questions.iter().enumerate() {
        tracing::info!(current = i + 1, total = questions.len(), "answering batch question");
        let outcome = orchestrator.process_query(question).await;
        entries.push(BatchEntry {
            question: question.clone(),
            answer: outcome.answer().unwrap_or_default().to_string(),
        });
    }
    entries
}

/// Run a whole batch and return the path of the results file.
pub async fn run_batch(
    orchestrator: &QueryOrchestrator,
    questions_file: &Path,
    output_dir: &Path,
) -> Result<PathBuf> {
    let questions = read_questions(questions_file)?;
    if questions.is_empty() {
        anyhow::bail!("No questions found in {}", questions_file.display());
    }

    let entries = answer_all(orchestrator, &questions).await;

    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output directory: {}", output_dir.display()))?;
    let path = output_dir.join(format!(
        "batch_results_{}.json",
        Local::now().format("%Y%m%d_%H%M")
    ));
    let json = serde_json::to_string_pretty(&entries)?;
    std::fs::write(&path, json)
        .with_context(|| format!("Failed to write batch results: {}", path.display()))?;

    eprintln!(
        "Answered {} questions, results saved to {}",
        entries.len(),
        path.display()
    );
    Ok(path)
}

/// Append `example` as one JSON line to `path`, creating the file if needed.
pub fn append_feedback(path: &Path, example: &FeedbackExample) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create feedback directory: {}", parent.display())
            })?;
        }
    }

    let mut line = serde_json::to_string(example)?;
    line.push('\n');
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| file.write_all(line.as_bytes()))
        .with_context(|| format!("Failed to write feedback file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DialogTurn;
    use chrono::Utc;

    fn example(query: &str, ideal: &str) -> FeedbackExample {
        FeedbackExample {
            turn: DialogTurn {
                timestamp: Utc::now(),
                query: query.to_string(),
                context: "Exits are north.".to_string(),
                prompt: format!("Question: {}", query),
                response: "Go south.".to_string(),
            },
            ideal_answer: ideal.to_string(),
        }
    }

    #[test]
    fn test_feedback_is_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/feedback.jsonl");

        append_feedback(&path, &example("Where are the exits?", "North side.")).unwrap();
        append_feedback(&path, &example("Who calls 112?", "The shift lead.")).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["query"], "Where are the exits?");
        assert_eq!(lines[0]["ideal_answer"], "North side.");
        assert_eq!(lines[0]["response"], "Go south.");
        assert_eq!(lines[1]["ideal_answer"], "The shift lead.");
    }

    #[test]
    fn test_read_questions_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.txt");
        std::fs::write(&path, "How to evacuate?\n\n   \n  Where is the hydrant?  \n").unwrap();

        let questions = read_questions(&path).unwrap();
        assert_eq!(questions, vec!["How to evacuate?", "Where is the hydrant?"]);
    }

    #[test]
    fn test_missing_questions_file() {
        assert!(read_questions(Path::new("/no/such/questions.txt")).is_err());
    }

    #[test]
    fn test_entry_serializes_as_question_answer() {
        let entry = BatchEntry {
            question: "Q".to_string(),
            answer: String::new(),
        };
        assert_eq!(
            serde_json::to_value(&entry).unwrap(),
            serde_json::json!({"question": "Q", "answer": ""})
        );
    }
}
