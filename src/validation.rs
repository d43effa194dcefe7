//! Rubric validation of generated answers.
//!
//! An answer is judged on six axes, each by its own judge prompt sent to the
//! generator. Judge replies are free text; the first matching score or
//! yes/no token (English or Russian) is taken, and a reply with no match
//! counts as failing that axis.
//!
//! | Axis | Reply | Unreadable reply |
//! |------|-------|------------------|
//! | relevance | 1–5 | 0 |
//! | accuracy | yes/no | false |
//! | completeness | 0–5 checklist items | 0 |
//! | safety | yes/no (violations found) | false |
//! | structure | yes/no | false |
//! | sources | yes/no | false |

use regex::Regex;
use std::sync::{Arc, LazyLock};

use crate::config::ValidationConfig;
use crate::generation::{is_failure_sentinel, Generator};
use crate::models::ValidationResult;
use crate::templates::substitute;

/// Returned by [`ResponseValidator::recommend`] when no rewrite could be generated.
pub const RECOMMENDATION_FALLBACK: &str =
    "Recommendations unavailable. The answer needs review by an expert.";

/// Context shown to the rewrite prompt is cut to this many characters.
const CONTEXT_LIMIT: usize = 2000;

static RELEVANCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[1-5]\b").expect("relevance pattern"));
static COMPLETENESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[0-5]\b").expect("completeness pattern"));
static YES_NO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(yes|no|да|нет)\b").expect("yes/no pattern"));
static DOC_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[(?:doc|normative|док|норматив)\s*(\d+)\]").expect("reference pattern")
});
static DANGER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(danger|warning|caution|опасно|внимание|предупреждение)")
        .expect("danger pattern")
});

const RELEVANCE_PROMPT: &str = "Rate how relevant the answer is to the question on a scale of 1-5. \
The answer must strictly follow emergency-service requirements:
1 - The answer does not match the question
3 - Partial match, key stages missing
5 - Full match with a step-by-step procedure

Question: {query}
Answer: {response}

Score (digit only):";

const ACCURACY_PROMPT: &str = "Does the answer comply with the following documents? ({references})
Context: {context}
Answer: {response}

Requirements:
1. All technical parameters must comply with {primary_reference}
2. Actions must comply with {secondary_reference}

Reply (strictly YES/NO):";

const COMPLETENESS_PROMPT: &str = "Check the completeness of the answer against the checklist:
1. Numbered stages are present
2. Danger zones are identified
3. Regulatory documents are referenced
4. Evacuation protocols are given
5. Personal protective equipment is named

Answer: {response}

Number of items satisfied (digit 0-5):";

const SAFETY_PROMPT: &str = "Identify safety violations according to:
{references}

Answer: {response}

Violations found? (YES/NO):";

const STRUCTURE_PROMPT: &str = "Does the answer follow the format of a service instruction?
1. Clear structure of commands
2. Standard wording
3. Areas of responsibility are assigned

Answer: {response}

Reply (YES/NO):";

const SOURCES_PROMPT: &str = "Check the answer for mandatory references to:
{references}

Answer: {response}

References found? (YES/NO):";

pub struct ResponseValidator {
    generator: Arc<dyn Generator>,
    references: Vec<String>,
}

impl ResponseValidator {
    pub fn new(generator: Arc<dyn Generator>, config: &ValidationConfig) -> Self {
        Self {
            generator,
            references: config.references.clone(),
        }
    }

    /// Judge `response` on all six axes.
    ///
    /// The template the answer was generated from is accepted for logging
    /// only; none of the judge prompts include it.
    pub async fn validate(
        &self,
        query: &str,
        context: &str,
        response: &str,
        prompt_used: &str,
    ) -> ValidationResult {
        tracing::debug!(prompt_len = prompt_used.len(), "validating response");

        let references = self.references.join(", ");
        let values = [
            ("query", query),
            ("context", context),
            ("response", response),
            ("references", references.as_str()),
            ("primary_reference", self.reference(0)),
            ("secondary_reference", self.reference(1)),
        ];
        let fill = |template: &str| substitute(template, &values);
        let prompts = [
            fill(RELEVANCE_PROMPT),
            fill(ACCURACY_PROMPT),
            fill(COMPLETENESS_PROMPT),
            fill(SAFETY_PROMPT),
            fill(STRUCTURE_PROMPT),
            fill(SOURCES_PROMPT),
        ];

        let (relevance, accuracy, completeness, safety, structure, sources) = tokio::join!(
            self.generator.generate(&prompts[0]),
            self.generator.generate(&prompts[1]),
            self.generator.generate(&prompts[2]),
            self.generator.generate(&prompts[3]),
            self.generator.generate(&prompts[4]),
            self.generator.generate(&prompts[5]),
        );

        let result = ValidationResult {
            relevance: parse_score(&relevance, &RELEVANCE_RE),
            accuracy: parse_yes_no(&accuracy),
            completeness: parse_score(&completeness, &COMPLETENESS_RE),
            safety: parse_yes_no(&safety),
            structure: parse_yes_no(&structure),
            sources: parse_yes_no(&sources),
        };
        tracing::debug!(?result, "validation finished");
        result
    }

    /// Ask for a corrected answer that fixes every failing axis.
    pub async fn recommend(
        &self,
        query: &str,
        context: &str,
        validation: &ValidationResult,
    ) -> String {
        let prompt = self.recommendation_prompt(query, context, validation);
        let reply = self.generator.generate(&prompt).await;

        if is_failure_sentinel(&reply) {
            tracing::warn!("recommendation generation failed");
            return RECOMMENDATION_FALLBACK.to_string();
        }
        let cleaned = postprocess_recommendation(&reply);
        if cleaned.is_empty() {
            return RECOMMENDATION_FALLBACK.to_string();
        }
        cleaned
    }

    fn recommendation_prompt(
        &self,
        query: &str,
        context: &str,
        validation: &ValidationResult,
    ) -> String {
        let issues = failing_axes(validation);
        let issues = if issues.is_empty() {
            "▪ General requirements are not met".to_string()
        } else {
            issues
                .iter()
                .map(|issue| format!("▪ {}", issue))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let truncated: String = context.chars().take(CONTEXT_LIMIT).collect();
        let marker = if context.chars().count() > CONTEXT_LIMIT {
            "..."
        } else {
            ""
        };

        format!(
            "You are an emergency-response expert. Rewrite the answer, fixing the following violations:\n\
             {issues}\n\n\
             **Reference context:**\n{truncated}{marker}\n\n\
             **Original question:**\n{query}\n\n\
             **Requirements for the new answer:**\n\
             1. Compliance with {references}\n\
             2. Clear structure:\n   \
                - Numbered action stages\n   \
                - Assigned areas of responsibility\n   \
                - Time frames for operations\n\
             3. Mandatory elements:\n   \
                ⚠️ Hazard warnings\n   \
                [References to regulatory documents]\n   \
                ► Equipment to be used\n\
             4. Official emergency-service terminology\n\n\
             **Answer format:**\n\
             Give ONLY the corrected answer without commentary, strictly keeping:\n\
             - Maximum specificity\n\
             - Numbered stages\n\
             - Technical requirements separated from actions",
            references = self.references.join(", "),
        )
    }

    fn reference(&self, i: usize) -> &str {
        self.references
            .get(i)
            .or_else(|| self.references.first())
            .map(String::as_str)
            .unwrap_or("the applicable regulations")
    }
}

/// Human-readable descriptions of the axes that failed.
pub fn failing_axes(validation: &ValidationResult) -> Vec<&'static str> {
    let mut issues = Vec::new();
    if validation.relevance < 3 {
        issues.push("Low relevance to the original question");
    }
    if !validation.accuracy {
        issues.push("Discrepancies with regulatory documents");
    }
    if validation.completeness < 3 {
        issues.push("Incomplete description of procedures");
    }
    if validation.safety {
        issues.push("Dangerous recommendations detected");
    }
    if !validation.structure {
        issues.push("Service instruction structure is broken");
    }
    if !validation.sources {
        issues.push("References to regulatory documents are missing");
    }
    issues
}

/// Normalise a generated rewrite for display.
///
/// `[doc N]` style references become `[N]`, danger keywords become ⚠️,
/// and markdown bold and code fences are stripped.
pub fn postprocess_recommendation(text: &str) -> String {
    let text = DOC_REF_RE.replace_all(text, "[$1]");
    let text = DANGER_RE.replace_all(&text, "⚠️");
    text.replace("**", "").replace("```", "").trim().to_string()
}

fn parse_score(reply: &str, pattern: &Regex) -> u8 {
    let reply = reply.trim().to_lowercase();
    pattern
        .find(&reply)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

fn parse_yes_no(reply: &str) -> bool {
    let reply = reply.trim().to_lowercase();
    YES_NO_RE
        .captures(&reply)
        .map(|c| matches!(&c[1], "yes" | "да"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::{EXHAUSTED_SENTINEL, TIMEOUT_SENTINEL};
    use crate::testing::ScriptedGenerator;

    fn validator(generator: ScriptedGenerator) -> (ResponseValidator, Arc<ScriptedGenerator>) {
        let generator = Arc::new(generator);
        let validator = ResponseValidator::new(
            Arc::clone(&generator) as Arc<dyn Generator>,
            &ValidationConfig::default(),
        );
        (validator, generator)
    }

    #[test]
    fn test_unreadable_score_is_zero() {
        assert_eq!(parse_score("maybe??", &RELEVANCE_RE), 0);
        assert_eq!(parse_score("I'd say 7", &RELEVANCE_RE), 0);
        assert_eq!(parse_score("Score: 4.", &RELEVANCE_RE), 4);
        assert_eq!(parse_score("0", &COMPLETENESS_RE), 0);
        assert_eq!(parse_score("3 of 5", &COMPLETENESS_RE), 3);
    }

    #[test]
    fn test_yes_no_in_both_languages() {
        assert!(parse_yes_no("YES, it complies"));
        assert!(parse_yes_no("Да"));
        assert!(!parse_yes_no("No."));
        assert!(!parse_yes_no("НЕТ"));
        assert!(!parse_yes_no("perhaps"));
        // Word boundaries keep "nothing" and "yesterday" from matching
        assert!(!parse_yes_no("nothing yesterday"));
    }

    #[tokio::test]
    async fn test_validate_parses_each_axis() {
        let (validator, generator) = validator(
            ScriptedGenerator::new("no idea")
                .rule("Rate how relevant", "4")
                .rule("Does the answer comply", "Yes")
                .rule("checklist", "Items satisfied: 2")
                .rule("safety violations", "no")
                .rule("service instruction", "да")
                .rule("mandatory references", "maybe??"),
        );

        let result = validator
            .validate("How to evacuate?", "ctx", "1. Leave.", "template")
            .await;
        assert_eq!(
            result,
            ValidationResult {
                relevance: 4,
                accuracy: true,
                completeness: 2,
                safety: false,
                structure: true,
                sources: false,
            }
        );
        assert_eq!(generator.prompts().len(), 6);
        assert!(generator
            .prompts()
            .iter()
            .any(|p| p.contains("SP 112.13330.2022")));
    }

    #[tokio::test]
    async fn test_judge_prompts_keep_placeholder_text_from_inputs() {
        let (validator, generator) = validator(ScriptedGenerator::new("no"));
        validator
            .validate(
                "What goes in {context}?",
                "Field {response} is optional",
                "See {references} and {query}",
                "template",
            )
            .await;

        let prompts = generator.prompts();
        let accuracy = prompts
            .iter()
            .find(|p| p.contains("Does the answer comply"))
            .unwrap();
        assert!(accuracy.contains("Context: Field {response} is optional"));
        assert!(accuracy.contains("Answer: See {references} and {query}"));

        let relevance = prompts
            .iter()
            .find(|p| p.contains("Rate how relevant"))
            .unwrap();
        assert!(relevance.contains("Question: What goes in {context}?"));
    }

    #[tokio::test]
    async fn test_sentinel_replies_fail_every_axis() {
        let (validator, _) = validator(ScriptedGenerator::new(TIMEOUT_SENTINEL));
        let result = validator.validate("q", "c", "r", "p").await;
        assert_eq!(result.relevance, 0);
        assert!(!result.accuracy);
        assert!(result.needs_recommendation());
    }

    #[tokio::test]
    async fn test_recommend_lists_only_failing_axes() {
        let (validator, generator) =
            validator(ScriptedGenerator::new("**Step 1.** See [doc 3]."));
        let validation = ValidationResult {
            relevance: 2,
            accuracy: true,
            completeness: 5,
            safety: false,
            structure: true,
            sources: true,
        };

        let rec = validator.recommend("q", "ctx", &validation).await;
        assert_eq!(rec, "Step 1. See [3].");

        let prompt = &generator.prompts()[0];
        assert!(prompt.contains("Low relevance"));
        assert!(!prompt.contains("Discrepancies"));
        assert!(!prompt.contains("General requirements"));
    }

    #[tokio::test]
    async fn test_recommend_with_no_failures_uses_general_issue() {
        let (validator, generator) = validator(ScriptedGenerator::new("Fixed."));
        let validation = ValidationResult {
            relevance: 5,
            accuracy: true,
            completeness: 5,
            safety: false,
            structure: true,
            sources: true,
        };
        validator.recommend("q", "ctx", &validation).await;
        assert!(generator.prompts()[0].contains("General requirements are not met"));
    }

    #[tokio::test]
    async fn test_recommend_truncates_long_context() {
        let (validator, generator) = validator(ScriptedGenerator::new("Fixed."));
        let context = "x".repeat(CONTEXT_LIMIT + 10);
        validator
            .recommend("q", &context, &ValidationResult::default())
            .await;

        let prompt = &generator.prompts()[0];
        assert!(prompt.contains(&format!("{}...", "x".repeat(CONTEXT_LIMIT))));
        assert!(!prompt.contains(&"x".repeat(CONTEXT_LIMIT + 1)));
    }

    #[tokio::test]
    async fn test_recommend_falls_back_on_generator_failure() {
        let (validator, _) = validator(ScriptedGenerator::new(EXHAUSTED_SENTINEL));
        let rec = validator
            .recommend("q", "c", &ValidationResult::default())
            .await;
        assert_eq!(rec, RECOMMENDATION_FALLBACK);
    }

    #[test]
    fn test_postprocess_recommendation() {
        let text = "```\n**Warning**: gas leak [Doc 12], see [норматив 4]. Опасно!\n```";
        assert_eq!(
            postprocess_recommendation(text),
            "⚠️: gas leak [12], see [4]. ⚠️!"
        );
    }

    #[test]
    fn test_failing_axes() {
        let all_bad = ValidationResult {
            safety: true,
            ..Default::default()
        };
        assert_eq!(failing_axes(&all_bad).len(), 6);
    }
}
