use serde::Deserialize;
use tracing::{debug, warn};

use crate::metrics::{bleu, token_f1};
use crate::model::{QuestionItem, ScoreRecord};
use crate::oracle::Oracle;
use crate::retry::BackoffPolicy;

const JUDGE_SYSTEM_PROMPT: &str = "\
You grade answers produced by a memory assistant against a gold answer. \
Be generous: an answer that touches the same topic or refers to the same date, \
even in a different format, counts as correct. Respond with JSON only.";

/// Computes BLEU, F1 and (optionally) an LLM-judge verdict for one answer.
pub struct Scorer<'a> {
    judge: Option<&'a dyn Oracle>,
    policy: BackoffPolicy,
    bleu_max_n: usize,
}

impl<'a> Scorer<'a> {
    pub fn new(judge: Option<&'a dyn Oracle>, policy: BackoffPolicy, bleu_max_n: usize) -> Self {
        Self {
            judge,
            policy,
            bleu_max_n: bleu_max_n.max(1),
        }
    }

    /// Lexical metrics only, no judge.
    pub fn lexical(bleu_max_n: usize) -> Self {
        Self::new(None, BackoffPolicy::immediate(1), bleu_max_n)
    }

    pub fn score(
        &self,
        candidate: &str,
        reference: &str,
        question: &QuestionItem,
        config_id: &str,
    ) -> ScoreRecord {
        ScoreRecord {
            question_id: question.question_id.clone(),
            category: question.category,
            config_id: config_id.to_string(),
            bleu: bleu(candidate, reference, self.bleu_max_n),
            f1: token_f1(candidate, reference),
            llm_judge: self.judge(candidate, reference, question),
        }
    }

    /// Judge score in [0, 1], or `None` when the judge is absent, unreachable, or
    /// replies with something unparseable.
    fn judge(&self, candidate: &str, reference: &str, question: &QuestionItem) -> Option<f64> {
        let oracle = self.judge?;
        let prompt = build_judge_prompt(&question.question, reference, candidate);
        let completion = match self
            .policy
            .run(&format!("judge {}", question.question_id), |_| {
                oracle.complete(JUDGE_SYSTEM_PROMPT, &prompt)
            }) {
            Ok(c) => c,
            Err(e) => {
                warn!(question_id = %question.question_id, error = %e.last_error, "judge call failed");
                return None;
            }
        };

        let verdict = parse_verdict(&completion.text);
        if verdict.is_none() {
            warn!(question_id = %question.question_id, reply = %completion.text, "unparseable judge reply");
        } else {
            debug!(question_id = %question.question_id, score = ?verdict, "judged");
        }
        verdict
    }
}

pub fn build_judge_prompt(question: &str, gold: &str, generated: &str) -> String {
    format!(
        r#"Label the generated answer to the question below.

Question: {question}
Gold answer: {gold}
Generated answer: {generated}

Rate how well the generated answer matches the gold answer on a 0-10 scale,
where 10 means fully correct and 0 means wrong or missing.

Respond with a JSON object: {{"score": <0-10>, "reasoning": "<one sentence>"}}"#
    )
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    #[serde(default)]
    score: Option<RawScore>,
    #[serde(default)]
    label: Option<String>,
}

/// Judges sometimes quote the number: `{"score": "8"}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawScore {
    Number(f64),
    Text(String),
}

impl RawScore {
    fn value(&self) -> Option<f64> {
        match self {
            RawScore::Number(n) => Some(*n),
            RawScore::Text(t) => t.trim().parse().ok(),
        }
    }
}

/// Parse a judge reply into a normalized score.
///
/// Accepts `{"score": 0..10}` (divided by 10 and clamped; a numeric string
/// also counts) and the binary
/// `{"label": "CORRECT" | "WRONG"}` form. Code fences around the JSON are ignored.
pub fn parse_verdict(reply: &str) -> Option<f64> {
    let raw: RawVerdict = serde_json_lenient::from_str(extract_json(reply)).ok()?;
    if let Some(score) = raw.score {
        let score = score.value()?;
        if !score.is_finite() {
            return None;
        }
        return Some((score / 10.0).clamp(0.0, 1.0));
    }
    match raw.label?.trim().to_ascii_uppercase().as_str() {
        "CORRECT" => Some(1.0),
        "WRONG" | "INCORRECT" => Some(0.0),
        _ => None,
    }
}

/// Strip a markdown code fence, or fall back to the outermost `{...}` span.
fn extract_json(reply: &str) -> &str {
    let trimmed = reply.trim();
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            return body[..end].trim();
        }
    }
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::Category;
    use crate::error::CallError;
    use crate::oracle::Completion;

    struct FixedJudge(Result<&'static str, CallError>);

    impl Oracle for FixedJudge {
        fn complete(&self, _system: &str, _prompt: &str) -> Result<Completion, CallError> {
            self.0.clone().map(|text| Completion {
                text: text.to_string(),
                input_tokens: None,
                output_tokens: None,
            })
        }

        fn model(&self) -> &str {
            "fixed"
        }
    }

    fn question() -> QuestionItem {
        QuestionItem {
            question_id: "c1:q0".into(),
            conversation_id: "c1".into(),
            question: "Where does Ann live?".into(),
            answer: "Paris".into(),
            category: Category::SingleHop,
            evidence: vec![],
            adversarial_answer: None,
        }
    }

    #[test]
    fn test_parse_numeric_score() {
        assert_eq!(parse_verdict(r#"{"score": 8, "reasoning": "close"}"#), Some(0.8));
        assert_eq!(parse_verdict(r#"{"score": 14}"#), Some(1.0));
        assert_eq!(parse_verdict(r#"{"score": -2}"#), Some(0.0));
    }

    #[test]
    fn test_parse_quoted_score() {
        assert_eq!(parse_verdict(r#"{"score": "8"}"#), Some(0.8));
        assert_eq!(parse_verdict(r#"{"score": " 7.5 "}"#), Some(0.75));
        assert_eq!(parse_verdict(r#"{"score": "high"}"#), None);
    }

    #[test]
    fn test_parse_label_form() {
        assert_eq!(parse_verdict(r#"{"label": "CORRECT"}"#), Some(1.0));
        assert_eq!(parse_verdict(r#"{"label": "wrong"}"#), Some(0.0));
        assert_eq!(parse_verdict(r#"{"label": "MAYBE"}"#), None);
    }

    #[test]
    fn test_parse_fenced_and_chatty_replies() {
        let fenced = "Here you go:\n```json\n{\"score\": 10, \"reasoning\": \"exact\"}\n```";
        assert_eq!(parse_verdict(fenced), Some(1.0));
        let chatty = "Sure. {\"score\": 5, \"reasoning\": \"partial\"} Hope that helps";
        assert_eq!(parse_verdict(chatty), Some(0.5));
    }

    #[test]
    fn test_parse_garbage_is_none() {
        assert_eq!(parse_verdict("I think it's right"), None);
        assert_eq!(parse_verdict("{}"), None);
        assert_eq!(parse_verdict(""), None);
    }

    #[test]
    fn test_score_partial_match() {
        let judge = FixedJudge(Ok(r#"{"score": 10, "reasoning": "same city"}"#));
        let scorer = Scorer::new(Some(&judge), BackoffPolicy::immediate(1), 1);
        let record = scorer.score("paris, France", "Paris", &question(), "mem0_top5_plain");

        assert!(record.f1 > 0.5 && record.f1 < 1.0);
        assert!(record.bleu > 0.0 && record.bleu < 1.0);
        assert_eq!(record.llm_judge, Some(1.0));
        assert_eq!(record.category, Category::SingleHop);
        assert_eq!(record.config_id, "mem0_top5_plain");
    }

    #[test]
    fn test_judge_failure_leaves_record_unjudged() {
        let judge = FixedJudge(Err(CallError::Permanent("401".into())));
        let scorer = Scorer::new(Some(&judge), BackoffPolicy::immediate(3), 1);
        let record = scorer.score("Paris", "Paris", &question(), "cfg");
        assert_eq!(record.llm_judge, None);
        assert_eq!(record.f1, 1.0);
    }

    #[test]
    fn test_lexical_scorer_skips_judge() {
        let record = Scorer::lexical(1).score("", "Paris", &question(), "cfg");
        assert_eq!(record.llm_judge, None);
        assert_eq!(record.bleu, 0.0);
        assert_eq!(record.f1, 0.0);
    }
}
