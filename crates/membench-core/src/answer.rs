use std::time::Instant;

use tracing::debug;

use crate::error::{BenchError, BenchResult};
use crate::model::{AnswerRecord, Conversation, QuestionItem, RetrievalResult};
use crate::oracle::{estimate_tokens, Oracle};
use crate::retry::BackoffPolicy;

const ANSWER_SYSTEM_PROMPT: &str = "\
You are a memory assistant answering questions about a long conversation between two people. \
Use only the memories provided. Memories are prefixed with the date they were recorded: \
convert relative time references (\"last year\", \"two weeks ago\") into absolute dates using \
that timestamp. If memories contradict each other, prefer the most recent one. \
Answer in at most six words.";

const FULL_CONTEXT_SYSTEM_PROMPT: &str = "\
You are a helpful assistant that can answer questions based on the provided complete \
conversation context. If the question involves timing, use the conversation date for reference. \
Provide the shortest possible answer. Use words directly from the conversation when possible. \
Avoid using subjects in your answer.";

/// Turns retrieved context into a candidate answer via the answering oracle.
pub struct AnswerGenerator<'a> {
    oracle: &'a dyn Oracle,
    policy: BackoffPolicy,
}

impl<'a> AnswerGenerator<'a> {
    pub fn new(oracle: &'a dyn Oracle, policy: BackoffPolicy) -> Self {
        Self { oracle, policy }
    }

    pub fn generate(
        &self,
        conversation: &Conversation,
        question: &QuestionItem,
        retrieval: &RetrievalResult,
    ) -> BenchResult<AnswerRecord> {
        let (system, prompt) = if retrieval.config.is_full_context() {
            (
                FULL_CONTEXT_SYSTEM_PROMPT,
                build_full_context_prompt(question, retrieval),
            )
        } else {
            (
                ANSWER_SYSTEM_PROMPT,
                build_answer_prompt(conversation, question, retrieval),
            )
        };

        let (completion, latency_ms) = self
            .policy
            .run(&format!("answer {}", question.question_id), |_| {
                let start = Instant::now();
                self.oracle
                    .complete(system, &prompt)
                    .map(|c| (c, start.elapsed().as_secs_f64() * 1000.0))
            })
            .map_err(|e| BenchError::AnswerGenerationFailed {
                question_id: question.question_id.clone(),
                attempts: e.attempts,
                reason: e.last_error.to_string(),
            })?;

        let answer = completion.text.trim().to_string();
        let input_tokens = completion
            .input_tokens
            .unwrap_or_else(|| estimate_tokens(system) + estimate_tokens(&prompt));
        let output_tokens = completion
            .output_tokens
            .unwrap_or_else(|| estimate_tokens(&answer));
        debug!(
            question_id = %question.question_id,
            latency_ms,
            input_tokens,
            output_tokens,
            "answer generated"
        );

        Ok(AnswerRecord {
            question_id: question.question_id.clone(),
            config_id: retrieval.config.id(),
            answer,
            latency_ms,
            input_tokens,
            output_tokens,
        })
    }
}

/// Question plus ordered fragments, grouped per speaker.
pub fn build_answer_prompt(
    conversation: &Conversation,
    question: &QuestionItem,
    retrieval: &RetrievalResult,
) -> String {
    let mut prompt = String::new();
    for speaker in [&conversation.speaker_a, &conversation.speaker_b] {
        prompt.push_str(&format!("Memories for {speaker}:\n"));
        let mut any = false;
        for fragment in retrieval.fragments.iter().filter(|f| &f.speaker == speaker) {
            prompt.push_str(&format!("- {}\n", fragment.text));
            any = true;
        }
        if !any {
            prompt.push_str("- (none)\n");
        }
        prompt.push('\n');
    }
    if !retrieval.relations.is_empty() {
        prompt.push_str("Relations:\n");
        for relation in &retrieval.relations {
            prompt.push_str(&format!("- {relation}\n"));
        }
        prompt.push('\n');
    }
    prompt.push_str(&format!("Question: {}\n\nAnswer:", question.question));
    prompt
}

/// The whole conversation, one turn per line, followed by the question.
pub fn build_full_context_prompt(question: &QuestionItem, retrieval: &RetrievalResult) -> String {
    let context = retrieval
        .fragments
        .iter()
        .map(|f| f.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "# Complete Conversation Context:\n{context}\n\n# Question:\n{}\n\n# Short answer:",
        question.question
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::Category;
    use crate::error::CallError;
    use crate::model::{ContextFragment, RetrievalConfig};
    use crate::oracle::Completion;
    use std::sync::Mutex;

    struct ScriptedOracle {
        replies: Mutex<Vec<Result<Completion, CallError>>>,
        prompts: Mutex<Vec<String>>,
        systems: Mutex<Vec<String>>,
    }

    impl ScriptedOracle {
        fn new(replies: Vec<Result<Completion, CallError>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                prompts: Mutex::new(Vec::new()),
                systems: Mutex::new(Vec::new()),
            }
        }
    }

    impl Oracle for ScriptedOracle {
        fn complete(&self, system: &str, prompt: &str) -> Result<Completion, CallError> {
            self.systems.lock().unwrap().push(system.to_string());
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.replies.lock().unwrap().remove(0)
        }

        fn model(&self) -> &str {
            "scripted"
        }
    }

    fn fixtures() -> (Conversation, QuestionItem, RetrievalResult) {
        let conv = Conversation {
            id: "c1".into(),
            speaker_a: "Ann".into(),
            speaker_b: "Bob".into(),
            sessions: vec![],
            questions: vec![],
        };
        let q = QuestionItem {
            question_id: "c1:q0".into(),
            conversation_id: "c1".into(),
            question: "Where does Ann live?".into(),
            answer: "Paris".into(),
            category: Category::SingleHop,
            evidence: vec![],
            adversarial_answer: None,
        };
        let r = RetrievalResult {
            question_id: "c1:q0".into(),
            config: RetrievalConfig::new("mem0", 5),
            fragments: vec![ContextFragment {
                speaker: "Ann".into(),
                text: "8 May 2023: Ann moved to Paris".into(),
                score: None,
            }],
            relations: vec![],
            latency_ms: 3.0,
        };
        (conv, q, r)
    }

    #[test]
    fn test_prompt_groups_fragments_by_speaker() {
        let (conv, q, r) = fixtures();
        let prompt = build_answer_prompt(&conv, &q, &r);
        assert!(prompt.contains("Memories for Ann:\n- 8 May 2023: Ann moved to Paris\n"));
        assert!(prompt.contains("Memories for Bob:\n- (none)\n"));
        assert!(prompt.ends_with("Question: Where does Ann live?\n\nAnswer:"));
        assert!(!prompt.contains("Relations:"));
    }

    #[test]
    fn test_generate_uses_reported_tokens() {
        let (conv, q, r) = fixtures();
        let oracle = ScriptedOracle::new(vec![Ok(Completion {
            text: "  Paris \n".into(),
            input_tokens: Some(120),
            output_tokens: Some(2),
        })]);
        let generator = AnswerGenerator::new(&oracle, BackoffPolicy::immediate(3));
        let record = generator.generate(&conv, &q, &r).unwrap();
        assert_eq!(record.answer, "Paris");
        assert_eq!(record.config_id, "mem0_top5_plain");
        assert_eq!(record.total_tokens(), 122);
    }

    #[test]
    fn test_generate_estimates_missing_usage() {
        let (conv, q, r) = fixtures();
        let oracle = ScriptedOracle::new(vec![Ok(Completion {
            text: "Paris".into(),
            input_tokens: None,
            output_tokens: None,
        })]);
        let generator = AnswerGenerator::new(&oracle, BackoffPolicy::immediate(1));
        let record = generator.generate(&conv, &q, &r).unwrap();
        assert!(record.input_tokens > 0);
        assert_eq!(record.output_tokens, 2);
    }

    #[test]
    fn test_generate_retries_then_fails() {
        let (conv, q, r) = fixtures();
        let oracle = ScriptedOracle::new(vec![
            Err(CallError::Transient("429".into())),
            Err(CallError::Transient("429".into())),
        ]);
        let generator = AnswerGenerator::new(&oracle, BackoffPolicy::immediate(2));
        let err = generator.generate(&conv, &q, &r).unwrap_err();
        match err {
            BenchError::AnswerGenerationFailed {
                question_id,
                attempts,
                ..
            } => {
                assert_eq!(question_id, "c1:q0");
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(oracle.prompts.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_full_context_uses_its_own_prompt() {
        let (conv, q, _) = fixtures();
        let r = RetrievalResult {
            question_id: "c1:q0".into(),
            config: RetrievalConfig::full_context(),
            fragments: vec![
                ContextFragment {
                    speaker: "Ann".into(),
                    text: "8 May 2023 | Ann: I moved to Paris".into(),
                    score: None,
                },
                ContextFragment {
                    speaker: "Bob".into(),
                    text: "8 May 2023 | Bob: Nice".into(),
                    score: None,
                },
            ],
            relations: vec![],
            latency_ms: 0.0,
        };
        let oracle = ScriptedOracle::new(vec![Ok(Completion {
            text: "Paris".into(),
            input_tokens: Some(40),
            output_tokens: Some(1),
        })]);
        let record = AnswerGenerator::new(&oracle, BackoffPolicy::immediate(1))
            .generate(&conv, &q, &r)
            .unwrap();

        assert_eq!(record.config_id, "full-context");
        let prompt = &oracle.prompts.lock().unwrap()[0];
        assert_eq!(
            prompt,
            "# Complete Conversation Context:\n\
             8 May 2023 | Ann: I moved to Paris\n\
             8 May 2023 | Bob: Nice\n\n\
             # Question:\nWhere does Ann live?\n\n# Short answer:"
        );
        assert!(oracle.systems.lock().unwrap()[0].contains("complete conversation context"));
    }
}
