//! LoCoMo-style dataset loading.
//!
//! Accepts either a JSON array of samples or an object with a `data`/`samples`
//! array. Each sample carries a `conversation` object with dynamic
//! `session_<n>` / `session_<n>_date_time` keys and a `qa` list. Every record is
//! validated here; anything inconsistent is a [`BenchError::DatasetIntegrity`].

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::category::Category;
use crate::error::{BenchError, BenchResult};
use crate::model::{Conversation, QuestionItem, Session, Turn};

#[derive(Debug, Clone)]
pub struct Dataset {
    pub name: String,
    pub conversations: Vec<Conversation>,
    /// SHA-256 of the raw input, hex encoded.
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetStats {
    pub conversations: usize,
    pub sessions: usize,
    pub turns: usize,
    pub questions: usize,
    pub by_category: BTreeMap<Category, usize>,
    pub answer_len_min: usize,
    pub answer_len_max: usize,
    pub answer_len_avg: f64,
}

impl Dataset {
    pub fn from_file(path: &Path) -> BenchResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BenchError::DatasetIntegrity(format!("cannot read {}: {e}", path.display()))
        })?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dataset".into());
        Self::from_json_str(&content, &name)
    }

    pub fn from_json_str(json: &str, name: &str) -> BenchResult<Self> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| BenchError::DatasetIntegrity(format!("malformed JSON: {e}")))?;

        let samples = match &value {
            Value::Array(arr) => arr.as_slice(),
            Value::Object(obj) => match obj.get("data").or_else(|| obj.get("samples")) {
                Some(Value::Array(arr)) => arr.as_slice(),
                Some(_) => {
                    return Err(BenchError::DatasetIntegrity(
                        "'data'/'samples' field must be an array".into(),
                    ))
                }
                None => std::slice::from_ref(&value),
            },
            _ => {
                return Err(BenchError::DatasetIntegrity(
                    "dataset must be a JSON array or object".into(),
                ))
            }
        };

        let mut conversations = Vec::with_capacity(samples.len());
        let mut seen_conversations = HashSet::new();
        let mut seen_questions = HashSet::new();
        for (idx, sample) in samples.iter().enumerate() {
            let conv = parse_sample(sample, idx)?;
            if !seen_conversations.insert(conv.id.clone()) {
                return Err(BenchError::DatasetIntegrity(format!(
                    "duplicate conversation id: {}",
                    conv.id
                )));
            }
            for q in &conv.questions {
                if !seen_questions.insert(q.question_id.clone()) {
                    return Err(BenchError::DatasetIntegrity(format!(
                        "duplicate question_id: {}",
                        q.question_id
                    )));
                }
            }
            conversations.push(conv);
        }

        Ok(Self {
            name: name.to_string(),
            conversations,
            fingerprint: fingerprint(json.as_bytes()),
        })
    }

    /// Every question paired with its conversation, in dataset order.
    pub fn questions(&self) -> impl Iterator<Item = (&Conversation, &QuestionItem)> {
        self.conversations
            .iter()
            .flat_map(|c| c.questions.iter().map(move |q| (c, q)))
    }

    pub fn question_count(&self) -> usize {
        self.conversations.iter().map(|c| c.questions.len()).sum()
    }

    pub fn stats(&self) -> DatasetStats {
        let mut by_category = BTreeMap::new();
        let mut lengths = Vec::new();
        for (_, q) in self.questions() {
            *by_category.entry(q.category).or_insert(0) += 1;
            if !q.answer.is_empty() {
                lengths.push(q.answer.chars().count());
            }
        }
        let answer_len_avg = if lengths.is_empty() {
            0.0
        } else {
            lengths.iter().sum::<usize>() as f64 / lengths.len() as f64
        };

        DatasetStats {
            conversations: self.conversations.len(),
            sessions: self.conversations.iter().map(|c| c.sessions.len()).sum(),
            turns: self.conversations.iter().map(|c| c.turn_count()).sum(),
            questions: self.question_count(),
            by_category,
            answer_len_min: lengths.iter().copied().min().unwrap_or(0),
            answer_len_max: lengths.iter().copied().max().unwrap_or(0),
            answer_len_avg,
        }
    }
}

pub fn fingerprint(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn parse_sample(value: &Value, idx: usize) -> BenchResult<Conversation> {
    let obj = value.as_object().ok_or_else(|| {
        BenchError::DatasetIntegrity(format!("sample {idx} must be a JSON object"))
    })?;

    let id = match obj.get("sample_id") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => format!("conv-{idx}"),
    };

    let conversation = obj
        .get("conversation")
        .and_then(|v| v.as_object())
        .ok_or_else(|| {
            BenchError::DatasetIntegrity(format!("missing 'conversation' in sample {id}"))
        })?;

    let speaker_a = conversation
        .get("speaker_a")
        .and_then(|v| v.as_str())
        .unwrap_or("speaker_a")
        .to_string();
    let speaker_b = conversation
        .get("speaker_b")
        .and_then(|v| v.as_str())
        .unwrap_or("speaker_b")
        .to_string();

    let mut sessions = Vec::new();
    let mut index = 1u32;
    while let Some(turns_value) = conversation.get(&format!("session_{index}")) {
        let session_id = format!("session_{index}");
        let timestamp = conversation
            .get(&format!("session_{index}_date_time"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let turns: Vec<Turn> = serde_json::from_value(turns_value.clone()).map_err(|e| {
            BenchError::DatasetIntegrity(format!("bad turns in {id}/{session_id}: {e}"))
        })?;
        sessions.push(Session {
            id: session_id,
            index,
            timestamp,
            turns,
        });
        index += 1;
    }

    let questions = match obj.get("qa") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(qi, item)| parse_question(item, &id, qi))
            .collect::<BenchResult<Vec<_>>>()?,
        Some(_) => {
            return Err(BenchError::DatasetIntegrity(format!(
                "'qa' in sample {id} must be an array"
            )))
        }
    };

    Ok(Conversation {
        id,
        speaker_a,
        speaker_b,
        sessions,
        questions,
    })
}

fn parse_question(value: &Value, conversation_id: &str, idx: usize) -> BenchResult<QuestionItem> {
    let at = format!("{conversation_id} qa[{idx}]");
    let obj = value
        .as_object()
        .ok_or_else(|| BenchError::DatasetIntegrity(format!("{at}: must be an object")))?;

    let question = obj
        .get("question")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| BenchError::DatasetIntegrity(format!("{at}: missing question text")))?
        .to_string();

    let category = match obj.get("category") {
        Some(Value::Number(n)) => n.as_u64().and_then(Category::from_code),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| {
        BenchError::DatasetIntegrity(format!(
            "{at}: unknown or missing category {}",
            obj.get("category").map(|v| v.to_string()).unwrap_or_default()
        ))
    })?;

    let answer = obj.get("answer").and_then(scalar_to_string).unwrap_or_default();
    if answer.is_empty() && category.is_scored() {
        return Err(BenchError::DatasetIntegrity(format!(
            "{at}: missing reference answer for {category} question"
        )));
    }

    let question_id = obj
        .get("question_id")
        .and_then(scalar_to_string)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("{conversation_id}:q{idx}"));

    let evidence = match obj.get("evidence") {
        Some(Value::Array(items)) => items.iter().filter_map(scalar_to_string).collect(),
        _ => Vec::new(),
    };

    Ok(QuestionItem {
        question_id,
        conversation_id: conversation_id.to_string(),
        question,
        answer,
        category,
        evidence,
        adversarial_answer: obj.get("adversarial_answer").and_then(scalar_to_string),
    })
}

fn scalar_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"[
      {
        "sample_id": "conv-26",
        "conversation": {
          "speaker_a": "Caroline",
          "speaker_b": "Melanie",
          "session_1_date_time": "1:56 pm on 8 May, 2023",
          "session_1": [
            {"speaker": "Caroline", "dia_id": "D1:1", "text": "I went to a LGBTQ support group yesterday."},
            {"speaker": "Melanie", "dia_id": "D1:2", "text": "That's great!"}
          ],
          "session_2_date_time": "1:14 pm on 25 May, 2023",
          "session_2": [
            {"speaker": "Melanie", "dia_id": "D2:1", "text": "I ran a charity race last Saturday."}
          ]
        },
        "qa": [
          {"question": "When did Caroline go to the support group?", "answer": "7 May 2023", "evidence": ["D1:1"], "category": 2},
          {"question": "What year did Melanie run?", "answer": 2023, "category": "single-hop"},
          {"question": "What did Caroline paint?", "adversarial_answer": "a sunset", "category": 5}
        ]
      }
    ]"#;

    #[test]
    fn test_parse_locomo_layout() {
        let ds = Dataset::from_json_str(SAMPLE, "locomo").unwrap();
        assert_eq!(ds.conversations.len(), 1);
        let conv = &ds.conversations[0];
        assert_eq!(conv.id, "conv-26");
        assert_eq!(conv.sessions.len(), 2);
        assert_eq!(conv.sessions[0].timestamp, "1:56 pm on 8 May, 2023");
        assert_eq!(conv.sessions[1].index, 2);
        assert_eq!(conv.turn_count(), 3);

        let qs = &conv.questions;
        assert_eq!(qs.len(), 3);
        assert_eq!(qs[0].question_id, "conv-26:q0");
        assert_eq!(qs[0].category, Category::Temporal);
        assert_eq!(qs[0].evidence, vec!["D1:1".to_string()]);
        assert_eq!(qs[1].answer, "2023");
        assert_eq!(qs[1].category, Category::SingleHop);
        assert_eq!(qs[2].category, Category::Adversarial);
        assert!(qs[2].answer.is_empty());
        assert_eq!(qs[2].adversarial_answer.as_deref(), Some("a sunset"));
    }

    #[test]
    fn test_object_with_data_key() {
        let wrapped = format!(r#"{{"data": {SAMPLE}}}"#);
        let ds = Dataset::from_json_str(&wrapped, "locomo").unwrap();
        assert_eq!(ds.question_count(), 3);
    }

    #[test]
    fn test_unknown_category_is_fatal() {
        let json = r#"[{"sample_id": "c", "conversation": {}, "qa": [
            {"question": "q?", "answer": "a", "category": 9}
        ]}]"#;
        let err = Dataset::from_json_str(json, "bad").unwrap_err();
        assert!(matches!(err, BenchError::DatasetIntegrity(_)));
        assert!(err.to_string().contains("category"));
    }

    #[test]
    fn test_duplicate_question_id_is_fatal() {
        let json = r#"[{"sample_id": "c", "conversation": {}, "qa": [
            {"question_id": "x", "question": "q1?", "answer": "a", "category": 1},
            {"question_id": "x", "question": "q2?", "answer": "b", "category": 1}
        ]}]"#;
        let err = Dataset::from_json_str(json, "dup").unwrap_err();
        assert!(err.to_string().contains("duplicate question_id"));
    }

    #[test]
    fn test_missing_answer_on_scored_category_is_fatal() {
        let json = r#"[{"sample_id": "c", "conversation": {}, "qa": [
            {"question": "q?", "category": 4}
        ]}]"#;
        assert!(matches!(
            Dataset::from_json_str(json, "x"),
            Err(BenchError::DatasetIntegrity(_))
        ));
    }

    #[test]
    fn test_missing_conversation_is_fatal() {
        let json = r#"[{"sample_id": "c", "qa": []}]"#;
        assert!(Dataset::from_json_str(json, "x").is_err());
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            Dataset::from_json_str("{not json", "x"),
            Err(BenchError::DatasetIntegrity(_))
        ));
    }

    #[test]
    fn test_stats_and_fingerprint() {
        let ds = Dataset::from_json_str(SAMPLE, "locomo").unwrap();
        let stats = ds.stats();
        assert_eq!(stats.questions, 3);
        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.by_category.get(&Category::Adversarial), Some(&1));
        assert_eq!(stats.answer_len_min, 4);
        assert_eq!(stats.answer_len_max, 10);

        assert_eq!(ds.fingerprint.len(), 64);
        assert_eq!(ds.fingerprint, fingerprint(SAMPLE.as_bytes()));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locomo10.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let ds = Dataset::from_file(&path).unwrap();
        assert_eq!(ds.name, "locomo10");
        assert_eq!(ds.question_count(), 3);
    }
}
