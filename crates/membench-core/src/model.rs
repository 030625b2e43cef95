use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::category::Category;
use crate::error::{BenchError, BenchResult};

// ---------------------------------------------------------------------------
// Dataset inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dia_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// 1-based, chronological.
    pub index: u32,
    pub timestamp: String,
    pub turns: Vec<Turn>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionItem {
    pub question_id: String,
    pub conversation_id: String,
    pub question: String,
    /// Reference answer. Empty only for adversarial questions.
    pub answer: String,
    pub category: Category,
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adversarial_answer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub speaker_a: String,
    pub speaker_b: String,
    pub sessions: Vec<Session>,
    pub questions: Vec<QuestionItem>,
}

impl Conversation {
    /// Memory-service user id for one speaker's perspective of this conversation.
    pub fn user_id(&self, speaker: &str) -> String {
        format!("{speaker}_{}", self.id)
    }

    pub fn turn_count(&self) -> usize {
        self.sessions.iter().map(|s| s.turns.len()).sum()
    }
}

// ---------------------------------------------------------------------------
// Retrieval configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    #[default]
    Plain,
    Graph,
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => write!(f, "plain"),
            Self::Graph => write!(f, "graph"),
        }
    }
}

impl std::str::FromStr for BackendMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "plain" => Ok(Self::Plain),
            "graph" => Ok(Self::Graph),
            _ => Err(format!("invalid backend mode: {s}")),
        }
    }
}

/// Technique that answers from the complete conversation instead of retrieval.
pub const FULL_CONTEXT_TECHNIQUE: &str = "full-context";

/// One (technique, top-k, backend mode) tuple under which a full evaluation pass runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub technique: String,
    pub top_k: usize,
    #[serde(default)]
    pub mode: BackendMode,
    #[serde(default)]
    pub filter_memories: bool,
}

impl RetrievalConfig {
    pub fn new(technique: impl Into<String>, top_k: usize) -> Self {
        Self {
            technique: technique.into(),
            top_k,
            mode: BackendMode::Plain,
            filter_memories: false,
        }
    }

    /// The whole conversation as context, with no memory service involved.
    /// `top_k` does not apply and is stored as 0.
    pub fn full_context() -> Self {
        Self::new(FULL_CONTEXT_TECHNIQUE, 0)
    }

    pub fn is_full_context(&self) -> bool {
        self.technique == FULL_CONTEXT_TECHNIQUE
    }

    pub fn with_mode(mut self, mode: BackendMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn is_graph(&self) -> bool {
        self.mode == BackendMode::Graph
    }

    /// Stable identifier used in records, reports and comparison tables.
    pub fn id(&self) -> String {
        if self.is_full_context() {
            return self.technique.clone();
        }
        let mut id = format!("{}_top{}_{}", self.technique, self.top_k, self.mode);
        if self.filter_memories {
            id.push_str("_filtered");
        }
        id
    }

    pub fn validate(&self) -> BenchResult<()> {
        if self.technique.trim().is_empty() {
            return Err(BenchError::Config("technique name is empty".into()));
        }
        // The technique becomes part of a directory name.
        if self.technique.contains(&['/', '\\'][..]) || self.technique.contains("..") {
            return Err(BenchError::Config(format!(
                "technique name must not contain path separators or '..': {}",
                self.technique
            )));
        }
        if self.is_full_context() {
            if self.is_graph() || self.filter_memories {
                return Err(BenchError::Config(
                    "full-context does not query a memory service; graph and filter do not apply"
                        .into(),
                ));
            }
            return Ok(());
        }
        if self.top_k == 0 {
            return Err(BenchError::Config("top_k must be at least 1".into()));
        }
        Ok(())
    }
}

impl fmt::Display for RetrievalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

// ---------------------------------------------------------------------------
// Pipeline stage records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextFragment {
    pub speaker: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub question_id: String,
    pub config: RetrievalConfig,
    pub fragments: Vec<ContextFragment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relations: Vec<String>,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub question_id: String,
    pub config_id: String,
    pub answer: String,
    pub latency_ms: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl AnswerRecord {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Retrieval and answer for one question, as persisted in `search_results.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionRecord {
    pub question_id: String,
    pub conversation_id: String,
    pub question: String,
    pub reference: String,
    pub category: Category,
    pub retrieval: RetrievalResult,
    pub answer: AnswerRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub question_id: String,
    pub category: Category,
    pub config_id: String,
    pub bleu: f64,
    pub f1: f64,
    /// `None` when the judge could not produce a verdict.
    pub llm_judge: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludedItem {
    pub question_id: String,
    pub category: Category,
    /// Whether retrieval and generation succeeded for the item.
    pub answered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Retrieval,
    Generation,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retrieval => write!(f, "retrieval"),
            Self::Generation => write!(f, "generation"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub question_id: String,
    pub category: Category,
    pub stage: Stage,
    pub error: String,
}

// ---------------------------------------------------------------------------
// Result collection
// ---------------------------------------------------------------------------

/// Append-only collection of per-question outcomes for one configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    #[serde(default)]
    pub scored: Vec<ScoreRecord>,
    #[serde(default)]
    pub excluded: Vec<ExcludedItem>,
    #[serde(default)]
    pub failed: Vec<ItemFailure>,
}

impl ResultSet {
    /// Question ids that need no further processing.
    pub fn completed_ids(&self) -> HashSet<&str> {
        self.scored
            .iter()
            .map(|r| r.question_id.as_str())
            .chain(self.excluded.iter().map(|e| e.question_id.as_str()))
            .collect()
    }

    pub fn completed(&self) -> usize {
        self.scored.len() + self.excluded.len()
    }

    pub fn len(&self) -> usize {
        self.completed() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop failure entries so the items are picked up again on resume.
    pub fn clear_failures(&mut self) -> usize {
        let n = self.failed.len();
        self.failed.clear();
        n
    }

    /// Sort every list by question id. Used before persisting so artifacts are reproducible.
    pub fn sort(&mut self) {
        self.scored.sort_by(|a, b| a.question_id.cmp(&b.question_id));
        self.excluded.sort_by(|a, b| a.question_id.cmp(&b.question_id));
        self.failed.sort_by(|a, b| a.question_id.cmp(&b.question_id));
    }
}
