use serde::{Deserialize, Serialize};

use membench_core::{GraphRelation, MemoryMessage, SearchHit, SearchHits};

// ---------------------------------------------------------------------------
// Memory service (mem0 REST)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct AddRequest<'a> {
    pub messages: &'a [MemoryMessage],
    pub user_id: &'a str,
    pub metadata: AddMetadata<'a>,
}

#[derive(Debug, Serialize)]
pub struct AddMetadata<'a> {
    pub timestamp: &'a str,
}

#[derive(Debug, Serialize)]
pub struct SearchRequest<'a> {
    pub query: &'a str,
    pub user_id: &'a str,
    pub top_k: usize,
    pub filter_memories: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub enable_graph: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_format: Option<&'a str>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HitMetadata {
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WireHit {
    pub memory: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub metadata: Option<HitMetadata>,
}

/// `v1.1` wraps hits in `results`; older servers return a bare list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum SearchResponse {
    Wrapped {
        #[serde(default)]
        results: Vec<WireHit>,
        #[serde(default)]
        relations: Vec<GraphRelation>,
    },
    Bare(Vec<WireHit>),
}

impl From<SearchResponse> for SearchHits {
    fn from(resp: SearchResponse) -> Self {
        let (results, relations) = match resp {
            SearchResponse::Wrapped { results, relations } => (results, relations),
            SearchResponse::Bare(results) => (results, Vec::new()),
        };
        SearchHits {
            hits: results
                .into_iter()
                .map(|h| SearchHit {
                    memory: h.memory,
                    timestamp: h.metadata.and_then(|m| m.timestamp),
                    score: h.score,
                })
                .collect(),
            relations,
        }
    }
}

// ---------------------------------------------------------------------------
// Chat completions (OpenAI-compatible)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ChatMessage<'a> {
    pub role: &'a str,
    pub content: &'a str,
}

#[derive(Debug, Serialize)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<ChatMessage<'a>>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    pub message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatUsage {
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
}
