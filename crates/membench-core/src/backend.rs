use serde::{Deserialize, Serialize};

use crate::error::CallError;
use crate::model::RetrievalConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub memory: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphRelation {
    pub source: String,
    pub relationship: String,
    pub target: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchHits {
    pub hits: Vec<SearchHit>,
    #[serde(default)]
    pub relations: Vec<GraphRelation>,
}

/// Black-box memory service. One call is one network round-trip; retries live
/// in [`crate::MemoryGateway`].
pub trait MemoryBackend: Send + Sync {
    fn add(
        &self,
        user_id: &str,
        messages: &[MemoryMessage],
        timestamp: &str,
    ) -> Result<(), CallError>;

    fn search(
        &self,
        user_id: &str,
        query: &str,
        config: &RetrievalConfig,
    ) -> Result<SearchHits, CallError>;
}
