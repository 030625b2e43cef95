use std::time::Duration;

use tracing::debug;

use membench_core::{CallError, MemoryBackend, MemoryMessage, RetrievalConfig, SearchHits};

use crate::protocol::{AddMetadata, AddRequest, SearchRequest, SearchResponse};
use crate::status::{agent, classify, read_json};

/// Client for a mem0-compatible REST memory service.
pub struct Mem0Client {
    agent: ureq::Agent,
    base_url: String,
}

impl Mem0Client {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            agent: agent(timeout),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl MemoryBackend for Mem0Client {
    fn add(
        &self,
        user_id: &str,
        messages: &[MemoryMessage],
        timestamp: &str,
    ) -> Result<(), CallError> {
        let url = format!("{}/memories", self.base_url);
        let body = AddRequest {
            messages,
            user_id,
            metadata: AddMetadata { timestamp },
        };
        self.agent.post(&url).send_json(&body).map_err(classify)?;
        debug!(user_id, messages = messages.len(), "POST /memories ok");
        Ok(())
    }

    fn search(
        &self,
        user_id: &str,
        query: &str,
        config: &RetrievalConfig,
    ) -> Result<SearchHits, CallError> {
        let url = format!("{}/search", self.base_url);
        let graph = config.is_graph();
        let body = SearchRequest {
            query,
            user_id,
            top_k: config.top_k,
            filter_memories: config.filter_memories,
            enable_graph: graph,
            output_format: graph.then_some("v1.1"),
        };
        let response = self.agent.post(&url).send_json(&body).map_err(classify)?;
        let parsed: SearchResponse = read_json(response, "search response")?;
        Ok(parsed.into())
    }
}
