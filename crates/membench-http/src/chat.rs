use std::time::Duration;

use membench_core::{CallError, Completion, Oracle};

use crate::protocol::{ChatMessage, ChatRequest, ChatResponse};
use crate::status::{agent, classify, read_json};

/// OpenAI-compatible `/chat/completions` client, used as answerer or judge.
pub struct ChatClient {
    agent: ureq::Agent,
    base_url: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
}

impl ChatClient {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: Option<String>,
        max_tokens: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            agent: agent(timeout),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            max_tokens,
        }
    }

    /// Same endpoint and key, different model.
    pub fn with_model(&self, model: &str) -> Self {
        Self {
            agent: self.agent.clone(),
            base_url: self.base_url.clone(),
            model: model.to_string(),
            api_key: self.api_key.clone(),
            max_tokens: self.max_tokens,
        }
    }
}

impl Oracle for ChatClient {
    fn complete(&self, system: &str, prompt: &str) -> Result<Completion, CallError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: 0.0,
            max_tokens: self.max_tokens,
        };

        let mut request = self.agent.post(&url);
        if let Some(key) = &self.api_key {
            request = request.set("Authorization", &format!("Bearer {key}"));
        }
        let response = request.send_json(&body).map_err(classify)?;
        let parsed: ChatResponse = read_json(response, "completion response")?;
        completion_from(parsed)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

fn completion_from(resp: ChatResponse) -> Result<Completion, CallError> {
    let text = resp
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| CallError::Permanent("completion has no choices".into()))?;
    let (input_tokens, output_tokens) = resp
        .usage
        .map(|u| (u.prompt_tokens, u.completion_tokens))
        .unwrap_or((None, None));
    Ok(Completion {
        text,
        input_tokens,
        output_tokens,
    })
}
