use crate::error::CallError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

/// Text-completion endpoint, used both to answer questions and to judge answers.
pub trait Oracle: Send + Sync {
    fn complete(&self, system: &str, prompt: &str) -> Result<Completion, CallError>;
    fn model(&self) -> &str;
}

/// Rough token estimate for endpoints that report no usage counters.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}
