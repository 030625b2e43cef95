use std::time::Instant;

use tracing::{debug, info, warn};

use crate::backend::{MemoryBackend, MemoryMessage, SearchHits};
use crate::error::{BenchError, BenchResult};
use crate::model::{ContextFragment, Conversation, QuestionItem, RetrievalConfig, RetrievalResult};
use crate::retry::{BackoffPolicy, RetryExhausted};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddAck {
    pub batches_sent: usize,
    pub batches_failed: usize,
}

/// Retrying add/search front for a [`MemoryBackend`].
pub struct MemoryGateway<'a> {
    backend: &'a dyn MemoryBackend,
    policy: BackoffPolicy,
    batch_size: usize,
}

impl<'a> MemoryGateway<'a> {
    pub fn new(backend: &'a dyn MemoryBackend, policy: BackoffPolicy, batch_size: usize) -> Self {
        Self {
            backend,
            policy,
            batch_size: batch_size.max(1),
        }
    }

    /// Store a conversation from both speakers' perspectives.
    ///
    /// Every batch is attempted exactly once under the retry policy and its outcome
    /// logged. Fails with `BackendUnavailable` if any batch could not be stored.
    pub fn add(&self, conversation: &Conversation) -> BenchResult<AddAck> {
        let mut ack = AddAck::default();
        let mut last_error = None;

        for owner in [&conversation.speaker_a, &conversation.speaker_b] {
            let user_id = conversation.user_id(owner);
            for session in &conversation.sessions {
                let messages = perspective_messages(owner, &session.turns);
                for (batch_idx, batch) in messages.chunks(self.batch_size).enumerate() {
                    let op = format!("add {user_id} {} batch {batch_idx}", session.id);
                    match self.policy.run(&op, |_| {
                        self.backend.add(&user_id, batch, &session.timestamp)
                    }) {
                        Ok(()) => {
                            ack.batches_sent += 1;
                            debug!(user_id = %user_id, session = %session.id, batch = batch_idx, "memory batch stored");
                        }
                        Err(e) => {
                            ack.batches_failed += 1;
                            warn!(
                                user_id = %user_id,
                                session = %session.id,
                                batch = batch_idx,
                                attempts = e.attempts,
                                error = %e.last_error,
                                "memory batch failed"
                            );
                            last_error = Some(unavailable(op, e));
                        }
                    }
                }
            }
        }

        info!(
            conversation = %conversation.id,
            sent = ack.batches_sent,
            failed = ack.batches_failed,
            "conversation ingested"
        );
        match last_error {
            Some(err) => Err(err),
            None => Ok(ack),
        }
    }

    /// Retrieve context for one question from both speakers' memories.
    pub fn search(
        &self,
        conversation: &Conversation,
        question: &QuestionItem,
        config: &RetrievalConfig,
    ) -> BenchResult<RetrievalResult> {
        config.validate()?;
        if config.is_full_context() {
            return Ok(RetrievalResult {
                question_id: question.question_id.clone(),
                config: config.clone(),
                fragments: full_context_fragments(conversation),
                relations: Vec::new(),
                latency_ms: 0.0,
            });
        }

        let mut fragments = Vec::new();
        let mut relations = Vec::new();
        let mut latency_ms = 0.0;

        for speaker in [&conversation.speaker_a, &conversation.speaker_b] {
            let user_id = conversation.user_id(speaker);
            let op = format!("search {user_id}");
            let (hits, elapsed) = self
                .policy
                .run(&op, |_| {
                    let start = Instant::now();
                    self.backend
                        .search(&user_id, &question.question, config)
                        .map(|hits| (hits, start.elapsed().as_secs_f64() * 1000.0))
                })
                .map_err(|e| unavailable(op, e))?;

            latency_ms += elapsed;
            let SearchHits {
                hits,
                relations: graph,
            } = hits;
            fragments.extend(hits.into_iter().map(|hit| ContextFragment {
                speaker: speaker.clone(),
                text: match hit.timestamp.as_deref() {
                    Some(ts) if !ts.is_empty() => format!("{ts}: {}", hit.memory),
                    _ => hit.memory,
                },
                score: hit.score,
            }));
            if config.is_graph() {
                relations.extend(
                    graph
                        .into_iter()
                        .map(|r| format!("{} -> {} -> {}", r.source, r.relationship, r.target)),
                );
            }
        }

        Ok(RetrievalResult {
            question_id: question.question_id.clone(),
            config: config.clone(),
            fragments,
            relations,
            latency_ms,
        })
    }
}

/// Every turn of every session, in order, as `"{timestamp} | {speaker}: {text}"`.
pub fn full_context_fragments(conversation: &Conversation) -> Vec<ContextFragment> {
    conversation
        .sessions
        .iter()
        .flat_map(|session| {
            session.turns.iter().map(move |turn| ContextFragment {
                speaker: turn.speaker.clone(),
                text: if session.timestamp.is_empty() {
                    format!("{}: {}", turn.speaker, turn.text)
                } else {
                    format!("{} | {}: {}", session.timestamp, turn.speaker, turn.text)
                },
                score: None,
            })
        })
        .collect()
}

fn unavailable(operation: String, e: RetryExhausted) -> BenchError {
    BenchError::BackendUnavailable {
        operation,
        attempts: e.attempts,
        last_error: e.last_error.to_string(),
    }
}

/// The owner's turns become `user` messages, the other speaker's `assistant`.
fn perspective_messages(owner: &str, turns: &[crate::model::Turn]) -> Vec<MemoryMessage> {
    turns
        .iter()
        .map(|t| MemoryMessage {
            role: if t.speaker == owner { "user" } else { "assistant" }.to_string(),
            content: format!("{}: {}", t.speaker, t.text),
        })
        .collect()
}
