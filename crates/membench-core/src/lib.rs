pub mod aggregate;
pub mod answer;
pub mod backend;
pub mod category;
pub mod error;
pub mod experiment;
pub mod gateway;
pub mod loader;
pub mod metrics;
pub mod model;
pub mod oracle;
pub mod retry;
pub mod scorer;

pub use aggregate::{aggregate, AggregateReport, CategoryStats};
pub use answer::AnswerGenerator;
pub use backend::{GraphRelation, MemoryBackend, MemoryMessage, SearchHit, SearchHits};
pub use category::Category;
pub use error::{BenchError, BenchResult, CallError};
pub use experiment::{ArtifactFiles, ExperimentMetadata, RunCounts, RunParameters, RunStatus};
pub use gateway::{full_context_fragments, AddAck, MemoryGateway};
pub use loader::{fingerprint, Dataset, DatasetStats};
pub use model::{
    AnswerRecord, BackendMode, ContextFragment, Conversation, ExcludedItem, ItemFailure,
    QuestionItem, QuestionRecord, ResultSet, RetrievalConfig, RetrievalResult, ScoreRecord,
    Session, Stage, Turn, FULL_CONTEXT_TECHNIQUE,
};
pub use oracle::{Completion, Oracle};
pub use retry::{BackoffPolicy, RetryExhausted};
pub use scorer::Scorer;
