//! Experiment runner: one full evaluation pass for one retrieval configuration.
//!
//! `Init -> Loading -> Processing -> Aggregating -> Finalized`, with `Failed`
//! reachable from every non-terminal state. `metadata.json` is written before
//! the dataset is read and is the only record of whether the run completed.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::{Local, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use membench_core::{
    aggregate, fingerprint, AggregateReport, AnswerGenerator, BackoffPolicy, BenchError,
    BenchResult, Category, Conversation, Dataset, ExcludedItem, ExperimentMetadata, ItemFailure,
    MemoryBackend, MemoryGateway, Oracle, QuestionItem, QuestionRecord, ResultSet,
    RetrievalConfig, RunParameters, RunStatus, ScoreRecord, Scorer, Stage,
};
use membench_store::layout::CHECKPOINT_FILE;
use membench_store::{create_unique_dir, experiment_name, Checkpoint, RunStore};

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Immutable settings for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub retrieval: RetrievalConfig,
    pub data_file: PathBuf,
    pub output_dir: PathBuf,
    pub workers: usize,
    pub checkpoint_every: usize,
    pub ingest: bool,
    pub resume: Option<PathBuf>,
    pub add_batch_size: usize,
    pub bleu_max_n: usize,
}

/// External collaborators shared by all workers.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub backend: &'a dyn MemoryBackend,
    pub answerer: &'a dyn Oracle,
    pub judge: Option<&'a dyn Oracle>,
    pub policy: &'a BackoffPolicy,
}

/// Cooperative cancellation shared with the signal handler.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn shared(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Loading,
    Processing,
    Aggregating,
    Finalized,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finalized | Self::Failed)
    }

    pub fn can_transition(self, to: RunState) -> bool {
        use RunState::*;
        match (self, to) {
            (from, Failed) => !from.is_terminal(),
            (Init, Loading) | (Loading, Processing) | (Processing, Aggregating) => true,
            (Aggregating, Finalized) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::Loading => "loading",
            Self::Processing => "processing",
            Self::Aggregating => "aggregating",
            Self::Finalized => "finalized",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// What a finished (or failed) run leaves behind.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub dir: PathBuf,
    pub metadata: ExperimentMetadata,
    pub report: AggregateReport,
    pub records: Vec<QuestionRecord>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.metadata.status == RunStatus::Completed
    }
}

/// Mutable state owned by the runner for the duration of one run.
struct RunContext {
    store: RunStore,
    metadata: ExperimentMetadata,
    state: RunState,
    results: ResultSet,
    records: Vec<QuestionRecord>,
}

impl RunContext {
    fn transition(&mut self, to: RunState) -> BenchResult<()> {
        if !self.state.can_transition(to) {
            return Err(BenchError::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        info!(from = %self.state, to = %to, run = %self.metadata.experiment_name, "run state");
        self.state = to;
        Ok(())
    }

    fn outcome(self) -> RunOutcome {
        let report = aggregate(&self.metadata.parameters.config.id(), &self.results);
        RunOutcome {
            dir: self.store.dir().to_path_buf(),
            metadata: self.metadata,
            report,
            records: self.records,
        }
    }
}

/// Result of processing one question.
enum ItemOutcome {
    Scored(QuestionRecord, ScoreRecord),
    Excluded(Option<QuestionRecord>, ExcludedItem),
    Failed(ItemFailure),
}

/// Results shared by the worker pool. Every append takes the lock.
struct Collected {
    results: ResultSet,
    records: Vec<QuestionRecord>,
    since_checkpoint: usize,
    fatal: Option<BenchError>,
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

pub struct ExperimentRunner<'a> {
    config: &'a RunConfig,
    deps: Collaborators<'a>,
    cancel: CancelFlag,
}

impl<'a> ExperimentRunner<'a> {
    pub fn new(config: &'a RunConfig, deps: Collaborators<'a>, cancel: CancelFlag) -> Self {
        Self {
            config,
            deps,
            cancel,
        }
    }

    /// Run to completion.
    ///
    /// Errors before `metadata.json` exists (bad config, resume mismatch, an
    /// uncreatable run directory) are returned as `Err`. Anything later ends the
    /// run `failed` and is reported through the returned outcome.
    pub fn run(self) -> BenchResult<RunOutcome> {
        let mut ctx = self.init()?;
        match self.execute(&mut ctx) {
            Ok(()) => Ok(ctx.outcome()),
            Err(err) => {
                let message = match &err {
                    BenchError::Cancelled => "cancelled".to_string(),
                    other => other.to_string(),
                };
                error!(run = %ctx.metadata.experiment_name, error = %message, "run failed");
                if ctx.transition(RunState::Failed).is_err() {
                    ctx.state = RunState::Failed;
                }
                ctx.metadata.record_report(&aggregate(
                    &self.config.retrieval.id(),
                    &ctx.results,
                ));
                ctx.metadata.fail(message);
                if let Err(e) = ctx.store.write_metadata(&ctx.metadata) {
                    error!(error = %e, "could not record failed status");
                }
                Ok(ctx.outcome())
            }
        }
    }

    fn params(&self) -> RunParameters {
        RunParameters {
            data_file: self.config.data_file.display().to_string(),
            config: self.config.retrieval.clone(),
            workers: self.config.workers,
            checkpoint_every: self.config.checkpoint_every,
            ingest: self.config.ingest,
            answer_model: self.deps.answerer.model().to_string(),
            judge_model: self
                .deps
                .judge
                .map(|j| j.model().to_string())
                .unwrap_or_default(),
        }
    }

    /// `Init`: validate, allocate or reopen the run directory, write metadata.
    fn init(&self) -> BenchResult<RunContext> {
        self.config.retrieval.validate()?;
        if self.config.workers == 0 {
            return Err(BenchError::Config("workers must be at least 1".into()));
        }

        let (store, metadata, results, records) = match &self.config.resume {
            Some(dir) => self.reopen(dir)?,
            None => {
                let name = experiment_name(&self.config.retrieval, Local::now().naive_local());
                let dir = create_unique_dir(&self.config.output_dir, &name)?;
                let experiment_name = dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or(name);
                let metadata = ExperimentMetadata::new(experiment_name, self.params());
                (RunStore::new(dir), metadata, ResultSet::default(), Vec::new())
            }
        };

        let ctx = RunContext {
            store,
            metadata,
            state: RunState::Init,
            results,
            records,
        };
        ctx.store.write_metadata(&ctx.metadata)?;
        info!(
            run = %ctx.metadata.experiment_name,
            config = %self.config.retrieval,
            dir = %ctx.store.dir().display(),
            "run initialized"
        );
        Ok(ctx)
    }

    fn reopen(
        &self,
        dir: &Path,
    ) -> BenchResult<(RunStore, ExperimentMetadata, ResultSet, Vec<QuestionRecord>)> {
        let store = RunStore::open(dir)?;
        let mut metadata = store.read_metadata()?;
        if metadata.parameters.config != self.config.retrieval {
            return Err(BenchError::Config(format!(
                "resume config mismatch: run was {}, requested {}",
                metadata.parameters.config, self.config.retrieval
            )));
        }

        let bytes = std::fs::read(&self.config.data_file)
            .map_err(|e| BenchError::persistence(&self.config.data_file, e))?;
        let current = fingerprint(&bytes);
        if let Some(previous) = &metadata.dataset_sha256 {
            if *previous != current {
                return Err(BenchError::Config(format!(
                    "resume dataset mismatch: {} has changed since the run started",
                    self.config.data_file.display()
                )));
            }
        }

        let (mut results, mut records) = match store.load_checkpoint()? {
            Some(cp) => (cp.results, cp.records),
            None => (ResultSet::default(), Vec::new()),
        };
        let retried = results.clear_failures();
        let done = results.completed_ids();
        records.retain(|r| done.contains(r.question_id.as_str()));

        if metadata.status == RunStatus::Completed {
            warn!(run = %metadata.experiment_name, "resuming a completed run");
        }
        metadata.reopen();
        metadata.parameters = self.params();
        info!(
            run = %metadata.experiment_name,
            completed = results.completed(),
            retried,
            "resuming"
        );
        Ok((store, metadata, results, records))
    }

    fn execute(&self, ctx: &mut RunContext) -> BenchResult<()> {
        // Loading
        ctx.transition(RunState::Loading)?;
        let dataset = Dataset::from_file(&self.config.data_file)?;
        ctx.metadata.dataset_sha256 = Some(dataset.fingerprint.clone());
        ctx.metadata.counts.questions = dataset.question_count();
        ctx.store.write_metadata(&ctx.metadata)?;

        if self.config.ingest && self.config.retrieval.is_full_context() {
            info!("full-context reads the dataset directly; ingestion skipped");
        } else if self.config.ingest {
            ctx.metadata.counts.ingest_failures = self.ingest(&dataset).failures;
            ctx.store.write_metadata(&ctx.metadata)?;
        }

        // Processing
        ctx.transition(RunState::Processing)?;
        self.process(ctx, &dataset)?;

        // Aggregating
        ctx.transition(RunState::Aggregating)?;
        let report = aggregate(&self.config.retrieval.id(), &ctx.results);
        let files = ctx.store.write_artifacts(&ctx.records, &ctx.results, &report)?;

        // Finalized
        ctx.transition(RunState::Finalized)?;
        ctx.metadata.files = files;
        ctx.metadata.record_report(&report);
        ctx.metadata.complete();
        ctx.store.write_metadata(&ctx.metadata)?;
        info!(
            run = %ctx.metadata.experiment_name,
            scored = report.scored,
            excluded = report.excluded,
            failed = report.failed,
            unjudged = report.unjudged,
            "run completed"
        );
        Ok(())
    }

    fn ingest(&self, dataset: &Dataset) -> AddPhase {
        ingest_dataset(
            self.deps.backend,
            self.deps.policy,
            self.config.add_batch_size,
            dataset,
        )
    }

    fn process(&self, ctx: &mut RunContext, dataset: &Dataset) -> BenchResult<()> {
        let done: HashSet<String> = ctx
            .results
            .completed_ids()
            .into_iter()
            .map(str::to_string)
            .collect();
        let pending: Vec<(&Conversation, &QuestionItem)> = dataset
            .questions()
            .filter(|(_, q)| !done.contains(&q.question_id))
            .collect();
        info!(
            pending = pending.len(),
            skipped = done.len(),
            workers = self.config.workers,
            "processing questions"
        );

        let collected = Mutex::new(Collected {
            results: std::mem::take(&mut ctx.results),
            records: std::mem::take(&mut ctx.records),
            since_checkpoint: 0,
            fatal: None,
        });
        let cursor = AtomicUsize::new(0);
        let gateway = MemoryGateway::new(
            self.deps.backend,
            self.deps.policy.clone(),
            self.config.add_batch_size,
        );
        let generator = AnswerGenerator::new(self.deps.answerer, self.deps.policy.clone());
        let scorer = Scorer::new(
            self.deps.judge,
            self.deps.policy.clone(),
            self.config.bleu_max_n,
        );
        let config_id = self.config.retrieval.id();
        let checkpoint_every = self.config.checkpoint_every.max(1);
        let dataset_sha = Some(dataset.fingerprint.clone());
        let store = &ctx.store;
        let workers = self.config.workers.min(pending.len()).max(1);

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    let idx = cursor.fetch_add(1, Ordering::SeqCst);
                    let Some((conversation, question)) = pending.get(idx).copied() else {
                        break;
                    };

                    let outcome = process_item(
                        &gateway,
                        &generator,
                        &scorer,
                        &self.config.retrieval,
                        conversation,
                        question,
                    );

                    let mut guard = collected.lock().unwrap_or_else(PoisonError::into_inner);
                    if guard.fatal.is_some() {
                        break;
                    }
                    match outcome {
                        ItemOutcome::Scored(record, score) => {
                            guard.records.push(record);
                            guard.results.scored.push(score);
                        }
                        ItemOutcome::Excluded(record, excluded) => {
                            guard.records.extend(record);
                            guard.results.excluded.push(excluded);
                        }
                        ItemOutcome::Failed(failure) => guard.results.failed.push(failure),
                    }
                    guard.since_checkpoint += 1;
                    if guard.since_checkpoint >= checkpoint_every {
                        guard.since_checkpoint = 0;
                        let snapshot = checkpoint(&config_id, &dataset_sha, &guard);
                        if let Err(e) = store.save_checkpoint(&snapshot) {
                            error!(error = %e, "checkpoint failed");
                            guard.fatal = Some(e);
                            break;
                        }
                        info!(
                            completed = guard.results.completed(),
                            failed = guard.results.failed.len(),
                            total = pending.len() + done.len(),
                            "progress"
                        );
                    }
                });
            }
        });

        let collected = collected.into_inner().unwrap_or_else(PoisonError::into_inner);
        let snapshot = checkpoint(&config_id, &dataset_sha, &collected);
        ctx.results = collected.results;
        ctx.records = collected.records;
        ctx.metadata.files.checkpoint = Some(CHECKPOINT_FILE.into());

        if let Some(err) = collected.fatal {
            return Err(err);
        }
        ctx.store.save_checkpoint(&snapshot)?;
        if self.cancel.is_cancelled() {
            warn!(
                completed = ctx.results.completed(),
                remaining = pending.len().saturating_sub(cursor.load(Ordering::SeqCst)),
                "cancelled, checkpoint written"
            );
            return Err(BenchError::Cancelled);
        }
        Ok(())
    }
}

fn checkpoint(config_id: &str, dataset_sha: &Option<String>, collected: &Collected) -> Checkpoint {
    Checkpoint {
        config_id: config_id.to_string(),
        dataset_sha256: dataset_sha.clone(),
        saved_at: Utc::now(),
        results: collected.results.clone(),
        records: collected.records.clone(),
    }
}

/// Retrieve, answer and score one question.
fn process_item(
    gateway: &MemoryGateway<'_>,
    generator: &AnswerGenerator<'_>,
    scorer: &Scorer<'_>,
    config: &RetrievalConfig,
    conversation: &Conversation,
    question: &QuestionItem,
) -> ItemOutcome {
    let adversarial = question.category == Category::Adversarial;
    let fail = |stage: Stage, err: BenchError| {
        warn!(question_id = %question.question_id, stage = %stage, error = %err, "item failed");
        if adversarial {
            ItemOutcome::Excluded(
                None,
                ExcludedItem {
                    question_id: question.question_id.clone(),
                    category: question.category,
                    answered: false,
                },
            )
        } else {
            ItemOutcome::Failed(ItemFailure {
                question_id: question.question_id.clone(),
                category: question.category,
                stage,
                error: err.to_string(),
            })
        }
    };

    let retrieval = match gateway.search(conversation, question, config) {
        Ok(r) => r,
        Err(e) => return fail(Stage::Retrieval, e),
    };
    let answer = match generator.generate(conversation, question, &retrieval) {
        Ok(a) => a,
        Err(e) => return fail(Stage::Generation, e),
    };

    let record = QuestionRecord {
        question_id: question.question_id.clone(),
        conversation_id: conversation.id.clone(),
        question: question.question.clone(),
        reference: question.answer.clone(),
        category: question.category,
        retrieval,
        answer,
    };

    if adversarial {
        let excluded = ExcludedItem {
            question_id: question.question_id.clone(),
            category: question.category,
            answered: true,
        };
        return ItemOutcome::Excluded(Some(record), excluded);
    }

    let score = scorer.score(
        &record.answer.answer,
        &question.answer,
        question,
        &record.answer.config_id,
    );
    ItemOutcome::Scored(record, score)
}

/// Cost of storing a dataset in the memory service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AddPhase {
    pub conversations: usize,
    pub failures: usize,
    pub total_ms: f64,
    pub avg_ms: Option<f64>,
}

/// Add every conversation through the gateway, timing each one.
pub fn ingest_dataset(
    backend: &dyn MemoryBackend,
    policy: &BackoffPolicy,
    batch_size: usize,
    dataset: &Dataset,
) -> AddPhase {
    let gateway = MemoryGateway::new(backend, policy.clone(), batch_size);
    let mut phase = AddPhase::default();
    for conversation in &dataset.conversations {
        let start = Instant::now();
        if let Err(e) = gateway.add(conversation) {
            warn!(conversation = %conversation.id, error = %e, "ingestion failed");
            phase.failures += 1;
        }
        phase.total_ms += start.elapsed().as_secs_f64() * 1000.0;
        phase.conversations += 1;
    }
    phase.avg_ms = (phase.conversations > 0).then(|| phase.total_ms / phase.conversations as f64);
    info!(
        conversations = phase.conversations,
        failures = phase.failures,
        total_ms = phase.total_ms,
        "ingestion finished"
    );
    phase
}
