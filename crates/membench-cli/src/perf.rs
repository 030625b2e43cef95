//! Runs one experiment per retrieval configuration and ranks the results.

use std::cmp::Ordering;
use std::fmt::Write as _;
use std::path::PathBuf;

use chrono::Local;
use serde::Serialize;
use tracing::{error, info, warn};

use membench_core::{
    aggregate, AggregateReport, BenchResult, Dataset, QuestionRecord, ResultSet, RetrievalConfig,
    RunStatus,
};
use membench_store::layout::{COMPARISON_CSV_FILE, PERFORMANCE_SUMMARY_FILE};
use membench_store::{comparison_name, create_unique_dir, write_json_atomic, write_text_atomic};

use crate::runner::{
    ingest_dataset, AddPhase, CancelFlag, Collaborators, ExperimentRunner, RunConfig,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RankingKey {
    #[default]
    LlmJudge,
    F1,
    Bleu,
    Latency,
    Tokens,
}

impl RankingKey {
    fn higher_is_better(self) -> bool {
        matches!(self, Self::LlmJudge | Self::F1 | Self::Bleu)
    }

    fn value(self, perf: &ConfigPerformance) -> Option<f64> {
        let overall = &perf.report.overall;
        match self {
            Self::LlmJudge => overall.llm_judge,
            Self::F1 => overall.f1,
            Self::Bleu => overall.bleu,
            Self::Latency => perf.total_latency_ms,
            Self::Tokens => perf.tokens.avg_total,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub mean_ms: Option<f64>,
    pub min_ms: Option<f64>,
    pub max_ms: Option<f64>,
}

impl LatencyStats {
    fn from_values(mut values: Vec<f64>) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        values.sort_by(f64::total_cmp);
        let sum: f64 = values.iter().sum();
        Self {
            mean_ms: Some(sum / values.len() as f64),
            min_ms: values.first().copied(),
            max_ms: values.last().copied(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TokenStats {
    pub avg_input: Option<f64>,
    pub avg_output: Option<f64>,
    pub avg_total: Option<f64>,
    pub total_input: u64,
    pub total_output: u64,
    pub total: u64,
}

/// Quality and cost of one configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigPerformance {
    pub config_id: String,
    pub config: RetrievalConfig,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub report: AggregateReport,
    pub search_latency: LatencyStats,
    pub response_latency: LatencyStats,
    pub total_latency_ms: Option<f64>,
    pub tokens: TokenStats,
}

impl ConfigPerformance {
    pub fn from_records(
        config: &RetrievalConfig,
        report: AggregateReport,
        records: &[QuestionRecord],
    ) -> Self {
        let search = LatencyStats::from_values(
            records.iter().map(|r| r.retrieval.latency_ms).collect(),
        );
        let response =
            LatencyStats::from_values(records.iter().map(|r| r.answer.latency_ms).collect());
        let total = LatencyStats::from_values(
            records
                .iter()
                .map(|r| r.retrieval.latency_ms + r.answer.latency_ms)
                .collect(),
        );

        let total_input: u64 = records.iter().map(|r| r.answer.input_tokens).sum();
        let total_output: u64 = records.iter().map(|r| r.answer.output_tokens).sum();
        let n = records.len();
        let avg = |sum: u64| (n > 0).then(|| sum as f64 / n as f64);
        let tokens = TokenStats {
            avg_input: avg(total_input),
            avg_output: avg(total_output),
            avg_total: avg(total_input + total_output),
            total_input,
            total_output,
            total: total_input + total_output,
        };

        Self {
            config_id: config.id(),
            config: config.clone(),
            status: RunStatus::Completed,
            run_dir: None,
            error: None,
            report,
            search_latency: search,
            response_latency: response,
            total_latency_ms: total.mean_ms,
            tokens,
        }
    }

    /// Entry for a configuration that never got a run directory.
    fn not_started(config: &RetrievalConfig, error: String) -> Self {
        let mut perf = Self::from_records(config, aggregate(&config.id(), &ResultSet::default()), &[]);
        perf.status = RunStatus::Failed;
        perf.error = Some(error);
        perf
    }
}

/// Quality keys descending, cost keys ascending, missing values last.
/// Ties go to lower mean latency, then to config id.
pub fn rank(perfs: &mut [ConfigPerformance], key: RankingKey) {
    perfs.sort_by(|a, b| {
        let primary = compare_option(key.value(a), key.value(b), key.higher_is_better());
        primary
            .then_with(|| compare_option(a.total_latency_ms, b.total_latency_ms, false))
            .then_with(|| a.config_id.cmp(&b.config_id))
    });
}

fn compare_option(a: Option<f64>, b: Option<f64>, descending: bool) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => {
            let ord = x.total_cmp(&y);
            if descending {
                ord.reverse()
            } else {
                ord
            }
        }
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSummary {
    pub dir: String,
    pub rank_by: RankingKey,
    /// Present when the dataset was ingested before the comparison.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub add_phase: Option<AddPhase>,
    pub configs: Vec<ConfigPerformance>,
}

impl PerformanceSummary {
    pub fn all_completed(&self) -> bool {
        self.configs.iter().all(|c| c.status == RunStatus::Completed)
    }

    /// `comparison.csv`, in ranked order.
    pub fn to_csv(&self) -> String {
        let mut out = String::from(
            "config,llm_score,f1_score,bleu_score,avg_search_ms,avg_response_ms,avg_total_ms,avg_total_tokens,count\n",
        );
        let cell = |v: Option<f64>, decimals: usize| {
            v.map(|v| format!("{v:.decimals$}")).unwrap_or_default()
        };
        for c in &self.configs {
            let name = if c.status == RunStatus::Completed {
                c.config_id.clone()
            } else {
                format!("{} (failed)", c.config_id)
            };
            let o = &c.report.overall;
            let _ = writeln!(
                out,
                "{name},{},{},{},{},{},{},{},{}",
                cell(o.llm_judge, 4),
                cell(o.f1, 4),
                cell(o.bleu, 4),
                cell(c.search_latency.mean_ms, 1),
                cell(c.response_latency.mean_ms, 1),
                cell(c.total_latency_ms, 1),
                cell(c.tokens.avg_total, 1),
                o.count
            );
        }
        out
    }

    pub fn render_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<4} {:<32} {:>8} {:>8} {:>8} {:>10} {:>10} {:>6}",
            "rank", "config", "judge", "f1", "bleu", "total_ms", "tokens", "count"
        );
        let dash = |v: Option<f64>, d: usize| v.map(|v| format!("{v:.d$}")).unwrap_or_else(|| "-".into());
        for (i, c) in self.configs.iter().enumerate() {
            let marker = if c.status == RunStatus::Completed { "" } else { " !" };
            let o = &c.report.overall;
            let _ = writeln!(
                out,
                "{:<4} {:<32} {:>8} {:>8} {:>8} {:>10} {:>10} {:>6}{marker}",
                i + 1,
                c.config_id,
                dash(o.llm_judge, 4),
                dash(o.f1, 4),
                dash(o.bleu, 4),
                dash(c.total_latency_ms, 1),
                dash(c.tokens.avg_total, 1),
                o.count
            );
        }
        if let Some(add) = &self.add_phase {
            let _ = writeln!(
                out,
                "add phase: {} conversations, {} failed, {:.1} ms total, {} ms avg",
                add.conversations,
                add.failures,
                add.total_ms,
                dash(add.avg_ms, 1)
            );
        }
        out
    }
}

/// Runs an experiment per configuration under one parent directory.
pub struct PerformanceEvaluator<'a> {
    template: RunConfig,
    deps: Collaborators<'a>,
    cancel: CancelFlag,
    rank_by: RankingKey,
}

impl<'a> PerformanceEvaluator<'a> {
    /// `template` supplies everything except the retrieval configuration.
    pub fn new(
        template: RunConfig,
        deps: Collaborators<'a>,
        cancel: CancelFlag,
        rank_by: RankingKey,
    ) -> Self {
        Self {
            template,
            deps,
            cancel,
            rank_by,
        }
    }

    pub fn run(&self, configs: &[RetrievalConfig]) -> BenchResult<PerformanceSummary> {
        for config in configs {
            config.validate()?;
        }
        let mut techniques: Vec<&str> = Vec::new();
        for config in configs {
            if !techniques.contains(&config.technique.as_str()) {
                techniques.push(&config.technique);
            }
        }
        if techniques.is_empty() {
            techniques.push(&self.template.retrieval.technique);
        }
        let parent = create_unique_dir(
            &self.template.output_dir,
            &comparison_name(&techniques.join("+"), Local::now().naive_local()),
        )?;
        info!(dir = %parent.display(), configs = configs.len(), "performance evaluation");

        let needs_memory = configs.iter().any(|c| !c.is_full_context());
        let add_phase = if self.template.ingest && needs_memory {
            let dataset = Dataset::from_file(&self.template.data_file)?;
            Some(ingest_dataset(
                self.deps.backend,
                self.deps.policy,
                self.template.add_batch_size,
                &dataset,
            ))
        } else {
            None
        };

        let mut perfs = Vec::with_capacity(configs.len());
        for config in configs {
            if self.cancel.is_cancelled() {
                warn!(config = %config, "skipped after cancellation");
                perfs.push(ConfigPerformance::not_started(config, "cancelled".into()));
                continue;
            }
            perfs.push(self.run_one(config, parent.clone()));
        }

        rank(&mut perfs, self.rank_by);
        let summary = PerformanceSummary {
            dir: parent.display().to_string(),
            rank_by: self.rank_by,
            add_phase,
            configs: perfs,
        };
        write_text_atomic(&parent.join(COMPARISON_CSV_FILE), &summary.to_csv())?;
        write_json_atomic(&parent.join(PERFORMANCE_SUMMARY_FILE), &summary)?;
        Ok(summary)
    }

    fn run_one(&self, config: &RetrievalConfig, parent: PathBuf) -> ConfigPerformance {
        let run_config = RunConfig {
            retrieval: config.clone(),
            output_dir: parent,
            ingest: false,
            resume: None,
            ..self.template.clone()
        };
        match ExperimentRunner::new(&run_config, self.deps, self.cancel.clone()).run() {
            Ok(outcome) => {
                let mut perf = ConfigPerformance::from_records(config, outcome.report, &outcome.records);
                perf.status = outcome.metadata.status;
                perf.error = outcome.metadata.error;
                perf.run_dir = Some(outcome.dir.display().to_string());
                perf
            }
            Err(e) => {
                error!(config = %config, error = %e, "configuration could not start");
                ConfigPerformance::not_started(config, e.to_string())
            }
        }
    }
}
