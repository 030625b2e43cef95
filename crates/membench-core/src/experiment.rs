use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::aggregate::{AggregateReport, CategoryStats};
use crate::model::RetrievalConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParameters {
    pub data_file: String,
    pub config: RetrievalConfig,
    pub workers: usize,
    pub checkpoint_every: usize,
    pub ingest: bool,
    pub answer_model: String,
    pub judge_model: String,
}

/// Artifact pointers, relative to the run directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactFiles {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_results: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete_results: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_metrics: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scores_csv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub questions: usize,
    pub scored: usize,
    pub excluded: usize,
    pub failed: usize,
    pub unjudged: usize,
    #[serde(default)]
    pub ingest_failures: usize,
}

/// Single source of truth for whether a run completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentMetadata {
    pub run_id: String,
    pub experiment_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub parameters: RunParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_sha256: Option<String>,
    #[serde(default)]
    pub files: ArtifactFiles,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_scores: Option<CategoryStats>,
    #[serde(default)]
    pub counts: RunCounts,
    #[serde(default)]
    pub resumed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExperimentMetadata {
    pub fn new(experiment_name: String, parameters: RunParameters) -> Self {
        Self {
            run_id: ulid::Ulid::new().to_string(),
            experiment_name,
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            parameters,
            dataset_sha256: None,
            files: ArtifactFiles::default(),
            overall_scores: None,
            counts: RunCounts::default(),
            resumed: 0,
            error: None,
        }
    }

    pub fn record_report(&mut self, report: &AggregateReport) {
        self.overall_scores = Some(report.overall.clone());
        self.counts.scored = report.scored;
        self.counts.excluded = report.excluded;
        self.counts.failed = report.failed;
        self.counts.unjudged = report.unjudged;
    }

    pub fn complete(&mut self) {
        self.status = RunStatus::Completed;
        self.finished_at = Some(Utc::now());
        self.error = None;
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = RunStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error.into());
    }

    /// Reopen a previously interrupted run.
    pub fn reopen(&mut self) {
        self.status = RunStatus::Running;
        self.finished_at = None;
        self.error = None;
        self.resumed += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> RunParameters {
        RunParameters {
            data_file: "dataset/locomo10.json".into(),
            config: RetrievalConfig::new("mem0", 10),
            workers: 4,
            checkpoint_every: 10,
            ingest: false,
            answer_model: "gpt-4o-mini".into(),
            judge_model: "gpt-4o-mini".into(),
        }
    }

    #[test]
    fn test_lifecycle() {
        let mut meta = ExperimentMetadata::new("run".into(), params());
        assert_eq!(meta.status, RunStatus::Running);
        assert!(meta.finished_at.is_none());

        meta.fail("cancelled");
        assert_eq!(meta.status, RunStatus::Failed);
        assert_eq!(meta.error.as_deref(), Some("cancelled"));

        meta.reopen();
        assert_eq!(meta.status, RunStatus::Running);
        assert_eq!(meta.resumed, 1);
        assert!(meta.error.is_none());

        meta.complete();
        assert_eq!(meta.status, RunStatus::Completed);
        assert!(meta.finished_at.is_some());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let meta = ExperimentMetadata::new("run".into(), params());
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["status"], "running");
        assert!(json.get("error").is_none());
    }
}
