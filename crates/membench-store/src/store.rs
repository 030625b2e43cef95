use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use membench_core::{
    AggregateReport, ArtifactFiles, BenchError, BenchResult, ExperimentMetadata, QuestionRecord,
    ResultSet, ScoreRecord,
};

use crate::layout::{
    CHECKPOINT_FILE, COMPLETE_RESULTS_FILE, EVALUATION_METRICS_FILE, METADATA_FILE,
    SCORES_CSV_FILE, SEARCH_RESULTS_FILE,
};

/// Snapshot of a run's progress, written under the collection lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub config_id: String,
    #[serde(default)]
    pub dataset_sha256: Option<String>,
    pub saved_at: DateTime<Utc>,
    pub results: ResultSet,
    #[serde(default)]
    pub records: Vec<QuestionRecord>,
}

/// One entry of `complete_results.json`: the record plus its scores, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteResult {
    #[serde(flatten)]
    pub record: QuestionRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scores: Option<ScoreRecord>,
    #[serde(default)]
    pub excluded: bool,
}

/// Filesystem handle for one experiment run directory.
#[derive(Debug, Clone)]
pub struct RunStore {
    dir: PathBuf,
}

impl RunStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Open an existing run directory for resume.
    pub fn open(dir: &Path) -> BenchResult<Self> {
        if !dir.join(METADATA_FILE).is_file() {
            return Err(BenchError::Config(format!(
                "{} is not a run directory (no {METADATA_FILE})",
                dir.display()
            )));
        }
        Ok(Self::new(dir))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    // -----------------------------------------------------------------------
    // Metadata
    // -----------------------------------------------------------------------

    pub fn write_metadata(&self, metadata: &ExperimentMetadata) -> BenchResult<()> {
        write_json_atomic(&self.path(METADATA_FILE), metadata)?;
        debug!(status = %metadata.status, "metadata written");
        Ok(())
    }

    pub fn read_metadata(&self) -> BenchResult<ExperimentMetadata> {
        read_json(&self.path(METADATA_FILE))
    }

    // -----------------------------------------------------------------------
    // Checkpoint
    // -----------------------------------------------------------------------

    pub fn save_checkpoint(&self, checkpoint: &Checkpoint) -> BenchResult<()> {
        write_json_atomic(&self.path(CHECKPOINT_FILE), checkpoint)?;
        debug!(
            completed = checkpoint.results.completed(),
            failed = checkpoint.results.failed.len(),
            "checkpoint saved"
        );
        Ok(())
    }

    /// `None` when no checkpoint was written yet.
    pub fn load_checkpoint(&self) -> BenchResult<Option<Checkpoint>> {
        let path = self.path(CHECKPOINT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    // -----------------------------------------------------------------------
    // Final artifacts
    // -----------------------------------------------------------------------

    /// Write every final artifact and return their pointers.
    ///
    /// Records and results are sorted by question id first so reruns produce
    /// byte-identical files.
    pub fn write_artifacts(
        &self,
        records: &[QuestionRecord],
        results: &ResultSet,
        report: &AggregateReport,
    ) -> BenchResult<ArtifactFiles> {
        let mut records = records.to_vec();
        records.sort_by(|a, b| a.question_id.cmp(&b.question_id));
        let mut results = results.clone();
        results.sort();

        write_json_atomic(&self.path(SEARCH_RESULTS_FILE), &records)?;
        write_json_atomic(
            &self.path(COMPLETE_RESULTS_FILE),
            &complete_results(&records, &results),
        )?;
        write_json_atomic(&self.path(EVALUATION_METRICS_FILE), &results)?;
        write_text_atomic(&self.path(SCORES_CSV_FILE), &report.to_csv())?;

        info!(dir = %self.dir.display(), records = records.len(), "artifacts written");
        Ok(ArtifactFiles {
            search_results: Some(SEARCH_RESULTS_FILE.into()),
            complete_results: Some(COMPLETE_RESULTS_FILE.into()),
            evaluation_metrics: Some(EVALUATION_METRICS_FILE.into()),
            scores_csv: Some(SCORES_CSV_FILE.into()),
            checkpoint: Some(CHECKPOINT_FILE.into()),
        })
    }
}

/// Join records with their scores. Records are expected sorted.
pub fn complete_results(records: &[QuestionRecord], results: &ResultSet) -> Vec<CompleteResult> {
    records
        .iter()
        .map(|record| CompleteResult {
            record: record.clone(),
            scores: results
                .scored
                .iter()
                .find(|s| s.question_id == record.question_id)
                .cloned(),
            excluded: results
                .excluded
                .iter()
                .any(|e| e.question_id == record.question_id),
        })
        .collect()
}

/// Load `evaluation_metrics.json` from any location.
pub fn read_evaluation_metrics(path: &Path) -> BenchResult<ResultSet> {
    read_json(path)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> BenchResult<T> {
    let content = std::fs::read_to_string(path).map_err(|e| BenchError::persistence(path, e))?;
    serde_json::from_str(&content).map_err(|e| BenchError::persistence(path, e))
}

pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> BenchResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    write_text_atomic(path, &json)
}

/// Write to `<path>.tmp`, then rename over `path`.
pub fn write_text_atomic(path: &Path, content: &str) -> BenchResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, content).map_err(|e| BenchError::persistence(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| BenchError::persistence(path, e))
}
