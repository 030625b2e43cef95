use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use tracing::debug;

use membench_core::{BenchError, BenchResult, RetrievalConfig};

pub const METADATA_FILE: &str = "metadata.json";
pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const SEARCH_RESULTS_FILE: &str = "search_results.json";
pub const COMPLETE_RESULTS_FILE: &str = "complete_results.json";
pub const EVALUATION_METRICS_FILE: &str = "evaluation_metrics.json";
pub const SCORES_CSV_FILE: &str = "scores.csv";
pub const COMPARISON_CSV_FILE: &str = "comparison.csv";
pub const PERFORMANCE_SUMMARY_FILE: &str = "performance_summary.json";

const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// `mem0_eval_top10_filterfalse_graphtrue_20250101_120000`, or
/// `full-context_eval_20250101_120000` when nothing is retrieved.
pub fn experiment_name(config: &RetrievalConfig, at: NaiveDateTime) -> String {
    if config.is_full_context() {
        return format!("{}_eval_{}", config.technique, at.format(STAMP_FORMAT));
    }
    format!(
        "{}_eval_top{}_filter{}_graph{}_{}",
        config.technique,
        config.top_k,
        config.filter_memories,
        config.is_graph(),
        at.format(STAMP_FORMAT)
    )
}

/// Parent directory name for a multi-configuration comparison.
pub fn comparison_name(technique: &str, at: NaiveDateTime) -> String {
    format!("{technique}_perf_{}", at.format(STAMP_FORMAT))
}

/// Create `parent/name`, appending `_1`, `_2`, ... until the name is free.
///
/// Creation uses `create_dir`, so two runs started in the same second never
/// share a directory.
pub fn create_unique_dir(parent: &Path, name: &str) -> BenchResult<PathBuf> {
    std::fs::create_dir_all(parent).map_err(|e| BenchError::persistence(parent, e))?;

    let mut suffix = 0u32;
    loop {
        let candidate = if suffix == 0 {
            parent.join(name)
        } else {
            parent.join(format!("{name}_{suffix}"))
        };
        match std::fs::create_dir(&candidate) {
            Ok(()) => {
                debug!(path = %candidate.display(), "created run directory");
                return Ok(candidate);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => suffix += 1,
            Err(e) => return Err(BenchError::persistence(&candidate, e)),
        }
    }
}
