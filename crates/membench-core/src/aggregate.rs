use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::category::Category;
use crate::model::{ResultSet, ScoreRecord};

/// Mean metrics for one category (or the overall row).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryStats {
    pub count: usize,
    #[serde(default)]
    pub unjudged: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bleu: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub f1: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_judge: Option<f64>,
}

impl CategoryStats {
    fn from_records<'a>(records: impl IntoIterator<Item = &'a ScoreRecord>) -> Self {
        let mut bleu = Vec::new();
        let mut f1 = Vec::new();
        let mut judge = Vec::new();
        let mut unjudged = 0;
        for r in records {
            bleu.push(r.bleu);
            f1.push(r.f1);
            match r.llm_judge {
                Some(v) => judge.push(v),
                None => unjudged += 1,
            }
        }
        Self {
            count: bleu.len(),
            unjudged,
            bleu: mean(bleu),
            f1: mean(f1),
            llm_judge: mean(judge),
        }
    }

    fn counted_only(count: usize) -> Self {
        Self {
            count,
            ..Self::default()
        }
    }
}

/// Order-independent mean: values are sorted before summing.
fn mean(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let sum: f64 = values.iter().sum();
    Some(sum / values.len() as f64)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub config_id: String,
    pub categories: BTreeMap<Category, CategoryStats>,
    pub overall: CategoryStats,
    pub scored: usize,
    pub excluded: usize,
    pub failed: usize,
    pub unjudged: usize,
}

/// Per-category and overall means for one configuration.
///
/// Every category appears in the report. Adversarial items only carry a count.
pub fn aggregate(config_id: &str, results: &ResultSet) -> AggregateReport {
    let mut by_category: BTreeMap<Category, Vec<&ScoreRecord>> = BTreeMap::new();
    for record in &results.scored {
        by_category.entry(record.category).or_default().push(record);
    }

    let mut categories = BTreeMap::new();
    for category in Category::ALL {
        let stats = if category.is_scored() {
            CategoryStats::from_records(by_category.get(&category).into_iter().flatten().copied())
        } else {
            CategoryStats::counted_only(
                results
                    .excluded
                    .iter()
                    .filter(|e| e.category == category)
                    .count(),
            )
        };
        categories.insert(category, stats);
    }

    let overall = CategoryStats::from_records(
        results.scored.iter().filter(|r| r.category.is_scored()),
    );

    AggregateReport {
        config_id: config_id.to_string(),
        scored: overall.count,
        excluded: results.excluded.len(),
        failed: results.failed.len(),
        unjudged: overall.unjudged,
        categories,
        overall,
    }
}

fn cell(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.4}")).unwrap_or_default()
}

impl AggregateReport {
    /// `scores.csv`: one row per category with data, then `overall`.
    pub fn to_csv(&self) -> String {
        let mut out = String::from("category_name,bleu_score,f1_score,llm_score,count\n");
        let rows = self
            .categories
            .iter()
            .filter(|(_, s)| s.count > 0)
            .map(|(c, s)| (c.as_str(), s))
            .chain(std::iter::once(("overall", &self.overall)));
        for (name, s) in rows {
            let _ = writeln!(
                out,
                "{name},{},{},{},{}",
                cell(s.bleu),
                cell(s.f1),
                cell(s.llm_judge),
                s.count
            );
        }
        out
    }

    /// Fixed-width table for the terminal.
    pub fn render_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Scores for {}", self.config_id);
        let _ = writeln!(
            out,
            "{:<14} {:>8} {:>8} {:>8} {:>7} {:>9}",
            "category", "bleu", "f1", "judge", "count", "unjudged"
        );
        let dash = |v: Option<f64>| v.map(|v| format!("{v:.4}")).unwrap_or_else(|| "-".into());
        let rows = self
            .categories
            .iter()
            .map(|(c, s)| (c.as_str(), s))
            .chain(std::iter::once(("overall", &self.overall)));
        for (name, s) in rows {
            let _ = writeln!(
                out,
                "{:<14} {:>8} {:>8} {:>8} {:>7} {:>9}",
                name,
                dash(s.bleu),
                dash(s.f1),
                dash(s.llm_judge),
                s.count,
                s.unjudged
            );
        }
        let _ = writeln!(
            out,
            "scored={} excluded={} failed={} unjudged={}",
            self.scored, self.excluded, self.failed, self.unjudged
        );
        out
    }
}
