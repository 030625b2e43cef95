//! Lexical agreement metrics between a candidate and a reference answer.

use std::collections::{HashMap, HashSet};

const ARTICLES: [&str; 3] = ["a", "an", "the"];

/// Smoothing value substituted for zero n-gram matches.
const BLEU_EPSILON: f64 = 0.1;

/// Lowercase, replace punctuation with spaces, split on whitespace.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Tokens used for set-overlap F1: [`tokenize`] minus English articles.
pub fn normalized_token_set(text: &str) -> HashSet<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| !ARTICLES.contains(&t.as_str()))
        .collect()
}

/// Harmonic mean of token-set precision and recall.
pub fn token_f1(candidate: &str, reference: &str) -> f64 {
    let cand = normalized_token_set(candidate);
    let refs = normalized_token_set(reference);
    match (cand.is_empty(), refs.is_empty()) {
        (true, true) => return 1.0,
        (true, false) | (false, true) => return 0.0,
        _ => {}
    }

    let common = cand.intersection(&refs).count() as f64;
    if common == 0.0 {
        return 0.0;
    }
    let precision = common / cand.len() as f64;
    let recall = common / refs.len() as f64;
    2.0 * precision * recall / (precision + recall)
}

/// Sentence BLEU with uniform weights over 1..=`max_n` grams and a brevity penalty.
///
/// `max_n = 1` gives BLEU-1. Zero-match orders are smoothed with a small epsilon
/// so one missing order does not zero the score outright.
pub fn bleu(candidate: &str, reference: &str, max_n: usize) -> f64 {
    let cand = tokenize(candidate);
    let refs = tokenize(reference);
    if cand.is_empty() || refs.is_empty() {
        return 0.0;
    }
    let max_n = max_n.max(1);

    let mut log_sum = 0.0;
    for n in 1..=max_n {
        let cand_counts = ngram_counts(&cand, n);
        let total: usize = cand_counts.values().sum();
        if total == 0 {
            // Candidate shorter than n: treat as a zero match for this order.
            log_sum += BLEU_EPSILON.ln();
            continue;
        }
        let ref_counts = ngram_counts(&refs, n);
        let clipped: usize = cand_counts
            .iter()
            .map(|(gram, count)| (*count).min(*ref_counts.get(gram).unwrap_or(&0)))
            .sum();
        let precision = if clipped == 0 {
            BLEU_EPSILON / total as f64
        } else {
            clipped as f64 / total as f64
        };
        log_sum += precision.ln();
    }
    let geo_mean = (log_sum / max_n as f64).exp();

    let (c, r) = (cand.len() as f64, refs.len() as f64);
    let brevity = if c >= r { 1.0 } else { (1.0 - r / c).exp() };

    (brevity * geo_mean).clamp(0.0, 1.0)
}

fn ngram_counts(tokens: &[String], n: usize) -> HashMap<&[String], usize> {
    let mut counts = HashMap::new();
    if tokens.len() >= n {
        for gram in tokens.windows(n) {
            *counts.entry(gram).or_insert(0) += 1;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_tokenize_strips_punctuation_and_case() {
        assert_eq!(tokenize("Paris, France!"), vec!["paris", "france"]);
        assert_eq!(tokenize("  "), Vec::<String>::new());
        assert_eq!(tokenize("7 May 2023"), vec!["7", "may", "2023"]);
    }

    #[test]
    fn test_f1_exact_match() {
        assert!(approx(token_f1("Paris", "Paris"), 1.0));
        assert!(approx(token_f1("the Paris.", "paris"), 1.0));
    }

    #[test]
    fn test_f1_partial_overlap() {
        // candidate {paris, france}, reference {paris}: p = 0.5, r = 1.0
        let f1 = token_f1("paris, France", "Paris");
        assert!(approx(f1, 2.0 / 3.0));
        assert!(f1 > 0.5 && f1 < 1.0);
    }

    #[test]
    fn test_f1_edge_cases() {
        assert_eq!(token_f1("", ""), 1.0);
        assert_eq!(token_f1("", "Paris"), 0.0);
        assert_eq!(token_f1("Paris", ""), 0.0);
        assert_eq!(token_f1("London", "Paris"), 0.0);
    }

    #[test]
    fn test_f1_is_symmetric() {
        let a = "went hiking in May";
        let b = "hiking trip May 2023";
        assert!(approx(token_f1(a, b), token_f1(b, a)));
    }

    #[test]
    fn test_bleu1_exact_and_disjoint() {
        assert!(approx(bleu("Paris", "Paris", 1), 1.0));
        let disjoint = bleu("London", "Paris", 1);
        assert!(disjoint > 0.0 && disjoint < 0.2);
    }

    #[test]
    fn test_bleu1_extra_tokens_lower_precision() {
        // 1 of 2 unigrams match, candidate longer than reference -> no penalty
        assert!(approx(bleu("paris, France", "Paris", 1), 0.5));
    }

    #[test]
    fn test_bleu_brevity_penalty() {
        // 1/1 precision but candidate shorter than the 3-token reference
        let score = bleu("Paris", "Paris in France", 1);
        assert!(approx(score, (1.0_f64 - 3.0).exp()));
    }

    #[test]
    fn test_bleu_clips_repeated_tokens() {
        // "paris" appears once in the reference: 1/3 clipped precision
        assert!(approx(bleu("paris paris paris", "paris is nice", 1), 1.0 / 3.0));
    }

    #[test]
    fn test_bleu_higher_order() {
        let same = bleu("she went to the park", "she went to the park", 4);
        assert!(approx(same, 1.0));
        let shuffled = bleu("park the to went she", "she went to the park", 2);
        assert!(shuffled < 0.5);
    }

    #[test]
    fn test_bleu_empty_inputs() {
        assert_eq!(bleu("", "Paris", 1), 0.0);
        assert_eq!(bleu("Paris", "", 1), 0.0);
    }

    #[test]
    fn test_scores_stay_in_unit_interval() {
        let pairs = [
            ("a b c d e f", "a"),
            ("a", "a b c d e f"),
            ("x y z", "x y z"),
            ("!!!", "?"),
        ];
        for (c, r) in pairs {
            for n in 1..=4 {
                let b = bleu(c, r, n);
                assert!((0.0..=1.0).contains(&b), "bleu({c}, {r}, {n}) = {b}");
            }
            let f = token_f1(c, r);
            assert!((0.0..=1.0).contains(&f));
        }
    }
}
