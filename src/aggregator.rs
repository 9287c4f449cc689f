use std::collections::BTreeMap;
use std::time::Duration;

use crate::models::{FetchOutcome, RawRecord};

pub const UNKNOWN_REGION: &str = "Unknown";

#[derive(Debug, Clone, PartialEq)]
pub struct TokenEntry {
    pub token: String,
    pub region: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailureEntry {
    pub record: RawRecord,
    pub reason: String,
}

/// Outcome accumulation for one batch run.
///
/// Only [`BatchSummary::fold`] mutates it, and only by appending. Regions and
/// histogram keys are kept in sorted maps so reports and file names come out
/// in a stable order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchSummary {
    pub total: usize,
    pub successes: Vec<TokenEntry>,
    pub failures: Vec<FailureEntry>,
    pub by_region_tokens: BTreeMap<String, Vec<String>>,
    pub by_region_records: BTreeMap<String, Vec<RawRecord>>,
    pub failure_histogram: BTreeMap<String, usize>,
}

/// Point-in-time view of a run, handed to progress sinks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub processed: usize,
    pub total: usize,
    pub successes: usize,
    pub failures: usize,
    pub elapsed: Duration,
}

impl BatchSummary {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    pub fn fold(&mut self, outcome: FetchOutcome) {
        match outcome {
            FetchOutcome::Success {
                token,
                region,
                record,
            } => {
                let region = region.unwrap_or_else(|| UNKNOWN_REGION.to_string());
                self.by_region_tokens
                    .entry(region.clone())
                    .or_default()
                    .push(token.clone());
                self.by_region_records
                    .entry(region.clone())
                    .or_default()
                    .push(record);
                self.successes.push(TokenEntry { token, region });
            }
            FetchOutcome::Failure { record, reason } => {
                *self
                    .failure_histogram
                    .entry(histogram_key(&reason))
                    .or_default() += 1;
                self.failures.push(FailureEntry { record, reason });
            }
        }
    }

    pub fn processed(&self) -> usize {
        self.successes.len() + self.failures.len()
    }

    pub fn snapshot(&self, elapsed: Duration) -> ProgressSnapshot {
        ProgressSnapshot {
            processed: self.processed(),
            total: self.total,
            successes: self.successes.len(),
            failures: self.failures.len(),
            elapsed,
        }
    }

    /// Histogram entries by descending count, ties broken by reason.
    pub fn top_failures(&self) -> Vec<(&str, usize)> {
        let mut entries: Vec<(&str, usize)> = self
            .failure_histogram
            .iter()
            .map(|(reason, count)| (reason.as_str(), *count))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        entries
    }
}

fn histogram_key(reason: &str) -> String {
    reason.split(':').next().unwrap_or(reason).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(uid: &str) -> RawRecord {
        json!({"uid": uid, "password": "p"}).as_object().cloned().unwrap()
    }

    fn outcomes() -> Vec<FetchOutcome> {
        vec![
            FetchOutcome::Success {
                token: "T1".into(),
                region: Some("EU".into()),
                record: raw("a"),
            },
            FetchOutcome::failure(raw("b"), "API Error (500): db down"),
            FetchOutcome::Success {
                token: "T2".into(),
                region: None,
                record: raw("c"),
            },
            FetchOutcome::failure(raw("d"), "API Error (502)"),
            FetchOutcome::failure(raw("e"), "Request Timeout"),
        ]
    }

    #[test]
    fn fold_buckets_by_region_and_reason_prefix() {
        let mut summary = BatchSummary::new(5);
        outcomes().into_iter().for_each(|o| summary.fold(o));

        assert_eq!(summary.processed(), 5);
        assert_eq!(summary.by_region_tokens["EU"], vec!["T1".to_string()]);
        assert_eq!(summary.by_region_tokens[UNKNOWN_REGION], vec!["T2".to_string()]);
        assert_eq!(summary.by_region_records["EU"][0]["uid"], json!("a"));
        assert_eq!(summary.failure_histogram["API Error (500)"], 1);
        assert_eq!(summary.failure_histogram["API Error (502)"], 1);
        assert_eq!(summary.failure_histogram["Request Timeout"], 1);
        assert_eq!(summary.failures[0].reason, "API Error (500): db down");
    }

    #[test]
    fn folding_is_free_of_shared_state() {
        let mut first = BatchSummary::new(5);
        let mut second = BatchSummary::new(5);
        outcomes().into_iter().for_each(|o| first.fold(o));
        outcomes().into_iter().for_each(|o| second.fold(o));
        assert_eq!(first, second);
    }

    #[test]
    fn top_failures_sorted_by_count() {
        let mut summary = BatchSummary::new(4);
        for reason in ["Request Timeout", "Network Error: refused", "Request Timeout", "Missing 'uid'"] {
            summary.fold(FetchOutcome::failure(raw("x"), reason));
        }
        assert_eq!(
            summary.top_failures(),
            vec![("Request Timeout", 2), ("Missing 'uid'", 1), ("Network Error", 1)]
        );
    }
}
