use futures::StreamExt;
use tokio::time::Instant;

use crate::aggregator::BatchSummary;
use crate::dispatcher::Dispatcher;
use crate::models::RawRecord;
use crate::progress::ProgressSink;

/// Runs one batch to completion, folding outcomes as they arrive.
///
/// Shared by interactive uploads and scheduled runs; only the sink differs.
pub async fn run_batch(
    dispatcher: &Dispatcher,
    records: Vec<RawRecord>,
    sink: &mut dyn ProgressSink,
) -> BatchSummary {
    let started = Instant::now();
    let mut summary = BatchSummary::new(records.len());
    let mut outcomes = dispatcher.run(records);

    while let Some(outcome) = outcomes.next().await {
        summary.fold(outcome);
        sink.on_progress(&summary.snapshot(started.elapsed())).await;
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::ProgressSnapshot;
    use crate::fetcher::TokenFetcher;
    use crate::models::{CredentialRecord, FetchOutcome};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    struct StubFetcher;

    #[async_trait]
    impl TokenFetcher for StubFetcher {
        async fn fetch(&self, record: CredentialRecord) -> FetchOutcome {
            if record.uid == "a" {
                FetchOutcome::Success {
                    token: "T1".into(),
                    region: Some("EU".into()),
                    record: record.fields,
                }
            } else {
                FetchOutcome::failure(record.fields, "API Error (401)")
            }
        }
    }

    #[derive(Default)]
    struct Recorder(Vec<ProgressSnapshot>);

    #[async_trait]
    impl ProgressSink for Recorder {
        async fn on_progress(&mut self, snapshot: &ProgressSnapshot) {
            self.0.push(*snapshot);
        }
    }

    #[tokio::test]
    async fn mixed_batch_summary() {
        let dispatcher = Dispatcher::new(Arc::new(StubFetcher), 10).unwrap();
        let records = vec![
            json!({"uid": "a", "password": "p"}),
            json!({"uid": "b"}),
        ]
        .into_iter()
        .map(|v| v.as_object().cloned().unwrap())
        .collect();

        let mut recorder = Recorder::default();
        let summary = run_batch(&dispatcher, records, &mut recorder).await;

        assert_eq!(summary.total, 2);
        assert_eq!(summary.successes.len(), 1);
        assert_eq!(summary.successes[0].token, "T1");
        assert_eq!(summary.successes[0].region, "EU");
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].reason, "Missing 'password'");

        assert_eq!(recorder.0.len(), 2);
        assert_eq!(recorder.0.last().unwrap().processed, 2);
    }
}
