use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::time::MissedTickBehavior;

use crate::artifacts;
use crate::credential::parse_batch;
use crate::dispatcher::Dispatcher;
use crate::error::StoreError;
use crate::models::DueSchedule;
use crate::pipeline::run_batch;
use crate::progress::{escape_html, LogProgress};
use crate::store::{select_due, Storage};
use crate::upload::{upload_tokens, UploadAttempt, UploadDestination};

/// Fresh per-tick checks on whether an owner may run premium work.
#[async_trait]
pub trait Eligibility: Send + Sync {
    async fn has_standing(&self, owner_id: i64) -> bool;
    async fn is_member(&self, owner_id: i64) -> bool;
}

/// Delivers HTML text to a schedule owner. Delivery failures are the
/// implementation's to log.
#[async_trait]
pub trait OwnerNotifier: Send + Sync {
    async fn notify(&self, owner_id: i64, text: String);
}

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick: Duration,
    pub startup_delay: Duration,
    pub max_file_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    NoTokens,
    NotConfigured,
    Uploaded,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    Completed {
        successes: usize,
        failures: usize,
        upload: UploadStatus,
    },
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub owner_id: i64,
    pub schedule_key: String,
    pub status: RunStatus,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Default, PartialEq)]
pub struct TickReport {
    /// Due entries left untouched because their owner was not eligible.
    pub skipped: Vec<(i64, String)>,
    pub runs: Vec<RunReport>,
}

/// Background runner for stored batches.
///
/// Every tick it snapshots the schedules, runs each due entry whose owner is
/// still eligible and writes back only the run timestamps. Attempts are
/// rescheduled from their own completion time whether they succeeded or not.
pub struct ScheduleRunner {
    storage: Arc<Storage>,
    dispatcher: Arc<Dispatcher>,
    eligibility: Arc<dyn Eligibility>,
    notifier: Arc<dyn OwnerNotifier>,
    destination: Arc<dyn UploadDestination>,
    clock: Clock,
    config: SchedulerConfig,
}

impl ScheduleRunner {
    pub fn new(
        storage: Arc<Storage>,
        dispatcher: Arc<Dispatcher>,
        eligibility: Arc<dyn Eligibility>,
        notifier: Arc<dyn OwnerNotifier>,
        destination: Arc<dyn UploadDestination>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            storage,
            dispatcher,
            eligibility,
            notifier,
            destination,
            clock: Arc::new(Utc::now),
            config,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Main loop; never returns.
    pub async fn run(self: Arc<Self>) {
        info!("Background scheduler started. Check interval: {:?}", self.config.tick);
        tokio::time::sleep(self.config.startup_delay).await;

        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.tick().await {
                Ok(report) if report.runs.is_empty() && report.skipped.is_empty() => {
                    debug!("Scheduler: no schedules were due this cycle")
                }
                Ok(report) => {
                    for run in &report.runs {
                        match &run.status {
                            RunStatus::Completed {
                                successes,
                                failures,
                                upload,
                            } => info!(
                                "Scheduler: '{}' of {} completed at {}: {} tokens, {} failures, upload {:?}",
                                run.schedule_key, run.owner_id, run.completed_at, successes, failures, upload
                            ),
                            RunStatus::Failed(reason) => warn!(
                                "Scheduler: '{}' of {} failed at {}: {}",
                                run.schedule_key, run.owner_id, run.completed_at, reason
                            ),
                        }
                    }
                    info!(
                        "Scheduler: ran {} schedule(s), skipped {}",
                        report.runs.len(),
                        report.skipped.len()
                    )
                }
                Err(err) => error!("Scheduler: could not load schedules: {}", err),
            }
        }
    }

    pub async fn tick(&self) -> Result<TickReport, StoreError> {
        let now = (self.clock)();
        let schedules = self.storage.schedules.load().await?;
        let due = select_due(&schedules, now);

        let mut report = TickReport::default();
        let mut verdicts: HashMap<i64, bool> = HashMap::new();
        let mut runnable = Vec::new();
        for entry in due {
            let eligible = match verdicts.get(&entry.owner_id) {
                Some(verdict) => *verdict,
                None => {
                    let verdict = self.owner_eligible(entry.owner_id).await;
                    verdicts.insert(entry.owner_id, verdict);
                    verdict
                }
            };
            if eligible {
                info!("Scheduler: schedule '{}' for user {} is due", entry.schedule_key, entry.owner_id);
                runnable.push(entry);
            } else {
                report.skipped.push((entry.owner_id, entry.schedule_key));
            }
        }

        if runnable.is_empty() {
            return Ok(report);
        }

        report.runs = futures::future::join_all(runnable.into_iter().map(|due| self.run_one(due))).await;

        let completed: Vec<(i64, String, DateTime<Utc>)> = report
            .runs
            .iter()
            .map(|run| (run.owner_id, run.schedule_key.clone(), run.completed_at))
            .collect();
        if let Err(err) = self.storage.record_runs(&completed).await {
            error!("Scheduler: failed to save updated schedule run times: {}", err);
        }

        Ok(report)
    }

    async fn owner_eligible(&self, owner_id: i64) -> bool {
        if !self.eligibility.has_standing(owner_id).await {
            info!("Scheduler: user {} has no standing. Skipping their schedules.", owner_id);
            return false;
        }
        if !self.eligibility.is_member(owner_id).await {
            info!("Scheduler: user {} has not joined the channel. Skipping schedules.", owner_id);
            self.notifier
                .notify(
                    owner_id,
                    "⚠️ Your scheduled processings are skipped because you are not joined to the channel. \
                     Please rejoin to resume."
                        .to_string(),
                )
                .await;
            return false;
        }
        true
    }

    async fn run_one(&self, due: DueSchedule) -> RunReport {
        let name = if due.entry.display_name.is_empty() {
            due.schedule_key.clone()
        } else {
            due.entry.display_name.clone()
        };
        info!("AutoProcess user {} schedule '{}': starting", due.owner_id, due.schedule_key);
        self.notifier
            .notify(
                due.owner_id,
                format!("⚙️ Auto-processing started for schedule <code>{}</code>...", escape_html(&name)),
            )
            .await;

        let status = match self.process(&due, &name).await {
            Ok((status, lines)) => {
                self.notifier.notify(due.owner_id, lines.join("\n")).await;
                status
            }
            Err(reason) => {
                error!("AutoProcess user {} schedule '{}' failed: {}", due.owner_id, due.schedule_key, reason);
                self.notifier
                    .notify(
                        due.owner_id,
                        format!(
                            "❌ <b>FAILED:</b> Auto-processing for schedule <code>{}</code> encountered an error:\n<code>{}</code>",
                            escape_html(&name),
                            escape_html(&reason)
                        ),
                    )
                    .await;
                RunStatus::Failed(reason)
            }
        };

        RunReport {
            owner_id: due.owner_id,
            schedule_key: due.schedule_key,
            status,
            completed_at: (self.clock)(),
        }
    }

    async fn process(&self, due: &DueSchedule, name: &str) -> Result<(RunStatus, Vec<String>), String> {
        let bytes = self
            .storage
            .read_batch(&due.entry.stored_file_path)
            .await
            .map_err(|e| format!("Stored file could not be read: {}", e))?;
        let records = parse_batch(&bytes, self.config.max_file_size).map_err(|e| e.to_string())?;

        if records.is_empty() {
            let status = RunStatus::Completed {
                successes: 0,
                failures: 0,
                upload: UploadStatus::NoTokens,
            };
            return Ok((status, vec!["✅ Finished: Stored file was empty.".to_string()]));
        }

        let mut sink = LogProgress::new(format!("schedule {} of {}", due.schedule_key, due.owner_id), records.len());
        let summary = run_batch(&self.dispatcher, records, &mut sink).await;
        info!(
            "AutoProcess user {} schedule '{}': {} tokens, {} failures",
            due.owner_id,
            due.schedule_key,
            summary.successes.len(),
            summary.failures.len()
        );

        let mut lines = vec![
            format!("🏁 Auto-processing of <code>{}</code> finished.", escape_html(name)),
            format!(
                "📊 API Results: {} tokens generated, {} failures.",
                summary.successes.len(),
                summary.failures.len()
            ),
        ];
        let top: Vec<String> = summary
            .top_failures()
            .into_iter()
            .take(2)
            .map(|(reason, count)| format!("<code>{}</code> ({})", escape_html(reason), count))
            .collect();
        if !top.is_empty() {
            lines.push(format!("   (Top errors: {})", top.join("; ")));
        }

        let tokens = artifacts::all_tokens(&summary).map_err(|e| format!("Failed to build token file: {}", e))?;
        let upload = match tokens {
            None => {
                lines.push("ℹ️ No successful tokens, skipping GitHub upload.".to_string());
                UploadStatus::NoTokens
            }
            Some(artifact) => {
                let attempt =
                    upload_tokens(&self.storage, self.destination.as_ref(), due.owner_id, &artifact.bytes).await;
                lines.push(attempt.describe());
                match attempt {
                    UploadAttempt::NotConfigured => UploadStatus::NotConfigured,
                    UploadAttempt::Uploaded(_) => UploadStatus::Uploaded,
                    UploadAttempt::Failed(_) => UploadStatus::Failed,
                }
            }
        };

        Ok((
            RunStatus::Completed {
                successes: summary.successes.len(),
                failures: summary.failures.len(),
                upload,
            },
            lines,
        ))
    }
}
