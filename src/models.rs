use std::path::PathBuf;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RangeError;

/// A raw batch item as parsed from the uploaded file.
pub type RawRecord = Map<String, Value>;

/// A credential record that passed structural validation.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialRecord {
    pub uid: String,
    pub password: String,
    /// Every field of the original item, passed through to output files.
    pub fields: RawRecord,
}

/// The tagged result of exchanging one credential record for a token.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Success {
        token: String,
        region: Option<String>,
        record: RawRecord,
    },
    Failure {
        record: RawRecord,
        reason: String,
    },
}

impl FetchOutcome {
    pub fn failure(record: RawRecord, reason: impl Into<String>) -> Self {
        FetchOutcome::Failure {
            record,
            reason: reason.into(),
        }
    }
}

/// Persisted schedule definition, keyed by owner and schedule key in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub interval_seconds: i64,
    pub stored_file_path: PathBuf,
    pub next_run_time: DateTime<Utc>,
    #[serde(default)]
    pub last_run_time: Option<DateTime<Utc>>,
    pub added_on: DateTime<Utc>,
    #[serde(default)]
    pub original_filename: String,
    #[serde(default)]
    pub display_name: String,
}

impl ScheduleEntry {
    pub fn new(
        interval_seconds: i64,
        stored_file_path: PathBuf,
        original_filename: String,
        display_name: String,
        now: DateTime<Utc>,
    ) -> Result<Self, RangeError> {
        Ok(Self {
            interval_seconds,
            stored_file_path,
            next_run_time: run_after(now, interval_seconds)?,
            last_run_time: None,
            added_on: now,
            original_filename,
            display_name,
        })
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_run_time
    }

    /// Stamps an attempt that finished at `completed_at`, success or not.
    ///
    /// An interval that overflows the calendar parks the entry at the end of
    /// time and is reported as an error.
    pub fn mark_ran(&mut self, completed_at: DateTime<Utc>) -> Result<(), RangeError> {
        self.last_run_time = Some(completed_at);
        match run_after(completed_at, self.interval_seconds) {
            Ok(next) => {
                self.next_run_time = next;
                Ok(())
            }
            Err(err) => {
                self.next_run_time = DateTime::<Utc>::MAX_UTC;
                Err(err)
            }
        }
    }
}

fn run_after(at: DateTime<Utc>, interval_seconds: i64) -> Result<DateTime<Utc>, RangeError> {
    TimeDelta::try_seconds(interval_seconds)
        .and_then(|interval| at.checked_add_signed(interval))
        .ok_or(RangeError::Interval(interval_seconds))
}

/// A due schedule snapshot handed to the runner for one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct DueSchedule {
    pub owner_id: i64,
    pub schedule_key: String,
    pub entry: ScheduleEntry,
}

/// Subscription record that grants standing until `expiry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub expiry: DateTime<Utc>,
    #[serde(default)]
    pub added_by: Option<i64>,
    pub added_on: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl Subscription {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expiry > now
    }
}

/// Upload destination configuration as persisted per owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadDestinationConfig {
    #[serde(rename = "github_token")]
    pub credential_secret: String,
    #[serde(rename = "github_repo")]
    pub repository_identifier: String,
    #[serde(rename = "github_branch")]
    pub branch: String,
    #[serde(rename = "github_filename")]
    pub target_filename: String,
    #[serde(default)]
    pub last_upload: Option<DateTime<Utc>>,
    #[serde(default)]
    pub config_set_on: Option<DateTime<Utc>>,
}

/// Telegram identity remembered for users the bot has talked to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KnownUser {
    pub access_hash: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn schedule_reschedules_from_completion_time() {
        let added = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut entry = ScheduleEntry::new(
            600,
            PathBuf::from("data/1_a.json"),
            "a.json".into(),
            "a.json".into(),
            added,
        )
        .unwrap();
        assert_eq!(entry.next_run_time, added + Duration::seconds(600));
        assert!(!entry.is_due(added));
        assert!(entry.is_due(added + Duration::seconds(600)));

        // A late attempt is rebased on its own completion, not the missed slot.
        let completed = added + Duration::hours(5);
        entry.mark_ran(completed).unwrap();
        assert_eq!(entry.last_run_time, Some(completed));
        assert_eq!(entry.next_run_time, completed + Duration::seconds(600));
    }

    #[test]
    fn oversized_interval_is_rejected_not_panicking() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let huge = 599_999_999_999_940;
        let err = ScheduleEntry::new(huge, "x".into(), String::new(), String::new(), now).unwrap_err();
        assert_eq!(err, RangeError::Interval(huge));

        let mut entry = ScheduleEntry::new(600, "x".into(), String::new(), String::new(), now).unwrap();
        entry.interval_seconds = i64::MAX;
        assert!(entry.mark_ran(now).is_err());
        assert_eq!(entry.last_run_time, Some(now));
        assert!(!entry.is_due(now + Duration::days(365 * 1000)));
    }

    #[test]
    fn subscription_expiry_is_exclusive() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let sub = Subscription {
            expiry: now,
            added_by: None,
            added_on: now,
            last_update: now,
        };
        assert!(!sub.is_active(now));
        assert!(sub.is_active(now - Duration::seconds(1)));
    }

    #[test]
    fn upload_config_uses_persisted_field_names() {
        let json = r#"{
            "github_token": "ghp_0123456789",
            "github_repo": "me/tokens",
            "github_branch": "main",
            "github_filename": "tokens.json",
            "last_upload": null
        }"#;
        let config: UploadDestinationConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.repository_identifier, "me/tokens");
        assert_eq!(config.config_set_on, None);
    }
}
