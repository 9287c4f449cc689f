use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{RangeError, StoreError};
use crate::models::{DueSchedule, KnownUser, ScheduleEntry, Subscription, UploadDestinationConfig};

/// Whole-file JSON store with atomic replacement.
///
/// Reads never observe a partial write: saves go to a unique temporary file
/// next to the target and are renamed over it. Mutations through one handle
/// are serialised; across processes the last writer wins.
pub struct JsonStore<T> {
    path: PathBuf,
    write_lock: Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    /// Loads the store, falling back to (and persisting) the default when the
    /// file is missing or corrupt. A corrupt file is kept aside for inspection.
    pub async fn load(&self) -> Result<T, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!("{} not found, creating with default value", self.path.display());
                let value = T::default();
                self.save(&value).await?;
                return Ok(value);
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(value),
            Err(err) => {
                error!("Error decoding JSON from {}: {}", self.path.display(), err);
                self.back_up_corrupted().await;
                let value = T::default();
                self.save(&value).await?;
                Ok(value)
            }
        }
    }

    /// Atomic read-modify-write. Nothing is persisted if `f` fails to run to
    /// completion; on a failed write the caller must treat the change as
    /// uncommitted.
    pub async fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut value = self.load().await?;
        let result = f(&mut value);
        self.save(&value).await?;
        Ok(result)
    }

    pub async fn save(&self, value: &T) -> Result<(), StoreError> {
        let payload = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Encode {
            path: self.path.clone(),
            source,
        })?;
        write_bytes_atomic(&self.path, &payload).await?;
        debug!("Saved {}", self.path.display());
        Ok(())
    }

    async fn back_up_corrupted(&self) {
        let mut backup = self.path.clone().into_os_string();
        backup.push(format!(".corrupted_{}", Utc::now().format("%Y%m%d_%H%M%S")));
        match tokio::fs::rename(&self.path, &backup).await {
            Ok(()) => info!("Backed up corrupted file to {:?}", backup),
            Err(err) => error!("Could not back up corrupted file {}: {}", self.path.display(), err),
        }
    }
}

pub type Subscriptions = BTreeMap<i64, Subscription>;
pub type UploadConfigs = BTreeMap<i64, UploadDestinationConfig>;
pub type Schedules = BTreeMap<i64, BTreeMap<String, ScheduleEntry>>;
pub type KnownUsers = BTreeMap<i64, KnownUser>;

/// What a revocation removed for one user.
#[derive(Debug, Default, PartialEq)]
pub struct Revocation {
    pub had_subscription: bool,
    pub had_upload_config: bool,
    pub schedules_removed: usize,
    pub files_deleted: usize,
}

/// Storage handle shared by the bot front-end and the scheduler.
pub struct Storage {
    data_dir: PathBuf,
    pub subscriptions: JsonStore<Subscriptions>,
    pub upload_configs: JsonStore<UploadConfigs>,
    pub schedules: JsonStore<Schedules>,
    pub known_users: JsonStore<KnownUsers>,
}

impl Storage {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            subscriptions: JsonStore::new(data_dir.join("vip_users.json")),
            upload_configs: JsonStore::new(data_dir.join("github_configs.json")),
            schedules: JsonStore::new(data_dir.join("scheduled_files.json")),
            known_users: JsonStore::new(data_dir.join("known_users.json")),
            data_dir,
        }
    }

    fn batch_dir(&self) -> PathBuf {
        self.data_dir.join("scheduled_files_data")
    }

    // --- standing ---

    pub async fn subscription(&self, user_id: i64) -> Result<Option<Subscription>, StoreError> {
        Ok(self.subscriptions.load().await?.remove(&user_id))
    }

    /// Standing check; storage trouble counts as no standing.
    pub async fn has_standing(&self, user_id: i64, now: DateTime<Utc>) -> bool {
        match self.subscription(user_id).await {
            Ok(sub) => sub.map_or(false, |s| s.is_active(now)),
            Err(err) => {
                error!("Could not read subscriptions for {}: {}", user_id, err);
                false
            }
        }
    }

    /// Adds `days` to the later of `now` and the current expiry. Returns the
    /// new record and whether an active subscription was extended. An expiry
    /// past the calendar's range leaves the store unchanged.
    pub async fn grant_subscription(
        &self,
        user_id: i64,
        days: i64,
        granted_by: i64,
        now: DateTime<Utc>,
    ) -> Result<(Subscription, bool), StoreError> {
        let granted = self
            .subscriptions
            .update(|subs| {
                let current = subs.get(&user_id).cloned();
                let extending = current.as_ref().map_or(false, |s| s.is_active(now));
                let start = if extending {
                    current.as_ref().map_or(now, |s| s.expiry)
                } else {
                    now
                };
                let expiry = TimeDelta::try_days(days)
                    .and_then(|extra| start.checked_add_signed(extra))
                    .ok_or(RangeError::Days(days))?;
                let sub = Subscription {
                    expiry,
                    added_by: Some(granted_by),
                    added_on: current.map_or(now, |s| s.added_on),
                    last_update: now,
                };
                subs.insert(user_id, sub.clone());
                Ok::<_, RangeError>((sub, extending))
            })
            .await??;
        Ok(granted)
    }

    /// Removes standing and every premium artefact of the user.
    pub async fn revoke(&self, user_id: i64) -> Result<Revocation, StoreError> {
        let had_subscription = self.subscriptions.update(|s| s.remove(&user_id).is_some()).await?;
        let had_upload_config = self.upload_configs.update(|c| c.remove(&user_id).is_some()).await?;
        let removed = self
            .schedules
            .update(|s| s.remove(&user_id).unwrap_or_default())
            .await?;

        let mut files_deleted = 0;
        for entry in removed.values() {
            if self.delete_batch(&entry.stored_file_path).await {
                files_deleted += 1;
            }
        }

        Ok(Revocation {
            had_subscription,
            had_upload_config,
            schedules_removed: removed.len(),
            files_deleted,
        })
    }

    // --- upload destination ---

    pub async fn upload_config(&self, user_id: i64) -> Result<Option<UploadDestinationConfig>, StoreError> {
        Ok(self.upload_configs.load().await?.remove(&user_id))
    }

    pub async fn set_upload_config(&self, user_id: i64, config: UploadDestinationConfig) -> Result<(), StoreError> {
        self.upload_configs
            .update(|configs| {
                configs.insert(user_id, config);
            })
            .await
    }

    pub async fn stamp_upload(&self, user_id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.upload_configs
            .update(|configs| match configs.get_mut(&user_id) {
                Some(config) => config.last_upload = Some(at),
                None => warn!("No upload config for {} when stamping last upload", user_id),
            })
            .await
    }

    // --- schedules ---

    pub fn batch_path(&self, owner_id: i64, schedule_key: &str) -> PathBuf {
        self.batch_dir().join(format!("{}_{}", owner_id, schedule_key))
    }

    pub async fn list_schedules(&self, owner_id: i64) -> Result<BTreeMap<String, ScheduleEntry>, StoreError> {
        Ok(self.schedules.load().await?.remove(&owner_id).unwrap_or_default())
    }

    /// Stores the batch file, then registers the entry. The file is removed
    /// again if the schedule cannot be saved.
    pub async fn add_schedule(
        &self,
        owner_id: i64,
        schedule_key: &str,
        entry: ScheduleEntry,
        batch: &[u8],
    ) -> Result<(), StoreError> {
        write_bytes_atomic(&entry.stored_file_path, batch).await?;

        let path = entry.stored_file_path.clone();
        let saved = self
            .schedules
            .update(|schedules| {
                schedules
                    .entry(owner_id)
                    .or_default()
                    .insert(schedule_key.to_string(), entry);
            })
            .await;

        if saved.is_err() {
            self.delete_batch(&path).await;
        }
        saved
    }

    pub async fn remove_schedule(&self, owner_id: i64, schedule_key: &str) -> Result<Option<ScheduleEntry>, StoreError> {
        let removed = self
            .schedules
            .update(|schedules| {
                let owner = schedules.get_mut(&owner_id)?;
                let removed = owner.remove(schedule_key);
                if owner.is_empty() {
                    schedules.remove(&owner_id);
                }
                removed
            })
            .await?;

        if let Some(entry) = &removed {
            self.delete_batch(&entry.stored_file_path).await;
        }
        Ok(removed)
    }

    /// Writes back run timestamps for entries that still exist.
    ///
    /// Only `last_run_time` and `next_run_time` are touched, so edits made to
    /// other fields while the runs were in flight survive.
    pub async fn record_runs(&self, completed: &[(i64, String, DateTime<Utc>)]) -> Result<usize, StoreError> {
        self.schedules
            .update(|schedules| {
                let mut updated = 0;
                for (owner_id, key, completed_at) in completed {
                    match schedules.get_mut(owner_id).and_then(|s| s.get_mut(key)) {
                        Some(entry) => {
                            if let Err(err) = entry.mark_ran(*completed_at) {
                                error!("Schedule '{}' for user {} parked: {}", key, owner_id, err);
                            }
                            updated += 1;
                        }
                        None => info!("Schedule '{}' for user {} was removed before run time update", key, owner_id),
                    }
                }
                updated
            })
            .await
    }

    pub async fn read_batch(&self, path: &Path) -> Result<Vec<u8>, StoreError> {
        tokio::fs::read(path).await.map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    async fn delete_batch(&self, path: &Path) -> bool {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                info!("Deleted stored batch file {}", path.display());
                true
            }
            Err(err) if err.kind() == ErrorKind::NotFound => false,
            Err(err) => {
                error!("Failed to delete stored batch file {}: {}", path.display(), err);
                false
            }
        }
    }

    // --- known users ---

    pub async fn remember_user(&self, user_id: i64, access_hash: Option<i64>) -> Result<(), StoreError> {
        let known = KnownUser { access_hash };
        if self.known_users.load().await?.get(&user_id) == Some(&known) {
            return Ok(());
        }
        self.known_users
            .update(|users| {
                users.insert(user_id, known);
            })
            .await?;
        info!("Remembered user {}", user_id);
        Ok(())
    }

    pub async fn known_user(&self, user_id: i64) -> Result<Option<KnownUser>, StoreError> {
        Ok(self.known_users.load().await?.get(&user_id).copied())
    }
}

/// Due entries across all owners, in owner then key order.
pub fn select_due(schedules: &Schedules, now: DateTime<Utc>) -> Vec<DueSchedule> {
    schedules
        .iter()
        .flat_map(|(owner_id, entries)| {
            entries
                .iter()
                .filter(|(_, entry)| entry.is_due(now))
                .map(move |(key, entry)| DueSchedule {
                    owner_id: *owner_id,
                    schedule_key: key.clone(),
                    entry: entry.clone(),
                })
        })
        .collect()
}

async fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    if let Err(err) = tokio::fs::write(&temp_path, bytes).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(io_err(err));
    }
    if let Err(err) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(io_err(err));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, hour, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn missing_file_loads_default_and_is_created() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/known.json");
        let store: JsonStore<KnownUsers> = JsonStore::new(&path);
        assert!(store.load().await.unwrap().is_empty());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_backed_up() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vip_users.json");
        std::fs::write(&path, b"{not json").unwrap();

        let store: JsonStore<Subscriptions> = JsonStore::new(&path);
        assert!(store.load().await.unwrap().is_empty());

        let backups = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupted_"))
            .count();
        assert_eq!(backups, 1);
    }

    #[tokio::test]
    async fn update_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store: JsonStore<KnownUsers> = JsonStore::new(dir.path().join("known.json"));
        store
            .update(|users| {
                users.insert(7, KnownUser { access_hash: Some(1) });
            })
            .await
            .unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["known.json".to_string()]);
        assert_eq!(store.load().await.unwrap()[&7].access_hash, Some(1));
    }

    #[tokio::test]
    async fn writes_under_an_unusable_data_dir_fail() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, b"").unwrap();
        let storage = Storage::new(&blocker);

        let config = UploadDestinationConfig {
            credential_secret: "ghp_secret".into(),
            repository_identifier: "me/tokens".into(),
            branch: "main".into(),
            target_filename: "tokens.json".into(),
            last_upload: None,
            config_set_on: None,
        };
        let err = storage.set_upload_config(1, config).await.unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
        assert!(storage.remove_schedule(1, "main.json").await.is_err());
    }

    #[tokio::test]
    async fn grant_extends_active_subscription() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());

        let (first, extended) = storage.grant_subscription(1, 10, 99, at(0)).await.unwrap();
        assert!(!extended);
        assert_eq!(first.expiry, at(0) + Duration::days(10));

        let (second, extended) = storage.grant_subscription(1, 5, 99, at(1)).await.unwrap();
        assert!(extended);
        assert_eq!(second.expiry, at(0) + Duration::days(15));
        assert_eq!(second.added_on, at(0));
        assert!(storage.has_standing(1, at(2)).await);
        assert!(!storage.has_standing(2, at(2)).await);
    }

    #[tokio::test]
    async fn oversized_grant_is_an_error_and_keeps_the_record() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        storage.grant_subscription(1, 10, 99, at(0)).await.unwrap();

        let err = storage.grant_subscription(1, 999_999_999, 99, at(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Range(RangeError::Days(999_999_999))));
        let kept = storage.subscription(1).await.unwrap().unwrap();
        assert_eq!(kept.expiry, at(0) + Duration::days(10));
    }

    #[tokio::test]
    async fn revoke_removes_schedules_and_their_files() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        storage.grant_subscription(5, 30, 1, at(0)).await.unwrap();

        let path = storage.batch_path(5, "main.json");
        let entry = ScheduleEntry::new(600, path.clone(), "main.json".into(), "main.json".into(), at(0)).unwrap();
        storage.add_schedule(5, "main.json", entry, b"[]").await.unwrap();
        assert!(path.exists());

        let revocation = storage.revoke(5).await.unwrap();
        assert_eq!(
            revocation,
            Revocation {
                had_subscription: true,
                had_upload_config: false,
                schedules_removed: 1,
                files_deleted: 1,
            }
        );
        assert!(!path.exists());
        assert!(storage.list_schedules(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn record_runs_only_touches_timestamps_of_live_entries() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        let entry = ScheduleEntry::new(900, storage.batch_path(3, "a.json"), "orig.json".into(), "A".into(), at(0)).unwrap();
        storage.add_schedule(3, "a.json", entry, b"[]").await.unwrap();

        let done = vec![(3, "a.json".to_string(), at(4)), (3, "gone.json".to_string(), at(4))];
        assert_eq!(storage.record_runs(&done).await.unwrap(), 1);

        let stored = &storage.list_schedules(3).await.unwrap()["a.json"];
        assert_eq!(stored.last_run_time, Some(at(4)));
        assert_eq!(stored.next_run_time, at(4) + Duration::seconds(900));
        assert_eq!(stored.display_name, "A");
    }

    #[test]
    fn select_due_filters_by_next_run_time() {
        let mut schedules = Schedules::new();
        let due = ScheduleEntry::new(300, "x".into(), String::new(), String::new(), at(0)).unwrap();
        let later = ScheduleEntry::new(86_400, "y".into(), String::new(), String::new(), at(0)).unwrap();
        schedules.entry(1).or_default().insert("due.json".into(), due);
        schedules.entry(2).or_default().insert("later.json".into(), later);

        let selected = select_due(&schedules, at(1));
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].owner_id, 1);
        assert_eq!(selected[0].schedule_key, "due.json");
    }
}
