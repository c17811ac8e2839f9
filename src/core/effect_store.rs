//! Durable effect store.
//!
//! Layout per effect, under `{runs_dir}/{run_id}/tasks/{effect_id}/`:
//! - `input.json`: exact input snapshot
//! - `result.json`: exact output snapshot (completed effects only)
//! - `effect.json`: status, timestamps and failure details
//!
//! `effect.json` is written last and is the commit point of every update.
//! Mutations for one `(run_id, effect_id)` key are serialized by an in-process
//! per-key lock; holders of [`EffectLock`] are the only writers of that key.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use super::error::EngineError;
use super::persist::{read_json, write_json_atomic};
use crate::domain::EffectRecord;

const INPUT_FILE: &str = "input.json";
const RESULT_FILE: &str = "result.json";
const META_FILE: &str = "effect.json";

type LockMap = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// File-based effect store shared by all runs
pub struct EffectStore {
    runs_dir: PathBuf,
    locks: LockMap,
}

/// Exclusive right to mutate one effect.
///
/// Dropping the last holder or waiter of a key removes it from the lock map.
pub struct EffectLock {
    run_id: Uuid,
    effect_id: String,
    key: String,
    locks: LockMap,
    guard: Option<OwnedMutexGuard<()>>,
}

impl EffectLock {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn effect_id(&self) -> &str {
        &self.effect_id
    }
}

impl Drop for EffectLock {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(&self.key).is_some_and(|m| Arc::strong_count(m) == 1) {
            locks.remove(&self.key);
        }
    }
}

impl EffectStore {
    /// Create a store rooted at the runs directory
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    /// Directory holding the snapshots of one effect
    pub fn effect_dir(&self, run_id: Uuid, effect_id: &str) -> PathBuf {
        self.tasks_dir(run_id).join(effect_id)
    }

    fn tasks_dir(&self, run_id: Uuid) -> PathBuf {
        self.runs_dir.join(run_id.to_string()).join("tasks")
    }

    /// Acquire the per-key lock for an effect
    pub async fn lock(&self, run_id: Uuid, effect_id: &str) -> EffectLock {
        let key = format!("{}/{}", run_id, effect_id);
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(key.clone()).or_default().clone()
        };

        EffectLock {
            run_id,
            effect_id: effect_id.to_string(),
            key,
            locks: self.locks.clone(),
            guard: Some(mutex.lock_owned().await),
        }
    }

    /// Load an effect with its snapshots
    pub async fn get(&self, run_id: Uuid, effect_id: &str) -> Result<Option<EffectRecord>, EngineError> {
        let dir = self.effect_dir(run_id, effect_id);
        self.load(&dir).await.map_err(EngineError::from)
    }

    async fn load(&self, dir: &Path) -> anyhow::Result<Option<EffectRecord>> {
        let Some(mut record) = read_json::<EffectRecord>(&dir.join(META_FILE)).await? else {
            return Ok(None);
        };

        record.input = read_json::<Value>(&dir.join(INPUT_FILE))
            .await?
            .unwrap_or(Value::Null);

        if record.is_completed() {
            let output = read_json::<Value>(&dir.join(RESULT_FILE))
                .await?
                .with_context(|| format!("Completed effect is missing {}: {}", RESULT_FILE, dir.display()))?;
            record.output = Some(output);
        }

        Ok(Some(record))
    }

    /// Create or update an effect, taking the per-key lock
    pub async fn put(&self, run_id: Uuid, effect_id: &str, record: &EffectRecord) -> Result<(), EngineError> {
        let lock = self.lock(run_id, effect_id).await;
        self.put_locked(&lock, record).await
    }

    /// Create or update an effect while holding its lock.
    ///
    /// Rejects any write over a completed record.
    pub async fn put_locked(&self, lock: &EffectLock, record: &EffectRecord) -> Result<(), EngineError> {
        if record.run_id != lock.run_id || record.effect_id != lock.effect_id {
            return Err(EngineError::Storage(anyhow::anyhow!(
                "Record {}/{} written under lock for {}/{}",
                record.run_id,
                record.effect_id,
                lock.run_id,
                lock.effect_id
            )));
        }

        let dir = self.effect_dir(lock.run_id, &lock.effect_id);

        if let Some(existing) = read_json::<EffectRecord>(&dir.join(META_FILE)).await? {
            if existing.is_completed() {
                return Err(EngineError::EffectAlreadyFinalized {
                    run_id: lock.run_id,
                    effect_id: lock.effect_id.clone(),
                });
            }
        }

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create effect directory: {}", dir.display()))?;

        write_json_atomic(&dir.join(INPUT_FILE), &record.input).await?;
        if let Some(ref output) = record.output {
            write_json_atomic(&dir.join(RESULT_FILE), output).await?;
        }
        write_json_atomic(&dir.join(META_FILE), record).await?;

        Ok(())
    }

    /// All effects of a run in call order
    pub async fn list(&self, run_id: Uuid) -> Result<Vec<EffectRecord>, EngineError> {
        let tasks_dir = self.tasks_dir(run_id);
        let mut records = Vec::new();

        if !tasks_dir.exists() {
            return Ok(records);
        }

        let mut entries = fs::read_dir(&tasks_dir)
            .await
            .with_context(|| format!("Failed to read {}", tasks_dir.display()))?;

        while let Some(entry) = entries.next_entry().await.context("Failed to read task entry")? {
            if let Some(record) = self.load(&entry.path()).await? {
                records.push(record);
            }
        }

        records.sort_by(|a, b| {
            a.sequence
                .cmp(&b.sequence)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.ordinal.cmp(&b.ordinal))
        });
        Ok(records)
    }
}

/// Derive the effect id for the `ordinal`-th call of `task_name` in a run.
///
/// Format: `{task_name}-{ordinal:03}-{hash16}` where the hash covers all three
/// parts, so ids are stable across replays and distinct across runs.
pub fn generate_effect_id(run_id: Uuid, task_name: &str, ordinal: u32) -> String {
    let hash = hash_input(&format!("{}:{}:{}", run_id, task_name, ordinal));
    format!("{}-{:03}-{}", slug(task_name), ordinal, hash)
}

/// Hash content (first 16 hex chars of SHA256)
pub fn hash_input(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

/// Reduce a task name to characters safe in a directory name
fn slug(name: &str) -> String {
    let slug: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();

    if slug.is_empty() {
        "task".to_string()
    } else {
        slug
    }
}
