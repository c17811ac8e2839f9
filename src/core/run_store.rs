//! Per-run persistence: the RunRecord snapshot and the append-only journal.
//!
//! Layout under `{runs_dir}/{run_id}/`:
//! - `run.json`: current RunRecord
//! - `journal.jsonl`: one JournalEvent per line, `seq` strictly increasing
//! - `abort.json`: present while an operator abort is pending

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, BufReader as AsyncBufReader};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::persist::{read_json, write_json_atomic};
use crate::domain::{JournalEvent, RunRecord};

/// File-based store for one run.
///
/// Clones share the snapshot lock; keep one store per run within a process.
#[derive(Debug, Clone)]
pub struct RunStore {
    run_id: Uuid,
    run_dir: PathBuf,
    record_path: PathBuf,
    journal_path: PathBuf,
    abort_path: PathBuf,
    record_lock: Arc<Mutex<()>>,
}

/// Marker written by `abort`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortRequest {
    pub requested_at: chrono::DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RunStore {
    /// Create or open the store of a run
    pub async fn open(runs_dir: &Path, run_id: Uuid) -> Result<Self> {
        let run_dir = runs_dir.join(run_id.to_string());

        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("Failed to create run directory: {}", run_dir.display()))?;

        Ok(Self {
            run_id,
            record_path: run_dir.join("run.json"),
            journal_path: run_dir.join("journal.jsonl"),
            abort_path: run_dir.join("abort.json"),
            run_dir,
            record_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    /// Load the RunRecord snapshot
    pub async fn load_record(&self) -> Result<Option<RunRecord>> {
        read_json(&self.record_path).await
    }

    /// Replace the RunRecord snapshot
    pub async fn save_record(&self, record: &RunRecord) -> Result<()> {
        write_json_atomic(&self.record_path, record).await
    }

    /// Journal a run-level entry and fold it into the `run.json` snapshot.
    ///
    /// Without a snapshot the record is rebuilt from the entry itself.
    pub async fn transition(&self, event: JournalEvent) -> Result<RunRecord> {
        let _guard = self.record_lock.lock().await;

        let event = self.append(event).await?;
        let record = match self.load_record().await? {
            Some(mut record) => {
                record.apply_event(&event);
                record
            }
            None => RunRecord::from_events(std::slice::from_ref(&event))
                .context("Failed to build run record")?,
        };

        self.save_record(&record).await?;
        Ok(record)
    }

    /// Append an entry to the journal, assigning the next sequence number.
    ///
    /// The journal is locked exclusively while the last `seq` is read and the
    /// entry is written, so concurrent writers (including other processes)
    /// never reuse a number.
    pub async fn append(&self, mut event: JournalEvent) -> Result<JournalEvent> {
        let path = self.journal_path.clone();

        tokio::task::spawn_blocking(move || -> Result<JournalEvent> {
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open journal: {}", path.display()))?;

            file.lock_exclusive()
                .context("Failed to acquire file lock on journal.jsonl")?;

            let mut last_seq = 0;
            for line in BufReader::new(&file).lines() {
                let line = line.context("Failed to read journal")?;
                if line.trim().is_empty() {
                    continue;
                }
                let previous: JournalEvent = serde_json::from_str(&line)
                    .with_context(|| format!("Failed to parse journal entry: {}", line))?;
                last_seq = previous.seq;
            }

            event.seq = last_seq + 1;
            let json = serde_json::to_string(&event).context("Failed to serialize journal entry")?;
            writeln!(file, "{}", json).context("Failed to write journal entry")?;
            file.flush().context("Failed to flush journal")?;

            // Lock is released when file is dropped
            Ok(event)
        })
        .await
        .context("Journal writer task failed")?
    }

    /// Replay all journal entries in order
    pub async fn replay(&self) -> Result<Vec<JournalEvent>> {
        if !self.journal_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.journal_path)
            .await
            .with_context(|| format!("Failed to open journal: {}", self.journal_path.display()))?;

        let mut lines = AsyncBufReader::new(file).lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: JournalEvent = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse journal entry: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Record an operator abort for the run to observe
    pub async fn request_abort(&self, reason: Option<String>) -> Result<()> {
        let request = AbortRequest {
            requested_at: Utc::now(),
            reason,
        };
        write_json_atomic(&self.abort_path, &request).await
    }

    /// Whether an abort is pending
    pub fn abort_requested(&self) -> bool {
        self.abort_path.exists()
    }

    /// Drop a pending abort (done when a run is explicitly resumed)
    pub async fn clear_abort(&self) -> Result<()> {
        match fs::remove_file(&self.abort_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", self.abort_path.display())),
        }
    }

    /// List all run ids under a runs directory
    pub async fn list_runs(runs_dir: &Path) -> Result<Vec<Uuid>> {
        if !runs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(runs_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        runs.push(uuid);
                    }
                }
            }
        }

        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventType, RunStatus};
    use serde_json::json;
    use tempfile::TempDir;

    async fn create_test_store() -> (RunStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = RunStore::open(temp_dir.path(), Uuid::new_v4()).await.unwrap();
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_append_assigns_sequence() {
        let (store, _temp) = create_test_store().await;
        let run_id = store.run_id();

        let first = store
            .append(JournalEvent::new(run_id, EventType::RunStarted, "Run started"))
            .await
            .unwrap();
        let second = store
            .append(JournalEvent::new(run_id, EventType::Log, "hello"))
            .await
            .unwrap();

        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);

        let events = store.replay().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::RunStarted);
        assert_eq!(events[1].seq, 2);
    }

    #[tokio::test]
    async fn test_sequence_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();

        let store = RunStore::open(temp_dir.path(), run_id).await.unwrap();
        for i in 0..3 {
            store
                .append(JournalEvent::new(run_id, EventType::Log, format!("line {}", i)))
                .await
                .unwrap();
        }

        let reopened = RunStore::open(temp_dir.path(), run_id).await.unwrap();
        let event = reopened
            .append(JournalEvent::new(run_id, EventType::Log, "after reopen"))
            .await
            .unwrap();
        assert_eq!(event.seq, 4);
    }

    #[tokio::test]
    async fn test_concurrent_appends_never_reuse_seq() {
        let (store, _temp) = create_test_store().await;
        let run_id = store.run_id();

        let mut handles = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append(JournalEvent::new(run_id, EventType::Log, format!("{}", i)))
                    .await
                    .unwrap()
                    .seq
            }));
        }

        let mut seqs = Vec::new();
        for handle in handles {
            seqs.push(handle.await.unwrap());
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=10).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_record_snapshot() {
        let (store, _temp) = create_test_store().await;
        assert!(store.load_record().await.unwrap().is_none());

        let mut record = RunRecord::new(store.run_id(), "review", json!({"doc": "a.md"}));
        record.status = RunStatus::Suspended;
        store.save_record(&record).await.unwrap();

        let loaded = store.load_record().await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Suspended);
        assert_eq!(loaded.inputs, json!({"doc": "a.md"}));
    }

    #[tokio::test]
    async fn test_transition_updates_snapshot() {
        let (store, _temp) = create_test_store().await;
        let run_id = store.run_id();

        let record = store
            .transition(
                JournalEvent::new(run_id, EventType::RunStarted, "Run started")
                    .with_data(json!({"processName": "review", "inputs": {}})),
            )
            .await
            .unwrap();
        assert_eq!(record.status, RunStatus::Running);
        assert_eq!(record.process_name, "review");

        store
            .transition(JournalEvent::new(run_id, EventType::RunSuspended, "Waiting").with_breakpoint("bp-000-x"))
            .await
            .unwrap();

        let loaded = store.load_record().await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Suspended);
        assert_eq!(loaded.current_breakpoint.as_deref(), Some("bp-000-x"));

        let replayed = RunRecord::from_events(&store.replay().await.unwrap()).unwrap();
        assert_eq!(replayed.status, loaded.status);
        assert_eq!(replayed.current_breakpoint, loaded.current_breakpoint);
    }

    #[tokio::test]
    async fn test_abort_marker() {
        let (store, _temp) = create_test_store().await;
        assert!(!store.abort_requested());

        store.request_abort(Some("operator".to_string())).await.unwrap();
        assert!(store.abort_requested());

        store.clear_abort().await.unwrap();
        assert!(!store.abort_requested());
        store.clear_abort().await.unwrap();
    }

    #[tokio::test]
    async fn test_list_runs() {
        let temp_dir = TempDir::new().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        RunStore::open(temp_dir.path(), a).await.unwrap();
        RunStore::open(temp_dir.path(), b).await.unwrap();
        std::fs::create_dir_all(temp_dir.path().join("not-a-run")).unwrap();

        let mut runs = RunStore::list_runs(temp_dir.path()).await.unwrap();
        runs.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(runs, expected);
    }
}
