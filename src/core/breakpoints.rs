//! Breakpoint manager: suspends a run until a reviewer resolves a checkpoint.
//!
//! Layout per breakpoint, under `{runs_dir}/{run_id}/breakpoints/{breakpoint_id}/`:
//! - `breakpoint.json`: the review payload and, once known, its resolution
//! - `resolution.json`: the reviewer's decision, created exactly once
//!
//! A resolution reaches a waiting run either through [`BreakpointManager::resolve`]
//! in the same process or through `resolution.json` written by another
//! process, which a file-system watcher picks up.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use serde_json::json;
use tokio::fs;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::effect_store::hash_input;
use super::error::EngineError;
use super::persist::{read_json, write_json_atomic, write_json_new};
use super::run_store::RunStore;
use crate::domain::{BreakpointRecord, BreakpointSpec, EventType, JournalEvent, Outcome, Resolution};

const BREAKPOINT_FILE: &str = "breakpoint.json";
const RESOLUTION_FILE: &str = "resolution.json";

/// Derive the id of the `ordinal`-th breakpoint of a run
pub fn generate_breakpoint_id(run_id: Uuid, ordinal: u32) -> String {
    let hash = hash_input(&format!("{}:breakpoint:{}", run_id, ordinal));
    format!("bp-{:03}-{}", ordinal, hash)
}

/// Unresolved breakpoint of a run in this process
struct Waiter {
    breakpoint_id: String,
    tx: mpsc::UnboundedSender<Resolution>,
}

/// Registration of a waiting run, removed when the wait ends or is cancelled
struct ActiveBreakpoint<'a> {
    manager: &'a BreakpointManager,
    run_id: Uuid,
    breakpoint_id: String,
}

impl Drop for ActiveBreakpoint<'_> {
    fn drop(&mut self) {
        self.manager.unregister(self.run_id, &self.breakpoint_id);
    }
}

/// Breakpoint manager shared by all runs of a driver
pub struct BreakpointManager {
    runs_dir: PathBuf,
    debounce: Duration,
    active: Mutex<HashMap<Uuid, Waiter>>,
}

impl BreakpointManager {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
            debounce: Duration::from_millis(200),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Debounce window of the resolution watcher
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Directory holding one breakpoint
    pub fn breakpoint_dir(&self, run_id: Uuid, breakpoint_id: &str) -> PathBuf {
        self.breakpoints_dir(run_id).join(breakpoint_id)
    }

    fn breakpoints_dir(&self, run_id: Uuid) -> PathBuf {
        self.runs_dir.join(run_id.to_string()).join("breakpoints")
    }

    /// Breakpoint the run is currently blocked on in this process
    pub fn active(&self, run_id: Uuid) -> Option<String> {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.get(&run_id).map(|w| w.breakpoint_id.clone())
    }

    /// Open the `ordinal`-th breakpoint of a run and wait for its resolution.
    ///
    /// A breakpoint resolved in an earlier execution of the run returns its
    /// recorded resolution without blocking, unless that resolution was an
    /// abort, in which case the breakpoint is opened again.
    pub async fn suspend(
        &self,
        store: &RunStore,
        ordinal: u32,
        spec: BreakpointSpec,
    ) -> Result<Resolution, EngineError> {
        let run_id = store.run_id();
        let breakpoint_id = generate_breakpoint_id(run_id, ordinal);
        let dir = self.breakpoint_dir(run_id, &breakpoint_id);

        if let Some(mut record) = self.get(run_id, &breakpoint_id).await? {
            match record.resolution.clone() {
                Some(resolution) if resolution.outcome != Outcome::Aborted => {
                    debug!(%run_id, %breakpoint_id, outcome = ?resolution.outcome, "Breakpoint already resolved");
                    if record.resolved_at.is_none() {
                        // Resolved while no process was waiting on it
                        record.resolved_at = Some(Utc::now());
                        write_json_atomic(&dir.join(BREAKPOINT_FILE), &record).await?;
                        store
                            .transition(
                                JournalEvent::new(
                                    run_id,
                                    EventType::BreakpointResolved,
                                    format!("Breakpoint '{}' resolved: {:?}", record.title, resolution.outcome),
                                )
                                .with_breakpoint(&breakpoint_id)
                                .with_data(json!(resolution)),
                            )
                            .await?;
                    }
                    return Ok(resolution);
                }
                Some(_) => {
                    info!(%run_id, %breakpoint_id, "Reopening aborted breakpoint");
                    remove_if_exists(&dir.join(RESOLUTION_FILE)).await?;
                }
                None => {}
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _active = self.register(run_id, &breakpoint_id, tx)?;

        let resolution = self.wait(store, &breakpoint_id, &dir, spec, &mut rx).await?;
        if resolution.outcome == Outcome::Aborted {
            return Err(EngineError::RunAborted {
                run_id,
                breakpoint_id: Some(breakpoint_id),
            });
        }
        Ok(resolution)
    }

    async fn wait(
        &self,
        store: &RunStore,
        breakpoint_id: &str,
        dir: &Path,
        spec: BreakpointSpec,
        rx: &mut mpsc::UnboundedReceiver<Resolution>,
    ) -> Result<Resolution, EngineError> {
        let run_id = store.run_id();
        let mut record = BreakpointRecord::open(run_id, breakpoint_id, spec);
        write_json_atomic(&dir.join(BREAKPOINT_FILE), &record).await?;

        store
            .append(
                JournalEvent::new(run_id, EventType::BreakpointOpened, format!("Breakpoint '{}' opened", record.title))
                    .with_breakpoint(breakpoint_id)
                    .with_data(record.payload()),
            )
            .await?;
        store
            .transition(
                JournalEvent::new(run_id, EventType::RunSuspended, format!("Waiting on '{}'", record.title))
                    .with_breakpoint(breakpoint_id),
            )
            .await?;

        info!(%run_id, %breakpoint_id, title = %record.title, "Run suspended at breakpoint");

        // Watch before the first read so a resolution written in between is seen
        let (fs_tx, mut fs_rx) = mpsc::unbounded_channel::<()>();
        let _watcher = self.watch(dir, fs_tx)?;

        let resolution_path = dir.join(RESOLUTION_FILE);
        let resolution = match read_json::<Resolution>(&resolution_path).await? {
            Some(resolution) => resolution,
            None => loop {
                tokio::select! {
                    Some(resolution) = rx.recv() => break resolution,
                    Some(()) = fs_rx.recv() => {
                        if let Some(resolution) = read_json::<Resolution>(&resolution_path).await? {
                            break resolution;
                        }
                    }
                    else => {
                        return Err(EngineError::Storage(anyhow::anyhow!(
                            "Resolution channels for breakpoint {} closed",
                            breakpoint_id
                        )));
                    }
                }
            },
        };

        record.resolution = Some(resolution.clone());
        record.resolved_at = Some(Utc::now());
        write_json_atomic(&dir.join(BREAKPOINT_FILE), &record).await?;

        store
            .transition(
                JournalEvent::new(
                    run_id,
                    EventType::BreakpointResolved,
                    format!("Breakpoint '{}' resolved: {:?}", record.title, resolution.outcome),
                )
                .with_breakpoint(breakpoint_id)
                .with_data(json!(resolution)),
            )
            .await?;

        info!(%run_id, %breakpoint_id, outcome = ?resolution.outcome, "Breakpoint resolved");
        Ok(resolution)
    }

    fn watch(
        &self,
        dir: &Path,
        tx: mpsc::UnboundedSender<()>,
    ) -> Result<Debouncer<notify::RecommendedWatcher>, EngineError> {
        let mut debouncer = new_debouncer(self.debounce, move |result: DebounceEventResult| match result {
            Ok(events) => {
                if !events.is_empty() {
                    let _ = tx.send(());
                }
            }
            Err(e) => warn!("Breakpoint watcher error: {:?}", e),
        })
        .context("Failed to create breakpoint watcher")?;

        debouncer
            .watcher()
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", dir.display()))?;

        Ok(debouncer)
    }

    fn register(
        &self,
        run_id: Uuid,
        breakpoint_id: &str,
        tx: mpsc::UnboundedSender<Resolution>,
    ) -> Result<ActiveBreakpoint<'_>, EngineError> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = active.get(&run_id) {
            return Err(EngineError::BreakpointConflict {
                run_id,
                active: existing.breakpoint_id.clone(),
            });
        }
        active.insert(
            run_id,
            Waiter {
                breakpoint_id: breakpoint_id.to_string(),
                tx,
            },
        );
        Ok(ActiveBreakpoint {
            manager: self,
            run_id,
            breakpoint_id: breakpoint_id.to_string(),
        })
    }

    fn unregister(&self, run_id: Uuid, breakpoint_id: &str) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.get(&run_id).is_some_and(|w| w.breakpoint_id == breakpoint_id) {
            active.remove(&run_id);
        }
    }

    /// Deliver a reviewer's decision.
    ///
    /// Works whether the run is waiting in this process, in another process,
    /// or not running at all (the next execution picks the resolution up).
    pub async fn resolve(&self, run_id: Uuid, breakpoint_id: &str, resolution: Resolution) -> Result<(), EngineError> {
        if resolution.outcome == Outcome::Aborted {
            return Err(EngineError::InvalidResolution {
                run_id,
                breakpoint_id: breakpoint_id.to_string(),
                outcome: resolution.outcome,
            });
        }

        let Some(record) = self.get(run_id, breakpoint_id).await? else {
            return Err(EngineError::BreakpointNotFound {
                run_id,
                breakpoint_id: breakpoint_id.to_string(),
            });
        };

        if record.is_resolved() {
            return Err(EngineError::BreakpointResolved {
                run_id,
                breakpoint_id: breakpoint_id.to_string(),
            });
        }

        let path = self.breakpoint_dir(run_id, breakpoint_id).join(RESOLUTION_FILE);
        if !write_json_new(&path, &resolution).await? {
            return Err(EngineError::BreakpointResolved {
                run_id,
                breakpoint_id: breakpoint_id.to_string(),
            });
        }

        self.notify(run_id, breakpoint_id, resolution);
        Ok(())
    }

    /// Resolve the run's open breakpoint as aborted, if it has one.
    ///
    /// Returns the aborted breakpoint id.
    pub async fn abort(&self, run_id: Uuid) -> Result<Option<String>, EngineError> {
        let breakpoint_id = match self.active(run_id) {
            Some(id) => Some(id),
            None => self
                .list(run_id)
                .await?
                .into_iter()
                .find(|record| !record.is_resolved())
                .map(|record| record.breakpoint_id),
        };

        let Some(breakpoint_id) = breakpoint_id else {
            return Ok(None);
        };

        let path = self.breakpoint_dir(run_id, &breakpoint_id).join(RESOLUTION_FILE);
        if write_json_new(&path, &Resolution::aborted()).await? {
            info!(%run_id, %breakpoint_id, "Aborting suspended run");
            self.notify(run_id, &breakpoint_id, Resolution::aborted());
            Ok(Some(breakpoint_id))
        } else {
            Ok(None)
        }
    }

    fn notify(&self, run_id: Uuid, breakpoint_id: &str, resolution: Resolution) {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(waiter) = active.get(&run_id).filter(|w| w.breakpoint_id == breakpoint_id) {
            let _ = waiter.tx.send(resolution);
        }
    }

    /// Load a breakpoint, merging a resolution not yet folded into its record
    pub async fn get(&self, run_id: Uuid, breakpoint_id: &str) -> Result<Option<BreakpointRecord>, EngineError> {
        let dir = self.breakpoint_dir(run_id, breakpoint_id);
        Ok(load(&dir).await?)
    }

    /// All breakpoints of a run, oldest first
    pub async fn list(&self, run_id: Uuid) -> Result<Vec<BreakpointRecord>, EngineError> {
        let dir = self.breakpoints_dir(run_id);
        let mut records = Vec::new();

        if !dir.exists() {
            return Ok(records);
        }

        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("Failed to read {}", dir.display()))?;

        while let Some(entry) = entries.next_entry().await.context("Failed to read breakpoint entry")? {
            if let Some(record) = load(&entry.path()).await? {
                records.push(record);
            }
        }

        records.sort_by(|a, b| a.breakpoint_id.cmp(&b.breakpoint_id));
        Ok(records)
    }
}

async fn load(dir: &Path) -> anyhow::Result<Option<BreakpointRecord>> {
    let Some(mut record) = read_json::<BreakpointRecord>(&dir.join(BREAKPOINT_FILE)).await? else {
        return Ok(None);
    };

    if record.resolution.is_none() {
        record.resolution = read_json::<Resolution>(&dir.join(RESOLUTION_FILE)).await?;
    }
    Ok(Some(record))
}

async fn remove_if_exists(path: &Path) -> anyhow::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breakpoint_id_format() {
        let run_id = Uuid::new_v4();
        let id = generate_breakpoint_id(run_id, 1);

        assert!(id.starts_with("bp-001-"));
        assert_eq!(id.len(), "bp-001-".len() + 16);
        assert_eq!(id, generate_breakpoint_id(run_id, 1));
        assert_ne!(id, generate_breakpoint_id(run_id, 2));
    }
}
