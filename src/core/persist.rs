//! JSON snapshot helpers shared by the stores.
//!
//! Snapshots are written to a temp file in the target directory and renamed
//! into place, so readers never observe a torn file.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;

/// Atomically write `value` as pretty JSON (UTF-8, trailing newline)
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("Failed to serialize {}", path.display()))?;
    bytes.push(b'\n');

    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let dir = path
            .parent()
            .with_context(|| format!("Snapshot path has no parent: {}", path.display()))?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        tmp.write_all(&bytes).context("Failed to write snapshot")?;
        tmp.as_file().sync_all().context("Failed to sync snapshot")?;
        tmp.persist(&path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to persist snapshot: {}", path.display()))?;
        Ok(())
    })
    .await
    .context("Snapshot writer task failed")?
}

/// Write `value` only if `path` does not exist yet.
///
/// Returns `false` when another writer got there first. The file appears
/// complete or not at all.
pub async fn write_json_new<T: Serialize>(path: &Path, value: &T) -> Result<bool> {
    let mut bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("Failed to serialize {}", path.display()))?;
    bytes.push(b'\n');

    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<bool> {
        let dir = path
            .parent()
            .with_context(|| format!("Snapshot path has no parent: {}", path.display()))?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        tmp.write_all(&bytes).context("Failed to write snapshot")?;
        tmp.as_file().sync_all().context("Failed to sync snapshot")?;

        match tmp.persist_noclobber(&path) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.error)
                .with_context(|| format!("Failed to persist snapshot: {}", path.display())),
        }
    })
    .await
    .context("Snapshot writer task failed")?
}

/// Read a JSON snapshot, returning `None` when the file does not exist
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };

    let value = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_then_read() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("value.json");

        write_json_atomic(&path, &json!({"a": [1, 2]})).await.unwrap();
        let value: Option<Value> = read_json(&path).await.unwrap();
        assert_eq!(value, Some(json!({"a": [1, 2]})));

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let temp = TempDir::new().unwrap();
        let value: Option<Value> = read_json(&temp.path().join("absent.json")).await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_write_new_does_not_clobber() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("resolution.json");

        assert!(write_json_new(&path, &json!({"outcome": "approve"})).await.unwrap());
        assert!(!write_json_new(&path, &json!({"outcome": "reject"})).await.unwrap());

        let value: Option<Value> = read_json(&path).await.unwrap();
        assert_eq!(value, Some(json!({"outcome": "approve"})));
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_overwrite_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("value.json");

        write_json_atomic(&path, &json!(1)).await.unwrap();
        write_json_atomic(&path, &json!(2)).await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(temp.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let value: Option<Value> = read_json(&path).await.unwrap();
        assert_eq!(value, Some(json!(2)));
    }
}
