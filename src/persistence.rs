//! Persisted instance-id counter.
//!
//! Grounded on `state.rs`'s open-or-create idiom: a small file under the
//! node's home directory, best-effort (absence is not fatal — the
//! wall-clock-derived fallback must still exceed any previously used value).

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

const COUNTER_FILE_NAME: &str = ".ring-fabric-instance";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("persistence: failed to write instance counter at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("persistence: failed to rename instance counter into place at {path}: {source}")]
    Rename {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct CounterFile {
    last_instance_id: u64,
}

fn wall_clock_instance() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Advance the persisted counter past both its stored value and the current
/// wall-clock-derived value, write it back atomically (temp file + rename),
/// and return the new `InstanceId`. A missing or unreadable counter file is
/// treated as "start from zero" rather than a fatal error.
pub async fn next_instance_id(home_directory: &Path) -> Result<u64, PersistenceError> {
    let path = home_directory.join(COUNTER_FILE_NAME);
    let stored = read_counter(&path).await.unwrap_or(0);
    let next = stored.max(wall_clock_instance()).wrapping_add(1);
    write_counter(&path, next).await?;
    Ok(next)
}

async fn read_counter(path: &Path) -> Option<u64> {
    let bytes = fs::read(path).await.ok()?;
    let parsed: CounterFile = bincode::deserialize(&bytes).ok()?;
    Some(parsed.last_instance_id)
}

async fn write_counter(path: &Path, value: u64) -> Result<(), PersistenceError> {
    let encoded = bincode::serialize(&CounterFile {
        last_instance_id: value,
    })
    .expect("CounterFile always serializes");
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, &encoded)
        .await
        .map_err(|source| PersistenceError::Write {
            path: tmp_path.clone(),
            source,
        })?;
    fs::rename(&tmp_path, path)
        .await
        .map_err(|source| PersistenceError::Rename {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counter_is_monotone_across_restarts() {
        let dir = std::env::temp_dir().join(format!("ring-fabric-test-{}", rand::random::<u64>()));
        fs::create_dir_all(&dir).await.unwrap();

        let first = next_instance_id(&dir).await.unwrap();
        let second = next_instance_id(&dir).await.unwrap();
        assert!(second > first);

        fs::remove_dir_all(&dir).await.ok();
    }
}
