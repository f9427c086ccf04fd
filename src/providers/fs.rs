use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tokio::{fs, io::AsyncWriteExt};

use super::{attempt_key, log_ignored_result, MethodExecutionState, MethodStateStorage, StorageError};
use crate::descriptors::{MethodId, PersistedMethodId, ServiceId};
use crate::intents::TaskResult;

/// Filesystem-backed storage writing one JSON document per attempt.
///
/// Layout: `<root>/state/<key>.json` and `<root>/results/<key>.json`. Writes go to a
/// temporary file that is renamed into place, so readers never see partial JSON.
/// A store-wide write lock serializes compare-and-swap within one process;
/// separate processes sharing a root are not coordinated.
pub struct FsStorage {
    root: PathBuf,
    write_lock: Mutex<()>,
}

#[derive(Serialize, Deserialize)]
struct StateRecord {
    etag: String,
    state: MethodExecutionState,
}

impl FsStorage {
    /// Create a new store rooted at the given directory path.
    /// If `reset_on_create` is true, delete any existing data under the root first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Result<Self, StorageError> {
        let path = root.as_ref().to_path_buf();
        if reset_on_create && path.exists() {
            std::fs::remove_dir_all(&path).map_err(|e| StorageError::permanent("create", e.to_string()))?;
        }
        for dir in [path.join("state"), path.join("results")] {
            std::fs::create_dir_all(&dir).map_err(|e| StorageError::permanent("create", e.to_string()))?;
        }
        Ok(Self {
            root: path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn state_path(&self, key: &str) -> PathBuf {
        self.root.join("state").join(format!("{}.json", encode_component(key)))
    }

    fn result_path(&self, key: &str) -> PathBuf {
        self.root.join("results").join(format!("{}.json", encode_component(key)))
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path, operation: &str) -> Result<Option<T>, StorageError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::retryable(operation, e.to_string())),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::permanent(operation, format!("corrupt record {}: {e}", path.display())))
    }

    async fn write_json<T: Serialize>(path: &Path, value: &T, operation: &str) -> Result<(), StorageError> {
        let data =
            serde_json::to_vec_pretty(value).map_err(|e| StorageError::permanent(operation, format!("encode: {e}")))?;
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| StorageError::retryable(operation, e.to_string()))?;
        file.write_all(&data)
            .await
            .map_err(|e| StorageError::retryable(operation, e.to_string()))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::retryable(operation, e.to_string()))?;
        drop(file);
        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(StorageError::retryable(operation, e.to_string()));
        }
        Ok(())
    }
}

/// Make an attempt key safe as a single file name.
fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[async_trait::async_trait]
impl MethodStateStorage for FsStorage {
    async fn write_state(
        &self,
        service: &ServiceId,
        method: &PersistedMethodId,
        state: &MethodExecutionState,
    ) -> Result<String, StorageError> {
        let key = attempt_key(service, &method.name, &method.intent_id);
        let path = self.state_path(&key);
        let _guard = self.write_lock.lock().await;

        let current: Option<StateRecord> = Self::read_json(&path, "write_state").await?;
        let current_etag = current.as_ref().map(|r| r.etag.as_str());
        if current_etag != method.etag.as_deref() {
            return Err(StorageError::conflict(
                "write_state",
                format!("etag mismatch for {key}: expected {:?}, stored {current_etag:?}", method.etag),
            ));
        }

        let etag = uuid::Uuid::new_v4().simple().to_string();
        let mut stored = state.clone();
        stored.method.etag = None;
        let record = StateRecord {
            etag: etag.clone(),
            state: stored,
        };
        Self::write_json(&path, &record, "write_state").await?;
        tracing::debug!(target: "routine_fabric::providers::fs", key = %key, etag = %etag, "state written");
        Ok(etag)
    }

    async fn read_state(
        &self,
        service: &ServiceId,
        method: &PersistedMethodId,
    ) -> Result<Option<MethodExecutionState>, StorageError> {
        let key = attempt_key(service, &method.name, &method.intent_id);
        let record: Option<StateRecord> = Self::read_json(&self.state_path(&key), "read_state").await?;
        Ok(record.map(|r| {
            let mut state = r.state;
            state.method.etag = Some(r.etag);
            state
        }))
    }

    async fn write_result(
        &self,
        service: &ServiceId,
        method: &MethodId,
        intent_id: &str,
        result: &TaskResult,
    ) -> Result<(), StorageError> {
        let key = attempt_key(service, &method.name, intent_id);
        let path = self.result_path(&key);
        let _guard = self.write_lock.lock().await;
        if let Some(stored) = Self::read_json::<TaskResult>(&path, "write_result").await? {
            log_ignored_result(self.name(), &key, &stored, result);
            return Ok(());
        }
        Self::write_json(&path, result, "write_result").await
    }

    async fn try_read_result(
        &self,
        service: &ServiceId,
        method: &MethodId,
        intent_id: &str,
    ) -> Result<Option<TaskResult>, StorageError> {
        let key = attempt_key(service, &method.name, intent_id);
        Self::read_json(&self.result_path(&key), "try_read_result").await
    }

    fn name(&self) -> &str {
        "fs"
    }
}
