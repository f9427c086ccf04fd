use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::debug;

use super::{attempt_key, log_ignored_result, MethodExecutionState, MethodStateStorage, StorageError};
use crate::descriptors::{MethodId, PersistedMethodId, ServiceId};
use crate::intents::TaskResult;

/// Configuration options for SqliteStorage
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    pub max_connections: u32,
    /// Milliseconds SQLite waits on a locked database before reporting busy.
    pub busy_timeout_ms: u32,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            max_connections: 5,
            busy_timeout_ms: 60_000,
        }
    }
}

/// SQLite-backed storage. The etag check and the overwrite happen in one
/// `UPDATE ... WHERE etag = ?` statement.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Convert sqlx error to StorageError with appropriate retry classification
    fn sqlx_to_storage_error(operation: &str, e: sqlx::Error) -> StorageError {
        let error_msg = e.to_string();

        // Check for SQLITE_BUSY (database locked) - retryable
        if error_msg.contains("database is locked") || error_msg.contains("SQLITE_BUSY") {
            return StorageError::retryable(operation, format!("Database locked: {error_msg}"));
        }

        // A second first-write of the same attempt lost the race
        if error_msg.contains("UNIQUE constraint") || error_msg.contains("PRIMARY KEY") {
            return StorageError::conflict(operation, format!("Constraint violation: {error_msg}"));
        }

        // Check for connection errors - retryable
        if error_msg.contains("connection") || error_msg.contains("timeout") {
            return StorageError::retryable(operation, format!("Connection error: {error_msg}"));
        }

        // Default: treat as retryable (conservative approach)
        StorageError::retryable(operation, error_msg)
    }

    /// Create a new SQLite storage
    ///
    /// # Arguments
    /// * `database_url` - SQLite connection string (e.g., "sqlite:data.db?mode=rwc" or "sqlite::memory:")
    /// * `options` - Optional pool configuration
    ///
    /// # Errors
    ///
    /// Returns an error if database connection or schema initialization fails.
    pub async fn new(database_url: &str, options: Option<SqliteOptions>) -> Result<Self, sqlx::Error> {
        let options = options.unwrap_or_default();
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let busy_timeout = format!("PRAGMA busy_timeout = {}", options.busy_timeout_ms);
        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections)
            .after_connect(move |conn, _meta| {
                let busy_timeout = busy_timeout.clone();
                Box::pin(async move {
                    if is_memory {
                        sqlx::query("PRAGMA journal_mode = MEMORY").execute(&mut *conn).await?;
                        // For in-memory DB, durability is not required
                        sqlx::query("PRAGMA synchronous = OFF").execute(&mut *conn).await?;
                    } else {
                        // Enable WAL mode for better concurrent access
                        sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                    }
                    sqlx::query(&busy_timeout).execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;

        Self::create_schema(&pool).await?;
        debug!(target: "routine_fabric::providers::sqlite", url = %database_url, "sqlite storage ready");
        Ok(Self { pool })
    }

    /// Convenience: create a shared in-memory SQLite store for tests.
    /// Uses a shared cache so multiple pooled connections see the same DB;
    /// each call gets its own database name.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        let url = format!(
            "sqlite:file:routine-{}?mode=memory&cache=shared",
            uuid::Uuid::new_v4().simple()
        );
        Self::new(&url, None).await
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS method_state (
                attempt_key TEXT PRIMARY KEY,
                service TEXT NOT NULL,
                method TEXT NOT NULL,
                intent_id TEXT NOT NULL,
                etag TEXT NOT NULL,
                state_data TEXT NOT NULL,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS method_result (
                attempt_key TEXT PRIMARY KEY,
                service TEXT NOT NULL,
                method TEXT NOT NULL,
                intent_id TEXT NOT NULL,
                result_data TEXT NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    fn encode<T: serde::Serialize>(operation: &str, value: &T) -> Result<String, StorageError> {
        serde_json::to_string(value).map_err(|e| StorageError::permanent(operation, format!("Serialization error: {e}")))
    }

    fn decode<T: serde::de::DeserializeOwned>(operation: &str, data: &str) -> Result<T, StorageError> {
        serde_json::from_str(data).map_err(|e| StorageError::permanent(operation, format!("Corrupt record: {e}")))
    }
}

#[async_trait::async_trait]
impl MethodStateStorage for SqliteStorage {
    async fn write_state(
        &self,
        service: &ServiceId,
        method: &PersistedMethodId,
        state: &MethodExecutionState,
    ) -> Result<String, StorageError> {
        let key = attempt_key(service, &method.name, &method.intent_id);
        let mut stored = state.clone();
        stored.method.etag = None;
        let data = Self::encode("write_state", &stored)?;
        let etag = uuid::Uuid::new_v4().simple().to_string();

        match method.etag.as_deref() {
            None => {
                sqlx::query(
                    "INSERT INTO method_state (attempt_key, service, method, intent_id, etag, state_data) VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(&key)
                .bind(&service.name)
                .bind(&method.name)
                .bind(&method.intent_id)
                .bind(&etag)
                .bind(&data)
                .execute(&self.pool)
                .await
                .map_err(|e| Self::sqlx_to_storage_error("write_state", e))?;
            }
            Some(expected) => {
                let updated = sqlx::query(
                    "UPDATE method_state SET etag = ?, state_data = ?, updated_at = CURRENT_TIMESTAMP WHERE attempt_key = ? AND etag = ?",
                )
                .bind(&etag)
                .bind(&data)
                .bind(&key)
                .bind(expected)
                .execute(&self.pool)
                .await
                .map_err(|e| Self::sqlx_to_storage_error("write_state", e))?;
                if updated.rows_affected() == 0 {
                    return Err(StorageError::conflict(
                        "write_state",
                        format!("etag mismatch for {key}: expected {expected}"),
                    ));
                }
            }
        }
        debug!(target: "routine_fabric::providers::sqlite", key = %key, etag = %etag, "state written");
        Ok(etag)
    }

    async fn read_state(
        &self,
        service: &ServiceId,
        method: &PersistedMethodId,
    ) -> Result<Option<MethodExecutionState>, StorageError> {
        let key = attempt_key(service, &method.name, &method.intent_id);
        let row = sqlx::query("SELECT etag, state_data FROM method_state WHERE attempt_key = ?")
            .bind(&key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_storage_error("read_state", e))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let etag: String = row.try_get("etag").map_err(|e| Self::sqlx_to_storage_error("read_state", e))?;
        let data: String = row
            .try_get("state_data")
            .map_err(|e| Self::sqlx_to_storage_error("read_state", e))?;
        let mut state: MethodExecutionState = Self::decode("read_state", &data)?;
        state.method.etag = Some(etag);
        Ok(Some(state))
    }

    async fn write_result(
        &self,
        service: &ServiceId,
        method: &MethodId,
        intent_id: &str,
        result: &TaskResult,
    ) -> Result<(), StorageError> {
        let key = attempt_key(service, &method.name, intent_id);
        let data = Self::encode("write_result", result)?;
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO method_result (attempt_key, service, method, intent_id, result_data) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&key)
        .bind(&service.name)
        .bind(&method.name)
        .bind(intent_id)
        .bind(&data)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_storage_error("write_result", e))?;
        if inserted.rows_affected() == 0 {
            if let Some(stored) = self.try_read_result(service, method, intent_id).await? {
                log_ignored_result(self.name(), &key, &stored, result);
            }
        }
        Ok(())
    }

    async fn try_read_result(
        &self,
        service: &ServiceId,
        method: &MethodId,
        intent_id: &str,
    ) -> Result<Option<TaskResult>, StorageError> {
        let key = attempt_key(service, &method.name, intent_id);
        let row = sqlx::query("SELECT result_data FROM method_result WHERE attempt_key = ?")
            .bind(&key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_storage_error("try_read_result", e))?;
        match row {
            Some(row) => {
                let data: String = row
                    .try_get("result_data")
                    .map_err(|e| Self::sqlx_to_storage_error("try_read_result", e))?;
                Ok(Some(Self::decode("try_read_result", &data)?))
            }
            None => Ok(None),
        }
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_databases_are_isolated() {
        let a = SqliteStorage::new_in_memory().await.unwrap();
        let b = SqliteStorage::new_in_memory().await.unwrap();
        let svc = ServiceId::new("A");
        let method = MethodId::new("Foo").persisted("1");
        a.write_state(&svc, &method, &MethodExecutionState::new(svc.clone(), method.clone()))
            .await
            .unwrap();
        assert!(a.read_state(&svc, &method).await.unwrap().is_some());
        assert!(b.read_state(&svc, &method).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_database_reopens_with_state() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("state.db").display());
        let svc = ServiceId::new("A");
        let method = MethodId::new("Foo").persisted("1");
        let etag = {
            let store = SqliteStorage::new(&url, None).await.unwrap();
            store
                .write_state(&svc, &method, &MethodExecutionState::new(svc.clone(), method.clone()))
                .await
                .unwrap()
        };
        let store = SqliteStorage::new(&url, None).await.unwrap();
        let loaded = store.read_state(&svc, &method).await.unwrap().unwrap();
        assert_eq!(loaded.etag(), Some(etag.as_str()));
    }

    #[test]
    fn unique_violations_classify_as_conflicts() {
        let e = SqliteStorage::sqlx_to_storage_error("write_state", sqlx::Error::Protocol("UNIQUE constraint failed".into()));
        assert!(e.is_conflict());
        let busy = SqliteStorage::sqlx_to_storage_error("write_state", sqlx::Error::Protocol("database is locked".into()));
        assert!(busy.is_retryable());
    }
}
