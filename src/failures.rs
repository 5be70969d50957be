//! Failure Memory: a persistent record of the last failure per CID.
//!
//! The admission filter consults it to avoid re-attempting DAGs that fail
//! deterministically (too big, unreachable) while still retrying transient
//! codes. Everything here is advisory: store errors never fail a backup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cid::Cid;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tokio::task::JoinHandle;

use crate::error::{
    BackupErrorKind, FailureStoreError, StoreConnectSnafu, StoreQuerySnafu, StoreSerializeSnafu,
};

/// Persisted record of the last failure for one CID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub error: FailureDetail,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureDetail {
    pub message: String,
    pub code: String,
}

impl FailureRecord {
    pub fn new(kind: BackupErrorKind, message: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            error: FailureDetail {
                message: message.to_string(),
                code: kind.as_code().to_string(),
            },
            timestamp,
        }
    }

    /// The recorded failure kind, if the stored code is recognized.
    pub fn kind(&self) -> Option<BackupErrorKind> {
        BackupErrorKind::from_code(&self.error.code)
    }
}

/// Last-failure store keyed by CID.
#[async_trait]
pub trait FailureStore: Send + Sync {
    /// Record (or overwrite) the last failure for `cid`.
    async fn record(
        &self,
        cid: &Cid,
        kind: BackupErrorKind,
        message: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), FailureStoreError>;

    /// Forget any failure recorded for `cid`.
    async fn clear(&self, cid: &Cid) -> Result<(), FailureStoreError>;

    /// The kind of the last recorded failure for `cid`, if any.
    ///
    /// Records with unrecognized codes read back as `None` so they never
    /// block an attempt.
    async fn classify(&self, cid: &Cid) -> Result<Option<BackupErrorKind>, FailureStoreError>;

    /// Release the connection.
    async fn close(&self);
}

/// No-op store used when no failure memory is configured.
pub struct NoopFailureStore;

#[async_trait]
impl FailureStore for NoopFailureStore {
    async fn record(
        &self,
        _cid: &Cid,
        _kind: BackupErrorKind,
        _message: &str,
        _timestamp: DateTime<Utc>,
    ) -> Result<(), FailureStoreError> {
        Ok(())
    }

    async fn clear(&self, _cid: &Cid) -> Result<(), FailureStoreError> {
        Ok(())
    }

    async fn classify(&self, _cid: &Cid) -> Result<Option<BackupErrorKind>, FailureStoreError> {
        Ok(None)
    }

    async fn close(&self) {}
}

/// In-memory store for tests and single-run usage.
#[derive(Default)]
pub struct MemoryFailureStore {
    records: std::sync::Mutex<std::collections::HashMap<String, FailureRecord>>,
}

#[async_trait]
impl FailureStore for MemoryFailureStore {
    async fn record(
        &self,
        cid: &Cid,
        kind: BackupErrorKind,
        message: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), FailureStoreError> {
        self.records.lock().unwrap().insert(
            cid.to_string(),
            FailureRecord::new(kind, message, timestamp),
        );
        Ok(())
    }

    async fn clear(&self, cid: &Cid) -> Result<(), FailureStoreError> {
        self.records.lock().unwrap().remove(&cid.to_string());
        Ok(())
    }

    async fn classify(&self, cid: &Cid) -> Result<Option<BackupErrorKind>, FailureStoreError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(&cid.to_string())
            .and_then(|r| r.kind()))
    }

    async fn close(&self) {}
}

const CREATE_TABLE_SQL: &str = "\
    CREATE TABLE IF NOT EXISTS backup_failures ( \
        cid TEXT PRIMARY KEY, \
        record TEXT NOT NULL, \
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now() \
    )";

const UPSERT_SQL: &str = "\
    INSERT INTO backup_failures (cid, record, updated_at) \
    VALUES ($1, $2, now()) \
    ON CONFLICT (cid) DO UPDATE SET record = $2, updated_at = now()";

const DELETE_SQL: &str = "DELETE FROM backup_failures WHERE cid = $1";

const SELECT_SQL: &str = "SELECT record FROM backup_failures WHERE cid = $1";

/// Postgres-backed failure store.
///
/// The table is created on open if missing, so the store can share a
/// database with the catalog or live in its own.
pub struct PgFailureStore {
    client: tokio_postgres::Client,
    driver: JoinHandle<()>,
}

impl PgFailureStore {
    /// Connect and ensure the failures table exists.
    pub async fn connect(database_url: &str) -> Result<Self, FailureStoreError> {
        let (client, connection) = tokio_postgres::connect(database_url, tokio_postgres::NoTls)
            .await
            .context(StoreConnectSnafu)?;

        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "failure memory connection error");
            }
        });

        client
            .execute(CREATE_TABLE_SQL, &[])
            .await
            .context(StoreQuerySnafu)?;

        Ok(Self { client, driver })
    }
}

#[async_trait]
impl FailureStore for PgFailureStore {
    async fn record(
        &self,
        cid: &Cid,
        kind: BackupErrorKind,
        message: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), FailureStoreError> {
        let record = FailureRecord::new(kind, message, timestamp);
        let encoded = serde_json::to_string(&record).context(StoreSerializeSnafu)?;
        self.client
            .execute(UPSERT_SQL, &[&cid.to_string(), &encoded])
            .await
            .context(StoreQuerySnafu)?;
        Ok(())
    }

    async fn clear(&self, cid: &Cid) -> Result<(), FailureStoreError> {
        self.client
            .execute(DELETE_SQL, &[&cid.to_string()])
            .await
            .context(StoreQuerySnafu)?;
        Ok(())
    }

    async fn classify(&self, cid: &Cid) -> Result<Option<BackupErrorKind>, FailureStoreError> {
        let row = self
            .client
            .query_opt(SELECT_SQL, &[&cid.to_string()])
            .await
            .context(StoreQuerySnafu)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let encoded: String = row.get(0);
        match serde_json::from_str::<FailureRecord>(&encoded) {
            Ok(record) => Ok(record.kind()),
            Err(e) => {
                tracing::warn!(cid = %cid, error = %e, "unreadable failure record, ignoring");
                Ok(None)
            }
        }
    }

    async fn close(&self) {
        self.driver.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_record_wire_shape() {
        let ts = "2023-05-10T12:00:00Z".parse().unwrap();
        let record = FailureRecord::new(BackupErrorKind::TooBig, "dag too big", ts);
        let encoded = serde_json::to_string(&record).unwrap();

        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["error"]["code"], "ERR_TOO_BIG");
        assert_eq!(value["error"]["message"], "dag too big");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_unknown_code_reads_back_as_none() {
        let record: FailureRecord = serde_json::from_str(
            r#"{"error":{"message":"old","code":"ERR_LEGACY"},"timestamp":"2020-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(record.kind(), None);
    }
}
