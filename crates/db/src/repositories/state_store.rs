use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prechat_core::storage::{StateStore, StoreError};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row};
use tracing::warn;

use super::RepositoryError;
use crate::DbPool;

/// SQLite-backed admission state, one JSON document per `(namespace, key)`.
#[derive(Clone)]
pub struct SqlStateStore {
    pool: DbPool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceSummary {
    pub namespace: String,
    pub records: i64,
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl SqlStateStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn summarize(&self) -> Result<Vec<NamespaceSummary>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT namespace, COUNT(*) AS records, MAX(updated_at) AS last_updated_at
             FROM admission_state
             GROUP BY namespace
             ORDER BY namespace",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<NamespaceSummary, RepositoryError> {
                let last_updated_at = row
                    .try_get::<Option<String>, _>("last_updated_at")?
                    .map(|value| parse_timestamp("last_updated_at", value))
                    .transpose()?;
                Ok(NamespaceSummary {
                    namespace: row.try_get("namespace")?,
                    records: row.try_get("records")?,
                    last_updated_at,
                })
            })
            .collect()
    }

    async fn load_row(&self, namespace: &str, key: &str) -> Result<Option<Value>, RepositoryError> {
        let row = sqlx::query(
            "SELECT payload_json FROM admission_state WHERE namespace = ? AND state_key = ?",
        )
        .bind(namespace)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| payload_from_row(&row)).transpose()
    }

    async fn load_namespace(&self, namespace: &str) -> Result<Vec<(String, Value)>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT state_key, payload_json
             FROM admission_state
             WHERE namespace = ?
             ORDER BY state_key",
        )
        .bind(namespace)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let key = row.try_get::<String, _>("state_key")?;
            match payload_from_row(&row) {
                Ok(payload) => records.push((key, payload)),
                Err(error) => warn!(
                    event_name = "db.admission_state.row_skipped",
                    namespace,
                    key = %key,
                    error = %error,
                    "skipping undecodable admission_state row"
                ),
            }
        }
        Ok(records)
    }

    async fn upsert(&self, namespace: &str, key: &str, value: &Value) -> Result<(), RepositoryError> {
        let payload = serde_json::to_string(value)
            .map_err(|error| RepositoryError::Decode(format!("payload encode failed: {error}")))?;

        sqlx::query(
            "INSERT INTO admission_state (namespace, state_key, payload_json, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(namespace, state_key) DO UPDATE SET
                payload_json = excluded.payload_json,
                updated_at = excluded.updated_at",
        )
        .bind(namespace)
        .bind(key)
        .bind(payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove(&self, namespace: &str, key: &str) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM admission_state WHERE namespace = ? AND state_key = ?")
            .bind(namespace)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for SqlStateStore {
    async fn load(&self, namespace: &str, key: &str) -> Result<Option<Value>, StoreError> {
        self.load_row(namespace, key).await.map_err(|error| with_location(error, namespace, key))
    }

    async fn load_all(&self, namespace: &str) -> Result<Vec<(String, Value)>, StoreError> {
        self.load_namespace(namespace).await.map_err(|error| with_location(error, namespace, "*"))
    }

    async fn save(&self, namespace: &str, key: &str, value: Value) -> Result<(), StoreError> {
        self.upsert(namespace, key, &value).await.map_err(|error| with_location(error, namespace, key))
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        self.remove(namespace, key).await.map_err(|error| with_location(error, namespace, key))
    }
}

fn with_location(error: RepositoryError, namespace: &str, key: &str) -> StoreError {
    match error {
        RepositoryError::Decode(detail) => {
            StoreError::Decode { namespace: namespace.to_string(), key: key.to_string(), detail }
        }
        other => StoreError::from(other),
    }
}

fn payload_from_row(row: &SqliteRow) -> Result<Value, RepositoryError> {
    let raw = row.try_get::<String, _>("payload_json")?;
    serde_json::from_str(&raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid payload_json: {error}")))
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}
