//! Durable, append-only operation log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::operation::{OpType, Operation};

/// Durable log of accepted operations, keyed by `(document_id, version)`.
/// Defined behind a trait so an alternate backend can be substituted without
/// touching the Hub.
#[async_trait]
pub trait OperationStore: Send + Sync {
    async fn append(&self, document_id: Uuid, op: &Operation) -> StoreResult<()>;
    async fn load_since(&self, document_id: Uuid, version: u64) -> StoreResult<Vec<Operation>>;
    async fn max_version(&self, document_id: Uuid) -> StoreResult<u64>;
    async fn truncate_up_to(&self, document_id: Uuid, version: u64) -> StoreResult<()>;
}

/// `sqlx`-backed SQLite implementation of [`OperationStore`].
#[derive(Clone)]
pub struct SqliteOperationStore {
    pool: SqlitePool,
}

impl SqliteOperationStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let connect_options = SqliteConnectOptions::from_str(database_url)
            .map_err(StoreError::Database)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(5000));

        let pool = SqlitePoolOptions::new()
            .max_connections(20)
            .connect_with(connect_options)
            .await
            .map_err(StoreError::Database)?;

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await
            .map_err(StoreError::Database)?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS operations (
                document_id TEXT NOT NULL,
                version     INTEGER NOT NULL,
                op_type     TEXT NOT NULL,
                position    INTEGER NOT NULL,
                content     TEXT NOT NULL DEFAULT '',
                length      INTEGER NOT NULL DEFAULT 0,
                author      TEXT NOT NULL,
                timestamp   TEXT NOT NULL,
                PRIMARY KEY (document_id, version)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS snapshots (
                document_id      TEXT NOT NULL,
                snapshot_version INTEGER NOT NULL,
                text             TEXT NOT NULL,
                created_at       TEXT NOT NULL,
                PRIMARY KEY (document_id, snapshot_version)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        Ok(())
    }

    pub async fn latest_snapshot(&self, document_id: Uuid) -> StoreResult<Option<(u64, String)>> {
        let row = sqlx::query(
            "SELECT snapshot_version, text FROM snapshots
             WHERE document_id = ?
             ORDER BY snapshot_version DESC LIMIT 1",
        )
        .bind(document_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        Ok(row.map(|row| {
            let version: i64 = row.get("snapshot_version");
            let text: String = row.get("text");
            (version as u64, text)
        }))
    }

    pub async fn save_snapshot(&self, document_id: Uuid, version: u64, text: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO snapshots (document_id, snapshot_version, text, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(document_id.to_string())
        .bind(version as i64)
        .bind(text)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;
        Ok(())
    }
}

fn row_to_operation(row: &sqlx::sqlite::SqliteRow) -> Operation {
    let op_type_str: String = row.get("op_type");
    let position: i64 = row.get("position");
    let content: String = row.get("content");
    let length: i64 = row.get("length");
    let author: String = row.get("author");
    let version: i64 = row.get("version");
    let timestamp: String = row.get("timestamp");

    let op_type = match op_type_str.as_str() {
        "insert" => OpType::Insert { content },
        "delete" => OpType::Delete { length: length as u64 },
        _ => OpType::Retain,
    };

    Operation {
        id: Uuid::new_v4(),
        op_type,
        position: position as u64,
        author: Uuid::parse_str(&author).unwrap_or_else(|_| Uuid::nil()),
        version: version as u64,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    }
}

#[async_trait]
impl OperationStore for SqliteOperationStore {
    async fn append(&self, document_id: Uuid, op: &Operation) -> StoreResult<()> {
        let (op_type, content, length) = match &op.op_type {
            OpType::Insert { content } => ("insert", content.clone(), 0i64),
            OpType::Delete { length } => ("delete", String::new(), *length as i64),
            OpType::Retain => ("retain", String::new(), 0i64),
        };

        sqlx::query(
            "INSERT INTO operations (document_id, version, op_type, position, content, length, author, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(document_id.to_string())
        .bind(op.version as i64)
        .bind(op_type)
        .bind(op.position as i64)
        .bind(content)
        .bind(length)
        .bind(op.author.to_string())
        .bind(op.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        Ok(())
    }

    async fn load_since(&self, document_id: Uuid, version: u64) -> StoreResult<Vec<Operation>> {
        let rows = sqlx::query(
            "SELECT version, op_type, position, content, length, author, timestamp
             FROM operations WHERE document_id = ? AND version > ?
             ORDER BY version ASC",
        )
        .bind(document_id.to_string())
        .bind(version as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        Ok(rows.iter().map(row_to_operation).collect())
    }

    async fn max_version(&self, document_id: Uuid) -> StoreResult<u64> {
        let row = sqlx::query("SELECT MAX(version) as max_version FROM operations WHERE document_id = ?")
            .bind(document_id.to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::Database)?;

        let max: Option<i64> = row.get("max_version");
        Ok(max.unwrap_or(0) as u64)
    }

    async fn truncate_up_to(&self, document_id: Uuid, version: u64) -> StoreResult<()> {
        sqlx::query("DELETE FROM operations WHERE document_id = ? AND version <= ?")
            .bind(document_id.to_string())
            .bind(version as i64)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Database)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_and_load_since_round_trip() {
        let store = SqliteOperationStore::connect("sqlite::memory:").await.unwrap();
        let document_id = Uuid::new_v4();
        let author = Uuid::new_v4();

        let op = Operation::insert(0, "hello".to_string(), author, 1);
        store.append(document_id, &op).await.unwrap();

        assert_eq!(store.max_version(document_id).await.unwrap(), 1);

        let loaded = store.load_since(document_id, 0).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].position, 0);
    }

    #[tokio::test]
    async fn truncate_up_to_drops_old_versions() {
        let store = SqliteOperationStore::connect("sqlite::memory:").await.unwrap();
        let document_id = Uuid::new_v4();
        let author = Uuid::new_v4();

        for v in 1..=5u64 {
            let op = Operation::insert(0, "x".to_string(), author, v);
            store.append(document_id, &op).await.unwrap();
        }

        store.truncate_up_to(document_id, 3).await.unwrap();
        let remaining = store.load_since(document_id, 0).await.unwrap();
        assert_eq!(remaining.len(), 2);
    }
}
