use super::{RecordStore, StoreError};
use crate::record::{FieldPatch, RawRecord, RecordId};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json as SqlJson;
use sqlx::{PgPool, Row};

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            _ => StoreError::Query(err.to_string()),
        }
    }
}

/// `sensor_readings`-shaped table: `id uuid`, `created_at timestamptz`, `doc jsonb`,
/// `data_quality text`, `updated_at timestamptz`.
#[derive(Clone, Debug)]
pub struct PgRecordStore {
    pool: PgPool,
    table: String,
}

impl PgRecordStore {
    /// `table` must already be a validated identifier; it is interpolated into SQL.
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id uuid primary key,
                created_at timestamptz null,
                doc jsonb not null default '{{}}'::jsonb,
                data_quality text null,
                updated_at timestamptz null
            )
            "#,
            table = self.table
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {table}_created_at_idx ON {table} (created_at DESC)",
            table = self.table
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn find_recent(&self, keys: &[&str], limit: usize) -> Result<Vec<RawRecord>, StoreError> {
        let keys: Vec<String> = keys.iter().map(|key| key.to_string()).collect();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        // Non-object documents are passed through untouched so the fetcher can reject them.
        // Rows dated only by `doc.timestamp` sort after every row with `created_at`.
        let rows = sqlx::query(&format!(
            r#"
            SELECT
                id,
                created_at,
                data_quality,
                CASE
                    WHEN jsonb_typeof(doc) = 'object' THEN COALESCE(
                        (SELECT jsonb_object_agg(e.key, e.value)
                         FROM jsonb_each(doc) e
                         WHERE e.key = ANY($1)),
                        '{{}}'::jsonb
                    )
                    ELSE doc
                END AS doc
            FROM {table}
            ORDER BY created_at DESC NULLS LAST, id
            LIMIT $2
            "#,
            table = self.table
        ))
        .bind(keys)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let doc = row
                .try_get::<Option<SqlJson<Value>>, _>("doc")?
                .map(|json| json.0)
                .unwrap_or(Value::Null);
            records.push(RawRecord {
                id: row.try_get::<RecordId, _>("id")?,
                created_at: row.try_get::<Option<DateTime<Utc>>, _>("created_at")?,
                doc,
                data_quality: row.try_get::<Option<String>, _>("data_quality")?,
            });
        }
        Ok(records)
    }

    async fn update_fields(&self, id: RecordId, patch: &FieldPatch) -> Result<u64, StoreError> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET doc = (CASE WHEN jsonb_typeof(doc) = 'object' THEN doc ELSE '{{}}'::jsonb END) || $2::jsonb,
                data_quality = COALESCE($3, data_quality),
                updated_at = NOW()
            WHERE id = $1
            "#,
            table = self.table
        ))
        .bind(id)
        .bind(SqlJson(patch.document()))
        .bind(patch.data_quality.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_many(&self, ids: &[RecordId]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(&format!(
            "DELETE FROM {table} WHERE id = ANY($1)",
            table = self.table
        ))
        .bind(ids.to_vec())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
