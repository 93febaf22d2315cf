//! Postgres-backed ledger event log.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use swarmrouter_core::LedgerEntryId;

use super::{LedgerEntry, LedgerEventError, LedgerEventKind, LedgerEventLog};

const SELECT_ENTRY: &str = r#"
    SELECT id, kind, payload, payload_hash, storage_ref, tx_ref, anchored, created_at, anchored_at
    FROM ledger_events
"#;

#[derive(Debug, Clone)]
pub struct PostgresLedgerEventLog {
    pool: Arc<PgPool>,
}

impl PostgresLedgerEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

#[async_trait]
impl LedgerEventLog for PostgresLedgerEventLog {
    #[instrument(skip(self, entry), fields(entry_id = %entry.id, kind = %entry.kind), err)]
    async fn append(&self, entry: &LedgerEntry) -> Result<(), LedgerEventError> {
        sqlx::query(
            r#"
            INSERT INTO ledger_events (id, kind, payload, payload_hash, storage_ref, tx_ref, anchored, created_at, anchored_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.kind.as_str())
        .bind(&entry.payload)
        .bind(&entry.payload_hash)
        .bind(&entry.storage_ref)
        .bind(&entry.tx_ref)
        .bind(entry.anchored)
        .bind(entry.created_at)
        .bind(entry.anchored_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("append", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn mark_anchored(
        &self,
        id: LedgerEntryId,
        storage_ref: &str,
        tx_ref: &str,
    ) -> Result<LedgerEntry, LedgerEventError> {
        let row = sqlx::query(
            r#"
            UPDATE ledger_events
            SET storage_ref = $2, tx_ref = $3, anchored = TRUE, anchored_at = $4
            WHERE id = $1
            RETURNING id, kind, payload, payload_hash, storage_ref, tx_ref, anchored, created_at, anchored_at
            "#,
        )
        .bind(id.as_uuid())
        .bind(storage_ref)
        .bind(tx_ref)
        .bind(Utc::now())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_anchored", e))?
        .ok_or(LedgerEventError::NotFound(id))?;

        entry_from_row(&row)
    }

    #[instrument(skip(self), err)]
    async fn get(&self, id: LedgerEntryId) -> Result<Option<LedgerEntry>, LedgerEventError> {
        let sql = format!("{SELECT_ENTRY} WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(entry_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn unanchored(&self) -> Result<Vec<LedgerEntry>, LedgerEventError> {
        let sql = format!("{SELECT_ENTRY} WHERE NOT anchored ORDER BY created_at ASC");
        let rows = sqlx::query(&sql)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("unanchored", e))?;
        rows.iter().map(entry_from_row).collect()
    }
}

fn entry_from_row(row: &PgRow) -> Result<LedgerEntry, LedgerEventError> {
    let decode = |e: sqlx::Error| LedgerEventError::Storage(format!("decode ledger_events row: {e}"));

    let kind: String = row.try_get("kind").map_err(decode)?;
    let kind = kind
        .parse::<LedgerEventKind>()
        .map_err(|e| LedgerEventError::Storage(format!("bad kind in ledger_events row: {e}")))?;

    Ok(LedgerEntry {
        id: LedgerEntryId::from_uuid(row.try_get::<Uuid, _>("id").map_err(decode)?),
        kind,
        payload: row.try_get("payload").map_err(decode)?,
        payload_hash: row.try_get("payload_hash").map_err(decode)?,
        storage_ref: row.try_get("storage_ref").map_err(decode)?,
        tx_ref: row.try_get("tx_ref").map_err(decode)?,
        anchored: row.try_get("anchored").map_err(decode)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(decode)?,
        anchored_at: row.try_get("anchored_at").map_err(decode)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerEventError {
    match err {
        sqlx::Error::Database(db_err) => {
            LedgerEventError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            LedgerEventError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => LedgerEventError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
