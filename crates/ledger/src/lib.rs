use std::future::Future;
use std::time::Duration;

use qgate_contracts::canonical;
use qgate_contracts::{AuditOutcome, AuditRecord};
use sqlx::postgres::PgPoolOptions;

pub mod queue;

pub use queue::{AuditError, AuditQueue, AuditQueueConfig};

#[derive(Debug)]
pub enum LedgerError {
    Timeout,
    Encode(serde_json::Error),
    Sqlx(sqlx::Error),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::Timeout => write!(f, "ledger operation timed out"),
            LedgerError::Encode(err) => write!(f, "ledger encode error: {}", err),
            LedgerError::Sqlx(err) => write!(f, "ledger sql error: {}", err),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<sqlx::Error> for LedgerError {
    fn from(value: sqlx::Error) -> Self {
        LedgerError::Sqlx(value)
    }
}

/// Durable destination for audit records. `append` returning `Ok` means the
/// record is stored; appending the same `audit_id` twice is a no-op.
pub trait AuditSink: Send + Sync {
    fn append(&self, record: &AuditRecord) -> impl Future<Output = Result<(), LedgerError>> + Send;

    fn ping(&self) -> impl Future<Output = Result<(), LedgerError>> + Send;
}

#[derive(Clone)]
pub struct LedgerWriter {
    pool: sqlx::PgPool,
    write_timeout: Duration,
}

impl LedgerWriter {
    pub async fn connect(db_url: &str, write_timeout: Duration) -> Result<Self, LedgerError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            PgPoolOptions::new().max_connections(4).connect(db_url),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??;

        Ok(Self {
            pool,
            write_timeout,
        })
    }

    pub async fn connect_and_migrate(
        db_url: &str,
        write_timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let writer = Self::connect(db_url, write_timeout).await?;
        writer.migrate().await?;
        Ok(writer)
    }

    pub async fn migrate(&self) -> Result<(), LedgerError> {
        tokio::time::timeout(Duration::from_secs(10), migrate(&self.pool))
            .await
            .map_err(|_| LedgerError::Timeout)??;
        Ok(())
    }

    pub async fn append_record(&self, record: &AuditRecord) -> Result<(), LedgerError> {
        let record_json = serde_json::to_value(record).map_err(LedgerError::Encode)?;
        let record_hash = canonical::hash_canonical_json(&record_json);
        let (denied_stage, error_kind) = match record.outcome {
            AuditOutcome::Success => (None, None),
            AuditOutcome::Denied { stage, kind } => (Some(i16::from(stage)), Some(kind.as_str())),
        };

        tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "INSERT INTO qgate_audit_records (audit_id, request_id, recorded_at_epoch_ms, identity_id, tenant_id, session_id, sql_hash, row_count, redacted_columns, masked_columns, outcome, denied_stage, error_kind, record_json, record_hash) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15) ON CONFLICT (audit_id) DO NOTHING",
            )
            .bind(&record.audit_id)
            .bind(&record.request_id)
            .bind(record.recorded_at_epoch_ms)
            .bind(&record.identity_id)
            .bind(&record.tenant_id)
            .bind(&record.session_id)
            .bind(record.sql_hash.as_deref())
            .bind(i64::try_from(record.row_count).unwrap_or(i64::MAX))
            .bind(sqlx::types::Json(&record.redacted_columns))
            .bind(sqlx::types::Json(&record.masked_columns))
            .bind(record.outcome.label())
            .bind(denied_stage)
            .bind(error_kind)
            .bind(&record_json)
            .bind(record_hash)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??;

        Ok(())
    }

    pub async fn ping(&self) -> Result<(), LedgerError> {
        tokio::time::timeout(
            self.write_timeout,
            sqlx::query("SELECT 1").execute(&self.pool),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl AuditSink for LedgerWriter {
    async fn append(&self, record: &AuditRecord) -> Result<(), LedgerError> {
        self.append_record(record).await
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        LedgerWriter::ping(self).await
    }
}

pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
