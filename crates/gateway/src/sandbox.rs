//! Stage 5: runs an accepted query inside a read-only transaction with a
//! planner cost gate, a statement timeout and a row cap.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use qgate_auth::{AuthError, ContextToken, ContextVerifier};
use qgate_contracts::{ErrorKind, ExecutionResult, Row, ValidatedQuery, canonical};
use serde::Deserialize;
use serde::de::{MapAccess, Visitor};
use sqlx::Row as _;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::sync::RwLock;
use tracing::Instrument;

const QUERY_CANCELED_SQLSTATE: &str = "57014";

/// How a tenant's rows are kept apart from everyone else's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsolationStrategy {
    /// Shared tables; the injected tenant predicate does the separation.
    SharedFiltered,
    DedicatedSchema { schema: String },
    DedicatedDatabase { db_url: String },
}

/// Tenants without an entry share filtered tables.
pub fn isolation_for(
    tenant_isolation: &BTreeMap<String, IsolationStrategy>,
    tenant_id: &str,
) -> IsolationStrategy {
    tenant_isolation
        .get(tenant_id)
        .cloned()
        .unwrap_or(IsolationStrategy::SharedFiltered)
}

#[derive(Debug, Clone, Copy)]
pub struct SandboxConfig {
    pub read_only: bool,
    pub statement_timeout: Duration,
    pub max_rows: usize,
    pub max_estimated_cost: f64,
}

/// Session settings applied at the start of every sandbox transaction.
#[derive(Debug, Clone, Copy)]
pub struct SessionSpec<'a> {
    pub tenant_id: &'a str,
    pub isolation: &'a IsolationStrategy,
    pub statement_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    Unavailable,
    StatementTimeout,
    Query,
    Decode,
    /// Two output columns share a name; a JSON row cannot carry both.
    DuplicateColumn(String),
}

impl From<sqlx::Error> for BackendError {
    fn from(value: sqlx::Error) -> Self {
        match value {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                BackendError::Unavailable
            }
            sqlx::Error::Tls(_) | sqlx::Error::Configuration(_) => BackendError::Unavailable,
            sqlx::Error::Database(db)
                if db.code().as_deref() == Some(QUERY_CANCELED_SQLSTATE) =>
            {
                BackendError::StatementTimeout
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => BackendError::Decode,
            _ => BackendError::Query,
        }
    }
}

/// Where sandboxed SQL actually runs. Each call is its own read-only
/// transaction configured from `session`.
pub trait QueryBackend: Send + Sync {
    /// Planner total cost; must not execute the statement.
    fn estimate_cost(
        &self,
        session: &SessionSpec<'_>,
        sql: &str,
    ) -> impl Future<Output = Result<f64, BackendError>> + Send;

    /// At most `limit` rows, columns in projection order.
    fn fetch(
        &self,
        session: &SessionSpec<'_>,
        sql: &str,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Row>, BackendError>> + Send;

    fn ping(&self) -> impl Future<Output = bool> + Send;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionError {
    Authentication(AuthError),
    NotAccepted,
    ReadOnlyRequired,
    CostExceeded { estimated: f64, max: f64 },
    StatementTimeout,
    DeadlineExceeded,
    Unavailable,
    DuplicateColumn,
    Failed,
}

impl ExecutionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutionError::Authentication(_) => ErrorKind::Authentication,
            ExecutionError::DeadlineExceeded => ErrorKind::Timeout,
            ExecutionError::Unavailable => ErrorKind::Unavailable,
            _ => ErrorKind::Execution,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ExecutionError::Authentication(err) => err.code,
            ExecutionError::NotAccepted => "ERR_QUERY_NOT_ACCEPTED",
            ExecutionError::ReadOnlyRequired => "ERR_SANDBOX_NOT_READ_ONLY",
            ExecutionError::CostExceeded { .. } => "ERR_PREFLIGHT_COST_EXCEEDED",
            ExecutionError::StatementTimeout => "ERR_STATEMENT_TIMEOUT",
            ExecutionError::DeadlineExceeded => "ERR_DEADLINE_EXCEEDED",
            ExecutionError::Unavailable => "ERR_DB_UNAVAILABLE",
            ExecutionError::DuplicateColumn => "ERR_DUPLICATE_OUTPUT_COLUMN",
            ExecutionError::Failed => "ERR_EXECUTION_FAILED",
        }
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionError::Authentication(_) => write!(f, "authentication failed"),
            ExecutionError::NotAccepted => write!(f, "query verdict is not accepted"),
            ExecutionError::ReadOnlyRequired => write!(f, "sandbox must run read-only"),
            ExecutionError::CostExceeded { estimated, max } => write!(
                f,
                "pre-flight: estimated cost {:.2} exceeds {:.2}",
                estimated, max
            ),
            ExecutionError::StatementTimeout => write!(f, "statement timeout"),
            ExecutionError::DeadlineExceeded => write!(f, "request deadline exceeded"),
            ExecutionError::Unavailable => write!(f, "database unavailable"),
            ExecutionError::DuplicateColumn => write!(f, "result has duplicate column names"),
            ExecutionError::Failed => write!(f, "query failed"),
        }
    }
}

impl std::error::Error for ExecutionError {}

impl From<BackendError> for ExecutionError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::Unavailable => ExecutionError::Unavailable,
            BackendError::StatementTimeout => ExecutionError::StatementTimeout,
            BackendError::DuplicateColumn(column) => {
                tracing::warn!(column = %column, "sandbox.duplicate_output_column");
                ExecutionError::DuplicateColumn
            }
            BackendError::Query | BackendError::Decode => ExecutionError::Failed,
        }
    }
}

/// Tenant and isolation are taken from the verified token, never from the
/// caller.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionScope<'a> {
    pub token: &'a ContextToken,
    pub deadline: tokio::time::Instant,
}

pub struct ExecutionSandbox<B> {
    backend: B,
    config: SandboxConfig,
    verifier: ContextVerifier,
    tenant_isolation: BTreeMap<String, IsolationStrategy>,
}

impl<B: QueryBackend> ExecutionSandbox<B> {
    pub fn new(backend: B, config: SandboxConfig, verifier: ContextVerifier) -> Self {
        Self {
            backend,
            config,
            verifier,
            tenant_isolation: BTreeMap::new(),
        }
    }

    pub fn with_tenant_isolation(
        mut self,
        tenant_isolation: BTreeMap<String, IsolationStrategy>,
    ) -> Self {
        self.tenant_isolation = tenant_isolation;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub async fn execute(
        &self,
        query: &ValidatedQuery,
        scope: &ExecutionScope<'_>,
    ) -> Result<ExecutionResult, ExecutionError> {
        let sql_hash = canonical::sha256_hex(query.rewritten_sql.as_bytes());
        let span = tracing::info_span!(
            "sandbox.execute",
            tenant_id = tracing::field::Empty,
            sql_hash = %sql_hash,
            estimated_cost = tracing::field::Empty,
            row_count = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async {
            let started = Instant::now();
            let result = self.execute_inner(query, scope).await;

            tracing::Span::current().record("latency_ms", started.elapsed().as_millis() as u64);
            match &result {
                Ok(result) => {
                    tracing::Span::current().record("estimated_cost", result.estimated_cost);
                    tracing::Span::current().record("row_count", result.row_count as u64);
                    tracing::Span::current()
                        .record("outcome", if result.truncated { "truncated" } else { "ok" });
                }
                Err(err) => {
                    tracing::Span::current().record("outcome", err.code());
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn execute_inner(
        &self,
        query: &ValidatedQuery,
        scope: &ExecutionScope<'_>,
    ) -> Result<ExecutionResult, ExecutionError> {
        let ctx = self
            .verifier
            .verify(scope.token)
            .map_err(ExecutionError::Authentication)?;
        tracing::Span::current().record("tenant_id", ctx.tenant_id());

        if !query.is_accepted() {
            return Err(ExecutionError::NotAccepted);
        }
        if !self.config.read_only {
            return Err(ExecutionError::ReadOnlyRequired);
        }
        if tokio::time::Instant::now() >= scope.deadline {
            return Err(ExecutionError::DeadlineExceeded);
        }

        let isolation = isolation_for(&self.tenant_isolation, ctx.tenant_id());
        let session = SessionSpec {
            tenant_id: ctx.tenant_id(),
            isolation: &isolation,
            statement_timeout: self.statement_timeout_for(scope.deadline),
        };

        let estimated_cost = tokio::time::timeout_at(
            scope.deadline,
            self.backend.estimate_cost(&session, &query.rewritten_sql),
        )
        .await
        .map_err(|_| ExecutionError::DeadlineExceeded)??;

        if !estimated_cost.is_finite() || estimated_cost > self.config.max_estimated_cost {
            return Err(ExecutionError::CostExceeded {
                estimated: estimated_cost,
                max: self.config.max_estimated_cost,
            });
        }

        let fetch_limit = self.config.max_rows.saturating_add(1);
        let mut rows = tokio::time::timeout_at(
            scope.deadline,
            self.backend.fetch(&session, &query.rewritten_sql, fetch_limit),
        )
        .await
        .map_err(|_| ExecutionError::DeadlineExceeded)??;

        let truncated = rows.len() > self.config.max_rows;
        rows.truncate(self.config.max_rows);

        Ok(ExecutionResult {
            row_count: rows.len(),
            rows,
            estimated_cost,
            truncated,
        })
    }

    /// The configured statement timeout, never longer than what is left of
    /// the request.
    fn statement_timeout_for(&self, deadline: tokio::time::Instant) -> Duration {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        self.config
            .statement_timeout
            .min(remaining)
            .max(Duration::from_millis(1))
    }
}

/// Postgres backend connected as the restricted read-only role.
#[derive(Clone)]
pub struct PgBackend {
    shared: PgPool,
    dedicated: Arc<RwLock<HashMap<String, PgPool>>>,
    max_connections: u32,
    acquire_timeout: Duration,
}

impl PgBackend {
    pub async fn connect(
        db_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, sqlx::Error> {
        let shared = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(db_url)
            .await?;

        Ok(Self {
            shared,
            dedicated: Arc::new(RwLock::new(HashMap::new())),
            max_connections,
            acquire_timeout,
        })
    }

    async fn pool_for(&self, session: &SessionSpec<'_>) -> Result<PgPool, BackendError> {
        let IsolationStrategy::DedicatedDatabase { db_url } = session.isolation else {
            return Ok(self.shared.clone());
        };

        if let Some(pool) = self.dedicated.read().await.get(session.tenant_id) {
            return Ok(pool.clone());
        }

        let mut dedicated = self.dedicated.write().await;
        if let Some(pool) = dedicated.get(session.tenant_id) {
            return Ok(pool.clone());
        }
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect_lazy(db_url)
            .map_err(|_| BackendError::Unavailable)?;
        dedicated.insert(session.tenant_id.to_string(), pool.clone());
        Ok(pool)
    }

    async fn begin(
        &self,
        session: &SessionSpec<'_>,
    ) -> Result<sqlx::Transaction<'static, sqlx::Postgres>, BackendError> {
        let pool = self.pool_for(session).await?;
        let mut tx = pool.begin().await.map_err(|_| BackendError::Unavailable)?;

        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await?;

        sqlx::query("SELECT set_config('statement_timeout', $1, true)")
            .bind(format!("{}ms", session.statement_timeout.as_millis()))
            .execute(&mut *tx)
            .await?;

        sqlx::query("SELECT set_config('qgate.tenant_id', $1, true)")
            .bind(session.tenant_id)
            .execute(&mut *tx)
            .await?;

        if let IsolationStrategy::DedicatedSchema { schema } = session.isolation {
            sqlx::query("SELECT set_config('search_path', $1, true)")
                .bind(schema.as_str())
                .execute(&mut *tx)
                .await?;
        }

        Ok(tx)
    }
}

impl QueryBackend for PgBackend {
    async fn estimate_cost(&self, session: &SessionSpec<'_>, sql: &str) -> Result<f64, BackendError> {
        let mut tx = self.begin(session).await?;
        let row = sqlx::query(&format!("EXPLAIN (FORMAT JSON) {}", sql))
            .fetch_one(&mut *tx)
            .await?;
        let plan: serde_json::Value = row.try_get(0)?;
        rollback(tx).await;

        total_cost(&plan).ok_or(BackendError::Decode)
    }

    async fn fetch(
        &self,
        session: &SessionSpec<'_>,
        sql: &str,
        limit: usize,
    ) -> Result<Vec<Row>, BackendError> {
        let mut tx = self.begin(session).await?;
        let wrapped = format!(
            "SELECT row_to_json(capped)::text FROM ({}) AS capped LIMIT {}",
            sql, limit
        );
        let raw_rows = sqlx::query(&wrapped).fetch_all(&mut *tx).await?;
        rollback(tx).await;

        raw_rows
            .iter()
            .map(|row| -> Result<Row, BackendError> {
                let text: String = row.try_get(0)?;
                decode_row(&text)
            })
            .collect()
    }

    async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.shared).await.is_ok()
    }
}

/// Read-only work; nothing is lost if the rollback itself fails.
async fn rollback(tx: sqlx::Transaction<'static, sqlx::Postgres>) {
    note_rollback(tx.rollback().await);
}

fn note_rollback(result: Result<(), sqlx::Error>) {
    if let Err(err) = result {
        tracing::warn!(error = %err, "sandbox.rollback_failed");
    }
}

/// `row_to_json` keeps every column even when names repeat; a plain map
/// would silently keep only the last one.
struct UniqueRow(Result<Row, String>);

impl<'de> Deserialize<'de> for UniqueRow {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RowVisitor;

        impl<'de> Visitor<'de> for RowVisitor {
            type Value = UniqueRow;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a JSON object row")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<UniqueRow, A::Error> {
                let mut row = Row::new();
                let mut duplicate = None;
                while let Some((column, value)) =
                    access.next_entry::<String, serde_json::Value>()?
                {
                    if row.contains_key(&column) {
                        duplicate.get_or_insert(column);
                        continue;
                    }
                    row.insert(column, value);
                }
                Ok(UniqueRow(duplicate.map_or(Ok(row), Err)))
            }
        }

        deserializer.deserialize_map(RowVisitor)
    }
}

fn decode_row(text: &str) -> Result<Row, BackendError> {
    let UniqueRow(row) = serde_json::from_str(text).map_err(|_| BackendError::Decode)?;
    row.map_err(BackendError::DuplicateColumn)
}

fn total_cost(plan: &serde_json::Value) -> Option<f64> {
    plan.get(0)?
        .get("Plan")?
        .get("Total Cost")?
        .as_f64()
}
