//! The request state machine: six stages run strictly in order, each either
//! handing its output forward or ending the request with a stage-tagged
//! error. Every request that gets past token verification leaves exactly one
//! audit record.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};

use qgate_auth::{ContextToken, ContextVerifier, UserContext};
use qgate_contracts::{
    AuditOutcome, AuditRecord, ErrorKind, Operation, Row, SchemaCatalog, SchemaDescriptor, Stage,
    ValidatedQuery, canonical,
};
use qgate_ledger::{AuditError, AuditQueue};
use qgate_policy::{AuthorizationGate, PolicyDecider};
use qgate_sql::{QueryScope, SqlValidator};
use serde::Serialize;
use tracing::Instrument;

use crate::agent::{AgentError, AgentRequest, QueryAgent};
use crate::guardrail::{InputGuardrail, InputRejection};
use crate::metrics;
use crate::sandbox::{self, ExecutionSandbox, ExecutionScope, IsolationStrategy, QueryBackend};
use crate::sanitize::{OutputSanitizer, SanitizeScope, unix_epoch_ms_now};

/// Extra time a denial record may wait for queue capacity once the request
/// deadline has already passed.
const DENIAL_AUDIT_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct PipelineError {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub code: &'static str,
    /// Internal detail. Logged, never returned to the caller.
    pub detail: String,
    /// Table cited by an authorization failure.
    pub table: Option<String>,
    pub retry_after: Option<Duration>,
    pub audit_id: Option<String>,
}

impl PipelineError {
    fn new(stage: Stage, kind: ErrorKind, code: &'static str, detail: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            code,
            detail: detail.into(),
            table: None,
            retry_after: None,
            audit_id: None,
        }
    }

    fn deadline(stage: Stage) -> Self {
        Self::new(
            stage,
            ErrorKind::Timeout,
            "ERR_DEADLINE_EXCEEDED",
            "request deadline passed before stage started",
        )
    }

    fn with_table(mut self, table: Option<&str>) -> Self {
        self.table = table.map(str::to_string);
        self
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "stage {} {}: {}",
            self.stage.number(),
            self.kind.as_str(),
            self.code
        )
    }
}

impl std::error::Error for PipelineError {}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub request_id: String,
    pub token: ContextToken,
    pub input: String,
    pub deadline: tokio::time::Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub request_id: String,
    pub audit_id: String,
    pub rows: Vec<Row>,
    pub row_count: usize,
    pub truncated: bool,
    pub estimated_cost: f64,
    pub redacted_columns: Vec<String>,
    pub masked_columns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Schema qualifier allowed for shared and dedicated-database tenants.
    pub db_schema: String,
    pub tenant_isolation: BTreeMap<String, IsolationStrategy>,
    pub agent_timeout: Duration,
}

impl PipelineSettings {
    pub fn isolation_for(&self, tenant_id: &str) -> IsolationStrategy {
        sandbox::isolation_for(&self.tenant_isolation, tenant_id)
    }
}

pub struct PipelineParts<D, A, B> {
    pub verifier: ContextVerifier,
    pub guardrail: InputGuardrail,
    pub gate: AuthorizationGate<D>,
    pub catalog: SchemaCatalog,
    pub validator: SqlValidator,
    pub agent: A,
    pub sandbox: ExecutionSandbox<B>,
    pub audit: AuditQueue,
    pub settings: PipelineSettings,
}

pub struct Pipeline<D, A, B> {
    verifier: ContextVerifier,
    guardrail: InputGuardrail,
    gate: AuthorizationGate<D>,
    catalog: SchemaCatalog,
    validator: SqlValidator,
    agent: A,
    sandbox: ExecutionSandbox<B>,
    sanitizer: OutputSanitizer,
    audit: AuditQueue,
    settings: PipelineSettings,
}

impl<D, A, B> Pipeline<D, A, B>
where
    D: PolicyDecider,
    A: QueryAgent,
    B: QueryBackend,
{
    pub fn new(parts: PipelineParts<D, A, B>) -> Self {
        let sanitizer = OutputSanitizer::new(parts.verifier.clone());
        Self {
            verifier: parts.verifier,
            guardrail: parts.guardrail,
            gate: parts.gate,
            catalog: parts.catalog,
            validator: parts.validator,
            agent: parts.agent,
            sandbox: parts.sandbox,
            sanitizer,
            audit: parts.audit,
            settings: parts.settings,
        }
    }

    pub fn verifier(&self) -> &ContextVerifier {
        &self.verifier
    }

    pub fn gate(&self) -> &AuthorizationGate<D> {
        &self.gate
    }

    pub fn sandbox(&self) -> &ExecutionSandbox<B> {
        &self.sandbox
    }

    pub fn audit_queue(&self) -> &AuditQueue {
        &self.audit
    }

    pub async fn run(&self, request: &QueryRequest) -> Result<QueryResponse, PipelineError> {
        let span = tracing::info_span!(
            "pipeline.request",
            request_id = %request.request_id,
            identity_id = tracing::field::Empty,
            tenant_id = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async {
            let started = Instant::now();
            let result = self.run_stages(request).await;

            tracing::Span::current().record("latency_ms", started.elapsed().as_millis() as u64);
            match &result {
                Ok(response) => {
                    tracing::Span::current().record("outcome", "success");
                    tracing::info!(
                        audit_id = %response.audit_id,
                        row_count = response.row_count,
                        truncated = response.truncated,
                        "pipeline.completed"
                    );
                }
                Err(err) => {
                    let label = AuditOutcome::denied(err.stage, err.kind).label();
                    tracing::Span::current().record("outcome", label.as_str());
                    // Validator detail can quote the statement; keep only the code.
                    let detail = if err.stage == Stage::SqlValidator {
                        ""
                    } else {
                        err.detail.as_str()
                    };
                    tracing::warn!(
                        stage = err.stage.number(),
                        kind = err.kind.as_str(),
                        code = err.code,
                        detail,
                        "pipeline.denied"
                    );
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_stages(&self, request: &QueryRequest) -> Result<QueryResponse, PipelineError> {
        let ctx = observe(Stage::ContextVerifier, async {
            check_deadline(Stage::ContextVerifier, request.deadline)?;
            self.verifier.verify(&request.token).map_err(|err| {
                PipelineError::new(
                    Stage::ContextVerifier,
                    ErrorKind::Authentication,
                    err.code,
                    err.message,
                )
            })
        })
        .await?;

        tracing::Span::current().record("identity_id", ctx.identity_id());
        tracing::Span::current().record("tenant_id", ctx.tenant_id());

        let Some(token_left) = ctx.remaining() else {
            return Err(PipelineError::new(
                Stage::ContextVerifier,
                ErrorKind::Authentication,
                "ERR_AUTHENTICATION",
                "token expired during verification",
            ));
        };
        let deadline = request
            .deadline
            .min(tokio::time::Instant::now() + token_left);

        let mut trail = Trail::default();
        match self.run_verified(request, &ctx, deadline, &mut trail).await {
            Ok(response) => Ok(response),
            Err(mut err) => {
                let record = denial_record(&ctx, request, &trail, &err);
                let audit_id = record.audit_id.clone();
                let audit_deadline = deadline.max(tokio::time::Instant::now() + DENIAL_AUDIT_GRACE);
                if self.record_audit(record, audit_deadline, false).await.is_ok() {
                    err.audit_id = Some(audit_id);
                }
                Err(err)
            }
        }
    }

    async fn run_verified(
        &self,
        request: &QueryRequest,
        ctx: &UserContext,
        deadline: tokio::time::Instant,
        trail: &mut Trail,
    ) -> Result<QueryResponse, PipelineError> {
        if self.audit.is_degraded() {
            return Err(PipelineError::new(
                Stage::OutputSanitizer,
                ErrorKind::Unavailable,
                "ERR_AUDIT_DEGRADED",
                "audit sink is degraded; refusing new requests",
            ));
        }

        observe(Stage::InputGuardrail, async { self.check_input(request, deadline) }).await?;

        let descriptor =
            observe(Stage::AuthorizationGate, self.filter_schema(request, deadline)).await?;

        let sql = self.draft_sql(request, &descriptor, deadline).await?;

        let isolation = self.settings.isolation_for(ctx.tenant_id());
        let validated = observe(
            Stage::SqlValidator,
            self.validate_sql(request, &sql, &descriptor, &isolation, deadline),
        )
        .await?;
        let sql_hash = canonical::sha256_hex(validated.rewritten_sql.as_bytes());
        trail.sql_hash = Some(sql_hash.clone());

        let result = observe(Stage::ExecutionSandbox, async {
            check_deadline(Stage::ExecutionSandbox, deadline)?;
            self.sandbox
                .execute(
                    &validated,
                    &ExecutionScope {
                        token: &request.token,
                        deadline,
                    },
                )
                .await
                .map_err(|err| {
                    PipelineError::new(Stage::ExecutionSandbox, err.kind(), err.code(), err.to_string())
                })
        })
        .await?;

        let (rows, record) = observe(Stage::OutputSanitizer, async {
            check_deadline(Stage::OutputSanitizer, deadline)?;
            self.sanitizer
                .sanitize(
                    &request.token,
                    result.rows,
                    &SanitizeScope {
                        descriptor: &descriptor,
                        tables: &validated.tables,
                        request_id: &request.request_id,
                        sql_hash: &sql_hash,
                    },
                )
                .map_err(|err| {
                    PipelineError::new(Stage::OutputSanitizer, err.kind(), err.code(), err.to_string())
                })
        })
        .await?;

        metrics::add_redacted_columns(record.redacted_columns.len() + record.masked_columns.len());

        let response = QueryResponse {
            request_id: request.request_id.clone(),
            audit_id: record.audit_id.clone(),
            row_count: rows.len(),
            rows,
            truncated: result.truncated,
            estimated_cost: result.estimated_cost,
            redacted_columns: record.redacted_columns.clone(),
            masked_columns: record.masked_columns.clone(),
        };

        // A success is never reported before its audit record is stored.
        self.record_audit(record, deadline, true)
            .await
            .map_err(|err| {
                let kind = match err {
                    AuditError::Backpressure if tokio::time::Instant::now() >= deadline => {
                        ErrorKind::Timeout
                    }
                    _ => ErrorKind::Unavailable,
                };
                PipelineError::new(
                    Stage::OutputSanitizer,
                    kind,
                    "ERR_AUDIT_UNAVAILABLE",
                    err.to_string(),
                )
            })?;

        Ok(response)
    }

    fn check_input(
        &self,
        request: &QueryRequest,
        deadline: tokio::time::Instant,
    ) -> Result<(), PipelineError> {
        let span = tracing::info_span!(
            "stage.input",
            input_len = request.input.chars().count(),
            outcome = tracing::field::Empty,
        );
        let _entered = span.enter();

        check_deadline(Stage::InputGuardrail, deadline)?;
        match self.guardrail.validate(&request.input, &request.token) {
            Ok(()) => {
                span.record("outcome", "accepted");
                Ok(())
            }
            Err(rejection) => {
                span.record("outcome", rejection.reason());
                let retry_after = match &rejection {
                    InputRejection::RateLimited { retry_after } => Some(*retry_after),
                    _ => None,
                };
                let mut err = PipelineError::new(
                    Stage::InputGuardrail,
                    rejection.kind(),
                    rejection.code(),
                    rejection.to_string(),
                );
                err.retry_after = retry_after;
                Err(err)
            }
        }
    }

    async fn filter_schema(
        &self,
        request: &QueryRequest,
        deadline: tokio::time::Instant,
    ) -> Result<SchemaDescriptor, PipelineError> {
        check_deadline(Stage::AuthorizationGate, deadline)?;
        let filtered =
            tokio::time::timeout_at(deadline, self.gate.filter_schema(&request.token, &self.catalog))
                .await
                .map_err(|_| PipelineError::deadline(Stage::AuthorizationGate))?;

        let descriptor = filtered.map_err(|err| {
            PipelineError::new(Stage::AuthorizationGate, err.kind(), err.code(), err.to_string())
        })?;
        if descriptor.is_empty() {
            return Err(PipelineError::new(
                Stage::AuthorizationGate,
                ErrorKind::Authorization,
                "ERR_NO_VISIBLE_TABLES",
                "identity may read no tables",
            ));
        }
        Ok(descriptor)
    }

    /// The agent sits between stages 3 and 4; its failures are reported
    /// against the validator, which never received a statement.
    async fn draft_sql(
        &self,
        request: &QueryRequest,
        descriptor: &SchemaDescriptor,
        deadline: tokio::time::Instant,
    ) -> Result<String, PipelineError> {
        check_deadline(Stage::SqlValidator, deadline)?;
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let schema = descriptor.agent_view();
        let agent_request = AgentRequest {
            request_id: &request.request_id,
            schema: &schema,
            input: &request.input,
        };

        self.agent
            .draft_sql(&agent_request, self.settings.agent_timeout.min(remaining))
            .await
            .map_err(|err| {
                let kind = match err {
                    AgentError::Timeout => ErrorKind::Timeout,
                    AgentError::InvalidResponse => ErrorKind::SqlValidation,
                    AgentError::Unavailable | AgentError::BadStatus(_) => ErrorKind::Unavailable,
                };
                PipelineError::new(Stage::SqlValidator, kind, err.code(), err.to_string())
            })
    }

    async fn validate_sql(
        &self,
        request: &QueryRequest,
        sql: &str,
        descriptor: &SchemaDescriptor,
        isolation: &IsolationStrategy,
        deadline: tokio::time::Instant,
    ) -> Result<ValidatedQuery, PipelineError> {
        let span = tracing::info_span!(
            "sql.validate",
            sql_hash = tracing::field::Empty,
            table_count = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async {
            let started = Instant::now();
            let result = async {
                check_deadline(Stage::SqlValidator, deadline)?;
                let schema = match isolation {
                    IsolationStrategy::DedicatedSchema { schema } => schema.as_str(),
                    _ => self.settings.db_schema.as_str(),
                };
                let scope = QueryScope {
                    descriptor,
                    token: &request.token,
                    schema,
                };
                let validated = self.validator.validate(sql, &scope).map_err(|err| {
                    PipelineError::new(Stage::SqlValidator, err.kind(), err.code(), err.to_string())
                        .with_table(err.table())
                })?;

                for table in &validated.tables {
                    let allowed = tokio::time::timeout_at(
                        deadline,
                        self.gate
                            .check_access(&request.token, &self.catalog, table, Operation::Read),
                    )
                    .await
                    .map_err(|_| PipelineError::deadline(Stage::SqlValidator))?;
                    if !allowed {
                        return Err(PipelineError::new(
                            Stage::SqlValidator,
                            ErrorKind::Authorization,
                            "ERR_TABLE_NOT_ALLOWED",
                            format!("access re-check denied table {}", table),
                        )
                        .with_table(Some(table)));
                    }
                }
                Ok(validated)
            }
            .await;

            tracing::Span::current().record("latency_ms", started.elapsed().as_millis() as u64);
            match &result {
                Ok(validated) => {
                    tracing::Span::current().record(
                        "sql_hash",
                        canonical::sha256_hex(validated.rewritten_sql.as_bytes()).as_str(),
                    );
                    tracing::Span::current().record("table_count", validated.tables.len() as u64);
                    tracing::Span::current().record("outcome", "accepted");
                }
                Err(err) => {
                    tracing::Span::current().record("outcome", err.code);
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn record_audit(
        &self,
        record: AuditRecord,
        deadline: tokio::time::Instant,
        wait_for_ack: bool,
    ) -> Result<(), AuditError> {
        let span = tracing::info_span!(
            "audit.enqueue",
            audit_id = %record.audit_id,
            audit_outcome = %record.outcome.label(),
            wait_for_ack,
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async {
            let started = Instant::now();
            let result = if wait_for_ack {
                self.audit.enqueue_and_wait(record, deadline).await
            } else {
                self.audit.enqueue(record, deadline).await
            };

            tracing::Span::current().record("latency_ms", started.elapsed().as_millis() as u64);
            match &result {
                Ok(()) => {
                    tracing::Span::current().record("outcome", "queued");
                }
                Err(err) => {
                    let reason = audit_failure_reason(*err);
                    tracing::Span::current().record("outcome", reason);
                    metrics::inc_audit_enqueue_failure(reason);
                    tracing::error!(error = %err, "audit.enqueue_failed");
                }
            }
            result
        }
        .instrument(span)
        .await
    }
}

/// Facts gathered along the way that the denial record carries.
#[derive(Default)]
struct Trail {
    sql_hash: Option<String>,
}

fn check_deadline(stage: Stage, deadline: tokio::time::Instant) -> Result<(), PipelineError> {
    if tokio::time::Instant::now() >= deadline {
        return Err(PipelineError::deadline(stage));
    }
    Ok(())
}

async fn observe<T, F>(stage: Stage, fut: F) -> Result<T, PipelineError>
where
    F: Future<Output = Result<T, PipelineError>>,
{
    let started = Instant::now();
    let result = fut.await;
    let outcome = match &result {
        Ok(_) => "ok",
        Err(err) => err.kind.as_str(),
    };
    metrics::observe_stage(stage.as_str(), outcome, started.elapsed());
    result
}

fn denial_record(
    ctx: &UserContext,
    request: &QueryRequest,
    trail: &Trail,
    err: &PipelineError,
) -> AuditRecord {
    AuditRecord {
        audit_id: ulid::Ulid::new().to_string(),
        request_id: request.request_id.clone(),
        recorded_at_epoch_ms: unix_epoch_ms_now(),
        identity_id: ctx.identity_id().to_string(),
        tenant_id: ctx.tenant_id().to_string(),
        session_id: ctx.session_id().to_string(),
        sql_hash: trail.sql_hash.clone(),
        row_count: 0,
        redacted_columns: Vec::new(),
        masked_columns: Vec::new(),
        outcome: AuditOutcome::denied(err.stage, err.kind),
    }
}

fn audit_failure_reason(err: AuditError) -> &'static str {
    match err {
        AuditError::Degraded => "degraded",
        AuditError::Backpressure => "backpressure",
        AuditError::Closed => "closed",
        AuditError::WriteFailed => "write_failed",
    }
}
