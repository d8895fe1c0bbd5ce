use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use qgate_auth::{ContextVerifier, bearer_token};
use qgate_contracts::{ErrorKind, Stage};
use qgate_ledger::{AuditQueue, AuditQueueConfig, LedgerWriter};
use qgate_policy::{AuthorizationGate, LocalPermissionDecider};
use qgate_sql::{SqlValidator, ValidatorConfig};
use serde::{Deserialize, Serialize};
use sha2::Digest;
use ulid::Ulid;

use crate::agent::HttpAgentClient;
use crate::config::{GatewayConfig, PolicyMode, StartupError};
use crate::guardrail::{GuardrailConfig, HeuristicClassifier, InputGuardrail};
use crate::opa::{OpaClient, OpaClientConfig, PolicyBackend};
use crate::pipeline::{Pipeline, PipelineError, PipelineParts, QueryRequest, QueryResponse};
use crate::rate_limit::RateLimiter;
use crate::sandbox::{ExecutionSandbox, PgBackend, QueryBackend, SandboxConfig};

const RATE_LIMIT_MAX_IDENTITIES: usize = 16_384;
const READY_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

pub type GatewayPipeline = Pipeline<PolicyBackend, HttpAgentClient, PgBackend>;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pipeline: Arc<GatewayPipeline>,
    ledger: LedgerWriter,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub async fn router(config: GatewayConfig) -> Result<Router, StartupError> {
    let verifier = ContextVerifier::new(config.verifier_config()).map_err(|err| StartupError {
        code: err.code,
        message: err.message,
    })?;

    let ledger = LedgerWriter::connect_and_migrate(
        &config.ledger_db_url,
        Duration::from_millis(config.ledger_write_timeout_ms),
    )
    .await
    .map_err(|err| StartupError {
        code: "ERR_LEDGER_UNAVAILABLE",
        message: format!("failed to initialize audit ledger: {}", err),
    })?;

    let backend = PgBackend::connect(
        &config.db_url,
        config.sandbox_pool_max_connections,
        Duration::from_millis(config.request_timeout_ms),
    )
    .await
    .map_err(|_| StartupError {
        code: "ERR_DB_UNAVAILABLE",
        message: "failed to initialize sandbox database pool".to_string(),
    })?;

    let policy = match config.policy_mode {
        PolicyMode::Local => {
            let decider = config
                .policy_deny_fields
                .iter()
                .fold(LocalPermissionDecider::new(), |decider, (table, fields)| {
                    decider.with_denied_fields(table, fields.iter().cloned())
                });
            PolicyBackend::Local(decider)
        }
        PolicyMode::Opa => {
            let base_url = config.opa_url.clone().ok_or_else(|| StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "opa policy mode requires QGATE_OPA_URL".to_string(),
            })?;
            let client = OpaClient::new(OpaClientConfig {
                base_url,
                timeout: Duration::from_millis(config.opa_timeout_ms),
                cache_max_entries: config.policy_cache_max_entries,
                cache_ttl: Duration::from_millis(config.policy_cache_ttl_ms),
                retry_max_attempts: config.opa_retry_max_attempts,
                retry_base_backoff: Duration::from_millis(config.opa_retry_base_backoff_ms),
                circuit_breaker_failure_threshold: config.opa_circuit_breaker_failure_threshold,
                circuit_breaker_open_for: Duration::from_millis(config.opa_circuit_breaker_open_ms),
            })
            .map_err(|_| StartupError {
                code: "ERR_OPA_UNAVAILABLE",
                message: "failed to initialize policy client".to_string(),
            })?;
            PolicyBackend::Opa(client)
        }
    };

    let agent = HttpAgentClient::new(
        config.agent_url.clone(),
        Duration::from_millis(config.agent_timeout_ms),
    )
    .map_err(|_| StartupError {
        code: "ERR_AGENT_CLIENT",
        message: "failed to initialize agent client".to_string(),
    })?;

    let (audit, _writer) = AuditQueue::spawn(
        ledger.clone(),
        AuditQueueConfig {
            capacity: config.audit_queue_capacity,
            retry_max_attempts: config.audit_retry_max_attempts,
            retry_base_backoff: Duration::from_millis(config.audit_retry_base_backoff_ms),
            degrade_after_failures: config.audit_degrade_after_failures,
            ..AuditQueueConfig::default()
        },
    );

    let guardrail = InputGuardrail::new(
        GuardrailConfig {
            max_length: config.input_max_length,
            classifier_threshold: config.classifier_threshold,
        },
        HeuristicClassifier,
        RateLimiter::new(
            Duration::from_secs(config.rate_limit_window_secs.max(1)),
            config.rate_limit_requests_per_window,
            RATE_LIMIT_MAX_IDENTITIES,
        ),
        verifier.clone(),
    );

    let sandbox = ExecutionSandbox::new(
        backend,
        SandboxConfig {
            read_only: true,
            statement_timeout: Duration::from_millis(config.sandbox_statement_timeout_ms),
            max_rows: config.sandbox_max_rows,
            max_estimated_cost: config.sandbox_max_estimated_cost,
        },
        verifier.clone(),
    )
    .with_tenant_isolation(config.tenant_isolation.clone());

    let pipeline = Pipeline::new(PipelineParts {
        verifier: verifier.clone(),
        guardrail,
        gate: AuthorizationGate::new(verifier.clone(), policy),
        catalog: config.schema.clone(),
        validator: SqlValidator::new(
            ValidatorConfig {
                max_subquery_depth: config.max_subquery_depth,
            },
            verifier,
        ),
        agent,
        sandbox,
        audit,
        settings: config.pipeline_settings(),
    });

    let state = AppState {
        config: Arc::new(config),
        pipeline: Arc::new(pipeline),
        ledger,
    };

    Ok(Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/query", post(query))
        .route("/v1/tokens", post(issue_token))
        .with_state(state))
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();

    let sandbox_ready = tokio::time::timeout(
        READY_PROBE_TIMEOUT,
        state.pipeline.sandbox().backend().ping(),
    )
    .await
    .unwrap_or(false);
    checks.insert("sandbox_db", sandbox_ready);

    let ledger_ready = state.ledger.ping().await.is_ok();
    checks.insert("ledger", ledger_ready);

    let policy_ready = tokio::time::timeout(
        READY_PROBE_TIMEOUT,
        state.pipeline.gate().decider().ready(),
    )
    .await
    .unwrap_or(false);
    checks.insert("policy", policy_ready);

    checks.insert("audit_queue", !state.pipeline.audit_queue().is_degraded());

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

async fn metrics() -> impl IntoResponse {
    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct QueryBody {
    input: String,
}

async fn query(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<QueryBody>, JsonRejection>,
) -> Response {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);
    let result = run_query(&state, &headers, request_id.clone(), req).await;

    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err((status, _)) => *status,
    };
    crate::metrics::observe_http_request(
        "/v1/query",
        "POST",
        status.as_u16(),
        started.elapsed(),
    );

    let mut response = match result {
        Ok(body) => Json(body).into_response(),
        Err((status, Json(body))) => {
            let retry_after = body.retry_after_secs;
            let mut response = (status, Json(body)).into_response();
            if let Some(secs) = retry_after
                && let Ok(value) = HeaderValue::from_str(secs.to_string().as_str())
            {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
    };
    if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
        response.headers_mut().insert("x-qgate-request-id", value);
    }
    response
}

async fn run_query(
    state: &AppState,
    headers: &HeaderMap,
    request_id: String,
    req: Result<Json<QueryBody>, JsonRejection>,
) -> Result<QueryResponse, ApiError> {
    let token = bearer_token(headers).map_err(|err| {
        stage_error(
            Stage::ContextVerifier,
            ErrorKind::Authentication,
            err.code,
        )
    })?;

    let Json(body) = req.map_err(|_| {
        stage_error(
            Stage::InputGuardrail,
            ErrorKind::InputRejected,
            "ERR_INVALID_PARAMS",
        )
    })?;

    let timeout = request_timeout(headers, state.config.request_timeout_ms);
    let request = QueryRequest {
        request_id,
        token,
        input: body.input,
        deadline: tokio::time::Instant::now() + timeout,
    };

    state
        .pipeline
        .run(&request)
        .await
        .map_err(|err| pipeline_error_response(&err))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IssueTokenBody {
    identity_id: String,
    tenant_id: String,
    #[serde(default)]
    permissions: Vec<String>,
    #[serde(default)]
    ttl_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
struct IssueTokenResponse {
    token: String,
    expires_in_secs: u64,
}

async fn issue_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<IssueTokenBody>, JsonRejection>,
) -> Result<Json<IssueTokenResponse>, ApiError> {
    let started = Instant::now();
    let result = issue_token_inner(&state, &headers, req);

    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err((status, _)) => *status,
    };
    crate::metrics::observe_http_request(
        "/v1/tokens",
        "POST",
        status.as_u16(),
        started.elapsed(),
    );
    result
}

fn issue_token_inner(
    state: &AppState,
    headers: &HeaderMap,
    req: Result<Json<IssueTokenBody>, JsonRejection>,
) -> Result<Json<IssueTokenResponse>, ApiError> {
    let Some(expected) = state.config.issuer_secret.as_deref() else {
        return Err(json_error(
            StatusCode::NOT_FOUND,
            "ERR_NOT_FOUND",
            "token issuance is disabled",
        ));
    };
    validate_issuer_secret(headers, expected)?;

    let Json(body) = req.map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PARAMS",
            "invalid JSON body",
        )
    })?;

    let ttl_secs = body.ttl_secs.unwrap_or(state.config.token_max_ttl_secs);
    let token = state
        .pipeline
        .verifier()
        .issue(
            body.identity_id.as_str(),
            body.tenant_id.as_str(),
            body.permissions,
            Duration::from_secs(ttl_secs),
        )
        .map_err(|err| json_error(StatusCode::BAD_REQUEST, err.code, err.message))?;

    tracing::info!(
        identity_id = %body.identity_id,
        tenant_id = %body.tenant_id,
        ttl_secs,
        "token.issued"
    );

    Ok(Json(IssueTokenResponse {
        token: token.as_str().to_string(),
        expires_in_secs: ttl_secs,
    }))
}

fn validate_issuer_secret(headers: &HeaderMap, expected: &str) -> Result<(), ApiError> {
    let provided = headers
        .get("x-qgate-issuer-secret")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            json_error(
                StatusCode::UNAUTHORIZED,
                "ERR_AUTH_REQUIRED",
                "missing issuer secret",
            )
        })?;

    if !digests_match(provided, expected) {
        return Err(json_error(
            StatusCode::UNAUTHORIZED,
            "ERR_AUTH_INVALID",
            "invalid issuer secret",
        ));
    }
    Ok(())
}

/// Compares SHA-256 digests so the comparison time does not depend on where
/// the inputs first differ.
fn digests_match(provided: &str, expected: &str) -> bool {
    let a = sha2::Sha256::digest(provided.as_bytes());
    let b = sha2::Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// `x-qgate-deadline-ms` may shorten the configured timeout, never extend it.
fn request_timeout(headers: &HeaderMap, max_ms: u64) -> Duration {
    let requested = headers
        .get("x-qgate-deadline-ms")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(max_ms);
    Duration::from_millis(requested.min(max_ms))
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-qgate-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audit_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
}

fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            code: code.into(),
            message: message.into(),
            retryable: false,
            stage: None,
            kind: None,
            table: None,
            audit_id: None,
            retry_after_secs: None,
        }),
    )
}

fn stage_error(stage: Stage, kind: ErrorKind, code: &str) -> ApiError {
    let (status, Json(mut body)) = json_error(status_for(kind, code), code, kind.public_message());
    body.stage = Some(stage.number());
    body.kind = Some(kind);
    body.retryable = kind.retryable();
    (status, Json(body))
}

/// Callers get the stage, the kind and a generic message. Internal detail
/// stays in the logs.
fn pipeline_error_response(err: &PipelineError) -> ApiError {
    let (status, Json(mut body)) = stage_error(err.stage, err.kind, err.code);
    if err.kind == ErrorKind::Authorization {
        body.table = err.table.clone();
    }
    body.audit_id = err.audit_id.clone();
    if let Some(retry_after) = err.retry_after {
        body.retryable = true;
        body.retry_after_secs = Some(retry_after.as_secs_f64().ceil().max(1.0) as u64);
    }
    (status, Json(body))
}

fn status_for(kind: ErrorKind, code: &str) -> StatusCode {
    match kind {
        ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
        ErrorKind::InputRejected if code == "ERR_RATE_LIMITED" => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::InputRejected => StatusCode::BAD_REQUEST,
        ErrorKind::Authorization => StatusCode::FORBIDDEN,
        ErrorKind::SqlValidation | ErrorKind::Execution => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Sanitization => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}
