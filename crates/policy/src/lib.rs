use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::time::Instant;

use qgate_auth::{AuthError, ContextToken, ContextVerifier, UserContext};
use qgate_contracts::{ErrorKind, Operation, SchemaCatalog, SchemaDescriptor, TableSchema, TableView};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::Instrument;

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyDecision {
    pub allow: bool,
    #[serde(default)]
    pub cacheable: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub redaction: Option<Value>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            allow: true,
            cacheable: true,
            reason: None,
            redaction: None,
        }
    }

    pub fn deny(reason: &str) -> Self {
        Self {
            allow: false,
            cacheable: true,
            reason: Some(reason.to_string()),
            redaction: None,
        }
    }
}

/// What the decision interface is asked: principal, resource, action.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyInput {
    pub action: &'static str,
    pub principal: Value,
    pub resource: Value,
}

impl PolicyInput {
    pub fn table(ctx: &UserContext, table: &TableSchema, operation: Operation) -> Self {
        Self {
            action: operation.as_str(),
            principal: ctx.principal_attrs(),
            resource: serde_json::json!({
                "kind": "table",
                "table": table.name.as_str(),
                "tenant_scoped": table.tenant_column.is_some(),
                "columns": table.columns.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            }),
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.principal.get("session_id").and_then(Value::as_str)
    }

    pub fn table_name(&self) -> Option<&str> {
        self.resource.get("table").and_then(Value::as_str)
    }
}

#[derive(Debug)]
pub enum PolicyError {
    Timeout,
    Unavailable(String),
    CircuitOpen,
    InvalidResponse,
}

impl std::fmt::Display for PolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyError::Timeout => write!(f, "policy engine timed out"),
            PolicyError::Unavailable(detail) => write!(f, "policy engine unavailable: {}", detail),
            PolicyError::CircuitOpen => write!(f, "policy engine circuit open"),
            PolicyError::InvalidResponse => write!(f, "policy engine returned invalid response"),
        }
    }
}

impl std::error::Error for PolicyError {}

/// Synchronous allow/deny decision interface.
pub trait PolicyDecider: Send + Sync {
    fn decide(
        &self,
        input: &PolicyInput,
    ) -> impl Future<Output = Result<PolicyDecision, PolicyError>> + Send;
}

/// Decides from the permission strings carried in the verified context.
///
/// `table:<name>:read` grants one table, `table:*:read` grants all. Writes
/// are never granted. Optional per-table denied fields become a redaction.
#[derive(Debug, Clone, Default)]
pub struct LocalPermissionDecider {
    denied_fields: BTreeMap<String, Vec<String>>,
}

impl LocalPermissionDecider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_denied_fields<I, S>(mut self, table: &str, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entry = self.denied_fields.entry(table.to_string()).or_default();
        entry.extend(fields.into_iter().map(Into::into));
        entry.sort();
        entry.dedup();
        self
    }

    fn decide_now(&self, input: &PolicyInput) -> PolicyDecision {
        if input.action != Operation::Read.as_str() {
            return PolicyDecision::deny("read_only");
        }
        let Some(table) = input.table_name() else {
            return PolicyDecision::deny("unknown_resource");
        };

        let permissions = input
            .principal
            .get("permissions")
            .and_then(Value::as_array)
            .map(|perms| perms.iter().filter_map(Value::as_str).collect::<BTreeSet<_>>())
            .unwrap_or_default();

        let wanted = format!("table:{}:read", table);
        if !permissions.contains(wanted.as_str()) && !permissions.contains("table:*:read") {
            return PolicyDecision::deny("missing_permission");
        }

        let mut decision = PolicyDecision::allow();
        if let Some(fields) = self.denied_fields.get(table)
            && !fields.is_empty()
        {
            decision.redaction = Some(serde_json::json!({ "deny_fields": fields }));
        }
        decision
    }
}

impl PolicyDecider for LocalPermissionDecider {
    async fn decide(&self, input: &PolicyInput) -> Result<PolicyDecision, PolicyError> {
        Ok(self.decide_now(input))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldRedaction {
    Allow(Vec<String>),
    Deny(Vec<String>),
}

impl FieldRedaction {
    pub fn keeps(&self, column: &str) -> bool {
        match self {
            FieldRedaction::Allow(fields) => {
                fields.binary_search_by(|f| f.as_str().cmp(column)).is_ok()
            }
            FieldRedaction::Deny(fields) => {
                fields.binary_search_by(|f| f.as_str().cmp(column)).is_err()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseRedactionError {
    message: String,
}

impl ParseRedactionError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ParseRedactionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseRedactionError {}

pub fn parse_field_redaction(
    redaction: Option<&Value>,
) -> Result<Option<FieldRedaction>, ParseRedactionError> {
    let Some(redaction) = redaction else {
        return Ok(None);
    };
    let Some(obj) = redaction.as_object() else {
        return Err(ParseRedactionError::new("redaction must be an object"));
    };
    if obj.is_empty() {
        return Ok(None);
    }

    let allow_fields = parse_fields(obj, "allow_fields")?;
    let deny_fields = parse_fields(obj, "deny_fields")?;

    match (allow_fields, deny_fields) {
        (Some(_), Some(_)) => Err(ParseRedactionError::new(
            "redaction cannot specify both allow_fields and deny_fields",
        )),
        (Some(fields), None) => Ok(Some(FieldRedaction::Allow(fields))),
        (None, Some(fields)) => Ok(Some(FieldRedaction::Deny(fields))),
        (None, None) => Ok(None),
    }
}

fn parse_fields(
    obj: &Map<String, Value>,
    key: &str,
) -> Result<Option<Vec<String>>, ParseRedactionError> {
    let Some(value) = obj.get(key) else {
        return Ok(None);
    };
    let Some(arr) = value.as_array() else {
        return Err(ParseRedactionError::new(format!(
            "redaction `{}` must be an array",
            key
        )));
    };

    let mut out = arr
        .iter()
        .map(|raw| {
            raw.as_str()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or_else(|| {
                    ParseRedactionError::new(format!("redaction `{}` must be a string array", key))
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    out.sort();
    out.dedup();
    Ok((!out.is_empty()).then_some(out))
}

#[derive(Debug)]
pub enum GateError {
    Authentication(AuthError),
    PolicyUnavailable(PolicyError),
    InvalidDecision(ParseRedactionError),
}

impl GateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GateError::Authentication(_) => ErrorKind::Authentication,
            GateError::PolicyUnavailable(PolicyError::Timeout) => ErrorKind::Timeout,
            GateError::PolicyUnavailable(_) => ErrorKind::Unavailable,
            GateError::InvalidDecision(_) => ErrorKind::Authorization,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GateError::Authentication(err) => err.code,
            GateError::PolicyUnavailable(PolicyError::Timeout) => "ERR_POLICY_TIMEOUT",
            GateError::PolicyUnavailable(_) => "ERR_POLICY_UNAVAILABLE",
            GateError::InvalidDecision(_) => "ERR_POLICY_INVALID_DECISION",
        }
    }
}

impl std::fmt::Display for GateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateError::Authentication(err) => write!(f, "{}", err),
            GateError::PolicyUnavailable(err) => write!(f, "{}", err),
            GateError::InvalidDecision(err) => write!(f, "invalid policy decision: {}", err),
        }
    }
}

impl std::error::Error for GateError {}

/// Filters the schema per identity and answers per-table access checks.
///
/// Every call verifies the context token itself; a context handed over by an
/// earlier stage is never trusted.
#[derive(Clone)]
pub struct AuthorizationGate<D> {
    verifier: ContextVerifier,
    decider: D,
}

impl<D: PolicyDecider> AuthorizationGate<D> {
    pub fn new(verifier: ContextVerifier, decider: D) -> Self {
        Self { verifier, decider }
    }

    pub fn decider(&self) -> &D {
        &self.decider
    }

    /// Tables the identity may not read are dropped; withheld columns are
    /// moved to `hidden_columns`. Any decision failure fails the whole call.
    pub async fn filter_schema(
        &self,
        token: &ContextToken,
        catalog: &SchemaCatalog,
    ) -> Result<SchemaDescriptor, GateError> {
        let ctx = self.verifier.verify(token).map_err(GateError::Authentication)?;

        let mut descriptor = SchemaDescriptor::default();
        for table in &catalog.tables {
            let input = PolicyInput::table(&ctx, table, Operation::Read);
            let decision = self.evaluate(&ctx, &input).await.map_err(GateError::PolicyUnavailable)?;
            if !decision.allow {
                continue;
            }

            let redaction = parse_field_redaction(decision.redaction.as_ref())
                .map_err(GateError::InvalidDecision)?;
            let (columns, hidden_columns) = match redaction {
                None => (table.columns.clone(), Vec::new()),
                Some(rule) => {
                    let (kept, hidden): (Vec<_>, Vec<_>) =
                        table.columns.iter().cloned().partition(|c| rule.keeps(&c.name));
                    (kept, hidden.into_iter().map(|c| c.name).collect())
                }
            };

            descriptor.tables.insert(
                table.name.clone(),
                TableView {
                    columns,
                    hidden_columns,
                    operations: BTreeSet::from([Operation::Read]),
                    tenant_column: table.tenant_column.clone(),
                },
            );
        }

        Ok(descriptor)
    }

    /// Independent re-check used at validation time. Anything other than an
    /// explicit allow is `false`.
    pub async fn check_access(
        &self,
        token: &ContextToken,
        catalog: &SchemaCatalog,
        table: &str,
        operation: Operation,
    ) -> bool {
        let Ok(ctx) = self.verifier.verify(token) else {
            return false;
        };
        if operation != Operation::Read {
            return false;
        }
        let Some(schema) = catalog.table(table) else {
            return false;
        };

        let input = PolicyInput::table(&ctx, schema, operation);
        match self.evaluate(&ctx, &input).await {
            Ok(decision) => decision.allow,
            Err(err) => {
                tracing::warn!(table, error = %err, "policy.check_access_failed");
                false
            }
        }
    }

    async fn evaluate(
        &self,
        ctx: &UserContext,
        input: &PolicyInput,
    ) -> Result<PolicyDecision, PolicyError> {
        let span = tracing::info_span!(
            "policy.evaluate",
            session_id = %ctx.session_id(),
            identity_id = %ctx.identity_id(),
            action = input.action,
            table = input.table_name().unwrap_or(""),
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async {
            let started = Instant::now();
            let decision = self.decider.decide(input).await;

            let latency_ms = started.elapsed().as_millis() as u64;
            tracing::Span::current().record("latency_ms", latency_ms);
            match &decision {
                Ok(decision) => {
                    let outcome = if decision.allow { "allow" } else { "deny" };
                    tracing::Span::current().record("outcome", outcome);
                }
                Err(_) => {
                    tracing::Span::current().record("outcome", "error");
                }
            }
            decision
        }
        .instrument(span)
        .await
    }
}
