use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub mod canonical;

/// One result row: column name to value, in projection order.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Pipeline stages in their fixed execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ContextVerifier,
    InputGuardrail,
    AuthorizationGate,
    SqlValidator,
    ExecutionSandbox,
    OutputSanitizer,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::ContextVerifier,
        Stage::InputGuardrail,
        Stage::AuthorizationGate,
        Stage::SqlValidator,
        Stage::ExecutionSandbox,
        Stage::OutputSanitizer,
    ];

    pub fn number(self) -> u8 {
        match self {
            Stage::ContextVerifier => 1,
            Stage::InputGuardrail => 2,
            Stage::AuthorizationGate => 3,
            Stage::SqlValidator => 4,
            Stage::ExecutionSandbox => 5,
            Stage::OutputSanitizer => 6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::ContextVerifier => "context_verifier",
            Stage::InputGuardrail => "input_guardrail",
            Stage::AuthorizationGate => "authorization_gate",
            Stage::SqlValidator => "sql_validator",
            Stage::ExecutionSandbox => "execution_sandbox",
            Stage::OutputSanitizer => "output_sanitizer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Authentication,
    InputRejected,
    Authorization,
    SqlValidation,
    Execution,
    Sanitization,
    Timeout,
    Unavailable,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Authentication => "AUTHENTICATION",
            ErrorKind::InputRejected => "INPUT_REJECTED",
            ErrorKind::Authorization => "AUTHORIZATION",
            ErrorKind::SqlValidation => "SQL_VALIDATION",
            ErrorKind::Execution => "EXECUTION",
            ErrorKind::Sanitization => "SANITIZATION",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Unavailable => "UNAVAILABLE",
        }
    }

    /// The only text a caller ever sees for a failure of this kind.
    pub fn public_message(self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication failed",
            ErrorKind::InputRejected => "input rejected",
            ErrorKind::Authorization => "not authorized",
            ErrorKind::SqlValidation => "query rejected",
            ErrorKind::Execution => "query execution failed",
            ErrorKind::Sanitization => "result could not be sanitized",
            ErrorKind::Timeout => "request deadline exceeded",
            ErrorKind::Unavailable => "service unavailable",
        }
    }

    pub fn retryable(self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::Unavailable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    #[default]
    Public,
    Pii,
    Credential,
    GovernmentId,
}

impl Sensitivity {
    /// Columns with these tags are replaced wholesale, whatever they contain.
    pub fn is_structurally_redacted(self) -> bool {
        matches!(self, Sensitivity::Credential | Sensitivity::GovernmentId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Read,
    Write,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub sensitivity: Sensitivity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableSchema {
    pub name: String,
    /// Column carrying the tenant id; `None` for tables shared by all tenants.
    #[serde(default)]
    pub tenant_column: Option<String>,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// The full database schema as configured; never shown to the agent as-is.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaCatalog {
    pub tables: Vec<TableSchema>,
}

impl SchemaCatalog {
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn validate(&self) -> Result<(), String> {
        let mut seen_tables = BTreeSet::new();
        for table in &self.tables {
            if !is_plain_identifier(&table.name) {
                return Err(format!("table name `{}` is not a plain identifier", table.name));
            }
            if !seen_tables.insert(table.name.as_str()) {
                return Err(format!("table `{}` is declared twice", table.name));
            }
            if table.columns.is_empty() {
                return Err(format!("table `{}` has no columns", table.name));
            }

            let mut seen_columns = BTreeSet::new();
            for column in &table.columns {
                if !is_plain_identifier(&column.name) {
                    return Err(format!(
                        "column `{}.{}` is not a plain identifier",
                        table.name, column.name
                    ));
                }
                if !seen_columns.insert(column.name.as_str()) {
                    return Err(format!(
                        "column `{}.{}` is declared twice",
                        table.name, column.name
                    ));
                }
            }

            if let Some(tenant_column) = table.tenant_column.as_deref()
                && !seen_columns.contains(tenant_column)
            {
                return Err(format!(
                    "tenant column `{}` is not a column of `{}`",
                    tenant_column, table.name
                ));
            }
        }
        Ok(())
    }
}

/// Lowercase ASCII identifier as Postgres folds unquoted names.
pub fn is_plain_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_lowercase() || first == '_')
        && s.len() <= 63
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableView {
    pub columns: Vec<ColumnSchema>,
    /// Columns that exist but the policy withheld from this identity.
    pub hidden_columns: Vec<String>,
    pub operations: BTreeSet<Operation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_column: Option<String>,
}

impl TableView {
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn is_hidden(&self, column: &str) -> bool {
        self.hidden_columns.iter().any(|c| c == column)
    }

    /// Columns the validator and sanitizer treat as protected.
    pub fn protected_columns(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|c| c.sensitivity.is_structurally_redacted())
            .map(|c| c.name.as_str())
            .chain(self.hidden_columns.iter().map(String::as_str))
    }

    pub fn has_protected_columns(&self) -> bool {
        self.protected_columns().next().is_some()
    }
}

/// Per-request view of the schema, filtered for one identity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub tables: BTreeMap<String, TableView>,
}

impl SchemaDescriptor {
    pub fn table(&self, name: &str) -> Option<&TableView> {
        self.tables.get(name)
    }

    pub fn allowed_tables(&self) -> BTreeSet<String> {
        self.tables
            .iter()
            .filter(|(_, view)| view.operations.contains(&Operation::Read))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Shape handed to the external agent: names, types, and tenant scoping only.
    pub fn agent_view(&self) -> serde_json::Value {
        let tables = self
            .tables
            .iter()
            .map(|(name, view)| {
                let columns = view
                    .columns
                    .iter()
                    .map(|c| serde_json::json!({ "name": c.name, "type": c.data_type }))
                    .collect::<Vec<_>>();
                (name.clone(), serde_json::json!({ "columns": columns }))
            })
            .collect::<serde_json::Map<_, _>>();
        serde_json::json!({ "tables": tables })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Accepted,
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedQuery {
    pub original_sql: String,
    pub rewritten_sql: String,
    pub tables: BTreeSet<String>,
    pub verdict: Verdict,
}

impl ValidatedQuery {
    pub fn is_accepted(&self) -> bool {
        self.verdict == Verdict::Accepted
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub rows: Vec<Row>,
    pub estimated_cost: f64,
    pub row_count: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Denied { stage: u8, kind: ErrorKind },
}

impl AuditOutcome {
    pub fn denied(stage: Stage, kind: ErrorKind) -> Self {
        AuditOutcome::Denied {
            stage: stage.number(),
            kind,
        }
    }

    pub fn label(self) -> String {
        match self {
            AuditOutcome::Success => "success".to_string(),
            AuditOutcome::Denied { stage, .. } => format!("denied_at_stage_{}", stage),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub audit_id: String,
    pub request_id: String,
    pub recorded_at_epoch_ms: i64,
    pub identity_id: String,
    pub tenant_id: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql_hash: Option<String>,
    pub row_count: u64,
    pub redacted_columns: Vec<String>,
    pub masked_columns: Vec<String>,
    pub outcome: AuditOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> SchemaCatalog {
        serde_json::from_value(serde_json::json!({
            "tables": [
                {
                    "name": "customers",
                    "tenant_column": "tenant_id",
                    "columns": [
                        {"name": "id", "data_type": "bigint"},
                        {"name": "tenant_id", "data_type": "text"},
                        {"name": "email", "data_type": "text", "sensitivity": "pii"},
                        {"name": "ssn", "data_type": "text", "sensitivity": "government_id"}
                    ]
                }
            ]
        }))
        .expect("catalog should deserialize")
    }

    #[test]
    fn stages_are_numbered_in_pipeline_order() {
        let numbers = Stage::ALL.iter().map(|s| s.number()).collect::<Vec<_>>();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn catalog_validate_accepts_well_formed_schema() {
        catalog().validate().expect("catalog should be valid");
    }

    #[test]
    fn catalog_validate_rejects_unknown_tenant_column() {
        let mut catalog = catalog();
        catalog.tables[0].tenant_column = Some("org_id".to_string());
        let err = catalog.validate().unwrap_err();
        assert!(err.contains("tenant column"));
    }

    #[test]
    fn catalog_validate_rejects_duplicate_columns_and_quoted_names() {
        let mut dup = catalog();
        dup.tables[0].columns.push(ColumnSchema {
            name: "id".to_string(),
            data_type: "bigint".to_string(),
            sensitivity: Sensitivity::Public,
        });
        assert!(dup.validate().unwrap_err().contains("declared twice"));

        let mut mixed_case = catalog();
        mixed_case.tables[0].name = "Customers".to_string();
        assert!(
            mixed_case
                .validate()
                .unwrap_err()
                .contains("plain identifier")
        );
    }

    #[test]
    fn protected_columns_include_hidden_and_structural() {
        let table = catalog().tables.remove(0);
        let view = TableView {
            columns: table.columns,
            hidden_columns: vec!["notes".to_string()],
            operations: BTreeSet::from([Operation::Read]),
            tenant_column: table.tenant_column,
        };
        let protected = view.protected_columns().collect::<Vec<_>>();
        assert_eq!(protected, vec!["ssn", "notes"]);
    }

    #[test]
    fn audit_outcome_serializes_stage_number() {
        let outcome = AuditOutcome::denied(Stage::ExecutionSandbox, ErrorKind::Execution);
        assert_eq!(
            serde_json::to_value(outcome).expect("outcome should serialize"),
            serde_json::json!({"status": "denied", "stage": 5, "kind": "EXECUTION"})
        );
        assert_eq!(outcome.label(), "denied_at_stage_5");
    }

    #[test]
    fn agent_view_omits_sensitivity_tags() {
        let table = catalog().tables.remove(0);
        let descriptor = SchemaDescriptor {
            tables: BTreeMap::from([(
                "customers".to_string(),
                TableView {
                    columns: table.columns,
                    hidden_columns: Vec::new(),
                    operations: BTreeSet::from([Operation::Read]),
                    tenant_column: table.tenant_column,
                },
            )]),
        };
        let view = descriptor.agent_view();
        assert!(!view.to_string().contains("government_id"));
        assert!(view.to_string().contains("\"email\""));
    }
}
