//! Stage 6: structural redaction of protected columns, value masking of
//! everything else, and the audit record for the request.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use qgate_auth::{AuthError, ContextToken, ContextVerifier, UserContext};
use qgate_contracts::{AuditOutcome, AuditRecord, ErrorKind, Row, SchemaDescriptor};
use regex::{Captures, Regex};
use serde_json::Value;

pub const REDACTED: &str = "[REDACTED]";
pub const EMAIL_MASK: &str = "***@***.***";
pub const NATIONAL_ID_MASK: &str = "***-**-****";
pub const PHONE_MASK: &str = "***-***-****";
pub const CARD_MASK: &str = "****-****-****-****";

static CARD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:\d[ -]?){12,18}\d\b").expect("invalid card pattern"));
static NATIONAL_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("invalid national id pattern"));
static PHONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\+\d{1,3}[ .-]?)?(?:\(\d{3}\)|\b\d{3})[ .-]?\d{3}[ .-]\d{4}\b")
        .expect("invalid phone pattern")
});
static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("invalid email pattern")
});

#[derive(Debug)]
pub enum SanitizationError {
    Authentication(AuthError),
    /// A referenced table has no entry in the request's descriptor.
    UnknownTable(String),
}

impl SanitizationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SanitizationError::Authentication(_) => ErrorKind::Authentication,
            SanitizationError::UnknownTable(_) => ErrorKind::Sanitization,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            SanitizationError::Authentication(err) => err.code,
            SanitizationError::UnknownTable(_) => "ERR_SANITIZATION_SCHEMA",
        }
    }
}

impl std::fmt::Display for SanitizationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SanitizationError::Authentication(err) => write!(f, "{}", err),
            SanitizationError::UnknownTable(table) => {
                write!(f, "no column metadata for table {}", table)
            }
        }
    }
}

impl std::error::Error for SanitizationError {}

#[derive(Debug, Clone, Copy)]
pub struct SanitizeScope<'a> {
    pub descriptor: &'a SchemaDescriptor,
    pub tables: &'a BTreeSet<String>,
    pub request_id: &'a str,
    pub sql_hash: &'a str,
}

#[derive(Clone)]
pub struct OutputSanitizer {
    verifier: ContextVerifier,
}

impl OutputSanitizer {
    pub fn new(verifier: ContextVerifier) -> Self {
        Self { verifier }
    }

    /// Returns the cleaned rows and the success audit record for them.
    pub fn sanitize(
        &self,
        token: &ContextToken,
        rows: Vec<Row>,
        scope: &SanitizeScope<'_>,
    ) -> Result<(Vec<Row>, AuditRecord), SanitizationError> {
        let ctx = self
            .verifier
            .verify(token)
            .map_err(SanitizationError::Authentication)?;

        let protected = protected_columns(scope.descriptor, scope.tables)?;
        let mut redacted_columns = BTreeSet::new();
        let mut masked_columns = BTreeSet::new();

        let rows = rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|(column, value)| {
                        if protected.contains(column.as_str()) {
                            redacted_columns.insert(column.clone());
                            return (column, Value::String(REDACTED.to_string()));
                        }
                        let (value, masked) = mask_value(value);
                        if masked {
                            masked_columns.insert(column.clone());
                        }
                        (column, value)
                    })
                    .collect::<Row>()
            })
            .collect::<Vec<_>>();

        let record = audit_record(
            &ctx,
            scope,
            rows.len() as u64,
            redacted_columns.into_iter().collect(),
            masked_columns.into_iter().collect(),
        );
        Ok((rows, record))
    }
}

fn protected_columns<'a>(
    descriptor: &'a SchemaDescriptor,
    tables: &BTreeSet<String>,
) -> Result<BTreeSet<&'a str>, SanitizationError> {
    let mut out = BTreeSet::new();
    for table in tables {
        let view = descriptor
            .table(table)
            .ok_or_else(|| SanitizationError::UnknownTable(table.clone()))?;
        out.extend(view.protected_columns());
    }
    Ok(out)
}

fn audit_record(
    ctx: &UserContext,
    scope: &SanitizeScope<'_>,
    row_count: u64,
    redacted_columns: Vec<String>,
    masked_columns: Vec<String>,
) -> AuditRecord {
    AuditRecord {
        audit_id: ulid::Ulid::new().to_string(),
        request_id: scope.request_id.to_string(),
        recorded_at_epoch_ms: unix_epoch_ms_now(),
        identity_id: ctx.identity_id().to_string(),
        tenant_id: ctx.tenant_id().to_string(),
        session_id: ctx.session_id().to_string(),
        sql_hash: Some(scope.sql_hash.to_string()),
        row_count,
        redacted_columns,
        masked_columns,
        outcome: AuditOutcome::Success,
    }
}

pub fn unix_epoch_ms_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

/// Masks strings anywhere inside `value`; reports whether anything changed.
pub fn mask_value(value: Value) -> (Value, bool) {
    match value {
        Value::String(text) => match mask_text(&text) {
            Some(masked) => (Value::String(masked), true),
            None => (Value::String(text), false),
        },
        Value::Array(items) => {
            let mut any = false;
            let items = items
                .into_iter()
                .map(|item| {
                    let (item, masked) = mask_value(item);
                    any |= masked;
                    item
                })
                .collect();
            (Value::Array(items), any)
        }
        Value::Object(map) => {
            let mut any = false;
            let map = map
                .into_iter()
                .map(|(k, v)| {
                    let (v, masked) = mask_value(v);
                    any |= masked;
                    (k, v)
                })
                .collect();
            (Value::Object(map), any)
        }
        other => (other, false),
    }
}

/// `None` when the text contains nothing to mask.
pub fn mask_text(text: &str) -> Option<String> {
    let carded = CARD.replace_all(text, |caps: &Captures<'_>| {
        if luhn_valid(&caps[0]) {
            CARD_MASK.to_string()
        } else {
            caps[0].to_string()
        }
    });
    let national = NATIONAL_ID.replace_all(&carded, NATIONAL_ID_MASK);
    let phoned = PHONE.replace_all(&national, PHONE_MASK);
    let emailed = EMAIL.replace_all(&phoned, EMAIL_MASK);

    (emailed != text).then(|| emailed.into_owned())
}

fn luhn_valid(candidate: &str) -> bool {
    let digits = candidate
        .chars()
        .filter_map(|c| c.to_digit(10))
        .collect::<Vec<_>>();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }

    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(idx, d)| {
            if idx % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                *d
            }
        })
        .sum();
    sum % 10 == 0
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use qgate_auth::VerifierConfig;
    use qgate_contracts::{ColumnSchema, Operation, Sensitivity, TableView};

    use super::*;

    fn verifier() -> ContextVerifier {
        ContextVerifier::new(VerifierConfig {
            secret: b"0123456789abcdef0123456789abcdef-test".to_vec(),
            issuer: "qgate".to_string(),
            audience: "qgate-gateway".to_string(),
            max_ttl: Duration::from_secs(900),
        })
        .expect("verifier should build")
    }

    fn column(name: &str, sensitivity: Sensitivity) -> ColumnSchema {
        ColumnSchema {
            name: name.to_string(),
            data_type: "text".to_string(),
            sensitivity,
        }
    }

    fn descriptor() -> SchemaDescriptor {
        SchemaDescriptor {
            tables: BTreeMap::from([(
                "customers".to_string(),
                TableView {
                    columns: vec![
                        column("id", Sensitivity::Public),
                        column("tenant_id", Sensitivity::Public),
                        column("email", Sensitivity::Pii),
                        column("ssn", Sensitivity::GovernmentId),
                        column("api_token", Sensitivity::Credential),
                    ],
                    hidden_columns: vec!["notes".to_string()],
                    operations: [Operation::Read].into_iter().collect(),
                    tenant_column: Some("tenant_id".to_string()),
                },
            )]),
        }
    }

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("row fixture must be an object"),
        }
    }

    fn sanitize(rows: Vec<Row>) -> Result<(Vec<Row>, AuditRecord), SanitizationError> {
        let verifier = verifier();
        let token = verifier
            .issue("alice", "acme", ["table:customers:read"], Duration::from_secs(60))
            .expect("token should issue");
        let descriptor = descriptor();
        let tables = BTreeSet::from(["customers".to_string()]);
        OutputSanitizer::new(verifier).sanitize(
            &token,
            rows,
            &SanitizeScope {
                descriptor: &descriptor,
                tables: &tables,
                request_id: "req-1",
                sql_hash: "abc",
            },
        )
    }

    #[test]
    fn email_is_masked_and_listed_in_audit() {
        let (rows, record) =
            sanitize(vec![row(serde_json::json!({"id": 5, "email": "jane.doe@example.com"}))])
                .expect("sanitize should succeed");

        assert_eq!(rows[0]["email"], serde_json::json!(EMAIL_MASK));
        assert_eq!(rows[0]["id"], serde_json::json!(5));
        assert_eq!(record.masked_columns, vec!["email".to_string()]);
        assert!(record.redacted_columns.is_empty());
        assert_eq!(record.outcome, AuditOutcome::Success);
        assert_eq!(record.identity_id, "alice");
        assert_eq!(record.tenant_id, "acme");
        assert_eq!(record.row_count, 1);
    }

    #[test]
    fn protected_columns_are_replaced_whatever_they_hold() {
        let (rows, record) = sanitize(vec![
            row(serde_json::json!({"ssn": "123-45-6789", "api_token": null, "notes": 42})),
            row(serde_json::json!({"ssn": "n/a", "api_token": {"k": "v"}, "notes": "plain"})),
        ])
        .expect("sanitize should succeed");

        for row in &rows {
            for column in ["ssn", "api_token", "notes"] {
                assert_eq!(row[column], serde_json::json!(REDACTED), "{column} not redacted");
            }
        }
        assert_eq!(
            record.redacted_columns,
            vec!["api_token".to_string(), "notes".to_string(), "ssn".to_string()]
        );
        assert!(record.masked_columns.is_empty());
    }

    #[test]
    fn audit_record_is_produced_without_redactions() {
        let (rows, record) = sanitize(Vec::new()).expect("sanitize should succeed");
        assert!(rows.is_empty());
        assert_eq!(record.row_count, 0);
        assert_eq!(record.sql_hash.as_deref(), Some("abc"));
        assert_eq!(record.request_id, "req-1");
    }

    #[test]
    fn unknown_table_fails_closed() {
        let verifier = verifier();
        let token = verifier
            .issue("alice", "acme", Vec::<String>::new(), Duration::from_secs(60))
            .expect("token should issue");
        let descriptor = descriptor();
        let tables = BTreeSet::from(["orders".to_string()]);
        let err = OutputSanitizer::new(verifier)
            .sanitize(
                &token,
                Vec::new(),
                &SanitizeScope {
                    descriptor: &descriptor,
                    tables: &tables,
                    request_id: "req-1",
                    sql_hash: "abc",
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Sanitization);
    }

    #[test]
    fn value_masks_cover_each_pattern() {
        assert_eq!(mask_text("ssn 123-45-6789").as_deref(), Some("ssn ***-**-****"));
        assert_eq!(
            mask_text("call 555-123-4567 or (555) 123-4567").as_deref(),
            Some("call ***-***-**** or ***-***-****")
        );
        assert_eq!(
            mask_text("card 4111 1111 1111 1111").as_deref(),
            Some("card ****-****-****-****")
        );
        assert_eq!(mask_text("reach me at a.b@c.io").as_deref(), Some("reach me at ***@***.***"));
        assert_eq!(mask_text("order 42 shipped"), None);
    }

    #[test]
    fn digit_runs_failing_luhn_are_left_alone() {
        assert_eq!(mask_text("ref 1234-5678-9012-3456"), None);
    }

    #[test]
    fn nested_values_are_masked() {
        let (value, masked) = mask_value(serde_json::json!({
            "contacts": [{"phone": "555-123-4567"}, {"email": "x@y.com"}],
            "count": 2
        }));
        assert!(masked);
        assert_eq!(
            value,
            serde_json::json!({
                "contacts": [{"phone": PHONE_MASK}, {"email": EMAIL_MASK}],
                "count": 2
            })
        );
    }
}
