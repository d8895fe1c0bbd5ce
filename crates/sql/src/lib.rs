//! Structural validation and tenant scoping of agent-drafted SQL.
//!
//! A statement is parsed with the PostgreSQL dialect and inspected as an AST.
//! Nothing here matches on SQL text. Accepted statements are rewritten so that
//! every `SELECT` reading a tenant-scoped table carries an
//! `<alias>.<tenant_column> = '<tenant>'` conjunct in its `WHERE` clause.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;

use qgate_auth::{AuthError, ContextToken, ContextVerifier};
use qgate_contracts::{ErrorKind, Operation, SchemaDescriptor, TableView, ValidatedQuery, Verdict};
use sqlparser::ast::{
    BinaryOperator, Expr, Function, FunctionArg, FunctionArgExpr, FunctionArguments, Ident,
    JoinConstraint, JoinOperator, ObjectName, ObjectNamePart, Query, Select, SelectItem, SetExpr,
    Statement, TableFactor, TableWithJoins, Value, Visit, VisitMut, Visitor, VisitorMut,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

const PARSER_RECURSION_LIMIT: usize = 64;

const MUTATING_VERBS: &[&str] = &["INSERT", "UPDATE", "DELETE", "MERGE"];

const DENIED_FUNCTIONS: &[&str] = &[
    "set_config",
    "current_setting",
    "nextval",
    "setval",
    "query_to_xml",
    "query_to_xml_and_xmlschema",
    "table_to_xml",
    "database_to_xml",
    "cursor_to_xml",
];

const DENIED_FUNCTION_PREFIXES: &[&str] = &["pg_", "dblink", "lo_", "txid_"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Authentication(AuthError),
    Parse(String),
    MultipleStatements(usize),
    DisallowedStatement(String),
    TableNotAllowed(String),
    ColumnNotAllowed(String),
    DepthExceeded { depth: usize, max: usize },
    DisallowedConstruct(String),
    DisallowedFunction(String),
    DuplicateColumn(String),
}

impl ValidationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ValidationError::Authentication(_) => ErrorKind::Authentication,
            ValidationError::TableNotAllowed(_) | ValidationError::ColumnNotAllowed(_) => {
                ErrorKind::Authorization
            }
            _ => ErrorKind::SqlValidation,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::Authentication(err) => err.code,
            ValidationError::Parse(_) => "ERR_SQL_PARSE",
            ValidationError::MultipleStatements(_) => "ERR_SQL_MULTIPLE_STATEMENTS",
            ValidationError::DisallowedStatement(_) => "ERR_SQL_DISALLOWED_STATEMENT",
            ValidationError::TableNotAllowed(_) => "ERR_TABLE_NOT_ALLOWED",
            ValidationError::ColumnNotAllowed(_) => "ERR_COLUMN_NOT_ALLOWED",
            ValidationError::DepthExceeded { .. } => "ERR_SQL_DEPTH_EXCEEDED",
            ValidationError::DisallowedConstruct(_) => "ERR_SQL_DISALLOWED_CONSTRUCT",
            ValidationError::DisallowedFunction(_) => "ERR_SQL_DISALLOWED_FUNCTION",
            ValidationError::DuplicateColumn(_) => "ERR_SQL_DUPLICATE_COLUMN",
        }
    }

    /// The table an authorization failure cites, if any.
    pub fn table(&self) -> Option<&str> {
        match self {
            ValidationError::TableNotAllowed(table) => Some(table),
            ValidationError::ColumnNotAllowed(column) => column.split('.').next(),
            _ => None,
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Authentication(_) => f.write_str("authentication failed"),
            ValidationError::Parse(detail) => write!(f, "sql parse error: {}", detail),
            ValidationError::MultipleStatements(n) => {
                write!(f, "expected one statement, found {}", n)
            }
            ValidationError::DisallowedStatement(verb) => {
                write!(f, "statement `{}` is not allowed", verb)
            }
            ValidationError::TableNotAllowed(table) => {
                write!(f, "table `{}` is not allowed", table)
            }
            ValidationError::ColumnNotAllowed(column) => {
                write!(f, "column `{}` is not allowed here", column)
            }
            ValidationError::DepthExceeded { depth, max } => {
                write!(f, "query nesting depth {} exceeds maximum {}", depth, max)
            }
            ValidationError::DisallowedConstruct(what) => write!(f, "{} is not allowed", what),
            ValidationError::DisallowedFunction(name) => {
                write!(f, "function `{}` is not allowed", name)
            }
            ValidationError::DuplicateColumn(name) => {
                write!(f, "output column `{}` appears more than once", name)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorConfig {
    pub max_subquery_depth: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_subquery_depth: 3,
        }
    }
}

/// Per-request inputs: what the identity may read and the token naming it.
///
/// The tenant predicate is taken from the verified token, never from the caller.
#[derive(Debug, Clone, Copy)]
pub struct QueryScope<'a> {
    pub descriptor: &'a SchemaDescriptor,
    pub token: &'a ContextToken,
    /// The only schema qualifier the statement may use.
    pub schema: &'a str,
}

#[derive(Clone)]
pub struct SqlValidator {
    config: ValidatorConfig,
    verifier: ContextVerifier,
}

impl SqlValidator {
    pub fn new(config: ValidatorConfig, verifier: ContextVerifier) -> Self {
        Self { config, verifier }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    pub fn validate(
        &self,
        sql: &str,
        scope: &QueryScope<'_>,
    ) -> Result<ValidatedQuery, ValidationError> {
        let ctx = self
            .verifier
            .verify(scope.token)
            .map_err(ValidationError::Authentication)?;
        let mut statement = parse_single_query(sql)?;

        let mut inspector = Inspector::new(scope, self.config.max_subquery_depth);
        if let ControlFlow::Break(err) = Visit::visit(&statement, &mut inspector) {
            return Err(err);
        }
        let inspection = inspector.finish()?;

        let mut scoper = TenantScoper {
            descriptor: scope.descriptor,
            tenant_id: ctx.tenant_id(),
            cte_names: &inspection.cte_names,
        };
        if let ControlFlow::Break(err) = VisitMut::visit(&mut statement, &mut scoper) {
            return Err(err);
        }

        Ok(ValidatedQuery {
            original_sql: sql.to_string(),
            rewritten_sql: statement.to_string(),
            tables: inspection.tables,
            verdict: Verdict::Accepted,
        })
    }
}

fn parse_single_query(sql: &str) -> Result<Statement, ValidationError> {
    let dialect = PostgreSqlDialect {};
    let statements = Parser::new(&dialect)
        .with_recursion_limit(PARSER_RECURSION_LIMIT)
        .try_with_sql(sql)
        .and_then(|mut parser| parser.parse_statements())
        .map_err(|err| ValidationError::Parse(err.to_string()))?;

    if let Some(other) = statements
        .iter()
        .find(|s| !matches!(s, Statement::Query(_)))
    {
        return Err(ValidationError::DisallowedStatement(leading_keyword(
            &other.to_string(),
        )));
    }

    let count = statements.len();
    let mut statements = statements.into_iter();
    match (statements.next(), count) {
        (Some(statement), 1) => Ok(statement),
        (None, _) => Err(ValidationError::Parse("empty statement".to_string())),
        (Some(_), n) => Err(ValidationError::MultipleStatements(n)),
    }
}

fn leading_keyword(rendered: &str) -> String {
    rendered
        .split_whitespace()
        .next()
        .map(|w| w.trim_start_matches('(').to_ascii_uppercase())
        .unwrap_or_default()
}

/// Postgres folds unquoted identifiers to lowercase; quoted ones are exact.
fn ident_key(ident: &Ident) -> String {
    if ident.quote_style.is_some() {
        ident.value.clone()
    } else {
        ident.value.to_ascii_lowercase()
    }
}

fn part_ident(part: &ObjectNamePart) -> Option<&Ident> {
    match part {
        ObjectNamePart::Identifier(ident) => Some(ident),
        #[allow(unreachable_patterns)]
        _ => None,
    }
}

fn is_denied_function(name: &str) -> bool {
    DENIED_FUNCTIONS.contains(&name)
        || DENIED_FUNCTION_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
}

#[derive(Default)]
struct CteFrame {
    names: Vec<String>,
    /// How many of `names` are in scope; advances as CTE bodies complete.
    visible: usize,
    /// Set when this query is the body of the parent's CTE at that index.
    cte_index: Option<usize>,
}

enum Relation {
    Base(String),
    Opaque,
}

type ColumnKey = (Option<String>, String);

struct ColumnRef {
    qualifier: Option<String>,
    column: String,
    bare_projection: bool,
}

fn compound_key(idents: &[Ident]) -> Option<ColumnKey> {
    match idents {
        [.., qualifier, column] => Some((Some(ident_key(qualifier)), ident_key(column))),
        [column] => Some((None, ident_key(column))),
        [] => None,
    }
}

fn join_constraint(operator: &JoinOperator) -> Option<&JoinConstraint> {
    match operator {
        JoinOperator::Join(c)
        | JoinOperator::Inner(c)
        | JoinOperator::Left(c)
        | JoinOperator::LeftOuter(c)
        | JoinOperator::Right(c)
        | JoinOperator::RightOuter(c)
        | JoinOperator::FullOuter(c)
        | JoinOperator::CrossJoin(c)
        | JoinOperator::Semi(c)
        | JoinOperator::LeftSemi(c)
        | JoinOperator::RightSemi(c)
        | JoinOperator::Anti(c)
        | JoinOperator::LeftAnti(c)
        | JoinOperator::RightAnti(c)
        | JoinOperator::StraightJoin(c)
        | JoinOperator::AsOf { constraint: c, .. } => Some(c),
        JoinOperator::CrossApply | JoinOperator::OuterApply => None,
    }
}

struct Inspection {
    tables: BTreeSet<String>,
    cte_names: BTreeSet<String>,
}

struct Inspector<'a> {
    scope: &'a QueryScope<'a>,
    max_depth: usize,
    frames: Vec<CteFrame>,
    cte_names: BTreeSet<String>,
    tables: BTreeSet<String>,
    relations: BTreeMap<String, Vec<Relation>>,
    columns: Vec<ColumnRef>,
    /// Top-level bare projections not yet matched to a visited expression.
    bare_projections: Vec<ColumnKey>,
    nested_wildcards: usize,
    statements_seen: usize,
}

impl<'a> Inspector<'a> {
    fn new(scope: &'a QueryScope<'a>, max_depth: usize) -> Self {
        Self {
            scope,
            max_depth,
            frames: Vec::new(),
            cte_names: BTreeSet::new(),
            tables: BTreeSet::new(),
            relations: BTreeMap::new(),
            columns: Vec::new(),
            bare_projections: Vec::new(),
            nested_wildcards: 0,
            statements_seen: 0,
        }
    }

    fn enter_query(&mut self, query: &Query) -> Result<(), ValidationError> {
        let depth = self.frames.len();
        if depth > self.max_depth {
            return Err(ValidationError::DepthExceeded {
                depth,
                max: self.max_depth,
            });
        }

        // CTE bodies are visited before anything else in their parent query.
        let cte_index = self
            .frames
            .last()
            .filter(|parent| parent.visible < parent.names.len())
            .map(|parent| parent.visible);

        if !query.locks.is_empty() {
            return Err(ValidationError::DisallowedConstruct(
                "row locking clause".to_string(),
            ));
        }

        let mut frame = CteFrame {
            cte_index,
            ..CteFrame::default()
        };
        if let Some(with) = &query.with {
            if with.recursive {
                return Err(ValidationError::DisallowedConstruct(
                    "WITH RECURSIVE".to_string(),
                ));
            }
            for cte in &with.cte_tables {
                if !cte.alias.columns.is_empty() {
                    return Err(ValidationError::DisallowedConstruct(
                        "CTE column list".to_string(),
                    ));
                }
                let name = ident_key(&cte.alias.name);
                if self.scope.descriptor.table(&name).is_some() {
                    return Err(ValidationError::DisallowedConstruct(format!(
                        "CTE `{}` shadowing a table",
                        name
                    )));
                }
                if !self.cte_names.insert(name.clone()) {
                    return Err(ValidationError::DisallowedConstruct(format!(
                        "CTE `{}` declared twice",
                        name
                    )));
                }
                frame.names.push(name);
            }
        }
        self.frames.push(frame);

        let top_level = depth == 0 && matches!(query.body.as_ref(), SetExpr::Select(_));
        self.inspect_set_expr(&query.body, top_level)
    }

    fn leave_query(&mut self) {
        let Some(frame) = self.frames.pop() else {
            return;
        };
        if let Some(index) = frame.cte_index
            && let Some(parent) = self.frames.last_mut()
        {
            parent.visible = index + 1;
        }
    }

    fn inspect_set_expr(&mut self, expr: &SetExpr, top_level: bool) -> Result<(), ValidationError> {
        match expr {
            SetExpr::Select(select) => self.inspect_select(select, top_level),
            // Parenthesized queries get their own visit.
            SetExpr::Query(_) => Ok(()),
            SetExpr::SetOperation { left, right, .. } => {
                self.inspect_set_expr(left, false)?;
                self.inspect_set_expr(right, false)
            }
            other => {
                let verb = leading_keyword(&other.to_string());
                if MUTATING_VERBS.contains(&verb.as_str()) {
                    Err(ValidationError::DisallowedStatement(verb))
                } else {
                    Err(ValidationError::DisallowedConstruct(verb))
                }
            }
        }
    }

    fn inspect_select(&mut self, select: &Select, top_level: bool) -> Result<(), ValidationError> {
        if select.into.is_some() {
            return Err(ValidationError::DisallowedConstruct(
                "SELECT INTO".to_string(),
            ));
        }

        let mut output_names = BTreeSet::new();
        for item in &select.projection {
            let output_name = match item {
                SelectItem::UnnamedExpr(Expr::Identifier(ident)) => Some(ident_key(ident)),
                SelectItem::UnnamedExpr(Expr::CompoundIdentifier(idents)) => {
                    idents.last().map(ident_key)
                }
                SelectItem::ExprWithAlias { alias, .. } => Some(ident_key(alias)),
                _ => None,
            };
            if top_level
                && let Some(name) = output_name
                && !output_names.insert(name.clone())
            {
                return Err(ValidationError::DuplicateColumn(name));
            }

            match item {
                SelectItem::UnnamedExpr(Expr::Identifier(ident)) if top_level => {
                    self.bare_projections.push((None, ident_key(ident)));
                }
                SelectItem::UnnamedExpr(Expr::CompoundIdentifier(idents)) if top_level => {
                    self.bare_projections.extend(compound_key(idents));
                }
                SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..) if !top_level => {
                    self.nested_wildcards += 1;
                }
                _ => {}
            }
        }

        for from in &select.from {
            self.inspect_joins(from)?;
        }
        Ok(())
    }

    /// `USING` names a column on both sides without a qualifier, so each name
    /// is checked like any other unqualified reference.
    fn inspect_joins(&mut self, from: &TableWithJoins) -> Result<(), ValidationError> {
        if let TableFactor::NestedJoin {
            table_with_joins, ..
        } = &from.relation
        {
            self.inspect_joins(table_with_joins)?;
        }
        for join in &from.joins {
            if let TableFactor::NestedJoin {
                table_with_joins, ..
            } = &join.relation
            {
                self.inspect_joins(table_with_joins)?;
            }
            match join_constraint(&join.join_operator) {
                Some(JoinConstraint::Natural) => {
                    return Err(ValidationError::DisallowedConstruct(
                        "NATURAL JOIN".to_string(),
                    ));
                }
                Some(JoinConstraint::Using(names)) => {
                    for name in names {
                        let Some(column) = name.0.last().and_then(part_ident) else {
                            return Err(ValidationError::DisallowedConstruct(
                                "dynamic USING column".to_string(),
                            ));
                        };
                        self.columns.push(ColumnRef {
                            qualifier: None,
                            column: ident_key(column),
                            bare_projection: false,
                        });
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn enter_table_factor(&mut self, factor: &TableFactor) -> Result<(), ValidationError> {
        match factor {
            TableFactor::Table {
                name, alias, args, ..
            } => {
                if args.is_some() {
                    return Err(ValidationError::DisallowedConstruct(
                        "table-valued function".to_string(),
                    ));
                }
                if let Some(alias) = alias
                    && !alias.columns.is_empty()
                {
                    return Err(ValidationError::DisallowedConstruct(
                        "column alias list".to_string(),
                    ));
                }

                let (key, relation) = self.resolve_relation(name)?;
                let key = alias.as_ref().map(|a| ident_key(&a.name)).unwrap_or(key);
                self.relations.entry(key).or_default().push(relation);
                Ok(())
            }
            TableFactor::Derived { alias, .. } | TableFactor::NestedJoin { alias, .. } => {
                if let Some(alias) = alias {
                    if !alias.columns.is_empty() {
                        return Err(ValidationError::DisallowedConstruct(
                            "column alias list".to_string(),
                        ));
                    }
                    self.relations
                        .entry(ident_key(&alias.name))
                        .or_default()
                        .push(Relation::Opaque);
                }
                Ok(())
            }
            _ => Err(ValidationError::DisallowedConstruct(
                "table source".to_string(),
            )),
        }
    }

    fn resolve_relation(&mut self, name: &ObjectName) -> Result<(String, Relation), ValidationError> {
        let parts = name
            .0
            .iter()
            .map(|part| {
                part_ident(part).ok_or_else(|| {
                    ValidationError::DisallowedConstruct("dynamic object name".to_string())
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let (schema, table) = match parts.as_slice() {
            [table] => (None, ident_key(table)),
            [schema, table] => (Some(ident_key(schema)), ident_key(table)),
            _ => {
                return Err(ValidationError::DisallowedConstruct(
                    "database-qualified name".to_string(),
                ));
            }
        };

        if schema.is_none() && self.cte_visible(&table) {
            return Ok((table, Relation::Opaque));
        }
        if self.cte_names.contains(&table) {
            return Err(ValidationError::DisallowedConstruct(format!(
                "CTE `{}` referenced outside its scope",
                table
            )));
        }
        if let Some(schema) = schema
            && schema != self.scope.schema
        {
            return Err(ValidationError::DisallowedConstruct(format!(
                "schema `{}`",
                schema
            )));
        }

        let readable = self
            .scope
            .descriptor
            .table(&table)
            .is_some_and(|view| view.operations.contains(&Operation::Read));
        if !readable {
            return Err(ValidationError::TableNotAllowed(table));
        }

        self.tables.insert(table.clone());
        Ok((table.clone(), Relation::Base(table)))
    }

    fn cte_visible(&self, name: &str) -> bool {
        self.frames.iter().any(|frame| {
            frame
                .names
                .iter()
                .take(frame.visible)
                .any(|n| n == name)
        })
    }

    fn enter_expr(&mut self, expr: &Expr) -> Result<(), ValidationError> {
        match expr {
            Expr::Identifier(ident) => {
                let key = (None, ident_key(ident));
                let bare_projection = self.take_bare_projection(&key);
                self.columns.push(ColumnRef {
                    qualifier: key.0,
                    column: key.1,
                    bare_projection,
                });
                Ok(())
            }
            Expr::CompoundIdentifier(idents) => {
                let Some(key) = compound_key(idents) else {
                    return Ok(());
                };
                let bare_projection = self.take_bare_projection(&key);
                let (qualifier, column) = key;
                self.columns.push(ColumnRef {
                    qualifier,
                    column,
                    bare_projection,
                });
                Ok(())
            }
            Expr::Wildcard(..) | Expr::QualifiedWildcard(..) => Err(
                ValidationError::DisallowedConstruct("wildcard expression".to_string()),
            ),
            Expr::Function(function) => self.inspect_function(function),
            _ => Ok(()),
        }
    }

    /// Each top-level bare projection marks at most one matching reference,
    /// and only one visited directly in the outermost query.
    fn take_bare_projection(&mut self, key: &ColumnKey) -> bool {
        if self.frames.len() != 1 {
            return false;
        }
        match self.bare_projections.iter().position(|p| p == key) {
            Some(index) => {
                self.bare_projections.swap_remove(index);
                true
            }
            None => false,
        }
    }

    fn inspect_function(&mut self, function: &Function) -> Result<(), ValidationError> {
        let name = function
            .name
            .0
            .last()
            .and_then(part_ident)
            .map(ident_key)
            .unwrap_or_default();
        if is_denied_function(&name) {
            return Err(ValidationError::DisallowedFunction(name));
        }

        let FunctionArguments::List(list) = &function.args else {
            return Ok(());
        };
        for arg in &list.args {
            let arg = match arg {
                FunctionArg::Named { arg, .. }
                | FunctionArg::ExprNamed { arg, .. }
                | FunctionArg::Unnamed(arg) => arg,
                #[allow(unreachable_patterns)]
                _ => continue,
            };
            match arg {
                FunctionArgExpr::QualifiedWildcard(_) => {
                    return Err(ValidationError::DisallowedConstruct(
                        "whole-row function argument".to_string(),
                    ));
                }
                FunctionArgExpr::Wildcard if name != "count" => {
                    return Err(ValidationError::DisallowedConstruct(
                        "wildcard function argument".to_string(),
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn referenced_views(&self) -> impl Iterator<Item = (&str, &TableView)> {
        self.tables.iter().filter_map(|t| {
            self.scope
                .descriptor
                .table(t)
                .map(|view| (t.as_str(), view))
        })
    }

    fn is_known_column(&self, name: &str) -> bool {
        self.referenced_views()
            .any(|(_, view)| view.column(name).is_some() || view.is_hidden(name))
    }

    fn finish(self) -> Result<Inspection, ValidationError> {
        let protected_present = self
            .referenced_views()
            .any(|(_, view)| view.has_protected_columns());
        if protected_present && self.nested_wildcards > 0 {
            return Err(ValidationError::DisallowedConstruct(
                "wildcard over a protected table outside the top-level projection".to_string(),
            ));
        }

        for column in &self.columns {
            if column.qualifier.is_none()
                && self.relations.contains_key(&column.column)
                && !self.is_known_column(&column.column)
            {
                return Err(ValidationError::DisallowedConstruct(format!(
                    "whole-row reference `{}`",
                    column.column
                )));
            }

            let candidates = match column.qualifier.as_deref() {
                Some(qualifier) => self
                    .relations
                    .get(qualifier)
                    .map(|rels| {
                        rels.iter()
                            .filter_map(|r| match r {
                                Relation::Base(table) => Some(table.as_str()),
                                Relation::Opaque => None,
                            })
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default(),
                None => self.tables.iter().map(String::as_str).collect(),
            };

            for table in candidates {
                let Some(view) = self.scope.descriptor.table(table) else {
                    continue;
                };
                if view.is_hidden(&column.column) {
                    return Err(ValidationError::ColumnNotAllowed(format!(
                        "{}.{}",
                        table, column.column
                    )));
                }
                let sensitive = view
                    .column(&column.column)
                    .is_some_and(|c| c.sensitivity.is_structurally_redacted());
                if sensitive && !column.bare_projection {
                    return Err(ValidationError::ColumnNotAllowed(format!(
                        "{}.{}",
                        table, column.column
                    )));
                }
            }
        }

        Ok(Inspection {
            tables: self.tables,
            cte_names: self.cte_names,
        })
    }
}

impl Visitor for Inspector<'_> {
    type Break = ValidationError;

    fn pre_visit_statement(&mut self, statement: &Statement) -> ControlFlow<Self::Break> {
        self.statements_seen += 1;
        if self.statements_seen > 1 {
            return ControlFlow::Break(ValidationError::DisallowedStatement(leading_keyword(
                &statement.to_string(),
            )));
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        match self.enter_query(query) {
            Ok(()) => ControlFlow::Continue(()),
            Err(err) => ControlFlow::Break(err),
        }
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.leave_query();
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<Self::Break> {
        match self.enter_table_factor(factor) {
            Ok(()) => ControlFlow::Continue(()),
            Err(err) => ControlFlow::Break(err),
        }
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match self.enter_expr(expr) {
            Ok(()) => ControlFlow::Continue(()),
            Err(err) => ControlFlow::Break(err),
        }
    }
}

struct TenantScoper<'a> {
    descriptor: &'a SchemaDescriptor,
    tenant_id: &'a str,
    cte_names: &'a BTreeSet<String>,
}

impl TenantScoper<'_> {
    fn scope_set_expr(&self, expr: &mut SetExpr) -> Result<(), ValidationError> {
        match expr {
            SetExpr::Select(select) => self.scope_select(select),
            SetExpr::SetOperation { left, right, .. } => {
                self.scope_set_expr(left)?;
                self.scope_set_expr(right)
            }
            _ => Ok(()),
        }
    }

    fn scope_select(&self, select: &mut Select) -> Result<(), ValidationError> {
        let mut predicates = Vec::new();
        for from in &select.from {
            self.collect_predicates(from, &mut predicates)?;
        }

        let mut present = Vec::new();
        if let Some(selection) = &select.selection {
            conjuncts(selection, &mut present);
        }
        predicates.retain(|p| {
            let rendered = p.to_string();
            if present.contains(&rendered) {
                false
            } else {
                present.push(rendered);
                true
            }
        });
        if predicates.is_empty() {
            return Ok(());
        }

        let mut combined = select.selection.take().map(|existing| match existing {
            Expr::Nested(_) => existing,
            other => Expr::Nested(Box::new(other)),
        });
        for predicate in predicates {
            combined = Some(match combined {
                Some(acc) => Expr::BinaryOp {
                    left: Box::new(acc),
                    op: BinaryOperator::And,
                    right: Box::new(predicate),
                },
                None => predicate,
            });
        }
        select.selection = combined;
        Ok(())
    }

    fn collect_predicates(
        &self,
        from: &TableWithJoins,
        out: &mut Vec<Expr>,
    ) -> Result<(), ValidationError> {
        self.collect_factor(&from.relation, out)?;
        for join in &from.joins {
            self.collect_factor(&join.relation, out)?;
        }
        Ok(())
    }

    /// A table the scoper cannot name fails the statement rather than going unscoped.
    fn collect_factor(&self, factor: &TableFactor, out: &mut Vec<Expr>) -> Result<(), ValidationError> {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                let Some(last) = name.0.last().and_then(part_ident) else {
                    return Err(ValidationError::DisallowedConstruct(
                        "dynamic object name".to_string(),
                    ));
                };
                let table = ident_key(last);
                if name.0.len() == 1 && self.cte_names.contains(&table) {
                    return Ok(());
                }
                let Some(tenant_column) = self
                    .descriptor
                    .table(&table)
                    .and_then(|view| view.tenant_column.as_deref())
                else {
                    return Ok(());
                };

                let qualifier = alias
                    .as_ref()
                    .map(|a| a.name.clone())
                    .unwrap_or_else(|| last.clone());
                out.push(Expr::BinaryOp {
                    left: Box::new(Expr::CompoundIdentifier(vec![
                        qualifier,
                        Ident::new(tenant_column),
                    ])),
                    op: BinaryOperator::Eq,
                    right: Box::new(Expr::value(Value::SingleQuotedString(
                        self.tenant_id.to_string(),
                    ))),
                });
                Ok(())
            }
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => self.collect_predicates(table_with_joins, out),
            _ => Ok(()),
        }
    }
}

impl VisitorMut for TenantScoper<'_> {
    type Break = ValidationError;

    fn post_visit_query(&mut self, query: &mut Query) -> ControlFlow<Self::Break> {
        match self.scope_set_expr(query.body.as_mut()) {
            Ok(()) => ControlFlow::Continue(()),
            Err(err) => ControlFlow::Break(err),
        }
    }
}

fn conjuncts(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            conjuncts(left, out);
            conjuncts(right, out);
        }
        Expr::Nested(inner)
            if matches!(
                inner.as_ref(),
                Expr::BinaryOp {
                    op: BinaryOperator::And,
                    ..
                }
            ) =>
        {
            conjuncts(inner, out)
        }
        other => out.push(other.to_string()),
    }
}
