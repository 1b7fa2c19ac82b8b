use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// How an `UPDATE allocations` statement touches the span columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanPatch {
    /// Neither `start` nor `"end"` assigned.
    Keep,
    /// Both set to NULL: follow the event's span again.
    Clear,
    Set(Ms, Ms),
}

/// One row of a multi-row allocation insert: (id, event_id, resource_id, span).
pub type AllocationRow = (Ulid, Ulid, Ulid, Option<(Ms, Ms)>);

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertEvent {
        id: Ulid,
        title: String,
        start: Ms,
        end: Ms,
        description: Option<String>,
    },
    UpdateEvent {
        id: Ulid,
        title: Option<String>,
        start: Option<Ms>,
        end: Option<Ms>,
        description: Option<Option<String>>,
    },
    DeleteEvent {
        id: Ulid,
    },
    InsertResource {
        id: Ulid,
        name: String,
        kind: Option<String>,
        capacity: Option<u32>,
    },
    UpdateResource {
        id: Ulid,
        name: Option<String>,
        kind: Option<Option<String>>,
        capacity: Option<Option<u32>>,
    },
    DeleteResource {
        id: Ulid,
    },
    InsertAllocation {
        id: Ulid,
        event_id: Ulid,
        resource_id: Ulid,
        span: Option<(Ms, Ms)>,
    },
    BatchInsertAllocations {
        allocations: Vec<AllocationRow>,
    },
    UpdateAllocation {
        id: Ulid,
        resource_id: Option<Ulid>,
        span: SpanPatch,
    },
    DeleteAllocation {
        id: Ulid,
    },
    SelectEvents,
    SelectResources,
    SelectAllocations {
        resource_id: Option<Ulid>,
    },
    SelectConflicts {
        resource_id: Option<Ulid>,
    },
    SelectValidate {
        resource_id: Ulid,
        event_id: Ulid,
        span: Option<(Ms, Ms)>,
        exclude_id: Option<Ulid>,
    },
    SelectUsage {
        resource_id: Option<Ulid>,
        start: Ms,
        end: Ms,
        now: Option<Ms>,
    },
    SelectUpcoming {
        resource_id: Ulid,
        now: Option<Ms>,
    },
    SelectDashboard {
        now: Option<Ms>,
    },
    SelectRecentAllocations {
        now: Option<Ms>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table in the FROM clause when `sql` is a SELECT. Placeholders are fine
/// here, so this works on unbound prepared statements.
pub fn select_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    match stmts.first()? {
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => table_factor_name(&select.from.first()?.relation).ok(),
            _ => None,
        },
        _ => None,
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// Column names for a VALUES row: the explicit column list, or the table's
/// default order when none was given.
fn column_names(insert: &ast::Insert, defaults: &[&str]) -> Vec<String> {
    if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    }
}

/// A VALUES row addressed by column name.
struct Row<'a> {
    table: &'static str,
    cells: Vec<(&'a str, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn new(table: &'static str, columns: &'a [String], values: &'a [Expr]) -> Result<Self, SqlError> {
        if values.len() != columns.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        let cells = columns.iter().map(String::as_str).zip(values.iter()).collect();
        Ok(Self { table, cells })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.cells.iter().find(|(c, _)| *c == column).map(|(_, e)| *e)
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }

    /// Optional `start`/`"end"` pair; giving only one is an error.
    fn span(&self) -> Result<Option<(Ms, Ms)>, SqlError> {
        let start = self.get("start").map(parse_i64_or_null).transpose()?.flatten();
        let end = self.get("end").map(parse_i64_or_null).transpose()?.flatten();
        match (start, end) {
            (Some(s), Some(e)) => Ok(Some((s, e))),
            (None, None) => Ok(None),
            (None, Some(_)) => Err(SqlError::MissingColumn(self.table, "start")),
            (Some(_), None) => Err(SqlError::MissingColumn(self.table, "end")),
        }
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_all_insert_rows(insert)?;

    if rows.len() > 1 && table != "allocations" {
        return Err(SqlError::Unsupported(format!("multi-row insert into {table}")));
    }

    match table.as_str() {
        "events" => {
            let columns = column_names(insert, &["id", "title", "start", "end", "description"][..rows[0].len().min(5)]);
            let row = Row::new("events", &columns, &rows[0])?;
            Ok(Command::InsertEvent {
                id: parse_ulid_expr(row.required("id")?)?,
                title: parse_string_expr(row.required("title")?)?,
                start: parse_i64_expr(row.required("start")?)?,
                end: parse_i64_expr(row.required("end")?)?,
                description: row.get("description").map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "resources" => {
            let columns = column_names(insert, &["id", "name", "kind", "capacity"][..rows[0].len().min(4)]);
            let row = Row::new("resources", &columns, &rows[0])?;
            Ok(Command::InsertResource {
                id: parse_ulid_expr(row.required("id")?)?,
                name: parse_string_expr(row.required("name")?)?,
                kind: row.get("kind").map(parse_string_or_null).transpose()?.flatten(),
                capacity: row.get("capacity").map(parse_u32_or_null).transpose()?.flatten(),
            })
        }
        "allocations" => {
            let width = rows[0].len().min(5);
            let columns = column_names(insert, &["id", "event_id", "resource_id", "start", "end"][..width]);
            let mut parsed = Vec::with_capacity(rows.len());
            for (i, values) in rows.iter().enumerate() {
                let row = Row::new("allocations", &columns, values)?;
                let at_row = |e: SqlError| SqlError::Parse(format!("row {i}: {e}"));
                parsed.push((
                    parse_ulid_expr(row.required("id")?).map_err(at_row)?,
                    parse_ulid_expr(row.required("event_id")?).map_err(at_row)?,
                    parse_ulid_expr(row.required("resource_id")?).map_err(at_row)?,
                    row.span().map_err(at_row)?,
                ));
            }
            if parsed.len() == 1 {
                let (id, event_id, resource_id, span) = parsed.remove(0);
                Ok(Command::InsertAllocation { id, event_id, resource_id, span })
            } else {
                Ok(Command::BatchInsertAllocations { allocations: parsed })
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    let mut set: Vec<(String, &Expr)> = Vec::with_capacity(assignments.len());
    for a in assignments {
        let column = match &a.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => return Err(SqlError::Unsupported("tuple assignment".into())),
        };
        set.push((column, &a.value));
    }
    let find = |col: &str| set.iter().find(|(c, _)| c == col).map(|(_, e)| *e);

    match table.as_str() {
        "events" => {
            let mut description = None;
            if let Some(e) = find("description") {
                description = Some(parse_string_or_null(e)?);
            }
            Ok(Command::UpdateEvent {
                id,
                title: find("title").map(parse_string_expr).transpose()?,
                start: find("start").map(parse_i64_expr).transpose()?,
                end: find("end").map(parse_i64_expr).transpose()?,
                description,
            })
        }
        "resources" => Ok(Command::UpdateResource {
            id,
            name: find("name").map(parse_string_expr).transpose()?,
            kind: find("kind").map(parse_string_or_null).transpose()?,
            capacity: find("capacity").map(parse_u32_or_null).transpose()?,
        }),
        "allocations" => {
            let start = find("start").map(parse_i64_or_null).transpose()?;
            let end = find("end").map(parse_i64_or_null).transpose()?;
            let span = match (start, end) {
                (None, None) => SpanPatch::Keep,
                (Some(None), Some(None)) => SpanPatch::Clear,
                (Some(Some(s)), Some(Some(e))) => SpanPatch::Set(s, e),
                _ => {
                    return Err(SqlError::Unsupported(
                        "start and \"end\" must be set together".into(),
                    ))
                }
            };
            Ok(Command::UpdateAllocation {
                id,
                resource_id: find("resource_id").map(parse_ulid_expr).transpose()?,
                span,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "events" => Ok(Command::DeleteEvent { id }),
        "resources" => Ok(Command::DeleteResource { id }),
        "allocations" => Ok(Command::DeleteAllocation { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

/// `column op value` terms of a WHERE clause joined by AND.
#[derive(Default)]
struct Filters<'a> {
    terms: Vec<(String, BinaryOperator, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn collect(&mut self, expr: &'a Expr) -> Result<(), SqlError> {
        match expr {
            Expr::BinaryOp {
                left,
                op: BinaryOperator::And,
                right,
            } => {
                self.collect(left)?;
                self.collect(right)
            }
            Expr::BinaryOp { left, op, right } => {
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                self.terms.push((column, op.clone(), right.as_ref()));
                Ok(())
            }
            Expr::Nested(inner) => self.collect(inner),
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    fn find(&self, column: &str, op: BinaryOperator) -> Option<&'a Expr> {
        self.terms
            .iter()
            .find(|(c, o, _)| c == column && *o == op)
            .map(|(_, _, e)| *e)
    }

    fn ulid(&self, column: &str) -> Result<Option<Ulid>, SqlError> {
        self.find(column, BinaryOperator::Eq).map(parse_ulid_expr).transpose()
    }

    fn ms(&self, column: &str, op: BinaryOperator) -> Result<Option<Ms>, SqlError> {
        self.find(column, op).map(parse_i64_expr).transpose()
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut f = Filters::default();
    if let Some(selection) = &select.selection {
        f.collect(selection)?;
    }
    let now = f.ms("now", BinaryOperator::Eq)?;

    match table.as_str() {
        "events" => Ok(Command::SelectEvents),
        "resources" => Ok(Command::SelectResources),
        "allocations" => Ok(Command::SelectAllocations {
            resource_id: f.ulid("resource_id")?,
        }),
        "conflicts" => Ok(Command::SelectConflicts {
            resource_id: f.ulid("resource_id")?,
        }),
        "validate" => {
            let start = f.ms("start", BinaryOperator::Eq)?;
            let end = f.ms("end", BinaryOperator::Eq)?;
            let span = match (start, end) {
                (Some(s), Some(e)) => Some((s, e)),
                (None, None) => None,
                (None, Some(_)) => return Err(SqlError::MissingFilter("start")),
                (Some(_), None) => return Err(SqlError::MissingFilter("end")),
            };
            Ok(Command::SelectValidate {
                resource_id: f.ulid("resource_id")?.ok_or(SqlError::MissingFilter("resource_id"))?,
                event_id: f.ulid("event_id")?.ok_or(SqlError::MissingFilter("event_id"))?,
                span,
                exclude_id: f.ulid("exclude_id")?,
            })
        }
        "usage" => Ok(Command::SelectUsage {
            resource_id: f.ulid("resource_id")?,
            start: f.ms("start", BinaryOperator::GtEq)?.ok_or(SqlError::MissingFilter("start"))?,
            end: f.ms("end", BinaryOperator::LtEq)?.ok_or(SqlError::MissingFilter("end"))?,
            now,
        }),
        "upcoming" => Ok(Command::SelectUpcoming {
            resource_id: f.ulid("resource_id")?.ok_or(SqlError::MissingFilter("resource_id"))?,
            now,
        }),
        "dashboard" => Ok(Command::SelectDashboard { now }),
        "recent_allocations" => Ok(Command::SelectRecentAllocations { now }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(values.rows.clone()),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    match expr {
        Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => Ok(-parse_i64_expr(expr)?),
        _ => match extract_value(expr) {
            Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => {
                s.parse().map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}")))
            }
            Some(value) => Err(SqlError::Parse(format!("expected integer, got {value}"))),
            None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
        },
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_i64_expr(expr).map(Some)
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    match parse_i64_or_null(expr)? {
        None => Ok(None),
        Some(v) => u32::try_from(v)
            .map(Some)
            .map_err(|_| SqlError::Parse(format!("{v} out of u32 range"))),
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string_expr(expr).map(Some)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing column {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
