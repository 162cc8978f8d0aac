use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertProvider {
        id: Ulid,
        name: String,
        experience_years: u32,
        specialty: String,
    },
    /// `None` fields keep the provider's current value.
    UpdateProvider {
        id: Ulid,
        name: Option<String>,
        experience_years: Option<u32>,
        specialty: Option<String>,
    },
    DeleteProvider {
        id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        provider_id: Ulid,
        start: Ms,
    },
    /// `booking_id = None` reschedules the caller's own booking.
    Reschedule {
        booking_id: Option<Ulid>,
        provider_id: Option<Ulid>,
        start: Option<Ms>,
        user_id: Option<Ulid>,
    },
    CancelOwnBooking,
    DeleteBooking {
        id: Ulid,
    },
    JoinWaitlist {
        id: Ulid,
        provider_id: Ulid,
        preferred_at: Ms,
    },
    LeaveWaitlist {
        id: Ulid,
    },
    SelectMyBooking,
    SelectBookings,
    SelectWaitlist,
    SelectProviders {
        id: Option<Ulid>,
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
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let arg = |i: usize| values.get(i);

    match table.as_str() {
        "providers" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("providers", 2, values.len()));
            }
            Ok(Command::InsertProvider {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                experience_years: arg(2).map(parse_u32).transpose()?.unwrap_or(0),
                specialty: arg(3).map(parse_string).transpose()?.unwrap_or_default(),
            })
        }
        "provider_updates" => {
            if values.is_empty() {
                return Err(SqlError::WrongArity("provider_updates", 1, 0));
            }
            Ok(Command::UpdateProvider {
                id: parse_ulid(&values[0])?,
                name: arg(1).map(parse_string_or_null).transpose()?.flatten(),
                experience_years: arg(2).map(parse_u32_or_null).transpose()?.flatten(),
                specialty: arg(3).map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "bookings" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("bookings", 3, values.len()));
            }
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                provider_id: parse_ulid(&values[1])?,
                start: parse_i64(&values[2])?,
            })
        }
        "reschedules" => {
            if values.is_empty() {
                return Err(SqlError::WrongArity("reschedules", 1, 0));
            }
            Ok(Command::Reschedule {
                booking_id: parse_ulid_or_null(&values[0])?,
                provider_id: arg(1).map(parse_ulid_or_null).transpose()?.flatten(),
                start: arg(2).map(parse_i64_or_null).transpose()?.flatten(),
                user_id: arg(3).map(parse_ulid_or_null).transpose()?.flatten(),
            })
        }
        "waitlist" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("waitlist", 3, values.len()));
            }
            Ok(Command::JoinWaitlist {
                id: parse_ulid(&values[0])?,
                provider_id: parse_ulid(&values[1])?,
                preferred_at: parse_i64(&values[2])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table == "my_booking" {
        return Ok(Command::CancelOwnBooking);
    }
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "providers" => Ok(Command::DeleteProvider { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        "waitlist" => Ok(Command::LeaveWaitlist { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let from = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    let table = table_factor_name(&from.relation)?;

    match table.as_str() {
        "my_booking" => Ok(Command::SelectMyBooking),
        "bookings" => Ok(Command::SelectBookings),
        "waitlist" => Ok(Command::SelectWaitlist),
        "providers" => {
            let id = match &select.selection {
                Some(_) => Some(extract_where_id(&select.selection)?),
                None => None,
            };
            Ok(Command::SelectProviders { id })
        }
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
    let first = tables_with_joins
        .first()
        .ok_or_else(|| SqlError::Parse("DELETE without table".into()))?;
    table_factor_name(&first.relation)
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

/// First VALUES row. Multi-row inserts are rejected: every statement is one operation.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or_else(|| SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection.as_ref() {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid(expr).map(Some)
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return parse_i64(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::Parse("integer out of range".into()));
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer '{s}': {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_i64(expr).map(Some)
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_u32(expr).map(Some)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
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
                write!(f, "{t}: expected at least {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
