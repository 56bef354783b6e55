use std::collections::HashMap;

use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, Expr, FromTable, FunctionArg, FunctionArgExpr, FunctionArguments, ObjectNamePart,
    SelectItem, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::calendar;
use crate::limits::MAX_INSERT_ROWS;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectAvailability { date: NaiveDate },
    InsertBooking(BookingRequest),
    UpdateBooking { id: Ulid, patch: BookingPatch },
    CancelBooking { id: Ulid },
    RateBooking {
        id: Ulid,
        rating: i64,
        feedback: Option<String>,
    },
    SelectBookings { filter: BookingFilter },
    SelectBookingById { id: Ulid },
    SelectBookingByProtocol { protocol: String },
    ToggleDayBlock { date: NaiveDate },
    ToggleSlotBlock { date: NaiveDate, time: NaiveTime },
    ToggleMonthBlock { month: NaiveDate },
    SelectBlockedDates,
    SelectBlockedSlots,
    SelectSummary,
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

// ── INSERT ────────────────────────────────────────────────────

/// Column name → value of the single VALUES row.
struct Row {
    table: &'static str,
    values: HashMap<String, Expr>,
}

impl Row {
    fn from_insert(table: &'static str, insert: &ast::Insert) -> Result<Self, SqlError> {
        let rows = extract_insert_rows(insert)?;
        if rows.len() > MAX_INSERT_ROWS {
            return Err(SqlError::Unsupported(format!(
                "{table}: one row per INSERT, got {}",
                rows.len()
            )));
        }
        let row = &rows[0];
        if insert.columns.is_empty() {
            return Err(SqlError::Parse(format!("{table}: column list required")));
        }
        if insert.columns.len() != row.len() {
            return Err(SqlError::WrongArity(table, insert.columns.len(), row.len()));
        }
        let values = insert
            .columns
            .iter()
            .map(|c| c.value.to_lowercase())
            .zip(row.iter().cloned())
            .collect();
        Ok(Self { table, values })
    }

    /// `None` when the column is absent or NULL.
    fn text(&self, column: &'static str) -> Result<Option<String>, SqlError> {
        match self.values.get(column) {
            Some(expr) => parse_text_or_null(expr),
            None => Ok(None),
        }
    }

    fn required(&self, column: &'static str) -> Result<String, SqlError> {
        self.text(column)?
            .ok_or(SqlError::MissingColumn(self.table, column))
    }

    fn service(&self) -> Result<Option<ServiceKind>, SqlError> {
        self.text("service")?
            .map(|s| s.parse().map_err(SqlError::Parse))
            .transpose()
    }

    fn date(&self) -> Result<Option<NaiveDate>, SqlError> {
        self.text("date")?.map(|s| parse_date_text(&s)).transpose()
    }

    fn time(&self) -> Result<Option<NaiveTime>, SqlError> {
        self.text("time")?.map(|s| parse_time_text(&s)).transpose()
    }

    fn flag(&self, column: &'static str) -> Result<Option<bool>, SqlError> {
        match self.values.get(column) {
            Some(expr) if !is_null(expr) => parse_bool(expr).map(Some),
            _ => Ok(None),
        }
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "bookings" => {
            let row = Row::from_insert("bookings", insert)?;
            let tax_id = row.text("tax_id")?;
            Ok(Command::InsertBooking(BookingRequest {
                service: row
                    .service()?
                    .ok_or(SqlError::MissingColumn("bookings", "service"))?,
                description: row.text("description")?,
                date: row.date()?.ok_or(SqlError::MissingColumn("bookings", "date"))?,
                slot: row.time()?.ok_or(SqlError::MissingColumn("bookings", "time"))?,
                name: row.required("name")?,
                phone: row.required("phone")?,
                has_tax_id: row.flag("has_tax_id")?.unwrap_or(tax_id.is_some()),
                tax_id,
                postal_code: row.text("postal_code")?,
                email: row.text("email")?,
            }))
        }
        "booking_updates" => {
            let row = Row::from_insert("booking_updates", insert)?;
            let id = parse_ulid_text(&row.required("id")?)?;
            let patch = BookingPatch {
                service: row.service()?,
                description: row.text("description")?,
                date: row.date()?,
                slot: row.time()?,
                name: row.text("name")?,
                phone: row.text("phone")?,
                tax_id: row.text("tax_id")?,
                has_tax_id: row.flag("has_tax_id")?,
                postal_code: row.text("postal_code")?,
                email: row.text("email")?,
                notes: row.text("notes")?,
            };
            Ok(Command::UpdateBooking { id, patch })
        }
        "ratings" => {
            let row = Row::from_insert("ratings", insert)?;
            let rating = row
                .values
                .get("rating")
                .ok_or(SqlError::MissingColumn("ratings", "rating"))?;
            Ok(Command::RateBooking {
                id: parse_ulid_text(&row.required("booking_id")?)?,
                rating: parse_i64_expr(rating)?,
                feedback: row.text("feedback")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "bookings" => {
            let (column, value) = where_eq(delete.selection.as_ref())?;
            if column != "id" {
                return Err(SqlError::MissingFilter("id"));
            }
            Ok(Command::CancelBooking {
                id: parse_ulid_text(&value)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return parse_function_call(&select.projection);
    };
    let table = table_factor_name(&from.relation)?;

    match table.as_str() {
        "availability" => {
            let (column, value) = where_eq(select.selection.as_ref())?;
            if column != "date" {
                return Err(SqlError::MissingFilter("date"));
            }
            Ok(Command::SelectAvailability {
                date: parse_date_text(&value)?,
            })
        }
        "bookings" => {
            let Some(selection) = select.selection.as_ref() else {
                return Ok(Command::SelectBookings {
                    filter: BookingFilter::All,
                });
            };
            let (column, value) = where_eq(Some(selection))?;
            match column.as_str() {
                "tax_id" => Ok(Command::SelectBookings {
                    filter: BookingFilter::TaxId(value),
                }),
                "id" => Ok(Command::SelectBookingById {
                    id: parse_ulid_text(&value)?,
                }),
                "protocol" => Ok(Command::SelectBookingByProtocol { protocol: value }),
                _ => Err(SqlError::Unsupported(format!("filter on bookings.{column}"))),
            }
        }
        "blocked_dates" => Ok(Command::SelectBlockedDates),
        "blocked_slots" => Ok(Command::SelectBlockedSlots),
        "summary" => Ok(Command::SelectSummary),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `SELECT toggle_*(...)` with no FROM clause.
fn parse_function_call(projection: &[SelectItem]) -> Result<Command, SqlError> {
    let function = match projection.first() {
        Some(SelectItem::UnnamedExpr(Expr::Function(f)))
        | Some(SelectItem::ExprWithAlias {
            expr: Expr::Function(f),
            ..
        }) => f,
        _ => return Err(SqlError::Parse("SELECT without FROM".into())),
    };
    let name = object_name_last(&function.name)
        .ok_or_else(|| SqlError::Parse("empty function name".into()))?;
    let args = function_args(&function.args)?;

    match name.as_str() {
        "toggle_day_block" => {
            let [date] = expect_args::<1>("toggle_day_block", args)?;
            Ok(Command::ToggleDayBlock {
                date: parse_date_text(&date)?,
            })
        }
        "toggle_slot_block" => {
            let [date, time] = expect_args::<2>("toggle_slot_block", args)?;
            Ok(Command::ToggleSlotBlock {
                date: parse_date_text(&date)?,
                time: parse_time_text(&time)?,
            })
        }
        "toggle_month_block" => {
            let [month] = expect_args::<1>("toggle_month_block", args)?;
            let month = calendar::parse_month(&month)
                .ok_or_else(|| SqlError::Parse(format!("bad month: {month}")))?;
            Ok(Command::ToggleMonthBlock { month })
        }
        _ => Err(SqlError::UnknownFunction(name)),
    }
}

fn function_args(args: &FunctionArguments) -> Result<Vec<String>, SqlError> {
    let list = match args {
        FunctionArguments::List(list) => list,
        FunctionArguments::None => return Ok(Vec::new()),
        FunctionArguments::Subquery(_) => {
            return Err(SqlError::Unsupported("subquery argument".into()))
        }
    };
    list.args
        .iter()
        .map(|arg| match arg {
            FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) => parse_text_or_null(expr)?
                .ok_or_else(|| SqlError::Parse("NULL argument".into())),
            _ => Err(SqlError::Unsupported("named or wildcard argument".into())),
        })
        .collect()
}

fn expect_args<const N: usize>(
    function: &'static str,
    args: Vec<String>,
) -> Result<[String; N], SqlError> {
    let got = args.len();
    args.try_into()
        .map_err(|_| SqlError::WrongArity(function, N, got))
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
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

/// The single `column = 'value'` predicate of a WHERE clause.
fn where_eq(selection: Option<&Expr>) -> Result<(String, String), SqlError> {
    let Some(Expr::BinaryOp {
        left,
        op: ast::BinaryOperator::Eq,
        right,
    }) = selection
    else {
        return Err(SqlError::Unsupported(
            "WHERE must be a single column = value".into(),
        ));
    };
    let column = expr_column_name(left)
        .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
    let value = parse_text_or_null(right)?
        .ok_or_else(|| SqlError::Parse(format!("{column} = NULL")))?;
    Ok((column, value))
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

/// Literal as text. Numbers keep their source spelling.
fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s.clone())),
        Some(Value::Boolean(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(SqlError::Parse(format!("unsupported literal {other:?}"))),
        None => Err(SqlError::Parse(format!("expected literal, got {expr}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return parse_i64_expr(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::Parse(format!("integer out of range: -{expr}")));
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        _ => Err(SqlError::Parse(format!("expected integer, got {expr}"))),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        _ => Err(SqlError::Parse(format!("expected bool, got {expr}"))),
    }
}

fn parse_ulid_text(s: &str) -> Result<Ulid, SqlError> {
    Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad id {s:?}: {e}")))
}

fn parse_date_text(s: &str) -> Result<NaiveDate, SqlError> {
    parse_date(s).ok_or_else(|| SqlError::Parse(format!("bad date {s:?}, expected YYYY-MM-DD")))
}

fn parse_time_text(s: &str) -> Result<NaiveTime, SqlError> {
    parse_time(s).ok_or_else(|| SqlError::Parse(format!("bad time {s:?}, expected HH:MM")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownFunction(String),
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
            SqlError::UnknownFunction(name) => write!(f, "unknown function: {name}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing column {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
