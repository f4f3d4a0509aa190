use chrono::{NaiveDate, NaiveDateTime};
use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::{DEFAULT_REPORT_LIMIT, DEFAULT_SCHEDULE_DAYS};
use crate::model::*;
use crate::scheduler::{parse_timestamp, BookingDraft, Reschedule};

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertBand {
        band: Band,
    },
    UpdateBand {
        band: Band,
    },
    DeleteBand {
        id: Ulid,
    },
    InsertMusician {
        musician: Musician,
    },
    UpdateMusician {
        musician: Musician,
    },
    DeleteMusician {
        id: Ulid,
    },
    InsertMember {
        band_id: Ulid,
        musician_id: Ulid,
    },
    DeleteMember {
        band_id: Ulid,
        musician_id: Ulid,
    },
    /// Raw field text; the scheduler validates it.
    ProposeBooking {
        draft: BookingDraft,
    },
    RescheduleBooking {
        id: Ulid,
        changes: Reschedule,
    },
    CancelBooking {
        id: Ulid,
    },
    SelectOccupancy {
        date: NaiveDate,
        room: Option<Room>,
    },
    SelectSchedule {
        from: NaiveDateTime,
        days: i64,
        room: Option<Room>,
        band_id: Option<Ulid>,
    },
    SelectBands,
    SelectMusicians {
        band_id: Option<Ulid>,
    },
    SelectFreeMusicians,
    SelectRehearsalHours {
        since: Option<NaiveDateTime>,
        max_rows: usize,
    },
    SelectGenres,
    SelectStats,
}

/// The first statement of `sql`; the rest must still parse.
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    parse_script(sql)?.into_iter().next().ok_or(SqlError::Empty)
}

/// Parse every `;`-separated statement of a simple query. Nothing runs unless all parse.
pub fn parse_script(sql: &str) -> Result<Vec<Command>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(parse_statement).collect()
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
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

    match table.as_str() {
        "bands" => Ok(Command::InsertBand {
            band: band_values(&values)?,
        }),
        "band_updates" => Ok(Command::UpdateBand {
            band: band_values(&values)?,
        }),
        "musicians" => Ok(Command::InsertMusician {
            musician: musician_values(&values)?,
        }),
        "musician_updates" => Ok(Command::UpdateMusician {
            musician: musician_values(&values)?,
        }),
        "band_members" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("band_members", 2, values.len()));
            }
            Ok(Command::InsertMember {
                band_id: parse_ulid_expr(&values[0])?,
                musician_id: parse_ulid_expr(&values[1])?,
            })
        }
        "bookings" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("bookings", 4, values.len()));
            }
            Ok(Command::ProposeBooking {
                draft: BookingDraft {
                    band_id: parse_text(&values[0])?,
                    room: parse_text(&values[1])?,
                    start: parse_text(&values[2])?,
                    duration_minutes: parse_i64_expr(&values[3])?,
                },
            })
        }
        "reschedules" => {
            if values.is_empty() {
                return Err(SqlError::WrongArity("reschedules", 1, 0));
            }
            let id = parse_ulid_expr(&values[0])?;
            let changes = Reschedule {
                room: optional(&values, 1, parse_text_or_null)?,
                start: optional(&values, 2, parse_text_or_null)?,
                duration_minutes: optional(&values, 3, parse_i64_or_null)?,
            };
            Ok(Command::RescheduleBooking { id, changes })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `(id, name, genre, founded)`; the last two may be NULL or omitted.
fn band_values(values: &[Expr]) -> Result<Band, SqlError> {
    if values.len() < 2 {
        return Err(SqlError::WrongArity("bands", 2, values.len()));
    }
    let founded = match optional(values, 3, parse_text_or_null)? {
        Some(s) => Some(parse_date(&s)?),
        None => None,
    };
    Ok(Band {
        id: parse_ulid_expr(&values[0])?,
        name: parse_text(&values[1])?,
        genre: optional(values, 2, parse_text_or_null)?,
        founded,
    })
}

/// `(id, first_name, last_name, instrument, phone, telegram)`.
fn musician_values(values: &[Expr]) -> Result<Musician, SqlError> {
    if values.len() < 5 {
        return Err(SqlError::WrongArity("musicians", 5, values.len()));
    }
    Ok(Musician {
        id: parse_ulid_expr(&values[0])?,
        first_name: parse_text_or_null(&values[1])?,
        last_name: parse_text(&values[2])?,
        instrument: parse_text(&values[3])?,
        phone: parse_text(&values[4])?,
        telegram: optional(values, 5, parse_text_or_null)?,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;

    match table.as_str() {
        "bands" => Ok(Command::DeleteBand {
            id: extract_where_id(&delete.selection)?,
        }),
        "musicians" => Ok(Command::DeleteMusician {
            id: extract_where_id(&delete.selection)?,
        }),
        "bookings" => Ok(Command::CancelBooking {
            id: extract_where_id(&delete.selection)?,
        }),
        "band_members" => {
            let (mut band_id, mut musician_id) = (None, None);
            for f in filters(&delete.selection)? {
                match (f.column.as_str(), &f.op) {
                    ("band_id", BinaryOperator::Eq) => band_id = Some(parse_ulid_expr(&f.value)?),
                    ("musician_id", BinaryOperator::Eq) => {
                        musician_id = Some(parse_ulid_expr(&f.value)?)
                    }
                    _ => return Err(f.unsupported("band_members")),
                }
            }
            Ok(Command::DeleteMember {
                band_id: band_id.ok_or(SqlError::MissingFilter("band_id"))?,
                musician_id: musician_id.ok_or(SqlError::MissingFilter("musician_id"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
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
    let filters = filters(&select.selection)?;

    match table.as_str() {
        "occupancy" => {
            let (mut date, mut room) = (None, None);
            for f in filters {
                match (f.column.as_str(), &f.op) {
                    ("date", BinaryOperator::Eq) => {
                        date = Some(parse_date(&parse_text(&f.value)?)?)
                    }
                    ("room", BinaryOperator::Eq) => room = Some(parse_room_expr(&f.value)?),
                    _ => return Err(f.unsupported("occupancy")),
                }
            }
            Ok(Command::SelectOccupancy {
                date: date.ok_or(SqlError::MissingFilter("date"))?,
                room,
            })
        }
        "schedule" => {
            let (mut from, mut days, mut room, mut band_id) = (None, None, None, None);
            for f in filters {
                match (f.column.as_str(), &f.op) {
                    ("start", BinaryOperator::GtEq | BinaryOperator::Eq) => {
                        from = Some(parse_timestamp_expr(&f.value)?)
                    }
                    ("days", BinaryOperator::Eq) => days = Some(parse_i64_expr(&f.value)?),
                    ("room", BinaryOperator::Eq) => room = Some(parse_room_expr(&f.value)?),
                    ("band_id", BinaryOperator::Eq) => band_id = Some(parse_ulid_expr(&f.value)?),
                    _ => return Err(f.unsupported("schedule")),
                }
            }
            Ok(Command::SelectSchedule {
                from: from.ok_or(SqlError::MissingFilter("start"))?,
                days: days.unwrap_or(DEFAULT_SCHEDULE_DAYS),
                room,
                band_id,
            })
        }
        "bands" => no_filters(filters, "bands", Command::SelectBands),
        "free_musicians" => no_filters(filters, "free_musicians", Command::SelectFreeMusicians),
        "stats" => no_filters(filters, "stats", Command::SelectStats),
        "genres" => no_filters(filters, "genres", Command::SelectGenres),
        "musicians" => {
            let mut band_id = None;
            for f in filters {
                match (f.column.as_str(), &f.op) {
                    ("band_id", BinaryOperator::Eq) => band_id = Some(parse_ulid_expr(&f.value)?),
                    _ => return Err(f.unsupported("musicians")),
                }
            }
            Ok(Command::SelectMusicians { band_id })
        }
        "rehearsal_hours" => {
            let (mut since, mut max_rows) = (None, DEFAULT_REPORT_LIMIT);
            for f in filters {
                match (f.column.as_str(), &f.op) {
                    ("since", BinaryOperator::GtEq | BinaryOperator::Eq) => {
                        since = Some(parse_timestamp_expr(&f.value)?)
                    }
                    ("max_rows", BinaryOperator::Eq) => {
                        let n = parse_i64_expr(&f.value)?;
                        max_rows = usize::try_from(n)
                            .map_err(|_| SqlError::Parse(format!("max_rows {n} out of range")))?;
                    }
                    _ => return Err(f.unsupported("rehearsal_hours")),
                }
            }
            Ok(Command::SelectRehearsalHours { since, max_rows })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE filters ─────────────────────────────────────────────

/// One `column <op> value` term of a conjunction.
#[derive(Debug)]
struct Filter {
    column: String,
    op: BinaryOperator,
    value: Expr,
}

impl Filter {
    fn unsupported(&self, table: &str) -> SqlError {
        SqlError::UnsupportedFilter(format!("{table}: {} {}", self.column, self.op))
    }
}

fn filters(selection: &Option<Expr>) -> Result<Vec<Filter>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_filters(expr, &mut out)?;
    }
    Ok(out)
}

fn collect_filters(expr: &Expr, out: &mut Vec<Filter>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out)?;
            collect_filters(right, out)?;
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.push(Filter {
                column,
                op: op.clone(),
                value: right.as_ref().clone(),
            });
        }
        Expr::Nested(inner) => collect_filters(inner, out)?,
        other => return Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
    Ok(())
}

fn no_filters(filters: Vec<Filter>, table: &str, cmd: Command) -> Result<Command, SqlError> {
    match filters.first() {
        Some(f) => Err(f.unsupported(table)),
        None => Ok(cmd),
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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

/// The single row of an INSERT. Multi-row VALUES are refused so that every row gets its own
/// conflict check and its own answer.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("one row per INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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

/// Value at `idx` if present, through `parse`; a missing trailing column is `None`.
fn optional<T>(
    values: &[Expr],
    idx: usize,
    parse: fn(&Expr) -> Result<Option<T>, SqlError>,
) -> Result<Option<T>, SqlError> {
    values.get(idx).map_or(Ok(None), parse)
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => Ok(Some(parse_i64_expr(expr)?)),
    }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    parse_text_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_date(s: &str) -> Result<NaiveDate, SqlError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_timestamp_expr(expr: &Expr) -> Result<NaiveDateTime, SqlError> {
    let s = parse_text(expr)?;
    parse_timestamp(&s).ok_or_else(|| SqlError::Parse(format!("bad timestamp {s:?}")))
}

fn parse_room_expr(expr: &Expr) -> Result<Room, SqlError> {
    let s = parse_text(expr)?;
    Room::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown room {s:?}")))
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
    UnsupportedFilter(String),
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
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::UnsupportedFilter(s) => write!(f, "unsupported filter: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}
