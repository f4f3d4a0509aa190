use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{
    AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler,
};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use tokio::net::TcpStream;

use crate::engine::EngineError;
use crate::model::*;
use crate::observability;
use crate::scheduler::{ScheduleError, ScheduleFilter};
use crate::sql::{self, Command, SqlError};
use crate::studio::Studio;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct BandroomHandler {
    studio: Arc<Studio>,
    query_parser: Arc<BandroomQueryParser>,
}

impl BandroomHandler {
    pub fn new(studio: Arc<Studio>) -> Self {
        Self {
            studio,
            query_parser: Arc::new(BandroomQueryParser),
        }
    }

    async fn execute(&self, cmd: Command, format: Option<&Format>) -> PgWireResult<Response> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        cmd: Command,
        format: Option<&Format>,
    ) -> PgWireResult<Response> {
        let engine = &self.studio.engine;
        let scheduler = &self.studio.scheduler;
        match cmd {
            Command::InsertBand { band } => {
                engine.create_band(band).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateBand { band } => {
                engine.update_band(band).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteBand { id } => {
                let cancelled = engine.delete_band(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1 + cancelled.len())))
            }
            Command::InsertMusician { musician } => {
                engine.create_musician(musician).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateMusician { musician } => {
                engine.update_musician(musician).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteMusician { id } => {
                engine.delete_musician(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertMember {
                band_id,
                musician_id,
            } => {
                engine
                    .add_member(band_id, musician_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteMember {
                band_id,
                musician_id,
            } => {
                engine
                    .remove_member(band_id, musician_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::ProposeBooking { draft } => {
                let booking = scheduler
                    .propose_booking(&draft)
                    .await
                    .map_err(schedule_err)?;
                self.booking_rows(vec![booking], format)
            }
            Command::RescheduleBooking { id, changes } => {
                let booking = scheduler
                    .reschedule_booking(id, &changes)
                    .await
                    .map_err(schedule_err)?;
                self.booking_rows(vec![booking], format)
            }
            Command::CancelBooking { id } => {
                scheduler.cancel_booking(id).await.map_err(schedule_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectOccupancy { date, room } => {
                let mut rows = scheduler.get_day_occupancy(date).await;
                rows.retain(|b| room.is_none_or(|r| b.room == r));
                self.booking_rows(rows, format)
            }
            Command::SelectSchedule {
                from,
                days,
                room,
                band_id,
            } => {
                let rows = scheduler
                    .upcoming(from, days, ScheduleFilter { room, band_id })
                    .await;
                self.booking_rows(rows, format)
            }
            Command::SelectBands => {
                let bands = engine.list_bands().await;
                let schema = Arc::new(fields(&BAND_COLUMNS, format));
                let rows: Vec<PgWireResult<_>> = bands
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.band.id.to_string())?;
                        encoder.encode_field(&s.band.name)?;
                        encoder.encode_field(&s.band.genre)?;
                        encoder.encode_field(&s.band.founded.map(|d| d.to_string()))?;
                        encoder.encode_field(&(s.members as i64))?;
                        encoder.encode_field(&(s.bookings as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectMusicians { band_id } => {
                let musicians = engine.list_musicians(band_id).map_err(engine_err)?;
                musician_rows(musicians, format)
            }
            Command::SelectFreeMusicians => musician_rows(engine.free_musicians(), format),
            Command::SelectRehearsalHours { since, max_rows } => {
                let hours = engine
                    .rehearsal_hours(since.unwrap_or(NaiveDateTime::MIN), max_rows)
                    .await;
                let schema = Arc::new(fields(&HOURS_COLUMNS, format));
                let rows: Vec<PgWireResult<_>> = hours
                    .into_iter()
                    .map(|h| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&h.band_id.to_string())?;
                        encoder.encode_field(&h.band_name)?;
                        encoder.encode_field(&(h.bookings as i64))?;
                        encoder.encode_field(&h.minutes)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectGenres => {
                let genres = engine.genre_distribution();
                let schema = Arc::new(fields(&GENRE_COLUMNS, format));
                let rows: Vec<PgWireResult<_>> = genres
                    .into_iter()
                    .map(|g| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&g.genre)?;
                        encoder.encode_field(&(g.bands as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectStats => {
                let stats = engine.stats();
                let schema = Arc::new(fields(&STATS_COLUMNS, format));
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&(stats.bands as i64))?;
                encoder.encode_field(&(stats.musicians as i64))?;
                encoder.encode_field(&(stats.bookings as i64))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }

    fn booking_rows(
        &self,
        bookings: Vec<Booking>,
        format: Option<&Format>,
    ) -> PgWireResult<Response> {
        let schema = Arc::new(fields(&BOOKING_COLUMNS, format));
        let rows: Vec<PgWireResult<_>> = bookings
            .into_iter()
            .map(|b| {
                let band_name = self.studio.engine.get_band(b.band_id).map(|band| band.name);
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&b.id.to_string())?;
                encoder.encode_field(&b.band_id.to_string())?;
                encoder.encode_field(&band_name)?;
                encoder.encode_field(&b.room.code().to_string())?;
                encoder.encode_field(&b.start.format(TIMESTAMP_FORMAT).to_string())?;
                encoder.encode_field(&b.end().format(TIMESTAMP_FORMAT).to_string())?;
                encoder.encode_field(&b.duration_minutes)?;
                Ok(encoder.take_row())
            })
            .collect();
        Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
    }
}

fn musician_rows(musicians: Vec<Musician>, format: Option<&Format>) -> PgWireResult<Response> {
    let schema = Arc::new(fields(&MUSICIAN_COLUMNS, format));
    let rows: Vec<PgWireResult<_>> = musicians
        .into_iter()
        .map(|m| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&m.id.to_string())?;
            encoder.encode_field(&m.first_name)?;
            encoder.encode_field(&m.last_name)?;
            encoder.encode_field(&m.instrument)?;
            encoder.encode_field(&m.phone)?;
            encoder.encode_field(&m.telegram)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

// ── Result schemas ───────────────────────────────────────────────

type Columns = [(&'static str, Type)];

static BOOKING_COLUMNS: [(&str, Type); 7] = [
    ("id", Type::VARCHAR),
    ("band_id", Type::VARCHAR),
    ("band_name", Type::VARCHAR),
    ("room", Type::VARCHAR),
    ("start", Type::VARCHAR),
    ("end", Type::VARCHAR),
    ("duration_minutes", Type::INT8),
];

static BAND_COLUMNS: [(&str, Type); 6] = [
    ("id", Type::VARCHAR),
    ("name", Type::VARCHAR),
    ("genre", Type::VARCHAR),
    ("founded", Type::VARCHAR),
    ("members", Type::INT8),
    ("bookings", Type::INT8),
];

static MUSICIAN_COLUMNS: [(&str, Type); 6] = [
    ("id", Type::VARCHAR),
    ("first_name", Type::VARCHAR),
    ("last_name", Type::VARCHAR),
    ("instrument", Type::VARCHAR),
    ("phone", Type::VARCHAR),
    ("telegram", Type::VARCHAR),
];

static HOURS_COLUMNS: [(&str, Type); 4] = [
    ("band_id", Type::VARCHAR),
    ("band_name", Type::VARCHAR),
    ("bookings", Type::INT8),
    ("minutes", Type::INT8),
];

static GENRE_COLUMNS: [(&str, Type); 2] = [("genre", Type::VARCHAR), ("bands", Type::INT8)];

static STATS_COLUMNS: [(&str, Type); 3] = [
    ("bands", Type::INT8),
    ("musicians", Type::INT8),
    ("bookings", Type::INT8),
];

/// Field descriptions in the client's requested result format; text when it asked for none
/// (simple query protocol, statement describe).
fn fields(columns: &Columns, format: Option<&Format>) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| {
            let field_format = format.map_or(FieldFormat::Text, |f| f.format_for(i));
            FieldInfo::new(name.to_string(), None, None, ty.clone(), field_format)
        })
        .collect()
}

/// Row shape of a statement, guessed from its text. Placeholders make the statement
/// unparseable until bind time, so Describe cannot go through `sql::parse_sql`.
fn result_columns(sql: &str) -> &'static Columns {
    let lower = sql.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .collect();
    let target = words
        .windows(2)
        .find(|w| w[0] == "from" || w[0] == "into")
        .map(|w| w[1]);
    match (words.first().copied(), target) {
        (Some("select"), Some("occupancy" | "schedule")) => &BOOKING_COLUMNS,
        (Some("select"), Some("bands")) => &BAND_COLUMNS,
        (Some("select"), Some("musicians" | "free_musicians")) => &MUSICIAN_COLUMNS,
        (Some("select"), Some("rehearsal_hours")) => &HOURS_COLUMNS,
        (Some("select"), Some("genres")) => &GENRE_COLUMNS,
        (Some("select"), Some("stats")) => &STATS_COLUMNS,
        (Some("insert"), Some("bookings" | "reschedules")) => &BOOKING_COLUMNS,
        _ => &[],
    }
}

#[async_trait]
impl SimpleQueryHandler for BandroomHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let cmds = sql::parse_script(query).map_err(sql_err)?;
        let mut responses = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            responses.push(self.execute(cmd, None).await?);
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct BandroomQueryParser;

#[async_trait]
impl QueryParser for BandroomQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(fields(result_columns(stmt), column_format))
    }
}

#[async_trait]
impl ExtendedQueryHandler for BandroomHandler {
    type Statement = String;
    type QueryParser = BandroomQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.execute(cmd, Some(&portal.result_column_format)).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            fields(result_columns(&target.statement), None),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(fields(
            result_columns(&target.statement.statement),
            Some(&target.result_column_format),
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    max = max.max(n);
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Replaced from the highest index down so that `$1` never eats the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute(&portal.statement.statement, &params)
}

fn substitute(sql: &str, params: &[Option<String>]) -> String {
    let mut result = sql.to_string();
    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(text) => format!("'{}'", text.replace('\'', "''")),
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Auth ─────────────────────────────────────────────────────────

/// One shared cleartext password for every user name.
#[derive(Debug)]
pub struct SharedPassword {
    password: String,
}

impl SharedPassword {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SharedPassword {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct BandroomFactory {
    handler: Arc<BandroomHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SharedPassword, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl BandroomFactory {
    pub fn new(studio: Arc<Studio>, password: String) -> Self {
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(BandroomHandler::new(studio)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SharedPassword::new(password),
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for BandroomFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    studio: Arc<Studio>,
    password: String,
) -> std::io::Result<()> {
    let factory = Arc::new(BandroomFactory::new(studio, password));
    pgwire::tokio::process_socket(socket, None, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for a scheduling failure. Conflicts use `exclusion_violation` whether the
/// pre-check or the storage guard caught them.
fn schedule_code(e: &ScheduleError) -> &'static str {
    match e {
        ScheduleError::Validation(_) => "22023",
        ScheduleError::Conflict(_) | ScheduleError::ConstraintViolation(_) => "23P01",
        ScheduleError::StorageUnavailable(_) => "08006",
        ScheduleError::NotFound(_) => "02000",
        ScheduleError::Rejected(_) => "P0001",
    }
}

fn schedule_err(e: ScheduleError) -> PgWireError {
    user_error(schedule_code(&e), e.to_string())
}

fn engine_code(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "02000",
        EngineError::ExclusionViolation(_) => "23P01",
        EngineError::Invalid(_) => "22023",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_code(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
