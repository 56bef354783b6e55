use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
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
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::CounterbookAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};

pub struct CounterbookHandler {
    engine: Arc<Engine>,
    admin_user: String,
    query_parser: Arc<CounterbookQueryParser>,
}

impl CounterbookHandler {
    pub fn new(engine: Arc<Engine>, admin_user: String) -> Self {
        Self {
            engine,
            admin_user,
            query_parser: Arc::new(CounterbookQueryParser),
        }
    }

    /// The login user decides who is cancelling.
    fn actor<C: ClientInfo>(&self, client: &C) -> Actor {
        match client.metadata().get("user") {
            Some(user) if *user == self.admin_user => Actor::Admin,
            _ => Actor::Citizen,
        }
    }

    async fn run(&self, sql: &str, actor: Actor) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd, actor).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command, actor: Actor) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::SelectAvailability { date } => {
                let slots = engine.availability(date).await;
                let schema = Arc::new(availability_schema());
                let rows: Vec<PgWireResult<DataRow>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&format_time(slot.time))?;
                        encoder.encode_field(&slot.available)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::InsertBooking(req) => {
                let booking = engine.create_booking(req).await.map_err(engine_err)?;
                Ok(vec![bookings_response(vec![booking])])
            }
            Command::UpdateBooking { id, patch } => {
                let booking = engine.update_booking(id, patch).await.map_err(engine_err)?;
                Ok(vec![bookings_response(vec![booking])])
            }
            Command::CancelBooking { id } => {
                engine.cancel_booking(id, actor).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::RateBooking {
                id,
                rating,
                feedback,
            } => {
                let booking = engine
                    .rate_booking(id, rating, feedback)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![bookings_response(vec![booking])])
            }
            Command::SelectBookings { filter } => {
                Ok(vec![bookings_response(engine.list_bookings(&filter).await)])
            }
            Command::SelectBookingById { id } => {
                let found = engine.get_booking(id).await.into_iter().collect();
                Ok(vec![bookings_response(found)])
            }
            Command::SelectBookingByProtocol { protocol } => {
                Ok(vec![bookings_response(engine.find_by_protocol(&protocol).await)])
            }
            Command::ToggleDayBlock { date } => {
                let action = engine.toggle_day_block(date).await.map_err(engine_err)?;
                Ok(vec![action_response(action)])
            }
            Command::ToggleSlotBlock { date, time } => {
                let action = engine
                    .toggle_slot_block(date, time)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![action_response(action)])
            }
            Command::ToggleMonthBlock { month } => {
                let action = engine.toggle_month_block(month).await.map_err(engine_err)?;
                Ok(vec![action_response(action)])
            }
            Command::SelectBlockedDates => {
                let schema = Arc::new(blocked_dates_schema());
                let rows: Vec<PgWireResult<DataRow>> = engine
                    .blocked_dates()
                    .await
                    .into_iter()
                    .map(|date| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&format_date(date))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectBlockedSlots => {
                let schema = Arc::new(blocked_slots_schema());
                let rows: Vec<PgWireResult<DataRow>> = engine
                    .blocked_slots()
                    .await
                    .into_iter()
                    .map(|(date, time)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&format_date(date))?;
                        encoder.encode_field(&format_time(time))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectSummary => {
                let summary = engine.summary().await;
                let schema = Arc::new(summary_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&(summary.total as i64))?;
                encoder.encode_field(&(summary.active as i64))?;
                encoder.encode_field(&(summary.today as i64))?;
                for (_, count) in &summary.by_service {
                    encoder.encode_field(&(*count as i64))?;
                }
                encoder.encode_field(&summary.average_rating)?;
                Ok(vec![query_response(schema, vec![Ok(encoder.take_row())])])
            }
        }
    }
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn bookings_response(bookings: Vec<Booking>) -> Response {
    let schema = Arc::new(booking_schema());
    let rows = bookings
        .iter()
        .map(|b| encode_booking(&schema, b))
        .collect();
    query_response(schema, rows)
}

fn encode_booking(schema: &Arc<Vec<FieldInfo>>, b: &Booking) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.protocol)?;
    encoder.encode_field(&b.service.name())?;
    encoder.encode_field(&b.description)?;
    encoder.encode_field(&format_date(b.date))?;
    encoder.encode_field(&format_time(b.slot))?;
    encoder.encode_field(&b.citizen.name)?;
    encoder.encode_field(&b.citizen.phone)?;
    encoder.encode_field(&b.citizen.tax_id)?;
    encoder.encode_field(&b.citizen.postal_code)?;
    encoder.encode_field(&b.citizen.email)?;
    encoder.encode_field(&b.status.as_str())?;
    encoder.encode_field(&b.rating.map(i32::from))?;
    encoder.encode_field(&b.feedback)?;
    encoder.encode_field(&b.notes)?;
    encoder.encode_field(&b.created_at.to_rfc3339())?;
    Ok(encoder.take_row())
}

fn action_response(action: BlockAction) -> Response {
    let schema = Arc::new(action_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    let row = encoder
        .encode_field(&action.as_str())
        .map(|()| encoder.take_row());
    query_response(schema, vec![row])
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![field("time", Type::VARCHAR), field("available", Type::BOOL)]
}

fn booking_schema() -> Vec<FieldInfo> {
    let mut fields: Vec<FieldInfo> = [
        "id",
        "protocol",
        "service",
        "description",
        "date",
        "time",
        "name",
        "phone",
        "tax_id",
        "postal_code",
        "email",
        "status",
    ]
    .into_iter()
    .map(|name| field(name, Type::VARCHAR))
    .collect();
    fields.push(field("rating", Type::INT4));
    fields.push(field("feedback", Type::VARCHAR));
    fields.push(field("notes", Type::VARCHAR));
    fields.push(field("created_at", Type::VARCHAR));
    fields
}

fn action_schema() -> Vec<FieldInfo> {
    vec![field("action", Type::VARCHAR)]
}

fn blocked_dates_schema() -> Vec<FieldInfo> {
    vec![field("date", Type::VARCHAR)]
}

fn blocked_slots_schema() -> Vec<FieldInfo> {
    vec![field("date", Type::VARCHAR), field("time", Type::VARCHAR)]
}

/// One count column per service, named after it.
fn summary_schema() -> Vec<FieldInfo> {
    let mut fields = vec![
        field("total", Type::INT8),
        field("active", Type::INT8),
        field("today", Type::INT8),
    ];
    fields.extend(
        ServiceKind::ALL
            .iter()
            .map(|k| field(k.name(), Type::INT8)),
    );
    fields.push(field("average_rating", Type::FLOAT8));
    fields
}

/// Row shape a statement will produce, guessed from its text so that
/// statements with `$n` placeholders can be described before binding.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let norm = sql.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
    if norm.contains("TOGGLE_") {
        action_schema()
    } else if norm.contains("FROM AVAILABILITY") {
        availability_schema()
    } else if norm.contains("FROM BLOCKED_DATES") {
        blocked_dates_schema()
    } else if norm.contains("FROM BLOCKED_SLOTS") {
        blocked_slots_schema()
    } else if norm.contains("FROM SUMMARY") {
        summary_schema()
    } else if (norm.starts_with("SELECT") && norm.contains("FROM BOOKINGS"))
        || norm.starts_with("INSERT INTO BOOKINGS")
        || norm.starts_with("INSERT INTO BOOKING_UPDATES")
        || norm.starts_with("INSERT INTO RATINGS")
    {
        booking_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for CounterbookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = self.actor(client);
        self.run(query, actor).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CounterbookQueryParser;

#[async_trait]
impl QueryParser for CounterbookQueryParser {
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
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CounterbookHandler {
    type Statement = String;
    type QueryParser = CounterbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = self.actor(client);
        let sql = substitute_params(portal);
        let mut responses = self.run(&sql, actor).await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
        Ok(responses.remove(0))
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Substitute `$1, $2, ...` with bound parameter values (text format).
/// Highest index first, so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CounterbookFactory {
    handler: Arc<CounterbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<CounterbookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl CounterbookFactory {
    pub fn new(engine: Arc<Engine>, auth: CounterbookAuthSource) -> Self {
        let admin_user = auth.admin_user().to_string();
        Self {
            handler: Arc::new(CounterbookHandler::new(engine, admin_user)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth,
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CounterbookFactory {
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
    engine: Arc<Engine>,
    auth: CounterbookAuthSource,
    tls: Option<TlsAcceptor>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let factory = CounterbookFactory::new(engine, auth);
    pgwire::tokio::process_socket(socket, tls, factory).await?;
    Ok(())
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
