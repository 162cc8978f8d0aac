use std::fmt::Debug;
use std::io;
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
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::{AccessPolicy, SlotwiseAuthSource};
use crate::engine::{BookingChange, Engine, EngineError, ProviderChange};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};

pub struct SlotwiseHandler {
    engine: Arc<Engine>,
    access: Arc<AccessPolicy>,
    query_parser: Arc<SlotwiseQueryParser>,
}

impl SlotwiseHandler {
    pub fn new(engine: Arc<Engine>, access: Arc<AccessPolicy>) -> Self {
        Self {
            engine,
            access,
            query_parser: Arc::new(SlotwiseQueryParser),
        }
    }

    fn resolve_caller<C: ClientInfo>(&self, client: &C) -> PgWireResult<Caller> {
        let login = client.metadata().get("user").cloned().unwrap_or_default();
        self.access.caller_for(&login).ok_or_else(|| {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            user_error("28000", format!("login '{login}' is not a user id"))
        })
    }

    async fn run<C: ClientInfo>(&self, client: &C, sql_text: &str) -> PgWireResult<Response> {
        let caller = self.resolve_caller(client)?;
        let cmd = sql::parse_sql(sql_text).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&caller, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, caller: &Caller, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertProvider {
                id,
                name,
                experience_years,
                specialty,
            } => {
                engine
                    .create_provider(caller, id, name, experience_years, specialty)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateProvider {
                id,
                name,
                experience_years,
                specialty,
            } => {
                let change = ProviderChange {
                    name,
                    experience_years,
                    specialty,
                };
                engine
                    .update_provider(caller, id, change)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteProvider { id } => {
                engine.delete_provider(caller, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertBooking {
                id,
                provider_id,
                start,
            } => {
                engine
                    .create_booking(caller, id, provider_id, start)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::Reschedule {
                booking_id: None,
                provider_id,
                start,
                user_id,
            } => {
                if user_id.is_some() {
                    return Err(engine_err(EngineError::NotAuthorized));
                }
                engine
                    .update_own_booking(caller, provider_id, start)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::Reschedule {
                booking_id: Some(booking_id),
                provider_id,
                start,
                user_id,
            } => {
                let change = BookingChange {
                    provider_id,
                    start,
                    user_id,
                };
                engine
                    .admin_update_booking(caller, booking_id, change)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::CancelOwnBooking => {
                engine.cancel_own_booking(caller).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::DeleteBooking { id } => {
                engine
                    .admin_delete_booking(caller, id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::JoinWaitlist {
                id,
                provider_id,
                preferred_at,
            } => {
                engine
                    .join_waitlist(caller, id, provider_id, preferred_at)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::LeaveWaitlist { id } => {
                engine.leave_waitlist(caller, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectMyBooking => {
                let rows = match engine.get_own_booking(caller).await {
                    Ok(info) => vec![info],
                    Err(EngineError::NoBooking(_)) => Vec::new(),
                    Err(e) => return Err(engine_err(e)),
                };
                booking_rows(rows)
            }
            Command::SelectBookings => {
                let rows = engine.list_bookings(caller).await.map_err(engine_err)?;
                booking_rows(rows)
            }
            Command::SelectWaitlist => waitlist_rows(engine.list_waitlist(caller).await),
            Command::SelectProviders { id } => provider_rows(engine.list_providers(id).await),
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("user_id", Type::VARCHAR),
        text_field("provider_id", Type::VARCHAR),
        text_field("provider_name", Type::VARCHAR),
        text_field("specialty", Type::VARCHAR),
        text_field("appointment_at", Type::INT8),
        text_field("created_at", Type::INT8),
        text_field("updated_at", Type::INT8),
    ]
}

fn waitlist_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("user_id", Type::VARCHAR),
        text_field("provider_id", Type::VARCHAR),
        text_field("preferred_at", Type::INT8),
        text_field("notified", Type::BOOL),
        text_field("created_at", Type::INT8),
    ]
}

fn provider_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("experience_years", Type::INT4),
        text_field("specialty", Type::VARCHAR),
    ]
}

fn booking_rows(rows: Vec<BookingInfo>) -> PgWireResult<Response> {
    let schema = Arc::new(booking_schema());
    let rows: Vec<PgWireResult<_>> = rows
        .into_iter()
        .map(|info| {
            let b = &info.booking;
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.user_id.to_string())?;
            encoder.encode_field(&b.provider_id.to_string())?;
            encoder.encode_field(&info.provider.name)?;
            encoder.encode_field(&info.provider.specialty)?;
            encoder.encode_field(&b.start)?;
            encoder.encode_field(&b.created_at)?;
            encoder.encode_field(&b.updated_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn waitlist_rows(entries: Vec<WaitlistEntry>) -> PgWireResult<Response> {
    let schema = Arc::new(waitlist_schema());
    let rows: Vec<PgWireResult<_>> = entries
        .into_iter()
        .map(|e| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&e.id.to_string())?;
            encoder.encode_field(&e.user_id.to_string())?;
            encoder.encode_field(&e.provider_id.to_string())?;
            encoder.encode_field(&e.preferred_at)?;
            encoder.encode_field(&e.notified)?;
            encoder.encode_field(&e.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn provider_rows(providers: Vec<ProviderInfo>) -> PgWireResult<Response> {
    let schema = Arc::new(provider_schema());
    let rows: Vec<PgWireResult<_>> = providers
        .into_iter()
        .map(|p| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&p.id.to_string())?;
            encoder.encode_field(&p.name)?;
            encoder.encode_field(&(p.experience_years.min(i32::MAX as u32) as i32))?;
            encoder.encode_field(&p.specialty)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Column layout of a statement's result. Placeholders are filled with a dummy id
/// so that prepared SELECTs can be described before binding.
fn result_schema(statement: &str) -> Vec<FieldInfo> {
    let probe = replace_placeholders(statement, |_| format!("'{}'", Ulid::nil()));
    match sql::parse_sql(&probe) {
        Ok(Command::SelectMyBooking | Command::SelectBookings) => booking_schema(),
        Ok(Command::SelectWaitlist) => waitlist_schema(),
        Ok(Command::SelectProviders { .. }) => provider_schema(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotwiseHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotwiseQueryParser;

#[async_trait]
impl QueryParser for SlotwiseQueryParser {
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
impl ExtendedQueryHandler for SlotwiseHandler {
    type Statement = String;
    type QueryParser = SlotwiseQueryParser;

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
        let sql = substitute_params(portal);
        self.run(client, &sql).await
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

/// Highest `$N` placeholder number in the statement.
fn count_params(sql: &str) -> usize {
    let mut max = 0;
    replace_placeholders(sql, |n| {
        max = max.max(n);
        String::new()
    });
    max
}

/// Rewrite every `$N` outside string literals with `value(N)`.
fn replace_placeholders(sql: &str, mut value: impl FnMut(usize) -> String) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut in_string = false;
    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            in_string = !in_string;
        }
        if c != '$' || in_string {
            out.push(c);
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while let Some(&(j, d)) = chars.peek() {
            if !d.is_ascii_digit() {
                break;
            }
            end = j + 1;
            chars.next();
        }
        match sql[start..end].parse::<usize>() {
            Ok(n) => out.push_str(&value(n)),
            Err(_) => out.push('$'),
        }
    }
    out
}

/// Substitute bound parameter values (text format) into the statement.
fn substitute_params(portal: &Portal<String>) -> String {
    let params = &portal.parameters;
    replace_placeholders(&portal.statement.statement, |n| {
        match params.get(n - 1) {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            _ => "NULL".to_string(),
        }
    })
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotwiseFactory {
    handler: Arc<SlotwiseHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SlotwiseAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotwiseFactory {
    pub fn new(engine: Arc<Engine>, access: Arc<AccessPolicy>, password: String) -> Self {
        let auth_source = SlotwiseAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotwiseHandler::new(engine, access)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotwiseFactory {
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
    access: Arc<AccessPolicy>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = SlotwiseFactory::new(engine, access, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for each engine rejection.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::ProviderNotFound(_) | EngineError::NotFound(_) | EngineError::NoBooking(_) => {
            "02000"
        }
        EngineError::DuplicateBooking { .. }
        | EngineError::AlreadyWaitlisted(_)
        | EngineError::AlreadyExists(_) => "23505",
        EngineError::SlotConflict(_) => "23P01",
        EngineError::PastDate(_) => "22008",
        EngineError::LockoutWindowViolation { .. } | EngineError::NotAuthorized => "42501",
        EngineError::ProviderInUse(_) => "23503",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::UnknownTable(_) => "42P01",
        SqlError::Unsupported(_) => "0A000",
        _ => "42601",
    };
    user_error(code, e.to_string())
}
