use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
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

use crate::auth::GatebookAuthSource;
use crate::engine::{Engine, EngineError};
use crate::limits::MAX_RESULT_ROWS;
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, format_timestamp};

pub struct GatebookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<GatebookQueryParser>,
}

impl GatebookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(GatebookQueryParser),
        }
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();

        let result = self.execute_command(cmd).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertAppointment(request) => {
                let view = engine.create_appointment(request).await.map_err(engine_err)?;
                appointment_rows(vec![view])
            }
            Command::UpdateAppointment { id, update } => {
                engine.update_appointment(id, update).await.map_err(engine_err)?;
                let view = engine.get_appointment(id).await.map_err(engine_err)?;
                appointment_rows(vec![view])
            }
            Command::SetStatus { id, status } => {
                match status {
                    AppointmentStatus::Approved => engine.approve_appointment(id).await,
                    AppointmentStatus::Canceled => engine.cancel_appointment(id).await,
                    AppointmentStatus::Scheduled => Err(EngineError::InvalidTransition {
                        id,
                        from: AppointmentStatus::Scheduled,
                        to: AppointmentStatus::Scheduled,
                    }),
                }
                .map_err(engine_err)?;
                let view = engine.get_appointment(id).await.map_err(engine_err)?;
                appointment_rows(vec![view])
            }
            Command::DeleteAppointment { id } => {
                engine.delete_appointment(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectAppointment { id } => {
                let view = engine.get_appointment(id).await.map_err(engine_err)?;
                appointment_rows(vec![view])
            }
            Command::SelectAppointments { day } => {
                let mut views = engine.get_appointments_on(day).await.map_err(engine_err)?;
                check_row_limit(views.len())?;
                views.sort_by_key(|v| (v.appointment.created, v.appointment.id));
                appointment_rows(views)
            }
            Command::SelectTerminals => {
                let mut terminals = engine.get_all_terminals().await;
                check_row_limit(terminals.len())?;
                terminals.sort_by_key(|t| t.id);
                terminal_rows(terminals)
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn check_row_limit(rows: usize) -> PgWireResult<()> {
    if rows > MAX_RESULT_ROWS {
        return Err(engine_err(EngineError::LimitExceeded(
            "result set too large, filter by day",
        )));
    }
    Ok(())
}

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn appointment_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::INT8),
        text_field("company_id", Type::INT8),
        text_field("company_name", Type::VARCHAR),
        text_field("company_email", Type::VARCHAR),
        text_field("gst_no", Type::VARCHAR),
        text_field("transport_lic_no", Type::VARCHAR),
        text_field("terminal_id", Type::INT8),
        text_field("port_name", Type::VARCHAR),
        text_field("address", Type::VARCHAR),
        text_field("city", Type::VARCHAR),
        text_field("state", Type::VARCHAR),
        text_field("country", Type::VARCHAR),
        text_field("driver_id", Type::INT8),
        text_field("driver_name", Type::VARCHAR),
        text_field("plate_no", Type::VARCHAR),
        text_field("phone_number", Type::VARCHAR),
        text_field("container_number", Type::VARCHAR),
        text_field("move_type", Type::VARCHAR),
        text_field("size_type", Type::VARCHAR),
        text_field("line", Type::VARCHAR),
        text_field("chassis_no", Type::VARCHAR),
        text_field("gate_code", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
        text_field("created", Type::VARCHAR),
        text_field("valid_through", Type::VARCHAR),
        text_field("last_modified", Type::VARCHAR),
    ]
}

fn terminal_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::INT8),
        text_field("port_name", Type::VARCHAR),
        text_field("address", Type::VARCHAR),
        text_field("city", Type::VARCHAR),
        text_field("state", Type::VARCHAR),
        text_field("country", Type::VARCHAR),
        text_field("email", Type::VARCHAR),
        text_field("created_at", Type::VARCHAR),
        text_field("updated_at", Type::VARCHAR),
    ]
}

fn appointment_rows(views: Vec<AppointmentView>) -> PgWireResult<Response> {
    let schema = Arc::new(appointment_schema());
    let rows: Vec<PgWireResult<_>> = views
        .into_iter()
        .map(|view| {
            let a = &view.appointment;
            let company = |f: fn(&Company) -> &String| view.company.as_ref().map(f);
            let terminal = |f: fn(&Terminal) -> &String| view.terminal.as_ref().map(f);
            let driver = |f: fn(&Driver) -> &String| view.driver.as_ref().map(f);

            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&(a.id.0 as i64))?;
            encoder.encode_field(&i64::from(a.company_id.0))?;
            encoder.encode_field(&company(|c| &c.name))?;
            encoder.encode_field(&company(|c| &c.email))?;
            encoder.encode_field(&company(|c| &c.gst_no))?;
            encoder.encode_field(&company(|c| &c.transport_lic_no))?;
            encoder.encode_field(&i64::from(a.terminal_id.0))?;
            encoder.encode_field(&terminal(|t| &t.port_name))?;
            encoder.encode_field(&terminal(|t| &t.address))?;
            encoder.encode_field(&terminal(|t| &t.city))?;
            encoder.encode_field(&terminal(|t| &t.state))?;
            encoder.encode_field(&terminal(|t| &t.country))?;
            encoder.encode_field(&i64::from(a.driver_id.0))?;
            encoder.encode_field(&driver(|d| &d.name))?;
            encoder.encode_field(&driver(|d| &d.plate_no))?;
            encoder.encode_field(&driver(|d| &d.phone_number))?;
            encoder.encode_field(&a.container_number)?;
            encoder.encode_field(&a.move_type)?;
            encoder.encode_field(&a.size_type)?;
            encoder.encode_field(&a.line)?;
            encoder.encode_field(&a.chassis_no)?;
            encoder.encode_field(&a.gate_code)?;
            encoder.encode_field(&a.status.as_str())?;
            encoder.encode_field(&format_timestamp(&a.created))?;
            encoder.encode_field(&format_timestamp(&a.valid_through))?;
            encoder.encode_field(&format_timestamp(&a.last_modified))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn terminal_rows(terminals: Vec<Terminal>) -> PgWireResult<Response> {
    let schema = Arc::new(terminal_schema());
    let rows: Vec<PgWireResult<_>> = terminals
        .into_iter()
        .map(|t| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&i64::from(t.id.0))?;
            encoder.encode_field(&t.port_name)?;
            encoder.encode_field(&t.address)?;
            encoder.encode_field(&t.city)?;
            encoder.encode_field(&t.state)?;
            encoder.encode_field(&t.country)?;
            encoder.encode_field(&t.email)?;
            encoder.encode_field(&format_timestamp(&t.created_at))?;
            encoder.encode_field(&format_timestamp(&t.updated_at))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Result columns for a statement, judged from its leading keyword.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if upper.starts_with("DELETE") {
        vec![]
    } else if upper.starts_with("SELECT") && upper.contains("TERMINALS") {
        terminal_schema()
    } else if upper.starts_with("SELECT")
        || upper.starts_with("INSERT")
        || upper.starts_with("UPDATE")
    {
        appointment_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for GatebookHandler {
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
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct GatebookQueryParser;

#[async_trait]
impl QueryParser for GatebookQueryParser {
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
impl ExtendedQueryHandler for GatebookHandler {
    type Statement = String;
    type QueryParser = GatebookQueryParser;

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
        self.run(&sql).await
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
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_placeholders(&portal.statement.statement, &portal.parameters)
}

/// Replace each `$N` outside a quoted literal with the quoted N-th parameter,
/// in one left-to-right pass. Substituted text is never scanned again, so a
/// value containing `$1` stays as written. Unbound placeholders are kept.
fn bind_placeholders<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_literal = false;
    let mut chars = sql.char_indices();
    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            in_literal = !in_literal;
        }
        if c != '$' || in_literal {
            out.push(c);
            continue;
        }
        let digits = &sql[i + 1..];
        let digits = &digits[..digits.bytes().take_while(u8::is_ascii_digit).count()];
        for _ in 0..digits.len() {
            chars.next();
        }
        let bound = digits
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        match bound {
            Some(param) => out.push_str(&quote_param(param.as_ref().map(|p| p.as_ref()))),
            None => {
                out.push('$');
                out.push_str(digits);
            }
        }
    }
    out
}

fn quote_param(param: Option<&[u8]>) -> String {
    match param {
        Some(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            format!("'{}'", text.replace('\'', "''"))
        }
        None => "NULL".to_string(),
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct GatebookFactory {
    handler: Arc<GatebookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<GatebookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl GatebookFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = GatebookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(GatebookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for GatebookFactory {
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
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(GatebookFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for each engine failure.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidCompany(_)
        | EngineError::InvalidTerminal(_)
        | EngineError::InvalidDriver(_) => "23503",
        EngineError::DuplicateContainer(_) => "23505",
        EngineError::NotFound(_) => "P0002",
        EngineError::InvalidCompanyName(_) => "22023",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Store(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if matches!(e, EngineError::Store(_)) {
        tracing::error!("store failure: {e}");
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
