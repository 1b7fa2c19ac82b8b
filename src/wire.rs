use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::StartupHandler;
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

use crate::engine::{Engine, EngineError, Proposal, SpanUpdate};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SpanPatch};

/// Wall-clock `now` for queries that leave it out.
fn now_ms() -> Ms {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as Ms)
}

pub struct ResallocHandler {
    engine: Arc<Engine>,
    query_parser: Arc<ResallocQueryParser>,
}

impl ResallocHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(ResallocQueryParser),
        }
    }

    /// Parse, execute and record RED metrics for one statement.
    async fn run(&self, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        if let Err(ref e) = result {
            tracing::debug!(command = label, "query failed: {e}");
        }
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            // ── Events ──
            Command::InsertEvent {
                id,
                title,
                start,
                end,
                description,
            } => {
                let span = Span::new(start, end).map_err(engine_err)?;
                engine
                    .create_event(id, title, description, span)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateEvent {
                id,
                title,
                start,
                end,
                description,
            } => {
                let current = engine.get_event(id).ok_or(EngineError::NotFound(id)).map_err(engine_err)?;
                let span = Span::new(
                    start.unwrap_or(current.span.start()),
                    end.unwrap_or(current.span.end()),
                )
                .map_err(engine_err)?;
                engine
                    .update_event(
                        id,
                        title.unwrap_or(current.title),
                        description.unwrap_or(current.description),
                        span,
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteEvent { id } => {
                engine.delete_event(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }

            // ── Resources ──
            Command::InsertResource {
                id,
                name,
                kind,
                capacity,
            } => {
                engine
                    .create_resource(id, name, kind, capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateResource {
                id,
                name,
                kind,
                capacity,
            } => {
                let current = engine.get_resource(id).ok_or(EngineError::NotFound(id)).map_err(engine_err)?;
                engine
                    .update_resource(
                        id,
                        name.unwrap_or(current.name),
                        kind.unwrap_or(current.kind),
                        capacity.unwrap_or(current.capacity),
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteResource { id } => {
                engine.delete_resource(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }

            // ── Allocations ──
            Command::InsertAllocation {
                id,
                event_id,
                resource_id,
                span,
            } => {
                let span = to_span(span)?;
                engine
                    .allocate(id, event_id, resource_id, span)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::BatchInsertAllocations { allocations } => {
                let mut batch = Vec::with_capacity(allocations.len());
                for (id, event_id, resource_id, span) in allocations {
                    batch.push((id, event_id, resource_id, to_span(span)?));
                }
                let created = engine.batch_allocate(batch).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(created.len()))])
            }
            Command::UpdateAllocation { id, resource_id, span } => {
                let span = match span {
                    SpanPatch::Keep => SpanUpdate::Keep,
                    SpanPatch::Clear => SpanUpdate::FollowEvent,
                    SpanPatch::Set(start, end) => SpanUpdate::Custom(Span::new(start, end).map_err(engine_err)?),
                };
                engine
                    .update_allocation(id, resource_id, span)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteAllocation { id } => {
                engine.deallocate(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }

            // ── Reads ──
            Command::SelectEvents => Ok(vec![query_response(event_schema(), engine.list_events(), encode_event)]),
            Command::SelectResources => Ok(vec![query_response(
                resource_schema(),
                engine.list_resources(),
                encode_resource,
            )]),
            Command::SelectAllocations { resource_id } => Ok(vec![query_response(
                allocation_schema(),
                engine.list_allocations(resource_id),
                encode_allocation,
            )]),
            Command::SelectConflicts { resource_id } => {
                let scope = resource_id.map_or(Scope::AllResources, Scope::SingleResource);
                let pairs = engine.detect_conflicts(scope).map_err(engine_err)?;
                Ok(vec![query_response(conflict_schema(), pairs, encode_conflict)])
            }
            Command::SelectValidate {
                resource_id,
                event_id,
                span,
                exclude_id,
            } => {
                let proposal = Proposal {
                    resource_id,
                    event_id,
                    span: to_span(span)?,
                    exclude: exclude_id,
                };
                let verdict = engine.validate_allocation(&proposal);
                Ok(vec![query_response(validate_schema(), vec![verdict], encode_verdict)])
            }
            Command::SelectUsage {
                resource_id,
                start,
                end,
                now,
            } => {
                let now = now.unwrap_or_else(now_ms);
                let reports = match resource_id {
                    Some(rid) => vec![engine.usage_report(rid, start, end, now).map_err(engine_err)?],
                    None => engine.usage_report_all(start, end, now).map_err(engine_err)?,
                };
                Ok(vec![query_response(usage_schema(), reports, encode_usage)])
            }
            Command::SelectUpcoming { resource_id, now } => {
                let upcoming = engine
                    .upcoming(resource_id, now.unwrap_or_else(now_ms))
                    .map_err(engine_err)?;
                Ok(vec![query_response(allocation_schema(), upcoming, encode_allocation)])
            }
            Command::SelectDashboard { now } => {
                let summary = engine.dashboard_summary(now.unwrap_or_else(now_ms));
                Ok(vec![query_response(dashboard_schema(), vec![summary], encode_dashboard)])
            }
            Command::SelectRecentAllocations { now } => {
                let summary = engine.dashboard_summary(now.unwrap_or_else(now_ms));
                Ok(vec![query_response(
                    allocation_schema(),
                    summary.recent_allocations,
                    encode_allocation,
                )])
            }
        }
    }
}

fn to_span(span: Option<(Ms, Ms)>) -> PgWireResult<Option<Span>> {
    span.map(|(start, end)| Span::new(start, end))
        .transpose()
        .map_err(engine_err)
}

// ── Result encoding ──────────────────────────────────────────────

fn query_response<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_event(enc: &mut DataRowEncoder, e: &Event) -> PgWireResult<()> {
    enc.encode_field(&e.id.to_string())?;
    enc.encode_field(&e.title)?;
    enc.encode_field(&e.span.start())?;
    enc.encode_field(&e.span.end())?;
    enc.encode_field(&e.description)
}

fn encode_resource(enc: &mut DataRowEncoder, r: &Resource) -> PgWireResult<()> {
    enc.encode_field(&r.id.to_string())?;
    enc.encode_field(&r.name)?;
    enc.encode_field(&r.kind)?;
    enc.encode_field(&r.capacity.map(i64::from))
}

fn encode_allocation(enc: &mut DataRowEncoder, a: &Allocation) -> PgWireResult<()> {
    enc.encode_field(&a.id.to_string())?;
    enc.encode_field(&a.event_id.to_string())?;
    enc.encode_field(&a.resource_id.to_string())?;
    enc.encode_field(&a.span.start())?;
    enc.encode_field(&a.span.end())?;
    enc.encode_field(&a.custom_span)
}

fn encode_conflict(enc: &mut DataRowEncoder, c: &ConflictPair) -> PgWireResult<()> {
    enc.encode_field(&c.resource_id.to_string())?;
    enc.encode_field(&c.first.to_string())?;
    enc.encode_field(&c.second.to_string())
}

fn encode_verdict(enc: &mut DataRowEncoder, verdict: &Result<Span, EngineError>) -> PgWireResult<()> {
    match verdict {
        Ok(span) => {
            enc.encode_field(&true)?;
            enc.encode_field(&Some(span.start()))?;
            enc.encode_field(&Some(span.end()))?;
            enc.encode_field(&None::<String>)?;
            enc.encode_field(&None::<String>)?;
            enc.encode_field(&None::<String>)
        }
        Err(e) => {
            let blocking_id = match e {
                EngineError::Conflict(id) | EngineError::DuplicateAllocation(id) => Some(id.to_string()),
                _ => None,
            };
            enc.encode_field(&false)?;
            enc.encode_field(&None::<i64>)?;
            enc.encode_field(&None::<i64>)?;
            enc.encode_field(&Some(e.kind().to_string()))?;
            enc.encode_field(&blocking_id)?;
            enc.encode_field(&Some(e.to_string()))
        }
    }
}

fn encode_usage(enc: &mut DataRowEncoder, u: &UsageReport) -> PgWireResult<()> {
    enc.encode_field(&u.resource_id.to_string())?;
    enc.encode_field(&u.total_hours)?;
    enc.encode_field(&(u.allocation_count as i64))?;
    enc.encode_field(&u.utilization)?;
    enc.encode_field(&(u.upcoming.len() as i64))
}

fn encode_dashboard(enc: &mut DataRowEncoder, d: &DashboardSummary) -> PgWireResult<()> {
    enc.encode_field(&(d.active_event_count as i64))?;
    enc.encode_field(&(d.resource_count as i64))?;
    enc.encode_field(&d.overall_utilization)?;
    enc.encode_field(&(d.conflict_count as i64))
}

// ── Schemas ──────────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn event_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("title", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("description", Type::VARCHAR),
    ]
}

fn resource_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("capacity", Type::INT8),
    ]
}

fn allocation_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("event_id", Type::VARCHAR),
        field("resource_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("custom_span", Type::BOOL),
    ]
}

fn conflict_schema() -> Vec<FieldInfo> {
    vec![
        field("resource_id", Type::VARCHAR),
        field("first_id", Type::VARCHAR),
        field("second_id", Type::VARCHAR),
    ]
}

fn validate_schema() -> Vec<FieldInfo> {
    vec![
        field("accepted", Type::BOOL),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("reason", Type::VARCHAR),
        field("blocking_id", Type::VARCHAR),
        field("message", Type::VARCHAR),
    ]
}

fn usage_schema() -> Vec<FieldInfo> {
    vec![
        field("resource_id", Type::VARCHAR),
        field("total_hours", Type::FLOAT8),
        field("allocation_count", Type::INT8),
        field("utilization", Type::FLOAT8),
        field("upcoming_count", Type::INT8),
    ]
}

fn dashboard_schema() -> Vec<FieldInfo> {
    vec![
        field("active_event_count", Type::INT8),
        field("resource_count", Type::INT8),
        field("overall_utilization", Type::FLOAT8),
        field("conflict_count", Type::INT8),
    ]
}

/// Row shape of a SELECT, looked up by its FROM table. Empty for anything
/// that is not a known read.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match sql::select_table(sql).as_deref() {
        Some("events") => event_schema(),
        Some("resources") => resource_schema(),
        Some("allocations") | Some("upcoming") | Some("recent_allocations") => allocation_schema(),
        Some("conflicts") => conflict_schema(),
        Some("validate") => validate_schema(),
        Some("usage") => usage_schema(),
        Some("dashboard") => dashboard_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for ResallocHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ResallocQueryParser;

#[async_trait]
impl QueryParser for ResallocQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ResallocHandler {
    type Statement = String;
    type QueryParser = ResallocQueryParser;

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
        let mut responses = self.run(&sql).await?;
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// `$N` placeholders outside quoted literals and identifiers, as
/// (byte range, N).
fn placeholders(sql: &str) -> Vec<(std::ops::Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote inside a literal closes and reopens it, which
            // this toggle handles for free.
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let start = i;
                let mut j = i + 1;
                while j < bytes.len() && bytes[j].is_ascii_digit() {
                    j += 1;
                }
                if let Ok(n) = sql[start + 1..j].parse::<usize>() {
                    found.push((start..j, n));
                    i = j;
                    continue;
                }
            }
            None => {}
        }
        i += 1;
    }
    found
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Splice bound text parameters in as quoted literals, in one pass. Bound
/// values are copied through as-is, never rescanned. Numeric columns accept
/// quoted integers, so every value is quoted.
fn bind_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut last = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        result.push_str(&sql[last..range.start]);
        match param {
            Some(bytes) => {
                result.push('\'');
                result.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        last = range.end;
    }
    result.push_str(&sql[last..]);
    result
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ResallocFactory {
    handler: Arc<ResallocHandler>,
    noop: Arc<NoopHandler>,
}

impl ResallocFactory {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            handler: Arc::new(ResallocHandler::new(engine)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ResallocFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.noop.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(socket: TcpStream, factory: Arc<ResallocFactory>) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, None, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
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
