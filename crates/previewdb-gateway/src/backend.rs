//! Backend stores and the execution adapter
//!
//! A [`Backend`] runs parameterless text SQL and yields a stream of
//! [`BackendEvent`]s: a column description before the first row of each
//! result set, one event per row with every value rendered as text, and a
//! completion per statement. Nothing is buffered beyond the row in flight.
//!
//! A client session that opens a transaction or changes session settings
//! checks out a [`PinnedConnection`] and keeps it until the block ends.

use crate::errors::sqlstate;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use previewdb_common::DbConfig;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions, PgQueryResult, PgRow};
use sqlx::{Column, Either, Executor, Postgres, Row, TypeInfo};
use std::fmt;
use tracing::{debug, info};

/// Which store a handle points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendRole {
    Production,
    Fresh,
}

impl BackendRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendRole::Production => "production",
            BackendRole::Fresh => "fresh",
        }
    }
}

impl fmt::Display for BackendRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result column metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    /// PostgreSQL type name (`INT4`, `TEXT`, ...)
    pub type_name: String,
}

/// One row, every value in PostgreSQL text form
pub type TextRow = Vec<Option<String>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// Columns of the result set whose rows follow
    ///
    /// Built from the first row, so a read that returns no rows yields no
    /// `Describe` and the client gets a RowDescription with zero columns.
    /// Clients that need the column list of an empty result should use the
    /// extended protocol's Describe, which asks the store without running
    /// the query.
    Describe(Vec<ColumnMeta>),
    Row(TextRow),
    /// One statement finished
    Complete { rows_affected: u64 },
}

/// Execution failure reported by a backend
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// The database rejected the statement
    #[error("{message}")]
    Database {
        code: Option<String>,
        message: String,
        detail: Option<String>,
        hint: Option<String>,
    },

    /// The store could not be reached or the connection broke
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Protocol(String),
}

impl BackendError {
    /// SQLSTATE reported by the database, if any
    pub fn code(&self) -> Option<&str> {
        match self {
            BackendError::Database { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for BackendError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => {
                let pg = db.try_downcast_ref::<sqlx::postgres::PgDatabaseError>();
                BackendError::Database {
                    code: db.code().map(|c| c.into_owned()),
                    message: db.message().to_string(),
                    detail: pg.and_then(|e| e.detail()).map(str::to_string),
                    hint: pg.and_then(|e| e.hint()).map(str::to_string),
                }
            }
            sqlx::Error::Io(e) => BackendError::Unavailable(e.to_string()),
            sqlx::Error::Tls(e) => BackendError::Unavailable(e.to_string()),
            sqlx::Error::PoolTimedOut => {
                BackendError::Unavailable("timed out acquiring a connection".into())
            }
            sqlx::Error::PoolClosed => BackendError::Unavailable("connection pool closed".into()),
            other => BackendError::Protocol(other.to_string()),
        }
    }
}

/// Transaction status of a connection, as reported in ReadyForQuery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    InTransaction,
    /// Inside a block that hit an error; only ROLLBACK gets out
    Failed,
}

/// Statement metadata obtained without executing it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatementDescription {
    /// Parameter type names (`INT4`, `TEXT`, ...) in `$n` order
    pub parameters: Vec<String>,
    /// Result columns; empty for statements that return no rows
    pub columns: Vec<ColumnMeta>,
}

pub type BackendStream<'a> = BoxStream<'a, Result<BackendEvent, BackendError>>;

/// A store the router can send queries to
#[async_trait]
pub trait Backend: Send + Sync {
    fn role(&self) -> BackendRole;

    /// Run `sql` (one or more statements) and stream its results
    fn query<'a>(&'a self, sql: &'a str) -> BackendStream<'a>;

    /// Check out a connection reserved for one client session
    async fn pin(&self) -> Result<Box<dyn PinnedConnection>, BackendError>;

    /// Parameter and result metadata of a single statement
    async fn describe(&self, sql: &str) -> Result<StatementDescription, BackendError>;
}

/// A backend connection held by one client session across messages
#[async_trait]
pub trait PinnedConnection: Send {
    fn query<'a>(&'a mut self, sql: &'a str) -> BackendStream<'a>;

    /// Where the connection stands after the last query
    async fn transaction_status(&mut self) -> Result<TransactionState, BackendError>;

    async fn describe(&mut self, sql: &str) -> Result<StatementDescription, BackendError>;

    /// Discard the connection instead of returning it to the pool
    async fn close(self: Box<Self>);
}

/// Run `sql` to completion, discarding rows; returns the last row count
pub async fn execute(backend: &dyn Backend, sql: &str) -> Result<u64, BackendError> {
    let mut stream = backend.query(sql);
    let mut affected = 0;
    while let Some(event) = stream.next().await {
        if let BackendEvent::Complete { rows_affected } = event? {
            affected = rows_affected;
        }
    }
    Ok(affected)
}

/// Run `sql` and collect its rows
pub async fn fetch_rows(backend: &dyn Backend, sql: &str) -> Result<Vec<TextRow>, BackendError> {
    fetch_text(backend.query(sql)).await
}

/// Liveness probe
pub async fn ping(backend: &dyn Backend) -> Result<(), BackendError> {
    execute(backend, "SELECT 1").await.map(|_| ())
}

/// PostgreSQL store behind a sqlx pool
pub struct PgBackend {
    role: BackendRole,
    pool: PgPool,
}

impl PgBackend {
    /// Connect a pool and verify the store answers
    pub async fn connect(role: BackendRole, config: &DbConfig) -> anyhow::Result<Self> {
        info!(backend = %role, target = %config.display_target(), "Connecting to backend");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout())
            .connect_with(config.connect_options()?)
            .await
            .map_err(|e| anyhow::anyhow!("failed to connect to {} store: {}", role, e))?;

        info!(backend = %role, "Backend connection established");
        Ok(Self { role, pool })
    }

    pub fn from_pool(role: BackendRole, pool: PgPool) -> Self {
        Self { role, pool }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Backend for PgBackend {
    fn role(&self) -> BackendRole {
        self.role
    }

    fn query<'a>(&'a self, sql: &'a str) -> BackendStream<'a> {
        // Simple-query protocol: multiple statements allowed, rows arrive as text
        into_events(self.pool.fetch_many(sqlx::raw_sql(sql)))
    }

    async fn pin(&self) -> Result<Box<dyn PinnedConnection>, BackendError> {
        let conn = self.pool.acquire().await?;
        debug!(backend = %self.role, "Pinned a connection");
        Ok(Box::new(PgPinned { conn }))
    }

    async fn describe(&self, sql: &str) -> Result<StatementDescription, BackendError> {
        describe_with(&self.pool, sql).await
    }
}

/// A pool connection checked out for one session
struct PgPinned {
    conn: PoolConnection<Postgres>,
}

#[async_trait]
impl PinnedConnection for PgPinned {
    fn query<'a>(&'a mut self, sql: &'a str) -> BackendStream<'a> {
        into_events((&mut *self.conn).fetch_many(sqlx::raw_sql(sql)))
    }

    async fn transaction_status(&mut self) -> Result<TransactionState, BackendError> {
        // now() is frozen at the start of an open block and equals the
        // statement timestamp only in an implicit, single-statement transaction
        let rows = fetch_text(self.query("SELECT now() = statement_timestamp()")).await;
        match rows {
            Ok(rows) => match rows.first().and_then(|r| r.first()).cloned().flatten().as_deref() {
                Some("t") => Ok(TransactionState::Idle),
                Some(_) => Ok(TransactionState::InTransaction),
                None => Err(BackendError::Protocol("empty transaction status".into())),
            },
            Err(err) if err.code() == Some(sqlstate::IN_FAILED_SQL_TRANSACTION) => {
                Ok(TransactionState::Failed)
            }
            Err(err) => Err(err),
        }
    }

    async fn describe(&mut self, sql: &str) -> Result<StatementDescription, BackendError> {
        describe_with(&mut *self.conn, sql).await
    }

    async fn close(self: Box<Self>) {
        let PgPinned { conn } = *self;
        if let Err(e) = conn.close().await {
            debug!(error = %e, "Error closing pinned connection");
        }
    }
}

/// Turn sqlx's simple-query results into backend events
fn into_events<'a>(
    results: BoxStream<'a, Result<Either<PgQueryResult, PgRow>, sqlx::Error>>,
) -> BackendStream<'a> {
    let mut described = false;

    results
        .flat_map(move |item| {
            let events = match item {
                Ok(Either::Left(done)) => {
                    described = false;
                    vec![Ok(BackendEvent::Complete {
                        rows_affected: done.rows_affected(),
                    })]
                }
                Ok(Either::Right(row)) => {
                    let mut events = Vec::with_capacity(2);
                    if !described {
                        described = true;
                        events.push(Ok(BackendEvent::Describe(describe_row(&row))));
                    }
                    events.push(text_values(&row).map(BackendEvent::Row));
                    events
                }
                Err(e) => vec![Err(BackendError::from(e))],
            };
            stream::iter(events)
        })
        .boxed()
}

async fn describe_with<'c, E>(executor: E, sql: &str) -> Result<StatementDescription, BackendError>
where
    E: Executor<'c, Database = Postgres>,
{
    let described = executor.describe(sql).await?;

    let parameters = match described.parameters() {
        Some(Either::Left(types)) => types.iter().map(|t| t.name().to_string()).collect(),
        Some(Either::Right(count)) => vec![String::from("UNKNOWN"); count],
        None => Vec::new(),
    };
    let columns = described
        .columns()
        .iter()
        .map(|col| ColumnMeta {
            name: col.name().to_string(),
            type_name: col.type_info().name().to_string(),
        })
        .collect();

    Ok(StatementDescription {
        parameters,
        columns,
    })
}

async fn fetch_text(mut stream: BackendStream<'_>) -> Result<Vec<TextRow>, BackendError> {
    let mut rows = Vec::new();
    while let Some(event) = stream.next().await {
        if let BackendEvent::Row(row) = event? {
            rows.push(row);
        }
    }
    Ok(rows)
}

fn describe_row(row: &PgRow) -> Vec<ColumnMeta> {
    row.columns()
        .iter()
        .map(|col| ColumnMeta {
            name: col.name().to_string(),
            type_name: col.type_info().name().to_string(),
        })
        .collect()
}

fn text_values(row: &PgRow) -> Result<TextRow, BackendError> {
    (0..row.len())
        .map(|i| {
            row.try_get_unchecked::<Option<String>, _>(i)
                .map_err(|e| BackendError::Protocol(format!("column {}: {}", i, e)))
        })
        .collect()
}

/// PostgreSQL command tag for a finished statement
pub fn command_tag(keyword: &str, rows: u64) -> String {
    match keyword {
        "SELECT" => format!("SELECT {}", rows),
        "INSERT" => format!("INSERT 0 {}", rows),
        "UPDATE" | "DELETE" | "MERGE" | "COPY" | "FETCH" | "MOVE" => format!("{} {}", keyword, rows),
        "" => "OK".to_string(),
        other => other.to_string(),
    }
}

/// Whether a completed statement of this kind returns a row set
pub fn returns_rows(keyword: &str) -> bool {
    matches!(keyword, "SELECT" | "SHOW" | "FETCH" | "EXPLAIN" | "VALUES" | "TABLE")
}
