//! Relational side of a worker: one PostgreSQL session per worker.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio_postgres::{Client, NoTls, Row};

use crate::codec::{ResultRow, RESULT_ROW_COLUMNS};
use crate::config::RelationalLogin;
use crate::dispatcher::Connect;
use crate::error::{GrabError, Result};

const STORE_NAME: &str = "postgres";

/// Forward-only stream of decoded rows for one query.
pub type RowStream = BoxStream<'static, Result<ResultRow>>;

/// Runs the statements carried by a job on a connection owned by one worker.
#[async_trait]
pub trait QueryExecutor: Send + 'static {
    /// Run a setup statement for its side effect (usually a scratch table).
    async fn run_setup(&mut self, statement: &str) -> Result<()>;

    /// Run the main query with its single bind value.
    async fn query(&mut self, query_text: &str, parameter: &str) -> Result<RowStream>;
}

/// A worker's dedicated session. The background connection task ends once
/// the client is dropped.
pub struct PgExecutor {
    client: Client,
}

impl PgExecutor {
    pub async fn connect(login: &RelationalLogin) -> Result<Self> {
        let (client, connection) = login
            .to_pg_config()
            .connect(NoTls)
            .await
            .map_err(|err| {
                GrabError::connection(
                    STORE_NAME,
                    format!("connect to {}:{}/{}: {err}", login.host, login.port, login.dbname),
                )
            })?;

        let host = login.host.clone();
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::warn!(host = %host, error = %err, "postgres connection ended with error");
            }
        });

        // Ping before handing the session to a worker.
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|err| GrabError::connection(STORE_NAME, format!("ping failed: {err}")))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl QueryExecutor for PgExecutor {
    async fn run_setup(&mut self, statement: &str) -> Result<()> {
        self.client
            .batch_execute(statement)
            .await
            .map_err(|err| GrabError::QueryExecution(format!("setup statement failed: {err}")))
    }

    async fn query(&mut self, query_text: &str, parameter: &str) -> Result<RowStream> {
        let rows = self
            .client
            .query_raw(query_text, [parameter])
            .await
            .map_err(|err| GrabError::QueryExecution(format!("query failed: {err}")))?;

        Ok(rows
            .map(|row| match row {
                Ok(row) => scan_row(&row),
                Err(err) => Err(GrabError::QueryExecution(format!("row fetch failed: {err}"))),
            })
            .boxed())
    }
}

/// Positional access to one row's columns.
trait Columns {
    fn width(&self) -> usize;
    fn text(&self, idx: usize) -> std::result::Result<Option<String>, String>;
    fn int4(&self, idx: usize) -> std::result::Result<i32, String>;
    fn int8(&self, idx: usize) -> std::result::Result<i64, String>;
}

impl Columns for Row {
    fn width(&self) -> usize {
        self.len()
    }

    fn text(&self, idx: usize) -> std::result::Result<Option<String>, String> {
        self.try_get(idx).map_err(|err| err.to_string())
    }

    fn int4(&self, idx: usize) -> std::result::Result<i32, String> {
        self.try_get(idx).map_err(|err| err.to_string())
    }

    fn int8(&self, idx: usize) -> std::result::Result<i64, String> {
        self.try_get(idx).map_err(|err| err.to_string())
    }
}

/// Decode one relational row positionally into a `ResultRow`.
///
/// NULL text columns become empty strings; a short row or a non-integer
/// table index is malformed.
fn scan_row<C: Columns + ?Sized>(row: &C) -> Result<ResultRow> {
    if row.width() < RESULT_ROW_COLUMNS {
        return Err(GrabError::MalformedPayload(format!(
            "result row has {} columns, expected {RESULT_ROW_COLUMNS}",
            row.width()
        )));
    }

    let text = |idx: usize| -> Result<String> {
        row.text(idx)
            .map(Option::unwrap_or_default)
            .map_err(|err| GrabError::MalformedPayload(format!("column {idx}: {err}")))
    };
    let table_index = match row.int4(1) {
        Ok(v) => i64::from(v),
        Err(_) => row
            .int8(1)
            .map_err(|err| GrabError::MalformedPayload(format!("column 1: {err}")))?,
    };

    Ok(ResultRow {
        work_id: text(0)?,
        table_index,
        level_5: text(2)?,
        level_4: text(3)?,
        level_3: text(4)?,
        level_2: text(5)?,
        level_1: text(6)?,
        level_0: text(7)?,
        marked_up: text(8)?,
        accented: text(9)?,
        stripped: text(10)?,
        hyphenated: text(11)?,
        annotations: text(12)?,
    })
}

/// Opens one dedicated PostgreSQL session per worker.
#[derive(Debug, Clone)]
pub struct PgConnector {
    login: RelationalLogin,
}

impl PgConnector {
    pub fn new(login: RelationalLogin) -> Self {
        Self { login }
    }
}

#[async_trait]
impl Connect for PgConnector {
    type Conn = PgExecutor;

    async fn connect(&self, worker: usize) -> Result<PgExecutor> {
        let executor = PgExecutor::connect(&self.login).await?;
        tracing::debug!(
            worker,
            host = %self.login.host,
            port = self.login.port,
            dbname = %self.login.dbname,
            "connected to relational store"
        );
        Ok(executor)
    }
}
