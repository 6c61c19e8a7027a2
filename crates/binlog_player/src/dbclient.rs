//! Database client abstraction.
//!
//! The player talks to the local database through the [`DbClient`] capability
//! set. Two implementations exist: [`LiveDbClient`], which drives a real
//! session obtained from a [`SqlConnector`], and [`DryRunDbClient`], which
//! renders every statement as SQL text instead of executing it. The low-level
//! wire driver lives behind the connector seam; this module only owns session
//! lifecycle and error classification.

use std::io::{BufWriter, Write};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// Deadlock detected while executing a statement; the transaction should be
/// rolled back and retried.
pub const ER_LOCK_DEADLOCK: u16 = 1213;
/// Query was interrupted server-side; the session is no longer usable.
pub const ER_QUERY_INTERRUPTED: u16 = 1317;
/// Server has gone away; reported when the client has no open session.
pub const CR_SERVER_GONE_ERROR: u16 = 2006;

/// Inclusive range of client/connection error codes that invalidate the
/// session.
const CR_ERROR_FIRST: u16 = 2000;
const CR_ERROR_LAST: u16 = 2018;

/// Buffer size for dry-run output, matching the original dump writer.
const DUMP_BUFFER_BYTES: usize = 16 * 1024;

/// Error raised by the database layer, carrying the numeric SQL code the
/// player classifies on.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("sql error {code}: {message}")]
pub struct SqlError {
    pub code: u16,
    pub message: String,
}

impl SqlError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Deadlocks are the one retryable statement failure.
    pub fn is_deadlock(&self) -> bool {
        self.code == ER_LOCK_DEADLOCK
    }

    /// Connection-fatal errors invalidate the session; the next call must
    /// reconnect.
    pub fn is_connection_fatal(&self) -> bool {
        (CR_ERROR_FIRST..=CR_ERROR_LAST).contains(&self.code)
            || self.code == ER_QUERY_INTERRUPTED
    }
}

/// Result of one statement execution.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryResult {
    /// Column names, present only when the caller asked for fields.
    pub fields: Option<Vec<String>>,
    pub rows_affected: u64,
    pub insert_id: u64,
    /// Result rows, at most `max_rows` of them; `None` cells are SQL NULL.
    pub rows: Vec<Vec<Option<String>>>,
}

/// One open session on the underlying driver.
///
/// The wire protocol is out of scope for the player; embedders supply an
/// implementation wrapping their driver of choice, tests supply a scripted
/// one.
#[async_trait]
pub trait SqlConnection: Send {
    /// Execute one statement. `max_rows = 0` means no row limit (not "return
    /// zero rows"); `want_fields` controls column-metadata inclusion.
    async fn execute_fetch(
        &mut self,
        query: &str,
        max_rows: usize,
        want_fields: bool,
    ) -> Result<QueryResult, SqlError>;

    /// Release the session. Called at most once per connection.
    fn close(&mut self) {}
}

/// Factory for [`SqlConnection`]s, holding whatever addressing and
/// credentials the driver needs.
#[async_trait]
pub trait SqlConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn SqlConnection>, SqlError>;
}

/// Capability set shared by the live and dry-run clients.
#[async_trait]
pub trait DbClient: Send {
    /// Establish a session. Idempotent after [`DbClient::close`].
    async fn connect(&mut self) -> Result<(), SqlError>;
    async fn begin(&mut self) -> Result<(), SqlError>;
    async fn commit(&mut self) -> Result<(), SqlError>;
    async fn rollback(&mut self) -> Result<(), SqlError>;
    /// Release the session. Safe to call repeatedly.
    fn close(&mut self);
    /// Execute one statement; see [`SqlConnection::execute_fetch`] for the
    /// `max_rows`/`want_fields` contract.
    async fn execute_fetch(
        &mut self,
        query: &str,
        max_rows: usize,
        want_fields: bool,
    ) -> Result<QueryResult, SqlError>;
}

/// Client backed by a real driver session.
pub struct LiveDbClient {
    connector: Arc<dyn SqlConnector>,
    conn: Option<Box<dyn SqlConnection>>,
}

impl LiveDbClient {
    pub fn new(connector: Arc<dyn SqlConnector>) -> Self {
        Self {
            connector,
            conn: None,
        }
    }

    /// Invalidate the session on connection-fatal codes so the next call
    /// must reconnect. Non-fatal errors leave session state untouched.
    fn handle_error(&mut self, err: &SqlError) {
        if err.is_connection_fatal() {
            self.close_session();
        }
    }

    fn close_session(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
        }
    }

    async fn exec_on_session(
        &mut self,
        query: &str,
        max_rows: usize,
        want_fields: bool,
    ) -> Result<QueryResult, SqlError> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| SqlError::new(CR_SERVER_GONE_ERROR, "not connected"))?;
        conn.execute_fetch(query, max_rows, want_fields).await
    }
}

#[async_trait]
impl DbClient for LiveDbClient {
    async fn connect(&mut self) -> Result<(), SqlError> {
        self.close_session();
        self.conn = Some(self.connector.connect().await?);
        Ok(())
    }

    async fn begin(&mut self) -> Result<(), SqlError> {
        if let Err(err) = self.exec_on_session("begin", 1, false).await {
            tracing::error!(error = %err, "BEGIN failed");
            self.handle_error(&err);
            return Err(err);
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), SqlError> {
        if let Err(err) = self.exec_on_session("commit", 1, false).await {
            tracing::error!(error = %err, "COMMIT failed");
            self.close_session();
            return Err(err);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), SqlError> {
        if let Err(err) = self.exec_on_session("rollback", 1, false).await {
            tracing::error!(error = %err, "ROLLBACK failed");
            self.close_session();
            return Err(err);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.close_session();
    }

    async fn execute_fetch(
        &mut self,
        query: &str,
        max_rows: usize,
        want_fields: bool,
    ) -> Result<QueryResult, SqlError> {
        match self.exec_on_session(query, max_rows, want_fields).await {
            Ok(result) => Ok(result),
            Err(err) => {
                tracing::error!(error = %err, "execute_fetch failed");
                self.handle_error(&err);
                Err(err)
            }
        }
    }
}

/// Client that writes statements to an output sink instead of executing
/// them. Used for generating SQL dumps and for tests.
pub struct DryRunDbClient {
    out: BufWriter<Box<dyn Write + Send>>,
}

impl DryRunDbClient {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: BufWriter::with_capacity(DUMP_BUFFER_BYTES, out),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    fn write_statement(&mut self, sql: &str) -> Result<(), SqlError> {
        self.out
            .write_all(sql.as_bytes())
            .and_then(|_| self.out.write_all(b";\n"))
            .map_err(|err| SqlError::new(0, format!("dry-run write failed: {err}")))
    }
}

#[async_trait]
impl DbClient for DryRunDbClient {
    async fn connect(&mut self) -> Result<(), SqlError> {
        Ok(())
    }

    async fn begin(&mut self) -> Result<(), SqlError> {
        self.write_statement("BEGIN")
    }

    async fn commit(&mut self) -> Result<(), SqlError> {
        self.write_statement("COMMIT")
    }

    async fn rollback(&mut self) -> Result<(), SqlError> {
        self.write_statement("ROLLBACK")
    }

    fn close(&mut self) {
        let _ = self.out.flush();
    }

    async fn execute_fetch(
        &mut self,
        query: &str,
        _max_rows: usize,
        _want_fields: bool,
    ) -> Result<QueryResult, SqlError> {
        self.write_statement(query)?;
        Ok(QueryResult {
            fields: None,
            rows_affected: 1,
            insert_id: 0,
            rows: Vec::new(),
        })
    }
}

impl Drop for DryRunDbClient {
    fn drop(&mut self) {
        let _ = self.out.flush();
    }
}
