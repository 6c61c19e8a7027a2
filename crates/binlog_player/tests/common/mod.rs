//! Shared helpers for integration tests: a scripted SQL connector that
//! records every statement the player issues, and a real-TCP update-stream
//! server fed frame by frame from the test body.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use binlog_player::transport::{StreamFrame, StreamRequest};
use binlog_player::{
    BinlogPlayer, BinlogTransaction, PlayerError, QueryResult, SqlConnection, SqlConnector,
    SqlError, Statement, StatementCategory,
};

/// Upper bound for any wait in the test suite.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Observable state shared between a test body and its scripted sessions.
#[derive(Default)]
pub struct DbState {
    /// Every statement executed, in order, including transaction verbs.
    pub log: Mutex<Vec<String>>,
    /// Errors to inject: the front entry fires on the first statement
    /// containing its pattern, then is consumed.
    pub fail_next: Mutex<VecDeque<(String, SqlError)>>,
    /// Value served by checkpoint SELECTs and updated by checkpoint UPDATEs.
    pub checkpoint_group_id: Mutex<Option<i64>>,
    /// Rows-affected reported for checkpoint UPDATEs.
    pub checkpoint_update_rows: Mutex<u64>,
    pub connects: AtomicUsize,
    pub session_closes: AtomicUsize,
}

impl DbState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            checkpoint_update_rows: Mutex::new(1),
            ..Self::default()
        })
    }

    pub fn with_checkpoint(group_id: i64) -> Arc<Self> {
        let state = Self::new();
        *state.checkpoint_group_id.lock().unwrap() = Some(group_id);
        state
    }

    pub fn fail_statement_containing(&self, pattern: &str, err: SqlError) {
        self.fail_next
            .lock()
            .unwrap()
            .push_back((pattern.to_string(), err));
    }

    pub fn statements(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count_matching(&self, pattern: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|stmt| stmt.contains(pattern))
            .count()
    }

    pub fn checkpoint(&self) -> Option<i64> {
        *self.checkpoint_group_id.lock().unwrap()
    }
}

/// Connector handing out sessions that execute against [`DbState`].
pub struct ScriptedConnector {
    state: Arc<DbState>,
}

impl ScriptedConnector {
    pub fn new(state: Arc<DbState>) -> Arc<Self> {
        Arc::new(Self { state })
    }
}

#[async_trait]
impl SqlConnector for ScriptedConnector {
    async fn connect(&self) -> Result<Box<dyn SqlConnection>, SqlError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            state: Arc::clone(&self.state),
        }))
    }
}

struct ScriptedSession {
    state: Arc<DbState>,
}

#[async_trait]
impl SqlConnection for ScriptedSession {
    async fn execute_fetch(
        &mut self,
        query: &str,
        max_rows: usize,
        want_fields: bool,
    ) -> Result<QueryResult, SqlError> {
        self.state.log.lock().unwrap().push(query.to_string());

        let injected = {
            let mut fail_next = self.state.fail_next.lock().unwrap();
            match fail_next.front() {
                Some((pattern, _)) if query.contains(pattern.as_str()) => {
                    fail_next.pop_front().map(|(_, err)| err)
                }
                _ => None,
            }
        };
        if let Some(err) = injected {
            return Err(err);
        }

        if query.starts_with("SELECT group_id FROM _vt.blp_checkpoint") {
            return Ok(match self.state.checkpoint() {
                Some(group_id) => QueryResult {
                    fields: want_fields.then(|| vec!["group_id".to_string()]),
                    rows_affected: 1,
                    insert_id: 0,
                    rows: vec![vec![Some(group_id.to_string())]]
                        .into_iter()
                        .take(max_rows.max(1))
                        .collect(),
                },
                None => QueryResult::default(),
            });
        }

        if let Some(rest) = query.strip_prefix("UPDATE _vt.blp_checkpoint SET group_id=") {
            let group_id = rest
                .split(',')
                .next()
                .and_then(|field| field.parse::<i64>().ok())
                .ok_or_else(|| SqlError::new(0, format!("unparseable checkpoint update {query}")))?;
            let rows_affected = *self.state.checkpoint_update_rows.lock().unwrap();
            if rows_affected == 1 {
                *self.state.checkpoint_group_id.lock().unwrap() = Some(group_id);
            }
            return Ok(QueryResult {
                rows_affected,
                ..QueryResult::default()
            });
        }

        let rows_affected = match query {
            "begin" | "commit" | "rollback" => 0,
            _ => 1,
        };
        Ok(QueryResult {
            rows_affected,
            ..QueryResult::default()
        })
    }

    fn close(&mut self) {
        self.state.session_closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// One-connection update-stream server the test feeds frame by frame.
/// Dropping the frame sender (via [`StreamServer::close`]) closes the stream
/// cleanly after all queued frames have been sent.
pub struct StreamServer {
    pub addr: String,
    frame_tx: Option<mpsc::UnboundedSender<StreamFrame>>,
    request_rx: Option<oneshot::Receiver<StreamRequest>>,
    task: JoinHandle<()>,
}

impl StreamServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<StreamFrame>();
        let (request_tx, request_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let mut framed = Framed::new(socket, LengthDelimitedCodec::new());
            let Some(Ok(request)) = framed.next().await else {
                return;
            };
            if let Ok(request) = serde_json::from_slice::<StreamRequest>(&request) {
                let _ = request_tx.send(request);
            }
            while let Some(frame) = frame_rx.recv().await {
                let payload = serde_json::to_vec(&frame).unwrap();
                // The client may already be gone (stop point, cancellation).
                if framed.send(Bytes::from(payload)).await.is_err() {
                    return;
                }
            }
        });

        Self {
            addr,
            frame_tx: Some(frame_tx),
            request_rx: Some(request_rx),
            task,
        }
    }

    pub fn send_txn(&self, tx: BinlogTransaction) {
        self.frame_tx
            .as_ref()
            .expect("stream already closed")
            .send(StreamFrame::Transaction(tx))
            .unwrap();
    }

    pub fn send_error(&self, message: &str) {
        self.frame_tx
            .as_ref()
            .expect("stream already closed")
            .send(StreamFrame::Error {
                message: message.to_string(),
            })
            .unwrap();
    }

    /// Close the stream cleanly once all queued frames have been delivered.
    pub fn close(&mut self) {
        self.frame_tx = None;
    }

    pub async fn await_request(&mut self) -> StreamRequest {
        self.request_rx
            .take()
            .expect("request already consumed")
            .await
            .expect("server saw no request")
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Build a one-statement DML transaction.
pub fn txn(group_id: i64, statements: &[&str]) -> BinlogTransaction {
    BinlogTransaction {
        group_id,
        statements: statements
            .iter()
            .map(|sql| Statement {
                category: StatementCategory::Dml,
                sql: sql.as_bytes().to_vec(),
            })
            .collect(),
    }
}

/// Run the player on a background task, returning it with the outcome so
/// tests can inspect the final position and stats.
pub fn spawn_player(
    mut player: BinlogPlayer,
    cancel: CancellationToken,
) -> JoinHandle<(BinlogPlayer, Result<(), PlayerError>)> {
    tokio::spawn(async move {
        let outcome = player.run(&cancel).await;
        (player, outcome)
    })
}

/// Poll `pred` until it holds or the suite timeout expires.
pub async fn wait_until(context: &str, mut pred: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while !pred() {
        if Instant::now() >= deadline {
            panic!("timeout waiting for {context}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
