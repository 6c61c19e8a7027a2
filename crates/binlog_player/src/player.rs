//! The binlog player: consumes an ordered stream of binlog transactions and
//! applies each one atomically to the local database, advancing the
//! checkpoint row inside the same commit.
//!
//! A single applier owns the database client and drives transactions
//! strictly in arrival order. The stream reader runs as an independent
//! producer behind a bounded queue; cancellation is cooperative and observed
//! only between whole transactions, which keeps the on-disk invariant (the
//! checkpoint never leads applied state) trivially true.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::checkpoint;
use crate::dbclient::{DbClient, QueryResult, SqlError};
use crate::stats::PlayerStats;
use crate::transport::{StreamError, StreamRequest, UpdateStreamClient};
use crate::types::{BinlogTransaction, BlpPosition, KeyRange, Selector};

/// Statements slower than this are logged with their SQL text.
pub const SLOW_QUERY_THRESHOLD: Duration = Duration::from_millis(100);
/// Delay between attempts of a deadlocked transaction.
pub const DEADLOCK_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Terminal outcome of the player, other than cancellation and the stop
/// point (which return `Ok`).
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("starting point {start} greater than stopping point {stop}")]
    StartAfterStop { start: i64, stop: i64 },
    /// The server closed the stream without error; a supervising controller
    /// typically restarts the player later.
    #[error("update stream closed by server")]
    ServerEof,
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("failed query {verb}: {source}")]
    TxnControl {
        verb: &'static str,
        #[source]
        source: SqlError,
    },
    #[error("error writing recovery info {query}: {source}")]
    RecoveryWrite {
        query: String,
        #[source]
        source: SqlError,
    },
    #[error("cannot update checkpoint table for uid {uid}, affected {rows} rows")]
    CheckpointRows { uid: u32, rows: u64 },
    #[error("error applying binlog statement: {source}")]
    Statement {
        #[source]
        source: SqlError,
    },
    #[error("error reading checkpoint for uid {uid}: {source}")]
    CheckpointRead {
        uid: u32,
        #[source]
        source: SqlError,
    },
    #[error("checkpoint information not available in db for uid {uid}")]
    MissingCheckpoint { uid: u32 },
    #[error("malformed checkpoint group id {value:?}")]
    CheckpointParse { value: String },
}

/// Replays one filtered update stream into the local database.
pub struct BinlogPlayer {
    addr: String,
    db_client: Box<dyn DbClient>,
    selector: Selector,
    position: BlpPosition,
    stop_at_group_id: i64,
    stats: Arc<PlayerStats>,
}

impl BinlogPlayer {
    /// Player for the server-side key-range filter, starting at
    /// `start.group_id` and updating the checkpoint row for `start.uid`.
    /// A non-zero `stop_at_group_id` stops the player at that group id.
    pub fn new_key_range(
        db_client: Box<dyn DbClient>,
        addr: impl Into<String>,
        key_range: KeyRange,
        start: BlpPosition,
        stop_at_group_id: i64,
    ) -> Self {
        Self::new(db_client, addr, Selector::KeyRange(key_range), start, stop_at_group_id)
    }

    /// Player for the server-side table-list filter; see
    /// [`BinlogPlayer::new_key_range`] for the position/stop contract.
    pub fn new_tables(
        db_client: Box<dyn DbClient>,
        addr: impl Into<String>,
        tables: Vec<String>,
        start: BlpPosition,
        stop_at_group_id: i64,
    ) -> Self {
        Self::new(db_client, addr, Selector::Tables(tables), start, stop_at_group_id)
    }

    fn new(
        db_client: Box<dyn DbClient>,
        addr: impl Into<String>,
        selector: Selector,
        start: BlpPosition,
        stop_at_group_id: i64,
    ) -> Self {
        Self {
            addr: addr.into(),
            db_client,
            selector,
            position: start,
            stop_at_group_id,
            stats: Arc::new(PlayerStats::new()),
        }
    }

    /// Last applied position. Advances only on successful commits, except
    /// that a transaction failing after its checkpoint write leaves the
    /// in-memory group id ahead of the database (the player is about to
    /// return that failure anyway).
    pub fn position(&self) -> BlpPosition {
        self.position
    }

    pub fn stats(&self) -> Arc<PlayerStats> {
        Arc::clone(&self.stats)
    }

    pub fn stats_json(&self) -> String {
        self.stats.json_snapshot()
    }

    /// Execute one statement, counting it and its wall time whether or not
    /// it succeeds.
    async fn exec(&mut self, sql: &str) -> Result<QueryResult, SqlError> {
        let start = Instant::now();
        let result = self.db_client.execute_fetch(sql, 0, false).await;
        self.stats.record_query(start);
        let elapsed = start.elapsed();
        if elapsed > SLOW_QUERY_THRESHOLD {
            tracing::info!(elapsed_ms = elapsed.as_millis() as u64, sql, "slow query");
        }
        result
    }

    /// Advance the in-memory position and write the checkpoint row. Runs
    /// inside the transaction the caller has already begun.
    async fn write_recovery_position(&mut self, group_id: i64) -> Result<(), PlayerError> {
        self.position.group_id = group_id;
        let query = checkpoint::update_recovery_sql(
            self.position.uid,
            group_id,
            checkpoint::unix_timestamp_secs(),
        );
        let result = self
            .exec(&query)
            .await
            .map_err(|source| PlayerError::RecoveryWrite {
                query: query.clone(),
                source,
            })?;
        if result.rows_affected != 1 {
            return Err(PlayerError::CheckpointRows {
                uid: self.position.uid,
                rows: result.rows_affected,
            });
        }
        Ok(())
    }

    /// Apply one transaction atomically: begin, checkpoint write, each
    /// statement in order, commit.
    ///
    /// Returns `Ok(true)` when the transaction committed, `Ok(false)` when a
    /// statement deadlocked and the transaction was rolled back for retry.
    /// Any other failure is returned as the error; connection-fatal SQL
    /// errors have already closed the session inside the client.
    pub async fn process_transaction(
        &mut self,
        tx: &BinlogTransaction,
    ) -> Result<bool, PlayerError> {
        let txn_start = Instant::now();
        self.db_client
            .begin()
            .await
            .map_err(|source| PlayerError::TxnControl {
                verb: "BEGIN",
                source,
            })?;
        self.write_recovery_position(tx.group_id).await?;
        for statement in &tx.statements {
            match self.exec(&statement.sql_string()).await {
                Ok(_) => {}
                Err(err) if err.is_deadlock() => {
                    tracing::info!(group_id = tx.group_id, error = %err, "deadlock");
                    self.db_client
                        .rollback()
                        .await
                        .map_err(|source| PlayerError::TxnControl {
                            verb: "ROLLBACK",
                            source,
                        })?;
                    return Ok(false);
                }
                Err(source) => return Err(PlayerError::Statement { source }),
            }
        }
        self.db_client
            .commit()
            .await
            .map_err(|source| PlayerError::TxnControl {
                verb: "COMMIT",
                source,
            })?;
        self.stats.record_txn(txn_start);
        Ok(true)
    }

    /// Subscribe to the update stream and apply transactions until a
    /// terminal condition.
    ///
    /// Returns `Ok(())` when `cancel` fires or the configured stop group id
    /// is reached, `Err(ServerEof)` when the server closes the stream
    /// cleanly, and any other error as-is. The stream connection is released
    /// on every exit path.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), PlayerError> {
        tracing::info!(
            uid = self.position.uid,
            selector = %self.selector,
            group_id = self.position.group_id,
            server = %self.addr,
            "binlog player starting"
        );
        if self.stop_at_group_id > 0 {
            if self.position.group_id > self.stop_at_group_id {
                return Err(PlayerError::StartAfterStop {
                    start: self.position.group_id,
                    stop: self.stop_at_group_id,
                });
            }
            if self.position.group_id == self.stop_at_group_id {
                tracing::info!(
                    stop_at_group_id = self.stop_at_group_id,
                    "not starting, already at the desired position"
                );
                return Ok(());
            }
            tracing::info!(
                stop_at_group_id = self.stop_at_group_id,
                "will stop player on reaching stop position"
            );
        }

        let client = UpdateStreamClient::dial(&self.addr).await?;
        let request = match &self.selector {
            Selector::Tables(tables) => StreamRequest::Tables {
                tables: tables.clone(),
                group_id: self.position.group_id,
            },
            Selector::KeyRange(key_range) => StreamRequest::KeyRange {
                key_range: key_range.clone(),
                group_id: self.position.group_id,
            },
        };
        let mut stream = client.stream(&request).await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                maybe_tx = stream.recv() => {
                    let Some(tx) = maybe_tx else { break };
                    // Retry loop: a deadlocked transaction is replayed with
                    // identical statements, unbounded; operators watch the
                    // logs and stats for a stuck retry.
                    loop {
                        if self.process_transaction(&tx).await? {
                            if self.stop_at_group_id > 0
                                && self.position.group_id >= self.stop_at_group_id
                            {
                                tracing::info!(
                                    group_id = self.position.group_id,
                                    "reached stopping position, done playing logs"
                                );
                                return Ok(());
                            }
                            break;
                        }
                        tracing::info!(group_id = tx.group_id, "retrying txn");
                        tokio::time::sleep(DEADLOCK_RETRY_DELAY).await;
                    }
                }
            }
        }

        stream.finish().await?;
        Err(PlayerError::ServerEof)
    }
}
