//! Binlog player: the data plane of shard-to-shard asynchronous replication.
//!
//! A player subscribes to a source shard's update stream, filtered by key
//! range or table list, and replays each binlog transaction into the local
//! database. The checkpoint row in `_vt.blp_checkpoint` is updated inside
//! every replicated transaction, so the persisted position can never get
//! ahead of the applied state. Deadlocks roll back and retry; connection
//! and statement failures surface to the caller, which owns restart policy.

pub mod checkpoint;
pub mod dbclient;
pub mod player;
pub mod stats;
pub mod transport;
pub mod types;

pub use checkpoint::read_start_position;
pub use dbclient::{
    DbClient, DryRunDbClient, LiveDbClient, QueryResult, SqlConnection, SqlConnector, SqlError,
};
pub use player::{BinlogPlayer, PlayerError, DEADLOCK_RETRY_DELAY, SLOW_QUERY_THRESHOLD};
pub use stats::PlayerStats;
pub use transport::{StreamError, StreamRequest, TransactionStream, UpdateStreamClient};
pub use types::{
    BinlogTransaction, BlpPosition, KeyRange, Selector, Statement, StatementCategory,
};
