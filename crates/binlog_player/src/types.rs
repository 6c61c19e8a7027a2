//! Shared types for the binlog player.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by both the player core and the transport layer, and they travel
//! over the framed update stream.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Marker prefixing statements that carry stream metadata in a leading
/// comment. The player never parses it; SQL passes through verbatim.
pub const STREAM_COMMENT_START: &[u8] = b"/* _stream ";

/// Position of one replication stream: which source shard it mirrors and the
/// group id of the last transaction fully applied locally.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlpPosition {
    /// Stable identity of this source-to-destination stream. Keys the
    /// checkpoint row; two players sharing a uid is operator error.
    pub uid: u32,
    /// Monotonic logical clock of the last applied transaction.
    pub group_id: i64,
}

/// Half-open sharding-key interval, endpoints encoded as hex byte-strings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: String,
    pub end: String,
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Server-side filter for the update stream. Exactly one variant is in
/// effect for the lifetime of a player.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selector {
    KeyRange(KeyRange),
    Tables(Vec<String>),
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::KeyRange(key_range) => write!(f, "keyrange '{key_range}'"),
            Selector::Tables(tables) => write!(f, "tables {tables:?}"),
        }
    }
}

/// Statement category as reported by the binlog parser on the server side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementCategory {
    Unrecognized,
    Begin,
    Commit,
    Rollback,
    Dml,
    Ddl,
    Set,
}

/// One statement of a binlog transaction. The SQL is carried as raw bytes;
/// the player hands it to the database without inspection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    pub category: StatementCategory,
    pub sql: Vec<u8>,
}

impl Statement {
    pub fn sql_string(&self) -> String {
        String::from_utf8_lossy(&self.sql).into_owned()
    }
}

/// One atomic unit of the update stream: an ordered list of statements to
/// replay under a single commit, tagged with the source group id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogTransaction {
    pub group_id: i64,
    pub statements: Vec<Statement>,
}
