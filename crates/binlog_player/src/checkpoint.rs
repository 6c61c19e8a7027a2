//! Checkpoint store: the single well-known row in `_vt.blp_checkpoint` that
//! records how far a replication stream has been applied.
//!
//! The row is pre-created by an external bootstrap step; the player only ever
//! reads it at startup and UPDATEs it inside each replicated transaction. The
//! caller owns transaction control; nothing here issues `begin`/`commit`.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::dbclient::DbClient;
use crate::player::PlayerError;
use crate::types::BlpPosition;

/// Fully qualified name of the checkpoint table.
pub const CHECKPOINT_TABLE: &str = "_vt.blp_checkpoint";

/// DDL for bootstrap tooling. The player itself never creates the table.
pub const CHECKPOINT_DDL: &str = "CREATE TABLE IF NOT EXISTS _vt.blp_checkpoint (
  source_shard_uid INTEGER NOT NULL,
  group_id BIGINT NOT NULL,
  time_updated BIGINT NOT NULL,
  PRIMARY KEY (source_shard_uid)
)";

/// Current wall-clock time as unix seconds (saturating).
pub fn unix_timestamp_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs().min(i64::MAX as u64) as i64)
        .unwrap_or(0)
}

pub fn select_start_position_sql(uid: u32) -> String {
    format!("SELECT group_id FROM {CHECKPOINT_TABLE} WHERE source_shard_uid={uid}")
}

/// The UPDATE applied inside every replicated transaction. Affecting any row
/// count other than 1 indicates a misconfigured table or uid mismatch.
pub fn update_recovery_sql(uid: u32, group_id: i64, time_updated: i64) -> String {
    format!(
        "UPDATE {CHECKPOINT_TABLE} SET group_id={group_id}, \
         time_updated={time_updated} WHERE source_shard_uid={uid}"
    )
}

/// Read the starting position for `uid` from the checkpoint table.
pub async fn read_start_position(
    dbc: &mut dyn DbClient,
    uid: u32,
) -> Result<BlpPosition, PlayerError> {
    let query = select_start_position_sql(uid);
    let result = dbc
        .execute_fetch(&query, 1, true)
        .await
        .map_err(|source| PlayerError::CheckpointRead { uid, source })?;
    if result.rows_affected != 1 {
        return Err(PlayerError::MissingCheckpoint { uid });
    }
    let cell = result
        .rows
        .first()
        .and_then(|row| row.first())
        .cloned()
        .flatten()
        .ok_or(PlayerError::MissingCheckpoint { uid })?;
    let group_id = cell
        .parse::<i64>()
        .map_err(|_| PlayerError::CheckpointParse { value: cell })?;
    Ok(BlpPosition { uid, group_id })
}
