//! Dry-run replay client for an update-stream server.
//!
//! Subscribes to a filtered binlog stream and renders the applied
//! transactions as a SQL script, the same shape a live player would execute.
//! Useful for turning a stream into a dump and for eyeballing what a
//! replication stream carries.

use std::fs::File;
use std::io::{IsTerminal, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use binlog_player::{BinlogPlayer, BlpPosition, DryRunDbClient, KeyRange, PlayerError};

/// CLI options for one replay run.
#[derive(Parser, Debug)]
#[command(name = "binlog-replay")]
struct Args {
    /// Update-stream server address, e.g. `127.0.0.1:6614`.
    #[arg(long)]
    server: String,

    /// Source shard uid; keys the checkpoint row named in the emitted
    /// UPDATE statements.
    #[arg(long)]
    uid: u32,

    /// Group id to resume after.
    #[arg(long)]
    group_id: i64,

    /// Comma-separated table list filter. Exactly one of `--tables` and
    /// `--key-range` must be given.
    #[arg(long, conflicts_with = "key_range")]
    tables: Option<String>,

    /// Key-range filter as hex endpoints, e.g. `40-80` (half-open).
    #[arg(long)]
    key_range: Option<String>,

    /// Stop once this group id is reached (0 runs until the stream ends).
    #[arg(long, default_value_t = 0)]
    stop_group_id: i64,

    /// Write the SQL script here instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
}

fn parse_key_range(raw: &str) -> anyhow::Result<KeyRange> {
    let (start, end) = raw
        .split_once('-')
        .with_context(|| format!("key range {raw:?} is not of the form start-end"))?;
    Ok(KeyRange {
        start: start.to_string(),
        end: end.to_string(),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stderr is a terminal and NO_COLOR is unset.
    let ansi = std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let sink: Box<dyn Write + Send> = match &args.out {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("create {}", path.display()))?,
        ),
        None => Box::new(std::io::stdout()),
    };
    let db_client = Box::new(DryRunDbClient::new(sink));

    let start = BlpPosition {
        uid: args.uid,
        group_id: args.group_id,
    };
    let mut player = match (&args.tables, &args.key_range) {
        (Some(tables), None) => BinlogPlayer::new_tables(
            db_client,
            &args.server,
            tables.split(',').map(str::to_string).collect(),
            start,
            args.stop_group_id,
        ),
        (None, Some(raw)) => BinlogPlayer::new_key_range(
            db_client,
            &args.server,
            parse_key_range(raw)?,
            start,
            args.stop_group_id,
        ),
        _ => anyhow::bail!("exactly one of --tables and --key-range is required"),
    };

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let outcome = player.run(&cancel).await;
    tracing::info!(stats = %player.stats_json(), "replay finished");
    match outcome {
        // A clean server close is a normal end for a dump run.
        Ok(()) | Err(PlayerError::ServerEof) => Ok(()),
        Err(err) => Err(err).context("binlog replay failed"),
    }
}
