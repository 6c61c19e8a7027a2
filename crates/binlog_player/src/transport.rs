//! Client side of the update-stream RPC surface.
//!
//! The server exposes two streaming methods, `UpdateStream.StreamKeyRange`
//! and `UpdateStream.StreamTables`, each delivering a lazy ordered sequence
//! of binlog transactions with a terminal status. The wire shape here is a
//! length-delimited framed TCP stream carrying JSON payloads: one request
//! frame from the client, then transaction frames from the server until a
//! clean close (end of stream) or an error frame.
//!
//! A spawned reader task owns the connection and forwards transactions into
//! a bounded queue; dropping the [`TransactionStream`] aborts the task and
//! releases the socket, so every exit path from the dispatch loop releases
//! the connection.

use std::io;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::types::{BinlogTransaction, KeyRange};

/// Capacity of the in-flight transaction queue between the stream reader and
/// the applier.
pub const STREAM_QUEUE_CAPACITY: usize = 16;

/// Transport-level failure of the update stream.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("error dialing binlog server {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("update stream i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to decode update stream frame: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("error received from update stream: {0}")]
    Server(String),
    #[error("update stream reader terminated unexpectedly")]
    Lost,
}

/// Request opening one filtered subscription. Carries the *starting* group
/// id; the server resumes strictly after it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "method", content = "request")]
pub enum StreamRequest {
    #[serde(rename = "UpdateStream.StreamKeyRange")]
    KeyRange { key_range: KeyRange, group_id: i64 },
    #[serde(rename = "UpdateStream.StreamTables")]
    Tables { tables: Vec<String>, group_id: i64 },
}

/// One frame sent by the server on an open stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamFrame {
    Transaction(BinlogTransaction),
    Error { message: String },
}

/// A dialed but not yet subscribed connection to the update-stream server.
pub struct UpdateStreamClient {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl UpdateStreamClient {
    pub async fn dial(addr: &str) -> Result<Self, StreamError> {
        let socket = TcpStream::connect(addr)
            .await
            .map_err(|source| StreamError::Dial {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self {
            framed: Framed::new(socket, LengthDelimitedCodec::new()),
        })
    }

    /// Send the subscription request and hand the connection to a reader
    /// task that feeds the returned stream.
    pub async fn stream(mut self, request: &StreamRequest) -> Result<TransactionStream, StreamError> {
        let payload = serde_json::to_vec(request)?;
        self.framed.send(Bytes::from(payload)).await?;

        let (txn_tx, txn_rx) = mpsc::channel(STREAM_QUEUE_CAPACITY);
        let (status_tx, status_rx) = oneshot::channel();
        let task = tokio::spawn(read_frames(self.framed, txn_tx, status_tx));
        Ok(TransactionStream {
            rx: txn_rx,
            status: Some(status_rx),
            task,
        })
    }
}

async fn read_frames(
    mut framed: Framed<TcpStream, LengthDelimitedCodec>,
    txn_tx: mpsc::Sender<BinlogTransaction>,
    status_tx: oneshot::Sender<Result<(), StreamError>>,
) {
    let status = loop {
        match framed.next().await {
            Some(Ok(bytes)) => match serde_json::from_slice::<StreamFrame>(&bytes) {
                Ok(StreamFrame::Transaction(tx)) => {
                    if txn_tx.send(tx).await.is_err() {
                        // Receiver dropped; the dispatch loop is gone.
                        break Ok(());
                    }
                }
                Ok(StreamFrame::Error { message }) => break Err(StreamError::Server(message)),
                Err(err) => break Err(StreamError::Decode(err)),
            },
            Some(Err(err)) => break Err(StreamError::Io(err)),
            None => break Ok(()),
        }
    };
    // Publish the terminal status before the transaction channel closes so
    // `finish` never races `recv`.
    let _ = status_tx.send(status);
}

/// Receiving half of one open subscription.
pub struct TransactionStream {
    rx: mpsc::Receiver<BinlogTransaction>,
    status: Option<oneshot::Receiver<Result<(), StreamError>>>,
    task: JoinHandle<()>,
}

impl TransactionStream {
    /// Next transaction in group-id order; `None` once the stream has
    /// terminated, after which [`TransactionStream::finish`] reports why.
    pub async fn recv(&mut self) -> Option<BinlogTransaction> {
        self.rx.recv().await
    }

    /// Terminal status: `Ok(())` for a clean server close, the stream error
    /// otherwise.
    pub async fn finish(&mut self) -> Result<(), StreamError> {
        match self.status.take() {
            Some(status) => status.await.unwrap_or(Err(StreamError::Lost)),
            None => Err(StreamError::Lost),
        }
    }
}

impl Drop for TransactionStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}
