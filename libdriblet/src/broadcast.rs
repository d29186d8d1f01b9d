//! The transaction broadcaster seam.
//!
//! Broadcasting is network I/O owned by the host (a peer group, an RPC node, an electrum
//! client); the state machines only need its asynchronous outcome. A network that silently
//! drops a transaction yields a future that never completes, so callers that care must impose
//! their own timeout.

use bitcoin::{Transaction, Txid};
use std::future::Future;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum BroadcastError {
    #[error("the network rejected the transaction: {0}")]
    Rejected(String),
    #[error("no peers accepted the transaction")]
    NoPeers,
    #[error("broadcast aborted: {0}")]
    Aborted(String),
}

pub trait Broadcaster {
    /// Publishes `tx` and resolves once the network has accepted or rejected it.
    fn broadcast(&self, tx: &Transaction) -> impl Future<Output = Result<Txid, BroadcastError>>;
}

/// A broadcaster that records everything it is given and always succeeds. Useful for tests and
/// for hosts that defer real publication.
#[derive(Default)]
pub struct RecordingBroadcaster {
    sent: Mutex<Vec<Transaction>>,
}

impl RecordingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Transaction> {
        self.sent.lock().expect("broadcast log poisoned").clone()
    }
}

impl Broadcaster for RecordingBroadcaster {
    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, BroadcastError> {
        let txid = tx.txid();
        self.sent.lock().expect("broadcast log poisoned").push(tx.clone());
        Ok(txid)
    }
}

/// A broadcaster that fails a configurable number of times before succeeding.
pub struct FlakyBroadcaster {
    failures_left: Mutex<u32>,
    inner: RecordingBroadcaster,
}

impl FlakyBroadcaster {
    pub fn failing(times: u32) -> Self {
        Self { failures_left: Mutex::new(times), inner: RecordingBroadcaster::new() }
    }

    pub fn sent(&self) -> Vec<Transaction> {
        self.inner.sent()
    }
}

impl Broadcaster for FlakyBroadcaster {
    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, BroadcastError> {
        {
            let mut left = self.failures_left.lock().expect("failure counter poisoned");
            if *left > 0 {
                *left -= 1;
                return Err(BroadcastError::NoPeers);
            }
        }
        self.inner.broadcast(tx).await
    }
}
