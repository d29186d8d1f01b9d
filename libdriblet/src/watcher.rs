//! Chain observation: settlement detection and the expiry-time refund.
//!
//! The state machines never poll a chain themselves. A host-provided watcher delivers spends of
//! the contract output and confirmation depth milestones; the callbacks must run on the same
//! logical sequencer as the state machine's mutating calls, or the host must forward them into
//! one (for example through a channel drained by the protocol driver task).

use crate::broadcast::{BroadcastError, Broadcaster};
use crate::helpers;
use bitcoin::{OutPoint, Transaction, Txid};
use log::{debug, info, warn};
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// The confirmation depth after which a settlement is treated as permanent and the channel
/// record can be deleted.
pub const EVENT_HORIZON: u32 = 100;

pub trait MonitorChain {
    type Error: std::error::Error;

    /// Registers a callback fired with any transaction that spends `outpoint`.
    fn watch_spends<Func>(
        &self,
        channel_name: String,
        outpoint: OutPoint,
        callback: Func,
    ) -> impl Future<Output = Result<(), Self::Error>>
    where
        Func: Fn(Transaction) + Send + 'static;

    /// Registers a callback fired once `txid` reaches `depth` confirmations.
    fn watch_confirmations<Func>(
        &self,
        channel_name: String,
        txid: Txid,
        depth: u32,
        callback: Func,
    ) -> impl Future<Output = Result<(), Self::Error>>
    where
        Func: FnOnce() + Send + 'static;
}

/// Sleeps until the channel's expiry time and then hands the refund to the broadcaster. Spawn
/// or select over this per stored client channel; once it resolves, the refund is on the
/// network and the channel is over.
pub async fn broadcast_refund_at_expiry<B: Broadcaster>(
    broadcaster: &B,
    refund: &Transaction,
    expiry_time: u64,
) -> Result<Txid, BroadcastError> {
    let now = helpers::unix_time();
    if expiry_time > now {
        let wait = expiry_time - now;
        debug!("refund {} locked for another {wait}s", refund.txid());
        tokio::time::sleep(Duration::from_secs(wait)).await;
    }
    info!("broadcasting refund {}", refund.txid());
    broadcaster.broadcast(refund).await
}

#[derive(Debug, Error)]
#[error("MockWatcher error: {0}")]
pub struct MockWatcherError(String);

/// A watcher that fires callbacks only when a test tells it to.
pub struct MockWatcher {
    spend_watchers: RefCell<HashMap<String, Box<dyn Fn(Transaction)>>>,
    depth_watchers: RefCell<HashMap<String, Box<dyn FnOnce()>>>,
}

impl Default for MockWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl MockWatcher {
    pub fn new() -> Self {
        Self {
            spend_watchers: RefCell::new(HashMap::new()),
            depth_watchers: RefCell::new(HashMap::new()),
        }
    }

    /// Delivers `tx` as a spend of the watched outpoint for `channel_name`.
    pub fn trigger_spend(&self, channel_name: &str, tx: Transaction) {
        match self.spend_watchers.borrow().get(channel_name) {
            Some(callback) => callback(tx),
            None => warn!("no spend watcher registered for {channel_name}"),
        }
    }

    /// Fires the depth callback for `channel_name`, consuming it.
    pub fn trigger_depth(&self, channel_name: &str) {
        match self.depth_watchers.borrow_mut().remove(channel_name) {
            Some(callback) => callback(),
            None => warn!("no depth watcher registered for {channel_name}"),
        }
    }
}

impl MonitorChain for MockWatcher {
    type Error = MockWatcherError;

    async fn watch_spends<Func>(
        &self,
        channel_name: String,
        _outpoint: OutPoint,
        callback: Func,
    ) -> Result<(), Self::Error>
    where
        Func: Fn(Transaction) + Send + 'static,
    {
        self.spend_watchers.borrow_mut().insert(channel_name, Box::new(callback));
        Ok(())
    }

    async fn watch_confirmations<Func>(
        &self,
        channel_name: String,
        _txid: Txid,
        _depth: u32,
        callback: Func,
    ) -> Result<(), Self::Error>
    where
        Func: FnOnce() + Send + 'static,
    {
        self.depth_watchers.borrow_mut().insert(channel_name, Box::new(callback));
        Ok(())
    }
}
