//! Persisted channel records.
//!
//! A record is written when a channel reaches the point where losing it would lose money, and
//! updated on every change to the value split. Client records exist from the moment the refund
//! is fully signed; server records from the moment the contract is accepted.

use crate::channel_id::ChannelId;
use crate::keys::ChannelKey;
use bitcoin::util::amount::serde::as_sat;
use bitcoin::{Amount, Transaction};
use serde::{Deserialize, Serialize};

/// The protocol version records are tagged with. Future protocol revisions add variants at the
/// boundary rather than new record shapes.
pub const MAJOR_VERSION: u16 = 1;

pub trait ChannelRecord {
    fn channel_id(&self) -> &ChannelId;

    /// The name records are filed under.
    fn record_name(&self) -> String {
        self.channel_id().name()
    }
}

/// Everything the client must keep to stay safe: the contract, the fully signed refund, and the
/// key that can countersign a settlement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredClientChannel {
    pub id: ChannelId,
    pub major_version: u16,
    pub contract: Transaction,
    pub refund: Transaction,
    pub client_key: ChannelKey,
    #[serde(with = "as_sat")]
    pub value_to_client: Amount,
    #[serde(with = "as_sat")]
    pub refund_fees: Amount,
    /// An active channel is attached to a live protocol driver; inactive ones may be resumed.
    pub active: bool,
    pub close_tx: Option<Transaction>,
}

impl ChannelRecord for StoredClientChannel {
    fn channel_id(&self) -> &ChannelId {
        &self.id
    }
}

/// The server's side: its key, the contract it broadcast, and the best payment seen so far.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredServerChannel {
    pub id: ChannelId,
    pub major_version: u16,
    pub server_key: ChannelKey,
    pub contract: Transaction,
    #[serde(with = "as_sat")]
    pub best_value_to_server: Amount,
    #[serde(
        serialize_with = "crate::helpers::option_to_hex",
        deserialize_with = "crate::helpers::option_from_hex",
        default
    )]
    pub best_value_signature: Option<Vec<u8>>,
    pub close_tx: Option<Transaction>,
}

impl ChannelRecord for StoredServerChannel {
    fn channel_id(&self) -> &ChannelId {
        &self.id
    }
}
