use crate::broadcast::BroadcastError;
use crate::keys::KeyError;
use crate::wallet::WalletError;
use thiserror::Error;

/// The error surface of both channel state machines.
///
/// Errors are surfaced to the caller rather than handled internally; only expiry and contract
/// rejection move the state machine to a terminal state.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// A value was negative, below the dust floor, or would overdraw the channel.
    #[error("value out of range: {0}")]
    ValueOutOfRange(String),
    /// The wallet cannot fund the contract, or a closing payment would be worth less than its fee.
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    /// A signature, sighash flag, refund or contract failed validation.
    #[error("verification failed: {0}")]
    Verification(String),
    /// The operation is not permitted in the state machine's current stage.
    #[error("illegal state: {0}")]
    IllegalState(String),
    /// The channel passed its expiry time; only the refund path remains.
    #[error("the channel has expired")]
    ChannelExpired,
    /// The broadcaster reported that the network rejected a transaction.
    #[error("broadcast failed: {0}")]
    Broadcast(#[from] BroadcastError),
    /// A channel key could not be decrypted or used.
    #[error("key error: {0}")]
    Key(#[from] KeyError),
    /// The wallet failed for a reason other than a funding shortfall.
    #[error("wallet error: {0}")]
    Wallet(WalletError),
    /// The channel store failed to persist or load a record.
    #[error("storage error: {0}")]
    Store(#[from] anyhow::Error),
}

impl ChannelError {
    pub(crate) fn illegal_state(msg: impl Into<String>) -> Self {
        ChannelError::IllegalState(msg.into())
    }

    pub(crate) fn verification(msg: impl Into<String>) -> Self {
        ChannelError::Verification(msg.into())
    }
}

impl From<WalletError> for ChannelError {
    fn from(err: WalletError) -> Self {
        match err {
            WalletError::InsufficientFunds => {
                ChannelError::InsufficientFunds("the wallet cannot fund the contract".into())
            }
            other => ChannelError::Wallet(other),
        }
    }
}
