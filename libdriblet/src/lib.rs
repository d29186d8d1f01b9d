//! Two-party, unidirectional Bitcoin micropayment channels.

pub mod amount;
pub mod broadcast;
pub mod channel_id;
pub mod client;
pub mod contract;
pub mod error;
pub mod helpers;
pub mod keys;
pub mod payment;
pub mod records;
pub mod refund;
pub mod server;
pub mod signing;
pub mod storage;
pub mod wallet;
pub mod watcher;

pub use channel_id::ChannelId;
pub use client::{ClientChannelState, ClientStage, IncrementedPayment};
pub use error::ChannelError;
pub use keys::ChannelKey;
pub use records::{StoredClientChannel, StoredServerChannel, MAJOR_VERSION};
pub use server::{ServerChannelState, ServerStage};

#[cfg(test)]
mod tests;
