//! The wallet seam: funding and committing transactions.
//!
//! The real UTXO set, coin selection and input signing live in the host's wallet. The channel
//! state machines only need a contract funded around a fixed output 0 and completed transactions
//! committed so the wallet tracks their spends.

pub mod dummy_impl;

pub use dummy_impl::DummyWallet;

use bitcoin::{Amount, Transaction};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum WalletError {
    #[error("not enough funds in the wallet to complete the transaction")]
    InsufficientFunds,
    #[error("error signing transaction: {0}")]
    Signing(String),
    #[error("the wallet rejected the transaction: {0}")]
    Rejected(String),
    #[error("an internal wallet error occurred: {0}")]
    Internal(String),
}

/// Funding policy for the multisig contract.
#[derive(Clone, Debug)]
pub struct FundingOptions {
    /// Micropayment channels default to spending unconfirmed coins; the locked value is small
    /// and the refund path bounds the loss.
    pub allow_unconfirmed: bool,
    /// The multisig output must stay at index 0, so output shuffling is off.
    pub shuffle_outputs: bool,
}

impl Default for FundingOptions {
    fn default() -> Self {
        FundingOptions { allow_unconfirmed: true, shuffle_outputs: false }
    }
}

/// A funded contract as returned by the wallet: the completed transaction and the fee it pays.
#[derive(Clone, Debug)]
pub struct FundedContract {
    pub contract: Transaction,
    pub fee: Amount,
}

pub trait ChannelWallet {
    /// Completes `template` by adding inputs and change for its outputs, signing the added
    /// inputs (decrypting wallet keys with `password` where needed). Output 0 of the template
    /// must remain output 0 of the result.
    fn fund_contract(
        &mut self,
        template: Transaction,
        options: &FundingOptions,
        password: Option<&str>,
    ) -> Result<FundedContract, WalletError>;

    /// Commits a transaction so the wallet tracks it and the outputs it spends.
    fn commit(&mut self, tx: &Transaction) -> Result<(), WalletError>;
}
