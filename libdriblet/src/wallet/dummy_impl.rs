use crate::wallet::{ChannelWallet, FundedContract, FundingOptions, WalletError};
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::{
    Amount, OutPoint, Script, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use log::debug;

/// An in-memory wallet for tests and demos. It fabricates a single funding input per contract,
/// charges a flat fee, and appends a change output, which is enough to exercise the channel
/// protocol without a chain.
pub struct DummyWallet {
    balance: Amount,
    fee: Amount,
    committed: Vec<Transaction>,
    funding_counter: u32,
}

impl DummyWallet {
    pub fn with_balance(balance: Amount) -> Self {
        DummyWallet {
            balance,
            fee: Amount::from_sat(5_000),
            committed: Vec::new(),
            funding_counter: 0,
        }
    }

    pub fn balance(&self) -> Amount {
        self.balance
    }

    pub fn committed(&self) -> &[Transaction] {
        &self.committed
    }

    fn next_funding_outpoint(&mut self) -> OutPoint {
        self.funding_counter += 1;
        let hash = sha256d::Hash::hash(&self.funding_counter.to_le_bytes());
        OutPoint::new(Txid::from_hash(hash), 0)
    }
}

impl ChannelWallet for DummyWallet {
    fn fund_contract(
        &mut self,
        mut template: Transaction,
        _options: &FundingOptions,
        _password: Option<&str>,
    ) -> Result<FundedContract, WalletError> {
        let target: u64 = template.output.iter().map(|o| o.value).sum();
        let needed = Amount::from_sat(target)
            .checked_add(self.fee)
            .ok_or_else(|| WalletError::Internal("funding target overflow".into()))?;
        let change = self
            .balance
            .checked_sub(needed)
            .ok_or(WalletError::InsufficientFunds)?;
        template.input.push(TxIn {
            previous_output: self.next_funding_outpoint(),
            script_sig: Script::new(),
            sequence: Sequence::MAX,
            witness: Witness::default(),
        });
        if change > Amount::ZERO {
            template.output.push(TxOut { value: change.to_sat(), script_pubkey: Script::new() });
        }
        self.balance = change;
        debug!("funded contract {} with fee {}", template.txid(), self.fee);
        Ok(FundedContract { contract: template, fee: self.fee })
    }

    fn commit(&mut self, tx: &Transaction) -> Result<(), WalletError> {
        self.committed.push(tx.clone());
        Ok(())
    }
}
