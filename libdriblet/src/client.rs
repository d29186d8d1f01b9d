//! The client (payer) side of a payment channel.
//!
//! The client locks money into the multisig contract, so the opening dance is ordered entirely
//! around never being exposed to a halted or hostile server: the time-locked refund is built and
//! countersigned *before* the server ever sees the contract. Once the channel is `Ready` the
//! client pays by signing ever-smaller refunds of its own share and sending only the signature.
//!
//! A state machine instance must be driven from a single logical sequencer. `&mut self` methods
//! hold exclusive access for their full duration; hosts sharing an instance across threads wrap
//! it in a mutex, and chain callbacks (`notify_coins_received`, `notify_close_confirmed`) must
//! be delivered on the same sequencer as the mutating calls.

use crate::amount;
use crate::channel_id::ChannelId;
use crate::contract;
use crate::error::ChannelError;
use crate::helpers;
use crate::keys::ChannelKey;
use crate::payment;
use crate::records::{ChannelRecord, StoredClientChannel, MAJOR_VERSION};
use crate::refund;
use crate::signing;
use crate::storage::ChannelStore;
use crate::wallet::{ChannelWallet, FundingOptions};
use bitcoin::secp256k1::{All, PublicKey, Secp256k1};
use bitcoin::blockdata::transaction::EcdsaSighashType;
use bitcoin::{Amount, EcdsaSig, Network, Script, Transaction};
use log::{debug, info, warn};
use std::fmt::{Display, Formatter};

/// The stages of the client state machine, in the order they are normally visited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientStage {
    New,
    Initiated,
    WaitingForSignedRefund,
    SaveStateInWallet,
    ProvideMultisigContractToServer,
    Ready,
    Expired,
    Closed,
}

impl Display for ClientStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientStage::New => write!(f, "New"),
            ClientStage::Initiated => write!(f, "Initiated"),
            ClientStage::WaitingForSignedRefund => write!(f, "WaitingForSignedRefund"),
            ClientStage::SaveStateInWallet => write!(f, "SaveStateInWallet"),
            ClientStage::ProvideMultisigContractToServer => {
                write!(f, "ProvideMultisigContractToServer")
            }
            ClientStage::Ready => write!(f, "Ready"),
            ClientStage::Expired => write!(f, "Expired"),
            ClientStage::Closed => write!(f, "Closed"),
        }
    }
}

/// A signature over the new payment transaction together with the amount it moved.
pub struct IncrementedPayment {
    pub signature: EcdsaSig,
    pub amount: Amount,
}

pub struct ClientChannelState<W, S> {
    secp: Secp256k1<All>,
    wallet: W,
    store: S,
    network: Network,
    client_key: ChannelKey,
    server_pub: PublicKey,
    total_value: Amount,
    expiry_time: u64,
    value_to_client: Amount,
    refund_fees: Amount,
    funding: FundingOptions,
    contract: Option<Transaction>,
    multisig_script: Option<Script>,
    refund: Option<Transaction>,
    stored: Option<StoredClientChannel>,
    stage: ClientStage,
}

impl<W, S> ClientChannelState<W, S>
where
    W: ChannelWallet,
    S: ChannelStore<StoredClientChannel>,
{
    /// Creates a client state machine for a channel that is about to be opened.
    ///
    /// `client_key` must be fresh for this channel. `server_pub` is the serialized public key
    /// the server handed over for the multisig contract; a non-canonical encoding fails with
    /// `Verification`. `expiry_time` is the UNIX time at which the refund becomes spendable.
    pub fn new(
        wallet: W,
        store: S,
        network: Network,
        client_key: ChannelKey,
        server_pub: &[u8],
        total_value: Amount,
        expiry_time: u64,
    ) -> Result<Self, ChannelError> {
        if total_value == Amount::ZERO {
            return Err(ChannelError::ValueOutOfRange("total value must be positive".into()));
        }
        let server_pub = PublicKey::from_slice(server_pub)
            .map_err(|e| ChannelError::verification(format!("server public key: {e}")))?;
        Ok(ClientChannelState {
            secp: Secp256k1::new(),
            wallet,
            store,
            network,
            client_key,
            server_pub,
            total_value,
            expiry_time,
            value_to_client: total_value,
            refund_fees: Amount::ZERO,
            funding: FundingOptions::default(),
            contract: None,
            multisig_script: None,
            refund: None,
            stored: None,
            stage: ClientStage::New,
        })
    }

    /// Resumes a channel from its stored record, re-entering `Ready`.
    pub fn from_stored(
        wallet: W,
        store: S,
        network: Network,
        stored: StoredClientChannel,
    ) -> Result<Self, ChannelError> {
        let output = stored
            .contract
            .output
            .first()
            .ok_or_else(|| ChannelError::verification("stored contract has no outputs"))?;
        let (client_pub, server_pub) = contract::parse_multisig_script(&output.script_pubkey)
            .ok_or_else(|| {
                ChannelError::verification("stored contract output 0 is not a 2-of-2 multisig")
            })?;
        if client_pub != stored.client_key.public_key() {
            return Err(ChannelError::verification(
                "stored client key does not match the contract",
            ));
        }
        Ok(ClientChannelState {
            secp: Secp256k1::new(),
            wallet,
            store,
            network,
            client_key: stored.client_key.clone(),
            server_pub,
            total_value: Amount::from_sat(output.value),
            expiry_time: u64::from(stored.refund.lock_time.0),
            value_to_client: stored.value_to_client,
            refund_fees: stored.refund_fees,
            funding: FundingOptions::default(),
            contract: Some(stored.contract.clone()),
            multisig_script: Some(output.script_pubkey.clone()),
            refund: Some(stored.refund.clone()),
            stored: Some(stored),
            stage: ClientStage::Ready,
        })
    }

    /// Adjusts how the wallet funds the contract. Must be called before [`initiate`].
    ///
    /// [`initiate`]: ClientChannelState::initiate
    pub fn with_funding_options(mut self, funding: FundingOptions) -> Self {
        self.funding = funding;
        self
    }

    /// Builds the multisig contract and the incomplete refund.
    ///
    /// The wallet funds the contract around the multisig output (unconfirmed coins allowed by
    /// default; the risk for micropayment sums is low). The refund spends it back to the
    /// client's address, time-locked to the expiry.
    pub fn initiate(&mut self, password: Option<&str>) -> Result<(), ChannelError> {
        self.require_stage(ClientStage::New, "initiate")?;
        if amount::is_dust(self.total_value) {
            return Err(ChannelError::ValueOutOfRange("total value too small to use".into()));
        }
        let client_pub = self.client_key.public_key();
        let template = contract::contract_template(self.total_value, &client_pub, &self.server_pub);
        let funded = self.wallet.fund_contract(template, &self.funding, password)?;
        let refund =
            refund::build_refund(&funded.contract, self.expiry_time, &client_pub, self.network)?;
        self.refund_fees = funded.fee + refund.fee;
        info!(
            "initiated channel with multisig contract {}, refund {}",
            funded.contract.txid(),
            refund.tx.txid()
        );
        self.multisig_script = Some(funded.contract.output[0].script_pubkey.clone());
        self.contract = Some(funded.contract);
        self.refund = Some(refund.tx);
        self.stage = ClientStage::Initiated;
        Ok(())
    }

    /// The partially signed (invalid) refund to pass to the server. Idempotent once the channel
    /// is waiting for the server's signature.
    pub fn incomplete_refund_transaction(&mut self) -> Result<Transaction, ChannelError> {
        match self.stage {
            ClientStage::Initiated => self.stage = ClientStage::WaitingForSignedRefund,
            ClientStage::WaitingForSignedRefund => {}
            stage => {
                return Err(ChannelError::illegal_state(format!(
                    "no incomplete refund to hand out in stage {stage}"
                )))
            }
        }
        self.refund_ref().cloned()
    }

    /// Verifies the server's refund signature, countersigns, and completes the refund.
    ///
    /// The server must have signed with exactly `NONE|ANYONECANPAY`: it commits the server to
    /// nothing about the outputs, so the refund stays the client's to shape. After this call
    /// succeeds the client can no longer lose the locked funds.
    pub fn provide_refund_signature(
        &mut self,
        server_sig: &[u8],
        password: Option<&str>,
    ) -> Result<(), ChannelError> {
        self.require_stage(ClientStage::WaitingForSignedRefund, "provide_refund_signature")?;
        let server_sig = signing::decode_signature(server_sig)?;
        if server_sig.hash_ty != EcdsaSighashType::NonePlusAnyoneCanPay {
            return Err(ChannelError::verification(
                "refund signature was not SIGHASH_NONE | ANYONECANPAY",
            ));
        }
        let script = self.multisig_script()?.clone();
        let secret = self.client_key.secret(password)?;
        let our_sig = signing::sign_input(
            &self.secp,
            self.refund_ref()?,
            0,
            &script,
            EcdsaSighashType::All,
            &secret,
        )?;
        let script_sig = signing::multisig_script_sig(&our_sig, &server_sig);
        debug!("refund scriptSig: {script_sig:?}");
        let contract_output = self.contract_ref()?.output[0].clone();
        let refund = self
            .refund
            .as_mut()
            .ok_or_else(|| ChannelError::illegal_state("refund not built"))?;
        refund.input[0].script_sig = script_sig;
        signing::verify_multisig_spend(&self.secp, refund, 0, &contract_output)?;
        self.stage = ClientStage::SaveStateInWallet;
        Ok(())
    }

    /// Stores the channel record and commits the contract to the wallet.
    ///
    /// `id` names the server being paid; it keys the record in the store. Idempotent when the
    /// channel is already stored under the same id.
    pub fn store_channel_in_wallet(&mut self, id: ChannelId) -> Result<(), ChannelError> {
        if let Some(stored) = &self.stored {
            return if stored.id == id {
                Ok(())
            } else {
                Err(ChannelError::illegal_state(format!(
                    "channel already stored under {}",
                    stored.id
                )))
            };
        }
        self.require_stage(ClientStage::SaveStateInWallet, "store_channel_in_wallet")?;
        let record = StoredClientChannel {
            id,
            major_version: MAJOR_VERSION,
            contract: self.contract_ref()?.clone(),
            refund: self.refund_ref()?.clone(),
            client_key: self.client_key.clone(),
            value_to_client: self.value_to_client,
            refund_fees: self.refund_fees,
            active: true,
            close_tx: None,
        };
        self.store.add_channel(&record)?;
        self.wallet.commit(&record.contract)?;
        debug!("stored channel {}", record.record_name());
        self.stored = Some(record);
        self.stage = ClientStage::ProvideMultisigContractToServer;
        Ok(())
    }

    /// The fully signed contract to hand to the server. Handing it out opens the channel for
    /// payments on this side.
    pub fn contract(&mut self) -> Result<Transaction, ChannelError> {
        match self.stage {
            ClientStage::ProvideMultisigContractToServer => self.stage = ClientStage::Ready,
            ClientStage::Ready => {}
            stage => {
                return Err(ChannelError::illegal_state(format!(
                    "contract is not ready to hand out in stage {stage}"
                )))
            }
        }
        self.contract_ref().cloned()
    }

    /// Moves `size` more satoshis to the server and returns the signature to send.
    ///
    /// A remainder that would be dust is rolled into the payment, driving the channel to
    /// exhaustion; at exhaustion the signature switches to `NONE|ANYONECANPAY`. An increment of
    /// zero is a valid refresh of the current split.
    pub fn increment_payment_by(
        &mut self,
        size: Amount,
        password: Option<&str>,
    ) -> Result<IncrementedPayment, ChannelError> {
        self.require_stage(ClientStage::Ready, "increment_payment_by")?;
        self.check_not_expired()?;
        let mut size = size;
        let mut new_value = self.value_to_client.checked_sub(size).ok_or_else(|| {
            ChannelError::ValueOutOfRange(format!(
                "channel has too little money to pay {size}"
            ))
        })?;
        if new_value > Amount::ZERO && amount::is_dust(new_value) {
            info!("remainder {new_value} would be dust, sending everything");
            size = self.value_to_client;
            new_value = Amount::ZERO;
        }
        let outpoint = contract::contract_outpoint(self.contract_ref()?);
        let tx = payment::unsigned_payment(
            outpoint,
            new_value,
            &self.client_key.public_key(),
            self.network,
        );
        let mode = payment::payment_sighash_mode(new_value);
        let script = self.multisig_script()?.clone();
        let secret = self.client_key.secret(password)?;
        let signature = signing::sign_input(&self.secp, &tx, 0, &script, mode, &secret)?;
        debug!("signed payment tx {} under {mode:?}", tx.txid());
        self.value_to_client = new_value;
        self.persist_value()?;
        Ok(IncrementedPayment { signature, amount: size })
    }

    /// True if `tx` is a valid settlement of this channel: its input 0 spends the contract's
    /// multisig output with two verifying signatures.
    pub fn is_settlement_transaction(&self, tx: &Transaction) -> bool {
        let Some(contract_tx) = &self.contract else {
            return false;
        };
        if tx.input.is_empty() || tx.output.is_empty() {
            return false;
        }
        if tx.input[0].previous_output != contract::contract_outpoint(contract_tx) {
            return false;
        }
        signing::verify_multisig_spend(&self.secp, tx, 0, &contract_tx.output[0]).is_ok()
    }

    /// Feed every transaction the wallet receives through here. Settlements close the channel
    /// and are recorded; everything else is ignored. Must run on the same sequencer as the
    /// mutating calls.
    pub fn notify_coins_received(&mut self, tx: &Transaction) {
        if self.contract.is_none() || !self.is_settlement_transaction(tx) {
            return;
        }
        let contract_txid = self.contract.as_ref().map(|c| c.txid());
        info!("close: transaction {} closed contract {:?}", tx.txid(), contract_txid);
        self.stage = ClientStage::Closed;
        if let Some(stored) = &mut self.stored {
            stored.close_tx = Some(tx.clone());
            if let Err(e) = self.store.update_channel(stored) {
                warn!("failed to record close transaction: {e}");
            }
        }
    }

    /// Call once the settlement has reached the event-horizon depth. The record is no longer
    /// needed and is deleted.
    pub fn notify_close_confirmed(&mut self) {
        if self.stage != ClientStage::Closed {
            warn!("close confirmation delivered in stage {}", self.stage);
            return;
        }
        if let Some(stored) = self.stored.take() {
            info!("close tx has confirmed, deleting channel {} from the store", stored.id);
            if let Err(e) = self.store.remove_channel(&stored.id) {
                warn!("failed to delete channel record: {e}");
            }
        }
    }

    /// Marks the stored channel inactive so it can be resumed later. No on-chain effect.
    pub fn disconnect_from_channel(&mut self) {
        self.mark_inactive();
    }

    pub fn stage(&self) -> ClientStage {
        self.stage
    }

    pub fn is_closed(&self) -> bool {
        self.stage == ClientStage::Closed
    }

    pub fn major_version(&self) -> u16 {
        MAJOR_VERSION
    }

    pub fn total_value(&self) -> Amount {
        self.total_value
    }

    /// The amount still allocated back to the client.
    pub fn value_refunded(&self) -> Amount {
        self.value_to_client
    }

    /// The amount sent to the server so far.
    pub fn value_spent(&self) -> Amount {
        self.total_value - self.value_to_client
    }

    /// The fees that claiming the refund will have cost, should it come to that.
    pub fn refund_tx_fees(&self) -> Amount {
        self.refund_fees
    }

    pub fn expiry_time(&self) -> u64 {
        self.expiry_time
    }

    /// The client's public half of the multisig pair; the server needs it alongside the refund.
    pub fn client_public_key(&self) -> PublicKey {
        self.client_key.public_key()
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        self.stored.as_ref().map(|s| s.id)
    }

    pub fn close_tx(&self) -> Option<&Transaction> {
        self.stored.as_ref().and_then(|s| s.close_tx.as_ref())
    }

    /// The channel's stored record, if it has been stored and not yet deleted.
    pub fn stored_record(&self) -> Option<&StoredClientChannel> {
        self.stored.as_ref()
    }

    /// The broadcastable refund, available once the server's signature has been verified and
    /// countersigned.
    pub fn completed_refund_transaction(&self) -> Result<Transaction, ChannelError> {
        match self.stage {
            ClientStage::New | ClientStage::Initiated | ClientStage::WaitingForSignedRefund => {
                Err(ChannelError::illegal_state(format!(
                    "refund is not fully signed in stage {}",
                    self.stage
                )))
            }
            _ => self.refund_ref().cloned(),
        }
    }

    fn require_stage(&self, expected: ClientStage, op: &str) -> Result<(), ChannelError> {
        if self.stage != expected {
            return Err(ChannelError::illegal_state(format!(
                "{op} requires stage {expected}, but the channel is {}",
                self.stage
            )));
        }
        Ok(())
    }

    fn check_not_expired(&mut self) -> Result<(), ChannelError> {
        if helpers::unix_time() > self.expiry_time {
            warn!("channel expired at {}; only the refund path remains", self.expiry_time);
            self.stage = ClientStage::Expired;
            self.mark_inactive();
            return Err(ChannelError::ChannelExpired);
        }
        Ok(())
    }

    fn mark_inactive(&mut self) {
        if let Some(stored) = &mut self.stored {
            stored.active = false;
            if let Err(e) = self.store.update_channel(stored) {
                warn!("failed to mark channel inactive: {e}");
            }
        }
    }

    fn persist_value(&mut self) -> Result<(), ChannelError> {
        if let Some(stored) = &mut self.stored {
            stored.value_to_client = self.value_to_client;
            self.store.update_channel(stored)?;
        }
        Ok(())
    }

    fn contract_ref(&self) -> Result<&Transaction, ChannelError> {
        self.contract
            .as_ref()
            .ok_or_else(|| ChannelError::illegal_state("contract not built yet"))
    }

    fn refund_ref(&self) -> Result<&Transaction, ChannelError> {
        self.refund
            .as_ref()
            .ok_or_else(|| ChannelError::illegal_state("refund not built yet"))
    }

    fn multisig_script(&self) -> Result<&Script, ChannelError> {
        self.multisig_script
            .as_ref()
            .ok_or_else(|| ChannelError::illegal_state("multisig script not built yet"))
    }
}
