//! The server (payee) side of a payment channel.
//!
//! The server's money is only ever the best payment signature it has seen, so its job is
//! narrow: sign the client's refund blind (committing to nothing), verify the contract before
//! broadcasting it, verify every incoming payment signature, keep the most valuable one, and
//! settle before the refund's lock time frees the client to take everything back.
//!
//! The same sequencing contract as [`crate::client`] applies: `&mut self` methods hold the
//! instance exclusively, and hosts drive one instance from one logical sequencer.

use crate::amount::{self, REFERENCE_DEFAULT_MIN_TX_FEE};
use crate::broadcast::Broadcaster;
use crate::channel_id::ChannelId;
use crate::contract;
use crate::error::ChannelError;
use crate::keys::ChannelKey;
use crate::payment;
use crate::records::{ChannelRecord, StoredServerChannel, MAJOR_VERSION};
use crate::refund;
use crate::signing;
use crate::storage::ChannelStore;
use crate::wallet::ChannelWallet;
use bitcoin::consensus::encode::deserialize;
use bitcoin::secp256k1::{All, PublicKey, Secp256k1};
use bitcoin::blockdata::transaction::EcdsaSighashType;
use bitcoin::{Amount, EcdsaSig, Network, OutPoint, Script, Transaction, TxOut};
use log::{debug, info, warn};
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerStage {
    WaitingForRefund,
    WaitingForMultisigContract,
    WaitingForMultisigAcceptance,
    Ready,
    Closing,
    Closed,
    /// A protocol violation or failed contract broadcast ended the channel before settlement.
    ErrorClosed,
}

impl Display for ServerStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStage::WaitingForRefund => write!(f, "WaitingForRefund"),
            ServerStage::WaitingForMultisigContract => write!(f, "WaitingForMultisigContract"),
            ServerStage::WaitingForMultisigAcceptance => write!(f, "WaitingForMultisigAcceptance"),
            ServerStage::Ready => write!(f, "Ready"),
            ServerStage::Closing => write!(f, "Closing"),
            ServerStage::Closed => write!(f, "Closed"),
            ServerStage::ErrorClosed => write!(f, "ErrorClosed"),
        }
    }
}

pub struct ServerChannelState<W, B, S> {
    secp: Secp256k1<All>,
    wallet: W,
    broadcaster: B,
    store: S,
    network: Network,
    server_key: ChannelKey,
    min_expire_time: u64,
    client_pub: Option<PublicKey>,
    multisig_script: Option<Script>,
    refund_outpoint: Option<OutPoint>,
    contract: Option<Transaction>,
    total_value: Amount,
    best_value_to_server: Amount,
    best_value_signature: Option<EcdsaSig>,
    pending_close: Option<Transaction>,
    fee_paid: Option<Amount>,
    stored: Option<StoredServerChannel>,
    stage: ServerStage,
}

impl<W, B, S> ServerChannelState<W, B, S>
where
    W: ChannelWallet,
    B: Broadcaster,
    S: ChannelStore<StoredServerChannel>,
{
    /// Creates a server state machine for a channel about to be opened.
    ///
    /// `server_key` must be fresh for this channel and used nowhere else. `min_expire_time` is
    /// the earliest refund lock time the server will sign; anything earlier would let the
    /// client reclaim the funds before the server can settle.
    pub fn new(
        broadcaster: B,
        wallet: W,
        store: S,
        network: Network,
        server_key: ChannelKey,
        min_expire_time: u64,
    ) -> Self {
        ServerChannelState {
            secp: Secp256k1::new(),
            wallet,
            broadcaster,
            store,
            network,
            server_key,
            min_expire_time,
            client_pub: None,
            multisig_script: None,
            refund_outpoint: None,
            contract: None,
            total_value: Amount::ZERO,
            best_value_to_server: Amount::ZERO,
            best_value_signature: None,
            pending_close: None,
            fee_paid: None,
            stored: None,
            stage: ServerStage::WaitingForRefund,
        }
    }

    /// Resumes a channel from its stored record, re-entering `Ready`.
    pub fn from_stored(
        broadcaster: B,
        wallet: W,
        store: S,
        network: Network,
        min_expire_time: u64,
        stored: StoredServerChannel,
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
        if server_pub != stored.server_key.public_key() {
            return Err(ChannelError::verification(
                "stored server key does not match the contract",
            ));
        }
        let best_value_signature = match &stored.best_value_signature {
            Some(bytes) => Some(signing::decode_signature(bytes)?),
            None if stored.best_value_to_server > Amount::ZERO => {
                return Err(ChannelError::verification(
                    "stored channel has value but no payment signature",
                ))
            }
            None => None,
        };
        Ok(ServerChannelState {
            secp: Secp256k1::new(),
            wallet,
            broadcaster,
            store,
            network,
            server_key: stored.server_key.clone(),
            min_expire_time,
            client_pub: Some(client_pub),
            multisig_script: Some(output.script_pubkey.clone()),
            refund_outpoint: Some(contract::contract_outpoint(&stored.contract)),
            contract: Some(stored.contract.clone()),
            total_value: Amount::from_sat(output.value),
            best_value_to_server: stored.best_value_to_server,
            best_value_signature,
            pending_close: None,
            fee_paid: None,
            stored: Some(stored),
            stage: ServerStage::Ready,
        })
    }

    /// Validates the client's refund and returns the server's signature over it.
    ///
    /// The signature is made with `NONE|ANYONECANPAY`: it commits to none of the refund's
    /// outputs, which is exactly the point; the refund is the client's safety net, not the
    /// server's business.
    pub fn provide_refund_transaction(
        &mut self,
        refund_bytes: &[u8],
        client_pub: &[u8],
        password: Option<&str>,
    ) -> Result<Vec<u8>, ChannelError> {
        self.require_stage(ServerStage::WaitingForRefund, "provide_refund_transaction")?;
        let refund_tx: Transaction = deserialize(refund_bytes)
            .map_err(|e| ChannelError::verification(format!("malformed refund: {e}")))?;
        let client_pub = PublicKey::from_slice(client_pub)
            .map_err(|e| ChannelError::verification(format!("client public key: {e}")))?;
        refund::validate_refund(&refund_tx, self.min_expire_time)?;
        let script =
            contract::multisig_output_script(&client_pub, &self.server_key.public_key());
        let secret = self.server_key.secret(password)?;
        let sig = signing::sign_input(
            &self.secp,
            &refund_tx,
            0,
            &script,
            EcdsaSighashType::NonePlusAnyoneCanPay,
            &secret,
        )?;
        info!("signed refund {} with lock time {}", refund_tx.txid(), refund_tx.lock_time.0);
        self.client_pub = Some(client_pub);
        self.multisig_script = Some(script);
        self.refund_outpoint = Some(refund_tx.input[0].previous_output);
        self.stage = ServerStage::WaitingForMultisigContract;
        Ok(signing::encode_signature(&sig))
    }

    /// Validates and broadcasts the client's contract, opening the channel.
    ///
    /// A contract that does not match what the refund was signed against is a protocol
    /// violation and ends the channel, as does a failed broadcast.
    pub async fn provide_contract(&mut self, contract_tx: Transaction) -> Result<(), ChannelError> {
        self.require_stage(ServerStage::WaitingForMultisigContract, "provide_contract")?;
        let client_pub = self.client_pub()?;
        let refund_outpoint = self
            .refund_outpoint
            .ok_or_else(|| ChannelError::illegal_state("refund has not been signed"))?;
        let total_value = match contract::validate_contract(
            &contract_tx,
            &client_pub,
            &self.server_key.public_key(),
            refund_outpoint,
        ) {
            Ok(total) => total,
            Err(e) => {
                warn!("rejecting contract {}: {e}", contract_tx.txid());
                self.stage = ServerStage::ErrorClosed;
                return Err(e);
            }
        };
        self.stage = ServerStage::WaitingForMultisigAcceptance;
        match self.broadcaster.broadcast(&contract_tx).await {
            Ok(txid) => {
                info!("contract {txid} accepted by the network, channel open for {total_value}");
                if let Err(e) = self.wallet.commit(&contract_tx) {
                    warn!("wallet refused to track the contract: {e}");
                }
                self.total_value = total_value;
                self.contract = Some(contract_tx);
                self.stage = ServerStage::Ready;
                Ok(())
            }
            Err(e) => {
                warn!("contract {} failed to broadcast: {e}", contract_tx.txid());
                self.stage = ServerStage::ErrorClosed;
                Err(ChannelError::Broadcast(e))
            }
        }
    }

    /// Applies a payment update: the client claims the channel now refunds it only
    /// `new_value_to_client`, and `signature` proves it.
    ///
    /// Stale or out-of-order updates are verified and then ignored; the server only ever keeps
    /// the lowest client value (the highest payment) it has seen. Returns whether the channel
    /// has value left to spend.
    pub fn increment_payment(
        &mut self,
        new_value_to_client: Amount,
        signature: &[u8],
    ) -> Result<bool, ChannelError> {
        self.require_stage(ServerStage::Ready, "increment_payment")?;
        let candidate_to_server =
            self.total_value.checked_sub(new_value_to_client).ok_or_else(|| {
                ChannelError::ValueOutOfRange(
                    "payment refunds more than the contract holds".into(),
                )
            })?;
        if new_value_to_client > Amount::ZERO && amount::is_dust(new_value_to_client) {
            return Err(ChannelError::ValueOutOfRange(
                "client change output would be dust".into(),
            ));
        }
        let sig = signing::decode_signature(signature)?;
        let expected_mode = payment::payment_sighash_mode(new_value_to_client);
        if sig.hash_ty != expected_mode {
            return Err(ChannelError::verification(format!(
                "payment signature used {:?} where {expected_mode:?} was required",
                sig.hash_ty
            )));
        }
        let client_pub = self.client_pub()?;
        let tx = payment::unsigned_payment(
            self.contract_outpoint()?,
            new_value_to_client,
            &client_pub,
            self.network,
        );
        let script = self.multisig_script()?.clone();
        signing::verify_input_signature(&self.secp, &tx, 0, &script, &sig, &client_pub)?;
        if candidate_to_server <= self.best_value_to_server {
            debug!(
                "ignoring stale payment update worth {candidate_to_server}, best is {}",
                self.best_value_to_server
            );
            return Ok(self.total_value - self.best_value_to_server > Amount::ZERO);
        }
        if amount::is_dust(candidate_to_server) {
            return Err(ChannelError::ValueOutOfRange(
                "payment to the server would be dust".into(),
            ));
        }
        info!(
            "payment update accepted: {candidate_to_server} to server, {new_value_to_client} to client"
        );
        self.best_value_to_server = candidate_to_server;
        self.best_value_signature = Some(sig);
        self.persist_best()?;
        Ok(new_value_to_client > Amount::ZERO)
    }

    /// Settles the channel: finalizes the best payment and broadcasts it.
    ///
    /// On broadcast failure the channel stays in `Closing` and the call may be retried; the
    /// rebuilt transaction is identical, signing is deterministic.
    pub async fn close(&mut self, password: Option<&str>) -> Result<Transaction, ChannelError> {
        match self.stage {
            ServerStage::Ready | ServerStage::Closing => {}
            stage => {
                return Err(ChannelError::illegal_state(format!(
                    "close requires a Ready or Closing channel, not {stage}"
                )))
            }
        }
        let close_tx = match self.pending_close.clone() {
            Some(tx) => tx,
            None => {
                let tx = self.build_close_transaction(password)?;
                self.pending_close = Some(tx.clone());
                tx
            }
        };
        self.stage = ServerStage::Closing;
        match self.broadcaster.broadcast(&close_tx).await {
            Ok(txid) => {
                info!("channel settled by {txid}, {} to server", self.best_value_to_server);
                self.fee_paid = Some(Amount::from_sat(REFERENCE_DEFAULT_MIN_TX_FEE));
                self.stage = ServerStage::Closed;
                if let Some(stored) = self.stored.take() {
                    if let Err(e) = self.store.remove_channel(&stored.id) {
                        warn!("failed to delete settled channel record: {e}");
                    }
                }
                Ok(close_tx)
            }
            Err(e) => {
                warn!("close broadcast failed, channel stays in Closing: {e}");
                Err(ChannelError::Broadcast(e))
            }
        }
    }

    /// Stores the channel so a restarted server can still settle. Only a `Ready` channel is
    /// worth storing. Returns the id the record is filed under.
    pub fn store_channel_in_wallet(&mut self) -> Result<ChannelId, ChannelError> {
        if let Some(stored) = &self.stored {
            return Ok(stored.id);
        }
        self.require_stage(ServerStage::Ready, "store_channel_in_wallet")?;
        let contract_tx = self.contract_ref()?.clone();
        let record = StoredServerChannel {
            id: ChannelId::from_contract_txid(contract_tx.txid()),
            major_version: MAJOR_VERSION,
            server_key: self.server_key.clone(),
            contract: contract_tx,
            best_value_to_server: self.best_value_to_server,
            best_value_signature: self.best_value_signature.as_ref().map(signing::encode_signature),
            close_tx: None,
        };
        self.store.add_channel(&record)?;
        debug!("stored channel {}", record.record_name());
        let id = record.id;
        self.stored = Some(record);
        Ok(id)
    }

    pub fn stage(&self) -> ServerStage {
        self.stage
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.stage, ServerStage::Closed | ServerStage::ErrorClosed)
    }

    pub fn major_version(&self) -> u16 {
        MAJOR_VERSION
    }

    /// The highest payment to the server seen so far, before the settlement fee.
    pub fn best_value_to_server(&self) -> Amount {
        self.best_value_to_server
    }

    /// The fee paid by the settlement transaction; only present once `close` has succeeded.
    pub fn fee_paid(&self) -> Option<Amount> {
        self.fee_paid
    }

    pub fn contract(&self) -> Option<&Transaction> {
        self.contract.as_ref()
    }

    pub fn total_value(&self) -> Amount {
        self.total_value
    }

    pub fn min_expire_time(&self) -> u64 {
        self.min_expire_time
    }

    /// The channel's stored record, if it has been stored and not yet deleted.
    pub fn stored_record(&self) -> Option<&StoredServerChannel> {
        self.stored.as_ref()
    }

    fn build_close_transaction(
        &mut self,
        password: Option<&str>,
    ) -> Result<Transaction, ChannelError> {
        let client_sig = self.best_value_signature.clone().ok_or_else(|| {
            ChannelError::illegal_state("cannot settle a channel before it has been used")
        })?;
        let client_pub = self.client_pub()?;
        let best_value_to_client = self.total_value - self.best_value_to_server;
        let mut tx = payment::unsigned_payment(
            self.contract_outpoint()?,
            best_value_to_client,
            &client_pub,
            self.network,
        );
        if best_value_to_client == Amount::ZERO {
            // The client signed NONE|ANYONECANPAY, so its empty output can simply be dropped.
            tx.output.clear();
        }
        let server_value = self
            .best_value_to_server
            .checked_sub(Amount::from_sat(REFERENCE_DEFAULT_MIN_TX_FEE))
            .filter(|v| !amount::is_dust(*v))
            .ok_or_else(|| {
                ChannelError::InsufficientFunds(
                    "closing payment would cost more in fees than it is worth".into(),
                )
            })?;
        tx.output.push(TxOut {
            value: server_value.to_sat(),
            script_pubkey: contract::p2pkh_script(&self.server_key.public_key(), self.network),
        });
        let script = self.multisig_script()?.clone();
        let secret = self.server_key.secret(password)?;
        let server_sig =
            signing::sign_input(&self.secp, &tx, 0, &script, EcdsaSighashType::All, &secret)?;
        tx.input[0].script_sig = signing::multisig_script_sig(&client_sig, &server_sig);
        let contract_output = TxOut { value: self.total_value.to_sat(), script_pubkey: script };
        signing::verify_multisig_spend(&self.secp, &tx, 0, &contract_output)?;
        debug!("built close transaction {}", tx.txid());
        Ok(tx)
    }

    fn persist_best(&mut self) -> Result<(), ChannelError> {
        if let Some(stored) = &mut self.stored {
            stored.best_value_to_server = self.best_value_to_server;
            stored.best_value_signature = self.best_value_signature.as_ref().map(signing::encode_signature);
            self.store.update_channel(stored)?;
        }
        Ok(())
    }

    fn require_stage(&self, expected: ServerStage, op: &str) -> Result<(), ChannelError> {
        if self.stage != expected {
            return Err(ChannelError::illegal_state(format!(
                "{op} requires stage {expected}, but the channel is {}",
                self.stage
            )));
        }
        Ok(())
    }

    fn client_pub(&self) -> Result<PublicKey, ChannelError> {
        self.client_pub
            .ok_or_else(|| ChannelError::illegal_state("client public key not yet known"))
    }

    fn contract_ref(&self) -> Result<&Transaction, ChannelError> {
        self.contract
            .as_ref()
            .ok_or_else(|| ChannelError::illegal_state("contract not yet provided"))
    }

    fn contract_outpoint(&self) -> Result<OutPoint, ChannelError> {
        Ok(contract::contract_outpoint(self.contract_ref()?))
    }

    fn multisig_script(&self) -> Result<&Script, ChannelError> {
        self.multisig_script
            .as_ref()
            .ok_or_else(|| ChannelError::illegal_state("multisig script not yet known"))
    }
}
