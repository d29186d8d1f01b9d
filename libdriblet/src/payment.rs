//! The off-chain payment transaction.
//!
//! Each increment re-signs a payment spending the contract output, with the client's remaining
//! share as output 0. The client's copy is never complete: the server appends its own output
//! only when it settles. Both parties must build the unsigned transaction identically or the
//! exchanged signatures will not verify, so the construction lives here and nowhere else.

use crate::contract;
use bitcoin::blockdata::transaction::EcdsaSighashType;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{
    Amount, Network, OutPoint, PackedLockTime, Script, Sequence, Transaction, TxIn, TxOut, Witness,
};

/// The unsigned payment transaction for a given remaining client value: one input spending the
/// contract output, one output returning `value_to_client` to the client's address.
pub fn unsigned_payment(
    contract_outpoint: OutPoint,
    value_to_client: Amount,
    client_pub: &PublicKey,
    network: Network,
) -> Transaction {
    Transaction {
        version: 2,
        lock_time: PackedLockTime::ZERO,
        input: vec![TxIn {
            previous_output: contract_outpoint,
            script_sig: Script::new(),
            sequence: Sequence::MAX,
            witness: Witness::default(),
        }],
        output: vec![TxOut {
            value: value_to_client.to_sat(),
            script_pubkey: contract::p2pkh_script(client_pub, network),
        }],
    }
}

/// The sighash mode the client signs a payment under.
///
/// While the client retains value, `SINGLE|ANYONECANPAY` binds exactly output 0, the client's
/// change, and leaves the server free to append its own output. Once the channel is exhausted
/// the client no longer cares what the outputs are and signs `NONE|ANYONECANPAY`.
pub fn payment_sighash_mode(value_to_client: Amount) -> EcdsaSighashType {
    if value_to_client == Amount::ZERO {
        EcdsaSighashType::NonePlusAnyoneCanPay
    } else {
        EcdsaSighashType::SinglePlusAnyoneCanPay
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use bitcoin::Txid;

    #[test]
    fn payment_shape() {
        let secp = Secp256k1::new();
        let sk = SecretKey::new(&mut rand::thread_rng());
        let client_pub = PublicKey::from_secret_key(&secp, &sk);
        let outpoint = OutPoint::new(Txid::all_zeros(), 0);
        let tx = unsigned_payment(outpoint, Amount::from_sat(700_000), &client_pub, Network::Testnet);
        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.input[0].previous_output, outpoint);
        assert_eq!(tx.input[0].sequence, Sequence::MAX);
        assert_eq!(tx.output.len(), 1);
        assert_eq!(tx.output[0].value, 700_000);
        assert_eq!(tx.output[0].script_pubkey, contract::p2pkh_script(&client_pub, Network::Testnet));
    }

    #[test]
    fn mode_switches_when_exhausted() {
        assert_eq!(
            payment_sighash_mode(Amount::from_sat(1)),
            EcdsaSighashType::SinglePlusAnyoneCanPay
        );
        assert_eq!(payment_sighash_mode(Amount::ZERO), EcdsaSighashType::NonePlusAnyoneCanPay);
    }
}
