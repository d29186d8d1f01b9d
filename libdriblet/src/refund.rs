//! The time-locked refund transaction.
//!
//! The refund returns the whole channel value to the client after the expiry time, so a halted
//! or hostile server can delay the client's money but never take it. It spends the contract's
//! multisig output with a lock time of the expiry and a zero sequence number, which keeps it
//! non-final until the lock time passes.

use crate::amount::{self, CENT, REFERENCE_DEFAULT_MIN_TX_FEE};
use crate::contract;
use crate::error::ChannelError;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{
    Amount, Network, PackedLockTime, Script, Sequence, Transaction, TxIn, TxOut, Witness,
};

/// A freshly built, unsigned refund plus the fee taken out of the refunded value (zero for
/// channels of at least one CENT).
pub struct UnsignedRefund {
    pub tx: Transaction,
    pub fee: Amount,
}

/// Builds the refund spending `contract` output 0 back to the client's address.
///
/// Channels worth at least one CENT refund the full value and rely on a later fee attach;
/// smaller channels pay the reference minimum fee out of the refunded value, and fail with
/// `ValueOutOfRange` if what remains would be dust.
pub fn build_refund(
    contract: &Transaction,
    expiry_time: u64,
    client_pub: &PublicKey,
    network: Network,
) -> Result<UnsignedRefund, ChannelError> {
    let lock_time = u32::try_from(expiry_time).map_err(|_| {
        ChannelError::ValueOutOfRange(format!("expiry time {expiry_time} does not fit a lock time"))
    })?;
    let total_value = Amount::from_sat(contract.output[0].value);
    let (refund_value, fee) = if total_value < Amount::from_sat(CENT) {
        let after_fee = total_value
            .checked_sub(Amount::from_sat(REFERENCE_DEFAULT_MIN_TX_FEE))
            .filter(|v| !amount::is_dust(*v))
            .ok_or_else(|| {
                ChannelError::ValueOutOfRange("total value too small to use".into())
            })?;
        (after_fee, Amount::from_sat(REFERENCE_DEFAULT_MIN_TX_FEE))
    } else {
        (total_value, Amount::ZERO)
    };
    let tx = Transaction {
        version: 2,
        lock_time: PackedLockTime(lock_time),
        input: vec![TxIn {
            previous_output: contract::contract_outpoint(contract),
            script_sig: Script::new(),
            // Zero keeps the transaction non-final while the lock time is in the future.
            sequence: Sequence::ZERO,
            witness: Witness::default(),
        }],
        output: vec![TxOut {
            value: refund_value.to_sat(),
            script_pubkey: contract::p2pkh_script(client_pub, network),
        }],
    };
    Ok(UnsignedRefund { tx, fee })
}

/// Server-side policy check on a client's refund: exactly one input with sequence zero, exactly
/// one output, and a lock time no earlier than the server's minimum.
pub fn validate_refund(refund: &Transaction, min_expire_time: u64) -> Result<(), ChannelError> {
    if refund.input.len() != 1 {
        return Err(ChannelError::verification("refund must have exactly one input"));
    }
    if refund.output.len() != 1 {
        return Err(ChannelError::verification("refund must have exactly one output"));
    }
    if refund.input[0].sequence != Sequence::ZERO {
        return Err(ChannelError::verification("refund input sequence must be zero"));
    }
    if u64::from(refund.lock_time.0) < min_expire_time {
        return Err(ChannelError::verification(format!(
            "refund lock time {} is earlier than the minimum {min_expire_time}",
            refund.lock_time.0
        )));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::amount::MIN_NONDUST_OUTPUT;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    fn fixture(total: u64) -> (Transaction, PublicKey) {
        let secp = Secp256k1::new();
        let client = SecretKey::new(&mut rand::thread_rng());
        let server = SecretKey::new(&mut rand::thread_rng());
        let client_pub = PublicKey::from_secret_key(&secp, &client);
        let server_pub = PublicKey::from_secret_key(&secp, &server);
        let contract = contract::contract_template(Amount::from_sat(total), &client_pub, &server_pub);
        (contract, client_pub)
    }

    #[test]
    fn refund_shape() {
        let (contract, client_pub) = fixture(CENT);
        let refund = build_refund(&contract, 1_700_000_000, &client_pub, Network::Testnet).unwrap();
        assert_eq!(refund.tx.lock_time.0, 1_700_000_000);
        assert_eq!(refund.tx.input.len(), 1);
        assert_eq!(refund.tx.input[0].sequence, Sequence::ZERO);
        assert_eq!(refund.tx.input[0].previous_output, contract::contract_outpoint(&contract));
        assert_eq!(refund.tx.output.len(), 1);
        assert_eq!(refund.tx.output[0].value, CENT);
        assert_eq!(refund.fee, Amount::ZERO);
    }

    #[test]
    fn small_channels_pay_the_reference_fee() {
        let (contract, client_pub) = fixture(CENT - 1);
        let refund = build_refund(&contract, 1_700_000_000, &client_pub, Network::Testnet).unwrap();
        assert_eq!(refund.tx.output[0].value, CENT - 1 - REFERENCE_DEFAULT_MIN_TX_FEE);
        assert_eq!(refund.fee, Amount::from_sat(REFERENCE_DEFAULT_MIN_TX_FEE));
    }

    #[test]
    fn dust_residual_is_rejected() {
        let (contract, client_pub) = fixture(REFERENCE_DEFAULT_MIN_TX_FEE + MIN_NONDUST_OUTPUT - 1);
        let err = build_refund(&contract, 1_700_000_000, &client_pub, Network::Testnet);
        assert!(matches!(err, Err(ChannelError::ValueOutOfRange(_))));
    }

    #[test]
    fn policy_validation() {
        let (contract, client_pub) = fixture(CENT);
        let refund = build_refund(&contract, 1_700_000_000, &client_pub, Network::Testnet).unwrap();
        validate_refund(&refund.tx, 1_600_000_000).unwrap();
        // Lock time too early for the server.
        assert!(validate_refund(&refund.tx, 1_700_000_001).is_err());
        // Final sequence number defeats the lock time.
        let mut bad = refund.tx.clone();
        bad.input[0].sequence = Sequence::MAX;
        assert!(validate_refund(&bad, 1_600_000_000).is_err());
        // Extra output.
        let mut bad = refund.tx.clone();
        bad.output.push(bad.output[0].clone());
        assert!(validate_refund(&bad, 1_600_000_000).is_err());
    }
}
