//! Construction and validation of the multisig contract that funds a channel.
//!
//! The contract's key output is output 0: `total_value` locked to a bare 2-of-2 multisig over
//! the client and server public keys. The key order is fixed, client first, so either party can
//! reconstruct the script from the two keys alone; any other order is a protocol error.

use crate::amount;
use crate::error::ChannelError;
use bitcoin::blockdata::opcodes;
use bitcoin::blockdata::script::{Builder, Instruction};
use bitcoin::secp256k1::PublicKey;
use bitcoin::{
    Address, Amount, Network, OutPoint, PackedLockTime, Script, Transaction, TxOut,
};

/// The 2-of-2 multisig output script, client key first.
pub fn multisig_output_script(client_pub: &PublicKey, server_pub: &PublicKey) -> Script {
    Builder::new()
        .push_opcode(opcodes::all::OP_PUSHNUM_2)
        .push_slice(&client_pub.serialize())
        .push_slice(&server_pub.serialize())
        .push_opcode(opcodes::all::OP_PUSHNUM_2)
        .push_opcode(opcodes::all::OP_CHECKMULTISIG)
        .into_script()
}

/// Parses a bare 2-of-2 multisig script into its (client, server) public keys.
pub fn parse_multisig_script(script: &Script) -> Option<(PublicKey, PublicKey)> {
    let mut keys = Vec::with_capacity(2);
    let mut ops = Vec::with_capacity(3);
    for instruction in script.instructions() {
        match instruction.ok()? {
            Instruction::PushBytes(data) => keys.push(PublicKey::from_slice(data).ok()?),
            Instruction::Op(op) => ops.push(op),
        }
    }
    let expected_ops = [
        opcodes::all::OP_PUSHNUM_2,
        opcodes::all::OP_PUSHNUM_2,
        opcodes::all::OP_CHECKMULTISIG,
    ];
    if keys.len() == 2 && ops == expected_ops {
        Some((keys[0], keys[1]))
    } else {
        None
    }
}

/// The pay-to-pubkey-hash script both the refund and the client's change output pay to.
pub fn p2pkh_script(pubkey: &PublicKey, network: Network) -> Script {
    Address::p2pkh(&bitcoin::PublicKey::new(*pubkey), network).script_pubkey()
}

/// An unfunded contract: a single multisig output of the channel's total value. The wallet adds
/// inputs and change behind this output; output 0 must stay in place.
pub fn contract_template(
    total_value: Amount,
    client_pub: &PublicKey,
    server_pub: &PublicKey,
) -> Transaction {
    Transaction {
        version: 2,
        lock_time: PackedLockTime::ZERO,
        input: vec![],
        output: vec![TxOut {
            value: total_value.to_sat(),
            script_pubkey: multisig_output_script(client_pub, server_pub),
        }],
    }
}

/// The outpoint all refund and payment transactions spend.
pub fn contract_outpoint(contract: &Transaction) -> OutPoint {
    OutPoint::new(contract.txid(), 0)
}

/// Server-side contract validation: output 0 must be the expected multisig script, carry a
/// non-dust value, and be the outpoint the previously signed refund spends. Returns the
/// channel's total value.
pub fn validate_contract(
    contract: &Transaction,
    client_pub: &PublicKey,
    server_pub: &PublicKey,
    refund_outpoint: OutPoint,
) -> Result<Amount, ChannelError> {
    let output = contract
        .output
        .first()
        .ok_or_else(|| ChannelError::verification("contract has no outputs"))?;
    if output.script_pubkey != multisig_output_script(client_pub, server_pub) {
        return Err(ChannelError::verification(
            "contract output 0 is not the agreed 2-of-2 multisig",
        ));
    }
    let total_value = Amount::from_sat(output.value);
    if amount::is_dust(total_value) {
        return Err(ChannelError::verification("contract output 0 is dust"));
    }
    if contract_outpoint(contract) != refund_outpoint {
        return Err(ChannelError::verification(
            "contract does not create the output the refund spends",
        ));
    }
    Ok(total_value)
}

#[cfg(test)]
mod test {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    fn two_keys() -> (PublicKey, PublicKey) {
        let secp = Secp256k1::new();
        let client = SecretKey::new(&mut rand::thread_rng());
        let server = SecretKey::new(&mut rand::thread_rng());
        (
            PublicKey::from_secret_key(&secp, &client),
            PublicKey::from_secret_key(&secp, &server),
        )
    }

    #[test]
    fn script_lists_client_key_first() {
        let (client, server) = two_keys();
        let script = multisig_output_script(&client, &server);
        let (parsed_client, parsed_server) = parse_multisig_script(&script).unwrap();
        assert_eq!(parsed_client, client);
        assert_eq!(parsed_server, server);
        assert_ne!(script, multisig_output_script(&server, &client));
    }

    #[test]
    fn parse_rejects_other_scripts() {
        let (client, _) = two_keys();
        assert!(parse_multisig_script(&p2pkh_script(&client, Network::Testnet)).is_none());
        assert!(parse_multisig_script(&Script::new()).is_none());
    }

    #[test]
    fn template_locks_total_value_at_output_zero() {
        let (client, server) = two_keys();
        let tx = contract_template(Amount::from_sat(1_000_000), &client, &server);
        assert_eq!(tx.output.len(), 1);
        assert_eq!(tx.output[0].value, 1_000_000);
        assert!(parse_multisig_script(&tx.output[0].script_pubkey).is_some());
    }

    #[test]
    fn validation_checks_script_value_and_outpoint() {
        let (client, server) = two_keys();
        let contract = contract_template(Amount::from_sat(1_000_000), &client, &server);
        let outpoint = contract_outpoint(&contract);
        assert_eq!(
            validate_contract(&contract, &client, &server, outpoint).unwrap(),
            Amount::from_sat(1_000_000)
        );
        // Wrong key order in the expectation.
        assert!(validate_contract(&contract, &server, &client, outpoint).is_err());
        // Refund spending some other transaction.
        let other = OutPoint::new(bitcoin::Txid::all_zeros(), 0);
        assert!(validate_contract(&contract, &client, &server, other).is_err());
        // Dust-sized contract.
        let dusty = contract_template(Amount::from_sat(100), &client, &server);
        let dusty_outpoint = contract_outpoint(&dusty);
        assert!(validate_contract(&dusty, &client, &server, dusty_outpoint).is_err());
    }
}
