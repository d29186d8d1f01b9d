//! Legacy sighash computation and ECDSA signing for contract spends.
//!
//! All transactions in this protocol spend the bare 2-of-2 multisig output, so every signature
//! here is a legacy (pre-segwit) signature with the multisig output script as the script code.
//! The sighash mode matrix lives with the callers; this module only computes and checks.

use crate::contract;
use crate::error::ChannelError;
use bitcoin::blockdata::script::Builder;
use bitcoin::secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::util::sighash::SighashCache;
use bitcoin::blockdata::transaction::EcdsaSighashType;
use bitcoin::{EcdsaSig, Script, Transaction, TxOut};

/// Computes the legacy signature hash of `tx` input `index` under `script_code` and `hash_ty`.
pub fn legacy_sighash(
    tx: &Transaction,
    index: usize,
    script_code: &Script,
    hash_ty: EcdsaSighashType,
) -> Result<Message, ChannelError> {
    let sighash = SighashCache::new(tx)
        .legacy_signature_hash(index, script_code, hash_ty.to_u32())
        .map_err(|e| ChannelError::verification(format!("cannot compute sighash: {e}")))?;
    // A 32-byte digest is always a valid message.
    Ok(Message::from_slice(&sighash[..]).expect("32 byte digest"))
}

/// Signs `tx` input `index` with `secret` under the given sighash mode.
pub fn sign_input(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    index: usize,
    script_code: &Script,
    hash_ty: EcdsaSighashType,
    secret: &SecretKey,
) -> Result<EcdsaSig, ChannelError> {
    let msg = legacy_sighash(tx, index, script_code, hash_ty)?;
    Ok(EcdsaSig { sig: secp.sign_ecdsa(&msg, secret), hash_ty })
}

/// Checks `sig` over `tx` input `index` against `pubkey`, using the sighash mode carried in the
/// signature itself.
pub fn verify_input_signature(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    index: usize,
    script_code: &Script,
    sig: &EcdsaSig,
    pubkey: &PublicKey,
) -> Result<(), ChannelError> {
    let msg = legacy_sighash(tx, index, script_code, sig.hash_ty)?;
    secp.verify_ecdsa(&msg, &sig.sig, pubkey)
        .map_err(|_| ChannelError::verification("signature does not verify"))
}

/// Decodes a DER signature with its trailing sighash-flag byte. Non-standard flags are rejected.
pub fn decode_signature(bytes: &[u8]) -> Result<EcdsaSig, ChannelError> {
    EcdsaSig::from_slice(bytes)
        .map_err(|e| ChannelError::verification(format!("malformed signature: {e}")))
}

/// Encodes a signature as DER followed by its sighash-flag byte, the form that crosses the wire
/// and sits in script_sigs.
pub fn encode_signature(sig: &EcdsaSig) -> Vec<u8> {
    let mut bytes = sig.sig.serialize_der().to_vec();
    bytes.push(sig.hash_ty.to_u32() as u8);
    bytes
}

/// Assembles the script_sig that satisfies the 2-of-2 multisig output. Signature order must
/// match the public key order in the output script: client first, server second. The leading
/// OP_0 absorbs the extra element CHECKMULTISIG pops.
pub fn multisig_script_sig(client_sig: &EcdsaSig, server_sig: &EcdsaSig) -> Script {
    Builder::new()
        .push_int(0)
        .push_slice(&encode_signature(client_sig))
        .push_slice(&encode_signature(server_sig))
        .into_script()
}

/// Fully checks that `tx` input `index` satisfies a 2-of-2 multisig `contract_output`: the
/// script_sig must carry exactly two decodable signatures, and each must verify against its
/// positional public key under the sighash mode its flag byte declares.
pub fn verify_multisig_spend(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    index: usize,
    contract_output: &TxOut,
) -> Result<(), ChannelError> {
    let (client_pub, server_pub) = contract::parse_multisig_script(&contract_output.script_pubkey)
        .ok_or_else(|| ChannelError::verification("output is not a 2-of-2 multisig"))?;
    let input = tx
        .input
        .get(index)
        .ok_or_else(|| ChannelError::verification("input index out of range"))?;
    let mut pushes = Vec::with_capacity(3);
    for instruction in input.script_sig.instructions() {
        match instruction {
            Ok(bitcoin::blockdata::script::Instruction::PushBytes(data)) => pushes.push(data),
            _ => return Err(ChannelError::verification("script_sig is not push-only")),
        }
    }
    if pushes.len() != 3 || !pushes[0].is_empty() {
        return Err(ChannelError::verification("script_sig does not match OP_0 <sig> <sig>"));
    }
    let client_sig = decode_signature(pushes[1])?;
    let server_sig = decode_signature(pushes[2])?;
    verify_input_signature(secp, tx, index, &contract_output.script_pubkey, &client_sig, &client_pub)?;
    verify_input_signature(secp, tx, index, &contract_output.script_pubkey, &server_sig, &server_pub)?;
    Ok(())
}
