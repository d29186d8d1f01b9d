use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::Txid;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};

/// A stable identifier for a channel.
///
/// The client derives one from a tag naming the server it is paying (any byte string; a host
/// name is typical); the server derives one from the contract itself. The id does not need to be
/// globally unique, it only keys the channel's record in storage.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(
    #[serde(serialize_with = "crate::helpers::to_hex", deserialize_with = "crate::helpers::fixed_from_hex")]
    [u8; 32],
);

impl ChannelId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        ChannelId(bytes)
    }

    /// Derives an id by hashing an arbitrary tag, typically the name of the server being paid.
    pub fn from_tag(tag: impl AsRef<[u8]>) -> Self {
        let mut engine = sha256::Hash::engine();
        engine.input(b"ChannelId");
        engine.input(tag.as_ref());
        ChannelId(sha256::Hash::from_engine(engine).into_inner())
    }

    /// Derives an id from the multisig contract that funds the channel.
    pub fn from_contract_txid(txid: Txid) -> Self {
        ChannelId(txid.into_inner())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The channel name, which is always in the format `DRB<first 16 bytes of hex encoded id>`
    pub fn name(&self) -> String {
        format!("DRB{}", hex::encode(&self.0[..16]))
    }
}

impl Debug for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ChannelId").field(&hex::encode(self.0)).finish()
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tag_ids_are_deterministic() {
        let a = ChannelId::from_tag("merchant.example.com");
        let b = ChannelId::from_tag("merchant.example.com");
        let c = ChannelId::from_tag("other.example.com");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn name_format() {
        let id = ChannelId::from_bytes([0xab; 32]);
        assert_eq!(id.name(), format!("DRB{}", "ab".repeat(16)));
        assert_eq!(id.to_string(), id.name());
    }

    #[test]
    fn serde_round_trip() {
        let id = ChannelId::from_tag("merchant");
        let serialized = ron::to_string(&id).unwrap();
        let deserialized: ChannelId = ron::from_str(&serialized).unwrap();
        assert_eq!(id, deserialized);
    }
}
