//! Shared fixtures: a client and server pair wired to in-memory collaborators, plus a helper to
//! walk them through channel establishment.

use crate::broadcast::RecordingBroadcaster;
use crate::channel_id::ChannelId;
use crate::client::{ClientChannelState, ClientStage};
use crate::keys::ChannelKey;
use crate::records::{StoredClientChannel, StoredServerChannel};
use crate::server::{ServerChannelState, ServerStage};
use crate::storage::MemoryStore;
use crate::wallet::DummyWallet;
use bitcoin::consensus::encode::serialize;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{Amount, Network};

pub type TestClient = ClientChannelState<DummyWallet, MemoryStore<StoredClientChannel>>;
pub type TestServer =
    ServerChannelState<DummyWallet, RecordingBroadcaster, MemoryStore<StoredServerChannel>>;

pub const NETWORK: Network = Network::Testnet;

pub struct ChannelPair {
    pub client: TestClient,
    pub server: TestServer,
    pub client_key: ChannelKey,
    pub server_key: ChannelKey,
}

/// A fresh, unopened channel pair. The client wallet holds well over the channel value so
/// funding always succeeds.
pub fn channel_pair(total_value: u64, expiry_time: u64, min_expire_time: u64) -> ChannelPair {
    let secp = Secp256k1::new();
    let mut rng = rand::thread_rng();
    let client_key = ChannelKey::random(&secp, &mut rng);
    let server_key = ChannelKey::random(&secp, &mut rng);
    let server = ServerChannelState::new(
        RecordingBroadcaster::new(),
        DummyWallet::with_balance(Amount::ZERO),
        MemoryStore::new(),
        NETWORK,
        server_key.clone(),
        min_expire_time,
    );
    let client = ClientChannelState::new(
        DummyWallet::with_balance(Amount::from_sat(total_value.saturating_mul(10).max(1_000_000))),
        MemoryStore::new(),
        NETWORK,
        client_key.clone(),
        &server_key.public_key().serialize(),
        Amount::from_sat(total_value),
        expiry_time,
    )
    .expect("valid channel parameters");
    ChannelPair { client, server, client_key, server_key }
}

/// Walks a pair through the whole opening handshake, leaving both sides `Ready`.
pub async fn open_channel(pair: &mut ChannelPair, id: ChannelId) {
    let client = &mut pair.client;
    let server = &mut pair.server;
    client.initiate(None).expect("initiate");
    let refund = client.incomplete_refund_transaction().expect("incomplete refund");
    let client_pub = client.client_public_key().serialize();
    let server_sig = server
        .provide_refund_transaction(&serialize(&refund), &client_pub, None)
        .expect("server refund signature");
    client.provide_refund_signature(&server_sig, None).expect("countersign refund");
    client.store_channel_in_wallet(id).expect("store client channel");
    let contract = client.contract().expect("contract");
    server.provide_contract(contract).await.expect("provide contract");
    server.store_channel_in_wallet().expect("store server channel");
    assert_eq!(client.stage(), ClientStage::Ready);
    assert_eq!(server.stage(), ServerStage::Ready);
}
