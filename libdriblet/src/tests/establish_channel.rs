//! Channel establishment: the refund-before-contract handshake and its failure modes.

use crate::broadcast::RecordingBroadcaster;
use crate::channel_id::ChannelId;
use crate::client::ClientStage;
use crate::error::ChannelError;
use crate::helpers::unix_time;
use crate::server::ServerStage;
use crate::signing;
use crate::tests::support::{channel_pair, open_channel};
use bitcoin::consensus::encode::serialize;
use bitcoin::blockdata::transaction::EcdsaSighashType;
use bitcoin::Amount;

const DAY: u64 = 24 * 60 * 60;

#[tokio::test]
async fn happy_path_establishment() {
    env_logger::try_init().ok();
    let now = unix_time();
    let mut pair = channel_pair(1_000_000, now + DAY, now + DAY / 2);
    open_channel(&mut pair, ChannelId::from_tag("merchant")).await;

    assert_eq!(pair.client.total_value(), Amount::from_sat(1_000_000));
    assert_eq!(pair.client.value_refunded(), Amount::from_sat(1_000_000));
    assert_eq!(pair.client.value_spent(), Amount::ZERO);
    assert_eq!(pair.server.total_value(), Amount::from_sat(1_000_000));
    assert_eq!(pair.server.best_value_to_server(), Amount::ZERO);
    assert_eq!(pair.client.major_version(), pair.server.major_version());

    // The contract went out over the broadcaster and into the client's store.
    let contract = pair.server.contract().expect("server holds the contract").clone();
    assert!(pair.client.channel_id().is_some());
    let refund = pair.client.completed_refund_transaction().unwrap();
    assert_eq!(refund.input[0].previous_output.txid, contract.txid());
}

#[tokio::test]
async fn server_rejects_a_refund_that_expires_too_soon() {
    env_logger::try_init().ok();
    let now = unix_time();
    // The client proposes a 6 hour lock; the server demands at least 12.
    let mut pair = channel_pair(1_000_000, now + DAY / 4, now + DAY / 2);
    pair.client.initiate(None).unwrap();
    let refund = pair.client.incomplete_refund_transaction().unwrap();
    let err = pair.server.provide_refund_transaction(
        &serialize(&refund),
        &pair.client.client_public_key().serialize(),
        None,
    );
    assert!(matches!(err, Err(ChannelError::Verification(_))));
    assert_eq!(pair.server.stage(), ServerStage::WaitingForRefund);
}

#[tokio::test]
async fn client_rejects_a_refund_signature_with_the_wrong_sighash() {
    env_logger::try_init().ok();
    let now = unix_time();
    let mut pair = channel_pair(1_000_000, now + DAY, now + DAY / 2);
    pair.client.initiate(None).unwrap();
    let refund = pair.client.incomplete_refund_transaction().unwrap();

    // A server that signs ALL instead of NONE|ANYONECANPAY would freeze the refund's outputs.
    let secp = bitcoin::secp256k1::Secp256k1::new();
    let script = crate::contract::multisig_output_script(
        &pair.client.client_public_key(),
        &pair.server_key.public_key(),
    );
    let bad_sig = signing::sign_input(
        &secp,
        &refund,
        0,
        &script,
        EcdsaSighashType::All,
        &pair.server_key.secret(None).unwrap(),
    )
    .unwrap();
    let err = pair.client.provide_refund_signature(&signing::encode_signature(&bad_sig), None);
    assert!(matches!(err, Err(ChannelError::Verification(_))));
    assert_eq!(pair.client.stage(), ClientStage::WaitingForSignedRefund);

    // The correctly flagged signature is still accepted afterwards.
    let good_sig = signing::sign_input(
        &secp,
        &refund,
        0,
        &script,
        EcdsaSighashType::NonePlusAnyoneCanPay,
        &pair.server_key.secret(None).unwrap(),
    )
    .unwrap();
    pair.client.provide_refund_signature(&signing::encode_signature(&good_sig), None).unwrap();
    assert_eq!(pair.client.stage(), ClientStage::SaveStateInWallet);
}

#[tokio::test]
async fn contract_broadcast_failure_closes_the_server_side() {
    env_logger::try_init().ok();
    let now = unix_time();
    let mut pair = channel_pair(1_000_000, now + DAY, now + DAY / 2);

    // Swap in a server whose broadcaster always fails.
    let mut server = crate::server::ServerChannelState::new(
        crate::broadcast::FlakyBroadcaster::failing(u32::MAX),
        crate::wallet::DummyWallet::with_balance(Amount::ZERO),
        crate::storage::MemoryStore::new(),
        crate::tests::support::NETWORK,
        pair.server_key.clone(),
        now + DAY / 2,
    );
    pair.client.initiate(None).unwrap();
    let refund = pair.client.incomplete_refund_transaction().unwrap();
    let sig = server
        .provide_refund_transaction(
            &serialize(&refund),
            &pair.client.client_public_key().serialize(),
            None,
        )
        .unwrap();
    pair.client.provide_refund_signature(&sig, None).unwrap();
    pair.client.store_channel_in_wallet(ChannelId::from_tag("merchant")).unwrap();
    let contract = pair.client.contract().unwrap();
    let err = server.provide_contract(contract).await;
    assert!(matches!(err, Err(ChannelError::Broadcast(_))));
    assert_eq!(server.stage(), ServerStage::ErrorClosed);
}

#[tokio::test]
async fn channels_can_be_resumed_from_their_records() {
    env_logger::try_init().ok();
    let now = unix_time();
    let mut pair = channel_pair(1_000_000, now + DAY, now + DAY / 2);
    let id = ChannelId::from_tag("merchant");
    open_channel(&mut pair, id).await;
    pair.client.increment_payment_by(Amount::from_sat(100_000), None).unwrap();

    // Rebuild the client from an equivalent record, as a restarted host would.
    assert_eq!(pair.client.channel_id(), Some(id));
    let record = crate::StoredClientChannel {
        id,
        major_version: crate::MAJOR_VERSION,
        contract: pair.server.contract().unwrap().clone(),
        refund: pair.client.completed_refund_transaction().unwrap(),
        client_key: pair.client_key.clone(),
        value_to_client: pair.client.value_refunded(),
        refund_fees: pair.client.refund_tx_fees(),
        active: false,
        close_tx: None,
    };
    let mut store = crate::storage::MemoryStore::new();
    {
        use crate::storage::ChannelStore;
        store.add_channel(&record).unwrap();
    }
    let resumed = crate::client::ClientChannelState::from_stored(
        crate::wallet::DummyWallet::with_balance(Amount::ZERO),
        store,
        crate::tests::support::NETWORK,
        record,
    )
    .unwrap();
    assert_eq!(resumed.stage(), ClientStage::Ready);
    assert_eq!(resumed.value_refunded(), Amount::from_sat(900_000));
    assert_eq!(resumed.total_value(), Amount::from_sat(1_000_000));
    assert_eq!(resumed.expiry_time(), now + DAY);

    // And the server from its own record.
    let server_record = crate::StoredServerChannel {
        id: crate::ChannelId::from_contract_txid(pair.server.contract().unwrap().txid()),
        major_version: crate::MAJOR_VERSION,
        server_key: pair.server_key.clone(),
        contract: pair.server.contract().unwrap().clone(),
        best_value_to_server: pair.server.best_value_to_server(),
        best_value_signature: None,
        close_tx: None,
    };
    // A record claiming value without a signature must be refused.
    let mut bad = server_record.clone();
    bad.best_value_to_server = Amount::from_sat(100_000);
    assert!(crate::server::ServerChannelState::from_stored(
        RecordingBroadcaster::new(),
        crate::wallet::DummyWallet::with_balance(Amount::ZERO),
        crate::storage::MemoryStore::new(),
        crate::tests::support::NETWORK,
        now + DAY / 2,
        bad,
    )
    .is_err());
    let resumed_server = crate::server::ServerChannelState::from_stored(
        RecordingBroadcaster::new(),
        crate::wallet::DummyWallet::with_balance(Amount::ZERO),
        crate::storage::MemoryStore::new(),
        crate::tests::support::NETWORK,
        now + DAY / 2,
        server_record,
    )
    .unwrap();
    assert_eq!(resumed_server.stage(), ServerStage::Ready);
    assert_eq!(resumed_server.total_value(), Amount::from_sat(1_000_000));
}
