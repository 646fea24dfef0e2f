use std::sync::Arc;
use std::time::Duration;

use tx_outbox::testing::{ManualTransaction, MockBroker};
use tx_outbox::{
    InMemoryStore, MissingTxPolicy, SendMode, TxMsgClient, TxMsgError, TxMsgStatus,
};

struct Fixture {
    store: Arc<InMemoryStore>,
    broker: Arc<MockBroker>,
    tx: Arc<ManualTransaction>,
    client: TxMsgClient,
}

fn fixture(mode: SendMode) -> Fixture {
    let store = Arc::new(InMemoryStore::new("orders"));
    let broker = Arc::new(MockBroker::new());
    let tx = Arc::new(ManualTransaction::new());
    let client = TxMsgClient::builder()
        .store(store.clone())
        .broker(broker.clone())
        .transaction_hook(tx.clone())
        .send_mode(mode)
        .build()
        .expect("client");
    Fixture { store, broker, tx, client }
}

async fn wait_for_status(store: &InMemoryStore, id: i64, status: TxMsgStatus) {
    for _ in 0..100 {
        if store.find(id).await.map(|m| m.status) == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("message {} never reached {:?}", id, status);
}

#[tokio::test]
async fn staged_row_is_visible_before_commit() {
    let f = fixture(SendMode::Sync);

    let id = f.client.send_tx_msg("order-1", r#"{"a":1}"#).await.unwrap();
    assert!(id > 0);

    let row = f.store.find_by_key("order-1").await.expect("row staged");
    assert_eq!(row.id, id);
    assert_eq!(row.status, TxMsgStatus::Waiting);
    // Nothing reaches the broker until the transaction commits.
    assert_eq!(f.broker.publish_count(), 0);
}

#[tokio::test]
async fn commit_publishes_and_marks_sent_exactly_once() {
    let f = fixture(SendMode::Sync);

    let id = f.client.send_tx_msg("order-1", r#"{"a":1}"#).await.unwrap();
    f.tx.commit().await;

    let row = f.store.find(id).await.unwrap();
    assert_eq!(row.status, TxMsgStatus::Sent);
    assert_eq!(f.broker.publish_count(), 1);
    let published = f.broker.published();
    assert_eq!(published[0].topic, "orders");
    assert_eq!(published[0].key, "order-1");
    assert_eq!(published[0].payload, r#"{"a":1}"#);
}

#[tokio::test]
async fn async_mode_sends_after_commit_without_blocking() {
    let f = fixture(SendMode::Async);

    let id = f.client.send_tx_msg("order-1", "{}").await.unwrap();
    f.tx.commit().await;

    wait_for_status(&f.store, id, TxMsgStatus::Sent).await;
    assert_eq!(f.broker.publish_count(), 1);
}

#[tokio::test]
async fn rollback_sends_nothing() {
    let f = fixture(SendMode::Sync);

    f.client.send_tx_msg("order-1", "{}").await.unwrap();
    f.tx.rollback();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(f.broker.publish_count(), 0);
    assert_eq!(f.tx.pending_actions(), 0);
}

#[tokio::test]
async fn duplicate_key_is_rejected_and_creates_no_second_row() {
    let f = fixture(SendMode::Sync);

    f.client.send_tx_msg("order-1", "{}").await.unwrap();
    let err = f.client.send_tx_msg("order-1", "other").await.unwrap_err();
    assert!(matches!(err, TxMsgError::DuplicateKey { msg_key } if msg_key == "order-1"));
    assert_eq!(f.store.len().await, 1);
}

#[tokio::test]
async fn validation_failures_write_no_row() {
    let f = fixture(SendMode::Sync);

    let long_key = "k".repeat(129);
    let long_tag = "t".repeat(129);

    assert!(matches!(
        f.client.send_tx_msg("", "{}").await,
        Err(TxMsgError::Validation(_))
    ));
    assert!(matches!(
        f.client.send_tx_msg(&long_key, "{}").await,
        Err(TxMsgError::Validation(_))
    ));
    assert!(matches!(
        f.client.send_tx_msg_with_tag("k", Some(&long_tag), "{}").await,
        Err(TxMsgError::Validation(_))
    ));
    assert!(matches!(
        f.client.send_tx_msg("k", "").await,
        Err(TxMsgError::Validation(_))
    ));
    assert!(f.store.is_empty().await);
}

#[tokio::test]
async fn oversized_payload_is_rejected() {
    let store = Arc::new(InMemoryStore::new("orders"));
    let client = TxMsgClient::builder()
        .store(store.clone())
        .broker(Arc::new(MockBroker::new()))
        .transaction_hook(Arc::new(ManualTransaction::new()))
        .max_payload_bytes(16)
        .build()
        .unwrap();

    assert!(client.send_tx_msg("k", "short").await.is_ok());
    let err = client
        .send_tx_msg("k2", "payload definitely over sixteen bytes")
        .await
        .unwrap_err();
    assert!(matches!(err, TxMsgError::Validation(_)));
}

#[tokio::test]
async fn missing_transaction_policy_is_configurable() {
    // Default policy: warn and proceed.
    let warn_tx = Arc::new(ManualTransaction::inactive());
    let warn_client = TxMsgClient::builder()
        .store(Arc::new(InMemoryStore::new("orders")))
        .broker(Arc::new(MockBroker::new()))
        .transaction_hook(warn_tx)
        .build()
        .unwrap();
    assert!(warn_client.send_tx_msg("k", "{}").await.is_ok());

    // Reject policy: fail fast, nothing staged.
    let store = Arc::new(InMemoryStore::new("orders"));
    let reject_client = TxMsgClient::builder()
        .store(store.clone())
        .broker(Arc::new(MockBroker::new()))
        .transaction_hook(Arc::new(ManualTransaction::inactive()))
        .missing_tx_policy(MissingTxPolicy::Reject)
        .build()
        .unwrap();
    assert!(matches!(
        reject_client.send_tx_msg("k", "{}").await,
        Err(TxMsgError::Validation(_))
    ));
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn builder_requires_all_collaborators() {
    let missing_broker = TxMsgClient::builder()
        .store(Arc::new(InMemoryStore::new("orders")))
        .transaction_hook(Arc::new(ManualTransaction::new()))
        .build();
    assert!(matches!(missing_broker, Err(TxMsgError::Config(_))));

    let missing_store = TxMsgClient::builder()
        .broker(Arc::new(MockBroker::new()))
        .transaction_hook(Arc::new(ManualTransaction::new()))
        .build();
    assert!(matches!(missing_store, Err(TxMsgError::Config(_))));

    let missing_hook = TxMsgClient::builder()
        .store(Arc::new(InMemoryStore::new("orders")))
        .broker(Arc::new(MockBroker::new()))
        .build();
    assert!(matches!(missing_hook, Err(TxMsgError::Config(_))));
}

#[tokio::test]
async fn end_to_end_order_flow() {
    let f = fixture(SendMode::Sync);

    let id = f.client.send_tx_msg("order-1", r#"{"a":1}"#).await.unwrap();
    assert_eq!(
        f.store.find(id).await.unwrap().status,
        TxMsgStatus::Waiting
    );

    f.tx.commit().await;
    assert_eq!(f.store.find(id).await.unwrap().status, TxMsgStatus::Sent);

    f.tx.begin();
    let err = f.client.send_tx_msg("order-1", r#"{"a":1}"#).await.unwrap_err();
    assert!(matches!(err, TxMsgError::DuplicateKey { .. }));
}
