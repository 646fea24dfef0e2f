//! Test doubles for wiring the engine without a real broker, transaction
//! manager, or feedback channel. Used by this crate's own tests and usable
//! by downstream crates for theirs.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::client::{CommitAction, TransactionHook, TxOutcome};
use crate::error::TxMsgError;
use crate::feedback::FeedbackSource;
use crate::sender::{BrokerAck, BrokerPublisher};
use crate::types::FeedbackRecord;

/// A recorded publish.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: String,
    pub key: String,
    pub tag: Option<String>,
    pub payload: String,
    pub offset: i64,
}

/// In-memory broker that records publishes and can be told to fail
/// specific keys.
#[derive(Default)]
pub struct MockBroker {
    published: Mutex<Vec<PublishedMessage>>,
    failing_keys: Mutex<HashSet<String>>,
    next_offset: AtomicI64,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every publish of `key` fail until cleared.
    pub fn fail_key(&self, key: impl Into<String>) {
        self.failing_keys.lock().expect("lock").insert(key.into());
    }

    pub fn clear_failures(&self) {
        self.failing_keys.lock().expect("lock").clear();
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().expect("lock").clone()
    }

    pub fn publish_count(&self) -> usize {
        self.published.lock().expect("lock").len()
    }
}

#[async_trait]
impl BrokerPublisher for MockBroker {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        tag: Option<&str>,
        payload: &str,
    ) -> Result<BrokerAck, TxMsgError> {
        if self.failing_keys.lock().expect("lock").contains(key) {
            return Err(TxMsgError::Send(format!("broker rejected key {}", key)));
        }

        let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
        self.published.lock().expect("lock").push(PublishedMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            tag: tag.map(str::to_string),
            payload: payload.to_string(),
            offset,
        });
        Ok(BrokerAck { offset })
    }
}

/// Hand-driven transaction context: collects commit actions and completion
/// observers, then runs them when the test calls [`commit`] or
/// [`rollback`].
///
/// [`commit`]: ManualTransaction::commit
/// [`rollback`]: ManualTransaction::rollback
pub struct ManualTransaction {
    active: AtomicBool,
    actions: Mutex<Vec<CommitAction>>,
    observers: Mutex<Vec<Box<dyn FnOnce(TxOutcome) + Send>>>,
}

impl Default for ManualTransaction {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualTransaction {
    /// Starts with an active transaction.
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(true),
            actions: Mutex::new(Vec::new()),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Starts with no active transaction.
    pub fn inactive() -> Self {
        let tx = Self::new();
        tx.active.store(false, Ordering::SeqCst);
        tx
    }

    pub fn begin(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    /// Commit: run every registered action to completion, then notify
    /// observers.
    pub async fn commit(&self) {
        self.active.store(false, Ordering::SeqCst);
        let actions: Vec<CommitAction> = self.actions.lock().expect("lock").drain(..).collect();
        for action in actions {
            action.await;
        }
        for observer in self.observers.lock().expect("lock").drain(..) {
            observer(TxOutcome::Committed);
        }
    }

    /// Roll back: registered actions are discarded, observers are notified.
    pub fn rollback(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.actions.lock().expect("lock").clear();
        for observer in self.observers.lock().expect("lock").drain(..) {
            observer(TxOutcome::RolledBack);
        }
    }

    pub fn pending_actions(&self) -> usize {
        self.actions.lock().expect("lock").len()
    }
}

impl TransactionHook for ManualTransaction {
    fn in_transaction(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn on_commit(&self, action: CommitAction) {
        self.actions.lock().expect("lock").push(action);
    }

    fn on_completion(&self, observer: Box<dyn FnOnce(TxOutcome) + Send>) {
        self.observers.lock().expect("lock").push(observer);
    }
}

/// Scriptable feedback channel: batches pushed by the test are handed out
/// one per poll.
#[derive(Default)]
pub struct ManualFeedbackSource {
    batches: Mutex<VecDeque<Vec<String>>>,
    commits: AtomicUsize,
}

impl ManualFeedbackSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_raw_batch(&self, batch: Vec<String>) {
        self.batches.lock().expect("lock").push_back(batch);
    }

    pub fn push_records(&self, records: &[FeedbackRecord]) {
        let batch = records
            .iter()
            .map(|r| serde_json::to_string(r).expect("serialize feedback record"))
            .collect();
        self.push_raw_batch(batch);
    }

    /// Number of batches acknowledged so far.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn pending_batches(&self) -> usize {
        self.batches.lock().expect("lock").len()
    }
}

#[async_trait]
impl FeedbackSource for ManualFeedbackSource {
    async fn poll(&self, timeout: Duration) -> Result<Vec<String>, TxMsgError> {
        let next = self.batches.lock().expect("lock").pop_front();
        match next {
            Some(batch) => Ok(batch),
            None => {
                tokio::time::sleep(timeout).await;
                Ok(Vec::new())
            }
        }
    }

    async fn commit(&self) -> Result<(), TxMsgError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
