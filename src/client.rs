use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::TxMsgError;
use crate::sender::{BrokerPublisher, SenderConfig, TxMsgSender};
use crate::store::TxMsgStore;
use crate::types::{TxMessage, TxMsgStatus, DEFAULT_MAX_PAYLOAD_BYTES, MAX_KEY_LEN, MAX_TAG_LEN};

/// Work registered to run after a transaction commits.
pub type CommitAction = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Final outcome of a transaction, as reported to completion observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Committed,
    RolledBack,
    Unknown,
}

/// Capability interface the host transaction manager must expose.
///
/// Any transaction framework that can answer "is a transaction active",
/// run an action after commit, and report completion satisfies the
/// contract. Actions registered with [`on_commit`](TransactionHook::on_commit)
/// must not run when the transaction rolls back.
pub trait TransactionHook: Send + Sync {
    fn in_transaction(&self) -> bool;

    /// Schedule `action` to run once the current transaction commits.
    fn on_commit(&self, action: CommitAction);

    /// Observe the final outcome of the current transaction.
    fn on_completion(&self, observer: Box<dyn FnOnce(TxOutcome) + Send>);
}

/// How the post-commit send is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Spawn the send onto the runtime; the commit callback returns
    /// immediately.
    Async,
    /// Await the send inside the commit callback, accepting the broker
    /// latency inline.
    Sync,
}

/// Policy for `send_tx_msg` calls made outside an active transaction.
///
/// Without an enclosing transaction the staged row cannot be discarded on
/// rollback, so consistency is not guaranteed. The engine cannot know the
/// caller's intent, hence a policy instead of a hard rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingTxPolicy {
    /// Log a warning and proceed.
    Warn,
    /// Reject the call with a validation error.
    Reject,
}

/// Public entry point for transactional message sending.
///
/// `send_tx_msg` stages the message inside the caller's transaction and
/// registers a commit hook that hands it to the sender. The returned id
/// acknowledges durable staging only, not delivery.
pub struct TxMsgClient {
    store: Arc<dyn TxMsgStore>,
    sender: Arc<TxMsgSender>,
    hook: Arc<dyn TransactionHook>,
    send_mode: SendMode,
    missing_tx: MissingTxPolicy,
    max_payload_bytes: usize,
}

impl TxMsgClient {
    pub fn builder() -> TxMsgClientBuilder {
        TxMsgClientBuilder::default()
    }

    /// Stage `content` under `msg_key` and send it after commit.
    pub async fn send_tx_msg(&self, msg_key: &str, content: &str) -> Result<i64, TxMsgError> {
        self.send_tx_msg_with_tag(msg_key, None, content).await
    }

    /// Stage a tagged message under `msg_key` and send it after commit.
    pub async fn send_tx_msg_with_tag(
        &self,
        msg_key: &str,
        msg_tag: Option<&str>,
        content: &str,
    ) -> Result<i64, TxMsgError> {
        validate(msg_key, msg_tag, content, self.max_payload_bytes)?;

        if !self.hook.in_transaction() {
            match self.missing_tx {
                MissingTxPolicy::Warn => tracing::warn!(
                    msg_key = %msg_key,
                    "send_tx_msg called outside an active transaction; consistency is not guaranteed"
                ),
                MissingTxPolicy::Reject => {
                    return Err(TxMsgError::Validation(
                        "send_tx_msg requires an active transaction".into(),
                    ))
                }
            }
        }

        let msg = self.store.insert(content, msg_key, msg_tag).await?;
        let id = msg.id;
        tracing::debug!(msg_id = id, msg_key = %msg_key, "message staged in transaction");

        self.register_commit_hook(msg);
        Ok(id)
    }

    fn register_commit_hook(&self, msg: TxMessage) {
        let sender = self.sender.clone();
        let mode = self.send_mode;
        let msg_id = msg.id;

        self.hook.on_commit(Box::pin(async move {
            tracing::debug!(msg_id, "transaction committed; handing message to sender");
            match mode {
                SendMode::Async => {
                    tokio::spawn(async move {
                        sender.send_one(msg).await;
                    });
                }
                SendMode::Sync => sender.send_one(msg).await,
            }
        }));

        self.hook.on_completion(Box::new(move |outcome| {
            if outcome != TxOutcome::Committed {
                tracing::debug!(
                    msg_id,
                    ?outcome,
                    "transaction did not commit; staged row was discarded with it"
                );
            }
        }));
    }

    /// Re-drive `Waiting` messages through the broker (compensation sweep).
    pub async fn resend_waiting_tx_msg(
        &self,
        shard_suffix: Option<&str>,
    ) -> Result<usize, TxMsgError> {
        self.sender.resend_waiting(shard_suffix).await
    }

    /// Prune delivered messages created at or before `expire_time_ms`.
    ///
    /// Removes `Sent` and `ConsumerSuccess` rows. `ConsumerFailed` rows are
    /// kept for inspection; prune them explicitly through
    /// [`TxMsgSender::clean_expired`] if desired. `Waiting` rows are never
    /// touched.
    pub async fn clean_expired_tx_msg(&self, expire_time_ms: i64) -> Result<u64, TxMsgError> {
        let sent = self
            .sender
            .clean_expired(expire_time_ms, TxMsgStatus::Sent)
            .await?;
        let consumed = self
            .sender
            .clean_expired(expire_time_ms, TxMsgStatus::ConsumerSuccess)
            .await?;
        Ok(sent + consumed)
    }

    /// The sender backing this client, for schedulers that drive sweeps and
    /// cleanup directly.
    pub fn sender(&self) -> Arc<TxMsgSender> {
        self.sender.clone()
    }
}

fn validate(
    msg_key: &str,
    msg_tag: Option<&str>,
    content: &str,
    max_payload_bytes: usize,
) -> Result<(), TxMsgError> {
    if msg_key.is_empty() {
        return Err(TxMsgError::Validation("message key cannot be empty".into()));
    }
    if msg_key.chars().count() > MAX_KEY_LEN {
        return Err(TxMsgError::Validation(format!(
            "message key length cannot exceed {} characters",
            MAX_KEY_LEN
        )));
    }
    if let Some(tag) = msg_tag {
        if tag.chars().count() > MAX_TAG_LEN {
            return Err(TxMsgError::Validation(format!(
                "message tag length cannot exceed {} characters",
                MAX_TAG_LEN
            )));
        }
    }
    if content.is_empty() {
        return Err(TxMsgError::Validation("message content cannot be empty".into()));
    }
    if content.len() > max_payload_bytes {
        return Err(TxMsgError::Validation(format!(
            "message size {} bytes exceeds the {} byte limit",
            content.len(),
            max_payload_bytes
        )));
    }
    Ok(())
}

/// Builder for [`TxMsgClient`]. Store, broker, and transaction hook are
/// required; `build` fails fast with [`TxMsgError::Config`] when one is
/// missing.
#[derive(Default)]
pub struct TxMsgClientBuilder {
    store: Option<Arc<dyn TxMsgStore>>,
    broker: Option<Arc<dyn BrokerPublisher>>,
    hook: Option<Arc<dyn TransactionHook>>,
    sender_config: Option<SenderConfig>,
    send_mode: Option<SendMode>,
    missing_tx: Option<MissingTxPolicy>,
    max_payload_bytes: Option<usize>,
}

impl TxMsgClientBuilder {
    pub fn store(mut self, store: Arc<dyn TxMsgStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn broker(mut self, broker: Arc<dyn BrokerPublisher>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn transaction_hook(mut self, hook: Arc<dyn TransactionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn sender_config(mut self, config: SenderConfig) -> Self {
        self.sender_config = Some(config);
        self
    }

    pub fn send_mode(mut self, mode: SendMode) -> Self {
        self.send_mode = Some(mode);
        self
    }

    pub fn missing_tx_policy(mut self, policy: MissingTxPolicy) -> Self {
        self.missing_tx = Some(policy);
        self
    }

    pub fn max_payload_bytes(mut self, max: usize) -> Self {
        self.max_payload_bytes = Some(max);
        self
    }

    pub fn build(self) -> Result<TxMsgClient, TxMsgError> {
        let store = self.store.ok_or(TxMsgError::Config("store is required"))?;
        let broker = self.broker.ok_or(TxMsgError::Config("broker is required"))?;
        let hook = self
            .hook
            .ok_or(TxMsgError::Config("transaction hook is required"))?;
        let max_payload_bytes = self.max_payload_bytes.unwrap_or(DEFAULT_MAX_PAYLOAD_BYTES);
        if max_payload_bytes == 0 {
            return Err(TxMsgError::Config("max payload size cannot be zero"));
        }

        let sender = Arc::new(TxMsgSender::new(
            broker,
            store.clone(),
            self.sender_config.unwrap_or_default(),
        ));

        Ok(TxMsgClient {
            store,
            sender,
            hook,
            send_mode: self.send_mode.unwrap_or(SendMode::Async),
            missing_tx: self.missing_tx.unwrap_or(MissingTxPolicy::Warn),
            max_payload_bytes,
        })
    }
}
