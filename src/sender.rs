use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;

use crate::error::TxMsgError;
use crate::store::TxMsgStore;
use crate::types::{TxMessage, TxMsgStatus};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Broker acknowledgment of a confirmed publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerAck {
    pub offset: i64,
}

/// Broker-facing publish primitive.
///
/// Implementations adapt a concrete broker client (Kafka, Rocket, ...) to
/// the engine. The engine never retries here; undelivered messages stay
/// `Waiting` and are re-driven by the compensation sweep.
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        tag: Option<&str>,
        payload: &str,
    ) -> Result<BrokerAck, TxMsgError>;
}

/// Tuning knobs for the sender and its sweeps.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Page size for the compensation sweep.
    pub fetch_limit: usize,

    /// Upper bound on messages processed by one sweep invocation. Work
    /// beyond the cap is left for the next invocation.
    pub max_resend_per_task: usize,

    /// Row bound for each expiry delete statement.
    pub delete_batch_size: usize,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            fetch_limit: 50,
            max_resend_per_task: 2_000,
            delete_batch_size: 200,
        }
    }
}

/// Outcome of one batch publish.
#[derive(Debug, Clone, Default)]
pub struct BatchSendReport {
    /// Ids confirmed by the broker and marked `Sent`.
    pub sent: Vec<i64>,

    /// Ids that failed to publish; they remain `Waiting` for the next sweep.
    pub failed: Vec<i64>,
}

/// Publishes staged messages and advances their status.
///
/// All methods here run after the caller's transaction has committed, so
/// failures are logged and left to the compensation sweep instead of being
/// surfaced to the original caller.
pub struct TxMsgSender {
    broker: Arc<dyn BrokerPublisher>,
    store: Arc<dyn TxMsgStore>,
    config: SenderConfig,
}

impl TxMsgSender {
    pub fn new(
        broker: Arc<dyn BrokerPublisher>,
        store: Arc<dyn TxMsgStore>,
        config: SenderConfig,
    ) -> Self {
        Self { broker, store, config }
    }

    /// Publish one message and mark it `Sent` on broker confirmation.
    ///
    /// On publish failure the row is left `Waiting`; no retry is attempted
    /// here.
    pub async fn send_one(&self, msg: TxMessage) {
        let msg_id = msg.id;
        match self
            .broker
            .publish(&msg.topic, &msg.msg_key, msg.msg_tag.as_deref(), &msg.content)
            .await
        {
            Ok(ack) => {
                metric_inc("txmsg.send.sent");
                tracing::debug!(msg_id, offset = ack.offset, topic = %msg.topic, "message published");
                match self.store.mark_sent(msg_id).await {
                    Ok(0) => {
                        tracing::warn!(msg_id, "publish confirmed but no Waiting row was updated")
                    }
                    Ok(_) => {}
                    Err(err) => {
                        // The row stays Waiting; the next sweep republishes.
                        tracing::error!(msg_id, error = %err, "failed to mark message sent");
                    }
                }
            }
            Err(err) => {
                metric_inc("txmsg.send.failed");
                tracing::error!(msg_id, topic = %msg.topic, error = %err, "message publish failed");
            }
        }
    }

    /// Publish a batch concurrently, then mark the confirmed subset `Sent`
    /// with a single batch update. Failed ids are logged and left `Waiting`.
    pub async fn send_batch(&self, msgs: Vec<TxMessage>) -> BatchSendReport {
        let mut report = BatchSendReport::default();
        if msgs.is_empty() {
            return report;
        }

        let mut in_flight = JoinSet::new();
        for msg in msgs {
            let broker = self.broker.clone();
            in_flight.spawn(async move {
                let outcome = broker
                    .publish(&msg.topic, &msg.msg_key, msg.msg_tag.as_deref(), &msg.content)
                    .await;
                (msg.id, msg.topic, outcome)
            });
        }

        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok((id, _, Ok(_))) => report.sent.push(id),
                Ok((id, topic, Err(err))) => {
                    tracing::error!(msg_id = id, topic = %topic, error = %err, "batch publish failed");
                    report.failed.push(id);
                }
                Err(err) => {
                    tracing::error!(error = %err, "batch publish task panicked");
                }
            }
        }

        if !report.sent.is_empty() {
            match self.store.mark_sent_batch(&report.sent).await {
                Ok(updated) if updated as usize != report.sent.len() => {
                    tracing::warn!(
                        expected = report.sent.len(),
                        updated,
                        "some sent messages were already marked"
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(error = %err, "batch status update failed; rows stay Waiting");
                }
            }
        }
        if !report.failed.is_empty() {
            metric_inc("txmsg.send.failed");
            tracing::error!(failed = ?report.failed, "batch publish left messages Waiting");
        }

        report
    }

    /// Compensation sweep: republish `Waiting` messages in id order.
    ///
    /// Pages through the store with a local cursor, stopping on an empty or
    /// short page or once `max_resend_per_task` messages have been
    /// processed. A failed page is logged and does not abort the sweep.
    /// Returns the number of messages processed.
    pub async fn resend_waiting(&self, shard_suffix: Option<&str>) -> Result<usize, TxMsgError> {
        let mut cursor = 0i64;
        let mut total = 0usize;

        loop {
            if total >= self.config.max_resend_per_task {
                tracing::warn!(
                    cap = self.config.max_resend_per_task,
                    "sweep reached its per-task cap; remaining messages wait for the next run"
                );
                break;
            }

            let page = self
                .store
                .fetch_waiting(self.config.fetch_limit, cursor, shard_suffix)
                .await?;
            if page.is_empty() {
                break;
            }

            let fetched = page.len();
            total += fetched;
            cursor = page.last().map(|m| m.id).unwrap_or(cursor);
            tracing::info!(fetched, total, cursor, shard = ?shard_suffix, "processing sweep page");
            metric_inc("txmsg.resend.page");

            self.send_batch(page).await;

            if fetched < self.config.fetch_limit {
                break;
            }
        }

        tracing::info!(total, shard = ?shard_suffix, "compensation sweep finished");
        Ok(total)
    }

    /// Remove messages in `status` created at or before `expire_time`.
    pub async fn clean_expired(
        &self,
        expire_time: i64,
        status: TxMsgStatus,
    ) -> Result<u64, TxMsgError> {
        let deleted = self
            .store
            .delete_expired(expire_time, status, self.config.delete_batch_size)
            .await?;
        metric_inc("txmsg.cleanup.pass");
        tracing::info!(deleted, ?status, expire_time, "expired message cleanup finished");
        Ok(deleted)
    }
}
