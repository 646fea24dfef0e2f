use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::error::TxMsgError;
use crate::sender::{BrokerAck, BrokerPublisher};
use crate::store::TxMsgStore;
use crate::types::FeedbackRecord;

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// A feedback channel delivering raw consumption-acknowledgment records.
///
/// `commit` acknowledges the records returned by the preceding `poll` and is
/// called only after their store updates completed, so a crash between the
/// two causes reprocessing rather than loss. Reprocessing is safe because
/// [`TxMsgStore::mark_consumer_results`] is idempotent.
#[async_trait]
pub trait FeedbackSource: Send + Sync {
    /// Block up to `timeout` for the next batch of serialized records.
    /// An empty vec means the poll timed out with nothing to do.
    async fn poll(&self, timeout: Duration) -> Result<Vec<String>, TxMsgError>;

    /// Acknowledge the last polled batch to the channel.
    async fn commit(&self) -> Result<(), TxMsgError>;
}

/// Parse function applied to each raw record.
pub type FeedbackParser =
    Arc<dyn Fn(&str) -> Result<FeedbackRecord, serde_json::Error> + Send + Sync>;

/// Default parser: records are flat JSON documents.
pub fn json_feedback_parser() -> FeedbackParser {
    Arc::new(|raw| serde_json::from_str(raw))
}

#[derive(Debug, Clone)]
pub struct FeedbackConfig {
    /// Poll timeout; also bounds how quickly workers notice shutdown.
    pub poll_timeout: Duration,

    /// Sub-batch size for store updates.
    pub batch_size: usize,

    /// Pause after a processing error before the loop retries.
    pub error_backoff: Duration,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            batch_size: 500,
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// One feedback worker: polls a source, applies outcomes to the store,
/// then acknowledges the batch.
pub struct FeedbackConsumer {
    store: Arc<dyn TxMsgStore>,
    source: Arc<dyn FeedbackSource>,
    parser: FeedbackParser,
    config: FeedbackConfig,
    running: Arc<AtomicBool>,
}

impl FeedbackConsumer {
    pub fn new(
        store: Arc<dyn TxMsgStore>,
        source: Arc<dyn FeedbackSource>,
        config: FeedbackConfig,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self::with_parser(store, source, json_feedback_parser(), config, running)
    }

    pub fn with_parser(
        store: Arc<dyn TxMsgStore>,
        source: Arc<dyn FeedbackSource>,
        parser: FeedbackParser,
        config: FeedbackConfig,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self { store, source, parser, config, running }
    }

    /// Poll loop. Runs until the shared running flag clears; each pass
    /// re-checks the flag, so shutdown latency is bounded by the poll
    /// timeout. Processing errors are logged and backed off, never fatal.
    pub async fn run(self) {
        tracing::info!("feedback consumer started");

        while self.running.load(Ordering::SeqCst) {
            let records = match self.source.poll(self.config.poll_timeout).await {
                Ok(records) => records,
                Err(err) => {
                    tracing::error!(error = %err, "feedback poll failed");
                    sleep(self.config.error_backoff).await;
                    continue;
                }
            };
            if records.is_empty() {
                continue;
            }

            if let Err(err) = self.process(records).await {
                tracing::error!(error = %err, "feedback batch processing failed");
                sleep(self.config.error_backoff).await;
                continue;
            }

            // Acknowledge only after the store updates are durable.
            if let Err(err) = self.source.commit().await {
                tracing::error!(error = %err, "feedback offset commit failed; batch will replay");
                sleep(self.config.error_backoff).await;
            }
        }

        tracing::info!("feedback consumer stopped");
    }

    async fn process(&self, records: Vec<String>) -> Result<(), TxMsgError> {
        let mut success_keys = Vec::new();
        let mut failed_keys = Vec::new();

        for raw in &records {
            match (self.parser)(raw) {
                Ok(record) => {
                    if record.success {
                        success_keys.push(record.msg_key);
                    } else {
                        tracing::debug!(
                            msg_key = %record.msg_key,
                            error_msg = ?record.error_msg,
                            "consumer reported failure"
                        );
                        failed_keys.push(record.msg_key);
                    }
                }
                Err(err) => {
                    // One malformed record never fails its batch.
                    metric_inc("txmsg.feedback.malformed");
                    tracing::error!(error = %err, raw = %raw, "skipping malformed feedback record");
                }
            }
        }

        for chunk in success_keys.chunks(self.config.batch_size.max(1)) {
            let (updated, _) = self.store.mark_consumer_results(chunk, &[]).await?;
            metric_inc("txmsg.feedback.applied");
            tracing::info!(received = chunk.len(), updated, "applied success feedback");
        }
        for chunk in failed_keys.chunks(self.config.batch_size.max(1)) {
            let (_, updated) = self.store.mark_consumer_results(&[], chunk).await?;
            metric_inc("txmsg.feedback.applied");
            tracing::info!(received = chunk.len(), updated, "applied failure feedback");
        }

        Ok(())
    }
}

/// Fixed pool of feedback workers, one per source, sharing a shutdown flag.
///
/// The sources are expected to belong to one logical consumer group so the
/// channel partitions the records across them.
pub struct FeedbackDispatch {
    running: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl FeedbackDispatch {
    pub fn start(
        store: Arc<dyn TxMsgStore>,
        sources: Vec<Arc<dyn FeedbackSource>>,
        config: FeedbackConfig,
    ) -> Self {
        Self::start_with_parser(store, sources, json_feedback_parser(), config)
    }

    pub fn start_with_parser(
        store: Arc<dyn TxMsgStore>,
        sources: Vec<Arc<dyn FeedbackSource>>,
        parser: FeedbackParser,
        config: FeedbackConfig,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let mut handles = Vec::with_capacity(sources.len());

        for source in sources {
            let consumer = FeedbackConsumer::with_parser(
                store.clone(),
                source,
                parser.clone(),
                config.clone(),
                running.clone(),
            );
            handles.push(tokio::spawn(consumer.run()));
        }

        tracing::info!(workers = handles.len(), "feedback dispatch started");
        Self { running, handles }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Signal all workers to stop and wait for them to drain.
    pub async fn shutdown(mut self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        tracing::info!("feedback dispatch stopped");
    }
}

/// Downstream-consumer helper: report a consumption outcome onto the
/// feedback topic through any broker adapter.
pub struct FeedbackPublisher {
    broker: Arc<dyn BrokerPublisher>,
    feedback_topic: String,
}

impl FeedbackPublisher {
    pub fn new(broker: Arc<dyn BrokerPublisher>, feedback_topic: impl Into<String>) -> Self {
        Self {
            broker,
            feedback_topic: feedback_topic.into(),
        }
    }

    pub async fn publish(&self, record: &FeedbackRecord) -> Result<BrokerAck, TxMsgError> {
        let payload =
            serde_json::to_string(record).map_err(|err| TxMsgError::Send(err.to_string()))?;
        self.broker
            .publish(&self.feedback_topic, &record.msg_key, None, &payload)
            .await
    }
}
