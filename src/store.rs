use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::TxMsgError;
use crate::types::{now_ms, shard_key_of, TxMessage, TxMsgStatus};

/// Durable staging store for transactional messages.
///
/// The store is the only shared mutable resource in the engine. Correctness
/// of concurrent sweeps and feedback workers relies on its operations being
/// atomic per row and idempotent: status updates carry a status guard, so a
/// racing re-update of an already-advanced row affects zero rows instead of
/// rolling it back.
#[async_trait]
pub trait TxMsgStore: Send + Sync {
    /// Insert a new message with status `Waiting`.
    ///
    /// Must run on the caller's own connection so that rolling back the
    /// enclosing transaction also discards the insert. Fails with
    /// [`TxMsgError::DuplicateKey`] when `msg_key` is already staged.
    async fn insert(
        &self,
        content: &str,
        msg_key: &str,
        msg_tag: Option<&str>,
    ) -> Result<TxMessage, TxMsgError>;

    /// Fetch up to `limit` `Waiting` messages with `id > after_id`, in
    /// ascending id order, optionally restricted to one shard.
    async fn fetch_waiting(
        &self,
        limit: usize,
        after_id: i64,
        shard_suffix: Option<&str>,
    ) -> Result<Vec<TxMessage>, TxMsgError>;

    /// Mark one message `Sent`. Re-marking an already advanced row is a
    /// no-op returning 0 affected rows.
    async fn mark_sent(&self, id: i64) -> Result<u64, TxMsgError>;

    /// Batch variant of [`mark_sent`](TxMsgStore::mark_sent).
    async fn mark_sent_batch(&self, ids: &[i64]) -> Result<u64, TxMsgError>;

    /// Record downstream consumption outcomes by message key.
    ///
    /// Keys without a matching non-terminal row are silently ignored, which
    /// keeps at-least-once feedback replay safe. Returns the affected row
    /// counts as `(success_rows, failed_rows)`.
    async fn mark_consumer_results(
        &self,
        success_keys: &[String],
        failed_keys: &[String],
    ) -> Result<(u64, u64), TxMsgError>;

    /// Delete messages in `status` with `create_time <= before_time`,
    /// issuing bounded deletes of at most `batch_limit` rows until a pass
    /// removes nothing. `Waiting` rows are never deleted; passing
    /// `TxMsgStatus::Waiting` is a validation error.
    async fn delete_expired(
        &self,
        before_time: i64,
        status: TxMsgStatus,
        batch_limit: usize,
    ) -> Result<u64, TxMsgError>;
}

pub(crate) fn check_insert_args(content: &str, msg_key: &str) -> Result<(), TxMsgError> {
    if content.is_empty() {
        return Err(TxMsgError::Validation("message content cannot be empty".into()));
    }
    if msg_key.is_empty() {
        return Err(TxMsgError::Validation("message key cannot be empty".into()));
    }
    Ok(())
}

pub(crate) fn check_expiry_status(status: TxMsgStatus) -> Result<(), TxMsgError> {
    if status == TxMsgStatus::Waiting {
        return Err(TxMsgError::Validation(
            "expiry cleanup must not target Waiting messages".into(),
        ));
    }
    Ok(())
}

/// In-memory store for tests and lightweight deployments.
pub struct InMemoryStore {
    topic: String,
    inner: Mutex<Inner>,
}

struct Inner {
    next_id: i64,
    rows: BTreeMap<i64, TxMessage>,
}

impl InMemoryStore {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            inner: Mutex::new(Inner {
                next_id: 1,
                rows: BTreeMap::new(),
            }),
        }
    }

    /// Snapshot of one row, by message key.
    pub async fn find_by_key(&self, msg_key: &str) -> Option<TxMessage> {
        let inner = self.inner.lock().await;
        inner.rows.values().find(|m| m.msg_key == msg_key).cloned()
    }

    /// Snapshot of one row, by id.
    pub async fn find(&self, id: i64) -> Option<TxMessage> {
        let inner = self.inner.lock().await;
        inner.rows.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl TxMsgStore for InMemoryStore {
    async fn insert(
        &self,
        content: &str,
        msg_key: &str,
        msg_tag: Option<&str>,
    ) -> Result<TxMessage, TxMsgError> {
        check_insert_args(content, msg_key)?;

        let mut inner = self.inner.lock().await;
        if inner.rows.values().any(|m| m.msg_key == msg_key) {
            return Err(TxMsgError::DuplicateKey {
                msg_key: msg_key.to_string(),
            });
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let now = now_ms();
        let message = TxMessage {
            id,
            msg_key: msg_key.to_string(),
            msg_tag: msg_tag.filter(|t| !t.is_empty()).map(str::to_string),
            content: content.to_string(),
            topic: self.topic.clone(),
            status: TxMsgStatus::Waiting,
            shard_key: shard_key_of(msg_key),
            create_time: now,
            update_time: now,
        };
        inner.rows.insert(id, message.clone());
        Ok(message)
    }

    async fn fetch_waiting(
        &self,
        limit: usize,
        after_id: i64,
        shard_suffix: Option<&str>,
    ) -> Result<Vec<TxMessage>, TxMsgError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rows
            .range(after_id + 1..)
            .map(|(_, m)| m)
            .filter(|m| m.status == TxMsgStatus::Waiting)
            .filter(|m| match shard_suffix {
                Some(suffix) => m.shard_key.as_deref() == Some(suffix),
                None => true,
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_sent(&self, id: i64) -> Result<u64, TxMsgError> {
        self.mark_sent_batch(&[id]).await
    }

    async fn mark_sent_batch(&self, ids: &[i64]) -> Result<u64, TxMsgError> {
        let mut inner = self.inner.lock().await;
        let now = now_ms();
        let mut affected = 0;
        for id in ids {
            if let Some(row) = inner.rows.get_mut(id) {
                if row.status == TxMsgStatus::Waiting {
                    row.status = TxMsgStatus::Sent;
                    row.update_time = now;
                    affected += 1;
                }
            }
        }
        Ok(affected)
    }

    async fn mark_consumer_results(
        &self,
        success_keys: &[String],
        failed_keys: &[String],
    ) -> Result<(u64, u64), TxMsgError> {
        let mut inner = self.inner.lock().await;
        let now = now_ms();
        let mut mark = |keys: &[String], status: TxMsgStatus| -> u64 {
            let mut affected = 0;
            for row in inner.rows.values_mut() {
                if !row.status.is_terminal() && keys.iter().any(|k| k == &row.msg_key) {
                    row.status = status;
                    row.update_time = now;
                    affected += 1;
                }
            }
            affected
        };
        let success_rows = mark(success_keys, TxMsgStatus::ConsumerSuccess);
        let failed_rows = mark(failed_keys, TxMsgStatus::ConsumerFailed);
        Ok((success_rows, failed_rows))
    }

    async fn delete_expired(
        &self,
        before_time: i64,
        status: TxMsgStatus,
        batch_limit: usize,
    ) -> Result<u64, TxMsgError> {
        check_expiry_status(status)?;
        let batch_limit = batch_limit.max(1);

        let mut total = 0u64;
        loop {
            let mut inner = self.inner.lock().await;
            let batch: Vec<i64> = inner
                .rows
                .values()
                .filter(|m| m.status == status && m.create_time <= before_time)
                .take(batch_limit)
                .map(|m| m.id)
                .collect();
            if batch.is_empty() {
                return Ok(total);
            }
            for id in &batch {
                inner.rows.remove(id);
            }
            total += batch.len() as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_assigns_increasing_ids_and_waiting_status() {
        let store = InMemoryStore::new("orders");
        let a = store.insert("{}", "k-1", None).await.unwrap();
        let b = store.insert("{}", "k-2", Some("created")).await.unwrap();

        assert!(b.id > a.id);
        assert_eq!(a.status, TxMsgStatus::Waiting);
        assert_eq!(a.topic, "orders");
        assert_eq!(a.shard_key.as_deref(), Some("1"));
        assert_eq!(b.msg_tag.as_deref(), Some("created"));
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected_without_second_row() {
        let store = InMemoryStore::new("orders");
        store.insert("{}", "k-1", None).await.unwrap();

        let err = store.insert("other", "k-1", None).await.unwrap_err();
        assert!(matches!(err, TxMsgError::DuplicateKey { msg_key } if msg_key == "k-1"));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn empty_args_are_validation_errors() {
        let store = InMemoryStore::new("orders");
        assert!(matches!(
            store.insert("", "k", None).await,
            Err(TxMsgError::Validation(_))
        ));
        assert!(matches!(
            store.insert("{}", "", None).await,
            Err(TxMsgError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn fetch_waiting_pages_by_cursor_in_id_order() {
        let store = InMemoryStore::new("orders");
        for i in 0..5 {
            store.insert("{}", &format!("key-a{}", i), None).await.unwrap();
        }

        let first = store.fetch_waiting(2, 0, None).await.unwrap();
        assert_eq!(first.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2]);

        let second = store.fetch_waiting(10, 2, None).await.unwrap();
        assert_eq!(second.iter().map(|m| m.id).collect::<Vec<_>>(), vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn fetch_waiting_skips_sent_rows_and_honors_shard() {
        let store = InMemoryStore::new("orders");
        let a = store.insert("{}", "key-1", None).await.unwrap();
        store.insert("{}", "key-2", None).await.unwrap();
        store.insert("{}", "key-11", None).await.unwrap();

        store.mark_sent(a.id).await.unwrap();

        let shard_one = store.fetch_waiting(10, 0, Some("1")).await.unwrap();
        assert_eq!(
            shard_one.iter().map(|m| m.msg_key.as_str()).collect::<Vec<_>>(),
            vec!["key-11"]
        );
    }

    #[tokio::test]
    async fn mark_sent_is_idempotent() {
        let store = InMemoryStore::new("orders");
        let msg = store.insert("{}", "k-1", None).await.unwrap();

        assert_eq!(store.mark_sent(msg.id).await.unwrap(), 1);
        assert_eq!(store.mark_sent(msg.id).await.unwrap(), 0);
        assert_eq!(store.mark_sent(999).await.unwrap(), 0);
        assert_eq!(
            store.find(msg.id).await.unwrap().status,
            TxMsgStatus::Sent
        );
    }

    #[tokio::test]
    async fn consumer_results_only_advance_non_terminal_rows() {
        let store = InMemoryStore::new("orders");
        let a = store.insert("{}", "k-1", None).await.unwrap();
        let b = store.insert("{}", "k-2", None).await.unwrap();
        store.mark_sent_batch(&[a.id, b.id]).await.unwrap();

        let (ok, failed) = store
            .mark_consumer_results(
                &["k-1".to_string(), "missing".to_string()],
                &["k-2".to_string()],
            )
            .await
            .unwrap();
        assert_eq!((ok, failed), (1, 1));

        // Replayed feedback crossing terminal states affects nothing.
        let (ok, failed) = store
            .mark_consumer_results(&["k-2".to_string()], &["k-1".to_string()])
            .await
            .unwrap();
        assert_eq!((ok, failed), (0, 0));
        assert_eq!(
            store.find(a.id).await.unwrap().status,
            TxMsgStatus::ConsumerSuccess
        );
        assert_eq!(
            store.find(b.id).await.unwrap().status,
            TxMsgStatus::ConsumerFailed
        );
    }

    #[tokio::test]
    async fn delete_expired_loops_past_the_batch_limit() {
        let store = InMemoryStore::new("orders");
        let mut sent_ids = Vec::new();
        for i in 0..7 {
            let msg = store.insert("{}", &format!("old-a{}", i), None).await.unwrap();
            sent_ids.push(msg.id);
        }
        store.mark_sent_batch(&sent_ids).await.unwrap();
        let keep = store.insert("{}", "fresh", None).await.unwrap();

        let cutoff = now_ms() + 1;
        let deleted = store
            .delete_expired(cutoff, TxMsgStatus::Sent, 2)
            .await
            .unwrap();
        assert_eq!(deleted, 7);
        // The Waiting row is untouched regardless of age.
        assert!(store.find(keep.id).await.is_some());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn delete_expired_rejects_waiting_status() {
        let store = InMemoryStore::new("orders");
        let err = store
            .delete_expired(now_ms(), TxMsgStatus::Waiting, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, TxMsgError::Validation(_)));
    }

    #[tokio::test]
    async fn delete_expired_respects_cutoff() {
        let store = InMemoryStore::new("orders");
        let msg = store.insert("{}", "k-1", None).await.unwrap();
        store.mark_sent(msg.id).await.unwrap();

        let deleted = store
            .delete_expired(msg.create_time - 1, TxMsgStatus::Sent, 10)
            .await
            .unwrap();
        assert_eq!(deleted, 0);
        assert!(store.find(msg.id).await.is_some());
    }
}
