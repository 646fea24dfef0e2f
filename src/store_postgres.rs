#[cfg(feature = "postgres")]
use async_trait::async_trait;
#[cfg(feature = "postgres")]
use tokio_postgres::error::SqlState;
#[cfg(feature = "postgres")]
use tokio_postgres::{Client, Row};

#[cfg(feature = "postgres")]
use crate::error::TxMsgError;
#[cfg(feature = "postgres")]
use crate::store::{check_expiry_status, check_insert_args, TxMsgStore};
#[cfg(feature = "postgres")]
use crate::types::{now_ms, shard_key_of, TxMessage, TxMsgStatus};

/// Postgres-backed message store.
///
/// One instance covers one table and one destination topic. The table and
/// its indexes are provisioned on construction if missing: a unique index on
/// `msg_key` backs duplicate detection, and `(status, create_time)` backs
/// the waiting and expiry scans.
#[cfg(feature = "postgres")]
pub struct PostgresStore {
    client: Client,
    table: String,
    topic: String,
}

#[cfg(feature = "postgres")]
impl PostgresStore {
    pub async fn new(
        client: Client,
        table: impl Into<String>,
        topic: impl Into<String>,
    ) -> Result<Self, TxMsgError> {
        let table = table.into();
        let topic = topic.into();
        if table.is_empty() {
            return Err(TxMsgError::Config("table name cannot be empty"));
        }
        if topic.is_empty() {
            return Err(TxMsgError::Config("topic cannot be empty"));
        }

        client
            .batch_execute(&format!(
                "CREATE TABLE IF NOT EXISTS {t} (
                    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                    msg_key VARCHAR(128) NOT NULL,
                    msg_tag VARCHAR(128),
                    content TEXT NOT NULL,
                    topic VARCHAR(255) NOT NULL,
                    status SMALLINT NOT NULL,
                    shard_key VARCHAR(16),
                    create_time BIGINT NOT NULL,
                    update_time BIGINT NOT NULL
                );
                CREATE UNIQUE INDEX IF NOT EXISTS uk_{t}_msg_key ON {t} (msg_key);
                CREATE INDEX IF NOT EXISTS idx_{t}_status_create_time ON {t} (status, create_time);",
                t = table,
            ))
            .await
            .map_err(db_err)?;

        tracing::info!(table = %table, topic = %topic, "outbox table ready");
        Ok(Self { client, table, topic })
    }

    fn row_to_message(&self, row: &Row) -> Result<TxMessage, TxMsgError> {
        let code: i16 = row.get("status");
        let status = TxMsgStatus::from_code(code)
            .ok_or_else(|| TxMsgError::Store(format!("unknown status code {}", code)))?;
        Ok(TxMessage {
            id: row.get("id"),
            msg_key: row.get("msg_key"),
            msg_tag: row.get("msg_tag"),
            content: row.get("content"),
            topic: row.get("topic"),
            status,
            shard_key: row.get("shard_key"),
            create_time: row.get("create_time"),
            update_time: row.get("update_time"),
        })
    }
}

#[cfg(feature = "postgres")]
fn db_err(err: tokio_postgres::Error) -> TxMsgError {
    TxMsgError::Store(err.to_string())
}

#[cfg(feature = "postgres")]
#[async_trait]
impl TxMsgStore for PostgresStore {
    async fn insert(
        &self,
        content: &str,
        msg_key: &str,
        msg_tag: Option<&str>,
    ) -> Result<TxMessage, TxMsgError> {
        check_insert_args(content, msg_key)?;

        let now = now_ms();
        let msg_tag = msg_tag.filter(|t| !t.is_empty());
        let shard_key = shard_key_of(msg_key);
        let sql = format!(
            "INSERT INTO {} (msg_key, msg_tag, content, topic, status, shard_key, create_time, update_time)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING id",
            self.table,
        );

        let row = self
            .client
            .query_one(
                sql.as_str(),
                &[
                    &msg_key,
                    &msg_tag,
                    &content,
                    &self.topic.as_str(),
                    &TxMsgStatus::Waiting.code(),
                    &shard_key,
                    &now,
                    &now,
                ],
            )
            .await
            .map_err(|err| {
                if err.code() == Some(&SqlState::UNIQUE_VIOLATION) {
                    TxMsgError::DuplicateKey {
                        msg_key: msg_key.to_string(),
                    }
                } else {
                    db_err(err)
                }
            })?;

        let id: i64 = row.get(0);
        tracing::debug!(msg_id = id, msg_key = %msg_key, topic = %self.topic, "message staged");
        Ok(TxMessage {
            id,
            msg_key: msg_key.to_string(),
            msg_tag: msg_tag.map(str::to_string),
            content: content.to_string(),
            topic: self.topic.clone(),
            status: TxMsgStatus::Waiting,
            shard_key,
            create_time: now,
            update_time: now,
        })
    }

    async fn fetch_waiting(
        &self,
        limit: usize,
        after_id: i64,
        shard_suffix: Option<&str>,
    ) -> Result<Vec<TxMessage>, TxMsgError> {
        let limit = limit as i64;
        let rows = match shard_suffix {
            Some(suffix) => {
                let sql = format!(
                    "SELECT id, msg_key, msg_tag, content, topic, status, shard_key, create_time, update_time
                     FROM {} WHERE status = 0 AND id > $1 AND shard_key = $2
                     ORDER BY id ASC LIMIT $3",
                    self.table,
                );
                self.client
                    .query(sql.as_str(), &[&after_id, &suffix, &limit])
                    .await
                    .map_err(db_err)?
            }
            None => {
                let sql = format!(
                    "SELECT id, msg_key, msg_tag, content, topic, status, shard_key, create_time, update_time
                     FROM {} WHERE status = 0 AND id > $1
                     ORDER BY id ASC LIMIT $2",
                    self.table,
                );
                self.client
                    .query(sql.as_str(), &[&after_id, &limit])
                    .await
                    .map_err(db_err)?
            }
        };

        rows.iter().map(|row| self.row_to_message(row)).collect()
    }

    async fn mark_sent(&self, id: i64) -> Result<u64, TxMsgError> {
        let sql = format!(
            "UPDATE {} SET status = 1, update_time = $1 WHERE id = $2 AND status = 0",
            self.table,
        );
        self.client
            .execute(sql.as_str(), &[&now_ms(), &id])
            .await
            .map_err(db_err)
    }

    async fn mark_sent_batch(&self, ids: &[i64]) -> Result<u64, TxMsgError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE {} SET status = 1, update_time = $1 WHERE id = ANY($2) AND status = 0",
            self.table,
        );
        self.client
            .execute(sql.as_str(), &[&now_ms(), &ids])
            .await
            .map_err(db_err)
    }

    async fn mark_consumer_results(
        &self,
        success_keys: &[String],
        failed_keys: &[String],
    ) -> Result<(u64, u64), TxMsgError> {
        // The status guard keeps terminal rows terminal when feedback is
        // replayed or races the sender's own update.
        let sql = format!(
            "UPDATE {} SET status = $1, update_time = $2 WHERE msg_key = ANY($3) AND status < 2",
            self.table,
        );
        let now = now_ms();

        let mut success_rows = 0;
        if !success_keys.is_empty() {
            success_rows = self
                .client
                .execute(sql.as_str(), &[&TxMsgStatus::ConsumerSuccess.code(), &now, &success_keys])
                .await
                .map_err(db_err)?;
        }

        let mut failed_rows = 0;
        if !failed_keys.is_empty() {
            failed_rows = self
                .client
                .execute(sql.as_str(), &[&TxMsgStatus::ConsumerFailed.code(), &now, &failed_keys])
                .await
                .map_err(db_err)?;
        }

        Ok((success_rows, failed_rows))
    }

    async fn delete_expired(
        &self,
        before_time: i64,
        status: TxMsgStatus,
        batch_limit: usize,
    ) -> Result<u64, TxMsgError> {
        check_expiry_status(status)?;
        let batch_limit = batch_limit.max(1) as i64;

        // Postgres has no DELETE ... LIMIT; bound each pass through ctid so
        // a large expired range never sits behind one long-running delete.
        let sql = format!(
            "DELETE FROM {t} WHERE ctid IN (
                SELECT ctid FROM {t} WHERE status = $1 AND create_time <= $2 LIMIT $3
            )",
            t = self.table,
        );

        let mut total = 0u64;
        loop {
            let deleted = self
                .client
                .execute(sql.as_str(), &[&status.code(), &before_time, &batch_limit])
                .await
                .map_err(db_err)?;
            if deleted == 0 {
                break;
            }
            total += deleted;
            tracing::info!(deleted, total, table = %self.table, "expired message batch removed");
        }
        Ok(total)
    }
}
