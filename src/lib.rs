//! A transactional-outbox ("local message table") engine.
//!
//! This crate keeps a database write and a broker publish consistent
//! **without distributed transactions**: messages are staged in a local
//! table inside the caller's own transaction, published asynchronously
//! after commit, re-driven by a bounded compensation sweep until the broker
//! confirms them, and finally closed out by a downstream consumption
//! feedback loop.
//!
//! ## Guarantees
//! - A message is published if and only if its staging transaction commits
//! - At-least-once delivery, durable across process crashes
//! - Idempotent staging via a unique message key
//! - Bounded sweep and cleanup cost per invocation
//! - Safe concurrent status updates (status-guarded, idempotent)
//!
//! ## Non-Guarantees
//! - Exactly-once delivery (consumers must be idempotent)
//! - Ordering across distinct messages
//! - Distributed transaction coordination (no 2PC)
//!
//! The broker client, the relational engine, and the host transaction
//! manager stay external: the engine talks to them through the
//! [`BrokerPublisher`], [`TxMsgStore`], and [`TransactionHook`] traits.

mod client;
mod error;
mod feedback;
mod sender;
mod store;
mod types;

pub mod testing;

#[cfg(feature = "postgres")]
mod store_postgres;

pub use client::{
    CommitAction, MissingTxPolicy, SendMode, TransactionHook, TxMsgClient, TxMsgClientBuilder,
    TxOutcome,
};
pub use error::TxMsgError;
pub use feedback::{
    json_feedback_parser, FeedbackConfig, FeedbackConsumer, FeedbackDispatch, FeedbackParser,
    FeedbackPublisher, FeedbackSource,
};
pub use sender::{BatchSendReport, BrokerAck, BrokerPublisher, SenderConfig, TxMsgSender};
pub use store::{InMemoryStore, TxMsgStore};
pub use types::{
    FeedbackRecord, TxMessage, TxMsgStatus, DEFAULT_MAX_PAYLOAD_BYTES, MAX_KEY_LEN, MAX_TAG_LEN,
};

#[cfg(feature = "postgres")]
pub use store_postgres::PostgresStore;
