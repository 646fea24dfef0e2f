use std::fmt;

/// Errors surfaced to callers of the outbox engine.
///
/// Everything that can fail *before or inside* the caller's transaction
/// (validation, duplicate keys, store writes) is returned through this type
/// so the caller can abort its transaction. Failures *after* commit (broker
/// publishes, feedback processing) are logged and recovered by the
/// compensation sweep; they never reach the original caller.
#[derive(Debug)]
pub enum TxMsgError {
    /// Bad key, tag, or content. No row was written.
    Validation(String),

    /// The message key already exists in the table.
    /// Callers may treat this as an idempotent replay of an earlier send.
    DuplicateKey {
        msg_key: String,
    },

    /// Persistence failure other than a key collision.
    Store(String),

    /// Broker publish failure. Returned by [`crate::BrokerPublisher`]
    /// implementations; the engine itself only logs it.
    Send(String),

    /// A required collaborator was missing at construction.
    Config(&'static str),
}

impl fmt::Display for TxMsgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxMsgError::Validation(reason) =>
                write!(f, "invalid message: {}", reason),
            TxMsgError::DuplicateKey { msg_key } =>
                write!(f, "message key already staged: {}", msg_key),
            TxMsgError::Store(reason) =>
                write!(f, "store failure: {}", reason),
            TxMsgError::Send(reason) =>
                write!(f, "broker publish failed: {}", reason),
            TxMsgError::Config(what) =>
                write!(f, "missing or invalid configuration: {}", what),
        }
    }
}

impl std::error::Error for TxMsgError {}
