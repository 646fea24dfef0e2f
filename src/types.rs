use serde::{Deserialize, Serialize};

/// Maximum length of a message key, in characters.
pub const MAX_KEY_LEN: usize = 128;

/// Maximum length of a message tag, in characters.
pub const MAX_TAG_LEN: usize = 128;

/// Default payload cap in bytes (the common broker per-message limit).
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1_048_576;

/// Lifecycle status of a staged message.
///
/// Transitions are one-directional:
/// `Waiting -> Sent -> {ConsumerSuccess | ConsumerFailed}`.
/// A row never moves back to an earlier status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxMsgStatus {
    /// Staged, not yet confirmed by the broker.
    Waiting,
    /// Broker confirmed the publish.
    Sent,
    /// A downstream consumer reported successful processing.
    ConsumerSuccess,
    /// A downstream consumer reported a processing failure.
    ConsumerFailed,
}

impl TxMsgStatus {
    /// Wire/storage code for this status.
    pub fn code(self) -> i16 {
        match self {
            TxMsgStatus::Waiting => 0,
            TxMsgStatus::Sent => 1,
            TxMsgStatus::ConsumerSuccess => 2,
            TxMsgStatus::ConsumerFailed => 3,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(TxMsgStatus::Waiting),
            1 => Some(TxMsgStatus::Sent),
            2 => Some(TxMsgStatus::ConsumerSuccess),
            3 => Some(TxMsgStatus::ConsumerFailed),
            _ => None,
        }
    }

    /// Whether a downstream consumption outcome has been recorded.
    pub fn is_terminal(self) -> bool {
        matches!(self, TxMsgStatus::ConsumerSuccess | TxMsgStatus::ConsumerFailed)
    }
}

/// A durably staged message.
///
/// Created only by [`crate::TxMsgClient::send_tx_msg`] inside the caller's
/// transaction; mutated by the sender and the feedback consumers; destroyed
/// only by expiry cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxMessage {
    /// Store-assigned, strictly increasing. Doubles as the sweep cursor.
    pub id: i64,

    /// Caller-supplied idempotency key, unique across the table.
    pub msg_key: String,

    /// Optional classification label.
    pub msg_tag: Option<String>,

    /// Opaque payload. Schema management is the caller's responsibility.
    pub content: String,

    /// Destination topic, fixed per store instance.
    pub topic: String,

    pub status: TxMsgStatus,

    /// Tail number used to partition sweep work across workers.
    pub shard_key: Option<String>,

    /// Epoch milliseconds.
    pub create_time: i64,

    /// Epoch milliseconds.
    pub update_time: i64,
}

/// Acknowledgment of downstream consumption, reported over the feedback
/// channel as a flat JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRecord {
    /// Key of the original message.
    pub msg_key: String,

    pub success: bool,

    /// Present iff `!success`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,

    /// Epoch milliseconds at which the consumer processed the message.
    pub process_time: i64,
}

/// Shard key derivation: the trailing ASCII digit of the message key, if any.
pub(crate) fn shard_key_of(msg_key: &str) -> Option<String> {
    msg_key
        .chars()
        .last()
        .filter(|c| c.is_ascii_digit())
        .map(|c| c.to_string())
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        for status in [
            TxMsgStatus::Waiting,
            TxMsgStatus::Sent,
            TxMsgStatus::ConsumerSuccess,
            TxMsgStatus::ConsumerFailed,
        ] {
            assert_eq!(TxMsgStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(TxMsgStatus::from_code(9), None);
    }

    #[test]
    fn feedback_record_wire_shape() {
        let record = FeedbackRecord {
            msg_key: "order-1".to_string(),
            success: false,
            error_msg: Some("boom".to_string()),
            process_time: 1_700_000_000_000,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["msgKey"], "order-1");
        assert_eq!(json["errorMsg"], "boom");
        assert_eq!(json["processTime"], 1_700_000_000_000i64);

        let ok: FeedbackRecord =
            serde_json::from_str(r#"{"msgKey":"k","success":true,"processTime":1}"#).unwrap();
        assert!(ok.success);
        assert!(ok.error_msg.is_none());
    }

    #[test]
    fn shard_key_is_trailing_digit() {
        assert_eq!(shard_key_of("order-17"), Some("7".to_string()));
        assert_eq!(shard_key_of("order-x"), None);
        assert_eq!(shard_key_of(""), None);
    }
}
