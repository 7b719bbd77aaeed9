use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A crosspost link: one source channel wired to one destination channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub id: i64,
    pub owner_id: i64,
    pub telegram_chat_id: i64,
    pub max_channel_id: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewLink {
    pub owner_id: i64,
    pub telegram_chat_id: i64,
    pub max_channel_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Success => "success",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(DeliveryStatus::Pending),
            "success" => Some(DeliveryStatus::Success),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

/// One delivery attempt of a source post through a link. The
/// (link_id, source_post_id) pair is unique, so a successful record
/// doubles as the dedup marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: i64,
    pub link_id: i64,
    pub source_post_id: i64,
    pub max_message_id: Option<String>,
    pub status: String,
    pub kind: Option<String>,
    pub error: Option<String>,
    pub latency_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl DeliveryRecord {
    pub fn status(&self) -> Option<DeliveryStatus> {
        DeliveryStatus::parse(&self.status)
    }
}

/// Outcome applied to an existing pending record.
#[derive(Debug, Clone)]
pub struct DeliverySuccess {
    pub record_id: i64,
    pub max_message_id: String,
    pub latency_ms: i64,
    pub sent_at: DateTime<Utc>,
}

/// Fully-formed success row, inserted directly during migration batches.
#[derive(Debug, Clone)]
pub struct DeliveredInsert {
    pub link_id: i64,
    pub source_post_id: i64,
    pub max_message_id: String,
    pub kind: String,
    pub latency_ms: i64,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: i64,
    pub link_id: i64,
    pub source_post_id: i64,
    pub error: String,
    pub retry_count: i32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}
