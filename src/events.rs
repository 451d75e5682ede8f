//! Transient events carried on the bus between ingestion and processing.

use crate::models::TopicKey;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Named bus topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Summarize,
    Mention,
    Midnight,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::Summarize, Topic::Mention, Topic::Midnight];

    pub fn name(self) -> &'static str {
        match self {
            Topic::Summarize => "summarize",
            Topic::Mention => "mention",
            Topic::Midnight => "midnight",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An event type bound to the topic it is published on.
pub trait BusEvent: Serialize + DeserializeOwned + Send + 'static {
    const TOPIC: Topic;
}

/// Ask for a summarization pass over exactly one (chat, topic) scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummarizeEvent {
    pub chat_id: i64,
    #[serde(rename = "topic_id", default, skip_serializing_if = "TopicKey::is_general")]
    pub topic: TopicKey,
    pub timestamp: DateTime<Utc>,
}

impl BusEvent for SummarizeEvent {
    const TOPIC: Topic = Topic::Summarize;
}

/// The bot was mentioned by name, or someone replied to one of its messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MentionEvent {
    pub chat_id: i64,
    #[serde(rename = "topic_id", default, skip_serializing_if = "TopicKey::is_general")]
    pub topic: TopicKey,
    pub user_id: i64,
    pub first_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub message_id: i64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_is_bot: Option<bool>,
    pub timestamp: DateTime<Utc>,
}

impl BusEvent for MentionEvent {
    const TOPIC: Topic = Topic::Mention;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MidnightEvent {
    pub triggered_at: DateTime<Utc>,
}

impl BusEvent for MidnightEvent {
    const TOPIC: Topic = Topic::Midnight;
}
