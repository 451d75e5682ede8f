//! Persisted records shared by the ingestion, summarization and reply paths.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Grouping key for a conversation inside a chat.
///
/// `General` is the chat's main stream (no thread id, or thread id 0 on the
/// wire). It is a distinct key from every concrete thread, so map lookups and
/// hashing never conflate "no topic" with some sentinel value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(from = "Option<i64>", into = "Option<i64>")]
pub enum TopicKey {
    #[default]
    General,
    Thread(i64),
}

impl TopicKey {
    pub fn from_thread_id(thread_id: Option<i64>) -> Self {
        match thread_id {
            Some(id) if id != 0 => TopicKey::Thread(id),
            _ => TopicKey::General,
        }
    }

    pub fn thread_id(self) -> Option<i64> {
        match self {
            TopicKey::General => None,
            TopicKey::Thread(id) => Some(id),
        }
    }

    pub fn is_general(&self) -> bool {
        matches!(self, TopicKey::General)
    }

    /// Column value for tables keyed on (chat, topic). 0 encodes the general stream.
    pub(crate) fn storage_key(self) -> i64 {
        self.thread_id().unwrap_or(0)
    }

    pub(crate) fn from_storage_key(key: i64) -> Self {
        Self::from_thread_id(Some(key))
    }
}

impl From<Option<i64>> for TopicKey {
    fn from(value: Option<i64>) -> Self {
        TopicKey::from_thread_id(value)
    }
}

impl From<TopicKey> for Option<i64> {
    fn from(value: TopicKey) -> Self {
        value.thread_id()
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicKey::General => write!(f, "general"),
            TopicKey::Thread(id) => write!(f, "thread:{}", id),
        }
    }
}

/// Closed value type for model-authored maps (topic counts, scores, traits).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum FactValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    List(Vec<String>),
}

impl FactValue {
    /// Numeric weight used when a map has to be cut down to its strongest entries.
    pub fn weight(&self) -> f64 {
        match self {
            FactValue::Int(v) => *v as f64,
            FactValue::Float(v) => *v,
            FactValue::Bool(true) => 1.0,
            FactValue::Bool(false) => 0.0,
            FactValue::Text(_) | FactValue::List(_) => 0.0,
        }
    }
}

impl fmt::Display for FactValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactValue::Int(v) => write!(f, "{}", v),
            FactValue::Float(v) => write!(f, "{}", v),
            FactValue::Bool(v) => write!(f, "{}", v),
            FactValue::Text(v) => write!(f, "{}", v),
            FactValue::List(v) => write!(f, "{}", v.join(", ")),
        }
    }
}

pub type FactMap = BTreeMap<String, FactValue>;

/// A planned event mentioned in the chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct UpcomingEvent {
    pub title: String,
    /// ISO 8601 when the model could infer one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

/// One stored chat message. Append-only.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: i64,
    pub platform_msg_id: i64,
    pub chat_id: i64,
    pub topic: TopicKey,
    pub user_id: i64,
    pub is_bot: bool,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub text: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn display_name(&self) -> String {
        display_name(&self.first_name, self.last_name.as_deref())
    }

    /// "User ID: 7, Name: Ann Lee, Username: @ann: hello" or None for text-less rows.
    pub fn transcript_line(&self) -> Option<String> {
        let text = self.text.as_deref()?;
        let mut who = format!("User ID: {}, Name: {}", self.user_id, self.display_name());
        if let Some(username) = self.username.as_deref().filter(|u| !u.is_empty()) {
            who.push_str(&format!(", Username: @{}", username));
        }
        Some(format!("{}: {}", who, text))
    }
}

/// A message about to be inserted; the store assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub platform_msg_id: i64,
    pub chat_id: i64,
    pub topic: TopicKey,
    pub user_id: i64,
    pub is_bot: bool,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub text: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatSummary {
    pub id: i64,
    pub chat_id: i64,
    pub topic: TopicKey,
    pub summary: String,
    pub topics: FactMap,
    pub next_events: Vec<UpcomingEvent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewChatSummary {
    pub chat_id: i64,
    pub topic: TopicKey,
    pub summary: String,
    pub topics: FactMap,
    pub next_events: Vec<UpcomingEvent>,
}

/// Cached identity of a user, refreshed from whatever batch last mentioned them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserIdentity {
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

/// Behaviour profile of one user across a whole chat (not per topic).
#[derive(Debug, Clone, PartialEq)]
pub struct UserSummary {
    pub id: i64,
    pub chat_id: i64,
    pub user_id: i64,
    pub identity: UserIdentity,
    pub likes: FactMap,
    pub dislikes: FactMap,
    pub competencies: FactMap,
    pub traits: FactMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewUserSummary {
    pub chat_id: i64,
    pub user_id: i64,
    pub identity: UserIdentity,
    pub likes: FactMap,
    pub dislikes: FactMap,
    pub competencies: FactMap,
    pub traits: FactMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AllowedChat {
    pub chat_id: i64,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub fn display_name(first_name: &str, last_name: Option<&str>) -> String {
    match last_name.map(str::trim).filter(|l| !l.is_empty()) {
        Some(last) => format!("{} {}", first_name, last),
        None => first_name.to_string(),
    }
}
