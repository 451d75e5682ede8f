//! Chat platform boundary: inbound messages, outbound text and reactions.

use crate::models::TopicKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod telegram;

pub use telegram::TelegramClient;

#[derive(Debug, Clone, PartialEq)]
pub struct Sender {
    pub id: i64,
    pub is_bot: bool,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
}

/// A formatting entity. Offsets and lengths count UTF-16 code units.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEntity {
    pub kind: String,
    pub offset: usize,
    pub length: usize,
}

impl MessageEntity {
    /// The slice of `text` this entity covers, if it lies inside the text.
    pub fn slice(&self, text: &str) -> Option<String> {
        let units: Vec<u16> = text.encode_utf16().collect();
        let end = self.offset.checked_add(self.length)?;
        if end > units.len() {
            return None;
        }
        String::from_utf16(&units[self.offset..end]).ok()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplyTo {
    pub message_id: i64,
    pub sender: Option<Sender>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub message_id: i64,
    pub chat_id: i64,
    pub thread_id: Option<i64>,
    pub sender: Option<Sender>,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub entities: Vec<MessageEntity>,
    pub caption_entities: Vec<MessageEntity>,
    pub reply_to: Option<ReplyTo>,
    pub date: DateTime<Utc>,
}

impl IncomingMessage {
    /// Text, or the caption when there is no text, with the matching entities.
    pub fn body(&self) -> Option<(&str, &[MessageEntity])> {
        if let Some(text) = self.text.as_deref().filter(|t| !t.is_empty()) {
            return Some((text, &self.entities));
        }
        self.caption
            .as_deref()
            .filter(|c| !c.is_empty())
            .map(|caption| (caption, self.caption_entities.as_slice()))
    }

    pub fn topic(&self) -> TopicKey {
        TopicKey::from_thread_id(self.thread_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendText {
    pub chat_id: i64,
    pub topic: TopicKey,
    pub reply_to_message_id: Option<i64>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetReaction {
    pub chat_id: i64,
    pub message_id: i64,
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub message_id: i64,
    pub date: DateTime<Utc>,
}

/// Who the bot is on the platform, fetched once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct BotIdentity {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: String,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SendError {
    /// The requested forum thread does not exist (deleted or closed).
    #[error("message thread not found: {0}")]
    ThreadNotFound(String),
    #[error("platform API error {code}: {description}")]
    Api { code: i64, description: String },
    #[error("transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait Platform: Send + Sync {
    fn identity(&self) -> &BotIdentity;

    async fn send_text(&self, request: &SendText) -> Result<SentMessage, SendError>;

    async fn set_reaction(&self, request: &SetReaction) -> Result<(), SendError>;
}
