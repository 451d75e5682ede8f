//! Telegram Bot API over HTTP long polling.

use super::{
    BotIdentity, IncomingMessage, MessageEntity, Platform, ReplyTo, SendError, SendText, Sender,
    SentMessage, SetReaction,
};
use crate::config::Config;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ERROR_BACKOFF: Duration = Duration::from_secs(5);

// ── Bot API wire types ──────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TgMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgMessage {
    pub message_id: i64,
    #[serde(default)]
    pub message_thread_id: Option<i64>,
    #[serde(default)]
    pub from: Option<TgUser>,
    pub chat: TgChat,
    pub date: i64,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub entities: Vec<TgEntity>,
    #[serde(default)]
    pub caption_entities: Vec<TgEntity>,
    #[serde(default)]
    pub reply_to_message: Option<Box<TgMessage>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgChat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgEntity {
    #[serde(rename = "type")]
    pub kind: String,
    pub offset: usize,
    pub length: usize,
}

#[derive(Debug, Serialize)]
struct GetUpdatesRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<i64>,
    timeout: u64,
    allowed_updates: &'a [&'a str],
}

#[derive(Debug, Serialize)]
struct ReplyParameters {
    message_id: i64,
    allow_sending_without_reply: bool,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_thread_id: Option<i64>,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_parameters: Option<ReplyParameters>,
}

#[derive(Debug, Serialize)]
struct ReactionType<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    emoji: &'a str,
}

#[derive(Debug, Serialize)]
struct SetReactionRequest<'a> {
    chat_id: i64,
    message_id: i64,
    reaction: Vec<ReactionType<'a>>,
}

#[derive(Debug, Serialize)]
struct Empty {}

// ── Conversions ─────────────────────────────────────────────────

impl From<TgUser> for Sender {
    fn from(user: TgUser) -> Self {
        Sender {
            id: user.id,
            is_bot: user.is_bot,
            first_name: user.first_name,
            last_name: user.last_name,
            username: user.username,
        }
    }
}

impl From<TgEntity> for MessageEntity {
    fn from(entity: TgEntity) -> Self {
        MessageEntity {
            kind: entity.kind,
            offset: entity.offset,
            length: entity.length,
        }
    }
}

fn unix_to_utc(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_else(Utc::now)
}

impl From<TgMessage> for IncomingMessage {
    fn from(msg: TgMessage) -> Self {
        let reply_to = msg.reply_to_message.map(|reply| {
            let reply = *reply;
            ReplyTo {
                message_id: reply.message_id,
                text: reply.text.or(reply.caption),
                sender: reply.from.map(Sender::from),
            }
        });

        IncomingMessage {
            message_id: msg.message_id,
            chat_id: msg.chat.id,
            thread_id: msg.message_thread_id,
            sender: msg.from.map(Sender::from),
            text: msg.text,
            caption: msg.caption,
            entities: msg.entities.into_iter().map(MessageEntity::from).collect(),
            caption_entities: msg
                .caption_entities
                .into_iter()
                .map(MessageEntity::from)
                .collect(),
            reply_to,
            date: unix_to_utc(msg.date),
        }
    }
}

/// Map a failed Bot API call onto the delivery error classes.
pub fn classify(code: i64, description: &str) -> SendError {
    if description.to_lowercase().contains("message thread not found") {
        SendError::ThreadNotFound(description.to_string())
    } else {
        SendError::Api {
            code,
            description: description.to_string(),
        }
    }
}

// ── Client ──────────────────────────────────────────────────────

pub struct TelegramClient {
    http: Client,
    base_url: String,
    poll_timeout: Duration,
    identity: BotIdentity,
}

impl TelegramClient {
    /// Build the HTTP client and fetch the bot's own identity with getMe.
    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(config.poll_timeout + Duration::from_secs(15))
            .build()
            .context("Failed to build HTTP client for Telegram API")?;
        let base_url = format!(
            "{}/bot{}",
            config.telegram_api_url.trim_end_matches('/'),
            config.telegram_token
        );

        let me: TgUser = call(&http, &base_url, "getMe", &Empty {})
            .await
            .context("Telegram getMe failed")?;
        let identity = BotIdentity {
            id: me.id,
            username: me.username,
            first_name: me.first_name,
        };
        info!(
            bot_id = identity.id,
            username = identity.username.as_deref().unwrap_or(""),
            "Telegram: connected"
        );

        Ok(Self {
            http,
            base_url,
            poll_timeout: config.poll_timeout,
            identity,
        })
    }

    pub async fn get_updates(&self, offset: Option<i64>) -> Result<Vec<Update>, SendError> {
        let request = GetUpdatesRequest {
            offset,
            timeout: self.poll_timeout.as_secs(),
            allowed_updates: &["message"],
        };
        call(&self.http, &self.base_url, "getUpdates", &request).await
    }

    /// Long-poll until cancelled, forwarding every message update to `tx`.
    pub async fn run_updates(
        &self,
        tx: mpsc::Sender<IncomingMessage>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut offset: Option<i64> = None;
        info!("Telegram: polling for updates");

        loop {
            let updates = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.get_updates(offset) => result,
            };

            let updates = match updates {
                Ok(updates) => updates,
                Err(e) => {
                    warn!("Telegram: getUpdates failed: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(ERROR_BACKOFF) => continue,
                    }
                }
            };

            for update in updates {
                offset = Some(update.update_id + 1);
                let Some(message) = update.message else {
                    continue;
                };
                debug!(
                    update_id = update.update_id,
                    chat_id = message.chat.id,
                    message_id = message.message_id,
                    "Telegram: update received"
                );
                if tx.send(IncomingMessage::from(message)).await.is_err() {
                    info!("Telegram: message channel closed, stopping poller");
                    return Ok(());
                }
            }
        }

        info!("Telegram: poller stopped");
        Ok(())
    }
}

async fn call<P, R>(http: &Client, base_url: &str, method: &str, params: &P) -> Result<R, SendError>
where
    P: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let url = format!("{}/{}", base_url, method);
    let response = http
        .post(&url)
        .json(params)
        .send()
        .await
        .map_err(|e| SendError::Transport(format!("{} request failed: {}", method, e.without_url())))?;

    let status = response.status();
    let body: ApiResponse<R> = response.json().await.map_err(|e| {
        SendError::Transport(format!("{} returned HTTP {} with unreadable body: {}", method, status, e.without_url()))
    })?;

    if !body.ok {
        let code = body.error_code.unwrap_or(i64::from(status.as_u16()));
        return Err(classify(code, body.description.as_deref().unwrap_or("unknown error")));
    }
    body.result
        .ok_or_else(|| SendError::Transport(format!("{} returned ok without result", method)))
}

#[async_trait]
impl Platform for TelegramClient {
    fn identity(&self) -> &BotIdentity {
        &self.identity
    }

    async fn send_text(&self, request: &SendText) -> Result<SentMessage, SendError> {
        let body = SendMessageRequest {
            chat_id: request.chat_id,
            message_thread_id: request.topic.thread_id(),
            text: &request.text,
            reply_parameters: request.reply_to_message_id.map(|message_id| ReplyParameters {
                message_id,
                allow_sending_without_reply: true,
            }),
        };
        let sent: TgMessage = call(&self.http, &self.base_url, "sendMessage", &body).await?;
        Ok(SentMessage {
            message_id: sent.message_id,
            date: unix_to_utc(sent.date),
        })
    }

    async fn set_reaction(&self, request: &SetReaction) -> Result<(), SendError> {
        let body = SetReactionRequest {
            chat_id: request.chat_id,
            message_id: request.message_id,
            reaction: vec![ReactionType {
                kind: "emoji",
                emoji: &request.emoji,
            }],
        };
        let _: bool = call(&self.http, &self.base_url, "setMessageReaction", &body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TopicKey;

    const UPDATE_JSON: &str = r#"{
        "ok": true,
        "result": [{
            "update_id": 100,
            "message": {
                "message_id": 55,
                "message_thread_id": 9,
                "from": {"id": 7, "is_bot": false, "first_name": "Ann", "username": "ann"},
                "chat": {"id": -1001, "type": "supergroup"},
                "date": 1767225600,
                "text": "@keeper_bot what's up",
                "entities": [{"type": "mention", "offset": 0, "length": 11}],
                "reply_to_message": {
                    "message_id": 54,
                    "from": {"id": 99, "is_bot": true, "first_name": "Keeper"},
                    "chat": {"id": -1001, "type": "supergroup"},
                    "date": 1767225500,
                    "text": "earlier answer"
                }
            }
        }, {
            "update_id": 101
        }]
    }"#;

    #[test]
    fn test_parse_updates_and_convert() {
        let response: ApiResponse<Vec<Update>> = serde_json::from_str(UPDATE_JSON).unwrap();
        assert!(response.ok);
        let updates = response.result.unwrap();
        assert_eq!(updates.len(), 2);
        assert!(updates[1].message.is_none());

        let msg = IncomingMessage::from(updates[0].message.clone().unwrap());
        assert_eq!(msg.chat_id, -1001);
        assert_eq!(msg.topic(), TopicKey::Thread(9));
        assert_eq!(msg.sender.as_ref().unwrap().username.as_deref(), Some("ann"));
        assert_eq!(msg.entities[0].kind, "mention");
        assert_eq!(msg.date.timestamp(), 1767225600);

        let reply = msg.reply_to.unwrap();
        assert_eq!(reply.message_id, 54);
        assert_eq!(reply.text.as_deref(), Some("earlier answer"));
        assert!(reply.sender.unwrap().is_bot);
    }

    #[test]
    fn test_parse_error_response() {
        let response: ApiResponse<TgMessage> = serde_json::from_str(
            r#"{"ok": false, "error_code": 400, "description": "Bad Request: message thread not found"}"#,
        )
        .unwrap();
        assert!(!response.ok);
        assert!(response.result.is_none());
        assert_eq!(response.error_code, Some(400));
    }

    #[test]
    fn test_classify_thread_not_found() {
        assert!(matches!(
            classify(400, "Bad Request: message thread not found"),
            SendError::ThreadNotFound(_)
        ));
        assert_eq!(
            classify(403, "Forbidden: bot was kicked"),
            SendError::Api {
                code: 403,
                description: "Forbidden: bot was kicked".to_string()
            }
        );
    }

    #[test]
    fn test_send_request_omits_general_thread() {
        let body = SendMessageRequest {
            chat_id: 1,
            message_thread_id: TopicKey::General.thread_id(),
            text: "hi",
            reply_parameters: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("message_thread_id").is_none());
        assert!(json.get("reply_parameters").is_none());
    }
}
