//! Sending generated replies back to the chat.

use crate::db::Database;
use crate::error::PipelineResult;
use crate::models::{NewMessage, TopicKey};
use crate::platform::{Platform, SendError, SendText, SentMessage, SetReaction};
use crate::reply::GeneratedReply;
use std::sync::Arc;
use tracing::{info, warn};

/// The message a reply answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryTarget {
    pub chat_id: i64,
    pub topic: TopicKey,
    pub message_id: i64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeliveryOutcome {
    pub reacted: bool,
    pub sent: Option<SentMessage>,
    /// The topic the text actually landed in.
    pub topic_used: Option<TopicKey>,
    pub fell_back: bool,
}

pub struct ResponseDelivery {
    platform: Arc<dyn Platform>,
    db: Database,
}

impl ResponseDelivery {
    pub fn new(platform: Arc<dyn Platform>, db: Database) -> Self {
        Self { platform, db }
    }

    pub async fn deliver(&self, target: DeliveryTarget, reply: &GeneratedReply) -> PipelineResult<DeliveryOutcome> {
        let mut outcome = DeliveryOutcome::default();

        if let Some(emoji) = reply.reaction.as_deref().filter(|e| !e.is_empty()) {
            let reaction = SetReaction {
                chat_id: target.chat_id,
                message_id: target.message_id,
                emoji: emoji.to_string(),
            };
            match self.platform.set_reaction(&reaction).await {
                Ok(()) => outcome.reacted = true,
                Err(e) => warn!(
                    chat_id = target.chat_id,
                    message_id = target.message_id,
                    "Delivery: failed to set reaction: {}",
                    e
                ),
            }
        }

        let text = reply.response.trim();
        if !reply.should_reply || text.is_empty() {
            return Ok(outcome);
        }

        let mut request = SendText {
            chat_id: target.chat_id,
            topic: target.topic,
            reply_to_message_id: Some(target.message_id),
            text: text.to_string(),
        };
        let first_attempt = self.platform.send_text(&request).await;
        let sent = match first_attempt {
            Ok(sent) => sent,
            Err(SendError::ThreadNotFound(description)) if !target.topic.is_general() => {
                warn!(
                    chat_id = target.chat_id,
                    topic = %target.topic,
                    "Delivery: thread not found ({}), falling back to general chat",
                    description
                );
                request.topic = TopicKey::General;
                outcome.fell_back = true;
                self.platform.send_text(&request).await?
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            chat_id = target.chat_id,
            topic = %request.topic,
            message_id = sent.message_id,
            "Delivery: reply sent"
        );
        self.persist_bot_message(&request, &sent).await;
        outcome.topic_used = Some(request.topic);
        outcome.sent = Some(sent);
        Ok(outcome)
    }

    async fn persist_bot_message(&self, request: &SendText, sent: &SentMessage) {
        let bot = self.platform.identity();
        let record = NewMessage {
            platform_msg_id: sent.message_id,
            chat_id: request.chat_id,
            topic: request.topic,
            user_id: bot.id,
            is_bot: true,
            first_name: bot.first_name.clone(),
            last_name: None,
            username: bot.username.clone(),
            text: Some(request.text.clone()),
            created_at: sent.date,
        };
        if let Err(e) = self.db.run_blocking(move |db| db.save_message(&record)).await {
            warn!(chat_id = request.chat_id, "Delivery: failed to store bot message: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::test_support::FakePlatform;

    fn target(topic: TopicKey) -> DeliveryTarget {
        DeliveryTarget {
            chat_id: 42,
            topic,
            message_id: 10,
        }
    }

    fn reply(text: &str, reaction: Option<&str>) -> GeneratedReply {
        GeneratedReply {
            response: text.to_string(),
            reaction: reaction.map(str::to_string),
            should_reply: true,
        }
    }

    #[tokio::test]
    async fn test_send_into_original_thread_and_persist() {
        let db = test_db();
        let platform = FakePlatform::new();
        let delivery = ResponseDelivery::new(platform.clone(), db.clone());

        let outcome = delivery.deliver(target(TopicKey::Thread(5)), &reply("hi", Some("👍"))).await.unwrap();
        assert!(outcome.reacted);
        assert!(!outcome.fell_back);
        assert_eq!(outcome.topic_used, Some(TopicKey::Thread(5)));

        let sends = platform.sent();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].reply_to_message_id, Some(10));

        let stored = db.latest_messages_in_topic(42, TopicKey::Thread(5), 10).unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].is_bot);
        assert_eq!(stored[0].user_id, platform.identity().id);
    }

    #[tokio::test]
    async fn test_thread_not_found_retries_once_in_general() {
        let db = test_db();
        let platform = FakePlatform::new();
        platform.fail_next_send(SendError::ThreadNotFound("Bad Request: message thread not found".into()));
        let delivery = ResponseDelivery::new(platform.clone(), db.clone());

        let outcome = delivery.deliver(target(TopicKey::Thread(5)), &reply("hi", None)).await.unwrap();
        assert!(outcome.fell_back);
        assert_eq!(outcome.topic_used, Some(TopicKey::General));

        let attempts = platform.send_attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].topic, TopicKey::Thread(5));
        assert_eq!(attempts[1].topic, TopicKey::General);

        assert!(db.latest_messages_in_topic(42, TopicKey::Thread(5), 10).unwrap().is_empty());
        let general = db.latest_messages_in_topic(42, TopicKey::General, 10).unwrap();
        assert_eq!(general.len(), 1);
        assert_eq!(general[0].topic, TopicKey::General);
    }

    #[tokio::test]
    async fn test_other_send_errors_are_terminal() {
        let db = test_db();
        let platform = FakePlatform::new();
        platform.fail_next_send(SendError::Api {
            code: 403,
            description: "Forbidden".to_string(),
        });
        let delivery = ResponseDelivery::new(platform.clone(), db.clone());

        let err = delivery.deliver(target(TopicKey::Thread(5)), &reply("hi", None)).await.unwrap_err();
        assert_eq!(err.kind(), "delivery");
        assert_eq!(platform.send_attempts().len(), 1);
        assert!(db.latest_messages_in_topic(42, TopicKey::Thread(5), 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reaction_failure_is_not_fatal() {
        let platform = FakePlatform::new();
        platform.fail_reactions();
        let delivery = ResponseDelivery::new(platform.clone(), test_db());

        let outcome = delivery.deliver(target(TopicKey::General), &reply("hi", Some("🔥"))).await.unwrap();
        assert!(!outcome.reacted);
        assert!(outcome.sent.is_some());
    }

    #[tokio::test]
    async fn test_reaction_only_sends_nothing() {
        let platform = FakePlatform::new();
        let delivery = ResponseDelivery::new(platform.clone(), test_db());
        let quiet = GeneratedReply {
            response: "ignored".to_string(),
            reaction: Some("👀".to_string()),
            should_reply: false,
        };

        let outcome = delivery.deliver(target(TopicKey::General), &quiet).await.unwrap();
        assert!(outcome.reacted);
        assert!(outcome.sent.is_none());
        assert!(platform.send_attempts().is_empty());
        assert_eq!(platform.reactions().len(), 1);
    }
}
