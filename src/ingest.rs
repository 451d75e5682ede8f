//! Inbound message ingestion: filter, route commands, persist, detect mentions, tick counters.

use crate::bus::EventBus;
use crate::commands::{parse_command, Command, CommandHandler};
use crate::db::Database;
use crate::error::{PipelineError, PipelineResult};
use crate::events::{MentionEvent, SummarizeEvent};
use crate::mention;
use crate::models::NewMessage;
use crate::platform::{BotIdentity, IncomingMessage};
use chrono::Utc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoText,
    FromBot,
    ChatNotAllowed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Skipped(SkipReason),
    /// Answered as a command; not stored and not counted.
    Command(Command),
    Stored {
        id: i64,
        mention_published: bool,
        summarize_published: bool,
    },
}

#[derive(Clone)]
pub struct Ingestor {
    db: Database,
    bus: EventBus,
    bot: BotIdentity,
    mention_token: String,
    threshold: i64,
    commands: Option<CommandHandler>,
}

impl Ingestor {
    pub fn new(
        db: Database,
        bus: EventBus,
        bot: BotIdentity,
        mention_token: impl Into<String>,
        threshold: i64,
    ) -> Self {
        Self {
            db,
            bus,
            bot,
            mention_token: mention_token.into(),
            threshold,
            commands: None,
        }
    }

    /// Answer slash commands instead of ingesting them.
    pub fn with_commands(mut self, commands: CommandHandler) -> Self {
        self.commands = Some(commands);
        self
    }

    pub async fn ingest(&self, message: IncomingMessage) -> PipelineResult<IngestOutcome> {
        let Some(sender) = message.sender.clone() else {
            return Err(PipelineError::Validation(format!(
                "message {} in chat {} has no sender",
                message.message_id, message.chat_id
            )));
        };
        if message.chat_id == 0 || message.message_id == 0 || sender.id == 0 {
            return Err(PipelineError::Validation(format!(
                "zero identifier (chat {}, message {}, user {})",
                message.chat_id, message.message_id, sender.id
            )));
        }

        let Some((text, _)) = message.body() else {
            return Ok(IngestOutcome::Skipped(SkipReason::NoText));
        };
        let text = text.to_string();
        if sender.is_bot {
            return Ok(IngestOutcome::Skipped(SkipReason::FromBot));
        }

        let chat_id = message.chat_id;
        let allowed = self
            .db
            .run_blocking(move |db| db.is_chat_allowed(chat_id))
            .await
            .map_err(PipelineError::Store)?;
        if !allowed {
            debug!(chat_id, "Ingest: chat not on allow-list, skipping");
            return Ok(IngestOutcome::Skipped(SkipReason::ChatNotAllowed));
        }

        if let Some(commands) = &self.commands {
            if let Some(command) = parse_command(&text, self.bot.username.as_deref()) {
                info!(chat_id, user_id = sender.id, command = command.name(), "Ingest: command received");
                commands.handle(&message, &command).await?;
                return Ok(IngestOutcome::Command(command));
            }
        }

        let topic = message.topic();
        let record = NewMessage {
            platform_msg_id: message.message_id,
            chat_id,
            topic,
            user_id: sender.id,
            is_bot: false,
            first_name: sender.first_name.clone(),
            last_name: sender.last_name.clone(),
            username: sender.username.clone(),
            text: Some(text.clone()),
            created_at: message.date,
        };
        let id = self
            .db
            .run_blocking(move |db| db.save_message(&record))
            .await
            .map_err(PipelineError::Store)?;

        let mut mention_published = false;
        if mention::is_addressed(&message, &self.mention_token, &self.bot) {
            let reply_to = message.reply_to.as_ref();
            let event = MentionEvent {
                chat_id,
                topic,
                user_id: sender.id,
                first_name: sender.first_name.clone(),
                last_name: sender.last_name.clone(),
                username: sender.username.clone(),
                message_id: message.message_id,
                text: text.clone(),
                reply_to_message_id: reply_to.map(|r| r.message_id),
                reply_to_text: reply_to.and_then(|r| r.text.clone()),
                reply_to_is_bot: reply_to.map(|_| mention::is_reply_to_bot(&message, &self.bot)),
                timestamp: Utc::now(),
            };
            self.publish(&event)?;
            mention_published = true;
            info!(chat_id, topic = %topic, user_id = sender.id, message_id = message.message_id, "Ingest: bot addressed");
        }

        let threshold = self.threshold;
        let tick = self
            .db
            .run_blocking(move |db| db.increment_counter(chat_id, topic, threshold))
            .await
            .map_err(PipelineError::Store)?;

        let mut summarize_published = false;
        if tick.triggered {
            self.publish(&SummarizeEvent {
                chat_id,
                topic,
                timestamp: Utc::now(),
            })?;
            summarize_published = true;
            info!(chat_id, topic = %topic, threshold, "Ingest: summarize threshold reached");
        } else {
            debug!(chat_id, topic = %topic, count = tick.count, "Ingest: counter ticked");
        }

        Ok(IngestOutcome::Stored {
            id,
            mention_published,
            summarize_published,
        })
    }

    fn publish<E: crate::events::BusEvent>(&self, event: &E) -> PipelineResult<()> {
        self.bus
            .publish(event)
            .map(|_| ())
            .map_err(|e| PipelineError::Store(anyhow::Error::from(e).context("encoding bus event")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::events::Topic;
    use crate::models::TopicKey;
    use crate::platform::{MessageEntity, ReplyTo, Sender};

    fn bot() -> BotIdentity {
        BotIdentity {
            id: 99,
            username: Some("keeper_bot".to_string()),
            first_name: "Keeper".to_string(),
        }
    }

    fn incoming(chat_id: i64, thread_id: Option<i64>, text: &str) -> IncomingMessage {
        IncomingMessage {
            message_id: 10,
            chat_id,
            thread_id,
            sender: Some(Sender {
                id: 7,
                is_bot: false,
                first_name: "Ann".to_string(),
                last_name: None,
                username: Some("ann".to_string()),
            }),
            text: Some(text.to_string()),
            caption: None,
            entities: Vec::new(),
            caption_entities: Vec::new(),
            reply_to: None,
            date: Utc::now(),
        }
    }

    fn setup(threshold: i64) -> (Database, EventBus, Ingestor) {
        let db = test_db();
        db.add_allowed_chat(42, None).unwrap();
        let bus = EventBus::new();
        let ingestor = Ingestor::new(db.clone(), bus.clone(), bot(), "@keeper_bot", threshold);
        (db, bus, ingestor)
    }

    #[tokio::test]
    async fn test_threshold_publishes_one_summarize_event() {
        let (db, bus, ingestor) = setup(3);
        let mut rx = bus.subscribe(Topic::Summarize);

        for i in 0..3 {
            ingestor.ingest(incoming(42, None, &format!("msg {}", i))).await.unwrap();
        }

        let delivery = rx.try_recv().unwrap();
        let event: SummarizeEvent = delivery.envelope().decode().unwrap();
        assert_eq!(event.chat_id, 42);
        assert_eq!(event.topic, TopicKey::General);
        delivery.ack();
        assert!(rx.try_recv().is_err());
        assert_eq!(db.get_counter(42, TopicKey::General).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_filters_run_before_side_effects() {
        let (db, _bus, ingestor) = setup(3);

        let mut no_text = incoming(42, None, "");
        no_text.text = None;
        assert_eq!(
            ingestor.ingest(no_text).await.unwrap(),
            IngestOutcome::Skipped(SkipReason::NoText)
        );

        let mut from_bot = incoming(42, None, "beep");
        if let Some(sender) = from_bot.sender.as_mut() {
            sender.is_bot = true;
        }
        assert_eq!(
            ingestor.ingest(from_bot).await.unwrap(),
            IngestOutcome::Skipped(SkipReason::FromBot)
        );

        assert_eq!(
            ingestor.ingest(incoming(7, None, "hi")).await.unwrap(),
            IngestOutcome::Skipped(SkipReason::ChatNotAllowed)
        );

        let err = ingestor.ingest(incoming(0, None, "hi")).await.unwrap_err();
        assert_eq!(err.kind(), "validation");

        assert!(db.latest_messages_in_topic(42, TopicKey::General, 10).unwrap().is_empty());
        assert_eq!(db.get_counter(42, TopicKey::General).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_caption_is_ingested() {
        let (db, _bus, ingestor) = setup(10);
        let mut msg = incoming(42, Some(5), "");
        msg.text = None;
        msg.caption = Some("photo of the venue".to_string());

        let outcome = ingestor.ingest(msg).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Stored { .. }));
        let stored = db.latest_messages_in_topic(42, TopicKey::Thread(5), 10).unwrap();
        assert_eq!(stored[0].text.as_deref(), Some("photo of the venue"));
    }

    #[tokio::test]
    async fn test_mention_publishes_event_with_reply_context() {
        let (_db, bus, ingestor) = setup(10);
        let mut rx = bus.subscribe(Topic::Mention);

        let mut msg = incoming(42, Some(3), "@keeper_bot what's up");
        msg.entities = vec![MessageEntity {
            kind: "mention".to_string(),
            offset: 0,
            length: 11,
        }];
        msg.reply_to = Some(ReplyTo {
            message_id: 4,
            text: Some("the earlier answer".to_string()),
            sender: Some(Sender {
                id: 99,
                is_bot: true,
                first_name: "Keeper".to_string(),
                last_name: None,
                username: None,
            }),
        });

        let outcome = ingestor.ingest(msg).await.unwrap();
        assert!(matches!(
            outcome,
            IngestOutcome::Stored {
                mention_published: true,
                summarize_published: false,
                ..
            }
        ));

        let delivery = rx.try_recv().unwrap();
        let event: MentionEvent = delivery.envelope().decode().unwrap();
        assert_eq!(event.topic, TopicKey::Thread(3));
        assert_eq!(event.text, "@keeper_bot what's up");
        assert_eq!(event.reply_to_message_id, Some(4));
        assert_eq!(event.reply_to_text.as_deref(), Some("the earlier answer"));
        assert_eq!(event.reply_to_is_bot, Some(true));
        delivery.ack();
    }

    #[tokio::test]
    async fn test_stats_command_is_answered_not_ingested() {
        let (db, bus, ingestor) = setup(1);
        let platform = crate::test_support::FakePlatform::new();
        let ingestor = ingestor.with_commands(CommandHandler::new(db.clone(), platform.clone(), chrono_tz::UTC));
        let mut summarize_rx = bus.subscribe(Topic::Summarize);
        let mut mention_rx = bus.subscribe(Topic::Mention);

        ingestor.ingest(incoming(42, None, "before")).await.unwrap();
        summarize_rx.try_recv().unwrap().ack();

        let mut msg = incoming(42, Some(6), "/stats@keeper_bot last 5");
        msg.entities = vec![MessageEntity {
            kind: "mention".to_string(),
            offset: 6,
            length: 11,
        }];
        let outcome = ingestor.ingest(msg).await.unwrap();
        let IngestOutcome::Command(Command::Stats(args)) = &outcome else {
            panic!("expected a stats command, got {:?}", outcome);
        };
        assert_eq!(args.limit, 5);

        let sent = platform.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, TopicKey::Thread(6));
        assert!(sent[0].text.contains("1. ann (Ann): just now"));
        assert!(db.latest_messages_in_topic(42, TopicKey::Thread(6), 10).unwrap().is_empty());
        assert_eq!(db.get_counter(42, TopicKey::Thread(6)).unwrap(), 0);
        assert!(summarize_rx.try_recv().is_err());
        assert!(mention_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_command_is_ingested_as_text() {
        let (db, _bus, ingestor) = setup(10);
        let platform = crate::test_support::FakePlatform::new();
        let ingestor = ingestor.with_commands(CommandHandler::new(db.clone(), platform.clone(), chrono_tz::UTC));

        let outcome = ingestor.ingest(incoming(42, None, "/shrug oh well")).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Stored { .. }));
        assert!(platform.sent().is_empty());
        assert_eq!(db.latest_messages_in_topic(42, TopicKey::General, 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_topics_count_independently() {
        let (db, bus, ingestor) = setup(2);
        let mut rx = bus.subscribe(Topic::Summarize);

        ingestor.ingest(incoming(42, None, "a")).await.unwrap();
        ingestor.ingest(incoming(42, Some(8), "b")).await.unwrap();
        assert!(rx.try_recv().is_err());

        ingestor.ingest(incoming(42, Some(8), "c")).await.unwrap();
        let event: SummarizeEvent = rx.try_recv().unwrap().envelope().decode().unwrap();
        assert_eq!(event.topic, TopicKey::Thread(8));
        assert_eq!(db.get_counter(42, TopicKey::General).unwrap(), 1);
    }
}
