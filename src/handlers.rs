use crate::bus::{Envelope, EventBus};
use crate::context::ContextBuilder;
use crate::delivery::{DeliveryOutcome, DeliveryTarget, ResponseDelivery};
use crate::events::{MentionEvent, MidnightEvent, SummarizeEvent, Topic};
use crate::reply::ReplyGenerator;
use crate::scheduler::{MidnightRollover, RolloverReport};
use crate::summarize::{SummarizationManager, SummarizeOutcome};
use anyhow::Context;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

/// Bus subscribers for the three event topics.
pub struct EventHandlers {
    pub summarizer: Arc<SummarizationManager>,
    pub context: ContextBuilder,
    pub generator: ReplyGenerator,
    pub delivery: ResponseDelivery,
    pub rollover: MidnightRollover,
}

impl EventHandlers {
    pub async fn handle_summarize(&self, envelope: Envelope) -> anyhow::Result<SummarizeOutcome> {
        let event: SummarizeEvent = envelope.decode().context("decoding summarize event")?;
        Ok(self.summarizer.summarize_topic(event.chat_id, event.topic).await?)
    }

    pub async fn handle_mention(&self, envelope: Envelope) -> anyhow::Result<DeliveryOutcome> {
        let event: MentionEvent = envelope.decode().context("decoding mention event")?;
        info!(
            chat_id = event.chat_id,
            topic = %event.topic,
            user_id = event.user_id,
            message_id = event.message_id,
            "Handlers: answering mention"
        );

        let request = self.context.build(&event).await?;
        let reply = self.generator.generate(&request).await?;
        let target = DeliveryTarget {
            chat_id: event.chat_id,
            topic: event.topic,
            message_id: event.message_id,
        };
        Ok(self.delivery.deliver(target, &reply).await?)
    }

    pub async fn handle_midnight(&self, envelope: Envelope) -> anyhow::Result<RolloverReport> {
        let event: MidnightEvent = envelope.decode().context("decoding midnight event")?;
        self.rollover.run(&event).await
    }

    /// Subscribe every handler on `bus`. Each delivery runs in its own tracked task.
    pub fn register(self: Arc<Self>, bus: &EventBus, tracker: &TaskTracker, cancel: &CancellationToken) {
        let handlers = self.clone();
        bus.spawn_subscriber(Topic::Summarize, tracker, cancel.clone(), move |envelope| {
            let handlers = handlers.clone();
            async move { handlers.handle_summarize(envelope).await.map(|_| ()) }
        });

        let handlers = self.clone();
        bus.spawn_subscriber(Topic::Mention, tracker, cancel.clone(), move |envelope| {
            let handlers = handlers.clone();
            async move { handlers.handle_mention(envelope).await.map(|_| ()) }
        });

        let handlers = self;
        bus.spawn_subscriber(Topic::Midnight, tracker, cancel.clone(), move |envelope| {
            let handlers = handlers.clone();
            async move { handlers.handle_midnight(envelope).await.map(|_| ()) }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_db, Database};
    use crate::models::TopicKey;
    use crate::test_support::{test_config, FakePlatform, ScriptedModel};
    use chrono::Utc;
    use std::time::Duration;

    fn handlers(db: &Database, model: Arc<ScriptedModel>, platform: Arc<FakePlatform>) -> Arc<EventHandlers> {
        let config = test_config();
        let summarizer = Arc::new(SummarizationManager::new(db.clone(), model.clone(), &config));
        Arc::new(EventHandlers {
            summarizer: summarizer.clone(),
            context: ContextBuilder::new(
                db.clone(),
                config.mention_username.clone(),
                config.default_response.clone(),
                config.recent_messages_limit,
            ),
            generator: ReplyGenerator::new(
                model,
                config.bot_name.clone(),
                config.prompts.response_system.clone(),
                config.timezone,
                config.max_tokens_response,
            ),
            delivery: ResponseDelivery::new(platform, db.clone()),
            rollover: MidnightRollover::new(summarizer, db.clone(), config.midnight_lookback),
        })
    }

    #[tokio::test]
    async fn test_mention_round_trip_through_bus() {
        let db = test_db();
        let model = ScriptedModel::new(vec![Ok(
            r#"{"response": "All quiet here.", "reaction": "👋", "should_reply": true}"#.to_string(),
        )]);
        let platform = FakePlatform::new();
        let bus = EventBus::new();
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        handlers(&db, model.clone(), platform.clone()).register(&bus, &tracker, &cancel);

        bus.publish(&MentionEvent {
            chat_id: 42,
            topic: TopicKey::Thread(3),
            user_id: 7,
            first_name: "Ann".to_string(),
            last_name: None,
            username: None,
            message_id: 11,
            text: "@keeper_bot anything new?".to_string(),
            reply_to_message_id: None,
            reply_to_text: None,
            reply_to_is_bot: None,
            timestamp: Utc::now(),
        })
        .unwrap();
        assert!(bus.wait_idle(Duration::from_secs(2)).await);

        assert_eq!(model.requests()[0].user, "Ann: anything new?");
        assert_eq!(platform.reactions().len(), 1);
        let sent = platform.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].text, "All quiet here.");
        assert_eq!(sent[0].topic, TopicKey::Thread(3));
        assert_eq!(bus.acknowledged(), 1);

        cancel.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_failing_summarize_is_still_acknowledged() {
        let db = test_db();
        db.save_message(&crate::db::sample_message(42, TopicKey::General, 7, "hello")).unwrap();
        let model = ScriptedModel::new(vec![Ok("garbage".to_string())]);
        let bus = EventBus::new();
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        handlers(&db, model, FakePlatform::new()).register(&bus, &tracker, &cancel);

        bus.publish(&SummarizeEvent {
            chat_id: 42,
            topic: TopicKey::General,
            timestamp: Utc::now(),
        })
        .unwrap();
        assert!(bus.wait_idle(Duration::from_secs(2)).await);
        assert_eq!(bus.acknowledged(), 1);
        assert!(db.get_chat_summary(42, TopicKey::General).unwrap().is_none());

        cancel.cancel();
        tracker.close();
        tracker.wait().await;
    }
}
