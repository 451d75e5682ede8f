pub mod bus;
pub mod commands;
pub mod config;
pub mod context;
pub mod db;
pub mod delivery;
pub mod error;
pub mod events;
pub mod handlers;
pub mod ingest;
pub mod llm;
pub mod mention;
pub mod models;
pub mod platform;
pub mod reply;
pub mod scheduler;
pub mod summarize;
pub mod system_prompt;

#[cfg(test)]
mod test_support;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

/// Wired components shared by every task.
pub struct App {
    pub config: config::Config,
    pub db: db::Database,
    pub bus: bus::EventBus,
    pub ingestor: ingest::Ingestor,
    pub handlers: Arc<handlers::EventHandlers>,
}

impl App {
    pub fn build(
        config: config::Config,
        db: db::Database,
        platform: Arc<dyn platform::Platform>,
        model: Arc<dyn llm::ChatModel>,
    ) -> Self {
        let bus = bus::EventBus::new();
        let ingestor = ingest::Ingestor::new(
            db.clone(),
            bus.clone(),
            platform.identity().clone(),
            config.mention_username.clone(),
            config.summarize_threshold,
        )
        .with_commands(commands::CommandHandler::new(
            db.clone(),
            platform.clone(),
            config.timezone,
        ));

        let summarizer = Arc::new(summarize::SummarizationManager::new(db.clone(), model.clone(), &config));
        let handlers = Arc::new(handlers::EventHandlers {
            summarizer: summarizer.clone(),
            context: context::ContextBuilder::new(
                db.clone(),
                config.mention_username.clone(),
                config.default_response.clone(),
                config.recent_messages_limit,
            ),
            generator: reply::ReplyGenerator::new(
                model,
                config.bot_name.clone(),
                config.prompts.response_system.clone(),
                config.timezone,
                config.max_tokens_response,
            ),
            delivery: delivery::ResponseDelivery::new(platform, db.clone()),
            rollover: scheduler::MidnightRollover::new(summarizer, db.clone(), config.midnight_lookback),
        });

        Self {
            config,
            db,
            bus,
            ingestor,
            handlers,
        }
    }

    /// Add every configured chat id to the allow-list table.
    pub async fn seed_allow_list(&self) -> anyhow::Result<()> {
        let ids = self.config.allowed_chat_ids.clone();
        if ids.is_empty() {
            return Ok(());
        }
        let count = ids.len();
        self.db
            .run_blocking(move |db| {
                for chat_id in ids {
                    db.add_allowed_chat(chat_id, None)?;
                }
                Ok(())
            })
            .await?;
        info!(chats = count, "App: allow-list seeded from config");
        Ok(())
    }

    /// Subscribe the event handlers and start the midnight scheduler.
    pub fn start(&self, tracker: &TaskTracker, cancel: &CancellationToken) {
        self.handlers.clone().register(&self.bus, tracker, cancel);

        let scheduler = scheduler::MidnightScheduler::new(
            self.bus.clone(),
            self.config.timezone,
            self.config.scheduler_check_interval,
        );
        tracker.spawn(scheduler.run(cancel.clone()));
    }

    /// Ingest one inbound message on its own task.
    pub fn spawn_ingest(&self, message: platform::IncomingMessage, tracker: &TaskTracker) {
        let ingestor = self.ingestor.clone();
        tracker.spawn(async move {
            let chat_id = message.chat_id;
            let message_id = message.message_id;
            match ingestor.ingest(message).await {
                Ok(outcome) => debug!(chat_id, message_id, ?outcome, "App: message ingested"),
                Err(e) => error!(chat_id, message_id, kind = e.kind(), "App: ingest failed: {}", e),
            }
        });
    }
}
