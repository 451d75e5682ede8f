//! Slash commands typed into an allowed chat.

pub mod stats;

pub use stats::StatsArgs;

use crate::db::Database;
use crate::error::PipelineResult;
use crate::platform::{IncomingMessage, Platform, SendText, SentMessage};
use chrono::Utc;
use chrono_tz::Tz;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Stats(StatsArgs),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Stats(_) => "stats",
        }
    }
}

/// Parse a known command at the start of `text`.
///
/// `/stats@other_bot` is addressed to someone else and yields `None`, as does
/// any command this bot does not know.
pub fn parse_command(text: &str, bot_username: Option<&str>) -> Option<Command> {
    let mut parts = text.trim_start().split_whitespace();
    let head = parts.next()?;
    let head = head.strip_prefix('/')?;

    let name = match head.split_once('@') {
        Some((name, target)) => {
            let ours = bot_username
                .map(|u| u.trim_start_matches('@'))
                .is_some_and(|u| u.eq_ignore_ascii_case(target));
            if !ours {
                return None;
            }
            name
        }
        None => head,
    };

    let args: Vec<&str> = parts.collect();
    match name.to_ascii_lowercase().as_str() {
        "stats" => Some(Command::Stats(StatsArgs::parse(&args))),
        _ => None,
    }
}

/// Runs commands and answers in the topic they were sent from.
#[derive(Clone)]
pub struct CommandHandler {
    db: Database,
    platform: Arc<dyn Platform>,
    timezone: Tz,
}

impl CommandHandler {
    pub fn new(db: Database, platform: Arc<dyn Platform>, timezone: Tz) -> Self {
        Self {
            db,
            platform,
            timezone,
        }
    }

    pub async fn handle(&self, message: &IncomingMessage, command: &Command) -> PipelineResult<SentMessage> {
        let text = match command {
            Command::Stats(args) => self.stats_reply(message.chat_id, *args).await,
        };

        let request = SendText {
            chat_id: message.chat_id,
            topic: message.topic(),
            reply_to_message_id: None,
            text,
        };
        let sent = self.platform.send_text(&request).await?;
        info!(
            chat_id = message.chat_id,
            topic = %request.topic,
            command = command.name(),
            "Commands: reply sent"
        );
        Ok(sent)
    }

    async fn stats_reply(&self, chat_id: i64, args: StatsArgs) -> String {
        let result = self
            .db
            .run_blocking(move |db| db.user_stats(chat_id, args.metric, args.order, args.limit))
            .await;
        match result {
            Ok(rows) => stats::format_stats(&rows, &args, Utc::now(), self.timezone),
            Err(e) => {
                error!(chat_id, metric = ?args.metric, "Commands: failed to load stats: {:#}", e);
                stats::STATS_FAILED.to_string()
            }
        }
    }
}
