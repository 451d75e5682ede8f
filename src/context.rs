use crate::db::Database;
use crate::error::{PipelineError, PipelineResult};
use crate::events::MentionEvent;
use crate::mention::extract_user_query;
use crate::models::{display_name, ChatSummary, Message, TopicKey, UserSummary};
use tracing::debug;

/// Everything reply generation needs, assembled from stored state.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyRequest {
    pub chat_id: i64,
    pub topic: TopicKey,
    /// Platform id of the message being answered.
    pub message_id: i64,
    pub user_id: i64,
    pub user_name: String,
    pub username: Option<String>,
    pub query: String,
    pub chat_summary: Option<ChatSummary>,
    pub user_summary: Option<UserSummary>,
    /// Oldest first.
    pub recent_messages: Vec<Message>,
    pub reply_to_text: Option<String>,
    pub reply_to_is_bot: Option<bool>,
}

#[derive(Clone)]
pub struct ContextBuilder {
    db: Database,
    mention_token: String,
    default_response: String,
    recent_limit: usize,
}

impl ContextBuilder {
    pub fn new(
        db: Database,
        mention_token: impl Into<String>,
        default_response: impl Into<String>,
        recent_limit: usize,
    ) -> Self {
        Self {
            db,
            mention_token: mention_token.into(),
            default_response: default_response.into(),
            recent_limit,
        }
    }

    pub async fn build(&self, event: &MentionEvent) -> PipelineResult<ReplyRequest> {
        if event.chat_id == 0 || event.user_id == 0 {
            return Err(PipelineError::Validation(format!(
                "mention with zero identifier (chat {}, user {})",
                event.chat_id, event.user_id
            )));
        }

        let chat_id = event.chat_id;
        let topic = event.topic;
        let user_id = event.user_id;
        let limit = self.recent_limit;
        let (chat_summary, user_summary, recent_messages) = self
            .db
            .run_blocking(move |db| {
                let chat_summary = db.get_chat_summary(chat_id, topic)?;
                // Profiles are chat-wide, so the topic plays no part here.
                let user_summary = db.get_user_summary(chat_id, user_id)?;
                // Summary row ids and message ids are separate sequences, and a
                // summary keeps its row id across upserts. The limit is what
                // actually bounds the tail once a scope has been summarized.
                let after = chat_summary.as_ref().map(|s| s.id);
                let recent = db.messages_after_id(chat_id, topic, after, limit)?;
                Ok((chat_summary, user_summary, recent))
            })
            .await
            .map_err(PipelineError::Store)?;

        debug!(
            chat_id,
            topic = %topic,
            user_id,
            has_summary = chat_summary.is_some(),
            has_profile = user_summary.is_some(),
            recent = recent_messages.len(),
            "Context: assembled"
        );

        Ok(ReplyRequest {
            chat_id,
            topic,
            message_id: event.message_id,
            user_id,
            user_name: display_name(&event.first_name, event.last_name.as_deref()),
            username: event.username.clone(),
            query: extract_user_query(&event.text, &self.mention_token, &self.default_response),
            chat_summary,
            user_summary,
            recent_messages,
            reply_to_text: event.reply_to_text.clone(),
            reply_to_is_bot: event.reply_to_is_bot,
        })
    }
}
