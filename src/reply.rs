use crate::context::ReplyRequest;
use crate::error::{PipelineError, PipelineResult};
use crate::llm::{ChatModel, CompletionRequest};
use crate::system_prompt::build_response_system_prompt;
use chrono::Utc;
use chrono_tz::Tz;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

/// What the model decided to do about a mention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedReply {
    pub response: String,
    pub reaction: Option<String>,
    pub should_reply: bool,
}

#[derive(Deserialize)]
struct StructuredReply {
    #[serde(default)]
    response: String,
    #[serde(default)]
    reaction: Option<String>,
    #[serde(default = "default_should_reply")]
    should_reply: bool,
}

fn default_should_reply() -> bool {
    true
}

/// Accept the structured form when the model produced it, plain text otherwise.
pub fn parse_generated_reply(raw: &str) -> GeneratedReply {
    let trimmed = raw.trim();
    let candidate = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);

    if candidate.starts_with('{') {
        if let Ok(parsed) = serde_json::from_str::<StructuredReply>(candidate) {
            return GeneratedReply {
                response: parsed.response.trim().to_string(),
                reaction: parsed.reaction.map(|r| r.trim().to_string()).filter(|r| !r.is_empty()),
                should_reply: parsed.should_reply,
            };
        }
    }

    GeneratedReply {
        response: trimmed.to_string(),
        reaction: None,
        should_reply: true,
    }
}

pub struct ReplyGenerator {
    model: Arc<dyn ChatModel>,
    bot_name: String,
    system_prompt: String,
    timezone: Tz,
    max_tokens: u32,
}

impl ReplyGenerator {
    pub fn new(
        model: Arc<dyn ChatModel>,
        bot_name: impl Into<String>,
        system_prompt: impl Into<String>,
        timezone: Tz,
        max_tokens: u32,
    ) -> Self {
        Self {
            model,
            bot_name: bot_name.into(),
            system_prompt: system_prompt.into(),
            timezone,
            max_tokens,
        }
    }

    pub async fn generate(&self, request: &ReplyRequest) -> PipelineResult<GeneratedReply> {
        let system = build_response_system_prompt(
            &self.system_prompt,
            &self.bot_name,
            request,
            Utc::now(),
            self.timezone,
        );
        let user = format!("{}: {}", request.user_name, request.query);

        let raw = self
            .model
            .complete(CompletionRequest {
                system,
                user,
                max_tokens: self.max_tokens,
                json: false,
            })
            .await
            .map_err(PipelineError::Llm)?;

        let reply = parse_generated_reply(&raw);
        debug!(
            chat_id = request.chat_id,
            should_reply = reply.should_reply,
            reaction = reply.reaction.as_deref().unwrap_or(""),
            "Reply: generated"
        );
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TopicKey;
    use crate::test_support::ScriptedModel;

    #[test]
    fn test_parse_structured_reply() {
        let reply = parse_generated_reply(r#"{"response": "Sure!", "reaction": "👍", "should_reply": true}"#);
        assert_eq!(reply.response, "Sure!");
        assert_eq!(reply.reaction.as_deref(), Some("👍"));
        assert!(reply.should_reply);

        let reaction_only = parse_generated_reply("```json\n{\"reaction\": \"🔥\", \"should_reply\": false}\n```");
        assert_eq!(reaction_only.response, "");
        assert!(!reaction_only.should_reply);
    }

    #[test]
    fn test_plain_text_is_a_reply() {
        let reply = parse_generated_reply("  Just text, no JSON.  ");
        assert_eq!(reply.response, "Just text, no JSON.");
        assert_eq!(reply.reaction, None);
        assert!(reply.should_reply);

        let broken = parse_generated_reply("{not really json");
        assert_eq!(broken.response, "{not really json");
    }

    #[tokio::test]
    async fn test_generate_sends_query_as_user_turn() {
        let model = ScriptedModel::new(vec![Ok("Hello Ann".to_string())]);
        let generator = ReplyGenerator::new(model.clone(), "Keeper", "You are Keeper.", chrono_tz::UTC, 500);
        let request = ReplyRequest {
            chat_id: 42,
            topic: TopicKey::General,
            message_id: 1,
            user_id: 7,
            user_name: "Ann".to_string(),
            username: None,
            query: "what's up".to_string(),
            chat_summary: None,
            user_summary: None,
            recent_messages: Vec::new(),
            reply_to_text: None,
            reply_to_is_bot: None,
        };

        let reply = generator.generate(&request).await.unwrap();
        assert_eq!(reply.response, "Hello Ann");

        let sent = model.requests();
        assert_eq!(sent[0].user, "Ann: what's up");
        assert!(sent[0].system.starts_with("You are Keeper."));
        assert_eq!(sent[0].max_tokens, 500);
        assert!(sent[0].system.contains("Your name in this chat is Keeper."));
    }
}
