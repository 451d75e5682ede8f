//! Cumulative summarization of a (chat, topic) scope.
//!
//! Each pass hands the model the stored chat summary, the stored profiles of
//! everyone in the batch and the newest messages, and asks for an updated
//! version of the same state. Merging is the model's job; this module only
//! checks the shape of what comes back and bounds it before it is stored.

use crate::config::Config;
use crate::db::Database;
use crate::error::{PipelineError, PipelineResult};
use crate::llm::{ChatModel, CompletionRequest};
use crate::models::{
    ChatSummary, FactMap, Message, NewChatSummary, NewUserSummary, TopicKey, UpcomingEvent,
    UserIdentity, UserSummary,
};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SummarizeResponse {
    pub chat_summary: ChatSummaryData,
    /// Keyed by numeric user id.
    #[serde(default)]
    pub user_profiles: BTreeMap<String, UserProfileData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ChatSummaryData {
    pub summary: String,
    /// Topic label to how often it came up.
    #[serde(default)]
    pub topics: FactMap,
    #[serde(default)]
    pub next_events: Vec<UpcomingEvent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct UserProfileData {
    #[serde(default)]
    pub likes: FactMap,
    #[serde(default)]
    pub dislikes: FactMap,
    #[serde(default)]
    pub competencies: FactMap,
    #[serde(default)]
    pub traits: FactMap,
}

/// Upper bounds applied to model output before it is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputLimits {
    pub max_summary_chars: usize,
    pub max_map_entries: usize,
    pub max_events: usize,
    pub max_profiles: usize,
}

impl OutputLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_summary_chars: config.max_summary_chars,
            max_map_entries: config.max_map_entries,
            max_events: config.max_events,
            max_profiles: config.max_profiles,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummarizeOutcome {
    /// Nothing with text in this scope yet.
    NoMessages,
    Updated { messages: usize, profiles: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupFailure {
    pub chat_id: i64,
    /// None when the chat's topics could not even be listed.
    pub topic: Option<TopicKey>,
    pub error: String,
}

/// Tally of a bulk pass. One group failing never stops the others.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkReport {
    pub chats: usize,
    pub groups: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failures: Vec<GroupFailure>,
}

impl BulkReport {
    fn record(&mut self, chat_id: i64, topic: TopicKey, result: PipelineResult<SummarizeOutcome>) {
        self.groups += 1;
        match result {
            Ok(SummarizeOutcome::Updated { .. }) => self.updated += 1,
            Ok(SummarizeOutcome::NoMessages) => self.skipped += 1,
            Err(e) => {
                error!(chat_id, topic = %topic, kind = e.kind(), "Summarize: group failed: {}", e);
                self.failures.push(GroupFailure {
                    chat_id,
                    topic: Some(topic),
                    error: e.to_string(),
                });
            }
        }
    }

    fn merge(&mut self, other: BulkReport) {
        self.chats += other.chats;
        self.groups += other.groups;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.failures.extend(other.failures);
    }
}

pub struct SummarizationManager {
    db: Database,
    model: Arc<dyn ChatModel>,
    system_prompt: String,
    max_messages: usize,
    max_tokens: u32,
    limits: OutputLimits,
}

impl SummarizationManager {
    pub fn new(db: Database, model: Arc<dyn ChatModel>, config: &Config) -> Self {
        Self {
            db,
            model,
            system_prompt: config.prompts.summarize_system.clone(),
            max_messages: config.summarize_max_messages,
            max_tokens: config.max_tokens_summarize,
            limits: OutputLimits::from_config(config),
        }
    }

    /// Run one cumulative pass over exactly one (chat, topic) scope.
    pub async fn summarize_topic(&self, chat_id: i64, topic: TopicKey) -> PipelineResult<SummarizeOutcome> {
        if chat_id == 0 {
            return Err(PipelineError::Validation("chat id is zero".to_string()));
        }
        info!(chat_id, topic = %topic, "Summarize: starting");

        let max_messages = self.max_messages;
        let messages = self
            .db
            .run_blocking(move |db| db.latest_messages_in_topic(chat_id, topic, max_messages))
            .await
            .map_err(PipelineError::Store)?;
        if !messages.iter().any(|m| m.text.is_some()) {
            debug!(chat_id, topic = %topic, "Summarize: no messages, skipping");
            return Ok(SummarizeOutcome::NoMessages);
        }

        let senders = batch_senders(&messages);
        let user_ids: Vec<i64> = senders.keys().copied().collect();
        let (existing_chat, existing_users) = self
            .db
            .run_blocking(move |db| {
                let chat = db.get_chat_summary(chat_id, topic)?;
                let users = db.get_user_summaries(chat_id, &user_ids)?;
                Ok((chat, users))
            })
            .await
            .map_err(PipelineError::Store)?;

        let request = CompletionRequest {
            system: self.system_instructions(),
            user: build_prompt(chat_id, &messages, existing_chat.as_ref(), &existing_users),
            max_tokens: self.max_tokens,
            json: true,
        };
        let raw = self.model.complete(request).await.map_err(PipelineError::Llm)?;

        let response = sanitize(parse_summarize_response(&raw)?, &self.limits);
        let (summary, profiles) = into_records(chat_id, topic, response, &senders, self.limits.max_profiles);

        let message_count = messages.len();
        let profile_count = profiles.len();
        self.db
            .run_blocking(move |db| db.save_summarization(&summary, &profiles))
            .await
            .map_err(PipelineError::Store)?;

        info!(
            chat_id,
            topic = %topic,
            messages = message_count,
            profiles = profile_count,
            "Summarize: stored updated summary"
        );
        Ok(SummarizeOutcome::Updated {
            messages: message_count,
            profiles: profile_count,
        })
    }

    /// Summarize every topic of one chat that saw activity since `since`.
    pub async fn summarize_chat(&self, chat_id: i64, since: DateTime<Utc>) -> BulkReport {
        let mut report = BulkReport {
            chats: 1,
            ..Default::default()
        };

        let topics = match self
            .db
            .run_blocking(move |db| db.active_topics_since(chat_id, since))
            .await
        {
            Ok(topics) => topics,
            Err(e) => {
                error!(chat_id, "Summarize: failed to list topics: {:#}", e);
                report.failures.push(GroupFailure {
                    chat_id,
                    topic: None,
                    error: format!("{:#}", e),
                });
                return report;
            }
        };

        for topic in topics {
            let result = self.summarize_topic(chat_id, topic).await;
            report.record(chat_id, topic, result);
        }
        report
    }

    /// Bulk pass over every chat active since `since`.
    pub async fn summarize_active_chats(&self, since: DateTime<Utc>) -> PipelineResult<BulkReport> {
        let chats = self
            .db
            .run_blocking(move |db| db.active_chats_since(since))
            .await
            .map_err(PipelineError::Store)?;
        info!(chats = chats.len(), since = %since, "Summarize: bulk pass starting");

        let mut report = BulkReport::default();
        for chat_id in chats {
            report.merge(self.summarize_chat(chat_id, since).await);
        }

        if report.failures.is_empty() {
            info!(groups = report.groups, updated = report.updated, "Summarize: bulk pass finished");
        } else {
            warn!(
                groups = report.groups,
                updated = report.updated,
                failed = report.failures.len(),
                "Summarize: bulk pass finished with failures"
            );
        }
        Ok(report)
    }

    fn system_instructions(&self) -> String {
        let schema = schemars::schema_for!(SummarizeResponse);
        let schema = serde_json::to_string_pretty(&schema).unwrap_or_default();
        format!("{}\n\nResponse JSON schema:\n{}", self.system_prompt, schema)
    }
}

/// Latest identity of each human sender in the batch.
fn batch_senders(messages: &[Message]) -> BTreeMap<i64, UserIdentity> {
    let mut senders = BTreeMap::new();
    for msg in messages.iter().filter(|m| !m.is_bot) {
        senders.insert(
            msg.user_id,
            UserIdentity {
                username: msg.username.clone().filter(|u| !u.is_empty()),
                first_name: Some(msg.first_name.clone()).filter(|f| !f.is_empty()),
                last_name: msg.last_name.clone().filter(|l| !l.is_empty()),
            },
        );
    }
    senders
}

fn json_or_empty<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

/// The user half of the summarize call: prior state verbatim, then the new transcript.
pub fn build_prompt(
    chat_id: i64,
    messages: &[Message],
    existing_chat: Option<&ChatSummary>,
    existing_users: &[UserSummary],
) -> String {
    let mut prompt = format!("Chat ID: {}\n\n", chat_id);

    if let Some(chat) = existing_chat {
        prompt.push_str("EXISTING CHAT SUMMARY:\n");
        let _ = writeln!(prompt, "Summary: {}", chat.summary);
        if !chat.topics.is_empty() {
            let _ = writeln!(prompt, "Topics: {}", json_or_empty(&chat.topics));
        }
        if !chat.next_events.is_empty() {
            let _ = writeln!(prompt, "Next events: {}", json_or_empty(&chat.next_events));
        }
        prompt.push('\n');
    }

    if !existing_users.is_empty() {
        prompt.push_str("EXISTING USER PROFILES:\n");
        for user in existing_users {
            let _ = writeln!(prompt, "User ID {}:", user.user_id);
            for (label, map) in [
                ("Likes", &user.likes),
                ("Dislikes", &user.dislikes),
                ("Competencies", &user.competencies),
                ("Traits", &user.traits),
            ] {
                if !map.is_empty() {
                    let _ = writeln!(prompt, "  {}: {}", label, json_or_empty(map));
                }
            }
            prompt.push('\n');
        }
    }

    prompt.push_str("NEW MESSAGES:\n");
    for line in messages.iter().filter_map(Message::transcript_line) {
        prompt.push_str(&line);
        prompt.push('\n');
    }
    prompt.push('\n');
    prompt.push_str(
        "IMPORTANT: This is an update, not a fresh analysis. Keep what is already known, \
         merge in new information from the messages, and return the complete updated state.",
    );
    prompt
}

/// Parse the model's answer. A single ```json fence is tolerated; anything
/// else that is not exactly the expected object is rejected.
pub fn parse_summarize_response(raw: &str) -> PipelineResult<SummarizeResponse> {
    let body = strip_code_fence(raw.trim());
    serde_json::from_str(body).map_err(|e| PipelineError::Parse(e.to_string()))
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let Some(rest) = rest.strip_suffix("```") else {
        return text;
    };
    // Drop the info string ("json") up to the first newline.
    match rest.split_once('\n') {
        Some((info, body)) if !info.trim().contains(['{', '[']) => body.trim(),
        _ => rest.trim(),
    }
}

/// Keep the `max` heaviest entries of a map; ties go to the smaller key.
fn cap_map(map: FactMap, max: usize) -> FactMap {
    if map.len() <= max {
        return map;
    }
    let mut entries: Vec<_> = map.into_iter().collect();
    entries.sort_by(|(ka, va), (kb, vb)| {
        vb.weight()
            .partial_cmp(&va.weight())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| ka.cmp(kb))
    });
    entries.truncate(max);
    entries.into_iter().collect()
}

/// Bound every model-authored collection.
pub fn sanitize(mut response: SummarizeResponse, limits: &OutputLimits) -> SummarizeResponse {
    let chat = &mut response.chat_summary;
    if chat.summary.chars().count() > limits.max_summary_chars {
        chat.summary = chat.summary.chars().take(limits.max_summary_chars).collect();
    }
    chat.topics = cap_map(std::mem::take(&mut chat.topics), limits.max_map_entries);
    chat.next_events.retain(|e| !e.title.trim().is_empty());
    chat.next_events.truncate(limits.max_events);

    for profile in response.user_profiles.values_mut() {
        profile.likes = cap_map(std::mem::take(&mut profile.likes), limits.max_map_entries);
        profile.dislikes = cap_map(std::mem::take(&mut profile.dislikes), limits.max_map_entries);
        profile.competencies = cap_map(std::mem::take(&mut profile.competencies), limits.max_map_entries);
        profile.traits = cap_map(std::mem::take(&mut profile.traits), limits.max_map_entries);
    }
    response
}

/// Turn a sanitized response into rows. Profiles of batch senders win when the
/// profile count has to be cut; non-numeric ids are dropped.
fn into_records(
    chat_id: i64,
    topic: TopicKey,
    response: SummarizeResponse,
    senders: &BTreeMap<i64, UserIdentity>,
    max_profiles: usize,
) -> (NewChatSummary, Vec<NewUserSummary>) {
    let summary = NewChatSummary {
        chat_id,
        topic,
        summary: response.chat_summary.summary,
        topics: response.chat_summary.topics,
        next_events: response.chat_summary.next_events,
    };

    let mut profiles: Vec<NewUserSummary> = Vec::new();
    for (raw_id, data) in response.user_profiles {
        let Ok(user_id) = raw_id.trim().parse::<i64>() else {
            warn!(chat_id, user_id = %raw_id, "Summarize: skipping profile with non-numeric user id");
            continue;
        };
        if user_id == 0 {
            continue;
        }
        profiles.push(NewUserSummary {
            chat_id,
            user_id,
            identity: senders.get(&user_id).cloned().unwrap_or_default(),
            likes: data.likes,
            dislikes: data.dislikes,
            competencies: data.competencies,
            traits: data.traits,
        });
    }
    profiles.sort_by_key(|p| (!senders.contains_key(&p.user_id), p.user_id));
    profiles.truncate(max_profiles);

    (summary, profiles)
}
