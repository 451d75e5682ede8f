//! Fakes shared by the in-crate tests.

use crate::config::{Config, Prompts};
use crate::llm::{ChatModel, CompletionRequest};
use crate::platform::{BotIdentity, Platform, SendError, SendText, SentMessage, SetReaction};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn test_config() -> Config {
    Config {
        telegram_token: "test".to_string(),
        telegram_api_url: "http://localhost".to_string(),
        poll_timeout: Duration::from_secs(1),
        llm_url: "http://localhost".to_string(),
        llm_model: "test".to_string(),
        llm_api_key: None,
        llm_temperature: 0.0,
        llm_timeout: Duration::from_secs(5),
        max_tokens_summarize: 1000,
        max_tokens_response: 500,
        database_url: ":memory:".to_string(),
        bot_name: "Keeper".to_string(),
        mention_username: "@keeper_bot".to_string(),
        default_response: "What did you want to ask?".to_string(),
        allowed_chat_ids: vec![42],
        summarize_threshold: 3,
        summarize_max_messages: 50,
        recent_messages_limit: 10,
        max_summary_chars: 2000,
        max_map_entries: 20,
        max_events: 10,
        max_profiles: 50,
        timezone: chrono_tz::UTC,
        scheduler_check_interval: Duration::from_millis(10),
        midnight_lookback: Duration::from_secs(24 * 3600),
        shutdown_grace: Duration::from_secs(1),
        prompts: Prompts::default(),
    }
}

/// Returns queued answers in order and records every request.
pub struct ScriptedModel {
    answers: Mutex<VecDeque<anyhow::Result<String>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedModel {
    pub fn new(answers: Vec<anyhow::Result<String>>) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(&self, request: CompletionRequest) -> anyhow::Result<String> {
        self.requests.lock().unwrap().push(request);
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow::anyhow!("no scripted answer left")))
    }
}

pub struct FakePlatform {
    identity: BotIdentity,
    next_id: AtomicI64,
    send_failures: Mutex<VecDeque<SendError>>,
    reactions_fail: AtomicBool,
    attempts: Mutex<Vec<SendText>>,
    sent: Mutex<Vec<SendText>>,
    reactions: Mutex<Vec<SetReaction>>,
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            identity: BotIdentity {
                id: 99,
                username: Some("keeper_bot".to_string()),
                first_name: "Keeper".to_string(),
            },
            next_id: AtomicI64::new(1000),
            send_failures: Mutex::new(VecDeque::new()),
            reactions_fail: AtomicBool::new(false),
            attempts: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            reactions: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_next_send(&self, error: SendError) {
        self.send_failures.lock().unwrap().push_back(error);
    }

    pub fn fail_reactions(&self) {
        self.reactions_fail.store(true, Ordering::SeqCst);
    }

    pub fn send_attempts(&self) -> Vec<SendText> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<SendText> {
        self.sent.lock().unwrap().clone()
    }

    pub fn reactions(&self) -> Vec<SetReaction> {
        self.reactions.lock().unwrap().clone()
    }
}

#[async_trait]
impl Platform for FakePlatform {
    fn identity(&self) -> &BotIdentity {
        &self.identity
    }

    async fn send_text(&self, request: &SendText) -> Result<SentMessage, SendError> {
        self.attempts.lock().unwrap().push(request.clone());
        if let Some(error) = self.send_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.sent.lock().unwrap().push(request.clone());
        Ok(SentMessage {
            message_id: self.next_id.fetch_add(1, Ordering::SeqCst),
            date: Utc::now(),
        })
    }

    async fn set_reaction(&self, request: &SetReaction) -> Result<(), SendError> {
        self.reactions.lock().unwrap().push(request.clone());
        if self.reactions_fail.load(Ordering::SeqCst) {
            return Err(SendError::Api {
                code: 400,
                description: "REACTION_INVALID".to_string(),
            });
        }
        Ok(())
    }
}
