use chrono_tz::Tz;
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::fs;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone)]
pub struct Config {
    pub telegram_token: String,
    pub telegram_api_url: String,
    pub poll_timeout: Duration,

    pub llm_url: String,
    pub llm_model: String,
    pub llm_api_key: Option<String>,
    pub llm_temperature: f32,
    pub llm_timeout: Duration,
    pub max_tokens_summarize: u32,
    pub max_tokens_response: u32,

    pub database_url: String,

    pub bot_name: String,
    /// Token that addresses the bot in text, e.g. "@keeper_bot".
    pub mention_username: String,
    /// Query used when a message contains nothing but the mention.
    pub default_response: String,
    pub allowed_chat_ids: Vec<i64>,

    // Summarization triggers and windows
    pub summarize_threshold: i64,
    pub summarize_max_messages: usize,
    pub recent_messages_limit: usize,

    // Bounds applied to model-authored state before it is stored
    pub max_summary_chars: usize,
    pub max_map_entries: usize,
    pub max_events: usize,
    pub max_profiles: usize,

    // Midnight rollover
    pub timezone: Tz,
    pub scheduler_check_interval: Duration,
    pub midnight_lookback: Duration,

    pub shutdown_grace: Duration,
    pub prompts: Prompts,
}

/// System prompts, overridable from a TOML file.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Prompts {
    pub summarize_system: String,
    pub response_system: String,
}

const DEFAULT_SUMMARIZE_PROMPT: &str = "You maintain long-lived memory for a group chat. \
You receive the stored chat summary and user profiles, followed by new messages. \
Return ONLY a JSON object with two keys: \"chat_summary\" (summary, topics, next_events) and \
\"user_profiles\" (keyed by numeric user id, each with likes, dislikes, competencies, traits). \
Topic and score values are integers counting how often something came up.";

const DEFAULT_RESPONSE_PROMPT: &str = "You are a member of a group chat who remembers what people talk about. \
Answer briefly and in the language of the question. \
Return a JSON object: {\"response\": string, \"reaction\": optional single emoji, \"should_reply\": bool}. \
Set should_reply to false when a reaction alone is enough.";

impl Default for Prompts {
    fn default() -> Self {
        Self {
            summarize_system: DEFAULT_SUMMARIZE_PROMPT.to_string(),
            response_system: DEFAULT_RESPONSE_PROMPT.to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        let timezone_name = env::var("SCHEDULER_TIMEZONE")
            .or_else(|_| env::var("TZ"))
            .unwrap_or_else(|_| "UTC".to_string());
        let timezone = Tz::from_str(&timezone_name)
            .map_err(|e| anyhow::anyhow!("invalid timezone {}: {}", timezone_name, e))?;

        let config = Config {
            telegram_token: env::var("TELEGRAM_BOT_TOKEN")
                .map_err(|_| anyhow::anyhow!("TELEGRAM_BOT_TOKEN must be set"))?,
            telegram_api_url: env::var("TELEGRAM_API_URL")
                .unwrap_or_else(|_| "https://api.telegram.org".to_string()),
            poll_timeout: duration_var("POLL_TIMEOUT", "30s")?,

            llm_url: env::var("LLM_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            llm_model: env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            llm_api_key: env::var("LLM_API_KEY").ok(),
            llm_temperature: parsed_var("LLM_TEMPERATURE", 0.7),
            llm_timeout: duration_var("LLM_TIMEOUT", "120s")?,
            max_tokens_summarize: parsed_var("MAX_TOKENS_SUMMARIZE", 4000),
            max_tokens_response: parsed_var("MAX_TOKENS_RESPONSE", 1000),

            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "data/chatkeeper.db".to_string()),

            bot_name: env::var("BOT_NAME").unwrap_or_else(|_| "Keeper".to_string()),
            mention_username: env::var("MENTION_USERNAME")
                .map_err(|_| anyhow::anyhow!("MENTION_USERNAME must be set"))?,
            default_response: env::var("DEFAULT_RESPONSE")
                .unwrap_or_else(|_| "Hi! What did you want to ask?".to_string()),
            allowed_chat_ids: parse_chat_ids(&env::var("ALLOWED_CHAT_IDS").unwrap_or_default())?,

            summarize_threshold: parsed_var("SUMMARIZE_THRESHOLD", 50),
            summarize_max_messages: parsed_var("SUMMARIZE_MAX_MESSAGES", 200),
            recent_messages_limit: parsed_var("RECENT_MESSAGES_LIMIT", 30),

            max_summary_chars: parsed_var("MAX_SUMMARY_CHARS", 4000),
            max_map_entries: parsed_var("MAX_MAP_ENTRIES", 50),
            max_events: parsed_var("MAX_EVENTS", 20),
            max_profiles: parsed_var("MAX_PROFILES", 100),

            timezone,
            scheduler_check_interval: duration_var("SCHEDULER_CHECK_INTERVAL", "1m")?,
            midnight_lookback: duration_var("MIDNIGHT_LOOKBACK", "24h")?,

            shutdown_grace: duration_var("SHUTDOWN_GRACE", "10s")?,
            prompts: Self::load_prompts()?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mention_username.trim().is_empty() {
            anyhow::bail!("MENTION_USERNAME must not be empty");
        }
        if self.summarize_threshold < 1 {
            anyhow::bail!("SUMMARIZE_THRESHOLD must be at least 1");
        }
        if self.summarize_max_messages == 0 {
            anyhow::bail!("SUMMARIZE_MAX_MESSAGES must be at least 1");
        }
        if self.recent_messages_limit == 0 {
            anyhow::bail!("RECENT_MESSAGES_LIMIT must be at least 1");
        }
        if self.scheduler_check_interval.is_zero() {
            anyhow::bail!("SCHEDULER_CHECK_INTERVAL must be positive");
        }
        Ok(())
    }

    pub fn load_prompts() -> anyhow::Result<Prompts> {
        let path = env::var("PROMPTS_PATH").unwrap_or_else(|_| "prompts.toml".to_string());
        match fs::read_to_string(&path) {
            Ok(content) => toml::from_str::<Prompts>(&content)
                .map_err(|e| anyhow::anyhow!("failed to parse {}: {}", path, e)),
            Err(_) => Ok(Prompts::default()),
        }
    }
}

fn parsed_var<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn duration_var(key: &str, default: &str) -> anyhow::Result<Duration> {
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    humantime::parse_duration(raw.trim())
        .map_err(|e| anyhow::anyhow!("{} is not a valid duration ({}): {}", key, raw, e))
}

fn parse_chat_ids(raw: &str) -> anyhow::Result<Vec<i64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .map_err(|_| anyhow::anyhow!("ALLOWED_CHAT_IDS contains an invalid chat id: {}", s))
        })
        .collect()
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("telegram_token", &"[REDACTED]")
            .field("telegram_api_url", &self.telegram_api_url)
            .field("poll_timeout", &self.poll_timeout)
            .field("llm_url", &self.llm_url)
            .field("llm_model", &self.llm_model)
            .field("llm_api_key", &self.llm_api_key.as_ref().map(|_| "[REDACTED]"))
            .field("llm_temperature", &self.llm_temperature)
            .field("llm_timeout", &self.llm_timeout)
            .field("max_tokens_summarize", &self.max_tokens_summarize)
            .field("max_tokens_response", &self.max_tokens_response)
            .field("database_url", &self.database_url)
            .field("bot_name", &self.bot_name)
            .field("mention_username", &self.mention_username)
            .field("default_response", &self.default_response)
            .field("allowed_chat_ids", &self.allowed_chat_ids)
            .field("summarize_threshold", &self.summarize_threshold)
            .field("summarize_max_messages", &self.summarize_max_messages)
            .field("recent_messages_limit", &self.recent_messages_limit)
            .field("max_summary_chars", &self.max_summary_chars)
            .field("max_map_entries", &self.max_map_entries)
            .field("max_events", &self.max_events)
            .field("max_profiles", &self.max_profiles)
            .field("timezone", &self.timezone)
            .field("scheduler_check_interval", &self.scheduler_check_interval)
            .field("midnight_lookback", &self.midnight_lookback)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("prompts", &self.prompts)
            .finish()
    }
}
