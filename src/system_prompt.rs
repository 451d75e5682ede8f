//! System message utilities for reply prompts.
//!
//! Builds the response system prompt: the configured persona, the current
//! date/time in the chat's zone, and the remembered state of the chat and user.

use crate::context::ReplyRequest;
use crate::models::FactMap;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::fmt::Write as _;

/// Format a moment for inclusion in system prompts.
///
/// ```text
/// Current date/time: Wednesday, February 05, 2025, 14:30:15 UTC (2025-02-05T14:30:15+00:00)
/// Local time: Wednesday, February 05, 2025, 15:30:15 CET (2025-02-05T15:30:15+01:00)
/// ```
pub fn get_datetime_context(now: DateTime<Utc>, tz: Tz) -> String {
    let local = now.with_timezone(&tz);
    format!(
        "Current date/time: {}, {} UTC ({})\nLocal time: {}, {} ({})",
        now.format("%A, %B %d, %Y"),
        now.format("%H:%M:%S"),
        now.to_rfc3339(),
        local.format("%A, %B %d, %Y"),
        local.format("%H:%M:%S %Z"),
        local.to_rfc3339()
    )
}

fn push_map(out: &mut String, label: &str, map: &FactMap) {
    if map.is_empty() {
        return;
    }
    let rendered = map
        .iter()
        .map(|(k, v)| format!("{} ({})", k, v))
        .collect::<Vec<_>>()
        .join(", ");
    let _ = write!(out, "\n{}: {}", label, rendered);
}

/// Full system prompt for answering `request` as `bot_name`.
pub fn build_response_system_prompt(
    base: &str,
    bot_name: &str,
    request: &ReplyRequest,
    now: DateTime<Utc>,
    tz: Tz,
) -> String {
    let mut prompt = base.trim().to_string();
    if !bot_name.trim().is_empty() {
        let _ = write!(prompt, "\nYour name in this chat is {}.", bot_name.trim());
    }
    let _ = write!(prompt, "\n\n{}", get_datetime_context(now, tz));

    if let Some(chat) = &request.chat_summary {
        let _ = write!(prompt, "\n\nChat context:\nSummary: {}", chat.summary);
        push_map(&mut prompt, "Chat topics", &chat.topics);
        if !chat.next_events.is_empty() {
            let events = chat
                .next_events
                .iter()
                .map(|e| match &e.date {
                    Some(date) => format!("{} ({})", e.title, date),
                    None => e.title.clone(),
                })
                .collect::<Vec<_>>()
                .join("; ");
            let _ = write!(prompt, "\nUpcoming events: {}", events);
        }
    }

    if let Some(user) = &request.user_summary {
        let _ = write!(prompt, "\n\nUser {} profile:", request.user_name);
        push_map(&mut prompt, "Likes", &user.likes);
        push_map(&mut prompt, "Dislikes", &user.dislikes);
        push_map(&mut prompt, "Competencies", &user.competencies);
        push_map(&mut prompt, "Traits", &user.traits);
    }

    let lines: Vec<String> = request
        .recent_messages
        .iter()
        .filter_map(|m| m.transcript_line())
        .collect();
    if !lines.is_empty() {
        prompt.push_str("\n\nRecent messages:\n");
        prompt.push_str(&lines.join("\n"));
    }

    if let Some(reply_text) = &request.reply_to_text {
        let author = if request.reply_to_is_bot == Some(true) {
            "your own earlier message"
        } else {
            "another user's message"
        };
        let _ = write!(prompt, "\n\nThe user is replying to {}:\n{}", author, reply_text);
    }

    prompt
}
