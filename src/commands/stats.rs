//! `/stats [top|bottom] [msgs|chars|last] [N]`: rank a chat's members.

use crate::db::{StatsMetric, StatsOrder, UserStats};
use crate::models::display_name;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use std::fmt::Write as _;

pub const DEFAULT_LIMIT: usize = 10;
pub const MAX_LIMIT: usize = 50;

pub(super) const STATS_FAILED: &str = "❌ Could not load statistics";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsArgs {
    pub metric: StatsMetric,
    pub order: StatsOrder,
    pub limit: usize,
}

impl Default for StatsArgs {
    fn default() -> Self {
        Self {
            metric: StatsMetric::Messages,
            order: StatsOrder::Top,
            limit: DEFAULT_LIMIT,
        }
    }
}

impl StatsArgs {
    /// Arguments may come in any order; later ones win and unknown words are ignored.
    pub fn parse(args: &[&str]) -> Self {
        let mut parsed = Self::default();
        for arg in args {
            match arg.to_lowercase().as_str() {
                "top" => parsed.order = StatsOrder::Top,
                "bottom" => parsed.order = StatsOrder::Bottom,
                "msgs" | "messages" => parsed.metric = StatsMetric::Messages,
                "chars" | "symbols" => parsed.metric = StatsMetric::Chars,
                "lastmsg" | "last" => parsed.metric = StatsMetric::LastMessage,
                other => {
                    if let Ok(n) = other.parse::<usize>() {
                        if n > 0 {
                            parsed.limit = n.min(MAX_LIMIT);
                        }
                    }
                }
            }
        }
        parsed
    }
}

/// Render a ranking as the chat reply.
pub fn format_stats(rows: &[UserStats], args: &StatsArgs, now: DateTime<Utc>, tz: Tz) -> String {
    if rows.is_empty() {
        return "📊 No statistics yet: no messages have been recorded in this chat.".to_string();
    }

    let title = match (args.metric, args.order) {
        (StatsMetric::Messages, StatsOrder::Top) => "Most active members",
        (StatsMetric::Messages, StatsOrder::Bottom) => "Least active members",
        (StatsMetric::Chars, StatsOrder::Top) => "Most active by characters",
        (StatsMetric::Chars, StatsOrder::Bottom) => "Least active by characters",
        (StatsMetric::LastMessage, StatsOrder::Top) => "Most recently active",
        (StatsMetric::LastMessage, StatsOrder::Bottom) => "Quiet the longest",
    };

    let mut out = format!("📊 {} (top {})\n\n", title, rows.len());
    for (i, row) in rows.iter().enumerate() {
        let value = match args.metric {
            StatsMetric::Messages => format!(
                "{} {}",
                row.message_count,
                plural(row.message_count, "message", "messages")
            ),
            StatsMetric::Chars => format!(
                "{} {}",
                format_number(row.char_count),
                plural(row.char_count, "character", "characters")
            ),
            StatsMetric::LastMessage => time_ago(row.last_message_at, now, tz),
        };
        let _ = writeln!(out, "{}. {}: {}", i + 1, member_label(row), value);
    }
    out
}

/// "ann (Ann Lee)". The username goes without "@" so the list pings nobody.
fn member_label(row: &UserStats) -> String {
    let full_name = display_name(row.first_name.trim(), row.last_name.as_deref());
    let full_name = full_name.trim();
    match row.username.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
        Some(username) if !full_name.is_empty() => format!("{} ({})", username, full_name),
        Some(username) => username.to_string(),
        None if !full_name.is_empty() => full_name.to_string(),
        None => format!("User {}", row.user_id),
    }
}

fn plural<'a>(n: i64, one: &'a str, many: &'a str) -> &'a str {
    if n == 1 {
        one
    } else {
        many
    }
}

/// 1234567 -> "1,234,567"
fn format_number(n: i64) -> String {
    let digits = n.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if n < 0 {
        out.push('-');
    }
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

fn time_ago(then: DateTime<Utc>, now: DateTime<Utc>, tz: Tz) -> String {
    let diff = now - then;
    let local = then.with_timezone(&tz);
    if diff < Duration::minutes(1) {
        "just now".to_string()
    } else if diff < Duration::hours(1) {
        let minutes = diff.num_minutes();
        format!("{} {} ago", minutes, plural(minutes, "minute", "minutes"))
    } else if diff < Duration::hours(24) {
        let hours = diff.num_hours();
        format!("{} {} ago", hours, plural(hours, "hour", "hours"))
    } else if diff < Duration::hours(48) {
        format!("yesterday at {}", local.format("%H:%M"))
    } else if diff < Duration::days(7) {
        format!("{} days ago", diff.num_days())
    } else {
        local.format("%d.%m.%Y %H:%M").to_string()
    }
}
