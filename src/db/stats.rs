use super::Database;
use chrono::{DateTime, Utc};

/// What a member ranking is ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatsMetric {
    #[default]
    Messages,
    Chars,
    LastMessage,
}

impl StatsMetric {
    fn column(self) -> &'static str {
        match self {
            StatsMetric::Messages => "p.message_count",
            StatsMetric::Chars => "p.char_count",
            StatsMetric::LastMessage => "p.last_message_at",
        }
    }
}

/// `Top` is the highest value first (most messages, most recent), `Bottom` the lowest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatsOrder {
    #[default]
    Top,
    Bottom,
}

/// One member's activity in a chat, with the identity from their latest message.
#[derive(Debug, Clone, PartialEq)]
pub struct UserStats {
    pub user_id: i64,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub message_count: i64,
    pub char_count: i64,
    pub last_message_at: DateTime<Utc>,
}

impl Database {
    /// Rank the human members of a chat by `metric`. Ties break on user id.
    pub fn user_stats(
        &self,
        chat_id: i64,
        metric: StatsMetric,
        order: StatsOrder,
        limit: usize,
    ) -> anyhow::Result<Vec<UserStats>> {
        let direction = match order {
            StatsOrder::Top => "DESC",
            StatsOrder::Bottom => "ASC",
        };
        let sql = format!(
            "WITH per_user AS (
                 SELECT user_id,
                        COUNT(*) AS message_count,
                        COALESCE(SUM(LENGTH(text)), 0) AS char_count,
                        MAX(created_at) AS last_message_at,
                        MAX(id) AS last_id
                 FROM messages
                 WHERE chat_id = ?1 AND is_bot = 0
                 GROUP BY user_id
             )
             SELECT p.user_id, m.first_name, m.last_name, m.username,
                    p.message_count, p.char_count, p.last_message_at
             FROM per_user p JOIN messages m ON m.id = p.last_id
             ORDER BY {} {}, p.user_id ASC
             LIMIT ?2",
            metric.column(),
            direction
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params![chat_id, limit as i64], |row| {
            Ok(UserStats {
                user_id: row.get(0)?,
                first_name: row.get(1)?,
                last_name: row.get(2)?,
                username: row.get(3)?,
                message_count: row.get(4)?,
                char_count: row.get(5)?,
                last_message_at: row.get(6)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}
