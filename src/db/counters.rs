use super::Database;
use crate::models::TopicKey;
use chrono::Utc;
use rusqlite::OptionalExtension;

/// Result of one counter increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterTick {
    /// Value stored after this increment (0 when it just hit the threshold).
    pub count: i64,
    /// True exactly when this increment reached the threshold and reset the counter.
    pub triggered: bool,
}

impl Database {
    /// Increment the (chat, topic) counter and reset it to zero when it reaches
    /// `threshold`, in a single statement. `threshold` must be at least 1.
    pub fn increment_counter(
        &self,
        chat_id: i64,
        topic: TopicKey,
        threshold: i64,
    ) -> anyhow::Result<CounterTick> {
        if threshold < 1 {
            anyhow::bail!("counter threshold must be at least 1, got {}", threshold);
        }
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "INSERT INTO message_counters (chat_id, topic_key, count, updated_at)
             VALUES (?1, ?2, CASE WHEN 1 >= ?3 THEN 0 ELSE 1 END, ?4)
             ON CONFLICT(chat_id, topic_key) DO UPDATE SET
                 count = CASE WHEN message_counters.count + 1 >= ?3 THEN 0
                              ELSE message_counters.count + 1 END,
                 updated_at = excluded.updated_at
             RETURNING count",
            rusqlite::params![chat_id, topic.storage_key(), threshold, Utc::now()],
            |row| row.get(0),
        )?;
        Ok(CounterTick {
            count,
            triggered: count == 0,
        })
    }

    pub fn get_counter(&self, chat_id: i64, topic: TopicKey) -> anyhow::Result<i64> {
        let conn = self.conn()?;
        let count = conn
            .query_row(
                "SELECT count FROM message_counters WHERE chat_id = ?1 AND topic_key = ?2",
                rusqlite::params![chat_id, topic.storage_key()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0))
    }

    /// Zero every counter. Returns the number of rows touched.
    pub fn reset_all_counters(&self) -> anyhow::Result<usize> {
        let conn = self.conn()?;
        let count = conn.execute(
            "UPDATE message_counters SET count = 0, updated_at = ?1",
            [Utc::now()],
        )?;
        Ok(count)
    }
}
