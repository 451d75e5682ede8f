use super::Database;
use crate::models::{Message, NewMessage, TopicKey};
use chrono::{DateTime, Utc};
use rusqlite::Row;
use tracing::debug;

const MESSAGE_COLUMNS: &str = "id, platform_msg_id, chat_id, topic_id, user_id, is_bot, \
     first_name, last_name, username, text, created_at";

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let topic_id: Option<i64> = row.get(3)?;
    Ok(Message {
        id: row.get(0)?,
        platform_msg_id: row.get(1)?,
        chat_id: row.get(2)?,
        topic: TopicKey::from_thread_id(topic_id),
        user_id: row.get(4)?,
        is_bot: row.get(5)?,
        first_name: row.get(6)?,
        last_name: row.get(7)?,
        username: row.get(8)?,
        text: row.get(9)?,
        created_at: row.get(10)?,
    })
}

impl Database {
    /// Append a message and return its store id.
    pub fn save_message(&self, msg: &NewMessage) -> anyhow::Result<i64> {
        debug!(
            chat_id = msg.chat_id,
            topic = %msg.topic,
            user_id = msg.user_id,
            message_id = msg.platform_msg_id,
            "Database: Saving message"
        );
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages (platform_msg_id, chat_id, topic_id, user_id, is_bot,
                                   first_name, last_name, username, text, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                msg.platform_msg_id,
                msg.chat_id,
                msg.topic.thread_id(),
                msg.user_id,
                msg.is_bot,
                msg.first_name,
                msg.last_name,
                msg.username,
                msg.text,
                msg.created_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The newest `limit` messages of one (chat, topic) scope, oldest first.
    pub fn latest_messages_in_topic(
        &self,
        chat_id: i64,
        topic: TopicKey,
        limit: usize,
    ) -> anyhow::Result<Vec<Message>> {
        self.messages_after_id(chat_id, topic, None, limit)
    }

    /// Messages of one (chat, topic) scope with id greater than `after_id`,
    /// keeping only the newest `limit`, oldest first.
    pub fn messages_after_id(
        &self,
        chat_id: i64,
        topic: TopicKey,
        after_id: Option<i64>,
        limit: usize,
    ) -> anyhow::Result<Vec<Message>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM messages
             WHERE chat_id = ?1 AND topic_id IS ?2 AND id > ?3
             ORDER BY id DESC LIMIT ?4",
            MESSAGE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params![chat_id, topic.thread_id(), after_id.unwrap_or(0), limit as i64],
            message_from_row,
        )?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        results.reverse();
        Ok(results)
    }

    /// Chats with at least one message at or after `since`.
    pub fn active_chats_since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT chat_id FROM messages WHERE created_at >= ?1 ORDER BY chat_id",
        )?;
        let rows = stmt.query_map([since], |row| row.get(0))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Distinct topics of one chat with activity at or after `since`.
    pub fn active_topics_since(
        &self,
        chat_id: i64,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<TopicKey>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT topic_id FROM messages
             WHERE chat_id = ?1 AND created_at >= ?2
             ORDER BY topic_id",
        )?;
        let rows = stmt.query_map(rusqlite::params![chat_id, since], |row| {
            row.get::<_, Option<i64>>(0)
        })?;

        let mut results = Vec::new();
        for row in rows {
            let topic = TopicKey::from_thread_id(row?);
            if !results.contains(&topic) {
                results.push(topic);
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
pub(crate) fn sample_message(chat_id: i64, topic: TopicKey, user_id: i64, text: &str) -> NewMessage {
    NewMessage {
        platform_msg_id: 1,
        chat_id,
        topic,
        user_id,
        is_bot: false,
        first_name: format!("User{}", user_id),
        last_name: None,
        username: None,
        text: Some(text.to_string()),
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use chrono::Duration;

    #[test]
    fn test_save_and_read_back() {
        let db = test_db();
        let mut msg = sample_message(42, TopicKey::Thread(7), 1, "hello");
        msg.last_name = Some("Lee".to_string());
        msg.username = Some("ann".to_string());
        let id = db.save_message(&msg).unwrap();

        let rows = db.latest_messages_in_topic(42, TopicKey::Thread(7), 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
        assert_eq!(rows[0].topic, TopicKey::Thread(7));
        assert_eq!(rows[0].last_name.as_deref(), Some("Lee"));
        assert_eq!(rows[0].text.as_deref(), Some("hello"));
    }

    #[test]
    fn test_topics_are_isolated() {
        let db = test_db();
        db.save_message(&sample_message(42, TopicKey::General, 1, "general")).unwrap();
        db.save_message(&sample_message(42, TopicKey::Thread(3), 1, "thread")).unwrap();
        db.save_message(&sample_message(43, TopicKey::General, 1, "other chat")).unwrap();

        let general = db.latest_messages_in_topic(42, TopicKey::General, 10).unwrap();
        assert_eq!(general.len(), 1);
        assert_eq!(general[0].text.as_deref(), Some("general"));

        let thread = db.latest_messages_in_topic(42, TopicKey::Thread(3), 10).unwrap();
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].text.as_deref(), Some("thread"));
    }

    #[test]
    fn test_latest_messages_are_chronological_tail() {
        let db = test_db();
        for i in 0..5 {
            db.save_message(&sample_message(1, TopicKey::General, 1, &format!("m{}", i)))
                .unwrap();
        }
        let rows = db.latest_messages_in_topic(1, TopicKey::General, 3).unwrap();
        let texts: Vec<_> = rows.iter().filter_map(|m| m.text.as_deref()).collect();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_messages_after_id() {
        let db = test_db();
        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(
                db.save_message(&sample_message(1, TopicKey::General, 1, &format!("m{}", i)))
                    .unwrap(),
            );
        }
        let rows = db.messages_after_id(1, TopicKey::General, Some(ids[1]), 10).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|m| m.id > ids[1]));
    }

    #[test]
    fn test_active_chats_and_topics() {
        let db = test_db();
        let mut old = sample_message(1, TopicKey::General, 1, "old");
        old.created_at = Utc::now() - Duration::days(3);
        db.save_message(&old).unwrap();
        db.save_message(&sample_message(2, TopicKey::General, 1, "a")).unwrap();
        db.save_message(&sample_message(2, TopicKey::Thread(5), 1, "b")).unwrap();
        db.save_message(&sample_message(3, TopicKey::Thread(9), 1, "c")).unwrap();

        let since = Utc::now() - Duration::hours(24);
        assert_eq!(db.active_chats_since(since).unwrap(), vec![2, 3]);
        assert_eq!(
            db.active_topics_since(2, since).unwrap(),
            vec![TopicKey::General, TopicKey::Thread(5)]
        );
        assert!(db.active_topics_since(1, since).unwrap().is_empty());
    }
}
