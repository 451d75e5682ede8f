use super::{from_json, to_json, Database};
use crate::models::{ChatSummary, NewChatSummary, NewUserSummary, TopicKey, UserIdentity, UserSummary};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row};
use tracing::debug;

fn chat_summary_from_row(row: &Row<'_>) -> rusqlite::Result<ChatSummary> {
    Ok(ChatSummary {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        topic: TopicKey::from_storage_key(row.get(2)?),
        summary: row.get(3)?,
        topics: from_json(row.get(4)?),
        next_events: from_json(row.get(5)?),
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn user_summary_from_row(row: &Row<'_>) -> rusqlite::Result<UserSummary> {
    Ok(UserSummary {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        user_id: row.get(2)?,
        identity: UserIdentity {
            username: row.get(3)?,
            first_name: row.get(4)?,
            last_name: row.get(5)?,
        },
        likes: from_json(row.get(6)?),
        dislikes: from_json(row.get(7)?),
        competencies: from_json(row.get(8)?),
        traits: from_json(row.get(9)?),
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

const USER_COLUMNS: &str = "id, chat_id, user_id, username, first_name, last_name, \
     likes, dislikes, competencies, traits, created_at, updated_at";

fn upsert_chat_summary_on(conn: &Connection, summary: &NewChatSummary) -> anyhow::Result<()> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO chat_summaries (chat_id, topic_key, summary, topics, next_events, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
         ON CONFLICT(chat_id, topic_key) DO UPDATE SET
             summary = excluded.summary,
             topics = excluded.topics,
             next_events = excluded.next_events,
             updated_at = excluded.updated_at",
        rusqlite::params![
            summary.chat_id,
            summary.topic.storage_key(),
            summary.summary,
            to_json(&summary.topics)?,
            to_json(&summary.next_events)?,
            now,
        ],
    )?;
    Ok(())
}

// Identity columns keep their previous value when the batch did not carry one.
fn upsert_user_summary_on(conn: &Connection, profile: &NewUserSummary) -> anyhow::Result<()> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO user_summaries (chat_id, user_id, username, first_name, last_name,
                                     likes, dislikes, competencies, traits, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
         ON CONFLICT(chat_id, user_id) DO UPDATE SET
             username = COALESCE(excluded.username, user_summaries.username),
             first_name = COALESCE(excluded.first_name, user_summaries.first_name),
             last_name = COALESCE(excluded.last_name, user_summaries.last_name),
             likes = excluded.likes,
             dislikes = excluded.dislikes,
             competencies = excluded.competencies,
             traits = excluded.traits,
             updated_at = excluded.updated_at",
        rusqlite::params![
            profile.chat_id,
            profile.user_id,
            profile.identity.username,
            profile.identity.first_name,
            profile.identity.last_name,
            to_json(&profile.likes)?,
            to_json(&profile.dislikes)?,
            to_json(&profile.competencies)?,
            to_json(&profile.traits)?,
            now,
        ],
    )?;
    Ok(())
}

impl Database {
    pub fn get_chat_summary(&self, chat_id: i64, topic: TopicKey) -> anyhow::Result<Option<ChatSummary>> {
        let conn = self.conn()?;
        let summary = conn
            .query_row(
                "SELECT id, chat_id, topic_key, summary, topics, next_events, created_at, updated_at
                 FROM chat_summaries WHERE chat_id = ?1 AND topic_key = ?2",
                rusqlite::params![chat_id, topic.storage_key()],
                chat_summary_from_row,
            )
            .optional()?;
        Ok(summary)
    }

    pub fn upsert_chat_summary(&self, summary: &NewChatSummary) -> anyhow::Result<()> {
        let conn = self.conn()?;
        upsert_chat_summary_on(&conn, summary)
    }

    pub fn get_user_summary(&self, chat_id: i64, user_id: i64) -> anyhow::Result<Option<UserSummary>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM user_summaries WHERE chat_id = ?1 AND user_id = ?2",
            USER_COLUMNS
        );
        let summary = conn
            .query_row(&sql, rusqlite::params![chat_id, user_id], user_summary_from_row)
            .optional()?;
        Ok(summary)
    }

    /// Stored profiles for any of `user_ids` in one chat. Users without a row are absent.
    pub fn get_user_summaries(&self, chat_id: i64, user_ids: &[i64]) -> anyhow::Result<Vec<UserSummary>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let placeholders = vec!["?"; user_ids.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM user_summaries WHERE chat_id = ? AND user_id IN ({}) ORDER BY user_id",
            USER_COLUMNS, placeholders
        );
        let mut params: Vec<&dyn rusqlite::ToSql> = vec![&chat_id];
        for id in user_ids {
            params.push(id);
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(&params[..], user_summary_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn upsert_user_summary(&self, profile: &NewUserSummary) -> anyhow::Result<()> {
        let conn = self.conn()?;
        upsert_user_summary_on(&conn, profile)
    }

    /// Persist one summarization result: the chat row and every profile, or nothing.
    pub fn save_summarization(
        &self,
        summary: &NewChatSummary,
        profiles: &[NewUserSummary],
    ) -> anyhow::Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        upsert_chat_summary_on(&tx, summary)?;
        for profile in profiles {
            upsert_user_summary_on(&tx, profile)?;
        }
        tx.commit()?;
        debug!(
            chat_id = summary.chat_id,
            topic = %summary.topic,
            profiles = profiles.len(),
            "Database: Saved summarization"
        );
        Ok(())
    }
}
