use super::Database;
use crate::models::AllowedChat;
use chrono::Utc;

impl Database {
    /// Allow a chat. Re-adding keeps the original row but refreshes a provided name.
    pub fn add_allowed_chat(&self, chat_id: i64, name: Option<&str>) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO allowed_chats (chat_id, name, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(chat_id) DO UPDATE SET name = COALESCE(excluded.name, allowed_chats.name)",
            rusqlite::params![chat_id, name, Utc::now()],
        )?;
        Ok(())
    }

    pub fn remove_allowed_chat(&self, chat_id: i64) -> anyhow::Result<bool> {
        let conn = self.conn()?;
        let count = conn.execute("DELETE FROM allowed_chats WHERE chat_id = ?1", [chat_id])?;
        Ok(count > 0)
    }

    pub fn is_chat_allowed(&self, chat_id: i64) -> anyhow::Result<bool> {
        let conn = self.conn()?;
        let exists = conn
            .prepare("SELECT 1 FROM allowed_chats WHERE chat_id = ?1")?
            .exists([chat_id])?;
        Ok(exists)
    }

    pub fn list_allowed_chats(&self) -> anyhow::Result<Vec<AllowedChat>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT chat_id, name, created_at FROM allowed_chats ORDER BY chat_id")?;
        let rows = stmt.query_map([], |row| {
            Ok(AllowedChat {
                chat_id: row.get(0)?,
                name: row.get(1)?,
                created_at: row.get(2)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}
