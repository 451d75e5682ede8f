pub(super) const SCHEMA: &str = "
-- Append-only message log. topic_id is NULL for the general stream.
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    platform_msg_id INTEGER NOT NULL,
    chat_id INTEGER NOT NULL,
    topic_id INTEGER,
    user_id INTEGER NOT NULL,
    is_bot BOOLEAN NOT NULL DEFAULT FALSE,
    first_name TEXT NOT NULL DEFAULT '',
    last_name TEXT,
    username TEXT,
    text TEXT,
    created_at DATETIME NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_chat_topic ON messages (chat_id, topic_id, id);
CREATE INDEX IF NOT EXISTS idx_messages_created ON messages (created_at);

-- topic_key 0 is the general stream
CREATE TABLE IF NOT EXISTS chat_summaries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chat_id INTEGER NOT NULL,
    topic_key INTEGER NOT NULL DEFAULT 0,
    summary TEXT NOT NULL,
    topics TEXT NOT NULL DEFAULT '{}',
    next_events TEXT NOT NULL DEFAULT '[]',
    created_at DATETIME NOT NULL,
    updated_at DATETIME NOT NULL,
    UNIQUE (chat_id, topic_key)
);

CREATE TABLE IF NOT EXISTS user_summaries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chat_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    username TEXT,
    first_name TEXT,
    last_name TEXT,
    likes TEXT NOT NULL DEFAULT '{}',
    dislikes TEXT NOT NULL DEFAULT '{}',
    competencies TEXT NOT NULL DEFAULT '{}',
    traits TEXT NOT NULL DEFAULT '{}',
    created_at DATETIME NOT NULL,
    updated_at DATETIME NOT NULL,
    UNIQUE (chat_id, user_id)
);

CREATE TABLE IF NOT EXISTS message_counters (
    chat_id INTEGER NOT NULL,
    topic_key INTEGER NOT NULL DEFAULT 0,
    count INTEGER NOT NULL DEFAULT 0,
    updated_at DATETIME NOT NULL,
    PRIMARY KEY (chat_id, topic_key)
);

CREATE TABLE IF NOT EXISTS allowed_chats (
    chat_id INTEGER PRIMARY KEY,
    name TEXT,
    created_at DATETIME NOT NULL
);
";
