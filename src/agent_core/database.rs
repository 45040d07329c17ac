//! SQLite store for conversations, messages and tool definitions.
//!
//! Uses `rusqlite` synchronously; callers hold the handle behind a mutex.
//! WAL mode is enabled so readers are not blocked during writes.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::errors::AgentError;
use super::types::{Conversation, MessageType, NewMessage, StoredMessage};
use crate::providers::Role;
use crate::tools::{ToolDefinition, ToolSource};

/// Longest auto-derived conversation title, in chars.
const TITLE_MAX_CHARS: usize = 50;

// ─── Database ───────────────────────────────────────────────────────────────

pub struct AgentDatabase {
    conn: Connection,
}

impl AgentDatabase {
    /// Open (or create) the database at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str) -> Result<Self, AgentError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self { conn };
        db.create_tables()?;
        Ok(db)
    }

    fn create_tables(&self) -> Result<(), AgentError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                title TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}'
            );

            CREATE INDEX IF NOT EXISTS idx_conversations_session
                ON conversations(session_id, updated_at);

            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL,
                message_type TEXT NOT NULL,
                content TEXT NOT NULL,
                extra TEXT NOT NULL DEFAULT '{}',
                token_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, seq);

            CREATE TABLE IF NOT EXISTS tool_definitions (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                parameters TEXT NOT NULL,
                source TEXT NOT NULL,
                mcp_server TEXT,
                plugin TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<(), AgentError> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    // ─── Conversations ──────────────────────────────────────────────────

    /// Create an empty conversation.
    pub fn create_conversation(&self, session_id: &str) -> Result<Conversation, AgentError> {
        let now = now();
        let conversation = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            title: None,
            created_at: now.clone(),
            updated_at: now,
            metadata: serde_json::json!({}),
        };
        insert_conversation(&self.conn, &conversation)?;
        Ok(conversation)
    }

    /// Create a conversation together with its first message, in one
    /// transaction.
    pub fn create_conversation_with_message(
        &self,
        session_id: &str,
        msg: &NewMessage,
        token_count: u32,
    ) -> Result<(Conversation, StoredMessage), AgentError> {
        let tx = self.conn.unchecked_transaction()?;
        let now = now();
        let mut conversation = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            title: title_for(msg),
            created_at: now.clone(),
            updated_at: now,
            metadata: serde_json::json!({}),
        };
        insert_conversation(&tx, &conversation)?;
        let stored = insert_message(&tx, &conversation.id, msg, token_count)?;
        conversation.updated_at = stored.created_at.clone();
        tx.commit()?;
        Ok((conversation, stored))
    }

    pub fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>, AgentError> {
        let result = self
            .conn
            .query_row(
                "SELECT id, session_id, title, created_at, updated_at, metadata
                 FROM conversations WHERE id = ?1",
                params![conversation_id],
                row_to_conversation,
            )
            .optional()?;
        result.transpose()
    }

    /// Conversations of a session, most recently updated first.
    pub fn list_conversations(&self, session_id: &str) -> Result<Vec<Conversation>, AgentError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, title, created_at, updated_at, metadata
             FROM conversations
             WHERE session_id = ?1
             ORDER BY updated_at DESC, rowid DESC",
        )?;

        let rows = stmt.query_map(params![session_id], row_to_conversation)?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row??);
        }
        Ok(conversations)
    }

    pub fn latest_conversation(&self, session_id: &str) -> Result<Option<Conversation>, AgentError> {
        Ok(self.list_conversations(session_id)?.into_iter().next())
    }

    pub fn rename_conversation(&self, conversation_id: &str, title: &str) -> Result<(), AgentError> {
        let changed = self.conn.execute(
            "UPDATE conversations SET title = ?2, updated_at = ?3 WHERE id = ?1",
            params![conversation_id, title, now()],
        )?;
        if changed == 0 {
            return Err(AgentError::ConversationNotFound {
                conversation_id: conversation_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn set_conversation_metadata(
        &self,
        conversation_id: &str,
        metadata: &serde_json::Value,
    ) -> Result<(), AgentError> {
        let json = serde_json::to_string(metadata)?;
        let changed = self.conn.execute(
            "UPDATE conversations SET metadata = ?2 WHERE id = ?1",
            params![conversation_id, json],
        )?;
        if changed == 0 {
            return Err(AgentError::ConversationNotFound {
                conversation_id: conversation_id.to_string(),
            });
        }
        Ok(())
    }

    /// Delete a conversation. Its messages go with it through the cascade.
    /// Returns false when nothing matched.
    pub fn delete_conversation(&self, conversation_id: &str) -> Result<bool, AgentError> {
        let changed = self.conn.execute(
            "DELETE FROM conversations WHERE id = ?1",
            params![conversation_id],
        )?;
        Ok(changed > 0)
    }

    /// Keep the `keep` most recent conversations of a session and delete the
    /// rest. Returns the number deleted.
    pub fn prune_conversations(&self, session_id: &str, keep: usize) -> Result<usize, AgentError> {
        let stale: Vec<String> = self
            .list_conversations(session_id)?
            .into_iter()
            .skip(keep)
            .map(|c| c.id)
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.unchecked_transaction()?;
        for id in &stale {
            tx.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(stale.len())
    }

    // ─── Messages ───────────────────────────────────────────────────────

    /// Append a message and touch the conversation's `updated_at`.
    pub fn append_message(
        &self,
        conversation_id: &str,
        msg: &NewMessage,
        token_count: u32,
    ) -> Result<StoredMessage, AgentError> {
        let tx = self.conn.unchecked_transaction()?;

        let title: Option<Option<String>> = tx
            .query_row(
                "SELECT title FROM conversations WHERE id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(title) = title else {
            return Err(AgentError::ConversationNotFound {
                conversation_id: conversation_id.to_string(),
            });
        };

        let stored = insert_message(&tx, conversation_id, msg, token_count)?;
        if title.is_none() {
            if let Some(derived) = title_for(msg) {
                tx.execute(
                    "UPDATE conversations SET title = ?2 WHERE id = ?1",
                    params![conversation_id, derived],
                )?;
            }
        }
        tx.commit()?;
        Ok(stored)
    }

    /// All messages of a conversation, in append order.
    pub fn get_messages(&self, conversation_id: &str) -> Result<Vec<StoredMessage>, AgentError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, conversation_id, role, message_type, content, extra,
                    token_count, created_at
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY seq ASC",
        )?;

        let rows = stmt.query_map(params![conversation_id], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row??);
        }
        Ok(messages)
    }

    /// The `limit` most recent messages, oldest first.
    pub fn get_recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, AgentError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, conversation_id, role, message_type, content, extra,
                    token_count, created_at
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY seq DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![conversation_id, limit as i64], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row??);
        }
        messages.reverse();
        Ok(messages)
    }

    pub fn message_count(&self, conversation_id: &str) -> Result<usize, AgentError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ─── Tool Definitions ───────────────────────────────────────────────

    pub fn upsert_tool_definition(&self, tool: &ToolDefinition) -> Result<(), AgentError> {
        let parameters = serde_json::to_string(&tool.parameters)?;
        self.conn.execute(
            "INSERT INTO tool_definitions
             (id, name, description, parameters, source, mcp_server, plugin, enabled, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                parameters = excluded.parameters,
                source = excluded.source,
                mcp_server = excluded.mcp_server,
                plugin = excluded.plugin,
                enabled = excluded.enabled,
                updated_at = excluded.updated_at",
            params![
                tool.id,
                tool.name,
                tool.description,
                parameters,
                tool.source.as_str(),
                tool.mcp_server,
                tool.plugin,
                tool.enabled as i32,
                now(),
            ],
        )?;
        Ok(())
    }

    pub fn set_tool_enabled(&self, id: &str, enabled: bool) -> Result<(), AgentError> {
        self.conn.execute(
            "UPDATE tool_definitions SET enabled = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, enabled as i32, now()],
        )?;
        Ok(())
    }

    pub fn tool_enabled(&self, id: &str) -> Result<Option<bool>, AgentError> {
        let enabled: Option<i32> = self
            .conn
            .query_row(
                "SELECT enabled FROM tool_definitions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(enabled.map(|v| v != 0))
    }

    pub fn load_tool_definitions(&self) -> Result<Vec<ToolDefinition>, AgentError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, description, parameters, source, mcp_server, plugin, enabled
             FROM tool_definitions
             ORDER BY id ASC",
        )?;

        let rows = stmt.query_map([], row_to_tool)?;

        let mut tools = Vec::new();
        for row in rows {
            tools.push(row??);
        }
        Ok(tools)
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

fn insert_conversation(conn: &Connection, conversation: &Conversation) -> Result<(), AgentError> {
    let metadata = serde_json::to_string(&conversation.metadata)?;
    conn.execute(
        "INSERT INTO conversations (id, session_id, title, created_at, updated_at, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            conversation.id,
            conversation.session_id,
            conversation.title,
            conversation.created_at,
            conversation.updated_at,
            metadata,
        ],
    )?;
    Ok(())
}

fn insert_message(
    conn: &Connection,
    conversation_id: &str,
    msg: &NewMessage,
    token_count: u32,
) -> Result<StoredMessage, AgentError> {
    let stored = StoredMessage {
        id: uuid::Uuid::new_v4().to_string(),
        conversation_id: conversation_id.to_string(),
        role: msg.role,
        message_type: msg.message_type,
        content: msg.content.clone(),
        extra: msg.extra.clone(),
        token_count,
        created_at: now(),
    };
    let extra = serde_json::to_string(&stored.extra)?;

    conn.execute(
        "INSERT INTO messages
         (id, conversation_id, role, message_type, content, extra, token_count, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            stored.id,
            stored.conversation_id,
            stored.role.as_str(),
            stored.message_type.as_str(),
            stored.content,
            extra,
            stored.token_count,
            stored.created_at,
        ],
    )?;
    conn.execute(
        "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
        params![conversation_id, stored.created_at],
    )?;
    Ok(stored)
}

/// Title from the first non-command user text.
fn title_for(msg: &NewMessage) -> Option<String> {
    if msg.role != Role::User || msg.message_type != MessageType::Text {
        return None;
    }
    let text = msg.content.trim();
    if text.is_empty() || text.starts_with('/') {
        return None;
    }
    let first_line = text.lines().next().unwrap_or(text);
    let mut title: String = first_line.chars().take(TITLE_MAX_CHARS).collect();
    if first_line.chars().count() > TITLE_MAX_CHARS {
        title.push('…');
    }
    Some(title)
}

fn corrupt(table: &str, reason: impl Into<String>) -> AgentError {
    AgentError::CorruptRecord {
        table: table.to_string(),
        reason: reason.into(),
    }
}

fn parse_json_object(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::json!({}))
}

fn row_to_conversation(row: &Row<'_>) -> rusqlite::Result<Result<Conversation, AgentError>> {
    let metadata: String = row.get(5)?;
    Ok(Ok(Conversation {
        id: row.get(0)?,
        session_id: row.get(1)?,
        title: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        metadata: parse_json_object(&metadata),
    }))
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Result<StoredMessage, AgentError>> {
    let role: String = row.get(2)?;
    let message_type: String = row.get(3)?;
    let extra: String = row.get(5)?;

    let Some(role) = Role::parse(&role) else {
        return Ok(Err(corrupt("messages", format!("unknown role '{role}'"))));
    };
    let Some(message_type) = MessageType::parse(&message_type) else {
        return Ok(Err(corrupt(
            "messages",
            format!("unknown message type '{message_type}'"),
        )));
    };

    Ok(Ok(StoredMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role,
        message_type,
        content: row.get(4)?,
        extra: parse_json_object(&extra),
        token_count: row.get(6)?,
        created_at: row.get(7)?,
    }))
}

fn row_to_tool(row: &Row<'_>) -> rusqlite::Result<Result<ToolDefinition, AgentError>> {
    let parameters: String = row.get(3)?;
    let source: String = row.get(4)?;
    let enabled: i32 = row.get(7)?;

    let Some(source) = ToolSource::parse(&source) else {
        return Ok(Err(corrupt(
            "tool_definitions",
            format!("unknown source '{source}'"),
        )));
    };

    Ok(Ok(ToolDefinition {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        parameters: parse_json_object(&parameters),
        source,
        mcp_server: row.get(5)?,
        plugin: row.get(6)?,
        enabled: enabled != 0,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> AgentDatabase {
        AgentDatabase::open(":memory:").unwrap()
    }

    #[test]
    fn test_append_preserves_order_for_any_count() {
        let db = test_db();
        for n in 0..6 {
            let conv = db.create_conversation("s1").unwrap();
            let contents: Vec<String> = (0..n).map(|i| format!("message {i}")).collect();
            for (i, content) in contents.iter().enumerate() {
                let msg = if i % 2 == 0 {
                    NewMessage::user_text(content.clone())
                } else {
                    NewMessage::assistant_text(content.clone())
                };
                db.append_message(&conv.id, &msg, 1).unwrap();
            }

            let read: Vec<String> = db
                .get_messages(&conv.id)
                .unwrap()
                .into_iter()
                .map(|m| m.content)
                .collect();
            assert_eq!(read, contents);
        }
    }

    #[test]
    fn test_delete_cascades_to_messages() {
        let db = test_db();
        let (conv, _) = db
            .create_conversation_with_message("s1", &NewMessage::user_text("Hello"), 2)
            .unwrap();
        db.append_message(&conv.id, &NewMessage::assistant_text("Hi!"), 1)
            .unwrap();
        assert_eq!(db.message_count(&conv.id).unwrap(), 2);

        assert!(db.delete_conversation(&conv.id).unwrap());
        assert!(db.get_messages(&conv.id).unwrap().is_empty());
        assert!(db.get_conversation(&conv.id).unwrap().is_none());
        assert!(!db.delete_conversation(&conv.id).unwrap());
    }

    #[test]
    fn test_title_from_first_non_command_user_message() {
        let db = test_db();
        let conv = db.create_conversation("s1").unwrap();
        db.append_message(&conv.id, &NewMessage::command("/help"), 1)
            .unwrap();
        db.append_message(&conv.id, &NewMessage::user_text("What's the weather?"), 1)
            .unwrap();
        db.append_message(&conv.id, &NewMessage::user_text("Second question"), 1)
            .unwrap();

        let stored = db.get_conversation(&conv.id).unwrap().unwrap();
        assert_eq!(stored.title.as_deref(), Some("What's the weather?"));
    }

    #[test]
    fn test_conversation_created_with_message_keeps_title() {
        let db = test_db();
        let (conv, stored) = db
            .create_conversation_with_message("s1", &NewMessage::user_text("Plan my trip"), 3)
            .unwrap();
        assert_eq!(conv.title.as_deref(), Some("Plan my trip"));
        assert_eq!(stored.conversation_id, conv.id);

        let reloaded = db.get_conversation(&conv.id).unwrap().unwrap();
        assert_eq!(reloaded.title.as_deref(), Some("Plan my trip"));
        assert_eq!(db.list_conversations("s1").unwrap()[0].title.as_deref(), Some("Plan my trip"));
    }

    #[test]
    fn test_append_to_missing_conversation_fails() {
        let db = test_db();
        let err = db
            .append_message("nope", &NewMessage::user_text("hi"), 1)
            .unwrap_err();
        assert!(matches!(err, AgentError::ConversationNotFound { .. }));
    }

    #[test]
    fn test_recency_order_and_prune() {
        let db = test_db();
        let first = db.create_conversation("s1").unwrap();
        let second = db.create_conversation("s1").unwrap();
        let third = db.create_conversation("s1").unwrap();
        db.create_conversation("other").unwrap();

        // Appending moves the oldest conversation to the front.
        db.append_message(&first.id, &NewMessage::user_text("bump"), 1)
            .unwrap();
        let order: Vec<String> = db
            .list_conversations("s1")
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(order, vec![first.id.clone(), third.id.clone(), second.id.clone()]);

        assert_eq!(db.prune_conversations("s1", 2).unwrap(), 1);
        assert!(db.get_conversation(&second.id).unwrap().is_none());
        assert_eq!(db.list_conversations("other").unwrap().len(), 1);
        assert_eq!(db.latest_conversation("s1").unwrap().unwrap().id, first.id);
    }

    #[test]
    fn test_recent_messages_oldest_first() {
        let db = test_db();
        let conv = db.create_conversation("s1").unwrap();
        for i in 0..5 {
            db.append_message(&conv.id, &NewMessage::user_text(format!("m{i}")), 1)
                .unwrap();
        }
        let recent: Vec<String> = db
            .get_recent_messages(&conv.id, 2)
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(recent, vec!["m3", "m4"]);
    }

    #[test]
    fn test_rename_conversation() {
        let db = test_db();
        let conv = db.create_conversation("s1").unwrap();
        db.rename_conversation(&conv.id, "Trip plans").unwrap();
        let stored = db.get_conversation(&conv.id).unwrap().unwrap();
        assert_eq!(stored.title.as_deref(), Some("Trip plans"));
        assert!(db.rename_conversation("missing", "x").is_err());
    }

    #[test]
    fn test_tool_definition_round_trip() {
        let db = test_db();
        let tool = ToolDefinition {
            id: "mcp_files_read".into(),
            name: "read".into(),
            description: "Read a file".into(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
            source: ToolSource::Mcp,
            mcp_server: Some("files".into()),
            plugin: None,
            enabled: true,
        };
        db.upsert_tool_definition(&tool).unwrap();
        db.set_tool_enabled(&tool.id, false).unwrap();

        assert_eq!(db.tool_enabled(&tool.id).unwrap(), Some(false));
        assert_eq!(db.tool_enabled("unknown").unwrap(), None);

        let loaded = db.load_tool_definitions().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].mcp_server.as_deref(), Some("files"));
        assert!(!loaded[0].enabled);
    }
}
