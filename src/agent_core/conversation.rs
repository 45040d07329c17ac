//! ConversationStore and the in-memory session layer.
//!
//! The store serializes writes through one mutex-guarded SQLite handle. The
//! session layer maps a live channel to its current conversation; it is a
//! cache that can always be rebuilt from the store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::providers::{ChatMessage, Role, ToolCallRequest};
use crate::sync::{lock, read, write};
use crate::tools::{ToolDefinition, ToolError, ToolStore};

use super::database::AgentDatabase;
use super::errors::AgentError;
use super::tokens;
use super::types::{Conversation, MessageType, NewMessage, StoredMessage};

/// Conversations kept per session before the oldest are pruned.
pub const DEFAULT_MAX_CONVERSATIONS_PER_SESSION: usize = 50;

// ─── ConversationStore ──────────────────────────────────────────────────────

pub struct ConversationStore {
    db: Mutex<AgentDatabase>,
    max_conversations_per_session: usize,
}

impl ConversationStore {
    pub fn new(db: AgentDatabase) -> Self {
        Self {
            db: Mutex::new(db),
            max_conversations_per_session: DEFAULT_MAX_CONVERSATIONS_PER_SESSION,
        }
    }

    pub fn open(path: &str) -> Result<Self, AgentError> {
        Ok(Self::new(AgentDatabase::open(path)?))
    }

    pub fn with_max_conversations(mut self, max: usize) -> Self {
        self.max_conversations_per_session = max.max(1);
        self
    }

    pub fn create_conversation(&self, session_id: &str) -> Result<Conversation, AgentError> {
        lock(&self.db).create_conversation(session_id)
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<(), AgentError> {
        lock(&self.db).execute_batch(sql)
    }

    /// Open a conversation with its first message, then prune the session's
    /// oldest conversations beyond the retention limit.
    pub fn start_conversation(
        &self,
        session_id: &str,
        msg: &NewMessage,
    ) -> Result<(Conversation, StoredMessage), AgentError> {
        let db = lock(&self.db);
        let created = db.create_conversation_with_message(session_id, msg, estimate(msg))?;
        let pruned = db.prune_conversations(session_id, self.max_conversations_per_session)?;
        if pruned > 0 {
            tracing::info!(session = %session_id, pruned, "pruned old conversations");
        }
        Ok(created)
    }

    pub fn append(&self, conversation_id: &str, msg: &NewMessage) -> Result<StoredMessage, AgentError> {
        lock(&self.db).append_message(conversation_id, msg, estimate(msg))
    }

    pub fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>, AgentError> {
        lock(&self.db).get_conversation(conversation_id)
    }

    pub fn get_messages(&self, conversation_id: &str) -> Result<Vec<StoredMessage>, AgentError> {
        lock(&self.db).get_messages(conversation_id)
    }

    pub fn list_conversations(&self, session_id: &str) -> Result<Vec<Conversation>, AgentError> {
        lock(&self.db).list_conversations(session_id)
    }

    pub fn latest_conversation(&self, session_id: &str) -> Result<Option<Conversation>, AgentError> {
        lock(&self.db).latest_conversation(session_id)
    }

    pub fn rename_conversation(&self, conversation_id: &str, title: &str) -> Result<(), AgentError> {
        lock(&self.db).rename_conversation(conversation_id, title)
    }

    pub fn delete_conversation(&self, conversation_id: &str) -> Result<bool, AgentError> {
        lock(&self.db).delete_conversation(conversation_id)
    }

    /// The last `limit` messages as provider input.
    ///
    /// Commands and system notes are skipped, and tool results whose
    /// originating call fell outside the window are dropped.
    pub fn history(&self, conversation_id: &str, limit: usize) -> Result<Vec<ChatMessage>, AgentError> {
        let recent = lock(&self.db).get_recent_messages(conversation_id, limit)?;
        let mut messages: Vec<ChatMessage> =
            recent.iter().filter_map(StoredMessage::to_chat_message).collect();
        let orphans = messages.iter().take_while(|m| m.role == Role::Tool).count();
        messages.drain(..orphans);
        Ok(messages)
    }
}

impl ToolStore for ConversationStore {
    fn upsert_tool(&self, tool: &ToolDefinition) -> Result<(), ToolError> {
        lock(&self.db).upsert_tool_definition(tool).map_err(storage)
    }

    fn set_tool_enabled(&self, id: &str, enabled: bool) -> Result<(), ToolError> {
        lock(&self.db).set_tool_enabled(id, enabled).map_err(storage)
    }

    fn tool_enabled(&self, id: &str) -> Result<Option<bool>, ToolError> {
        lock(&self.db).tool_enabled(id).map_err(storage)
    }
}

fn storage(e: AgentError) -> ToolError {
    ToolError::Storage {
        reason: e.to_string(),
    }
}

fn estimate(msg: &NewMessage) -> u32 {
    let chat = match msg.message_type {
        MessageType::ToolCall => {
            let calls: Vec<ToolCallRequest> = msg
                .extra
                .get("toolCalls")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            ChatMessage::assistant_tool_calls(Some(msg.content.clone()), calls)
        }
        _ => ChatMessage::new(msg.role, msg.content.clone()),
    };
    tokens::estimate_message_tokens(&chat)
}

// ─── Sessions ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: String,
    pub current_conversation_id: Option<String>,
    /// Ephemeral per-connection state (model info, character info).
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Maps live channels to sessions. The session id is the channel id, so a
/// reconnecting client resumes its latest conversation.
pub struct SessionManager {
    store: Arc<ConversationStore>,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new(store: Arc<ConversationStore>) -> Self {
        Self {
            store,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Bind a channel to a session, recovering its latest conversation or
    /// creating an empty one.
    pub fn attach(&self, channel_id: &str) -> Result<Session, AgentError> {
        let conversation = match self.store.latest_conversation(channel_id)? {
            Some(c) => c,
            None => self.store.create_conversation(channel_id)?,
        };
        let session = Session {
            session_id: channel_id.to_string(),
            current_conversation_id: Some(conversation.id),
            metadata: serde_json::Map::new(),
        };
        write(&self.sessions).insert(channel_id.to_string(), session.clone());
        tracing::debug!(
            channel = %channel_id,
            conversation = ?session.current_conversation_id,
            "session attached"
        );
        Ok(session)
    }

    /// Drop the in-memory session. Persisted data stays.
    pub fn detach(&self, channel_id: &str) -> Option<Session> {
        write(&self.sessions).remove(channel_id)
    }

    pub fn get(&self, channel_id: &str) -> Option<Session> {
        read(&self.sessions).get(channel_id).cloned()
    }

    pub fn current_conversation(&self, channel_id: &str) -> Option<String> {
        read(&self.sessions)
            .get(channel_id)
            .and_then(|s| s.current_conversation_id.clone())
    }

    /// Point the session at an existing conversation of the same session.
    pub fn switch_to(&self, channel_id: &str, conversation_id: &str) -> Result<(), AgentError> {
        let conversation = self
            .store
            .get_conversation(conversation_id)?
            .filter(|c| c.session_id == channel_id)
            .ok_or_else(|| AgentError::ConversationNotFound {
                conversation_id: conversation_id.to_string(),
            })?;
        let mut sessions = write(&self.sessions);
        let session = sessions
            .entry(channel_id.to_string())
            .or_insert_with(|| empty_session(channel_id));
        session.current_conversation_id = Some(conversation.id);
        Ok(())
    }

    /// Detach the current conversation; the next recorded message opens a
    /// fresh one.
    pub fn start_new(&self, channel_id: &str) {
        let mut sessions = write(&self.sessions);
        let session = sessions
            .entry(channel_id.to_string())
            .or_insert_with(|| empty_session(channel_id));
        session.current_conversation_id = None;
    }

    pub fn set_metadata(&self, channel_id: &str, key: &str, value: serde_json::Value) {
        let mut sessions = write(&self.sessions);
        let session = sessions
            .entry(channel_id.to_string())
            .or_insert_with(|| empty_session(channel_id));
        session.metadata.insert(key.to_string(), value);
    }

    pub fn metadata(&self, channel_id: &str, key: &str) -> Option<serde_json::Value> {
        read(&self.sessions)
            .get(channel_id)
            .and_then(|s| s.metadata.get(key).cloned())
    }

    /// Persist a message to the channel's current conversation, opening a
    /// new conversation with it when there is none.
    ///
    /// Holds the session lock across the write so two messages on the same
    /// channel cannot both open a conversation.
    pub fn record(&self, channel_id: &str, msg: &NewMessage) -> Result<StoredMessage, AgentError> {
        let mut sessions = write(&self.sessions);
        let session = sessions
            .entry(channel_id.to_string())
            .or_insert_with(|| empty_session(channel_id));

        if let Some(conversation_id) = &session.current_conversation_id {
            match self.store.append(conversation_id, msg) {
                Err(AgentError::ConversationNotFound { .. }) => {
                    tracing::info!(
                        channel = %channel_id,
                        conversation = %conversation_id,
                        "current conversation was deleted, starting a new one"
                    );
                }
                other => return other,
            }
        }

        let (conversation, stored) = self.store.start_conversation(&session.session_id, msg)?;
        session.current_conversation_id = Some(conversation.id);
        Ok(stored)
    }

    /// Provider-ready history of the channel's current conversation.
    pub fn history(&self, channel_id: &str, limit: usize) -> Result<Vec<ChatMessage>, AgentError> {
        match self.current_conversation(channel_id) {
            Some(id) => self.store.history(&id, limit),
            None => Ok(Vec::new()),
        }
    }
}

fn empty_session(channel_id: &str) -> Session {
    Session {
        session_id: channel_id.to_string(),
        current_conversation_id: None,
        metadata: serde_json::Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> Arc<ConversationStore> {
        Arc::new(ConversationStore::open(":memory:").unwrap())
    }

    #[test]
    fn test_attach_creates_then_recovers() {
        let store = test_store();
        let sessions = SessionManager::new(store.clone());

        let first = sessions.attach("ch1").unwrap();
        let conv_id = first.current_conversation_id.clone().unwrap();
        sessions.record("ch1", &NewMessage::user_text("Hello")).unwrap();
        sessions.detach("ch1");
        assert!(sessions.get("ch1").is_none());

        let again = sessions.attach("ch1").unwrap();
        assert_eq!(again.current_conversation_id, Some(conv_id.clone()));
        assert_eq!(store.get_messages(&conv_id).unwrap().len(), 1);
    }

    #[test]
    fn test_start_new_opens_conversation_on_next_record() {
        let store = test_store();
        let sessions = SessionManager::new(store.clone());
        let first = sessions.attach("ch1").unwrap().current_conversation_id;

        sessions.start_new("ch1");
        assert!(sessions.current_conversation("ch1").is_none());

        let stored = sessions.record("ch1", &NewMessage::user_text("Fresh start")).unwrap();
        assert_ne!(Some(stored.conversation_id.clone()), first);
        assert_eq!(sessions.current_conversation("ch1"), Some(stored.conversation_id.clone()));

        let conv = store.get_conversation(&stored.conversation_id).unwrap().unwrap();
        assert_eq!(conv.title.as_deref(), Some("Fresh start"));
    }

    #[test]
    fn test_record_recovers_from_deleted_conversation() {
        let store = test_store();
        let sessions = SessionManager::new(store.clone());
        let conv = sessions.attach("ch1").unwrap().current_conversation_id.unwrap();
        store.delete_conversation(&conv).unwrap();

        let stored = sessions.record("ch1", &NewMessage::user_text("hi")).unwrap();
        assert_ne!(stored.conversation_id, conv);
    }

    #[test]
    fn test_retention_prunes_oldest() {
        let store = Arc::new(
            ConversationStore::open(":memory:")
                .unwrap()
                .with_max_conversations(2),
        );
        for i in 0..4 {
            store
                .start_conversation("s1", &NewMessage::user_text(format!("q{i}")))
                .unwrap();
        }
        assert_eq!(store.list_conversations("s1").unwrap().len(), 2);
    }

    #[test]
    fn test_history_drops_orphan_tool_results() {
        let store = test_store();
        let conv = store.create_conversation("s1").unwrap();
        let call = ToolCallRequest {
            id: "call_1".into(),
            name: "get_weather".into(),
            arguments: "{}".into(),
        };
        store.append(&conv.id, &NewMessage::user_text("weather?")).unwrap();
        store
            .append(&conv.id, &NewMessage::assistant_tool_calls(None, &[call]))
            .unwrap();
        store
            .append(&conv.id, &NewMessage::tool_result("call_1", "get_weather", "sunny"))
            .unwrap();
        store.append(&conv.id, &NewMessage::assistant_text("It's sunny.")).unwrap();

        let full = store.history(&conv.id, 10).unwrap();
        assert_eq!(full.len(), 4);

        // Window starting at the tool result loses it.
        let windowed = store.history(&conv.id, 2).unwrap();
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].role, Role::Assistant);
    }

    #[test]
    fn test_token_count_recorded() {
        let store = test_store();
        let conv = store.create_conversation("s1").unwrap();
        let stored = store
            .append(&conv.id, &NewMessage::user_text("a fairly ordinary sentence"))
            .unwrap();
        assert!(stored.token_count > 4);
    }
}
