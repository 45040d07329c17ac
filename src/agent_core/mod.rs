//! Agent Core: persistence and correlation services.
//!
//! Submodules:
//! - `database`: SQLite tables for conversations, messages and tool definitions
//! - `conversation`: ConversationStore and the per-channel session layer
//! - `pending`: request/response correlation with timeouts
//! - `tokens`: Token estimation for stored messages
//! - `types`: Stored records
//! - `errors`: Agent-level error types

pub mod conversation;
pub mod database;
pub mod errors;
pub mod pending;
pub mod tokens;
pub mod types;

pub use conversation::{
    ConversationStore, Session, SessionManager, DEFAULT_MAX_CONVERSATIONS_PER_SESSION,
};
pub use database::AgentDatabase;
pub use errors::AgentError;
pub use pending::{PendingRequests, PendingTicket};
pub use types::{Conversation, MessageType, NewMessage, StoredMessage};
