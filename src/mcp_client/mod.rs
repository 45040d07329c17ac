//! MCP Client: JSON-RPC connections to external tool servers.
//!
//! This module handles:
//! - Spawning stdio servers and dialing SSE servers
//! - The `initialize` handshake and `tools/list` discovery
//! - Bridging discovered tools into the shared tool registry
//! - One reconnect-and-retry when a call finds the connection gone
//! - The persisted flat list of server records

pub mod client;
pub mod connection;
pub mod errors;
pub mod sse;
pub mod transport;
pub mod types;

pub use client::{load_server_configs, save_server_configs, McpClient, McpServerStatus};
pub use connection::{Connector, ProcessConnector};
pub use errors::McpError;
pub use transport::Transport;
pub use types::{McpServerConfig, McpToolDefinition, PlatformCommand, TransportKind};
