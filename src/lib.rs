pub mod agent_core;
pub mod config;
pub mod handler;
pub mod mcp_client;
pub mod pipeline;
pub mod plugins;
pub mod providers;
pub(crate) mod sse;
pub(crate) mod sync;
pub mod tools;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use agent_core::{AgentDatabase, AgentError, ConversationStore, SessionManager};
use config::{AppConfig, ConfigError};
use handler::{register_builtin_commands, CommandRegistry, Handler, HandlerError};
use mcp_client::McpClient;
use pipeline::{
    ClientChannel, InboundKind, InboundMessage, MessageContext, OutboundKind, OutboundMessage,
    Pipeline,
};
use plugins::{PluginManager, PluginServices};
use providers::{ProviderError, ProviderRegistry};
use tools::{ToolError, ToolRegistry, ToolStore};

/// Return the platform-standard data directory for DeskPet.
///
/// - macOS: `~/Library/Application Support/com.deskpet.agent/`
/// - Windows: `{FOLDERID_RoamingAppData}\com.deskpet.agent\`
/// - Linux: `$XDG_DATA_HOME/com.deskpet.agent/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.deskpet/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("com.deskpet.agent");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".deskpet")
}

// ─── Tracing ─────────────────────────────────────────────────────────────────

/// Initialize the tracing subscriber, writing to `<log_dir>/agent.log`.
///
/// On each start:
/// 1. Rotates existing logs (agent.log → agent.log.1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh agent.log with a line-flushing writer.
/// 3. Logs a startup banner with the log path and pid.
///
/// Returns the log file path. A second call keeps the first subscriber.
pub fn init_tracing(log_dir: &Path) -> std::io::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join("agent.log");
    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("deskpet_agent=info,warn"));

    let installed = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            log_dir = %log_dir.display(),
            log_file = %log_path.display(),
            pid = std::process::id(),
            "=== DeskPet agent starting ==="
        );
    }
    Ok(log_path)
}

/// Rotate log files: `agent.log` → `agent.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write, so
/// each log line is on disk even if the process dies.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ─── Agent Core ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] AgentError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

/// Every service of the agent, constructed once and shared by reference.
pub struct AgentCore {
    pub config: AppConfig,
    pub providers: Arc<ProviderRegistry>,
    pub tools: Arc<ToolRegistry>,
    pub sessions: Arc<SessionManager>,
    pub commands: Arc<CommandRegistry>,
    pub mcp: Arc<McpClient>,
    pub plugins: Arc<PluginManager>,
    pub handler: Arc<Handler>,
    pub pipeline: Arc<Pipeline>,
}

/// One live client connection.
///
/// Turns (user input, taps, uploads, commands) run one at a time in arrival
/// order. Responses and bookkeeping run at once, so a `tool_confirm_response`
/// can settle a turn that is waiting on it.
pub struct Connection {
    channel: ClientChannel,
    turns: mpsc::UnboundedSender<InboundMessage>,
    worker: JoinHandle<()>,
    watcher: JoinHandle<()>,
}

impl Connection {
    pub fn channel(&self) -> &ClientChannel {
        &self.channel
    }
}

fn is_turn(kind: InboundKind) -> bool {
    matches!(
        kind,
        InboundKind::UserInput
            | InboundKind::TapEvent
            | InboundKind::FileUpload
            | InboundKind::CommandExecute
            | InboundKind::PluginMessage
    )
}

async fn run_message(pipeline: &Pipeline, channel: ClientChannel, message: InboundMessage) {
    let mut ctx = MessageContext::new(message, channel);
    pipeline.run(&mut ctx).await;
}

impl AgentCore {
    /// Build every service from `config`. Nothing connects until [`start`](Self::start).
    pub fn new(config: AppConfig) -> Result<Self, CoreError> {
        let db_path = config.database_path.to_string_lossy().into_owned();
        if let Some(parent) = config.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        let store = Arc::new(
            ConversationStore::new(AgentDatabase::open(&db_path)?)
                .with_max_conversations(config.max_conversations_per_session),
        );
        tracing::info!(db_path = %db_path, "agent database initialized");

        let providers = Arc::new(ProviderRegistry::with_builtin_kinds());
        for instance in &config.providers {
            if let Err(e) = providers.add_instance(instance.clone()) {
                tracing::warn!(instance = %instance.instance_id, error = %e, "provider instance skipped");
            }
        }
        for primary in [&config.primary_llm, &config.primary_tts].into_iter().flatten() {
            if let Err(e) = providers.set_primary(primary) {
                tracing::warn!(instance = %primary, error = %e, "primary not applied");
            }
        }

        let tools = Arc::new(
            ToolRegistry::new(config.tool_timeout()).with_store(store.clone() as Arc<dyn ToolStore>),
        );
        tools::builtin::register_builtin_tools(&tools)?;

        let sessions = Arc::new(SessionManager::new(store));
        let commands = Arc::new(CommandRegistry::new());
        register_builtin_commands(&commands, sessions.clone(), tools.clone())?;

        let servers = match mcp_client::load_server_configs(&config.mcp_servers_file) {
            Ok(servers) => servers,
            Err(e) => {
                tracing::warn!(path = %config.mcp_servers_file.display(), error = %e, "MCP server list ignored");
                Vec::new()
            }
        };
        let mcp = Arc::new(McpClient::new(tools.clone(), servers));

        let plugins = Arc::new(PluginManager::new(PluginServices {
            tools: tools.clone(),
            commands: commands.clone(),
            providers: providers.clone(),
            config_dir: config.plugin_config_dir.clone(),
            data_dir: config.plugin_data_dir.clone(),
        }));

        let handler = Arc::new(
            Handler::new(
                config.handler_config(),
                providers.clone(),
                tools.clone(),
                sessions.clone(),
                commands.clone(),
            )
            .with_plugins(plugins.clone()),
        );
        let pipeline = Arc::new(Pipeline::standard(handler.clone()));

        Ok(Self {
            config,
            providers,
            tools,
            sessions,
            commands,
            mcp,
            plugins,
            handler,
            pipeline,
        })
    }

    /// Connect providers and auto-start MCP servers, then discover and
    /// activate plugins. Failures are logged per component.
    ///
    /// Register plugin factories on [`plugins`](Self::plugins) before calling.
    pub async fn start(&self) {
        self.providers.initialize_all().await;

        for (server, e) in self.mcp.connect_all_auto().await {
            tracing::warn!(server = %server, error = %e, "MCP server failed to start (non-fatal)");
        }

        match self.plugins.discover(&self.config.plugins_dir) {
            Ok(found) => tracing::info!(plugins = found.len(), "plugins discovered"),
            Err(e) => tracing::warn!(error = %e, "plugin discovery failed"),
        }
        for (plugin, e) in self.plugins.activate_all().await {
            tracing::warn!(plugin = %plugin, error = %e, "plugin failed to activate");
        }

        tracing::info!(
            tools = self.tools.len(),
            commands = self.commands.list().len(),
            "agent core started"
        );
    }

    /// Attach a client: bind its session, announce commands, and keep the
    /// announcement current while the channel lives.
    pub fn connect(&self, channel: ClientChannel) -> Result<Connection, CoreError> {
        self.handler.on_connect(&channel)?;

        let watcher = {
            let mut revisions = self.commands.subscribe();
            let handler = self.handler.clone();
            let channel = channel.clone();
            tokio::spawn(async move {
                while revisions.changed().await.is_ok() {
                    if !channel.send(handler.commands_register_message()) {
                        break;
                    }
                }
            })
        };

        let (turns, mut queue) = mpsc::unbounded_channel::<InboundMessage>();
        let worker = {
            let pipeline = self.pipeline.clone();
            let channel = channel.clone();
            tokio::spawn(async move {
                while let Some(message) = queue.recv().await {
                    run_message(&pipeline, channel.clone(), message).await;
                }
            })
        };

        Ok(Connection {
            channel,
            turns,
            worker,
            watcher,
        })
    }

    /// Route one raw JSON frame from the client.
    ///
    /// A frame that does not parse still gets a reply.
    pub fn handle_raw(&self, connection: &Connection, raw: &str) {
        match InboundMessage::parse(raw) {
            Ok(message) => self.handle(connection, message),
            Err(e) => {
                tracing::warn!(channel = %connection.channel.id(), error = %e, "unparseable frame");
                connection.channel.send(OutboundMessage::new(
                    OutboundKind::Dialogue,
                    Some(format!("Sorry, something went wrong: {e}")),
                    serde_json::Value::Null,
                ));
            }
        }
    }

    pub fn handle(&self, connection: &Connection, message: InboundMessage) {
        if is_turn(message.kind) {
            if connection.turns.send(message).is_err() {
                tracing::warn!(channel = %connection.channel.id(), "turn dropped after disconnect");
            }
            return;
        }
        let pipeline = self.pipeline.clone();
        let channel = connection.channel.clone();
        tokio::spawn(async move { run_message(&pipeline, channel, message).await });
    }

    /// Detach a client. Anything it was waiting on settles now; a turn
    /// already running finishes against the closed channel.
    pub async fn disconnect(&self, connection: Connection) {
        let Connection {
            channel,
            turns,
            worker,
            watcher,
        } = connection;
        watcher.abort();
        drop(turns);
        self.handler.on_disconnect(channel.id());
        if let Err(e) = worker.await {
            tracing::warn!(channel = %channel.id(), error = %e, "turn worker ended abnormally");
        }
    }

    /// Deactivate plugins, stop MCP servers and dispose providers.
    pub async fn shutdown(&self) {
        self.plugins.shutdown().await;
        self.mcp.shutdown_all().await;
        self.providers.shutdown().await;
        tracing::info!("agent core stopped");
    }
}
