//! DeskPet agent over stdio.
//!
//! Reads one JSON message per line from stdin and writes one JSON message
//! per line to stdout. The whole process is a single client channel.

use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use deskpet_agent::config::AppConfig;
use deskpet_agent::pipeline::ClientChannel;
use deskpet_agent::{data_dir, init_tracing, AgentCore};

const STDIO_CHANNEL: &str = "stdio";
const WRITER_DRAIN: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(&data_dir()).context("failed to initialize logging")?;

    let config_path = AppConfig::default_path();
    let config = AppConfig::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let core = AgentCore::new(config).context("failed to build agent core")?;
    core.start().await;

    let (channel, mut outbound) = ClientChannel::pair(STDIO_CHANNEL);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = outbound.recv().await {
            let mut line = match serde_json::to_string(&message) {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!(error = %e, "outbound message not serializable");
                    continue;
                }
            };
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                tracing::warn!("stdout closed");
                break;
            }
        }
    });

    let connection = core.connect(channel).context("failed to attach stdio channel")?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("failed to read stdin")? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => core.handle_raw(&connection, &line),
                None => {
                    tracing::info!("stdin closed");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        }
    }

    core.disconnect(connection).await;
    core.shutdown().await;
    // Drains once the last channel clone is gone.
    if tokio::time::timeout(WRITER_DRAIN, writer).await.is_err() {
        tracing::warn!("stdout writer did not drain");
    }
    Ok(())
}
