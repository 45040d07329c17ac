//! Traits implemented by plugins.

use async_trait::async_trait;

use super::context::PluginContext;
use crate::pipeline::MessageContext;

/// A statically linked plugin.
///
/// `initialize` receives the plugin's scoped context; keep a clone of it to
/// use providers, config or logging later.
#[async_trait]
pub trait Plugin: Send + Sync {
    async fn initialize(&self, ctx: PluginContext) -> anyhow::Result<()>;

    async fn terminate(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handler plugins return their hooks here.
    fn handler_hooks(&self) -> Option<&dyn HandlerHooks> {
        None
    }
}

/// Message hooks run before the default handler.
///
/// Each returns `true` when it fully handled the message, which skips the
/// default logic and every later plugin. Replies go through `ctx`.
#[async_trait]
pub trait HandlerHooks: Send + Sync {
    async fn on_user_input(&self, _ctx: &mut MessageContext) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn on_tap_event(&self, _ctx: &mut MessageContext) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn on_file_upload(&self, _ctx: &mut MessageContext) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn on_plugin_message(&self, _ctx: &mut MessageContext) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn on_command(&self, _ctx: &mut MessageContext) -> anyhow::Result<bool> {
        Ok(false)
    }
}
