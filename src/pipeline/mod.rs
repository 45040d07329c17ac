//! Message pipeline: every inbound message runs PreProcess → Process →
//! Respond inside its own [`MessageContext`].
//!
//! Submodules:
//! - `types`: inbound/outbound envelopes and the client channel
//! - `context`: per-message state and the two reply paths
//! - `stages`: the Stage contract and the standard stages
//! - `chain`: the ordered, editable stage list
//! - `errors`: pipeline error types

pub mod chain;
pub mod context;
pub mod errors;
pub mod stages;
pub mod types;

pub use chain::Pipeline;
pub use context::MessageContext;
pub use errors::PipelineError;
pub use stages::{Dispatcher, Stage, PRE_PROCESS, PROCESS, RESPOND};
pub use types::{
    ClientChannel, InboundKind, InboundMessage, OutboundKind, OutboundMessage, Priority,
};
