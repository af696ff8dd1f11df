//! Message orchestration for Murmur: per-thread locking, intent
//! classification, capability dispatch, attachment ingestion, and the
//! guarantee that every inbound message gets exactly one response.

mod attachments;
mod progress;

pub mod handlers;
pub mod inbound;
pub mod orchestrator;
pub mod response;

#[cfg(test)]
pub(crate) mod test_support;

pub use handlers::{
    CapabilityHandler, CapabilityReply, ImageEditCapability, ImageGenCapability, TextCapability,
    TurnContext, VisionCapability,
};
pub use inbound::InboundMessage;
pub use orchestrator::{default_handlers, MessageOrchestrator, OrchestratorConfig};
pub use response::{user_facing_ai_error, Response, ResponseKind};
