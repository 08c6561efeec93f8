//! Core types shared across the crate.

pub mod message;
pub mod reply;

pub use message::{Message, Role};
pub use reply::AgentReply;
