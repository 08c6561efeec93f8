//! Convenience re-exports for common use.

pub use crate::client::{StreamEvent, StreamListener, StreamOptions, StreamingClient};
pub use crate::config::TetherConfig;
pub use crate::conversation::{Conversation, ConversationState, HistoryQuery};
pub use crate::error::{ErrorKind, Result, TetherError};
pub use crate::orchestrator::Orchestrator;
pub use crate::router::{MessageProcessor, MessageRouter, QueueStatus};
pub use crate::session::{Session, SessionOptions, SessionRegistry};
pub use crate::types::{AgentReply, Message, Role};
