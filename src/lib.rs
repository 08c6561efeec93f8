//! Tether: session-scoped orchestration for conversations with a remote agent.
//!
//! Four pieces make up the core:
//! - [`session`]: session identity, TTL eviction and durable snapshots
//! - [`router`]: per-session FIFO admission with a concurrency cap and rate limit
//! - [`conversation`]: lifecycle state machine, bounded history, summarization
//! - [`client`]: upstream calls, including a resilient event-stream consumer
//!
//! [`orchestrator::Orchestrator`] ties them together.
//!
//! # Quick Start
//!
//! ```no_run
//! use tether::prelude::*;
//!
//! # async fn example() -> tether::error::Result<()> {
//! let orchestrator = Orchestrator::from_config(TetherConfig::from_env()?)?;
//! orchestrator.start().await?;
//!
//! let session = orchestrator
//!     .create_session("w1", "a1", SessionOptions::default())
//!     .await?;
//! let reply = orchestrator.send_message(&session.id, "hi").await?;
//! println!("{}", reply.content);
//!
//! orchestrator.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod conversation;
pub mod error;
pub mod orchestrator;
pub mod prelude;
pub mod router;
pub mod session;
pub mod types;
pub mod util;
