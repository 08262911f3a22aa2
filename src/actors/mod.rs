//! Actor-based connector runtime
//!
//! Each actor runs as an independent async task and is driven through a
//! handle sending commands over an mpsc channel.
//!
//! ```text
//!   bus messages ──► ConnectorHandle ──► ConnectorActor ──► MessagePipeline
//!                                                              │
//!                                          ┌───────────────────┴─────┐
//!                                          ▼                         ▼
//!                                   PoolManager              ThresholdEvaluator
//!                                          │
//!                          ┌───────────────┴──────────────┐
//!                          ▼                              ▼
//!                 WorkerHandle × N (rrdcached)   WorkerHandle × 1 (direct)
//!                          │                              │
//!                    rrdtool - (stdin/stdout)      rrdtool - (stdin/stdout)
//! ```
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: each actor has an mpsc command channel
//! 2. **Request/Response**: oneshot channels carry the replies
//!
//! The worker actors live in [`crate::storage::worker`].

pub mod connector;
pub mod messages;

pub use connector::{ConnectorActor, ConnectorHandle};
pub use messages::ConnectorCommand;
