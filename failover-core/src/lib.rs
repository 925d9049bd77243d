//! Resource ownership failover for two-node high-availability clusters
//!
//! The [`engine::FailoverEngine`] decides which node holds which resource
//! groups, negotiates standby hand-offs, fences dead peers and runs the
//! resource scripts. [`node::FailoverNode`] drives it from a tokio task.

pub mod abstractions;
pub mod audit;
pub mod config;
pub mod deferred_queue;
pub mod engine;
pub mod error;
pub mod fencing;
pub mod link;
pub mod message;
pub mod node;
pub mod process_tracker;
pub mod resource;
pub mod scripts;
pub mod standby;

// Test helpers are exposed for integration tests
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use config::FailoverConfig;
pub use engine::FailoverEngine;
pub use error::{FailoverError, FailoverResult};
pub use message::{ClusterMessage, Envelope};
pub use node::{FailoverNode, NodeHandle, StatusReport};
pub use resource::ResourceClass;
