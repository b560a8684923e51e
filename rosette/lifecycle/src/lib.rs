#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Node lifecycle runtime for rosette.
//!
//! A [`Node`] supplies three hooks. A [`NodeRuntime`] drives those hooks
//! through `Created -> Starting -> Running -> Stopping -> Stopped`, spawns
//! the run loop on tokio with a per-node cancellation token, and releases
//! whatever the node acquired through its [`NodeContext`] when it stops.

/// Service bundle and per-node context.
pub mod context;
/// The node trait.
pub mod node;
/// State machine driver.
pub mod runtime;
/// Lifecycle states and status snapshots.
pub mod state;

pub use context::{NodeContext, Services};
pub use node::Node;
pub use runtime::{LifecycleError, NodeRuntime, DEFAULT_STOP_TIMEOUT};
pub use state::{NodeState, NodeStatus};
pub use tokio_util::sync::CancellationToken;
