#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Goal-oriented action execution for rosette nodes.
//!
//! Actions are named, long-running handlers. A goal sent to an action runs
//! concurrently with its submitter, reports progress through feedback, and
//! can be cancelled cooperatively.

/// Goal identity, status, and outcome types.
#[path = "../goals.rs"]
pub mod goals;

/// Handler contract and per-goal context.
#[path = "../handler.rs"]
pub mod handler;

/// Registry, dispatch, and goal bookkeeping.
#[path = "../executor.rs"]
pub mod executor;

pub use executor::{
    ActionError, ActionExecutor, ActionExecutorBuilder, ExecutorConfig, GoalHandle,
    DEFAULT_COMPLETED_RETENTION,
};
pub use goals::{GoalId, GoalInfo, GoalOutcome, GoalStatus};
pub use handler::{
    action_fn, ActionHandler, FeedbackCallback, FeedbackPublisher, GoalContext, GoalResponse,
};
