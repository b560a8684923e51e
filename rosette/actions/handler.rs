use std::{
    fmt,
    future::Future,
    marker::PhantomData,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::goals::GoalId;

/// Callback receiving feedback for one goal, in emission order.
pub type FeedbackCallback = Arc<dyn Fn(GoalId, &Value) + Send + Sync>;

/// Decision taken by [`ActionHandler::accept`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GoalResponse {
    /// Dispatch the goal.
    Accept,
    /// Refuse the goal with a reason.
    Reject(String),
}

/// Emits progress updates for a running goal.
#[derive(Clone)]
pub struct FeedbackPublisher {
    goal_id: GoalId,
    callback: Option<FeedbackCallback>,
    emitted: Arc<AtomicU64>,
}

impl fmt::Debug for FeedbackPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedbackPublisher")
            .field("goal_id", &self.goal_id)
            .field("emitted", &self.emitted())
            .finish_non_exhaustive()
    }
}

impl FeedbackPublisher {
    pub(crate) fn new(goal_id: GoalId, callback: Option<FeedbackCallback>) -> Self {
        Self {
            goal_id,
            callback,
            emitted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Delivers one feedback value to the submitter, synchronously.
    pub fn publish(&self, feedback: Value) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
        if let Some(callback) = &self.callback {
            callback(self.goal_id, &feedback);
        }
    }

    /// Number of feedback values emitted so far.
    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }
}

/// Everything a handler receives for one goal.
#[derive(Debug, Clone)]
pub struct GoalContext {
    /// Goal identifier.
    pub goal_id: GoalId,
    /// Action name the goal was sent to.
    pub action: String,
    /// Goal payload.
    pub goal: Value,
    /// Feedback channel back to the submitter.
    pub feedback: FeedbackPublisher,
    /// Cooperative cancellation signal.
    pub cancel: CancellationToken,
}

impl GoalContext {
    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation is requested.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Shorthand for `self.feedback.publish(..)`.
    pub fn publish_feedback(&self, feedback: Value) {
        self.feedback.publish(feedback);
    }
}

/// Body of a registered action.
///
/// `execute` runs on its own task, outside the executor's lock. It should
/// check [`GoalContext::is_cancelled`] at every suspension point and return
/// promptly once cancellation is requested.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Validates a goal before it is dispatched.
    fn accept(&self, _goal: &Value) -> GoalResponse {
        GoalResponse::Accept
    }

    /// Executes the goal and returns its result.
    async fn execute(&self, ctx: GoalContext) -> anyhow::Result<Value>;
}

/// Adapter turning an async closure into an [`ActionHandler`].
pub struct FnHandler<F, Fut> {
    body: F,
    _marker: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F, Fut>
where
    F: Fn(GoalContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn execute(&self, ctx: GoalContext) -> anyhow::Result<Value> {
        (self.body)(ctx).await
    }
}

/// Wraps an async closure as a shareable handler.
pub fn action_fn<F, Fut>(body: F) -> Arc<dyn ActionHandler>
where
    F: Fn(GoalContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler {
        body,
        _marker: PhantomData,
    })
}
