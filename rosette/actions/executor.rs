use std::{any::Any, fmt, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::Utc;
use futures::FutureExt;
use indexmap::{map::Entry, IndexMap};
use parking_lot::Mutex;
use serde_json::{json, Value};
use shared_logging::{DiagnosticSinkExt, LogLevel, NullSink, SharedSink};
use thiserror::Error;
use tokio::{
    runtime::Handle,
    sync::{oneshot, OwnedSemaphorePermit, Semaphore},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    goals::{GoalId, GoalInfo, GoalOutcome, GoalStatus},
    handler::{ActionHandler, FeedbackCallback, FeedbackPublisher, GoalContext, GoalResponse},
};

const SOURCE: &str = "action_executor";

/// How long terminal statuses stay queryable by default.
pub const DEFAULT_COMPLETED_RETENTION: Duration = Duration::from_secs(30);

/// Errors surfaced to goal submitters and action registrants.
#[derive(Debug, Error)]
pub enum ActionError {
    /// No handler is registered under the requested name.
    #[error("no handler registered for action `{0}`")]
    UnknownAction(String),
    /// A handler already owns the name.
    #[error("action `{0}` is already registered")]
    AlreadyRegistered(String),
    /// The handler refused the goal before dispatch.
    #[error("goal {goal_id} rejected: {reason}")]
    GoalRejected {
        /// Identifier recorded with status `Rejected`.
        goal_id: GoalId,
        /// Reason given by the handler.
        reason: String,
    },
    /// Executor could not run or track the goal.
    #[error("action executor failure: {0}")]
    Infrastructure(String),
}

/// Tunables for [`ActionExecutor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// How long a terminal status remains visible to `get_goal_status`.
    pub completed_retention: Duration,
    /// Maximum number of simultaneously active goals; `None` is unbounded.
    pub max_concurrent_goals: Option<usize>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            completed_retention: DEFAULT_COMPLETED_RETENTION,
            max_concurrent_goals: None,
        }
    }
}

struct GoalEntry {
    info: GoalInfo,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Registry {
    handlers: IndexMap<String, Arc<dyn ActionHandler>>,
    active: IndexMap<GoalId, GoalEntry>,
    completed: IndexMap<GoalId, (GoalStatus, Instant)>,
}

impl Registry {
    fn prune(&mut self, retention: Duration) {
        self.completed
            .retain(|_, (_, finished)| finished.elapsed() <= retention);
    }

    fn remember(&mut self, goal_id: GoalId, status: GoalStatus, retention: Duration) {
        self.prune(retention);
        self.completed.insert(goal_id, (status, Instant::now()));
    }
}

/// Builder used to configure an [`ActionExecutor`].
#[derive(Default)]
pub struct ActionExecutorBuilder {
    config: ExecutorConfig,
    diagnostics: Option<SharedSink>,
}

impl ActionExecutorBuilder {
    /// Overrides the completed-goal retention period.
    #[must_use]
    pub const fn completed_retention(mut self, retention: Duration) -> Self {
        self.config.completed_retention = retention;
        self
    }

    /// Limits how many goals run at once.
    #[must_use]
    pub const fn max_concurrent_goals(mut self, limit: usize) -> Self {
        self.config.max_concurrent_goals = Some(limit);
        self
    }

    /// Attaches a diagnostics sink.
    #[must_use]
    pub fn diagnostics(mut self, sink: SharedSink) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    /// Finalizes the builder.
    #[must_use]
    pub fn build(self) -> ActionExecutor {
        ActionExecutor::new(
            self.config,
            self.diagnostics.unwrap_or_else(|| Arc::new(NullSink)),
        )
    }
}

/// Goal-scoped task manager with cancellation and progress feedback.
///
/// Registry and goal bookkeeping sit behind one internal lock. Handler
/// bodies run on their own tokio tasks, outside that lock, so `send_goal`
/// never blocks the caller on handler work.
#[derive(Clone)]
pub struct ActionExecutor {
    registry: Arc<Mutex<Registry>>,
    config: ExecutorConfig,
    permits: Option<Arc<Semaphore>>,
    diagnostics: SharedSink,
}

impl fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("ActionExecutor")
            .field("config", &self.config)
            .field("actions", &registry.handlers.keys().collect::<Vec<_>>())
            .field("active_goals", &registry.active.len())
            .finish_non_exhaustive()
    }
}

impl Default for ActionExecutor {
    fn default() -> Self {
        Self::new(ExecutorConfig::default(), Arc::new(NullSink))
    }
}

impl ActionExecutor {
    /// Creates an executor with the given configuration.
    #[must_use]
    pub fn new(config: ExecutorConfig, diagnostics: SharedSink) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            config,
            permits: config
                .max_concurrent_goals
                .map(|limit| Arc::new(Semaphore::new(limit.max(1)))),
            diagnostics,
        }
    }

    /// Returns a builder.
    #[must_use]
    pub fn builder() -> ActionExecutorBuilder {
        ActionExecutorBuilder::default()
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> ExecutorConfig {
        self.config
    }

    /// Registers `handler` under `name`. An existing registration is kept.
    pub fn register_action(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn ActionHandler>,
    ) -> Result<(), ActionError> {
        let name = name.into();
        match self.registry.lock().handlers.entry(name.clone()) {
            Entry::Occupied(_) => {
                warn!(action = %name, "duplicate action registration refused");
                return Err(ActionError::AlreadyRegistered(name));
            }
            Entry::Vacant(slot) => {
                slot.insert(handler);
            }
        }
        self.diagnostics.record(
            SOURCE,
            LogLevel::Info,
            "action.registered",
            json!({ "action": name }),
        );
        Ok(())
    }

    /// Removes a handler. Goals already running keep executing.
    pub fn unregister_action(&self, name: &str) -> bool {
        let removed = self.registry.lock().handlers.shift_remove(name).is_some();
        if removed {
            self.diagnostics.record(
                SOURCE,
                LogLevel::Info,
                "action.unregistered",
                json!({ "action": name }),
            );
        }
        removed
    }

    /// Names of registered actions, in registration order.
    #[must_use]
    pub fn registered_actions(&self) -> Vec<String> {
        self.registry.lock().handlers.keys().cloned().collect()
    }

    /// Submits a goal and returns immediately.
    ///
    /// Must be called from within a tokio runtime. The goal is `Active` on
    /// return unless a concurrency limit holds it `Pending`.
    pub fn send_goal(
        &self,
        action: &str,
        goal: Value,
        feedback: Option<FeedbackCallback>,
    ) -> Result<GoalHandle, ActionError> {
        let runtime =
            Handle::try_current().map_err(|err| ActionError::Infrastructure(err.to_string()))?;
        let handler = self
            .registry
            .lock()
            .handlers
            .get(action)
            .cloned()
            .ok_or_else(|| ActionError::UnknownAction(action.to_string()))?;

        let goal_id = GoalId::new();
        if let GoalResponse::Reject(reason) = handler.accept(&goal) {
            self.registry
                .lock()
                .remember(goal_id, GoalStatus::Rejected, self.config.completed_retention);
            self.diagnostics.record(
                SOURCE,
                LogLevel::Warn,
                "action.goal.rejected",
                json!({ "action": action, "goal_id": goal_id, "reason": reason }),
            );
            return Err(ActionError::GoalRejected { goal_id, reason });
        }

        let (status, permit) = match &self.permits {
            None => (GoalStatus::Active, None),
            Some(permits) => match Arc::clone(permits).try_acquire_owned() {
                Ok(permit) => (GoalStatus::Active, Some(permit)),
                Err(_) => (GoalStatus::Pending, None),
            },
        };

        let cancel = CancellationToken::new();
        let info = GoalInfo {
            goal_id,
            action: action.to_string(),
            status,
            submitted_at: Utc::now(),
        };
        self.registry.lock().active.insert(
            goal_id,
            GoalEntry {
                info,
                cancel: cancel.clone(),
            },
        );
        debug!(%goal_id, action, %status, "goal submitted");
        self.diagnostics.record(
            SOURCE,
            LogLevel::Debug,
            "action.goal.submitted",
            json!({ "action": action, "goal_id": goal_id, "status": status }),
        );

        let ctx = GoalContext {
            goal_id,
            action: action.to_string(),
            goal,
            feedback: FeedbackPublisher::new(goal_id, feedback),
            cancel,
        };
        let (tx, rx) = oneshot::channel();
        let executor = self.clone();
        runtime.spawn(async move {
            executor.drive(handler, ctx, permit, tx).await;
        });

        Ok(GoalHandle {
            goal_id,
            outcome: rx,
        })
    }

    /// Requests cancellation. Returns false when the goal is not active.
    pub fn cancel_goal(&self, goal_id: GoalId) -> bool {
        let registry = self.registry.lock();
        if let Some(entry) = registry.active.get(&goal_id) {
            entry.cancel.cancel();
            debug!(%goal_id, "goal cancellation requested");
            true
        } else {
            false
        }
    }

    /// Cancels every active goal, returning how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let registry = self.registry.lock();
        for entry in registry.active.values() {
            entry.cancel.cancel();
        }
        registry.active.len()
    }

    /// Current status of an active goal, or the retained terminal status of
    /// a recently finished one.
    #[must_use]
    pub fn get_goal_status(&self, goal_id: GoalId) -> Option<GoalStatus> {
        let mut registry = self.registry.lock();
        if let Some(entry) = registry.active.get(&goal_id) {
            return Some(entry.info.status);
        }
        registry.prune(self.config.completed_retention);
        registry.completed.get(&goal_id).map(|(status, _)| *status)
    }

    /// Snapshot of pending and active goals in submission order.
    #[must_use]
    pub fn get_active_goals(&self) -> Vec<GoalInfo> {
        self.registry
            .lock()
            .active
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }

    async fn drive(
        self,
        handler: Arc<dyn ActionHandler>,
        ctx: GoalContext,
        permit: Option<OwnedSemaphorePermit>,
        tx: oneshot::Sender<GoalOutcome>,
    ) {
        let _permit = match (permit, &self.permits) {
            (Some(permit), _) => Some(permit),
            (None, None) => None,
            (None, Some(permits)) => {
                let acquired = tokio::select! {
                    biased;
                    () = ctx.cancel.cancelled() => None,
                    acquired = Arc::clone(permits).acquire_owned() => Some(acquired),
                };
                match acquired {
                    Some(Ok(permit)) if self.activate(&ctx) => Some(permit),
                    Some(Err(err)) => {
                        let message = Some(err.to_string());
                        self.finish(&ctx, |_| (GoalStatus::Aborted, None, message), tx);
                        return;
                    }
                    None | Some(Ok(_)) => {
                        let message = Some("cancelled before dispatch".to_string());
                        self.finish(&ctx, |_| (GoalStatus::Recalled, None, message), tx);
                        return;
                    }
                }
            }
        };

        let outcome = AssertUnwindSafe(handler.execute(ctx.clone()))
            .catch_unwind()
            .await;
        self.finish(
            &ctx,
            move |cancelled| match outcome {
                Ok(Ok(value)) if !cancelled => (GoalStatus::Succeeded, Some(value), None),
                Ok(Ok(value)) => (
                    GoalStatus::Preempted,
                    Some(value),
                    Some("cancellation requested".to_string()),
                ),
                Ok(Err(err)) if !cancelled => {
                    (GoalStatus::Aborted, None, Some(format!("{err:#}")))
                }
                Err(payload) if !cancelled => (
                    GoalStatus::Aborted,
                    None,
                    Some(format!("handler panicked: {}", panic_message(payload.as_ref()))),
                ),
                _ => (
                    GoalStatus::Preempted,
                    None,
                    Some("cancellation requested".to_string()),
                ),
            },
            tx,
        );
    }

    /// Moves a pending goal to `Active` unless it was cancelled meanwhile.
    fn activate(&self, ctx: &GoalContext) -> bool {
        let mut registry = self.registry.lock();
        if ctx.is_cancelled() {
            return false;
        }
        if let Some(entry) = registry.active.get_mut(&ctx.goal_id) {
            entry.info.status = GoalStatus::Active;
        }
        true
    }

    /// Retires the goal. `decide` sees the cancellation flag under the same
    /// lock `cancel_goal` takes, so an acknowledged cancel is never lost.
    fn finish<D>(&self, ctx: &GoalContext, decide: D, tx: oneshot::Sender<GoalOutcome>)
    where
        D: FnOnce(bool) -> Verdict,
    {
        let (status, result, message) = {
            let mut registry = self.registry.lock();
            let verdict = decide(ctx.is_cancelled());
            registry.active.shift_remove(&ctx.goal_id);
            registry.remember(ctx.goal_id, verdict.0, self.config.completed_retention);
            verdict
        };

        let level = if status == GoalStatus::Aborted {
            LogLevel::Warn
        } else {
            LogLevel::Info
        };
        self.diagnostics.record(
            SOURCE,
            level,
            "action.goal.finished",
            json!({
                "action": ctx.action,
                "goal_id": ctx.goal_id,
                "status": status,
                "message": message,
                "feedback_count": ctx.feedback.emitted(),
            }),
        );
        debug!(goal_id = %ctx.goal_id, action = %ctx.action, %status, "goal finished");

        let outcome = GoalOutcome {
            goal_id: ctx.goal_id,
            action: ctx.action.clone(),
            status,
            result,
            message,
            finished_at: Utc::now(),
        };
        if tx.send(outcome).is_err() {
            debug!(goal_id = %ctx.goal_id, "goal handle dropped before completion");
        }
    }
}

/// Terminal status, result and message of a goal.
type Verdict = (GoalStatus, Option<Value>, Option<String>);

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Returned by [`ActionExecutor::send_goal`]; resolves to the terminal
/// outcome of the goal.
#[derive(Debug)]
pub struct GoalHandle {
    goal_id: GoalId,
    outcome: oneshot::Receiver<GoalOutcome>,
}

impl GoalHandle {
    /// Identifier of the submitted goal.
    #[must_use]
    pub const fn id(&self) -> GoalId {
        self.goal_id
    }

    /// Waits for the goal to reach a terminal status.
    pub async fn outcome(self) -> Result<GoalOutcome, ActionError> {
        let goal_id = self.goal_id;
        self.outcome.await.map_err(|_| {
            ActionError::Infrastructure(format!("goal {goal_id} dropped without an outcome"))
        })
    }
}
