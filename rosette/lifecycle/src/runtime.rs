use std::{any::Any, fmt, future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::json;
use shared_logging::{DiagnosticSinkExt, LogLevel};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    context::{NodeContext, Services},
    node::Node,
    state::{NodeState, NodeStatus},
};

const SOURCE: &str = "lifecycle";

/// How long `stop` waits for a run loop by default.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors reported by lifecycle transitions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LifecycleError {
    /// Another transition is in progress.
    #[error("node `{node}` cannot move from {from} to {to}")]
    InvalidTransition {
        /// Node name.
        node: String,
        /// State observed.
        from: NodeState,
        /// State requested.
        to: NodeState,
    },
    /// `on_start` failed; the node is `Stopped`.
    #[error("node `{node}` failed to start: {reason}")]
    StartFailed {
        /// Node name.
        node: String,
        /// Failure detail.
        reason: String,
    },
    /// `on_stop` failed; the node is `Stopped` regardless.
    #[error("node `{node}` failed to stop cleanly: {reason}")]
    StopFailed {
        /// Node name.
        node: String,
        /// Failure detail.
        reason: String,
    },
}

impl LifecycleError {
    /// Name of the node the error refers to.
    #[must_use]
    pub fn node(&self) -> &str {
        match self {
            Self::InvalidTransition { node, .. }
            | Self::StartFailed { node, .. }
            | Self::StopFailed { node, .. } => node,
        }
    }
}

struct Slot {
    state: NodeState,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
    started_at: Option<DateTime<Utc>>,
    /// Bumped on every successful start; a run loop only reports into the
    /// slot while its generation is current.
    generation: u64,
    run_finished: bool,
    last_error: Option<String>,
}

/// Everything a transition needs, cloneable into a spawned task.
#[derive(Clone)]
struct Driver {
    name: String,
    node: Arc<dyn Node>,
    context: NodeContext,
    stop_timeout: Duration,
    slot: Arc<Mutex<Slot>>,
}

/// Drives one [`Node`] through its lifecycle.
///
/// Transitions run on their own task once claimed, so dropping a `start`
/// or `stop` future midway still lets the node settle in `Running` or
/// `Stopped`.
pub struct NodeRuntime {
    driver: Driver,
}

impl fmt::Debug for NodeRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRuntime")
            .field("name", &self.driver.name)
            .field("state", &self.state())
            .field("stop_timeout", &self.driver.stop_timeout)
            .finish_non_exhaustive()
    }
}

impl NodeRuntime {
    /// Wraps `node` in state `Created`.
    #[must_use]
    pub fn new(node: Arc<dyn Node>, services: Services) -> Self {
        let name = node.name().to_string();
        Self {
            driver: Driver {
                context: NodeContext::new(&name, services),
                name,
                node,
                stop_timeout: DEFAULT_STOP_TIMEOUT,
                slot: Arc::new(Mutex::new(Slot {
                    state: NodeState::Created,
                    cancel: None,
                    task: None,
                    started_at: None,
                    generation: 0,
                    run_finished: false,
                    last_error: None,
                })),
            },
        }
    }

    /// Overrides how long `stop` waits for the run loop.
    #[must_use]
    pub const fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.driver.stop_timeout = timeout;
        self
    }

    /// Node name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.driver.name
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> NodeState {
        self.driver.slot.lock().state
    }

    /// The node's service context.
    #[must_use]
    pub const fn context(&self) -> &NodeContext {
        &self.driver.context
    }

    /// Snapshot of state and failure bookkeeping.
    #[must_use]
    pub fn status(&self) -> NodeStatus {
        let slot = self.driver.slot.lock();
        NodeStatus {
            name: self.driver.name.clone(),
            state: slot.state,
            started_at: slot.started_at,
            run_finished: slot.run_finished,
            last_error: slot.last_error.clone(),
        }
    }

    /// Runs `on_start` and spawns the run loop.
    ///
    /// A no-op when already `Running`. When `on_start` fails the node ends
    /// `Stopped`, everything it acquired is released, and `on_stop` is not
    /// called.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        let driver = &self.driver;
        {
            let mut slot = driver.slot.lock();
            let current = slot.state;
            match current {
                NodeState::Running => {
                    drop(slot);
                    debug!(node = %driver.name, "start ignored, already running");
                    driver.report(LogLevel::Debug, "node.start.ignored", json!({}));
                    return Ok(());
                }
                state if state.can_start() => slot.state = NodeState::Starting,
                from => {
                    return Err(LifecycleError::InvalidTransition {
                        node: driver.name.clone(),
                        from,
                        to: NodeState::Running,
                    });
                }
            }
        }

        let transition = tokio::spawn(driver.clone().finish_start());
        transition.await.unwrap_or_else(|err| {
            Err(LifecycleError::StartFailed {
                node: driver.name.clone(),
                reason: format!("start task failed: {err}"),
            })
        })
    }

    /// Cancels the run loop, waits up to the stop timeout, then runs
    /// `on_stop` and releases acquired resources.
    ///
    /// A no-op unless `Running`. A loop that ignores cancellation is
    /// detached, not aborted.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        let driver = &self.driver;
        let (cancel, task) = {
            let mut slot = driver.slot.lock();
            if slot.state != NodeState::Running {
                debug!(node = %driver.name, state = %slot.state, "stop ignored, not running");
                return Ok(());
            }
            slot.state = NodeState::Stopping;
            (slot.cancel.take(), slot.task.take())
        };

        let transition = tokio::spawn(driver.clone().finish_stop(cancel, task));
        transition.await.unwrap_or_else(|err| {
            Err(LifecycleError::StopFailed {
                node: driver.name.clone(),
                reason: format!("stop task failed: {err}"),
            })
        })
    }
}

impl Driver {
    /// `Starting` onwards.
    async fn finish_start(self) -> Result<(), LifecycleError> {
        if let Err(reason) = guarded(self.node.on_start(&self.context)).await {
            let released = self.context.release();
            {
                let mut slot = self.slot.lock();
                slot.state = NodeState::Stopped;
                slot.last_error = Some(reason.clone());
            }
            warn!(node = %self.name, %reason, "on_start failed");
            self.report(
                LogLevel::Error,
                "node.start.failed",
                json!({ "reason": reason, "released": released }),
            );
            return Err(LifecycleError::StartFailed {
                node: self.name.clone(),
                reason,
            });
        }

        let cancel = CancellationToken::new();
        let generation = {
            let mut slot = self.slot.lock();
            slot.generation += 1;
            slot.run_finished = false;
            slot.last_error = None;
            slot.generation
        };
        let task = self.spawn_run(cancel.clone(), generation);
        {
            let mut slot = self.slot.lock();
            slot.state = NodeState::Running;
            slot.cancel = Some(cancel);
            slot.task = Some(task);
            slot.started_at = Some(Utc::now());
        }
        info!(node = %self.name, generation, "node running");
        self.report(LogLevel::Info, "node.started", json!({ "generation": generation }));
        Ok(())
    }

    /// `Stopping` onwards.
    async fn finish_stop(
        self,
        cancel: Option<CancellationToken>,
        task: Option<JoinHandle<()>>,
    ) -> Result<(), LifecycleError> {
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(task) = task {
            match tokio::time::timeout(self.stop_timeout, task).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(node = %self.name, %err, "run task ended abnormally"),
                Err(_) => {
                    warn!(node = %self.name, timeout = ?self.stop_timeout, "run loop ignored cancellation, detaching");
                    let timeout_ms = u64::try_from(self.stop_timeout.as_millis()).unwrap_or(u64::MAX);
                    self.report(
                        LogLevel::Warn,
                        "node.stop.timeout",
                        json!({ "timeout_ms": timeout_ms }),
                    );
                }
            }
        }

        let teardown = guarded(self.node.on_stop(&self.context)).await;
        let released = self.context.release();
        {
            let mut slot = self.slot.lock();
            slot.state = NodeState::Stopped;
            if let Err(reason) = &teardown {
                slot.last_error = Some(reason.clone());
            }
        }

        match teardown {
            Ok(()) => {
                info!(node = %self.name, released, "node stopped");
                self.report(LogLevel::Info, "node.stopped", json!({ "released": released }));
                Ok(())
            }
            Err(reason) => {
                warn!(node = %self.name, %reason, "on_stop failed");
                self.report(
                    LogLevel::Error,
                    "node.stop.failed",
                    json!({ "reason": reason, "released": released }),
                );
                Err(LifecycleError::StopFailed {
                    node: self.name.clone(),
                    reason,
                })
            }
        }
    }

    fn spawn_run(&self, cancel: CancellationToken, generation: u64) -> JoinHandle<()> {
        let node = Arc::clone(&self.node);
        let ctx = self.context.clone();
        let slot = Arc::clone(&self.slot);
        let diagnostics = Arc::clone(&self.context.services().diagnostics);
        let name = self.name.clone();
        tokio::spawn(async move {
            let outcome = guarded(node.run(ctx, cancel.clone())).await;
            let cancelled = cancel.is_cancelled();
            let current = {
                let mut slot = slot.lock();
                let current = slot.generation == generation;
                if current {
                    slot.run_finished = true;
                    if let Err(reason) = &outcome {
                        slot.last_error = Some(reason.clone());
                    }
                }
                current
            };
            match outcome {
                Err(reason) => {
                    warn!(node = %name, generation, current, %reason, "run loop failed");
                    diagnostics.record(
                        SOURCE,
                        LogLevel::Error,
                        "node.run.failed",
                        json!({ "node": name, "reason": reason, "generation": generation }),
                    );
                }
                Ok(()) if !cancelled => {
                    debug!(node = %name, generation, "run loop returned before stop");
                    diagnostics.record(
                        SOURCE,
                        LogLevel::Info,
                        "node.run.exited",
                        json!({ "node": name, "generation": generation }),
                    );
                }
                Ok(()) => {}
            }
        })
    }

    fn report(&self, level: LogLevel, message: &str, mut metadata: serde_json::Value) {
        if let Some(map) = metadata.as_object_mut() {
            map.insert("node".into(), json!(self.name));
        }
        self.context
            .services()
            .diagnostics
            .record(SOURCE, level, message, metadata);
    }
}

/// Awaits a hook, turning errors and panics into a reason string.
async fn guarded<F>(hook: F) -> Result<(), String>
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(hook).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(format!("{err:#}")),
        Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
