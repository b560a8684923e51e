#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! System supervisor: owns the node set and sequences startup/shutdown.
//!
//! Nodes start and stop in registration order. One node failing never
//! prevents the others from being started or stopped; failures are
//! collected into the returned report instead.

use std::{fmt, sync::Arc, time::Duration};

use indexmap::IndexMap;
use parking_lot::Mutex;
use rosette_lifecycle::{
    LifecycleError, Node, NodeRuntime, NodeState, NodeStatus, Services, DEFAULT_STOP_TIMEOUT,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::{DiagnosticSinkExt, LogLevel};
use thiserror::Error;
use tracing::{info, warn};

const SOURCE: &str = "supervisor";

/// Errors from node registration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SupervisorError {
    /// A node with the same name is already registered.
    #[error("node `{0}` is already registered")]
    DuplicateNode(String),
    /// No node with that name is registered.
    #[error("node `{0}` is not registered")]
    NodeNotFound(String),
}

/// Result of [`Supervisor::start_all`].
#[derive(Debug, Clone, Default)]
pub struct StartReport {
    /// Nodes that are running after the call, in registration order.
    pub started: Vec<String>,
    /// Nodes whose startup failed.
    pub failed: Vec<LifecycleError>,
}

impl StartReport {
    /// Whether every node started.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Result of [`Supervisor::stop_all`].
#[derive(Debug, Clone, Default)]
pub struct StopReport {
    /// Nodes stopped cleanly, in registration order.
    pub stopped: Vec<String>,
    /// Nodes whose teardown reported an error. They are stopped regardless.
    pub failed: Vec<LifecycleError>,
}

impl StopReport {
    /// Whether every node stopped cleanly.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Aggregate view returned by [`Supervisor::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatus {
    /// Nodes currently `Running`.
    pub running: usize,
    /// Registered nodes.
    pub total: usize,
    /// Topics with at least one subscriber.
    pub topics: Vec<String>,
    /// Per-node status in registration order.
    pub nodes: Vec<NodeStatus>,
    /// Goals pending or active on the executor.
    pub active_goals: usize,
}

/// Owns the registered nodes and the services they share.
pub struct Supervisor {
    services: Services,
    stop_timeout: Duration,
    nodes: Mutex<IndexMap<String, Arc<NodeRuntime>>>,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("nodes", &self.node_names())
            .field("stop_timeout", &self.stop_timeout)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Supervisor handing `services` to every node it manages.
    #[must_use]
    pub fn new(services: Services) -> Self {
        Self {
            services,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            nodes: Mutex::new(IndexMap::new()),
        }
    }

    /// Stop timeout applied to nodes added afterwards.
    #[must_use]
    pub const fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Shared services.
    #[must_use]
    pub const fn services(&self) -> &Services {
        &self.services
    }

    /// Registers a node. Names must be unique.
    pub fn add_node(&self, node: Arc<dyn Node>) -> Result<(), SupervisorError> {
        let name = node.name().to_string();
        let mut nodes = self.nodes.lock();
        if nodes.contains_key(&name) {
            return Err(SupervisorError::DuplicateNode(name));
        }
        let runtime = NodeRuntime::new(node, self.services.clone())
            .with_stop_timeout(self.stop_timeout);
        nodes.insert(name.clone(), Arc::new(runtime));
        drop(nodes);
        self.report(LogLevel::Debug, "supervisor.node.added", &name);
        Ok(())
    }

    /// Stops the node if it is running, then unregisters it.
    pub async fn remove_node(&self, name: &str) -> Result<NodeStatus, SupervisorError> {
        let runtime = self
            .nodes
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| SupervisorError::NodeNotFound(name.to_string()))?;
        if let Err(err) = runtime.stop().await {
            warn!(node = name, %err, "node stopped with errors during removal");
        }
        self.nodes.lock().shift_remove(name);
        self.report(LogLevel::Info, "supervisor.node.removed", name);
        Ok(runtime.status())
    }

    /// Starts every node in registration order.
    pub async fn start_all(&self) -> StartReport {
        let mut report = StartReport::default();
        for runtime in self.runtimes() {
            match runtime.start().await {
                Ok(()) => report.started.push(runtime.name().to_string()),
                Err(err) => {
                    warn!(node = runtime.name(), %err, "node failed to start");
                    report.failed.push(err);
                }
            }
        }
        info!(
            started = report.started.len(),
            failed = report.failed.len(),
            "start_all finished"
        );
        self.services.diagnostics.record(
            SOURCE,
            if report.is_clean() {
                LogLevel::Info
            } else {
                LogLevel::Warn
            },
            "supervisor.start_all",
            json!({
                "started": report.started,
                "failed": report.failed.iter().map(LifecycleError::node).collect::<Vec<_>>(),
            }),
        );
        report
    }

    /// Stops every running node in registration order.
    pub async fn stop_all(&self) -> StopReport {
        let mut report = StopReport::default();
        for runtime in self.runtimes() {
            if runtime.state() != NodeState::Running {
                continue;
            }
            match runtime.stop().await {
                Ok(()) => report.stopped.push(runtime.name().to_string()),
                Err(err) => {
                    warn!(node = runtime.name(), %err, "node failed to stop cleanly");
                    report.failed.push(err);
                }
            }
        }
        info!(
            stopped = report.stopped.len(),
            failed = report.failed.len(),
            "stop_all finished"
        );
        self.services.diagnostics.record(
            SOURCE,
            if report.is_clean() {
                LogLevel::Info
            } else {
                LogLevel::Warn
            },
            "supervisor.stop_all",
            json!({
                "stopped": report.stopped,
                "failed": report.failed.iter().map(LifecycleError::node).collect::<Vec<_>>(),
            }),
        );
        report
    }

    /// Running/total counts, active topics, and per-node state.
    #[must_use]
    pub fn status(&self) -> SystemStatus {
        let nodes: Vec<NodeStatus> = self.runtimes().iter().map(|rt| rt.status()).collect();
        SystemStatus {
            running: nodes
                .iter()
                .filter(|status| status.state == NodeState::Running)
                .count(),
            total: nodes.len(),
            topics: self.services.bus.list_topics(),
            nodes,
            active_goals: self.services.actions.get_active_goals().len(),
        }
    }

    /// Status of one node.
    #[must_use]
    pub fn node_status(&self, name: &str) -> Option<NodeStatus> {
        self.nodes.lock().get(name).map(|runtime| runtime.status())
    }

    /// Registered node names in registration order.
    #[must_use]
    pub fn node_names(&self) -> Vec<String> {
        self.nodes.lock().keys().cloned().collect()
    }

    fn runtimes(&self) -> Vec<Arc<NodeRuntime>> {
        self.nodes.lock().values().cloned().collect()
    }

    fn report(&self, level: LogLevel, message: &str, node: &str) {
        self.services
            .diagnostics
            .record(SOURCE, level, message, json!({ "node": node }));
    }
}
