use std::{fmt, sync::Arc};

use parking_lot::Mutex;
use rosette_actions::{ActionError, ActionExecutor, ActionHandler};
use rosette_params::ParameterStore;
use rosette_transforms::TransformGraph;
use serde_json::Value;
use shared_logging::{DiagnosticSinkExt, LogLevel, NullSink, SharedSink};
use shared_message_bus::{Message, MessageBus, PublishReport, SubscriptionId};

/// The shared infrastructure handed to every node.
///
/// Each service is a cheap clone around shared state, so a `Services`
/// value built once in `main` (or once per test) is the whole process-wide
/// environment. Nothing here is a global.
#[derive(Clone)]
pub struct Services {
    /// Publish/subscribe router.
    pub bus: MessageBus,
    /// Global key/value configuration.
    pub params: ParameterStore,
    /// Coordinate-frame buffer.
    pub transforms: TransformGraph,
    /// Goal executor.
    pub actions: ActionExecutor,
    /// Diagnostics destination.
    pub diagnostics: SharedSink,
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("bus", &self.bus)
            .field("params", &self.params)
            .field("transforms", &self.transforms)
            .field("actions", &self.actions)
            .finish_non_exhaustive()
    }
}

impl Default for Services {
    fn default() -> Self {
        Self::new(Arc::new(NullSink))
    }
}

impl Services {
    /// Fresh services with default settings, all reporting to `diagnostics`.
    #[must_use]
    pub fn new(diagnostics: SharedSink) -> Self {
        Self {
            bus: MessageBus::new(Arc::clone(&diagnostics)),
            params: ParameterStore::new(),
            transforms: TransformGraph::new(),
            actions: ActionExecutor::builder()
                .diagnostics(Arc::clone(&diagnostics))
                .build(),
            diagnostics,
        }
    }

    /// Replaces the transform graph.
    #[must_use]
    pub fn with_transforms(mut self, transforms: TransformGraph) -> Self {
        self.transforms = transforms;
        self
    }

    /// Replaces the action executor.
    #[must_use]
    pub fn with_actions(mut self, actions: ActionExecutor) -> Self {
        self.actions = actions;
        self
    }

    /// Replaces the parameter store.
    #[must_use]
    pub fn with_params(mut self, params: ParameterStore) -> Self {
        self.params = params;
        self
    }
}

#[derive(Default)]
struct Acquired {
    subscriptions: Vec<(String, SubscriptionId)>,
    actions: Vec<String>,
}

/// A node's view of [`Services`].
///
/// Subscriptions and action registrations made through the context are
/// tracked, and released by the runtime once the node stops.
#[derive(Clone)]
pub struct NodeContext {
    node: Arc<str>,
    services: Services,
    acquired: Arc<Mutex<Acquired>>,
}

impl fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let acquired = self.acquired.lock();
        f.debug_struct("NodeContext")
            .field("node", &self.node)
            .field("subscriptions", &acquired.subscriptions.len())
            .field("actions", &acquired.actions)
            .finish_non_exhaustive()
    }
}

impl NodeContext {
    /// Context for the node called `node`.
    #[must_use]
    pub fn new(node: &str, services: Services) -> Self {
        Self {
            node: Arc::from(node),
            services,
            acquired: Arc::new(Mutex::new(Acquired::default())),
        }
    }

    /// Name of the owning node.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.node
    }

    /// All services.
    #[must_use]
    pub const fn services(&self) -> &Services {
        &self.services
    }

    /// Message bus.
    #[must_use]
    pub const fn bus(&self) -> &MessageBus {
        &self.services.bus
    }

    /// Parameter store.
    #[must_use]
    pub const fn params(&self) -> &ParameterStore {
        &self.services.params
    }

    /// Transform graph.
    #[must_use]
    pub const fn transforms(&self) -> &TransformGraph {
        &self.services.transforms
    }

    /// Action executor.
    #[must_use]
    pub const fn actions(&self) -> &ActionExecutor {
        &self.services.actions
    }

    /// Subscribes on the bus and tracks the subscription for release.
    pub fn subscribe<T, F>(&self, topic: &str, handler: F) -> SubscriptionId
    where
        T: Message,
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.services.bus.subscribe(topic, handler);
        self.acquired
            .lock()
            .subscriptions
            .push((topic.to_string(), id));
        id
    }

    /// Drops a tracked subscription early.
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> bool {
        self.acquired
            .lock()
            .subscriptions
            .retain(|(t, sub)| !(t == topic && *sub == id));
        self.services.bus.unsubscribe(topic, id)
    }

    /// Publishes on the bus.
    pub fn publish<T: Message>(&self, topic: &str, message: T) -> PublishReport {
        self.services.bus.publish(topic, message)
    }

    /// Registers an action owned by this node.
    pub fn register_action(
        &self,
        name: &str,
        handler: Arc<dyn ActionHandler>,
    ) -> Result<(), ActionError> {
        self.services.actions.register_action(name, handler)?;
        self.acquired.lock().actions.push(name.to_string());
        Ok(())
    }

    /// Emits a diagnostic attributed to this node.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        self.services
            .diagnostics
            .record(&self.node, level, message, metadata);
    }

    /// Number of subscriptions and actions currently held.
    #[must_use]
    pub fn acquired_count(&self) -> usize {
        let acquired = self.acquired.lock();
        acquired.subscriptions.len() + acquired.actions.len()
    }

    /// Unsubscribes and unregisters everything acquired so far.
    pub(crate) fn release(&self) -> usize {
        let Acquired {
            subscriptions,
            actions,
        } = std::mem::take(&mut *self.acquired.lock());
        let mut released = 0;
        for (topic, id) in subscriptions {
            released += usize::from(self.services.bus.unsubscribe(&topic, id));
        }
        for action in actions {
            released += usize::from(self.services.actions.unregister_action(&action));
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rosette_actions::{action_fn, GoalContext};
    use shared_message_bus::MessageHeader;

    #[derive(Debug, Clone)]
    struct Ping {
        header: MessageHeader,
    }

    impl Message for Ping {
        fn header(&self) -> &MessageHeader {
            &self.header
        }
    }

    #[test]
    fn release_drops_tracked_resources() {
        let services = Services::default();
        let ctx = NodeContext::new("pinger", services.clone());
        ctx.subscribe("ping", |_: &Ping| Ok(()));
        let early = ctx.subscribe("ping", |_: &Ping| Ok(()));
        ctx.register_action(
            "noop",
            action_fn(|_ctx: GoalContext| async { Ok::<_, anyhow::Error>(Value::Null) }),
        )
        .unwrap();
        assert_eq!(ctx.acquired_count(), 3);

        assert!(ctx.unsubscribe("ping", early));
        assert_eq!(services.bus.subscriber_count("ping"), 1);

        assert_eq!(ctx.release(), 2);
        assert_eq!(services.bus.subscriber_count("ping"), 0);
        assert!(services.actions.registered_actions().is_empty());
        assert_eq!(ctx.acquired_count(), 0);
        assert_eq!(ctx.release(), 0);
    }

    #[test]
    fn duplicate_action_is_not_tracked() {
        let services = Services::default();
        let owner = NodeContext::new("owner", services.clone());
        let intruder = NodeContext::new("intruder", services.clone());
        let handler = action_fn(|_ctx: GoalContext| async { Ok::<_, anyhow::Error>(Value::Null) });
        owner.register_action("dock", Arc::clone(&handler)).unwrap();
        assert!(intruder.register_action("dock", handler).is_err());

        intruder.release();
        assert_eq!(services.actions.registered_actions(), vec!["dock".to_string()]);
        let report = owner.publish(
            "ping",
            Ping {
                header: MessageHeader::new("owner"),
            },
        );
        assert_eq!(report.delivered, 0);
    }
}
