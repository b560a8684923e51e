#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Typed publish/subscribe router shared by every node in the process.
//!
//! Topics are plain strings; the bus itself is untyped. Each subscription binds
//! its topic filter to one concrete message type at subscribe time, and a
//! publish only reaches the subscriptions bound to the published type.
//! Delivery is synchronous on the publisher's thread.

/// Message trait and header.
pub mod message;
/// Topic filter parsing and matching.
pub mod topic;

use std::{
    any::{type_name, Any, TypeId},
    collections::BTreeSet,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::{DiagnosticSinkExt, LogLevel, NullSink, SharedSink};
use thiserror::Error;

pub use message::{Message, MessageHeader};
pub use topic::TopicFilter;

const SOURCE: &str = "bus";

/// Identifier returned by [`MessageBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Failure raised by a subscriber. Only ever reported to diagnostics.
#[derive(Debug, Error)]
pub enum BusError {
    /// The handler returned an error.
    #[error("handler {subscription} on `{topic}` ({shape}) failed: {reason}")]
    HandlerFailed {
        /// Topic being published.
        topic: String,
        /// Subscription that failed.
        subscription: SubscriptionId,
        /// Message type name.
        shape: &'static str,
        /// Rendered error.
        reason: String,
    },
    /// The handler panicked.
    #[error("handler {subscription} on `{topic}` ({shape}) panicked: {reason}")]
    HandlerPanicked {
        /// Topic being published.
        topic: String,
        /// Subscription that panicked.
        subscription: SubscriptionId,
        /// Message type name.
        shape: &'static str,
        /// Panic payload, when it was a string.
        reason: String,
    },
}

/// Outcome of one publish call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReport {
    /// Handlers that returned successfully.
    pub delivered: usize,
    /// Handlers that failed or panicked.
    pub failed: usize,
}

/// Per-topic traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicStats {
    /// Publish calls on the topic.
    pub published: u64,
    /// Successful handler invocations.
    pub delivered: u64,
    /// Failed handler invocations.
    pub failed: u64,
}

type ErasedHandler = Arc<dyn Fn(&dyn Any) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    shape: TypeId,
    shape_name: &'static str,
    handler: ErasedHandler,
}

#[derive(Default)]
struct Registry {
    exact: IndexMap<String, Vec<Subscription>>,
    wildcard: Vec<(TopicFilter, Subscription)>,
}

impl Registry {
    fn snapshot(&self, topic: &str, shape: TypeId) -> Vec<Subscription> {
        let mut matched: Vec<Subscription> = self
            .exact
            .get(topic)
            .into_iter()
            .flatten()
            .filter(|sub| sub.shape == shape)
            .cloned()
            .collect();
        matched.extend(
            self.wildcard
                .iter()
                .filter(|(filter, sub)| sub.shape == shape && filter.matches(topic))
                .map(|(_, sub)| sub.clone()),
        );
        // Subscription ids are allocated monotonically, so this restores
        // global subscription order across exact and wildcard filters.
        matched.sort_by_key(|sub| sub.id);
        matched
    }
}

/// In-memory topic router.
///
/// Cloning is cheap and every clone shares the same registry.
#[derive(Clone)]
pub struct MessageBus {
    registry: Arc<RwLock<Registry>>,
    stats: Arc<Mutex<IndexMap<String, TopicStats>>>,
    next_id: Arc<AtomicU64>,
    diagnostics: SharedSink,
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("topics", &self.list_topics())
            .finish()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(Arc::new(NullSink))
    }
}

impl MessageBus {
    /// Creates an empty bus reporting handler failures to `diagnostics`.
    #[must_use]
    pub fn new(diagnostics: SharedSink) -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry::default())),
            stats: Arc::new(Mutex::new(IndexMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            diagnostics,
        }
    }

    /// Binds `handler` to messages of type `T` on `topic`.
    ///
    /// `topic` is parsed as a [`TopicFilter`]: `"*"` and `"prefix/*"` are
    /// wildcards, anything else is matched exactly.
    pub fn subscribe<T, F>(&self, topic: &str, handler: F) -> SubscriptionId
    where
        T: Message,
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: ErasedHandler = Arc::new(move |message: &dyn Any| {
            message
                .downcast_ref::<T>()
                .map_or(Ok(()), |typed| handler(typed))
        });
        let subscription = Subscription {
            id,
            shape: TypeId::of::<T>(),
            shape_name: type_name::<T>(),
            handler,
        };

        let filter = TopicFilter::parse(topic);
        let mut registry = self.registry.write();
        match filter {
            TopicFilter::Exact(name) => registry.exact.entry(name).or_default().push(subscription),
            wildcard => registry.wildcard.push((wildcard, subscription)),
        }
        drop(registry);

        tracing::debug!(%id, topic, shape = type_name::<T>(), "subscribed");
        id
    }

    /// Removes a subscription. Returns false when `id` is not subscribed on `topic`.
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> bool {
        let mut registry = self.registry.write();
        let removed = match TopicFilter::parse(topic) {
            TopicFilter::Exact(name) => {
                let Some(list) = registry.exact.get_mut(&name) else {
                    return false;
                };
                let before = list.len();
                list.retain(|sub| sub.id != id);
                let removed = list.len() != before;
                if list.is_empty() {
                    registry.exact.shift_remove(&name);
                }
                removed
            }
            wildcard => {
                let before = registry.wildcard.len();
                registry
                    .wildcard
                    .retain(|(filter, sub)| !(sub.id == id && *filter == wildcard));
                registry.wildcard.len() != before
            }
        };
        drop(registry);
        if removed {
            tracing::debug!(%id, topic, "unsubscribed");
        }
        removed
    }

    /// Delivers `message` to every subscription on `topic` bound to type `T`.
    ///
    /// Handlers run synchronously in subscription order on the calling thread,
    /// against a snapshot taken before the first handler runs. A failing or
    /// panicking handler is reported to diagnostics and never stops delivery
    /// to the remaining handlers.
    pub fn publish<T: Message>(&self, topic: &str, message: T) -> PublishReport {
        let targets = self.registry.read().snapshot(topic, TypeId::of::<T>());
        let mut report = PublishReport::default();
        let payload: &dyn Any = &message;

        for target in &targets {
            let outcome = catch_unwind(AssertUnwindSafe(|| (target.handler)(payload)));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(BusError::HandlerFailed {
                    topic: topic.to_string(),
                    subscription: target.id,
                    shape: target.shape_name,
                    reason: format!("{err:#}"),
                }),
                Err(panic) => Some(BusError::HandlerPanicked {
                    topic: topic.to_string(),
                    subscription: target.id,
                    shape: target.shape_name,
                    reason: panic_reason(panic.as_ref()),
                }),
            };
            match failure {
                None => report.delivered += 1,
                Some(err) => {
                    report.failed += 1;
                    self.report_failure(topic, message.header(), &err);
                }
            }
        }

        let mut stats = self.stats.lock();
        let entry = stats.entry(topic.to_string()).or_default();
        entry.published += 1;
        entry.delivered += report.delivered as u64;
        entry.failed += report.failed as u64;
        report
    }

    /// Topics with at least one subscription, including wildcard filters, sorted.
    #[must_use]
    pub fn list_topics(&self) -> Vec<String> {
        let registry = self.registry.read();
        let mut topics: BTreeSet<String> = registry
            .exact
            .iter()
            .filter(|(_, subs)| !subs.is_empty())
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.extend(
            registry
                .wildcard
                .iter()
                .map(|(filter, _)| filter.to_string()),
        );
        topics.into_iter().collect()
    }

    /// Number of subscriptions whose filter would receive a publish on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let registry = self.registry.read();
        registry.exact.get(topic).map_or(0, Vec::len)
            + registry
                .wildcard
                .iter()
                .filter(|(filter, _)| filter.matches(topic))
                .count()
    }

    /// Traffic counters for one topic.
    #[must_use]
    pub fn topic_stats(&self, topic: &str) -> TopicStats {
        self.stats.lock().get(topic).copied().unwrap_or_default()
    }

    /// Traffic counters for every topic published so far.
    #[must_use]
    pub fn stats(&self) -> IndexMap<String, TopicStats> {
        self.stats.lock().clone()
    }

    fn report_failure(&self, topic: &str, header: &MessageHeader, err: &BusError) {
        tracing::warn!(topic, error = %err, "subscriber failed");
        self.diagnostics.record(
            SOURCE,
            LogLevel::Error,
            "bus.handler.failed",
            json!({
                "topic": topic,
                "message_id": header.id,
                "publisher": header.source,
                "error": err.to_string(),
            }),
        );
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_logging::MemorySink;

    #[derive(Debug, Clone)]
    struct Scan {
        header: MessageHeader,
        range: f64,
    }

    impl Message for Scan {
        fn header(&self) -> &MessageHeader {
            &self.header
        }
    }

    #[derive(Debug, Clone)]
    struct Alert {
        header: MessageHeader,
        text: String,
    }

    impl Message for Alert {
        fn header(&self) -> &MessageHeader {
            &self.header
        }
    }

    fn scan(range: f64) -> Scan {
        Scan {
            header: MessageHeader::new("lidar"),
            range,
        }
    }

    fn alert(text: &str) -> Alert {
        Alert {
            header: MessageHeader::new("monitor"),
            text: text.into(),
        }
    }

    #[test]
    fn delivers_in_subscription_order() {
        let bus = MessageBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            bus.subscribe("scan", move |msg: &Scan| {
                seen.lock().push((tag, msg.range));
                Ok(())
            });
        }

        let report = bus.publish("scan", scan(1.5));
        assert_eq!(report.delivered, 3);
        assert_eq!(
            *seen.lock(),
            vec![("first", 1.5), ("second", 1.5), ("third", 1.5)]
        );
    }

    #[test]
    fn other_shapes_on_same_topic_are_skipped() {
        let bus = MessageBus::default();
        let scans = Arc::new(AtomicU64::new(0));
        let alerts = Arc::new(AtomicU64::new(0));
        {
            let scans = Arc::clone(&scans);
            bus.subscribe("mixed", move |_: &Scan| {
                scans.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        {
            let alerts = Arc::clone(&alerts);
            bus.subscribe("mixed", move |msg: &Alert| {
                assert_eq!(msg.text, "hot");
                alerts.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        assert_eq!(bus.publish("mixed", alert("hot")).delivered, 1);
        assert_eq!(scans.load(Ordering::SeqCst), 0);
        assert_eq!(alerts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let bus = MessageBus::default();
        assert_eq!(bus.publish("nobody", scan(0.0)), PublishReport::default());
        assert_eq!(bus.topic_stats("nobody").published, 1);
    }

    #[test]
    fn failing_handler_does_not_stop_delivery() {
        let sink = Arc::new(MemorySink::new(16));
        let bus = MessageBus::new(sink.clone());
        let reached = Arc::new(AtomicU64::new(0));
        bus.subscribe("scan", |_: &Scan| anyhow::bail!("bad calibration"));
        bus.subscribe("scan", |_: &Scan| -> anyhow::Result<()> { panic!("boom") });
        {
            let reached = Arc::clone(&reached);
            bus.subscribe("scan", move |_: &Scan| {
                reached.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let report = bus.publish("scan", scan(2.0));
        assert_eq!(report, PublishReport { delivered: 1, failed: 2 });
        assert_eq!(reached.load(Ordering::SeqCst), 1);
        let errors = sink.at_least(LogLevel::Error);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].metadata["error"]
            .as_str()
            .unwrap()
            .contains("bad calibration"));
        assert!(errors[1].metadata["error"].as_str().unwrap().contains("boom"));
    }

    #[test]
    fn handler_can_unsubscribe_itself() {
        let bus = MessageBus::default();
        let calls = Arc::new(AtomicU64::new(0));
        let own_id: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let id = {
            let bus_handle = bus.clone();
            let calls = Arc::clone(&calls);
            let own_id = Arc::clone(&own_id);
            bus.subscribe("scan", move |_: &Scan| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(id) = *own_id.lock() {
                    assert!(bus_handle.unsubscribe("scan", id));
                }
                Ok(())
            })
        };
        *own_id.lock() = Some(id);

        assert_eq!(bus.publish("scan", scan(1.0)).delivered, 1);
        assert_eq!(bus.publish("scan", scan(1.0)).delivered, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(bus.list_topics().is_empty());
    }

    #[test]
    fn handler_subscribing_during_publish_sees_next_message_only() {
        let bus = MessageBus::default();
        let late_calls = Arc::new(AtomicU64::new(0));
        {
            let bus_handle = bus.clone();
            let late_calls = Arc::clone(&late_calls);
            let registered = Arc::new(Mutex::new(false));
            bus.subscribe("scan", move |_: &Scan| {
                let mut registered = registered.lock();
                if !*registered {
                    *registered = true;
                    let late_calls = Arc::clone(&late_calls);
                    bus_handle.subscribe("scan", move |_: &Scan| {
                        late_calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    });
                }
                Ok(())
            });
        }

        bus.publish("scan", scan(1.0));
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);
        bus.publish("scan", scan(1.0));
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wildcard_filters_interleave_with_exact_in_subscription_order() {
        let bus = MessageBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for (filter, tag) in [
            ("sensors/lidar", "exact"),
            ("*", "all"),
            ("sensors/*", "prefix"),
            ("actuators/*", "elsewhere"),
        ] {
            let seen = Arc::clone(&seen);
            bus.subscribe(filter, move |_: &Scan| {
                seen.lock().push(tag);
                Ok(())
            });
        }

        bus.publish("sensors/lidar", scan(3.0));
        assert_eq!(*seen.lock(), vec!["exact", "all", "prefix"]);
        assert_eq!(bus.subscriber_count("sensors/lidar"), 3);
        assert_eq!(
            bus.list_topics(),
            vec!["*", "actuators/*", "sensors/*", "sensors/lidar"]
        );
    }

    #[test]
    fn unsubscribe_requires_matching_topic() {
        let bus = MessageBus::default();
        let id = bus.subscribe("a", |_: &Scan| Ok(()));
        let wildcard = bus.subscribe("a/*", |_: &Scan| Ok(()));
        assert!(!bus.unsubscribe("b", id));
        assert!(!bus.unsubscribe("a", wildcard));
        assert!(bus.unsubscribe("a/*", wildcard));
        assert!(bus.unsubscribe("a", id));
        assert!(!bus.unsubscribe("a", id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_publishers_and_subscribers() {
        let bus = MessageBus::default();
        let total = Arc::new(AtomicU64::new(0));
        {
            let total = Arc::clone(&total);
            bus.subscribe("load", move |_: &Scan| {
                total.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let mut tasks = Vec::new();
        for worker in 0..4 {
            let bus = bus.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..100 {
                    if i % 10 == 0 {
                        let id = bus.subscribe("load", |_: &Scan| Ok(()));
                        bus.unsubscribe("load", id);
                    }
                    bus.publish("load", scan(f64::from(worker)));
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(total.load(Ordering::SeqCst), 400);
        assert_eq!(bus.topic_stats("load").published, 400);
    }
}
