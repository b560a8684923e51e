//! Infrastructure nodes the orchestrator always runs.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use rosette_lifecycle::{CancellationToken, Node, NodeContext};
use serde_json::{json, Map, Value};
use shared_logging::LogLevel;
use shared_message_bus::{Message, MessageHeader};
use tracing::info;

/// Topic the heartbeat is published on.
pub const HEARTBEAT_TOPIC: &str = "system/heartbeat";
/// Parameter holding the heartbeat period in milliseconds.
pub const HEARTBEAT_PERIOD_KEY: &str = "nodes/heartbeat_period_ms";
/// Parameter holding the monitor report period in milliseconds.
pub const MONITOR_PERIOD_KEY: &str = "nodes/monitor_report_period_ms";

const MIN_PERIOD_MS: u64 = 10;

/// Liveness message.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    /// Message header.
    pub header: MessageHeader,
    /// Monotonic counter, starting at 1.
    pub sequence: u64,
    /// Time since the heartbeat loop started.
    pub uptime_ms: u64,
}

impl Message for Heartbeat {
    fn header(&self) -> &MessageHeader {
        &self.header
    }
}

fn period(ctx: &NodeContext, key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(ctx.params().get(key, default_ms).max(MIN_PERIOD_MS))
}

/// Sleeps for `period`; returns false if cancelled first.
async fn pause(cancel: &CancellationToken, period: Duration) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(period) => true,
    }
}

/// Publishes a [`Heartbeat`] every `nodes/heartbeat_period_ms`.
///
/// The period is re-read from the parameter store on every cycle, so it can
/// be retuned while running.
#[derive(Debug, Default)]
pub struct HeartbeatNode {
    sequence: AtomicU64,
}

impl HeartbeatNode {
    /// Heartbeats published so far.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Node for HeartbeatNode {
    fn name(&self) -> &str {
        "heartbeat"
    }

    async fn run(&self, ctx: NodeContext, cancel: CancellationToken) -> anyhow::Result<()> {
        let started = Instant::now();
        loop {
            let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
            let uptime_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            ctx.publish(
                HEARTBEAT_TOPIC,
                Heartbeat {
                    header: MessageHeader::new(ctx.name()),
                    sequence,
                    uptime_ms,
                },
            );
            if !pause(&cancel, period(&ctx, HEARTBEAT_PERIOD_KEY, 1_000)).await {
                return Ok(());
            }
        }
    }
}

/// Watches every topic and periodically reports traffic counters.
///
/// Subscribes to `"*"` for [`Heartbeat`]s to track liveness; the per-topic
/// counts come from the bus statistics and cover every message shape.
#[derive(Debug, Default)]
pub struct TopicMonitorNode {
    last_heartbeat: Arc<AtomicU64>,
    reports: AtomicU64,
}

impl TopicMonitorNode {
    /// Sequence number of the latest heartbeat observed.
    #[must_use]
    pub fn last_heartbeat(&self) -> u64 {
        self.last_heartbeat.load(Ordering::Relaxed)
    }

    /// Reports emitted so far.
    #[must_use]
    pub fn reports(&self) -> u64 {
        self.reports.load(Ordering::Relaxed)
    }

    fn report(&self, ctx: &NodeContext) {
        let topics: Map<String, Value> = ctx
            .bus()
            .stats()
            .into_iter()
            .map(|(topic, stats)| {
                (
                    topic,
                    json!({
                        "published": stats.published,
                        "delivered": stats.delivered,
                        "failed": stats.failed,
                    }),
                )
            })
            .collect();
        let last_heartbeat = self.last_heartbeat();
        info!(topics = topics.len(), last_heartbeat, "topic report");
        ctx.log(
            LogLevel::Info,
            "monitor.report",
            json!({ "topics": topics, "last_heartbeat": last_heartbeat }),
        );
        self.reports.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl Node for TopicMonitorNode {
    fn name(&self) -> &str {
        "topic_monitor"
    }

    async fn on_start(&self, ctx: &NodeContext) -> anyhow::Result<()> {
        let last = Arc::clone(&self.last_heartbeat);
        ctx.subscribe("*", move |beat: &Heartbeat| {
            last.fetch_max(beat.sequence, Ordering::Relaxed);
            Ok(())
        });
        Ok(())
    }

    async fn run(&self, ctx: NodeContext, cancel: CancellationToken) -> anyhow::Result<()> {
        while pause(&cancel, period(&ctx, MONITOR_PERIOD_KEY, 5_000)).await {
            self.report(&ctx);
        }
        Ok(())
    }

    async fn on_stop(&self, ctx: &NodeContext) -> anyhow::Result<()> {
        self.report(ctx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rosette_lifecycle::{NodeRuntime, Services};
    use shared_logging::MemorySink;

    #[tokio::test]
    async fn monitor_observes_heartbeats() {
        let memory = Arc::new(MemorySink::default());
        let services = Services::new(memory.clone());
        services.params.set(HEARTBEAT_PERIOD_KEY, 10_i64);
        services.params.set(MONITOR_PERIOD_KEY, 15_i64);

        let heartbeat = Arc::new(HeartbeatNode::default());
        let monitor = Arc::new(TopicMonitorNode::default());
        let monitor_rt = NodeRuntime::new(monitor.clone(), services.clone());
        let heartbeat_rt = NodeRuntime::new(heartbeat.clone(), services.clone());
        monitor_rt.start().await.unwrap();
        heartbeat_rt.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        heartbeat_rt.stop().await.unwrap();
        monitor_rt.stop().await.unwrap();

        assert!(heartbeat.sequence() >= 2);
        assert_eq!(monitor.last_heartbeat(), heartbeat.sequence());
        assert!(monitor.reports() >= 1);
        assert!(memory.contains("monitor.report"));
        let stats = services.bus.topic_stats(HEARTBEAT_TOPIC);
        assert_eq!(stats.published, heartbeat.sequence());
        assert_eq!(services.bus.subscriber_count(HEARTBEAT_TOPIC), 0);
    }

    #[tokio::test]
    async fn period_is_clamped_and_defaulted() {
        let services = Services::default();
        let ctx = NodeContext::new("probe", services.clone());
        assert_eq!(
            period(&ctx, HEARTBEAT_PERIOD_KEY, 1_000),
            Duration::from_secs(1)
        );
        services.params.set(HEARTBEAT_PERIOD_KEY, 1_i64);
        assert_eq!(
            period(&ctx, HEARTBEAT_PERIOD_KEY, 1_000),
            Duration::from_millis(MIN_PERIOD_MS)
        );
        // Wrong kind degrades to the default.
        services.params.set(HEARTBEAT_PERIOD_KEY, "fast");
        assert_eq!(
            period(&ctx, HEARTBEAT_PERIOD_KEY, 1_000),
            Duration::from_secs(1)
        );
    }
}
