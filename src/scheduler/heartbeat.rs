//! Heartbeat-based failure detection.
//!
//! Every registered node gets its own probe task, tracked by a shared
//! [`TaskTracker`] and keyed by node id through the registry's per-node
//! cancellation token. On each tick the task asks the registry to advance the
//! node's warning count; after `max_warnings` unanswered probes the next tick
//! evicts the node and requeues its jobs.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::protocol::{Message, Outbound};
use crate::scheduler::job::NodeId;
use crate::scheduler::registry::{Node, NodeRegistry, ProbeOutcome};
use crate::transport::MessageSender;

/// Delay before a node's first probe: one interval plus up to `jitter_ms`.
pub fn first_probe_delay(interval: Duration, jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return interval;
    }
    let mut rng = rand::thread_rng();
    interval + Duration::from_millis(rng.gen_range(0..=jitter_ms))
}

pub struct HeartbeatMonitor {
    registry: Arc<NodeRegistry>,
    sender: MessageSender,
    interval: Duration,
    jitter_ms: u64,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl HeartbeatMonitor {
    pub fn new(
        registry: Arc<NodeRegistry>,
        sender: MessageSender,
        interval: Duration,
        jitter_ms: u64,
    ) -> Self {
        Self {
            registry,
            sender,
            interval,
            jitter_ms,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start probing `node`. Returns false if it is no longer registered or
    /// the monitor has been stopped.
    pub async fn watch(&self, node: &Node) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        let Some(token) = self.registry.heartbeat_token(node.id).await else {
            return false;
        };

        let delay = first_probe_delay(self.interval, self.jitter_ms);
        self.tracker.spawn(probe_loop(
            node.id,
            self.registry.clone(),
            self.sender.clone(),
            delay,
            self.interval,
            token,
            self.shutdown.clone(),
        ));
        tracing::debug!(node_id = node.id, first_probe = ?delay, "Heartbeat started");
        true
    }

    /// Number of probe tasks still running.
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel every probe task and wait for them to exit.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::debug!("Heartbeat monitor stopped");
    }
}

async fn probe_loop(
    node_id: NodeId,
    registry: Arc<NodeRegistry>,
    sender: MessageSender,
    first_delay: Duration,
    interval: Duration,
    node_token: CancellationToken,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + first_delay, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = node_token.cancelled() => break,
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match registry.tick(node_id).await {
            ProbeOutcome::Probe { endpoint, warnings } => {
                tracing::debug!(node_id, warnings, "Sending IS_ALIVE");
                sender
                    .send_or_log(&Message::outbound(Outbound::IsAlive), endpoint)
                    .await;
            }
            ProbeOutcome::Evicted { node, reclaimed } => {
                tracing::warn!(
                    node_id,
                    endpoint = %node.endpoint(),
                    requeued = reclaimed.len(),
                    "Node failed to answer heartbeats, evicted"
                );
                break;
            }
            ProbeOutcome::Gone => break,
        }
    }
}
