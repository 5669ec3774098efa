use std::{cmp::Ordering, sync::Arc, time::Duration};

use anyhow::Result;
use priority_queue::PriorityQueue;
use state_store::{
    nodes::{NodeUpdate, MIN_NODE_TTL},
    ClusterState,
};
use tokio::{
    sync::{watch, Notify, RwLock},
    time::Instant,
};
use tracing::{error, trace};

/// Wrapper for `tokio::time::Instant` that reverses the ordering, so the
/// earliest deadline sits at the top of the priority queue.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ReverseInstant(pub Instant);

impl Ord for ReverseInstant {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.cmp(&self.0)
    }
}

impl PartialOrd for ReverseInstant {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

enum WaitResult {
    /// A node's registration deadline has been reached.
    Deadline,
    /// A heartbeat re-armed the queue.
    Notified,
    Shutdown,
}

/// Drives node liveness: heartbeats update the registry and arm a deadline
/// monitor that forces the offline computation the moment a registration
/// expires, instead of waiting for the next read or background sweep.
pub struct NodeManager {
    state: Arc<ClusterState>,
    deadlines: RwLock<PriorityQueue<String, ReverseInstant>>,
    notify: Arc<Notify>,
    default_ttl: Duration,
    sweep_interval: Duration,
}

impl NodeManager {
    pub fn new(state: Arc<ClusterState>, default_ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            state,
            deadlines: RwLock::new(PriorityQueue::new()),
            notify: Arc::new(Notify::new()),
            default_ttl,
            sweep_interval,
        }
    }

    /// Apply one heartbeat: re-arm the node's deadline and forward the
    /// registration update to the registry.
    pub async fn heartbeat(
        &self,
        name: &str,
        ttl_secs: Option<u64>,
        update: NodeUpdate,
    ) -> Result<()> {
        let ttl = ttl_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_ttl)
            .max(MIN_NODE_TTL);

        trace!(node = name, ttl_s = ttl.as_secs(), "heartbeat received");
        let first = {
            let mut deadlines = self.deadlines.write().await;
            let was_empty = deadlines.is_empty();
            let deadline = ReverseInstant(Instant::now() + ttl);
            if deadlines
                .change_priority(&name.to_string(), deadline)
                .is_none()
            {
                deadlines.push(name.to_string(), deadline);
            }
            was_empty
        };
        if first {
            self.notify.notify_one();
        }

        self.state.nodes.update(name, ttl, update).await
    }

    async fn wait_for_deadline_event(&self, shutdown_rx: &mut watch::Receiver<()>) -> WaitResult {
        let next_deadline = {
            let deadlines = self.deadlines.read().await;
            deadlines.peek().map(|(_, deadline)| deadline.0)
        };

        match next_deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => WaitResult::Deadline,
                    _ = self.notify.notified() => WaitResult::Notified,
                    _ = shutdown_rx.changed() => WaitResult::Shutdown,
                }
            }
            None => {
                tokio::select! {
                    _ = self.notify.notified() => WaitResult::Notified,
                    _ = shutdown_rx.changed() => WaitResult::Shutdown,
                }
            }
        }
    }

    /// The deadline monitor loop.
    pub async fn start_monitor(self: Arc<Self>, mut shutdown_rx: watch::Receiver<()>) {
        loop {
            match self.wait_for_deadline_event(&mut shutdown_rx).await {
                WaitResult::Deadline => {
                    if let Err(err) = self.process_lapsed_nodes().await {
                        error!("failed to process lapsed nodes: {:?}", err);
                    }
                    // Batch subsequent lapses instead of spinning.
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                WaitResult::Notified => continue,
                WaitResult::Shutdown => {
                    trace!("node deadline monitor shutting down");
                    break;
                }
            }
        }
    }

    /// Pop expired deadlines and force the registry's online computation
    /// for each, which fires the OFFLINE event.
    pub async fn process_lapsed_nodes(&self) -> Result<()> {
        let now = Instant::now();
        let mut lapsed = Vec::new();
        {
            let mut deadlines = self.deadlines.write().await;
            while let Some((_, next)) = deadlines.peek() {
                if next.0 > now {
                    break;
                }
                if let Some((name, _)) = deadlines.pop() {
                    lapsed.push(name);
                } else {
                    break;
                }
            }
        }

        for name in lapsed {
            trace!(node = %name, "node registration lapsed");
            self.state.nodes.get_node_info(&name).await?;
        }
        Ok(())
    }

    /// Fallback sweep that forces the online computation on every node, so
    /// expiries are detected even if the monitor misses an arm.
    pub async fn start_sweeper(self: Arc<Self>, mut shutdown_rx: watch::Receiver<()>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.sweep_interval) => {
                    self.state.nodes.sweep().await;
                }
                _ = shutdown_rx.changed() => {
                    trace!("node sweeper shutting down");
                    break;
                }
            }
        }
    }
}
