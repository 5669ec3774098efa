use std::{collections::HashSet, sync::Arc, time::Duration};

use anyhow::Result;
use dashmap::DashMap;
use flotilla_utils::deferrable_sleep::DeferrableSleep;
use metrics::{ReconcilerMetrics, Timer};
use runtime_api::{ContainerSummary, DockerService};
use state_store::{
    containers::ContainerRecord,
    events::{DockerLogEvent, NodeEvent, NodeEventKind},
    ClusterState,
};
use tokio::{sync::watch, time::Instant};
use tracing::{debug, error, info, warn};

/// Chunk for the debounce sleep; bounds how late a deferral is noticed.
const DEBOUNCE_POLL_CHUNK: Duration = Duration::from_millis(50);

/// Daemon event statuses that mean a container ceased to exist.
const DELETE_STATUSES: [&str; 2] = ["destroy", "delete"];

/// Keeps the container inventory consistent with live daemon state:
/// a fixed-interval full sweep over every online node, plus event-driven
/// resyncs for node transitions and daemon log events.
pub struct ContainerReconciler {
    state: Arc<ClusterState>,
    docker: Arc<dyn DockerService>,
    interval: Duration,
    debounce: Duration,
    debounce_ceiling: Duration,
    /// One pending debounced resync per node; further events defer it.
    pending_resync: Arc<DashMap<String, watch::Sender<Instant>>>,
    metrics: Arc<ReconcilerMetrics>,
}

impl ContainerReconciler {
    pub fn new(
        state: Arc<ClusterState>,
        docker: Arc<dyn DockerService>,
        interval: Duration,
        debounce: Duration,
        debounce_ceiling: Duration,
    ) -> Self {
        Self {
            state,
            docker,
            interval,
            debounce,
            debounce_ceiling,
            pending_resync: Arc::new(DashMap::new()),
            metrics: Arc::new(ReconcilerMetrics::new()),
        }
    }

    /// Fixed-delay full reconciliation loop.
    pub async fn start_periodic(self: Arc<Self>, mut shutdown_rx: watch::Receiver<()>) {
        info!(
            interval_s = self.interval.as_secs(),
            "starting container inventory reconciler"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.sweep().await;
                }
                _ = shutdown_rx.changed() => {
                    info!("container reconciler shutting down");
                    break;
                }
            }
        }
    }

    /// Event loop: node lifecycle and daemon log events.
    pub async fn start_event_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<()>) {
        let mut node_rx = self.state.bus.subscribe_nodes();
        let mut docker_rx = self.state.bus.subscribe_docker_logs();
        loop {
            tokio::select! {
                event = node_rx.recv() => {
                    match event {
                        Ok(event) => self.handle_node_event(&event).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "node event stream lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                event = docker_rx.recv() => {
                    match event {
                        Ok(event) => self.handle_docker_event(&event).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "docker event stream lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("reconciler event loop shutting down");
                    break;
                }
            }
        }
    }

    /// Reconcile every online node. A node failure is logged and skipped;
    /// it does not abort the sweep for the other nodes.
    pub async fn sweep(&self) {
        let _timer = Timer::start(&self.metrics.sweep_duration);
        let nodes = match self.state.nodes.list_nodes().await {
            Ok(nodes) => nodes,
            Err(err) => {
                error!("failed to list nodes for reconcile sweep: {:?}", err);
                return;
            }
        };
        for node in nodes.iter().filter(|n| n.on) {
            if let Err(err) = self.sync_node(node.name.get()).await {
                self.metrics.nodes_skipped.add(1, &[]);
                warn!(
                    node = node.name.get(),
                    "skipping unreachable node this cycle: {:?}", err
                );
            }
        }
    }

    /// Full sync of one node: upsert every live container, then delete
    /// local entries the live listing no longer shows.
    pub async fn sync_node(&self, node: &str) -> Result<()> {
        sync_node_inner(&self.state, &self.docker, node).await
    }

    async fn handle_node_event(&self, event: &NodeEvent) {
        let node = event.node.name.get();
        match event.kind {
            NodeEventKind::Online => {
                debug!(node, "node came online, forcing container sync");
                if let Err(err) = self.sync_node(node).await {
                    warn!(node, "sync after online transition failed: {:?}", err);
                }
            }
            NodeEventKind::Offline | NodeEventKind::Deleted => {
                // Containers on a gone node are unknown, not stale-but-present.
                match self.state.containers.remove_node_containers(node).await {
                    Ok(removed) if !removed.is_empty() => {
                        info!(node, count = removed.len(), "dropped containers of offline node");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(node, "failed to drop containers of offline node: {:?}", err);
                    }
                }
            }
            NodeEventKind::Updated => {}
        }
    }

    async fn handle_docker_event(&self, event: &DockerLogEvent) {
        if DELETE_STATUSES.contains(&event.status.as_str()) {
            debug!(
                container_id = %event.container_id,
                "daemon reported container deletion"
            );
            if let Err(err) = self.state.containers.remove(&event.container_id).await {
                warn!(
                    container_id = %event.container_id,
                    "failed to remove deleted container: {:?}", err
                );
            }
            return;
        }
        let known = self
            .state
            .containers
            .get(&event.container_id)
            .await
            .ok()
            .flatten()
            .is_some();
        if !known {
            // A burst of events for the same node collapses into one
            // rescheduled resync, capped by the debounce ceiling.
            self.schedule_resync(&event.node);
        }
    }

    fn schedule_resync(&self, node: &str) {
        let target = Instant::now() + self.debounce;
        if let Some(sender) = self.pending_resync.get(node) {
            if sender.send(target).is_ok() {
                return;
            }
            // Receiver gone: the task just finished, fall through and
            // schedule a fresh one.
        }
        let (sleep, sender) = DeferrableSleep::new(
            target,
            Instant::now() + self.debounce_ceiling,
            DEBOUNCE_POLL_CHUNK,
        );
        self.pending_resync.insert(node.to_string(), sender);

        let state = self.state.clone();
        let docker = self.docker.clone();
        let pending = self.pending_resync.clone();
        let node = node.to_string();
        tokio::spawn(async move {
            sleep.await;
            pending.remove(&node);
            debug!(%node, "running debounced node resync");
            if let Err(err) = sync_node_inner(&state, &docker, &node).await {
                warn!(%node, "debounced resync failed: {:?}", err);
            }
        });
    }
}

async fn sync_node_inner(
    state: &Arc<ClusterState>,
    docker: &Arc<dyn DockerService>,
    node: &str,
) -> Result<()> {
    let live = docker.list_containers(Some(node)).await?;
    let mut seen: HashSet<String> = HashSet::with_capacity(live.len());
    for summary in live {
        seen.insert(summary.id.clone());
        if let Err(err) = state.containers.create_or_update(record_from(summary)).await {
            warn!(node, "failed to upsert container record: {:?}", err);
        }
    }
    for id in state.containers.ids_on_node(node) {
        if !seen.contains(&id) {
            debug!(container_id = %id, node, "dropping stale inventory entry");
            if let Err(err) = state.containers.remove(&id).await {
                warn!(container_id = %id, "failed to drop stale entry: {:?}", err);
            }
        }
    }
    Ok(())
}

fn record_from(summary: ContainerSummary) -> ContainerRecord {
    ContainerRecord {
        id: summary.id,
        name: summary.name,
        node: summary.node,
        image: summary.image,
        image_id: summary.image_id,
        labels: summary.labels,
        additional_labels: Default::default(),
    }
}
