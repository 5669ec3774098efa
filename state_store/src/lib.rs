pub mod access;
pub mod containers;
pub mod events;
pub mod kv;
pub mod nodes;
pub mod serializer;

use std::sync::Arc;

use anyhow::Result;
use metrics::StateStoreMetrics;
use tokio::sync::watch;
use tracing::{error, info};

use crate::{
    access::AccessChecker,
    containers::ContainerInventory,
    events::EventBus,
    kv::KvStore,
    nodes::NodeRegistry,
};

/// The soft-state facade: node and container registries over one KV store
/// and one event bus.
pub struct ClusterState {
    pub kv: Arc<dyn KvStore>,
    pub nodes: Arc<NodeRegistry>,
    pub containers: Arc<ContainerInventory>,
    pub bus: Arc<EventBus>,
    pub metrics: Arc<StateStoreMetrics>,
}

impl ClusterState {
    pub async fn new(kv: Arc<dyn KvStore>, access: Arc<dyn AccessChecker>) -> Result<Arc<Self>> {
        let bus = Arc::new(EventBus::new());
        let nodes = Arc::new(NodeRegistry::new(kv.clone(), bus.clone(), access));
        let containers = Arc::new(ContainerInventory::new(kv.clone(), bus.clone()));

        nodes.load().await?;
        containers.load().await?;
        info!("cluster soft state initialized from persisted store");

        Ok(Arc::new(Self {
            kv,
            nodes,
            containers,
            bus,
            metrics: Arc::new(StateStoreMetrics::new()),
        }))
    }

    /// Pump remote KV watch events into the registries until shutdown.
    /// Delivery is at-least-once and unordered across entities; the
    /// registries tolerate both.
    pub fn start_kv_listener(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<()>) {
        let state = self.clone();
        let mut rx = state.kv.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        let event = match event {
                            Ok(event) => event,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                                error!(skipped, "kv watch lagged; some events were dropped");
                                continue;
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        };
                        state.metrics.kv_events.add(1, &[]);
                        let result = if event.key.starts_with("nodes/") {
                            state.nodes.handle_kv_event(&event).await
                        } else if event.key.starts_with("containers/") {
                            state.containers.handle_kv_event(&event).await
                        } else {
                            Ok(())
                        };
                        if let Err(err) = result {
                            error!(key = event.key, "error applying kv event: {:?}", err);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("kv listener shutting down");
                        break;
                    }
                }
            }
        });
    }
}
