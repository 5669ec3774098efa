use data_model::NodeInfo;
use tokio::sync::broadcast;

use crate::containers::ContainerRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum NodeEventKind {
    Online,
    Offline,
    Updated,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct NodeEvent {
    pub kind: NodeEventKind,
    pub node: NodeInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ContainerEventKind {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct ContainerEvent {
    pub kind: ContainerEventKind,
    pub container: ContainerRecord,
}

/// A raw daemon log event, as ingested from a node's event stream.
#[derive(Debug, Clone)]
pub struct DockerLogEvent {
    pub node: String,
    pub container_id: String,
    pub status: String,
}

/// In-process lifecycle event bus. Publication is a non-blocking broadcast
/// send and subscribers consume on their own tasks, so emitting an event
/// never stalls the mutator that produced it; callers still must not
/// publish while holding an entity lock.
pub struct EventBus {
    node_tx: broadcast::Sender<NodeEvent>,
    container_tx: broadcast::Sender<ContainerEvent>,
    docker_tx: broadcast::Sender<DockerLogEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (node_tx, _) = broadcast::channel(1024);
        let (container_tx, _) = broadcast::channel(1024);
        let (docker_tx, _) = broadcast::channel(1024);
        Self {
            node_tx,
            container_tx,
            docker_tx,
        }
    }

    pub fn publish_node(&self, event: NodeEvent) {
        let _ = self.node_tx.send(event);
    }

    pub fn publish_container(&self, event: ContainerEvent) {
        let _ = self.container_tx.send(event);
    }

    pub fn publish_docker_log(&self, event: DockerLogEvent) {
        let _ = self.docker_tx.send(event);
    }

    pub fn subscribe_nodes(&self) -> broadcast::Receiver<NodeEvent> {
        self.node_tx.subscribe()
    }

    pub fn subscribe_containers(&self) -> broadcast::Receiver<ContainerEvent> {
        self.container_tx.subscribe()
    }

    pub fn subscribe_docker_logs(&self) -> broadcast::Receiver<DockerLogEvent> {
        self.docker_tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
