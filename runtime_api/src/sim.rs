//! In-memory daemon and registry used by tests and `--dev` mode.
//!
//! Every mutating call is recorded in a trace so tests can assert exact
//! call sequences.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use data_model::{images, ContainerSpec};
use flotilla_utils::get_epoch_time_in_ms;

use crate::{
    CallResult,
    ClusterConfig,
    ContainerDetails,
    ContainerRegistry,
    ContainerRunState,
    ContainerSummary,
    CreateResult,
    DockerService,
    ImageDescriptor,
    NodeSummary,
    ResultCode,
};

#[derive(Debug, Clone)]
struct SimContainer {
    summary: ContainerSummary,
    env: Vec<String>,
    restart_policy: Option<String>,
}

#[derive(Default)]
struct SimState {
    containers: Vec<SimContainer>,
    images: HashMap<String, ImageDescriptor>,
    nodes: Vec<NodeSummary>,
    unreachable_nodes: HashSet<String>,
    cluster: ClusterConfig,
}

pub struct SimDocker {
    state: Mutex<SimState>,
    calls: Mutex<Vec<String>>,
    /// When set, started containers come up crashed, so health checks fail.
    unhealthy_starts: AtomicBool,
    /// Force this many creates to fail with a name conflict.
    conflicts_remaining: AtomicUsize,
}

impl SimDocker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                cluster: ClusterConfig::default(),
                ..Default::default()
            }),
            calls: Mutex::new(Vec::new()),
            unhealthy_starts: AtomicBool::new(false),
            conflicts_remaining: AtomicUsize::new(0),
        }
    }

    pub fn add_node(&self, name: &str, address: &str) {
        let mut state = self.state.lock().unwrap();
        state.nodes.push(NodeSummary {
            name: name.to_string(),
            address: address.to_string(),
            healthy: true,
        });
    }

    pub fn add_image(&self, descriptor: ImageDescriptor) {
        let mut state = self.state.lock().unwrap();
        state.images.insert(descriptor.id.clone(), descriptor.clone());
        let reference = match &descriptor.tag {
            Some(tag) => format!("{}:{}", descriptor.name, tag),
            None => descriptor.name.clone(),
        };
        state.images.insert(reference, descriptor);
    }

    /// Seed a running container, bypassing the create path.
    pub fn add_container(&self, name: &str, image: &str, node: &str) -> String {
        let id = nanoid::nanoid!(16);
        let mut state = self.state.lock().unwrap();
        state.containers.push(SimContainer {
            summary: ContainerSummary {
                id: id.clone(),
                name: name.to_string(),
                node: node.to_string(),
                image: image.to_string(),
                image_id: None,
                labels: HashMap::new(),
                state: ContainerRunState::Running,
                created_at: get_epoch_time_in_ms(),
            },
            env: Vec::new(),
            restart_policy: None,
        });
        id
    }

    pub fn set_cluster_config(&self, config: ClusterConfig) {
        self.state.lock().unwrap().cluster = config;
    }

    pub fn set_node_unreachable(&self, node: &str, unreachable: bool) {
        let mut state = self.state.lock().unwrap();
        if unreachable {
            state.unreachable_nodes.insert(node.to_string());
        } else {
            state.unreachable_nodes.remove(node);
        }
    }

    pub fn set_unhealthy_starts(&self, unhealthy: bool) {
        self.unhealthy_starts.store(unhealthy, Ordering::SeqCst);
    }

    pub fn fail_next_creates_with_conflict(&self, count: usize) {
        self.conflicts_remaining.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn placement_node(state: &SimState, spec: &ContainerSpec) -> String {
        if let Some(node) = &spec.node {
            return node.clone();
        }
        // Honor an equality or soft-preference placement constraint.
        for constraint in &spec.constraints {
            if let Some(value) = constraint.strip_prefix("node==") {
                return value.trim_start_matches('~').to_string();
            }
        }
        state
            .nodes
            .first()
            .map(|n| n.name.clone())
            .unwrap_or_else(|| "local".to_string())
    }
}

impl Default for SimDocker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DockerService for SimDocker {
    async fn list_containers(&self, node: Option<&str>) -> Result<Vec<ContainerSummary>> {
        let state = self.state.lock().unwrap();
        if let Some(node) = node {
            if state.unreachable_nodes.contains(node) {
                return Err(anyhow!("node {} is unreachable", node));
            }
        }
        Ok(state
            .containers
            .iter()
            .filter(|c| node.map(|n| c.summary.node == n).unwrap_or(true))
            .map(|c| c.summary.clone())
            .collect())
    }

    async fn get_container(&self, id_or_name: &str) -> Result<Option<ContainerDetails>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .iter()
            .find(|c| c.summary.id == id_or_name || c.summary.name == id_or_name)
            .map(|c| ContainerDetails {
                summary: c.summary.clone(),
                env: c.env.clone(),
                restart_policy: c.restart_policy.clone(),
            }))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<CreateResult> {
        let name = spec
            .name
            .clone()
            .ok_or_else(|| anyhow!("container spec has no name"))?;
        self.record(format!("create({}, {})", name, spec.image));

        if self
            .conflicts_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(CreateResult {
                code: ResultCode::Conflict,
                id: None,
            });
        }

        let mut state = self.state.lock().unwrap();
        if state.containers.iter().any(|c| c.summary.name == name) {
            return Ok(CreateResult {
                code: ResultCode::Conflict,
                id: None,
            });
        }
        let node = Self::placement_node(&state, spec);
        let image_id = state.images.get(&spec.image).map(|d| d.id.clone());
        let id = nanoid::nanoid!(16);
        state.containers.push(SimContainer {
            summary: ContainerSummary {
                id: id.clone(),
                name,
                node,
                image: spec.image.clone(),
                image_id,
                labels: spec.labels.clone(),
                state: ContainerRunState::Created,
                created_at: get_epoch_time_in_ms(),
            },
            env: spec.env.clone(),
            restart_policy: spec.restart_policy.clone(),
        });
        Ok(CreateResult {
            code: ResultCode::Ok,
            id: Some(id),
        })
    }

    async fn start_container(&self, id: &str) -> Result<CallResult> {
        self.record(format!("start({})", id));
        let mut state = self.state.lock().unwrap();
        let Some(container) = state
            .containers
            .iter_mut()
            .find(|c| c.summary.id == id || c.summary.name == id)
        else {
            return Ok(CallResult::of(ResultCode::NotFound));
        };
        if container.summary.state == ContainerRunState::Running {
            return Ok(CallResult::of(ResultCode::NotModified));
        }
        container.summary.state = if self.unhealthy_starts.load(Ordering::SeqCst) {
            ContainerRunState::Exited
        } else {
            ContainerRunState::Running
        };
        Ok(CallResult::ok())
    }

    async fn stop_container(&self, id: &str) -> Result<CallResult> {
        self.record(format!("stop({})", id));
        let mut state = self.state.lock().unwrap();
        let Some(container) = state
            .containers
            .iter_mut()
            .find(|c| c.summary.id == id || c.summary.name == id)
        else {
            return Ok(CallResult::of(ResultCode::NotFound));
        };
        if container.summary.state == ContainerRunState::Exited {
            return Ok(CallResult::of(ResultCode::NotModified));
        }
        container.summary.state = ContainerRunState::Exited;
        Ok(CallResult::ok())
    }

    async fn remove_container(&self, id: &str) -> Result<CallResult> {
        self.record(format!("remove({})", id));
        let mut state = self.state.lock().unwrap();
        let before = state.containers.len();
        state
            .containers
            .retain(|c| c.summary.id != id && c.summary.name != id);
        if state.containers.len() == before {
            return Ok(CallResult::of(ResultCode::NotFound));
        }
        Ok(CallResult::ok())
    }

    async fn pull_image(&self, name: &str) -> Result<Option<ImageDescriptor>> {
        self.record(format!("pull({})", name));
        let mut state = self.state.lock().unwrap();
        if let Some(descriptor) = state.images.get(name) {
            return Ok(Some(descriptor.clone()));
        }
        // The registry always has what we ask for in the sim; synthesize it.
        let descriptor = ImageDescriptor {
            id: nanoid::nanoid!(16),
            name: images::image_repo(name).to_string(),
            tag: images::image_tag(name).map(|t| t.to_string()),
            labels: HashMap::new(),
            env: Vec::new(),
        };
        state.images.insert(name.to_string(), descriptor.clone());
        state
            .images
            .insert(descriptor.id.clone(), descriptor.clone());
        Ok(Some(descriptor))
    }

    async fn get_image(&self, id_or_name: &str) -> Result<Option<ImageDescriptor>> {
        let state = self.state.lock().unwrap();
        Ok(state.images.get(id_or_name).cloned())
    }

    async fn cluster_config(&self) -> Result<ClusterConfig> {
        Ok(self.state.lock().unwrap().cluster.clone())
    }

    async fn node_list(&self) -> Result<Vec<NodeSummary>> {
        Ok(self.state.lock().unwrap().nodes.clone())
    }
}

pub struct SimRegistry {
    tags: Mutex<HashMap<String, Vec<String>>>,
    calls: Mutex<Vec<String>>,
    /// Artificial latency for `list_tags`, for concurrency tests.
    list_delay: Mutex<Duration>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl SimRegistry {
    pub fn new() -> Self {
        Self {
            tags: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            list_delay: Mutex::new(Duration::ZERO),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn set_tags(&self, image: &str, tags: Vec<&str>) {
        self.tags.lock().unwrap().insert(
            image.to_string(),
            tags.into_iter().map(|t| t.to_string()).collect(),
        );
    }

    pub fn set_list_delay(&self, delay: Duration) {
        *self.list_delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Highest number of concurrently in-flight `list_tags` calls observed.
    pub fn max_concurrent_lists(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl Default for SimRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRegistry for SimRegistry {
    async fn list_tags(&self, image: &str) -> Result<Vec<String>> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("list_tags({})", image));
        let concurrent = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(concurrent, Ordering::SeqCst);
        let delay = *self.list_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let mut tags = self
            .tags
            .lock()
            .unwrap()
            .get(image)
            .cloned()
            .unwrap_or_default();
        tags.sort_by(|a, b| images::compare_versions(a, b));
        Ok(tags)
    }

    async fn get_image(&self, image: &str, tag: &str) -> Result<Option<ImageDescriptor>> {
        let tags = self.tags.lock().unwrap();
        let known = tags
            .get(image)
            .map(|t| t.iter().any(|x| x == tag))
            .unwrap_or(false);
        Ok(known.then(|| ImageDescriptor {
            id: format!("sim-{}-{}", images::app_name(image), tag),
            name: image.to_string(),
            tag: Some(tag.to_string()),
            labels: HashMap::new(),
            env: Vec::new(),
        }))
    }

    async fn delete_tag(&self, image: &str, tag: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("delete_tag({}, {})", image, tag));
        let mut tags = self.tags.lock().unwrap();
        if let Some(list) = tags.get_mut(image) {
            list.retain(|t| t != tag);
        }
        Ok(())
    }
}
