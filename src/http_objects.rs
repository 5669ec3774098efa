use std::collections::HashMap;

use data_model::{NodeHealth, NodeInfo};
use orchestrator::{UpdateJobParams, UpdateStrategyKind};
use serde::{Deserialize, Serialize};
use state_store::{containers::ContainerRecord, nodes::NodeUpdate};
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NodeHealthReport {
    pub healthy: bool,
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub mem: f64,
    #[serde(default)]
    pub disk: f64,
    #[serde(default)]
    pub net: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct HeartbeatRequest {
    /// Seconds this registration stays valid; server default when absent.
    pub ttl_secs: Option<u64>,
    pub address: Option<String>,
    pub labels: Option<HashMap<String, String>>,
    pub cluster: Option<String>,
    pub health: Option<NodeHealthReport>,
}

impl HeartbeatRequest {
    pub fn into_update(self) -> (Option<u64>, NodeUpdate) {
        (
            self.ttl_secs,
            NodeUpdate {
                address: self.address,
                labels: self.labels,
                cluster: self.cluster,
                health: self.health.map(|h| NodeHealth {
                    healthy: h.healthy,
                    cpu: h.cpu,
                    mem: h.mem,
                    disk: h.disk,
                    net: h.net,
                    ..Default::default()
                }),
            },
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NodeResponse {
    pub name: String,
    pub address: String,
    pub cluster: Option<String>,
    pub labels: HashMap<String, String>,
    pub on: bool,
    pub healthy: bool,
}

impl From<NodeInfo> for NodeResponse {
    fn from(info: NodeInfo) -> Self {
        Self {
            name: info.name.get().to_string(),
            address: info.address,
            cluster: info.cluster,
            labels: info.labels,
            on: info.on,
            healthy: info.health.healthy,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ContainerResponse {
    pub id: String,
    pub name: String,
    pub node: String,
    pub image: String,
    pub labels: HashMap<String, String>,
}

impl From<ContainerRecord> for ContainerResponse {
    fn from(record: ContainerRecord) -> Self {
        let mut labels = record.labels;
        // User-applied labels are merged into the displayed set.
        labels.extend(record.additional_labels);
        Self {
            id: record.id,
            name: record.name,
            node: record.node,
            image: record.image,
            labels,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DockerEventRequest {
    pub node: String,
    pub container_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateStrategyRequest {
    StopThenStartEach,
    StopThenStartAll,
    StartThenStopEach,
}

impl From<UpdateStrategyRequest> for UpdateStrategyKind {
    fn from(strategy: UpdateStrategyRequest) -> Self {
        match strategy {
            UpdateStrategyRequest::StopThenStartEach => UpdateStrategyKind::StopThenStartEach,
            UpdateStrategyRequest::StopThenStartAll => UpdateStrategyKind::StopThenStartAll,
            UpdateStrategyRequest::StartThenStopEach => UpdateStrategyKind::StartThenStopEach,
        }
    }
}

fn default_sample_percent() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_health_check_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpdateJobRequest {
    pub image: String,
    pub cluster: Option<String>,
    pub from_version: Option<String>,
    pub to_version: Option<String>,
    pub strategy: Option<UpdateStrategyRequest>,
    #[serde(default = "default_true")]
    pub rollback_on_failure: bool,
    #[serde(default = "default_true")]
    pub health_check: bool,
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_secs: u64,
    #[serde(default = "default_sample_percent")]
    pub sample_percent: f64,
    pub filter: Option<String>,
    pub node: Option<String>,
}

impl UpdateJobRequest {
    pub fn into_params(self) -> UpdateJobParams {
        UpdateJobParams {
            cluster: self.cluster,
            image: self.image,
            from_version: self.from_version,
            to_version: self.to_version,
            strategy: self
                .strategy
                .map(Into::into)
                .unwrap_or(UpdateStrategyKind::StopThenStartEach),
            rollback_on_failure: self.rollback_on_failure,
            health_check: self.health_check,
            health_check_timeout_secs: self.health_check_timeout_secs,
            sample_percent: self.sample_percent,
            filter: self.filter,
            node: self.node,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct JobResponse {
    pub job_id: String,
    pub success: bool,
    pub log: Vec<String>,
}
