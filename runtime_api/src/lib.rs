pub mod sim;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use data_model::ContainerSpec;
use serde::{Deserialize, Serialize};
use strum::AsRefStr;

/// Application-level outcome of a daemon call. Distinct from a transport
/// failure: a call that reached the daemon and was rejected returns `Ok`
/// with a non-`Ok` code, while a call that never completed returns `Err`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, AsRefStr, strum::Display)]
pub enum ResultCode {
    Ok,
    NotModified,
    Conflict,
    NotFound,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallResult {
    pub code: ResultCode,
    pub message: Option<String>,
}

impl CallResult {
    pub fn ok() -> Self {
        Self {
            code: ResultCode::Ok,
            message: None,
        }
    }

    pub fn of(code: ResultCode) -> Self {
        Self {
            code,
            message: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == ResultCode::Ok
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateResult {
    pub code: ResultCode,
    pub id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, AsRefStr, strum::Display)]
pub enum ContainerRunState {
    Created,
    Running,
    Exited,
}

/// One row of a daemon container listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub node: String,
    pub image: String,
    pub image_id: Option<String>,
    pub labels: HashMap<String, String>,
    pub state: ContainerRunState,
    pub created_at: u64,
}

/// Full container inspection, including the runtime configuration needed to
/// reconstruct a creation spec.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerDetails {
    pub summary: ContainerSummary,
    pub env: Vec<String>,
    pub restart_policy: Option<String>,
}

/// An image as reported by the daemon or a registry, with the config
/// defaults the image itself contributes to containers created from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ImageDescriptor {
    pub id: String,
    pub name: String,
    pub tag: Option<String>,
    pub labels: HashMap<String, String>,
    pub env: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterConfig {
    pub max_instances_per_node: i64,
    pub default_restart_policy: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            max_instances_per_node: 0,
            default_restart_policy: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSummary {
    pub name: String,
    pub address: String,
    pub healthy: bool,
}

/// The Docker daemon boundary. Implementations live outside this
/// repository; [`sim::SimDocker`] stands in for tests and dev mode.
#[async_trait]
pub trait DockerService: Send + Sync {
    /// List containers, optionally restricted to one node.
    async fn list_containers(&self, node: Option<&str>) -> Result<Vec<ContainerSummary>>;
    async fn get_container(&self, id_or_name: &str) -> Result<Option<ContainerDetails>>;
    async fn create_container(&self, spec: &ContainerSpec) -> Result<CreateResult>;
    async fn start_container(&self, id: &str) -> Result<CallResult>;
    async fn stop_container(&self, id: &str) -> Result<CallResult>;
    async fn remove_container(&self, id: &str) -> Result<CallResult>;
    async fn pull_image(&self, name: &str) -> Result<Option<ImageDescriptor>>;
    async fn get_image(&self, id_or_name: &str) -> Result<Option<ImageDescriptor>>;
    async fn cluster_config(&self) -> Result<ClusterConfig>;
    async fn node_list(&self) -> Result<Vec<NodeSummary>>;
}

/// The image registry boundary: tag discovery and tag management for the
/// scheduled update path.
#[async_trait]
pub trait ContainerRegistry: Send + Sync {
    /// Tags for an image, ascending by version.
    async fn list_tags(&self, image: &str) -> Result<Vec<String>>;
    async fn get_image(&self, image: &str, tag: &str) -> Result<Option<ImageDescriptor>>;
    async fn delete_tag(&self, image: &str, tag: &str) -> Result<()>;
}
