pub mod filter;
pub mod images;
pub mod test_objects;

use std::{
    collections::{BTreeSet, HashMap},
    fmt::{self, Display},
};

use anyhow::{anyhow, Result};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use strum::AsRefStr;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct NodeName(String);

impl Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl NodeName {
    pub fn new(name: String) -> Self {
        Self(name)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, AsRefStr)]
pub enum ContainerState {
    Ok,
    Failed,
}

/// Desired configuration for a container, carried alongside the container
/// through an update so the replacement can be created from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ContainerSpec {
    pub image: String,
    pub name: Option<String>,
    pub node: Option<String>,
    pub cluster: Option<String>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub constraints: BTreeSet<String>,
    pub restart_policy: Option<String>,
}

/// A container as seen by an update strategy.
///
/// Immutable: every mutation point produces a fresh instance through
/// [`Container::make_new`] or [`Container::make_copy`]. `make_new` links the
/// predecessor as `old`, forming a backward-only history chain used by
/// rollback bookkeeping and progress reporting; `make_copy` leaves the
/// ancestry untouched and is for bookkeeping-only rewrites that are not a
/// version step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Builder)]
#[builder(build_fn(skip))]
pub struct Container {
    pub id: Option<String>,
    pub name: Option<String>,
    pub node: Option<String>,
    pub image: String,
    pub image_id: Option<String>,
    pub cluster: Option<String>,
    pub state: Option<ContainerState>,
    pub labels: HashMap<String, String>,
    pub src: ContainerSpec,
    pub old: Option<Box<Container>>,
}

impl Container {
    pub fn make_new<F>(&self, f: F) -> Container
    where
        F: FnOnce(&mut Container),
    {
        let mut next = self.clone();
        f(&mut next);
        next.old = Some(Box::new(self.clone()));
        next
    }

    pub fn make_copy<F>(&self, f: F) -> Container
    where
        F: FnOnce(&mut Container),
    {
        let mut next = self.clone();
        f(&mut next);
        next
    }

    /// Walk the history chain, newest first.
    pub fn versions(&self) -> Vec<&Container> {
        let mut out = vec![self];
        let mut cur = self;
        while let Some(prev) = cur.old.as_deref() {
            out.push(prev);
            cur = prev;
        }
        out
    }

    /// Best available human-readable identity for log lines.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.id.as_deref())
            .unwrap_or(&self.image)
    }
}

impl Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Container(id: {:?}, name: {:?}, node: {:?}, image: {})",
            self.id, self.name, self.node, self.image
        )
    }
}

impl ContainerBuilder {
    pub fn build(&mut self) -> Result<Container> {
        let image = self.image.clone().ok_or(anyhow!("image is required"))?;
        let labels = self.labels.clone().unwrap_or_default();
        let mut src = self.src.clone().unwrap_or_default();
        if src.image.is_empty() {
            src.image = image.clone();
        }
        Ok(Container {
            id: self.id.clone().flatten(),
            name: self.name.clone().flatten(),
            node: self.node.clone().flatten(),
            image,
            image_id: self.image_id.clone().flatten(),
            cluster: self.cluster.clone().flatten(),
            state: self.state.clone().flatten(),
            labels,
            src,
            old: None,
        })
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, strum::Display, AsRefStr,
)]
pub enum NodeConnState {
    #[default]
    Alone,
    Disconnected,
    Clustered,
}

/// Health metrics reported by a node agent. Kept in memory only; a soft
/// state reload from the KV store must never clobber these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NodeHealth {
    pub healthy: bool,
    pub state: NodeConnState,
    pub cpu: f64,
    pub mem: f64,
    pub disk: f64,
    pub net: f64,
}

/// Immutable snapshot of a node registration, as handed to event
/// subscribers and read-side callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NodeInfo {
    pub name: NodeName,
    pub address: String,
    pub cluster: Option<String>,
    pub labels: HashMap<String, String>,
    pub health: NodeHealth,
    pub on: bool,
}

impl NodeInfo {
    pub fn key(&self) -> String {
        self.name.get().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::{test_objects::tests::mock_container, *};

    #[test]
    fn test_make_new_links_ancestor() {
        let original = mock_container("app-0", "reg/app:1.0", "n1");
        let upgraded = original.make_new(|c| {
            c.image = "reg/app:2.0".to_string();
        });
        assert_eq!(upgraded.image, "reg/app:2.0");
        assert_eq!(upgraded.old.as_deref(), Some(&original));
        assert_eq!(original.old, None);

        let created = upgraded.make_new(|c| {
            c.id = Some("new-id".to_string());
        });
        let chain = created.versions();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].id.as_deref(), Some("new-id"));
        assert_eq!(chain[2].image, "reg/app:1.0");
    }

    #[test]
    fn test_make_copy_keeps_ancestry() {
        let original = mock_container("app-0", "reg/app:1.0", "n1");
        let upgraded = original.make_new(|c| {
            c.image = "reg/app:2.0".to_string();
        });
        let stripped = upgraded.make_copy(|c| {
            c.labels.clear();
        });
        // A copy is not a version step; the chain is unchanged.
        assert_eq!(stripped.old.as_deref(), Some(&original));
        assert_eq!(stripped.versions().len(), 2);
    }

    #[test]
    fn test_builder_requires_image() {
        assert!(ContainerBuilder::default().build().is_err());
        let c = ContainerBuilder::default()
            .image("reg/app:1.0".to_string())
            .build()
            .unwrap();
        assert_eq!(c.src.image, "reg/app:1.0");
        assert_eq!(c.state, None);
    }
}
