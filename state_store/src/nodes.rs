use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use dashmap::DashMap;
use data_model::{NodeHealth, NodeInfo, NodeName};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    access::AccessChecker,
    events::{EventBus, NodeEvent, NodeEventKind},
    kv::{KvEvent, KvEventKind, KvStore},
    serializer::{JsonEncode, JsonEncoder},
};

/// Registrations shorter than this are floored; a node cannot demand a
/// faster expiry than the sweep can honor.
pub const MIN_NODE_TTL: Duration = Duration::from_secs(10);

const PREFIX: &str = "nodes";
/// The field whose remote CREATE/DELETE marks the entity itself appearing
/// or disappearing; other fields only dirty the local cache.
const ANCHOR_FIELD: &str = "address";

/// Fields applied by one logical registration update. `None` leaves the
/// field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeUpdate {
    pub address: Option<String>,
    pub labels: Option<HashMap<String, String>>,
    pub cluster: Option<String>,
    pub health: Option<NodeHealth>,
}

struct NodeEntry {
    name: String,
    address: String,
    labels: HashMap<String, String>,
    cluster: Option<String>,
    health: NodeHealth,
    /// Deadline set by the last ttl update; `None` until first heartbeat.
    end_time: Option<Instant>,
    on: bool,
    /// Set when a remote UPDATE arrives; persisted fields are reloaded on
    /// the next access. Health is never touched by a reload.
    stale: bool,
    snapshot: Option<NodeInfo>,
}

impl NodeEntry {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            address: String::new(),
            labels: HashMap::new(),
            cluster: None,
            health: NodeHealth::default(),
            end_time: None,
            on: false,
            stale: false,
            snapshot: None,
        }
    }

    fn invalidate(&mut self) {
        self.snapshot = None;
    }

    fn snapshot(&mut self) -> NodeInfo {
        if self.snapshot.is_none() {
            self.snapshot = Some(NodeInfo {
                name: NodeName::from(self.name.as_str()),
                address: self.address.clone(),
                cluster: self.cluster.clone(),
                labels: self.labels.clone(),
                health: self.health.clone(),
                on: self.on,
            });
        }
        self.snapshot.clone().unwrap()
    }

    /// Recompute the on/off flag from the deadline. Returns the lifecycle
    /// transition to fire, if the flag flipped.
    fn compute_on(&mut self, now: Instant) -> Option<NodeEventKind> {
        let on = self.end_time.map(|t| now <= t).unwrap_or(false);
        if on == self.on {
            return None;
        }
        self.on = on;
        self.invalidate();
        Some(if on {
            NodeEventKind::Online
        } else {
            NodeEventKind::Offline
        })
    }
}

/// Soft-state registry of node registrations.
///
/// Each node's mutable state sits behind its own lock; never take two
/// entry locks at once. Events are published only after the lock is
/// released.
pub struct NodeRegistry {
    kv: Arc<dyn KvStore>,
    entries: DashMap<String, Arc<Mutex<NodeEntry>>>,
    bus: Arc<EventBus>,
    access: Arc<dyn AccessChecker>,
}

impl NodeRegistry {
    pub fn new(kv: Arc<dyn KvStore>, bus: Arc<EventBus>, access: Arc<dyn AccessChecker>) -> Self {
        Self {
            kv,
            entries: DashMap::new(),
            bus,
            access,
        }
    }

    fn entry(&self, name: &str) -> Option<Arc<Mutex<NodeEntry>>> {
        self.entries.get(name).map(|e| e.value().clone())
    }

    fn entry_or_create(&self, name: &str) -> (Arc<Mutex<NodeEntry>>, bool) {
        let mut created = false;
        let arc = self
            .entries
            .entry(name.to_string())
            .or_insert_with(|| {
                created = true;
                Arc::new(Mutex::new(NodeEntry::new(name)))
            })
            .value()
            .clone();
        (arc, created)
    }

    fn fire(&self, kind: NodeEventKind, node: NodeInfo) {
        debug!(node = node.name.get(), event = %kind, "node lifecycle event");
        self.bus.publish_node(NodeEvent { kind, node });
    }

    /// Apply one logical registration update. The ttl is applied first so
    /// the online computation reflects the new deadline before any other
    /// field is considered.
    #[tracing::instrument(skip(self, update))]
    pub async fn update(&self, name: &str, ttl: Duration, update: NodeUpdate) -> Result<()> {
        self.access.check_update(name)?;
        let (arc, created) = self.entry_or_create(name);

        let now = Instant::now();
        let (transition, before, after, persist) = {
            let mut entry = arc.lock().unwrap();
            let before = if created { None } else { Some(entry.snapshot()) };

            entry.end_time = Some(now + ttl.max(MIN_NODE_TTL));
            let transition = entry.compute_on(now);

            let mut persist: Vec<(&str, Vec<u8>)> = Vec::new();
            if let Some(address) = update.address {
                if created || address != entry.address {
                    entry.address = address;
                    entry.invalidate();
                }
            }
            if created {
                // Anchor field; its remote CREATE announces the entity.
                persist.push((ANCHOR_FIELD, JsonEncoder::encode(&entry.address)?));
            } else if before.as_ref().map(|b| &b.address) != Some(&entry.address) {
                persist.push((ANCHOR_FIELD, JsonEncoder::encode(&entry.address)?));
            }
            if let Some(labels) = update.labels {
                if labels != entry.labels {
                    entry.labels = labels;
                    entry.invalidate();
                    persist.push(("labels", JsonEncoder::encode(&entry.labels)?));
                }
            }
            if let Some(cluster) = update.cluster {
                if Some(&cluster) != entry.cluster.as_ref() {
                    entry.cluster = Some(cluster);
                    entry.invalidate();
                    persist.push(("cluster", JsonEncoder::encode(&entry.cluster)?));
                }
            }
            if let Some(health) = update.health {
                if health != entry.health {
                    entry.health = health;
                    entry.invalidate();
                }
            }
            let after = entry.snapshot();
            (transition, before, after, persist)
        };

        for (field, value) in persist {
            self.kv
                .put(&format!("{}/{}/{}", PREFIX, name, field), value)
                .await?;
        }

        if let Some(kind) = transition {
            // The transition event already carries the fresh snapshot; no
            // separate update event for the same mutation.
            self.fire(kind, after);
        } else if before.as_ref() != Some(&after) {
            self.fire(NodeEventKind::Updated, after);
        }
        Ok(())
    }

    /// Read a node's snapshot, lazily computing the on/off transition.
    /// Returns `None` for unknown nodes; that is "not found", not a fault.
    pub async fn get_node_info(&self, name: &str) -> Result<Option<NodeInfo>> {
        self.access.check_read(name)?;
        let Some(arc) = self.entry(name) else {
            return Ok(None);
        };
        self.reload_if_stale(name, &arc).await?;

        let (transition, snapshot) = {
            let mut entry = arc.lock().unwrap();
            let transition = entry.compute_on(Instant::now());
            (transition, entry.snapshot())
        };
        if let Some(kind) = transition {
            self.fire(kind, snapshot.clone());
        }
        Ok(Some(snapshot))
    }

    pub async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            if self.access.check_read(&name).is_err() {
                continue;
            }
            if let Some(info) = self.get_node_info(&name).await? {
                out.push(info);
            }
        }
        Ok(out)
    }

    /// Force the online computation on every node. Detects expiries even
    /// when nothing reads the node.
    pub async fn sweep(&self) {
        let arcs: Vec<Arc<Mutex<NodeEntry>>> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        for arc in arcs {
            // One entity at a time; no nested entry locks.
            let fired = {
                let mut entry = arc.lock().unwrap();
                entry
                    .compute_on(Instant::now())
                    .map(|kind| (kind, entry.snapshot()))
            };
            if let Some((kind, snapshot)) = fired {
                self.fire(kind, snapshot);
            }
        }
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        self.access.check_update(name)?;
        let removed = self.entries.remove(name).map(|(_, arc)| arc);
        for key in self.kv.list(&format!("{}/{}/", PREFIX, name)).await? {
            self.kv.remove(&key).await?;
        }
        let snapshot = match removed {
            Some(arc) => arc.lock().unwrap().snapshot(),
            None => NodeInfo {
                name: NodeName::from(name),
                ..Default::default()
            },
        };
        self.fire(NodeEventKind::Deleted, snapshot);
        Ok(())
    }

    /// Recreate stale local entries from the persisted store, e.g. at
    /// startup. Entries come up offline until their first heartbeat.
    pub async fn load(&self) -> Result<()> {
        for key in self.kv.list(&format!("{}/", PREFIX)).await? {
            if let Some((name, _)) = parse_key(&key) {
                let (arc, created) = self.entry_or_create(name);
                if created {
                    arc.lock().unwrap().stale = true;
                }
            }
        }
        Ok(())
    }

    async fn reload_if_stale(&self, name: &str, arc: &Arc<Mutex<NodeEntry>>) -> Result<()> {
        if !arc.lock().unwrap().stale {
            return Ok(());
        }
        // Fetch outside the entry lock; the fields are applied afterwards.
        // Health metrics are not persisted on this path and stay untouched.
        let address = self.read_field::<String>(name, ANCHOR_FIELD).await;
        let labels = self
            .read_field::<HashMap<String, String>>(name, "labels")
            .await;
        let cluster = self.read_field::<Option<String>>(name, "cluster").await;

        let mut entry = arc.lock().unwrap();
        if !entry.stale {
            return Ok(());
        }
        if let Some(address) = address {
            entry.address = address;
        }
        if let Some(labels) = labels {
            entry.labels = labels;
        }
        if let Some(cluster) = cluster {
            entry.cluster = cluster;
        }
        entry.stale = false;
        entry.invalidate();
        Ok(())
    }

    /// Corrupt or missing persisted values read as absent.
    async fn read_field<T: serde::de::DeserializeOwned>(
        &self,
        name: &str,
        field: &str,
    ) -> Option<T> {
        let key = format!("{}/{}/{}", PREFIX, name, field);
        match self.kv.get(&key).await {
            Ok(Some(bytes)) => match JsonEncoder::decode(&bytes) {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(key, "ignoring corrupt persisted record: {:?}", err);
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(key, "failed to read persisted record: {:?}", err);
                None
            }
        }
    }

    /// Reconcile one remote store event into the local cache.
    pub async fn handle_kv_event(&self, event: &KvEvent) -> Result<()> {
        let Some((name, field)) = parse_key(&event.key) else {
            return Ok(());
        };
        match event.kind {
            KvEventKind::Create | KvEventKind::Update => {
                let (arc, created) = self.entry_or_create(name);
                let mut entry = arc.lock().unwrap();
                entry.stale = true;
                if created {
                    debug!(node = name, "created local entry from remote store");
                }
            }
            KvEventKind::Delete => {
                if field != ANCHOR_FIELD {
                    if let Some(arc) = self.entry(name) {
                        arc.lock().unwrap().stale = true;
                    }
                    return Ok(());
                }
                let snapshot = match self.entries.remove(name) {
                    Some((_, arc)) => arc.lock().unwrap().snapshot(),
                    None => NodeInfo {
                        name: NodeName::from(name),
                        ..Default::default()
                    },
                };
                self.fire(NodeEventKind::Deleted, snapshot);
            }
        }
        Ok(())
    }
}

fn parse_key(key: &str) -> Option<(&str, &str)> {
    let mut parts = key.splitn(3, '/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(PREFIX), Some(name), Some(field)) if !name.is_empty() && !field.is_empty() => {
            Some((name, field))
        }
        _ => None,
    }
}
