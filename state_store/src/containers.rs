use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    events::{ContainerEvent, ContainerEventKind, EventBus},
    kv::{KvEvent, KvEventKind, KvStore},
    serializer::{JsonEncode, JsonEncoder},
};

const PREFIX: &str = "containers";
/// Entity anchor field; see `nodes.rs`.
const ANCHOR_FIELD: &str = "node";

/// The soft-state view of one container.
///
/// `labels` are the image/daemon-derived labels from the live listing;
/// `additional_labels` are user-applied and survive the container being
/// recreated, so they are kept apart and merged only for display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub node: String,
    pub image: String,
    pub image_id: Option<String>,
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub additional_labels: HashMap<String, String>,
}

struct ContainerEntry {
    record: ContainerRecord,
    stale: bool,
}

/// Soft-state inventory of containers, keyed by daemon container id.
/// Reconciled against live daemon listings by the reconciler loops.
pub struct ContainerInventory {
    kv: Arc<dyn KvStore>,
    entries: DashMap<String, Arc<Mutex<ContainerEntry>>>,
    bus: Arc<EventBus>,
}

impl ContainerInventory {
    pub fn new(kv: Arc<dyn KvStore>, bus: Arc<EventBus>) -> Self {
        Self {
            kv,
            entries: DashMap::new(),
            bus,
        }
    }

    fn entry(&self, id: &str) -> Option<Arc<Mutex<ContainerEntry>>> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    fn fire(&self, kind: ContainerEventKind, container: ContainerRecord) {
        debug!(
            container_id = %container.id,
            event = %kind,
            "container lifecycle event"
        );
        self.bus.publish_container(ContainerEvent { kind, container });
    }

    /// Upsert a container registration. Creation is compute-if-absent:
    /// concurrent callers for the same id all observe the same entry.
    pub async fn create_or_update(&self, incoming: ContainerRecord) -> Result<ContainerRecord> {
        if incoming.id.is_empty() {
            return Err(anyhow!("container record has no id"));
        }
        if incoming.node.is_empty() {
            return Err(anyhow!(
                "container {} has no node in incoming record",
                incoming.id
            ));
        }

        let mut created = false;
        let arc = self
            .entries
            .entry(incoming.id.clone())
            .or_insert_with(|| {
                created = true;
                Arc::new(Mutex::new(ContainerEntry {
                    record: ContainerRecord {
                        id: incoming.id.clone(),
                        ..Default::default()
                    },
                    stale: false,
                }))
            })
            .value()
            .clone();

        let (changed, snapshot) = {
            let mut entry = arc.lock().unwrap();
            if entry.record.id != incoming.id {
                return Err(anyhow!(
                    "id mismatch: entry {} vs incoming {}",
                    entry.record.id,
                    incoming.id
                ));
            }
            let before = entry.record.clone();
            entry.record.name = incoming.name;
            entry.record.node = incoming.node;
            entry.record.image = incoming.image;
            entry.record.image_id = incoming.image_id;
            entry.record.labels = incoming.labels;
            // User-applied labels are kept; an upsert from a live listing
            // carries none.
            if !incoming.additional_labels.is_empty() {
                entry.record.additional_labels = incoming.additional_labels;
            }
            (before != entry.record, entry.record.clone())
        };

        if created || changed {
            self.persist(&snapshot).await?;
        }
        if created {
            self.fire(ContainerEventKind::Created, snapshot.clone());
        } else if changed {
            self.fire(ContainerEventKind::Updated, snapshot.clone());
        }
        Ok(snapshot)
    }

    /// Attach user-applied labels to a registration.
    pub async fn set_additional_labels(
        &self,
        id: &str,
        labels: HashMap<String, String>,
    ) -> Result<()> {
        let arc = self
            .entry(id)
            .ok_or_else(|| anyhow!("unknown container {}", id))?;
        let snapshot = {
            let mut entry = arc.lock().unwrap();
            if entry.record.additional_labels == labels {
                return Ok(());
            }
            entry.record.additional_labels = labels;
            entry.record.clone()
        };
        self.persist(&snapshot).await?;
        self.fire(ContainerEventKind::Updated, snapshot);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<ContainerRecord>> {
        let Some(arc) = self.entry(id) else {
            return Ok(None);
        };
        self.reload_if_stale(id, &arc).await?;
        let record = arc.lock().unwrap().record.clone();
        Ok(Some(record))
    }

    pub fn list(&self) -> Vec<ContainerRecord> {
        let mut records: Vec<ContainerRecord> = self
            .entries
            .iter()
            .map(|e| e.value().lock().unwrap().record.clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn list_by_node(&self, node: &str) -> Vec<ContainerRecord> {
        self.list()
            .into_iter()
            .filter(|r| r.node == node)
            .collect()
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        let removed = self.entries.remove(id).map(|(_, arc)| arc);
        for key in self.kv.list(&format!("{}/{}/", PREFIX, id)).await? {
            self.kv.remove(&key).await?;
        }
        let record = match removed {
            Some(arc) => arc.lock().unwrap().record.clone(),
            None => ContainerRecord {
                id: id.to_string(),
                ..Default::default()
            },
        };
        self.fire(ContainerEventKind::Deleted, record);
        Ok(())
    }

    /// Drop every registration on a node. Used when the node goes offline:
    /// its containers become unknown rather than stale-but-present.
    pub async fn remove_node_containers(&self, node: &str) -> Result<Vec<String>> {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().lock().unwrap().record.node == node)
            .map(|e| e.key().clone())
            .collect();
        for id in &ids {
            self.remove(id).await?;
        }
        Ok(ids)
    }

    /// Ids currently registered for a node; used by the reconciler to
    /// delete entries absent from a live listing.
    pub fn ids_on_node(&self, node: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.value().lock().unwrap().record.node == node)
            .map(|e| e.key().clone())
            .collect()
    }

    pub async fn load(&self) -> Result<()> {
        for key in self.kv.list(&format!("{}/", PREFIX)).await? {
            if let Some((id, _)) = parse_key(&key) {
                let mut created = false;
                let arc = self
                    .entries
                    .entry(id.to_string())
                    .or_insert_with(|| {
                        created = true;
                        Arc::new(Mutex::new(ContainerEntry {
                            record: ContainerRecord {
                                id: id.to_string(),
                                ..Default::default()
                            },
                            stale: false,
                        }))
                    })
                    .value()
                    .clone();
                if created {
                    arc.lock().unwrap().stale = true;
                }
            }
        }
        Ok(())
    }

    async fn persist(&self, record: &ContainerRecord) -> Result<()> {
        let fields: Vec<(&str, Vec<u8>)> = vec![
            (ANCHOR_FIELD, JsonEncoder::encode(&record.node)?),
            ("name", JsonEncoder::encode(&record.name)?),
            ("image", JsonEncoder::encode(&record.image)?),
            ("image_id", JsonEncoder::encode(&record.image_id)?),
            ("labels", JsonEncoder::encode(&record.labels)?),
            (
                "additional_labels",
                JsonEncoder::encode(&record.additional_labels)?,
            ),
        ];
        for (field, value) in fields {
            self.kv
                .put(&format!("{}/{}/{}", PREFIX, record.id, field), value)
                .await?;
        }
        Ok(())
    }

    async fn reload_if_stale(&self, id: &str, arc: &Arc<Mutex<ContainerEntry>>) -> Result<()> {
        if !arc.lock().unwrap().stale {
            return Ok(());
        }
        let node = self.read_field::<String>(id, ANCHOR_FIELD).await;
        let name = self.read_field::<String>(id, "name").await;
        let image = self.read_field::<String>(id, "image").await;
        let image_id = self.read_field::<Option<String>>(id, "image_id").await;
        let labels = self
            .read_field::<HashMap<String, String>>(id, "labels")
            .await;
        let additional = self
            .read_field::<HashMap<String, String>>(id, "additional_labels")
            .await;

        let mut entry = arc.lock().unwrap();
        if !entry.stale {
            return Ok(());
        }
        if let Some(node) = node {
            entry.record.node = node;
        }
        if let Some(name) = name {
            entry.record.name = name;
        }
        if let Some(image) = image {
            entry.record.image = image;
        }
        if let Some(image_id) = image_id {
            entry.record.image_id = image_id;
        }
        if let Some(labels) = labels {
            entry.record.labels = labels;
        }
        if let Some(additional) = additional {
            entry.record.additional_labels = additional;
        }
        entry.stale = false;
        Ok(())
    }

    async fn read_field<T: serde::de::DeserializeOwned>(&self, id: &str, field: &str) -> Option<T> {
        let key = format!("{}/{}/{}", PREFIX, id, field);
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

    pub async fn handle_kv_event(&self, event: &KvEvent) -> Result<()> {
        let Some((id, field)) = parse_key(&event.key) else {
            return Ok(());
        };
        match event.kind {
            KvEventKind::Create | KvEventKind::Update => {
                let arc = self
                    .entries
                    .entry(id.to_string())
                    .or_insert_with(|| {
                        Arc::new(Mutex::new(ContainerEntry {
                            record: ContainerRecord {
                                id: id.to_string(),
                                ..Default::default()
                            },
                            stale: false,
                        }))
                    })
                    .value()
                    .clone();
                arc.lock().unwrap().stale = true;
            }
            KvEventKind::Delete => {
                if field != ANCHOR_FIELD {
                    if let Some(arc) = self.entry(id) {
                        arc.lock().unwrap().stale = true;
                    }
                    return Ok(());
                }
                if let Some((_, arc)) = self.entries.remove(id) {
                    let record = arc.lock().unwrap().record.clone();
                    self.fire(ContainerEventKind::Deleted, record);
                } else {
                    self.fire(
                        ContainerEventKind::Deleted,
                        ContainerRecord {
                            id: id.to_string(),
                            ..Default::default()
                        },
                    );
                }
            }
        }
        Ok(())
    }
}

fn parse_key(key: &str) -> Option<(&str, &str)> {
    let mut parts = key.splitn(3, '/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(PREFIX), Some(id), Some(field)) if !id.is_empty() && !field.is_empty() => {
            Some((id, field))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::kv::MemoryKv;

    fn inventory() -> (ContainerInventory, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        (
            ContainerInventory::new(Arc::new(MemoryKv::new()), bus.clone()),
            bus,
        )
    }

    fn record(id: &str, node: &str) -> ContainerRecord {
        ContainerRecord {
            id: id.to_string(),
            name: format!("app-{id}"),
            node: node.to_string(),
            image: "reg/app:1.0".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_or_update_roundtrip() -> Result<()> {
        let (inventory, _bus) = inventory();
        inventory.create_or_update(record("c1", "n1")).await?;
        let got = inventory.get("c1").await?.unwrap();
        assert_eq!(got.name, "app-c1");
        assert_eq!(got.node, "n1");
        assert_eq!(inventory.list_by_node("n1").len(), 1);
        assert_eq!(inventory.list_by_node("n2").len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_creation_yields_one_entry() -> Result<()> {
        let (inventory, _bus) = inventory();
        let inventory = Arc::new(inventory);
        let mut handles = vec![];
        for _ in 0..8 {
            let inv = inventory.clone();
            handles.push(tokio::spawn(async move {
                inv.create_or_update(record("c1", "n1")).await
            }));
        }
        for h in handles {
            h.await.unwrap()?;
        }
        assert_eq!(inventory.list().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_node_rejected() {
        let (inventory, _bus) = inventory();
        let mut r = record("c1", "n1");
        r.node = String::new();
        assert!(inventory.create_or_update(r).await.is_err());
    }

    #[tokio::test]
    async fn test_additional_labels_survive_upsert() -> Result<()> {
        let (inventory, _bus) = inventory();
        inventory.create_or_update(record("c1", "n1")).await?;
        inventory
            .set_additional_labels(
                "c1",
                HashMap::from([("owner".to_string(), "team-a".to_string())]),
            )
            .await?;
        // A reconcile upsert from the daemon listing has no user labels.
        inventory.create_or_update(record("c1", "n1")).await?;
        let got = inventory.get("c1").await?.unwrap();
        assert_eq!(got.additional_labels.get("owner").unwrap(), "team-a");
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_node_containers() -> Result<()> {
        let (inventory, bus) = inventory();
        let mut rx = bus.subscribe_containers();
        inventory.create_or_update(record("c1", "n1")).await?;
        inventory.create_or_update(record("c2", "n1")).await?;
        inventory.create_or_update(record("c3", "n2")).await?;
        // Drain the create events.
        while rx.try_recv().is_ok() {}

        let removed = inventory.remove_node_containers("n1").await?;
        assert_eq!(removed.len(), 2);
        assert_eq!(inventory.list().len(), 1);
        let mut deleted = 0;
        while let Ok(ev) = rx.try_recv() {
            assert_eq!(ev.kind, ContainerEventKind::Deleted);
            deleted += 1;
        }
        assert_eq!(deleted, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_update_event_suppressed_when_unchanged() -> Result<()> {
        let (inventory, bus) = inventory();
        let mut rx = bus.subscribe_containers();
        inventory.create_or_update(record("c1", "n1")).await?;
        assert_eq!(rx.try_recv().unwrap().kind, ContainerEventKind::Created);
        inventory.create_or_update(record("c1", "n1")).await?;
        assert!(rx.try_recv().is_err());
        Ok(())
    }
}
