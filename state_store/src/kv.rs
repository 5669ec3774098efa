use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

/// Watch events delivered by the store. At-least-once, no ordering
/// guarantee across unrelated keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum KvEventKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct KvEvent {
    pub kind: KvEventKind,
    pub key: String,
}

/// The external key-value storage boundary. Assumed linearizable with
/// watch/subscribe semantics; replication and consensus are the store's
/// problem, not ours.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
    /// Keys under a prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    fn subscribe(&self) -> broadcast::Receiver<KvEvent>;
}

/// In-memory implementation used by tests and dev mode.
pub struct MemoryKv {
    entries: DashMap<String, Vec<u8>>,
    events_tx: broadcast::Sender<KvEvent>,
}

impl MemoryKv {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(1024);
        Self {
            entries: DashMap::new(),
            events_tx,
        }
    }

    fn emit(&self, kind: KvEventKind, key: &str) {
        let _ = self.events_tx.send(KvEvent {
            kind,
            key: key.to_string(),
        });
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let previous = self.entries.insert(key.to_string(), value);
        let kind = if previous.is_some() {
            KvEventKind::Update
        } else {
            KvEventKind::Create
        };
        self.emit(kind, key);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        if self.entries.remove(key).is_some() {
            self.emit(KvEventKind::Delete, key);
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn subscribe(&self) -> broadcast::Receiver<KvEvent> {
        self.events_tx.subscribe()
    }
}
