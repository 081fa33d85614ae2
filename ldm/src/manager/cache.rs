use common::{LocalDisk, NODE_NAME_FIELD};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{RwLock, watch};

use super::ManagerError;
use super::scheme::Scheme;
use crate::resource::WatchEvent;

pub type IndexFn = Arc<dyn Fn(&LocalDisk) -> Vec<String> + Send + Sync>;

/// Field index over the cache: `field_path` names the index, `extractor`
/// returns the values an object is filed under.
#[derive(Clone)]
pub struct LookupIndex {
    pub field_path: String,
    pub extractor: IndexFn,
}

impl LookupIndex {
    pub fn new<F>(field_path: &str, extractor: F) -> Self
    where
        F: Fn(&LocalDisk) -> Vec<String> + Send + Sync + 'static,
    {
        LookupIndex {
            field_path: field_path.to_string(),
            extractor: Arc::new(extractor),
        }
    }
}

/// Index of disks by owning node.
pub fn node_name_index() -> LookupIndex {
    LookupIndex::new(NODE_NAME_FIELD, |disk| vec![disk.spec.node_name.clone()])
}

#[derive(Default)]
struct Store {
    objects: HashMap<String, LocalDisk>,
    extractors: HashMap<String, IndexFn>,
    // field -> value -> object names
    indices: HashMap<String, HashMap<String, BTreeSet<String>>>,
}

impl Store {
    fn unindex(&mut self, disk: &LocalDisk) {
        for (field, extract) in &self.extractors {
            if let Some(index) = self.indices.get_mut(field) {
                for value in extract(disk) {
                    if let Some(names) = index.get_mut(&value) {
                        names.remove(disk.name());
                        if names.is_empty() {
                            index.remove(&value);
                        }
                    }
                }
            }
        }
    }

    fn index(&mut self, disk: &LocalDisk) {
        for (field, extract) in &self.extractors {
            let index = self.indices.entry(field.clone()).or_default();
            for value in extract(disk) {
                index
                    .entry(value)
                    .or_default()
                    .insert(disk.name().to_string());
            }
        }
    }

    fn upsert(&mut self, disk: LocalDisk) {
        if let Some(old) = self.objects.remove(disk.name()) {
            self.unindex(&old);
        }
        self.index(&disk);
        self.objects.insert(disk.name().to_string(), disk);
    }

    fn remove(&mut self, name: &str) {
        if let Some(old) = self.objects.remove(name) {
            self.unindex(&old);
        }
    }
}

/// A manager's local copy of the backend, filled by its informer.
/// Indexes must be registered before the informer first syncs.
pub struct ResourceCache {
    store: RwLock<Store>,
    started: watch::Sender<bool>,
}

impl Default for ResourceCache {
    fn default() -> Self {
        let (started, _) = watch::channel(false);
        Self {
            store: RwLock::default(),
            started,
        }
    }
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn index_field(
        &self,
        scheme: &Scheme,
        kind: &str,
        index: LookupIndex,
    ) -> Result<(), ManagerError> {
        if !scheme.recognizes(kind) {
            return Err(ManagerError::KindNotRegistered(kind.to_string()));
        }
        if self.is_started() {
            return Err(ManagerError::CacheStarted(index.field_path));
        }
        let mut store = self.store.write().await;
        if store.extractors.contains_key(&index.field_path) {
            return Err(ManagerError::IndexConflict(index.field_path));
        }
        store
            .indices
            .insert(index.field_path.clone(), HashMap::new());
        store.extractors.insert(index.field_path, index.extractor);
        Ok(())
    }

    /// Swap the whole content, as after a fresh list.
    pub async fn replace(&self, objects: Vec<LocalDisk>) {
        let mut store = self.store.write().await;
        store.objects.clear();
        for index in store.indices.values_mut() {
            index.clear();
        }
        for disk in objects {
            store.upsert(disk);
        }
    }

    pub async fn apply(&self, event: &WatchEvent) {
        let mut store = self.store.write().await;
        match event {
            WatchEvent::Put(disk) => store.upsert(disk.clone()),
            WatchEvent::Delete(name) => store.remove(name),
        }
    }

    pub fn mark_started(&self) {
        self.started.send_replace(true);
    }

    pub fn is_started(&self) -> bool {
        *self.started.borrow()
    }

    /// Resolve once the informer has filled the cache for the first time.
    pub async fn wait_started(&self) {
        let mut started = self.started.subscribe();
        // the sender lives as long as `self`, so this cannot fail
        let _ = started.wait_for(|s| *s).await;
    }

    pub async fn get(&self, name: &str) -> Option<LocalDisk> {
        self.store.read().await.objects.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<LocalDisk> {
        self.store.read().await.objects.values().cloned().collect()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.store.read().await.objects.keys().cloned().collect()
    }

    pub async fn by_index(&self, field: &str, value: &str) -> Result<Vec<LocalDisk>, ManagerError> {
        let store = self.store.read().await;
        let index = store
            .indices
            .get(field)
            .ok_or_else(|| ManagerError::IndexNotFound(field.to_string()))?;
        Ok(index
            .get(value)
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| store.objects.get(n).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    pub fn reader(self: &Arc<Self>) -> CacheReader {
        CacheReader {
            cache: self.clone(),
        }
    }
}

/// Read-only view of a manager's cache, handed to background tasks.
#[derive(Clone)]
pub struct CacheReader {
    cache: Arc<ResourceCache>,
}

impl CacheReader {
    pub async fn get(&self, name: &str) -> Option<LocalDisk> {
        self.cache.get(name).await
    }

    pub async fn list(&self) -> Vec<LocalDisk> {
        self.cache.list().await
    }

    pub async fn by_index(&self, field: &str, value: &str) -> Result<Vec<LocalDisk>, ManagerError> {
        self.cache.by_index(field, value).await
    }

    pub fn has_synced(&self) -> bool {
        self.cache.is_started()
    }

    pub async fn wait_synced(&self) {
        self.cache.wait_started().await
    }
}
