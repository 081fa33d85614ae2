use async_trait::async_trait;
use common::LocalDisk;
use futures::StreamExt;
use futures::stream;
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::{RwLock, broadcast};

use super::{BackendError, ResourceBackend, WatchEvent, WatchEventStream};

const HISTORY_LIMIT: usize = 1024;

/// In-memory backend for standalone mode and tests. Keeps a short event
/// history so a watch started from a listed revision misses nothing.
pub struct MemoryBackend {
    inner: RwLock<Inner>,
    events: broadcast::Sender<(i64, WatchEvent)>,
}

struct Inner {
    objects: BTreeMap<String, LocalDisk>,
    revision: i64,
    history: VecDeque<(i64, WatchEvent)>,
    unavailable: bool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(HISTORY_LIMIT);
        Self {
            inner: RwLock::new(Inner {
                objects: BTreeMap::new(),
                revision: 0,
                history: VecDeque::new(),
                unavailable: false,
            }),
            events,
        }
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        self.inner.write().await.unavailable = unavailable;
    }

    fn record(&self, inner: &mut Inner, event: WatchEvent) {
        inner.revision += 1;
        if inner.history.len() == HISTORY_LIMIT {
            inner.history.pop_front();
        }
        inner.history.push_back((inner.revision, event.clone()));
        let _ = self.events.send((inner.revision, event));
    }
}

fn check(inner: &Inner) -> Result<(), BackendError> {
    if inner.unavailable {
        return Err(BackendError::Unavailable("memory backend switched off".into()));
    }
    Ok(())
}

#[async_trait]
impl ResourceBackend for MemoryBackend {
    async fn list(&self) -> Result<(Vec<LocalDisk>, i64), BackendError> {
        let inner = self.inner.read().await;
        check(&inner)?;
        Ok((inner.objects.values().cloned().collect(), inner.revision))
    }

    async fn get(&self, name: &str) -> Result<Option<LocalDisk>, BackendError> {
        let inner = self.inner.read().await;
        check(&inner)?;
        Ok(inner.objects.get(name).cloned())
    }

    async fn put(&self, disk: &LocalDisk) -> Result<(), BackendError> {
        let mut inner = self.inner.write().await;
        check(&inner)?;
        let mut disk = disk.clone();
        disk.metadata.resource_version = inner.revision + 1;
        inner.objects.insert(disk.name().to_string(), disk.clone());
        self.record(&mut *inner, WatchEvent::Put(disk));
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), BackendError> {
        let mut inner = self.inner.write().await;
        check(&inner)?;
        if inner.objects.remove(name).is_some() {
            self.record(&mut *inner, WatchEvent::Delete(name.to_string()));
        }
        Ok(())
    }

    async fn watch(&self, since: i64) -> Result<WatchEventStream, BackendError> {
        let inner = self.inner.read().await;
        check(&inner)?;
        let rx = self.events.subscribe();
        let replay: Vec<_> = inner
            .history
            .iter()
            .filter(|(rev, _)| *rev >= since)
            .map(|(_, ev)| Ok(ev.clone()))
            .collect();
        drop(inner);

        // a lagging watcher gets one error and the stream ends, so the
        // informer relists instead of missing events
        let live = stream::unfold(Some(rx), |rx| async move {
            let mut rx = rx?;
            match rx.recv().await {
                Ok((_, ev)) => Some((Ok(ev), Some(rx))),
                Err(broadcast::error::RecvError::Lagged(missed)) => Some((
                    Err(BackendError::Unavailable(format!(
                        "watch fell behind by {missed} events"
                    ))),
                    None,
                )),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });
        Ok(stream::iter(replay).chain(live).boxed())
    }
}
