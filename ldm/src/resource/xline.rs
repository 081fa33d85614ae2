use async_trait::async_trait;
use common::LocalDisk;
use etcd_client::{EventType, WatchStream, Watcher};
use futures::StreamExt;
use futures::stream;
use std::collections::VecDeque;
use tracing::warn;

use super::{BackendError, ResourceBackend, WatchEvent, WatchEventStream};
use crate::api::xlinestore::XlineStore;

pub struct XlineResourceBackend {
    store: XlineStore,
}

impl XlineResourceBackend {
    pub fn new(store: XlineStore) -> Self {
        Self { store }
    }
}

fn unavailable(e: anyhow::Error) -> BackendError {
    BackendError::Unavailable(format!("{e:#}"))
}

fn decode(name: &str, yaml: &str) -> Result<LocalDisk, BackendError> {
    serde_yaml::from_str(yaml).map_err(|source| BackendError::Decode {
        name: name.to_string(),
        source,
    })
}

#[async_trait]
impl ResourceBackend for XlineResourceBackend {
    async fn list(&self) -> Result<(Vec<LocalDisk>, i64), BackendError> {
        let (items, rev) = self
            .store
            .localdisks_snapshot_with_rev()
            .await
            .map_err(unavailable)?;
        let mut disks = Vec::with_capacity(items.len());
        for (name, yaml) in items {
            match decode(&name, &yaml) {
                Ok(disk) => disks.push(disk),
                Err(e) => warn!("Ignoring bad localdisk object: {e}"),
            }
        }
        Ok((disks, rev))
    }

    async fn get(&self, name: &str) -> Result<Option<LocalDisk>, BackendError> {
        match self
            .store
            .get_localdisk_yaml(name)
            .await
            .map_err(unavailable)?
        {
            Some(yaml) => Ok(Some(decode(name, &yaml)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, disk: &LocalDisk) -> Result<(), BackendError> {
        let yaml = serde_yaml::to_string(disk)?;
        self.store
            .insert_localdisk_yaml(disk.name(), &yaml)
            .await
            .map_err(unavailable)
    }

    async fn delete(&self, name: &str) -> Result<(), BackendError> {
        self.store.delete_localdisk(name).await.map_err(unavailable)
    }

    async fn watch(&self, since: i64) -> Result<WatchEventStream, BackendError> {
        let (watcher, stream) = self
            .store
            .watch_localdisks(since)
            .await
            .map_err(unavailable)?;
        Ok(into_event_stream(self.store.clone(), watcher, stream))
    }
}

struct WatchState {
    store: XlineStore,
    // dropping the watcher cancels the watch, so it lives with the stream
    _watcher: Watcher,
    stream: WatchStream,
    pending: VecDeque<Result<WatchEvent, BackendError>>,
}

fn into_event_stream(store: XlineStore, watcher: Watcher, stream: WatchStream) -> WatchEventStream {
    let state = WatchState {
        store,
        _watcher: watcher,
        stream,
        pending: VecDeque::new(),
    };
    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(ev) = st.pending.pop_front() {
                return Some((ev, st));
            }
            let resp = match st.stream.message().await {
                Ok(Some(resp)) => resp,
                Ok(None) => return None,
                Err(e) => {
                    return Some((Err(BackendError::Unavailable(e.to_string())), st));
                }
            };
            if resp.canceled() {
                warn!("localdisk watch canceled by server");
                return None;
            }
            for event in resp.events() {
                let Some(kv) = event.kv() else { continue };
                let name = st.store.localdisk_name(kv.key());
                let item = match event.event_type() {
                    EventType::Put => {
                        decode(&name, &String::from_utf8_lossy(kv.value())).map(WatchEvent::Put)
                    }
                    EventType::Delete => Ok(WatchEvent::Delete(name)),
                };
                st.pending.push_back(item);
            }
        }
    })
    .boxed()
}
