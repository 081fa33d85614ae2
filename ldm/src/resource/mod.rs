//! Access to the resource backend holding `LocalDisk` objects.

pub mod memory;
pub mod xline;

use async_trait::async_trait;
use common::LocalDisk;
use futures::stream::BoxStream;

pub use memory::MemoryBackend;
pub use xline::XlineResourceBackend;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("resource backend unavailable: {0}")]
    Unavailable(String),
    #[error("malformed object {name}: {source}")]
    Decode {
        name: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error(transparent)]
    Encode(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Put(LocalDisk),
    Delete(String),
}

impl WatchEvent {
    pub fn name(&self) -> &str {
        match self {
            WatchEvent::Put(disk) => disk.name(),
            WatchEvent::Delete(name) => name,
        }
    }
}

pub type WatchEventStream = BoxStream<'static, Result<WatchEvent, BackendError>>;

#[async_trait]
pub trait ResourceBackend: Send + Sync {
    /// All objects and the revision they were read at.
    async fn list(&self) -> Result<(Vec<LocalDisk>, i64), BackendError>;

    async fn get(&self, name: &str) -> Result<Option<LocalDisk>, BackendError>;

    async fn put(&self, disk: &LocalDisk) -> Result<(), BackendError>;

    async fn delete(&self, name: &str) -> Result<(), BackendError>;

    /// Changes after revision `since`. The stream ends when the backend drops the watch.
    async fn watch(&self, since: i64) -> Result<WatchEventStream, BackendError>;
}
