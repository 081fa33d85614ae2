//! Leadership leases keyed by role.
//!
//! A [`LeaseStore`] is the coordination store capability: atomic acquire,
//! renew and release of a time-bounded record per role key. The
//! [`runner::LeaseGatedRunner`] builds leader-only execution on top of it.

pub mod memory;
pub mod runner;
pub mod xline;

use async_trait::async_trait;
use std::time::Duration;

pub use memory::MemoryLeaseStore;
pub use runner::LeaseGatedRunner;
pub use xline::XlineLeaseStore;

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("lease role key must not be empty")]
    InvalidRole,
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
    #[error("gave up acquiring lease {role} after {attempts} failed attempts")]
    RetriesExhausted { role: String, attempts: u32 },
    #[error("leader callback for {role} failed: {error:#}")]
    LeaderFailed { role: String, error: anyhow::Error },
}

/// Lease as observed by the process running the runner.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeaseState {
    pub held: bool,
    pub holder_identity: Option<String>,
}

impl LeaseState {
    pub fn held_by(holder: &str) -> Self {
        LeaseState {
            held: true,
            holder_identity: Some(holder.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LeaseTiming {
    /// How long a granted lease stays valid without renewal.
    pub lease_duration: Duration,
    /// How long the leader keeps acting after its last successful renewal.
    /// Must be shorter than `lease_duration`.
    pub renew_deadline: Duration,
    /// Renewal period, and the wait between acquisition attempts.
    pub retry_period: Duration,
    pub max_backoff: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for LeaseTiming {
    fn default() -> Self {
        LeaseTiming {
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Take the lease for `role` if it is free, expired, or already ours.
    /// `Ok(false)` means another holder owns a live lease.
    async fn try_acquire(&self, role: &str, holder: &str, ttl: Duration)
    -> Result<bool, LeaseError>;

    /// Extend our lease. `Ok(false)` means it was lost to expiry or another holder.
    async fn renew(&self, role: &str, holder: &str, ttl: Duration) -> Result<bool, LeaseError>;

    /// Give the lease up if we still hold it.
    async fn release(&self, role: &str, holder: &str) -> Result<(), LeaseError>;

    async fn holder(&self, role: &str) -> Result<Option<String>, LeaseError>;
}
