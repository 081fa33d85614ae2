use anyhow::anyhow;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{LeaseError, LeaseState, LeaseStore, LeaseTiming};

/// How one period of leadership ended.
enum Tenure {
    /// The parent token was cancelled.
    Cancelled,
    /// Renewal failed past the deadline or the store reported the lease gone.
    Lost,
    /// The callback returned `Ok` on its own.
    Finished,
    Failed(anyhow::Error),
}

/// Runs a callback only while this process holds the lease for a role.
///
/// Leadership is a task that owns a child token per acquisition: losing the
/// lease cancels that child and re-enters acquisition, and the next
/// acquisition calls the callback again with a fresh child. Losing leadership
/// is never treated as fatal.
///
/// Stepping down happens `renew_deadline` after the last good renewal, which
/// is before the lease expires in the store, so a successor can only take
/// over once the previous leader's callback was told to stop. A callback that
/// ignores its token can still overlap with the successor until it returns.
pub struct LeaseGatedRunner {
    store: Arc<dyn LeaseStore>,
    timing: LeaseTiming,
    state: watch::Sender<LeaseState>,
}

impl LeaseGatedRunner {
    pub fn new(store: Arc<dyn LeaseStore>, timing: LeaseTiming) -> Self {
        let (state, _) = watch::channel(LeaseState::default());
        Self {
            store,
            timing,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LeaseState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> LeaseState {
        self.state.borrow().clone()
    }

    /// Acquire the lease for `role_key` as `namespace/identity` and run
    /// `run_fn` while it is held, until `cancel` fires.
    ///
    /// Returns `Ok(())` on cancellation. Errors are fatal to the caller:
    /// an empty role, store retries abandoned by `max_attempts`, or the
    /// callback itself failing while leading.
    pub async fn run_with_lease<F, Fut>(
        &self,
        namespace: &str,
        identity: &str,
        role_key: &str,
        cancel: CancellationToken,
        run_fn: F,
    ) -> Result<(), LeaseError>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if role_key.trim().is_empty() {
            return Err(LeaseError::InvalidRole);
        }
        let holder = format!("{namespace}/{identity}");
        let retry_period = self.timing.retry_period;
        let mut failures = 0u32;
        let mut backoff = retry_period;

        info!(role = role_key, holder = %holder, "attempting to acquire leader lease");
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let attempted_at = Instant::now();
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = timeout(
                    self.timing.renew_deadline,
                    self.store.try_acquire(role_key, &holder, self.timing.lease_duration),
                ) => res.unwrap_or_else(|_| {
                    Err(LeaseError::Unavailable(format!(
                        "acquire did not complete within {:?}",
                        self.timing.renew_deadline
                    )))
                }),
            };
            match attempt {
                Ok(true) => {
                    failures = 0;
                    backoff = retry_period;
                    let tenure = self
                        .lead(role_key, &holder, attempted_at, &cancel, &run_fn)
                        .await;
                    self.release(role_key, &holder).await;
                    match tenure {
                        Tenure::Cancelled => return Ok(()),
                        Tenure::Failed(error) => {
                            error!(role = role_key, holder = %holder, "leader callback failed: {error:#}");
                            return Err(LeaseError::LeaderFailed {
                                role: role_key.to_string(),
                                error,
                            });
                        }
                        Tenure::Lost => {
                            warn!(role = role_key, holder = %holder, "stopped leading, re-entering acquisition")
                        }
                        Tenure::Finished => {
                            info!(role = role_key, holder = %holder, "leader callback returned, re-entering acquisition")
                        }
                    }
                    if !sleep_or_cancel(&cancel, retry_period).await {
                        return Ok(());
                    }
                }
                Ok(false) => {
                    debug!(role = role_key, holder = %holder, "lease held by another process");
                    if !sleep_or_cancel(&cancel, retry_period).await {
                        return Ok(());
                    }
                }
                Err(e) => {
                    failures += 1;
                    if let Some(max) = self.timing.max_attempts
                        && failures >= max
                    {
                        error!(role = role_key, attempts = failures, "giving up on lease: {e}");
                        return Err(LeaseError::RetriesExhausted {
                            role: role_key.to_string(),
                            attempts: failures,
                        });
                    }
                    warn!(
                        role = role_key,
                        attempt = failures,
                        "failed to acquire lease: {e}, retrying in {backoff:?}"
                    );
                    if !sleep_or_cancel(&cancel, jittered(backoff)).await {
                        return Ok(());
                    }
                    backoff = std::cmp::min(backoff * 2, self.timing.max_backoff);
                }
            }
        }
    }

    async fn lead<F, Fut>(
        &self,
        role: &str,
        holder: &str,
        acquired_at: Instant,
        cancel: &CancellationToken,
        run_fn: &F,
    ) -> Tenure
    where
        F: Fn(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.state.send_replace(LeaseState::held_by(holder));
        info!(role, holder, "became leader");

        let child = cancel.child_token();
        let mut leader = tokio::spawn(run_fn(child.clone()));
        let period = self.timing.retry_period;
        let mut renew = interval_at(Instant::now() + period, period);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // counted from when the request was sent, never from the reply
        let mut last_renewed = acquired_at;

        let tenure = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    child.cancel();
                    let _ = (&mut leader).await;
                    break Tenure::Cancelled;
                }
                res = &mut leader => {
                    break match res {
                        Ok(Ok(())) if cancel.is_cancelled() => Tenure::Cancelled,
                        Ok(Ok(())) => Tenure::Finished,
                        Ok(Err(e)) => Tenure::Failed(e),
                        Err(e) => Tenure::Failed(anyhow!("leader task aborted: {e}")),
                    };
                }
                _ = renew.tick() => {
                    let deadline = self.timing.renew_deadline;
                    let sent_at = Instant::now();
                    let remaining = deadline.saturating_sub(last_renewed.elapsed());
                    let renewed = tokio::select! {
                        _ = cancel.cancelled() => continue,
                        res = timeout(remaining, self.store.renew(role, holder, self.timing.lease_duration)) => res,
                    };
                    match renewed {
                        Ok(Ok(true)) => {
                            last_renewed = sent_at;
                            continue;
                        }
                        Ok(Ok(false)) => warn!(role, holder, "lease lost"),
                        Ok(Err(e)) if last_renewed.elapsed() < deadline => {
                            warn!(role, holder, "failed to renew lease: {e}");
                            continue;
                        }
                        Ok(Err(e)) => error!(role, holder, "failed to renew lease within {deadline:?}: {e}"),
                        Err(_) => error!(role, holder, "lease renewal did not complete within {deadline:?}"),
                    }
                    child.cancel();
                    let _ = (&mut leader).await;
                    break Tenure::Lost;
                }
            }
        };

        child.cancel();
        self.state.send_replace(LeaseState::default());
        tenure
    }

    async fn release(&self, role: &str, holder: &str) {
        match timeout(self.timing.retry_period, self.store.release(role, holder)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(role, holder, "failed to release lease: {e}"),
            Err(_) => debug!(role, holder, "lease release timed out, leaving it to expire"),
        }
    }
}

/// Sleep for `dur`; returns `false` if `cancel` fired first.
async fn sleep_or_cancel(cancel: &CancellationToken, dur: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(dur) => true,
    }
}

fn jittered(dur: Duration) -> Duration {
    let max_jitter = (dur.as_millis() / 5) as u64;
    if max_jitter == 0 {
        return dur;
    }
    dur + Duration::from_millis(rand::rng().random_range(0..=max_jitter))
}
