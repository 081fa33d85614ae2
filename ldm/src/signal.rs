use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// The single process-wide cancellation source.
///
/// The token moves from active to cancelled exactly once, on the first
/// SIGINT or SIGTERM (or [`SignalGate::trigger`]). Every other component gets a
/// clone or a child of [`SignalGate::token`]; nothing else listens for signals.
#[derive(Clone, Default)]
pub struct SignalGate {
    token: CancellationToken,
    fired: Arc<AtomicBool>,
}

impl SignalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the gate and spawn the OS signal listener. Must run inside a tokio runtime.
    pub fn install() -> std::io::Result<Self> {
        let gate = SignalGate::new();
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        let listener = gate.clone();
        tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    s = sigint.recv() => s.map(|_| "SIGINT"),
                    s = sigterm.recv() => s.map(|_| "SIGTERM"),
                };
                match name {
                    Some(name) => {
                        listener.trigger(name);
                    }
                    None => {
                        error!("signal stream closed, cancelling");
                        listener.trigger("signal stream closed");
                        return;
                    }
                }
            }
        });
        Ok(gate)
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancel the shared token. Returns `true` only for the call that performed
    /// the transition; later calls are ignored.
    pub fn trigger(&self, reason: &str) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            info!(reason, "Receive exit signal.");
            self.token.cancel();
            true
        } else {
            debug!(reason, "already shutting down, signal ignored");
            false
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}
