use futures::future::join_all;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    Cancelling,
    Terminated,
}

/// How the process ends; `main` turns it into the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Signal received and every unit stopped within the grace period.
    Drained,
    /// Startup failed, lease retries were abandoned, or the cluster manager failed.
    Fatal,
    /// Signal received but some unit was still running when the grace period ran out.
    GraceExpired,
    /// The node manager stopped although no signal arrived.
    NodeManagerStopped,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Drained => 0,
            ExitStatus::Fatal => 1,
            ExitStatus::GraceExpired => 2,
            ExitStatus::NodeManagerStopped => 3,
        }
    }
}

impl From<ExitStatus> for std::process::ExitCode {
    fn from(status: ExitStatus) -> Self {
        std::process::ExitCode::from(status.code() as u8)
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitStatus::Drained => "drained",
            ExitStatus::Fatal => "fatal",
            ExitStatus::GraceExpired => "grace period expired",
            ExitStatus::NodeManagerStopped => "node manager stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainResult {
    Drained,
    GraceExpired,
}

/// Running -> Cancelling -> Terminated, with a bounded wait in between.
pub struct ShutdownCoordinator {
    grace: Duration,
    phase: watch::Sender<ShutdownPhase>,
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration) -> Self {
        let (phase, _) = watch::channel(ShutdownPhase::Running);
        Self { grace, phase }
    }

    pub fn phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase.subscribe()
    }

    /// Wait for `units` to finish, at most for the grace period. Units still
    /// running after that are left behind and the phase becomes Terminated
    /// regardless.
    pub async fn drain<I, F>(&self, units: I) -> DrainResult
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = ()>,
    {
        self.phase.send_replace(ShutdownPhase::Cancelling);
        info!(grace = ?self.grace, "waiting for running units to stop");
        let result = match timeout(self.grace, join_all(units)).await {
            Ok(_) => DrainResult::Drained,
            Err(_) => {
                warn!(grace = ?self.grace, "grace period expired with units still running");
                DrainResult::GraceExpired
            }
        };
        self.phase.send_replace(ShutdownPhase::Terminated);
        result
    }
}

/// Drive `main_fn` on a fresh multi-threaded runtime, then drop the runtime
/// without waiting for anything still running.
///
/// A unit abandoned by an expired grace period can sit in a blocking pool
/// thread or a non-yielding loop; the default runtime drop would wait for it
/// and the process would never exit.
pub fn block_until_exit<F>(main_fn: F) -> std::io::Result<ExitStatus>
where
    F: Future<Output = ExitStatus>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let status = runtime.block_on(main_fn);
    runtime.shutdown_background();
    Ok(status)
}
