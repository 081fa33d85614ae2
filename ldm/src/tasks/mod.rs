//! Independent background loops started next to the managers.
//!
//! Each task runs in its own tokio task. A failure, error or panic, is
//! logged with the task's name and stays contained; nothing is restarted.

pub mod csi;
pub mod disk_monitor;
pub mod smart;

use futures::FutureExt;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

type TaskFn = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Informational only: the supervisor never restarts a task either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    /// One attempt; a failure ends the task for the life of the process.
    #[default]
    Never,
    /// The task owns a retry loop and recovers from its own errors.
    Internal,
}

pub struct BackgroundTask {
    name: String,
    run: TaskFn,
    restart_policy: RestartPolicy,
}

impl BackgroundTask {
    pub fn new<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        BackgroundTask {
            name: name.into(),
            run: Box::new(move |token| run(token).boxed()),
            restart_policy: RestartPolicy::Never,
        }
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        self.restart_policy
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Finished,
    Failed(String),
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Running => write!(f, "running"),
            TaskState::Finished => write!(f, "finished"),
            TaskState::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

pub struct TaskHandle {
    name: String,
    state: watch::Receiver<TaskState>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        *self.state.borrow() == TaskState::Running
    }

    pub fn state(&self) -> TaskState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TaskState> {
        self.state.clone()
    }

    /// Wait for the task to end. Its outcome has already been logged.
    pub async fn join(self) {
        let _ = self.join.await;
    }
}

/// Spawn every task at once and return without waiting on any of them.
pub fn launch(tasks: Vec<BackgroundTask>, token: &CancellationToken) -> Vec<TaskHandle> {
    tasks
        .into_iter()
        .map(|task| spawn_task(task, token.child_token()))
        .collect()
}

fn spawn_task(task: BackgroundTask, token: CancellationToken) -> TaskHandle {
    let BackgroundTask {
        name,
        run,
        restart_policy,
    } = task;
    let (state_tx, state) = watch::channel(TaskState::Running);
    info!(task = %name, ?restart_policy, "starting background task");

    // the task body runs in its own tokio task so a panic surfaces here
    // as a JoinError instead of unwinding through the supervisor
    let inner = tokio::spawn(run(token));
    let task_name = name.clone();
    let join = tokio::spawn(async move {
        let end = match inner.await {
            Ok(Ok(())) => {
                info!(task = %task_name, "background task finished");
                TaskState::Finished
            }
            Ok(Err(e)) => {
                error!(task = %task_name, "background task failed: {e:#}");
                TaskState::Failed(format!("{e:#}"))
            }
            Err(e) => {
                error!(task = %task_name, "background task aborted: {e}");
                TaskState::Failed(e.to_string())
            }
        };
        state_tx.send_replace(end);
    });

    TaskHandle { name, state, join }
}
