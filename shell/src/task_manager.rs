//! Ownership of spawned background tasks.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Owns spawned tasks and cancels them when dropped, so a component
/// stops running when the last handle holding its manager is dropped.
pub struct TaskManager {
    cancel_token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl TaskManager {
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            tasks: Vec::new(),
            shutdown_timeout,
        }
    }

    /// Spawn a task. It receives a child token that is cancelled when
    /// the manager shuts down or is dropped.
    pub fn spawn<F, Fut>(&mut self, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(tokio::spawn(task(self.cancel_token.child_token())));
    }

    /// Cancel all tasks and wait for them to finish, up to the shutdown
    /// timeout. Tasks still running after the timeout are aborted.
    pub async fn shutdown(mut self) {
        self.cancel_token.cancel();
        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        for mut task in self.tasks.drain(..) {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                log::warn!("Task did not stop within the shutdown timeout. Aborting");
                task.abort();
            }
        }
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}
