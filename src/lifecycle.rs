//! Cooperative task groups with staged shutdown.
//!
//! Every long-running loop in the process follows the same shape: it takes a
//! cancellation token, owns its ticker, answers cancellation before any
//! other branch, and its join handle is the stopped sentinel. Groups are
//! shut down in reverse dependency order by the caller, each within a
//! deadline.

use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Grace period for the background-job stage.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(15);

/// A named set of tasks sharing one cancellation token.
pub struct TaskGroup {
    name: &'static str,
    cancel: CancellationToken,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl TaskGroup {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn<F>(&mut self, task_name: impl Into<String>, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let task_name = task_name.into();
        trace!(message = "spawning task", group = self.name, task = %task_name);
        self.tasks.push((task_name, tokio::spawn(future)));
    }

    /// Spawns a job that is restarted if it panics. Panics never take the
    /// process down; a crashed job logs and comes back after a short pause.
    pub fn spawn_recoverable<F, Fut>(&mut self, task_name: impl Into<String>, factory: F)
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let task_name = task_name.into();
        let cancel = self.cancel.clone();
        let group = self.name;
        let outer_name = task_name.clone();
        self.tasks.push((
            outer_name,
            tokio::spawn(async move {
                loop {
                    let attempt = tokio::spawn(factory(cancel.clone()));
                    match attempt.await {
                        Ok(()) => break,
                        Err(join_error) if join_error.is_panic() => {
                            error!(
                                message = "background job panicked, restarting",
                                group,
                                task = %task_name,
                            );
                        }
                        Err(_) => break,
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }),
        ));
    }

    /// Cancels the group and waits for its tasks, up to the deadline.
    pub async fn shutdown(self, deadline: Duration) {
        info!(message = "stopping task group", group = self.name, tasks = self.tasks.len());
        self.cancel.cancel();

        let (names, handles): (Vec<String>, Vec<JoinHandle<()>>) =
            self.tasks.into_iter().unzip();
        let joined = tokio::time::timeout(deadline, join_all(handles)).await;
        match joined {
            Ok(results) => {
                for (name, result) in names.iter().zip(results) {
                    if let Err(join_error) = result {
                        if join_error.is_panic() {
                            error!(message = "task panicked during shutdown", task = %name);
                        }
                    }
                }
            }
            Err(_) => {
                warn!(
                    message = "task group missed shutdown deadline",
                    group = self.name,
                    deadline_secs = deadline.as_secs(),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn group_shutdown_cancels_tasks() {
        let mut group = TaskGroup::new("test");
        let token = group.token();
        let finished = Arc::new(AtomicU32::new(0));
        let flag = Arc::clone(&finished);
        group.spawn("waiter", async move {
            token.cancelled().await;
            flag.fetch_add(1, Ordering::SeqCst);
        });

        group.shutdown(Duration::from_secs(1)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recoverable_job_restarts_after_panic() {
        let mut group = TaskGroup::new("test");
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&attempts);
        group.spawn_recoverable("flaky", move |cancel| {
            let counter = Arc::clone(&counter);
            async move {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                if attempt == 0 {
                    panic!("first attempt dies");
                }
                cancel.cancelled().await;
            }
        });

        // Give the first attempt time to panic and the restart to land.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        group.shutdown(Duration::from_secs(1)).await;
        assert!(attempts.load(Ordering::SeqCst) >= 2);
    }
}
