//! Registry of long-running background tasks and their liveness

use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Clears the running flag when the task ends, including by panic or abort.
struct RunningGuard {
    name: String,
    flag: Arc<AtomicBool>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
        debug!(task = %self.name, "Background task stopped");
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub name: String,
    pub running: bool,
}

#[derive(Clone, Default)]
pub struct BackgroundTasks {
    flags: Arc<DashMap<String, Arc<AtomicBool>>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `fut` as task `name`; it counts as running until it returns.
    pub fn spawn<F>(&self, name: impl Into<String>, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let flag = Arc::new(AtomicBool::new(true));
        if self.flags.insert(name.clone(), flag.clone()).is_some() {
            warn!(task = %name, "Background task registered twice, tracking the newest");
        }
        let guard = RunningGuard { name, flag };
        tokio::spawn(async move {
            let _guard = guard;
            fut.await;
        })
    }

    pub fn statuses(&self) -> Vec<TaskStatus> {
        let mut statuses: Vec<TaskStatus> = self
            .flags
            .iter()
            .map(|e| TaskStatus {
                name: e.key().clone(),
                running: e.value().load(Ordering::SeqCst),
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn registered(&self) -> usize {
        self.flags.len()
    }

    pub fn running(&self) -> usize {
        self.flags
            .iter()
            .filter(|e| e.value().load(Ordering::SeqCst))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_flag_tracks_task_lifetime() {
        let tasks = BackgroundTasks::new();
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let handle = tasks.spawn("monitor", async move { child.cancelled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(tasks.running(), 1);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(tasks.running(), 0);
        assert_eq!(tasks.registered(), 1);
        assert!(!tasks.statuses()[0].running);
    }
}
