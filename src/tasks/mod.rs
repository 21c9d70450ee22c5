//! Fire-and-forget bookkeeping off the response path.

use std::fmt::Display;
use std::future::Future;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskMode {
    /// Spawn on the tokio runtime and return immediately
    #[default]
    Background,
    /// Await the task before returning; failures are still only logged
    Inline,
}

/// Runs bookkeeping tasks whose failures must never reach the caller
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskRunner {
    mode: TaskMode,
}

impl TaskRunner {
    pub fn new(mode: TaskMode) -> Self {
        Self { mode }
    }

    pub fn background() -> Self {
        Self::new(TaskMode::Background)
    }

    pub fn inline() -> Self {
        Self::new(TaskMode::Inline)
    }

    pub fn mode(&self) -> TaskMode {
        self.mode
    }

    pub async fn run<F, E>(&self, name: &'static str, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        match self.mode {
            TaskMode::Background => {
                tokio::spawn(async move {
                    execute(name, task).await;
                });
            }
            TaskMode::Inline => execute(name, task).await,
        }
    }
}

async fn execute<F, E>(name: &'static str, task: F)
where
    F: Future<Output = Result<(), E>>,
    E: Display,
{
    match task.await {
        Ok(()) => debug!("Task '{}' finished", name),
        Err(e) => error!("❌ Task '{}' failed: {}", name, e),
    }
}
