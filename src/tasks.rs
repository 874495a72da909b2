//! Background tasks
//!
//! Polls and propagations are independent jobs handed to a
//! [`TaskDispatcher`]. Delivery is at-least-once: every handler tolerates
//! duplicates through the poll token, get-or-create and leasing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Semaphore, mpsc};

use crate::data::AccountKey;
use crate::error::AppError;
use crate::service::{Poller, PropagationWorker};

/// A unit of background work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Poll an account. `last_polled` is the dedupe token: a task whose
    /// token no longer matches the stored one is dropped.
    Poll {
        account: AccountKey,
        last_polled: DateTime<Utc>,
    },
    /// Propagate a response delivery record
    Propagate { id: String },
    /// Propagate a blog post delivery record
    PropagateBlogPost { id: String },
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Poll { .. } => "poll",
            Self::Propagate { .. } => "propagate",
            Self::PropagateBlogPost { .. } => "propagate-blogpost",
        }
    }
}

/// Accepts tasks for later execution
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Enqueue `task`, optionally after `delay`
    async fn dispatch(&self, task: Task, delay: Option<Duration>) -> Result<(), AppError>;
}

/// In-process dispatcher backed by an unbounded channel
#[derive(Clone)]
pub struct QueueDispatcher {
    sender: mpsc::UnboundedSender<Task>,
}

impl QueueDispatcher {
    /// Create a dispatcher and the receiving end for a [`TaskRunner`]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Task>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl TaskDispatcher for QueueDispatcher {
    async fn dispatch(&self, task: Task, delay: Option<Duration>) -> Result<(), AppError> {
        tracing::debug!(task = task.name(), ?delay, "Dispatching task");

        match delay {
            Some(delay) if !delay.is_zero() => {
                let sender = self.sender.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if sender.send(task).is_err() {
                        tracing::warn!("Task queue closed before delayed task was enqueued");
                    }
                });
                Ok(())
            }
            _ => self
                .sender
                .send(task)
                .map_err(|_| AppError::Internal(anyhow::anyhow!("task queue is closed"))),
        }
    }
}

/// Executes dispatched tasks with bounded concurrency
#[derive(Clone)]
pub struct TaskRunner {
    poller: Arc<Poller>,
    worker: Arc<PropagationWorker>,
    concurrency: usize,
}

impl TaskRunner {
    pub fn new(poller: Arc<Poller>, worker: Arc<PropagationWorker>, concurrency: usize) -> Self {
        Self {
            poller,
            worker,
            concurrency: concurrency.max(1),
        }
    }

    /// Consume tasks until every dispatcher is dropped
    pub async fn run(self, mut receiver: mpsc::UnboundedReceiver<Task>) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        tracing::info!(concurrency = self.concurrency, "Task runner started");

        while let Some(task) = receiver.recv().await {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let runner = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                runner.execute(task).await;
            });
        }

        tracing::info!("Task queue closed, runner stopping");
    }

    /// Run one task to completion, logging failures
    pub async fn execute(&self, task: Task) {
        let name = task.name();
        let result = match task {
            Task::Poll {
                account,
                last_polled,
            } => self
                .poller
                .poll(&account, last_polled)
                .await
                .map(|outcome| tracing::debug!(account = %account, ?outcome, "Poll task done")),
            Task::Propagate { id } | Task::PropagateBlogPost { id } => self
                .worker
                .propagate(&id)
                .await
                .map(|_| tracing::debug!(delivery = %id, "Propagate task done")),
        };

        if let Err(error) = result {
            tracing::error!(task = name, error = %error, "Task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn immediate_dispatch_is_received() {
        let (dispatcher, mut receiver) = QueueDispatcher::new();
        let task = Task::Propagate {
            id: "tag:twitter.com,2013:1_2".to_string(),
        };
        dispatcher.dispatch(task.clone(), None).await.unwrap();
        assert_eq!(receiver.recv().await, Some(task));
    }

    #[tokio::test]
    async fn delayed_dispatch_waits() {
        let (dispatcher, mut receiver) = QueueDispatcher::new();
        let task = Task::PropagateBlogPost {
            id: "https://blog.example.org/post".to_string(),
        };
        dispatcher
            .dispatch(task.clone(), Some(Duration::from_millis(30)))
            .await
            .unwrap();

        assert!(receiver.try_recv().is_err());
        let received = tokio::time::timeout(Duration::from_secs(2), receiver.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(task));
    }

    #[tokio::test]
    async fn dispatch_after_close_fails() {
        let (dispatcher, receiver) = QueueDispatcher::new();
        drop(receiver);
        let result = dispatcher
            .dispatch(Task::Propagate { id: "x".to_string() }, None)
            .await;
        assert!(matches!(result, Err(AppError::Internal(_))));
    }
}
