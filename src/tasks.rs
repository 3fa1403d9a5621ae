use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use crate::log_task_event;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// pending -> running -> completed | failed, never backwards
    fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProgressDetails {
    pub current: usize,
    pub total: usize,
    pub chapter: String,
    pub concept: String,
    pub percentage: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    Percent(f64),
    Detailed(ProgressDetails),
}

/// Point-in-time view of a tracked task, as returned to pollers
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: Uuid,
    pub status: TaskStatus,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub message: String,
    pub details: Option<ProgressDetails>,
}

/// Handed to every job so it can publish progress without knowing its task id
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn Fn(Progress) + Send + Sync>,
}

impl ProgressReporter {
    pub fn new(sink: impl Fn(Progress) + Send + Sync + 'static) -> Self {
        Self { sink: Arc::new(sink) }
    }

    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn report(&self, progress: Progress) {
        (self.sink)(progress)
    }
}

type TaskMap = HashMap<Uuid, TaskSnapshot>;

/// Runs submitted jobs on a bounded pool and keeps their state for polling.
///
/// Constructed once at startup and shared through application state.
#[derive(Clone)]
pub struct TaskTracker {
    tasks: Arc<RwLock<TaskMap>>,
    permits: Arc<Semaphore>,
    max_age: chrono::Duration,
}

impl TaskTracker {
    pub fn new(workers: usize, max_age: chrono::Duration) -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            permits: Arc::new(Semaphore::new(workers.max(1))),
            max_age,
        }
    }

    /// Registers a pending task and schedules `job` on the pool. Returns immediately.
    pub fn submit<F, Fut>(&self, job: F) -> Uuid
    where
        F: FnOnce(ProgressReporter) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.write().insert(
            id,
            TaskSnapshot {
                id,
                status: TaskStatus::Pending,
                progress: 0.0,
                created_at: now,
                updated_at: now,
                result: None,
                error: None,
                message: "Task submitted".to_string(),
                details: None,
            },
        );
        log_task_event!(submitted, task_id = id);

        let tracker = self.clone();
        tokio::spawn(async move {
            let _permit = match tracker.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    tracker.fail(id, format!("worker pool unavailable: {}", e));
                    return;
                }
            };

            tracker.transition(id, TaskStatus::Running, |task| {
                task.message = "Task running".to_string();
            });
            log_task_event!(running, task_id = id);

            let started = Instant::now();
            let reporter = tracker.reporter_for(id);
            let outcome = AssertUnwindSafe(async move { job(reporter).await })
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(result)) => {
                    tracker.transition(id, TaskStatus::Completed, |task| {
                        task.progress = 100.0;
                        task.result = Some(result);
                        task.message = "Task completed".to_string();
                    });
                    log_task_event!(completed, task_id = id, duration_ms = started.elapsed().as_millis() as u64);
                }
                Ok(Err(e)) => tracker.fail(id, format!("{:#}", e)),
                Err(panic) => tracker.fail(id, format!("task panicked: {}", panic_message(&*panic))),
            }
        });

        id
    }

    /// Unknown or evicted ids yield `None`
    pub fn get(&self, id: &Uuid) -> Option<TaskSnapshot> {
        self.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evicts every task created more than `max_age` before `now`
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut tasks = self.write();
        let before = tasks.len();
        tasks.retain(|_, task| now - task.created_at <= self.max_age);
        let evicted = before - tasks.len();

        if evicted > 0 {
            log_task_event!(swept, count = evicted);
        }
        evicted
    }

    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                tracker.sweep_expired(Utc::now());
            }
        })
    }

    fn reporter_for(&self, id: Uuid) -> ProgressReporter {
        let tracker = self.clone();
        ProgressReporter::new(move |progress| tracker.apply_progress(id, progress))
    }

    fn apply_progress(&self, id: Uuid, progress: Progress) {
        let mut tasks = self.write();
        let Some(task) = tasks.get_mut(&id) else {
            return;
        };
        if task.status != TaskStatus::Running {
            return;
        }

        match progress {
            Progress::Percent(percent) => {
                task.progress = percent.clamp(0.0, 100.0);
            }
            Progress::Detailed(details) => {
                task.progress = details.percentage.clamp(0.0, 100.0);
                task.message = format!("Generating: {} - {}", details.chapter, details.concept);
                task.details = Some(details);
            }
        }
        task.updated_at = Utc::now();
    }

    fn fail(&self, id: Uuid, error: String) {
        log_task_event!(failed, task_id = id, error = error);
        self.transition(id, TaskStatus::Failed, |task| {
            task.message = format!("Task failed: {}", error);
            task.error = Some(error);
        });
    }

    /// Applies `update` and moves to `next` if the transition is legal
    fn transition(&self, id: Uuid, next: TaskStatus, update: impl FnOnce(&mut TaskSnapshot)) -> bool {
        let mut tasks = self.write();
        let Some(task) = tasks.get_mut(&id) else {
            return false;
        };

        if !task.status.can_transition_to(next) {
            warn!(task_id = %id, from = ?task.status, to = ?next, "Rejected task status transition");
            return false;
        }

        update(task);
        task.status = next;
        task.updated_at = Utc::now();
        true
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, TaskMap> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, TaskMap> {
        self.tasks.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
