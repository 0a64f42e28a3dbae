//! Bounded-parallelism scheduler over `cpu` and `gpu` worker pools.
//!
//! Grounded in `server.py`'s `Queue` class: `add()` submits a unit of work
//! and returns an opaque id immediately; `kill()` raises a cooperative
//! cancel signal the worker is expected to poll; `state()` and
//! `get_nb_active_processes()` expose introspection. The Python
//! `ProcessPoolExecutor` + `multiprocessing.Manager().Event()` pairing maps
//! onto a `tokio::sync::Semaphore` per pool plus an `AtomicBool`-backed
//! cancel signal per task.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tigger_core::types::{TaskKind, TaskQueueKind, TaskRecord, TaskState};
use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("task not found: {0}")]
    NotFound(Uuid),
}

impl From<&QueueError> for tigger_core::error::ErrorKind {
    fn from(err: &QueueError) -> Self {
        match err {
            QueueError::NotFound(_) => tigger_core::error::ErrorKind::NotFound,
        }
    }
}

/// Cooperative cancellation signal, cloned into the worker closure.
#[derive(Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Outcome of a completed task, polled by the reaper.
pub struct TaskOutcome {
    pub unique_id: Uuid,
    pub kind: TaskKind,
    pub project_slug: String,
    pub user: String,
    pub result: Result<serde_json::Value, String>,
}

struct TaskEntry {
    record: TaskRecord,
    cancel: CancelSignal,
    handle: tokio::task::JoinHandle<()>,
}

/// Two bounded-parallelism pools (`cpu`, `gpu`) and a stack of in-flight
/// tasks, mirroring `server.py::Queue.current`.
pub struct Queue {
    cpu: Arc<Semaphore>,
    gpu: Arc<Semaphore>,
    tasks: Arc<Mutex<HashMap<Uuid, TaskEntry>>>,
    outcomes_tx: flume::Sender<TaskOutcome>,
    outcomes_rx: flume::Receiver<TaskOutcome>,
}

impl Queue {
    pub fn new(n_workers_cpu: usize, n_workers_gpu: usize) -> Self {
        let (outcomes_tx, outcomes_rx) = flume::unbounded();
        Self {
            cpu: Arc::new(Semaphore::new(n_workers_cpu.max(1))),
            gpu: Arc::new(Semaphore::new(n_workers_gpu.max(1))),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            outcomes_tx,
            outcomes_rx,
        }
    }

    fn pool(&self, queue: TaskQueueKind) -> Arc<Semaphore> {
        match queue {
            TaskQueueKind::Cpu => self.cpu.clone(),
            TaskQueueKind::Gpu => self.gpu.clone(),
        }
    }

    /// Submit a unit of work. Returns the `unique_id` immediately — the
    /// caller never blocks on worker capacity; submissions queue behind
    /// the pool's semaphore in submission order.
    pub async fn add_task<F, Fut>(
        &self,
        kind: TaskKind,
        project_slug: impl Into<String>,
        user: impl Into<String>,
        queue: TaskQueueKind,
        work: F,
    ) -> Uuid
    where
        F: FnOnce(CancelSignal) -> Fut + Send + 'static,
        Fut: Future<Output = Result<serde_json::Value, String>> + Send + 'static,
    {
        let unique_id = Uuid::new_v4();
        let cancel = CancelSignal::default();
        let record = TaskRecord {
            unique_id,
            kind,
            project_slug: project_slug.into(),
            user: user.into(),
            queue,
            submitted_at: Utc::now(),
            state: TaskState::Pending,
        };

        let tasks = self.tasks.clone();
        let outcomes_tx = self.outcomes_tx.clone();
        let permit_pool = self.pool(queue);
        let worker_cancel = cancel.clone();
        let project_for_outcome = record.project_slug.clone();
        let user_for_outcome = record.user.clone();

        let handle = tokio::spawn(async move {
            let _permit = permit_pool.acquire_owned().await.expect("semaphore not closed");
            if let Some(entry) = tasks.lock().await.get_mut(&unique_id) {
                entry.record.state = TaskState::Running;
            }

            let result = if worker_cancel.is_cancelled() {
                Err("cancelled".to_string())
            } else {
                work(worker_cancel.clone()).await
            };

            let mut guard = tasks.lock().await;
            if let Some(entry) = guard.get_mut(&unique_id) {
                // A kill() may already have marked this Cancelled; state
                // transitions are monotonic, so a late result never
                // overwrites a terminal cancellation.
                if !entry.record.state.is_terminal() {
                    entry.record.state = if worker_cancel.is_cancelled() {
                        TaskState::Cancelled
                    } else if result.is_ok() {
                        TaskState::Done
                    } else {
                        TaskState::Failed
                    };
                }
            }
            drop(guard);

            let _ = outcomes_tx.send(TaskOutcome {
                unique_id,
                kind,
                project_slug: project_for_outcome,
                user: user_for_outcome,
                result,
            });
        });

        self.tasks.lock().await.insert(unique_id, TaskEntry { record, cancel, handle });
        unique_id
    }

    /// Sets the cancel signal; the worker is expected to check it at its
    /// next poll point. Best-effort: the task may already have completed.
    pub async fn kill(&self, unique_id: Uuid) -> Result<(), QueueError> {
        let mut guard = self.tasks.lock().await;
        let entry = guard.get_mut(&unique_id).ok_or(QueueError::NotFound(unique_id))?;
        entry.cancel.cancel();
        if entry.record.state.can_transition_to(&TaskState::Cancelled) {
            entry.record.state = TaskState::Cancelled;
        }
        Ok(())
    }

    pub async fn delete(&self, unique_id: Uuid) {
        if let Some(entry) = self.tasks.lock().await.remove(&unique_id) {
            entry.handle.abort();
        }
    }

    /// Cancels every in-flight task of the given kinds owned by `user`
    /// (`Orchestrator::stop_user_processes`).
    pub async fn stop_user_processes(&self, kinds: &[TaskKind], user: &str) -> usize {
        let ids: Vec<Uuid> = {
            let guard = self.tasks.lock().await;
            guard
                .values()
                .filter(|e| e.record.user == user && kinds.contains(&e.record.kind) && !e.record.state.is_terminal())
                .map(|e| e.record.unique_id)
                .collect()
        };
        for id in &ids {
            let _ = self.kill(*id).await;
        }
        ids.len()
    }

    pub async fn state(&self) -> HashMap<Uuid, TaskState> {
        self.tasks.lock().await.iter().map(|(id, e)| (*id, e.record.state)).collect()
    }

    pub async fn get_nb_active_processes(&self) -> (usize, usize) {
        let guard = self.tasks.lock().await;
        let cpu = guard
            .values()
            .filter(|e| e.record.queue == TaskQueueKind::Cpu && e.record.state == TaskState::Running)
            .count();
        let gpu = guard
            .values()
            .filter(|e| e.record.queue == TaskQueueKind::Gpu && e.record.state == TaskState::Running)
            .count();
        (cpu, gpu)
    }

    /// Drains every terminal task, removing it from the stack. Called by
    /// the orchestrator's reaper tick, once per `UPDATE_TIMEOUT` interval,
    /// before running each owning component's `on_complete` hook.
    pub async fn drain_terminal(&self) -> Vec<Uuid> {
        let mut guard = self.tasks.lock().await;
        let terminal: Vec<Uuid> = guard
            .iter()
            .filter(|(_, e)| e.record.state.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for id in &terminal {
            guard.remove(id);
        }
        terminal
    }

    /// Receives outcomes as tasks complete, for the reaper to consume.
    pub fn outcomes(&self) -> flume::Receiver<TaskOutcome> {
        self.outcomes_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submission_returns_immediately_and_completes() {
        let queue = Queue::new(2, 1);
        let id = queue
            .add_task(TaskKind::FeatureDfm, "demo", "alice", TaskQueueKind::Cpu, |_cancel| async {
                Ok(serde_json::json!({"ok": true}))
            })
            .await;

        let outcome = queue.outcomes().recv_async().await.unwrap();
        assert_eq!(outcome.unique_id, id);
        assert!(outcome.result.is_ok());

        let states = queue.state().await;
        assert_eq!(states.get(&id), Some(&TaskState::Done));
    }

    #[tokio::test]
    async fn kill_marks_cancelled_and_worker_observes_signal() {
        let queue = Queue::new(1, 1);
        let id = queue
            .add_task(TaskKind::LanguageModelTrain, "demo", "alice", TaskQueueKind::Gpu, |cancel| async move {
                for _ in 0..50 {
                    if cancel.is_cancelled() {
                        return Err("cancelled".into());
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                }
                Ok(serde_json::json!({}))
            })
            .await;

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        queue.kill(id).await.unwrap();

        let outcome = queue.outcomes().recv_async().await.unwrap();
        assert!(outcome.result.is_err());

        let states = queue.state().await;
        assert_eq!(states.get(&id), Some(&TaskState::Cancelled));
    }

    #[tokio::test]
    async fn pool_capacity_is_bounded() {
        let queue = Queue::new(1, 1);
        assert_eq!(queue.get_nb_active_processes().await, (0, 0));
    }

    #[tokio::test]
    async fn drain_terminal_removes_completed_tasks() {
        let queue = Queue::new(1, 1);
        let id = queue
            .add_task(TaskKind::FeatureDfm, "demo", "alice", TaskQueueKind::Cpu, |_| async {
                Ok(serde_json::json!({}))
            })
            .await;
        let _ = queue.outcomes().recv_async().await.unwrap();

        let drained = queue.drain_terminal().await;
        assert_eq!(drained, vec![id]);
        assert!(queue.state().await.is_empty());
    }
}
