//! Shared work queue for one pipeline stage
//!
//! A FIFO of pending tasks plus the bookkeeping the progress reporter needs.
//! Each task moves `Pending -> InFlight -> Completed | Failed`; the move to
//! `InFlight` happens under the same lock as the removal from the FIFO, so a
//! task is handed to at most one worker.

use serde::{Deserialize, Serialize};
use shiptrack_common::TrackError;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::warn;

use crate::batch::{Batch, BatchName};

/// Something a worker can pick up
pub trait QueueTask: Send + 'static {
    /// Human-readable name used in logs and failure reports
    fn label(&self) -> String;
}

impl QueueTask for Batch {
    fn label(&self) -> String {
        self.name().to_string()
    }
}

impl QueueTask for BatchName {
    fn label(&self) -> String {
        self.0.clone()
    }
}

/// Task lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InFlight,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

/// Why a task ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task: String,
    /// Machine-readable error kind, see `TrackError::kind`
    pub kind: String,
    pub reason: String,
}

/// Point-in-time view of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressSnapshot {
    pub total: usize,
    /// Pending plus in-flight
    pub remaining: usize,
    pub completed: usize,
    pub failed: usize,
}

impl ProgressSnapshot {
    /// `(total - remaining) / total * 100`, rounded down.
    ///
    /// Reaches 100 only once nothing is pending or in flight. An empty stage
    /// is complete by definition.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        let done = self.total.saturating_sub(self.remaining);
        ((done * 100) / self.total).min(100) as u8
    }

    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    /// Status line for progress sinks, e.g. `"40% of 5 complete"`
    pub fn status_line(&self) -> String {
        format!("{}% of {} complete", self.percent(), self.total)
    }
}

struct QueueState<T> {
    pending: VecDeque<(usize, T)>,
    states: Vec<TaskState>,
    labels: Vec<String>,
    in_flight: usize,
    completed: usize,
    failures: Vec<TaskFailure>,
}

impl<T> QueueState<T> {
    fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.states.len(),
            remaining: self.pending.len() + self.in_flight,
            completed: self.completed,
            failed: self.failures.len(),
        }
    }
}

/// Thread-safe FIFO shared by the workers of one stage
///
/// One instance per stage per run; nothing is global.
pub struct WorkQueue<T: QueueTask> {
    state: Mutex<QueueState<T>>,
}

impl<T: QueueTask> WorkQueue<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                states: Vec::new(),
                labels: Vec::new(),
                in_flight: 0,
                completed: 0,
                failures: Vec::new(),
            }),
        })
    }

    pub fn from_tasks(tasks: impl IntoIterator<Item = T>) -> Arc<Self> {
        let queue = Self::new();
        for task in tasks {
            queue.push(task);
        }
        queue
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        // A panicking worker never leaves the state half-updated
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a task as `Pending`; returns its id
    pub fn push(&self, task: T) -> usize {
        let mut state = self.lock();
        let id = state.states.len();
        state.states.push(TaskState::Pending);
        state.labels.push(task.label());
        state.pending.push_back((id, task));
        id
    }

    /// Take the oldest pending task, or `None` if nothing is pending.
    ///
    /// Never blocks waiting for work.
    pub fn try_dequeue(self: &Arc<Self>) -> Option<(TaskLease<T>, T)> {
        let mut state = self.lock();
        let (id, task) = state.pending.pop_front()?;
        state.states[id] = TaskState::InFlight;
        state.in_flight += 1;
        let label = state.labels[id].clone();
        drop(state);

        let lease = TaskLease {
            queue: Arc::clone(self),
            id,
            label,
            settled: false,
        };
        Some((lease, task))
    }

    fn settle(&self, id: usize, failure: Option<TaskFailure>) -> ProgressSnapshot {
        let mut state = self.lock();
        if state.states.get(id) == Some(&TaskState::InFlight) {
            state.in_flight -= 1;
            match failure {
                None => {
                    state.states[id] = TaskState::Completed;
                    state.completed += 1;
                },
                Some(failure) => {
                    state.states[id] = TaskState::Failed;
                    state.failures.push(failure);
                },
            }
        }
        state.snapshot()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.lock().snapshot()
    }

    /// Pending plus in-flight tasks
    pub fn remaining(&self) -> usize {
        self.lock().snapshot().remaining
    }

    pub fn total(&self) -> usize {
        self.lock().states.len()
    }

    pub fn task_state(&self, id: usize) -> Option<TaskState> {
        self.lock().states.get(id).copied()
    }

    /// Failures so far, in the order they happened
    pub fn failures(&self) -> Vec<TaskFailure> {
        self.lock().failures.clone()
    }

    /// Labels of tasks that reached `Completed`, in enqueue order
    pub fn completed_labels(&self) -> Vec<String> {
        let state = self.lock();
        state
            .states
            .iter()
            .zip(&state.labels)
            .filter(|(s, _)| **s == TaskState::Completed)
            .map(|(_, label)| label.clone())
            .collect()
    }
}

/// Exclusive claim on one in-flight task
///
/// Must be settled with [`TaskLease::complete`] or [`TaskLease::fail`].
/// A lease dropped unsettled (a worker panicked) marks its task `Failed`.
/// That only happens in unwinding builds; the release profile aborts on panic.
pub struct TaskLease<T: QueueTask> {
    queue: Arc<WorkQueue<T>>,
    id: usize,
    label: String,
    settled: bool,
}

impl<T: QueueTask> TaskLease<T> {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn complete(mut self) -> ProgressSnapshot {
        self.settled = true;
        self.queue.settle(self.id, None)
    }

    pub fn fail(mut self, error: &TrackError) -> ProgressSnapshot {
        self.settled = true;
        let failure = TaskFailure {
            task: self.label.clone(),
            kind: error.kind().to_string(),
            reason: error.to_string(),
        };
        self.queue.settle(self.id, Some(failure))
    }
}

impl<T: QueueTask> Drop for TaskLease<T> {
    fn drop(&mut self) {
        if !self.settled {
            warn!(task = %self.label, "Task abandoned while in flight");
            let error =
                TrackError::Abandoned("worker stopped before finishing the task".to_string());
            self.queue.settle(
                self.id,
                Some(TaskFailure {
                    task: self.label.clone(),
                    kind: error.kind().to_string(),
                    reason: error.to_string(),
                }),
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn names(n: usize) -> Vec<BatchName> {
        (0..n).map(|i| BatchName(format!("b{}", i))).collect()
    }

    #[test]
    fn test_fifo_and_state_transitions() {
        let queue = WorkQueue::from_tasks(names(3));
        assert_eq!(queue.remaining(), 3);

        let (lease, task) = queue.try_dequeue().unwrap();
        assert_eq!(task.as_str(), "b0");
        assert_eq!(queue.task_state(lease.id()), Some(TaskState::InFlight));
        // In-flight work still counts as remaining
        assert_eq!(queue.remaining(), 3);

        let id = lease.id();
        let snapshot = lease.complete();
        assert_eq!(queue.task_state(id), Some(TaskState::Completed));
        assert_eq!(snapshot.remaining, 2);
        assert_eq!(snapshot.percent(), 33);
        assert_eq!(snapshot.status_line(), "33% of 3 complete");

        let (lease, task) = queue.try_dequeue().unwrap();
        assert_eq!(task.as_str(), "b1");
        let snapshot = lease.fail(&TrackError::NoUsableRecords("b1".into()));
        assert_eq!(snapshot.failed, 1);

        let (lease, _) = queue.try_dequeue().unwrap();
        assert!(queue.try_dequeue().is_none());
        let snapshot = lease.complete();
        assert!(snapshot.is_complete());
        assert_eq!(snapshot.percent(), 100);

        let failures = queue.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].task, "b1");
        assert_eq!(failures[0].kind, "no_usable_records");
        assert_eq!(queue.completed_labels(), vec!["b0", "b2"]);
    }

    #[test]
    fn test_dropped_lease_fails_task() {
        let queue = WorkQueue::from_tasks(names(1));
        let (lease, _) = queue.try_dequeue().unwrap();
        let id = lease.id();
        drop(lease);

        assert_eq!(queue.task_state(id), Some(TaskState::Failed));
        assert_eq!(queue.failures()[0].kind, "abandoned");
        assert_eq!(queue.remaining(), 0);
    }

    #[test]
    fn test_empty_stage_is_complete() {
        let queue: Arc<WorkQueue<BatchName>> = WorkQueue::new();
        let snapshot = queue.snapshot();
        assert_eq!(snapshot.percent(), 100);
        assert_eq!(snapshot.status_line(), "100% of 0 complete");
    }

    #[test]
    fn test_percent_rounds_down_until_done() {
        let snapshot = ProgressSnapshot {
            total: 3,
            remaining: 1,
            completed: 2,
            failed: 0,
        };
        assert_eq!(snapshot.percent(), 66);

        let snapshot = ProgressSnapshot {
            total: 1000,
            remaining: 1,
            completed: 999,
            failed: 0,
        };
        assert_eq!(snapshot.percent(), 99);
    }
}
