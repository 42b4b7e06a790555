//! Shared state of a queue session's worker pool.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use findr_core::{QueueTaskId, SessionId, WorkerStatus};

use crate::queue::QueueStats;

/// One worker slot of the pool.
#[derive(Debug, Clone)]
pub struct WorkerSlot {
    /// Slot index within the pool.
    pub id: usize,

    /// Current status.
    pub status: WorkerStatus,

    /// Task currently running on this slot.
    pub current_task: Option<QueueTaskId>,

    /// Tasks this slot has finished.
    pub tasks_done: u64,

    /// When the slot last changed status.
    pub last_change: DateTime<Utc>,
}

impl WorkerSlot {
    fn new(id: usize) -> Self {
        Self {
            id,
            status: WorkerStatus::Idle,
            current_task: None,
            tasks_done: 0,
            last_change: Utc::now(),
        }
    }
}

/// Task counters of the session.
#[derive(Debug, Clone, Default)]
pub struct TaskCounters {
    pub submitted: u64,
    pub waiting: u64,
    pub running: u64,
    pub complete: u64,
    pub total_execute_time: Duration,
}

/// Shared pool state, read by the HTTP status API and the run driver.
pub struct PoolState {
    /// Session this pool belongs to.
    pub session: SessionId,

    /// When the session started.
    pub started_at: DateTime<Utc>,

    /// Worker slots indexed by slot id.
    pub workers: RwLock<Vec<WorkerSlot>>,

    /// Task counters.
    pub tasks: RwLock<TaskCounters>,
}

impl PoolState {
    /// Create a new PoolState with `workers` idle slots, wrapped in Arc.
    pub fn new(session: SessionId, workers: usize) -> Arc<Self> {
        Arc::new(Self {
            session,
            started_at: Utc::now(),
            workers: RwLock::new((0..workers).map(WorkerSlot::new).collect()),
            tasks: RwLock::new(TaskCounters::default()),
        })
    }

    /// Count a newly submitted task.
    pub async fn task_submitted(&self) {
        let mut tasks = self.tasks.write().await;
        tasks.submitted += 1;
        tasks.waiting += 1;
    }

    /// Move a task onto an idle slot and return the slot id.
    ///
    /// Callers hold a pool permit, so an idle slot exists.
    pub async fn task_started(&self, task: QueueTaskId) -> Option<usize> {
        {
            let mut tasks = self.tasks.write().await;
            tasks.waiting = tasks.waiting.saturating_sub(1);
            tasks.running += 1;
        }

        let mut workers = self.workers.write().await;
        let slot = workers.iter_mut().find(|w| w.status.can_accept_tasks())?;
        slot.status = WorkerStatus::Busy;
        slot.current_task = Some(task);
        slot.last_change = Utc::now();
        Some(slot.id)
    }

    /// Release a slot after its task finished.
    pub async fn task_finished(&self, slot: Option<usize>, elapsed: Duration) {
        {
            let mut tasks = self.tasks.write().await;
            tasks.running = tasks.running.saturating_sub(1);
            tasks.complete += 1;
            tasks.total_execute_time += elapsed;
        }

        if let Some(id) = slot {
            let mut workers = self.workers.write().await;
            if let Some(worker) = workers.get_mut(id) {
                worker.status = WorkerStatus::Idle;
                worker.current_task = None;
                worker.tasks_done += 1;
                worker.last_change = Utc::now();
            }
        }
    }

    /// Snapshot worker and task counts.
    pub async fn snapshot(&self) -> QueueStats {
        let workers = self.workers.read().await;
        let mut stats = QueueStats::default();
        for worker in workers.iter() {
            match worker.status {
                WorkerStatus::Idle => stats.workers_idle += 1,
                WorkerStatus::Busy => stats.workers_busy += 1,
            }
        }
        stats.workers_connected = stats.workers_idle + stats.workers_busy;
        drop(workers);

        let tasks = self.tasks.read().await;
        stats.tasks_submitted = tasks.submitted;
        stats.tasks_waiting = tasks.waiting;
        stats.tasks_running = tasks.running;
        stats.tasks_complete = tasks.complete;
        stats.total_execute_time_ms = tasks.total_execute_time.as_millis() as u64;
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_task_lifecycle_counts() {
        let state = PoolState::new(SessionId::generate(), 2);

        state.task_submitted().await;
        state.task_submitted().await;
        let slot = state.task_started(QueueTaskId::new(1)).await;
        assert_eq!(slot, Some(0));

        let stats = state.snapshot().await;
        assert_eq!(stats.workers_connected, 2);
        assert_eq!(stats.workers_busy, 1);
        assert_eq!(stats.workers_idle, 1);
        assert_eq!(stats.tasks_waiting, 1);
        assert_eq!(stats.tasks_running, 1);

        state.task_finished(slot, Duration::from_millis(250)).await;
        let stats = state.snapshot().await;
        assert_eq!(stats.workers_busy, 0);
        assert_eq!(stats.tasks_running, 0);
        assert_eq!(stats.tasks_complete, 1);
        assert_eq!(stats.total_execute_time_ms, 250);
    }
}
