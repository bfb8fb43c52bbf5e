use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// QueueEntry / QueuePosition
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    pub project: String,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuePosition {
    /// Holds an execution slot right now.
    Running,
    /// 1-based rank among entries still waiting for a slot.
    Queued(usize),
    /// Not queued and not running.
    Idle,
}

struct WaitingEntry {
    ticket: u64,
    project: String,
    enqueued_at: DateTime<Utc>,
}

struct QueueInner {
    next_ticket: u64,
    running: HashSet<String>,
    waiting: VecDeque<WaitingEntry>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PipelineQueue — global FIFO admission gate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Bounds concurrently executing pipeline runs to `capacity`, serving
/// submissions strictly FIFO. A project never holds two slots at once:
/// when the head entry's project is already running, admission waits, so
/// repeat deployments of one project serialize behind each other.
///
/// Constructed once at process start and injected by reference.
pub struct PipelineQueue {
    capacity: usize,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl PipelineQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(QueueInner {
                next_ticket: 0,
                running: HashSet::new(),
                waiting: VecDeque::new(),
            }),
            notify: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wait for an execution slot. Resolves when this submission reaches
    /// the head of the queue, a slot is free, and no other run of the same
    /// project is in flight. The slot is held until the permit drops.
    pub async fn acquire(&self, project: &str) -> QueuePermit<'_> {
        let ticket = {
            let mut inner = self.lock();
            let ticket = inner.next_ticket;
            inner.next_ticket += 1;
            inner.waiting.push_back(WaitingEntry {
                ticket,
                project: project.to_string(),
                enqueued_at: Utc::now(),
            });
            ticket
        };

        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.lock();
                let admissible = inner.running.len() < self.capacity
                    && inner
                        .waiting
                        .front()
                        .map(|head| head.ticket == ticket && !inner.running.contains(project))
                        .unwrap_or(false);
                if admissible {
                    inner.waiting.pop_front();
                    inner.running.insert(project.to_string());
                    tracing::debug!(project = %project, "admitted pipeline run");
                    return QueuePermit {
                        queue: self,
                        project: project.to_string(),
                        released: false,
                    };
                }
            }
            notified.await;
        }
    }

    /// Where a project currently stands: running, 1-based queue rank, or
    /// not present at all.
    pub fn queue_position(&self, project: &str) -> QueuePosition {
        let inner = self.lock();
        if inner.running.contains(project) {
            return QueuePosition::Running;
        }
        inner
            .waiting
            .iter()
            .position(|entry| entry.project == project)
            .map(|idx| QueuePosition::Queued(idx + 1))
            .unwrap_or(QueuePosition::Idle)
    }

    pub fn waiting_entries(&self) -> Vec<QueueEntry> {
        self.lock()
            .waiting
            .iter()
            .map(|entry| QueueEntry {
                project: entry.project.clone(),
                enqueued_at: entry.enqueued_at,
            })
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.lock().running.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        // The queue mutex only guards quick map operations; a poisoned
        // lock means a panic mid-operation and is unrecoverable anyway.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, project: &str) {
        {
            let mut inner = self.lock();
            inner.running.remove(project);
        }
        // Wake every waiter; each re-checks admission in FIFO order.
        self.notify.notify_waiters();
    }
}

/// Held for the duration of one pipeline run; dropping it frees the slot
/// and immediately admits the next FIFO entry if capacity allows.
pub struct QueuePermit<'a> {
    queue: &'a PipelineQueue,
    project: String,
    released: bool,
}

impl Drop for QueuePermit<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.queue.release(&self.project);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_first_submission_runs_immediately() {
        let queue = PipelineQueue::new(1);
        let permit = queue.acquire("a").await;
        assert_eq!(queue.queue_position("a"), QueuePosition::Running);
        drop(permit);
        assert_eq!(queue.queue_position("a"), QueuePosition::Idle);
    }

    #[tokio::test]
    async fn test_capacity_one_queues_second_project() {
        let queue = Arc::new(PipelineQueue::new(1));
        let permit_a = queue.acquire("a").await;

        let queue_b = queue.clone();
        let task_b = tokio::spawn(async move {
            let _permit = queue_b.acquire("b").await;
            queue_b.queue_position("b")
        });
        settle().await;

        assert_eq!(queue.queue_position("b"), QueuePosition::Queued(1));
        assert_eq!(queue.running_count(), 1);

        // completing A admits B automatically
        drop(permit_a);
        let position = task_b.await.unwrap();
        assert_eq!(position, QueuePosition::Running);
    }

    #[tokio::test]
    async fn test_fifo_positions_advance_on_completion() {
        let queue = Arc::new(PipelineQueue::new(1));
        let permit_a = queue.acquire("a").await;

        for project in ["b", "c"] {
            let queue = queue.clone();
            let project = project.to_string();
            tokio::spawn(async move {
                let _permit = queue.acquire(&project).await;
                // hold briefly so order is observable
                tokio::time::sleep(Duration::from_millis(100)).await;
            });
            settle().await;
        }

        assert_eq!(queue.queue_position("b"), QueuePosition::Queued(1));
        assert_eq!(queue.queue_position("c"), QueuePosition::Queued(2));

        drop(permit_a);
        settle().await;
        assert_eq!(queue.queue_position("b"), QueuePosition::Running);
        assert_eq!(queue.queue_position("c"), QueuePosition::Queued(1));
    }

    #[tokio::test]
    async fn test_capacity_two_runs_two_concurrently() {
        let queue = Arc::new(PipelineQueue::new(2));
        let _permit_a = queue.acquire("a").await;
        let _permit_b = queue.acquire("b").await;

        let queue_c = queue.clone();
        tokio::spawn(async move {
            let _permit = queue_c.acquire("c").await;
            tokio::time::sleep(Duration::from_millis(200)).await;
        });
        settle().await;

        assert_eq!(queue.running_count(), 2);
        assert_eq!(queue.queue_position("c"), QueuePosition::Queued(1));
    }

    #[tokio::test]
    async fn test_same_project_never_runs_twice() {
        let queue = Arc::new(PipelineQueue::new(2));
        let permit_first = queue.acquire("a").await;

        let queue_again = queue.clone();
        let task = tokio::spawn(async move {
            let _permit = queue_again.acquire("a").await;
            queue_again.running_count()
        });
        settle().await;

        // capacity allows two, but the same project must wait
        assert_eq!(queue.running_count(), 1);
        assert_eq!(queue.queue_position("a"), QueuePosition::Running);

        drop(permit_first);
        let running_during_second = task.await.unwrap();
        assert_eq!(running_during_second, 1);
    }

    #[tokio::test]
    async fn test_waiting_entries_are_ordered() {
        let queue = Arc::new(PipelineQueue::new(1));
        let _permit = queue.acquire("a").await;

        for project in ["b", "c"] {
            let queue = queue.clone();
            let project = project.to_string();
            tokio::spawn(async move {
                let _p = queue.acquire(&project).await;
            });
            settle().await;
        }

        let entries = queue.waiting_entries();
        let names: Vec<&str> = entries.iter().map(|e| e.project.as_str()).collect();
        assert_eq!(names, ["b", "c"]);
    }
}
