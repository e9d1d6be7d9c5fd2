/// Concurrent download queue with priority scheduling.
///
/// Uses a tokio Semaphore to bound how many engine processes run at once and
/// a binary heap to decide which waiting task goes next (lower priority value
/// first, submission order within a priority).
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};
use chrono::{DateTime, Utc};

use crate::models::percent_done;

/// Live state of a tracked task.
#[derive(Debug, Clone)]
pub struct TrackedTask {
    pub task_id: i64,
    pub origin: String,
    pub state: TaskState,
    pub received: i64,
    pub total_size: i64,
    pub speed_bps: f64,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    last_sample: Option<(DateTime<Utc>, i64)>,
}

impl TrackedTask {
    /// Completion percentage, capped at 100.
    pub fn percent(&self) -> u8 {
        percent_done(self.received, self.total_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Done,
    Failed,
    Stopped,
}

/// Heap entry; greater means scheduled sooner.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingEntry {
    priority: i64,
    seq: u64,
    task_id: i64,
}

impl Ord for PendingEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Main task queue with concurrency control.
pub struct TaskQueue {
    /// Semaphore to limit concurrent engine processes.
    semaphore: Arc<Semaphore>,
    /// Active permits (held while a download runs).
    permits: Arc<Mutex<HashMap<i64, OwnedSemaphorePermit>>>,
    /// Waiting tasks in scheduling order.
    pending: Arc<Mutex<BinaryHeap<PendingEntry>>>,
    /// Tracked task metadata.
    tasks: Arc<Mutex<HashMap<i64, TrackedTask>>>,
    /// Wakes the scheduler when work arrives.
    notify: Arc<Notify>,
    /// Submission counter, breaks priority ties FIFO.
    seq: AtomicU64,
    /// Max concurrent downloads.
    max_concurrent: usize,
}

impl TaskQueue {
    /// Create a new task queue with the given concurrency limit.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            permits: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(BinaryHeap::new())),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            notify: Arc::new(Notify::new()),
            seq: AtomicU64::new(0),
            max_concurrent,
        }
    }

    /// Enqueue a task. Returns false when it is already queued or running;
    /// finished entries are replaced so the task can run again.
    pub async fn enqueue(&self, task_id: i64, origin: &str, priority: i64) -> bool {
        let mut tasks = self.tasks.lock().await;
        if let Some(existing) = tasks.get(&task_id) {
            if matches!(existing.state, TaskState::Queued | TaskState::Running) {
                warn!("Task {} already in queue", task_id);
                return false;
            }
        }

        tasks.insert(
            task_id,
            TrackedTask {
                task_id,
                origin: origin.to_string(),
                state: TaskState::Queued,
                received: 0,
                total_size: 0,
                speed_bps: 0.0,
                enqueued_at: Utc::now(),
                started_at: None,
                last_sample: None,
            },
        );
        drop(tasks);

        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.pending.lock().await.push(PendingEntry {
            priority,
            seq,
            task_id,
        });
        self.notify.notify_one();

        info!("Task {} enqueued (priority {})", task_id, priority);
        true
    }

    /// Pop the next task due to run, skipping entries that were stopped or
    /// removed while they waited. None when nothing is pending.
    pub async fn next_ready(&self) -> Option<i64> {
        let mut pending = self.pending.lock().await;
        let tasks = self.tasks.lock().await;
        while let Some(entry) = pending.pop() {
            match tasks.get(&entry.task_id) {
                Some(t) if t.state == TaskState::Queued => return Some(entry.task_id),
                _ => continue,
            }
        }
        None
    }

    /// Park the scheduler until new work is enqueued.
    pub async fn wait_for_work(&self) {
        self.notify.notified().await;
    }

    /// Acquire a concurrency permit. Waits if at capacity. Returns false when
    /// the task was stopped or removed while waiting for a slot.
    pub async fn acquire(&self, task_id: i64) -> bool {
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                warn!("Semaphore closed for task {}", task_id);
                return false;
            }
        };

        let mut tasks = self.tasks.lock().await;
        match tasks.get_mut(&task_id) {
            Some(task) if task.state == TaskState::Queued => {
                task.state = TaskState::Running;
                task.started_at = Some(Utc::now());
            }
            _ => return false,
        }
        drop(tasks);

        self.permits.lock().await.insert(task_id, permit);
        info!("Task {} acquired slot, now running", task_id);
        true
    }

    /// Update byte counters for a running task and recompute its speed from
    /// the delta since the previous sample.
    pub async fn update_progress(&self, task_id: i64, received: i64, total_size: i64) {
        if let Some(task) = self.tasks.lock().await.get_mut(&task_id) {
            let now = Utc::now();
            if let Some((last_at, last_received)) = task.last_sample {
                if let Some(micros) = (now - last_at).num_microseconds() {
                    if micros > 0 {
                        let delta = (received - last_received) as f64;
                        task.speed_bps = delta / (micros as f64 / 1_000_000.0);
                    }
                }
            }
            task.last_sample = Some((now, received));
            task.received = received;
            if total_size > 0 {
                task.total_size = total_size;
            }
        }
    }

    /// Mark task as completed and release its permit.
    pub async fn complete(&self, task_id: i64) {
        if let Some(task) = self.tasks.lock().await.get_mut(&task_id) {
            task.state = TaskState::Done;
            if task.total_size > 0 {
                task.received = task.total_size;
            }
            task.speed_bps = 0.0;
        }
        self.permits.lock().await.remove(&task_id);
        info!("Task {} completed, slot released", task_id);
    }

    /// Mark task as failed and release its permit.
    pub async fn fail(&self, task_id: i64) {
        if let Some(task) = self.tasks.lock().await.get_mut(&task_id) {
            task.state = TaskState::Failed;
            task.speed_bps = 0.0;
        }
        self.permits.lock().await.remove(&task_id);
        warn!("Task {} failed, slot released", task_id);
    }

    /// Stop a task (marks it stopped, releases its permit if held). Returns
    /// false for untracked or already finished tasks.
    pub async fn stop(&self, task_id: i64) -> bool {
        let mut tasks = self.tasks.lock().await;
        match tasks.get_mut(&task_id) {
            Some(task) if matches!(task.state, TaskState::Queued | TaskState::Running) => {
                task.state = TaskState::Stopped;
                task.speed_bps = 0.0;
                drop(tasks);
                self.permits.lock().await.remove(&task_id);
                info!("Task {} stopped", task_id);
                true
            }
            _ => false,
        }
    }

    /// Drop a task from tracking entirely (after deletion).
    pub async fn forget(&self, task_id: i64) {
        self.tasks.lock().await.remove(&task_id);
        self.permits.lock().await.remove(&task_id);
    }

    /// Get the current live state of a task.
    pub async fn get_status(&self, task_id: i64) -> Option<TrackedTask> {
        self.tasks.lock().await.get(&task_id).cloned()
    }

    /// Snapshot of every tracked task, for merging into listings.
    pub async fn all_tracked(&self) -> HashMap<i64, TrackedTask> {
        self.tasks.lock().await.clone()
    }

    /// Get count of currently running tasks.
    pub async fn running_count(&self) -> usize {
        self.permits.lock().await.len()
    }

    /// Get count of queued (waiting) tasks.
    pub async fn queued_count(&self) -> usize {
        self.tasks
            .lock()
            .await
            .values()
            .filter(|t| t.state == TaskState::Queued)
            .count()
    }

    /// Get queue statistics.
    pub async fn stats(&self) -> QueueStats {
        let tasks = self.tasks.lock().await;
        let running = self.permits.lock().await.len();
        QueueStats {
            max_concurrent: self.max_concurrent,
            running,
            queued: tasks
                .values()
                .filter(|t| t.state == TaskState::Queued)
                .count(),
            completed: tasks.values().filter(|t| t.state == TaskState::Done).count(),
            failed: tasks
                .values()
                .filter(|t| t.state == TaskState::Failed)
                .count(),
            stopped: tasks
                .values()
                .filter(|t| t.state == TaskState::Stopped)
                .count(),
            total_tracked: tasks.len(),
        }
    }

    /// Remove finished tasks older than the retention period from tracking.
    /// The database keeps the durable record.
    pub async fn cleanup_old(&self, max_age_secs: i64) {
        let cutoff = Utc::now() - chrono::Duration::seconds(max_age_secs);
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|_, t| {
            t.state == TaskState::Queued || t.state == TaskState::Running || t.enqueued_at > cutoff
        });
    }
}

/// Queue statistics snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStats {
    pub max_concurrent: usize,
    pub running: usize,
    pub queued: usize,
    pub completed: usize,
    pub failed: usize,
    pub stopped: usize,
    pub total_tracked: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enqueue_and_acquire() {
        let queue = TaskQueue::new(2);
        assert!(queue.enqueue(1, "https://example.com/a", 100).await);
        assert_eq!(queue.next_ready().await, Some(1));
        assert!(queue.acquire(1).await);
        assert_eq!(queue.running_count().await, 1);
    }

    #[tokio::test]
    async fn test_complete_releases_slot() {
        let queue = TaskQueue::new(1);
        queue.enqueue(1, "https://example.com/a", 100).await;
        queue.next_ready().await;
        queue.acquire(1).await;
        assert_eq!(queue.running_count().await, 1);

        queue.complete(1).await;
        assert_eq!(queue.running_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_enqueue() {
        let queue = TaskQueue::new(2);
        assert!(queue.enqueue(1, "https://example.com/a", 100).await);
        assert!(!queue.enqueue(1, "https://example.com/a", 100).await);

        // finished tasks can be enqueued again
        queue.next_ready().await;
        queue.acquire(1).await;
        queue.fail(1).await;
        assert!(queue.enqueue(1, "https://example.com/a", 100).await);
    }

    #[tokio::test]
    async fn test_priority_order() {
        let queue = TaskQueue::new(1);
        queue.enqueue(1, "https://example.com/a", 100).await;
        queue.enqueue(2, "https://example.com/b", 50).await;
        queue.enqueue(3, "https://example.com/c", 100).await;

        assert_eq!(queue.next_ready().await, Some(2));
        assert_eq!(queue.next_ready().await, Some(1));
        assert_eq!(queue.next_ready().await, Some(3));
        assert_eq!(queue.next_ready().await, None);
    }

    #[tokio::test]
    async fn test_stopped_pending_task_is_skipped() {
        let queue = TaskQueue::new(1);
        queue.enqueue(1, "https://example.com/a", 100).await;
        queue.enqueue(2, "https://example.com/b", 100).await;

        assert!(queue.stop(1).await);
        assert_eq!(queue.next_ready().await, Some(2));
        assert_eq!(queue.next_ready().await, None);
    }

    #[tokio::test]
    async fn test_acquire_detects_stop_while_waiting() {
        let queue = TaskQueue::new(1);
        queue.enqueue(1, "https://example.com/a", 100).await;
        queue.stop(1).await;
        assert!(!queue.acquire(1).await);
        // the slot was not consumed
        assert_eq!(queue.running_count().await, 0);
    }

    #[tokio::test]
    async fn test_progress_updates_speed() {
        let queue = TaskQueue::new(1);
        queue.enqueue(1, "https://example.com/a", 100).await;
        queue.next_ready().await;
        queue.acquire(1).await;

        queue.update_progress(1, 1_000, 10_000).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.update_progress(1, 5_000, 10_000).await;

        let task = queue.get_status(1).await.unwrap();
        assert_eq!(task.received, 5_000);
        assert_eq!(task.total_size, 10_000);
        assert_eq!(task.percent(), 50);
        assert!(task.speed_bps > 0.0);
    }

    #[tokio::test]
    async fn test_stats() {
        let queue = TaskQueue::new(3);
        queue.enqueue(1, "https://example.com/a", 100).await;
        queue.enqueue(2, "https://example.com/b", 100).await;
        queue.next_ready().await;
        queue.acquire(1).await;

        let stats = queue.stats().await;
        assert_eq!(stats.running, 1);
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.max_concurrent, 3);
    }
}
