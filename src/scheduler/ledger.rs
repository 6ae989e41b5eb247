use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, Notify};

use crate::error::{DispatchError, Result};
use crate::scheduler::job::{Job, JobId, NodeId};

/// Queue and allocation totals taken under both ledger locks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerCounts {
    pub queued: usize,
    pub allocated: usize,
    pub per_node: HashMap<NodeId, usize>,
}

#[derive(Debug, Clone)]
struct Allocation {
    job: Job,
    node_id: NodeId,
}

/// FIFO queue of pending jobs plus the record of which node runs each
/// allocated job.
///
/// A job lives in exactly one of the two collections. The queue and the
/// allocation map have separate locks; operations that touch both always
/// take the queue lock first so that a job moving between them is never
/// observable in neither or both.
#[derive(Debug)]
pub struct JobLedger {
    queue: Mutex<VecDeque<Job>>,
    allocations: Mutex<BTreeMap<JobId, Allocation>>,
    next_job_id: AtomicU64,
    changed: Notify,
}

impl Default for JobLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl JobLedger {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            allocations: Mutex::new(BTreeMap::new()),
            next_job_id: AtomicU64::new(1),
            changed: Notify::new(),
        }
    }

    /// Create a job and append it to the tail of the queue.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Validation`] if `execution_time` is zero.
    pub async fn enqueue(&self, execution_time: u32) -> Result<Job> {
        if execution_time < 1 {
            return Err(DispatchError::Validation(
                "execution time must be at least 1 second".to_string(),
            ));
        }

        let mut queue = self.queue.lock().await;
        let job = Job::new(self.next_job_id.fetch_add(1, Ordering::SeqCst), execution_time);
        queue.push_back(job.clone());
        drop(queue);

        tracing::info!(job_id = job.id, execution_time, "Job queued");
        self.changed.notify_one();
        Ok(job)
    }

    /// The job at the head of the queue, left in place.
    pub async fn peek_head(&self) -> Option<Job> {
        self.queue.lock().await.front().cloned()
    }

    /// Move `job` from the queue into the allocation map under `node_id`.
    ///
    /// Returns the allocated job, or `None` if it was no longer queued.
    pub async fn allocate(&self, job: &Job, node_id: NodeId) -> Option<Job> {
        let mut queue = self.queue.lock().await;
        let position = queue.iter().position(|j| j.id == job.id)?;
        let mut allocations = self.allocations.lock().await;
        let mut job = queue.remove(position)?;
        job.mark_allocated();
        allocations.insert(
            job.id,
            Allocation {
                job: job.clone(),
                node_id,
            },
        );
        Some(job)
    }

    /// Drop the allocation record for `job_id`. Unknown ids are a no-op.
    pub async fn deallocate(&self, job_id: JobId) -> Option<Job> {
        let removed = self.allocations.lock().await.remove(&job_id);
        if removed.is_some() {
            self.changed.notify_one();
        }
        removed.map(|a| a.job)
    }

    /// Put a previously allocated job back at the tail of the queue.
    pub async fn requeue(&self, mut job: Job) {
        job.mark_queued();
        tracing::info!(job_id = job.id, "Job requeued");
        self.queue.lock().await.push_back(job);
        self.changed.notify_one();
    }

    /// Deallocate `job_id` and requeue it in one step.
    pub async fn requeue_allocated(&self, job_id: JobId) -> Option<Job> {
        let mut queue = self.queue.lock().await;
        let mut job = self.allocations.lock().await.remove(&job_id)?.job;
        job.mark_queued();
        queue.push_back(job.clone());
        drop(queue);

        tracing::info!(job_id, "Job requeued");
        self.changed.notify_one();
        Some(job)
    }

    /// Requeue every job allocated to `node_id`, in id order.
    pub async fn reclaim_node(&self, node_id: NodeId) -> Vec<Job> {
        let mut queue = self.queue.lock().await;
        let mut allocations = self.allocations.lock().await;

        let ids: Vec<JobId> = allocations
            .values()
            .filter(|a| a.node_id == node_id)
            .map(|a| a.job.id)
            .collect();

        let mut reclaimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(allocation) = allocations.remove(&id) {
                let mut job = allocation.job;
                job.mark_queued();
                queue.push_back(job.clone());
                reclaimed.push(job);
            }
        }
        drop(allocations);
        drop(queue);

        if !reclaimed.is_empty() {
            tracing::info!(node_id, jobs = reclaimed.len(), "Reclaimed jobs from node");
            self.changed.notify_one();
        }
        reclaimed
    }

    pub async fn lookup_allocated(&self, job_id: JobId) -> Option<Job> {
        self.allocations
            .lock()
            .await
            .get(&job_id)
            .map(|a| a.job.clone())
    }

    /// Node currently running `job_id`.
    pub async fn node_for_job(&self, job_id: JobId) -> Option<NodeId> {
        self.allocations.lock().await.get(&job_id).map(|a| a.node_id)
    }

    pub async fn jobs_for_node(&self, node_id: NodeId) -> Vec<Job> {
        self.allocations
            .lock()
            .await
            .values()
            .filter(|a| a.node_id == node_id)
            .map(|a| a.job.clone())
            .collect()
    }

    pub async fn allocated_count(&self, node_id: NodeId) -> usize {
        self.allocations
            .lock()
            .await
            .values()
            .filter(|a| a.node_id == node_id)
            .count()
    }

    /// Allocated job count per node. Nodes without jobs are absent.
    pub async fn allocation_counts(&self) -> HashMap<NodeId, usize> {
        let allocations = self.allocations.lock().await;
        let mut counts = HashMap::new();
        for allocation in allocations.values() {
            *counts.entry(allocation.node_id).or_insert(0) += 1;
        }
        counts
    }

    /// Queue length, allocation count, and per-node counts as one view.
    pub async fn counts(&self) -> LedgerCounts {
        let queue = self.queue.lock().await;
        let allocations = self.allocations.lock().await;
        let mut per_node = HashMap::new();
        for allocation in allocations.values() {
            *per_node.entry(allocation.node_id).or_insert(0) += 1;
        }
        LedgerCounts {
            queued: queue.len(),
            allocated: allocations.len(),
            per_node,
        }
    }

    /// Snapshot of the queue in FIFO order.
    pub async fn queued_jobs(&self) -> Vec<Job> {
        self.queue.lock().await.iter().cloned().collect()
    }

    pub async fn queued_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn allocated_len(&self) -> usize {
        self.allocations.lock().await.len()
    }

    /// Wait until something changed that could make an allocation possible.
    ///
    /// A change that happened while nobody was waiting is remembered, so the
    /// next call returns immediately.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }
}
