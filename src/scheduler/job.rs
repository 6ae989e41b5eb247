use chrono::{DateTime, Utc};

pub type JobId = u64;
pub type NodeId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Allocated,
    Finished,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Allocated => write!(f, "allocated"),
            JobState::Finished => write!(f, "finished"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    /// Seconds the node is expected to spend on the job
    pub execution_time: u32,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub allocated_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: JobId, execution_time: u32) -> Self {
        Self {
            id,
            execution_time,
            state: JobState::Queued,
            created_at: Utc::now(),
            allocated_at: None,
        }
    }

    pub(crate) fn mark_allocated(&mut self) {
        self.state = JobState::Allocated;
        self.allocated_at = Some(Utc::now());
    }

    pub(crate) fn mark_queued(&mut self) {
        self.state = JobState::Queued;
        self.allocated_at = None;
    }

    pub fn finish(&mut self) {
        self.state = JobState::Finished;
    }

    /// Milliseconds from submission to the current allocation.
    pub fn queue_wait_ms(&self) -> Option<i64> {
        self.allocated_at
            .map(|at| (at - self.created_at).num_milliseconds().max(0))
    }
}
