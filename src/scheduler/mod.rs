pub mod algorithm;
pub mod heartbeat;
pub mod job;
pub mod ledger;
pub mod registry;

pub use algorithm::{AllocationAlgorithm, NodeLoad};
pub use heartbeat::HeartbeatMonitor;
pub use job::{Job, JobId, JobState, NodeId};
pub use ledger::{JobLedger, LedgerCounts};
pub use registry::{ClusterOverview, Node, NodeRegistry, NodeSnapshot, ProbeOutcome};
