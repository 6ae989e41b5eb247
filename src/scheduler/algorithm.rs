//! Node selection strategies.
//!
//! Both strategies are pure functions over a load snapshot, one
//! [`NodeLoad`] per registered node in registry order, and return the index
//! of the chosen node.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationAlgorithm {
    /// Rotate through the nodes, skipping those at capacity
    RoundRobin,
    /// Prefer the least utilized node, then the one with the most capacity
    WeightedRoundRobin,
}

impl fmt::Display for AllocationAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationAlgorithm::RoundRobin => write!(f, "round-robin"),
            AllocationAlgorithm::WeightedRoundRobin => write!(f, "weighted-round-robin"),
        }
    }
}

impl FromStr for AllocationAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "round-robin" | "normal" => Ok(AllocationAlgorithm::RoundRobin),
            "weighted-round-robin" | "weighted" => Ok(AllocationAlgorithm::WeightedRoundRobin),
            other => Err(format!("unknown allocation algorithm: {other}")),
        }
    }
}

/// Load of a single node at the moment of selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLoad {
    pub allocated: usize,
    pub max_capacity: u32,
}

impl NodeLoad {
    pub fn new(allocated: usize, max_capacity: u32) -> Self {
        Self {
            allocated,
            max_capacity,
        }
    }

    pub fn utilization(&self) -> f64 {
        if self.max_capacity == 0 {
            return 1.0;
        }
        self.allocated as f64 / self.max_capacity as f64
    }

    pub fn has_capacity(&self) -> bool {
        self.allocated < self.max_capacity as usize
    }
}

/// First node with spare capacity scanning forward from `cursor`, wrapping.
pub fn round_robin(loads: &[NodeLoad], cursor: usize) -> Option<usize> {
    if loads.is_empty() {
        return None;
    }
    let start = cursor % loads.len();
    (0..loads.len())
        .map(|offset| (start + offset) % loads.len())
        .find(|&i| loads[i].has_capacity())
}

/// Least utilized node; ties go to the larger capacity, then registry order.
/// `None` when even the best candidate is fully utilized.
pub fn weighted_round_robin(loads: &[NodeLoad]) -> Option<usize> {
    let mut order: Vec<usize> = (0..loads.len()).collect();
    order.sort_by(|&a, &b| {
        loads[a]
            .utilization()
            .total_cmp(&loads[b].utilization())
            .then_with(|| loads[b].max_capacity.cmp(&loads[a].max_capacity))
    });
    order
        .first()
        .copied()
        .filter(|&i| loads[i].utilization() < 1.0)
}

/// Dispatch to the strategy selected by `algorithm`.
pub fn select(algorithm: AllocationAlgorithm, loads: &[NodeLoad], cursor: usize) -> Option<usize> {
    match algorithm {
        AllocationAlgorithm::RoundRobin => round_robin(loads, cursor),
        AllocationAlgorithm::WeightedRoundRobin => weighted_round_robin(loads),
    }
}
