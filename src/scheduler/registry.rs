use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::{DispatchError, Result};
use crate::scheduler::algorithm::{self, AllocationAlgorithm, NodeLoad};
use crate::scheduler::job::{Job, NodeId};
use crate::scheduler::ledger::JobLedger;

/// A registered worker node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub address: IpAddr,
    pub port: u16,
    pub max_capacity: u32,
}

impl Node {
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// Point-in-time view of a node and its load.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub endpoint: SocketAddr,
    pub max_capacity: u32,
    pub allocated: usize,
    pub utilization: f64,
    pub warnings: u32,
}

/// Registered nodes together with the ledger totals, for `GET_INFO`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterOverview {
    pub nodes: Vec<NodeSnapshot>,
    pub queued: usize,
    pub allocated: usize,
}

/// Result of a heartbeat tick for one node.
#[derive(Debug)]
pub enum ProbeOutcome {
    /// Send `IS_ALIVE` to `endpoint`; `warnings` is the count after this probe
    Probe { endpoint: SocketAddr, warnings: u32 },
    /// The node exhausted its warnings and was removed
    Evicted { node: Node, reclaimed: Vec<Job> },
    /// The node is no longer registered
    Gone,
}

#[derive(Debug)]
struct RegisteredNode {
    node: Node,
    warnings: u32,
    heartbeat: CancellationToken,
}

#[derive(Debug, Default)]
struct Inner {
    nodes: Vec<RegisteredNode>,
    cursor: usize,
}

impl Inner {
    fn position(&self, node_id: NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n.node.id == node_id)
    }

    fn remove(&mut self, index: usize) -> RegisteredNode {
        let removed = self.nodes.remove(index);
        removed.heartbeat.cancel();
        if index < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= self.nodes.len() {
            self.cursor = 0;
        }
        removed
    }

    async fn loads(&self, ledger: &JobLedger) -> Vec<NodeLoad> {
        let counts = ledger.allocation_counts().await;
        self.nodes
            .iter()
            .map(|n| load_of(&n.node, &counts))
            .collect()
    }

    fn snapshots(&self, counts: &HashMap<NodeId, usize>) -> Vec<NodeSnapshot> {
        self.nodes
            .iter()
            .map(|n| {
                let load = load_of(&n.node, counts);
                NodeSnapshot {
                    id: n.node.id,
                    endpoint: n.node.endpoint(),
                    max_capacity: n.node.max_capacity,
                    allocated: load.allocated,
                    utilization: load.utilization(),
                    warnings: n.warnings,
                }
            })
            .collect()
    }
}

fn load_of(node: &Node, counts: &HashMap<NodeId, usize>) -> NodeLoad {
    NodeLoad::new(counts.get(&node.id).copied().unwrap_or(0), node.max_capacity)
}

/// Registry of worker nodes and their failure-detector state.
///
/// Lock order is registry, then the ledger's queue, then its allocation map.
/// The ledger never calls back into the registry.
#[derive(Debug)]
pub struct NodeRegistry {
    inner: RwLock<Inner>,
    next_node_id: AtomicU64,
    ledger: Arc<JobLedger>,
    max_warnings: u32,
}

impl NodeRegistry {
    pub fn new(ledger: Arc<JobLedger>, max_warnings: u32) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            next_node_id: AtomicU64::new(1),
            ledger,
            max_warnings,
        }
    }

    /// Register a node listening on `address:port`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Validation`] for a port outside `1..=65535`
    /// or a capacity of zero.
    pub async fn register(&self, address: IpAddr, port: u32, max_capacity: u32) -> Result<Node> {
        let port = match u16::try_from(port) {
            Ok(p) if p != 0 => p,
            _ => {
                return Err(DispatchError::Validation(format!(
                    "port {port} is out of range"
                )))
            }
        };
        if max_capacity < 1 {
            return Err(DispatchError::Validation(
                "maximum capacity must be at least 1".to_string(),
            ));
        }

        let mut inner = self.inner.write().await;
        let node = Node {
            id: self.next_node_id.fetch_add(1, Ordering::SeqCst),
            address,
            port,
            max_capacity,
        };
        inner.nodes.push(RegisteredNode {
            node: node.clone(),
            warnings: 0,
            heartbeat: CancellationToken::new(),
        });

        tracing::info!(
            node_id = node.id,
            endpoint = %node.endpoint(),
            max_capacity,
            "Node registered"
        );
        Ok(node)
    }

    /// Remove the node at `index`, cancel its heartbeat, and requeue its jobs.
    ///
    /// Every removal goes through here. The caller holds the write lock.
    async fn remove_and_reclaim(&self, inner: &mut Inner, index: usize) -> (Node, Vec<Job>) {
        let removed = inner.remove(index);
        let reclaimed = self.ledger.reclaim_node(removed.node.id).await;
        (removed.node, reclaimed)
    }

    /// Remove a node, cancel its heartbeat, and requeue all of its jobs.
    pub async fn unregister(&self, node_id: NodeId) -> Option<(Node, Vec<Job>)> {
        let mut inner = self.inner.write().await;
        let index = inner.position(node_id)?;
        let (node, reclaimed) = self.remove_and_reclaim(&mut inner, index).await;
        drop(inner);

        tracing::info!(node_id, requeued = reclaimed.len(), "Node unregistered");
        Some((node, reclaimed))
    }

    /// Remove every node, cancelling their heartbeats. Used at shutdown.
    pub async fn drain(&self) -> Vec<Node> {
        let mut inner = self.inner.write().await;
        let mut drained = Vec::with_capacity(inner.nodes.len());
        while !inner.nodes.is_empty() {
            let (node, _) = self.remove_and_reclaim(&mut inner, 0).await;
            drained.push(node);
        }
        drained
    }

    /// Advance the failure detector for `node_id` by one interval.
    ///
    /// Decided and applied under the registry lock, so a tick racing an
    /// acknowledgement or another removal is consistent.
    pub async fn tick(&self, node_id: NodeId) -> ProbeOutcome {
        let mut inner = self.inner.write().await;
        let Some(index) = inner.position(node_id) else {
            return ProbeOutcome::Gone;
        };

        if inner.nodes[index].warnings >= self.max_warnings {
            let (node, reclaimed) = self.remove_and_reclaim(&mut inner, index).await;
            return ProbeOutcome::Evicted { node, reclaimed };
        }

        let entry = &mut inner.nodes[index];
        entry.warnings += 1;
        ProbeOutcome::Probe {
            endpoint: entry.node.endpoint(),
            warnings: entry.warnings,
        }
    }

    /// Reset the warning count of `node_id` after a liveness acknowledgement.
    pub async fn acknowledge(&self, node_id: NodeId) -> Result<()> {
        let mut inner = self.inner.write().await;
        let index = inner
            .position(node_id)
            .ok_or(DispatchError::NodeNotFound(node_id))?;
        inner.nodes[index].warnings = 0;
        Ok(())
    }

    /// Pick the node the next job should go to.
    ///
    /// Round-robin advances its cursor past the returned node.
    pub async fn next_qualifying_node(&self, algorithm: AllocationAlgorithm) -> Option<Node> {
        let mut inner = self.inner.write().await;
        let loads = inner.loads(&self.ledger).await;
        let index = algorithm::select(algorithm, &loads, inner.cursor)?;
        if algorithm == AllocationAlgorithm::RoundRobin {
            inner.cursor = (index + 1) % inner.nodes.len();
        }
        Some(inner.nodes[index].node.clone())
    }

    /// Allocate the job at the head of the queue to the next qualifying node.
    ///
    /// Selection and allocation happen under the registry lock, so the chosen
    /// node cannot be evicted before its job is recorded.
    pub async fn assign_next(&self, algorithm: AllocationAlgorithm) -> Option<(Job, Node)> {
        let mut inner = self.inner.write().await;
        let head = self.ledger.peek_head().await?;
        let loads = inner.loads(&self.ledger).await;
        let index = algorithm::select(algorithm, &loads, inner.cursor)?;
        let node = inner.nodes[index].node.clone();
        let job = self.ledger.allocate(&head, node.id).await?;
        if algorithm == AllocationAlgorithm::RoundRobin {
            inner.cursor = (index + 1) % inner.nodes.len();
        }
        Some((job, node))
    }

    pub async fn get(&self, node_id: NodeId) -> Option<Node> {
        let inner = self.inner.read().await;
        inner
            .position(node_id)
            .map(|index| inner.nodes[index].node.clone())
    }

    pub async fn find_by_endpoint(&self, endpoint: SocketAddr) -> Option<Node> {
        self.inner
            .read()
            .await
            .nodes
            .iter()
            .find(|n| n.node.endpoint() == endpoint)
            .map(|n| n.node.clone())
    }

    pub async fn warnings(&self, node_id: NodeId) -> Option<u32> {
        let inner = self.inner.read().await;
        inner.position(node_id).map(|index| inner.nodes[index].warnings)
    }

    /// Heartbeat cancellation token of `node_id`, cancelled on removal.
    pub async fn heartbeat_token(&self, node_id: NodeId) -> Option<CancellationToken> {
        let inner = self.inner.read().await;
        inner
            .position(node_id)
            .map(|index| inner.nodes[index].heartbeat.clone())
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.nodes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.nodes.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<NodeSnapshot> {
        let inner = self.inner.read().await;
        let counts = self.ledger.allocation_counts().await;
        inner.snapshots(&counts)
    }

    /// Nodes and queue totals read as one consistent view.
    ///
    /// Holds the registry read lock while the ledger counts are taken, so an
    /// eviction cannot move jobs between the node list and the totals.
    pub async fn overview(&self) -> ClusterOverview {
        let inner = self.inner.read().await;
        let counts = self.ledger.counts().await;
        ClusterOverview {
            nodes: inner.snapshots(&counts.per_node),
            queued: counts.queued,
            allocated: counts.allocated,
        }
    }
}
