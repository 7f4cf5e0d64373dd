//! Process group handles.
//!
//! A `ProcessGroup` is an explicit value owned by whoever issues collectives on
//! it. There is no process-wide registry: layers receive the group they route
//! over at construction time.

use super::backend::LocalCommunicator;
use super::CollectiveCommunicator;
use crate::utils::error::{MoeError, Result};
use std::fmt;
use std::sync::Arc;

/// Process group handle
#[derive(Clone)]
pub struct ProcessGroup {
    /// Communicator for this group
    pub communicator: Arc<dyn CollectiveCommunicator>,
    /// Global ranks in this group, indexed by group-local rank
    pub ranks: Vec<usize>,
    /// Size of this group
    pub size: usize,
}

impl ProcessGroup {
    pub fn new(communicator: Arc<dyn CollectiveCommunicator>, ranks: Vec<usize>) -> Self {
        let size = ranks.len();
        Self { communicator, ranks, size }
    }

    /// Group covering every rank of `communicator`.
    pub fn from_communicator(communicator: Arc<dyn CollectiveCommunicator>) -> Self {
        let ranks = (0..communicator.world_size()).collect();
        Self::new(communicator, ranks)
    }

    /// Trivial group containing only this process.
    pub fn single() -> Self {
        let mut comms = LocalCommunicator::new_group(1);
        let comm: Arc<dyn CollectiveCommunicator> = match comms.pop() {
            Some(comm) => Arc::new(comm),
            None => unreachable!("new_group(1) yields one communicator"),
        };
        Self::new(comm, vec![0])
    }

    /// One group handle per rank, backed by threads in this process.
    pub fn local_group(size: usize) -> Vec<Self> {
        LocalCommunicator::new_group(size)
            .into_iter()
            .map(|comm| Self::from_communicator(Arc::new(comm)))
            .collect()
    }

    /// Rank of this process within the group.
    pub fn rank(&self) -> usize {
        self.communicator.rank()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Get local rank within this group
    pub fn local_rank(&self, global_rank: usize) -> Option<usize> {
        self.ranks.iter().position(|&r| r == global_rank)
    }
}

impl fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("rank", &self.rank())
            .field("ranks", &self.ranks)
            .finish()
    }
}

/// Placement of experts over an expert-parallel group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpertParallelConfig {
    /// Number of EP ranks
    pub ep_size: usize,
    /// Total number of experts
    pub num_experts: usize,
    /// Number of local experts per rank
    pub num_local_experts: usize,
    /// This rank in EP group
    pub ep_rank: usize,
}

impl ExpertParallelConfig {
    pub fn new(num_experts: usize, group: &ProcessGroup) -> Result<Self> {
        let ep_size = group.size();
        if ep_size == 0 || num_experts % ep_size != 0 {
            return Err(MoeError::Config(format!(
                "{} experts cannot be spread evenly over {} ranks",
                num_experts, ep_size
            )));
        }

        Ok(Self {
            ep_size,
            num_experts,
            num_local_experts: num_experts / ep_size,
            ep_rank: group.rank(),
        })
    }

    /// Get expert IDs that this rank is responsible for.
    pub fn local_expert_ids(&self) -> Vec<usize> {
        let start = self.ep_rank * self.num_local_experts;
        (start..start + self.num_local_experts).collect()
    }

    /// Rank owning a global expert id.
    pub fn owner_of(&self, expert: usize) -> usize {
        expert / self.num_local_experts
    }
}
