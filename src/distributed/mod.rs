//! Distributed plumbing for expert parallelism.
//!
//! The routing engine never looks up process groups from ambient state: every
//! layer holds the `ProcessGroup` it exchanges over, and every collective is
//! issued from an explicit call site. All ranks of a group must issue the same
//! collectives in the same order or the group deadlocks.

use candle_core::{Result, Tensor};

/// Trait for collective communications.
///
/// Implementations include:
/// - `LocalCommunicator`: in-process ranks on threads, used by tests and demos
/// - any transport-backed communicator provided by the embedding trainer
pub trait CollectiveCommunicator: Send + Sync {
    /// Get the rank of this process
    fn rank(&self) -> usize;

    /// Get the total number of processes
    fn world_size(&self) -> usize;

    /// All-reduce: Sum tensor across all ranks and broadcast result.
    fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor>;

    /// All-gather: Gather tensors from all ranks, concatenating along dim 0.
    fn all_gather(&self, tensor: &Tensor) -> Result<Tensor>;

    /// All-to-all with variable split sizes along dim 0.
    ///
    /// Args:
    ///   tensor: Input rows, partition `i` (of `input_splits[i]` rows) goes to rank `i`
    ///   input_splits: Number of rows to send to each rank
    ///   output_splits: Number of rows to receive from each rank
    ///
    /// Received partitions are concatenated in rank order.
    fn all_to_all_variable(
        &self,
        tensor: &Tensor,
        input_splits: &[usize],
        output_splits: &[usize],
    ) -> Result<Tensor>;

    /// All-to-all with equal partitions along dim 0.
    fn all_to_all(&self, tensor: &Tensor) -> Result<Tensor> {
        let world_size = self.world_size();
        if world_size == 1 {
            return Ok(tensor.clone());
        }
        let rows = tensor.dim(0)?;
        if rows % world_size != 0 {
            return Err(candle_core::Error::Msg(format!(
                "all_to_all: {} rows cannot be split evenly over {} ranks",
                rows, world_size
            )));
        }
        let splits = vec![rows / world_size; world_size];
        self.all_to_all_variable(tensor, &splits, &splits)
    }
}

pub mod backend;
pub mod exchange;
pub mod groups;
pub mod sync_policy;

// Re-export commonly used items
pub use backend::LocalCommunicator;
pub use exchange::{exchange, exchange_counts, ExchangePlan, ExpertExchange};
pub use groups::{ExpertParallelConfig, ProcessGroup};
pub use sync_policy::{ParamSyncRegistry, SyncPolicy};

use crate::utils::error::{MoeError, Result as MoeResult};
use std::collections::HashMap;

/// Synchronize gradients using the parameter sync side-table.
///
/// Parameters registered as `SyncPolicy::ExpertGroup` are averaged over
/// `expert_data_parallel` (when given) instead of the data-parallel group;
/// everything else is averaged over `data_parallel`. Names are visited in
/// sorted order so every rank issues the same collective sequence.
pub fn synchronize_gradients(
    grads: &mut HashMap<String, Tensor>,
    registry: &ParamSyncRegistry,
    data_parallel: &dyn CollectiveCommunicator,
    expert_data_parallel: Option<&dyn CollectiveCommunicator>,
) -> MoeResult<()> {
    let mut names: Vec<String> = grads.keys().cloned().collect();
    names.sort();

    for name in names {
        let comm = match registry.policy(&name) {
            SyncPolicy::DataParallel => data_parallel,
            SyncPolicy::ExpertGroup { .. } => match expert_data_parallel {
                Some(comm) => comm,
                None => continue,
            },
        };
        if comm.world_size() == 1 {
            continue;
        }
        if let Some(grad) = grads.get(&name) {
            let summed = comm
                .all_reduce(grad)
                .map_err(|e| MoeError::Communication(format!("all_reduce {}: {}", name, e)))?;
            let avg = (summed / comm.world_size() as f64)?;
            grads.insert(name, avg);
        }
    }
    Ok(())
}

/// Average a scalar value across all ranks.
pub fn all_reduce_scalar(
    value: f64,
    communicator: &dyn CollectiveCommunicator,
) -> MoeResult<f64> {
    if communicator.world_size() == 1 {
        return Ok(value);
    }

    let tensor = Tensor::new(&[value as f32], &candle_core::Device::Cpu)?;
    let reduced = communicator
        .all_reduce(&tensor)
        .map_err(|e| MoeError::Communication(e.to_string()))?;
    let result = reduced.to_vec1::<f32>()?[0] as f64;
    Ok(result / communicator.world_size() as f64)
}
