//! All-to-all orchestration for expert parallelism.
//!
//! `exchange` is the single collective the routing engine issues for token
//! traffic. Every rank of the group must reach each call site the same number
//! of times, in the same order, or the whole group blocks.

use super::groups::{ExpertParallelConfig, ProcessGroup};
use crate::utils::error::{MoeError, Result};
use crate::utils::metrics;
use candle_core::Tensor;
use std::time::Instant;
use tracing::trace;

/// Exchange a batch over `group`.
///
/// Partition `i` of `batch` (sized by `input_splits`, or equal partitions when
/// unset) goes to rank `i`; the received partitions are concatenated in rank
/// order. When `output_splits` is unset it is derived with a count exchange
/// (variable input) or assumed equal (equal input).
pub fn exchange(
    batch: &Tensor,
    group: &ProcessGroup,
    input_splits: Option<&[usize]>,
    output_splits: Option<&[usize]>,
) -> Result<Tensor> {
    let size = group.size();
    if size == 1 {
        return Ok(batch.clone());
    }

    let start = Instant::now();
    let comm = &group.communicator;
    let received = match (input_splits, output_splits) {
        (None, None) => comm.all_to_all(batch),
        (Some(input), Some(output)) => comm.all_to_all_variable(batch, input, output),
        (Some(input), None) => {
            let output = exchange_counts(input, group)?;
            comm.all_to_all_variable(batch, input, &output)
        }
        (None, Some(output)) => {
            let rows = batch.dim(0)?;
            if rows % size != 0 {
                return Err(MoeError::Invariant(format!(
                    "{} rows cannot be split evenly over {} ranks",
                    rows, size
                )));
            }
            let input = vec![rows / size; size];
            comm.all_to_all_variable(batch, &input, output)
        }
    }
    .map_err(|e| MoeError::Communication(format!("rank {}: {}", group.rank(), e)))?;

    let elapsed = start.elapsed().as_secs_f64();
    metrics::record_exchange_time(elapsed);
    trace!(
        rank = group.rank(),
        sent = batch.dim(0)?,
        received = received.dim(0)?,
        elapsed_us = elapsed * 1e6,
        "all-to-all exchange"
    );

    Ok(received)
}

/// Exchange per-destination counts.
///
/// `counts` holds `counts.len() / group.size()` entries per destination rank;
/// the result holds the same number of entries per source rank, in rank order.
pub fn exchange_counts(counts: &[usize], group: &ProcessGroup) -> Result<Vec<usize>> {
    let size = group.size();
    if size == 1 {
        return Ok(counts.to_vec());
    }
    if counts.len() % size != 0 {
        return Err(MoeError::Invariant(format!(
            "{} counts cannot be split evenly over {} ranks",
            counts.len(),
            size
        )));
    }

    let as_u32: Vec<u32> = counts.iter().map(|&c| c as u32).collect();
    let tensor = Tensor::from_vec(as_u32, (counts.len(),), &candle_core::Device::Cpu)?;
    let received = group
        .communicator
        .all_to_all(&tensor)
        .map_err(|e| MoeError::Communication(format!("count exchange: {}", e)))?;

    Ok(received
        .to_vec1::<u32>()?
        .into_iter()
        .map(|c| c as usize)
        .collect())
}

/// Everything needed to send expert outputs back to their origin.
#[derive(Clone, Debug)]
pub struct ExchangePlan {
    /// Rows sent to each rank
    pub send_splits: Vec<usize>,
    /// Rows received from each rank
    pub recv_splits: Vec<usize>,
    /// Received rows per (source rank, local expert), source-major
    pub recv_expert_counts: Vec<usize>,
    /// Rows per local expert after regrouping
    pub local_splits: Vec<usize>,
    /// Source-major row index for each expert-major position
    regroup: Vec<u32>,
}

/// Moves expert-sorted rows to the ranks owning their experts and back.
pub struct ExpertExchange {
    group: ProcessGroup,
    placement: ExpertParallelConfig,
}

impl ExpertExchange {
    pub fn new(group: ProcessGroup, num_experts: usize) -> Result<Self> {
        let placement = ExpertParallelConfig::new(num_experts, &group)?;
        Ok(Self { group, placement })
    }

    pub fn placement(&self) -> &ExpertParallelConfig {
        &self.placement
    }

    pub fn group(&self) -> &ProcessGroup {
        &self.group
    }

    /// Dispatch rows sorted by global expert id.
    ///
    /// Args:
    ///   sorted: Rows grouped contiguously by expert (expert 0 first)
    ///   expert_counts: Rows per global expert (num_experts,)
    ///
    /// Returns:
    ///   (rows grouped by local expert, plan for `combine`)
    pub fn dispatch(&self, sorted: &Tensor, expert_counts: &[usize]) -> Result<(Tensor, ExchangePlan)> {
        let size = self.placement.ep_size;
        let num_local = self.placement.num_local_experts;
        if expert_counts.len() != self.placement.num_experts {
            return Err(MoeError::Invariant(format!(
                "expected {} expert counts, got {}",
                self.placement.num_experts,
                expert_counts.len()
            )));
        }
        let rows = sorted.dim(0)?;
        if expert_counts.iter().sum::<usize>() != rows {
            return Err(MoeError::Invariant(format!(
                "expert counts sum to {} but {} rows were sorted",
                expert_counts.iter().sum::<usize>(),
                rows
            )));
        }

        let send_splits: Vec<usize> = expert_counts
            .chunks(num_local)
            .map(|chunk| chunk.iter().sum())
            .collect();
        let recv_expert_counts = exchange_counts(expert_counts, &self.group)?;
        let recv_splits: Vec<usize> = recv_expert_counts
            .chunks(num_local)
            .map(|chunk| chunk.iter().sum())
            .collect();

        let received = exchange(sorted, &self.group, Some(&send_splits), Some(&recv_splits))?;

        // Received rows are source-major; experts want their rows contiguous.
        let mut offsets = vec![0usize; size * num_local];
        let mut running = 0;
        for (slot, &count) in recv_expert_counts.iter().enumerate() {
            offsets[slot] = running;
            running += count;
        }
        let mut regroup = Vec::with_capacity(running);
        let mut local_splits = vec![0usize; num_local];
        for (expert, split) in local_splits.iter_mut().enumerate() {
            for src in 0..size {
                let slot = src * num_local + expert;
                let start = offsets[slot];
                regroup.extend((start..start + recv_expert_counts[slot]).map(|i| i as u32));
                *split += recv_expert_counts[slot];
            }
        }

        let grouped = if size == 1 || running == 0 {
            received
        } else {
            let index = Tensor::from_vec(regroup.clone(), (running,), received.device())?;
            received.index_select(&index, 0)?
        };

        let plan = ExchangePlan {
            send_splits,
            recv_splits,
            recv_expert_counts,
            local_splits,
            regroup,
        };
        Ok((grouped, plan))
    }

    /// Return expert outputs (grouped by local expert) to the ranks that sent them.
    ///
    /// The result is in the same order as the `sorted` rows given to `dispatch`.
    pub fn combine(&self, expert_out: &Tensor, plan: &ExchangePlan) -> Result<Tensor> {
        let rows = expert_out.dim(0)?;
        if rows != plan.regroup.len() {
            return Err(MoeError::Invariant(format!(
                "expert output has {} rows, plan expects {}",
                rows,
                plan.regroup.len()
            )));
        }

        let source_major = if self.placement.ep_size == 1 || rows == 0 {
            expert_out.clone()
        } else {
            let mut restore = vec![0u32; rows];
            for (pos, &src) in plan.regroup.iter().enumerate() {
                restore[src as usize] = pos as u32;
            }
            let index = Tensor::from_vec(restore, (rows,), expert_out.device())?;
            expert_out.index_select(&index, 0)?
        };

        // Send/recv splits swap on the way back.
        exchange(
            &source_major,
            &self.group,
            Some(&plan.recv_splits),
            Some(&plan.send_splits),
        )
    }
}
