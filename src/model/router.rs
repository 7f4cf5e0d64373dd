//! Capacity-free permutation router for intra-device routing.
//!
//! Every token is routed to exactly `k` local experts. The router only
//! produces orderings: a stable sort of the flattened (token, choice) pairs by
//! expert, its inverse, and per-expert split sizes.

use crate::distributed::SyncPolicy;
use crate::model::gate::stable_top_k;
use crate::utils::error::{MoeError, Result};
use candle_core::{DType, Module, Tensor};
use candle_nn::{ops, Linear, VarBuilder};

/// Orderings and weights produced by `LocalGate::route`.
pub struct RouterOutput {
    /// Token index for each expert-sorted row (N * k)
    pub sort_order: Vec<u32>,
    /// Expert-sorted row for each flattened (token, choice) position (N * k)
    pub reversed_order: Vec<u32>,
    /// Weight per flattened (token, choice) position (N * k,)
    pub combine_weights: Tensor,
    /// Rows per expert, zero entries kept
    pub splits: Vec<usize>,
    /// Softmax routing probabilities (N, E)
    pub routing_probs: Tensor,
    /// Raw logits (N, E)
    pub logits: Tensor,
    /// Selected expert per flattened (token, choice) position
    pub expert_ids: Vec<usize>,
}

impl RouterOutput {
    /// Expert-sorted row -> expert id.
    pub fn sorted_experts(&self) -> Vec<usize> {
        let mut experts = Vec::with_capacity(self.sort_order.len());
        for (expert, &count) in self.splits.iter().enumerate() {
            experts.extend(std::iter::repeat(expert).take(count));
        }
        experts
    }
}

/// Top-k router over the experts resident on one device.
pub struct LocalGate {
    wg: Linear,
    num_experts: usize,
    k: usize,
    straight_through: bool,
    param_path: String,
}

impl LocalGate {
    pub fn new(
        hidden_size: usize,
        num_experts: usize,
        k: usize,
        straight_through: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let vb = vb.pp("wg");
        let param_path = format!("{}.weight", vb.prefix());
        let wg = candle_nn::linear_no_bias(hidden_size, num_experts, vb)?;
        Self::build(wg, num_experts, k, straight_through, param_path)
    }

    /// Router with a given `(num_experts, hidden_size)` weight.
    pub fn from_weight(weight: Tensor, k: usize, straight_through: bool) -> Result<Self> {
        let (num_experts, _) = weight.dims2()?;
        Self::build(Linear::new(weight, None), num_experts, k, straight_through, "wg.weight".to_string())
    }

    fn build(
        wg: Linear,
        num_experts: usize,
        k: usize,
        straight_through: bool,
        param_path: String,
    ) -> Result<Self> {
        if k == 0 || k > num_experts {
            return Err(MoeError::Config(format!(
                "local router k ({}) must be in 1..={}",
                k, num_experts
            )));
        }
        Ok(Self { wg, num_experts, k, straight_through, param_path })
    }

    pub fn num_experts(&self) -> usize {
        self.num_experts
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Router parameters stay out of data-parallel averaging.
    pub fn sync_policies(&self, group_name: &str) -> Vec<(String, SyncPolicy)> {
        vec![(
            self.param_path.clone(),
            SyncPolicy::ExpertGroup { group_name: group_name.to_string() },
        )]
    }

    /// Route `x` (N, D) to `k` local experts per token.
    pub fn route(&self, x: &Tensor) -> Result<RouterOutput> {
        let (n, _) = x.dims2()?;
        let k = self.k;
        let device = x.device();

        let x = x.to_dtype(DType::F32)?;
        let wg = Linear::new(self.wg.weight().to_dtype(DType::F32)?, None);
        let logits = wg.forward(&x)?;
        let probs = ops::softmax_last_dim(&logits)?;

        let mut expert_ids = Vec::with_capacity(n * k);
        for row in probs.to_vec2::<f32>()? {
            expert_ids.extend(stable_top_k(&row, k));
        }

        // Stable sort keeps token order within an expert.
        let mut flat_order: Vec<usize> = (0..n * k).collect();
        flat_order.sort_by_key(|&i| expert_ids[i]);

        let reversed_order = inverse_permutation(
            &flat_order.iter().map(|&i| i as u32).collect::<Vec<_>>(),
        );
        let sort_order: Vec<u32> = flat_order.iter().map(|&i| (i / k) as u32).collect();

        let mut splits = vec![0usize; self.num_experts];
        for &expert in &expert_ids {
            splits[expert] += 1;
        }

        let idx: Vec<u32> = expert_ids.iter().map(|&e| e as u32).collect();
        let idx = Tensor::from_vec(idx, (n, k), device)?;
        let top_probs = probs.gather(&idx, 1)?;
        let mut weights = if k > 1 {
            ops::softmax_last_dim(&top_probs)?
        } else {
            top_probs
        };
        if self.straight_through {
            weights = ((&weights - weights.detach())? + 1.0)?;
        }

        Ok(RouterOutput {
            sort_order,
            reversed_order,
            combine_weights: weights.flatten_all()?,
            splits,
            routing_probs: probs,
            logits,
            expert_ids,
        })
    }
}

/// Exact inverse of a permutation: `inv[order[i]] == i`.
pub fn inverse_permutation(order: &[u32]) -> Vec<u32> {
    let mut inverse = vec![0u32; order.len()];
    for (pos, &src) in order.iter().enumerate() {
        inverse[src as usize] = pos as u32;
    }
    inverse
}

/// Top-1 one-hot (N, E) from flattened (token, choice) expert ids.
pub fn top1_mask(expert_ids: &[usize], k: usize, num_experts: usize, device: &candle_core::Device) -> Result<Tensor> {
    let n = expert_ids.len() / k;
    let mut mask = vec![0f32; n * num_experts];
    for t in 0..n {
        mask[t * num_experts + expert_ids[t * k]] = 1.0;
    }
    Ok(Tensor::from_vec(mask, (n, num_experts), device)?)
}
