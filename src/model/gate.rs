//! Capacity-constrained top-k gate.
//!
//! Scores tokens against experts in float32, picks the top-k experts per token
//! and assigns every selection a capacity slot inside its expert. Selections
//! that find no free slot are dropped silently.

use crate::distributed::ProcessGroup;
use crate::model::aux_loss::{AuxLoss, RoutingMetadata};
use crate::utils::config::{GateConfig, NoisyGatePolicy};
use crate::utils::error::{MoeError, Result};
use crate::utils::metrics;
use candle_core::{DType, Module, Tensor};
use candle_nn::{ops, Linear, VarBuilder};
use std::cmp::Ordering;
use tracing::{debug, warn};

const JITTER_EPS: f32 = 1e-2;

/// Result of one gate pass.
pub struct GateOutput {
    /// Weighted auxiliary loss (scalar)
    pub aux_loss: Tensor,
    /// Combine weights (N, E, C)
    pub combine_weights: Tensor,
    /// 0/1 slot occupancy (N, E, C)
    pub dispatch_mask: Tensor,
    /// Selections per expert over all k choices, before capacity drops
    pub exp_counts: Vec<usize>,
    /// Softmax routing probabilities (N, E)
    pub routing_probs: Tensor,
    pub metadata: RoutingMetadata,
    pub capacity: usize,
    /// Selections per token that found a capacity slot
    pub routed_per_token: Vec<usize>,
}

impl GateOutput {
    /// Number of selections dropped by capacity.
    pub fn dropped(&self) -> usize {
        let selected: usize = self.exp_counts.iter().sum();
        let routed: usize = self.routed_per_token.iter().sum();
        selected - routed
    }
}

/// Top-k gate with per-expert capacity.
pub struct TopKGate {
    wg: Linear,
    config: GateConfig,
    /// Group that agrees on capacity when tokens are never dropped
    group: ProcessGroup,
}

impl TopKGate {
    pub fn new(hidden_size: usize, config: GateConfig, group: ProcessGroup, vb: VarBuilder) -> Result<Self> {
        let wg = candle_nn::linear_no_bias(hidden_size, config.num_experts, vb.pp("wg"))?;
        Self::from_linear(wg, config, group)
    }

    /// Gate with a given `(num_experts, hidden_size)` weight.
    pub fn from_weight(weight: Tensor, config: GateConfig, group: ProcessGroup) -> Result<Self> {
        Self::from_linear(Linear::new(weight, None), config, group)
    }

    fn from_linear(wg: Linear, config: GateConfig, group: ProcessGroup) -> Result<Self> {
        let (experts, _) = wg.weight().dims2()?;
        if experts != config.num_experts {
            return Err(MoeError::Config(format!(
                "gate weight has {} rows, config expects {} experts",
                experts, config.num_experts
            )));
        }
        if config.top_k == 0 || config.top_k > config.num_experts {
            return Err(MoeError::Config(format!(
                "top_k ({}) must be in 1..={}",
                config.top_k, config.num_experts
            )));
        }
        Ok(Self { wg, config, group })
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        self.wg.weight()
    }

    /// Gate logits in float32 regardless of the input dtype.
    pub fn logits(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.to_dtype(DType::F32)?;
        let wg = Linear::new(self.wg.weight().to_dtype(DType::F32)?, None);
        Ok(wg.forward(&x)?)
    }

    /// Route `x` (N, D).
    ///
    /// `used_mask[t] == false` excludes token `t` from selection entirely.
    pub fn forward(&self, x: &Tensor, used_mask: Option<&[bool]>, training: bool) -> Result<GateOutput> {
        let (n, _) = x.dims2()?;
        let e = self.config.num_experts;
        let k = self.config.top_k;
        let device = x.device();

        if let Some(mask) = used_mask {
            if mask.len() != n {
                return Err(MoeError::Invariant(format!(
                    "used_mask has {} entries for {} tokens",
                    mask.len(),
                    n
                )));
            }
        }

        let mut input = x.to_dtype(DType::F32)?;
        if training && self.config.noisy_gate_policy == NoisyGatePolicy::Jitter {
            let noise = Tensor::rand(1f32 - JITTER_EPS, 1f32 + JITTER_EPS, input.dims(), device)?;
            input = (input * noise)?;
        }
        let logits = self.logits(&input)?;
        let probs = ops::softmax_last_dim(&logits)?;

        // Gumbel noise only perturbs which experts are chosen.
        let scores = if training && self.config.noisy_gate_policy == NoisyGatePolicy::RSample {
            let u = Tensor::rand(1e-9f32, 1f32, logits.dims(), device)?;
            let gumbel = u.log()?.neg()?.log()?.neg()?;
            (&logits + gumbel)?
        } else {
            probs.clone()
        };

        let scores_host = scores.to_vec2::<f32>()?;
        let selections: Vec<Vec<usize>> = scores_host
            .iter()
            .enumerate()
            .map(|(t, row)| {
                let used = used_mask.map_or(true, |m| m[t]);
                if used { stable_top_k(row, k) } else { Vec::new() }
            })
            .collect();

        let mut exp_counts = vec![0usize; e];
        for sel in &selections {
            for &expert in sel {
                exp_counts[expert] += 1;
            }
        }

        let capacity = self.capacity(n, &exp_counts, training)?;

        // Slots: all first choices in token order, then all second choices, ...
        let mut fill = vec![0usize; e];
        let mut routed_per_token = vec![0usize; n];
        let mut locations = vec![vec![0f32; n * e * capacity]; k];
        let mut topk_idx = vec![0u32; n * k];
        for rank in 0..k {
            for (t, sel) in selections.iter().enumerate() {
                let Some(&expert) = sel.get(rank) else {
                    continue;
                };
                topk_idx[t * k + rank] = expert as u32;
                if fill[expert] < capacity {
                    locations[rank][(t * e + expert) * capacity + fill[expert]] = 1.0;
                    fill[expert] += 1;
                    routed_per_token[t] += 1;
                }
            }
        }

        let topk_idx = Tensor::from_vec(topk_idx, (n, k), device)?;
        let selected = probs.gather(&topk_idx, 1)?;
        let mut weights = if k > 1 {
            ops::softmax_last_dim(&selected)?
        } else {
            selected
        };
        if self.config.straight_through_gate {
            weights = ((&weights - weights.detach())? + 1.0)?;
        }

        let mut combine_weights = Tensor::zeros((n, e, capacity), DType::F32, device)?;
        let mut dispatch_mask = Tensor::zeros((n, e, capacity), DType::F32, device)?;
        for (rank, loc) in locations.into_iter().enumerate() {
            let loc = Tensor::from_vec(loc, (n, e, capacity), device)?;
            let w = weights.narrow(1, rank, 1)?.reshape((n, 1, 1))?;
            combine_weights = (combine_weights + loc.broadcast_mul(&w)?)?;
            dispatch_mask = (dispatch_mask + loc)?;
        }

        // Balance statistics use first choices before drops.
        let mut top1 = vec![0f32; n * e];
        for (t, sel) in selections.iter().enumerate() {
            if let Some(&expert) = sel.first() {
                top1[t * e + expert] = 1.0;
            }
        }
        let top1 = Tensor::from_vec(top1, (n, e), device)?;
        let (aux_loss, mut metadata) =
            AuxLoss::compute(&probs, &top1, Some(&logits), &self.config.aux_loss_weights)?;

        let selected_total: usize = exp_counts.iter().sum();
        let routed: usize = routed_per_token.iter().sum();
        let dropped = selected_total - routed;
        for (i, &c) in exp_counts.iter().enumerate() {
            metadata.insert(format!("expert_{}_tokens", i), c as f64);
        }
        metadata.insert("capacity", capacity as f64);
        metadata.insert("dropped_tokens", dropped as f64);

        debug!(
            tokens = n,
            experts = e,
            k = k,
            capacity = capacity,
            dropped = dropped,
            "top-k gate pass"
        );
        if selected_total > 0 && dropped * 2 > selected_total {
            warn!(dropped = dropped, selected = selected_total, capacity = capacity, "gate dropped more than half of its selections");
        }
        metrics::record_gate_pass(&exp_counts, routed, dropped, capacity);
        if let Some(aux) = metadata.get("aux_loss") {
            metrics::record_aux_loss(aux);
        }

        Ok(GateOutput {
            aux_loss,
            combine_weights,
            dispatch_mask,
            exp_counts,
            routing_probs: probs,
            metadata,
            capacity,
            routed_per_token,
        })
    }

    /// Per-expert capacity for `n` tokens.
    ///
    /// With `drop_tokens` the capacity is `ceil(k * n / E * factor)` floored at
    /// `min_capacity`. Without it, capacity grows to the busiest expert, agreed
    /// across the expert group so every rank builds the same shapes.
    pub fn capacity(&self, n: usize, exp_counts: &[usize], training: bool) -> Result<usize> {
        if self.config.drop_tokens {
            let factor = if training {
                self.config.capacity_factor
            } else {
                self.config.eval_capacity_factor
            };
            let raw = (self.config.top_k * n) as f64 / self.config.num_experts as f64 * factor;
            return Ok((raw.ceil() as usize).max(self.config.min_capacity));
        }

        let local_max = exp_counts.iter().copied().max().unwrap_or(0);
        let agreed = if self.group.size() > 1 {
            let t = Tensor::new(&[local_max as u32], &candle_core::Device::Cpu)?;
            let gathered = self
                .group
                .communicator
                .all_gather(&t)
                .map_err(|e| MoeError::Communication(format!("capacity agreement: {}", e)))?;
            gathered.to_vec1::<u32>()?.into_iter().max().unwrap_or(0) as usize
        } else {
            local_max
        };
        Ok(agreed.max(1))
    }
}

/// Indices of the `k` largest entries, ties broken by the lower index.
pub fn stable_top_k(row: &[f32], k: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..row.len()).collect();
    idx.sort_by(|&a, &b| {
        row[b]
            .partial_cmp(&row[a])
            .unwrap_or(Ordering::Equal)
            .then(a.cmp(&b))
    });
    idx.truncate(k);
    idx
}
