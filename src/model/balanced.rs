//! Forced balanced assignment.
//!
//! Every expert receives exactly `N / E` tokens. Assignment is greedy over
//! (token, expert) scores in descending order, ties broken by token index and
//! then expert index.

use crate::distributed::SyncPolicy;
use crate::utils::error::{MoeError, Result};
use candle_core::{DType, Module, Tensor};
use candle_nn::{ops, Linear, VarBuilder};
use std::cmp::Ordering;
use tracing::debug;

/// Result of a balanced assignment.
pub struct BalancedAssignment {
    /// Token indices grouped by expert, token order within an expert
    pub sort_by_expert: Vec<u32>,
    /// Tokens per expert (all equal)
    pub expert_counts: Vec<usize>,
    /// Assigned expert per token
    pub expert_of: Vec<usize>,
    /// Weight of each token's assigned expert, token order (N,)
    pub routing_probs: Tensor,
    /// Full softmax probabilities (N, E)
    pub probs: Tensor,
}

pub struct BalancedGate {
    wg: Linear,
    num_experts: usize,
    straight_through: bool,
    param_path: String,
}

impl BalancedGate {
    pub fn new(hidden_size: usize, num_experts: usize, straight_through: bool, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("wg");
        let param_path = format!("{}.weight", vb.prefix());
        let wg = candle_nn::linear_no_bias(hidden_size, num_experts, vb)?;
        Ok(Self { wg, num_experts, straight_through, param_path })
    }

    pub fn from_weight(weight: Tensor, straight_through: bool) -> Result<Self> {
        let (num_experts, _) = weight.dims2()?;
        Ok(Self {
            wg: Linear::new(weight, None),
            num_experts,
            straight_through,
            param_path: "wg.weight".to_string(),
        })
    }

    pub fn num_experts(&self) -> usize {
        self.num_experts
    }

    pub fn sync_policies(&self, group_name: &str) -> Vec<(String, SyncPolicy)> {
        vec![(
            self.param_path.clone(),
            SyncPolicy::ExpertGroup { group_name: group_name.to_string() },
        )]
    }

    /// Assign `x` (N, D) so that each expert gets `N / E` tokens.
    pub fn assign(&self, x: &Tensor) -> Result<BalancedAssignment> {
        let (n, _) = x.dims2()?;
        let e = self.num_experts;
        if n % e != 0 {
            return Err(MoeError::Invariant(format!(
                "balanced assignment needs a multiple of {} tokens, got {}",
                e, n
            )));
        }
        let per_expert = n / e;

        let x = x.to_dtype(DType::F32)?;
        let wg = Linear::new(self.wg.weight().to_dtype(DType::F32)?, None);
        let probs = ops::softmax_last_dim(&wg.forward(&x)?)?;
        let scores = probs.to_vec2::<f32>()?;

        let mut pairs: Vec<(usize, usize)> = (0..n)
            .flat_map(|t| (0..e).map(move |j| (t, j)))
            .collect();
        pairs.sort_by(|&(ta, ea), &(tb, eb)| {
            scores[tb][eb]
                .partial_cmp(&scores[ta][ea])
                .unwrap_or(Ordering::Equal)
                .then(ta.cmp(&tb))
                .then(ea.cmp(&eb))
        });

        let mut expert_of = vec![usize::MAX; n];
        let mut expert_counts = vec![0usize; e];
        let mut assigned = 0;
        for (t, j) in pairs {
            if assigned == n {
                break;
            }
            if expert_of[t] == usize::MAX && expert_counts[j] < per_expert {
                expert_of[t] = j;
                expert_counts[j] += 1;
                assigned += 1;
            }
        }

        let mut sort_by_expert: Vec<u32> = (0..n as u32).collect();
        sort_by_expert.sort_by_key(|&t| expert_of[t as usize]);

        let idx: Vec<u32> = expert_of.iter().map(|&j| j as u32).collect();
        let idx = Tensor::from_vec(idx, (n, 1), probs.device())?;
        let mut routing_probs = probs.gather(&idx, 1)?.squeeze(1)?;
        if self.straight_through {
            routing_probs = ((&routing_probs - routing_probs.detach())? + 1.0)?;
        }

        debug!(tokens = n, experts = e, per_expert = per_expert, "balanced assignment");

        Ok(BalancedAssignment {
            sort_by_expert,
            expert_counts,
            expert_of,
            routing_probs,
            probs,
        })
    }
}
