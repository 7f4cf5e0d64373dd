//! Auxiliary routing losses and the per-pass metadata record.

use crate::distributed::{all_reduce_scalar, ProcessGroup};
use crate::utils::config::AuxLossWeights;
use crate::utils::error::{MoeError, Result};
use candle_core::{DType, Tensor, D};
use std::collections::BTreeMap;

/// String-keyed scalars describing one routing pass.
///
/// Keys: `aux_loss`, `load_balance_loss`, `zloss`, `entropy_loss`,
/// `expert_<i>_tokens` plus whatever the strategy adds (`capacity`,
/// `dropped_tokens`, `fallback_tokens`, `global_*`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingMetadata {
    values: BTreeMap<String, f64>,
}

impl RoutingMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: f64) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Copy of this record with every key prefixed, e.g. `global_`.
    pub fn with_prefix(&self, prefix: &str) -> Self {
        Self {
            values: self
                .values
                .iter()
                .map(|(k, v)| (format!("{}{}", prefix, k), *v))
                .collect(),
        }
    }

    /// Merge `other` into `self`; keys from `other` win.
    pub fn merge(&mut self, other: RoutingMetadata) {
        self.values.extend(other.values);
    }

    /// Sum the values of keys present in both records (per-layer accumulation).
    pub fn accumulate(&mut self, other: &RoutingMetadata) {
        for (k, v) in &other.values {
            *self.values.entry(k.clone()).or_insert(0.0) += v;
        }
    }

    /// Per-expert token counts stored under `expert_<i>_tokens`.
    pub fn expert_counts(&self, prefix: &str, num_experts: usize) -> Vec<f64> {
        (0..num_experts)
            .map(|i| {
                self.get(&format!("{}expert_{}_tokens", prefix, i))
                    .unwrap_or(0.0)
            })
            .collect()
    }

    /// Average every value over `group`.
    ///
    /// Collective: all ranks must hold the same key set. Keys are visited in
    /// sorted order so the reduction sequence matches across ranks.
    pub fn reduce_mean(&self, group: &ProcessGroup) -> Result<Self> {
        let mut reduced = Self::new();
        for (k, v) in &self.values {
            let mean = all_reduce_scalar(*v, group.communicator.as_ref())?;
            reduced.insert(k.clone(), mean);
        }
        Ok(reduced)
    }
}

/// Load-balance, z-loss and entropy regularizers.
pub struct AuxLoss;

impl AuxLoss {
    /// Compute the weighted auxiliary loss for one routing pass.
    ///
    /// Args:
    ///   probs: Routing probabilities (N, E)
    ///   mask: Top-1 selection one-hot (N, E), before capacity drops
    ///   logits: Raw gate logits (N, E), when available
    ///   weights: Per-term weights
    ///
    /// Returns:
    ///   (scalar loss tensor, metadata)
    pub fn compute(
        probs: &Tensor,
        mask: &Tensor,
        logits: Option<&Tensor>,
        weights: &AuxLossWeights,
    ) -> Result<(Tensor, RoutingMetadata)> {
        let (n, e) = probs.dims2()?;
        if mask.dims2()? != (n, e) {
            return Err(MoeError::Invariant(format!(
                "aux loss mask {:?} does not match probabilities ({}, {})",
                mask.dims(),
                n,
                e
            )));
        }

        let mut meta = RoutingMetadata::new();
        let counts = mask.to_dtype(DType::F32)?.sum(0)?.to_vec1::<f32>()?;
        for (i, c) in counts.iter().enumerate() {
            meta.insert(format!("expert_{}_tokens", i), *c as f64);
        }

        if n == 0 {
            let zero = Tensor::zeros((), DType::F32, probs.device())?;
            meta.insert("load_balance_loss", 0.0);
            meta.insert("entropy_loss", 0.0);
            if logits.is_some() {
                meta.insert("zloss", 0.0);
            }
            meta.insert("aux_loss", 0.0);
            return Ok((zero, meta));
        }

        let probs = probs.to_dtype(DType::F32)?;
        let mask = mask.to_dtype(DType::F32)?;

        // GShard: E * sum_e mean(probs_e) * fraction_e
        let me = probs.mean(0)?;
        let ce = mask.mean(0)?;
        let load_balance = ((me * ce)?.sum_all()? * e as f64)?;

        let entropy = probs
            .clamp(1e-9f32, 1f32)?
            .log()?
            .mul(&probs)?
            .sum(D::Minus1)?
            .neg()?
            .mean_all()?;

        let mut loss = (load_balance.clone() * weights.load_balance)?;
        loss = (loss + (entropy.clone() * weights.entropy)?)?;

        meta.insert("load_balance_loss", load_balance.to_scalar::<f32>()? as f64);
        meta.insert("entropy_loss", entropy.to_scalar::<f32>()? as f64);

        if let Some(logits) = logits {
            let zloss = logsumexp(&logits.to_dtype(DType::F32)?)?.sqr()?.mean_all()?;
            meta.insert("zloss", zloss.to_scalar::<f32>()? as f64);
            loss = (loss + (zloss * weights.zloss)?)?;
        }

        meta.insert("aux_loss", loss.to_scalar::<f32>()? as f64);
        Ok((loss, meta))
    }
}

/// Numerically stable log-sum-exp over the last dimension.
pub fn logsumexp(x: &Tensor) -> Result<Tensor> {
    let max = x.max_keepdim(D::Minus1)?;
    let shifted = x.broadcast_sub(&max)?.exp()?.sum_keepdim(D::Minus1)?.log()?;
    Ok((shifted + max)?.squeeze(D::Minus1)?)
}
