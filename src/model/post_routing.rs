//! Dense-initialised routing with an overflow fallback.
//!
//! Experts start as identical copies of one dense MLP, so any token the
//! capacity-constrained gate fails to route can be recomputed by any expert
//! without changing the function the layer computes.

use crate::distributed::{ExpertExchange, ExpertParallelConfig, ProcessGroup, SyncPolicy};
use crate::model::balanced::BalancedGate;
use crate::model::dispatch::{dense_combine, dense_dispatch, index_tensor};
use crate::model::experts::LocalExperts;
use crate::model::flat::run_slots;
use crate::model::gate::{GateOutput, TopKGate};
use crate::model::router::inverse_permutation;
use crate::model::strategy::{ForwardContext, MoeOutput, RoutingStrategy};
use crate::utils::config::{FallbackKind, PostRoutingConfig, UnroutedPolicy};
use crate::utils::error::{MoeError, Result};
use crate::utils::metrics;
use candle_core::{DType, Device, Tensor};
use tracing::{debug, info};

/// `(post * post_probs + top1 * top1_probs) / max(post_probs + top1_probs, eps)`.
///
/// Blends the fallback output of a partially routed token with what its
/// successful selections produced, each in proportion to its confidence.
pub fn blend_overflow(post_out: &Tensor, post_probs: &Tensor, top1_out: &Tensor, top1_probs: &Tensor) -> Result<Tensor> {
    let dtype = post_out.dtype();
    let pp = post_probs.to_dtype(dtype)?.unsqueeze(1)?;
    let tp = top1_probs.to_dtype(dtype)?.unsqueeze(1)?;
    let numerator = (post_out.broadcast_mul(&pp)? + top1_out.broadcast_mul(&tp)?)?;
    let denominator = (&pp + &tp)?.maximum(f32::EPSILON as f64)?;
    Ok(numerator.broadcast_div(&denominator)?)
}

/// Replace rows `idx` of `t` with `rows`.
fn replace_rows(t: &Tensor, idx: &Tensor, rows: &Tensor) -> Result<Tensor> {
    let delta = (rows - t.index_select(idx, 0)?)?;
    Ok(t.index_add(idx, &delta, 0)?)
}

/// Evenly sized contiguous chunks: `n` rows over `parts`, sizes differ by at most one.
pub fn even_splits(n: usize, parts: usize) -> Vec<usize> {
    (0..parts)
        .map(|i| n / parts + usize::from(i < n % parts))
        .collect()
}

enum Fallback {
    /// Recompute on this device's experts, rows split evenly.
    Local,
    /// Forced balanced assignment over every expert, padded to a multiple of E.
    Balanced { gate: BalancedGate, exchange: ExpertExchange },
}

pub struct PostRoutingPlan {
    gate: GateOutput,
    policy: UnroutedPolicy,
}

/// Capacity-constrained routing whose overflow is recomputed by a fallback pass.
pub struct PostRoutingMoe {
    gate: TopKGate,
    experts: LocalExperts,
    group: ProcessGroup,
    placement: ExpertParallelConfig,
    config: PostRoutingConfig,
    fallback: Fallback,
}

impl PostRoutingMoe {
    /// Experts must hold identical weights.
    pub fn new(gate: TopKGate, experts: LocalExperts, group: ProcessGroup, config: PostRoutingConfig) -> Result<Self> {
        let placement = ExpertParallelConfig::new(gate.config().num_experts, &group)?;
        if experts.len() != placement.num_local_experts {
            return Err(MoeError::Config(format!(
                "{} local experts given, placement expects {}",
                experts.len(),
                placement.num_local_experts
            )));
        }
        experts.assert_identical()?;

        let fallback = match config.fallback {
            FallbackKind::Local => Fallback::Local,
            FallbackKind::Balanced => Fallback::Balanced {
                // Shares the routing gate's weight.
                gate: BalancedGate::from_weight(gate.weight().clone(), true)?,
                exchange: ExpertExchange::new(group.clone(), placement.num_experts)?,
            },
        };

        let k = gate.config().top_k;
        if k == 1 && config.unrouted_policy == UnroutedPolicy::Any {
            info!("top-1 gate: unrouted policy `any` behaves as `all`");
        }
        info!(
            experts = placement.num_experts,
            local = placement.num_local_experts,
            k = k,
            fallback = ?config.fallback,
            policy = ?config.unrouted_policy,
            threshold = config.threshold_for(k),
            "dense-initialised MoE routing"
        );
        Ok(Self { gate, experts, group, placement, config, fallback })
    }

    pub fn experts(&self) -> &LocalExperts {
        &self.experts
    }

    /// Run the fallback on rows `x` (M, D).
    ///
    /// Returns the outputs and the global expert id that produced each row.
    /// The balanced fallback issues collectives, so every rank calls it even
    /// with no rows.
    pub fn post_routing(&self, x: &Tensor) -> Result<(Tensor, Vec<usize>)> {
        let (m, d) = x.dims2()?;
        match &self.fallback {
            Fallback::Local => {
                if m == 0 {
                    return Ok((x.clone(), Vec::new()));
                }
                let local = self.experts.len();
                let splits = even_splits(m, local);
                let out = self.experts.forward_split(x, &splits)?;
                let base = self.placement.ep_rank * local;
                let ids = splits
                    .iter()
                    .enumerate()
                    .flat_map(|(i, &len)| std::iter::repeat(base + i).take(len))
                    .collect();
                Ok((out, ids))
            }
            Fallback::Balanced { gate, exchange } => {
                let e = gate.num_experts();
                let pad = if m < e || m % e != 0 { e - m % e } else { 0 };
                let zeros = Tensor::zeros((pad, d), x.dtype(), x.device())?;
                let padded = match (m, pad) {
                    (0, _) => zeros,
                    (_, 0) => x.clone(),
                    _ => Tensor::cat(&[x, &zeros], 0)?,
                };

                let assignment = gate.assign(&padded)?;
                let sorted = padded.index_select(&index_tensor(&assignment.sort_by_expert, x.device())?, 0)?;
                let (routed, plan) = exchange.dispatch(&sorted, &assignment.expert_counts)?;
                let expert_out = self.experts.forward_split(&routed, &plan.local_splits)?;
                let returned = exchange.combine(&expert_out, &plan)?;

                let restore = index_tensor(&inverse_permutation(&assignment.sort_by_expert), x.device())?;
                let weights = assignment.routing_probs.to_dtype(x.dtype())?.unsqueeze(1)?;
                let out = returned.index_select(&restore, 0)?.broadcast_mul(&weights)?;

                debug!(rows = m, padded = m + pad, "balanced fallback pass");
                let mut ids = assignment.expert_of;
                ids.truncate(m);
                Ok((out.narrow(0, 0, m)?, ids))
            }
        }
    }

    fn eligible(ctx: &ForwardContext, t: usize) -> bool {
        ctx.used_mask.map_or(true, |m| m[t])
    }
}

fn gather_rows(t: &Tensor, rows: &[u32], device: &Device) -> Result<Tensor> {
    if rows.is_empty() {
        let (_, d) = t.dims2()?;
        return Ok(Tensor::zeros((0, d), t.dtype(), device)?);
    }
    Ok(t.index_select(&index_tensor(rows, device)?, 0)?)
}

impl RoutingStrategy for PostRoutingMoe {
    type Plan = PostRoutingPlan;

    fn name(&self) -> &'static str {
        "post_routing"
    }

    fn gate(&self, x: &Tensor, ctx: &ForwardContext) -> Result<PostRoutingPlan> {
        let mut gate = self.gate.forward(x, ctx.used_mask, ctx.training)?;
        let policy = if self.gate.config().top_k == 1 {
            // Routed tokens see the dense function exactly, gradient still
            // flows into the gate.
            let cw = &gate.combine_weights;
            gate.combine_weights = ((cw - cw.detach())? + &gate.dispatch_mask)?;
            UnroutedPolicy::All
        } else {
            self.config.unrouted_policy
        };
        Ok(PostRoutingPlan { gate, policy })
    }

    fn exchange_if_needed(&self, x: &Tensor, plan: &mut PostRoutingPlan, _ctx: &ForwardContext) -> Result<Tensor> {
        let slots = dense_dispatch(&plan.gate.dispatch_mask, x)?;
        run_slots(&slots, &self.experts, &self.group, &self.placement)
    }

    fn combine(&self, x: &Tensor, expert_out: Tensor, plan: PostRoutingPlan, ctx: &ForwardContext) -> Result<MoeOutput> {
        let device = x.device();
        let output = dense_combine(&plan.gate.combine_weights, &expert_out)?;
        let routed = &plan.gate.routed_per_token;

        let threshold = match plan.policy {
            UnroutedPolicy::All => 1,
            UnroutedPolicy::Any => self.config.threshold_for(self.gate.config().top_k),
        };
        let unrouted: Vec<u32> = (0..routed.len())
            .filter(|&t| Self::eligible(ctx, t) && routed[t] < threshold)
            .map(|t| t as u32)
            .collect();

        let post_in = gather_rows(x, &unrouted, device)?;
        let (post_out, post_ids) = self.post_routing(&post_in)?;

        let output = if unrouted.is_empty() {
            output
        } else {
            let idx = index_tensor(&unrouted, device)?;
            let rows = match plan.policy {
                UnroutedPolicy::All => post_out,
                UnroutedPolicy::Any => {
                    let probs = plan.gate.routing_probs.index_select(&idx, 0)?;
                    let partial: Vec<f32> = unrouted
                        .iter()
                        .map(|&t| if routed[t as usize] > 0 { 1.0 } else { 0.0 })
                        .collect();
                    let partial = Tensor::from_vec(partial, (unrouted.len(),), device)?;
                    let top1_probs = (probs.max(1)? * partial)?;

                    let ids: Vec<u32> = post_ids.iter().map(|&j| j as u32).collect();
                    let ids = Tensor::from_vec(ids, (unrouted.len(), 1), device)?;
                    let post_probs = probs.gather(&ids, 1)?.squeeze(1)?;

                    let top1_out = output.index_select(&idx, 0)?;
                    blend_overflow(&post_out, &post_probs, &top1_out, &top1_probs)?
                }
            };
            replace_rows(&output, &idx, &rows.to_dtype(output.dtype())?)?
        };

        let mut metadata = plan.gate.metadata;
        metadata.insert("fallback_tokens", unrouted.len() as f64);
        metrics::record_fallback_tokens(unrouted.len());
        debug!(fallback = unrouted.len(), policy = ?plan.policy, "post-routing pass");

        Ok(MoeOutput {
            output,
            aux_loss: plan.gate.aux_loss,
            metadata,
        })
    }

    fn sync_policies(&self) -> Vec<(String, SyncPolicy)> {
        let policy = SyncPolicy::ExpertGroup { group_name: format!("ep_size_{}", self.placement.ep_size) };
        self.experts
            .param_names()
            .into_iter()
            .map(|name| (name, policy.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::experts::{Expert, FeedForwardExpert};
    use crate::utils::config::GateConfig;
    use candle_nn::{VarBuilder, VarMap};

    fn dense_pool(d: usize, n: usize) -> Result<(FeedForwardExpert, LocalExperts)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let dense = FeedForwardExpert::new(d, 2 * d, vb.pp("dense"))?;
        let pool = LocalExperts::from_dense(&dense, n, vb.pp("moe"))?;
        Ok((dense, pool))
    }

    #[test]
    fn test_even_splits() {
        assert_eq!(even_splits(7, 3), vec![3, 2, 2]);
        assert_eq!(even_splits(2, 4), vec![1, 1, 0, 0]);
        assert_eq!(even_splits(0, 2), vec![0, 0]);
    }

    #[test]
    fn test_blend_overflow_weights_by_confidence() -> Result<()> {
        let post = Tensor::new(&[[1f32, 0.0]], &Device::Cpu)?;
        let top1 = Tensor::new(&[[0f32, 1.0]], &Device::Cpu)?;
        let pp = Tensor::new(&[0.4f32], &Device::Cpu)?;
        let tp = Tensor::new(&[0.9f32], &Device::Cpu)?;
        let got = blend_overflow(&post, &pp, &top1, &tp)?.to_vec2::<f32>()?;
        assert!((got[0][0] - 0.4 / 1.3).abs() < 1e-6);
        assert!((got[0][1] - 0.9 / 1.3).abs() < 1e-6);

        // both confidences zero: no NaN
        let zero = Tensor::new(&[0f32], &Device::Cpu)?;
        let got = blend_overflow(&post, &zero, &top1, &zero)?.to_vec2::<f32>()?;
        assert!(got[0].iter().all(|v| v.is_finite()));
        Ok(())
    }

    #[test]
    fn test_top1_with_fallback_matches_dense() -> Result<()> {
        let (dense, pool) = dense_pool(4, 2)?;
        let mut config = GateConfig::new(2, 1, 0.25);
        config.min_capacity = 1;
        let gate = TopKGate::from_weight(
            Tensor::randn(0f32, 1f32, (2, 4), &Device::Cpu)?,
            config,
            ProcessGroup::single(),
        )?;
        let moe = PostRoutingMoe::new(gate, pool, ProcessGroup::single(), PostRoutingConfig::default())?;

        let x = Tensor::randn(0f32, 1f32, (8, 4), &Device::Cpu)?;
        let out = moe.route(&x, &ForwardContext::train())?;
        assert!(out.metadata.get("fallback_tokens").unwrap_or(0.0) > 0.0);

        let want = dense.forward(&x)?.to_vec2::<f32>()?;
        let got = out.output.to_vec2::<f32>()?;
        for (g, w) in got.iter().flatten().zip(want.iter().flatten()) {
            assert!((g - w).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_balanced_fallback_pads_and_trims() -> Result<()> {
        let (_, pool) = dense_pool(4, 3)?;
        let gate = TopKGate::from_weight(
            Tensor::randn(0f32, 1f32, (3, 4), &Device::Cpu)?,
            GateConfig::new(3, 2, 1.0),
            ProcessGroup::single(),
        )?;
        let config = PostRoutingConfig {
            fallback: FallbackKind::Balanced,
            ..Default::default()
        };
        let moe = PostRoutingMoe::new(gate, pool, ProcessGroup::single(), config)?;

        let x = Tensor::randn(0f32, 1f32, (4, 4), &Device::Cpu)?;
        let (out, ids) = moe.post_routing(&x)?;
        assert_eq!(out.dims(), &[4, 4]);
        assert_eq!(ids.len(), 4);
        assert!(ids.iter().all(|&j| j < 3));

        let (empty, ids) = moe.post_routing(&Tensor::zeros((0, 4), DType::F32, &Device::Cpu)?)?;
        assert_eq!(empty.dims(), &[0, 4]);
        assert!(ids.is_empty());
        Ok(())
    }

    #[test]
    fn test_rejects_distinct_experts() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let pool = LocalExperts::feed_forward(4, 8, 2, vb)?;
        let gate = TopKGate::from_weight(
            Tensor::randn(0f32, 1f32, (2, 4), &Device::Cpu)?,
            GateConfig::new(2, 1, 1.0),
            ProcessGroup::single(),
        )?;
        let result = PostRoutingMoe::new(gate, pool, ProcessGroup::single(), PostRoutingConfig::default());
        assert!(matches!(result, Err(MoeError::Config(_))));
        Ok(())
    }
}
