//! Two-level routing: across devices, then among the experts of a device.
//!
//! - `HierarchicalRouting`: capacity-constrained outer gate over devices,
//!   capacity-free inner router over local experts.
//! - `LocalRouting`: the degenerate single-device form, no exchange at all.
//! - `BalancedHierarchicalRouting`: forced balanced outer assignment with
//!   variable splits and an optional training-time shuffle.

use crate::distributed::{exchange, ExpertExchange, ProcessGroup, SyncPolicy};
use crate::model::aux_loss::{AuxLoss, RoutingMetadata};
use crate::model::balanced::BalancedGate;
use crate::model::dispatch::{combine_sorted, dense_combine, dense_dispatch, index_tensor};
use crate::model::experts::LocalExperts;
use crate::model::gate::{GateOutput, TopKGate};
use crate::model::router::{inverse_permutation, top1_mask, LocalGate};
use crate::model::strategy::{ForwardContext, MoeOutput, RoutingStrategy};
use crate::utils::config::AuxLossWeights;
use crate::utils::error::{MoeError, Result};
use candle_core::{DType, Tensor, D};
use tracing::{debug, info};

/// Output of the intra-device stage.
pub struct LocalMoeOutput {
    /// Combined expert output, same rows as the input
    pub output: Tensor,
    /// Inner routing probabilities (R, L)
    pub probs: Tensor,
    pub logits: Tensor,
    /// Flattened (token, choice) expert ids
    pub expert_ids: Vec<usize>,
}

/// Route rows among local experts without dropping any of them.
pub fn local_moe(router: &LocalGate, experts: &LocalExperts, x: &Tensor) -> Result<LocalMoeOutput> {
    let routed = router.route(x)?;
    let rows = routed.sort_order.len();
    let sorted = if rows == 0 {
        x.clone()
    } else {
        x.index_select(&index_tensor(&routed.sort_order, x.device())?, 0)?
    };
    let expert_out = experts.forward_split(&sorted, &routed.splits)?;
    let output = combine_sorted(&expert_out, &routed.reversed_order, &routed.combine_weights, router.k())?;

    debug!(rows = rows, splits = ?routed.splits, "local expert pass");
    Ok(LocalMoeOutput {
        output,
        probs: routed.routing_probs,
        logits: routed.logits,
        expert_ids: routed.expert_ids,
    })
}

fn expert_group_name(ep_size: usize) -> String {
    format!("ep_size_{}", ep_size)
}

fn router_and_expert_policies(router_policies: Vec<(String, SyncPolicy)>, experts: &LocalExperts, ep_size: usize) -> Vec<(String, SyncPolicy)> {
    let policy = SyncPolicy::ExpertGroup { group_name: expert_group_name(ep_size) };
    router_policies
        .into_iter()
        .chain(experts.param_names().into_iter().map(|name| (name, policy.clone())))
        .collect()
}

/// Intra-device routing only.
pub struct LocalRouting {
    router: LocalGate,
    experts: LocalExperts,
    aux_weights: AuxLossWeights,
}

impl LocalRouting {
    pub fn new(router: LocalGate, experts: LocalExperts, aux_weights: AuxLossWeights) -> Result<Self> {
        if experts.len() == 1 {
            return Err(MoeError::Config(
                "local routing needs more than one local expert".to_string(),
            ));
        }
        if router.num_experts() != experts.len() {
            return Err(MoeError::Config(format!(
                "router scores {} experts, pool holds {}",
                router.num_experts(),
                experts.len()
            )));
        }
        info!(experts = experts.len(), k = router.k(), "local MoE routing");
        Ok(Self { router, experts, aux_weights })
    }

    pub fn experts(&self) -> &LocalExperts {
        &self.experts
    }
}

impl RoutingStrategy for LocalRouting {
    type Plan = Option<LocalMoeOutput>;

    fn name(&self) -> &'static str {
        "local"
    }

    fn gate(&self, _x: &Tensor, _ctx: &ForwardContext) -> Result<Self::Plan> {
        // Routing and compute happen together below.
        Ok(None)
    }

    fn exchange_if_needed(&self, x: &Tensor, plan: &mut Self::Plan, _ctx: &ForwardContext) -> Result<Tensor> {
        let local = local_moe(&self.router, &self.experts, x)?;
        let output = local.output.clone();
        *plan = Some(local);
        Ok(output)
    }

    fn combine(&self, _x: &Tensor, expert_out: Tensor, plan: Self::Plan, _ctx: &ForwardContext) -> Result<MoeOutput> {
        let local = plan.ok_or_else(|| MoeError::Invariant("local routing combined before exchange".to_string()))?;
        let mask = top1_mask(&local.expert_ids, self.router.k(), self.experts.len(), expert_out.device())?;
        let (aux_loss, metadata) = AuxLoss::compute(&local.probs, &mask, Some(&local.logits), &self.aux_weights)?;
        Ok(MoeOutput { output: expert_out, aux_loss, metadata })
    }

    fn sync_policies(&self) -> Vec<(String, SyncPolicy)> {
        router_and_expert_policies(self.router.sync_policies(&expert_group_name(1)), &self.experts, 1)
    }
}

/// Plan of the capacity-constrained two-level route.
pub struct HierarchicalPlan {
    gate: GateOutput,
    global: Option<(Tensor, RoutingMetadata)>,
}

/// Outer top-k gate over devices, inner permutation router over local experts.
pub struct HierarchicalRouting {
    outer: TopKGate,
    inner: LocalGate,
    experts: LocalExperts,
    group: ProcessGroup,
    aux_weights: AuxLossWeights,
}

impl HierarchicalRouting {
    pub fn new(
        outer: TopKGate,
        inner: LocalGate,
        experts: LocalExperts,
        group: ProcessGroup,
        aux_weights: AuxLossWeights,
    ) -> Result<Self> {
        if outer.config().num_experts != group.size() {
            return Err(MoeError::Config(format!(
                "outer gate scores {} devices, group has {}",
                outer.config().num_experts,
                group.size()
            )));
        }
        if inner.num_experts() != experts.len() {
            return Err(MoeError::Config(format!(
                "inner router scores {} experts, pool holds {}",
                inner.num_experts(),
                experts.len()
            )));
        }
        info!(
            devices = group.size(),
            local = experts.len(),
            outer_k = outer.config().top_k,
            inside_k = inner.k(),
            "hierarchical MoE routing"
        );
        Ok(Self { outer, inner, experts, group, aux_weights })
    }

    pub fn experts(&self) -> &LocalExperts {
        &self.experts
    }
}

impl RoutingStrategy for HierarchicalRouting {
    type Plan = HierarchicalPlan;

    fn name(&self) -> &'static str {
        "hierarchical"
    }

    fn gate(&self, x: &Tensor, ctx: &ForwardContext) -> Result<HierarchicalPlan> {
        let gate = self.outer.forward(x, ctx.used_mask, ctx.training)?;
        Ok(HierarchicalPlan { gate, global: None })
    }

    fn exchange_if_needed(&self, x: &Tensor, plan: &mut HierarchicalPlan, _ctx: &ForwardContext) -> Result<Tensor> {
        let (_, d) = x.dims2()?;
        let ep = self.group.size();

        // Outer probabilities ride along as extra columns so every received
        // row carries its own cross-device distribution.
        let probs = plan.gate.routing_probs.to_dtype(x.dtype())?;
        let payload = Tensor::cat(&[x, &probs], D::Minus1)?;
        let slots = dense_dispatch(&plan.gate.dispatch_mask, &payload)?;
        let (_, c, width) = slots.dims3()?;

        let received = exchange(&slots.reshape((ep * c, width))?, &self.group, None, None)?;
        let tokens = received.narrow(1, 0, d)?.contiguous()?;
        let outer_probs = received.narrow(1, d, ep)?.to_dtype(DType::F32)?;

        let local = local_moe(&self.inner, &self.experts, &tokens)?;

        // Empty capacity slots carry all-zero outer probabilities.
        let occupied: Vec<u32> = outer_probs
            .sum(1)?
            .to_vec1::<f32>()?
            .iter()
            .enumerate()
            .filter(|&(_, &s)| s > 0.0)
            .map(|(i, _)| i as u32)
            .collect();
        let index = index_tensor(&occupied, x.device())?;
        let (outer_real, inner_real) = if occupied.is_empty() {
            (
                Tensor::zeros((0, ep), DType::F32, x.device())?,
                Tensor::zeros((0, self.experts.len()), DType::F32, x.device())?,
            )
        } else {
            (outer_probs.index_select(&index, 0)?, local.probs.index_select(&index, 0)?)
        };
        let rows = occupied.len();
        let l = self.experts.len();
        let global_probs = outer_real
            .reshape((rows, ep, 1))?
            .broadcast_mul(&inner_real.reshape((rows, 1, l))?)?
            .reshape((rows, ep * l))?;
        let mut mask = vec![0f32; rows * ep * l];
        for (r, row) in global_probs.to_vec2::<f32>()?.iter().enumerate() {
            let best = crate::model::gate::stable_top_k(row, 1);
            if let Some(&j) = best.first() {
                mask[r * ep * l + j] = 1.0;
            }
        }
        let mask = Tensor::from_vec(mask, (rows, ep * l), x.device())?;
        plan.global = Some(AuxLoss::compute(&global_probs, &mask, None, &self.aux_weights)?);

        let returned = exchange(&local.output, &self.group, None, None)?;
        Ok(returned.reshape((ep, c, d))?)
    }

    fn combine(&self, _x: &Tensor, expert_out: Tensor, plan: HierarchicalPlan, _ctx: &ForwardContext) -> Result<MoeOutput> {
        let output = dense_combine(&plan.gate.combine_weights, &expert_out)?;
        let (global_loss, global_meta) = plan
            .global
            .ok_or_else(|| MoeError::Invariant("hierarchical plan combined before exchange".to_string()))?;

        let mut metadata = plan.gate.metadata;
        metadata.merge(global_meta.with_prefix("global_"));
        Ok(MoeOutput { output, aux_loss: global_loss, metadata })
    }

    fn sync_policies(&self) -> Vec<(String, SyncPolicy)> {
        let ep = self.group.size();
        router_and_expert_policies(self.inner.sync_policies(&expert_group_name(ep)), &self.experts, ep)
    }
}

/// Plan of the balanced two-level route.
pub struct BalancedPlan {
    /// Rows actually routed (shuffled when shuffling is on)
    features: Tensor,
    shuffle: Option<Vec<u32>>,
    sort_by_expert: Vec<u32>,
    expert_counts: Vec<usize>,
    routing_probs: Tensor,
    aux: Option<(Tensor, RoutingMetadata)>,
}

/// Forced balanced outer assignment over devices.
pub struct BalancedHierarchicalRouting {
    outer: BalancedGate,
    inner: LocalGate,
    experts: LocalExperts,
    exchange: ExpertExchange,
    shuffle: bool,
    aux_weights: AuxLossWeights,
}

impl BalancedHierarchicalRouting {
    pub fn new(
        outer: BalancedGate,
        inner: LocalGate,
        experts: LocalExperts,
        group: ProcessGroup,
        shuffle: bool,
        aux_weights: AuxLossWeights,
    ) -> Result<Self> {
        if outer.num_experts() != group.size() {
            return Err(MoeError::Config(format!(
                "balanced outer gate scores {} devices, group has {}",
                outer.num_experts(),
                group.size()
            )));
        }
        if inner.num_experts() != experts.len() {
            return Err(MoeError::Config(format!(
                "inner router scores {} experts, pool holds {}",
                inner.num_experts(),
                experts.len()
            )));
        }
        let exchange = ExpertExchange::new(group, outer.num_experts())?;
        info!(
            devices = exchange.group().size(),
            local = experts.len(),
            shuffle = shuffle,
            "balanced hierarchical MoE routing"
        );
        Ok(Self { outer, inner, experts, exchange, shuffle, aux_weights })
    }

    pub fn experts(&self) -> &LocalExperts {
        &self.experts
    }

    fn random_permutation(n: usize, device: &candle_core::Device) -> Result<Vec<u32>> {
        let keys = Tensor::rand(0f32, 1f32, (n,), device)?.to_vec1::<f32>()?;
        let mut perm: Vec<u32> = (0..n as u32).collect();
        perm.sort_by(|&a, &b| {
            keys[a as usize]
                .partial_cmp(&keys[b as usize])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(perm)
    }
}

impl RoutingStrategy for BalancedHierarchicalRouting {
    type Plan = BalancedPlan;

    fn name(&self) -> &'static str {
        "balanced_hierarchical"
    }

    fn gate(&self, x: &Tensor, ctx: &ForwardContext) -> Result<BalancedPlan> {
        let group = self.exchange.group();
        let (n, _) = x.dims2()?;

        let (features, shuffle) = if self.shuffle && ctx.training {
            // Break correlations within the batch by scattering rows over ranks.
            let perm = Self::random_permutation(n, x.device())?;
            let shuffled = x.index_select(&index_tensor(&perm, x.device())?, 0)?;
            (exchange(&shuffled, group, None, None)?, Some(perm))
        } else {
            (x.clone(), None)
        };

        let assignment = self.outer.assign(&features)?;
        Ok(BalancedPlan {
            features,
            shuffle,
            sort_by_expert: assignment.sort_by_expert,
            expert_counts: assignment.expert_counts,
            routing_probs: assignment.routing_probs,
            aux: None,
        })
    }

    fn exchange_if_needed(&self, _x: &Tensor, plan: &mut BalancedPlan, _ctx: &ForwardContext) -> Result<Tensor> {
        let index = index_tensor(&plan.sort_by_expert, plan.features.device())?;
        let dispatched = plan.features.index_select(&index, 0)?;
        let (routed, exchange_plan) = self.exchange.dispatch(&dispatched, &plan.expert_counts)?;

        let local = local_moe(&self.inner, &self.experts, &routed)?;
        let mask = top1_mask(&local.expert_ids, self.inner.k(), self.experts.len(), routed.device())?;
        plan.aux = Some(AuxLoss::compute(&local.probs, &mask, Some(&local.logits), &self.aux_weights)?);

        self.exchange.combine(&local.output, &exchange_plan)
    }

    fn combine(&self, _x: &Tensor, expert_out: Tensor, plan: BalancedPlan, _ctx: &ForwardContext) -> Result<MoeOutput> {
        let restore = index_tensor(&inverse_permutation(&plan.sort_by_expert), expert_out.device())?;
        let recovered = expert_out.index_select(&restore, 0)?;
        let weights = plan.routing_probs.to_dtype(recovered.dtype())?.unsqueeze(1)?;
        let mut output = recovered.broadcast_mul(&weights)?;

        if let Some(perm) = &plan.shuffle {
            let unshuffled = exchange(&output, self.exchange.group(), None, None)?;
            let restore = index_tensor(&inverse_permutation(perm), unshuffled.device())?;
            output = unshuffled.index_select(&restore, 0)?;
        }

        let (aux_loss, metadata) = plan
            .aux
            .ok_or_else(|| MoeError::Invariant("balanced plan combined before exchange".to_string()))?;
        Ok(MoeOutput { output, aux_loss, metadata })
    }

    fn sync_policies(&self) -> Vec<(String, SyncPolicy)> {
        let ep = self.exchange.group().size();
        router_and_expert_policies(self.inner.sync_policies(&expert_group_name(ep)), &self.experts, ep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::experts::Expert;
    use crate::utils::config::GateConfig;
    use candle_core::Device;
    use std::sync::Arc;

    struct Scale(f64);

    impl Expert for Scale {
        fn forward(&self, x: &Tensor) -> Result<Tensor> {
            Ok((x * self.0)?)
        }
        fn weights(&self) -> Vec<Tensor> {
            Vec::new()
        }
        fn param_names(&self) -> Vec<String> {
            Vec::new()
        }
    }

    fn pool() -> Result<LocalExperts> {
        LocalExperts::new(vec![
            Arc::new(Scale(2.0)) as Arc<dyn Expert>,
            Arc::new(Scale(-1.0)) as Arc<dyn Expert>,
        ])
    }

    #[test]
    fn test_local_moe_top1() -> Result<()> {
        let w = Tensor::from_vec(vec![1f32, 0., 0., 1.], (2, 2), &Device::Cpu)?;
        let router = LocalGate::from_weight(w, 1, false)?;
        let x = Tensor::from_vec(vec![1f32, 0., 0., 1.], (2, 2), &Device::Cpu)?;

        let out = local_moe(&router, &pool()?, &x)?;
        let p = 1.0 / (1.0 + (-1f32).exp());
        let got = out.output.to_vec2::<f32>()?;
        assert!((got[0][0] - 2.0 * p).abs() < 1e-5);
        assert!((got[1][1] + p).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_single_device_hierarchical_reports_global_metadata() -> Result<()> {
        let group = ProcessGroup::single();
        let outer = TopKGate::from_weight(
            Tensor::zeros((1, 2), DType::F32, &Device::Cpu)?,
            GateConfig::new(1, 1, 1.0),
            group.clone(),
        )?;
        let inner = LocalGate::from_weight(Tensor::randn(0f32, 1f32, (2, 2), &Device::Cpu)?, 1, false)?;
        let hier = HierarchicalRouting::new(outer, inner, pool()?, group, AuxLossWeights::default())?;

        let x = Tensor::randn(0f32, 1f32, (6, 2), &Device::Cpu)?;
        let out = hier.route(&x, &ForwardContext::eval())?;
        assert_eq!(out.output.dims(), &[6, 2]);
        assert!(out.metadata.contains("global_aux_loss"));
        assert_eq!(out.metadata.get("dropped_tokens"), Some(0.0));
        let counted: f64 = out.metadata.expert_counts("global_", 2).iter().sum();
        assert_eq!(counted, 6.0);
        Ok(())
    }

    #[test]
    fn test_balanced_single_device_weights_by_probability() -> Result<()> {
        let group = ProcessGroup::single();
        let outer = BalancedGate::from_weight(Tensor::zeros((1, 2), DType::F32, &Device::Cpu)?, false)?;
        let w = Tensor::from_vec(vec![1f32, 0., 0., 1.], (2, 2), &Device::Cpu)?;
        let inner = LocalGate::from_weight(w.clone(), 1, false)?;
        let balanced = BalancedHierarchicalRouting::new(outer, inner, pool()?, group, true, AuxLossWeights::default())?;

        let x = Tensor::from_vec(vec![1f32, 0., 0., 1., 3., 0.], (3, 2), &Device::Cpu)?;
        let out = balanced.route(&x, &ForwardContext::train())?;

        // one device: outer probability is 1, result equals the local pass
        let reference = local_moe(&LocalGate::from_weight(w, 1, false)?, &pool()?, &x)?;
        let got = out.output.to_vec2::<f32>()?;
        let want = reference.output.to_vec2::<f32>()?;
        for (g, w) in got.iter().flatten().zip(want.iter().flatten()) {
            assert!((g - w).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_balanced_rejects_router_pool_mismatch() -> Result<()> {
        let outer = BalancedGate::from_weight(Tensor::zeros((1, 2), DType::F32, &Device::Cpu)?, false)?;
        let inner = LocalGate::from_weight(Tensor::zeros((3, 2), DType::F32, &Device::Cpu)?, 1, false)?;
        let built =
            BalancedHierarchicalRouting::new(outer, inner, pool()?, ProcessGroup::single(), false, AuxLossWeights::default());
        assert!(matches!(built, Err(MoeError::Config(_))));
        Ok(())
    }
}
