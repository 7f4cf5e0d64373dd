//! Flat capacity-constrained routing over every expert of the group.

use crate::distributed::{exchange, ExpertParallelConfig, ProcessGroup, SyncPolicy};
use crate::model::dispatch::{dense_combine, dense_dispatch};
use crate::model::experts::{Expert, FeedForwardExpert, LocalExperts};
use crate::model::gate::{GateOutput, TopKGate};
use crate::model::strategy::{ForwardContext, MoeOutput, RoutingStrategy};
use crate::utils::config::GateConfig;
use crate::utils::error::{MoeError, Result};
use candle_core::{Module, Tensor};
use candle_nn::{ops, Linear, VarBuilder};
use tracing::info;

/// Dense MLP blended with the MoE output through a learned 2-way coefficient.
pub struct ResidualMlp {
    mlp: FeedForwardExpert,
    coefficient: Linear,
}

impl ResidualMlp {
    pub fn new(hidden_size: usize, expert_hidden: usize, vb: VarBuilder) -> Result<Self> {
        let mlp = FeedForwardExpert::new(hidden_size, expert_hidden, vb.pp("mlp"))?;
        let coefficient = candle_nn::linear(hidden_size, 2, vb.pp("coefficient"))?;
        Ok(Self { mlp, coefficient })
    }

    fn blend(&self, x: &Tensor, moe_out: &Tensor) -> Result<Tensor> {
        let dense = self.mlp.forward(x)?;
        let coef = ops::softmax_last_dim(&self.coefficient.forward(x)?)?;
        let moe = moe_out.broadcast_mul(&coef.narrow(1, 0, 1)?)?;
        let res = dense.broadcast_mul(&coef.narrow(1, 1, 1)?)?;
        Ok((moe + res)?)
    }
}

/// GShard-style routing: one gate over all `E` experts, slots exchanged with
/// an equal-split all-to-all.
pub struct FlatRouting {
    gate: TopKGate,
    experts: LocalExperts,
    group: ProcessGroup,
    placement: ExpertParallelConfig,
    residual: Option<ResidualMlp>,
}

impl FlatRouting {
    pub fn new(
        gate: TopKGate,
        experts: LocalExperts,
        group: ProcessGroup,
        residual: Option<ResidualMlp>,
    ) -> Result<Self> {
        let placement = ExpertParallelConfig::new(gate.config().num_experts, &group)?;
        if experts.len() != placement.num_local_experts {
            return Err(MoeError::Config(format!(
                "{} local experts given, placement expects {}",
                experts.len(),
                placement.num_local_experts
            )));
        }
        info!(
            experts = placement.num_experts,
            local = placement.num_local_experts,
            ep = placement.ep_size,
            k = gate.config().top_k,
            residual = residual.is_some(),
            "flat MoE routing"
        );
        Ok(Self { gate, experts, group, placement, residual })
    }

    /// Build gate, experts and optional residual under `vb`.
    pub fn from_config(
        hidden_size: usize,
        expert_hidden: usize,
        config: &GateConfig,
        group: ProcessGroup,
        vb: VarBuilder,
    ) -> Result<Self> {
        let gate = TopKGate::new(hidden_size, config.clone(), group.clone(), vb.pp("gate"))?;
        let num_local = config.num_experts / group.size().max(1);
        let experts = LocalExperts::feed_forward(hidden_size, expert_hidden, num_local, vb.clone())?;
        let residual = if config.use_residual {
            Some(ResidualMlp::new(hidden_size, expert_hidden, vb.pp("residual"))?)
        } else {
            None
        };
        Self::new(gate, experts, group, residual)
    }

    pub fn experts(&self) -> &LocalExperts {
        &self.experts
    }
}

/// Run experts on capacity slots (E, C, D), exchanging over `group`.
pub(crate) fn run_slots(
    slots: &Tensor,
    experts: &LocalExperts,
    group: &ProcessGroup,
    placement: &ExpertParallelConfig,
) -> Result<Tensor> {
    let (e, c, d) = slots.dims3()?;
    let ep = placement.ep_size;
    let local = placement.num_local_experts;

    let received = exchange(&slots.reshape((e * c, d))?, group, None, None)?;
    let grouped = received.reshape((ep, local, c, d))?;
    let out = experts.forward_grouped(&grouped)?;
    if out.dims() != grouped.dims() {
        return Err(MoeError::Invariant(format!(
            "expert output {:?} does not match dispatched {:?}",
            out.dims(),
            grouped.dims()
        )));
    }
    let returned = exchange(&out.reshape((ep * local * c, d))?, group, None, None)?;
    Ok(returned.reshape((e, c, d))?)
}

impl RoutingStrategy for FlatRouting {
    type Plan = GateOutput;

    fn name(&self) -> &'static str {
        "flat"
    }

    fn gate(&self, x: &Tensor, ctx: &ForwardContext) -> Result<GateOutput> {
        self.gate.forward(x, ctx.used_mask, ctx.training)
    }

    fn exchange_if_needed(&self, x: &Tensor, plan: &mut GateOutput, _ctx: &ForwardContext) -> Result<Tensor> {
        let slots = dense_dispatch(&plan.dispatch_mask, x)?;
        run_slots(&slots, &self.experts, &self.group, &self.placement)
    }

    fn combine(&self, x: &Tensor, expert_out: Tensor, plan: GateOutput, _ctx: &ForwardContext) -> Result<MoeOutput> {
        let mut output = dense_combine(&plan.combine_weights, &expert_out)?;
        if let Some(residual) = &self.residual {
            output = residual.blend(x, &output)?;
        }
        Ok(MoeOutput {
            output,
            aux_loss: plan.aux_loss,
            metadata: plan.metadata,
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
