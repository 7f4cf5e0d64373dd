//! The routing strategy interface shared by every MoE variant.

use crate::distributed::SyncPolicy;
use crate::model::aux_loss::RoutingMetadata;
use crate::utils::error::Result;
use candle_core::Tensor;

/// Per-call switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardContext<'a> {
    pub training: bool,
    /// Tokens marked `false` are never routed
    pub used_mask: Option<&'a [bool]>,
}

impl<'a> ForwardContext<'a> {
    pub fn train() -> Self {
        Self { training: true, used_mask: None }
    }

    pub fn eval() -> Self {
        Self { training: false, used_mask: None }
    }

    pub fn with_used_mask(mut self, mask: &'a [bool]) -> Self {
        self.used_mask = Some(mask);
        self
    }
}

/// Output of one MoE forward pass.
pub struct MoeOutput {
    /// Same shape as the input
    pub output: Tensor,
    /// Weighted auxiliary loss (scalar)
    pub aux_loss: Tensor,
    pub metadata: RoutingMetadata,
}

/// One routing topology.
///
/// `gate` decides placement, `exchange_if_needed` moves tokens to their
/// experts, runs them and brings the outputs home, `combine` weights and
/// reorders them. Implementations that issue collectives do so on every rank
/// of their group unconditionally.
pub trait RoutingStrategy {
    /// Everything `gate` decides that later stages need.
    type Plan;

    fn name(&self) -> &'static str;

    fn gate(&self, x: &Tensor, ctx: &ForwardContext) -> Result<Self::Plan>;

    /// Expert outputs for the tokens in `plan`, back on this device.
    fn exchange_if_needed(&self, x: &Tensor, plan: &mut Self::Plan, ctx: &ForwardContext) -> Result<Tensor>;

    fn combine(&self, x: &Tensor, expert_out: Tensor, plan: Self::Plan, ctx: &ForwardContext) -> Result<MoeOutput>;

    /// Route `x` (N, D) end to end.
    fn route(&self, x: &Tensor, ctx: &ForwardContext) -> Result<MoeOutput> {
        let mut plan = self.gate(x, ctx)?;
        let expert_out = self.exchange_if_needed(x, &mut plan, ctx)?;
        self.combine(x, expert_out, plan, ctx)
    }

    /// Parameters that must not be averaged over the data-parallel group.
    fn sync_policies(&self) -> Vec<(String, SyncPolicy)> {
        Vec::new()
    }
}
