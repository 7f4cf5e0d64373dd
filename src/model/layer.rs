//! A MoE layer: one routing strategy chosen from configuration.

use crate::distributed::{ParamSyncRegistry, ProcessGroup, SyncPolicy};
use crate::model::balanced::BalancedGate;
use crate::model::experts::{FeedForwardExpert, LocalExperts};
use crate::model::flat::{FlatRouting, ResidualMlp};
use crate::model::gate::TopKGate;
use crate::model::hierarchical::{BalancedHierarchicalRouting, HierarchicalRouting, LocalRouting};
use crate::model::post_routing::PostRoutingMoe;
use crate::model::router::LocalGate;
use crate::model::strategy::{ForwardContext, MoeOutput, RoutingStrategy};
use crate::utils::config::{GateConfig, MoeConfig};
use crate::utils::error::{MoeError, Result};
use candle_core::Tensor;
use candle_nn::VarBuilder;
use tracing::info;

/// The routing topology of one layer.
pub enum MoeLayer {
    Flat(FlatRouting),
    Hierarchical(HierarchicalRouting),
    Local(LocalRouting),
    BalancedHierarchical(BalancedHierarchicalRouting),
    PostRouting(PostRoutingMoe),
}

/// Expert pool for one layer under `vb`.
///
/// Dense-initialised pools start as copies of one freshly drawn MLP; only the
/// copies are registered.
pub fn build_experts(config: &MoeConfig, num_local: usize, vb: VarBuilder) -> Result<LocalExperts> {
    let d = config.model.hidden_size;
    let h = config.model.expert_hidden_size;
    if config.dense_init {
        let dense = FeedForwardExpert::unregistered(d, h, vb.dtype(), vb.device())?;
        LocalExperts::from_dense(&dense, num_local, vb)
    } else {
        LocalExperts::feed_forward(d, h, num_local, vb)
    }
}

impl MoeLayer {
    /// Pick and build the strategy `config` describes.
    ///
    /// - dense init + hierarchical: balanced hierarchical
    /// - dense init: post-routing
    /// - hierarchical over one device: local only
    /// - hierarchical: two-level capacity routing
    /// - otherwise: flat
    ///
    /// `experts` reuses an existing pool (expert sharing); otherwise one is built.
    pub fn build(config: &MoeConfig, group: ProcessGroup, experts: Option<LocalExperts>, vb: VarBuilder) -> Result<Self> {
        let gate_config = &config.gate;
        let d = config.model.hidden_size;
        let ep = group.size();
        if ep != config.distributed.ep_size {
            return Err(MoeError::Config(format!(
                "configured ep_size {} but the expert-parallel group has {} ranks",
                config.distributed.ep_size, ep
            )));
        }
        if gate_config.num_experts % ep != 0 {
            return Err(MoeError::Config(format!(
                "{} experts cannot be placed on {} devices",
                gate_config.num_experts, ep
            )));
        }
        let num_local = gate_config.num_experts / ep;
        let experts = match experts {
            Some(pool) if pool.len() == num_local => pool,
            Some(pool) => {
                return Err(MoeError::Config(format!(
                    "shared pool holds {} experts, layer needs {}",
                    pool.len(),
                    num_local
                )))
            }
            None => build_experts(config, num_local, vb.clone())?,
        };
        let st = gate_config.straight_through_gate;

        let layer = match (&config.hierarchical, config.dense_init) {
            (Some(hier), true) => {
                let outer = BalancedGate::new(d, ep, st, vb.pp("outer_gate"))?;
                let inner = LocalGate::new(d, num_local, hier.inside_k, st, vb.pp("inside_gate"))?;
                Self::BalancedHierarchical(BalancedHierarchicalRouting::new(
                    outer,
                    inner,
                    experts,
                    group,
                    hier.shuffle,
                    gate_config.aux_loss_weights,
                )?)
            }
            (None, true) => {
                let gate = TopKGate::new(d, gate_config.clone(), group.clone(), vb.pp("gate"))?;
                let post = config.post_routing.clone().unwrap_or_default();
                Self::PostRouting(PostRoutingMoe::new(gate, experts, group, post)?)
            }
            (Some(hier), false) => {
                if let Some(size) = hier.group_size {
                    if size != ep {
                        return Err(MoeError::Config(format!(
                            "hierarchical group_size {} does not match the expert-parallel group of {}",
                            size, ep
                        )));
                    }
                }
                let inner = LocalGate::new(d, num_local, hier.inside_k, st, vb.pp("inside_gate"))?;
                if ep == 1 {
                    Self::Local(LocalRouting::new(inner, experts, gate_config.aux_loss_weights)?)
                } else {
                    let outer_config = GateConfig {
                        num_experts: ep,
                        ..gate_config.clone()
                    };
                    let outer = TopKGate::new(d, outer_config, group.clone(), vb.pp("gate"))?;
                    Self::Hierarchical(HierarchicalRouting::new(
                        outer,
                        inner,
                        experts,
                        group,
                        gate_config.aux_loss_weights,
                    )?)
                }
            }
            (None, false) => {
                let gate = TopKGate::new(d, gate_config.clone(), group.clone(), vb.pp("gate"))?;
                let residual = if gate_config.use_residual {
                    Some(ResidualMlp::new(d, config.model.expert_hidden_size, vb.pp("residual"))?)
                } else {
                    None
                };
                Self::Flat(FlatRouting::new(gate, experts, group, residual)?)
            }
        };
        info!(strategy = layer.name(), prefix = %vb.prefix(), "built MoE layer");
        Ok(layer)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Flat(s) => s.name(),
            Self::Hierarchical(s) => s.name(),
            Self::Local(s) => s.name(),
            Self::BalancedHierarchical(s) => s.name(),
            Self::PostRouting(s) => s.name(),
        }
    }

    pub fn experts(&self) -> &LocalExperts {
        match self {
            Self::Flat(s) => s.experts(),
            Self::Hierarchical(s) => s.experts(),
            Self::Local(s) => s.experts(),
            Self::BalancedHierarchical(s) => s.experts(),
            Self::PostRouting(s) => s.experts(),
        }
    }

    /// Route `x` (..., D); leading dimensions are flattened into tokens.
    pub fn forward(&self, x: &Tensor, ctx: &ForwardContext) -> Result<MoeOutput> {
        let dims = x.dims().to_vec();
        let d = *dims
            .last()
            .ok_or_else(|| MoeError::Invariant("MoE input must have a hidden dimension".to_string()))?;
        let tokens = x.reshape(((), d))?;

        let mut out = match self {
            Self::Flat(s) => s.route(&tokens, ctx)?,
            Self::Hierarchical(s) => s.route(&tokens, ctx)?,
            Self::Local(s) => s.route(&tokens, ctx)?,
            Self::BalancedHierarchical(s) => s.route(&tokens, ctx)?,
            Self::PostRouting(s) => s.route(&tokens, ctx)?,
        };
        out.output = out.output.reshape(dims)?;
        Ok(out)
    }

    pub fn sync_policies(&self) -> Vec<(String, SyncPolicy)> {
        match self {
            Self::Flat(s) => s.sync_policies(),
            Self::Hierarchical(s) => s.sync_policies(),
            Self::Local(s) => s.sync_policies(),
            Self::BalancedHierarchical(s) => s.sync_policies(),
            Self::PostRouting(s) => s.sync_policies(),
        }
    }

    /// Record this layer's non-default synchronisation policies.
    pub fn register_sync(&self, registry: &mut ParamSyncRegistry) {
        for (param, policy) in self.sync_policies() {
            registry.register(param, policy);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::experts::Expert;
    use crate::utils::config::{HierarchicalConfig, LayoutConfig};
    use candle_core::{DType, Device};
    use candle_nn::{Optimizer, VarMap, SGD};

    fn small_config() -> MoeConfig {
        MoeConfig {
            gate: GateConfig::new(4, 2, 2.0),
            model: LayoutConfig {
                hidden_size: 8,
                expert_hidden_size: 16,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_strategy_selection() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);

        let config = small_config();
        let flat = MoeLayer::build(&config, ProcessGroup::single(), None, vb.pp("flat"))?;
        assert_eq!(flat.name(), "flat");

        let mut hier = small_config();
        hier.hierarchical = Some(HierarchicalConfig::default());
        let local = MoeLayer::build(&hier, ProcessGroup::single(), None, vb.pp("local"))?;
        assert_eq!(local.name(), "local");

        let mut dense = small_config();
        dense.dense_init = true;
        let post = MoeLayer::build(&dense, ProcessGroup::single(), None, vb.pp("post"))?;
        assert_eq!(post.name(), "post_routing");

        dense.hierarchical = Some(HierarchicalConfig::default());
        let balanced = MoeLayer::build(&dense, ProcessGroup::single(), None, vb.pp("balanced"))?;
        assert_eq!(balanced.name(), "balanced_hierarchical");
        Ok(())
    }

    #[test]
    fn test_forward_keeps_batch_shape() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = MoeLayer::build(&small_config(), ProcessGroup::single(), None, vb.pp("moe"))?;

        let x = Tensor::randn(0f32, 1f32, (2, 3, 8), &Device::Cpu)?;
        let out = layer.forward(&x, &ForwardContext::train())?;
        assert_eq!(out.output.dims(), &[2, 3, 8]);
        assert!(out.aux_loss.to_scalar::<f32>()?.is_finite());
        Ok(())
    }

    #[test]
    fn test_expert_params_registered() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut config = small_config();
        config.hierarchical = Some(HierarchicalConfig::default());
        let layer = MoeLayer::build(&config, ProcessGroup::single(), None, vb.pp("layers.1"))?;

        let mut registry = ParamSyncRegistry::new();
        layer.register_sync(&mut registry);
        assert_eq!(
            registry.policy("layers.1.experts.0.fc1.weight"),
            SyncPolicy::ExpertGroup { group_name: "ep_size_1".to_string() }
        );
        assert_eq!(
            registry.policy("layers.1.inside_gate.wg.weight"),
            SyncPolicy::ExpertGroup { group_name: "ep_size_1".to_string() }
        );
        assert_eq!(registry.policy("layers.1.gate.wg.weight"), SyncPolicy::DataParallel);
        Ok(())
    }

    #[test]
    fn test_dense_init_experts_are_trainable() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut config = small_config();
        config.dense_init = true;
        let layer = MoeLayer::build(&config, ProcessGroup::single(), None, vb.pp("moe"))?;

        let keys: Vec<String> = varmap.data().lock().expect("varmap lock").keys().cloned().collect();
        assert!(keys.iter().all(|k| !k.contains("dense")), "orphan dense vars: {:?}", keys);
        let mut registry = ParamSyncRegistry::new();
        layer.register_sync(&mut registry);
        assert_eq!(registry.expert_params().len(), 8);
        for name in registry.expert_params() {
            assert!(keys.iter().any(|k| k == name), "{} missing from varmap", name);
        }

        let snapshot = |layer: &MoeLayer| -> Result<Vec<f32>> {
            let mut values = Vec::new();
            for i in 0..layer.experts().len() {
                if let Some(expert) = layer.experts().get(i) {
                    for w in expert.weights() {
                        values.extend(w.flatten_all()?.to_vec1::<f32>()?);
                    }
                }
            }
            Ok(values)
        };

        let x = Tensor::randn(0f32, 1f32, (16, 8), &Device::Cpu)?;
        let before = layer.forward(&x, &ForwardContext::train())?.output;
        let weights_before = snapshot(&layer)?;

        let mut sgd = SGD::new(varmap.all_vars(), 0.1)?;
        sgd.backward_step(&before.sqr()?.sum_all()?)?;

        let moved = snapshot(&layer)?
            .iter()
            .zip(&weights_before)
            .any(|(a, b)| a != b);
        assert!(moved, "expert weights unchanged after an optimizer step");

        let after = layer.forward(&x, &ForwardContext::train())?.output;
        let change = (after - before)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(change > 0.0);
        Ok(())
    }

    #[test]
    fn test_group_must_match_configured_ep_size() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut config = small_config();
        config.distributed.ep_size = 2;
        let built = MoeLayer::build(&config, ProcessGroup::single(), None, vb.pp("moe"));
        assert!(matches!(built, Err(MoeError::Config(_))));
        Ok(())
    }
}
