//! Which layers of a stack are MoE, and which of them share experts.

use crate::distributed::{ParamSyncRegistry, ProcessGroup};
use crate::model::aux_loss::RoutingMetadata;
use crate::model::experts::{Expert, FeedForwardExpert, LocalExperts};
use crate::model::layer::MoeLayer;
use crate::model::strategy::ForwardContext;
use crate::utils::config::{LayoutConfig, MoeConfig};
use crate::utils::error::{MoeError, Result};
use candle_core::Tensor;
use candle_nn::VarBuilder;
use std::collections::HashMap;
use tracing::{debug, info};

/// Layer `index` is MoE iff `moe_freq > 0` and it is the last of every
/// `moe_freq` layers.
pub fn is_moe_layer(index: usize, moe_freq: usize) -> bool {
    moe_freq > 0 && index % moe_freq == moe_freq - 1
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerKind {
    Dense,
    Moe {
        /// Sharing group key, `moe_group_<g>`
        tie: Option<String>,
        /// Builds the pool the rest of its group reuses
        owner: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSpec {
    pub index: usize,
    pub kind: LayerKind,
}

/// Lay out `config.num_layers` layers.
pub fn plan_layers(config: &LayoutConfig) -> Result<Vec<LayerSpec>> {
    if let Some(share) = &config.share_layers {
        if config.pipe_parallel_size > 1 {
            return Err(MoeError::Config(
                "expert sharing across layers is not supported with pipeline parallelism".to_string(),
            ));
        }
        if share.group_size == 0 || config.num_layers % share.group_size != 0 {
            return Err(MoeError::Config(format!(
                "{} layers cannot be split into sharing groups of {}",
                config.num_layers, share.group_size
            )));
        }
    }

    let mut seen = HashMap::new();
    let specs = (0..config.num_layers)
        .map(|index| {
            let kind = if is_moe_layer(index, config.moe_freq) {
                let tie = config
                    .share_layers
                    .as_ref()
                    .map(|share| format!("moe_group_{}", index / share.group_size));
                let owner = match &tie {
                    Some(key) => seen.insert(key.clone(), index).is_none(),
                    None => true,
                };
                LayerKind::Moe { tie, owner }
            } else {
                LayerKind::Dense
            };
            LayerSpec { index, kind }
        })
        .collect();
    Ok(specs)
}

enum StackLayer {
    Dense(FeedForwardExpert),
    Moe(MoeLayer),
}

/// Output of a stack pass.
pub struct StackOutput {
    pub output: Tensor,
    /// One per MoE layer, in layer order
    pub aux_losses: Vec<Tensor>,
    pub metadata: Vec<RoutingMetadata>,
    /// Sum of the per-layer records
    pub totals: RoutingMetadata,
}

/// A residual stack of feed-forward layers, some of them MoE.
pub struct MoeStack {
    specs: Vec<LayerSpec>,
    layers: Vec<StackLayer>,
}

impl MoeStack {
    pub fn new(config: &MoeConfig, group: ProcessGroup, vb: VarBuilder) -> Result<Self> {
        let specs = plan_layers(&config.model)?;
        let d = config.model.hidden_size;
        let h = config.model.expert_hidden_size;

        let mut pools: HashMap<String, LocalExperts> = HashMap::new();
        let mut layers = Vec::with_capacity(specs.len());
        for spec in &specs {
            let vb = vb.pp(format!("layers.{}", spec.index));
            let layer = match &spec.kind {
                LayerKind::Dense => StackLayer::Dense(FeedForwardExpert::new(d, h, vb.pp("mlp"))?),
                LayerKind::Moe { tie, .. } => {
                    let shared = tie.as_ref().and_then(|key| pools.get(key).cloned());
                    let layer = MoeLayer::build(config, group.clone(), shared, vb)?;
                    if let Some(key) = tie {
                        pools.entry(key.clone()).or_insert_with(|| layer.experts().clone());
                    }
                    StackLayer::Moe(layer)
                }
            };
            layers.push(layer);
        }

        let moe_layers = specs
            .iter()
            .filter(|s| matches!(s.kind, LayerKind::Moe { .. }))
            .count();
        info!(layers = specs.len(), moe_layers = moe_layers, shared_pools = pools.len(), "built MoE stack");
        Ok(Self { specs, layers })
    }

    pub fn specs(&self) -> &[LayerSpec] {
        &self.specs
    }

    /// The MoE layer at `index`, if that layer is MoE.
    pub fn moe_layer(&self, index: usize) -> Option<&MoeLayer> {
        match self.layers.get(index) {
            Some(StackLayer::Moe(layer)) => Some(layer),
            _ => None,
        }
    }

    /// `x + layer(x)` through every layer.
    pub fn forward(&self, x: &Tensor, ctx: &ForwardContext) -> Result<StackOutput> {
        let mut h = x.clone();
        let mut aux_losses = Vec::new();
        let mut metadata = Vec::new();
        let mut totals = RoutingMetadata::new();
        for (spec, layer) in self.specs.iter().zip(&self.layers) {
            let delta = match layer {
                StackLayer::Dense(mlp) => mlp.forward(&h)?,
                StackLayer::Moe(moe) => {
                    let out = moe.forward(&h, ctx)?;
                    aux_losses.push(out.aux_loss);
                    totals.accumulate(&out.metadata);
                    metadata.push(out.metadata);
                    out.output
                }
            };
            h = (h + delta)?;
            debug!(layer = spec.index, "stack layer done");
        }
        Ok(StackOutput { output: h, aux_losses, metadata, totals })
    }

    /// Synchronisation policies of every MoE layer.
    pub fn sync_registry(&self) -> ParamSyncRegistry {
        let mut registry = ParamSyncRegistry::new();
        for layer in &self.layers {
            if let StackLayer::Moe(moe) = layer {
                moe.register_sync(&mut registry);
            }
        }
        registry
    }
}
