//! Configuration loading with JSON file support and environment variable overrides.
//!
//! Pattern: `MOE_*` environment variables override config file values.
//! Example: `MOE_TOP_K=2` overrides `gate.top_k`, `MOE_GATE__CAPACITY_FACTOR=1.5`
//! targets the gate section explicitly.

use crate::utils::error::{MoeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Noise applied to the gate during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NoisyGatePolicy {
    #[default]
    None,
    /// Multiplicative uniform noise on the gate input.
    Jitter,
    /// Gumbel noise on the logits, used for expert selection only.
    RSample,
}

impl NoisyGatePolicy {
    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "none" | "" => Some(Self::None),
            "jitter" => Some(Self::Jitter),
            "rsample" => Some(Self::RSample),
            _ => None,
        }
    }
}

/// Which tokens the post-routing fallback recomputes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnroutedPolicy {
    /// Tokens that no stage routed.
    #[default]
    All,
    /// Tokens that at least one stage failed to route, blended by confidence.
    Any,
}

/// Where the post-routing fallback runs overflow tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FallbackKind {
    /// Evenly over the experts resident on this device.
    #[default]
    Local,
    /// Forced balanced assignment over every expert in the group.
    Balanced,
}

/// Weights of the auxiliary regularizers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AuxLossWeights {
    #[serde(default = "default_one_f64")]
    pub load_balance: f64,
    #[serde(default)]
    pub zloss: f64,
    #[serde(default)]
    pub entropy: f64,
}

impl Default for AuxLossWeights {
    fn default() -> Self {
        Self { load_balance: 1.0, zloss: 0.0, entropy: 0.0 }
    }
}

/// Gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Number of experts the gate scores against
    #[serde(default = "default_num_experts")]
    pub num_experts: usize,

    /// Experts selected per token
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Capacity multiplier used while training
    #[serde(default = "default_capacity_factor")]
    pub capacity_factor: f64,

    /// Capacity multiplier used in evaluation
    #[serde(default = "default_capacity_factor")]
    pub eval_capacity_factor: f64,

    /// Lower bound on per-expert capacity
    #[serde(default = "default_min_capacity")]
    pub min_capacity: usize,

    /// Drop selections beyond capacity instead of growing capacity
    #[serde(default = "default_true")]
    pub drop_tokens: bool,

    /// Blend with a dense residual expert (flat routing only)
    #[serde(default)]
    pub use_residual: bool,

    #[serde(default)]
    pub noisy_gate_policy: NoisyGatePolicy,

    /// Force effective combine weights to 1 while keeping their gradient
    #[serde(default)]
    pub straight_through_gate: bool,

    #[serde(default)]
    pub aux_loss_weights: AuxLossWeights,
}

/// Two-level routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchicalConfig {
    /// Experts selected per token by the intra-device router
    #[serde(default = "default_one")]
    pub inside_k: usize,

    /// Cross-device group size; defaults to the expert-parallel size
    #[serde(default)]
    pub group_size: Option<usize>,

    /// Shuffle tokens across ranks before balanced routing (training only)
    #[serde(default)]
    pub shuffle: bool,
}

/// Overflow handling for dense-initialised routing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostRoutingConfig {
    #[serde(default)]
    pub fallback: FallbackKind,

    #[serde(default)]
    pub unrouted_policy: UnroutedPolicy,

    /// Number of successful routings a token needs to count as routed under
    /// `UnroutedPolicy::Any`. Defaults to `top_k`, or 2 for top-3 gates.
    #[serde(default)]
    pub routed_threshold: Option<usize>,
}

impl PostRoutingConfig {
    pub fn threshold_for(&self, top_k: usize) -> usize {
        self.routed_threshold
            .unwrap_or(if top_k == 3 { 2 } else { top_k })
    }
}

/// Expert sharing between MoE layers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareLayersConfig {
    /// Number of consecutive layers that share one expert pool
    pub group_size: usize,
}

/// Layer stack configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutConfig {
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,

    #[serde(default = "default_expert_hidden_size")]
    pub expert_hidden_size: usize,

    #[serde(default = "default_num_layers")]
    pub num_layers: usize,

    /// Every `moe_freq`-th layer is a MoE layer; 0 disables MoE
    #[serde(default = "default_moe_freq")]
    pub moe_freq: usize,

    #[serde(default)]
    pub share_layers: Option<ShareLayersConfig>,

    #[serde(default = "default_one")]
    pub pipe_parallel_size: usize,

    /// Weight of the summed auxiliary losses in the training loss
    #[serde(default = "default_moe_loss_weight")]
    pub moe_loss_weight: f64,
}

/// Distributed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// Expert parallelism degree
    #[serde(default = "default_one")]
    pub ep_size: usize,
}

/// Complete configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MoeConfig {
    #[serde(default)]
    pub gate: GateConfig,

    #[serde(default)]
    pub hierarchical: Option<HierarchicalConfig>,

    #[serde(default)]
    pub post_routing: Option<PostRoutingConfig>,

    /// Experts start as copies of a dense MLP ("moe-from-dense")
    #[serde(default)]
    pub dense_init: bool,

    #[serde(default)]
    pub model: LayoutConfig,

    #[serde(default)]
    pub distributed: DistributedConfig,

    /// Additional key-value configuration
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

// Default value functions
fn default_num_experts() -> usize { 8 }
fn default_top_k() -> usize { 1 }
fn default_capacity_factor() -> f64 { 1.0 }
fn default_min_capacity() -> usize { 4 }
fn default_true() -> bool { true }
fn default_one() -> usize { 1 }
fn default_one_f64() -> f64 { 1.0 }
fn default_hidden_size() -> usize { 1024 }
fn default_expert_hidden_size() -> usize { 4096 }
fn default_num_layers() -> usize { 24 }
fn default_moe_freq() -> usize { 2 }
fn default_moe_loss_weight() -> f64 { 0.01 }

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            num_experts: default_num_experts(),
            top_k: default_top_k(),
            capacity_factor: default_capacity_factor(),
            eval_capacity_factor: default_capacity_factor(),
            min_capacity: default_min_capacity(),
            drop_tokens: true,
            use_residual: false,
            noisy_gate_policy: NoisyGatePolicy::None,
            straight_through_gate: false,
            aux_loss_weights: AuxLossWeights::default(),
        }
    }
}

impl GateConfig {
    /// Small gate for tests and demos.
    pub fn new(num_experts: usize, top_k: usize, capacity_factor: f64) -> Self {
        Self {
            num_experts,
            top_k,
            capacity_factor,
            eval_capacity_factor: capacity_factor,
            ..Default::default()
        }
    }
}

impl Default for HierarchicalConfig {
    fn default() -> Self {
        Self { inside_k: 1, group_size: None, shuffle: false }
    }
}

impl Default for PostRoutingConfig {
    fn default() -> Self {
        Self {
            fallback: FallbackKind::Local,
            unrouted_policy: UnroutedPolicy::All,
            routed_threshold: None,
        }
    }
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            hidden_size: default_hidden_size(),
            expert_hidden_size: default_expert_hidden_size(),
            num_layers: default_num_layers(),
            moe_freq: default_moe_freq(),
            share_layers: None,
            pipe_parallel_size: 1,
            moe_loss_weight: default_moe_loss_weight(),
        }
    }
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self { ep_size: 1 }
    }
}

impl MoeConfig {
    /// Load configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| MoeError::Config(format!("Failed to parse config: {}", e)))?;

        info!(config_file = %path.display(), "Loaded MoE configuration from file");
        Ok(config)
    }

    /// Load configuration with environment variable overrides.
    ///
    /// Environment variables are prefixed with `MOE_` and use uppercase.
    /// Nested keys use double underscore: `MOE_GATE__TOP_K`.
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from environment only (no file).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Number of experts resident on each device of the expert-parallel group.
    pub fn num_local_experts(&self) -> usize {
        self.gate.num_experts / self.distributed.ep_size.max(1)
    }

    fn apply_env_overrides(&mut self) {
        for (key, value) in env::vars() {
            let Some(config_key) = key.strip_prefix("MOE_") else {
                continue;
            };
            let config_key = config_key.to_lowercase();
            let parts: Vec<&str> = config_key.split("__").collect();

            match parts.as_slice() {
                ["gate", field] => self.apply_gate_override(field, &value),
                ["hierarchical", field] => self.apply_hierarchical_override(field, &value),
                ["post_routing", field] => self.apply_post_routing_override(field, &value),
                ["model", field] => self.apply_model_override(field, &value),
                ["distributed", field] => self.apply_distributed_override(field, &value),
                ["dense_init"] => self.dense_init = parse_bool(&value),
                [field] => {
                    self.apply_gate_override(field, &value);
                    self.apply_model_override(field, &value);
                    self.apply_distributed_override(field, &value);
                }
                _ => {
                    debug!(key = %key, "Unknown config key pattern");
                }
            }
        }
    }

    fn apply_gate_override(&mut self, field: &str, value: &str) {
        let gate = &mut self.gate;
        match field {
            "num_experts" => if let Ok(v) = value.parse() { gate.num_experts = v; }
            "top_k" | "k" => if let Ok(v) = value.parse() { gate.top_k = v; }
            "capacity_factor" => if let Ok(v) = value.parse() { gate.capacity_factor = v; }
            "eval_capacity_factor" => if let Ok(v) = value.parse() { gate.eval_capacity_factor = v; }
            "min_capacity" => if let Ok(v) = value.parse() { gate.min_capacity = v; }
            "drop_tokens" => gate.drop_tokens = parse_bool(value),
            "use_residual" => gate.use_residual = parse_bool(value),
            "straight_through_gate" | "gate_st" => gate.straight_through_gate = parse_bool(value),
            "noisy_gate_policy" => {
                if let Some(policy) = NoisyGatePolicy::parse(value) {
                    gate.noisy_gate_policy = policy;
                }
            }
            "load_balance_weight" => if let Ok(v) = value.parse() { gate.aux_loss_weights.load_balance = v; }
            "zloss_weight" => if let Ok(v) = value.parse() { gate.aux_loss_weights.zloss = v; }
            "entropy_weight" => if let Ok(v) = value.parse() { gate.aux_loss_weights.entropy = v; }
            _ => {}
        }
    }

    fn apply_hierarchical_override(&mut self, field: &str, value: &str) {
        let hier = self.hierarchical.get_or_insert_with(HierarchicalConfig::default);
        match field {
            "inside_k" => if let Ok(v) = value.parse() { hier.inside_k = v; }
            "group_size" => if let Ok(v) = value.parse() { hier.group_size = Some(v); }
            "shuffle" => hier.shuffle = parse_bool(value),
            _ => {}
        }
    }

    fn apply_post_routing_override(&mut self, field: &str, value: &str) {
        let post = self.post_routing.get_or_insert_with(PostRoutingConfig::default);
        match field {
            "fallback" => match value.to_lowercase().as_str() {
                "local" => post.fallback = FallbackKind::Local,
                "balanced" => post.fallback = FallbackKind::Balanced,
                _ => {}
            },
            "unrouted_policy" | "unrouted_type" => match value.to_lowercase().as_str() {
                "all" => post.unrouted_policy = UnroutedPolicy::All,
                "any" => post.unrouted_policy = UnroutedPolicy::Any,
                _ => {}
            },
            "routed_threshold" => if let Ok(v) = value.parse() { post.routed_threshold = Some(v); }
            _ => {}
        }
    }

    fn apply_model_override(&mut self, field: &str, value: &str) {
        let model = &mut self.model;
        match field {
            "hidden_size" => if let Ok(v) = value.parse() { model.hidden_size = v; }
            "expert_hidden_size" => if let Ok(v) = value.parse() { model.expert_hidden_size = v; }
            "num_layers" => if let Ok(v) = value.parse() { model.num_layers = v; }
            "moe_freq" => if let Ok(v) = value.parse() { model.moe_freq = v; }
            "pipe_parallel_size" => if let Ok(v) = value.parse() { model.pipe_parallel_size = v; }
            "moe_loss_weight" => if let Ok(v) = value.parse() { model.moe_loss_weight = v; }
            "share_group_size" => {
                if let Ok(v) = value.parse() {
                    model.share_layers = Some(ShareLayersConfig { group_size: v });
                }
            }
            _ => {}
        }
    }

    fn apply_distributed_override(&mut self, field: &str, value: &str) {
        if field == "ep_size" {
            if let Ok(v) = value.parse() { self.distributed.ep_size = v; }
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        let gate = &self.gate;
        let ep_size = self.distributed.ep_size;

        if gate.num_experts == 0 {
            return Err(MoeError::Config("num_experts must be positive".to_string()));
        }
        if gate.top_k == 0 || gate.top_k > gate.num_experts {
            return Err(MoeError::Config(format!(
                "top_k ({}) must be in 1..={} (num_experts)",
                gate.top_k, gate.num_experts
            )));
        }
        if gate.capacity_factor <= 0.0 || gate.eval_capacity_factor <= 0.0 {
            return Err(MoeError::Config(format!(
                "capacity factors must be positive (train {}, eval {})",
                gate.capacity_factor, gate.eval_capacity_factor
            )));
        }
        if ep_size == 0 || gate.num_experts % ep_size != 0 {
            return Err(MoeError::Config(format!(
                "num_experts ({}) must be divisible by ep_size ({})",
                gate.num_experts, ep_size
            )));
        }

        if let Some(hier) = &self.hierarchical {
            let num_local = self.num_local_experts();
            if hier.inside_k == 0 || hier.inside_k > num_local {
                return Err(MoeError::Config(format!(
                    "inside_k ({}) must be in 1..={} (local experts)",
                    hier.inside_k, num_local
                )));
            }
            if let Some(group_size) = hier.group_size {
                if group_size != ep_size {
                    return Err(MoeError::Config(format!(
                        "hierarchical group_size ({}) must match ep_size ({})",
                        group_size, ep_size
                    )));
                }
            }
        }

        if let Some(post) = &self.post_routing {
            if !self.dense_init {
                return Err(MoeError::Config(
                    "post_routing requires dense_init experts".to_string(),
                ));
            }
            let threshold = post.threshold_for(gate.top_k);
            if threshold == 0 || threshold > gate.top_k {
                return Err(MoeError::Config(format!(
                    "routed_threshold ({}) must be in 1..={} (top_k)",
                    threshold, gate.top_k
                )));
            }
        }

        let model = &self.model;
        if let Some(share) = &model.share_layers {
            if model.pipe_parallel_size > 1 {
                return Err(MoeError::Config(
                    "sharing MoE layers is not supported together with pipeline parallelism".to_string(),
                ));
            }
            if share.group_size == 0 || model.num_layers % share.group_size != 0 {
                return Err(MoeError::Config(format!(
                    "num_layers ({}) must be divisible by share_layers.group_size ({})",
                    model.num_layers, share.group_size
                )));
            }
        }

        Ok(())
    }

    /// Save configuration to a JSON file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| MoeError::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, json)?;
        Ok(())
    }
}

fn parse_bool(value: &str) -> bool {
    value.to_lowercase() == "true" || value == "1"
}
