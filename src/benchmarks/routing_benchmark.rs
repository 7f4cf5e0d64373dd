use crate::distributed::ProcessGroup;
use crate::model::layer::MoeLayer;
use crate::model::strategy::ForwardContext;
use crate::utils::config::{GateConfig, HierarchicalConfig, LayoutConfig, MoeConfig, PostRoutingConfig, UnroutedPolicy};
use crate::utils::error::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use std::time::Duration;

#[derive(Clone, Copy)]
pub struct BenchConfig {
    pub batch_size: usize,
    pub seq_len: usize,
    pub hidden_size: usize,
    pub expert_hidden_size: usize,
    pub num_experts: usize,
    pub top_k: usize,
    pub capacity_factor: f64,
    pub warmup_iters: usize,
    pub measure_iters: usize,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            seq_len: 64,
            hidden_size: 256,
            expert_hidden_size: 512,
            num_experts: 8,
            top_k: 2,
            capacity_factor: 1.25,
            warmup_iters: 3,
            measure_iters: 10,
        }
    }
}

/// Average forward time of one strategy.
pub struct BenchResult {
    pub strategy: &'static str,
    pub per_pass: Duration,
}

fn layer_config(cfg: &BenchConfig) -> MoeConfig {
    MoeConfig {
        gate: GateConfig::new(cfg.num_experts, cfg.top_k, cfg.capacity_factor),
        model: LayoutConfig {
            hidden_size: cfg.hidden_size,
            expert_hidden_size: cfg.expert_hidden_size,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn variants(cfg: &BenchConfig) -> Vec<MoeConfig> {
    let flat = layer_config(cfg);

    let mut local = layer_config(cfg);
    local.hierarchical = Some(HierarchicalConfig { inside_k: cfg.top_k, ..Default::default() });

    let mut post = layer_config(cfg);
    post.dense_init = true;
    post.post_routing = Some(PostRoutingConfig {
        unrouted_policy: UnroutedPolicy::Any,
        ..Default::default()
    });

    let mut balanced = layer_config(cfg);
    balanced.dense_init = true;
    balanced.hierarchical = Some(HierarchicalConfig { inside_k: cfg.top_k, ..Default::default() });

    vec![flat, local, post, balanced]
}

fn time_layer(layer: &MoeLayer, input: &Tensor, cfg: &BenchConfig) -> Result<Duration> {
    let ctx = ForwardContext::train();
    for _ in 0..cfg.warmup_iters {
        layer.forward(input, &ctx)?;
    }
    let start = std::time::Instant::now();
    for _ in 0..cfg.measure_iters {
        layer.forward(input, &ctx)?;
    }
    Ok(start.elapsed() / cfg.measure_iters.max(1) as u32)
}

/// Time every single-device strategy on the same input.
pub fn run_benchmark_with(cfg: &BenchConfig, device: &Device) -> Result<Vec<BenchResult>> {
    let input = Tensor::randn(0f32, 1f32, (cfg.batch_size, cfg.seq_len, cfg.hidden_size), device)?;

    let mut results = Vec::new();
    for config in variants(cfg) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let layer = MoeLayer::build(&config, ProcessGroup::single(), None, vb.pp("bench"))?;
        let per_pass = time_layer(&layer, &input, cfg)?;
        results.push(BenchResult { strategy: layer.name(), per_pass });
    }
    Ok(results)
}

pub fn run_benchmark() -> Result<()> {
    println!("\n=== MoE Routing Benchmark ===");
    let device = if candle_core::utils::metal_is_available() {
        println!("Using Metal GPU");
        Device::new_metal(0)?
    } else {
        println!("Using CPU");
        Device::Cpu
    };
    let cfg = BenchConfig::default();
    println!(
        "Config: batch={}, seq_len={}, d_model={}, experts={}, k={}, warmup={}, measure={} iterations",
        cfg.batch_size, cfg.seq_len, cfg.hidden_size, cfg.num_experts, cfg.top_k, cfg.warmup_iters, cfg.measure_iters
    );

    for result in run_benchmark_with(&cfg, &device)? {
        println!("{:<24} {:.2?} per forward pass", result.strategy, result.per_pass);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benchmark_runs_every_strategy() -> Result<()> {
        let cfg = BenchConfig {
            batch_size: 1,
            seq_len: 8,
            hidden_size: 8,
            expert_hidden_size: 16,
            num_experts: 4,
            top_k: 2,
            capacity_factor: 1.0,
            warmup_iters: 0,
            measure_iters: 1,
        };
        let results = run_benchmark_with(&cfg, &Device::Cpu)?;
        let names: Vec<&str> = results.iter().map(|r| r.strategy).collect();
        assert_eq!(names, vec!["flat", "local", "post_routing", "balanced_hierarchical"]);
        Ok(())
    }
}
