use hier_moe::benchmarks::routing_benchmark;
use hier_moe::distributed::ProcessGroup;
use hier_moe::model::layer::MoeLayer;
use hier_moe::model::layout::MoeStack;
use hier_moe::model::strategy::ForwardContext;
use hier_moe::training::loss::MoeCrossEntropy;
use hier_moe::utils::config::{GateConfig, HierarchicalConfig, LayoutConfig, MoeConfig, PostRoutingConfig, UnroutedPolicy};
use hier_moe::utils::{logging, metrics};
use hier_moe::{MoeError, Result};

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use std::thread;
use tracing::info;

fn demo_config() -> Result<MoeConfig> {
    // Optional JSON config path as the first argument.
    let mut config = match std::env::args().nth(1) {
        Some(path) => MoeConfig::from_file_with_env(path)?,
        None => MoeConfig {
            gate: GateConfig::new(8, 2, 1.25),
            model: LayoutConfig {
                hidden_size: 64,
                expert_hidden_size: 128,
                num_layers: 4,
                moe_freq: 2,
                ..Default::default()
            },
            ..MoeConfig::from_env()
        },
    };
    config.distributed.ep_size = 1;
    config.validate()?;
    Ok(config)
}

fn run_layer(name: &str, config: &MoeConfig, vb: VarBuilder, input: &Tensor) -> Result<()> {
    let layer = MoeLayer::build(config, ProcessGroup::single(), None, vb)?;
    let out = layer.forward(input, &ForwardContext::train())?;

    println!("{} strategy: {}", name, layer.name());
    println!("  output shape: {:?}", out.output.shape());
    println!("  aux loss: {:.4}", out.aux_loss.to_scalar::<f32>()?);
    for (key, value) in out.metadata.iter() {
        println!("  {} = {:.3}", key, value);
    }
    Ok(())
}

/// Two in-process ranks running hierarchical routing in lockstep.
fn run_two_rank_hierarchical(config: &MoeConfig) -> Result<()> {
    let mut config = config.clone();
    config.distributed.ep_size = 2;
    config.hierarchical = Some(HierarchicalConfig::default());
    config.validate()?;

    let handles: Vec<_> = ProcessGroup::local_group(2)
        .into_iter()
        .map(|group| {
            let config = config.clone();
            thread::spawn(move || -> Result<(usize, Vec<usize>, f64, f64)> {
                let rank = group.rank();
                let varmap = VarMap::new();
                let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
                let layer = MoeLayer::build(&config, group.clone(), None, vb.pp("hier"))?;
                let x = Tensor::randn(0f32, 1f32, (16, config.model.hidden_size), &Device::Cpu)?;
                let out = layer.forward(&x, &ForwardContext::train())?;
                let dropped = out.metadata.get("dropped_tokens").unwrap_or(0.0);
                let mean = out.metadata.reduce_mean(&group)?;
                let global_aux = mean.get("global_aux_loss").unwrap_or(0.0);
                Ok((rank, out.output.dims().to_vec(), dropped, global_aux))
            })
        })
        .collect();

    for handle in handles {
        let (rank, dims, dropped, global_aux) = handle
            .join()
            .map_err(|_| MoeError::Distributed("rank thread panicked".to_string()))??;
        println!(
            "  rank {}: output {:?}, dropped {}, group-mean global aux {:.4}",
            rank, dims, dropped, global_aux
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    logging::init_logging_from_env();
    info!("Starting hier-moe routing demo");

    let device = Device::Cpu;
    let config = demo_config()?;
    let d_model = config.model.hidden_size;
    let batch_size = 2;
    let seq_len = 16;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let input = Tensor::randn(0f32, 1f32, (batch_size, seq_len, d_model), &device)?;

    println!("--- Flat capacity routing ---");
    run_layer("flat", &config, vb.pp("flat"), &input)?;

    println!("\n--- Hierarchical routing on one device ---");
    let mut local = config.clone();
    local.hierarchical = Some(HierarchicalConfig { inside_k: config.gate.top_k, ..Default::default() });
    run_layer("hierarchical", &local, vb.pp("local"), &input)?;

    println!("\n--- Dense-initialised routing with overflow fallback ---");
    let mut post = config.clone();
    post.dense_init = true;
    post.gate.capacity_factor = 0.5;
    post.post_routing = Some(PostRoutingConfig {
        unrouted_policy: UnroutedPolicy::Any,
        ..Default::default()
    });
    run_layer("post-routing", &post, vb.pp("post"), &input)?;

    println!("\n--- Balanced hierarchical routing ---");
    let mut balanced = local.clone();
    balanced.dense_init = true;
    run_layer("balanced", &balanced, vb.pp("balanced"), &input)?;

    println!("\n--- Two ranks, hierarchical ---");
    run_two_rank_hierarchical(&config)?;

    println!("\n--- MoE stack and loss ---");
    let stack = MoeStack::new(&config, ProcessGroup::single(), vb.pp("stack"))?;
    let out = stack.forward(&input, &ForwardContext::train())?;
    let vocab_size = 32;
    let head = candle_nn::linear_no_bias(d_model, vocab_size, vb.pp("lm_head"))?;
    let logits = candle_core::Module::forward(&head, &out.output)?;
    let targets = Tensor::zeros((batch_size, seq_len), DType::U32, &device)?;
    let loss = MoeCrossEntropy::new(config.model.moe_loss_weight).compute(&logits, &targets, &out.aux_losses)?;
    println!("  MoE layers: {}", out.aux_losses.len());
    println!(
        "  dropped selections over all layers: {}",
        out.totals.get("dropped_tokens").unwrap_or(0.0)
    );
    println!("  lm loss {:.4}, aux loss {:.4}", loss.lm_loss, loss.aux_loss);
    println!("  expert-group parameters: {}", stack.sync_registry().expert_params().len());

    routing_benchmark::run_benchmark()?;

    println!("\n--- Routing metrics ---");
    println!("{}", metrics::get_metrics().gather());
    Ok(())
}
