use candle_core::{DType, Device, Tensor, D};
use candle_nn::{ops, Linear, Module, VarBuilder, VarMap};
use moe_dispatch::dispatch::FastDispatcher;
use moe_dispatch::distributed::{all_to_all_with, contract, expand, ExchangeRuntime, ProcessGroup};
use moe_dispatch::utils::config::MoeConfig;
use moe_dispatch::utils::{logging, metrics};
use moe_dispatch::{MoeError, Result};
use std::sync::Arc;
use std::thread;
use tracing::info;

/// Routing assignment for one batch: per choice, expert ids, slot positions and gates.
struct Routing {
    indices: Vec<Tensor>,
    locations: Vec<Tensor>,
    gates: Vec<Tensor>,
    first_choice_share: Tensor,
}

/// Top-k softmax gate. Slots are handed out choice-major, so every token's
/// first choice is placed before any second choice.
fn route(probs: &Tensor, top_k: usize, num_experts: usize) -> Result<Routing> {
    let (num_tokens, _) = probs.dims2()?;
    let topk_idx = probs.arg_sort_last_dim(false)?.narrow(1, 0, top_k)?.contiguous()?;
    let topk_vals = probs.gather(&topk_idx, 1)?;
    let idx_host = topk_idx.to_vec2::<u32>()?;

    let mut fill = vec![0u32; num_experts];
    let mut routing = Routing {
        indices: Vec::with_capacity(top_k),
        locations: Vec::with_capacity(top_k),
        gates: Vec::with_capacity(top_k),
        first_choice_share: Tensor::zeros(num_experts, DType::F32, probs.device())?,
    };
    for k in 0..top_k {
        let experts: Vec<u32> = idx_host.iter().map(|row| row[k]).collect();
        let slots: Vec<u32> = experts
            .iter()
            .map(|&e| {
                let slot = fill[e as usize];
                fill[e as usize] += 1;
                slot
            })
            .collect();

        if k == 0 {
            let share: Vec<f32> = (0..num_experts)
                .map(|e| experts.iter().filter(|&&x| x as usize == e).count() as f32 / num_tokens as f32)
                .collect();
            routing.first_choice_share = Tensor::from_vec(share, num_experts, probs.device())?;
        }
        routing.indices.push(Tensor::from_vec(experts, num_tokens, probs.device())?);
        routing.locations.push(Tensor::from_vec(slots, num_tokens, probs.device())?);
        routing.gates.push(topk_vals.narrow(1, k, 1)?.squeeze(1)?);
    }
    Ok(routing)
}

fn run_worker(group: ProcessGroup, config: MoeConfig) -> Result<f32> {
    let device = Device::Cpu;
    let rank = group.rank();
    let world_size = group.size;
    let settings = &config.dispatch;
    let num_experts = settings.num_global_experts;
    let local_experts = num_experts / world_size;
    let model_dim = settings.model_dim;
    let capacity = settings.capacity;

    let runtime = Arc::new(ExchangeRuntime::from_config(&config.communication));
    let mut dispatcher = FastDispatcher::new(settings.to_dispatch_config()?, &device)?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let gate = candle_nn::linear_no_bias(model_dim, num_experts, vb.pp("gate"))?;
    let experts = (0..local_experts)
        .map(|i| candle_nn::linear(model_dim, model_dim, vb.pp(format!("expert.{}", i))))
        .collect::<candle_core::Result<Vec<Linear>>>()?;

    let x = Tensor::randn(0f32, 1f32, (settings.num_tokens, model_dim), &device)?;
    let probs = ops::softmax(&gate.forward(&x)?, D::Minus1)?;
    let routing = route(&probs, settings.top_k, num_experts)?;
    dispatcher.update(&routing.indices, &routing.locations, &routing.gates, Some(capacity))?;

    // [E * C, D] -> this rank's experts, one bank per source rank
    let dispatched = dispatcher.encode_all(&x)?;
    let received = all_to_all_with(&group, &runtime, &dispatched)?
        .to_dtype(DType::F32)?
        .reshape((world_size, local_experts, capacity, model_dim))?;
    let outputs = experts
        .iter()
        .enumerate()
        .map(|(i, expert)| {
            let bank = received.narrow(1, i, 1)?.reshape((world_size * capacity, model_dim))?;
            expert.forward(&bank)?.gelu()?.reshape((world_size, 1, capacity, model_dim))
        })
        .collect::<candle_core::Result<Vec<_>>>()?;
    let expert_output = Tensor::cat(&outputs, 1)?.reshape((num_experts * capacity, model_dim))?;
    let returned = all_to_all_with(&group, &runtime, &expert_output)?;
    let y = dispatcher.decode(&returned)?.to_dtype(DType::F32)?;

    // Balance term: global mean gate probability per expert against this
    // rank's first-choice share, each rank keeping its own experts' part.
    let mean_probs = expand(&group, &probs.mean(0)?.unsqueeze(0)?)?.mean(0)?;
    let per_expert = ((mean_probs * &routing.first_choice_share)? * num_experts as f64)?;
    let l_aux = contract(&group, &per_expert)?.sum_all()?;

    let loss = (y.sqr()?.mean_all()? + &l_aux)?;
    let grads = loss.backward()?;
    let gate_grad = grads
        .get(gate.weight())
        .ok_or_else(|| MoeError::Routing("gate received no gradient".to_string()))?;

    let loss_value = loss.to_scalar::<f32>()?;
    if rank == 0 {
        info!(
            world_size,
            backend = ?runtime.resolved_backend(),
            kernel_builds = dispatcher.kernel_builds(),
            "Step complete"
        );
        println!("Dispatch buffer: {:?}", dispatched.shape());
        println!("Combined output: {:?}", y.shape());
        println!("Loss: {:.6} (aux {:.6})", loss_value, l_aux.to_scalar::<f32>()?);
        println!("Gate gradient norm: {:.6}", gate_grad.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?);
    }
    Ok(loss_value)
}

fn main() -> Result<()> {
    logging::init_logging_from_env();

    let config = match std::env::args().nth(1) {
        Some(path) => MoeConfig::from_file_with_env(path)?,
        None => MoeConfig::from_env(),
    };
    config.validate()?;
    info!(
        world_size = config.communication.world_size,
        backend = ?config.communication.a2a_backend,
        num_experts = config.dispatch.num_global_experts,
        "Starting MoE dispatch demo"
    );

    let handles: Vec<_> = ProcessGroup::local(config.communication.world_size)
        .into_iter()
        .map(|group| {
            let config = config.clone();
            thread::spawn(move || run_worker(group, config))
        })
        .collect();

    let mut losses = Vec::with_capacity(handles.len());
    for handle in handles {
        let loss = handle
            .join()
            .map_err(|_| MoeError::Communication("worker thread panicked".to_string()))??;
        losses.push(loss);
    }
    println!("Per-rank losses: {:?}", losses);

    if config.communication.a2a_timing {
        if let Some(registry) = metrics::get_metrics() {
            println!("{}", registry.gather());
        }
    }
    Ok(())
}
