use anyhow::Result;
use candle_core::{DType, Device, Tensor, Var};
use moe_dispatch::distributed::{
    all_to_all_with, contract, expand, A2aBackend, CollectiveCommunicator, ExchangeRuntime,
    LocalCommunicator, ProcessGroup,
};
use moe_dispatch::utils::metrics;
use moe_dispatch::MoeError;
use std::sync::Arc;
use std::thread;

/// Run `f` on one thread per group handle, each rank with its own runtime.
fn spawn_ranks<T, F>(groups: Vec<ProcessGroup>, backend: A2aBackend, timing: bool, f: F) -> Result<Vec<T>>
where
    T: Send + 'static,
    F: Fn(ProcessGroup, Arc<ExchangeRuntime>) -> Result<T> + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let handles: Vec<_> = groups
        .into_iter()
        .map(|group| {
            let f = f.clone();
            thread::spawn(move || f(group, Arc::new(ExchangeRuntime::new(backend, timing))))
        })
        .collect();

    handles
        .into_iter()
        .map(|h| h.join().map_err(|_| anyhow::anyhow!("rank panicked"))?)
        .collect()
}

fn run_local<T, F>(world_size: usize, backend: A2aBackend, f: F) -> Result<Vec<T>>
where
    T: Send + 'static,
    F: Fn(ProcessGroup, Arc<ExchangeRuntime>) -> Result<T> + Send + Sync + 'static,
{
    spawn_ranks(ProcessGroup::local(world_size), backend, false, f)
}

/// Rank-specific `[rows, 2]` data: `rank * 100 + row * 2 + col`.
fn rank_rows(rank: usize, rows: usize) -> Result<Tensor> {
    let data: Vec<f32> = (0..rows * 2).map(|i| (rank * 100 + i) as f32).collect();
    Ok(Tensor::from_vec(data, (rows, 2), &Device::Cpu)?)
}

/// Local communicator that reports ranks as living in separate address spaces.
struct Isolated(LocalCommunicator);

impl CollectiveCommunicator for Isolated {
    fn rank(&self) -> usize {
        self.0.rank()
    }
    fn world_size(&self) -> usize {
        self.0.world_size()
    }
    fn all_reduce(&self, tensor: &Tensor) -> candle_core::Result<Tensor> {
        self.0.all_reduce(tensor)
    }
    fn all_gather(&self, tensor: &Tensor) -> candle_core::Result<Tensor> {
        self.0.all_gather(tensor)
    }
    fn broadcast(&self, tensor: &Tensor, root_rank: usize) -> candle_core::Result<Tensor> {
        self.0.broadcast(tensor, root_rank)
    }
    fn all_to_all(&self, tensor: &Tensor) -> candle_core::Result<Tensor> {
        self.0.all_to_all(tensor)
    }
}

#[test]
fn test_all_to_all_routes_chunks() -> Result<()> {
    let results = run_local(3, A2aBackend::Standard, |group, runtime| {
        let x = rank_rows(group.rank(), 3)?;
        Ok(all_to_all_with(&group, &runtime, &x)?.to_vec2::<f32>()?)
    })?;

    // rank r receives row r of every rank, in rank order
    assert_eq!(results[0], vec![vec![0.0, 1.0], vec![100.0, 101.0], vec![200.0, 201.0]]);
    assert_eq!(results[2], vec![vec![4.0, 5.0], vec![104.0, 105.0], vec![204.0, 205.0]]);
    Ok(())
}

#[test]
fn test_all_to_all_involution() -> Result<()> {
    let results = run_local(2, A2aBackend::Standard, |group, runtime| {
        let x = rank_rows(group.rank(), 4)?;
        let back = all_to_all_with(&group, &runtime, &all_to_all_with(&group, &runtime, &x)?)?;
        Ok((x.to_vec2::<f32>()?, back.to_vec2::<f32>()?))
    })?;

    for (x, back) in results {
        assert_eq!(x, back);
    }
    Ok(())
}

#[test]
fn test_all_to_all_backward_is_all_to_all() -> Result<()> {
    let results = run_local(2, A2aBackend::Standard, |group, runtime| {
        let rank = group.rank();
        let x = Var::from_tensor(&rank_rows(rank, 2)?)?;
        let w = ((rank_rows(rank, 2)? * 0.5)? - 3.0)?;

        let y = all_to_all_with(&group, &runtime, x.as_tensor())?;
        let forward_inner = y.mul(&w)?.sum_all()?.to_scalar::<f32>()?;
        let grads = y.mul(&w)?.sum_all()?.backward()?;
        let dx = grads.get(x.as_tensor()).expect("gradient for x").clone();

        let w_exchanged = all_to_all_with(&group, &runtime, &w)?;
        let adjoint_inner = x.as_tensor().mul(&w_exchanged)?.sum_all()?.to_scalar::<f32>()?;
        Ok((dx.to_vec2::<f32>()?, w_exchanged.to_vec2::<f32>()?, forward_inner, adjoint_inner))
    })?;

    let mut forward_total = 0.0;
    let mut adjoint_total = 0.0;
    for (dx, w_exchanged, forward_inner, adjoint_inner) in results {
        assert_eq!(dx, w_exchanged);
        forward_total += forward_inner;
        adjoint_total += adjoint_inner;
    }
    // <A x, w> == <x, A w> summed over the group
    assert!((forward_total - adjoint_total).abs() < 1e-3);
    Ok(())
}

#[test]
fn test_expand_contract_duality() -> Result<()> {
    let results = run_local(2, A2aBackend::Standard, |group, _runtime| {
        let x = Var::new(&[[1.0f32, 2.0], [3.0, 4.0]], &Device::Cpu)?;
        let expanded = expand(&group, x.as_tensor())?;
        let z = contract(&group, &expanded)?;

        let w = Tensor::new(&[[1.0f32, -1.0], [0.5, 2.0]], &Device::Cpu)?;
        let grads = z.mul(&w)?.sum_all()?.backward()?;
        let dx = grads.get(x.as_tensor()).expect("gradient for x").to_vec2::<f32>()?;
        Ok((expanded.dims().to_vec(), z.to_vec2::<f32>()?, dx))
    })?;

    for (expanded_dims, z, dx) in results {
        assert_eq!(expanded_dims, vec![4, 2]);
        assert_eq!(z, vec![vec![2.0, 4.0], vec![6.0, 8.0]]);
        assert_eq!(dx, vec![vec![2.0, -2.0], vec![1.0, 4.0]]);
    }
    Ok(())
}

#[test]
fn test_expand_contract_shapes() -> Result<()> {
    let results = run_local(2, A2aBackend::Standard, |group, _runtime| {
        let rank = group.rank() as f32;
        let scalar = expand(&group, &Tensor::new(rank, &Device::Cpu)?)?;
        let rows = contract(&group, &Tensor::ones((4, 3), DType::F32, &Device::Cpu)?)?;
        let uneven = contract(&group, &Tensor::ones((3, 3), DType::F32, &Device::Cpu)?);
        Ok((
            scalar.to_vec1::<f32>()?,
            rows.dims().to_vec(),
            matches!(uneven, Err(MoeError::Distributed(_))),
        ))
    })?;

    for (scalar, rows, uneven_rejected) in results {
        assert_eq!(scalar, vec![0.0, 1.0]);
        assert_eq!(rows, vec![2, 3]);
        assert!(uneven_rejected);
    }
    Ok(())
}

#[test]
fn test_group_of_one_is_identity() -> Result<()> {
    let group = ProcessGroup::single();
    let runtime = Arc::new(ExchangeRuntime::new(A2aBackend::External, true));
    let x = rank_rows(7, 3)?.to_dtype(DType::F16)?;

    for y in [
        all_to_all_with(&group, &runtime, &x)?,
        expand(&group, &x)?,
        contract(&group, &x)?,
    ] {
        assert_eq!(y.dtype(), DType::F16);
        assert_eq!(y.dims(), x.dims());
        assert_eq!(
            y.flatten_all()?.to_vec1::<half::f16>()?,
            x.flatten_all()?.to_vec1::<half::f16>()?
        );
    }
    assert!(!runtime.is_prepared());
    Ok(())
}

#[test]
fn test_external_backend_negotiation() -> Result<()> {
    let results = run_local(3, A2aBackend::External, |group, runtime| {
        assert_eq!(runtime.resolved_backend(), None);
        let x = rank_rows(group.rank(), 3)?;
        let y = all_to_all_with(&group, &runtime, &x)?;
        let again = all_to_all_with(&group, &runtime, &y)?;
        Ok((runtime.resolved_backend(), y.to_vec2::<f32>()?, again.to_vec2::<f32>()?, x.to_vec2::<f32>()?))
    })?;

    for (rank, (backend, y, again, x)) in results.into_iter().enumerate() {
        assert_eq!(backend, Some(A2aBackend::External));
        let r = rank as f32 * 2.0;
        assert_eq!(y, vec![vec![r, r + 1.0], vec![100.0 + r, 101.0 + r], vec![200.0 + r, 201.0 + r]]);
        assert_eq!(again, x);
    }
    Ok(())
}

#[test]
fn test_ranks_sharing_one_runtime() -> Result<()> {
    for backend in [A2aBackend::External, A2aBackend::Standard] {
        let runtime = Arc::new(ExchangeRuntime::new(backend, false));
        let handles: Vec<_> = ProcessGroup::local(2)
            .into_iter()
            .map(|group| {
                let runtime = runtime.clone();
                thread::spawn(move || -> Result<Vec<Vec<f32>>> {
                    let x = rank_rows(group.rank(), 2)?;
                    Ok(all_to_all_with(&group, &runtime, &x)?.to_vec2::<f32>()?)
                })
            })
            .collect();
        let results = handles
            .into_iter()
            .map(|h| h.join().map_err(|_| anyhow::anyhow!("rank panicked"))?)
            .collect::<Result<Vec<_>>>()?;

        assert_eq!(runtime.resolved_backend(), Some(backend));
        assert_eq!(results[0], vec![vec![0.0, 1.0], vec![100.0, 101.0]]);
        assert_eq!(results[1], vec![vec![2.0, 3.0], vec![102.0, 103.0]]);
    }
    Ok(())
}

#[test]
fn test_external_falls_back_to_standard() -> Result<()> {
    let groups = LocalCommunicator::new_group(2)
        .into_iter()
        .map(|comm| ProcessGroup::new(Arc::new(Isolated(comm)), vec![0, 1]))
        .collect::<moe_dispatch::Result<Vec<_>>>()?;

    let results = spawn_ranks(groups, A2aBackend::External, false, |group, runtime| {
        let x = rank_rows(group.rank(), 2)?;
        let y = all_to_all_with(&group, &runtime, &x)?;
        Ok((runtime.resolved_backend(), y.to_vec2::<f32>()?))
    })?;

    assert_eq!(results[0].0, Some(A2aBackend::Standard));
    assert_eq!(results[0].1, vec![vec![0.0, 1.0], vec![100.0, 101.0]]);
    assert_eq!(results[1].1, vec![vec![2.0, 3.0], vec![102.0, 103.0]]);
    Ok(())
}

#[test]
fn test_pass_through_backend() -> Result<()> {
    let results = run_local(2, A2aBackend::PassThrough, |group, runtime| {
        let x = rank_rows(group.rank(), 2)?;
        let y = all_to_all_with(&group, &runtime, &x)?;
        Ok((runtime.resolved_backend(), x.to_vec2::<f32>()?, y.to_vec2::<f32>()?))
    })?;

    for (backend, x, y) in results {
        assert_eq!(backend, Some(A2aBackend::PassThrough));
        assert_eq!(x, y);
    }
    Ok(())
}

#[test]
fn test_timed_exchange_records_metrics() -> Result<()> {
    let before = metrics::get_metrics()
        .map(|m| m.all_to_all_seconds.get_sample_count())
        .unwrap_or(0);

    spawn_ranks(ProcessGroup::local(2), A2aBackend::Standard, true, |group, runtime| {
        let x = rank_rows(group.rank(), 4)?;
        all_to_all_with(&group, &runtime, &x)?;
        Ok(())
    })?;

    let after = metrics::get_metrics()
        .map(|m| m.all_to_all_seconds.get_sample_count())
        .unwrap_or(0);
    assert!(after > before);
    Ok(())
}

#[test]
fn test_uneven_split_is_rejected() -> Result<()> {
    let results = run_local(2, A2aBackend::Standard, |group, runtime| {
        let x = rank_rows(group.rank(), 3)?;
        Ok(matches!(all_to_all_with(&group, &runtime, &x), Err(MoeError::Distributed(_))))
    })?;
    assert!(results.into_iter().all(|rejected| rejected));
    Ok(())
}
