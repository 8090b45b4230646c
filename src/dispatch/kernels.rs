//! Shape-specialized scatter/gather kernels and the cache that owns them.
//!
//! A [`DispatchKernels`] bundle is bound to one `(sample_size, capacity)`
//! pair plus the dispatcher's fixed expert count, lane width and precision.
//! The three transforms mirror a sparse one-hot matmul without materializing
//! the one-hot matrix:
//!
//! ```text
//! forward_scatter:  dispatched[e*C + s] += gate[t] * input[t]
//! backward_data:    grad_input[t]       += gate[t] * dispatched[e*C + s]
//! backward_gate:    grad_gate[t]         = <dispatched[e*C + s], grad_output[t]>
//! ```
//!
//! where `(e, s) = (indices[t], locations[t])`. Tokens with `s >= C` are
//! skipped by all three.

use crate::utils::error::{MoeError, Result};
use crate::utils::metrics;
use candle_core::{DType, Device, Tensor, WithDType};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Cache discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShapeKey {
    pub sample_size: usize,
    pub capacity: usize,
}

/// Working precision of the dispatch kernels.
///
/// `lanes` is 2 for packed half precision, 1 otherwise, with
/// `model_dim_per_lane * lanes == model_dim`. It only affects the shape
/// bookkeeping; the kernels walk each feature row flat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Precision {
    pub dtype: DType,
    pub lanes: usize,
}

impl Precision {
    pub fn full() -> Self {
        Self { dtype: DType::F32, lanes: 1 }
    }

    pub fn packed_half() -> Self {
        Self { dtype: DType::F16, lanes: 2 }
    }

    pub fn is_packed(&self) -> bool {
        self.lanes > 1
    }
}

/// Placement of every token for one routing choice.
///
/// `locations[t] >= capacity` marks a dropped token.
#[derive(Debug, Clone)]
pub struct Route {
    pub indices: Arc<[u32]>,
    pub locations: Arc<[u32]>,
}

impl Route {
    pub fn new(indices: Vec<u32>, locations: Vec<u32>) -> Self {
        Self {
            indices: indices.into(),
            locations: locations.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Number of tokens that do not fit into their expert's bank.
    pub fn dropped(&self, capacity: usize) -> usize {
        self.locations
            .iter()
            .filter(|&&loc| loc as usize >= capacity)
            .count()
    }
}

/// Forward-scatter, backward-data and backward-gate transforms for one shape.
#[derive(Debug)]
pub struct DispatchKernels {
    key: ShapeKey,
    num_experts: usize,
    model_dim_per_lane: usize,
    precision: Precision,
    ones_helper: Tensor,
}

impl DispatchKernels {
    fn build(
        key: ShapeKey,
        num_experts: usize,
        model_dim_per_lane: usize,
        precision: Precision,
    ) -> Result<Self> {
        let ones_helper = Tensor::ones(key.sample_size, precision.dtype, &Device::Cpu)?;
        Ok(Self {
            key,
            num_experts,
            model_dim_per_lane,
            precision,
            ones_helper,
        })
    }

    pub fn key(&self) -> ShapeKey {
        self.key
    }

    pub fn sample_size(&self) -> usize {
        self.key.sample_size
    }

    pub fn capacity(&self) -> usize {
        self.key.capacity
    }

    pub fn num_experts(&self) -> usize {
        self.num_experts
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Rows of the dispatch buffer.
    pub fn num_slots(&self) -> usize {
        self.num_experts * self.key.capacity
    }

    /// Elements per token row.
    pub fn row_width(&self) -> usize {
        self.model_dim_per_lane * self.precision.lanes
    }

    /// Unit gates used when dispatching without weighting, shape `[sample_size]`.
    pub fn ones_helper(&self) -> &Tensor {
        &self.ones_helper
    }

    #[inline]
    fn slot(&self, expert: u32, location: u32) -> Option<usize> {
        let (expert, location) = (expert as usize, location as usize);
        (location < self.key.capacity && expert < self.num_experts)
            .then(|| expert * self.key.capacity + location)
    }

    fn check_launch(&self, route: &Route, gates: usize, tokens: usize, slots: usize) -> candle_core::Result<()> {
        let s = self.key.sample_size;
        let w = self.row_width();
        if route.len() != s || route.locations.len() != s || gates != s {
            candle_core::bail!(
                "kernel for {} tokens launched with route of {} / gates of {}",
                s,
                route.len(),
                gates
            );
        }
        if tokens != s * w || slots != self.num_slots() * w {
            candle_core::bail!(
                "kernel for [{}, {}] rows launched with token buffer {} and slot buffer {}",
                s,
                w,
                tokens,
                slots
            );
        }
        Ok(())
    }

    /// `dispatched[slot(t)] += gates[t] * input[t]` for every kept token.
    pub fn forward_scatter<T: WithDType>(
        &self,
        gates: &[T],
        route: &Route,
        input: &[T],
        dispatched: &mut [T],
    ) -> candle_core::Result<()> {
        self.check_launch(route, gates.len(), input.len(), dispatched.len())?;
        let w = self.row_width();

        for t in 0..self.key.sample_size {
            let Some(slot) = self.slot(route.indices[t], route.locations[t]) else {
                continue;
            };
            let gate = gates[t];
            let src = &input[t * w..(t + 1) * w];
            let dst = &mut dispatched[slot * w..(slot + 1) * w];
            for (d, &s) in dst.iter_mut().zip(src) {
                *d += gate * s;
            }
        }
        Ok(())
    }

    /// `grad_input[t] += gates[t] * dispatched[slot(t)]` for every kept token.
    ///
    /// Also the forward gather of the combine step.
    pub fn backward_data<T: WithDType>(
        &self,
        gates: &[T],
        dispatched: &[T],
        route: &Route,
        grad_input: &mut [T],
    ) -> candle_core::Result<()> {
        self.check_launch(route, gates.len(), grad_input.len(), dispatched.len())?;
        let w = self.row_width();

        for t in 0..self.key.sample_size {
            let Some(slot) = self.slot(route.indices[t], route.locations[t]) else {
                continue;
            };
            let gate = gates[t];
            let src = &dispatched[slot * w..(slot + 1) * w];
            let dst = &mut grad_input[t * w..(t + 1) * w];
            for (d, &s) in dst.iter_mut().zip(src) {
                *d += gate * s;
            }
        }
        Ok(())
    }

    /// `grad_gates[t] = <dispatched[slot(t)], grad_output[t]>`, zero for dropped tokens.
    pub fn backward_gate<T: WithDType>(
        &self,
        dispatched: &[T],
        route: &Route,
        grad_output: &[T],
        grad_gates: &mut [T],
    ) -> candle_core::Result<()> {
        self.check_launch(route, grad_gates.len(), grad_output.len(), dispatched.len())?;
        let w = self.row_width();

        for (t, grad_gate) in grad_gates.iter_mut().enumerate() {
            *grad_gate = match self.slot(route.indices[t], route.locations[t]) {
                Some(slot) => {
                    let row = &dispatched[slot * w..(slot + 1) * w];
                    let grad = &grad_output[t * w..(t + 1) * w];
                    let dot: f64 = row
                        .iter()
                        .zip(grad)
                        .map(|(&a, &b)| a.to_f64() * b.to_f64())
                        .sum();
                    T::from_f64(dot)
                }
                None => T::from_f64(0.0),
            };
        }
        Ok(())
    }
}

/// Properties every entry of one cache shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct KernelSignature {
    num_experts: usize,
    model_dim_per_lane: usize,
    precision: Precision,
}

/// Map from shape key to kernel bundle.
///
/// Entries live as long as the cache and are never evicted: a training run
/// sees only a handful of distinct `(sample_size, capacity)` pairs.
#[derive(Debug, Default)]
pub struct KernelCache {
    signature: Option<KernelSignature>,
    entries: HashMap<ShapeKey, Arc<DispatchKernels>>,
    builds: usize,
}

impl KernelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the bundle for `(sample_size, capacity)`, building it on first use.
    ///
    /// Every call must pass the same expert count, lane width and precision
    /// as the first one; a different value is a configuration error.
    pub fn get_or_build(
        &mut self,
        sample_size: usize,
        capacity: usize,
        num_experts: usize,
        model_dim_per_lane: usize,
        precision: Precision,
    ) -> Result<Arc<DispatchKernels>> {
        if sample_size == 0 || capacity == 0 || num_experts == 0 || model_dim_per_lane == 0 {
            return Err(MoeError::Config(format!(
                "kernel shape must be positive: sample_size={}, capacity={}, num_experts={}, model_dim_per_lane={}",
                sample_size, capacity, num_experts, model_dim_per_lane
            )));
        }

        let signature = KernelSignature {
            num_experts,
            model_dim_per_lane,
            precision,
        };
        match self.signature {
            Some(existing) if existing != signature => {
                return Err(MoeError::Config(format!(
                    "kernel cache built for {:?} cannot serve {:?}",
                    existing, signature
                )));
            }
            Some(_) => {}
            None => self.signature = Some(signature),
        }

        let key = ShapeKey { sample_size, capacity };
        if let Some(kernels) = self.entries.get(&key) {
            return Ok(kernels.clone());
        }

        debug!(
            sample_size,
            capacity,
            num_experts,
            model_dim_per_lane,
            dtype = ?precision.dtype,
            "Building dispatch kernels"
        );
        let kernels = Arc::new(DispatchKernels::build(key, num_experts, model_dim_per_lane, precision)?);
        self.entries.insert(key, kernels.clone());
        self.builds += 1;
        metrics::record_kernel_build();
        Ok(kernels)
    }

    /// Number of bundles built so far.
    pub fn builds(&self) -> usize {
        self.builds
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &ShapeKey) -> bool {
        self.entries.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernels(sample_size: usize, capacity: usize, num_experts: usize, dim: usize) -> Arc<DispatchKernels> {
        KernelCache::new()
            .get_or_build(sample_size, capacity, num_experts, dim, Precision::full())
            .unwrap()
    }

    #[test]
    fn test_cache_reuses_identical_key() {
        let mut cache = KernelCache::new();
        let a = cache.get_or_build(6, 2, 4, 8, Precision::full()).unwrap();
        let b = cache.get_or_build(6, 2, 4, 8, Precision::full()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.builds(), 1);

        cache.get_or_build(6, 3, 4, 8, Precision::full()).unwrap();
        assert_eq!(cache.builds(), 2);
        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&ShapeKey { sample_size: 6, capacity: 3 }));
    }

    #[test]
    fn test_cache_rejects_signature_change() {
        let mut cache = KernelCache::new();
        cache.get_or_build(6, 2, 4, 8, Precision::full()).unwrap();

        let err = cache.get_or_build(6, 2, 4, 16, Precision::full()).unwrap_err();
        assert!(matches!(err, MoeError::Config(_)));
        let err = cache.get_or_build(6, 2, 4, 4, Precision::packed_half()).unwrap_err();
        assert!(matches!(err, MoeError::Config(_)));
        assert_eq!(cache.builds(), 1);
    }

    #[test]
    fn test_cache_rejects_zero_capacity() {
        let mut cache = KernelCache::new();
        assert!(matches!(
            cache.get_or_build(6, 0, 4, 8, Precision::full()),
            Err(MoeError::Config(_))
        ));
        assert!(matches!(
            cache.get_or_build(0, 2, 4, 8, Precision::full()),
            Err(MoeError::Config(_))
        ));
        assert_eq!(cache.builds(), 0);
    }

    #[test]
    fn test_scatter_skips_overflow() {
        let k = kernels(3, 1, 2, 2);
        let route = Route::new(vec![0, 1, 1], vec![0, 0, 1]);
        let input = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut dispatched = vec![0.0f32; 4];

        k.forward_scatter(&[1.0, 1.0, 1.0], &route, &input, &mut dispatched).unwrap();
        assert_eq!(dispatched, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(route.dropped(1), 1);
    }

    #[test]
    fn test_backward_gate_dot_products() {
        let k = kernels(2, 2, 1, 2);
        let route = Route::new(vec![0, 0], vec![1, 2]);
        let dispatched = [0.0f32, 0.0, 2.0, 3.0];
        let grad = [1.0f32, 10.0, 7.0, 7.0];
        let mut grad_gates = [9.0f32; 2];

        k.backward_gate(&dispatched, &route, &grad, &mut grad_gates).unwrap();
        assert_eq!(grad_gates, [32.0, 0.0]);
    }

    #[test]
    fn test_packed_lanes_cover_full_row() {
        let k = KernelCache::new()
            .get_or_build(1, 1, 1, 2, Precision::packed_half())
            .unwrap();
        assert_eq!(k.row_width(), 4);

        let route = Route::new(vec![0], vec![0]);
        let input = [1.0f32, 2.0, 3.0, 4.0];
        let mut dispatched = [0.0f32; 4];
        k.forward_scatter(&[0.5], &route, &input, &mut dispatched).unwrap();
        assert_eq!(dispatched, [0.5, 1.0, 1.5, 2.0]);
    }

    #[test]
    fn test_launch_shape_mismatch_is_an_error() {
        let k = kernels(2, 1, 1, 2);
        let route = Route::new(vec![0], vec![0]);
        let mut dispatched = [0.0f32; 2];
        assert!(k.forward_scatter(&[1.0], &route, &[1.0, 1.0], &mut dispatched).is_err());
    }
}
