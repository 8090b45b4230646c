use crate::autograd;
use crate::dispatch::kernels::{DispatchKernels, KernelCache, Precision, Route};
use crate::dispatch::ops::{GatingDecoder, GatingEncoder};
use crate::utils::error::{MoeError, Result};
use crate::utils::metrics;
use candle_core::{DType, Device, Tensor};
use std::sync::Arc;
use tracing::{debug, info};

/// Static shape and precision of a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    pub num_global_experts: usize,
    pub capacity: usize,
    pub model_dim: usize,
    pub dtype: DType,
}

impl DispatchConfig {
    pub fn new(num_global_experts: usize, capacity: usize, model_dim: usize, dtype: DType) -> Result<Self> {
        if num_global_experts == 0 {
            return Err(MoeError::Config("num_global_experts must be at least 1".to_string()));
        }
        if capacity == 0 {
            return Err(MoeError::Config("capacity must be at least 1".to_string()));
        }
        if model_dim == 0 {
            return Err(MoeError::Config("model_dim must be at least 1".to_string()));
        }
        if !matches!(dtype, DType::F16 | DType::BF16 | DType::F32 | DType::F64) {
            return Err(MoeError::Config(format!("Unrecognized data type: {:?}", dtype)));
        }
        Ok(Self {
            num_global_experts,
            capacity,
            model_dim,
            dtype,
        })
    }
}

/// Whether the device can run the packed two-lane half precision path.
pub fn supports_packed_half(device: &Device) -> bool {
    !device.is_metal()
}

/// Working precision for a requested dtype.
///
/// Half precision is used only for f16 on a capable device with an even
/// feature width. bf16 and f64 compute in f32.
pub fn select_precision(dtype: DType, model_dim: usize, device: &Device) -> Precision {
    if dtype == DType::F16 && model_dim % 2 == 0 && supports_packed_half(device) {
        Precision::packed_half()
    } else {
        Precision::full()
    }
}

/// Read a routing tensor into host integers, rejecting negative values.
fn routing_values(tensor: &Tensor, what: &str, choice: usize) -> Result<Vec<u32>> {
    let values = tensor.flatten_all()?.to_dtype(DType::I64)?.to_vec1::<i64>()?;
    values
        .into_iter()
        .map(|v| {
            if v < 0 {
                Err(MoeError::Routing(format!("{} of choice {} contains negative value {}", what, choice, v)))
            } else {
                Ok(v.min(u32::MAX as i64) as u32)
            }
        })
        .collect()
}

/// Capacity-bounded sparse dispatch/combine engine.
///
/// `update` installs a routing assignment; `encode` and `decode` then move
/// token rows into expert slots and back. All three stay valid until the
/// next `update`.
#[derive(Debug)]
pub struct FastDispatcher {
    config: DispatchConfig,
    precision: Precision,
    capacity: usize,
    cache: KernelCache,
    kernels: Option<Arc<DispatchKernels>>,
    routes: Vec<Route>,
    gates: Vec<Tensor>,
}

impl FastDispatcher {
    pub fn new(config: DispatchConfig, device: &Device) -> Result<Self> {
        let config = DispatchConfig::new(config.num_global_experts, config.capacity, config.model_dim, config.dtype)?;
        let precision = select_precision(config.dtype, config.model_dim, device);
        info!(
            num_global_experts = config.num_global_experts,
            capacity = config.capacity,
            model_dim = config.model_dim,
            requested = ?config.dtype,
            compute = ?precision.dtype,
            lanes = precision.lanes,
            "Created sparse dispatcher"
        );
        Ok(Self {
            config,
            precision,
            capacity: config.capacity,
            cache: KernelCache::new(),
            kernels: None,
            routes: Vec::new(),
            gates: Vec::new(),
        })
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn compute_dtype(&self) -> DType {
        self.precision.dtype
    }

    /// Capacity of the installed assignment, or the configured one before any update.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn sample_size(&self) -> Option<usize> {
        self.kernels.as_ref().map(|k| k.sample_size())
    }

    pub fn num_choices(&self) -> usize {
        self.routes.len()
    }

    /// Kernel bundles built over the dispatcher's lifetime.
    pub fn kernel_builds(&self) -> usize {
        self.cache.builds()
    }

    fn model_dim_per_lane(&self) -> usize {
        self.config.model_dim / self.precision.lanes
    }

    /// Install a routing assignment of `K = indices.len()` choices.
    ///
    /// `capacity` of `None` keeps the current capacity. Kernels are rebuilt
    /// only for a `(sample_size, capacity)` pair not seen before.
    pub fn update(
        &mut self,
        indices: &[Tensor],
        locations: &[Tensor],
        gates: &[Tensor],
        capacity: Option<usize>,
    ) -> Result<()> {
        let num_choices = indices.len();
        if num_choices == 0 {
            return Err(MoeError::Routing("routing assignment has no choices".to_string()));
        }
        if locations.len() != num_choices || gates.len() != num_choices {
            return Err(MoeError::Routing(format!(
                "routing choice count mismatch: {} indices, {} locations, {} gates",
                num_choices,
                locations.len(),
                gates.len()
            )));
        }

        let capacity = capacity.unwrap_or(self.capacity);
        if capacity == 0 {
            return Err(MoeError::Config("capacity must be at least 1".to_string()));
        }

        let sample_size = indices[0].elem_count();
        if sample_size == 0 {
            return Err(MoeError::Routing("routing assignment has no tokens".to_string()));
        }
        let num_experts = self.config.num_global_experts;
        let mut routes = Vec::with_capacity(num_choices);
        let mut flat_gates = Vec::with_capacity(num_choices);

        for (i, ((idx, loc), gate)) in indices.iter().zip(locations).zip(gates).enumerate() {
            let lengths = [idx.elem_count(), loc.elem_count(), gate.elem_count()];
            if lengths.iter().any(|&n| n != sample_size) {
                return Err(MoeError::Routing(format!(
                    "choice {} has indices/locations/gates of lengths {:?}, expected {}",
                    i, lengths, sample_size
                )));
            }

            let idx = routing_values(idx, "indices", i)?;
            if let Some(&bad) = idx.iter().find(|&&e| e as usize >= num_experts) {
                return Err(MoeError::Routing(format!(
                    "choice {} routes to expert {} but only {} experts exist",
                    i, bad, num_experts
                )));
            }
            let loc = routing_values(loc, "locations", i)?;

            routes.push(Route::new(idx, loc));
            flat_gates.push(gate.flatten_all()?);
        }

        let kernels = self.cache.get_or_build(
            sample_size,
            capacity,
            num_experts,
            self.model_dim_per_lane(),
            self.precision,
        )?;

        let dropped: usize = routes.iter().map(|r| r.dropped(capacity)).sum();
        if dropped > 0 {
            debug!(dropped, sample_size, capacity, "Routing choices exceed expert capacity");
        }
        metrics::record_routing(sample_size * num_choices - dropped, dropped);

        self.capacity = capacity;
        self.kernels = Some(kernels);
        self.routes = routes;
        self.gates = flat_gates;
        Ok(())
    }

    fn installed(&self) -> Result<&Arc<DispatchKernels>> {
        self.kernels
            .as_ref()
            .ok_or_else(|| MoeError::Routing("no routing assignment installed; call update first".to_string()))
    }

    /// View `tensor` as `[rows, model_dim]` in the working precision.
    fn to_rows(&self, tensor: &Tensor, rows: usize, what: &str) -> Result<Tensor> {
        let model_dim = self.config.model_dim;
        let last = tensor.dims().last().copied().unwrap_or(1);
        if last != model_dim {
            return Err(MoeError::Config(format!(
                "{} has feature width {}, dispatcher was built for {}",
                what, last, model_dim
            )));
        }
        if tensor.elem_count() != rows * model_dim {
            return Err(MoeError::Routing(format!(
                "{} of shape {:?} does not hold {} rows of width {}",
                what,
                tensor.dims(),
                rows,
                model_dim
            )));
        }
        Ok(tensor.reshape((rows, model_dim))?.to_dtype(self.precision.dtype)?)
    }

    fn scatter(&self, x: &Tensor, routes: Vec<Route>) -> Result<Tensor> {
        let kernels = self.installed()?;
        let input = self.to_rows(x, kernels.sample_size(), "encoder input")?;
        let encoder = GatingEncoder::new(kernels.clone(), routes);
        let dispatched = autograd::apply(encoder, &[&input])?;
        Ok(dispatched.to_dtype(self.config.dtype)?)
    }

    /// Scatter `x: [sample_size, model_dim]` into `[E * capacity, model_dim]`
    /// using the first routing choice, unweighted.
    pub fn encode(&self, x: &Tensor) -> Result<Tensor> {
        let first = self.routes.first().cloned().into_iter().collect();
        self.scatter(x, first)
    }

    /// Like [`encode`](Self::encode) but scatters every routing choice.
    pub fn encode_all(&self, x: &Tensor) -> Result<Tensor> {
        self.scatter(x, self.routes.clone())
    }

    /// Combine `expert_output: [E * capacity, model_dim]` back into
    /// `[sample_size, model_dim]`, weighting every choice by its gate.
    pub fn decode(&self, expert_output: &Tensor) -> Result<Tensor> {
        let kernels = self.installed()?;
        let expert_output = self.to_rows(expert_output, kernels.num_slots(), "expert output")?;
        let gates = self
            .gates
            .iter()
            .map(|g| g.to_dtype(self.precision.dtype))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let gates = Tensor::stack(&gates, 0)?;

        let decoder = GatingDecoder::new(kernels.clone(), self.routes.clone());
        let combined = autograd::apply(decoder, &[&expert_output, &gates])?;
        Ok(combined.to_dtype(self.config.dtype)?)
    }
}
