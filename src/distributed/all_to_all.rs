//! Differentiable all-to-all.
//!
//! Forward sends chunk `j` of dim 0 to rank `j`. The exchange is its own
//! adjoint, so backward runs the same all-to-all on the gradient.

use super::exchange::ExchangeRuntime;
use super::groups::ProcessGroup;
use super::{check_divisible, CollectiveCommunicator};
use crate::autograd::{self, Context, Function};
use crate::utils::error::{MoeError, Result};
use candle_core::{Device, Tensor};
use std::sync::Arc;

pub struct AllToAll {
    communicator: Arc<dyn CollectiveCommunicator>,
    runtime: Arc<ExchangeRuntime>,
    device: Device,
}

impl AllToAll {
    pub fn new(communicator: Arc<dyn CollectiveCommunicator>, runtime: Arc<ExchangeRuntime>, device: Device) -> Self {
        Self {
            communicator,
            runtime,
            device,
        }
    }
}

impl Function for AllToAll {
    fn name(&self) -> &'static str {
        "all_to_all"
    }

    fn forward(&self, _ctx: &mut Context, inputs: &[&Tensor]) -> candle_core::Result<Tensor> {
        self.runtime
            .exchange(self.communicator.as_ref(), inputs[0], &self.device)
    }

    fn backward(&self, _ctx: &Context, grad_output: &Tensor) -> candle_core::Result<Vec<Option<Tensor>>> {
        let grad = self
            .runtime
            .exchange(self.communicator.as_ref(), grad_output, &self.device)?;
        Ok(vec![Some(grad)])
    }
}

/// All-to-all over `group` using the process-wide runtime.
pub fn all_to_all(group: &ProcessGroup, x: &Tensor) -> Result<Tensor> {
    all_to_all_with(group, &ExchangeRuntime::global(), x)
}

/// All-to-all over `group` using an explicit runtime.
pub fn all_to_all_with(group: &ProcessGroup, runtime: &Arc<ExchangeRuntime>, x: &Tensor) -> Result<Tensor> {
    if group.is_single() {
        return Ok(x.clone());
    }
    check_divisible(x, group.size, "all_to_all").map_err(|e| MoeError::Distributed(e.to_string()))?;

    let op = AllToAll::new(group.communicator.clone(), runtime.clone(), x.device().clone());
    Ok(autograd::apply(op, &[x])?)
}
