//! Gather / reduce-scatter pair with mirrored gradients.
//!
//! `expand` all-gathers along dim 0 and reduce-scatters its gradient;
//! `contract` reduce-scatters and all-gathers its gradient. Composing them
//! gives `contract(expand(x)) == world_size * x`.
//!
//! Use `expand` before an operation that needs every rank's values (an
//! auxiliary balance term, say) and `contract` to hand each rank back its
//! share of a summed result.

use super::groups::ProcessGroup;
use super::{check_divisible, CollectiveCommunicator};
use crate::autograd::{self, Context, Function};
use crate::utils::error::{MoeError, Result};
use candle_core::Tensor;
use std::sync::Arc;

fn gather(comm: &dyn CollectiveCommunicator, x: &Tensor) -> candle_core::Result<Tensor> {
    comm.all_gather(&x.contiguous()?)
}

fn scatter_sum(comm: &dyn CollectiveCommunicator, x: &Tensor) -> candle_core::Result<Tensor> {
    check_divisible(x, comm.world_size(), "reduce_scatter")?;
    comm.reduce_scatter(&x.contiguous()?)
}

/// Forward: all-gather (`[d0, ...] -> [P * d0, ...]`)
/// Backward: reduce-scatter
pub struct PreAllreduceSum {
    communicator: Arc<dyn CollectiveCommunicator>,
}

impl Function for PreAllreduceSum {
    fn name(&self) -> &'static str {
        "pre_allreduce_sum"
    }

    fn forward(&self, _ctx: &mut Context, inputs: &[&Tensor]) -> candle_core::Result<Tensor> {
        let x = inputs[0];
        // a scalar travels as one row
        let x = if x.rank() == 0 { x.reshape(1)? } else { x.clone() };
        gather(self.communicator.as_ref(), &x)
    }

    fn backward(&self, ctx: &Context, grad_output: &Tensor) -> candle_core::Result<Vec<Option<Tensor>>> {
        let grad = scatter_sum(self.communicator.as_ref(), grad_output)?;
        Ok(vec![Some(grad.reshape(ctx.input_shape(0)?)?)])
    }
}

/// Forward: reduce-scatter (`[d0, ...] -> [d0 / P, ...]`)
/// Backward: all-gather
pub struct PostAllreduceSum {
    communicator: Arc<dyn CollectiveCommunicator>,
}

impl Function for PostAllreduceSum {
    fn name(&self) -> &'static str {
        "post_allreduce_sum"
    }

    fn forward(&self, _ctx: &mut Context, inputs: &[&Tensor]) -> candle_core::Result<Tensor> {
        scatter_sum(self.communicator.as_ref(), inputs[0])
    }

    fn backward(&self, ctx: &Context, grad_output: &Tensor) -> candle_core::Result<Vec<Option<Tensor>>> {
        let grad = gather(self.communicator.as_ref(), grad_output)?;
        Ok(vec![Some(grad.reshape(ctx.input_shape(0)?)?)])
    }
}

/// All-gather `x` over `group`; identity for a group of one.
pub fn expand(group: &ProcessGroup, x: &Tensor) -> Result<Tensor> {
    if group.is_single() {
        return Ok(x.clone());
    }
    let op = PreAllreduceSum {
        communicator: group.communicator.clone(),
    };
    Ok(autograd::apply(op, &[x])?)
}

/// Reduce-scatter `x` over `group`; identity for a group of one.
pub fn contract(group: &ProcessGroup, x: &Tensor) -> Result<Tensor> {
    if group.is_single() {
        return Ok(x.clone());
    }
    check_divisible(x, group.size, "contract").map_err(|e| MoeError::Distributed(e.to_string()))?;
    let op = PostAllreduceSum {
        communicator: group.communicator.clone(),
    };
    Ok(autograd::apply(op, &[x])?)
}
