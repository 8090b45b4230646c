//! Differentiable encode/decode operators built on the dispatch kernels.
//!
//! Both operators run entirely in the dispatcher's working precision; the
//! caller casts inputs in and outputs back, so the casts stay on candle's
//! own autograd graph.

use crate::autograd::{Context, Function};
use crate::dispatch::kernels::{DispatchKernels, Route};
use candle_core::{bail, DType, Device, Result, Tensor, WithDType};
use half::f16;
use std::sync::Arc;

fn host_vec<T: WithDType>(tensor: &Tensor) -> Result<Vec<T>> {
    tensor.flatten_all()?.to_vec1::<T>()
}

/// Scatter token rows into expert slots without gate weighting.
///
/// Input `[sample_size, model_dim]`, output `[num_experts * capacity, model_dim]`.
/// One scatter per route; several routes accumulate into the same buffer.
pub struct GatingEncoder {
    kernels: Arc<DispatchKernels>,
    routes: Vec<Route>,
}

impl GatingEncoder {
    pub fn new(kernels: Arc<DispatchKernels>, routes: Vec<Route>) -> Self {
        Self { kernels, routes }
    }

    fn scatter<T: WithDType>(&self, input: &Tensor) -> Result<Tensor> {
        let k = &self.kernels;
        let ones = host_vec::<T>(k.ones_helper())?;
        let input = host_vec::<T>(input)?;
        let mut dispatched = vec![T::from_f64(0.0); k.num_slots() * k.row_width()];
        for route in &self.routes {
            k.forward_scatter(&ones, route, &input, &mut dispatched)?;
        }
        Tensor::from_vec(dispatched, (k.num_slots(), k.row_width()), &Device::Cpu)
    }

    fn gather<T: WithDType>(&self, grad_output: &Tensor) -> Result<Tensor> {
        let k = &self.kernels;
        let ones = host_vec::<T>(k.ones_helper())?;
        let grad_output = host_vec::<T>(grad_output)?;
        let mut grad_input = vec![T::from_f64(0.0); k.sample_size() * k.row_width()];
        for route in &self.routes {
            k.backward_data(&ones, &grad_output, route, &mut grad_input)?;
        }
        Tensor::from_vec(grad_input, (k.sample_size(), k.row_width()), &Device::Cpu)
    }
}

impl Function for GatingEncoder {
    fn name(&self) -> &'static str {
        "gating_encoder"
    }

    fn forward(&self, _ctx: &mut Context, inputs: &[&Tensor]) -> Result<Tensor> {
        let input = inputs[0];
        match input.dtype() {
            DType::F16 => self.scatter::<f16>(input),
            DType::F32 => self.scatter::<f32>(input),
            dtype => bail!("gating encoder cannot compute in {:?}", dtype),
        }
    }

    fn backward(&self, _ctx: &Context, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let grad = match grad_output.dtype() {
            DType::F16 => self.gather::<f16>(grad_output)?,
            DType::F32 => self.gather::<f32>(grad_output)?,
            dtype => bail!("gating encoder cannot compute in {:?}", dtype),
        };
        Ok(vec![Some(grad)])
    }
}

/// Gate-weighted combine of expert slots back into token rows.
///
/// Inputs are the expert output `[num_experts * capacity, model_dim]` and the
/// stacked gates `[K, sample_size]`, one row per route.
pub struct GatingDecoder {
    kernels: Arc<DispatchKernels>,
    routes: Vec<Route>,
}

impl GatingDecoder {
    pub fn new(kernels: Arc<DispatchKernels>, routes: Vec<Route>) -> Self {
        Self { kernels, routes }
    }

    fn check_gates(&self, gates: &Tensor) -> Result<()> {
        let expected = (self.routes.len(), self.kernels.sample_size());
        if gates.dims2()? != expected {
            bail!("gating decoder expects gates of shape {:?}, got {:?}", expected, gates.dims());
        }
        Ok(())
    }

    fn combine<T: WithDType>(&self, expert_output: &Tensor, gates: &Tensor) -> Result<Tensor> {
        let k = &self.kernels;
        let expert_output = host_vec::<T>(expert_output)?;
        let gates = gates.to_vec2::<T>()?;
        let mut combined = vec![T::from_f64(0.0); k.sample_size() * k.row_width()];
        for (route, gate) in self.routes.iter().zip(&gates) {
            k.backward_data(gate, &expert_output, route, &mut combined)?;
        }
        Tensor::from_vec(combined, (k.sample_size(), k.row_width()), &Device::Cpu)
    }

    fn grads<T: WithDType>(
        &self,
        expert_output: &Tensor,
        gates: &Tensor,
        grad_output: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let k = &self.kernels;
        let expert_output = host_vec::<T>(expert_output)?;
        let gates = gates.to_vec2::<T>()?;
        let grad_output = host_vec::<T>(grad_output)?;

        let mut grad_expert = vec![T::from_f64(0.0); k.num_slots() * k.row_width()];
        let mut grad_gates = vec![T::from_f64(0.0); self.routes.len() * k.sample_size()];
        for ((route, gate), grad_gate) in self
            .routes
            .iter()
            .zip(&gates)
            .zip(grad_gates.chunks_exact_mut(k.sample_size()))
        {
            k.forward_scatter(gate, route, &grad_output, &mut grad_expert)?;
            k.backward_gate(&expert_output, route, &grad_output, grad_gate)?;
        }

        let grad_expert = Tensor::from_vec(grad_expert, (k.num_slots(), k.row_width()), &Device::Cpu)?;
        let grad_gates = Tensor::from_vec(grad_gates, (self.routes.len(), k.sample_size()), &Device::Cpu)?;
        Ok((grad_expert, grad_gates))
    }
}

impl Function for GatingDecoder {
    fn name(&self) -> &'static str {
        "gating_decoder"
    }

    fn forward(&self, ctx: &mut Context, inputs: &[&Tensor]) -> Result<Tensor> {
        let (expert_output, gates) = match inputs {
            [expert_output, gates] => (*expert_output, *gates),
            _ => bail!("gating decoder takes expert output and gates"),
        };
        self.check_gates(gates)?;
        ctx.save_for_backward(expert_output.clone());
        ctx.save_for_backward(gates.clone());

        match expert_output.dtype() {
            DType::F16 => self.combine::<f16>(expert_output, gates),
            DType::F32 => self.combine::<f32>(expert_output, gates),
            dtype => bail!("gating decoder cannot compute in {:?}", dtype),
        }
    }

    fn backward(&self, ctx: &Context, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let expert_output = ctx.saved_tensor(0)?;
        let gates = ctx.saved_tensor(1)?;
        let (grad_expert, grad_gates) = match grad_output.dtype() {
            DType::F16 => self.grads::<f16>(expert_output, gates, grad_output)?,
            DType::F32 => self.grads::<f32>(expert_output, gates, grad_output)?,
            dtype => bail!("gating decoder cannot compute in {:?}", dtype),
        };
        Ok(vec![Some(grad_expert), Some(grad_gates)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::apply;
    use crate::dispatch::kernels::{KernelCache, Precision};
    use candle_core::Var;

    fn setup() -> (Arc<DispatchKernels>, Route) {
        let kernels = KernelCache::new()
            .get_or_build(3, 1, 2, 2, Precision::full())
            .unwrap();
        // token 2 overflows expert 1
        let route = Route::new(vec![1, 0, 1], vec![0, 0, 1]);
        (kernels, route)
    }

    #[test]
    fn test_encoder_gradient_is_gather() -> Result<()> {
        let (kernels, route) = setup();
        let x = Var::new(&[[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0]], &Device::Cpu)?;

        let y = apply(GatingEncoder::new(kernels, vec![route]), &[x.as_tensor()])?;
        assert_eq!(y.to_vec2::<f32>()?, vec![vec![3.0, 4.0], vec![1.0, 2.0]]);

        let w = Tensor::new(&[[10.0f32, 20.0], [30.0, 40.0]], &Device::Cpu)?;
        let grads = y.mul(&w)?.sum_all()?.backward()?;
        let dx = grads.get(x.as_tensor()).expect("grad x");
        assert_eq!(
            dx.to_vec2::<f32>()?,
            vec![vec![30.0, 40.0], vec![10.0, 20.0], vec![0.0, 0.0]]
        );
        Ok(())
    }

    #[test]
    fn test_decoder_gradients() -> Result<()> {
        let (kernels, route) = setup();
        let expert = Var::new(&[[1.0f32, 1.0], [2.0, 3.0]], &Device::Cpu)?;
        let gates = Var::new(&[[0.5f32, 2.0, 4.0]], &Device::Cpu)?;

        let y = apply(
            GatingDecoder::new(kernels, vec![route]),
            &[expert.as_tensor(), gates.as_tensor()],
        )?;
        assert_eq!(
            y.to_vec2::<f32>()?,
            vec![vec![1.0, 1.5], vec![2.0, 2.0], vec![0.0, 0.0]]
        );

        let grads = y.sum_all()?.backward()?;
        let d_expert = grads.get(expert.as_tensor()).expect("grad expert");
        assert_eq!(d_expert.to_vec2::<f32>()?, vec![vec![2.0, 2.0], vec![0.5, 0.5]]);
        let d_gates = grads.get(gates.as_tensor()).expect("grad gates");
        assert_eq!(d_gates.to_vec2::<f32>()?, vec![vec![5.0, 2.0, 0.0]]);
        Ok(())
    }

    #[test]
    fn test_decoder_rejects_gate_shape() {
        let (kernels, route) = setup();
        let expert = Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap();
        let gates = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let decoder = GatingDecoder::new(kernels, vec![route]);
        assert!(apply(decoder, &[&expert, &gates]).is_err());
    }
}
