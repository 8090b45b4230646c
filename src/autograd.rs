//! Explicit forward/backward operators recorded on candle's autograd graph.
//!
//! Candle differentiates its built-in ops, but collectives and the sparse
//! dispatch kernels need hand-written gradient rules. A [`Function`] computes
//! its forward result on host tensors, keeps whatever backward needs in a
//! [`Context`], and [`apply`] records the pair as a candle custom op so that
//! `Tensor::backward` calls [`Function::backward`] at the right point of the
//! reverse sweep.

use candle_core::{
    bail, CpuStorage, CustomOp1, CustomOp2, DType, Device, Layout, Result, Shape, Tensor,
};

/// Values carried from forward to backward.
///
/// Only what backward actually reads belongs here: input shapes are filled in
/// by [`apply`], saved tensors are pushed by the forward implementation.
#[derive(Debug, Default)]
pub struct Context {
    input_shapes: Vec<Shape>,
    saved: Vec<Tensor>,
}

impl Context {
    pub fn save_for_backward(&mut self, tensor: Tensor) {
        self.saved.push(tensor);
    }

    pub fn saved_tensor(&self, index: usize) -> Result<&Tensor> {
        match self.saved.get(index) {
            Some(t) => Ok(t),
            None => bail!("no tensor saved for backward at index {}", index),
        }
    }

    pub fn input_shape(&self, index: usize) -> Result<&Shape> {
        match self.input_shapes.get(index) {
            Some(s) => Ok(s),
            None => bail!("no input shape recorded at index {}", index),
        }
    }
}

/// A differentiable operator with an explicit gradient rule.
pub trait Function: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Compute the output. Inputs are detached host tensors.
    fn forward(&self, ctx: &mut Context, inputs: &[&Tensor]) -> Result<Tensor>;

    /// Gradient of every input given the gradient of the output, `None` for
    /// inputs that receive no gradient.
    fn backward(&self, ctx: &Context, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>>;
}

/// Run `function` on `inputs` and record it for backpropagation.
///
/// One or two inputs are supported. Inputs living on an accelerator are
/// moved to the host for the operator and the result is moved back; both
/// transfers are differentiable.
pub fn apply<F: Function>(function: F, inputs: &[&Tensor]) -> Result<Tensor> {
    let device = match inputs.first() {
        Some(t) => t.device().clone(),
        None => bail!("{} called without inputs", function.name()),
    };

    let host = inputs
        .iter()
        .map(|t| t.to_device(&Device::Cpu))
        .collect::<Result<Vec<_>>>()?;
    let detached: Vec<Tensor> = host.iter().map(|t| t.detach()).collect();
    let refs: Vec<&Tensor> = detached.iter().collect();

    let mut ctx = Context {
        input_shapes: host.iter().map(|t| t.shape().clone()).collect(),
        saved: Vec::new(),
    };
    let output = function.forward(&mut ctx, &refs)?;
    let node = Recorded { function, ctx, output };

    let result = match host.as_slice() {
        [x] => x.apply_op1(node)?,
        [lhs, rhs] => lhs.apply_op2(rhs, node)?,
        _ => bail!("{} takes one or two inputs, got {}", node.function.name(), host.len()),
    };
    result.to_device(&device)
}

/// A function together with its forward result and saved context.
struct Recorded<F> {
    function: F,
    ctx: Context,
    output: Tensor,
}

impl<F: Function> Recorded<F> {
    fn grads(&self, args: &[&Tensor], grad_res: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let mut grads = self.function.backward(&self.ctx, grad_res)?;
        grads.resize(args.len(), None);
        for (arg, grad) in args.iter().zip(grads.iter()) {
            if let Some(grad) = grad {
                if grad.dims() != arg.dims() {
                    bail!(
                        "{} produced a gradient of shape {:?} for an input of shape {:?}",
                        self.function.name(),
                        grad.dims(),
                        arg.dims()
                    );
                }
            }
        }
        Ok(grads)
    }
}

/// Copy a tensor into a freshly allocated, contiguous host storage.
fn host_storage(tensor: &Tensor) -> Result<(CpuStorage, Shape)> {
    let flat = tensor.flatten_all()?;
    let storage = match tensor.dtype() {
        DType::U8 => CpuStorage::U8(flat.to_vec1()?),
        DType::U32 => CpuStorage::U32(flat.to_vec1()?),
        DType::I64 => CpuStorage::I64(flat.to_vec1()?),
        DType::BF16 => CpuStorage::BF16(flat.to_vec1()?),
        DType::F16 => CpuStorage::F16(flat.to_vec1()?),
        DType::F32 => CpuStorage::F32(flat.to_vec1()?),
        DType::F64 => CpuStorage::F64(flat.to_vec1()?),
        dtype => bail!("unsupported output dtype {:?}", dtype),
    };
    Ok((storage, tensor.shape().clone()))
}

impl<F: Function> CustomOp1 for Recorded<F> {
    fn name(&self) -> &'static str {
        self.function.name()
    }

    fn cpu_fwd(&self, _: &CpuStorage, _: &Layout) -> Result<(CpuStorage, Shape)> {
        host_storage(&self.output)
    }

    fn bwd(&self, arg: &Tensor, _res: &Tensor, grad_res: &Tensor) -> Result<Option<Tensor>> {
        let mut grads = self.grads(&[arg], grad_res)?;
        Ok(grads.swap_remove(0))
    }
}

impl<F: Function> CustomOp2 for Recorded<F> {
    fn name(&self) -> &'static str {
        self.function.name()
    }

    fn cpu_fwd(
        &self,
        _: &CpuStorage,
        _: &Layout,
        _: &CpuStorage,
        _: &Layout,
    ) -> Result<(CpuStorage, Shape)> {
        host_storage(&self.output)
    }

    fn bwd(
        &self,
        arg1: &Tensor,
        arg2: &Tensor,
        _res: &Tensor,
        grad_res: &Tensor,
    ) -> Result<(Option<Tensor>, Option<Tensor>)> {
        let mut grads = self.grads(&[arg1, arg2], grad_res)?.into_iter();
        let lhs = grads.next().flatten();
        let rhs = grads.next().flatten();
        Ok((lhs, rhs))
    }
}
