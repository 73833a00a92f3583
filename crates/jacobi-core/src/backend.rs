use crate::error::Result;
use crate::op::Operation;
use crate::tensor::Tensor;
use std::fmt;

// Backend — The numeric side of graph execution
//
// The graph engine schedules operations and owns every tensor, but never
// computes a value itself. All arithmetic goes through a Backend:
//
//   exec_op(op, inputs, output)   forward pass of one op node; WRITES the
//                                 output buffer (does not accumulate)
//   create_grad_kernel(op)        one gradient-update kernel per op node,
//                                 resolved once when a section is built
//
// A GradKernel applies the chain rule for one operation:
//
//   reset(inputs, output)                         bind the node's values
//   update_grad(inputs, i, out_grad, in_grad)     in_grad += d(out)/d(in_i) · out_grad
//
// Gradients are Jacobian blocks: for a node n and graph output o the block
// d(o)/d(n) is laid out row-major as [n.size(), o.size()]. Kernels see
// `out_grad` as [op_output.size(), O] and `in_grad` as [input_i.size(), O],
// where O = o.size() can be read from the tensor lengths.
//
// An operation kind the backend cannot differentiate must fail with
// Error::KernelNotFound at create_grad_kernel time. Skipping it would
// silently corrupt every gradient upstream of it.

/// A gradient-update kernel for one operation node.
pub trait GradKernel: Send + fmt::Debug {
    /// Bind the operation's concrete tensors before a visit. Kernels may
    /// cache shape-derived values here.
    fn reset(&mut self, inputs: &[&Tensor], output: &Tensor) -> Result<()>;

    /// Accumulate the contribution of `out_grad` into `in_grad` for input
    /// position `index`. `inputs` is the slice passed to the last `reset`.
    fn update_grad(
        &self,
        inputs: &[&Tensor],
        index: usize,
        out_grad: &Tensor,
        in_grad: &mut Tensor,
    ) -> Result<()>;
}

/// A numeric backend.
pub trait Backend: Send + Sync + fmt::Debug {
    /// A human-readable name (e.g. "cpu").
    fn name(&self) -> &str;

    /// Compute one operation, overwriting `output`.
    fn exec_op(&self, op: &Operation, inputs: &[&Tensor], output: &mut Tensor) -> Result<()>;

    /// Create the gradient-update kernel for `op`.
    fn create_grad_kernel(&self, op: &Operation) -> Result<Box<dyn GradKernel>>;
}

impl<B: Backend + ?Sized> Backend for &B {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn exec_op(&self, op: &Operation, inputs: &[&Tensor], output: &mut Tensor) -> Result<()> {
        (**self).exec_op(op, inputs, output)
    }

    fn create_grad_kernel(&self, op: &Operation) -> Result<Box<dyn GradKernel>> {
        (**self).create_grad_kernel(op)
    }
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn exec_op(&self, op: &Operation, inputs: &[&Tensor], output: &mut Tensor) -> Result<()> {
        (**self).exec_op(op, inputs, output)
    }

    fn create_grad_kernel(&self, op: &Operation) -> Result<Box<dyn GradKernel>> {
        (**self).create_grad_kernel(op)
    }
}
