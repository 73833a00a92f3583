//! # jacobi-cpu
//!
//! Reference CPU backend for Jacobi.
//!
//! Forward kernels live in [`ops`], gradient-update kernels in [`grad`].
//! Matmul-family kernels run row-parallel on the rayon global pool.

pub mod grad;
pub mod ops;

use jacobi_core::{Backend, GradKernel, Operation, Result, Tensor};

/// The CPU backend. Stateless; cheap to create and share.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        CpuBackend
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn exec_op(&self, op: &Operation, inputs: &[&Tensor], output: &mut Tensor) -> Result<()> {
        ops::exec(op, inputs, output)
    }

    fn create_grad_kernel(&self, op: &Operation) -> Result<Box<dyn GradKernel>> {
        log::trace!("cpu grad kernel for {}", op);
        Ok(grad::kernel_for(op))
    }
}
