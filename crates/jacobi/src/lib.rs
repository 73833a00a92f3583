//! # Jacobi
//!
//! Static dataflow tensor graphs with Jacobian-form reverse-mode
//! differentiation.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use jacobi::prelude::*;
//!
//! # fn main() -> jacobi::Result<()> {
//! let mut b = GraphBuilder::new();
//! let x = b.add_input_node(3);
//! let v = b.add_data_node(3);
//! let d = b.apply(Operation::sub(), &[x, v])?;
//! let s = b.apply(Operation::square(), &[d])?;
//! let y = b.apply(Operation::reduce_sum(0), &[s])?;
//! b.make_output(y)?;
//! let graph = b.build();
//!
//! let mut section = SectionBuilder::new(&graph, CpuBackend::new())
//!     .config(SectionConfig::default().with_differentiate(true))
//!     .bind_data(v, Tensor::from_vec(vec![1.0, 2.0, 3.0], 3)?)
//!     .build()?;
//! let input = Tensor::from_vec(vec![2.0, 4.0, 6.0], 3)?;
//! let result = section.execute(&[(x, &input)], true)?;
//! assert_eq!(result.output(y).unwrap().data(), &[14.0]);
//! assert_eq!(result.grad(v, y).unwrap().data(), &[-2.0, -4.0, -6.0]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `jacobi-core` | Graph, builder, runners, dependency analysis, gradient system, Section |
//! | `jacobi-cpu` | CPU backend: forward kernels and gradient-update kernels (rayon) |
//!
//! ## Modules
//!
//! - [`persist`] — Save/load graphs in the binary `.jcg` format

/// Re-export core types.
pub use jacobi_core::{
    backend::{Backend, GradKernel},
    BackwardEngine, BackwardRunner, DepType, DiffInfo, DiffInfoBuilder, Error, ExecResult,
    ForwardRunner, GradMap, GradSystem, Gradient, Graph, GraphBuilder, GraphParts, NodeDiffInfo,
    NodeId, NodeValues, OpKind, OpNode, Operation, Result, RunState, Section, SectionBuilder,
    SectionConfig, Shape, Tensor, TensorArena, TensorHandle, TensorNode,
};

/// Re-export CPU backend.
pub use jacobi_cpu::CpuBackend;

/// Persist — save and load graphs.
pub mod persist;

/// Convenient imports for common usage.
///
/// ```rust
/// use jacobi::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        CpuBackend, Error, GraphBuilder, NodeId, Operation, Result, Section, SectionBuilder,
        SectionConfig, Shape, Tensor,
    };
}
