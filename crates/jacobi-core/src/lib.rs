//! # jacobi-core
//!
//! Static dataflow graphs with Jacobian-form reverse-mode differentiation.
//!
//! This crate provides:
//! - [`GraphBuilder`] / [`Graph`] — append-only construction of an immutable DAG
//! - [`ForwardRunner`] / [`BackwardRunner`] — dependency-tracked op scheduling
//! - [`DiffInfoBuilder`] — static analysis of which gradients can be non-zero
//! - [`GradSystem`] — sparse storage of `source ⊗ output` gradient blocks
//! - [`Backend`] / [`GradKernel`] — the numeric contract a backend implements
//! - [`Section`] — binds a graph to a backend and runs it, optionally
//!   differentiating every output
// - Shape / Tensor / TensorArena: storage primitives
// - Operation: closed op tags with shape inference
// - Graph + runners: structure and traversal order
// - DiffInfo + GradSystem + BackwardEngine: differentiation
// - Section: execution orchestration

pub mod backend;
pub mod backward;
pub mod diff_info;
pub mod error;
pub mod grad;
pub mod graph;
pub mod op;
pub mod runner;
pub mod section;
pub mod shape;
pub mod tensor;
pub mod values;

pub use backend::{Backend, GradKernel};
pub use backward::BackwardEngine;
pub use diff_info::{DepType, DiffInfo, DiffInfoBuilder, NodeDiffInfo};
pub use error::{Error, Result};
pub use grad::{GradMap, GradSystem, Gradient};
pub use graph::{Graph, GraphBuilder, GraphParts, NodeId, OpNode, TensorNode};
pub use op::{OpKind, Operation};
pub use runner::{BackwardRunner, ForwardRunner, RunState};
pub use section::{ExecResult, Section, SectionBuilder, SectionConfig};
pub use shape::Shape;
pub use tensor::{Tensor, TensorArena, TensorHandle};
pub use values::NodeValues;
