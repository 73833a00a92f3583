// Op — Operation tags carried by graph operation nodes
//
// An operation is a closed tag (OpKind) plus one integer argument. The
// argument is only meaningful for reductions, where it is the axis:
//
//   Operation::add()           → { kind: Add,       arg: 0 }
//   Operation::reduce_sum(1)   → { kind: ReduceSum, arg: 1 }
//
// The graph never interprets an operation numerically. It only needs to know
// how many inputs an operation takes and what output shape it produces, so
// that the builder can reject malformed graphs before anything runs. The
// numeric meaning lives in the backend, which maps each OpKind to a forward
// kernel and a gradient-update kernel.
//
// SHAPE RULES:
//
//   Matmul      [M,K]  · [K,N]  → [M,N]
//   VecMatmul   [M]    · [M,N]  → [N]
//   MatVecmul   [M,N]  · [N]    → [M]
//   DotProduct  [N]    · [N]    → [1]
//   Add/Sub/Mult  a    · a      → a        (no broadcasting)
//   Square        a             → a
//   Identity      a             → a
//   ReduceSum/ReduceMean(axis)  → a without `axis`
//   Noop                        → declared shape, no inputs checked

use std::fmt;

use crate::error::{Error, Result};
use crate::shape::Shape;

/// The kind of an operation. The order of the variants is the stable tag
/// order used by the persistence format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    Noop,
    Identity,
    Matmul,
    VecMatmul,
    MatVecmul,
    DotProduct,
    Sub,
    Add,
    Mult,
    Square,
    ReduceSum,
    ReduceMean,
}

impl OpKind {
    /// All operation kinds, in tag order.
    pub const ALL: [OpKind; 12] = [
        OpKind::Noop,
        OpKind::Identity,
        OpKind::Matmul,
        OpKind::VecMatmul,
        OpKind::MatVecmul,
        OpKind::DotProduct,
        OpKind::Sub,
        OpKind::Add,
        OpKind::Mult,
        OpKind::Square,
        OpKind::ReduceSum,
        OpKind::ReduceMean,
    ];

    /// Stable numeric tag.
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<OpKind> {
        OpKind::ALL.get(tag as usize).copied()
    }

    /// Number of inputs, or `None` when any count is accepted.
    pub fn arity(self) -> Option<usize> {
        match self {
            OpKind::Noop => None,
            OpKind::Identity | OpKind::Square | OpKind::ReduceSum | OpKind::ReduceMean => Some(1),
            OpKind::Matmul
            | OpKind::VecMatmul
            | OpKind::MatVecmul
            | OpKind::DotProduct
            | OpKind::Sub
            | OpKind::Add
            | OpKind::Mult => Some(2),
        }
    }
}

/// A graph operation: kind plus an optional integer argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operation {
    pub kind: OpKind,
    pub arg: i32,
}

impl Operation {
    pub fn new(kind: OpKind, arg: i32) -> Self {
        Operation { kind, arg }
    }

    pub fn noop() -> Self {
        Self::new(OpKind::Noop, 0)
    }
    pub fn identity() -> Self {
        Self::new(OpKind::Identity, 0)
    }
    pub fn matmul() -> Self {
        Self::new(OpKind::Matmul, 0)
    }
    pub fn vecmatmul() -> Self {
        Self::new(OpKind::VecMatmul, 0)
    }
    pub fn matvecmul() -> Self {
        Self::new(OpKind::MatVecmul, 0)
    }
    pub fn dot_product() -> Self {
        Self::new(OpKind::DotProduct, 0)
    }
    pub fn sub() -> Self {
        Self::new(OpKind::Sub, 0)
    }
    pub fn add() -> Self {
        Self::new(OpKind::Add, 0)
    }
    pub fn mult() -> Self {
        Self::new(OpKind::Mult, 0)
    }
    pub fn square() -> Self {
        Self::new(OpKind::Square, 0)
    }
    pub fn reduce_sum(axis: i32) -> Self {
        Self::new(OpKind::ReduceSum, axis)
    }
    pub fn reduce_mean(axis: i32) -> Self {
        Self::new(OpKind::ReduceMean, axis)
    }

    /// The reduction axis, validated against the input shape.
    pub fn axis(&self, input: &Shape) -> Result<usize> {
        if self.arg < 0 || self.arg as usize >= input.rank() {
            return Err(Error::InvalidAxis {
                axis: self.arg,
                shape: input.clone(),
            });
        }
        Ok(self.arg as usize)
    }

    /// Compute the output shape for the given input shapes, rejecting
    /// wrong arities and incompatible shapes.
    ///
    /// `Noop` has no shape rule; callers supply its output shape directly.
    pub fn infer_shape(&self, inputs: &[&Shape]) -> Result<Option<Shape>> {
        if let Some(expected) = self.kind.arity() {
            if inputs.len() != expected {
                return Err(Error::ArityMismatch {
                    op: self.kind,
                    expected,
                    got: inputs.len(),
                });
            }
        }
        let shape = match self.kind {
            OpKind::Noop => return Ok(None),
            OpKind::Identity | OpKind::Square => inputs[0].clone(),
            OpKind::Add | OpKind::Sub | OpKind::Mult => {
                same_shape(inputs[0], inputs[1])?;
                inputs[0].clone()
            }
            OpKind::Matmul => {
                let (a, b) = (inputs[0], inputs[1]);
                expect_rank(a, 2)?;
                expect_rank(b, 2)?;
                if a.dims()[1] != b.dims()[0] {
                    return Err(Error::ShapeMismatch {
                        expected: Shape::from((a.dims()[1], b.dims()[1])),
                        got: b.clone(),
                    });
                }
                Shape::from((a.dims()[0], b.dims()[1]))
            }
            OpKind::VecMatmul => {
                let (v, m) = (inputs[0], inputs[1]);
                expect_rank(v, 1)?;
                expect_rank(m, 2)?;
                if v.dims()[0] != m.dims()[0] {
                    return Err(Error::ShapeMismatch {
                        expected: Shape::from((v.dims()[0], m.dims()[1])),
                        got: m.clone(),
                    });
                }
                Shape::from(m.dims()[1])
            }
            OpKind::MatVecmul => {
                let (m, v) = (inputs[0], inputs[1]);
                expect_rank(m, 2)?;
                expect_rank(v, 1)?;
                if m.dims()[1] != v.dims()[0] {
                    return Err(Error::ShapeMismatch {
                        expected: Shape::from(m.dims()[1]),
                        got: v.clone(),
                    });
                }
                Shape::from(m.dims()[0])
            }
            OpKind::DotProduct => {
                expect_rank(inputs[0], 1)?;
                same_shape(inputs[0], inputs[1])?;
                Shape::from(())
            }
            OpKind::ReduceSum | OpKind::ReduceMean => {
                let axis = self.axis(inputs[0])?;
                inputs[0].without_axis(axis)
            }
        };
        Ok(Some(shape))
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            OpKind::ReduceSum | OpKind::ReduceMean => write!(f, "{:?}({})", self.kind, self.arg),
            kind => write!(f, "{:?}", kind),
        }
    }
}

fn same_shape(a: &Shape, b: &Shape) -> Result<()> {
    if a != b {
        return Err(Error::ShapeMismatch {
            expected: a.clone(),
            got: b.clone(),
        });
    }
    Ok(())
}

fn expect_rank(s: &Shape, rank: usize) -> Result<()> {
    if s.rank() != rank {
        return Err(Error::msg(format!(
            "expected a rank-{} operand, got shape {}",
            rank, s
        )));
    }
    Ok(())
}
