use std::fmt;

use crate::error::{Error, Result};
use crate::shape::Shape;

// Tensor — Dense single-precision buffer with a shape
//
// The graph engine never computes on tensors itself. It allocates them,
// zeroes them and hands them to backend kernels, which read and write the
// raw `f32` buffer in row-major order.
//
// Two kinds of tensors flow through a section:
//
//   - Flow/data tensors — the value of a graph node, shape = node shape.
//   - Gradient tensors  — a Jacobian block d(target)/d(source), shape =
//                         source ⊗ target, laid out as a row-major
//                         [source.size(), target.size()] matrix.
//
// Storage is owned by a TensorArena and addressed by TensorHandle, so several
// logical entries can refer to one buffer without reference counting.

/// A dense, row-major `f32` tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Shape,
    data: Vec<f32>,
}

impl Default for Tensor {
    /// An empty placeholder of shape `[0]`.
    fn default() -> Self {
        Tensor {
            shape: Shape::from(0),
            data: Vec::new(),
        }
    }
}

impl Tensor {
    /// Allocate a zero-filled tensor.
    pub fn zeros(shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        let data = vec![0.0; shape.size()];
        Tensor { shape, data }
    }

    /// Create a tensor from row-major data.
    pub fn from_vec(data: Vec<f32>, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.size() {
            return Err(Error::ElementCountMismatch {
                expected: shape.size(),
                got: data.len(),
                shape,
            });
        }
        Ok(Tensor { shape, data })
    }

    /// Identity Jacobian for a node of shape `half`: shape `half ⊗ half`,
    /// ones where the flattened source index equals the target index.
    pub fn identity(half: &Shape) -> Self {
        let n = half.size();
        let mut t = Tensor::zeros(half * half);
        for i in 0..n {
            t.data[i * n + i] = 1.0;
        }
        t
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw row-major contents.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable raw row-major contents.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Fill with zeros, keeping the allocation.
    pub fn zero(&mut self) {
        self.data.fill(0.0);
    }

    /// Copy `other`'s contents into this tensor. Shapes must match.
    pub fn copy_from(&mut self, other: &Tensor) -> Result<()> {
        if self.dims() != other.dims() {
            return Err(Error::ShapeMismatch {
                expected: self.shape.clone(),
                got: other.shape.clone(),
            });
        }
        self.data.copy_from_slice(&other.data);
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.data.clone()
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor{}{:?}", self.shape(), self.data)
    }
}

// TensorArena — Handle-indexed tensor storage

/// Opaque index of a tensor inside a [`TensorArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorHandle(usize);

/// Owns a set of tensors and hands out integer handles to them.
///
/// Tensors are never freed individually; the arena lives as long as the
/// section (or gradient system) that allocated it.
#[derive(Debug, Default)]
pub struct TensorArena {
    tensors: Vec<Tensor>,
}

impl TensorArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a zero-filled tensor and return its handle.
    pub fn allocate(&mut self, shape: impl Into<Shape>) -> TensorHandle {
        self.insert(Tensor::zeros(shape))
    }

    /// Move an existing tensor into the arena.
    pub fn insert(&mut self, tensor: Tensor) -> TensorHandle {
        self.tensors.push(tensor);
        TensorHandle(self.tensors.len() - 1)
    }

    pub fn get(&self, h: TensorHandle) -> &Tensor {
        &self.tensors[h.0]
    }

    pub fn get_mut(&mut self, h: TensorHandle) -> &mut Tensor {
        &mut self.tensors[h.0]
    }

    pub fn zero(&mut self, h: TensorHandle) {
        self.tensors[h.0].zero();
    }

    /// Borrow one tensor immutably and a different one mutably.
    ///
    /// Panics if `read == write`.
    pub fn pair_mut(&mut self, read: TensorHandle, write: TensorHandle) -> (&Tensor, &mut Tensor) {
        assert_ne!(read, write, "pair_mut on a single handle");
        if read.0 < write.0 {
            let (lo, hi) = self.tensors.split_at_mut(write.0);
            (&lo[read.0], &mut hi[0])
        } else {
            let (lo, hi) = self.tensors.split_at_mut(read.0);
            (&hi[0], &mut lo[write.0])
        }
    }

    /// Temporarily move a tensor out, leaving a placeholder. Pair with [`put`].
    ///
    /// [`put`]: TensorArena::put
    pub fn take(&mut self, h: TensorHandle) -> Tensor {
        std::mem::take(&mut self.tensors[h.0])
    }

    pub fn put(&mut self, h: TensorHandle, tensor: Tensor) {
        self.tensors[h.0] = tensor;
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Total number of `f32` elements held.
    pub fn elem_count(&self) -> usize {
        self.tensors.iter().map(Tensor::len).sum()
    }
}
