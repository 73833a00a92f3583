use std::fmt;
use std::ops::Mul;

// Shape — N-dimensional shape of a graph tensor
//
// A Shape is an ordered list of dimension sizes. Unlike a general tensor
// library there is no rank-0 shape: an empty list normalizes to `[1]`, so a
// scalar and a one-element vector are the same thing.
//
//   - Scalar: Shape([])      → [1]
//   - Vector: Shape([5])     → 5 elements
//   - Matrix: Shape([3, 4])  → 12 elements
//
// Gradients are stored in Jacobian form, so shapes also concatenate:
//
//   [2, 3] ⊗ [1]  = [2, 3, 1]   (d output[1] / d A[2,3])
//
// The first half indexes the source node, the second half the target output.

/// N-dimensional shape of a tensor node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a new shape. An empty list becomes `[1]`.
    pub fn new(dims: Vec<usize>) -> Self {
        if dims.is_empty() {
            Shape(vec![1])
        } else {
            Shape(dims)
        }
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions (always >= 1).
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements (product of all dimensions).
    pub fn size(&self) -> usize {
        self.0.iter().product()
    }

    /// Size of a specific dimension, if it exists.
    pub fn dim(&self, d: usize) -> Option<usize> {
        self.0.get(d).copied()
    }

    /// Jacobian block shape: the dims of `self` followed by the dims of `other`.
    pub fn concat(&self, other: &Shape) -> Shape {
        let mut dims = Vec::with_capacity(self.rank() + other.rank());
        dims.extend_from_slice(&self.0);
        dims.extend_from_slice(&other.0);
        Shape(dims)
    }

    /// The shape with dimension `axis` removed (normalized to `[1]` if empty).
    pub fn without_axis(&self, axis: usize) -> Shape {
        let dims = self
            .0
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != axis)
            .map(|(_, &d)| d)
            .collect();
        Shape::new(dims)
    }

    /// Split the shape around `axis` into (outer, axis, inner) element counts.
    ///
    /// For `[2, 3, 4]` and axis 1 this is `(2, 3, 4)`; for axis 0 it is
    /// `(1, 2, 12)`. Reduction kernels walk memory with exactly these three
    /// loops.
    pub fn split_at_axis(&self, axis: usize) -> (usize, usize, usize) {
        let outer = self.0[..axis].iter().product();
        let inner = self.0[axis + 1..].iter().product();
        (outer, self.0[axis], inner)
    }
}

impl Mul for &Shape {
    type Output = Shape;

    /// `a * b` is the Jacobian shape `a ⊗ b`.
    fn mul(self, rhs: &Shape) -> Shape {
        self.concat(rhs)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

// Convenient From implementations
// These let you write: Shape::from((3, 4)) instead of Shape::new(vec![3, 4])

impl From<()> for Shape {
    /// Scalar shape, `[1]`.
    fn from(_: ()) -> Self {
        Shape::new(vec![])
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape::new(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape::new(s.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_normalizes() {
        let s = Shape::from(());
        assert_eq!(s.dims(), &[1]);
        assert_eq!(s.rank(), 1);
        assert_eq!(s.size(), 1);
        assert_eq!(Shape::new(vec![]), Shape::from(1));
    }

    #[test]
    fn test_matrix_size() {
        let s = Shape::from((3, 4));
        assert_eq!(s.rank(), 2);
        assert_eq!(s.size(), 12);
        assert_eq!(s.dim(1), Some(4));
        assert_eq!(s.dim(2), None);
    }

    #[test]
    fn test_concat() {
        let a = Shape::from((2, 3));
        let b = Shape::from(1);
        assert_eq!(&a * &b, Shape::from((2, 3, 1)));
        assert_eq!((&a * &b).size(), 6);
    }

    #[test]
    fn test_without_axis() {
        let s = Shape::from((2, 3, 4));
        assert_eq!(s.without_axis(1), Shape::from((2, 4)));
        assert_eq!(Shape::from(3).without_axis(0), Shape::from(1));
    }

    #[test]
    fn test_split_at_axis() {
        let s = Shape::from((2, 3, 4));
        assert_eq!(s.split_at_axis(0), (1, 2, 12));
        assert_eq!(s.split_at_axis(1), (2, 3, 4));
        assert_eq!(s.split_at_axis(2), (6, 4, 1));
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Shape::from((3, 4))), "[3, 4]");
    }
}
