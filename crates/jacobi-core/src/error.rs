use crate::graph::NodeId;
use crate::op::OpKind;
use crate::shape::Shape;

/// All errors that can occur within Jacobi.
///
/// Structural graph errors, shape errors, configuration errors (a missing
/// gradient kernel, a missing dependency record) and execution binding
/// errors all share this one type so that `?` works across crates.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A node id that the graph (or builder) does not know about.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// `make_output` on a node that is not currently internal.
    #[error("node {0} is not internal")]
    NotInternal(NodeId),

    /// `unset_output` on a node that is not currently an output.
    #[error("node {0} is not an output")]
    NotOutput(NodeId),

    /// Shape mismatch, e.g. `add([2,3], [3,2])` or a declared output shape
    /// that disagrees with the inferred one.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Wrong number of inputs for an operation.
    #[error("{op:?} takes {expected} inputs, got {got}")]
    ArityMismatch {
        op: OpKind,
        expected: usize,
        got: usize,
    },

    /// Reduction axis outside the rank of its input.
    #[error("axis {axis} out of range for shape {shape}")]
    InvalidAxis { axis: i32, shape: Shape },

    /// Element count mismatch when creating a tensor from a vec.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// The backend has no gradient-update kernel for an operation kind that
    /// appears in the graph.
    #[error("no gradient kernel registered for {0:?}")]
    KernelNotFound(OpKind),

    /// The dependency analysis has no record for a node that should have one.
    #[error("no dependency record for node {0}")]
    MissingDiffInfo(NodeId),

    /// A graph input was not supplied to `execute`.
    #[error("no tensor supplied for graph input {0}")]
    MissingInput(NodeId),

    /// A data node has no bound tensor.
    #[error("data node {0} has no bound tensor")]
    UnboundData(NodeId),

    /// Gradients were requested from a section built without them.
    #[error("section was built without differentiation")]
    DifferentiationDisabled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }
}

/// Convenience Result type used throughout Jacobi.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
