use crate::shape::Shape;

/// All errors that can occur within gradus.
///
/// Every variant describes a broken call contract (bad shapes, bad indices,
/// unsupported backend operations). They are detected before any buffer is
/// touched, so an `Err` never leaves a tensor half-written.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two shapes that must be equal are not (e.g. assigning a [2,2] slice into a [3,2] region).
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Operand shapes cannot be broadcast against each other.
    #[error("shapes {lhs} and {rhs} are not broadcast-compatible")]
    BroadcastMismatch { lhs: Shape, rhs: Shape },

    /// Operation requires a specific rank (number of dimensions).
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// Axis index out of range for the tensor's rank.
    #[error("axis out of range: axis {axis} for tensor with {rank} dimensions")]
    AxisOutOfRange { axis: usize, rank: usize },

    /// A concrete index is outside the size of its axis.
    #[error("index out of range: index {index} on axis {axis} of size {size}")]
    IndexOutOfRange { index: isize, axis: usize, size: usize },

    /// A range slice exceeds the size of its axis.
    #[error("slice out of bounds: {start}..{end} on axis {axis} of size {size}")]
    SliceOutOfBounds {
        axis: usize,
        start: usize,
        end: usize,
        size: usize,
    },

    /// A slice has more entries than the tensor has axes.
    #[error("slice has {got} entries but tensor has rank {rank}")]
    SliceRankMismatch { got: usize, rank: usize },

    /// Tried to read a scalar from a tensor whose shape is not [].
    #[error("not a scalar: tensor has shape {shape}")]
    NotAScalar { shape: Shape },

    /// Element count mismatch when creating from a vec.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Matrix multiplication inner dimensions differ.
    #[error("matmul shape mismatch: [{m}x{k1}] @ [{k2}x{n}], inner dims must match")]
    MatmulShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    /// Cannot reshape because element counts differ.
    #[error(
        "cannot reshape: source has {src} elements, target shape {dst_shape} has {dst} elements"
    )]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    /// Axis arrangement is not a permutation of 0..rank.
    #[error("invalid permutation {perm:?} for tensor with {rank} dimensions")]
    InvalidPermutation { perm: Vec<usize>, rank: usize },

    /// The backend does not implement this operation.
    #[error("{op} is not available on the {backend} backend")]
    Unsupported { op: &'static str, backend: String },

    /// A buffer lock was poisoned by a panicking thread.
    #[error("buffer lock poisoned")]
    LockPoisoned,

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

/// Convenience Result type used throughout gradus.
pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted error message.
/// Usage: `bail!("cannot pad axis {}", axis)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
