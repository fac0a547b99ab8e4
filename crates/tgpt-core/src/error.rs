use crate::dtype::DType;

/// Errors produced by tensor operations and the layers built on them.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TgptError {
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("dimension {dim} is not divisible into {heads} heads")]
    DimensionMismatch { dim: usize, heads: usize },

    #[error("cannot broadcast shapes {a:?} and {b:?}")]
    BroadcastError { a: Vec<usize>, b: Vec<usize> },

    #[error("matmul dimension mismatch: [{m}, {k1}] @ [{k2}, {n}]")]
    MatmulDimMismatch { m: usize, k1: usize, k2: usize, n: usize },

    #[error("cannot reshape {numel} elements into {shape:?}")]
    InvalidReshape { numel: usize, shape: Vec<isize> },

    #[error("axis {axis} out of range for {ndim}-d tensor")]
    InvalidAxis { axis: isize, ndim: usize },

    #[error("unsupported dtype {0}")]
    UnsupportedDType(DType),

    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    #[error("index {index} out of range for size {size}")]
    IndexOutOfRange { index: i64, size: usize },

    #[error("index {0} is not a whole number")]
    NonIntegralIndex(f32),

    #[error("{0} used before configure()")]
    NotConfigured(String),

    #[error("unknown activation '{0}'")]
    UnknownActivation(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("storage error: {0}")]
    StorageError(String),
}
