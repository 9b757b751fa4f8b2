use crate::shape::Shape;

/// All errors that can occur within marten.
///
/// One error type covers the whole library: shape and order mismatches in the
/// numeric core, protocol violations in the module layer (backward pass after
/// memory optimization, gradient access on a forward-only state), and the
/// matrix-file parsing failures at the serialization boundary. The numeric
/// variants are programmer errors by policy — callers propagate them with `?`
/// up to the top of the run rather than recovering. Only the I/O variants are
/// meant to be caught.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape mismatch between two tensors (e.g., accumulating [2,3] into [4,5]).
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Operation requires a specific order (number of dimensions).
    #[error("order mismatch: expected order {expected}, got {got}")]
    OrderMismatch { expected: usize, got: usize },

    /// Requested tensor order exceeds the supported maximum.
    #[error("order {order} exceeds the maximum supported order {max}")]
    OrderTooLarge { order: usize, max: usize },

    /// A dimension of size zero was requested on an allocating constructor.
    #[error("zero-sized dimension in shape {shape}")]
    ZeroDim { shape: Shape },

    /// Dimension index out of range for the tensor's order.
    #[error("dimension out of range: dim {dim} for tensor of order {order}")]
    DimOutOfRange { dim: usize, order: usize },

    /// Element index out of bounds.
    #[error("index {index:?} out of bounds for dimensions {dims:?}")]
    IndexOutOfBounds { index: Vec<usize>, dims: Vec<usize> },

    /// Narrow/slice operation out of bounds.
    #[error("narrow out of bounds: dim {dim}, start {start}, len {len}, dim size {dim_size}")]
    NarrowOutOfBounds {
        dim: usize,
        start: usize,
        len: usize,
        dim_size: usize,
    },

    /// Unfold window does not fit the dimension.
    #[error("unfold out of bounds: dim {dim}, size {size}, step {step}, dim size {dim_size}")]
    UnfoldOutOfBounds {
        dim: usize,
        size: usize,
        step: usize,
        dim_size: usize,
    },

    /// Element count mismatch between a buffer and a shape.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// `resize` cannot change the order of a tensor in place.
    #[error("resize cannot change order from {from} to {to}")]
    OrderChange { from: usize, to: usize },

    /// Gradient or curvature buffer requested on a forward-only state.
    #[error("state is forward-only: gradient/curvature buffers are forbidden")]
    ForwardOnly,

    /// A backward pass needs a gradient/curvature buffer the state never allocated.
    #[error("state has no {kind} buffer")]
    MissingBuffer { kind: &'static str },

    /// Backward pass invoked on a container that ran in memory-optimized mode.
    #[error("container was memory-optimized: bprop/bbprop are no longer possible")]
    MemoryOptimized,

    /// Propagation through a container with no modules.
    #[error("operation on an empty module container")]
    EmptyContainer,

    /// A connection table entry references a nonexistent feature map.
    #[error("connection table {kind} index {index} out of range ({count} maps)")]
    TableOutOfRange {
        kind: &'static str,
        index: usize,
        count: usize,
    },

    /// Underlying I/O failure while reading or writing a matrix file.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Matrix file magic number does not match any known element type.
    #[error("unknown matrix magic number 0x{magic:08x}")]
    UnknownMagic { magic: u32 },

    /// Matrix file header or payload is structurally invalid.
    #[error("malformed matrix file: {0}")]
    MalformedMatrix(String),

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

/// Convenience Result type used throughout marten.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
