use thiserror::Error;

use crate::backend::BackendError;
use crate::layout::Layout;

/// Failure of a split-convolution call. Every variant aborts the whole call.
#[derive(Debug, Error)]
pub enum SplitConvError {
    /// Channel counts not divisible by the split factors, or tensors with the wrong geometry.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("input tensor must be in {expected} layout, got {found}")]
    Layout { expected: Layout, found: Layout },
    #[error("invalid split convolution config: {0}")]
    Config(String),
    /// Propagated verbatim from the backend primitive that failed.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl SplitConvError {
    pub(crate) fn shape(message: impl Into<String>) -> Self {
        SplitConvError::ShapeMismatch(message.into())
    }
}

pub type SplitConvResult<T> = Result<T, SplitConvError>;
