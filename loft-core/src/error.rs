//! Error types for the lowering core.
//!
//! Every pass reports failures through a single `CompilerError` enum.
//! Internal-invariant violations (hoist failures, unexpected post-
//! simplification shapes, write conflicts) indicate a bug in an earlier
//! pass; they carry a short tag and a pretty-printed offending term and
//! are never user-recoverable.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CompilerError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompilerError {
    /// Loop lowering failed (for -> seq, destination threading).
    #[error("Lowering error: {0}")]
    LowerError(String),

    /// Imp translation failed (allocation, switch, handle lowering).
    #[error("Imp error: {0}")]
    ImpError(String),

    /// A vectorization invariant was violated. Refusals are not errors;
    /// this is raised only for genuine conflicts (e.g. divergent writes
    /// through a uniform reference).
    #[error("Vectorization error: {0}")]
    VectorizeError(String),

    /// Index algebra could not express a size or offset symbolically.
    #[error("Algebra error: {0}")]
    AlgebraError(String),

    /// A compiler invariant was violated. Always a bug in an earlier pass.
    #[error("Internal error ({tag}): {msg}")]
    InternalError { tag: &'static str, msg: String },
}

/// Construct a `LowerError` with format args.
#[macro_export]
macro_rules! err_lower {
    ($($arg:tt)*) => {
        $crate::error::CompilerError::LowerError(format!($($arg)*))
    };
}

/// Construct an `ImpError` with format args.
#[macro_export]
macro_rules! err_imp {
    ($($arg:tt)*) => {
        $crate::error::CompilerError::ImpError(format!($($arg)*))
    };
}

/// Construct a `VectorizeError` with format args.
#[macro_export]
macro_rules! err_vectorize {
    ($($arg:tt)*) => {
        $crate::error::CompilerError::VectorizeError(format!($($arg)*))
    };
}

/// Construct an `AlgebraError` with format args.
#[macro_export]
macro_rules! err_algebra {
    ($($arg:tt)*) => {
        $crate::error::CompilerError::AlgebraError(format!($($arg)*))
    };
}

/// Construct an `InternalError` with a short tag and format args.
#[macro_export]
macro_rules! err_internal {
    ($tag:expr, $($arg:tt)*) => {
        $crate::error::CompilerError::InternalError {
            tag: $tag,
            msg: format!($($arg)*),
        }
    };
}
