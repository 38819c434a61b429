//! The crate's closed error taxonomy.
//!
//! Every public entry point in [`crate`] returns [`Result<T>`]. Each [`Error`]
//! variant corresponds to exactly one code in the closed taxonomy the storage
//! engine is specified against; [`Error::code`] recovers that code, which is
//! useful for callers that want to match on the taxonomy without matching on
//! variant payloads.

use crate::layout::Layout;
use crate::shape::Shape;

/// The closed set of error codes the storage engine can return.
///
/// This mirrors the taxonomy 1:1; `SUCCESS` has no corresponding [`Error`]
/// variant since success is represented by `Ok(_)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NullPointer,
    InvalidArgument,
    AllocFailed,
    NotImplemented,
    BackendRegistryDuplicate,
    BackendRegistryBackendNotFound,
    StorageHandleUninitialized,
    StorageBackendMismatch,
    StorageShapeMismatch,
    StorageLayoutShapeMismatch,
    StorageLayoutIndexOutOfBounds,
    StorageLayoutNotContiguous,
    StorageRegistryParentNotRegistered,
    StorageRegistryRecordNotFound,
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("null pointer: {0}")]
    NullPointer(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("allocation failed for {elem_count} elements")]
    AllocFailed { elem_count: usize },

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("backend '{name}' is already registered")]
    BackendRegistryDuplicate { name: String },

    #[error("no backend registered under the name '{name}'")]
    BackendRegistryBackendNotFound { name: String },

    #[error("storage {uuid} is uninitialized")]
    StorageHandleUninitialized { uuid: uuid::Uuid },

    #[error("backend mismatch: expected '{expected}', got '{got}'")]
    StorageBackendMismatch {
        expected: &'static str,
        got: &'static str,
    },

    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    StorageShapeMismatch { expected: Shape, got: Shape },

    #[error("layout shape mismatch between {lhs:?} and {rhs:?}")]
    StorageLayoutShapeMismatch { lhs: Shape, rhs: Shape },

    #[error("index {idx:?} out of bounds for layout with shape {shape:?}")]
    StorageLayoutIndexOutOfBounds { idx: Vec<usize>, shape: Shape },

    #[error("layout is not contiguous: {layout:?}")]
    StorageLayoutNotContiguous { layout: Layout },

    #[error("parent storage {parent} is not registered")]
    StorageRegistryParentNotRegistered { parent: uuid::Uuid },

    #[error("no recording scope with id {record_id} is active")]
    StorageRegistryRecordNotFound { record_id: u64 },

    /// Free-text diagnostic for internal invariants that should never be
    /// reachable from public inputs. Kept out of the closed taxonomy on
    /// purpose: callers are not expected to match on it.
    #[error("{0}")]
    Msg(String),

    #[error("{inner}\n{backtrace}")]
    WithBacktrace {
        inner: Box<Self>,
        backtrace: Box<std::backtrace::Backtrace>,
    },
}

impl Error {
    pub fn code(&self) -> Option<ErrorCode> {
        use ErrorCode as C;
        match self {
            Self::NullPointer(_) => Some(C::NullPointer),
            Self::InvalidArgument(_) => Some(C::InvalidArgument),
            Self::AllocFailed { .. } => Some(C::AllocFailed),
            Self::NotImplemented(_) => Some(C::NotImplemented),
            Self::BackendRegistryDuplicate { .. } => Some(C::BackendRegistryDuplicate),
            Self::BackendRegistryBackendNotFound { .. } => Some(C::BackendRegistryBackendNotFound),
            Self::StorageHandleUninitialized { .. } => Some(C::StorageHandleUninitialized),
            Self::StorageBackendMismatch { .. } => Some(C::StorageBackendMismatch),
            Self::StorageShapeMismatch { .. } => Some(C::StorageShapeMismatch),
            Self::StorageLayoutShapeMismatch { .. } => Some(C::StorageLayoutShapeMismatch),
            Self::StorageLayoutIndexOutOfBounds { .. } => Some(C::StorageLayoutIndexOutOfBounds),
            Self::StorageLayoutNotContiguous { .. } => Some(C::StorageLayoutNotContiguous),
            Self::StorageRegistryParentNotRegistered { .. } => {
                Some(C::StorageRegistryParentNotRegistered)
            }
            Self::StorageRegistryRecordNotFound { .. } => Some(C::StorageRegistryRecordNotFound),
            Self::Msg(_) => None,
            Self::WithBacktrace { inner, .. } => inner.code(),
        }
    }

    /// Attach a captured backtrace, if backtrace capture is enabled in the
    /// environment. Call sites chain this the way `.bt()` is chained in the
    /// wider tensor-library ecosystem this ships alongside.
    pub fn bt(self) -> Self {
        let backtrace = std::backtrace::Backtrace::capture();
        match backtrace.status() {
            std::backtrace::BacktraceStatus::Disabled
            | std::backtrace::BacktraceStatus::Unsupported => self,
            _ => Self::WithBacktrace {
                inner: Box::new(self),
                backtrace: Box::new(backtrace),
            },
        }
    }
}

/// Terse error construction for internal free-text diagnostics, mirrored
/// after the `bail!` macro used throughout this crate's wider ecosystem.
#[macro_export]
macro_rules! bail {
    ($msg:literal $(,)?) => {
        return Err($crate::Error::Msg(format!($msg)).bt())
    };
    ($err:expr $(,)?) => {
        return Err($crate::Error::Msg($err.to_string()).bt())
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($fmt, $($arg)*)).bt())
    };
}
