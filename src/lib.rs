//! A strided, multi-dimensional storage engine with a pluggable backend
//! registry.
//!
//! This crate is the storage layer beneath a tensor/autograd stack, not the
//! stack itself: it has no notion of a compute graph, gradients, or an
//! optimizer. What it does provide is everything those layers build on top
//! of — [`Layout`](layout::Layout) (shape, strides, broadcasting, reshape,
//! transpose), a [`Backend`](backend::Backend) protocol that element-type
//! and device variants implement (only `cpu_f32` ships here), a process-wide
//! [`backend_registry`] mapping names to backends, a thread-local
//! [`storage_registry`] that tracks which storages alias the same
//! allocation and frees scoped temporaries on every exit path, and the
//! [`storage`] façade that ties all of the above into the public operations
//! (`init`, `view`, `transpose`, `reshape`, `contiguous`, `gemm`, `axpy`,
//! `reduce`, `free`).
//!
//! Call [`init_library`] once before touching anything else; [`cleanup_library`]
//! tears the registries back down. Both are idempotent.

pub mod backend;
pub mod backend_registry;
pub mod cpu_backend;
pub mod error;
pub mod layout;
pub mod shape;
pub mod storage;
pub mod storage_registry;

pub use error::{Error, ErrorCode, Result};
pub use layout::{Layout, TENSOR_DIM};
pub use shape::Shape;
pub use storage::Storage;

use std::sync::atomic::{AtomicBool, Ordering};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Brings up the backend registry (registering the built-in `cpu_f32`
/// backend) and the storage registry. Re-entrant: a second call is a no-op,
/// matching the reference design's `init_library` contract.
pub fn init_library() -> Result<()> {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    backend_registry::init_builtin_backends()?;
    log::debug!("storage engine initialized");
    Ok(())
}

/// Tears down the storage registry, then the backend registry. Safe to call
/// even if no storage was ever created; any storage still registered at
/// this point leaks its backend buffer rather than being force-freed, since
/// cleanup does not know which handles the caller still holds.
pub fn cleanup_library() {
    if !INITIALIZED.swap(false, Ordering::SeqCst) {
        return;
    }
    storage_registry::cleanup();
    backend_registry::cleanup();
    log::debug!("storage engine cleaned up");
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::SeqCst)
}
