//! The backend protocol: a vtable of kernels operating over an opaque,
//! backend-owned buffer plus a [`Layout`] describing how to read it.
//!
//! A concrete backend (only [`crate::cpu_backend::CpuF32Backend`] ships with
//! this crate) provides a [`BackendBuffer`] type that carries its own
//! element storage and knows how to clone its handle (sharing the
//! allocation) and downcast itself for backend-specific kernel code. The
//! [`Backend`] trait is the dynamic, name-addressable half of the protocol:
//! it is what the [`crate::backend_registry`] stores and what the storage
//! façade dispatches through, without ever needing to know which concrete
//! element type or device is behind the trait object.

use std::any::Any;
use std::fmt::Debug;

use crate::error::Result;
use crate::layout::Layout;

/// An opaque, backend-owned handle to an allocation plus the layout that
/// currently describes it. Two buffers produced by [`Backend::view`] from
/// the same source share their underlying allocation but are otherwise
/// independent `BackendBuffer` values with their own [`Layout`].
pub trait BackendBuffer: Debug {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn layout(&self) -> &Layout;

    /// Clones the handle, sharing the underlying allocation (reference
    /// counted). This is the Rust analogue of copying a `data*` pointer:
    /// cheap, and it keeps the allocation alive as long as any clone does.
    fn clone_handle(&self) -> Box<dyn BackendBuffer>;
}

/// The function table every backend provides. All methods take/return
/// `f64` scalars at the protocol boundary regardless of the backend's
/// native element width, mirroring how the reference design passes scalars
/// through `α`/`β`/`get`/`set` independent of storage dtype.
pub trait Backend: Send + Sync + Debug {
    /// The name this backend is registered under, e.g. `"cpu_f32"`.
    fn name(&self) -> &'static str;

    /// Advertised size, in bytes, of one element of this backend's native
    /// storage. Informational only: Rust's allocator does not need this to
    /// allocate, but it is part of the protocol's descriptor contract and is
    /// useful for `print`/diagnostics.
    fn element_size(&self) -> usize;

    fn init(&self, layout: &Layout) -> Result<Box<dyn BackendBuffer>>;

    /// Explicit release of a buffer's storage. In Rust this mostly happens
    /// for free when the `Box` drops, but the storage registry calls this
    /// explicitly at the moment a bucket's member count reaches zero so the
    /// lifecycle matches the spec's explicit free-on-last-reference
    /// contract rather than relying on incidental drop timing.
    fn free(&self, buffer: Box<dyn BackendBuffer>) -> Result<()>;

    fn fill(&self, buffer: &mut dyn BackendBuffer, value: f64) -> Result<()>;
    fn fill_rand(&self, buffer: &mut dyn BackendBuffer) -> Result<()>;

    fn get(&self, buffer: &dyn BackendBuffer, idx: &[usize]) -> Result<f64>;
    fn set(&self, buffer: &mut dyn BackendBuffer, idx: &[usize], value: f64) -> Result<()>;

    /// Builds a new handle aliasing `src`'s allocation under `target_layout`.
    fn view(&self, src: &dyn BackendBuffer, target_layout: Layout) -> Result<Box<dyn BackendBuffer>>;

    /// Copies `src` element-for-element (in row-major iteration order) into
    /// `dst`, which must already be allocated, shape-equal, and contiguous.
    fn contiguous(&self, src: &dyn BackendBuffer, dst: &mut dyn BackendBuffer) -> Result<()>;

    /// `y += α·x`. `y` must be contiguous; `x` may carry any layout.
    fn axpy(&self, alpha: f64, x: &dyn BackendBuffer, y: &mut dyn BackendBuffer) -> Result<()>;

    /// `c = α·(a·b) + β·c`, batched over every leading axis the last two
    /// (m,k)×(k,n) dims do not cover.
    fn gemm(
        &self,
        alpha: f64,
        a: &dyn BackendBuffer,
        b: &dyn BackendBuffer,
        beta: f64,
        c: &mut dyn BackendBuffer,
    ) -> Result<()>;

    /// Formats a short, size-capped, row-major preview of `buffer` for
    /// debugging. Never routed through `log` (see the crate's logging
    /// conventions) since it can be expensive and buffers can be large.
    fn print(&self, buffer: &dyn BackendBuffer) -> Result<String>;
}
