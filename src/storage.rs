//! The public storage façade: the operations every caller actually uses.
//!
//! Every composite operation ([`gemm`], [`axpy`], [`reduce`]) opens a
//! [`Scope`] before building any intermediate view or temporary buffer, and
//! exempts its output from that scope just before returning. `Scope`'s
//! `Drop` impl is the thing that makes this safe on every exit path,
//! including the ones that happen in the middle via `?`: whatever is still
//! tracked when the scope drops gets freed there and then.

use std::sync::Arc;

use uuid::Uuid;

use crate::backend::{Backend, BackendBuffer};
use crate::backend_registry;
use crate::cpu_backend::CPU_F32_BACKEND_NAME;
use crate::error::{Error, Result};
use crate::layout::{Layout, TENSOR_DIM};
use crate::shape::Shape;
use crate::storage_registry;

/// A handle to a backend-owned allocation plus the layout currently
/// describing it. Two `Storage` values that alias the same allocation (one
/// produced the other via [`view`], [`transpose`], or a view-form
/// [`reshape`]) are independent values here, but share membership in one
/// alias bucket in the storage registry.
#[derive(Debug)]
pub struct Storage {
    uuid: Uuid,
    backend: Arc<dyn Backend>,
    buffer: Box<dyn BackendBuffer>,
}

impl Storage {
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn layout(&self) -> Layout {
        *self.buffer.layout()
    }

    pub fn shape(&self) -> Shape {
        self.buffer.layout().shape()
    }

    pub fn get(&self, idx: &[usize]) -> Result<f64> {
        self.backend.get(self.buffer.as_ref(), idx)
    }

    pub fn set(&mut self, idx: &[usize], value: f64) -> Result<()> {
        self.backend.set(self.buffer.as_mut(), idx, value)
    }

    pub fn fill(&mut self, value: f64) -> Result<()> {
        self.backend.fill(self.buffer.as_mut(), value)
    }

    pub fn fill_rand(&mut self) -> Result<()> {
        self.backend.fill_rand(self.buffer.as_mut())
    }

    pub fn print(&self) -> Result<String> {
        self.backend.print(self.buffer.as_ref())
    }

    pub fn bucket_size(&self) -> Result<usize> {
        storage_registry::bucket_size(self.uuid)
    }
}

/// Closes a recording scope unconditionally when dropped, freeing whatever
/// transients are still tracked. Errors encountered while freeing cannot be
/// propagated from `Drop`, so they are logged rather than returned; this is
/// the one place this crate accepts "log and continue" over `Result`.
struct Scope(u64);

impl Scope {
    fn open() -> Self {
        Self(storage_registry::start_recording())
    }

    fn exempt(&self, storage: &Storage) {
        if let Err(err) = storage_registry::record_remove(self.0, storage.uuid) {
            log::warn!("failed to exempt storage {} from its recording scope: {err}", storage.uuid);
        }
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        match storage_registry::stop_recording(self.0) {
            Ok(uuids) => {
                for uuid in uuids {
                    if let Err(err) = free_by_uuid(uuid) {
                        log::error!("failed to free transient storage {uuid}: {err}");
                    }
                }
            }
            Err(err) => log::error!("failed to close recording scope: {err}"),
        }
    }
}

fn free_by_uuid(uuid: Uuid) -> Result<()> {
    if let Some(freed) = storage_registry::deregister(uuid)? {
        freed.backend.free(freed.buffer)?;
    }
    Ok(())
}

/// Allocates a new, zero-initialized root storage of `shape` on the named
/// backend.
pub fn init(shape: &Shape, backend_name: &str) -> Result<Storage> {
    let backend = backend_registry::get(backend_name)?;
    let layout = Layout::new(shape)?;
    let buffer = backend.init(&layout)?;
    let uuid = Uuid::new_v4();
    storage_registry::register_root(uuid, Arc::clone(&backend), buffer.clone_handle());
    Ok(Storage { uuid, backend, buffer })
}

/// A child storage aliasing `src`'s buffer under `target_layout` (or
/// `src`'s own layout, if `None`). `target_layout`, when given, must only
/// address offsets `src`'s own layout can address.
pub fn view(src: &Storage, target_layout: Option<Layout>) -> Result<Storage> {
    let target_layout = match target_layout {
        Some(l) => {
            if !Layout::is_contained_in(&src.layout(), &l) {
                return Err(Error::StorageLayoutShapeMismatch {
                    lhs: src.layout().shape(),
                    rhs: l.shape(),
                }
                .bt());
            }
            l
        }
        None => src.layout(),
    };
    let buffer = src.backend.view(src.buffer.as_ref(), target_layout)?;
    let uuid = Uuid::new_v4();
    storage_registry::register_child(uuid, src.uuid)?;
    Ok(Storage {
        uuid,
        backend: Arc::clone(&src.backend),
        buffer,
    })
}

/// A view of `src` with its trailing `perm.len()` axes permuted.
pub fn transpose(src: &Storage, perm: &[usize]) -> Result<Storage> {
    let transposed = src.layout().transpose(perm)?;
    view(src, Some(transposed))
}

/// A contiguous copy of `src`: a cheap aliasing view if `src` is already
/// contiguous, otherwise a freshly allocated root with the data copied in.
pub fn contiguous(src: &Storage) -> Result<Storage> {
    if src.layout().is_contiguous() {
        return view(src, None);
    }
    let mut dst = init(&src.shape(), src.backend_name())?;
    src.backend.contiguous(src.buffer.as_ref(), dst.buffer.as_mut())?;
    Ok(dst)
}

/// Reshapes `src` to `new_dims` (one `-1` entry allowed). A view when the
/// reshape can be expressed without copying; otherwise materializes a
/// contiguous copy and reshapes that copy's own layout in place.
///
/// The non-mergeable fallback must not register a second, child handle atop
/// `contig`: `contig` is already the sole root naming its freshly allocated
/// buffer, so the reshaped result is `contig` itself with its layout
/// replaced, not a view of it. A child view here would leave `contig`'s
/// uuid — the only handle the bucket can ever reach size 0 through —
/// stranded with no caller able to free it.
pub fn reshape(src: &Storage, new_dims: &[isize]) -> Result<Storage> {
    match src.layout().reshape(new_dims) {
        Ok(new_layout) => view(src, Some(new_layout)),
        Err(_) => {
            let mut contig = contiguous(src)?;
            let new_layout = contig.layout().reshape(new_dims)?;
            contig.buffer = contig.backend.view(contig.buffer.as_ref(), new_layout)?;
            Ok(contig)
        }
    }
}

/// `c = alpha*(a*b) + beta*c`, batched over every leading axis the trailing
/// `(m,k)x(k,n)` dims do not cover. `a` and `b`'s leading `TENSOR_DIM - 2`
/// axes are broadcast against each other first. If `c` is `None`, a fresh
/// contiguous output is allocated; otherwise the supplied storage is
/// validated and accumulated into.
pub fn gemm(alpha: f64, a: &Storage, b: &Storage, beta: f64, c: Option<Storage>) -> Result<Storage> {
    let scope = Scope::open();

    let mut a_layout = a.layout();
    let mut b_layout = b.layout();
    Layout::broadcast(&mut a_layout, &mut b_layout, 0, TENSOR_DIM - 2)?;
    let a_view = view(a, Some(a_layout))?;
    let b_view = view(b, Some(b_layout))?;

    let m = a_layout.dims()[TENSOR_DIM - 2];
    let k = a_layout.dims()[TENSOR_DIM - 1];
    let n = b_layout.dims()[TENSOR_DIM - 1];
    if b_layout.dims()[TENSOR_DIM - 2] != k {
        return Err(Error::StorageShapeMismatch {
            expected: a_layout.shape(),
            got: b_layout.shape(),
        }
        .bt());
    }
    let mut target_dims = *a_layout.dims();
    target_dims[TENSOR_DIM - 2] = m;
    target_dims[TENSOR_DIM - 1] = n;
    let target_shape = Shape::from(target_dims.to_vec());

    let mut c = match c {
        Some(existing) => {
            if existing.shape() != target_shape {
                return Err(Error::StorageShapeMismatch {
                    expected: target_shape,
                    got: existing.shape(),
                }
                .bt());
            }
            if !existing.layout().is_contiguous() {
                return Err(Error::NotImplemented("gemm output must be contiguous".into()).bt());
            }
            existing
        }
        None => init(&target_shape, a.backend_name())?,
    };

    a.backend.gemm(alpha, a_view.buffer.as_ref(), b_view.buffer.as_ref(), beta, c.buffer.as_mut())?;

    scope.exempt(&c);
    Ok(c)
}

/// `r += alpha*x` (broadcasting `x` and `y` against each other over every
/// axis first). If `r` is `None`: when `y` needs no broadcast expansion and
/// is already contiguous, the accumulation happens in place on a view of
/// `y` (`r == y` in the reference design's terms); otherwise a fresh
/// contiguous buffer is allocated and `y`'s (broadcast) values are copied
/// in before accumulating.
pub fn axpy(alpha: f64, x: &Storage, y: &Storage, r: Option<Storage>) -> Result<Storage> {
    let scope = Scope::open();

    let y_layout_before = y.layout();
    let mut x_layout = x.layout();
    let mut y_layout = y.layout();
    Layout::broadcast(&mut x_layout, &mut y_layout, 0, TENSOR_DIM)?;
    let x_view = view(x, Some(x_layout))?;
    let target_shape = y_layout.shape();

    let in_place_on_y = r.is_none() && y_layout == y_layout_before && y_layout_before.is_contiguous();

    let mut r = match r {
        Some(existing) => {
            if existing.shape() != target_shape {
                return Err(Error::StorageShapeMismatch {
                    expected: target_shape,
                    got: existing.shape(),
                }
                .bt());
            }
            if !existing.layout().is_contiguous() {
                return Err(Error::StorageLayoutNotContiguous { layout: existing.layout() }.bt());
            }
            existing
        }
        None if in_place_on_y => view(y, None)?,
        None => init(&target_shape, x.backend_name())?,
    };

    if !in_place_on_y {
        let y_view = view(y, Some(y_layout))?;
        x.backend.contiguous(y_view.buffer.as_ref(), r.buffer.as_mut())?;
    }
    x.backend.axpy(alpha, x_view.buffer.as_ref(), r.buffer.as_mut())?;

    scope.exempt(&r);
    Ok(r)
}

/// A fresh contiguous storage of shape `(n, 1)` filled with `1.0`, the
/// building block [`reduce`] uses to turn a sum along an axis into a
/// matrix-vector product.
pub(crate) fn ones(n: usize, backend_name: &str) -> Result<Storage> {
    let mut storage = init(&Shape::from((n, 1)), backend_name)?;
    storage.fill(1.0)?;
    Ok(storage)
}

/// A fresh contiguous, rank-0 storage (a single element) filled with
/// `value`.
pub(crate) fn scalar(value: f64, backend_name: &str) -> Result<Storage> {
    let mut storage = init(&Shape::from(()), backend_name)?;
    storage.fill(value)?;
    Ok(storage)
}

/// `alpha * sum(a, axis=mask)`, expressed as a transpose (reduced axes
/// last) + reshape to `(kept, summed)` + a matmul against a column of ones.
/// `r` mirrors [`gemm`]'s optional-output parameter; it is always
/// `Err(Error::NotImplemented)` here (likewise any nonzero `beta`), since
/// accumulating into a pre-existing output is not supported (see this
/// crate's design notes) — the parameters still exist so the signature
/// matches the one this operation is specified against.
pub fn reduce(alpha: f64, a: &Storage, mask: &[bool], beta: f64, r: Option<Storage>) -> Result<Storage> {
    if r.is_some() || beta != 0.0 {
        return Err(Error::NotImplemented(
            "reduce does not support accumulating into a pre-existing output".into(),
        )
        .bt());
    }

    let scope = Scope::open();

    let target_layout = a.layout().reduce(mask)?;
    let rank = mask.len();
    let pad = TENSOR_DIM - rank;
    let dims = *a.layout().dims();

    let mut perm: Vec<usize> = (0..rank).filter(|&i| !mask[i]).collect();
    perm.extend((0..rank).filter(|&i| mask[i]));

    let permuted = transpose(a, &perm)?;
    let kept_size: usize = (0..rank).filter(|&i| !mask[i]).map(|i| dims[pad + i]).product::<usize>().max(1);
    let summed_size: usize = (0..rank).filter(|&i| mask[i]).map(|i| dims[pad + i]).product::<usize>().max(1);

    let flattened = reshape(&permuted, &[kept_size as isize, summed_size as isize])?;
    let ones_vec = ones(summed_size, a.backend_name())?;
    let summed = gemm(alpha, &flattened, &ones_vec, 0.0, None)?;

    let target_dims: Vec<isize> = target_layout.dims()[pad..].iter().map(|&d| d as isize).collect();
    let result = reshape(&summed, &target_dims)?;

    scope.exempt(&result);
    Ok(result)
}

/// The root handle of `storage`'s alias bucket: a fresh view over the same
/// buffer at the root's own layout.
pub fn get_root(storage: &Storage) -> Result<Storage> {
    let (root_uuid, backend, buffer) = storage_registry::root_handle(storage.uuid)?;
    Ok(Storage {
        uuid: root_uuid,
        backend,
        buffer,
    })
}

/// Releases `storage`. If it is the last member of its alias bucket, the
/// backend buffer is freed; otherwise only this handle's membership is
/// released and the buffer lives on for its siblings.
pub fn free(storage: Storage) -> Result<()> {
    free_by_uuid(storage.uuid)
}

pub(crate) fn default_backend_name() -> &'static str {
    CPU_F32_BACKEND_NAME
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() {
        crate::init_library().unwrap();
    }

    #[test]
    fn init_then_fill_then_get() {
        setup();
        let mut s = init(&Shape::from((2, 3, 4, 5)), CPU_F32_BACKEND_NAME).unwrap();
        s.fill(7.5).unwrap();
        assert_eq!(s.get(&[0, 0, 0, 0]).unwrap(), 7.5);
        assert_eq!(s.get(&[0, 1, 2, 3]).unwrap(), 7.5);
        free(s).unwrap();
    }

    #[test]
    fn simple_gemm() {
        setup();
        let mut a = init(&Shape::from((2, 3)), CPU_F32_BACKEND_NAME).unwrap();
        let mut b = init(&Shape::from((3, 2)), CPU_F32_BACKEND_NAME).unwrap();
        for (i, v) in [1., 2., 3., 4., 5., 6.].into_iter().enumerate() {
            a.set(&[i / 3, i % 3], v).unwrap();
        }
        for (i, v) in [7., 8., 9., 10., 11., 12.].into_iter().enumerate() {
            b.set(&[i / 2, i % 2], v).unwrap();
        }
        let c = gemm(1.0, &a, &b, 0.0, None).unwrap();
        assert_eq!(c.get(&[0, 0]).unwrap(), 58.0);
        assert_eq!(c.get(&[0, 1]).unwrap(), 64.0);
        assert_eq!(c.get(&[1, 0]).unwrap(), 139.0);
        assert_eq!(c.get(&[1, 1]).unwrap(), 154.0);
        free(a).unwrap();
        free(b).unwrap();
        free(c).unwrap();
    }

    #[test]
    fn reduce_sum_along_each_axis() {
        setup();
        let mut t = init(&Shape::from((2, 3)), CPU_F32_BACKEND_NAME).unwrap();
        for (i, v) in [1., 2., 3., 4., 5., 6.].into_iter().enumerate() {
            t.set(&[i / 3, i % 3], v).unwrap();
        }

        let along_1 = reduce(1.0, &t, &[false, true], 0.0, None).unwrap();
        assert_eq!(along_1.get(&[0, 0]).unwrap(), 6.0);
        assert_eq!(along_1.get(&[1, 0]).unwrap(), 15.0);

        let along_0 = reduce(1.0, &t, &[true, false], 0.0, None).unwrap();
        assert_eq!(along_0.get(&[0, 0]).unwrap(), 5.0);
        assert_eq!(along_0.get(&[0, 1]).unwrap(), 7.0);
        assert_eq!(along_0.get(&[0, 2]).unwrap(), 9.0);

        let total = reduce(1.0, &t, &[true, true], 0.0, None).unwrap();
        assert_eq!(total.get(&[0, 0]).unwrap(), 21.0);

        free(t).unwrap();
        free(along_1).unwrap();
        free(along_0).unwrap();
        free(total).unwrap();
    }

    #[test]
    fn alias_lifetime_survives_partial_frees() {
        setup();
        let mut root = init(&Shape::from((2, 3)), CPU_F32_BACKEND_NAME).unwrap();
        root.fill(1.0).unwrap();
        let v1 = view(&root, None).unwrap();
        let v2 = view(&root, None).unwrap();
        assert_eq!(root.bucket_size().unwrap(), 3);

        free(v1).unwrap();
        assert_eq!(root.get(&[0, 0]).unwrap(), 1.0);
        assert_eq!(v2.get(&[0, 0]).unwrap(), 1.0);

        free(v2).unwrap();
        assert_eq!(root.get(&[0, 0]).unwrap(), 1.0);

        free(root).unwrap();
    }

    #[test]
    fn axpy_defaults_to_in_place_on_a_contiguous_target() {
        setup();
        let mut x = init(&Shape::from((2, 2)), CPU_F32_BACKEND_NAME).unwrap();
        let mut y = init(&Shape::from((2, 2)), CPU_F32_BACKEND_NAME).unwrap();
        x.fill(2.0).unwrap();
        y.fill(10.0).unwrap();
        let r = axpy(3.0, &x, &y, None).unwrap();
        assert_eq!(r.get(&[0, 0]).unwrap(), 16.0);
        assert_eq!(y.get(&[0, 0]).unwrap(), 16.0);
        free(r).unwrap();
        free(x).unwrap();
        free(y).unwrap();
    }
}
