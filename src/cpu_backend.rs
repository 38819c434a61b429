//! The built-in `cpu_f32` backend: single-precision, host-memory storage.
//!
//! The interesting kernel here is [`copy_contiguous`], which implements the
//! block-detection strategy from the storage engine's design: it finds the
//! longest trailing run of axes that are already contiguous in memory and
//! copies that run in one shot per outer index, rather than walking every
//! element one at a time.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand_distr::{Distribution, StandardNormal};

use crate::backend::{Backend, BackendBuffer};
use crate::error::{Error, Result};
use crate::layout::{Layout, TENSOR_DIM};
use crate::shape::Shape;

pub const CPU_F32_BACKEND_NAME: &str = "cpu_f32";

#[derive(Debug)]
pub struct CpuF32Buffer {
    data: Rc<RefCell<Vec<f32>>>,
    layout: Layout,
}

impl CpuF32Buffer {
    fn as_cpu(buffer: &dyn BackendBuffer) -> Result<&Self> {
        buffer
            .as_any()
            .downcast_ref::<Self>()
            .ok_or_else(|| {
                Error::StorageBackendMismatch {
                    expected: CPU_F32_BACKEND_NAME,
                    got: "unknown",
                }
                .bt()
            })
    }

    fn as_cpu_mut(buffer: &mut dyn BackendBuffer) -> Result<&mut Self> {
        buffer
            .as_any_mut()
            .downcast_mut::<Self>()
            .ok_or_else(|| {
                Error::StorageBackendMismatch {
                    expected: CPU_F32_BACKEND_NAME,
                    got: "unknown",
                }
                .bt()
            })
    }
}

impl BackendBuffer for CpuF32Buffer {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn layout(&self) -> &Layout {
        &self.layout
    }

    fn clone_handle(&self) -> Box<dyn BackendBuffer> {
        Box::new(Self {
            data: Rc::clone(&self.data),
            layout: self.layout,
        })
    }
}

/// Row-major odometer over a (possibly left-padded) fixed-rank shape.
struct IndexIter {
    shape: [usize; TENSOR_DIM],
    next: Option<[usize; TENSOR_DIM]>,
}

impl IndexIter {
    fn new(shape: [usize; TENSOR_DIM]) -> Self {
        Self {
            shape,
            next: Some([0; TENSOR_DIM]),
        }
    }
}

impl Iterator for IndexIter {
    type Item = [usize; TENSOR_DIM];

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        let mut advanced = current;
        let mut i = TENSOR_DIM;
        self.next = loop {
            if i == 0 {
                break None;
            }
            i -= 1;
            advanced[i] += 1;
            if advanced[i] < self.shape[i] {
                break Some(advanced);
            }
            advanced[i] = 0;
            if i == 0 {
                break None;
            }
        };
        Some(current)
    }
}

fn offset_of(idx: &[usize; TENSOR_DIM], strides: &[isize; TENSOR_DIM]) -> isize {
    idx.iter().zip(strides.iter()).map(|(&i, &s)| i as isize * s).sum()
}

#[derive(Debug)]
pub struct CpuF32Backend {
    num_threads: AtomicUsize,
}

impl CpuF32Backend {
    /// Resolves the worker-thread count the way the wider ecosystem this
    /// backend ships alongside does: an explicit override first, then
    /// `RAYON_NUM_THREADS`, then the number of logical CPUs.
    pub fn new() -> Self {
        let threads = std::env::var("RAYON_NUM_THREADS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or_else(num_cpus::get);
        Self {
            num_threads: AtomicUsize::new(threads.max(1)),
        }
    }

    pub fn with_num_threads(num_threads: usize) -> Self {
        Self {
            num_threads: AtomicUsize::new(num_threads.max(1)),
        }
    }

    fn num_threads(&self) -> usize {
        self.num_threads.load(Ordering::Relaxed)
    }

    /// Returns an owned, regular buffer equivalent to `buffer`: a cheap
    /// handle clone if it is already regular, otherwise a freshly
    /// materialized contiguous copy (logged, since it is a hidden cost).
    fn ensure_regular(&self, buffer: &CpuF32Buffer, context: &str) -> Result<CpuF32Buffer> {
        if buffer.layout.is_regular() {
            return Ok(CpuF32Buffer {
                data: Rc::clone(&buffer.data),
                layout: buffer.layout,
            });
        }
        log::debug!("{context}: materializing a contiguous copy of a non-regular operand");
        let mut dst = self.init(&buffer.layout.shape())?;
        let dst_buf = CpuF32Buffer::as_cpu_mut(dst.as_mut())?;
        copy_contiguous(buffer, dst_buf)?;
        Ok(CpuF32Buffer {
            data: Rc::clone(&dst_buf.data),
            layout: dst_buf.layout,
        })
    }
}

impl Default for CpuF32Backend {
    fn default() -> Self {
        Self::new()
    }
}

/// Implements the block-detection contiguous copy: the longest trailing
/// run of axes over which `src` is already contiguous-in-memory is copied
/// in single strided vector copies, one per outer index combination.
fn copy_contiguous(src: &CpuF32Buffer, dst: &mut CpuF32Buffer) -> Result<()> {
    if src.layout.size() != dst.layout.size() {
        return Err(Error::StorageShapeMismatch {
            expected: dst.layout.shape(),
            got: src.layout.shape(),
        }
        .bt());
    }
    if !dst.layout.is_contiguous() {
        return Err(Error::StorageLayoutNotContiguous { layout: dst.layout }.bt());
    }

    let shape = *src.layout.dims();
    let strides = *src.layout.strides();

    let mut block_start = TENSOR_DIM - 1;
    let mut block_size = shape[TENSOR_DIM - 1];
    for k in (1..TENSOR_DIM).rev() {
        if strides[k - 1] == shape[k] as isize * strides[k] {
            block_start = k - 1;
            block_size *= shape[k - 1];
        } else {
            break;
        }
    }
    let inner_stride = strides[TENSOR_DIM - 1];

    let src_data = src.data.borrow();
    let mut dst_data = dst.data.borrow_mut();

    let mut outer_shape = [1usize; TENSOR_DIM];
    outer_shape[..block_start].copy_from_slice(&shape[..block_start]);

    let mut dst_cursor = 0usize;
    for outer_idx in IndexIter::new(outer_shape) {
        let base = offset_of(&outer_idx, &strides);
        for j in 0..block_size {
            let src_offset = base + j as isize * inner_stride;
            dst_data[dst_cursor] = src_data[src_offset as usize];
            dst_cursor += 1;
        }
    }
    Ok(())
}

impl Backend for CpuF32Backend {
    fn name(&self) -> &'static str {
        CPU_F32_BACKEND_NAME
    }

    fn element_size(&self) -> usize {
        std::mem::size_of::<f32>()
    }

    fn init(&self, layout: &Layout) -> Result<Box<dyn BackendBuffer>> {
        let size = layout.size();
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| Error::AllocFailed { elem_count: size }.bt())?;
        data.resize(size, 0f32);
        Ok(Box::new(CpuF32Buffer {
            data: Rc::new(RefCell::new(data)),
            layout: *layout,
        }))
    }

    fn free(&self, buffer: Box<dyn BackendBuffer>) -> Result<()> {
        drop(buffer);
        Ok(())
    }

    fn fill(&self, buffer: &mut dyn BackendBuffer, value: f64) -> Result<()> {
        let buffer = CpuF32Buffer::as_cpu_mut(buffer)?;
        let shape = *buffer.layout.dims();
        let strides = *buffer.layout.strides();
        if (0..TENSOR_DIM).any(|i| shape[i] > 1 && strides[i] == 0) {
            return Err(Error::InvalidArgument(
                "fill cannot write through a broadcast (stride-0) axis".into(),
            )
            .bt());
        }
        let value = value as f32;
        let mut data = buffer.data.borrow_mut();
        for idx in IndexIter::new(shape) {
            let offset = offset_of(&idx, &strides);
            data[offset as usize] = value;
        }
        Ok(())
    }

    fn fill_rand(&self, buffer: &mut dyn BackendBuffer) -> Result<()> {
        let buffer = CpuF32Buffer::as_cpu_mut(buffer)?;
        let shape = *buffer.layout.dims();
        let strides = *buffer.layout.strides();
        if (0..TENSOR_DIM).any(|i| shape[i] > 1 && strides[i] == 0) {
            return Err(Error::InvalidArgument(
                "fill_rand cannot write through a broadcast (stride-0) axis".into(),
            )
            .bt());
        }
        let mut rng = rand::thread_rng();
        let mut data = buffer.data.borrow_mut();
        for idx in IndexIter::new(shape) {
            let offset = offset_of(&idx, &strides);
            data[offset as usize] = StandardNormal.sample(&mut rng);
        }
        Ok(())
    }

    fn get(&self, buffer: &dyn BackendBuffer, idx: &[usize]) -> Result<f64> {
        let buffer = CpuF32Buffer::as_cpu(buffer)?;
        let offset = buffer.layout.flat_index(idx)?;
        Ok(buffer.data.borrow()[offset] as f64)
    }

    fn set(&self, buffer: &mut dyn BackendBuffer, idx: &[usize], value: f64) -> Result<()> {
        let buffer = CpuF32Buffer::as_cpu_mut(buffer)?;
        let offset = buffer.layout.flat_index(idx)?;
        buffer.data.borrow_mut()[offset] = value as f32;
        Ok(())
    }

    fn view(&self, src: &dyn BackendBuffer, target_layout: Layout) -> Result<Box<dyn BackendBuffer>> {
        let src = CpuF32Buffer::as_cpu(src)?;
        Ok(Box::new(CpuF32Buffer {
            data: Rc::clone(&src.data),
            layout: target_layout,
        }))
    }

    fn contiguous(&self, src: &dyn BackendBuffer, dst: &mut dyn BackendBuffer) -> Result<()> {
        let src = CpuF32Buffer::as_cpu(src)?;
        let dst = CpuF32Buffer::as_cpu_mut(dst)?;
        copy_contiguous(src, dst)
    }

    fn axpy(&self, alpha: f64, x: &dyn BackendBuffer, y: &mut dyn BackendBuffer) -> Result<()> {
        let x = CpuF32Buffer::as_cpu(x)?;
        let y = CpuF32Buffer::as_cpu_mut(y)?;
        if !y.layout.is_contiguous() {
            return Err(Error::StorageLayoutNotContiguous { layout: y.layout }.bt());
        }
        if x.layout.size() != y.layout.size() {
            return Err(Error::StorageShapeMismatch {
                expected: y.layout.shape(),
                got: x.layout.shape(),
            }
            .bt());
        }
        let x_owned;
        let x_contig: &CpuF32Buffer = if x.layout.is_contiguous() {
            x
        } else {
            log::debug!("axpy: materializing a contiguous copy of a non-contiguous operand");
            let mut tmp = self.init(&x.layout.shape())?;
            let tmp_buf = CpuF32Buffer::as_cpu_mut(tmp.as_mut())?;
            copy_contiguous(x, tmp_buf)?;
            x_owned = CpuF32Buffer {
                data: Rc::clone(&tmp_buf.data),
                layout: tmp_buf.layout,
            };
            &x_owned
        };
        let alpha = alpha as f32;
        if Rc::ptr_eq(&x_contig.data, &y.data) {
            // `x` and `y` alias the same buffer (e.g. `axpy(alpha, &t, &t,
            // None)`): borrowing `x_contig.data` and `y.data` mutably at the
            // same time would panic on one shared `RefCell`, so snapshot
            // `x`'s values first and drop that borrow before taking `y`'s.
            let snapshot: Vec<f32> = x_contig.data.borrow().clone();
            let mut y_data = y.data.borrow_mut();
            for (i, v) in snapshot.into_iter().enumerate() {
                y_data[i] += alpha * v;
            }
        } else {
            let x_data = x_contig.data.borrow();
            let mut y_data = y.data.borrow_mut();
            for i in 0..y.layout.size() {
                y_data[i] += alpha * x_data[i];
            }
        }
        Ok(())
    }

    fn gemm(
        &self,
        alpha: f64,
        a: &dyn BackendBuffer,
        b: &dyn BackendBuffer,
        beta: f64,
        c: &mut dyn BackendBuffer,
    ) -> Result<()> {
        let a = CpuF32Buffer::as_cpu(a)?;
        let b = CpuF32Buffer::as_cpu(b)?;
        let c = CpuF32Buffer::as_cpu_mut(c)?;

        let a_regular = self.ensure_regular(a, "gemm")?;
        let b_regular = self.ensure_regular(b, "gemm")?;

        let a_shape = *a_regular.layout.dims();
        let b_shape = *b_regular.layout.dims();
        let c_shape = *c.layout.dims();
        let a_strides = *a_regular.layout.strides();
        let b_strides = *b_regular.layout.strides();
        let c_strides = *c.layout.strides();

        let m = a_shape[TENSOR_DIM - 2];
        let k = a_shape[TENSOR_DIM - 1];
        let k2 = b_shape[TENSOR_DIM - 2];
        let n = b_shape[TENSOR_DIM - 1];
        if k != k2 {
            return Err(Error::StorageShapeMismatch {
                expected: a_regular.layout.shape(),
                got: b_regular.layout.shape(),
            }
            .bt());
        }
        if c_shape[TENSOR_DIM - 2] != m || c_shape[TENSOR_DIM - 1] != n {
            return Err(Error::StorageShapeMismatch {
                expected: Shape::from((m, n)),
                got: c.layout.shape(),
            }
            .bt());
        }

        let mut batch_shape = [1usize; TENSOR_DIM];
        batch_shape[..TENSOR_DIM - 2].copy_from_slice(&c_shape[..TENSOR_DIM - 2]);

        let a_rs = a_strides[TENSOR_DIM - 2];
        let a_cs = a_strides[TENSOR_DIM - 1];
        let b_rs = b_strides[TENSOR_DIM - 2];
        let b_cs = b_strides[TENSOR_DIM - 1];
        let c_rs = c_strides[TENSOR_DIM - 2];
        let c_cs = c_strides[TENSOR_DIM - 1];

        let a_data = a_regular.data.borrow();
        let b_data = b_regular.data.borrow();
        let mut c_data = c.data.borrow_mut();

        let read_dst = beta != 0.0;
        let nthreads = self.num_threads();

        for batch_idx in IndexIter::new(batch_shape) {
            let a_off = offset_of(&batch_idx, &a_strides);
            let b_off = offset_of(&batch_idx, &b_strides);
            let c_off = offset_of(&batch_idx, &c_strides);
            unsafe {
                let a_ptr = a_data.as_ptr().offset(a_off);
                let b_ptr = b_data.as_ptr().offset(b_off);
                let c_ptr = c_data.as_mut_ptr().offset(c_off);
                // gemm's `alpha` scales the pre-existing destination and
                // `beta` scales the product, the mirror image of this
                // crate's `C = alpha*(A*B) + beta*C` convention.
                gemm::gemm(
                    m,
                    n,
                    k,
                    c_ptr,
                    c_cs,
                    c_rs,
                    read_dst,
                    a_ptr,
                    a_cs,
                    a_rs,
                    b_ptr,
                    b_cs,
                    b_rs,
                    beta as f32,
                    alpha as f32,
                    false,
                    false,
                    false,
                    gemm::Parallelism::Rayon(nthreads),
                );
            }
        }
        Ok(())
    }

    fn print(&self, buffer: &dyn BackendBuffer) -> Result<String> {
        const PREVIEW_BUDGET: usize = 32;
        let buffer = CpuF32Buffer::as_cpu(buffer)?;
        let shape = buffer.layout.shape();
        let strides = *buffer.layout.strides();
        let dims = *buffer.layout.dims();
        let data = buffer.data.borrow();
        let mut preview = Vec::new();
        for idx in IndexIter::new(dims).take(PREVIEW_BUDGET) {
            let offset = offset_of(&idx, &strides);
            preview.push(data[offset as usize]);
        }
        let truncated = buffer.layout.size() > PREVIEW_BUDGET;
        Ok(format!(
            "CpuF32Storage(shape={:?}, preview={:?}{})",
            shape.dims(),
            preview,
            if truncated { ", .." } else { "" }
        ))
    }
}
