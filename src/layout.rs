//! Shape, strides, and the purely geometric transforms over them.
//!
//! Every [`Layout`] is fixed-rank: it always carries exactly [`TENSOR_DIM`]
//! dimensions, with ranks smaller than that left-padded by `shape=1,
//! stride=0`. This keeps the type `Copy`-friendly (no heap allocation for a
//! layout) and lets every downstream kernel iterate a known-size array
//! instead of a slice of unknown length.

use crate::error::{Error, Result};
use crate::shape::Shape;

/// Maximum supported rank. Left-padding absorbs any lower-rank tensor into
/// this fixed width.
pub const TENSOR_DIM: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    shape: [usize; TENSOR_DIM],
    strides: [isize; TENSOR_DIM],
    size: usize,
}

impl Layout {
    /// Builds a row-major contiguous layout for `shape`, left-padded to
    /// [`TENSOR_DIM`]. Rejects ranks over `TENSOR_DIM` and zero extents.
    pub fn new(shape: &Shape) -> Result<Self> {
        shape.check()?;
        let dims = shape.dims();
        let pad = TENSOR_DIM - dims.len();
        let mut full_shape = [1usize; TENSOR_DIM];
        full_shape[pad..].copy_from_slice(dims);
        let mut strides = [0isize; TENSOR_DIM];
        let mut acc: isize = 1;
        for i in (0..TENSOR_DIM).rev() {
            strides[i] = if full_shape[i] == 1 && i < pad {
                0
            } else {
                acc
            };
            acc *= full_shape[i] as isize;
        }
        Ok(Self {
            shape: full_shape,
            strides,
            size: full_shape.iter().product(),
        })
    }

    /// Rebuilds a layout directly from already-padded shape/stride arrays.
    /// Used by transforms that need to hand back a layout with strides that
    /// are not the canonical row-major ones (broadcast axes, views, ...).
    pub(crate) fn from_parts(shape: [usize; TENSOR_DIM], strides: [isize; TENSOR_DIM]) -> Self {
        Self {
            shape,
            strides,
            size: shape.iter().product(),
        }
    }

    pub fn dims(&self) -> &[usize; TENSOR_DIM] {
        &self.shape
    }

    pub fn strides(&self) -> &[isize; TENSOR_DIM] {
        &self.strides
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The full, left-padded shape as a dynamic [`Shape`]. Used for
    /// diagnostics; callers that track the pre-padding rank themselves
    /// should keep their own [`Shape`] rather than round-trip through this.
    pub fn shape(&self) -> Shape {
        Shape::from(self.shape.to_vec())
    }

    /// `Σ idx[i] · strides[i]`, right-aligning `idx` against the trailing
    /// axes and left-padding with zero. Fails with
    /// [`Error::StorageLayoutIndexOutOfBounds`] if any supplied coordinate is
    /// out of range for its axis.
    pub fn flat_index(&self, idx: &[usize]) -> Result<usize> {
        if idx.len() > TENSOR_DIM {
            return Err(Error::InvalidArgument(format!(
                "index of rank {} exceeds TENSOR_DIM {}",
                idx.len(),
                TENSOR_DIM
            ))
            .bt());
        }
        let pad = TENSOR_DIM - idx.len();
        let mut offset: isize = 0;
        for i in 0..idx.len() {
            let axis = pad + i;
            if idx[i] >= self.shape[axis] {
                return Err(Error::StorageLayoutIndexOutOfBounds {
                    idx: idx.to_vec(),
                    shape: self.shape(),
                }
                .bt());
            }
            offset += idx[i] as isize * self.strides[axis];
        }
        debug_assert!(offset >= 0, "flat offsets must not go negative");
        Ok(offset as usize)
    }

    /// Row-major, no gaps: `strides[D-1] == 1` and
    /// `strides[i] == strides[i+1] * shape[i+1]`, skipping any axis of
    /// extent 1 (its stride is irrelevant to addressing).
    pub fn is_contiguous(&self) -> bool {
        let mut acc: isize = 1;
        for i in (0..TENSOR_DIM).rev() {
            if self.shape[i] == 1 {
                continue;
            }
            if self.strides[i] != acc {
                return false;
            }
            acc *= self.shape[i] as isize;
        }
        true
    }

    /// No negative strides on any axis of extent > 1, and no two axes whose
    /// addressable ranges overlap. Broadcast axes (extent > 1, stride 0) are
    /// permitted: they are not self-overlapping, they simply repeat.
    pub fn is_regular(&self) -> bool {
        let mut axes: Vec<(usize, isize)> = (0..TENSOR_DIM)
            .filter(|&i| self.shape[i] > 1 && self.strides[i] != 0)
            .map(|i| (self.shape[i], self.strides[i]))
            .collect();
        if axes.iter().any(|&(_, s)| s < 0) {
            return false;
        }
        axes.sort_by_key(|&(_, s)| s);
        let mut min_next_stride: usize = 1;
        for (extent, stride) in axes {
            let stride = stride as usize;
            if stride < min_next_stride {
                return false;
            }
            min_next_stride = stride * extent;
        }
        true
    }

    /// The inclusive `[min, max]` range of offsets this layout can address.
    fn offset_bounds(&self) -> (isize, isize) {
        let mut lo: isize = 0;
        let mut hi: isize = 0;
        for i in 0..TENSOR_DIM {
            if self.shape[i] <= 1 {
                continue;
            }
            let span = (self.shape[i] as isize - 1) * self.strides[i];
            if span >= 0 {
                hi += span;
            } else {
                lo += span;
            }
        }
        (lo, hi)
    }

    /// True iff every offset `inner` can address is also an offset `outer`
    /// can address, i.e. a view built with `inner`'s layout stays within the
    /// allocation `outer` describes.
    pub fn is_contained_in(outer: &Layout, inner: &Layout) -> bool {
        let (outer_lo, outer_hi) = outer.offset_bounds();
        let (inner_lo, inner_hi) = inner.offset_bounds();
        inner_lo >= outer_lo && inner_hi <= outer_hi
    }

    /// Permutes the trailing `perm.len()` axes of both shape and strides.
    /// `perm` must be a permutation of `0..perm.len()`, indexed so that
    /// `perm[i]` names which of the trailing axes ends up at position `i`.
    pub fn transpose(&self, perm: &[usize]) -> Result<Self> {
        let ndim = perm.len();
        if ndim > TENSOR_DIM {
            return Err(Error::InvalidArgument(format!(
                "permutation of rank {ndim} exceeds TENSOR_DIM {TENSOR_DIM}"
            ))
            .bt());
        }
        let mut seen = vec![false; ndim];
        for &p in perm {
            if p >= ndim || seen[p] {
                return Err(Error::InvalidArgument(format!(
                    "{perm:?} is not a permutation of 0..{ndim}"
                ))
                .bt());
            }
            seen[p] = true;
        }
        let pad = TENSOR_DIM - ndim;
        let mut shape = self.shape;
        let mut strides = self.strides;
        for i in 0..ndim {
            let src = pad + perm[i];
            shape[pad + i] = self.shape[src];
            strides[pad + i] = self.strides[src];
        }
        Ok(Self::from_parts(shape, strides))
    }

    /// Reshapes to `new_dims`, accepting a single `-1` placeholder that is
    /// solved so the product matches `size`. Succeeds without copying data
    /// when the source is contiguous, or when the source is regular and the
    /// reshape can be expressed as merges/splits of its existing contiguous
    /// runs; otherwise fails with [`Error::NotImplemented`] so the façade can
    /// fall back to materializing a contiguous copy first.
    pub fn reshape(&self, new_dims: &[isize]) -> Result<Self> {
        if new_dims.len() > TENSOR_DIM {
            return Err(Error::InvalidArgument(format!(
                "reshape target of rank {} exceeds TENSOR_DIM {TENSOR_DIM}",
                new_dims.len()
            ))
            .bt());
        }
        let mut placeholder: Option<usize> = None;
        let mut known_product: usize = 1;
        for (i, &d) in new_dims.iter().enumerate() {
            if d == -1 {
                if placeholder.is_some() {
                    return Err(
                        Error::InvalidArgument("at most one -1 entry is allowed".into()).bt(),
                    );
                }
                placeholder = Some(i);
            } else if d < 0 {
                return Err(Error::InvalidArgument(format!("invalid dimension {d}")).bt());
            } else {
                known_product *= d as usize;
            }
        }
        let mut resolved: Vec<usize> = new_dims
            .iter()
            .map(|&d| if d == -1 { 0 } else { d as usize })
            .collect();
        if let Some(ph) = placeholder {
            if known_product == 0 || self.size % known_product != 0 {
                return Err(Error::InvalidArgument(format!(
                    "cannot infer -1 for size {} with known product {known_product}",
                    self.size
                ))
                .bt());
            }
            resolved[ph] = self.size / known_product;
        } else if known_product != self.size {
            return Err(Error::InvalidArgument(format!(
                "reshape size mismatch: {known_product} != {}",
                self.size
            ))
            .bt());
        }

        let target_shape = Shape::from(resolved.clone());
        if self.is_contiguous() {
            return Layout::new(&target_shape);
        }
        if !self.is_regular() {
            return Err(Error::NotImplemented(
                "reshape of a non-regular layout requires materializing a contiguous copy".into(),
            )
            .bt());
        }
        // Trim degenerate leading axes so the merge/split algorithm below
        // works over the logical (non-padded) dims only.
        let first_real = self.shape.iter().position(|&d| d != 1).unwrap_or(TENSOR_DIM - 1);
        let old_shape = &self.shape[first_real..];
        let old_strides = &self.strides[first_real..];
        match compute_view_strides(old_shape, old_strides, &resolved) {
            Some(new_strides) => {
                let pad = TENSOR_DIM - resolved.len();
                let mut shape = [1usize; TENSOR_DIM];
                let mut strides = [0isize; TENSOR_DIM];
                shape[pad..].copy_from_slice(&resolved);
                strides[pad..].copy_from_slice(&new_strides);
                Ok(Self::from_parts(shape, strides))
            }
            None => Err(Error::NotImplemented(
                "reshape cannot be expressed as a view of this layout".into(),
            )
            .bt()),
        }
    }

    /// Mutates `a` and `b` in place to a common shape over the `[start,
    /// end)` axis range. Unequal extents are reconciled only when one side
    /// is `1`, in which case that side becomes a broadcast axis (shape set
    /// to the other side's extent, stride set to 0).
    pub fn broadcast(a: &mut Layout, b: &mut Layout, start: usize, end: usize) -> Result<()> {
        if end > TENSOR_DIM || start > end {
            return Err(Error::InvalidArgument(format!(
                "invalid broadcast range [{start}, {end})"
            ))
            .bt());
        }
        for i in start..end {
            let sa = a.shape[i];
            let sb = b.shape[i];
            if sa == sb {
                continue;
            } else if sa == 1 {
                a.shape[i] = sb;
                a.strides[i] = 0;
            } else if sb == 1 {
                b.shape[i] = sa;
                b.strides[i] = 0;
            } else {
                return Err(Error::StorageLayoutShapeMismatch {
                    lhs: a.shape(),
                    rhs: b.shape(),
                }
                .bt());
            }
        }
        a.size = a.shape.iter().product();
        b.size = b.shape.iter().product();
        Ok(())
    }

    /// Collapses every axis marked in `mask` (right-aligned, like
    /// [`Layout::flat_index`]) to extent 1, and returns a fresh contiguous
    /// layout of the resulting shape. `mask` carries no strides of its own:
    /// the reduced layout is always a brand-new, densely packed allocation
    /// target, never a view of `self`.
    pub fn reduce(&self, mask: &[bool]) -> Result<Self> {
        if mask.len() > TENSOR_DIM {
            return Err(Error::InvalidArgument(format!(
                "reduce mask of rank {} exceeds TENSOR_DIM {TENSOR_DIM}",
                mask.len()
            ))
            .bt());
        }
        let pad = TENSOR_DIM - mask.len();
        let mut target = self.shape;
        for (i, &masked) in mask.iter().enumerate() {
            if masked {
                target[pad + i] = 1;
            }
        }
        Layout::new(&Shape::from(target.to_vec()))
    }
}

/// Adapts PyTorch's `computeStride` view-ability algorithm: determines
/// whether `new_shape` can be expressed as strides over `old_shape`/
/// `old_strides` without copying, by matching up runs of axes whose element
/// counts multiply out evenly. Returns `None` when no such assignment
/// exists, which the caller maps to "fall back to a contiguous copy".
fn compute_view_strides(
    old_shape: &[usize],
    old_strides: &[isize],
    new_shape: &[usize],
) -> Option<Vec<isize>> {
    let mut new_strides = vec![0isize; new_shape.len()];
    if new_shape.is_empty() {
        return Some(new_strides);
    }
    let mut view_d = new_shape.len() as isize - 1;
    let mut chunk_base_stride = *old_strides.last().unwrap_or(&1);
    let mut tensor_numel: usize = 1;
    let mut view_numel: usize = 1;
    for tensor_d in (0..old_shape.len()).rev() {
        tensor_numel *= old_shape[tensor_d];
        let at_chunk_boundary = tensor_d == 0
            || (old_shape[tensor_d - 1] != 1
                && old_strides[tensor_d - 1] != old_strides[tensor_d] * old_shape[tensor_d] as isize);
        if at_chunk_boundary {
            while view_d >= 0 && (view_numel < tensor_numel || new_shape[view_d as usize] == 1) {
                new_strides[view_d as usize] = view_numel as isize * chunk_base_stride;
                view_numel *= new_shape[view_d as usize];
                view_d -= 1;
            }
            if view_numel != tensor_numel {
                return None;
            }
            if tensor_d > 0 {
                chunk_base_stride = old_strides[tensor_d - 1];
                tensor_numel = 1;
                view_numel = 1;
            }
        }
    }
    if view_d != -1 {
        return None;
    }
    Some(new_strides)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_is_row_major_contiguous() {
        let l = Layout::new(&Shape::from((2, 3, 4))).unwrap();
        assert_eq!(l.size(), 24);
        assert!(l.is_contiguous());
        assert!(l.is_regular());
        assert_eq!(l.strides()[TENSOR_DIM - 1], 1);
        assert_eq!(l.strides()[TENSOR_DIM - 2], 4);
        assert_eq!(l.strides()[TENSOR_DIM - 3], 12);
    }

    #[test]
    fn flat_index_matches_row_major_formula() {
        let l = Layout::new(&Shape::from((2, 3, 4))).unwrap();
        assert_eq!(l.flat_index(&[0, 0, 0]).unwrap(), 0);
        assert_eq!(l.flat_index(&[1, 2, 3]).unwrap(), 1 * 12 + 2 * 4 + 3);
        assert!(l.flat_index(&[2, 0, 0]).is_err());
    }

    #[test]
    fn transpose_round_trips() {
        let l = Layout::new(&Shape::from((2, 3, 4))).unwrap();
        let perm = [0, 2, 1];
        let t = l.transpose(&perm).unwrap();
        assert!(!t.is_contiguous());
        assert!(t.is_regular());
        // Apply the inverse permutation and recover the original layout.
        let mut inverse = [0usize; 3];
        for (i, &p) in perm.iter().enumerate() {
            inverse[p] = i;
        }
        let back = t.transpose(&inverse).unwrap();
        assert_eq!(back, l);
    }

    #[test]
    fn transpose_rejects_bad_permutation() {
        let l = Layout::new(&Shape::from((2, 3))).unwrap();
        assert!(l.transpose(&[0, 0]).is_err());
        assert!(l.transpose(&[0, 2]).is_err());
    }

    #[test]
    fn broadcast_sets_stride_zero_on_the_unit_side() {
        let mut a = Layout::new(&Shape::from((1, 4))).unwrap();
        let mut b = Layout::new(&Shape::from((3, 4))).unwrap();
        Layout::broadcast(&mut a, &mut b, TENSOR_DIM - 2, TENSOR_DIM).unwrap();
        assert_eq!(a.dims()[TENSOR_DIM - 2], 3);
        assert_eq!(a.strides()[TENSOR_DIM - 2], 0);
        assert_eq!(a.size(), 12);
    }

    #[test]
    fn broadcast_is_idempotent() {
        let mut a1 = Layout::new(&Shape::from((1, 4))).unwrap();
        let mut b1 = Layout::new(&Shape::from((3, 4))).unwrap();
        Layout::broadcast(&mut a1, &mut b1, 0, TENSOR_DIM).unwrap();
        let (a1_again, b1_again) = (a1, b1);
        let mut a2 = a1;
        let mut b2 = b1;
        Layout::broadcast(&mut a2, &mut b2, 0, TENSOR_DIM).unwrap();
        assert_eq!(a1_again, a2);
        assert_eq!(b1_again, b2);
    }

    #[test]
    fn broadcast_mismatch_fails() {
        let mut a = Layout::new(&Shape::from((2, 4))).unwrap();
        let mut b = Layout::new(&Shape::from((3, 4))).unwrap();
        assert!(Layout::broadcast(&mut a, &mut b, 0, TENSOR_DIM).is_err());
    }

    #[test]
    fn reshape_on_contiguous_preserves_order() {
        let l = Layout::new(&Shape::from((2, 6))).unwrap();
        let r = l.reshape(&[3, 4]).unwrap();
        assert_eq!(r.size(), 12);
        assert!(r.is_contiguous());
    }

    #[test]
    fn reshape_infers_placeholder() {
        let l = Layout::new(&Shape::from((2, 6))).unwrap();
        let r = l.reshape(&[-1, 4]).unwrap();
        assert_eq!(r.dims()[TENSOR_DIM - 2], 3);
    }

    #[test]
    fn reshape_on_regular_non_contiguous_merges_when_possible() {
        // A row-major layout with every stride scaled by 2 (e.g. a stride-2
        // slice along the flattened buffer): non-contiguous but regular,
        // and the outer two axes are still a mergeable contiguous run.
        let l = Layout::from_parts(
            {
                let mut s = [1usize; TENSOR_DIM];
                s[TENSOR_DIM - 3..].copy_from_slice(&[2, 3, 4]);
                s
            },
            {
                let mut s = [0isize; TENSOR_DIM];
                s[TENSOR_DIM - 3..].copy_from_slice(&[24, 8, 2]);
                s
            },
        );
        assert!(!l.is_contiguous());
        assert!(l.is_regular());
        let r = l.reshape(&[6, 4]).unwrap();
        assert_eq!(r.size(), 24);
        assert_eq!(r.dims()[TENSOR_DIM - 2], 6);
        assert_eq!(r.strides()[TENSOR_DIM - 2], 8);
        assert_eq!(r.strides()[TENSOR_DIM - 1], 2);
    }

    #[test]
    fn reshape_on_transposed_non_mergeable_falls_to_not_implemented() {
        let l = Layout::new(&Shape::from((2, 3, 4))).unwrap();
        let t = l.transpose(&[1, 0, 2]).unwrap(); // shape (3, 2, 4), strides (4, 12, 1)
        assert!(t.reshape(&[3, 8]).is_err());
    }

    #[test]
    fn reshape_rejects_size_mismatch() {
        let l = Layout::new(&Shape::from((2, 6))).unwrap();
        assert!(l.reshape(&[5, 2]).is_err());
    }

    #[test]
    fn reduce_collapses_masked_axes() {
        let l = Layout::new(&Shape::from((2, 3))).unwrap();
        let r = l.reduce(&[false, true]).unwrap();
        assert_eq!(r.dims()[TENSOR_DIM - 2], 2);
        assert_eq!(r.dims()[TENSOR_DIM - 1], 1);
        assert_eq!(r.size(), 2);
    }

    #[test]
    fn is_contained_in_checks_offset_bounds() {
        let outer = Layout::new(&Shape::from((4, 4))).unwrap();
        let inner = outer.transpose(&[1, 0]).unwrap();
        assert!(Layout::is_contained_in(&outer, &inner));
        let too_big = Layout::new(&Shape::from((4, 5))).unwrap();
        assert!(!Layout::is_contained_in(&outer, &too_big));
    }
}
