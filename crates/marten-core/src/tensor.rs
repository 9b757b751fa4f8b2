use crate::dtype::Float;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::shape::Shape;
use crate::storage::Storage;

// Tensor — Strided view over shared storage
//
// A Tensor pairs a Layout (shape + strides + offset) with a shared Storage.
// View operations (select, narrow, transpose, permute, unfold) clone the
// storage handle and rewrite the layout — no element is copied, and writes
// through a view are visible through every other view of the same storage.
//
// MEMORY MODEL:
//
//   Storage is reference-counted (Arc). A view can never outlive the data
//   it looks at: the last handle keeps the buffer alive. Storage only ever
//   grows, so a view's offset stays valid across resizes of sibling views.
//
// MUTATION MODEL:
//
//   There is no autograd graph here: tensors are plain data, and the
//   forward/backward passes of the module layer call the bulk operations
//   below explicitly. Every mutating operation snapshots its sources before
//   taking the write lock, so operating on two views of the same storage
//   (e.g. mirroring a border row onto another row of the same map) is safe.

/// Strided n-dimensional view over shared element storage.
pub struct Tensor<T: Float> {
    storage: Storage<T>,
    layout: Layout,
}

impl<T: Float> Clone for Tensor<T> {
    /// Cheap view clone: shares storage, copies the layout.
    fn clone(&self) -> Self {
        Tensor {
            storage: self.storage.clone(),
            layout: self.layout.clone(),
        }
    }
}

impl<T: Float> std::fmt::Debug for Tensor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(shape={}, strides={:?}, offset={})",
            self.layout.shape(),
            self.layout.strides(),
            self.layout.offset(),
        )
    }
}

impl<T: Float> Tensor<T> {
    // Constructors

    /// Allocate a zero-filled tensor with its own storage.
    pub fn new(shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        shape.check_alloc()?;
        let storage = Storage::new(shape.elem_count());
        Ok(Tensor {
            storage,
            layout: Layout::contiguous(shape),
        })
    }

    /// Create a tensor from a flat slice in logical (row-major) order.
    pub fn from_slice(data: &[T], shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        shape.check_alloc()?;
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        Ok(Tensor {
            storage: Storage::from_vec(data.to_vec()),
            layout: Layout::contiguous(shape),
        })
    }

    /// Create a tensor viewing existing storage through an explicit layout.
    /// Grows the storage if the layout reaches past its current end.
    pub fn from_storage(storage: Storage<T>, layout: Layout) -> Self {
        storage.grow_to(layout.required_len());
        Tensor { storage, layout }
    }

    /// Zero-filled tensor with the same shape as `other` (own storage).
    pub fn zeros_like(other: &Self) -> Result<Self> {
        Tensor::new(other.shape().clone())
    }

    // Accessors

    pub fn shape(&self) -> &Shape {
        self.layout.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.layout.dims()
    }

    pub fn order(&self) -> usize {
        self.layout.order()
    }

    pub fn elem_count(&self) -> usize {
        self.layout.elem_count()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn storage(&self) -> &Storage<T> {
        &self.storage
    }

    pub fn is_contiguous(&self) -> bool {
        self.layout.is_contiguous()
    }

    /// Whether two tensors share the same storage allocation.
    pub fn aliases(&self, other: &Tensor<T>) -> bool {
        self.storage.ptr_eq(&other.storage)
    }

    // Views (zero-copy, storage shared)

    /// Fix dimension `dim` to `index`; order drops by one.
    pub fn select(&self, dim: usize, index: usize) -> Result<Self> {
        Ok(Tensor {
            storage: self.storage.clone(),
            layout: self.layout.select(dim, index)?,
        })
    }

    /// Restrict dimension `dim` to `len` entries starting at `start`.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        Ok(Tensor {
            storage: self.storage.clone(),
            layout: self.layout.narrow(dim, start, len)?,
        })
    }

    /// Swap two dimensions.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self> {
        Ok(Tensor {
            storage: self.storage.clone(),
            layout: self.layout.transpose(dim0, dim1)?,
        })
    }

    /// Reorder all dimensions.
    pub fn permute(&self, perm: &[usize]) -> Result<Self> {
        Ok(Tensor {
            storage: self.storage.clone(),
            layout: self.layout.permute(perm)?,
        })
    }

    /// Overlapping sliding-window view along `dim` (see [`Layout::unfold`]).
    pub fn unfold(&self, dim: usize, size: usize, step: usize) -> Result<Self> {
        Ok(Tensor {
            storage: self.storage.clone(),
            layout: self.layout.unfold(dim, size, step)?,
        })
    }

    // Resizing

    /// Resize in place to `shape`, which must have the same order.
    ///
    /// A no-op when the dimensions are unchanged. Growth extends the
    /// backing storage (zero-filled); the storage itself never shrinks, so
    /// sibling views stay valid. The tensor becomes contiguous from its
    /// current offset.
    pub fn resize(&mut self, shape: impl Into<Shape>) -> Result<()> {
        let shape = shape.into();
        if shape.dims() == self.dims() {
            return Ok(());
        }
        if shape.order() != self.order() {
            return Err(Error::OrderChange {
                from: self.order(),
                to: shape.order(),
            });
        }
        shape.check_alloc()?;
        let layout = Layout::contiguous_at(shape, self.layout.offset());
        self.storage.grow_to(layout.required_len());
        self.layout = layout;
        Ok(())
    }

    // Element access

    fn check_index(&self, index: &[usize]) -> Result<()> {
        let dims = self.dims();
        if index.len() != dims.len() || index.iter().zip(dims.iter()).any(|(&i, &d)| i >= d) {
            return Err(Error::IndexOutOfBounds {
                index: index.to_vec(),
                dims: dims.to_vec(),
            });
        }
        Ok(())
    }

    /// Read one element, bounds-checked.
    pub fn get(&self, index: &[usize]) -> Result<T> {
        self.check_index(index)?;
        let flat = self.layout.flat_index(index);
        Ok(self.storage.read()[flat])
    }

    /// Write one element, bounds-checked.
    pub fn set(&mut self, index: &[usize], value: T) -> Result<()> {
        self.check_index(index)?;
        let flat = self.layout.flat_index(index);
        self.storage.write()[flat] = value;
        Ok(())
    }

    // Bulk operations
    //
    // All of these walk the layout's strided indices, so they are correct on
    // any view. Sources are snapshotted to a Vec before the write lock is
    // taken; two views of one storage never deadlock or read half-written
    // data.

    /// All elements in logical order.
    pub fn to_vec(&self) -> Vec<T> {
        let data = self.storage.read();
        self.layout.strided_indices().map(|i| data[i]).collect()
    }

    /// Overwrite all elements from a flat slice in logical order.
    pub fn assign(&mut self, values: &[T]) -> Result<()> {
        if values.len() != self.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: self.elem_count(),
                got: values.len(),
                shape: self.shape().clone(),
            });
        }
        let mut data = self.storage.write();
        for (i, v) in self.layout.strided_indices().zip(values.iter()) {
            data[i] = *v;
        }
        Ok(())
    }

    /// Set every element to `value`.
    pub fn fill(&mut self, value: T) {
        let mut data = self.storage.write();
        for i in self.layout.strided_indices() {
            data[i] = value;
        }
    }

    /// Set every element to zero.
    pub fn clear(&mut self) {
        self.fill(T::ZERO);
    }

    fn check_same_count(&self, other: &Tensor<T>) -> Result<()> {
        if self.elem_count() != other.elem_count() {
            return Err(Error::ShapeMismatch {
                expected: self.shape().clone(),
                got: other.shape().clone(),
            });
        }
        Ok(())
    }

    /// Copy `src`'s elements into self (same element count; shapes may
    /// differ, elements pair up in logical order).
    pub fn copy_from(&mut self, src: &Tensor<T>) -> Result<()> {
        self.check_same_count(src)?;
        let values = src.to_vec();
        self.assign(&values)
    }

    /// self += other (element-wise, logical order pairing).
    pub fn add_assign(&mut self, other: &Tensor<T>) -> Result<()> {
        self.accumulate_map(other, |v| v)
    }

    /// self += alpha * other.
    pub fn add_scaled(&mut self, other: &Tensor<T>, alpha: T) -> Result<()> {
        self.accumulate_map(other, |v| v * alpha)
    }

    /// self[i] += f(src[i]).
    pub fn accumulate_map(&mut self, src: &Tensor<T>, f: impl Fn(T) -> T) -> Result<()> {
        self.check_same_count(src)?;
        let values = src.to_vec();
        let mut data = self.storage.write();
        for (i, v) in self.layout.strided_indices().zip(values.into_iter()) {
            data[i] += f(v);
        }
        Ok(())
    }

    /// self[i] += f(a[i], b[i]) — the accumulate form used by backward
    /// passes of element-wise operators.
    pub fn accumulate_zip(
        &mut self,
        a: &Tensor<T>,
        b: &Tensor<T>,
        f: impl Fn(T, T) -> T,
    ) -> Result<()> {
        self.check_same_count(a)?;
        self.check_same_count(b)?;
        let av = a.to_vec();
        let bv = b.to_vec();
        let mut data = self.storage.write();
        for ((i, x), y) in self
            .layout
            .strided_indices()
            .zip(av.into_iter())
            .zip(bv.into_iter())
        {
            data[i] += f(x, y);
        }
        Ok(())
    }

    /// self[i] = f(src[i]) — the map form used by forward passes of
    /// element-wise operators.
    pub fn map_from(&mut self, src: &Tensor<T>, f: impl Fn(T) -> T) -> Result<()> {
        self.check_same_count(src)?;
        let values = src.to_vec();
        let mut data = self.storage.write();
        for (i, v) in self.layout.strided_indices().zip(values.into_iter()) {
            data[i] = f(v);
        }
        Ok(())
    }

    /// Multiply every element by `alpha`.
    pub fn scale(&mut self, alpha: T) {
        let mut data = self.storage.write();
        for i in self.layout.strided_indices() {
            data[i] *= alpha;
        }
    }

    /// Add `c` to every element.
    pub fn add_scalar(&mut self, c: T) {
        let mut data = self.storage.write();
        for i in self.layout.strided_indices() {
            data[i] += c;
        }
    }

    /// Flattened inner product: sum over self[i] * other[i] in logical
    /// order. Shapes may differ as long as element counts match — this is
    /// what makes convolution-as-dot-over-unfolds work.
    pub fn dot(&self, other: &Tensor<T>) -> Result<T> {
        self.check_same_count(other)?;
        if self.storage.ptr_eq(&other.storage) {
            // Same storage: snapshot one side, a single read lock is not
            // re-entrant for two iterators over one guard.
            let ov = other.to_vec();
            let data = self.storage.read();
            let mut acc = T::ZERO;
            for (i, v) in self.layout.strided_indices().zip(ov.into_iter()) {
                acc += data[i] * v;
            }
            return Ok(acc);
        }
        let a = self.storage.read();
        let b = other.storage.read();
        let mut acc = T::ZERO;
        for (i, j) in self
            .layout
            .strided_indices()
            .zip(other.layout.strided_indices())
        {
            acc += a[i] * b[j];
        }
        Ok(acc)
    }

    /// Sum of all elements.
    pub fn sum(&self) -> T {
        let data = self.storage.read();
        let mut acc = T::ZERO;
        for i in self.layout.strided_indices() {
            acc += data[i];
        }
        acc
    }

    /// Largest absolute element value (0 for an empty view).
    pub fn max_abs(&self) -> T {
        let data = self.storage.read();
        let mut m = T::ZERO;
        for i in self.layout.strided_indices() {
            let v = data[i].abs();
            if v > m {
                m = v;
            }
        }
        m
    }

    // Copies

    /// Allocate fresh storage and copy all elements. Mutations of the copy
    /// never propagate back.
    pub fn deep_copy(&self) -> Result<Self> {
        let mut t = Tensor::new(self.shape().clone())?;
        t.assign(&self.to_vec())?;
        Ok(t)
    }

    /// Copy-convert to another element type.
    pub fn cast<U: Float>(&self) -> Result<Tensor<U>> {
        let values: Vec<U> = self
            .to_vec()
            .into_iter()
            .map(|v| U::from_f64(v.to_f64()))
            .collect();
        Tensor::from_slice(&values, self.shape().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iota(shape: impl Into<Shape>) -> Tensor<f64> {
        let shape = shape.into();
        let data: Vec<f64> = (0..shape.elem_count()).map(|i| i as f64).collect();
        Tensor::from_slice(&data, shape).unwrap()
    }

    #[test]
    fn test_new_rejects_bad_shapes() {
        assert!(Tensor::<f64>::new(Shape::new(vec![1; 9])).is_err());
        assert!(Tensor::<f64>::new((2, 0)).is_err());
        assert!(Tensor::<f64>::new((2, 3)).is_ok());
    }

    #[test]
    fn test_get_set_bounds() {
        let mut t = Tensor::<f64>::new((2, 3)).unwrap();
        t.set(&[1, 2], 5.0).unwrap();
        assert_eq!(t.get(&[1, 2]).unwrap(), 5.0);
        assert!(t.get(&[2, 0]).is_err());
        assert!(t.get(&[0]).is_err());
        assert!(t.set(&[0, 3], 1.0).is_err());
    }

    #[test]
    fn test_views_alias_storage() {
        // Mutating through a view must be visible through the original.
        let mut t = iota((2, 3));
        let mut row = t.select(0, 1).unwrap();
        row.set(&[0], 100.0).unwrap();
        assert_eq!(t.get(&[1, 0]).unwrap(), 100.0);

        let mut col = t.transpose(0, 1).unwrap();
        col.set(&[2, 0], -1.0).unwrap();
        assert_eq!(t.get(&[0, 2]).unwrap(), -1.0);

        let mut nar = t.narrow(1, 1, 2).unwrap();
        nar.fill(9.0);
        assert_eq!(t.get(&[0, 1]).unwrap(), 9.0);
        assert_eq!(t.get(&[1, 2]).unwrap(), 9.0);
        assert!(t.aliases(&nar));
    }

    #[test]
    fn test_deep_copy_does_not_alias() {
        let t = iota((2, 2));
        let mut c = t.deep_copy().unwrap();
        c.fill(0.0);
        assert_eq!(t.get(&[0, 1]).unwrap(), 1.0);
        assert!(!t.aliases(&c));
    }

    #[test]
    fn test_unfold_dot_is_windowed_sum() {
        // [1,2,3,4,5] unfolded to 3-windows, dotted with ones → window sums
        let t = Tensor::from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0], 5).unwrap();
        let u = t.unfold(0, 3, 1).unwrap();
        let ones = Tensor::from_slice(&[1.0, 1.0, 1.0], 3).unwrap();
        let w0 = u.select(0, 0).unwrap().dot(&ones).unwrap();
        let w2 = u.select(0, 2).unwrap().dot(&ones).unwrap();
        assert_eq!(w0, 6.0);
        assert_eq!(w2, 12.0);
    }

    #[test]
    fn test_resize_noop_and_grow() {
        let mut t = iota((2, 3));
        let before = t.to_vec();
        t.resize((2, 3)).unwrap();
        assert_eq!(t.to_vec(), before);

        t.resize((4, 3)).unwrap();
        assert_eq!(t.dims(), &[4, 3]);
        assert_eq!(t.elem_count(), 12);
        // Order change is forbidden in place.
        assert!(t.resize(12).is_err());
    }

    #[test]
    fn test_resize_never_shrinks_storage() {
        let mut t = iota((4, 3));
        t.resize((2, 3)).unwrap();
        assert!(t.storage().len() >= 12);
    }

    #[test]
    fn test_copy_from_and_accumulate() {
        let a = iota((2, 2));
        let mut b = Tensor::<f64>::new((2, 2)).unwrap();
        b.copy_from(&a).unwrap();
        assert_eq!(b.to_vec(), vec![0.0, 1.0, 2.0, 3.0]);
        b.add_scaled(&a, 2.0).unwrap();
        assert_eq!(b.to_vec(), vec![0.0, 3.0, 6.0, 9.0]);
        b.accumulate_zip(&a, &a, |x, y| x * y).unwrap();
        assert_eq!(b.to_vec(), vec![0.0, 4.0, 10.0, 18.0]);
    }

    #[test]
    fn test_copy_between_views_of_same_storage() {
        // Mirror-style copy: row 0 onto row 2 of the same tensor.
        let t = iota((3, 2));
        let src = t.select(0, 0).unwrap();
        let mut dst = t.select(0, 2).unwrap();
        dst.copy_from(&src).unwrap();
        assert_eq!(t.to_vec(), vec![0.0, 1.0, 2.0, 3.0, 0.0, 1.0]);
    }

    #[test]
    fn test_dot_mismatch() {
        let a = iota((2, 2));
        let b = iota((2, 3));
        assert!(a.dot(&b).is_err());
    }

    #[test]
    fn test_cast() {
        let a = iota((2, 2));
        let b: Tensor<f32> = a.cast().unwrap();
        assert_eq!(b.to_vec(), vec![0.0f32, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_sum_max_abs() {
        let t = Tensor::from_slice(&[-3.0, 1.0, 2.0], 3).unwrap();
        assert_eq!(t.sum(), 0.0);
        assert_eq!(t.max_abs(), 3.0);
    }
}
