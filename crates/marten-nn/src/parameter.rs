use std::path::Path;

use marten_core::{Error, Float, Layout, Result, Shape, Storage, Tensor};

use crate::state::State;

// Parameter — The flat learnable-weights vector
//
// Every learnable module sub-allocates its weight state from a Parameter: a
// triple of flat growable storages (value, gradient, curvature) plus a
// high-water mark. `alloc` hands out a State whose tensors are views into
// those storages at the current mark, then bumps it. Growth is monotonic and
// append-only — storage never shrinks and offsets already handed out stay
// valid — so the whole network's weights are one contiguous vector that an
// optimizer (or a weight file) can address at once.
//
// LIFECYCLE: all allocation happens while the network is being constructed;
// after that the parameter is only read and updated in place. There is no
// locking discipline beyond that because execution is single-threaded.

/// Flat growable backing buffer for the learnable states of a network.
pub struct Parameter<T: Float> {
    x: Storage<T>,
    dx: Storage<T>,
    ddx: Storage<T>,
    footprint: usize,
}

impl<T: Float> Parameter<T> {
    /// An empty parameter; modules grow it as they allocate weights.
    pub fn new() -> Self {
        Parameter {
            x: Storage::new(0),
            dx: Storage::new(0),
            ddx: Storage::new(0),
            footprint: 0,
        }
    }

    /// Current high-water mark: total elements handed out so far.
    pub fn footprint(&self) -> usize {
        self.footprint
    }

    /// Sub-allocate a weight state of the given shape.
    ///
    /// The returned state's x/dx/ddx tensors are views into this
    /// parameter's storages at the current high-water mark.
    pub fn alloc(&mut self, shape: impl Into<Shape>) -> Result<State<T>> {
        let shape = shape.into();
        shape.check_alloc()?;
        let n = shape.elem_count();
        let offset = self.footprint;
        self.x.grow_to(offset + n);
        self.dx.grow_to(offset + n);
        self.ddx.grow_to(offset + n);
        let x = Tensor::from_storage(
            self.x.clone(),
            Layout::contiguous_at(shape.clone(), offset),
        );
        let dx = Tensor::from_storage(
            self.dx.clone(),
            Layout::contiguous_at(shape.clone(), offset),
        );
        let ddx = Tensor::from_storage(self.ddx.clone(), Layout::contiguous_at(shape, offset));
        self.footprint = offset + n;
        State::from_tensors(x, Some(dx), Some(ddx))
    }

    fn flat(&self, storage: &Storage<T>) -> Option<Tensor<T>> {
        if self.footprint == 0 {
            return None;
        }
        Some(Tensor::from_storage(
            storage.clone(),
            Layout::contiguous(Shape::from(self.footprint)),
        ))
    }

    /// The whole weight vector as one flat tensor (None while empty).
    pub fn x_flat(&self) -> Option<Tensor<T>> {
        self.flat(&self.x)
    }

    /// The whole gradient vector as one flat tensor (None while empty).
    pub fn dx_flat(&self) -> Option<Tensor<T>> {
        self.flat(&self.dx)
    }

    /// The whole curvature vector as one flat tensor (None while empty).
    pub fn ddx_flat(&self) -> Option<Tensor<T>> {
        self.flat(&self.ddx)
    }

    /// Clear all weight gradients. Call before each backward pass —
    /// bprop accumulates.
    pub fn clear_dx(&mut self) {
        if let Some(mut t) = self.dx_flat() {
            t.clear();
        }
    }

    /// Clear all weight curvatures. Call before each second-order pass.
    pub fn clear_ddx(&mut self) {
        if let Some(mut t) = self.ddx_flat() {
            t.clear();
        }
    }

    /// Vanilla gradient step over the flat vector: x -= lr * dx.
    pub fn update(&mut self, lr: T) -> Result<()> {
        if let (Some(mut x), Some(dx)) = (self.x_flat(), self.dx_flat()) {
            x.add_scaled(&dx, -lr)?;
        }
        Ok(())
    }

    /// Snapshot of the current weight values.
    pub fn values(&self) -> Vec<T> {
        self.x_flat().map(|t| t.to_vec()).unwrap_or_default()
    }

    /// Overwrite the weight values (length must equal the footprint).
    pub fn set_values(&mut self, values: &[T]) -> Result<()> {
        match self.x_flat() {
            Some(mut t) => t.assign(values),
            None if values.is_empty() => Ok(()),
            None => Err(Error::msg("set_values on an empty parameter")),
        }
    }

    /// Save the flat weight vector as a matrix file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let x = self
            .x_flat()
            .ok_or_else(|| Error::msg("save on an empty parameter"))?;
        marten_io::save_matrix(&x, path)
    }

    /// Load weights from a matrix file written by [`Parameter::save`].
    /// The file's element count must match the footprint.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let t: Tensor<T> = marten_io::load_matrix(path)?;
        if t.elem_count() != self.footprint {
            return Err(Error::ElementCountMismatch {
                expected: self.footprint,
                got: t.elem_count(),
                shape: t.shape().clone(),
            });
        }
        self.set_values(&t.to_vec())
    }
}

impl<T: Float> Default for Parameter<T> {
    fn default() -> Self {
        Self::new()
    }
}
