use marten_core::{Error, Float, Result, Shape, Tensor};

// State — The activation bundle flowing between modules
//
// A State is a plain struct of up to three co-shaped tensors:
//
//   x   — the forward value
//   dx  — the gradient (allocated only when a backward pass will run)
//   ddx — the curvature (second-order backward pass)
//
// Modules read their input state's value and write their output state's
// value during fprop; bprop and bbprop run the other way, ACCUMULATING into
// dx/ddx. Because backward passes accumulate rather than overwrite, callers
// must clear gradients before each new pass (see `clear_grads`) — forgetting
// to do so corrupts gradients across iterations, by contract.
//
// INVARIANT: whenever dx/ddx exist they have exactly the dimensions of x.
// Every constructor and resize path enforces this; there is no way to build
// a state with mismatched buffers.

/// A bundle of co-shaped value/gradient/curvature tensors.
pub struct State<T: Float> {
    /// Forward value.
    pub x: Tensor<T>,
    /// Gradient, same shape as `x` when present.
    pub dx: Option<Tensor<T>>,
    /// Curvature (diagonal second-order term), same shape as `x` when present.
    pub ddx: Option<Tensor<T>>,
    forward_only: bool,
}

impl<T: Float> State<T> {
    /// Value-only state. Gradient buffers may still be added later with
    /// [`State::ensure_grad`].
    pub fn forward(shape: impl Into<Shape>) -> Result<Self> {
        Ok(State {
            x: Tensor::new(shape)?,
            dx: None,
            ddx: None,
            forward_only: false,
        })
    }

    /// Value-only state that FORBIDS gradient/curvature allocation.
    /// Asking such a state for backward buffers is a contract violation
    /// surfaced as [`Error::ForwardOnly`].
    pub fn forward_only(shape: impl Into<Shape>) -> Result<Self> {
        Ok(State {
            x: Tensor::new(shape)?,
            dx: None,
            ddx: None,
            forward_only: true,
        })
    }

    /// State with value and gradient buffers.
    pub fn with_grad(shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        Ok(State {
            x: Tensor::new(shape.clone())?,
            dx: Some(Tensor::new(shape)?),
            ddx: None,
            forward_only: false,
        })
    }

    /// State with value, gradient, and curvature buffers.
    pub fn with_curvature(shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        Ok(State {
            x: Tensor::new(shape.clone())?,
            dx: Some(Tensor::new(shape.clone())?),
            ddx: Some(Tensor::new(shape)?),
            forward_only: false,
        })
    }

    /// Build a state from existing tensors, validating co-shaping.
    pub fn from_tensors(
        x: Tensor<T>,
        dx: Option<Tensor<T>>,
        ddx: Option<Tensor<T>>,
    ) -> Result<Self> {
        for t in dx.iter().chain(ddx.iter()) {
            if t.dims() != x.dims() {
                return Err(Error::ShapeMismatch {
                    expected: x.shape().clone(),
                    got: t.shape().clone(),
                });
            }
        }
        Ok(State {
            x,
            dx,
            ddx,
            forward_only: false,
        })
    }

    // Accessors

    pub fn shape(&self) -> &Shape {
        self.x.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.x.dims()
    }

    pub fn order(&self) -> usize {
        self.x.order()
    }

    pub fn elem_count(&self) -> usize {
        self.x.elem_count()
    }

    pub fn is_forward_only(&self) -> bool {
        self.forward_only
    }

    /// The gradient tensor, or [`Error::MissingBuffer`] if never allocated.
    pub fn dx(&self) -> Result<&Tensor<T>> {
        self.dx.as_ref().ok_or(Error::MissingBuffer { kind: "gradient" })
    }

    pub fn dx_mut(&mut self) -> Result<&mut Tensor<T>> {
        self.dx.as_mut().ok_or(Error::MissingBuffer { kind: "gradient" })
    }

    /// The curvature tensor, or [`Error::MissingBuffer`] if never allocated.
    pub fn ddx(&self) -> Result<&Tensor<T>> {
        self.ddx.as_ref().ok_or(Error::MissingBuffer { kind: "curvature" })
    }

    pub fn ddx_mut(&mut self) -> Result<&mut Tensor<T>> {
        self.ddx.as_mut().ok_or(Error::MissingBuffer { kind: "curvature" })
    }

    /// Allocate the gradient buffer if absent.
    pub fn ensure_grad(&mut self) -> Result<()> {
        if self.forward_only {
            return Err(Error::ForwardOnly);
        }
        if self.dx.is_none() {
            self.dx = Some(Tensor::new(self.x.shape().clone())?);
        }
        Ok(())
    }

    /// Allocate gradient and curvature buffers if absent.
    pub fn ensure_curvature(&mut self) -> Result<()> {
        self.ensure_grad()?;
        if self.ddx.is_none() {
            self.ddx = Some(Tensor::new(self.x.shape().clone())?);
        }
        Ok(())
    }

    // Resizing

    /// Resize all present buffers in lockstep. A no-op when the dimensions
    /// are unchanged — callers in inner loops rely on that being cheap.
    pub fn resize(&mut self, shape: impl Into<Shape>) -> Result<()> {
        let shape = shape.into();
        if shape.dims() == self.dims() {
            return Ok(());
        }
        self.x.resize(shape.clone())?;
        if let Some(dx) = self.dx.as_mut() {
            dx.resize(shape.clone())?;
        }
        if let Some(ddx) = self.ddx.as_mut() {
            ddx.resize(shape)?;
        }
        Ok(())
    }

    /// Resize to `shape`, replacing the underlying buffers when the order
    /// differs. Tensor-level `resize` cannot change order; only the
    /// container machinery re-purposes a buffer across stages of different
    /// order (ping-pong execution), so module code sticks to `resize`.
    pub fn adapt(&mut self, shape: impl Into<Shape>) -> Result<()> {
        let shape = shape.into();
        if shape.order() == self.order() {
            return self.resize(shape);
        }
        shape.check_alloc()?;
        let had_dx = self.dx.is_some();
        let had_ddx = self.ddx.is_some();
        self.x = Tensor::new(shape.clone())?;
        self.dx = if had_dx {
            Some(Tensor::new(shape.clone())?)
        } else {
            None
        };
        self.ddx = if had_ddx { Some(Tensor::new(shape)?) } else { None };
        Ok(())
    }

    // Clearing

    pub fn zero_x(&mut self) {
        self.x.clear();
    }

    pub fn zero_dx(&mut self) {
        if let Some(dx) = self.dx.as_mut() {
            dx.clear();
        }
    }

    pub fn zero_ddx(&mut self) {
        if let Some(ddx) = self.ddx.as_mut() {
            ddx.clear();
        }
    }

    /// Clear gradient and curvature buffers. Call before accumulating a new
    /// backward pass.
    pub fn clear_grads(&mut self) {
        self.zero_dx();
        self.zero_ddx();
    }

    // Views

    /// View a sub-range along `dim`: all present buffers are narrowed in
    /// lockstep and alias this state's storage.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<State<T>> {
        Ok(State {
            x: self.x.narrow(dim, start, len)?,
            dx: self
                .dx
                .as_ref()
                .map(|t| t.narrow(dim, start, len))
                .transpose()?,
            ddx: self
                .ddx
                .as_ref()
                .map(|t| t.narrow(dim, start, len))
                .transpose()?,
            forward_only: self.forward_only,
        })
    }

    /// View with one dimension fixed; all present buffers select in lockstep.
    pub fn select(&self, dim: usize, index: usize) -> Result<State<T>> {
        Ok(State {
            x: self.x.select(dim, index)?,
            dx: self.dx.as_ref().map(|t| t.select(dim, index)).transpose()?,
            ddx: self.ddx.as_ref().map(|t| t.select(dim, index)).transpose()?,
            forward_only: self.forward_only,
        })
    }

    /// Fresh storage for every present buffer; mutations never propagate
    /// back to the source.
    pub fn deep_copy(&self) -> Result<State<T>> {
        Ok(State {
            x: self.x.deep_copy()?,
            dx: self.dx.as_ref().map(|t| t.deep_copy()).transpose()?,
            ddx: self.ddx.as_ref().map(|t| t.deep_copy()).transpose()?,
            forward_only: self.forward_only,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_co_shaping_enforced() {
        let x = Tensor::<f64>::new((2, 3)).unwrap();
        let dx = Tensor::<f64>::new((2, 3)).unwrap();
        let bad = Tensor::<f64>::new((3, 2)).unwrap();
        assert!(State::from_tensors(x.clone(), Some(dx), None).is_ok());
        assert!(State::from_tensors(x, Some(bad), None).is_err());
    }

    #[test]
    fn test_forward_only_forbids_grads() {
        let mut s = State::<f64>::forward_only((2, 2)).unwrap();
        assert!(matches!(s.ensure_grad(), Err(Error::ForwardOnly)));
        assert!(s.dx().is_err());
    }

    #[test]
    fn test_resize_lockstep_and_noop() {
        let mut s = State::<f64>::with_curvature((2, 3)).unwrap();
        s.resize((4, 5)).unwrap();
        assert_eq!(s.x.dims(), &[4, 5]);
        assert_eq!(s.dx().unwrap().dims(), &[4, 5]);
        assert_eq!(s.ddx().unwrap().dims(), &[4, 5]);
        // Same-shape resize is a no-op (values preserved).
        s.x.set(&[0, 0], 3.0).unwrap();
        s.resize((4, 5)).unwrap();
        assert_eq!(s.x.get(&[0, 0]).unwrap(), 3.0);
    }

    #[test]
    fn test_narrow_views_alias() {
        let mut s = State::<f64>::with_grad((4, 3)).unwrap();
        let mut v = s.narrow(0, 1, 2).unwrap();
        v.x.fill(5.0);
        v.dx_mut().unwrap().fill(2.0);
        assert_eq!(s.x.get(&[1, 0]).unwrap(), 5.0);
        assert_eq!(s.x.get(&[0, 0]).unwrap(), 0.0);
        assert_eq!(s.dx().unwrap().get(&[2, 2]).unwrap(), 2.0);
    }

    #[test]
    fn test_deep_copy_detaches() {
        let mut s = State::<f64>::with_grad((2, 2)).unwrap();
        s.x.fill(1.0);
        let mut c = s.deep_copy().unwrap();
        c.x.fill(9.0);
        assert_eq!(s.x.get(&[0, 0]).unwrap(), 1.0);
    }

    #[test]
    fn test_clear_grads() {
        let mut s = State::<f64>::with_curvature(4).unwrap();
        s.dx_mut().unwrap().fill(1.0);
        s.ddx_mut().unwrap().fill(1.0);
        s.clear_grads();
        assert_eq!(s.dx().unwrap().sum(), 0.0);
        assert_eq!(s.ddx().unwrap().sum(), 0.0);
    }
}
