use rand::rngs::StdRng;

use marten_core::{Error, Float, Result, Shape, Tensor};

use crate::init::{uniform_fill, ForgetParam};
use crate::module::Module;
use crate::parameter::Parameter;
use crate::state::State;

// Linear — Fully-connected layer, plus the per-map Bias and Diagonal gain
//
// Linear computes out = W · flatten(in) with W of shape
// [out_features, in_features]. The input may have any shape as long as its
// element count equals in_features — the flattening is implicit in the
// logical-order pairing of the dot product.
//
// BACKWARD:
//
//   dW  += out.dx ⊗ flatten(in.x)
//   din += Wᵀ · out.dx
//
// The curvature pass propagates W² instead of W (diagonal Gauss–Newton):
//
//   ddW  += out.ddx ⊗ flatten(in.x)²
//   ddin += (W²)ᵀ · out.ddx

/// Fully-connected layer: out = W · flatten(in).
pub struct Linear<T: Float> {
    /// Weight state allocated from a parameter: [out_features, in_features].
    w: State<T>,
    in_features: usize,
    out_features: usize,
}

impl<T: Float> Linear<T> {
    pub fn new(param: &mut Parameter<T>, in_features: usize, out_features: usize) -> Result<Self> {
        let w = param.alloc((out_features, in_features))?;
        Ok(Linear {
            w,
            in_features,
            out_features,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn weight(&self) -> &State<T> {
        &self.w
    }

    pub fn weight_mut(&mut self) -> &mut State<T> {
        &mut self.w
    }

    fn check_input(&self, input: &State<T>) -> Result<()> {
        if input.elem_count() != self.in_features {
            return Err(Error::ShapeMismatch {
                expected: Shape::from(self.in_features),
                got: input.shape().clone(),
            });
        }
        Ok(())
    }
}

impl<T: Float> Module<T> for Linear<T> {
    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        self.check_input(input)?;
        output.resize(self.out_features)?;
        for i in 0..self.out_features {
            let row = self.w.x.select(0, i)?;
            let v = row.dot(&input.x)?;
            output.x.set(&[i], v)?;
        }
        Ok(())
    }

    fn bprop(&mut self, input: &mut State<T>, output: &mut State<T>) -> Result<()> {
        self.check_input(input)?;
        let odx = output.dx()?.to_vec();
        let xv = input.x.to_vec();
        let wv = self.w.x.to_vec(); // row-major [out, in]

        // din += Wᵀ · out.dx
        let mut gin = vec![T::ZERO; self.in_features];
        for i in 0..self.out_features {
            for j in 0..self.in_features {
                gin[j] += wv[i * self.in_features + j] * odx[i];
            }
        }
        let gin = Tensor::from_slice(&gin, self.in_features)?;
        input.dx_mut()?.add_assign(&gin)?;

        // dW += out.dx ⊗ in.x
        let mut gw = vec![T::ZERO; self.out_features * self.in_features];
        for i in 0..self.out_features {
            for j in 0..self.in_features {
                gw[i * self.in_features + j] = odx[i] * xv[j];
            }
        }
        let gw = Tensor::from_slice(&gw, (self.out_features, self.in_features))?;
        self.w.dx_mut()?.add_assign(&gw)
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &mut State<T>) -> Result<()> {
        self.check_input(input)?;
        let oddx = output.ddx()?.to_vec();
        let xv = input.x.to_vec();
        let wv = self.w.x.to_vec();

        // ddin += (W²)ᵀ · out.ddx
        let mut gin = vec![T::ZERO; self.in_features];
        for i in 0..self.out_features {
            for j in 0..self.in_features {
                let w = wv[i * self.in_features + j];
                gin[j] += w * w * oddx[i];
            }
        }
        let gin = Tensor::from_slice(&gin, self.in_features)?;
        input.ddx_mut()?.add_assign(&gin)?;

        // ddW += out.ddx ⊗ in.x²
        let mut gw = vec![T::ZERO; self.out_features * self.in_features];
        for i in 0..self.out_features {
            for j in 0..self.in_features {
                gw[i * self.in_features + j] = oddx[i] * xv[j] * xv[j];
            }
        }
        let gw = Tensor::from_slice(&gw, (self.out_features, self.in_features))?;
        self.w.ddx_mut()?.add_assign(&gw)
    }

    fn forget(&mut self, rng: &mut StdRng, init: ForgetParam) -> Result<()> {
        let bound = init.bound(self.in_features);
        uniform_fill(&mut self.w.x, bound, rng)
    }

    fn normalize(&mut self) -> Result<()> {
        // Scale each output unit's weight row to unit L1 norm.
        for i in 0..self.out_features {
            let mut row = self.w.x.select(0, i)?;
            let norm: T = row.to_vec().into_iter().map(|v| v.abs()).sum();
            if norm > T::ZERO {
                row.scale(T::ONE / norm);
            }
        }
        Ok(())
    }

    fn fprop_size(&mut self, input: &mut Shape) -> Result<Shape> {
        let out = Shape::from(self.out_features);
        *input = self.bprop_size(&out)?;
        Ok(out)
    }

    fn bprop_size(&self, _output: &Shape) -> Result<Shape> {
        Ok(Shape::from(self.in_features))
    }

    fn replicate(&self, param: &mut Parameter<T>) -> Result<Box<dyn Module<T>>> {
        let mut m = Linear::new(param, self.in_features, self.out_features)?;
        m.w.x.copy_from(&self.w.x)?;
        Ok(Box::new(m))
    }

    fn load_x(&mut self, weights: &Tensor<T>) -> Result<()> {
        self.w.x.copy_from(weights)
    }

    fn describe(&self) -> String {
        format!("linear {}x{}", self.out_features, self.in_features)
    }
}

/// Per-feature-map additive bias: out[m, ...] = in[m, ...] + b[m].
/// On a 1-D input every element is its own map.
pub struct Bias<T: Float> {
    b: State<T>,
    maps: usize,
}

impl<T: Float> Bias<T> {
    pub fn new(param: &mut Parameter<T>, maps: usize) -> Result<Self> {
        Ok(Bias {
            b: param.alloc(maps)?,
            maps,
        })
    }

    pub fn bias(&self) -> &State<T> {
        &self.b
    }

    fn check_input(&self, input: &State<T>) -> Result<()> {
        if input.order() == 0 || input.dims()[0] != self.maps {
            return Err(Error::ShapeMismatch {
                expected: Shape::from(self.maps),
                got: input.shape().clone(),
            });
        }
        Ok(())
    }
}

impl<T: Float> Module<T> for Bias<T> {
    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        self.check_input(input)?;
        output.resize(input.shape().clone())?;
        for m in 0..self.maps {
            let c = self.b.x.get(&[m])?;
            let in_map = input.x.select(0, m)?;
            let mut out_map = output.x.select(0, m)?;
            out_map.map_from(&in_map, |v| v + c)?;
        }
        Ok(())
    }

    fn bprop(&mut self, input: &mut State<T>, output: &mut State<T>) -> Result<()> {
        self.check_input(input)?;
        input.dx_mut()?.add_assign(output.dx()?)?;
        for m in 0..self.maps {
            let g = output.dx()?.select(0, m)?.sum();
            let cur = self.b.dx()?.get(&[m])?;
            self.b.dx_mut()?.set(&[m], cur + g)?;
        }
        Ok(())
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &mut State<T>) -> Result<()> {
        self.check_input(input)?;
        input.ddx_mut()?.add_assign(output.ddx()?)?;
        for m in 0..self.maps {
            let g = output.ddx()?.select(0, m)?.sum();
            let cur = self.b.ddx()?.get(&[m])?;
            self.b.ddx_mut()?.set(&[m], cur + g)?;
        }
        Ok(())
    }

    fn forget(&mut self, rng: &mut StdRng, init: ForgetParam) -> Result<()> {
        uniform_fill(&mut self.b.x, init.bound(1), rng)
    }

    fn replicate(&self, param: &mut Parameter<T>) -> Result<Box<dyn Module<T>>> {
        let mut m = Bias::new(param, self.maps)?;
        m.b.x.copy_from(&self.b.x)?;
        Ok(Box::new(m))
    }

    fn load_x(&mut self, weights: &Tensor<T>) -> Result<()> {
        self.b.x.copy_from(weights)
    }

    fn describe(&self) -> String {
        format!("bias {}", self.maps)
    }
}

/// Per-feature-map multiplicative gain: out[m, ...] = in[m, ...] * d[m].
pub struct Diagonal<T: Float> {
    d: State<T>,
    maps: usize,
}

impl<T: Float> Diagonal<T> {
    pub fn new(param: &mut Parameter<T>, maps: usize) -> Result<Self> {
        let mut d = param.alloc(maps)?;
        d.x.fill(T::ONE); // neutral gain until forget() runs
        Ok(Diagonal { d, maps })
    }

    pub fn gain(&self) -> &State<T> {
        &self.d
    }

    fn check_input(&self, input: &State<T>) -> Result<()> {
        if input.order() == 0 || input.dims()[0] != self.maps {
            return Err(Error::ShapeMismatch {
                expected: Shape::from(self.maps),
                got: input.shape().clone(),
            });
        }
        Ok(())
    }
}

impl<T: Float> Module<T> for Diagonal<T> {
    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        self.check_input(input)?;
        output.resize(input.shape().clone())?;
        for m in 0..self.maps {
            let c = self.d.x.get(&[m])?;
            let in_map = input.x.select(0, m)?;
            let mut out_map = output.x.select(0, m)?;
            out_map.map_from(&in_map, |v| v * c)?;
        }
        Ok(())
    }

    fn bprop(&mut self, input: &mut State<T>, output: &mut State<T>) -> Result<()> {
        self.check_input(input)?;
        for m in 0..self.maps {
            let c = self.d.x.get(&[m])?;
            let odx_map = output.dx()?.select(0, m)?;
            let mut idx_map = input.dx_mut()?.select(0, m)?;
            idx_map.add_scaled(&odx_map, c)?;
            let g = input.x.select(0, m)?.dot(&odx_map)?;
            let cur = self.d.dx()?.get(&[m])?;
            self.d.dx_mut()?.set(&[m], cur + g)?;
        }
        Ok(())
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &mut State<T>) -> Result<()> {
        self.check_input(input)?;
        for m in 0..self.maps {
            let c = self.d.x.get(&[m])?;
            let oddx_map = output.ddx()?.select(0, m)?;
            let mut iddx_map = input.ddx_mut()?.select(0, m)?;
            iddx_map.add_scaled(&oddx_map, c * c)?;
            let in_map = input.x.select(0, m)?;
            let mut g = T::ZERO;
            for (xv, dv) in in_map.to_vec().into_iter().zip(oddx_map.to_vec()) {
                g += xv * xv * dv;
            }
            let cur = self.d.ddx()?.get(&[m])?;
            self.d.ddx_mut()?.set(&[m], cur + g)?;
        }
        Ok(())
    }

    fn forget(&mut self, rng: &mut StdRng, init: ForgetParam) -> Result<()> {
        uniform_fill(&mut self.d.x, init.bound(1), rng)
    }

    fn replicate(&self, param: &mut Parameter<T>) -> Result<Box<dyn Module<T>>> {
        let mut m = Diagonal::new(param, self.maps)?;
        m.d.x.copy_from(&self.d.x)?;
        Ok(Box::new(m))
    }

    fn load_x(&mut self, weights: &Tensor<T>) -> Result<()> {
        self.d.x.copy_from(weights)
    }

    fn describe(&self) -> String {
        format!("diag {}", self.maps)
    }
}
