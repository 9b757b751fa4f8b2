use rand::rngs::StdRng;

use marten_core::{bail, Error, Float, Result, Shape, Tensor};

use crate::init::{uniform_fill, ForgetParam};
use crate::module::Module;
use crate::parameter::Parameter;
use crate::state::State;

// Subsample — Stride-factor spatial reduction with a learnable gain
//
// Each output pixel is the SUM of a non-overlapping sh×sw window of its
// input map, multiplied by that map's learnable coefficient. Trailing rows
// and columns that do not fill a complete window are dropped (crop, not
// pad), like the convolution layer.
//
//   sub[m,i,j] = Σ_{p<sh, q<sw} in[m, i*sh+p, j*sw+q]
//   out[m,i,j] = coeff[m] * sub[m,i,j]
//
// The window sums are cached during fprop because the coefficient gradient
// needs them in bprop.

/// Spatial subsampling by an integer stride factor, one learnable
/// coefficient per feature map.
pub struct Subsample<T: Float> {
    coeff: State<T>,
    sub: Option<Tensor<T>>,
    sh: usize,
    sw: usize,
    maps: usize,
}

impl<T: Float> Subsample<T> {
    pub fn new(param: &mut Parameter<T>, maps: usize, sh: usize, sw: usize) -> Result<Self> {
        if sh == 0 || sw == 0 {
            bail!("subsample: degenerate stride {}x{}", sh, sw);
        }
        let mut coeff = param.alloc(maps)?;
        coeff.x.fill(T::ONE);
        Ok(Subsample {
            coeff,
            sub: None,
            sh,
            sw,
            maps,
        })
    }

    pub fn coeff(&self) -> &State<T> {
        &self.coeff
    }

    pub fn stride(&self) -> (usize, usize) {
        (self.sh, self.sw)
    }

    fn check_input(&self, input: &State<T>) -> Result<(usize, usize)> {
        if input.order() != 3 {
            return Err(Error::OrderMismatch {
                expected: 3,
                got: input.order(),
            });
        }
        let d = input.dims();
        if d[0] != self.maps || d[1] < self.sh || d[2] < self.sw {
            return Err(Error::ShapeMismatch {
                expected: Shape::from((self.maps, self.sh, self.sw)),
                got: input.shape().clone(),
            });
        }
        Ok((d[1], d[2]))
    }
}

impl<T: Float> Module<T> for Subsample<T> {
    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        let (h, w) = self.check_input(input)?;
        let (oh, ow) = (h / self.sh, w / self.sw);
        output.resize((self.maps, oh, ow))?;

        let mut sub = Tensor::new((self.maps, oh, ow))?;
        for m in 0..self.maps {
            let xv = input.x.select(0, m)?.to_vec();
            let c = self.coeff.x.get(&[m])?;
            let mut sv = vec![T::ZERO; oh * ow];
            let mut ov = vec![T::ZERO; oh * ow];
            for i in 0..oh {
                for j in 0..ow {
                    let mut acc = T::ZERO;
                    for p in 0..self.sh {
                        for q in 0..self.sw {
                            acc += xv[(i * self.sh + p) * w + (j * self.sw + q)];
                        }
                    }
                    sv[i * ow + j] = acc;
                    ov[i * ow + j] = c * acc;
                }
            }
            sub.select(0, m)?.assign(&sv)?;
            output.x.select(0, m)?.assign(&ov)?;
        }
        self.sub = Some(sub);
        Ok(())
    }

    fn bprop(&mut self, input: &mut State<T>, output: &mut State<T>) -> Result<()> {
        let (_, w) = self.check_input(input)?;
        let od = output.dims();
        let (oh, ow) = (od[1], od[2]);
        let sub = self
            .sub
            .as_ref()
            .ok_or_else(|| Error::msg("subsample: bprop before fprop"))?;

        for m in 0..self.maps {
            let c = self.coeff.x.get(&[m])?;
            let odx = output.dx()?.select(0, m)?.to_vec();
            let mut din_map = input.dx_mut()?.select(0, m)?;
            let mut din = din_map.to_vec();
            for i in 0..oh {
                for j in 0..ow {
                    let g = c * odx[i * ow + j];
                    for p in 0..self.sh {
                        for q in 0..self.sw {
                            din[(i * self.sh + p) * w + (j * self.sw + q)] += g;
                        }
                    }
                }
            }
            din_map.assign(&din)?;

            let g = sub.select(0, m)?.dot(&output.dx()?.select(0, m)?)?;
            let cur = self.coeff.dx()?.get(&[m])?;
            self.coeff.dx_mut()?.set(&[m], cur + g)?;
        }
        Ok(())
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &mut State<T>) -> Result<()> {
        let (_, w) = self.check_input(input)?;
        let od = output.dims();
        let (oh, ow) = (od[1], od[2]);
        let sub = self
            .sub
            .as_ref()
            .ok_or_else(|| Error::msg("subsample: bbprop before fprop"))?;

        for m in 0..self.maps {
            let c = self.coeff.x.get(&[m])?;
            let c2 = c * c;
            let oddx = output.ddx()?.select(0, m)?.to_vec();
            let mut ddin_map = input.ddx_mut()?.select(0, m)?;
            let mut ddin = ddin_map.to_vec();
            for i in 0..oh {
                for j in 0..ow {
                    let g = c2 * oddx[i * ow + j];
                    for p in 0..self.sh {
                        for q in 0..self.sw {
                            ddin[(i * self.sh + p) * w + (j * self.sw + q)] += g;
                        }
                    }
                }
            }
            ddin_map.assign(&ddin)?;

            let mut g = T::ZERO;
            for (sv, dv) in sub.select(0, m)?.to_vec().into_iter().zip(oddx) {
                g += sv * sv * dv;
            }
            let cur = self.coeff.ddx()?.get(&[m])?;
            self.coeff.ddx_mut()?.set(&[m], cur + g)?;
        }
        Ok(())
    }

    fn forget(&mut self, rng: &mut StdRng, init: ForgetParam) -> Result<()> {
        uniform_fill(&mut self.coeff.x, init.bound(self.sh * self.sw), rng)
    }

    fn fprop_size(&mut self, input: &mut Shape) -> Result<Shape> {
        if input.order() != 3 {
            return Err(Error::OrderMismatch {
                expected: 3,
                got: input.order(),
            });
        }
        let oh = (input.dim(1)? / self.sh).max(1);
        let ow = (input.dim(2)? / self.sw).max(1);
        let out = Shape::from((self.maps, oh, ow));
        *input = self.bprop_size(&out)?;
        Ok(out)
    }

    fn bprop_size(&self, output: &Shape) -> Result<Shape> {
        if output.order() != 3 {
            return Err(Error::OrderMismatch {
                expected: 3,
                got: output.order(),
            });
        }
        Ok(Shape::from((
            self.maps,
            output.dim(1)?.max(1) * self.sh,
            output.dim(2)?.max(1) * self.sw,
        )))
    }

    fn replicate(&self, param: &mut Parameter<T>) -> Result<Box<dyn Module<T>>> {
        let mut m = Subsample::new(param, self.maps, self.sh, self.sw)?;
        m.coeff.x.copy_from(&self.coeff.x)?;
        Ok(Box::new(m))
    }

    fn load_x(&mut self, weights: &Tensor<T>) -> Result<()> {
        self.coeff.x.copy_from(weights)
    }

    fn describe(&self) -> String {
        format!("subsample {}x{}, {} maps", self.sh, self.sw, self.maps)
    }
}
