use marten_core::{Error, Float, Result, Shape};

use crate::module::Module;
use crate::parameter::Parameter;
use crate::state::State;

// Padding modules — border padding sized from a kernel's receptive field
//
// A valid-mode convolution with a kh×kw kernel shrinks each spatial
// dimension by k-1. Padding the input by (k-1)/2 before / k/2 after (the
// split is asymmetric for even kernels) restores the spatial extent.
// ZeroPad fills the border with zeros; MirrorPad reflects the interior
// (without repeating the edge row itself).

fn pad_split(k: usize) -> (usize, usize) {
    ((k.saturating_sub(1)) / 2, k / 2)
}

/// Zero border padding of feature-map stacks [maps, h, w].
pub struct ZeroPad {
    top: usize,
    bottom: usize,
    left: usize,
    right: usize,
}

impl ZeroPad {
    pub fn new(top: usize, bottom: usize, left: usize, right: usize) -> Self {
        ZeroPad {
            top,
            bottom,
            left,
            right,
        }
    }

    /// Padding that preserves spatial extent for a kh×kw valid convolution.
    pub fn for_kernel(kh: usize, kw: usize) -> Self {
        let (top, bottom) = pad_split(kh);
        let (left, right) = pad_split(kw);
        ZeroPad::new(top, bottom, left, right)
    }

    pub fn pads(&self) -> (usize, usize, usize, usize) {
        (self.top, self.bottom, self.left, self.right)
    }

    fn check_input<T: Float>(&self, input: &State<T>) -> Result<(usize, usize, usize)> {
        if input.order() != 3 {
            return Err(Error::OrderMismatch {
                expected: 3,
                got: input.order(),
            });
        }
        let d = input.dims();
        Ok((d[0], d[1], d[2]))
    }
}

impl<T: Float> Module<T> for ZeroPad {
    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        let (maps, h, w) = self.check_input(input)?;
        output.resize((maps, h + self.top + self.bottom, w + self.left + self.right))?;
        output.x.clear();
        let mut center = output
            .x
            .narrow(1, self.top, h)?
            .narrow(2, self.left, w)?;
        center.copy_from(&input.x)
    }

    fn bprop(&mut self, input: &mut State<T>, output: &mut State<T>) -> Result<()> {
        let (_, h, w) = self.check_input(input)?;
        let center = output.dx()?.narrow(1, self.top, h)?.narrow(2, self.left, w)?;
        input.dx_mut()?.add_assign(&center)
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &mut State<T>) -> Result<()> {
        let (_, h, w) = self.check_input(input)?;
        let center = output
            .ddx()?
            .narrow(1, self.top, h)?
            .narrow(2, self.left, w)?;
        input.ddx_mut()?.add_assign(&center)
    }

    fn fprop_size(&mut self, input: &mut Shape) -> Result<Shape> {
        if input.order() != 3 {
            return Err(Error::OrderMismatch {
                expected: 3,
                got: input.order(),
            });
        }
        let out = Shape::from((
            input.dim(0)?,
            input.dim(1)? + self.top + self.bottom,
            input.dim(2)? + self.left + self.right,
        ));
        *input = Module::<T>::bprop_size(self, &out)?;
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
            output.dim(0)?,
            output.dim(1)?.saturating_sub(self.top + self.bottom).max(1),
            output.dim(2)?.saturating_sub(self.left + self.right).max(1),
        )))
    }

    fn replicate(&self, _param: &mut Parameter<T>) -> Result<Box<dyn Module<T>>> {
        Ok(Box::new(ZeroPad::new(
            self.top,
            self.bottom,
            self.left,
            self.right,
        )))
    }

    fn describe(&self) -> String {
        format!(
            "zero-pad t{} b{} l{} r{}",
            self.top, self.bottom, self.left, self.right
        )
    }
}

/// Reflecting border padding: out[i] reads in[mirror(i)], where the
/// reflection pivots on the edge row without repeating it.
pub struct MirrorPad {
    top: usize,
    bottom: usize,
    left: usize,
    right: usize,
}

/// Reflect index `i` (which may be conceptually negative by `before`) into
/// [0, len): ... 2 1 | 0 1 2 ... len-1 | len-2 len-3 ...
fn mirror(i: isize, len: usize) -> usize {
    let len = len as isize;
    let mut i = i;
    if i < 0 {
        i = -i;
    }
    if i >= len {
        i = 2 * len - 2 - i;
    }
    i as usize
}

impl MirrorPad {
    pub fn new(top: usize, bottom: usize, left: usize, right: usize) -> Self {
        MirrorPad {
            top,
            bottom,
            left,
            right,
        }
    }

    /// Padding that preserves spatial extent for a kh×kw valid convolution.
    pub fn for_kernel(kh: usize, kw: usize) -> Self {
        let (top, bottom) = pad_split(kh);
        let (left, right) = pad_split(kw);
        MirrorPad::new(top, bottom, left, right)
    }

    fn check_input<T: Float>(&self, input: &State<T>) -> Result<(usize, usize, usize)> {
        if input.order() != 3 {
            return Err(Error::OrderMismatch {
                expected: 3,
                got: input.order(),
            });
        }
        let d = input.dims();
        // Reflection needs at least pad+1 interior rows to pivot on.
        if d[1] <= self.top.max(self.bottom) || d[2] <= self.left.max(self.right) {
            return Err(Error::ShapeMismatch {
                expected: Shape::from((
                    d[0],
                    self.top.max(self.bottom) + 1,
                    self.left.max(self.right) + 1,
                )),
                got: input.shape().clone(),
            });
        }
        Ok((d[0], d[1], d[2]))
    }
}

impl<T: Float> Module<T> for MirrorPad {
    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        let (maps, h, w) = self.check_input(input)?;
        let oh = h + self.top + self.bottom;
        let ow = w + self.left + self.right;
        output.resize((maps, oh, ow))?;
        for m in 0..maps {
            let xv = input.x.select(0, m)?.to_vec();
            let mut ov = vec![T::ZERO; oh * ow];
            for i in 0..oh {
                let si = mirror(i as isize - self.top as isize, h);
                for j in 0..ow {
                    let sj = mirror(j as isize - self.left as isize, w);
                    ov[i * ow + j] = xv[si * w + sj];
                }
            }
            output.x.select(0, m)?.assign(&ov)?;
        }
        Ok(())
    }

    fn bprop(&mut self, input: &mut State<T>, output: &mut State<T>) -> Result<()> {
        let (maps, h, w) = self.check_input(input)?;
        let od = output.dims();
        let (oh, ow) = (od[1], od[2]);
        for m in 0..maps {
            let odx = output.dx()?.select(0, m)?.to_vec();
            let mut din_map = input.dx_mut()?.select(0, m)?;
            let mut din = din_map.to_vec();
            for i in 0..oh {
                let si = mirror(i as isize - self.top as isize, h);
                for j in 0..ow {
                    let sj = mirror(j as isize - self.left as isize, w);
                    din[si * w + sj] += odx[i * ow + j];
                }
            }
            din_map.assign(&din)?;
        }
        Ok(())
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &mut State<T>) -> Result<()> {
        let (maps, h, w) = self.check_input(input)?;
        let od = output.dims();
        let (oh, ow) = (od[1], od[2]);
        for m in 0..maps {
            let oddx = output.ddx()?.select(0, m)?.to_vec();
            let mut ddin_map = input.ddx_mut()?.select(0, m)?;
            let mut ddin = ddin_map.to_vec();
            for i in 0..oh {
                let si = mirror(i as isize - self.top as isize, h);
                for j in 0..ow {
                    let sj = mirror(j as isize - self.left as isize, w);
                    ddin[si * w + sj] += oddx[i * ow + j];
                }
            }
            ddin_map.assign(&ddin)?;
        }
        Ok(())
    }

    fn fprop_size(&mut self, input: &mut Shape) -> Result<Shape> {
        if input.order() != 3 {
            return Err(Error::OrderMismatch {
                expected: 3,
                got: input.order(),
            });
        }
        let out = Shape::from((
            input.dim(0)?,
            input.dim(1)? + self.top + self.bottom,
            input.dim(2)? + self.left + self.right,
        ));
        *input = Module::<T>::bprop_size(self, &out)?;
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
            output.dim(0)?,
            output.dim(1)?.saturating_sub(self.top + self.bottom).max(1),
            output.dim(2)?.saturating_sub(self.left + self.right).max(1),
        )))
    }

    fn replicate(&self, _param: &mut Parameter<T>) -> Result<Box<dyn Module<T>>> {
        Ok(Box::new(MirrorPad::new(
            self.top,
            self.bottom,
            self.left,
            self.right,
        )))
    }

    fn describe(&self) -> String {
        format!(
            "mirror-pad t{} b{} l{} r{}",
            self.top, self.bottom, self.left, self.right
        )
    }
}
