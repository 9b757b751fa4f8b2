use rand::rngs::StdRng;

use marten_core::{bail, Error, Float, Result, Shape, Tensor};

use crate::init::{uniform_fill, ForgetParam};
use crate::module::Module;
use crate::parameter::Parameter;
use crate::state::State;
use crate::table::Table;

// Convolution — Connection-table-driven sparse 2-D correlation
//
// Input and output are stacks of feature maps [maps, h, w]. The connection
// table lists (input map, output map) pairs; each pair k owns kernel slice
// k and its correlation result is ADDED into the target output map. A full
// table is a dense convolution, anything sparser gives grouped/partial
// connectivity.
//
// The forward pass is a dot product over unfolded patches: unfolding the
// input map twice yields a [oh, ow, kh, kw] view whose (i, j) window is
// exactly the receptive field of output pixel (i, j) — no data is copied.
//
// Inputs whose size is not stride-compatible are cropped: trailing rows and
// columns that do not fill a complete window are trimmed, never padded.
//
// OUTPUT SIZE:  oh = (h - kh) / sh + 1   (floor), same for width.
// MINIMAL INPUT for a given output: h = (oh - 1) * sh + kh.

/// Sparse-connectivity 2-D convolution layer.
pub struct Convolution<T: Float> {
    /// One kernel slice per table entry: [table.len(), kh, kw].
    kernel: State<T>,
    table: Table,
    kh: usize,
    kw: usize,
    sh: usize,
    sw: usize,
    in_maps: usize,
    out_maps: usize,
}

impl<T: Float> Convolution<T> {
    pub fn new(
        param: &mut Parameter<T>,
        kh: usize,
        kw: usize,
        sh: usize,
        sw: usize,
        table: Table,
    ) -> Result<Self> {
        if table.is_empty() {
            bail!("convolution: empty connection table");
        }
        if kh == 0 || kw == 0 || sh == 0 || sw == 0 {
            bail!(
                "convolution: degenerate kernel {}x{} stride {}x{}",
                kh,
                kw,
                sh,
                sw
            );
        }
        let kernel = param.alloc((table.len(), kh, kw))?;
        let in_maps = table.max_in() + 1;
        let out_maps = table.out_maps();
        Ok(Convolution {
            kernel,
            table,
            kh,
            kw,
            sh,
            sw,
            in_maps,
            out_maps,
        })
    }

    pub fn kernel(&self) -> &State<T> {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut State<T> {
        &mut self.kernel
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn out_maps(&self) -> usize {
        self.out_maps
    }

    fn check_input(&self, input: &State<T>) -> Result<(usize, usize, usize)> {
        if input.order() != 3 {
            return Err(Error::OrderMismatch {
                expected: 3,
                got: input.order(),
            });
        }
        let d = input.dims();
        let (maps, h, w) = (d[0], d[1], d[2]);
        self.table.check_inputs(maps)?;
        if h < self.kh || w < self.kw {
            return Err(Error::ShapeMismatch {
                expected: Shape::from((self.in_maps, self.kh, self.kw)),
                got: input.shape().clone(),
            });
        }
        Ok((maps, h, w))
    }

    fn out_hw(&self, h: usize, w: usize) -> (usize, usize) {
        ((h - self.kh) / self.sh + 1, (w - self.kw) / self.sw + 1)
    }
}

impl<T: Float> Module<T> for Convolution<T> {
    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        let (_, h, w) = self.check_input(input)?;
        let (oh, ow) = self.out_hw(h, w);
        output.resize((self.out_maps, oh, ow))?;
        output.x.clear();

        // Crop the input to the region complete windows cover, then unfold
        // into per-output-pixel receptive fields.
        let used_h = (oh - 1) * self.sh + self.kh;
        let used_w = (ow - 1) * self.sw + self.kw;
        for (k, &(im, om)) in self.table.pairs().iter().enumerate() {
            let in_map = input
                .x
                .select(0, im)?
                .narrow(0, 0, used_h)?
                .narrow(1, 0, used_w)?;
            let patches = in_map.unfold(0, self.kh, self.sh)?.unfold(1, self.kw, self.sw)?;
            let ker = self.kernel.x.select(0, k)?;
            let mut out_map = output.x.select(0, om)?;
            let mut acc = out_map.to_vec();
            for i in 0..oh {
                let row = patches.select(0, i)?;
                for j in 0..ow {
                    acc[i * ow + j] += row.select(0, j)?.dot(&ker)?;
                }
            }
            out_map.assign(&acc)?;
        }
        Ok(())
    }

    fn bprop(&mut self, input: &mut State<T>, output: &mut State<T>) -> Result<()> {
        let (_, _h, w_in) = self.check_input(input)?;
        let od = output.dims();
        let (oh, ow) = (od[1], od[2]);
        let w = w_in;

        for (k, &(im, om)) in self.table.pairs().iter().enumerate() {
            let kv = self.kernel.x.select(0, k)?.to_vec();
            let odx = output.dx()?.select(0, om)?.to_vec();
            let xv = input.x.select(0, im)?.to_vec();

            // din[i*sh+p, j*sw+q] += out.dx[i, j] * ker[p, q]
            // dker[p, q]          += out.dx[i, j] * in[i*sh+p, j*sw+q]
            let mut din_map = input.dx_mut()?.select(0, im)?;
            let mut din = din_map.to_vec();
            let mut dker = self.kernel.dx()?.select(0, k)?.to_vec();
            for i in 0..oh {
                for j in 0..ow {
                    let g = odx[i * ow + j];
                    if g == T::ZERO {
                        continue;
                    }
                    for p in 0..self.kh {
                        for q in 0..self.kw {
                            let ii = (i * self.sh + p) * w + (j * self.sw + q);
                            din[ii] += g * kv[p * self.kw + q];
                            dker[p * self.kw + q] += g * xv[ii];
                        }
                    }
                }
            }
            din_map.assign(&din)?;
            self.kernel.dx_mut()?.select(0, k)?.assign(&dker)?;
        }
        Ok(())
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &mut State<T>) -> Result<()> {
        let (_, _h, w_in) = self.check_input(input)?;
        let od = output.dims();
        let (oh, ow) = (od[1], od[2]);
        let w = w_in;

        for (k, &(im, om)) in self.table.pairs().iter().enumerate() {
            let kv = self.kernel.x.select(0, k)?.to_vec();
            let oddx = output.ddx()?.select(0, om)?.to_vec();
            let xv = input.x.select(0, im)?.to_vec();

            let mut ddin_map = input.ddx_mut()?.select(0, im)?;
            let mut ddin = ddin_map.to_vec();
            let mut ddker = self.kernel.ddx()?.select(0, k)?.to_vec();
            for i in 0..oh {
                for j in 0..ow {
                    let g = oddx[i * ow + j];
                    if g == T::ZERO {
                        continue;
                    }
                    for p in 0..self.kh {
                        for q in 0..self.kw {
                            let ii = (i * self.sh + p) * w + (j * self.sw + q);
                            let kval = kv[p * self.kw + q];
                            ddin[ii] += g * kval * kval;
                            ddker[p * self.kw + q] += g * xv[ii] * xv[ii];
                        }
                    }
                }
            }
            ddin_map.assign(&ddin)?;
            self.kernel.ddx_mut()?.select(0, k)?.assign(&ddker)?;
        }
        Ok(())
    }

    fn forget(&mut self, rng: &mut StdRng, init: ForgetParam) -> Result<()> {
        // Fan-in of an output unit: kernel area times the number of input
        // maps feeding that output map.
        for (k, &(_, om)) in self.table.pairs().iter().enumerate() {
            let fanin = self.kh * self.kw * self.table.in_degree(om);
            let mut ker = self.kernel.x.select(0, k)?;
            uniform_fill(&mut ker, init.bound(fanin), rng)?;
        }
        Ok(())
    }

    fn normalize(&mut self) -> Result<()> {
        for k in 0..self.table.len() {
            let mut ker = self.kernel.x.select(0, k)?;
            let norm: T = ker.to_vec().into_iter().map(|v| v.abs()).sum();
            if norm > T::ZERO {
                ker.scale(T::ONE / norm);
            }
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
        let h = input.dim(1)?.max(self.kh);
        let w = input.dim(2)?.max(self.kw);
        let (oh, ow) = self.out_hw(h, w);
        let out = Shape::from((self.out_maps, oh, ow));
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
        let oh = output.dim(1)?.max(1);
        let ow = output.dim(2)?.max(1);
        Ok(Shape::from((
            self.in_maps,
            (oh - 1) * self.sh + self.kh,
            (ow - 1) * self.sw + self.kw,
        )))
    }

    fn replicate(&self, param: &mut Parameter<T>) -> Result<Box<dyn Module<T>>> {
        let mut m = Convolution::new(
            param,
            self.kh,
            self.kw,
            self.sh,
            self.sw,
            self.table.clone(),
        )?;
        m.kernel.x.copy_from(&self.kernel.x)?;
        Ok(Box::new(m))
    }

    fn load_x(&mut self, weights: &Tensor<T>) -> Result<()> {
        self.kernel.x.copy_from(weights)
    }

    fn describe(&self) -> String {
        format!(
            "convolution {}x{} stride {}x{}, {} table entries, {}->{} maps",
            self.kh,
            self.kw,
            self.sh,
            self.sw,
            self.table.len(),
            self.in_maps,
            self.out_maps
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Naive dense 2-D valid correlation for cross-checking.
    fn naive_correlate(input: &[f64], h: usize, w: usize, ker: &[f64], kh: usize, kw: usize) -> Vec<f64> {
        let oh = h - kh + 1;
        let ow = w - kw + 1;
        let mut out = vec![0.0; oh * ow];
        for i in 0..oh {
            for j in 0..ow {
                let mut acc = 0.0;
                for p in 0..kh {
                    for q in 0..kw {
                        acc += input[(i + p) * w + (j + q)] * ker[p * kw + q];
                    }
                }
                out[i * ow + j] = acc;
            }
        }
        out
    }

    #[test]
    fn test_single_entry_equals_dense_correlation() {
        // 3x3 kernel over 5x5 input, stride 1, one (0,0) table entry.
        let mut p = Parameter::<f64>::new();
        let mut conv = Convolution::new(&mut p, 3, 3, 1, 1, Table::one2one(1)).unwrap();
        let ker: Vec<f64> = (0..9).map(|i| (i as f64) * 0.1 - 0.4).collect();
        conv.kernel.x.assign(&ker).unwrap();

        let img: Vec<f64> = (0..25).map(|i| i as f64).collect();
        let mut input = State::with_grad((1, 5, 5)).unwrap();
        input.x.assign(&img).unwrap();
        let mut output = State::with_grad((1, 1, 1)).unwrap();
        conv.fprop(&input, &mut output).unwrap();

        assert_eq!(output.dims(), &[1, 3, 3]);
        let expected = naive_correlate(&img, 5, 5, &ker, 3, 3);
        for (got, want) in output.x.to_vec().into_iter().zip(expected) {
            assert!((got - want).abs() < 1e-12, "{} vs {}", got, want);
        }
    }

    #[test]
    fn test_stride_crops_trailing_pixels() {
        // 6x7 input, 2x2 kernel, stride 2: oh = 3, ow = 3 — the 7th column
        // never participates.
        let mut p = Parameter::<f64>::new();
        let mut conv = Convolution::new(&mut p, 2, 2, 2, 2, Table::one2one(1)).unwrap();
        conv.kernel.x.fill(1.0);
        let mut input = State::with_grad((1, 6, 7)).unwrap();
        input.x.fill(1.0);
        let mut output = State::with_grad((1, 1, 1)).unwrap();
        conv.fprop(&input, &mut output).unwrap();
        assert_eq!(output.dims(), &[1, 3, 3]);
        // every window sums 4 ones
        assert!(output.x.to_vec().iter().all(|&v| v == 4.0));
    }

    #[test]
    fn test_table_accumulates_into_shared_output() {
        // Two inputs both feeding output map 0: results add.
        let mut p = Parameter::<f64>::new();
        let table = Table::from_pairs(vec![(0, 0), (1, 0)]);
        let mut conv = Convolution::new(&mut p, 1, 1, 1, 1, table).unwrap();
        conv.kernel.x.assign(&[1.0, 1.0]).unwrap();
        let mut input = State::with_grad((2, 2, 2)).unwrap();
        input.x.assign(&[1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0]).unwrap();
        let mut output = State::with_grad((1, 1, 1)).unwrap();
        conv.fprop(&input, &mut output).unwrap();
        assert_eq!(output.x.to_vec(), vec![11.0, 22.0, 33.0, 44.0]);
    }

    #[test]
    fn test_table_out_of_range_rejected() {
        let mut p = Parameter::<f64>::new();
        let table = Table::from_pairs(vec![(2, 0)]);
        let mut conv = Convolution::new(&mut p, 1, 1, 1, 1, table).unwrap();
        let input = State::with_grad((2, 2, 2)).unwrap();
        let mut output = State::with_grad((1, 1, 1)).unwrap();
        assert!(matches!(
            conv.fprop(&input, &mut output),
            Err(Error::TableOutOfRange { .. })
        ));
    }

    #[test]
    fn test_size_round_trip() {
        let mut p = Parameter::<f64>::new();
        let mut conv = Convolution::new(&mut p, 5, 5, 1, 1, Table::full(1, 6)).unwrap();
        let out = Shape::from((6, 8, 8));
        let input = conv.bprop_size(&out).unwrap();
        assert_eq!(input.dims(), &[1, 12, 12]);
        let mut d = input.clone();
        let forward = conv.fprop_size(&mut d).unwrap();
        assert_eq!(forward.dims(), out.dims());
        assert_eq!(d.dims(), input.dims());
    }

    #[test]
    fn test_bprop_matches_finite_difference() {
        use rand::SeedableRng;
        let mut p = Parameter::<f64>::new();
        let mut conv = Convolution::new(&mut p, 2, 2, 1, 1, Table::one2one(1)).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        conv.forget(&mut rng, ForgetParam::default()).unwrap();

        let mut input = State::with_grad((1, 3, 3)).unwrap();
        let xs: Vec<f64> = (0..9).map(|i| (i as f64) * 0.3 - 1.0).collect();
        input.x.assign(&xs).unwrap();
        let mut output = State::with_grad((1, 1, 1)).unwrap();
        conv.fprop(&input, &mut output).unwrap();

        // loss = sum(out); out.dx = 1
        output.dx_mut().unwrap().fill(1.0);
        input.zero_dx();
        p.clear_dx();
        conv.bprop(&mut input, &mut output).unwrap();

        let eps = 1e-6;
        for idx in 0..9 {
            let mut plus = xs.clone();
            plus[idx] += eps;
            let mut minus = xs.clone();
            minus[idx] -= eps;
            input.x.assign(&plus).unwrap();
            conv.fprop(&input, &mut output).unwrap();
            let lp = output.x.sum();
            input.x.assign(&minus).unwrap();
            conv.fprop(&input, &mut output).unwrap();
            let lm = output.x.sum();
            let numeric = (lp - lm) / (2.0 * eps);
            let analytic = input.dx().unwrap().to_vec()[idx];
            assert!(
                (numeric - analytic).abs() < 1e-5,
                "input grad {} numeric {} analytic {}",
                idx,
                numeric,
                analytic
            );
        }
    }
}
