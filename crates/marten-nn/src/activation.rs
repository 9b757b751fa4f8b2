use marten_core::{Float, Result};

use crate::module::Module;
use crate::parameter::Parameter;
use crate::state::State;

// Nonlinearity modules — stateless element-wise operators
//
// These hold no weights; forward maps elements, backward multiplies the
// incoming gradient by the derivative (and the curvature pass by the
// derivative squared — the diagonal Gauss–Newton term of an element-wise
// operator).

/// Hyperbolic tangent.
pub struct Tanh;

impl<T: Float> Module<T> for Tanh {
    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        output.resize(input.shape().clone())?;
        output.x.map_from(&input.x, |v| v.tanh())
    }

    fn bprop(&mut self, input: &mut State<T>, output: &mut State<T>) -> Result<()> {
        // d tanh = 1 - tanh², and out.x already holds tanh(in.x).
        input
            .dx_mut()?
            .accumulate_zip(&output.x, output.dx()?, |y, g| (T::ONE - y * y) * g)
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &mut State<T>) -> Result<()> {
        input.ddx_mut()?.accumulate_zip(&output.x, output.ddx()?, |y, g| {
            let d = T::ONE - y * y;
            d * d * g
        })
    }

    fn replicate(&self, _param: &mut Parameter<T>) -> Result<Box<dyn Module<T>>> {
        Ok(Box::new(Tanh))
    }

    fn describe(&self) -> String {
        "tanh".to_string()
    }
}

/// The "standard sigmoid": 1.7159 · tanh(2x/3).
///
/// The constants put the unit's effective gain near 1 around the origin and
/// its saturation just past ±1, which keeps target values of ±1 inside the
/// active range.
pub struct StdSigmoid;

const STD_A: f64 = 1.7159;
const STD_B: f64 = 2.0 / 3.0;

impl<T: Float> Module<T> for StdSigmoid {
    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        output.resize(input.shape().clone())?;
        let a = T::from_f64(STD_A);
        let b = T::from_f64(STD_B);
        output.x.map_from(&input.x, |v| a * (v * b).tanh())
    }

    fn bprop(&mut self, input: &mut State<T>, output: &mut State<T>) -> Result<()> {
        // ds = a·b·(1 - tanh²(bx)); recover tanh(bx) = out.x / a.
        let a = T::from_f64(STD_A);
        let b = T::from_f64(STD_B);
        input
            .dx_mut()?
            .accumulate_zip(&output.x, output.dx()?, |y, g| {
                let t = y / a;
                a * b * (T::ONE - t * t) * g
            })
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &mut State<T>) -> Result<()> {
        let a = T::from_f64(STD_A);
        let b = T::from_f64(STD_B);
        input
            .ddx_mut()?
            .accumulate_zip(&output.x, output.ddx()?, |y, g| {
                let t = y / a;
                let d = a * b * (T::ONE - t * t);
                d * d * g
            })
    }

    fn replicate(&self, _param: &mut Parameter<T>) -> Result<Box<dyn Module<T>>> {
        Ok(Box::new(StdSigmoid))
    }

    fn describe(&self) -> String {
        "stdsigmoid".to_string()
    }
}
