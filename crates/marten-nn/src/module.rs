use rand::rngs::StdRng;

use marten_core::{Float, Result, Shape, Tensor};

use crate::init::ForgetParam;
use crate::parameter::Parameter;
use crate::state::State;

// Module traits — The interface every network operator implements
//
// A module is stateless with respect to activations: values, gradients, and
// curvatures live in caller-supplied States, and a module may only own its
// learnable weights (allocated from a Parameter). Each module implements
// three propagation passes over those states:
//
//   fprop  — read in.x, write out.x (resizing out as needed)
//   bprop  — read out.dx and in.x, ACCUMULATE into in.dx and weight dx
//   bbprop — like bprop but propagates squared-Jacobian (diagonal
//            Gauss–Newton) curvature terms into ddx buffers
//
// PROTOCOL: bprop/bbprop before fprop on the same buffers is undefined (it
// reads stale values — garbage in, garbage out); this is a documented
// discipline, not something the types enforce. Gradient buffers accumulate,
// so callers clear them between passes.
//
// WHY A TRAIT? Containers hold `Box<dyn Module<T>>`, so heterogeneous
// pipelines compose without an inheritance hierarchy. Capability queries
// that the container needs (like "is this sub-module a branch?") are part
// of the trait rather than answered by downcasting.

/// Single-input, single-output network operator.
pub trait Module<T: Float> {
    /// Forward pass: read `input.x`, resize `output`, write `output.x`.
    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()>;

    /// Gradient pass: read `output.dx` and `input.x`, accumulate into
    /// `input.dx` and this module's weight gradients.
    fn bprop(&mut self, input: &mut State<T>, output: &mut State<T>) -> Result<()>;

    /// Curvature pass: like `bprop` with squared-Jacobian terms (a linear
    /// operator propagates w² where bprop propagates w).
    fn bbprop(&mut self, input: &mut State<T>, output: &mut State<T>) -> Result<()>;

    /// Re-initialize learnable weights with fan-in-scaled uniform draws.
    /// Modules without weights ignore this.
    fn forget(&mut self, _rng: &mut StdRng, _init: ForgetParam) -> Result<()> {
        Ok(())
    }

    /// Rescale learnable weights to a canonical norm. Modules without
    /// weights (or without a meaningful normalization) ignore this.
    fn normalize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Shape relation, forward direction: the output shape produced for
    /// `input`. Also MUTATES `input` to the nearest input shape compatible
    /// with this module's receptive-field arithmetic (the round trip
    /// through `bprop_size`) — callers use this dual role to find a valid
    /// network input size for a desired output size.
    fn fprop_size(&mut self, input: &mut Shape) -> Result<Shape> {
        Ok(input.clone())
    }

    /// Shape relation, backward direction: the minimal input shape that
    /// produces at least `output`.
    fn bprop_size(&self, output: &Shape) -> Result<Shape> {
        Ok(output.clone())
    }

    /// Whether this module is a container whose output leaves through a
    /// side buffer instead of the main path (see `Layers`).
    fn is_branch_container(&self) -> bool {
        false
    }

    /// Clear the gradient buffers of any hidden states this module owns.
    /// Containers override this; leaf modules hold no hidden activations.
    /// The main path calls it once per backward pass, covering its branches
    /// — a branch never clears on its own.
    fn clear_hidden_grads(&mut self) {}

    /// Clear the curvature buffers of any hidden states this module owns.
    fn clear_hidden_curvatures(&mut self) {}

    /// Deep-clone this module, allocating fresh weights from `param` and
    /// copying the current weight values into them.
    fn replicate(&self, param: &mut Parameter<T>) -> Result<Box<dyn Module<T>>>;

    /// Overwrite this module's weights from a tensor of matching shape.
    /// Weightless modules reject this.
    fn load_x(&mut self, _weights: &Tensor<T>) -> Result<()> {
        Err(marten_core::Error::msg(format!(
            "{}: module has no weights to load",
            self.describe()
        )))
    }

    /// One-line human description of the operator and its hyper-parameters.
    fn describe(&self) -> String;
}

/// Two-input, single-output operator (mergers, distance layers).
pub trait BiModule<T: Float> {
    fn fprop(&mut self, in1: &State<T>, in2: &State<T>, output: &mut State<T>) -> Result<()>;

    fn bprop(&mut self, in1: &mut State<T>, in2: &mut State<T>, output: &State<T>) -> Result<()>;

    fn bbprop(&mut self, in1: &mut State<T>, in2: &mut State<T>, output: &State<T>) -> Result<()>;

    fn describe(&self) -> String;
}

/// Single-input energy module: fprop produces a scalar energy.
pub trait Ebm1<T: Float> {
    fn fprop(&mut self, input: &State<T>, energy: &mut State<T>) -> Result<()>;
    fn bprop(&mut self, input: &mut State<T>, energy: &State<T>) -> Result<()>;
    fn bbprop(&mut self, input: &mut State<T>, energy: &State<T>) -> Result<()>;
    fn describe(&self) -> String;
}

/// Two-input energy module (costs/losses). `infer` minimizes the energy
/// over the second input.
pub trait Ebm2<T: Float> {
    fn fprop(&mut self, in1: &State<T>, in2: &State<T>, energy: &mut State<T>) -> Result<()>;
    fn bprop(&mut self, in1: &mut State<T>, in2: &mut State<T>, energy: &State<T>) -> Result<()>;
    fn bbprop(&mut self, in1: &mut State<T>, in2: &mut State<T>, energy: &State<T>) -> Result<()>;
    /// Set `in2` to the minimizer of the energy given `in1`.
    fn infer(&mut self, in1: &State<T>, in2: &mut State<T>) -> Result<()>;
    fn describe(&self) -> String;
}

/// Identity passthrough. Mostly useful as a placeholder network in tests
/// and as the trivial detector front end.
pub struct Identity;

impl<T: Float> Module<T> for Identity {
    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        output.resize(input.shape().clone())?;
        output.x.copy_from(&input.x)
    }

    fn bprop(&mut self, input: &mut State<T>, output: &mut State<T>) -> Result<()> {
        input.dx_mut()?.add_assign(output.dx()?)
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &mut State<T>) -> Result<()> {
        input.ddx_mut()?.add_assign(output.ddx()?)
    }

    fn replicate(&self, _param: &mut Parameter<T>) -> Result<Box<dyn Module<T>>> {
        Ok(Box::new(Identity))
    }

    fn describe(&self) -> String {
        "identity".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_roundtrip() {
        let mut m = Identity;
        let mut input = State::<f64>::with_grad((2, 2)).unwrap();
        input.x.assign(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        let mut output = State::with_grad((1, 1)).unwrap();
        Module::fprop(&mut m, &input, &mut output).unwrap();
        assert_eq!(output.x.to_vec(), vec![1.0, 2.0, 3.0, 4.0]);

        output.dx_mut().unwrap().fill(1.0);
        Module::bprop(&mut m, &mut input, &mut output).unwrap();
        assert_eq!(input.dx().unwrap().sum(), 4.0);
    }

    #[test]
    fn test_identity_size_relations() {
        let mut m = Identity;
        let mut s = Shape::from((3, 10, 10));
        let out = Module::<f64>::fprop_size(&mut m, &mut s).unwrap();
        assert_eq!(out.dims(), &[3, 10, 10]);
        let back = Module::<f64>::bprop_size(&m, &out).unwrap();
        assert_eq!(back.dims(), &[3, 10, 10]);
    }
}
