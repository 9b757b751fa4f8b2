use marten_core::{Float, Result, Shape};

use crate::module::{BiModule, Module};
use crate::parameter::Parameter;
use crate::state::State;

// Flatten / FlatMerge — feature-vector plumbing
//
// Flatten turns a stack of feature maps into the 1-D vector a classifier
// head consumes. FlatMerge concatenates two states along the feature
// dimension after flattening each — the fan-in counterpart of a branch,
// fusing multi-branch features into one vector.

/// Flatten any input to a 1-D feature vector.
///
/// The input shape seen by the last forward pass (or `fprop_size` query) is
/// cached so `bprop_size` can invert the flattening.
pub struct Flatten {
    cached_in: Option<Shape>,
}

impl Flatten {
    pub fn new() -> Self {
        Flatten { cached_in: None }
    }
}

impl Default for Flatten {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Float> Module<T> for Flatten {
    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        self.cached_in = Some(input.shape().clone());
        output.resize(input.elem_count())?;
        output.x.copy_from(&input.x)
    }

    fn bprop(&mut self, input: &mut State<T>, output: &mut State<T>) -> Result<()> {
        input.dx_mut()?.add_assign(output.dx()?)
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &mut State<T>) -> Result<()> {
        input.ddx_mut()?.add_assign(output.ddx()?)
    }

    fn fprop_size(&mut self, input: &mut Shape) -> Result<Shape> {
        self.cached_in = Some(input.clone());
        Ok(Shape::from(input.elem_count()))
    }

    fn bprop_size(&self, output: &Shape) -> Result<Shape> {
        // Invert through the cached input shape when it matches. Without a
        // cache, assume the collapsed-spatial case [n, 1, 1]: that is what
        // a flatten sitting between a convolution stack and a classifier
        // head sees at the canonical input size.
        match &self.cached_in {
            Some(s) if s.elem_count() == output.elem_count() => Ok(s.clone()),
            _ => Ok(Shape::from((output.elem_count(), 1, 1))),
        }
    }

    fn replicate(&self, _param: &mut Parameter<T>) -> Result<Box<dyn Module<T>>> {
        Ok(Box::new(Flatten {
            cached_in: self.cached_in.clone(),
        }))
    }

    fn describe(&self) -> String {
        "flatten".to_string()
    }
}

/// Concatenate two flattened states into one feature vector:
/// out = [flatten(in1), flatten(in2)].
pub struct FlatMerge;

impl<T: Float> BiModule<T> for FlatMerge {
    fn fprop(&mut self, in1: &State<T>, in2: &State<T>, output: &mut State<T>) -> Result<()> {
        let n1 = in1.elem_count();
        let n2 = in2.elem_count();
        output.resize(n1 + n2)?;
        output.x.narrow(0, 0, n1)?.copy_from(&in1.x)?;
        output.x.narrow(0, n1, n2)?.copy_from(&in2.x)
    }

    fn bprop(&mut self, in1: &mut State<T>, in2: &mut State<T>, output: &State<T>) -> Result<()> {
        let n1 = in1.elem_count();
        let n2 = in2.elem_count();
        in1.dx_mut()?.add_assign(&output.dx()?.narrow(0, 0, n1)?)?;
        in2.dx_mut()?.add_assign(&output.dx()?.narrow(0, n1, n2)?)
    }

    fn bbprop(&mut self, in1: &mut State<T>, in2: &mut State<T>, output: &State<T>) -> Result<()> {
        let n1 = in1.elem_count();
        let n2 = in2.elem_count();
        in1.ddx_mut()?.add_assign(&output.ddx()?.narrow(0, 0, n1)?)?;
        in2.ddx_mut()?.add_assign(&output.ddx()?.narrow(0, n1, n2)?)
    }

    fn describe(&self) -> String {
        "flat-merge".to_string()
    }
}
