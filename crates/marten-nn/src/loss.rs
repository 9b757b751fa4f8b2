use marten_core::{Error, Float, Result};

use crate::module::{Ebm1, Ebm2, Module};
use crate::state::State;

// EuclideanEnergy — squared-distance cost between two states
//
//   E = ½ Σ (in1 − in2)²
//
// The energy lands in a one-element state. Backward reads the energy
// state's dx as the seed (callers set energy.dx = 1 for a plain loss):
//
//   in1.dx += (in1 − in2) · e.dx
//   in2.dx += (in2 − in1) · e.dx
//
// The curvature pass uses the diagonal Gauss–Newton term: the residual's
// Jacobian is the identity, so d²E/din² = 1 and both inputs receive the
// energy curvature seed unchanged.

/// Squared Euclidean distance energy between two equally-sized states.
pub struct EuclideanEnergy;

impl<T: Float> Ebm2<T> for EuclideanEnergy {
    fn fprop(&mut self, in1: &State<T>, in2: &State<T>, energy: &mut State<T>) -> Result<()> {
        if in1.elem_count() != in2.elem_count() {
            return Err(Error::ShapeMismatch {
                expected: in1.shape().clone(),
                got: in2.shape().clone(),
            });
        }
        energy.resize(1)?;
        let mut e = T::ZERO;
        for (a, b) in in1.x.to_vec().into_iter().zip(in2.x.to_vec()) {
            let d = a - b;
            e += d * d;
        }
        energy.x.set(&[0], T::HALF * e)
    }

    fn bprop(&mut self, in1: &mut State<T>, in2: &mut State<T>, energy: &State<T>) -> Result<()> {
        let seed = energy.dx()?.get(&[0])?;
        let a = in1.x.clone();
        let b = in2.x.clone();
        in1.dx_mut()?.accumulate_zip(&a, &b, |a, b| (a - b) * seed)?;
        in2.dx_mut()?.accumulate_zip(&b, &a, |b, a| (b - a) * seed)
    }

    fn bbprop(&mut self, in1: &mut State<T>, in2: &mut State<T>, energy: &State<T>) -> Result<()> {
        let seed = energy.ddx()?.get(&[0])?;
        in1.ddx_mut()?.add_scalar(seed);
        in2.ddx_mut()?.add_scalar(seed);
        Ok(())
    }

    fn infer(&mut self, in1: &State<T>, in2: &mut State<T>) -> Result<()> {
        // The energy is minimized (zero) when in2 equals in1.
        in2.resize(in1.shape().clone())?;
        in2.x.copy_from(&in1.x)
    }

    fn describe(&self) -> String {
        "euclidean-energy".to_string()
    }
}

/// Quadratic penalty energy on a single state: E = ½ Σ in².
pub struct SquareEnergy;

impl<T: Float> Ebm1<T> for SquareEnergy {
    fn fprop(&mut self, input: &State<T>, energy: &mut State<T>) -> Result<()> {
        energy.resize(1)?;
        let mut e = T::ZERO;
        for v in input.x.to_vec() {
            e += v * v;
        }
        energy.x.set(&[0], T::HALF * e)
    }

    fn bprop(&mut self, input: &mut State<T>, energy: &State<T>) -> Result<()> {
        let seed = energy.dx()?.get(&[0])?;
        let x = input.x.clone();
        input.dx_mut()?.accumulate_map(&x, |v| v * seed)
    }

    fn bbprop(&mut self, input: &mut State<T>, energy: &State<T>) -> Result<()> {
        // d²E/din² = 1.
        let seed = energy.ddx()?.get(&[0])?;
        input.ddx_mut()?.add_scalar(seed);
        Ok(())
    }

    fn describe(&self) -> String {
        "square-energy".to_string()
    }
}

// fc_ebm — machine + cost fused into one energy module
//
// The classic trainable assembly: a feature-extraction machine feeding a
// cost. The hidden state between them is owned here, so callers see a
// plain energy interface while both halves get their gradients.

/// A module followed by a single-input energy: E(in) = cost(machine(in)).
pub struct FcEbm1<T: Float> {
    machine: Box<dyn Module<T>>,
    cost: Box<dyn Ebm1<T>>,
    hidden: State<T>,
}

impl<T: Float> FcEbm1<T> {
    pub fn new(machine: Box<dyn Module<T>>, cost: Box<dyn Ebm1<T>>) -> Result<Self> {
        Ok(FcEbm1 {
            machine,
            cost,
            hidden: State::with_curvature(1)?,
        })
    }

    pub fn hidden(&self) -> &State<T> {
        &self.hidden
    }
}

impl<T: Float> Ebm1<T> for FcEbm1<T> {
    fn fprop(&mut self, input: &State<T>, energy: &mut State<T>) -> Result<()> {
        self.machine.fprop(input, &mut self.hidden)?;
        self.cost.fprop(&self.hidden, energy)
    }

    fn bprop(&mut self, input: &mut State<T>, energy: &State<T>) -> Result<()> {
        self.hidden.zero_dx();
        self.cost.bprop(&mut self.hidden, energy)?;
        self.machine.bprop(input, &mut self.hidden)
    }

    fn bbprop(&mut self, input: &mut State<T>, energy: &State<T>) -> Result<()> {
        self.hidden.zero_ddx();
        self.cost.bbprop(&mut self.hidden, energy)?;
        self.machine.bbprop(input, &mut self.hidden)
    }

    fn describe(&self) -> String {
        format!("fc-ebm1 [ {} | {} ]", self.machine.describe(), self.cost.describe())
    }
}

/// A module followed by a two-input energy:
/// E(in, target) = cost(machine(in), target).
pub struct FcEbm2<T: Float> {
    machine: Box<dyn Module<T>>,
    cost: Box<dyn Ebm2<T>>,
    hidden: State<T>,
}

impl<T: Float> FcEbm2<T> {
    pub fn new(machine: Box<dyn Module<T>>, cost: Box<dyn Ebm2<T>>) -> Result<Self> {
        Ok(FcEbm2 {
            machine,
            cost,
            hidden: State::with_curvature(1)?,
        })
    }

    pub fn hidden(&self) -> &State<T> {
        &self.hidden
    }
}

impl<T: Float> Ebm2<T> for FcEbm2<T> {
    fn fprop(&mut self, in1: &State<T>, in2: &State<T>, energy: &mut State<T>) -> Result<()> {
        self.machine.fprop(in1, &mut self.hidden)?;
        self.cost.fprop(&self.hidden, in2, energy)
    }

    fn bprop(&mut self, in1: &mut State<T>, in2: &mut State<T>, energy: &State<T>) -> Result<()> {
        self.hidden.zero_dx();
        self.cost.bprop(&mut self.hidden, in2, energy)?;
        self.machine.bprop(in1, &mut self.hidden)
    }

    fn bbprop(&mut self, in1: &mut State<T>, in2: &mut State<T>, energy: &State<T>) -> Result<()> {
        self.hidden.zero_ddx();
        self.cost.bbprop(&mut self.hidden, in2, energy)?;
        self.machine.bbprop(in1, &mut self.hidden)
    }

    fn infer(&mut self, in1: &State<T>, in2: &mut State<T>) -> Result<()> {
        // Minimizing over the target: run the machine, then let the cost
        // infer against the machine's output.
        self.machine.fprop(in1, &mut self.hidden)?;
        self.cost.infer(&self.hidden, in2)
    }

    fn describe(&self) -> String {
        format!("fc-ebm2 [ {} | {} ]", self.machine.describe(), self.cost.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_energy_value() {
        let mut m = EuclideanEnergy;
        let mut a = State::<f64>::with_grad(3).unwrap();
        a.x.assign(&[1.0, 2.0, 3.0]).unwrap();
        let mut b = State::<f64>::with_grad(3).unwrap();
        b.x.assign(&[1.0, 0.0, 0.0]).unwrap();
        let mut e = State::with_grad(1).unwrap();
        m.fprop(&a, &b, &mut e).unwrap();
        // ½ (0 + 4 + 9) = 6.5
        assert_eq!(e.x.to_vec(), vec![6.5]);
    }

    #[test]
    fn test_bprop_gradients_oppose() {
        let mut m = EuclideanEnergy;
        let mut a = State::<f64>::with_grad(2).unwrap();
        a.x.assign(&[2.0, -1.0]).unwrap();
        let mut b = State::<f64>::with_grad(2).unwrap();
        b.x.assign(&[0.0, 1.0]).unwrap();
        let mut e = State::with_grad(1).unwrap();
        m.fprop(&a, &b, &mut e).unwrap();
        e.dx_mut().unwrap().assign(&[1.0]).unwrap();
        m.bprop(&mut a, &mut b, &e).unwrap();
        assert_eq!(a.dx().unwrap().to_vec(), vec![2.0, -2.0]);
        assert_eq!(b.dx().unwrap().to_vec(), vec![-2.0, 2.0]);
    }

    #[test]
    fn test_infer_copies_first_input() {
        let mut m = EuclideanEnergy;
        let mut a = State::<f64>::with_grad(2).unwrap();
        a.x.assign(&[5.0, 6.0]).unwrap();
        let mut b = State::<f64>::with_grad(2).unwrap();
        m.infer(&a, &mut b).unwrap();
        assert_eq!(b.x.to_vec(), vec![5.0, 6.0]);

        let mut e = State::with_grad(1).unwrap();
        m.fprop(&a, &b, &mut e).unwrap();
        assert_eq!(e.x.to_vec(), vec![0.0]);
    }

    #[test]
    fn test_mismatched_inputs_rejected() {
        let mut m = EuclideanEnergy;
        let a = State::<f64>::with_grad(2).unwrap();
        let b = State::<f64>::with_grad(3).unwrap();
        let mut e = State::with_grad(1).unwrap();
        assert!(m.fprop(&a, &b, &mut e).is_err());
    }

    #[test]
    fn test_square_energy() {
        let mut m = SquareEnergy;
        let mut a = State::<f64>::with_grad(2).unwrap();
        a.x.assign(&[3.0, -4.0]).unwrap();
        let mut e = State::with_grad(1).unwrap();
        m.fprop(&a, &mut e).unwrap();
        assert_eq!(e.x.to_vec(), vec![12.5]);

        e.dx_mut().unwrap().assign(&[1.0]).unwrap();
        m.bprop(&mut a, &e).unwrap();
        assert_eq!(a.dx().unwrap().to_vec(), vec![3.0, -4.0]);
    }

    #[test]
    fn test_fc_ebm2_chains_machine_and_cost() {
        use crate::linear::Linear;
        use crate::parameter::Parameter;

        let mut p = Parameter::<f64>::new();
        let mut lin = Linear::new(&mut p, 2, 1).unwrap();
        lin.weight_mut().x.assign(&[1.0, 1.0]).unwrap();
        let mut ebm = FcEbm2::new(Box::new(lin), Box::new(EuclideanEnergy)).unwrap();

        let mut input = State::with_grad(2).unwrap();
        input.x.assign(&[1.0, 2.0]).unwrap();
        let mut target = State::with_grad(1).unwrap();
        target.x.assign(&[1.0]).unwrap();
        let mut e = State::with_grad(1).unwrap();
        ebm.fprop(&input, &target, &mut e).unwrap();
        // machine out = 3; E = ½(3-1)² = 2
        assert_eq!(e.x.to_vec(), vec![2.0]);

        e.dx_mut().unwrap().assign(&[1.0]).unwrap();
        input.zero_dx();
        target.zero_dx();
        p.clear_dx();
        ebm.bprop(&mut input, &mut target, &e).unwrap();
        // dE/din = Wᵀ(out - t) = [2, 2]
        assert_eq!(input.dx().unwrap().to_vec(), vec![2.0, 2.0]);
        assert_eq!(target.dx().unwrap().to_vec(), vec![-2.0]);

        // infer drives the target to the machine output (zero energy).
        ebm.infer(&input, &mut target).unwrap();
        ebm.fprop(&input, &target, &mut e).unwrap();
        assert_eq!(e.x.to_vec(), vec![0.0]);
    }

    #[test]
    fn test_fc_ebm1_penalizes_machine_output() {
        use crate::module::Identity;
        let mut ebm = FcEbm1::new(Box::new(Identity), Box::new(SquareEnergy)).unwrap();
        let mut input = State::<f64>::with_grad(2).unwrap();
        input.x.assign(&[1.0, -2.0]).unwrap();
        let mut e = State::with_grad(1).unwrap();
        ebm.fprop(&input, &mut e).unwrap();
        assert_eq!(e.x.to_vec(), vec![2.5]);

        e.dx_mut().unwrap().assign(&[1.0]).unwrap();
        ebm.bprop(&mut input, &e).unwrap();
        assert_eq!(input.dx().unwrap().to_vec(), vec![1.0, -2.0]);
    }
}
