use rand::rngs::StdRng;
use rand::Rng;

use marten_core::{Float, Result, Tensor};

// Weight initialization — fan-in-scaled uniform draws
//
// Every learnable module re-initializes its weights the same way: draw
// uniformly from [-bound, bound] with bound = value / fanin^exponent. The
// fan-in is the number of inputs feeding one output unit (for a convolution
// kernel: kh * kw * maps-connected-to-that-output), so deeper-fan layers get
// proportionally smaller weights and the signal variance stays bounded
// through the stack.

/// Parameters of the fan-in-scaled uniform initialization:
/// `bound = value / fanin^exponent`.
#[derive(Debug, Clone, Copy)]
pub struct ForgetParam {
    pub value: f64,
    pub exponent: f64,
}

impl ForgetParam {
    pub fn new(value: f64, exponent: f64) -> Self {
        ForgetParam { value, exponent }
    }

    /// The uniform bound for a unit with the given fan-in.
    pub fn bound(&self, fanin: usize) -> f64 {
        self.value / (fanin.max(1) as f64).powf(self.exponent)
    }
}

impl Default for ForgetParam {
    /// The conventional setting: value 1, square-root fan-in scaling.
    fn default() -> Self {
        ForgetParam::new(1.0, 0.5)
    }
}

/// Fill a tensor with uniform draws from [-bound, bound].
pub fn uniform_fill<T: Float>(t: &mut Tensor<T>, bound: f64, rng: &mut StdRng) -> Result<()> {
    let values: Vec<T> = (0..t.elem_count())
        .map(|_| T::from_f64(rng.gen_range(-bound..=bound)))
        .collect();
    t.assign(&values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_bound_formula() {
        let p = ForgetParam::new(1.0, 0.5);
        assert!((p.bound(25) - 0.2).abs() < 1e-12);
        let p = ForgetParam::new(2.0, 1.0);
        assert!((p.bound(4) - 0.5).abs() < 1e-12);
        // Degenerate fan-in clamps to 1 instead of dividing by zero.
        assert!((ForgetParam::new(1.0, 0.5).bound(0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_uniform_fill_within_bounds() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut t = Tensor::<f64>::new(1000).unwrap();
        uniform_fill(&mut t, 0.3, &mut rng).unwrap();
        for v in t.to_vec() {
            assert!(v >= -0.3 && v <= 0.3, "value {} out of bounds", v);
        }
        // Not all equal: the fill actually drew random values.
        assert!(t.max_abs() > 0.0);
    }

    #[test]
    fn test_uniform_fill_deterministic_with_seed() {
        let mut a = Tensor::<f64>::new(16).unwrap();
        let mut b = Tensor::<f64>::new(16).unwrap();
        let mut rng1 = StdRng::seed_from_u64(7);
        let mut rng2 = StdRng::seed_from_u64(7);
        uniform_fill(&mut a, 1.0, &mut rng1).unwrap();
        uniform_fill(&mut b, 1.0, &mut rng2).unwrap();
        assert_eq!(a.to_vec(), b.to_vec());
    }
}
