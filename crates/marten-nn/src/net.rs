use marten_core::{Float, Result};

use crate::activation::StdSigmoid;
use crate::conv::Convolution;
use crate::linear::{Bias, Linear};
use crate::merge::Flatten;
use crate::parameter::Parameter;
use crate::pool::Subsample;
use crate::table::Table;
use crate::Layers;

// net_cscscf — the classic convolutional topology
//
// Three convolution stages interleaved with two subsampling stages and
// finished by a fully-connected classifier head:
//
//   C0 -> S0 -> C1 -> S1 -> C2 -> flatten -> F
//
// Every weighted stage is followed by a per-map bias and the standard
// sigmoid. Sized so that at the canonical input resolution
// (`bprop_size` of a [classes] output) the last convolution collapses the
// spatial dimensions to 1×1, which fixes the classifier's input width to
// C2's map count.

/// Build a c-s-c-s-c-f network. Kernels are (kh, kw), subsampling strides
/// (sh, sw); each table's output map count chains into the next stage.
#[allow(clippy::too_many_arguments)]
pub fn net_cscscf<T: Float>(
    param: &mut Parameter<T>,
    k0: (usize, usize),
    table0: Table,
    s0: (usize, usize),
    k1: (usize, usize),
    table1: Table,
    s1: (usize, usize),
    k2: (usize, usize),
    table2: Table,
    classes: usize,
) -> Result<Layers<T>> {
    let n0 = table0.out_maps();
    let n1 = table1.out_maps();
    let n2 = table2.out_maps();

    let mut net = Layers::new();
    net.add_module(Box::new(Convolution::new(param, k0.0, k0.1, 1, 1, table0)?));
    net.add_module(Box::new(Bias::new(param, n0)?));
    net.add_module(Box::new(StdSigmoid));
    net.add_module(Box::new(Subsample::new(param, n0, s0.0, s0.1)?));
    net.add_module(Box::new(Bias::new(param, n0)?));
    net.add_module(Box::new(StdSigmoid));
    net.add_module(Box::new(Convolution::new(param, k1.0, k1.1, 1, 1, table1)?));
    net.add_module(Box::new(Bias::new(param, n1)?));
    net.add_module(Box::new(StdSigmoid));
    net.add_module(Box::new(Subsample::new(param, n1, s1.0, s1.1)?));
    net.add_module(Box::new(Bias::new(param, n1)?));
    net.add_module(Box::new(StdSigmoid));
    net.add_module(Box::new(Convolution::new(param, k2.0, k2.1, 1, 1, table2)?));
    net.add_module(Box::new(Bias::new(param, n2)?));
    net.add_module(Box::new(StdSigmoid));
    net.add_module(Box::new(Flatten::new()));
    net.add_module(Box::new(Linear::new(param, n2, classes)?));
    Ok(net)
}

/// The classic 6→16 sparse connection table of lenet-5: each of the 16
/// output maps sees only a subset of the 6 inputs, breaking symmetry and
/// keeping the layer cheap.
fn lenet5_table() -> Table {
    const COLS: [&[usize]; 16] = [
        &[0, 1, 2],
        &[1, 2, 3],
        &[2, 3, 4],
        &[3, 4, 5],
        &[0, 4, 5],
        &[0, 1, 5],
        &[0, 1, 2, 3],
        &[1, 2, 3, 4],
        &[2, 3, 4, 5],
        &[0, 3, 4, 5],
        &[0, 1, 4, 5],
        &[0, 1, 2, 5],
        &[0, 1, 3, 4],
        &[1, 2, 4, 5],
        &[0, 2, 3, 5],
        &[0, 1, 2, 3, 4, 5],
    ];
    let mut pairs = Vec::new();
    for (o, ins) in COLS.iter().enumerate() {
        for &i in ins.iter() {
            pairs.push((i, o));
        }
    }
    Table::from_pairs(pairs)
}

/// lenet-5: the canonical instance of [`net_cscscf`] — 5×5 kernels, 2×2
/// subsampling, 6/16/120 maps with the classic sparse 6→16 table.
/// Canonical input is a single 32×32 map.
pub fn lenet5<T: Float>(param: &mut Parameter<T>, classes: usize) -> Result<Layers<T>> {
    net_cscscf(
        param,
        (5, 5),
        Table::full(1, 6),
        (2, 2),
        (5, 5),
        lenet5_table(),
        (2, 2),
        (5, 5),
        Table::full(16, 120),
        classes,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Module;
    use marten_core::Shape;

    /// A small lenet-flavored build: 1 input map, 6/16/32 maps, 5x5
    /// kernels, 2x2 subsampling. Canonical input is 28x28.
    fn small_net(param: &mut Parameter<f64>) -> Layers<f64> {
        net_cscscf(
            param,
            (5, 5),
            Table::full(1, 6),
            (2, 2),
            (5, 5),
            Table::full(6, 16),
            (2, 2),
            (4, 4),
            Table::full(16, 32),
            10,
        )
        .unwrap()
    }

    #[test]
    fn test_canonical_input_size() {
        let mut p = Parameter::<f64>::new();
        let net = small_net(&mut p);
        // Work backward from a [10] output: linear wants 32 features, the
        // flatten cache is not primed, so the conv stack unrolls from
        // [32,1,1]: 4+... → 28x28.
        let back = Module::<f64>::bprop_size(&net, &Shape::from(10)).unwrap();
        assert_eq!(back.dims(), &[1, 28, 28]);
    }

    #[test]
    fn test_forward_from_canonical_input() {
        use crate::state::State;
        let mut p = Parameter::<f64>::new();
        let mut net = small_net(&mut p);
        let mut input = State::with_grad((1, 28, 28)).unwrap();
        input.x.fill(0.1);
        let mut output = State::with_grad(10).unwrap();
        net.fprop(&input, &mut output).unwrap();
        assert_eq!(output.dims(), &[10]);
    }

    #[test]
    fn test_lenet5_canonical_input_is_32x32() {
        let mut p = Parameter::<f64>::new();
        let net = lenet5(&mut p, 10).unwrap();
        let back = Module::<f64>::bprop_size(&net, &Shape::from(10)).unwrap();
        assert_eq!(back.dims(), &[1, 32, 32]);
    }

    #[test]
    fn test_lenet5_table_shape() {
        let t = lenet5_table();
        assert_eq!(t.out_maps(), 16);
        assert_eq!(t.max_in(), 5);
        // 6 maps of 3 + 9 maps of 4 + 1 map of 6 = 60 entries.
        assert_eq!(t.len(), 60);
        assert_eq!(t.in_degree(15), 6);
    }
}
