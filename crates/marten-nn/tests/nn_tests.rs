// Integration tests for marten-nn
//
// These exercise the module contract across whole pipelines: numeric
// gradient checks against finite differences, memory-optimized vs regular
// forward equivalence, shape-relation round trips, and weight persistence
// through the matrix format.

use rand::rngs::StdRng;
use rand::SeedableRng;

use marten_core::Shape;
use marten_nn::module::Module;
use marten_nn::{
    net_cscscf, Convolution, Ebm2, EuclideanEnergy, Flatten, ForgetParam, Layers, Linear,
    MirrorPad, Parameter, State, StdSigmoid, Subsample, Table, Tanh, ZeroPad,
};

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(
        got.len(),
        expected.len(),
        "length mismatch: {} vs {}",
        got.len(),
        expected.len()
    );
    for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
        assert!(
            approx_eq(*g, *e, tol),
            "index {}: got {} expected {} (tol {})",
            i,
            g,
            e,
            tol
        );
    }
}

// Finite-difference gradient checks

/// Loss of a linear layer under the euclidean energy against a fixed
/// target, as a function of explicit weight values.
fn linear_loss(weights: &[f64], xs: &[f64], target: &[f64], n_in: usize, n_out: usize) -> f64 {
    let mut p = Parameter::<f64>::new();
    let mut lin = Linear::new(&mut p, n_in, n_out).unwrap();
    lin.weight_mut().x.assign(weights).unwrap();
    let mut input = State::with_grad(n_in).unwrap();
    input.x.assign(xs).unwrap();
    let mut output = State::with_grad(n_out).unwrap();
    lin.fprop(&input, &mut output).unwrap();

    let mut tgt = State::with_grad(n_out).unwrap();
    tgt.x.assign(target).unwrap();
    let mut energy = State::with_grad(1).unwrap();
    EuclideanEnergy.fprop(&output, &tgt, &mut energy).unwrap();
    energy.x.to_vec()[0]
}

#[test]
fn test_linear_weight_gradient_matches_finite_difference() {
    let n_in = 4;
    let n_out = 3;
    let mut rng = StdRng::seed_from_u64(11);

    let mut p = Parameter::<f64>::new();
    let mut lin = Linear::new(&mut p, n_in, n_out).unwrap();
    lin.forget(&mut rng, ForgetParam::default()).unwrap();
    let weights = lin.weight().x.to_vec();
    let xs = vec![0.3, -0.7, 0.2, 0.9];
    let target = vec![0.1, -0.1, 0.4];

    // Analytic gradient through fprop + energy bprop + linear bprop.
    let mut input = State::with_grad(n_in).unwrap();
    input.x.assign(&xs).unwrap();
    let mut output = State::with_grad(n_out).unwrap();
    lin.fprop(&input, &mut output).unwrap();
    let mut tgt = State::with_grad(n_out).unwrap();
    tgt.x.assign(&target).unwrap();
    let mut energy = State::with_grad(1).unwrap();
    let mut cost = EuclideanEnergy;
    cost.fprop(&output, &tgt, &mut energy).unwrap();

    energy.dx_mut().unwrap().assign(&[1.0]).unwrap();
    output.zero_dx();
    tgt.zero_dx();
    p.clear_dx();
    input.zero_dx();
    cost.bprop(&mut output, &mut tgt, &energy).unwrap();
    lin.bprop(&mut input, &mut output).unwrap();
    let analytic = lin.weight().dx().unwrap().to_vec();

    // Numeric gradient, one weight at a time.
    let eps = 1e-6;
    for k in 0..weights.len() {
        let mut plus = weights.clone();
        plus[k] += eps;
        let mut minus = weights.clone();
        minus[k] -= eps;
        let lp = linear_loss(&plus, &xs, &target, n_in, n_out);
        let lm = linear_loss(&minus, &xs, &target, n_in, n_out);
        let numeric = (lp - lm) / (2.0 * eps);
        approx::assert_relative_eq!(numeric, analytic[k], max_relative = 1e-4, epsilon = 1e-8);
    }
}

#[test]
fn test_linear_curvature_matches_analytic() {
    // For E = ½‖Wx − t‖², the diagonal Gauss–Newton curvature of W[i][j]
    // is x[j]², and of the input is Σ_i W[i][j]².
    let mut p = Parameter::<f64>::new();
    let mut lin = Linear::new(&mut p, 2, 2).unwrap();
    lin.weight_mut().x.assign(&[1.0, 2.0, -1.0, 0.5]).unwrap();
    let mut input = State::with_curvature(2).unwrap();
    input.x.assign(&[0.4, -0.3]).unwrap();
    let mut output = State::with_curvature(2).unwrap();
    lin.fprop(&input, &mut output).unwrap();

    output.ddx_mut().unwrap().fill(1.0);
    input.zero_ddx();
    p.clear_ddx();
    lin.bbprop(&mut input, &mut output).unwrap();

    // ddW[i][j] = out.ddx[i] * x[j]²
    assert_vec_approx(
        &lin.weight().ddx().unwrap().to_vec(),
        &[0.16, 0.09, 0.16, 0.09],
        1e-12,
    );
    // ddin[j] = Σ_i W[i][j]² (out.ddx = 1)
    assert_vec_approx(&input.ddx().unwrap().to_vec(), &[2.0, 4.25], 1e-12);
}

// Convolution vs a naive dense correlation

#[test]
fn test_convolution_equals_naive_reference() {
    // Single input map, single output map, table {(0,0)}: the module must
    // be a plain dense 2-D correlation. 3x3 kernel over 5x5, stride 1.
    let mut p = Parameter::<f64>::new();
    let mut conv = Convolution::new(&mut p, 3, 3, 1, 1, Table::one2one(1)).unwrap();
    let ker = [0.5, -0.5, 0.0, 1.0, 0.25, -1.0, 0.0, 0.75, -0.25];
    conv.kernel_mut().x.assign(&ker).unwrap();

    let img: Vec<f64> = (0..25).map(|i| ((i * 7) % 11) as f64 * 0.1).collect();
    let mut input = State::with_grad((1, 5, 5)).unwrap();
    input.x.assign(&img).unwrap();
    let mut output = State::with_grad((1, 1, 1)).unwrap();
    conv.fprop(&input, &mut output).unwrap();
    assert_eq!(output.dims(), &[1, 3, 3]);

    let mut expected = vec![0.0; 9];
    for i in 0..3 {
        for j in 0..3 {
            let mut acc = 0.0;
            for u in 0..3 {
                for v in 0..3 {
                    acc += img[(i + u) * 5 + (j + v)] * ker[u * 3 + v];
                }
            }
            expected[i * 3 + j] = acc;
        }
    }
    assert_vec_approx(&output.x.to_vec(), &expected, 1e-12);
}

// Shape-relation round trips

#[test]
fn test_shape_round_trips() {
    let mut p = Parameter::<f64>::new();
    let mut conv = Convolution::new(&mut p, 5, 5, 1, 1, Table::full(3, 8)).unwrap();
    let mut sub = Subsample::new(&mut p, 8, 2, 2).unwrap();
    let mut zpad = ZeroPad::for_kernel(5, 5);
    let mut mpad = MirrorPad::for_kernel(3, 3);

    // fprop_size on the dims returned by bprop_size must reproduce the
    // requested output shape.
    for out in [
        Shape::from((8, 6, 6)),
        Shape::from((8, 1, 1)),
        Shape::from((8, 13, 7)),
    ] {
        let mut d = conv.bprop_size(&out).unwrap();
        let fwd = conv.fprop_size(&mut d).unwrap();
        assert_eq!(fwd.dims(), out.dims(), "conv round trip for {}", out);

        let mut d = sub.bprop_size(&out).unwrap();
        let fwd = sub.fprop_size(&mut d).unwrap();
        assert_eq!(fwd.dims(), out.dims(), "subsample round trip for {}", out);
    }
    for out in [Shape::from((3, 10, 10)), Shape::from((1, 5, 9))] {
        let mut d = Module::<f64>::bprop_size(&zpad, &out).unwrap();
        let fwd = Module::<f64>::fprop_size(&mut zpad, &mut d).unwrap();
        assert_eq!(fwd.dims(), out.dims(), "zero-pad round trip for {}", out);

        let mut d = Module::<f64>::bprop_size(&mpad, &out).unwrap();
        let fwd = Module::<f64>::fprop_size(&mut mpad, &mut d).unwrap();
        assert_eq!(fwd.dims(), out.dims(), "mirror-pad round trip for {}", out);
    }
}

// Memory-optimized vs regular execution

fn conv_pipeline(param: &mut Parameter<f64>) -> Layers<f64> {
    let mut net = Layers::new();
    net.add_module(Box::new(ZeroPad::for_kernel(3, 3)));
    net.add_module(Box::new(Convolution::new(param, 3, 3, 1, 1, Table::full(1, 4)).unwrap()));
    net.add_module(Box::new(Tanh));
    net.add_module(Box::new(Subsample::new(param, 4, 2, 2).unwrap()));
    net.add_module(Box::new(Flatten::new()));
    net.add_module(Box::new(Linear::new(param, 4 * 4 * 4, 3).unwrap()));
    net
}

#[test]
fn test_memory_optimized_fprop_equivalence() {
    let mut rng = StdRng::seed_from_u64(23);
    let mut p = Parameter::<f64>::new();
    let mut net = conv_pipeline(&mut p);
    net.forget(&mut rng, ForgetParam::default()).unwrap();
    let weights = p.values();

    let img: Vec<f64> = (0..64).map(|i| ((i % 13) as f64 - 6.0) * 0.1).collect();
    let mut input = State::with_grad((1, 8, 8)).unwrap();
    input.x.assign(&img).unwrap();
    let mut output = State::with_grad(3).unwrap();
    net.fprop(&input, &mut output).unwrap();
    let expected = output.x.to_vec();

    // Same weights, fresh container, ping-pong mode.
    let mut p2 = Parameter::<f64>::new();
    let mut net2 = conv_pipeline(&mut p2);
    p2.set_values(&weights).unwrap();
    let mut a = State::with_grad((1, 8, 8)).unwrap();
    a.x.assign(&img).unwrap();
    let mut b = State::with_grad(3).unwrap();
    let in_out = net2.optimize_fprop(&mut a, &mut b).unwrap();
    let got = if in_out { b.x.to_vec() } else { a.x.to_vec() };
    assert_vec_approx(&got, &expected, 1e-12);
}

// Gradient accumulation contract

#[test]
fn test_bprop_accumulates_instead_of_overwriting() {
    let mut p = Parameter::<f64>::new();
    let mut lin = Linear::new(&mut p, 3, 2).unwrap();
    lin.weight_mut()
        .x
        .assign(&[0.2, -0.1, 0.4, 0.0, 0.3, -0.2])
        .unwrap();
    let mut input = State::with_grad(3).unwrap();
    input.x.assign(&[1.0, 2.0, 3.0]).unwrap();
    let mut output = State::with_grad(2).unwrap();
    lin.fprop(&input, &mut output).unwrap();
    output.dx_mut().unwrap().assign(&[1.0, 1.0]).unwrap();

    lin.bprop(&mut input, &mut output).unwrap();
    let once = input.dx().unwrap().to_vec();
    let w_once = lin.weight().dx().unwrap().to_vec();

    // A second pass WITHOUT clearing must double, not reproduce.
    lin.bprop(&mut input, &mut output).unwrap();
    let twice = input.dx().unwrap().to_vec();
    let w_twice = lin.weight().dx().unwrap().to_vec();
    for (a, b) in once.iter().zip(twice.iter()) {
        assert!(approx_eq(2.0 * a, *b, 1e-12));
    }
    for (a, b) in w_once.iter().zip(w_twice.iter()) {
        assert!(approx_eq(2.0 * a, *b, 1e-12));
    }

    // Clearing restores the single-pass gradient.
    input.zero_dx();
    p.clear_dx();
    lin.bprop(&mut input, &mut output).unwrap();
    assert_vec_approx(&input.dx().unwrap().to_vec(), &once, 1e-12);
}

// Whole-network training smoke test

#[test]
fn test_cscscf_training_step_reduces_energy() {
    let mut rng = StdRng::seed_from_u64(5);
    let mut p = Parameter::<f64>::new();
    let mut net = net_cscscf(
        &mut p,
        (5, 5),
        Table::full(1, 4),
        (2, 2),
        (5, 5),
        Table::full(4, 6),
        (2, 2),
        (4, 4),
        Table::full(6, 8),
        3,
    )
    .unwrap();
    net.forget(&mut rng, ForgetParam::default()).unwrap();

    let canonical = Module::<f64>::bprop_size(&net, &Shape::from(3)).unwrap();
    assert_eq!(canonical.dims(), &[1, 28, 28]);

    let mut input = State::with_grad(canonical).unwrap();
    let img: Vec<f64> = (0..28 * 28).map(|i| ((i % 17) as f64 - 8.0) * 0.05).collect();
    input.x.assign(&img).unwrap();
    let mut output = State::with_grad(3).unwrap();
    let mut target = State::with_grad(3).unwrap();
    target.x.assign(&[1.0, -1.0, 0.0]).unwrap();
    let mut energy = State::with_grad(1).unwrap();
    let mut cost = EuclideanEnergy;

    net.fprop(&input, &mut output).unwrap();
    cost.fprop(&output, &target, &mut energy).unwrap();
    let e0 = energy.x.to_vec()[0];

    energy.dx_mut().unwrap().assign(&[1.0]).unwrap();
    output.zero_dx();
    target.zero_dx();
    input.zero_dx();
    p.clear_dx();
    cost.bprop(&mut output, &mut target, &energy).unwrap();
    net.bprop(&mut input, &mut output).unwrap();
    p.update(0.01).unwrap();

    net.fprop(&input, &mut output).unwrap();
    cost.fprop(&output, &target, &mut energy).unwrap();
    let e1 = energy.x.to_vec()[0];
    assert!(e1 < e0, "energy did not decrease: {} -> {}", e0, e1);
}

// Weight persistence

#[test]
fn test_parameter_save_load_round_trip() {
    let mut rng = StdRng::seed_from_u64(99);
    let mut p = Parameter::<f64>::new();
    let mut net = conv_pipeline(&mut p);
    net.forget(&mut rng, ForgetParam::default()).unwrap();
    let saved = p.values();

    let mut path = std::env::temp_dir();
    path.push(format!("marten-nn-test-weights-{}.mat", std::process::id()));
    p.save(&path).unwrap();

    let mut p2 = Parameter::<f64>::new();
    let _net2 = conv_pipeline(&mut p2);
    p2.load(&path).unwrap();
    assert_vec_approx(&p2.values(), &saved, 1e-12);
    std::fs::remove_file(&path).ok();
}

// StdSigmoid saturation behavior inside a pipeline

#[test]
fn test_stdsigmoid_bounded_outputs() {
    let mut net = Layers::<f64>::new();
    net.add_module(Box::new(StdSigmoid));
    let mut input = State::with_grad(5).unwrap();
    input.x.assign(&[-100.0, -1.0, 0.0, 1.0, 100.0]).unwrap();
    let mut output = State::with_grad(5).unwrap();
    net.fprop(&input, &mut output).unwrap();
    let v = output.x.to_vec();
    assert!(v.iter().all(|x| x.abs() <= 1.7159 + 1e-9));
    assert!(approx_eq(v[2], 0.0, 1e-12));
    assert!(v[4] > 1.0 && v[0] < -1.0);
}
