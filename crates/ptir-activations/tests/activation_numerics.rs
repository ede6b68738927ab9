use ptir_activations::backend::ptir_utils::{
    tensor_literal_f32, tensor_literal_f64, tensor_literal_i32,
};
use ptir_activations::backend::spec::{Operation, PortableBackend, TensorLiteral};
use ptir_activations::ops::lowering;
use ptir_activations::GraphBuilder;
use ptir_activations_ref_cpu::{CpuPortableBackend, CpuTensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const FORWARD: [&str; 3] = ["Relu", "Relu6", "Relu1"];
const GRADIENTS: [&str; 3] = ["ReluGrad", "Relu6Grad", "Relu1Grad"];

/// Lowers `op` over parameters shaped like `inputs` and evaluates it on the reference backend.
fn run(op: &str, inputs: &[TensorLiteral]) -> CpuTensor {
    let mut b = GraphBuilder::new();
    let params = inputs
        .iter()
        .map(|lit| b.parameter(lit.spec.clone()).expect("parameter"))
        .collect::<Vec<_>>();
    let out = lowering::lower(op, &mut b, &params).unwrap_or_else(|err| panic!("{op}: {err}"));
    let program = b.finish(op, &[out]).expect("finish");

    let backend = CpuPortableBackend::new();
    let handles = inputs
        .iter()
        .cloned()
        .map(|lit| backend.materialize(lit).expect("materialize"))
        .collect::<Vec<_>>();
    let mut outputs = backend
        .run_program(&program, &handles)
        .unwrap_or_else(|err| panic!("{op}: {err}"));
    assert_eq!(outputs.len(), 1);
    outputs.pop().expect("single output")
}

fn run_f32(op: &str, inputs: &[TensorLiteral]) -> Vec<f32> {
    run(op, inputs).to_f32_vec().expect("f32 output")
}

fn reference_forward(op: &str, x: f32) -> f32 {
    match op {
        "Relu" => x.max(0.0),
        "Relu6" => x.clamp(0.0, 6.0),
        "Relu1" => x.clamp(0.0, 1.0),
        other => panic!("no reference for {other}"),
    }
}

fn reference_grad(op: &str, g: f32, f: f32) -> f32 {
    let upper = match op {
        "ReluGrad" => f32::INFINITY,
        "Relu6Grad" => 6.0,
        "Relu1Grad" => 1.0,
        other => panic!("no reference for {other}"),
    };
    if f > 0.0 && f < upper {
        g
    } else {
        0.0
    }
}

#[test]
fn forward_activations_on_mixed_features() {
    let x = tensor_literal_f32(&[5], &[-2.0, 0.0, 3.0, 6.0, 8.0]);
    assert_eq!(run_f32("Relu", &[x.clone()]), vec![0.0, 0.0, 3.0, 6.0, 8.0]);
    assert_eq!(run_f32("Relu6", &[x.clone()]), vec![0.0, 0.0, 3.0, 6.0, 6.0]);
    assert_eq!(run_f32("Relu1", &[x]), vec![0.0, 0.0, 1.0, 1.0, 1.0]);
}

#[test]
fn saturating_activations_on_reference_points() {
    let x = tensor_literal_f32(&[4], &[-1.0, 0.5, 3.0, 10.0]);
    assert_eq!(run_f32("Relu6", &[x.clone()]), vec![0.0, 0.5, 3.0, 6.0]);
    assert_eq!(run_f32("Relu1", &[x]), vec![0.0, 0.5, 1.0, 1.0]);
}

#[test]
fn relu_grad_passes_ones_where_feature_is_positive() {
    let g = tensor_literal_f32(&[5], &[1.0; 5]);
    let f = tensor_literal_f32(&[5], &[-2.0, 0.0, 3.0, 6.0, 8.0]);
    assert_eq!(
        run_f32("ReluGrad", &[g.clone(), f.clone()]),
        vec![0.0, 0.0, 1.0, 1.0, 1.0]
    );
    assert_eq!(
        run_f32("Relu6Grad", &[g.clone(), f.clone()]),
        vec![0.0, 0.0, 1.0, 0.0, 0.0]
    );
    assert_eq!(run_f32("Relu1Grad", &[g, f]), vec![0.0; 5]);
}

#[test]
fn gradients_are_zero_exactly_at_the_bounds() {
    let g = tensor_literal_f32(&[4], &[3.5, 3.5, 3.5, 3.5]);
    let f = tensor_literal_f32(&[4], &[0.0, 0.5, 1.0, 6.0]);
    assert_eq!(
        run_f32("ReluGrad", &[g.clone(), f.clone()]),
        vec![0.0, 3.5, 3.5, 3.5]
    );
    assert_eq!(
        run_f32("Relu6Grad", &[g.clone(), f.clone()]),
        vec![0.0, 3.5, 3.5, 0.0]
    );
    assert_eq!(
        run_f32("Relu1Grad", &[g, f]),
        vec![0.0, 3.5, 0.0, 0.0],
        "relu1 gradient is strict at 0 and at 1"
    );
}

#[test]
fn relu6_grad_mask_is_strict_on_both_sides() {
    let g = tensor_literal_f32(&[6], &[1.0; 6]);
    let f = tensor_literal_f32(&[6], &[-1.0, 0.0, 1e-6, 5.5, 6.0, 7.0]);

    let mut b = GraphBuilder::new();
    let gradient = b.parameter(g.spec.clone()).expect("gradient");
    let feature = b.parameter(f.spec.clone()).expect("feature");
    let out = lowering::lower("Relu6Grad", &mut b, &[gradient, feature]).expect("lower");
    let mut program = b.finish("relu6_grad_mask", &[out]).expect("finish");

    // Return the predicate feeding the select instead of the selected gradient.
    let function = &mut program.functions[0];
    let mask = function
        .body
        .iter()
        .find(|instruction| matches!(instruction.op, Operation::LogicalAnd))
        .expect("relu6 grad combines its bounds with and")
        .clone();
    function.result_ids = vec![mask.id];
    function.results = vec![mask.output];

    let backend = CpuPortableBackend::new();
    let handles = [g, f]
        .into_iter()
        .map(|lit| backend.materialize(lit).expect("materialize"))
        .collect::<Vec<_>>();
    let outputs = backend.run_program(&program, &handles).expect("run");
    assert_eq!(
        outputs[0].to_bool_vec().expect("i1 mask"),
        vec![false, false, true, true, false, false]
    );
}

#[test]
fn forward_saturates_exactly_at_the_bounds() {
    let x = tensor_literal_f32(&[4], &[-0.0, 1.0, 6.0, 6.5]);
    assert_eq!(run_f32("Relu6", &[x.clone()]), vec![0.0, 1.0, 6.0, 6.0]);
    assert_eq!(run_f32("Relu1", &[x]), vec![0.0, 1.0, 1.0, 1.0]);
}

#[test]
fn gradients_forward_upstream_values_unchanged() {
    let g = tensor_literal_f32(&[2, 2], &[-7.25, 1e6, 0.125, -0.5]);
    let f = tensor_literal_f32(&[2, 2], &[0.5, 0.25, 0.75, 0.9]);
    for op in GRADIENTS {
        assert_eq!(
            run_f32(op, &[g.clone(), f.clone()]),
            vec![-7.25, 1e6, 0.125, -0.5],
            "{op}"
        );
    }
}

#[test]
fn integer_features_use_integer_bounds() {
    let x = tensor_literal_i32(&[4], &[-3, 0, 2, 9]);
    let out = run("Relu6", &[x.clone()]).to_i32_vec().expect("si32");
    assert_eq!(out, vec![0, 0, 2, 6]);
    let out = run("Relu1", &[x.clone()]).to_i32_vec().expect("si32");
    assert_eq!(out, vec![0, 0, 1, 1]);

    let g = tensor_literal_i32(&[4], &[5, 5, 5, 5]);
    let out = run("Relu6Grad", &[g, x]).to_i32_vec().expect("si32");
    assert_eq!(out, vec![0, 0, 5, 0]);
}

#[test]
fn double_precision_gradients() {
    let g = tensor_literal_f64(&[3], &[2.0, 2.0, 2.0]);
    let f = tensor_literal_f64(&[3], &[-1e-300, 1e-300, 0.999_999_999]);
    let out = run("Relu1Grad", &[g.clone(), f.clone()])
        .to_f64_vec()
        .expect("f64");
    assert_eq!(out, vec![0.0, 2.0, 2.0]);
    let out = run("ReluGrad", &[g, f]).to_f64_vec().expect("f64");
    assert_eq!(out, vec![0.0, 2.0, 2.0]);
}

#[test]
fn rank_two_features_broadcast_their_bounds() {
    let g = tensor_literal_f32(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let f = tensor_literal_f32(&[2, 3], &[-1.0, 2.0, 7.0, 5.0, 0.0, 6.0]);
    assert_eq!(
        run_f32("Relu6Grad", &[g, f]),
        vec![0.0, 2.0, 0.0, 4.0, 0.0, 0.0]
    );
}

#[test]
fn seeded_sweep_matches_closed_form() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for round in 0..8 {
        let len = rng.gen_range(1..64);
        let mut features = (0..len)
            .map(|_| rng.gen_range(-10.0f32..10.0))
            .collect::<Vec<_>>();
        // Land some samples exactly on the bounds each round.
        for (slot, bound) in [0.0f32, 1.0, 6.0].into_iter().enumerate() {
            if let Some(value) = features.get_mut(slot * 3 % len) {
                *value = bound;
            }
        }
        let gradients = (0..len)
            .map(|_| rng.gen_range(-4.0f32..4.0))
            .collect::<Vec<_>>();
        let f = tensor_literal_f32(&[len], &features);
        let g = tensor_literal_f32(&[len], &gradients);

        for op in FORWARD {
            let expected = features
                .iter()
                .map(|&x| reference_forward(op, x))
                .collect::<Vec<_>>();
            assert_eq!(run_f32(op, &[f.clone()]), expected, "{op} round {round}");
        }
        for op in GRADIENTS {
            let expected = gradients
                .iter()
                .zip(&features)
                .map(|(&g, &f)| reference_grad(op, g, f))
                .collect::<Vec<_>>();
            assert_eq!(
                run_f32(op, &[g.clone(), f.clone()]),
                expected,
                "{op} round {round}"
            );
        }
    }
}

#[test]
fn seeded_sweep_properties_hold() {
    let mut rng = StdRng::seed_from_u64(42);
    let features = (0..256)
        .map(|_| rng.gen_range(-20.0f32..20.0))
        .collect::<Vec<_>>();
    let f = tensor_literal_f32(&[16, 16], &features);

    let relu = run_f32("Relu", &[f.clone()]);
    let relu6 = run_f32("Relu6", &[f.clone()]);
    let relu1 = run_f32("Relu1", &[f.clone()]);
    for (idx, &x) in features.iter().enumerate() {
        assert!(relu[idx] >= 0.0);
        assert!((0.0..=6.0).contains(&relu6[idx]));
        assert!((0.0..=1.0).contains(&relu1[idx]));
        if x > 0.0 {
            assert_eq!(relu[idx], x, "relu is identity for positive input");
        }
        // The saturating variants agree with relu below their upper bound.
        assert_eq!(relu6[idx], relu[idx].min(6.0));
        assert_eq!(relu1[idx], relu[idx].min(1.0));
    }

    let ones = tensor_literal_f32(&[16, 16], &[1.0; 256]);
    let mask = run_f32("ReluGrad", &[ones.clone(), f.clone()]);
    let mask6 = run_f32("Relu6Grad", &[ones.clone(), f.clone()]);
    let mask1 = run_f32("Relu1Grad", &[ones, f]);
    for idx in 0..features.len() {
        for value in [mask[idx], mask6[idx], mask1[idx]] {
            assert!(value == 0.0 || value == 1.0);
        }
        assert!(mask6[idx] <= mask[idx]);
        assert!(mask1[idx] <= mask6[idx]);
    }
}
