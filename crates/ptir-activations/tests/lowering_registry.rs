use ptir_activations::backend::ptir_utils::tensor_spec_static;
use ptir_activations::backend::spec::DType;
use ptir_activations::config::{DuplicatePolicy, LoweringConfig};
use ptir_activations::ops::lowering::{
    all_lowering_defs, global_registry, ActivationGradKind, ActivationKind, LoweringDef,
    LoweringError, LoweringKind, LoweringRegistry, RegistryBuilder, RegistryError,
};
use ptir_activations::GraphBuilder;

#[test]
fn global_registry_exposes_every_activation() {
    let registry = global_registry().expect("global registry builds");
    for kind in ActivationKind::ALL {
        assert!(registry.contains(kind.op_name()), "{}", kind.op_name());
    }
    for kind in ActivationGradKind::ALL {
        assert!(registry.contains(kind.op_name()), "{}", kind.op_name());
    }
    assert_eq!(registry.len(), 6);
    assert_eq!(all_lowering_defs().len(), 6);
}

#[test]
fn global_registry_is_built_once() {
    let first = global_registry().expect("registry") as *const LoweringRegistry;
    let second = global_registry().expect("registry") as *const LoweringRegistry;
    assert_eq!(first, second);
}

#[test]
fn registry_lowering_matches_direct_call() {
    let registry = global_registry().expect("registry");
    let spec = tensor_spec_static(DType::F32, &[3]);

    let mut via_table = GraphBuilder::new();
    let x = via_table.parameter(spec.clone()).expect("parameter");
    let out = registry.lower("Relu6", &mut via_table, &[x]).expect("lower");
    let via_table = via_table.finish("relu6", &[out]).expect("finish");

    let mut direct = GraphBuilder::new();
    let x = direct.parameter(spec).expect("parameter");
    let out = ActivationKind::Relu6
        .emit(&mut direct, x, DType::F32)
        .expect("emit");
    let direct = direct.finish("relu6", &[out]).expect("finish");

    assert_eq!(via_table, direct);
}

#[test]
fn arity_errors_are_reported_per_operator() {
    let registry = global_registry().expect("registry");
    let mut b = GraphBuilder::new();
    let x = b
        .parameter(tensor_spec_static(DType::F32, &[2]))
        .expect("parameter");

    let err = registry
        .lower("Relu", &mut b, &[x, x])
        .expect_err("relu takes one input");
    assert_eq!(
        err.downcast_ref::<LoweringError>(),
        Some(&LoweringError::Arity {
            op: "Relu",
            expected: 1,
            actual: 2
        })
    );

    let err = registry
        .lower("Relu1Grad", &mut b, &[])
        .expect_err("relu1 grad takes two inputs");
    assert!(matches!(
        err.downcast_ref::<LoweringError>(),
        Some(LoweringError::Arity { expected: 2, .. })
    ));
}

#[test]
fn unknown_operator_reaches_the_caller() {
    let mut b = GraphBuilder::new();
    let err = ptir_activations::lower("LeakyRelu", &mut b, &[]).expect_err("not registered");
    assert_eq!(
        err.downcast_ref::<RegistryError>(),
        Some(&RegistryError::UnknownOperator("LeakyRelu".to_string()))
    );
}

#[test]
fn configured_replacement_routes_to_new_kind() {
    let config = LoweringConfig::from_json_str(r#"{"duplicate_policy":"replace"}"#)
        .expect("config json");
    assert_eq!(config.duplicate_policy, DuplicatePolicy::Replace);

    let mut builder = RegistryBuilder::new(config);
    builder
        .register_all(all_lowering_defs())
        .expect("builtin defs")
        .register(LoweringDef::new(
            "ReluGrad",
            LoweringKind::ActivationGrad(ActivationGradKind::Relu1Grad),
        ))
        .expect("replace");
    let registry = builder.build();

    let spec = tensor_spec_static(DType::F32, &[4]);
    let mut b = GraphBuilder::new();
    let g = b.parameter(spec.clone()).expect("gradient");
    let f = b.parameter(spec).expect("feature");
    registry.lower("ReluGrad", &mut b, &[g, f]).expect("lower");
    assert_eq!(b.instruction_count(), 1, "replacement lowers through map");
}

#[test]
fn rejecting_builder_refuses_second_registration() {
    let mut builder = RegistryBuilder::new(LoweringConfig::default());
    let def = LoweringDef::new("Relu", LoweringKind::Activation(ActivationKind::Relu));
    builder.register(def).expect("first registration");
    assert_eq!(
        builder.register(def).map(|_| ()),
        Err(RegistryError::DuplicateRegistration { name: "Relu" })
    );
}
