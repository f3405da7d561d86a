use opswap::executor::AlwaysAdmit;
use opswap::ops::{scaled_dot_product_attention_op, CORE_NAMESPACE};
use opswap::{
    checker_fn, transform_fn, ExecutorRegistry, RegistryError, Signature, SubstitutionOverrides,
    SubstitutionPolicy, SubstitutionRule,
};

fn identity_op(registry: &mut ExecutorRegistry, namespace: &str, name: &str) -> Result<(), RegistryError> {
    registry.namespace_mut(namespace)?.register_operator(
        name,
        Signature::new().tensor("x"),
        |args| Ok(vec![args.tensor(0)?.clone()]),
        |args| Ok(vec![args.tensor(0)?.clone()]),
    )?;
    Ok(())
}

fn passthrough_rule() -> SubstitutionRule {
    SubstitutionRule::new(
        scaled_dot_product_attention_op(),
        AlwaysAdmit,
        transform_fn(|_tracer, args| Ok(vec![args.tensor(0)?.clone()])),
    )
}

#[test]
fn core_namespace_holds_builtins() {
    let registry = ExecutorRegistry::new();
    let core = registry.namespace(CORE_NAMESPACE).expect("core namespace");
    for name in ["add", "zeros_like", "scaled_dot_product_attention", "sdpa_backward"] {
        assert!(core.operator(name).is_some(), "missing core::{name}");
    }
    assert_eq!(
        core.operator("scaled_dot_product_attention").map(|op| op.id()),
        Some(scaled_dot_product_attention_op().id())
    );
    assert_eq!(core.operators().len(), 4);
}

#[test]
fn builtin_names_are_reserved_in_core() {
    let mut registry = ExecutorRegistry::new();
    let err = identity_op(&mut registry, CORE_NAMESPACE, "add").expect_err("builtin name");
    assert_eq!(
        err,
        RegistryError::NameCollision {
            namespace: CORE_NAMESPACE.into(),
            name: "add".into()
        }
    );
    identity_op(&mut registry, CORE_NAMESPACE, "identity").expect("free name");
    let core = registry.namespace(CORE_NAMESPACE).expect("core namespace");
    assert_eq!(core.operators().len(), 5);
}

#[test]
fn operator_names_collide_only_within_a_namespace() {
    let mut registry = ExecutorRegistry::new();
    registry.register_namespace("alpha", "1").expect("alpha");
    registry.register_namespace("beta", "1").expect("beta");

    identity_op(&mut registry, "alpha", "fused").expect("first registration");
    let err = identity_op(&mut registry, "alpha", "fused").expect_err("duplicate name");
    assert_eq!(
        err,
        RegistryError::NameCollision {
            namespace: "alpha".into(),
            name: "fused".into()
        }
    );
    identity_op(&mut registry, "beta", "fused").expect("same name elsewhere");

    let alpha = registry.namespace("alpha").expect("alpha").operator("fused").expect("op").clone();
    let beta = registry.namespace("beta").expect("beta").operator("fused").expect("op").clone();
    assert_ne!(alpha.id(), beta.id());
    assert_eq!(alpha.qualified_name(), "alpha::fused");
}

#[test]
fn namespace_collisions_and_lookups_fail() {
    let mut registry = ExecutorRegistry::new();
    registry.register_namespace("alpha", "1").expect("alpha");
    assert!(matches!(
        registry.register_namespace("alpha", "2"),
        Err(RegistryError::NamespaceCollision { .. })
    ));
    assert!(matches!(
        registry.register_namespace(CORE_NAMESPACE, "2"),
        Err(RegistryError::NamespaceCollision { .. })
    ));
    assert!(matches!(
        registry.namespace_mut("missing"),
        Err(RegistryError::UnknownNamespace { .. })
    ));
}

#[test]
fn candidates_follow_priority_then_registration_order() {
    let mut registry = ExecutorRegistry::new();
    {
        let alpha = registry.register_namespace("alpha", "1").expect("alpha");
        alpha.register_rule(passthrough_rule());
        alpha.register_rule(passthrough_rule().with_priority(5));
    }
    registry
        .register_namespace("beta", "1")
        .expect("beta")
        .register_rule(passthrough_rule());

    let target = scaled_dot_product_attention_op();
    let order: Vec<(String, usize)> = registry
        .candidate_rules(target, None, false)
        .iter()
        .map(|rule| (rule.executor().to_string(), rule.sequence()))
        .collect();
    assert_eq!(
        order,
        vec![
            ("alpha".to_string(), 1),
            ("alpha".to_string(), 0),
            ("beta".to_string(), 0),
        ]
    );

    let allowed = ["beta".to_string()];
    let restricted = registry.candidate_rules(target, Some(&allowed), false);
    assert_eq!(restricted.len(), 1);
    assert_eq!(restricted[0].executor(), "beta");

    // None of the rules carry a gradient transform.
    assert!(registry.candidate_rules(target, None, true).is_empty());
}

#[test]
fn overrides_force_or_disable_executors() {
    let mut registry = ExecutorRegistry::new();
    for name in ["alpha", "beta"] {
        registry
            .register_namespace(name, "1")
            .expect("namespace")
            .register_rule(passthrough_rule().with_gradient(transform_fn(|_tracer, args| {
                Ok(vec![args.tensor(0)?.clone()])
            })));
    }
    let target = scaled_dot_product_attention_op();

    let forced = SubstitutionOverrides::new().with(
        target.name(),
        SubstitutionPolicy::Force {
            executor: "beta".into(),
        },
    );
    registry.set_overrides(forced);
    let candidates = registry.candidate_rules(target, None, true);
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].executor(), "beta");

    registry.set_overrides(SubstitutionOverrides::new().with(target.name(), SubstitutionPolicy::Fallback));
    assert!(registry.candidate_rules(target, None, false).is_empty());

    registry.set_overrides(SubstitutionOverrides::new().with(
        target.name(),
        SubstitutionPolicy::Force {
            executor: "gamma".into(),
        },
    ));
    assert!(registry.candidate_rules(target, None, false).is_empty());
}

#[test]
fn closures_work_as_checkers() {
    use opswap::{Attrs, CapabilityChecker, Device, DType, OpArgs, Shape, TensorMeta, Tracer};

    let checker = checker_fn(|args: &OpArgs<'_, opswap::SymbolicTensor>| {
        args.attrs().bool("is_causal").unwrap_or(false)
    });
    let mut tracer = Tracer::new();
    let x = tracer.input(TensorMeta::new(Shape::new([2, 2]), DType::F32, Device::cpu()));
    let inputs = [Some(x)];
    let causal = Attrs::new().with("is_causal", true);
    let plain = Attrs::new();
    assert!(checker.admits(&OpArgs::new("causal_only", &inputs, &causal)));
    assert!(!checker.admits(&OpArgs::new("causal_only", &inputs, &plain)));
}

#[test]
fn overrides_keyed_by_qualified_name_target_one_namespace() {
    let mut registry = ExecutorRegistry::new();
    let ops: Vec<_> = ["alpha", "beta"]
        .into_iter()
        .map(|name| {
            let namespace = registry.register_namespace(name, "1").expect("namespace");
            let op = namespace
                .register_high_level(
                    "mix",
                    Signature::new().tensor("x"),
                    |args| Ok(vec![args.tensor(0)?.clone()]),
                    |args| Ok(vec![args.tensor(0)?.clone()]),
                    None,
                )
                .expect("high-level op");
            namespace.register_rule(SubstitutionRule::new(
                &op,
                AlwaysAdmit,
                transform_fn(|_tracer, args| Ok(vec![args.tensor(0)?.clone()])),
            ));
            op
        })
        .collect();

    registry.set_overrides(SubstitutionOverrides::new().with("alpha::mix", SubstitutionPolicy::Fallback));
    assert!(registry.candidate_rules(&ops[0], None, false).is_empty());
    assert_eq!(registry.candidate_rules(&ops[1], None, false).len(), 1);

    registry.set_overrides(SubstitutionOverrides::new().with("mix", SubstitutionPolicy::Fallback));
    assert!(registry.candidate_rules(&ops[0], None, false).is_empty());
    assert!(registry.candidate_rules(&ops[1], None, false).is_empty());
}
