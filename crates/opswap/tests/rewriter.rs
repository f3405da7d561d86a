use std::sync::Arc;

use opswap::graph::{execute, DispatchState};
use opswap::ops::{attention, scaled_dot_product_attention_op, zeros_like, AttentionOptions};
use opswap::{
    checker_fn, transform_fn, AttrKind, AttrValue, ContractViolation, DType, Device,
    ExecutorRegistry, ExecutorRegistryHandle, GraphRewriter, OpArgs, OperatorHandle,
    RewriteOptions, Shape, Signature, SubstitutionRule, SymbolicTensor, Tensor, TensorMeta, Trace,
    Tracer,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn meta(dims: [usize; 4]) -> TensorMeta {
    TensorMeta::new(Shape::new(dims.to_vec()), DType::F32, Device::cpu())
}

/// Registers a `toy` executor whose operator delegates to the reference attention and whose
/// rule admits every unmasked call.
fn toy_registry() -> ExecutorRegistryHandle {
    let mut registry = ExecutorRegistry::new();
    let namespace = registry.register_namespace("toy", "0.1").expect("toy namespace");
    let toy: OperatorHandle = namespace
        .register_operator(
            "toy_attention",
            Signature::new()
                .tensor("q")
                .tensor("k")
                .tensor("v")
                .attr("is_causal", AttrKind::Bool, AttrValue::Bool(false))
                .attr("scale", AttrKind::OptionalFloat, AttrValue::None),
            |args| {
                let inputs = [
                    Some(args.tensor(0)?.clone()),
                    Some(args.tensor(1)?.clone()),
                    Some(args.tensor(2)?.clone()),
                    None,
                ];
                scaled_dot_product_attention_op().infer(&inputs, args.attrs())
            },
            |args| {
                let inputs = [
                    Some(args.tensor(0)?.clone()),
                    Some(args.tensor(1)?.clone()),
                    Some(args.tensor(2)?.clone()),
                    None,
                ];
                scaled_dot_product_attention_op()
                    .operator()
                    .execute(&inputs, args.attrs())
            },
        )
        .expect("toy operator");

    let rule = SubstitutionRule::new(
        scaled_dot_product_attention_op(),
        checker_fn(|args: &OpArgs<'_, SymbolicTensor>| {
            args.optional(3).is_none() && args.attrs().float("dropout_p").map_or(false, |p| p == 0.0)
        }),
        transform_fn(move |tracer, args| {
            let attrs = opswap::Attrs::new()
                .with("is_causal", args.attrs().bool("is_causal")?)
                .with("scale", args.attrs().opt_float("scale")?);
            toy.call(
                tracer,
                &[Some(args.tensor(0)?), Some(args.tensor(1)?), Some(args.tensor(2)?)],
                &attrs,
            )
        }),
    );
    namespace.register_rule(rule);
    registry.freeze()
}

fn attention_trace(mask: bool, calls: usize) -> Trace {
    let mut tracer = Tracer::new();
    let q = tracer.input(meta([1, 2, 4, 8]));
    let k = tracer.input(meta([1, 2, 4, 8]));
    let v = tracer.input(meta([1, 2, 4, 8]));
    let mask = mask.then(|| tracer.input(meta([1, 1, 4, 4])));
    let mut outputs = Vec::new();
    for _ in 0..calls {
        let out = attention(&mut tracer, &q, &k, &v, mask.as_ref(), AttentionOptions::causal())
            .expect("attention");
        outputs.push(out);
    }
    tracer
        .finish(&outputs.iter().collect::<Vec<_>>())
        .expect("finish")
}

fn random_inputs(trace: &Trace, seed: u64) -> Vec<Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    trace
        .input_metas()
        .iter()
        .map(|meta| Tensor::randn(meta, 1.0, &mut rng))
        .collect()
}

#[test]
fn admitted_nodes_are_substituted() {
    let trace = attention_trace(false, 1);
    let rewriter = GraphRewriter::new(toy_registry());
    let rewritten = rewriter.rewrite(&trace).expect("rewrite");

    assert_eq!(rewritten.report.substituted(), 1);
    assert_eq!(rewritten.report.executor_for(0), Some("toy"));
    assert_eq!(rewritten.trace.count_op("toy::toy_attention"), 1);
    assert_eq!(rewritten.trace.count_op("core::scaled_dot_product_attention"), 0);
    assert_eq!(rewritten.trace.output_metas(), trace.output_metas());

    let inputs = random_inputs(&trace, 7);
    let expected = execute(&trace, &inputs).expect("reference");
    let actual = execute(&rewritten.trace, &inputs).expect("substituted");
    assert!(expected[0].max_abs_diff(&actual[0]).expect("diff") < 1e-6);
}

#[test]
fn rejected_nodes_fall_back_to_the_reference() {
    let trace = attention_trace(true, 1);
    let rewritten = GraphRewriter::new(toy_registry()).rewrite(&trace).expect("rewrite");

    assert_eq!(rewritten.report.fallbacks(), 1);
    assert_eq!(rewritten.report.records()[0].state, DispatchState::Fallback);
    assert_eq!(rewritten.trace.count_op("core::scaled_dot_product_attention"), 1);
    assert_eq!(rewritten.trace.count_op("toy::toy_attention"), 0);
}

#[test]
fn allow_list_restricts_executors() {
    let trace = attention_trace(false, 1);
    let options = RewriteOptions::default().with_executors(["core"]);
    let rewritten = GraphRewriter::with_options(toy_registry(), options)
        .rewrite(&trace)
        .expect("rewrite");
    assert_eq!(rewritten.report.fallbacks(), 1);
}

#[test]
fn repeated_calls_reuse_dispatch_decisions() {
    let trace = attention_trace(false, 2);
    let rewritten = GraphRewriter::new(toy_registry()).rewrite(&trace).expect("rewrite");
    let cached: Vec<bool> = rewritten.report.records().iter().map(|r| r.cached).collect();
    assert_eq!(cached, vec![false, true]);
    assert_eq!(rewritten.report.substituted(), 2);

    let uncached = GraphRewriter::with_options(
        toy_registry(),
        RewriteOptions::default().with_decision_cache_size(0),
    )
    .rewrite(&trace)
    .expect("rewrite");
    assert!(uncached.report.records().iter().all(|r| !r.cached));
    assert_eq!(uncached.report.substituted(), 2);
}

#[test]
fn transforms_must_match_the_declared_outputs() {
    let mut registry = ExecutorRegistry::new();
    registry
        .register_namespace("broken", "0")
        .expect("namespace")
        .register_rule(SubstitutionRule::new(
            scaled_dot_product_attention_op(),
            opswap::executor::AlwaysAdmit,
            transform_fn(|_tracer, args| Ok(vec![args.tensor(0)?.clone()])),
        ));

    let mut tracer = Tracer::new();
    let q = tracer.input(meta([1, 1, 3, 8]));
    let k = tracer.input(meta([1, 1, 3, 8]));
    let v = tracer.input(meta([1, 1, 3, 4]));
    let out = attention(&mut tracer, &q, &k, &v, None, AttentionOptions::default()).expect("attention");
    let trace = tracer.finish(&[&out]).expect("finish");

    let err = GraphRewriter::new(Arc::new(registry))
        .rewrite(&trace)
        .expect_err("mismatched transform");
    match err.downcast_ref::<ContractViolation>() {
        Some(ContractViolation::TransformMismatch {
            executor, index, ..
        }) => {
            assert_eq!(executor, "broken");
            assert_eq!(*index, 0);
        }
        other => panic!("unexpected error: {other:?} ({err:#})"),
    }
}

#[test]
fn kernel_nodes_are_copied_verbatim() {
    let mut tracer = Tracer::new();
    let x = tracer.input(meta([1, 1, 2, 2]));
    let zeros = zeros_like(&mut tracer, &x).expect("zeros_like");
    let trace = tracer.finish(&[&zeros]).expect("finish");

    let rewritten = GraphRewriter::new(toy_registry()).rewrite(&trace).expect("rewrite");
    assert!(rewritten.report.records().is_empty());
    assert_eq!(rewritten.trace.count_op("core::zeros_like"), 1);
    assert!(rewritten.trace.to_string().contains("core::zeros_like(%0)"));
}
