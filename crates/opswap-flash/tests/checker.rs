use opswap::ops::AttentionOptions;
use opswap::{CapabilityChecker, DType, Device, OpArgs, Shape, SymbolicTensor, TensorMeta, Tracer};
use opswap_flash::{FlashCapability, FlashChecker, FlashConfig};

fn meta(dims: &[usize], dtype: DType, device: Device) -> TensorMeta {
    TensorMeta::new(Shape::new(dims.to_vec()), dtype, device)
}

fn checker() -> FlashChecker {
    FlashChecker::new(FlashConfig::default(), FlashCapability::forced(true))
}

/// Builds symbolic `(q, k, v, mask?)` operands and asks `checker` about them.
fn admits(
    checker: &FlashChecker,
    metas: [TensorMeta; 3],
    mask: Option<TensorMeta>,
    options: AttentionOptions,
) -> bool {
    let mut tracer = Tracer::new();
    let mut operands: Vec<Option<SymbolicTensor>> =
        metas.into_iter().map(|meta| Some(tracer.input(meta))).collect();
    operands.push(mask.map(|meta| tracer.input(meta)));
    let attrs = options.to_attrs();
    checker.admits(&OpArgs::new("core::scaled_dot_product_attention", &operands, &attrs))
}

fn uniform(dims: &[usize], dtype: DType, device: Device) -> [TensorMeta; 3] {
    let m = meta(dims, dtype, device);
    [m.clone(), m.clone(), m]
}

const SCENARIO: [usize; 4] = [2, 8, 128, 64];

#[test]
fn admits_supported_half_precision_attention() {
    let checker = checker();
    for options in [AttentionOptions::default(), AttentionOptions::causal()] {
        assert!(admits(
            &checker,
            uniform(&SCENARIO, DType::F16, Device::cuda(0)),
            None,
            options
        ));
    }
    for head_dim in [128, 256] {
        assert!(admits(
            &checker,
            uniform(&[1, 4, 32, head_dim], DType::F16, Device::cuda(1)),
            None,
            AttentionOptions::default()
        ));
    }
}

#[test]
fn rejects_unsupported_head_dims_and_ranks() {
    let checker = checker();
    assert!(!admits(
        &checker,
        uniform(&[2, 8, 128, 48], DType::F16, Device::cuda(0)),
        None,
        AttentionOptions::default()
    ));

    let mut mixed = uniform(&SCENARIO, DType::F16, Device::cuda(0));
    mixed[2] = meta(&[2, 8, 128, 32], DType::F16, Device::cuda(0));
    assert!(!admits(&checker, mixed, None, AttentionOptions::default()));

    assert!(!admits(
        &checker,
        uniform(&[8, 128, 64], DType::F16, Device::cuda(0)),
        None,
        AttentionOptions::default()
    ));
}

#[test]
fn rejects_masks_and_dropout() {
    let checker = checker();
    let mask = meta(&[1, 1, 128, 128], DType::F16, Device::cuda(0));
    assert!(!admits(
        &checker,
        uniform(&SCENARIO, DType::F16, Device::cuda(0)),
        Some(mask),
        AttentionOptions::default()
    ));
    let dropout = AttentionOptions {
        dropout_p: 0.1,
        ..AttentionOptions::default()
    };
    assert!(!admits(
        &checker,
        uniform(&SCENARIO, DType::F16, Device::cuda(0)),
        None,
        dropout
    ));
}

#[test]
fn rejects_other_dtypes() {
    let checker = checker();
    for dtype in [DType::F32, DType::BF16] {
        assert!(!admits(
            &checker,
            uniform(&SCENARIO, dtype, Device::cuda(0)),
            None,
            AttentionOptions::default()
        ));
    }
    let mut mixed = uniform(&SCENARIO, DType::F16, Device::cuda(0));
    mixed[1] = meta(&SCENARIO, DType::F32, Device::cuda(0));
    assert!(!admits(&checker, mixed, None, AttentionOptions::default()));
}

#[test]
fn rejects_host_and_split_devices() {
    let checker = checker();
    assert!(!admits(
        &checker,
        uniform(&SCENARIO, DType::F16, Device::cpu()),
        None,
        AttentionOptions::default()
    ));
    let mut split = uniform(&SCENARIO, DType::F16, Device::cuda(0));
    split[2] = meta(&SCENARIO, DType::F16, Device::cuda(1));
    assert!(!admits(&checker, split, None, AttentionOptions::default()));
}

#[test]
fn rejects_everything_without_the_kernel() {
    let checker = FlashChecker::new(FlashConfig::default(), FlashCapability::forced(false));
    assert!(!admits(
        &checker,
        uniform(&SCENARIO, DType::F16, Device::cuda(0)),
        None,
        AttentionOptions::default()
    ));
}

#[test]
fn decisions_are_repeatable() {
    let checker = checker();
    for _ in 0..3 {
        assert!(admits(
            &checker,
            uniform(&SCENARIO, DType::F16, Device::cuda(0)),
            None,
            AttentionOptions::default()
        ));
        assert!(!admits(
            &checker,
            uniform(&[2, 8, 128, 48], DType::F16, Device::cuda(0)),
            None,
            AttentionOptions::default()
        ));
    }
}

#[test]
fn configuration_widens_the_admitted_set() {
    let config = FlashConfig::from_json(r#"{ "head_dims": [48], "dtype": "bf16" }"#).expect("config");
    let checker = FlashChecker::new(config, FlashCapability::forced(true));
    assert!(admits(
        &checker,
        uniform(&[2, 8, 128, 48], DType::BF16, Device::cuda(0)),
        None,
        AttentionOptions::default()
    ));
    assert!(!admits(
        &checker,
        uniform(&SCENARIO, DType::F16, Device::cuda(0)),
        None,
        AttentionOptions::default()
    ));
    assert!(FlashConfig::from_json(r#"{ "dtype": "f64" }"#).is_err());
}
