use std::fmt;
use std::sync::{Arc, Mutex};

use opswap::ops::{attention, AttentionOptions};
use opswap::{
    DType, Device, ExecutorRegistry, GraphRewriter, Shape, SubstitutionOverrides,
    SubstitutionPolicy, TensorMeta, Trace, Tracer,
};
use opswap_flash::{register_flash_executor_with, FlashCapability, FlashConfig, ReferenceFlashKernel};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

#[derive(Debug, Clone)]
struct Recorded {
    level: Level,
    fields: Vec<(String, String)>,
}

impl Recorded {
    fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Default)]
struct Fields(Vec<(String, String)>);

impl Visit for Fields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.push((field.name().to_string(), value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.push((field.name().to_string(), format!("{value:?}")));
    }
}

#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<Recorded>>>,
}

impl Recorder {
    fn events(&self) -> Vec<Recorded> {
        self.events.lock().expect("recorder poisoned").clone()
    }
}

impl<S: Subscriber> Layer<S> for Recorder {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = Fields::default();
        event.record(&mut fields);
        self.events.lock().expect("recorder poisoned").push(Recorded {
            level: *event.metadata().level(),
            fields: fields.0,
        });
    }
}

fn attention_trace() -> Trace {
    let meta = TensorMeta::new(Shape::new([1, 2, 16, 64]), DType::F16, Device::cuda(0));
    let mut tracer = Tracer::new();
    let q = tracer.input(meta.clone());
    let k = tracer.input(meta.clone());
    let v = tracer.input(meta);
    let out = attention(&mut tracer, &q, &k, &v, None, AttentionOptions::default()).expect("attention");
    tracer.finish(&[&out]).expect("finish")
}

fn rewrite_recorded(overrides: SubstitutionOverrides) -> (usize, Vec<Recorded>) {
    let recorder = Recorder::default();
    let subscriber = tracing_subscriber::registry().with(recorder.clone());
    let substituted = tracing::subscriber::with_default(subscriber, || {
        let mut registry = ExecutorRegistry::new().with_overrides(overrides);
        register_flash_executor_with(
            &mut registry,
            Arc::new(ReferenceFlashKernel::default()),
            FlashConfig::default(),
            FlashCapability::forced(true),
        )
        .expect("flash executor");
        GraphRewriter::new(registry.freeze())
            .rewrite(&attention_trace())
            .expect("rewrite")
            .report
            .substituted()
    });
    (substituted, recorder.events())
}

#[test]
fn dispatch_decisions_are_logged() {
    let (substituted, events) = rewrite_recorded(SubstitutionOverrides::new());
    assert_eq!(substituted, 1);

    let decision = events
        .iter()
        .find(|event| event.field("message") == Some("dispatch decision"))
        .expect("dispatch decision event");
    assert_eq!(decision.level, Level::DEBUG);
    assert_eq!(decision.field("op"), Some("core::scaled_dot_product_attention"));
    assert_eq!(decision.field("state"), Some("substituted(flash)"));
    assert_eq!(decision.field("cached"), Some("false"));

    assert!(events
        .iter()
        .any(|event| event.field("message") == Some("registered flash executor")
            && event.field("executor") == Some("flash")));
}

#[test]
fn forcing_an_unknown_executor_warns() {
    let overrides = SubstitutionOverrides::new().with(
        "scaled_dot_product_attention",
        SubstitutionPolicy::Force {
            executor: "missing".into(),
        },
    );
    let (substituted, events) = rewrite_recorded(overrides);
    assert_eq!(substituted, 0);

    let warning = events
        .iter()
        .find(|event| event.level == Level::WARN)
        .expect("warning event");
    assert_eq!(warning.field("executor"), Some("missing"));
    assert_eq!(warning.field("op"), Some("scaled_dot_product_attention"));
}
