//! Graph rewriting: route each high-level node to the first admitting substitution rule.
//!
//! Every high-level node walks a small state machine, `Unresolved -> Checking ->
//! {Substituted | Fallback}`. Candidates are tried in [`ExecutorRegistry::candidate_rules`]
//! order and the first rule whose checker admits the call wins; with no admitting rule the
//! node keeps its reference implementation. Because checkers are pure, decisions are memoised
//! per (operator, input metas, static arguments).
//!
//! [`GraphRewriter::rewrite_with_grad`] additionally builds the backward graph. Gradient
//! transforms run in forward order with a backward capture open on the tracer; the fragments
//! they leave behind are replayed in reverse, once every downstream gradient of a symbol has
//! been accumulated.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use lru::LruCache;

use super::grad::{BackwardFragment, BackwardStep, GradientBinding};
use super::trace::{Node, NodeOp, Trace, Tracer};
use crate::error::ContractViolation;
use crate::executor::{ExecutorRegistryHandle, SubstitutionRule};
use crate::ops::prims::zeros_like;
use crate::ops::{AttrValue, Attrs, HighLevelOp, OpArgs, OperatorId, TransformFn};
use crate::tensor::{SymbolId, SymbolicTensor, TensorMeta};

const DEFAULT_DECISION_CACHE_SIZE: usize = 256;

/// Knobs for a [`GraphRewriter`].
#[derive(Debug, Clone)]
pub struct RewriteOptions {
    /// Allow-list of executor namespaces to consult; `None` consults all of them.
    pub executors: Option<Vec<String>>,
    /// Capacity of the dispatch decision cache; `0` disables memoisation.
    pub decision_cache_size: usize,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        Self {
            executors: None,
            decision_cache_size: DEFAULT_DECISION_CACHE_SIZE,
        }
    }
}

impl RewriteOptions {
    pub fn with_executors<I, S>(mut self, executors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.executors = Some(executors.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_decision_cache_size(mut self, size: usize) -> Self {
        self.decision_cache_size = size;
        self
    }
}

/// Dispatch progress of one high-level node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchState {
    Unresolved,
    Checking,
    Substituted { executor: String },
    Fallback,
}

impl DispatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DispatchState::Substituted { .. } | DispatchState::Fallback
        )
    }

    fn advance(&mut self, next: DispatchState) {
        debug_assert!(
            matches!(
                (&*self, &next),
                (DispatchState::Unresolved, DispatchState::Checking)
                    | (DispatchState::Checking, DispatchState::Substituted { .. })
                    | (DispatchState::Checking, DispatchState::Fallback)
            ),
            "invalid dispatch transition {:?} -> {:?}",
            self,
            next
        );
        *self = next;
    }
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchState::Unresolved => f.write_str("unresolved"),
            DispatchState::Checking => f.write_str("checking"),
            DispatchState::Substituted { executor } => write!(f, "substituted({executor})"),
            DispatchState::Fallback => f.write_str("fallback"),
        }
    }
}

/// Final dispatch outcome for one node of the source trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRecord {
    /// Index of the node in the source trace.
    pub node: usize,
    pub op: String,
    pub state: DispatchState,
    /// Whether the decision came from the memoisation cache.
    pub cached: bool,
}

/// Per-node dispatch outcomes of one rewrite.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    records: Vec<DispatchRecord>,
}

impl DispatchReport {
    pub fn records(&self) -> &[DispatchRecord] {
        &self.records
    }

    pub fn substituted(&self) -> usize {
        self.records
            .iter()
            .filter(|record| matches!(record.state, DispatchState::Substituted { .. }))
            .count()
    }

    pub fn fallbacks(&self) -> usize {
        self.records
            .iter()
            .filter(|record| record.state == DispatchState::Fallback)
            .count()
    }

    /// Executor that took over source node `node`, if any.
    pub fn executor_for(&self, node: usize) -> Option<&str> {
        self.records
            .iter()
            .find(|record| record.node == node)
            .and_then(|record| match &record.state {
                DispatchState::Substituted { executor } => Some(executor.as_str()),
                _ => None,
            })
    }
}

/// A rewritten trace plus how each high-level node was dispatched.
#[derive(Debug, Clone)]
pub struct Rewritten {
    pub trace: Trace,
    pub report: DispatchReport,
}

/// Everything a checker may look at. Stored whole so that distinct calls never share a decision.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct DispatchKey {
    op: OperatorId,
    gradient: bool,
    inputs: Vec<Option<TensorMeta>>,
    attrs: Vec<(String, AttrKey)>,
}

/// Hashable form of an [`AttrValue`]; floats compare by bit pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum AttrKey {
    Bool(bool),
    Int(i64),
    Float(u64),
    None,
}

impl From<&AttrValue> for AttrKey {
    fn from(value: &AttrValue) -> Self {
        match value {
            AttrValue::Bool(v) => AttrKey::Bool(*v),
            AttrValue::Int(v) => AttrKey::Int(*v),
            AttrValue::Float(v) => AttrKey::Float(v.to_bits()),
            AttrValue::None => AttrKey::None,
        }
    }
}

impl DispatchKey {
    fn new(op: OperatorId, gradient: bool, inputs: &[Option<SymbolicTensor>], attrs: &Attrs) -> Self {
        Self {
            op,
            gradient,
            inputs: inputs
                .iter()
                .map(|input| input.as_ref().map(|tensor| tensor.meta().clone()))
                .collect(),
            attrs: attrs
                .iter()
                .map(|(name, value)| (name.to_string(), AttrKey::from(value)))
                .collect(),
        }
    }
}

/// Rewrites traces against a frozen executor registry.
pub struct GraphRewriter {
    registry: ExecutorRegistryHandle,
    options: RewriteOptions,
    decisions: Mutex<Option<LruCache<DispatchKey, Option<Arc<SubstitutionRule>>>>>,
}

impl GraphRewriter {
    pub fn new(registry: ExecutorRegistryHandle) -> Self {
        Self::with_options(registry, RewriteOptions::default())
    }

    pub fn with_options(registry: ExecutorRegistryHandle, options: RewriteOptions) -> Self {
        let decisions = NonZeroUsize::new(options.decision_cache_size).map(LruCache::new);
        Self {
            registry,
            options,
            decisions: Mutex::new(decisions),
        }
    }

    pub fn registry(&self) -> &ExecutorRegistryHandle {
        &self.registry
    }

    pub fn options(&self) -> &RewriteOptions {
        &self.options
    }

    /// Forward-only rewrite: substituted nodes are replaced by their execution transforms.
    pub fn rewrite(&self, trace: &Trace) -> Result<Rewritten> {
        let mut tracer = Tracer::new();
        let mut env = SymbolMap::new(trace, &mut tracer);
        let mut report = DispatchReport::default();

        for (index, node) in trace.nodes().iter().enumerate() {
            let inputs = env.inputs(node)?;
            let outputs = match &node.op {
                NodeOp::Kernel(handle) => handle.call(&mut tracer, &refs(&inputs), &node.attrs)?,
                NodeOp::HighLevel(op) => {
                    let args = OpArgs::new(op.operator().qualified_name(), &inputs, &node.attrs);
                    let (record, rule) = self.dispatch(index, op, &args, false);
                    let outputs = match &rule {
                        Some(rule) => {
                            let outputs = (rule.execution())(&mut tracer, &args).with_context(|| {
                                format!(
                                    "execution transform of executor '{}' for {}",
                                    rule.executor(),
                                    op.operator().qualified_name()
                                )
                            })?;
                            check_transform(op, rule.executor(), &inputs, &node.attrs, &outputs)?;
                            outputs
                        }
                        None => op.call(&mut tracer, &refs(&inputs), &node.attrs)?,
                    };
                    report.records.push(record);
                    outputs
                }
            };
            env.bind_outputs(node, outputs)?;
        }

        let outputs = env.outputs(trace)?;
        let rewritten = tracer.finish(&outputs.iter().collect::<Vec<_>>())?;
        log_report(&report);
        Ok(Rewritten {
            trace: rewritten,
            report,
        })
    }

    /// Joint forward/backward rewrite.
    ///
    /// The resulting trace takes the source inputs followed by one cotangent per source
    /// output, and returns the source outputs followed by one gradient per source input.
    pub fn rewrite_with_grad(&self, trace: &Trace) -> Result<Rewritten> {
        let mut tracer = Tracer::new();
        let mut env = SymbolMap::new(trace, &mut tracer);
        let mut report = DispatchReport::default();
        let mut fragments: Vec<BackwardFragment> = Vec::new();

        for (index, node) in trace.nodes().iter().enumerate() {
            let op = match &node.op {
                NodeOp::HighLevel(op) => op,
                NodeOp::Kernel(handle) => {
                    return Err(anyhow!(
                        "{} is a kernel node and has no gradient rule",
                        handle.qualified_name()
                    ))
                }
            };
            let inputs = env.inputs(node)?;
            let args = OpArgs::new(op.operator().qualified_name(), &inputs, &node.attrs);
            let (record, rule) = self.dispatch(index, op, &args, true);
            let (transform, executor): (&TransformFn, &str) = match &rule {
                Some(rule) => (
                    rule.gradient()
                        .ok_or_else(|| anyhow!("rule for {} lost its gradient transform", op.name()))?,
                    rule.executor(),
                ),
                None => (
                    op.default_grad().ok_or_else(|| {
                        anyhow!(
                            "{} has no default gradient and no executor admits it",
                            op.operator().qualified_name()
                        )
                    })?,
                    op.operator().namespace(),
                ),
            };

            tracer.begin_backward();
            let result = transform(&mut tracer, &args);
            let fragment = tracer.end_backward();
            let outputs = result.with_context(|| {
                format!(
                    "gradient transform of executor '{}' for {}",
                    executor,
                    op.operator().qualified_name()
                )
            })?;
            check_transform(op, executor, &inputs, &node.attrs, &outputs)?;
            if !fragment.is_empty() {
                fragments.push(fragment);
            }
            report.records.push(record);
            env.bind_outputs(node, outputs)?;
        }

        let primal_outputs = env.outputs(trace)?;
        let primal_inputs = env.source_inputs(trace)?;

        let mut binding = GradientBinding::new();
        for output in &primal_outputs {
            let cotangent = tracer.input(output.meta().clone());
            binding.accumulate(&mut tracer, output.id(), cotangent)?;
        }

        for fragment in fragments.into_iter().rev() {
            replay_fragment(&mut tracer, &mut binding, fragment)?;
        }

        let mut outputs = primal_outputs.clone();
        for input in &primal_inputs {
            let grad = match binding.get(input.id()) {
                Some(grad) => grad.clone(),
                None => zeros_like(&mut tracer, input)?,
            };
            outputs.push(grad);
        }

        let rewritten = tracer.finish(&outputs.iter().collect::<Vec<_>>())?;
        log_report(&report);
        Ok(Rewritten {
            trace: rewritten,
            report,
        })
    }

    fn dispatch(
        &self,
        node: usize,
        op: &HighLevelOp,
        args: &OpArgs<'_, SymbolicTensor>,
        gradient: bool,
    ) -> (DispatchRecord, Option<Arc<SubstitutionRule>>) {
        let mut state = DispatchState::Unresolved;
        state.advance(DispatchState::Checking);

        let key = DispatchKey::new(op.id(), gradient, args.tensors(), args.attrs());
        let cached = self.cached_decision(&key);
        let hit = cached.is_some();
        let rule = match cached {
            Some(rule) => rule,
            None => {
                let executors = self.options.executors.as_deref();
                let rule = self
                    .registry
                    .candidate_rules(op, executors, gradient)
                    .into_iter()
                    .find(|rule| rule.admits(args));
                self.store_decision(key, rule.clone());
                rule
            }
        };

        match &rule {
            Some(rule) => state.advance(DispatchState::Substituted {
                executor: rule.executor().to_string(),
            }),
            None => state.advance(DispatchState::Fallback),
        }
        debug_assert!(state.is_terminal());
        tracing::debug!(
            node,
            op = op.operator().qualified_name(),
            state = %state,
            cached = hit,
            gradient,
            "dispatch decision"
        );
        (
            DispatchRecord {
                node,
                op: op.operator().qualified_name().to_string(),
                state,
                cached: hit,
            },
            rule,
        )
    }

    fn cached_decision(&self, key: &DispatchKey) -> Option<Option<Arc<SubstitutionRule>>> {
        let mut guard = self.decisions.lock().ok()?;
        guard.as_mut()?.get(key).cloned()
    }

    fn store_decision(&self, key: DispatchKey, rule: Option<Arc<SubstitutionRule>>) {
        if let Ok(mut guard) = self.decisions.lock() {
            if let Some(cache) = guard.as_mut() {
                cache.put(key, rule);
            }
        }
    }
}

/// Source-trace symbol to rewritten-trace symbol.
struct SymbolMap {
    symbols: HashMap<SymbolId, SymbolicTensor>,
}

impl SymbolMap {
    fn new(trace: &Trace, tracer: &mut Tracer) -> Self {
        let symbols = trace
            .inputs()
            .iter()
            .map(|id| (*id, tracer.input(trace.meta(*id).clone())))
            .collect();
        Self { symbols }
    }

    fn get(&self, id: SymbolId) -> Result<&SymbolicTensor> {
        self.symbols
            .get(&id)
            .ok_or_else(|| anyhow!("symbol {} is used before it is defined", id))
    }

    fn inputs(&self, node: &Node) -> Result<Vec<Option<SymbolicTensor>>> {
        node.inputs
            .iter()
            .map(|input| input.map(|id| self.get(id).cloned()).transpose())
            .collect()
    }

    fn bind_outputs(&mut self, node: &Node, outputs: Vec<SymbolicTensor>) -> Result<()> {
        if outputs.len() != node.outputs.len() {
            return Err(anyhow!(
                "{} produced {} outputs, trace expects {}",
                node.op.qualified_name(),
                outputs.len(),
                node.outputs.len()
            ));
        }
        for (id, output) in node.outputs.iter().zip(outputs) {
            self.symbols.insert(*id, output);
        }
        Ok(())
    }

    fn outputs(&self, trace: &Trace) -> Result<Vec<SymbolicTensor>> {
        trace.outputs().iter().map(|id| self.get(*id).cloned()).collect()
    }

    fn source_inputs(&self, trace: &Trace) -> Result<Vec<SymbolicTensor>> {
        trace.inputs().iter().map(|id| self.get(*id).cloned()).collect()
    }
}

fn refs(inputs: &[Option<SymbolicTensor>]) -> Vec<Option<&SymbolicTensor>> {
    inputs.iter().map(Option::as_ref).collect()
}

/// A transform must reproduce the high-level operator's declared outputs exactly.
fn check_transform(
    op: &HighLevelOp,
    executor: &str,
    inputs: &[Option<SymbolicTensor>],
    attrs: &Attrs,
    outputs: &[SymbolicTensor],
) -> Result<()> {
    let metas: Vec<Option<TensorMeta>> = inputs
        .iter()
        .map(|input| input.as_ref().map(|tensor| tensor.meta().clone()))
        .collect();
    let expected = op.infer(&metas, attrs)?;
    let count = expected.len().max(outputs.len());
    for index in 0..count {
        let declared = expected.get(index);
        let produced = outputs.get(index).map(SymbolicTensor::meta);
        if declared != produced {
            return Err(ContractViolation::TransformMismatch {
                executor: executor.to_string(),
                op: op.operator().qualified_name().to_string(),
                index,
                expected: declared.map_or_else(|| "nothing".to_string(), ToString::to_string),
                actual: produced.map_or_else(|| "nothing".to_string(), ToString::to_string),
            }
            .into());
        }
    }
    Ok(())
}

fn replay_fragment(
    tracer: &mut Tracer,
    binding: &mut GradientBinding,
    fragment: BackwardFragment,
) -> Result<()> {
    let mut remap: HashMap<SymbolId, SymbolId> = HashMap::new();
    for (placeholder, primal) in fragment.placeholders {
        let grad = match binding.get(primal) {
            Some(grad) => grad.clone(),
            None => {
                let primal = tracer.symbol(primal)?;
                zeros_like(tracer, &primal)?
            }
        };
        remap.insert(placeholder, grad.id());
    }
    for step in fragment.steps {
        match step {
            BackwardStep::Node(node) => tracer.replay(node, &remap),
            BackwardStep::Accumulate {
                target,
                contribution,
            } => {
                let contribution = remap.get(&contribution).copied().unwrap_or(contribution);
                let contribution = tracer.symbol(contribution)?;
                binding.accumulate(tracer, target, contribution)?;
            }
        }
    }
    Ok(())
}

fn log_report(report: &DispatchReport) {
    tracing::debug!(
        nodes = report.records().len(),
        substituted = report.substituted(),
        fallbacks = report.fallbacks(),
        "rewrite finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::add_op;
    use crate::tensor::{DType, Device, Shape};

    fn key(inputs: &[Option<SymbolicTensor>], gradient: bool, scale: f64) -> DispatchKey {
        let attrs = Attrs::new().with("scale", scale);
        DispatchKey::new(add_op().id(), gradient, inputs, &attrs)
    }

    #[test]
    fn dispatch_keys_compare_every_field() {
        let mut tracer = Tracer::new();
        let x = tracer.input(TensorMeta::new(Shape::new([2, 3]), DType::F32, Device::cpu()));
        let y = tracer.input(TensorMeta::new(Shape::new([2, 3]), DType::F16, Device::cpu()));

        let base = key(&[Some(x.clone())], false, 0.0);
        assert_eq!(base, key(&[Some(x.clone())], false, 0.0));
        assert_ne!(base, key(&[Some(x.clone())], false, -0.0));
        assert_ne!(base, key(&[Some(x.clone())], true, 0.0));
        assert_ne!(base, key(&[Some(y)], false, 0.0));
        assert_ne!(base, key(&[Some(x), None], false, 0.0));
    }
}
