//! Substitution rules: a checker guarding a pair of transforms for one high-level operator.

use std::fmt;
use std::sync::Arc;

use crate::ops::{HighLevelOp, OpArgs, TransformFn};
use crate::tensor::SymbolicTensor;

/// Decides from symbolic metadata and static arguments alone whether a substitution is legal.
///
/// Implementations must be pure: same arguments, same answer, no side effects. They never
/// return errors; a malformed call is simply not admitted.
pub trait CapabilityChecker: Send + Sync {
    fn admits(&self, args: &OpArgs<'_, SymbolicTensor>) -> bool;
}

/// Adapts a closure into a [`CapabilityChecker`].
pub struct FnChecker<F>(F);

impl<F> CapabilityChecker for FnChecker<F>
where
    F: Fn(&OpArgs<'_, SymbolicTensor>) -> bool + Send + Sync,
{
    fn admits(&self, args: &OpArgs<'_, SymbolicTensor>) -> bool {
        (self.0)(args)
    }
}

pub fn checker_fn<F>(f: F) -> FnChecker<F>
where
    F: Fn(&OpArgs<'_, SymbolicTensor>) -> bool + Send + Sync,
{
    FnChecker(f)
}

/// A checker that admits every call.
pub struct AlwaysAdmit;

impl CapabilityChecker for AlwaysAdmit {
    fn admits(&self, _args: &OpArgs<'_, SymbolicTensor>) -> bool {
        true
    }
}

/// Substitution of `target` by an executor's operators, guarded by `checker`.
///
/// The executor name and sequence number are assigned when the rule is registered.
#[derive(Clone)]
pub struct SubstitutionRule {
    target: HighLevelOp,
    checker: Arc<dyn CapabilityChecker>,
    execution: TransformFn,
    gradient: Option<TransformFn>,
    priority: i32,
    executor: String,
    sequence: usize,
}

impl SubstitutionRule {
    pub fn new(
        target: &HighLevelOp,
        checker: impl CapabilityChecker + 'static,
        execution: TransformFn,
    ) -> Self {
        Self {
            target: target.clone(),
            checker: Arc::new(checker),
            execution,
            gradient: None,
            priority: 0,
            executor: String::new(),
            sequence: 0,
        }
    }

    /// Attaches a gradient transform, making the rule eligible while building backward graphs.
    pub fn with_gradient(mut self, gradient: TransformFn) -> Self {
        self.gradient = Some(gradient);
        self
    }

    /// Higher priorities are consulted first; ties keep registration order.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub(crate) fn bind(mut self, executor: &str, sequence: usize) -> Self {
        self.executor = executor.to_string();
        self.sequence = sequence;
        self
    }

    pub fn target(&self) -> &HighLevelOp {
        &self.target
    }

    pub fn admits(&self, args: &OpArgs<'_, SymbolicTensor>) -> bool {
        self.checker.admits(args)
    }

    pub fn execution(&self) -> &TransformFn {
        &self.execution
    }

    pub fn gradient(&self) -> Option<&TransformFn> {
        self.gradient.as_ref()
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Name of the executor namespace that registered the rule.
    pub fn executor(&self) -> &str {
        &self.executor
    }

    pub fn sequence(&self) -> usize {
        self.sequence
    }
}

impl fmt::Debug for SubstitutionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubstitutionRule")
            .field("target", &self.target.operator().qualified_name())
            .field("executor", &self.executor)
            .field("priority", &self.priority)
            .field("sequence", &self.sequence)
            .field("has_gradient", &self.gradient.is_some())
            .finish()
    }
}
