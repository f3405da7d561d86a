//! The executor registry: every namespace, its operators and rules, and dispatch overrides.
//!
//! Registration happens on an owned, mutable [`ExecutorRegistry`]. Once every executor has
//! registered, [`ExecutorRegistry::freeze`] turns it into a shared read-only handle that
//! rewriters consult from any thread without locking.

use std::sync::Arc;

use super::namespace::ExecutorNamespace;
use super::overrides::{SubstitutionOverrides, SubstitutionPolicy};
use super::rule::SubstitutionRule;
use crate::error::RegistryError;
use crate::ops::{attention, prims, HighLevelOp, CORE_NAMESPACE};

/// Shared pointer to a frozen registry.
pub type ExecutorRegistryHandle = Arc<ExecutorRegistry>;

/// Version tag of the built-in `core` namespace.
pub const CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug)]
pub struct ExecutorRegistry {
    namespaces: Vec<ExecutorNamespace>,
    overrides: SubstitutionOverrides,
}

impl ExecutorRegistry {
    /// Creates a registry holding the `core` namespace and its built-in operators.
    pub fn new() -> Self {
        let core = ExecutorNamespace::with_operators(
            CORE_NAMESPACE,
            CORE_VERSION,
            [
                prims::add_op().operator().clone(),
                prims::zeros_like_op().clone(),
                attention::scaled_dot_product_attention_op().operator().clone(),
                attention::sdpa_backward_op().clone(),
            ],
        );
        Self {
            namespaces: vec![core],
            overrides: SubstitutionOverrides::default(),
        }
    }

    /// Adds an executor namespace. Namespaces are consulted in registration order.
    pub fn register_namespace(
        &mut self,
        name: &str,
        version: &str,
    ) -> Result<&mut ExecutorNamespace, RegistryError> {
        if self.namespace(name).is_some() {
            return Err(RegistryError::NamespaceCollision {
                name: name.to_string(),
            });
        }
        tracing::debug!(executor = name, version, "registered executor namespace");
        self.namespaces.push(ExecutorNamespace::new(name, version));
        let index = self.namespaces.len() - 1;
        Ok(&mut self.namespaces[index])
    }

    pub fn namespace(&self, name: &str) -> Option<&ExecutorNamespace> {
        self.namespaces.iter().find(|ns| ns.name() == name)
    }

    pub fn namespace_mut(&mut self, name: &str) -> Result<&mut ExecutorNamespace, RegistryError> {
        self.namespaces
            .iter_mut()
            .find(|ns| ns.name() == name)
            .ok_or_else(|| RegistryError::UnknownNamespace {
                name: name.to_string(),
            })
    }

    pub fn namespaces(&self) -> &[ExecutorNamespace] {
        &self.namespaces
    }

    pub fn with_overrides(mut self, overrides: SubstitutionOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn set_overrides(&mut self, overrides: SubstitutionOverrides) {
        self.overrides = overrides;
    }

    pub fn overrides(&self) -> &SubstitutionOverrides {
        &self.overrides
    }

    /// Configured policy for `op`; see [`SubstitutionOverrides::policy_for`].
    pub fn policy(&self, op: &HighLevelOp) -> SubstitutionPolicy {
        self.overrides
            .policy_for(op.operator().qualified_name(), op.name())
    }

    /// Rules targeting `target`, in the order they are tried.
    ///
    /// Ordering is priority (highest first), then namespace registration order, then rule
    /// registration order. `executors` restricts the namespaces consulted; the configured
    /// policy for the operator applies on top. With `gradient` set only rules carrying a
    /// gradient transform qualify.
    pub fn candidate_rules(
        &self,
        target: &HighLevelOp,
        executors: Option<&[String]>,
        gradient: bool,
    ) -> Vec<Arc<SubstitutionRule>> {
        let forced = match self.policy(target) {
            SubstitutionPolicy::Fallback => return Vec::new(),
            SubstitutionPolicy::Force { executor } => {
                if self.namespace(&executor).is_none() {
                    tracing::warn!(
                        op = target.name(),
                        executor = %executor,
                        "forced executor is not registered; running the reference implementation"
                    );
                    return Vec::new();
                }
                Some(executor)
            }
            SubstitutionPolicy::Default => None,
        };

        let mut candidates: Vec<(usize, Arc<SubstitutionRule>)> = self
            .namespaces
            .iter()
            .enumerate()
            .filter(|(_, ns)| {
                executors.map_or(true, |allowed| allowed.iter().any(|name| name == ns.name()))
            })
            .filter(|(_, ns)| forced.as_deref().map_or(true, |name| name == ns.name()))
            .flat_map(move |(order, ns)| {
                ns.rules()
                    .iter()
                    .filter(move |rule| rule.target() == target)
                    .filter(move |rule| !gradient || rule.gradient().is_some())
                    .map(move |rule| (order, Arc::clone(rule)))
            })
            .collect();
        candidates.sort_by(|(a_order, a), (b_order, b)| {
            b.priority()
                .cmp(&a.priority())
                .then(a_order.cmp(b_order))
                .then(a.sequence().cmp(&b.sequence()))
        });
        candidates.into_iter().map(|(_, rule)| rule).collect()
    }

    /// Ends the registration phase.
    pub fn freeze(self) -> ExecutorRegistryHandle {
        Arc::new(self)
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
