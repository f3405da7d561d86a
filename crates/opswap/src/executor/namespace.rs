//! Executor namespaces own operators and substitution rules.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use super::rule::SubstitutionRule;
use crate::error::RegistryError;
use crate::ops::{HighLevelOp, OpArgs, OperatorHandle, OperatorSpec, Signature, TransformFn};
use crate::tensor::{Tensor, TensorMeta};

/// A named, versioned collection of operators plus the rules that substitute them in.
#[derive(Debug)]
pub struct ExecutorNamespace {
    name: String,
    version: String,
    operators: Vec<OperatorHandle>,
    by_name: HashMap<String, usize>,
    rules: Vec<Arc<SubstitutionRule>>,
}

impl ExecutorNamespace {
    pub(crate) fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            operators: Vec::new(),
            by_name: HashMap::new(),
            rules: Vec::new(),
        }
    }

    /// A namespace pre-populated with operators declared elsewhere. Later duplicates of a
    /// name are skipped.
    pub(crate) fn with_operators(
        name: &str,
        version: &str,
        operators: impl IntoIterator<Item = OperatorHandle>,
    ) -> Self {
        let mut namespace = Self::new(name, version);
        for handle in operators {
            if !namespace.by_name.contains_key(handle.name()) {
                namespace.push_operator(handle);
            }
        }
        namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Declares an operator with separate meta and implementation functions.
    ///
    /// Fails with [`RegistryError::NameCollision`] when `name` is already taken here; the same
    /// name in another namespace is fine.
    pub fn register_operator<M, I>(
        &mut self,
        name: &str,
        signature: Signature,
        meta: M,
        imp: I,
    ) -> Result<OperatorHandle, RegistryError>
    where
        M: Fn(&OpArgs<'_, TensorMeta>) -> Result<Vec<TensorMeta>> + Send + Sync + 'static,
        I: Fn(&OpArgs<'_, Tensor>) -> Result<Vec<Tensor>> + Send + Sync + 'static,
    {
        self.ensure_free(name)?;
        let handle = OperatorHandle::new(OperatorSpec::new(&self.name, name, signature, meta, imp));
        self.push_operator(handle.clone());
        Ok(handle)
    }

    /// Declares a high-level operator whose implementation serves as the reference fallback.
    pub fn register_high_level<M, I>(
        &mut self,
        name: &str,
        signature: Signature,
        meta: M,
        imp: I,
        default_grad: Option<TransformFn>,
    ) -> Result<HighLevelOp, RegistryError>
    where
        M: Fn(&OpArgs<'_, TensorMeta>) -> Result<Vec<TensorMeta>> + Send + Sync + 'static,
        I: Fn(&OpArgs<'_, Tensor>) -> Result<Vec<Tensor>> + Send + Sync + 'static,
    {
        let operator = self.register_operator(name, signature, meta, imp)?;
        Ok(HighLevelOp::new(operator, default_grad))
    }

    fn ensure_free(&self, name: &str) -> Result<(), RegistryError> {
        if self.by_name.contains_key(name) {
            return Err(RegistryError::NameCollision {
                namespace: self.name.clone(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Callers guarantee the name is free.
    fn push_operator(&mut self, handle: OperatorHandle) {
        debug_assert!(!self.by_name.contains_key(handle.name()));
        tracing::debug!(
            namespace = %self.name,
            operator = handle.name(),
            "registered operator"
        );
        self.by_name
            .insert(handle.name().to_string(), self.operators.len());
        self.operators.push(handle);
    }

    pub fn operator(&self, name: &str) -> Option<&OperatorHandle> {
        self.by_name.get(name).map(|&index| &self.operators[index])
    }

    pub fn operators(&self) -> &[OperatorHandle] {
        &self.operators
    }

    /// Adds a rule; it is consulted after this namespace's earlier rules of equal priority.
    pub fn register_rule(&mut self, rule: SubstitutionRule) {
        let rule = rule.bind(&self.name, self.rules.len());
        tracing::debug!(
            executor = %self.name,
            target = rule.target().operator().qualified_name(),
            priority = rule.priority(),
            gradient = rule.gradient().is_some(),
            "registered substitution rule"
        );
        self.rules.push(Arc::new(rule));
    }

    pub fn rules(&self) -> &[Arc<SubstitutionRule>] {
        &self.rules
    }
}
