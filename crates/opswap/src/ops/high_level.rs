//! High-level operators: the generic nodes a substitution rule can target.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use super::attrs::Attrs;
use super::registry::{OperatorHandle, OperatorId};
use super::signature::OpArgs;
use crate::graph::trace::{NodeOp, Tracer};
use crate::tensor::{SymbolicTensor, TensorMeta};

/// Rewrites one node into calls on registered operators, returning the node's outputs.
///
/// Used both for execution transforms and for gradient transforms; the latter additionally
/// call [`Tracer::incoming_gradient`] and [`Tracer::accumulate_gradient`].
pub type TransformFn =
    Arc<dyn Fn(&mut Tracer, &OpArgs<'_, SymbolicTensor>) -> Result<Vec<SymbolicTensor>> + Send + Sync>;

/// Wraps a closure as a [`TransformFn`], pinning down the higher-ranked argument lifetime.
pub fn transform_fn<F>(f: F) -> TransformFn
where
    F: Fn(&mut Tracer, &OpArgs<'_, SymbolicTensor>) -> Result<Vec<SymbolicTensor>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// An operator (meta plus reference implementation) and its default gradient rule.
///
/// When no substitution rule admits a node, the reference implementation runs; in gradient
/// mode the default gradient transform builds the backward graph.
#[derive(Clone)]
pub struct HighLevelOp {
    operator: OperatorHandle,
    default_grad: Option<TransformFn>,
}

impl HighLevelOp {
    pub fn new(operator: OperatorHandle, default_grad: Option<TransformFn>) -> Self {
        Self {
            operator,
            default_grad,
        }
    }

    pub fn id(&self) -> OperatorId {
        self.operator.id()
    }

    pub fn name(&self) -> &str {
        self.operator.name()
    }

    pub fn operator(&self) -> &OperatorHandle {
        &self.operator
    }

    pub fn default_grad(&self) -> Option<&TransformFn> {
        self.default_grad.as_ref()
    }

    pub fn infer(&self, inputs: &[Option<TensorMeta>], attrs: &Attrs) -> Result<Vec<TensorMeta>> {
        self.operator.infer(inputs, attrs)
    }

    /// Records a high-level node; the rewriter later decides how it executes.
    pub fn call(
        &self,
        tracer: &mut Tracer,
        inputs: &[Option<&SymbolicTensor>],
        attrs: &Attrs,
    ) -> Result<Vec<SymbolicTensor>> {
        let metas: Vec<Option<TensorMeta>> = inputs
            .iter()
            .map(|input| input.map(|tensor| tensor.meta().clone()))
            .collect();
        let signature = self.operator.signature();
        signature.check_operands(self.operator.qualified_name(), &metas)?;
        let bound = signature.bind_attrs(self.operator.qualified_name(), attrs)?;
        let outputs = self.operator.infer(&metas, &bound)?;
        tracer.record(NodeOp::HighLevel(self.clone()), inputs, bound, outputs)
    }
}

impl PartialEq for HighLevelOp {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for HighLevelOp {}

impl fmt::Debug for HighLevelOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HighLevelOp")
            .field("operator", &self.operator)
            .field("has_default_grad", &self.default_grad.is_some())
            .finish()
    }
}
