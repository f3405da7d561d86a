//! Low-level operator declarations.
//!
//! An operator pairs a meta function (shape, dtype, and device inference over
//! [`TensorMeta`]s) with an implementation over concrete [`Tensor`]s. Both are bound to one
//! [`Signature`]. Tracing a call runs only the meta function and records a node; the
//! implementation runs later when the trace is executed.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};

use super::attrs::Attrs;
use super::signature::{OpArgs, Signature};
use crate::error::ContractViolation;
use crate::graph::trace::{NodeOp, Tracer};
use crate::tensor::{SymbolicTensor, Tensor, TensorMeta};

/// Symbolic inference: output metas from input metas and bound static arguments.
pub type MetaFn = Arc<dyn Fn(&OpArgs<'_, TensorMeta>) -> Result<Vec<TensorMeta>> + Send + Sync>;

/// Numeric implementation over contiguous host tensors.
pub type ImplFn = Arc<dyn Fn(&OpArgs<'_, Tensor>) -> Result<Vec<Tensor>> + Send + Sync>;

static NEXT_OPERATOR_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique operator identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperatorId(u64);

impl OperatorId {
    fn next() -> Self {
        OperatorId(NEXT_OPERATOR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Full declaration of a registered operator.
pub struct OperatorSpec {
    id: OperatorId,
    namespace: String,
    name: String,
    qualified_name: String,
    signature: Signature,
    meta: MetaFn,
    imp: ImplFn,
}

impl OperatorSpec {
    pub(crate) fn new<M, I>(namespace: &str, name: &str, signature: Signature, meta: M, imp: I) -> Self
    where
        M: Fn(&OpArgs<'_, TensorMeta>) -> Result<Vec<TensorMeta>> + Send + Sync + 'static,
        I: Fn(&OpArgs<'_, Tensor>) -> Result<Vec<Tensor>> + Send + Sync + 'static,
    {
        Self {
            id: OperatorId::next(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            qualified_name: format!("{namespace}::{name}"),
            signature,
            meta: Arc::new(meta),
            imp: Arc::new(imp),
        }
    }
}

impl fmt::Debug for OperatorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorSpec")
            .field("id", &self.id)
            .field("qualified_name", &self.qualified_name)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

/// Cheap, clonable reference to a registered operator.
#[derive(Clone)]
pub struct OperatorHandle {
    spec: Arc<OperatorSpec>,
}

impl OperatorHandle {
    pub(crate) fn new(spec: OperatorSpec) -> Self {
        Self {
            spec: Arc::new(spec),
        }
    }

    pub fn id(&self) -> OperatorId {
        self.spec.id
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn namespace(&self) -> &str {
        &self.spec.namespace
    }

    /// `namespace::name`, as printed in traces and errors.
    pub fn qualified_name(&self) -> &str {
        &self.spec.qualified_name
    }

    pub fn signature(&self) -> &Signature {
        &self.spec.signature
    }

    /// Runs the meta function on symbolic inputs after validating and binding arguments.
    pub fn infer(&self, inputs: &[Option<TensorMeta>], attrs: &Attrs) -> Result<Vec<TensorMeta>> {
        let bound = self.bind(inputs, attrs)?;
        self.infer_bound(inputs, &bound)
    }

    fn infer_bound(&self, inputs: &[Option<TensorMeta>], bound: &Attrs) -> Result<Vec<TensorMeta>> {
        (self.spec.meta)(&OpArgs::new(self.qualified_name(), inputs, bound))
            .with_context(|| format!("meta inference for {}", self.qualified_name()))
    }

    fn bind<T>(&self, inputs: &[Option<T>], attrs: &Attrs) -> Result<Attrs> {
        let name = self.qualified_name();
        self.spec.signature.check_operands(name, inputs)?;
        Ok(self.spec.signature.bind_attrs(name, attrs)?)
    }

    /// Records a call in `tracer` and returns symbolic placeholders for its outputs.
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
        let bound = self.bind(&metas, attrs)?;
        let outputs = self.infer_bound(&metas, &bound)?;
        tracer.record(NodeOp::Kernel(self.clone()), inputs, bound, outputs)
    }

    /// Runs the implementation on concrete tensors. Inputs are made contiguous first.
    pub fn execute(&self, inputs: &[Option<Tensor>], attrs: &Attrs) -> Result<Vec<Tensor>> {
        let bound = self.bind(inputs, attrs)?;
        let contiguous: Vec<Option<Tensor>> = inputs
            .iter()
            .map(|input| input.as_ref().map(Tensor::contiguous))
            .collect();
        (self.spec.imp)(&OpArgs::new(self.qualified_name(), &contiguous, &bound))
            .with_context(|| format!("executing {}", self.qualified_name()))
    }

    /// Like [`execute`](Self::execute), then checks every output against the meta function.
    pub fn execute_verified(&self, inputs: &[Option<Tensor>], attrs: &Attrs) -> Result<Vec<Tensor>> {
        let outputs = self.execute(inputs, attrs)?;
        let metas: Vec<Option<TensorMeta>> = inputs
            .iter()
            .map(|input| input.as_ref().map(Tensor::meta))
            .collect();
        let expected = self.infer(&metas, attrs)?;
        if expected.len() != outputs.len() {
            return Err(ContractViolation::OutputArity {
                op: self.qualified_name().to_string(),
                expected: expected.len(),
                actual: outputs.len(),
            }
            .into());
        }
        for (index, (declared, produced)) in expected.iter().zip(outputs.iter()).enumerate() {
            let actual = produced.meta();
            if *declared != actual {
                return Err(ContractViolation::ShapeContract {
                    op: self.qualified_name().to_string(),
                    index,
                    expected: declared.clone(),
                    actual,
                }
                .into());
            }
        }
        Ok(outputs)
    }
}

impl PartialEq for OperatorHandle {
    fn eq(&self, other: &Self) -> bool {
        self.spec.id == other.spec.id
    }
}

impl Eq for OperatorHandle {}

impl fmt::Debug for OperatorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OperatorHandle({})", self.qualified_name())
    }
}

impl fmt::Display for OperatorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.qualified_name())
    }
}
