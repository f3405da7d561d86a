//! Traced programs and the tracer that records them.

use std::collections::HashMap;
use std::fmt;

use anyhow::{anyhow, ensure, Result};
use smallvec::SmallVec;

use super::grad::{BackwardFragment, BackwardStep, GradCapture};
use crate::ops::{Attrs, HighLevelOp, OperatorHandle};
use crate::tensor::{SymbolId, SymbolicTensor, TensorMeta, TraceId};

/// What a node invokes.
#[derive(Debug, Clone)]
pub enum NodeOp {
    /// A generic operator subject to substitution; executes its reference implementation.
    HighLevel(HighLevelOp),
    /// A concrete kernel executed as-is.
    Kernel(OperatorHandle),
}

impl NodeOp {
    pub fn operator(&self) -> &OperatorHandle {
        match self {
            NodeOp::HighLevel(op) => op.operator(),
            NodeOp::Kernel(handle) => handle,
        }
    }

    pub fn qualified_name(&self) -> &str {
        self.operator().qualified_name()
    }

    pub fn is_high_level(&self) -> bool {
        matches!(self, NodeOp::HighLevel(_))
    }
}

/// One recorded operator call.
#[derive(Debug, Clone)]
pub struct Node {
    pub op: NodeOp,
    pub inputs: Vec<Option<SymbolId>>,
    pub attrs: Attrs,
    pub outputs: SmallVec<[SymbolId; 2]>,
}

/// A finished, immutable program over symbolic values.
#[derive(Debug, Clone)]
pub struct Trace {
    id: TraceId,
    symbols: Vec<TensorMeta>,
    inputs: Vec<SymbolId>,
    nodes: Vec<Node>,
    outputs: Vec<SymbolId>,
}

impl Trace {
    pub fn meta(&self, id: SymbolId) -> &TensorMeta {
        &self.symbols[id.index()]
    }

    pub fn symbol(&self, id: SymbolId) -> SymbolicTensor {
        SymbolicTensor::new(self.id, id, self.meta(id).clone())
    }

    pub fn num_symbols(&self) -> usize {
        self.symbols.len()
    }

    pub fn inputs(&self) -> &[SymbolId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[SymbolId] {
        &self.outputs
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn input_metas(&self) -> Vec<TensorMeta> {
        self.inputs.iter().map(|id| self.meta(*id).clone()).collect()
    }

    pub fn output_metas(&self) -> Vec<TensorMeta> {
        self.outputs.iter().map(|id| self.meta(*id).clone()).collect()
    }

    /// Number of nodes invoking the operator named `qualified_name`.
    pub fn count_op(&self, qualified_name: &str) -> usize {
        self.nodes
            .iter()
            .filter(|node| node.op.qualified_name() == qualified_name)
            .count()
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inputs: Vec<String> = self
            .inputs
            .iter()
            .map(|id| format!("{}: {}", id, self.meta(*id)))
            .collect();
        writeln!(f, "trace({}) {{", inputs.join(", "))?;
        for node in &self.nodes {
            let outputs: Vec<String> = node.outputs.iter().map(ToString::to_string).collect();
            let inputs: Vec<String> = node
                .inputs
                .iter()
                .map(|input| input.map_or_else(|| "_".to_string(), |id| id.to_string()))
                .collect();
            write!(
                f,
                "  {} = {}({})",
                outputs.join(", "),
                node.op.qualified_name(),
                inputs.join(", ")
            )?;
            if !node.attrs.is_empty() {
                write!(f, " {}", node.attrs)?;
            }
            writeln!(f)?;
        }
        let outputs: Vec<String> = self.outputs.iter().map(ToString::to_string).collect();
        writeln!(f, "  return {}", outputs.join(", "))?;
        f.write_str("}")
    }
}

/// Records operator calls into a [`Trace`].
///
/// While a backward capture is open (gradient transforms during a joint rewrite), every node
/// that transitively depends on an incoming-gradient placeholder is diverted into the capture
/// instead of the forward node list.
#[derive(Debug)]
pub struct Tracer {
    id: TraceId,
    symbols: Vec<TensorMeta>,
    inputs: Vec<SymbolId>,
    nodes: Vec<Node>,
    capture: Option<GradCapture>,
}

impl Tracer {
    pub fn new() -> Self {
        Self {
            id: TraceId::next(),
            symbols: Vec::new(),
            inputs: Vec::new(),
            nodes: Vec::new(),
            capture: None,
        }
    }

    pub fn id(&self) -> TraceId {
        self.id
    }

    /// Declares a program input.
    pub fn input(&mut self, meta: TensorMeta) -> SymbolicTensor {
        let symbol = self.fresh(meta);
        self.inputs.push(symbol.id());
        symbol
    }

    pub fn symbol(&self, id: SymbolId) -> Result<SymbolicTensor> {
        self.symbols
            .get(id.index())
            .map(|meta| SymbolicTensor::new(self.id, id, meta.clone()))
            .ok_or_else(|| anyhow!("symbol {} does not belong to this trace", id))
    }

    fn fresh(&mut self, meta: TensorMeta) -> SymbolicTensor {
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(meta.clone());
        SymbolicTensor::new(self.id, id, meta)
    }

    fn check_owned(&self, tensor: &SymbolicTensor) -> Result<()> {
        ensure!(
            tensor.trace() == self.id
                && self.symbols.get(tensor.id().index()) == Some(tensor.meta()),
            "symbol {} ({}) does not belong to this trace",
            tensor.id(),
            tensor.meta()
        );
        Ok(())
    }

    pub(crate) fn record(
        &mut self,
        op: NodeOp,
        inputs: &[Option<&SymbolicTensor>],
        attrs: Attrs,
        outputs: Vec<TensorMeta>,
    ) -> Result<Vec<SymbolicTensor>> {
        for input in inputs.iter().flatten() {
            self.check_owned(input)?;
        }
        let results: Vec<SymbolicTensor> =
            outputs.into_iter().map(|meta| self.fresh(meta)).collect();
        let node = Node {
            op,
            inputs: inputs.iter().map(|input| input.map(SymbolicTensor::id)).collect(),
            attrs,
            outputs: results.iter().map(SymbolicTensor::id).collect(),
        };
        match self.capture.as_mut() {
            Some(capture) if capture.depends_on_gradient(&node) => {
                capture.taint(&node.outputs);
                capture.steps.push(BackwardStep::Node(node));
            }
            _ => self.nodes.push(node),
        }
        Ok(results)
    }

    /// Appends an already-built node, renaming its inputs through `remap`.
    pub(crate) fn replay(&mut self, mut node: Node, remap: &HashMap<SymbolId, SymbolId>) {
        for input in node.inputs.iter_mut().flatten() {
            if let Some(renamed) = remap.get(input) {
                *input = *renamed;
            }
        }
        self.nodes.push(node);
    }

    pub(crate) fn begin_backward(&mut self) {
        debug_assert!(self.capture.is_none(), "backward capture already open");
        self.capture = Some(GradCapture::default());
    }

    pub(crate) fn end_backward(&mut self) -> BackwardFragment {
        self.capture
            .take()
            .map(GradCapture::into_fragment)
            .unwrap_or_default()
    }

    pub fn in_backward(&self) -> bool {
        self.capture.is_some()
    }

    /// Symbolic gradient flowing into `primal` from everything downstream of it.
    ///
    /// Only available inside a gradient transform. Repeated calls for the same symbol return
    /// the same placeholder.
    pub fn incoming_gradient(&mut self, primal: &SymbolicTensor) -> Result<SymbolicTensor> {
        self.check_owned(primal)?;
        ensure!(
            self.capture.is_some(),
            "incoming_gradient is only available while building a backward graph"
        );
        if let Some(existing) = self
            .capture
            .as_ref()
            .and_then(|capture| capture.placeholder_for(primal.id()))
        {
            return self.symbol(existing);
        }
        let placeholder = self.fresh(primal.meta().clone());
        if let Some(capture) = self.capture.as_mut() {
            capture.add_placeholder(placeholder.id(), primal.id());
        }
        Ok(placeholder)
    }

    /// Adds `contribution` to the gradient of `target`, summing with earlier contributions.
    pub fn accumulate_gradient(&mut self, target: &SymbolicTensor, contribution: &SymbolicTensor) -> Result<()> {
        self.check_owned(target)?;
        self.check_owned(contribution)?;
        ensure!(
            target.meta() == contribution.meta(),
            "gradient {} does not match its primal {}",
            contribution.meta(),
            target.meta()
        );
        let capture = self.capture.as_mut().ok_or_else(|| {
            anyhow!("accumulate_gradient is only available while building a backward graph")
        })?;
        capture.steps.push(BackwardStep::Accumulate {
            target: target.id(),
            contribution: contribution.id(),
        });
        Ok(())
    }

    /// Closes the program with `outputs`.
    pub fn finish(self, outputs: &[&SymbolicTensor]) -> Result<Trace> {
        ensure!(
            self.capture.is_none(),
            "cannot finish a trace with an open backward capture"
        );
        for output in outputs {
            self.check_owned(output)?;
        }
        Ok(Trace {
            id: self.id,
            symbols: self.symbols,
            inputs: self.inputs,
            nodes: self.nodes,
            outputs: outputs.iter().map(|output| output.id()).collect(),
        })
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}
