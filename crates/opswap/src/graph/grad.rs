//! Backward-graph bookkeeping: capture of gradient-transform fragments and accumulation of
//! gradient contributions per primal symbol.

use std::collections::{HashMap, HashSet};

use anyhow::Result;

use super::trace::{Node, Tracer};
use crate::ops::prims::{add_op, single};
use crate::ops::Attrs;
use crate::tensor::{SymbolId, SymbolicTensor};

#[derive(Debug, Clone)]
pub(crate) enum BackwardStep {
    Node(Node),
    Accumulate {
        target: SymbolId,
        contribution: SymbolId,
    },
}

/// State of an open backward capture on a [`Tracer`].
#[derive(Debug, Default)]
pub(crate) struct GradCapture {
    tainted: HashSet<SymbolId>,
    placeholders: Vec<(SymbolId, SymbolId)>,
    pub(crate) steps: Vec<BackwardStep>,
}

impl GradCapture {
    pub(crate) fn depends_on_gradient(&self, node: &Node) -> bool {
        node.inputs
            .iter()
            .flatten()
            .any(|input| self.tainted.contains(input))
    }

    pub(crate) fn taint(&mut self, symbols: &[SymbolId]) {
        self.tainted.extend(symbols.iter().copied());
    }

    pub(crate) fn placeholder_for(&self, primal: SymbolId) -> Option<SymbolId> {
        self.placeholders
            .iter()
            .find(|(_, p)| *p == primal)
            .map(|(placeholder, _)| *placeholder)
    }

    pub(crate) fn add_placeholder(&mut self, placeholder: SymbolId, primal: SymbolId) {
        self.tainted.insert(placeholder);
        self.placeholders.push((placeholder, primal));
    }

    pub(crate) fn into_fragment(self) -> BackwardFragment {
        BackwardFragment {
            placeholders: self.placeholders,
            steps: self.steps,
        }
    }
}

/// Deferred backward computation emitted by one gradient transform.
///
/// Placeholders are `(placeholder, primal)` pairs resolved once every downstream contribution
/// to `primal` has been accumulated.
#[derive(Debug, Clone, Default)]
pub(crate) struct BackwardFragment {
    pub(crate) placeholders: Vec<(SymbolId, SymbolId)>,
    pub(crate) steps: Vec<BackwardStep>,
}

impl BackwardFragment {
    pub(crate) fn is_empty(&self) -> bool {
        self.placeholders.is_empty() && self.steps.is_empty()
    }
}

/// Accumulated gradient per primal symbol for one backward construction pass.
#[derive(Debug, Default)]
pub struct GradientBinding {
    grads: HashMap<SymbolId, SymbolicTensor>,
}

impl GradientBinding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, primal: SymbolId) -> Option<&SymbolicTensor> {
        self.grads.get(&primal)
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// Binds `contribution` to `primal`, emitting a `core::add` when a gradient already exists.
    pub fn accumulate(
        &mut self,
        tracer: &mut Tracer,
        primal: SymbolId,
        contribution: SymbolicTensor,
    ) -> Result<()> {
        let summed = match self.grads.remove(&primal) {
            Some(existing) => single(add_op().operator().call(
                tracer,
                &[Some(&existing), Some(&contribution)],
                &Attrs::new(),
            )?)?,
            None => contribution,
        };
        self.grads.insert(primal, summed);
        Ok(())
    }
}
