//! Concrete execution of traces on host tensors.

use anyhow::{anyhow, ensure, Result};

use super::trace::Trace;
use crate::env;
use crate::tensor::Tensor;

/// Options for [`execute_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Check every node's outputs against its operator's meta function.
    pub verify_contracts: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            verify_contracts: env::verify_contracts_enabled(),
        }
    }
}

/// Runs `trace` with default options.
pub fn execute(trace: &Trace, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
    execute_with(trace, inputs, ExecutionOptions::default())
}

/// Runs every node's implementation in order and returns the trace outputs.
///
/// High-level nodes that were not substituted run their reference implementation.
pub fn execute_with(trace: &Trace, inputs: &[Tensor], options: ExecutionOptions) -> Result<Vec<Tensor>> {
    ensure!(
        inputs.len() == trace.inputs().len(),
        "trace expects {} inputs, got {}",
        trace.inputs().len(),
        inputs.len()
    );
    let mut values: Vec<Option<Tensor>> = vec![None; trace.num_symbols()];
    for (index, (id, tensor)) in trace.inputs().iter().zip(inputs).enumerate() {
        let declared = trace.meta(*id);
        ensure!(
            *declared == tensor.meta(),
            "input {} is {}, trace declares {}",
            index,
            tensor.meta(),
            declared
        );
        values[id.index()] = Some(tensor.clone());
    }

    for node in trace.nodes() {
        let args = node
            .inputs
            .iter()
            .map(|input| match input {
                Some(id) => values[id.index()]
                    .clone()
                    .map(Some)
                    .ok_or_else(|| anyhow!("symbol {} has no value yet", id)),
                None => Ok(None),
            })
            .collect::<Result<Vec<Option<Tensor>>>>()?;

        let handle = node.op.operator();
        tracing::trace!(
            op = handle.qualified_name(),
            high_level = node.op.is_high_level(),
            "executing node"
        );
        let outputs = if options.verify_contracts {
            handle.execute_verified(&args, &node.attrs)?
        } else {
            handle.execute(&args, &node.attrs)?
        };
        ensure!(
            outputs.len() == node.outputs.len(),
            "{} produced {} outputs, trace expects {}",
            handle.qualified_name(),
            outputs.len(),
            node.outputs.len()
        );
        for (id, tensor) in node.outputs.iter().zip(outputs) {
            values[id.index()] = Some(tensor);
        }
    }

    trace
        .outputs()
        .iter()
        .map(|id| {
            values[id.index()]
                .clone()
                .ok_or_else(|| anyhow!("trace output {} was never computed", id))
        })
        .collect()
}
