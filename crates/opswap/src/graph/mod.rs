//! Traces, the tracer that records them, rewriting against executors, and execution.

pub mod grad;
pub mod interpreter;
pub mod rewriter;
pub mod trace;

pub use grad::GradientBinding;
pub use interpreter::{execute, execute_with, ExecutionOptions};
pub use rewriter::{
    DispatchRecord, DispatchReport, DispatchState, GraphRewriter, RewriteOptions, Rewritten,
};
pub use trace::{Node, NodeOp, Trace, Tracer};
