//! Provenance hook for freshly constructed gradient variables.
//!
//! A debugging frontend can install a hook to attach each new adjoint to
//! the forward node it was derived from. Without a hook installed the
//! event is only logged at trace level.

use std::cell::Cell;

use crate::graph::node::{NodeId, VarPtr};

/// Called once per freshly constructed adjoint variable with the adjoint,
/// the identifier of the forward node it derives from and the edge index
/// it came through
pub type GradTraceFn = fn(child: &VarPtr, parent: NodeId, index: usize);

thread_local! {
    static GRAD_TRACE: Cell<Option<GradTraceFn>> = const { Cell::new(None) };
}

/// Installs (or with `None`, removes) the gradient provenance hook for the
/// current thread
pub fn set_grad_trace(hook: Option<GradTraceFn>) {
    GRAD_TRACE.with(|cell| cell.set(hook));
}

pub(crate) fn trace_grad(child: &VarPtr, parent: NodeId, index: usize) {
    match GRAD_TRACE.with(Cell::get) {
        Some(hook) => hook(child, parent, index),
        None => log::trace!("new grad {child:?} from node {parent} through edge {index}"),
    }
}
