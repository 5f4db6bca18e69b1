//! # Zanshin
//!
//! **Zanshin** is the reverse-mode
//! [automatic differentiation](https://en.wikipedia.org/wiki/Automatic_differentiation)
//! engine of a lazy tensor computation framework. It owns the part of
//! autodiff that is independent of any tensor backend: deciding which
//! nodes of a computation graph carry gradient, ordering the backward
//! walk, accumulating fan-out contributions and composing per-operator
//! local adjoints into gradient variables.
//!
//! Variables here are symbolic, they carry a shape and an elemental type
//! but no storage. Calling [`grad`] does not compute numbers, it extends
//! the graph with the adjoint of the loss and returns one new variable per
//! target. Evaluating those variables is the business of whatever backend
//! registered the operators.
//!
//! ## Usage
//! ```rust
//! use zanshin as zn;
//!
//! let x = zn::variable(&[3], zn::DType::Float32);
//! let y = zn::binary(&x, &x, zn::BinaryKind::Mul);
//! let loss = zn::reduce_sum(&y);
//!
//! let grads = zn::grad(&loss, &[x.clone()]);
//! assert_eq!(grads[0].shape(), x.shape());
//! ```
//!
//! The gradient variables are ordinary graph nodes, so feeding them back
//! into [`grad`] yields higher-order derivatives.
//!
//! Whole sub-regions of a graph can be declared opaque for
//! differentiation with [`tape`] and [`tape_together`]: the region's
//! interior is never traversed and a user callback supplies the adjoints
//! of all taped inputs from the adjoints of all taped outputs in one call.
//!
//! A differentiation pass appends sums while accumulating gradients along
//! fan-out edges. To keep a later fusing compiler from swallowing an
//! unbounded summation chain into a single kernel, every chain longer
//! than [`prevent_large_fused_op`] is broken with a fusion barrier.

#![deny(
    unsafe_code,
    clippy::all,
    clippy::cargo,
    clippy::module_name_repetitions,
    clippy::shadow_unrelated
)]
#![warn(clippy::pedantic, clippy::nursery)]

mod grad;
mod graph;
mod ops;
mod trace;

pub use grad::{
    grad, prevent_large_fused_op, set_fuse_guard_on_grouped, set_prevent_large_fused_op,
};
pub use graph::node::{DType, LoopOptions, NodeFlags, NodeId, Op, VarPtr, Variable};
pub use graph::tape::{tape, tape_together, GradCallback, Tape};
pub use ops::{
    binary, broadcast, cast, detach, get_op_ctor, identity, neg, number, reduce_sum, register_op,
    Binary, BinaryCtor, BinaryKind, Broadcast, Number, NumberCtor, OpCtor, Operator, ReduceSum,
    Unary, UnaryKind,
};
pub use trace::{set_grad_trace, GradTraceFn};

/// Creates a new leaf variable with the given shape and elemental type
#[must_use]
#[inline]
pub fn variable(shape: &[usize], dtype: DType) -> VarPtr {
    Variable::leaf(shape, dtype)
}
