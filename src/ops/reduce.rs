use std::any::Any;
use std::rc::Rc;

use crate::graph::node::{Op, VarPtr};
use crate::ops::Operator;

/// Sum of all elements down to a scalar
pub struct ReduceSum;

impl Operator for ReduceSum {
    fn name(&self) -> &'static str {
        "reduce_sum"
    }

    fn grad(
        &self,
        _op: &Rc<Op>,
        _out: &VarPtr,
        dout: &VarPtr,
        x: &VarPtr,
        _x_index: usize,
    ) -> Option<VarPtr> {
        // every element contributed once, the adjoint spreads back evenly
        Some(broadcast(dout, x.shape()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Builds the scalar sum of all elements of `x`
#[must_use]
pub fn reduce_sum(x: &VarPtr) -> VarPtr {
    Op::build_one(Box::new(ReduceSum), vec![x.clone()], Vec::new(), x.dtype())
}

/// Replication of a scalar over a shape
pub struct Broadcast;

impl Operator for Broadcast {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    fn grad(
        &self,
        _op: &Rc<Op>,
        _out: &VarPtr,
        dout: &VarPtr,
        _x: &VarPtr,
        _x_index: usize,
    ) -> Option<VarPtr> {
        Some(reduce_sum(dout))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Builds a variable of the given shape with every element equal to the
/// scalar `x`
///
/// # Panics
///
/// Panics if `x` is not a single-element variable.
#[must_use]
pub fn broadcast(x: &VarPtr, shape: &[usize]) -> VarPtr {
    assert_eq!(x.num(), 1, "only single-element variables broadcast");
    Op::build_one(Box::new(Broadcast), vec![x.clone()], shape.to_vec(), x.dtype())
}
