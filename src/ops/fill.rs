use std::any::Any;

use crate::graph::node::{Op, VarPtr};
use crate::ops::Operator;

/// Constant-fill operator. It has no inputs, so it never receives a
/// gradient call.
pub struct Number {
    value: f64,
}

impl Number {
    /// Returns the fill value
    #[must_use]
    pub const fn value(&self) -> f64 {
        self.value
    }
}

impl Operator for Number {
    fn name(&self) -> &'static str {
        "number"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Builds a variable filled with `value`, with the shape and dtype of
/// `like`. The engine uses this for the seed one at the loss and for zero
/// substitutes.
#[must_use]
pub fn number(value: f64, like: &VarPtr) -> VarPtr {
    Op::build_one(
        Box::new(Number { value }),
        Vec::new(),
        like.shape().to_vec(),
        like.dtype(),
    )
}
