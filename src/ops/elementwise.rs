use std::any::Any;
use std::rc::Rc;

use crate::graph::node::{DType, NodeFlags, Op, VarPtr};
use crate::ops::Operator;

/// Kind of an elementwise binary operator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryKind {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryKind {
    /// The kind's lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
        }
    }
}

/// Elementwise binary operator over two same-shaped variables
pub struct Binary {
    kind: BinaryKind,
}

impl Binary {
    /// Returns the kind of the operation
    #[must_use]
    pub const fn kind(&self) -> BinaryKind {
        self.kind
    }
}

impl Operator for Binary {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn grad(
        &self,
        op: &Rc<Op>,
        _out: &VarPtr,
        dout: &VarPtr,
        _x: &VarPtr,
        x_index: usize,
    ) -> Option<VarPtr> {
        match self.kind {
            BinaryKind::Add => Some(dout.clone()),
            BinaryKind::Sub => {
                if x_index == 0 {
                    Some(dout.clone())
                } else {
                    Some(neg(dout))
                }
            }
            BinaryKind::Mul => {
                let other = &op.inputs()[1 - x_index];
                Some(binary(dout, other, BinaryKind::Mul))
            }
            BinaryKind::Div => {
                let a = &op.inputs()[0];
                let b = &op.inputs()[1];
                if x_index == 0 {
                    Some(binary(dout, b, BinaryKind::Div))
                } else {
                    let da = binary(dout, a, BinaryKind::Mul);
                    let bb = binary(b, b, BinaryKind::Mul);
                    Some(neg(&binary(&da, &bb, BinaryKind::Div)))
                }
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Builds an elementwise binary operation between two variables of the
/// same shape and dtype
///
/// # Panics
///
/// Panics on a shape or dtype mismatch between the operands.
#[must_use]
pub fn binary(a: &VarPtr, b: &VarPtr, kind: BinaryKind) -> VarPtr {
    assert_eq!(
        a.shape(),
        b.shape(),
        "elementwise {} needs matching shapes",
        kind.as_str()
    );
    assert_eq!(
        a.dtype(),
        b.dtype(),
        "elementwise {} needs matching dtypes",
        kind.as_str()
    );
    Op::build_one(
        Box::new(Binary { kind }),
        vec![a.clone(), b.clone()],
        a.shape().to_vec(),
        a.dtype(),
    )
}

/// Kind of an elementwise unary operator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryKind {
    Identity,
    Neg,
    Cast(DType),
}

/// Elementwise unary operator
pub struct Unary {
    kind: UnaryKind,
}

impl Unary {
    /// Returns the kind of the operation
    #[must_use]
    pub const fn kind(&self) -> UnaryKind {
        self.kind
    }
}

impl Operator for Unary {
    fn name(&self) -> &'static str {
        "unary"
    }

    fn grad(
        &self,
        _op: &Rc<Op>,
        _out: &VarPtr,
        dout: &VarPtr,
        x: &VarPtr,
        _x_index: usize,
    ) -> Option<VarPtr> {
        match self.kind {
            UnaryKind::Identity => Some(dout.clone()),
            UnaryKind::Neg => Some(neg(dout)),
            UnaryKind::Cast(_) => Some(cast(dout, x.dtype())),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn unary(x: &VarPtr, kind: UnaryKind, dtype: DType) -> VarPtr {
    Op::build_one(
        Box::new(Unary { kind }),
        vec![x.clone()],
        x.shape().to_vec(),
        dtype,
    )
}

/// Passes a variable through unchanged
#[must_use]
pub fn identity(x: &VarPtr) -> VarPtr {
    unary(x, UnaryKind::Identity, x.dtype())
}

/// Elementwise negation
#[must_use]
pub fn neg(x: &VarPtr) -> VarPtr {
    unary(x, UnaryKind::Neg, x.dtype())
}

/// Elementwise conversion to another dtype. Casting to an integer dtype
/// ends gradient flow, integer variables cannot carry gradient.
#[must_use]
pub fn cast(x: &VarPtr, dtype: DType) -> VarPtr {
    unary(x, UnaryKind::Cast(dtype), dtype)
}

/// Passes a variable through unchanged and stops gradients at the result.
/// Anything upstream of the barrier receives no gradient through it.
#[must_use]
pub fn detach(x: &VarPtr) -> VarPtr {
    let out = identity(x);
    out.set_flag(NodeFlags::STOP_GRAD);
    out
}
