//! Operator kernels and the registration surface the engine consumes.
//!
//! The engine itself never names concrete operators. It resolves the two
//! constructors it needs, the elementwise binary used for fan-in summation
//! and the constant fill used for gradient seeds and zero substitutes, by
//! name through the registry in this module, the same way a backend would
//! register and look up its own kernels.

mod elementwise;
mod fill;
mod reduce;

use std::any::Any;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::{OnceLock, RwLock};

use crate::graph::node::{NodeFlags, Op, VarPtr};

pub use elementwise::{binary, cast, detach, identity, neg, Binary, BinaryKind, Unary, UnaryKind};
pub use fill::{number, Number};
pub use reduce::{broadcast, reduce_sum, Broadcast, ReduceSum};

/// Local adjoint contract of an operator kernel.
///
/// A kernel implements exactly one of the two protocols. Single-output
/// kernels implement [`Operator::grad`], which yields the partial adjoint
/// of one input through one output and leaves all summation to the engine.
/// Grouped kernels request the [`NodeFlags::GRADS`] flag and implement
/// [`Operator::grads`], which turns the adjoints of all outputs into the
/// adjoints of all inputs in a single call.
///
/// `None` stands for a structurally zero adjoint in both directions and
/// never materializes a tensor. A returned adjoint must match its paired
/// forward variable in shape and dtype.
pub trait Operator {
    /// The operator's name, used for diagnostics and registry lookups
    fn name(&self) -> &'static str;

    /// Flags the graph node for this kernel is created with
    fn flags(&self) -> NodeFlags {
        NodeFlags::empty()
    }

    /// Single-output protocol: the partial adjoint of input `x` (at
    /// position `x_index` of `op`) through output `out`, whose adjoint is
    /// `dout`. The default declines to contribute.
    fn grad(
        &self,
        op: &Rc<Op>,
        out: &VarPtr,
        dout: &VarPtr,
        x: &VarPtr,
        x_index: usize,
    ) -> Option<VarPtr> {
        let _ = (op, out, dout, x, x_index);
        None
    }

    /// Grouped protocol: all input adjoints from all output adjoints,
    /// positionally. Only consulted when the kernel asks for
    /// [`NodeFlags::GRADS`]. The default declines to contribute.
    fn grads(&self, op: &Rc<Op>, douts: &[Option<VarPtr>]) -> Vec<Option<VarPtr>> {
        let _ = douts;
        vec![None; op.inputs().len()]
    }

    /// The kernel as `Any`, so callers holding a `dyn Operator` can
    /// recover the concrete kernel type
    fn as_any(&self) -> &dyn Any;
}

/// Constructor of an elementwise binary operator
pub type BinaryCtor = fn(&VarPtr, &VarPtr, BinaryKind) -> VarPtr;
/// Constructor of a constant-fill operator shaped like an existing variable
pub type NumberCtor = fn(f64, &VarPtr) -> VarPtr;

/// A constructor registered under an operator name
#[derive(Clone, Copy)]
pub enum OpCtor {
    Binary(BinaryCtor),
    Number(NumberCtor),
}

fn registry() -> &'static RwLock<HashMap<&'static str, OpCtor>> {
    static REGISTRY: OnceLock<RwLock<HashMap<&'static str, OpCtor>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut ops = HashMap::new();
        ops.insert("binary", OpCtor::Binary(elementwise::binary));
        ops.insert("number", OpCtor::Number(fill::number));
        RwLock::new(ops)
    })
}

/// Registers (or replaces) the constructor for the given operator name
pub fn register_op(name: &'static str, ctor: OpCtor) {
    registry()
        .write()
        .expect("operator registry poisoned")
        .insert(name, ctor);
}

/// Looks up the constructor registered under `name`
///
/// # Panics
///
/// Panics if no constructor has been registered under `name`.
#[must_use]
pub fn get_op_ctor(name: &str) -> OpCtor {
    *registry()
        .read()
        .expect("operator registry poisoned")
        .get(name)
        .unwrap_or_else(|| panic!("no operator registered under \"{name}\""))
}

/// The elementwise binary constructor the engine sums fan-in with
pub(crate) fn binary_constructor() -> BinaryCtor {
    match get_op_ctor("binary") {
        OpCtor::Binary(ctor) => ctor,
        OpCtor::Number(_) => panic!("operator \"binary\" registered with the wrong constructor"),
    }
}

/// The constant-fill constructor the engine seeds and zero-fills with
pub(crate) fn number_constructor() -> NumberCtor {
    match get_op_ctor("number") {
        OpCtor::Number(ctor) => ctor,
        OpCtor::Binary(_) => panic!("operator \"number\" registered with the wrong constructor"),
    }
}
