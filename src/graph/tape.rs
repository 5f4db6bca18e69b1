use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::graph::node::{NodeFlags, NodeId, Op, VarPtr, Variable};
use crate::ops::Operator;

/// Grouped adjoint callback of a taped sub-region. Receives one adjoint
/// slot per taped output (absent slots are `None`) and returns one adjoint
/// per taped input, both in declaration order.
pub type GradCallback = Box<dyn Fn(&[Option<VarPtr>]) -> Vec<Option<VarPtr>>>;

/// A collapsed sub-region of the graph, differentiated as a single opaque
/// multi-input multi-output node.
///
/// Traversal never descends into the region. Whenever an edge reaches one
/// of the region's boundary operators, the `Tape` is substituted in its
/// place, so the interior is skipped entirely and the user-supplied
/// callback supplies all input adjoints from all output adjoints at once.
pub struct Tape {
    id: NodeId,
    flags: Cell<NodeFlags>,
    tflag: Cell<u64>,
    pending: Cell<usize>,
    total: usize,
    ref_count: Cell<usize>,
    callback: GradCallback,
    inputs: Vec<Weak<Variable>>,
    outputs: Vec<Weak<Variable>>,
}

impl Tape {
    /// Returns the tape's unique-per-declaration boundary size
    #[must_use]
    #[inline]
    pub const fn total(&self) -> usize {
        self.total
    }

    /// Returns the number of boundary operators still alive
    #[must_use]
    #[inline]
    pub fn ref_count(&self) -> usize {
        self.ref_count.get()
    }

    /// Runs the user callback on the given output adjoints
    pub(crate) fn run_callback(&self, douts: &[Option<VarPtr>]) -> Vec<Option<VarPtr>> {
        (self.callback)(douts)
    }

    /// The source variables feeding the region, positions preserved
    pub(crate) fn input_vars(&self) -> Vec<Option<VarPtr>> {
        self.inputs.iter().map(Weak::upgrade).collect()
    }

    /// The boundary output variables, positions preserved
    pub(crate) fn output_vars(&self) -> Vec<Option<VarPtr>> {
        self.outputs.iter().map(Weak::upgrade).collect()
    }

    pub(crate) fn flags(&self) -> NodeFlags {
        self.flags.get()
    }

    pub(crate) fn tflag(&self) -> u64 {
        self.tflag.get()
    }

    pub(crate) fn set_tflag(&self, t: u64) {
        self.tflag.set(t);
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.get()
    }

    pub(crate) fn set_pending(&self, deps: usize) {
        self.pending.set(deps);
    }

    /// Called when a boundary operator is dropped. Once any boundary is
    /// gone the tape can no longer be differentiated and backward use
    /// fails the `ref == total` assertion.
    pub(crate) fn release_boundary(&self) {
        self.ref_count.set(self.ref_count.get() - 1);
    }
}

impl fmt::Debug for Tape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tape({} {}in {}out)",
            self.id,
            self.inputs.len(),
            self.outputs.len()
        )
    }
}

/// Boundary pass-through kernel. Forward it is the identity, backward it
/// forwards the incoming adjoint unchanged unless the operator has been
/// claimed by a tape, in which case traversal never consults it.
pub(crate) struct TapeKernel;

impl Operator for TapeKernel {
    fn name(&self) -> &'static str {
        "tape"
    }

    fn grad(
        &self,
        _op: &Rc<Op>,
        _out: &VarPtr,
        dout: &VarPtr,
        _x: &VarPtr,
        _x_index: usize,
    ) -> Option<VarPtr> {
        Some(dout.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Wraps a variable behind a boundary pass-through operator so that it can
/// later take part in a [`tape_together`] declaration.
#[must_use]
pub fn tape(x: &VarPtr) -> VarPtr {
    Op::build_one(
        Box::new(TapeKernel),
        vec![x.clone()],
        x.shape().to_vec(),
        x.dtype(),
    )
}

/// Declares the sub-region delimited by the given boundary variables as a
/// single unit of differentiation with a user-supplied adjoint callback.
///
/// Every boundary variable must have been wrapped with [`tape`]. The
/// callback receives the adjoints of `taped_outputs` and returns the
/// adjoints of `taped_inputs`, both positionally.
///
/// # Panics
///
/// Panics if either boundary list is empty or contains a variable that was
/// not produced by a [`tape`] operator.
pub fn tape_together(
    taped_inputs: &[VarPtr],
    taped_outputs: &[VarPtr],
    callback: GradCallback,
) {
    assert!(
        !taped_inputs.is_empty() && !taped_outputs.is_empty(),
        "a tape needs at least one boundary input and one boundary output"
    );

    let boundary_op = |var: &VarPtr| -> Rc<Op> {
        let op = var
            .input()
            .unwrap_or_else(|| panic!("taped variable {var:?} has no producing operator"));
        assert!(
            op.kernel().name() == "tape",
            "taped variable {var:?} is not produced by a tape operator"
        );
        op.clone()
    };

    let mut ops = Vec::with_capacity(taped_inputs.len() + taped_outputs.len());
    let mut inputs = Vec::with_capacity(taped_inputs.len());
    for var in taped_inputs {
        let op = boundary_op(var);
        // the source edge feeding the boundary, not the boundary itself
        inputs.push(Rc::downgrade(&op.inputs()[0]));
        ops.push(op);
    }
    let mut outputs = Vec::with_capacity(taped_outputs.len());
    for var in taped_outputs {
        ops.push(boundary_op(var));
        outputs.push(Rc::downgrade(var));
    }

    let total = taped_inputs.len() + taped_outputs.len();
    let tape = Rc::new(Tape {
        id: crate::graph::node::next_id(),
        flags: Cell::new(NodeFlags::GRADS),
        tflag: Cell::new(0),
        pending: Cell::new(0),
        total,
        ref_count: Cell::new(total),
        callback,
        inputs,
        outputs,
    });

    for op in ops {
        op.set_flag(NodeFlags::TAPE);
        op.set_tape(tape.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::{tape, tape_together};
    use crate::graph::node::{DType, NodeFlags, VarPtr, Variable};
    use crate::ops::{identity, reduce_sum};

    #[test]
    fn tape_wraps_behind_boundary_operator() {
        let x = Variable::leaf(&[3], DType::Float32);
        let t = tape(&x);
        assert_eq!(t.shape(), &[3]);
        assert_eq!(t.dtype(), DType::Float32);
        assert_eq!(t.input().unwrap().kernel().name(), "tape");
    }

    #[test]
    fn tape_together_marks_and_links_boundaries() {
        let x = Variable::leaf(&[3], DType::Float32);
        let t_in = tape(&x);
        let z = identity(&t_in);
        let t_out = tape(&z);

        tape_together(
            &[t_in.clone()],
            &[t_out.clone()],
            Box::new(|douts: &[Option<VarPtr>]| vec![douts[0].clone()]),
        );

        let in_op = t_in.input().unwrap();
        let out_op = t_out.input().unwrap();
        assert!(in_op.has_flag(NodeFlags::TAPE));
        assert!(out_op.has_flag(NodeFlags::TAPE));

        let tape = in_op.tape().unwrap();
        assert_eq!(tape.total(), 2);
        assert_eq!(tape.ref_count(), 2);
        assert!(tape.flags().contains(NodeFlags::GRADS));

        // the tape's sources are the variables feeding the boundary
        let sources = tape.input_vars();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].as_ref().unwrap().id(), x.id());
        let outs = tape.output_vars();
        assert_eq!(outs[0].as_ref().unwrap().id(), t_out.id());
    }

    #[test]
    fn dropping_a_boundary_releases_the_tape() {
        let x = Variable::leaf(&[3], DType::Float32);
        let t_in = tape(&x);
        let kept = tape(&x);
        let t_out = tape(&identity(&kept));

        tape_together(
            &[t_in.clone(), kept.clone()],
            &[t_out.clone()],
            Box::new(|_: &[Option<VarPtr>]| vec![None, None]),
        );
        let tape = kept.input().unwrap().tape().unwrap();
        assert_eq!(tape.ref_count(), 3);

        drop(t_in);
        assert_eq!(tape.ref_count(), 2);
        let _keepalive = reduce_sum(&t_out);
    }

    #[test]
    #[should_panic(expected = "at least one boundary")]
    fn empty_boundary_is_rejected() {
        let x = Variable::leaf(&[3], DType::Float32);
        let t = tape(&x);
        tape_together(&[t], &[], Box::new(|_: &[Option<VarPtr>]| Vec::new()));
    }

    #[test]
    #[should_panic(expected = "not produced by a tape operator")]
    fn unwrapped_boundary_is_rejected() {
        let x = Variable::leaf(&[3], DType::Float32);
        let y = identity(&x);
        let t = tape(&x);
        tape_together(&[t], &[y], Box::new(|_: &[Option<VarPtr>]| Vec::new()));
    }
}
