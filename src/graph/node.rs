use bitflags::bitflags;
use std::cell::{Cell, Ref, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::graph::tape::Tape;
use crate::ops::Operator;

static COUNTER: AtomicUsize = AtomicUsize::new(0);
static PASS_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Type used as `Variable` and `Op` identifier
#[allow(clippy::module_name_repetitions)]
pub type NodeId = usize;

/// Shared handle to a `Variable` in the computation graph
pub type VarPtr = Rc<Variable>;

/// Returns a fresh node identifier from a global static incremental counter.
/// Unique IDs are necessary to be able to tell if two nodes are the same when
/// used in different operations.
pub(crate) fn next_id() -> NodeId {
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Bumps the process-wide traversal counter and returns the new value.
/// Every node visited during a traversal stores this value in its visit
/// epoch, so no clearing pass is needed between traversals. The epochs
/// and the per-node scratch fields are unsynchronized, two passes touching
/// the same graph must never run concurrently.
pub(crate) fn next_pass() -> u64 {
    PASS_COUNTER.fetch_add(1, Ordering::Relaxed) + 1
}

bitflags! {
    /// Structural properties of a graph node
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct NodeFlags: u8 {
        /// Gradients do not flow through this node
        const STOP_GRAD = 1 << 0;
        /// Downstream kernel fusion must not cross this node
        const STOP_FUSE = 1 << 1;
        /// This operator is the boundary of a taped sub-region and traversal
        /// substitutes its `Tape` in its place
        const TAPE = 1 << 2;
        /// This node computes the adjoints of all its inputs in one call,
        /// given the adjoints of all its outputs
        const GRADS = 1 << 3;
    }
}

/// Elemental type of a `Variable`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DType {
    Float32,
    Float64,
    Int32,
    Int64,
}

impl DType {
    /// Returns `true` for floating-point types. Only floating-point
    /// variables can carry gradient.
    #[must_use]
    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }
}

/// Opaque per-variable scheduling hint. The engine never interprets it,
/// it only propagates it from a forward variable to its gradient.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoopOptions(pub Vec<(String, i64)>);

/// A tensor-valued node in the computation graph.
///
/// A `Variable` records its `shape` and `dtype` but never holds tensor
/// storage, the graph is lazy and evaluation belongs to a backend. The
/// producing operator is owned through `input`, consumers are tracked
/// through weak back edges so ownership always flows downstream to
/// upstream and the graph stays acyclic under `Rc`.
pub struct Variable {
    id: NodeId,
    name: RefCell<String>,
    shape: Vec<usize>,
    dtype: DType,
    num: usize,
    flags: Cell<NodeFlags>,
    tflag: Cell<u64>,
    pending: Cell<usize>,
    grad_index: Cell<i64>,
    loop_options: RefCell<Option<Rc<LoopOptions>>>,
    input: Option<Rc<Op>>,
    outputs: RefCell<Vec<(Weak<Op>, usize)>>,
}

impl Variable {
    fn new(shape: Vec<usize>, dtype: DType, input: Option<Rc<Op>>) -> Self {
        let num = shape.iter().product();
        Self {
            id: next_id(),
            name: RefCell::new(String::new()),
            shape,
            dtype,
            num,
            flags: Cell::new(NodeFlags::empty()),
            tflag: Cell::new(0),
            pending: Cell::new(0),
            grad_index: Cell::new(-1),
            loop_options: RefCell::new(None),
            input,
            outputs: RefCell::new(Vec::new()),
        }
    }

    /// Creates a new leaf variable, one that is not produced by any operator
    #[must_use]
    pub fn leaf(shape: &[usize], dtype: DType) -> VarPtr {
        Rc::new(Self::new(shape.to_vec(), dtype, None))
    }

    /// Returns the variable's unique identifier
    #[must_use]
    #[inline]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    /// Returns the variable's name, empty unless set with `set_name`
    #[must_use]
    pub fn name(&self) -> Ref<String> {
        self.name.borrow()
    }

    /// Names the variable for diagnostics
    pub fn set_name(&self, name: &str) {
        *self.name.borrow_mut() = name.to_owned();
    }

    /// Returns the ordered extents of the variable
    #[must_use]
    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the variable's elemental type
    #[must_use]
    #[inline]
    pub const fn dtype(&self) -> DType {
        self.dtype
    }

    /// Returns the number of elements, the product of all extents
    #[must_use]
    #[inline]
    pub const fn num(&self) -> usize {
        self.num
    }

    /// Returns `true` if the variable has a floating-point dtype
    #[must_use]
    #[inline]
    pub const fn is_float(&self) -> bool {
        self.dtype.is_float()
    }

    /// Returns the current flag set
    #[must_use]
    #[inline]
    pub fn flags(&self) -> NodeFlags {
        self.flags.get()
    }

    /// Sets the given flag
    #[inline]
    pub fn set_flag(&self, flag: NodeFlags) {
        self.flags.set(self.flags.get() | flag);
    }

    /// Returns `true` if the given flag is set
    #[must_use]
    #[inline]
    pub fn has_flag(&self, flag: NodeFlags) -> bool {
        self.flags.get().contains(flag)
    }

    /// Marks the variable as a gradient barrier. Backward traversal stops
    /// here and nothing upstream of this variable receives gradient through
    /// it.
    #[inline]
    pub fn stop_grad(&self) {
        self.set_flag(NodeFlags::STOP_GRAD);
    }

    /// Returns the scheduling hint attached to this variable, if any
    #[must_use]
    pub fn loop_options(&self) -> Option<Rc<LoopOptions>> {
        self.loop_options.borrow().clone()
    }

    /// Attaches a scheduling hint to this variable
    pub fn set_loop_options(&self, options: Rc<LoopOptions>) {
        *self.loop_options.borrow_mut() = Some(options);
    }

    /// Returns the operator that produced this variable, or `None` for leaves
    #[must_use]
    pub fn input(&self) -> Option<&Rc<Op>> {
        self.input.as_ref()
    }

    /// Returns the live consumers of this variable together with the input
    /// slot the variable occupies in each of them. A consumer appears once
    /// per slot it reads the variable through.
    #[must_use]
    pub fn outputs_with_index(&self) -> Vec<(Rc<Op>, usize)> {
        self.outputs
            .borrow()
            .iter()
            .filter_map(|(op, index)| op.upgrade().map(|op| (op, *index)))
            .collect()
    }

    pub(crate) fn tflag(&self) -> u64 {
        self.tflag.get()
    }

    pub(crate) fn set_tflag(&self, t: u64) {
        self.tflag.set(t);
    }

    pub(crate) fn grad_index(&self) -> i64 {
        self.grad_index.get()
    }

    pub(crate) fn set_grad_index(&self, index: i64) {
        self.grad_index.set(index);
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Var({}", self.id)?;
        let name = self.name.borrow();
        if !name.is_empty() {
            write!(f, " \"{name}\"")?;
        }
        write!(f, " {:?} {:?})", self.shape, self.dtype)
    }
}

/// An operator node, the computation producing one or more variables from
/// zero or more input variables.
///
/// The operator's behavior lives in its kernel, an [`Operator`]
/// implementation supplying the local adjoint contract. The node itself
/// only carries graph structure and traversal scratch state.
pub struct Op {
    id: NodeId,
    kernel: Box<dyn Operator>,
    flags: Cell<NodeFlags>,
    tflag: Cell<u64>,
    pending: Cell<usize>,
    inputs: Vec<VarPtr>,
    outputs: RefCell<Vec<Weak<Variable>>>,
    tape: RefCell<Option<Rc<Tape>>>,
}

impl Op {
    /// Creates an operator node consuming `inputs` and producing one fresh
    /// variable per `(shape, dtype)` entry in `outputs`. The new variables
    /// own the operator, the operator owns its inputs, and each input
    /// records a weak back edge to the operator.
    pub fn build(
        kernel: Box<dyn Operator>,
        inputs: Vec<VarPtr>,
        outputs: &[(Vec<usize>, DType)],
    ) -> Vec<VarPtr> {
        let flags = kernel.flags();
        let op = Rc::new(Self {
            id: next_id(),
            kernel,
            flags: Cell::new(flags),
            tflag: Cell::new(0),
            pending: Cell::new(0),
            inputs,
            outputs: RefCell::new(Vec::with_capacity(outputs.len())),
            tape: RefCell::new(None),
        });

        for (index, input) in op.inputs.iter().enumerate() {
            input.outputs.borrow_mut().push((Rc::downgrade(&op), index));
        }

        outputs
            .iter()
            .map(|(shape, dtype)| {
                let var = Rc::new(Variable::new(shape.clone(), *dtype, Some(op.clone())));
                op.outputs.borrow_mut().push(Rc::downgrade(&var));
                var
            })
            .collect()
    }

    /// Creates a single-output operator node, see [`Op::build`]
    pub fn build_one(
        kernel: Box<dyn Operator>,
        inputs: Vec<VarPtr>,
        shape: Vec<usize>,
        dtype: DType,
    ) -> VarPtr {
        let mut vars = Self::build(kernel, inputs, &[(shape, dtype)]);
        debug_assert_eq!(vars.len(), 1);
        vars.swap_remove(0)
    }

    /// Returns the operator's unique identifier
    #[must_use]
    #[inline]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    /// Returns the operator's kernel
    #[must_use]
    pub fn kernel(&self) -> &dyn Operator {
        self.kernel.as_ref()
    }

    /// Returns the ordered input variables
    #[must_use]
    #[inline]
    pub fn inputs(&self) -> &[VarPtr] {
        &self.inputs
    }

    /// Returns the ordered output variables. Positions are preserved, an
    /// output that has been dropped elsewhere yields `None` in its slot.
    #[must_use]
    pub fn outputs(&self) -> Vec<Option<VarPtr>> {
        self.outputs.borrow().iter().map(Weak::upgrade).collect()
    }

    /// Returns the current flag set
    #[must_use]
    #[inline]
    pub fn flags(&self) -> NodeFlags {
        self.flags.get()
    }

    /// Sets the given flag
    #[inline]
    pub fn set_flag(&self, flag: NodeFlags) {
        self.flags.set(self.flags.get() | flag);
    }

    /// Returns `true` if the given flag is set
    #[must_use]
    #[inline]
    pub fn has_flag(&self, flag: NodeFlags) -> bool {
        self.flags.get().contains(flag)
    }

    /// Returns the tape this operator bounds, if it is a taped boundary
    #[must_use]
    pub fn tape(&self) -> Option<Rc<Tape>> {
        self.tape.borrow().clone()
    }

    pub(crate) fn set_tape(&self, tape: Rc<Tape>) {
        *self.tape.borrow_mut() = Some(tape);
    }

    pub(crate) fn tflag(&self) -> u64 {
        self.tflag.get()
    }

    pub(crate) fn set_tflag(&self, t: u64) {
        self.tflag.set(t);
    }
}

impl Drop for Op {
    fn drop(&mut self) {
        // a dropped boundary operator breaks its tape
        if let Some(tape) = self.tape.borrow().as_ref() {
            tape.release_boundary();
        }
    }
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Op({} {})", self.id, self.kernel.name())
    }
}

/// A node observed during traversal, either a variable, an operator or a
/// tape standing in for a collapsed sub-region.
///
/// Tapes are not operators but are substituted for taped boundary
/// operators at edge-follow time, so every traversal works on this
/// variant instead of a common node interface.
#[derive(Clone)]
pub(crate) enum NodeRef {
    Var(VarPtr),
    Op(Rc<Op>),
    Tape(Rc<Tape>),
}

impl NodeRef {
    /// Replaces a taped boundary operator by its tape
    pub(crate) fn substitute(op: Rc<Op>) -> Self {
        if op.has_flag(NodeFlags::TAPE) {
            let tape = op
                .tape()
                .unwrap_or_else(|| panic!("operator {op:?} is flagged as taped but has no tape"));
            Self::Tape(tape)
        } else {
            Self::Op(op)
        }
    }

    pub(crate) fn tflag(&self) -> u64 {
        match self {
            Self::Var(var) => var.tflag.get(),
            Self::Op(op) => op.tflag.get(),
            Self::Tape(tape) => tape.tflag(),
        }
    }

    pub(crate) fn set_tflag(&self, t: u64) {
        match self {
            Self::Var(var) => var.tflag.set(t),
            Self::Op(op) => op.tflag.set(t),
            Self::Tape(tape) => tape.set_tflag(t),
        }
    }

    pub(crate) fn pending(&self) -> usize {
        match self {
            Self::Var(var) => var.pending.get(),
            Self::Op(op) => op.pending.get(),
            Self::Tape(tape) => tape.pending(),
        }
    }

    pub(crate) fn set_pending(&self, deps: usize) {
        match self {
            Self::Var(var) => var.pending.set(deps),
            Self::Op(op) => op.pending.set(deps),
            Self::Tape(tape) => tape.set_pending(deps),
        }
    }

    pub(crate) fn dec_pending(&self) -> usize {
        let deps = self.pending() - 1;
        self.set_pending(deps);
        deps
    }

    pub(crate) fn flags(&self) -> NodeFlags {
        match self {
            Self::Var(var) => var.flags.get(),
            Self::Op(op) => op.flags.get(),
            Self::Tape(tape) => tape.flags(),
        }
    }

    pub(crate) fn as_var(&self) -> Option<&VarPtr> {
        match self {
            Self::Var(var) => Some(var),
            Self::Op(_) | Self::Tape(_) => None,
        }
    }

    /// Nodes reached by following one producer edge backward, with tape
    /// substitution applied
    pub(crate) fn input_nodes(&self) -> Vec<Self> {
        match self {
            Self::Var(var) => var
                .input
                .iter()
                .map(|op| Self::substitute(op.clone()))
                .collect(),
            Self::Op(op) => op.inputs.iter().map(|var| Self::Var(var.clone())).collect(),
            Self::Tape(tape) => tape
                .input_vars()
                .into_iter()
                .flatten()
                .map(Self::Var)
                .collect(),
        }
    }

    /// Nodes reached by following one consumer edge forward, with tape
    /// substitution applied
    pub(crate) fn output_nodes(&self) -> Vec<Self> {
        match self {
            Self::Var(var) => var
                .outputs_with_index()
                .into_iter()
                .map(|(op, _)| Self::substitute(op))
                .collect(),
            Self::Op(op) => op.outputs().into_iter().flatten().map(Self::Var).collect(),
            Self::Tape(tape) => tape
                .output_vars()
                .into_iter()
                .flatten()
                .map(Self::Var)
                .collect(),
        }
    }

    /// The node's input variables with positions preserved. Used by the
    /// accumulator, which pairs them against grouped adjoint slots.
    pub(crate) fn input_vars(&self) -> Vec<Option<VarPtr>> {
        match self {
            Self::Var(_) => Vec::new(),
            Self::Op(op) => op.inputs.iter().cloned().map(Some).collect(),
            Self::Tape(tape) => tape.input_vars(),
        }
    }

    /// The node's output variables with positions preserved
    pub(crate) fn output_vars(&self) -> Vec<Option<VarPtr>> {
        match self {
            Self::Var(_) => Vec::new(),
            Self::Op(op) => op.outputs(),
            Self::Tape(tape) => tape.output_vars(),
        }
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Var(var) => var.fmt(f),
            Self::Op(op) => op.fmt(f),
            Self::Tape(tape) => tape.fmt(f),
        }
    }
}
