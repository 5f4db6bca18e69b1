//! The differentiation pass.
//!
//! Given a loss variable and a set of target variables, [`grad`] walks the
//! computation graph backward and returns one gradient variable per
//! target. The pass is synchronous and allocation is confined to the
//! invocation, only the adjoint variables it constructs outlive it. They
//! are ordinary graph nodes, so differentiating a gradient again yields
//! higher-order derivatives.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::graph::node::{NodeFlags, NodeRef, Op, VarPtr};
use crate::graph::traverse::{
    bfs_backward_with_tape, bfs_forward_with_tape, topological_sort_backward_with_tape,
};
use crate::ops::{self, BinaryKind};
use crate::trace;
use std::rc::Rc;

static PREVENT_LARGE_FUSED_OP: AtomicUsize = AtomicUsize::new(16);
static FUSE_GUARD_ON_GROUPED: AtomicBool = AtomicBool::new(false);

/// Caps the number of summations fused into one kernel while accumulating
/// fan-out gradients. Once a gradient slot has absorbed this many
/// additions, further sums are flagged [`NodeFlags::STOP_FUSE`] so a
/// downstream compiler cannot collapse an unbounded accumulation chain
/// into a single operation. `None` disables the guard. The default is 16.
///
/// # Panics
///
/// Panics on a limit of zero.
pub fn set_prevent_large_fused_op(limit: Option<usize>) {
    assert!(limit != Some(0), "the fuse guard limit must be positive");
    PREVENT_LARGE_FUSED_OP.store(limit.unwrap_or(0), Ordering::Relaxed);
}

/// Returns the current fuse guard limit, `None` when disabled
#[must_use]
pub fn prevent_large_fused_op() -> Option<usize> {
    match PREVENT_LARGE_FUSED_OP.load(Ordering::Relaxed) {
        0 => None,
        limit => Some(limit),
    }
}

/// Extends the fuse guard to accumulations fed by grouped adjoints.
/// Historically the guard only watched the single-output path, grouped
/// operators were assumed to emit their own structure. Off by default.
pub fn set_fuse_guard_on_grouped(enabled: bool) {
    FUSE_GUARD_ON_GROUPED.store(enabled, Ordering::Relaxed);
}

fn fuse_guard_on_grouped() -> bool {
    FUSE_GUARD_ON_GROUPED.load(Ordering::Relaxed)
}

/// One entry of the pre-serialized accumulation work list.
///
/// The accumulator appends new operators to the graph while it runs, which
/// would invalidate any live iteration over consumer lists and dense
/// indices. Both are therefore resolved up front into this flat record
/// stream and the construction phase only ever reads it.
enum IdRecord {
    /// A consumer operator (or substituted tape) of the variable whose
    /// block this is, with the input slot the variable occupies in it
    Op { node: NodeRef, index: usize },
    /// An output or input of the preceding operator record, with its dense
    /// gradient slot, negative when it carries no gradient in this pass
    Var { var: Option<VarPtr>, slot: i64 },
    /// Ends a variable's block
    End,
}

/// Builds the partial adjoint of `x` through one output of `op` and hands
/// the variable's scheduling hint down to it
fn make_grad(
    op: &Rc<Op>,
    out: &VarPtr,
    dout: Option<&VarPtr>,
    x: &VarPtr,
    x_index: usize,
) -> Option<VarPtr> {
    let dout = dout?;
    log::trace!(
        "make grad of {} through {out:?} for {x:?} at slot {x_index}",
        op.kernel().name()
    );
    let dx = op.kernel().grad(op, out, dout, x, x_index)?;
    if let Some(options) = x.loop_options() {
        dx.set_loop_options(options);
    }
    Some(dx)
}

/// Fusion barriers survive from a forward variable to its adjoint
fn assign_attrs(to: &VarPtr, from: &VarPtr) {
    if from.has_flag(NodeFlags::STOP_FUSE) {
        to.set_flag(NodeFlags::STOP_FUSE);
    }
}

/// Computes the gradient of `loss` with respect to each target.
///
/// Targets that do not influence the loss, or whose influence is blocked
/// by [`stop_grad`](crate::Variable::stop_grad) barriers or non-floating
/// variables, receive a zero-filled gradient and a warning. Every returned
/// gradient matches its target in shape and dtype.
///
/// The pass must not run concurrently with another pass over the same
/// graph, per-node bookkeeping is unsynchronized.
///
/// # Panics
///
/// Panics if `loss` or any target is not floating-point, if an operator
/// returns an adjoint whose shape or dtype does not match its input, or if
/// a taped sub-region has lost part of its boundary.
#[must_use]
pub fn grad(loss: &VarPtr, targets: &[VarPtr]) -> Vec<VarPtr> {
    log::debug!("grad of {loss:?} for {} targets", targets.len());
    assert!(loss.is_float(), "loss must be a floating-point variable");
    for target in targets {
        assert!(
            target.is_float(),
            "gradient targets must be floating-point variables"
        );
    }

    let make_binary = ops::binary_constructor();
    let make_number = ops::number_constructor();

    // every node downstream of a target
    let mut ts: Vec<NodeRef> = targets
        .iter()
        .map(|target| NodeRef::Var(target.clone()))
        .collect();
    let fwd = bfs_forward_with_tape(&mut ts, |_| true);
    log::debug!("size of successors: {}", ts.len());

    // intersect with the ancestors of the loss that can carry gradient
    let mut gnodes: Vec<NodeRef> = Vec::with_capacity(ts.len());
    if loss.tflag() == fwd {
        gnodes.push(NodeRef::Var(loss.clone()));
    }
    bfs_backward_with_tape(&mut gnodes, |node| {
        if node.tflag() != fwd {
            return false;
        }
        if node.flags().contains(NodeFlags::STOP_GRAD) {
            return false;
        }
        // integer values have zero grad
        node.as_var().map_or(true, |var| var.is_float())
    });
    log::debug!("size of grad nodes: {}", gnodes.len());

    let (sorted, pass) = topological_sort_backward_with_tape(&gnodes);

    let mut gvars: Vec<VarPtr> = Vec::with_capacity(sorted.len());
    for node in &sorted {
        if let Some(var) = node.as_var() {
            var.set_grad_index(gvars.len() as i64);
            gvars.push(var.clone());
        }
    }
    log::debug!("size of grad vars: {}", gvars.len());

    // dense indices are captured now, the slots are repurposed as the
    // accumulator appends to the graph
    let target_id: Vec<i64> = targets
        .iter()
        .map(|target| {
            if target.tflag() == pass {
                target.grad_index()
            } else {
                -1
            }
        })
        .collect();

    let mut grads: Vec<Option<VarPtr>> = vec![None; gvars.len()];
    if !grads.is_empty() {
        // derivative of the loss with respect to itself
        let one = make_number(1.0, loss);
        assign_attrs(&one, loss);
        trace::trace_grad(&one, loss.id(), 0);
        grads[0] = Some(one);
    }

    // emit phase: serialize every consumer visit before any construction
    let mut id_buffer: Vec<IdRecord> = Vec::with_capacity(sorted.len() + 10);
    let var_record = |var: Option<VarPtr>| {
        let slot = var
            .as_ref()
            .map_or(-1, |v| if v.tflag() == pass { v.grad_index() } else { -1 });
        IdRecord::Var { var, slot }
    };
    for var in gvars.iter().skip(1) {
        for (op, index) in var.outputs_with_index() {
            let node = NodeRef::substitute(op);
            if node.tflag() != pass {
                continue;
            }
            id_buffer.push(IdRecord::Op {
                node: node.clone(),
                index,
            });
            if node.flags().contains(NodeFlags::GRADS) {
                // grouped nodes backward once, not once per input
                node.set_tflag(0);
                for out in node.output_vars() {
                    id_buffer.push(var_record(out));
                }
                for input in node.input_vars() {
                    id_buffer.push(var_record(input));
                }
            } else {
                for out in node.output_vars() {
                    id_buffer.push(var_record(out));
                }
            }
        }
        id_buffer.push(IdRecord::End);
    }

    // apply phase: replay the records and build the adjoint graph
    let mut j = 0;
    for (i, var) in gvars.iter().enumerate().skip(1) {
        let mut gsum = 0;
        loop {
            let (node, index) = match &id_buffer[j] {
                IdRecord::End => break,
                IdRecord::Op { node, index } => (node.clone(), *index),
                IdRecord::Var { .. } => unreachable!("misaligned id buffer"),
            };
            j += 1;

            if node.flags().contains(NodeFlags::GRADS) {
                let n_outputs = node.output_vars().len();
                let n_inputs = node.input_vars().len();
                let mut douts: Vec<Option<VarPtr>> = Vec::with_capacity(n_outputs);
                for _ in 0..n_outputs {
                    let slot = match &id_buffer[j] {
                        IdRecord::Var { slot, .. } => *slot,
                        _ => unreachable!("misaligned id buffer"),
                    };
                    j += 1;
                    douts.push(if slot >= 0 {
                        grads[slot as usize].clone()
                    } else {
                        None
                    });
                }
                let mut dins = match &node {
                    NodeRef::Tape(tape) => tape.run_callback(&douts),
                    NodeRef::Op(op) => op.kernel().grads(op, &douts),
                    NodeRef::Var(_) => unreachable!("variables have no grouped adjoint"),
                };
                assert_eq!(
                    dins.len(),
                    n_inputs,
                    "grouped adjoint of {node:?} must yield one entry per input"
                );
                for din in dins.iter_mut().take(n_inputs) {
                    let slot = match &id_buffer[j] {
                        IdRecord::Var { slot, .. } => *slot,
                        _ => unreachable!("misaligned id buffer"),
                    };
                    j += 1;
                    if slot < 0 {
                        continue;
                    }
                    if let Some(din) = din.take() {
                        let entry = &mut grads[slot as usize];
                        *entry = match entry.take() {
                            None => Some(din),
                            Some(acc) => {
                                let sum = make_binary(&acc, &din, BinaryKind::Add);
                                if fuse_guard_on_grouped() {
                                    gsum += 1;
                                    if let Some(limit) = prevent_large_fused_op() {
                                        if gsum >= limit {
                                            sum.set_flag(NodeFlags::STOP_FUSE);
                                        }
                                    }
                                }
                                Some(sum)
                            }
                        };
                    }
                }
            } else {
                let op = match &node {
                    NodeRef::Op(op) => op.clone(),
                    _ => unreachable!("single-output adjoints only come from operators"),
                };
                let n_outputs = node.output_vars().len();
                for _ in 0..n_outputs {
                    let (out, slot) = match &id_buffer[j] {
                        IdRecord::Var { var, slot } => (var.clone(), *slot),
                        _ => unreachable!("misaligned id buffer"),
                    };
                    j += 1;
                    if slot < 0 {
                        continue;
                    }
                    let out = match out {
                        Some(out) => out,
                        None => continue,
                    };
                    let dout = grads[slot as usize].clone();
                    if let Some(dvar) = make_grad(&op, &out, dout.as_ref(), var, index) {
                        assert_eq!(
                            dvar.shape(),
                            var.shape(),
                            "adjoint of {var:?} through {op:?} has the wrong shape"
                        );
                        assert_eq!(
                            dvar.dtype(),
                            var.dtype(),
                            "adjoint of {var:?} through {op:?} has the wrong dtype"
                        );
                        trace::trace_grad(&dvar, op.id(), index);
                        grads[i] = match grads[i].take() {
                            None => Some(dvar),
                            Some(acc) => {
                                let sum = make_binary(&acc, &dvar, BinaryKind::Add);
                                gsum += 1;
                                if let Some(limit) = prevent_large_fused_op() {
                                    if gsum >= limit {
                                        // keep a runaway accumulation chain
                                        // out of a single fused kernel
                                        sum.set_flag(NodeFlags::STOP_FUSE);
                                    }
                                }
                                assign_attrs(&sum, var);
                                trace::trace_grad(&sum, var.id(), index);
                                Some(sum)
                            }
                        };
                    }
                }
            }
        }
        j += 1;
    }

    // unreachable targets fall back to zeros
    targets
        .iter()
        .enumerate()
        .map(|(i, target)| {
            let taken = match target_id[i] {
                id if id >= 0 => grads[id as usize].take(),
                _ => None,
            };
            taken.unwrap_or_else(|| {
                log::warn!("target {i} {target:?} has no gradient, filling with zeros");
                let zero = make_number(0.0, target);
                assign_attrs(&zero, target);
                trace::trace_grad(&zero, target.id(), 0);
                zero
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::rc::Rc;
    use std::sync::PoisonError;

    use approx::assert_relative_eq;

    use super::{grad, set_fuse_guard_on_grouped, set_prevent_large_fused_op};
    use crate::graph::node::{DType, LoopOptions, NodeFlags, Op, VarPtr, Variable};
    use crate::graph::tape::{tape, tape_together};
    use crate::ops::{
        binary, cast, detach, identity, number, reduce_sum, BinaryKind, Number, Operator,
    };
    use crate::tests::{eval, Bindings, CONFIG_LOCK};

    fn bind(pairs: &[(&VarPtr, Vec<f64>)]) -> Bindings {
        pairs
            .iter()
            .map(|(var, values)| (var.id(), values.clone()))
            .collect()
    }

    fn is_zero_fill(var: &VarPtr) -> bool {
        var.input().is_some_and(|op| {
            op.kernel()
                .as_any()
                .downcast_ref::<Number>()
                .is_some_and(|n| n.value() == 0.0)
        })
    }

    fn chain_has_stop_fuse(var: &VarPtr) -> bool {
        if var.has_flag(NodeFlags::STOP_FUSE) {
            return true;
        }
        var.input()
            .is_some_and(|op| op.inputs().iter().any(chain_has_stop_fuse))
    }

    #[test]
    fn identity_gradient_is_ones() {
        let x = Variable::leaf(&[2, 2], DType::Float32);
        let y = identity(&x);
        let grads = grad(&y, &[x.clone()]);

        assert_eq!(grads.len(), 1);
        assert_eq!(grads[0].shape(), x.shape());
        assert_eq!(grads[0].dtype(), x.dtype());
        assert_eq!(eval(&grads[0], &Bindings::new()), vec![1.0; 4]);
    }

    #[test]
    fn square_gradient_is_two_x() {
        let x = Variable::leaf(&[3], DType::Float32);
        let y = binary(&x, &x, BinaryKind::Mul);
        let loss = reduce_sum(&y);
        let grads = grad(&loss, &[x.clone()]);

        let bindings = bind(&[(&x, vec![1.0, 2.0, 3.0])]);
        assert_eq!(eval(&grads[0], &bindings), vec![2.0, 4.0, 6.0]);
    }

    #[test]
    fn sum_and_difference_products() {
        let x = Variable::leaf(&[2], DType::Float32);
        let y = Variable::leaf(&[2], DType::Float32);
        let u = binary(&x, &y, BinaryKind::Add);
        let v = binary(&x, &y, BinaryKind::Sub);
        let loss = reduce_sum(&binary(&u, &v, BinaryKind::Mul));
        let grads = grad(&loss, &[x.clone(), y.clone()]);

        let bindings = bind(&[(&x, vec![1.0, 2.0]), (&y, vec![3.0, 4.0])]);
        assert_eq!(eval(&grads[0], &bindings), vec![2.0, 4.0]);
        assert_eq!(eval(&grads[1], &bindings), vec![-6.0, -8.0]);
    }

    #[test]
    fn taped_region_uses_the_callback() {
        let x = Variable::leaf(&[2], DType::Float32);
        let t_in = tape(&x);
        let hidden = identity(&t_in);
        let t_out = tape(&hidden);
        tape_together(
            &[t_in.clone()],
            &[t_out.clone()],
            Box::new(|douts: &[Option<VarPtr>]| {
                vec![douts[0].as_ref().map(|dout| {
                    let three = number(3.0, dout);
                    binary(dout, &three, BinaryKind::Mul)
                })]
            }),
        );
        let loss = reduce_sum(&t_out);
        let grads = grad(&loss, &[x.clone()]);

        assert_eq!(grads[0].shape(), x.shape());
        assert_eq!(eval(&grads[0], &Bindings::new()), vec![3.0, 3.0]);
    }

    #[test]
    fn fan_out_accumulates_and_guards_fusion() {
        let _config = CONFIG_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        set_prevent_large_fused_op(Some(16));

        let x = Variable::leaf(&[2], DType::Float32);
        let copies: Vec<VarPtr> = (0..20).map(|_| identity(&x)).collect();
        let total = copies
            .iter()
            .skip(1)
            .fold(copies[0].clone(), |acc, copy| {
                binary(&acc, copy, BinaryKind::Add)
            });
        let loss = reduce_sum(&total);
        let grads = grad(&loss, &[x.clone()]);

        assert_eq!(eval(&grads[0], &Bindings::new()), vec![20.0, 20.0]);
        assert!(chain_has_stop_fuse(&grads[0]));
    }

    #[test]
    fn fuse_guard_can_be_disabled() {
        let _config = CONFIG_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        set_prevent_large_fused_op(None);

        let x = Variable::leaf(&[2], DType::Float32);
        let copies: Vec<VarPtr> = (0..20).map(|_| identity(&x)).collect();
        let total = copies
            .iter()
            .skip(1)
            .fold(copies[0].clone(), |acc, copy| {
                binary(&acc, copy, BinaryKind::Add)
            });
        let loss = reduce_sum(&total);
        let grads = grad(&loss, &[x.clone()]);

        assert_eq!(eval(&grads[0], &Bindings::new()), vec![20.0, 20.0]);
        assert!(!chain_has_stop_fuse(&grads[0]));

        set_prevent_large_fused_op(Some(16));
    }

    #[test]
    fn fuse_guard_threshold_is_tunable() {
        let _config = CONFIG_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

        let fan_out_grad = || {
            let x = Variable::leaf(&[2], DType::Float32);
            let copies: Vec<VarPtr> = (0..4).map(|_| identity(&x)).collect();
            let total = copies
                .iter()
                .skip(1)
                .fold(copies[0].clone(), |acc, copy| {
                    binary(&acc, copy, BinaryKind::Add)
                });
            let loss = reduce_sum(&total);
            grad(&loss, &[x]).swap_remove(0)
        };

        set_prevent_large_fused_op(Some(16));
        assert!(!chain_has_stop_fuse(&fan_out_grad()));

        set_prevent_large_fused_op(Some(2));
        assert!(chain_has_stop_fuse(&fan_out_grad()));

        set_prevent_large_fused_op(Some(16));
    }

    #[test]
    fn stop_grad_factor_does_not_contribute() {
        let x = Variable::leaf(&[3], DType::Float32);
        let frozen = detach(&x);
        let y = binary(&frozen, &x, BinaryKind::Mul);
        let loss = reduce_sum(&y);
        let grads = grad(&loss, &[x.clone()]);

        // only the unbarriered factor contributes, the gradient is the
        // frozen copy of x itself
        let bindings = bind(&[(&x, vec![1.0, -2.0, 5.0])]);
        assert_eq!(eval(&grads[0], &bindings), vec![1.0, -2.0, 5.0]);
    }

    #[test]
    fn fully_barriered_target_gets_zeros() {
        let x = Variable::leaf(&[2], DType::Float32);
        let frozen = detach(&x);
        let loss = reduce_sum(&frozen);
        let grads = grad(&loss, &[x.clone()]);

        assert!(is_zero_fill(&grads[0]));
        assert_eq!(grads[0].shape(), x.shape());
        assert_eq!(eval(&grads[0], &Bindings::new()), vec![0.0, 0.0]);
    }

    #[test]
    fn disconnected_target_gets_zeros() {
        let x = Variable::leaf(&[2], DType::Float32);
        let constant = Variable::leaf(&[3], DType::Float64);
        let loss = reduce_sum(&identity(&x));
        let grads = grad(&loss, &[constant.clone()]);

        assert!(is_zero_fill(&grads[0]));
        assert_eq!(grads[0].shape(), constant.shape());
        assert_eq!(grads[0].dtype(), DType::Float64);
    }

    #[test]
    fn integer_variables_block_gradient_flow() {
        let x = Variable::leaf(&[2], DType::Float32);
        let quantized = cast(&x, DType::Int32);
        let back = cast(&quantized, DType::Float32);
        let loss = reduce_sum(&back);
        let grads = grad(&loss, &[x.clone()]);

        assert!(is_zero_fill(&grads[0]));
    }

    #[test]
    #[should_panic(expected = "loss must be a floating-point")]
    fn integer_loss_is_rejected() {
        let loss = Variable::leaf(&[2], DType::Int32);
        let _ = grad(&loss, &[]);
    }

    #[test]
    #[should_panic(expected = "targets must be floating-point")]
    fn integer_target_is_rejected() {
        let loss = Variable::leaf(&[], DType::Float32);
        let target = Variable::leaf(&[2], DType::Int64);
        let _ = grad(&loss, &[target]);
    }

    struct SwapGrads;

    impl Operator for SwapGrads {
        fn name(&self) -> &'static str {
            "swap_grads"
        }

        fn flags(&self) -> NodeFlags {
            NodeFlags::GRADS
        }

        fn grads(&self, _op: &Rc<Op>, douts: &[Option<VarPtr>]) -> Vec<Option<VarPtr>> {
            vec![douts[1].clone(), douts[0].clone()]
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn grouped_operators_backward_once_with_all_slots() {
        let a = Variable::leaf(&[2], DType::Float32);
        let b = Variable::leaf(&[2], DType::Float32);
        let outs = Op::build(
            Box::new(SwapGrads),
            vec![a.clone(), b.clone()],
            &[(vec![2], DType::Float32), (vec![2], DType::Float32)],
        );
        let loss = reduce_sum(&outs[0]);
        let grads = grad(&loss, &[a.clone(), b.clone()]);

        // only the first output carries adjoint and the kernel crosses it
        // over to the second input
        assert!(is_zero_fill(&grads[0]));
        assert_eq!(eval(&grads[1], &Bindings::new()), vec![1.0, 1.0]);
    }

    #[test]
    fn grouped_accumulation_honors_the_optional_guard() {
        let _config = CONFIG_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        set_prevent_large_fused_op(Some(1));
        set_fuse_guard_on_grouped(false);

        let taped_passthrough = |x: &VarPtr| {
            let t_in = tape(x);
            let t_out = tape(&identity(&t_in));
            tape_together(
                &[t_in],
                &[t_out.clone()],
                Box::new(|douts: &[Option<VarPtr>]| vec![douts[0].clone()]),
            );
            t_out
        };

        let x = Variable::leaf(&[2], DType::Float32);
        let loss = reduce_sum(&binary(
            &taped_passthrough(&x),
            &taped_passthrough(&x),
            BinaryKind::Add,
        ));
        let grads = grad(&loss, &[x.clone()]);
        assert_eq!(eval(&grads[0], &Bindings::new()), vec![2.0, 2.0]);
        assert!(!chain_has_stop_fuse(&grads[0]));

        set_fuse_guard_on_grouped(true);
        let x = Variable::leaf(&[2], DType::Float32);
        let loss = reduce_sum(&binary(
            &taped_passthrough(&x),
            &taped_passthrough(&x),
            BinaryKind::Add,
        ));
        let grads = grad(&loss, &[x.clone()]);
        assert!(chain_has_stop_fuse(&grads[0]));

        set_fuse_guard_on_grouped(false);
        set_prevent_large_fused_op(Some(16));
    }

    #[test]
    fn gradients_are_linear_in_the_loss() {
        let x = Variable::leaf(&[2], DType::Float32);
        let l1 = reduce_sum(&binary(&x, &x, BinaryKind::Mul));
        let l2 = reduce_sum(&identity(&x));
        let a = number(2.0, &l1);
        let b = number(-3.0, &l2);
        let loss = binary(
            &binary(&a, &l1, BinaryKind::Mul),
            &binary(&b, &l2, BinaryKind::Mul),
            BinaryKind::Add,
        );

        let combined = grad(&loss, &[x.clone()]);
        let first = grad(&l1, &[x.clone()]);
        let second = grad(&l2, &[x.clone()]);

        let bindings = bind(&[(&x, vec![0.5, -1.5])]);
        let combined_values = eval(&combined[0], &bindings);
        let first_values = eval(&first[0], &bindings);
        let second_values = eval(&second[0], &bindings);
        for i in 0..2 {
            assert_relative_eq!(
                combined_values[i],
                2.0f64.mul_add(first_values[i], -3.0 * second_values[i]),
                max_relative = 1e-12
            );
        }
    }

    #[test]
    fn loop_options_follow_the_gradient() {
        let x = Variable::leaf(&[2], DType::Float32);
        let options = Rc::new(LoopOptions(vec![("unroll".to_owned(), 4)]));
        x.set_loop_options(options.clone());
        let loss = reduce_sum(&identity(&x));
        let grads = grad(&loss, &[x.clone()]);

        assert_eq!(grads[0].loop_options(), Some(options));
    }

    #[test]
    fn seed_inherits_fusion_barrier_from_the_loss() {
        let x = Variable::leaf(&[2], DType::Float32);
        let loss = reduce_sum(&identity(&x));
        loss.set_flag(NodeFlags::STOP_FUSE);
        let grads = grad(&loss, &[x.clone()]);

        assert!(chain_has_stop_fuse(&grads[0]));
    }

    #[test]
    fn gradients_can_be_differentiated_again() {
        let x = Variable::leaf(&[2], DType::Float32);
        let y = binary(&x, &x, BinaryKind::Mul);
        let loss = reduce_sum(&y);
        let first = grad(&loss, &[x.clone()]);

        let second_loss = reduce_sum(&first[0]);
        let second = grad(&second_loss, &[x.clone()]);

        let bindings = bind(&[(&x, vec![1.0, 2.0])]);
        assert_eq!(eval(&second[0], &bindings), vec![2.0, 2.0]);
    }
}
