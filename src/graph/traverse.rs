//! Graph traversals used by the differentiation pass.
//!
//! All three walks test membership in the current pass by comparing a
//! node's visit epoch against the process-wide traversal counter, so no
//! state has to be cleared between passes. All three substitute tapes for
//! taped boundary operators while following edges.

use crate::graph::node::{next_pass, NodeRef};

/// Breadth-first walk following consumer edges. The queue doubles as the
/// visited set, nodes already in it are marked before expansion starts.
/// `accept` decides whether a newly reached node joins the walk. Returns
/// the pass token the walk marked its nodes with.
pub(crate) fn bfs_forward_with_tape(
    queue: &mut Vec<NodeRef>,
    mut accept: impl FnMut(&NodeRef) -> bool,
) -> u64 {
    let t = next_pass();
    for node in queue.iter() {
        node.set_tflag(t);
    }
    let mut i = 0;
    while i < queue.len() {
        let node = queue[i].clone();
        i += 1;
        for onode in node.output_nodes() {
            if let NodeRef::Tape(tape) = &onode {
                assert_eq!(
                    tape.ref_count(),
                    tape.total(),
                    "tape boundary has been broken, {tape:?} lost an operator"
                );
            }
            if onode.tflag() != t && accept(&onode) {
                onode.set_tflag(t);
                queue.push(onode);
            }
        }
    }
    t
}

/// Breadth-first walk following producer edges, see [`bfs_forward_with_tape`]
pub(crate) fn bfs_backward_with_tape(
    queue: &mut Vec<NodeRef>,
    mut accept: impl FnMut(&NodeRef) -> bool,
) -> u64 {
    let t = next_pass();
    for node in queue.iter() {
        node.set_tflag(t);
    }
    let mut i = 0;
    while i < queue.len() {
        let node = queue[i].clone();
        i += 1;
        for inode in node.input_nodes() {
            if let NodeRef::Tape(tape) = &inode {
                assert_eq!(
                    tape.ref_count(),
                    tape.total(),
                    "tape boundary has been broken, {tape:?} lost an operator"
                );
            }
            if inode.tflag() != t && accept(&inode) {
                inode.set_tflag(t);
                queue.push(inode);
            }
        }
    }
    t
}

/// Kahn sort of `nodes` in reverse execution order.
///
/// A node's remaining dependency count is the number of its consumers
/// inside `nodes`, so the sources of the sort are the nodes nothing in the
/// set consumes, typically just the loss. A variable's adjoint is complete
/// once every node emitted before it has been processed. Returns the order
/// together with the pass token the sorted nodes are marked with.
///
/// # Panics
///
/// Panics if the sort does not cover the whole set, which would mean the
/// input is not acyclic.
pub(crate) fn topological_sort_backward_with_tape(nodes: &[NodeRef]) -> (Vec<NodeRef>, u64) {
    let t = next_pass();
    let mut sorted = Vec::with_capacity(nodes.len());
    for node in nodes {
        node.set_tflag(t);
    }
    for node in nodes {
        let deps = node
            .output_nodes()
            .into_iter()
            .filter(|onode| onode.tflag() == t)
            .count();
        node.set_pending(deps);
        if deps == 0 {
            sorted.push(node.clone());
        }
    }
    let mut i = 0;
    while i < sorted.len() {
        let node = sorted[i].clone();
        i += 1;
        for inode in node.input_nodes() {
            if inode.tflag() == t && inode.dec_pending() == 0 {
                sorted.push(inode);
            }
        }
    }
    assert_eq!(
        nodes.len(),
        sorted.len(),
        "topological sort did not cover the gradient subgraph"
    );
    (sorted, t)
}

#[cfg(test)]
mod tests {
    use super::{bfs_backward_with_tape, bfs_forward_with_tape, topological_sort_backward_with_tape};
    use crate::graph::node::{DType, NodeRef, VarPtr, Variable};
    use crate::graph::tape::{tape, tape_together};
    use crate::ops::{binary, identity, reduce_sum, BinaryKind};

    fn contains(nodes: &[NodeRef], var: &VarPtr) -> bool {
        nodes
            .iter()
            .any(|node| node.as_var().is_some_and(|v| v.id() == var.id()))
    }

    #[test]
    fn forward_walk_marks_descendants() {
        let x = Variable::leaf(&[2], DType::Float32);
        let y = Variable::leaf(&[2], DType::Float32);
        let z = binary(&x, &y, BinaryKind::Add);
        let loss = reduce_sum(&z);

        let mut queue = vec![NodeRef::Var(x.clone())];
        bfs_forward_with_tape(&mut queue, |_| true);

        assert!(contains(&queue, &z));
        assert!(contains(&queue, &loss));
        // y is a sibling input, not a descendant of x
        assert!(!contains(&queue, &y));
    }

    #[test]
    fn backward_walk_marks_ancestors() {
        let x = Variable::leaf(&[2], DType::Float32);
        let y = identity(&x);
        let loss = reduce_sum(&y);

        let mut queue = vec![NodeRef::Var(loss.clone())];
        bfs_backward_with_tape(&mut queue, |_| true);

        assert!(contains(&queue, &y));
        assert!(contains(&queue, &x));
    }

    #[test]
    fn walks_collapse_taped_regions() {
        let x = Variable::leaf(&[2], DType::Float32);
        let t_in = tape(&x);
        let hidden = identity(&t_in);
        let t_out = tape(&hidden);
        tape_together(
            &[t_in.clone()],
            &[t_out.clone()],
            Box::new(|douts: &[Option<VarPtr>]| vec![douts[0].clone()]),
        );
        let loss = reduce_sum(&t_out);

        let mut queue = vec![NodeRef::Var(x.clone())];
        bfs_forward_with_tape(&mut queue, |_| true);

        assert!(contains(&queue, &t_out));
        assert!(contains(&queue, &loss));
        // the interior of the region is skipped entirely
        assert!(!contains(&queue, &hidden));
        assert!(!contains(&queue, &t_in));
        assert!(queue.iter().any(|n| matches!(n, NodeRef::Tape(_))));
    }

    #[test]
    fn sort_emits_consumers_before_producers() {
        let x = Variable::leaf(&[2], DType::Float32);
        let y = identity(&x);
        let loss = reduce_sum(&y);

        let mut queue = vec![NodeRef::Var(loss.clone())];
        bfs_backward_with_tape(&mut queue, |_| true);
        let (sorted, _) = topological_sort_backward_with_tape(&queue);

        assert_eq!(sorted.len(), queue.len());
        let pos = |var: &VarPtr| {
            sorted
                .iter()
                .position(|node| node.as_var().is_some_and(|v| v.id() == var.id()))
                .unwrap()
        };
        assert_eq!(pos(&loss), 0);
        assert!(pos(&y) < pos(&x));
    }

    #[test]
    fn sort_handles_fan_out() {
        let x = Variable::leaf(&[2], DType::Float32);
        let a = identity(&x);
        let b = identity(&x);
        let s = binary(&a, &b, BinaryKind::Add);
        let loss = reduce_sum(&s);

        let mut queue = vec![NodeRef::Var(loss.clone())];
        bfs_backward_with_tape(&mut queue, |_| true);
        let (sorted, _) = topological_sort_backward_with_tape(&queue);

        // x is only ready after both of its consumers have been emitted
        let pos = |var: &VarPtr| {
            sorted
                .iter()
                .position(|node| node.as_var().is_some_and(|v| v.id() == var.id()))
                .unwrap()
        };
        assert!(pos(&a) < pos(&x));
        assert!(pos(&b) < pos(&x));
        assert_eq!(sorted.len(), queue.len());
    }

    #[test]
    #[should_panic(expected = "tape boundary has been broken")]
    fn broken_tape_boundary_is_fatal() {
        let x = Variable::leaf(&[2], DType::Float32);
        let t_in = tape(&x);
        let dropped = tape(&x);
        let t_out = tape(&identity(&t_in));
        tape_together(
            &[t_in.clone(), dropped.clone()],
            &[t_out.clone()],
            Box::new(|_: &[Option<VarPtr>]| vec![None, None]),
        );
        drop(dropped);

        let mut queue = vec![NodeRef::Var(x)];
        bfs_forward_with_tape(&mut queue, |_| true);
    }
}
