//! This module contains the data structures of the lazy computation graph
//! the differentiation engine walks.
//!
//! The graph is bipartite: `Variable` nodes are tensor-valued and `Op`
//! nodes are the computations producing variables from variables. A
//! variable owns the operator that produced it and an operator owns its
//! input variables, so the whole history of a result stays alive for as
//! long as the result does, while consumer edges are weak and disappear
//! with their subgraphs.
//!
//! A `Tape` is the third kind of node: it stands in for a whole sub-region
//! of the graph whose adjoint is supplied by a user callback instead of by
//! composition of per-operator adjoints. Traversals substitute the tape
//! for the region's boundary operators at edge-follow time.

pub mod node;
pub mod tape;
pub(crate) mod traverse;
