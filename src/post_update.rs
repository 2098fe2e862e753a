//! Hooks run once per optimizer step, after every node of the chain was updated

use crate::{
    graph::{Graph, GraphError, NodeId},
    range::Range,
};

/// Signature of a post-update hook
pub type PostUpdateFunction = Box<dyn Fn(&mut Graph) -> Result<(), GraphError>>;

/// Hook doing nothing
pub fn none() -> PostUpdateFunction {
    Box::new(|_| Ok(()))
}

/// Saturates every parameter from `begin` to `end` into `[-bound, bound]`
///
/// This is the weight clipping of a Wasserstein critic.
pub fn clip_weight(begin: NodeId, end: NodeId, bound: f32) -> PostUpdateFunction {
    Box::new(move |graph| {
        Range::new(graph, begin, end)?.apply(graph, |node| node.params_mut().clip(bound))
    })
}

/// Scales every parameter from `begin` to `end` by `factor`
pub fn gradient_penalty(begin: NodeId, end: NodeId, factor: f32) -> PostUpdateFunction {
    Box::new(move |graph| {
        Range::new(graph, begin, end)?.apply(graph, |node| *node.params_mut() *= factor)
    })
}
