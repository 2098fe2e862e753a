//! Traversals over a chain segment, endpoints included

use crate::{
    graph::{Graph, GraphError, NodeId},
    node::Node,
};

/// Ordered node ids from `begin` to `end`, walking `next` or `previous`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    ids: Vec<NodeId>,
}

impl Range {
    /// Walks `next` pointers from `begin` until `end`
    pub fn new(graph: &Graph, begin: NodeId, end: NodeId) -> Result<Self, GraphError> {
        Self::walk(graph, begin, end, Node::next)
    }

    /// Walks `previous` pointers from `begin` until `end`
    pub fn reverse(graph: &Graph, begin: NodeId, end: NodeId) -> Result<Self, GraphError> {
        Self::walk(graph, begin, end, Node::previous)
    }

    fn walk(
        graph: &Graph,
        begin: NodeId,
        end: NodeId,
        step: fn(&Node) -> Option<NodeId>,
    ) -> Result<Self, GraphError> {
        let unreachable = GraphError::Unreachable {
            from: begin,
            to: end,
        };
        let mut ids = vec![begin];
        let mut current = begin;
        while current != end {
            current = match step(graph.node(current)?) {
                Some(id) => id,
                None => return Err(unreachable),
            };
            ids.push(current);
            // a cycle that skips `end`
            if ids.len() > graph.len() {
                return Err(unreachable);
            }
        }
        Ok(Self { ids })
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn first(&self) -> Option<NodeId> {
        self.ids.first().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.ids.iter().copied()
    }

    /// Calls `f` on every node in traversal order
    pub fn apply<F>(&self, graph: &mut Graph, mut f: F) -> Result<(), GraphError>
    where
        F: FnMut(&mut Node),
    {
        for &id in &self.ids {
            f(graph.node_mut(id)?);
        }
        Ok(())
    }

    pub fn forward(&self, graph: &mut Graph, batch_size: usize) -> Result<(), GraphError> {
        for &id in &self.ids {
            graph.forward(id, batch_size)?;
        }
        Ok(())
    }

    pub fn backward(&self, graph: &mut Graph, batch_size: usize) -> Result<(), GraphError> {
        for &id in &self.ids {
            graph.backward(id, batch_size)?;
        }
        Ok(())
    }

    /// Backward pass where the first node takes its sensitivity from the loss
    pub fn backward_from_loss(
        &self,
        graph: &mut Graph,
        batch_size: usize,
    ) -> Result<(), GraphError> {
        let Some((&first, rest)) = self.ids.split_first() else {
            return Ok(());
        };
        graph.backward_from_loss(first, batch_size)?;
        for &id in rest {
            graph.backward(id, batch_size)?;
        }
        Ok(())
    }

    pub fn update(
        &self,
        graph: &mut Graph,
        batch_size: usize,
        lambda: f32,
    ) -> Result<(), GraphError> {
        for &id in &self.ids {
            graph.update(id, batch_size, lambda)?;
        }
        Ok(())
    }

    pub fn lock(&self, graph: &mut Graph) -> Result<(), GraphError> {
        self.apply(graph, Node::lock)
    }

    pub fn unlock(&self, graph: &mut Graph) -> Result<(), GraphError> {
        self.apply(graph, Node::unlock)
    }

    pub fn clear(&self, graph: &mut Graph) -> Result<(), GraphError> {
        self.apply(graph, Node::clear)
    }
}

impl<'a> IntoIterator for &'a Range {
    type Item = &'a NodeId;
    type IntoIter = std::slice::Iter<'a, NodeId>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.iter()
    }
}
