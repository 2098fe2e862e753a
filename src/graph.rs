//! Arena of nodes and the link protocol wiring them into a pipeline
//!
//! Nodes are addressed by [`NodeId`]. An edge is a pair of indices: `previous.next` and
//! `next.previous`. A node reads its input from its predecessor's outputs and its output
//! sensitivity from its successor's input sensitivity, both looked up at call time, so
//! re-linking only reassigns indices.

use std::fmt::{self, Display};

use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

use crate::{
    layers::{
        BatchNormalization, Bias, BilinearUpsampling, Border, Built, Convolution2D,
        Deconvolution2D, Dropout, Input, LeakyRelu, Linear, MaxPooling, Noise, Relu, Sigmoid,
        Softmax, Tanh,
    },
    node::Node,
    optim::AdamConfig,
    tensor::{Tensor, TensorError},
};

/// Stable index of a node inside its [`Graph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Errors for graph construction and traversal
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Unknown node {0}")]
    UnknownNode(NodeId),
    #[error("Cannot link node {0} to itself")]
    SelfLink(NodeId),
    #[error("Cannot link into input node {0}")]
    LinkIntoInput(NodeId),
    #[error("Node {0} has no predecessor")]
    NotLinked(NodeId),
    #[error(
        "Shape mismatch linking {previous} to {next}: expected {expected} values, got {got}"
    )]
    ShapeMismatch {
        previous: NodeId,
        next: NodeId,
        expected: usize,
        got: usize,
    },
    #[error("Invalid {layer} layer: {reason}")]
    InvalidLayer { layer: &'static str, reason: String },
    #[error("The graph was built without any lane")]
    NoLanes,
    #[error("Batch of {batch_size} exceeds the {lanes} available lanes")]
    BatchTooLarge { batch_size: usize, lanes: usize },
    #[error("Node {to} is not reachable from {from}")]
    Unreachable { from: NodeId, to: NodeId },
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

impl GraphError {
    pub(crate) fn invalid(layer: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidLayer {
            layer,
            reason: reason.into(),
        }
    }
}

/// Construction-time settings shared by every node of a graph
#[derive(Debug, Clone, PartialEq)]
pub struct GraphConfig {
    /// number of batch lanes allocated per node
    pub lanes: usize,
    /// seed of the graph generator, drawn from the OS when absent
    pub seed: Option<u64>,
    pub adam: AdamConfig,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            lanes: 64,
            seed: None,
            adam: AdamConfig::default(),
        }
    }
}

/// Read-only view of every node except the one being run
struct Neighbours<'a> {
    head: &'a [Node],
    tail: &'a [Node],
    pivot: usize,
}

impl<'a> Neighbours<'a> {
    fn get(&self, id: NodeId) -> &'a Node {
        if id.0 < self.pivot {
            &self.head[id.0]
        } else {
            &self.tail[id.0 - self.pivot - 1]
        }
    }
}

fn split(nodes: &mut [Node], id: NodeId) -> Result<(&mut Node, Neighbours<'_>), GraphError> {
    if id.0 >= nodes.len() {
        return Err(GraphError::UnknownNode(id));
    }
    let (head, rest) = nodes.split_at_mut(id.0);
    let (node, tail) = rest
        .split_first_mut()
        .ok_or(GraphError::UnknownNode(id))?;
    Ok((
        node,
        Neighbours {
            head,
            tail,
            pivot: id.0,
        },
    ))
}

/// Owns every node and the generator used for initialisation and random layers
#[derive(Debug)]
pub struct Graph {
    nodes: Vec<Node>,
    rng: Pcg64Mcg,
    config: GraphConfig,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new(GraphConfig::default())
    }
}

impl Graph {
    pub fn new(config: GraphConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => Pcg64Mcg::seed_from_u64(seed),
            None => Pcg64Mcg::seed_from_u64(rand::random()),
        };
        Self {
            nodes: Vec::new(),
            rng,
            config,
        }
    }

    /// Default configuration with a fixed seed
    pub fn with_seed(seed: u64) -> Self {
        Self::new(GraphConfig {
            seed: Some(seed),
            ..GraphConfig::default()
        })
    }

    pub fn lanes(&self) -> usize {
        self.config.lanes
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.nodes.get(id.0).ok_or(GraphError::UnknownNode(id))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, GraphError> {
        self.nodes.get_mut(id.0).ok_or(GraphError::UnknownNode(id))
    }

    fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    fn check_batch(&self, batch_size: usize) -> Result<(), GraphError> {
        if batch_size > self.config.lanes {
            return Err(GraphError::BatchTooLarge {
                batch_size,
                lanes: self.config.lanes,
            });
        }
        Ok(())
    }

    /// Starts a new chain whose lanes the caller fills before each forward pass
    pub fn input(&mut self, sizes: Vec<usize>) -> NodeId {
        let lanes = self.config.lanes;
        self.push(Node::new(Input::build(sizes), vec![0], lanes))
    }

    /// Builds a node on the output shape of `previous` and links it after `previous`
    pub fn attach<F>(&mut self, previous: NodeId, build: F) -> Result<NodeId, GraphError>
    where
        F: FnOnce(&[usize], &mut Pcg64Mcg, usize) -> Result<Built, GraphError>,
    {
        let input_sizes = self.node(previous)?.output_sizes().to_vec();
        let lanes = self.config.lanes;
        let built = build(&input_sizes, &mut self.rng, lanes)?;
        let id = self.push(Node::new(built, input_sizes, lanes));
        self.link(previous, id)?;
        Ok(id)
    }

    pub fn linear(
        &mut self,
        previous: NodeId,
        output_sizes: Vec<usize>,
    ) -> Result<NodeId, GraphError> {
        self.attach(previous, |sizes, rng, _| {
            Linear::build(sizes, output_sizes, rng)
        })
    }

    pub fn bias(&mut self, previous: NodeId) -> Result<NodeId, GraphError> {
        self.attach(previous, |sizes, rng, _| Bias::build(sizes, rng))
    }

    pub fn convolution_2d(
        &mut self,
        previous: NodeId,
        filter: [usize; 2],
        features: usize,
        stride: usize,
    ) -> Result<NodeId, GraphError> {
        self.attach(previous, |sizes, rng, _| {
            Convolution2D::build(sizes, filter, features, stride, rng)
        })
    }

    pub fn deconvolution_2d(
        &mut self,
        previous: NodeId,
        filter: [usize; 2],
        features: usize,
        stride: usize,
    ) -> Result<NodeId, GraphError> {
        self.attach(previous, |sizes, rng, _| {
            Deconvolution2D::build(sizes, filter, features, stride, rng)
        })
    }

    pub fn batch_normalization(&mut self, previous: NodeId) -> Result<NodeId, GraphError> {
        self.attach(previous, |sizes, _, _| {
            Ok(Built::stateless(
                BatchNormalization::new(sizes),
                sizes.to_vec(),
            ))
        })
    }

    pub fn max_pooling(&mut self, previous: NodeId) -> Result<NodeId, GraphError> {
        self.attach(previous, |sizes, _, _| MaxPooling::build(sizes))
    }

    pub fn bilinear_upsampling(&mut self, previous: NodeId) -> Result<NodeId, GraphError> {
        self.attach(previous, |sizes, _, _| BilinearUpsampling::build(sizes))
    }

    pub fn border(
        &mut self,
        previous: NodeId,
        size: usize,
        value: f32,
    ) -> Result<NodeId, GraphError> {
        self.attach(previous, |sizes, _, _| Border::build(sizes, size, value))
    }

    pub fn dropout(&mut self, previous: NodeId, ratio: f32) -> Result<NodeId, GraphError> {
        self.attach(previous, |sizes, _, lanes| {
            Dropout::build(sizes, ratio, lanes)
        })
    }

    pub fn noise(&mut self, previous: NodeId, sigma: f32) -> Result<NodeId, GraphError> {
        self.attach(previous, |sizes, _, _| Noise::build(sizes, sigma))
    }

    pub fn relu(&mut self, previous: NodeId) -> Result<NodeId, GraphError> {
        self.attach(previous, |sizes, _, _| {
            Ok(Built::stateless(Relu, sizes.to_vec()))
        })
    }

    pub fn leaky_relu(&mut self, previous: NodeId) -> Result<NodeId, GraphError> {
        self.attach(previous, |sizes, _, _| {
            Ok(Built::stateless(LeakyRelu, sizes.to_vec()))
        })
    }

    pub fn sigmoid(&mut self, previous: NodeId) -> Result<NodeId, GraphError> {
        self.attach(previous, |sizes, _, _| {
            Ok(Built::stateless(Sigmoid, sizes.to_vec()))
        })
    }

    pub fn tanh(&mut self, previous: NodeId) -> Result<NodeId, GraphError> {
        self.attach(previous, |sizes, _, _| {
            Ok(Built::stateless(Tanh, sizes.to_vec()))
        })
    }

    pub fn softmax(&mut self, previous: NodeId) -> Result<NodeId, GraphError> {
        self.attach(previous, |sizes, _, _| {
            Ok(Built::stateless(Softmax, sizes.to_vec()))
        })
    }

    /// Makes `next` read from `previous`, replacing the existing edges of both ends
    ///
    /// The former partners keep their own pointers, so relinking a sub-chain and linking
    /// it back later restores the original wiring.
    pub fn link(&mut self, previous: NodeId, next: NodeId) -> Result<(), GraphError> {
        if previous == next {
            return Err(GraphError::SelfLink(previous));
        }
        let got: usize = self.node(previous)?.output_sizes().iter().product();
        let target = self.node(next)?;
        if target.is_input() {
            return Err(GraphError::LinkIntoInput(next));
        }
        let expected: usize = target.input_sizes().iter().product();
        if got != expected {
            return Err(GraphError::ShapeMismatch {
                previous,
                next,
                expected,
                got,
            });
        }
        self.nodes[previous.0].next = Some(next);
        self.nodes[next.0].previous = Some(previous);
        log::debug!(
            "linked {} {} -> {} {}",
            self.nodes[previous.0].name(),
            previous,
            self.nodes[next.0].name(),
            next
        );
        Ok(())
    }

    pub fn forward(&mut self, id: NodeId, batch_size: usize) -> Result<(), GraphError> {
        self.check_batch(batch_size)?;
        let Self { nodes, rng, .. } = self;
        let (node, neighbours) = split(nodes, id)?;
        let input: &[Tensor] = match node.previous {
            Some(previous) => neighbours.get(previous).outputs(),
            None if node.is_input() => &[],
            None => return Err(GraphError::NotLinked(id)),
        };
        node.forward(input, batch_size, rng);
        Ok(())
    }

    /// Backward pass reading the output sensitivity from the successor, if any
    pub fn backward(&mut self, id: NodeId, batch_size: usize) -> Result<(), GraphError> {
        self.backward_with(id, batch_size, false)
    }

    /// Backward pass reading the output sensitivity the loss wrote into the node itself
    pub fn backward_from_loss(&mut self, id: NodeId, batch_size: usize) -> Result<(), GraphError> {
        self.backward_with(id, batch_size, true)
    }

    fn backward_with(
        &mut self,
        id: NodeId,
        batch_size: usize,
        terminal: bool,
    ) -> Result<(), GraphError> {
        self.check_batch(batch_size)?;
        let (node, neighbours) = split(&mut self.nodes, id)?;
        let input: &[Tensor] = match node.previous {
            Some(previous) => neighbours.get(previous).outputs(),
            None if node.is_input() => &[],
            None => return Err(GraphError::NotLinked(id)),
        };
        let output_sensitivity = match node.next {
            Some(next) if !terminal => Some(neighbours.get(next).input_sensitivities()),
            _ => None,
        };
        node.backward(input, output_sensitivity, batch_size);
        Ok(())
    }

    pub fn update(&mut self, id: NodeId, batch_size: usize, lambda: f32) -> Result<(), GraphError> {
        self.check_batch(batch_size)?;
        let config = self.config.adam;
        self.node_mut(id)?.update(batch_size, lambda, &config);
        Ok(())
    }

    /// Copies `value` into one output lane of `id`, normally an input node
    pub fn set_input(&mut self, id: NodeId, lane: usize, value: &Tensor) -> Result<(), GraphError> {
        self.input_lane_mut(id, lane, value.len())?
            .values
            .copy_from_slice(&value.values);
        Ok(())
    }

    /// Output lane of `id`, checked against the expected value count
    pub fn input_lane_mut(
        &mut self,
        id: NodeId,
        lane: usize,
        len: usize,
    ) -> Result<&mut Tensor, GraphError> {
        self.check_lane(lane)?;
        let output = self.node_mut(id)?.output_mut(lane);
        if output.len() != len {
            return Err(TensorError::ShapeMismatch {
                expected: output.len(),
                got: len,
            }
            .into());
        }
        Ok(output)
    }

    fn check_lane(&self, lane: usize) -> Result<(), GraphError> {
        if lane >= self.config.lanes {
            return Err(GraphError::BatchTooLarge {
                batch_size: lane + 1,
                lanes: self.config.lanes,
            });
        }
        Ok(())
    }

    /// Sensitivity of the error with respect to one output lane of `id`
    pub fn output_sensitivity(&self, id: NodeId, lane: usize) -> Result<&Tensor, GraphError> {
        self.check_lane(lane)?;
        let node = self.node(id)?;
        Ok(match node.next {
            Some(next) => self.node(next)?.input_sensitivity(lane),
            None => node.terminal_sensitivity(lane),
        })
    }

    /// Calls `f(prediction, sensitivity)` with the terminal buffer of the lane
    pub fn with_prediction<R>(
        &mut self,
        id: NodeId,
        lane: usize,
        f: impl FnOnce(&Tensor, &mut Tensor) -> R,
    ) -> Result<R, GraphError> {
        self.check_lane(lane)?;
        let (prediction, sensitivity) = self.node_mut(id)?.prediction_mut(lane);
        Ok(f(prediction, sensitivity))
    }
}

#[cfg(test)]
mod tests {
    use crate::layers::Layer;

    use super::*;

    fn small_graph() -> Graph {
        Graph::new(GraphConfig {
            lanes: 2,
            seed: Some(1),
            ..GraphConfig::default()
        })
    }

    #[test]
    fn test_attach_links_both_ways() {
        let mut graph = small_graph();
        let input = graph.input(vec![3]);
        let linear = graph.linear(input, vec![2]).unwrap();
        let relu = graph.relu(linear).unwrap();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.node(input).unwrap().next(), Some(linear));
        assert_eq!(graph.node(linear).unwrap().previous(), Some(input));
        assert_eq!(graph.node(linear).unwrap().next(), Some(relu));
        assert_eq!(graph.node(relu).unwrap().output_sizes(), &[2]);
        assert_eq!(graph.node(relu).unwrap().name(), "Relu");
    }

    #[test]
    fn test_link_errors() {
        let mut graph = small_graph();
        let a = graph.input(vec![3]);
        let b = graph.input(vec![4]);
        let relu = graph.relu(a).unwrap();
        assert!(matches!(graph.link(relu, relu), Err(GraphError::SelfLink(_))));
        assert!(matches!(graph.link(a, b), Err(GraphError::LinkIntoInput(_))));
        assert!(matches!(
            graph.link(b, relu),
            Err(GraphError::ShapeMismatch {
                expected: 3,
                got: 4,
                ..
            })
        ));
        assert!(matches!(
            graph.link(a, NodeId(9)),
            Err(GraphError::UnknownNode(NodeId(9)))
        ));
    }

    #[test]
    fn test_forward_reads_previous_outputs() {
        let mut graph = small_graph();
        let input = graph.input(vec![2]);
        let relu = graph.relu(input).unwrap();
        let value = Tensor::from_values(vec![2], vec![-1.0, 2.0]).unwrap();
        graph.set_input(input, 1, &value).unwrap();
        graph.forward(relu, 2).unwrap();
        assert_eq!(graph.node(relu).unwrap().output(1).values, vec![0.0, 2.0]);
        assert!(matches!(
            graph.forward(relu, 3),
            Err(GraphError::BatchTooLarge { .. })
        ));
        assert!(graph.set_input(input, 0, &Tensor::zeros(vec![3])).is_err());
    }

    #[test]
    fn test_backward_resolves_sensitivity_from_successor() {
        let mut graph = small_graph();
        let input = graph.input(vec![2]);
        let first = graph.relu(input).unwrap();
        let second = graph.relu(first).unwrap();
        graph
            .set_input(input, 0, &Tensor::from_values(vec![2], vec![1.0, -1.0]).unwrap())
            .unwrap();
        graph.forward(first, 1).unwrap();
        graph.forward(second, 1).unwrap();
        graph
            .with_prediction(second, 0, |_, sensitivity| sensitivity.fill(3.0))
            .unwrap();
        graph.backward(second, 1).unwrap();
        graph.backward(first, 1).unwrap();
        assert_eq!(
            graph.output_sensitivity(first, 0).unwrap().values,
            vec![3.0, 0.0]
        );
        assert_eq!(
            graph.node(first).unwrap().input_sensitivity(0).values,
            vec![3.0, 0.0]
        );
    }

    #[test]
    fn test_relink_keeps_former_partner_pointers() {
        let mut graph = small_graph();
        let a = graph.input(vec![2]);
        let x = graph.relu(a).unwrap();
        let b = graph.input(vec![2]);
        graph.link(b, x).unwrap();
        assert_eq!(graph.node(x).unwrap().previous(), Some(b));
        // `a` still points at `x` until it is linked elsewhere
        assert_eq!(graph.node(a).unwrap().next(), Some(x));
        graph.link(a, x).unwrap();
        assert_eq!(graph.node(x).unwrap().previous(), Some(a));
    }

    #[test]
    fn test_bias_node_updates_its_offsets() {
        let mut graph = small_graph();
        let input = graph.input(vec![3]);
        let bias = graph.bias(input).unwrap();
        assert!(matches!(graph.node(bias).unwrap().layer(), Layer::Bias(_)));
        assert_eq!(graph.node(bias).unwrap().params().sizes, vec![3]);

        for lane in 0..2 {
            graph.set_input(input, lane, &Tensor::zeros(vec![3])).unwrap();
        }
        graph.forward(bias, 2).unwrap();
        let before = graph.node(bias).unwrap().params().clone();
        assert_eq!(graph.node(bias).unwrap().output(1), &before);
        for lane in 0..2 {
            graph
                .with_prediction(bias, lane, |_, sensitivity| sensitivity.fill(1.0))
                .unwrap();
        }
        graph.backward_from_loss(bias, 2).unwrap();
        graph.update(bias, 2, 0.01).unwrap();

        let node = graph.node(bias).unwrap();
        assert!(node.optimizer_state().is_some());
        for (after, before) in node.params().values.iter().zip(before.values.iter()) {
            assert!(after < before);
        }
        assert_eq!(node.params_sensitivity(0).error(), 0.0);
    }

    #[test]
    fn test_invalid_layer_is_not_added() {
        let mut graph = small_graph();
        let input = graph.input(vec![2, 2, 1]);
        assert!(matches!(
            graph.convolution_2d(input, [3, 3], 1, 1),
            Err(GraphError::InvalidLayer { .. })
        ));
        assert_eq!(graph.len(), 1);
        assert_eq!(format!("{}", NodeId(4)), "#4");
    }
}
