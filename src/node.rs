//! A single stage of the pipeline: one layer plus its per-lane buffers

use rand_pcg::Pcg64Mcg;

use crate::{
    graph::NodeId,
    layers::{Backward, Built, Forward, Kernel, Layer},
    optim::{AdamConfig, AdamState},
    tensor::Tensor,
};

/// Owns a layer's parameters, its per-lane outputs and sensitivities
///
/// The input of a node is the `outputs` of its `previous` node and its output sensitivity
/// is the `input_sensitivity` of its `next` node, both resolved by the [`crate::graph::Graph`].
/// A node with no successor reads its output sensitivity from its own terminal buffer,
/// written by the loss function.
#[derive(Debug, Clone)]
pub struct Node {
    layer: Layer,
    params: Tensor,
    outputs: Vec<Tensor>,
    input_sensitivity: Vec<Tensor>,
    params_sensitivity: Vec<Tensor>,
    terminal_sensitivity: Vec<Tensor>,
    input_sizes: Vec<usize>,
    output_sizes: Vec<usize>,
    pub(crate) previous: Option<NodeId>,
    pub(crate) next: Option<NodeId>,
    locked: bool,
    optimizer: Option<AdamState>,
}

impl Node {
    pub fn new(built: Built, input_sizes: Vec<usize>, lanes: usize) -> Self {
        let Built {
            layer,
            output_sizes,
            params,
        } = built;
        Self {
            outputs: vec![Tensor::zeros(output_sizes.clone()); lanes],
            input_sensitivity: vec![Tensor::zeros(input_sizes.clone()); lanes],
            params_sensitivity: vec![Tensor::zeros(params.sizes.clone()); lanes],
            terminal_sensitivity: vec![Tensor::zeros(output_sizes.clone()); lanes],
            layer,
            params,
            input_sizes,
            output_sizes,
            previous: None,
            next: None,
            locked: false,
            optimizer: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.layer.name()
    }

    pub fn layer(&self) -> &Layer {
        &self.layer
    }

    pub fn is_input(&self) -> bool {
        matches!(self.layer, Layer::Input(_))
    }

    pub fn params(&self) -> &Tensor {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut Tensor {
        &mut self.params
    }

    pub fn lanes(&self) -> usize {
        self.outputs.len()
    }

    pub fn output(&self, lane: usize) -> &Tensor {
        &self.outputs[lane]
    }

    pub fn outputs(&self) -> &[Tensor] {
        &self.outputs
    }

    pub(crate) fn output_mut(&mut self, lane: usize) -> &mut Tensor {
        &mut self.outputs[lane]
    }

    pub fn input_sensitivity(&self, lane: usize) -> &Tensor {
        &self.input_sensitivity[lane]
    }

    pub(crate) fn input_sensitivities(&self) -> &[Tensor] {
        &self.input_sensitivity
    }

    pub fn params_sensitivity(&self, lane: usize) -> &Tensor {
        &self.params_sensitivity[lane]
    }

    pub(crate) fn terminal_sensitivity(&self, lane: usize) -> &Tensor {
        &self.terminal_sensitivity[lane]
    }

    /// Prediction of one lane alongside the terminal buffer the loss writes into
    pub(crate) fn prediction_mut(&mut self, lane: usize) -> (&Tensor, &mut Tensor) {
        (&self.outputs[lane], &mut self.terminal_sensitivity[lane])
    }

    pub fn input_sizes(&self) -> &[usize] {
        &self.input_sizes
    }

    pub fn output_sizes(&self) -> &[usize] {
        &self.output_sizes
    }

    pub fn previous(&self) -> Option<NodeId> {
        self.previous
    }

    pub fn next(&self) -> Option<NodeId> {
        self.next
    }

    pub fn optimizer_state(&self) -> Option<&AdamState> {
        self.optimizer.as_ref()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Freezes the parameters: [`Node::update`] becomes a no-op
    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn unlock(&mut self) {
        self.locked = false;
    }

    /// Zeroes every sensitivity buffer, leaving parameters and optimizer state alone
    pub fn clear(&mut self) {
        for t in self
            .input_sensitivity
            .iter_mut()
            .chain(self.params_sensitivity.iter_mut())
            .chain(self.terminal_sensitivity.iter_mut())
        {
            t.fill(0.0);
        }
    }

    pub(crate) fn forward(&mut self, input: &[Tensor], batch_size: usize, rng: &mut Pcg64Mcg) {
        self.layer.forward(Forward {
            batch_size,
            input,
            params: &self.params,
            output: &mut self.outputs,
            rng,
        });
    }

    /// Runs the layer backward, reading the terminal buffer when no sensitivity is given
    pub(crate) fn backward(
        &mut self,
        input: &[Tensor],
        output_sensitivity: Option<&[Tensor]>,
        batch_size: usize,
    ) {
        let Self {
            layer,
            params,
            outputs,
            input_sensitivity,
            params_sensitivity,
            terminal_sensitivity,
            ..
        } = self;
        let output_sensitivity = output_sensitivity.unwrap_or(&terminal_sensitivity[..]);
        layer.backward(Backward {
            batch_size,
            input,
            output: &outputs[..],
            output_sensitivity,
            params,
            input_sensitivity,
            params_sensitivity,
        });
    }

    /// Applies one optimizer step from the lane-summed parameter sensitivity
    ///
    /// Skipped entirely when locked. Every lane's accumulator is zeroed afterwards.
    pub fn update(&mut self, batch_size: usize, lambda: f32, config: &AdamConfig) {
        if self.locked || self.params.is_empty() {
            return;
        }
        let mut gradient = Tensor::zeros(self.params.sizes.clone());
        for lane in &self.params_sensitivity[..batch_size] {
            gradient += lane;
        }
        let state = self
            .optimizer
            .get_or_insert_with(|| AdamState::new(&self.params, config));
        state.step(config, &mut self.params, &gradient, lambda);
        for lane in self.params_sensitivity.iter_mut() {
            lane.fill(0.0);
        }
        if self.params.values.iter().any(|p| !p.is_finite()) {
            log::warn!("{} parameters are no longer finite", self.name());
        }
    }

    /// Values contributed to a parameter file: params, squared-gradient average, momentum
    pub fn serialized_len(&self) -> usize {
        3 * self.params.len()
    }

    /// Appends the node state, substituting a fresh optimizer state when none exists yet
    pub fn write_params(&self, out: &mut Vec<f32>, config: &AdamConfig) {
        out.extend_from_slice(&self.params.values);
        match &self.optimizer {
            Some(state) => {
                out.extend_from_slice(&state.smoothed_squared_gradient.values);
                out.extend_from_slice(&state.momentum.values);
            }
            None => {
                let state = AdamState::new(&self.params, config);
                out.extend_from_slice(&state.smoothed_squared_gradient.values);
                out.extend_from_slice(&state.momentum.values);
            }
        }
    }

    /// Restores the node state from the front of `values`, returning how many were read
    ///
    /// `values` must hold at least [`Node::serialized_len`] entries.
    pub fn read_params(&mut self, values: &[f32], config: &AdamConfig) -> usize {
        let n = self.params.len();
        if n == 0 {
            return 0;
        }
        self.params.values.copy_from_slice(&values[..n]);
        let mut state = AdamState::new(&self.params, config);
        state
            .smoothed_squared_gradient
            .values
            .copy_from_slice(&values[n..2 * n]);
        state.momentum.values.copy_from_slice(&values[2 * n..3 * n]);
        self.optimizer = Some(state);
        3 * n
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use crate::{assert_eq_float, layers::Linear};

    use super::*;

    fn linear_node(lanes: usize) -> Node {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        Node::new(Linear::build(&[2], vec![1], &mut rng).unwrap(), vec![2], lanes)
    }

    #[test]
    fn test_node_buffers() {
        let node = linear_node(4);
        assert_eq!(node.name(), "Linear");
        assert_eq!(node.lanes(), 4);
        assert_eq!(node.output(3).sizes, vec![1]);
        assert_eq!(node.input_sensitivity(3).sizes, vec![2]);
        assert_eq!(node.params_sensitivity(0).sizes, vec![3, 1]);
        assert!(node.optimizer_state().is_none());
        assert_eq!(node.serialized_len(), 9);
    }

    #[test]
    fn test_update_sums_lanes_and_zeroes_accumulators() {
        let mut node = linear_node(3);
        node.params.values = vec![0.0; 3];
        node.params_sensitivity[0].values = vec![1.0, 0.0, 0.0];
        node.params_sensitivity[1].values = vec![1.0, 0.0, 0.0];
        // lane 2 lies outside the batch
        node.params_sensitivity[2].values = vec![0.0, 5.0, 0.0];
        let config = AdamConfig::default();
        node.update(2, 0.1, &config);

        // g = 2, s = 0.4
        assert_eq_float!(node.params[0], -0.2 / (0.4f32.sqrt() + 1e-4), 1e-5);
        assert_eq!(node.params[1], 0.0);
        assert!(
            node.params_sensitivity
                .iter()
                .all(|t| t.values.iter().all(|v| *v == 0.0))
        );
        assert_eq_float!(
            node.optimizer_state().unwrap().smoothed_squared_gradient[0],
            0.4
        );
    }

    #[test]
    fn test_locked_node_does_not_update() {
        let mut node = linear_node(1);
        let before = node.params.clone();
        node.params_sensitivity[0].fill(1.0);
        node.lock();
        node.update(1, 1.0, &AdamConfig::default());
        assert_eq!(node.params, before);
        assert!(node.optimizer_state().is_none());

        node.unlock();
        node.update(1, 1.0, &AdamConfig::default());
        assert_ne!(node.params, before);
    }

    #[test]
    fn test_clear_zeroes_sensitivities() {
        let mut node = linear_node(2);
        node.input_sensitivity[1].fill(2.0);
        node.params_sensitivity[0].fill(3.0);
        node.terminal_sensitivity[1].fill(4.0);
        let params = node.params.clone();
        node.clear();
        assert!(node.input_sensitivity(1).values.iter().all(|v| *v == 0.0));
        assert!(node.params_sensitivity(0).values.iter().all(|v| *v == 0.0));
        assert!(node.terminal_sensitivity(1).values.iter().all(|v| *v == 0.0));
        assert_eq!(node.params, params);
    }

    #[test]
    fn test_write_then_read_params() {
        let config = AdamConfig::default();
        let mut node = linear_node(1);
        node.params_sensitivity[0].fill(1.0);
        node.update(1, 0.5, &config);
        let mut values = Vec::new();
        node.write_params(&mut values, &config);
        assert_eq!(values.len(), node.serialized_len());

        let mut other = linear_node(1);
        other.params.fill(0.0);
        assert_eq!(other.read_params(&values, &config), 9);
        assert_eq!(other.params, node.params);
        assert_eq!(other.optimizer_state(), node.optimizer_state());
    }
}
