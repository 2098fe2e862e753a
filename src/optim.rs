//! Optimizer update rule applied by every node with parameters
//!
//! The rule is the ADAM family's second moment only: gradients are normalised by a
//! moving average of their squares, without bias correction. The first moment is still
//! tracked so saved parameter files keep the same layout.

use crate::tensor::Tensor;

/// Hyper-parameters of the update rule
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamConfig {
    /// decay of the (unused) first-moment average
    pub beta1: f32,
    /// decay of the squared-gradient average
    pub beta2: f32,
    pub epsilon: f32,
    /// value the squared-gradient average starts from on the first update
    pub initial_squared_gradient: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.9,
            epsilon: 1e-4,
            initial_squared_gradient: 0.0,
        }
    }
}

/// Per-node optimizer state, shaped like the node parameters
#[derive(Debug, Clone, PartialEq)]
pub struct AdamState {
    pub momentum: Tensor,
    pub smoothed_squared_gradient: Tensor,
}

impl AdamState {
    pub fn new(params: &Tensor, config: &AdamConfig) -> Self {
        let mut smoothed_squared_gradient = Tensor::zeros(params.sizes.clone());
        smoothed_squared_gradient.fill(config.initial_squared_gradient);
        Self {
            momentum: Tensor::zeros(params.sizes.clone()),
            smoothed_squared_gradient,
        }
    }

    /// Performs a single step with a gradient already reduced over the batch
    ///
    /// The gradient is not divided by the batch size: `lambda` carries that normalisation.
    pub fn step(&mut self, config: &AdamConfig, params: &mut Tensor, gradient: &Tensor, lambda: f32) {
        let AdamConfig {
            beta1,
            beta2,
            epsilon,
            ..
        } = *config;
        for (p, ((m, s), g)) in params.values.iter_mut().zip(
            self.momentum
                .values
                .iter_mut()
                .zip(self.smoothed_squared_gradient.values.iter_mut())
                .zip(gradient.values.iter()),
        ) {
            *m = beta1 * *m + (1.0 - beta1) * g;
            *s = beta2 * *s + (1.0 - beta2) * g * g;
            *p -= lambda * g / (s.sqrt() + epsilon);
        }
    }
}
