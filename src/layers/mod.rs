//! Per-layer forward and backward kernels
//!
//! Every kernel works on whole lane arrays: `input[t]`, `output[t]` and the sensitivity
//! buffers are indexed by lane and only the first `batch_size` lanes are touched. Lanes
//! are independent and run on the rayon pool, except where a layer couples them
//! (batch normalization).

mod activation;
mod batch_norm;
mod bias;
mod border;
mod convolution;
mod deconvolution;
mod input;
mod linear;
mod pooling;
mod random;
mod softmax;

pub use activation::{LEAKY_RELU_SLOPE, LeakyRelu, Relu, Sigmoid, Tanh};
pub use batch_norm::{BATCH_NORM_EPSILON, BatchNormalization};
pub use bias::Bias;
pub use border::Border;
pub use convolution::Convolution2D;
pub use deconvolution::Deconvolution2D;
pub use input::Input;
pub use linear::Linear;
pub use pooling::{BilinearUpsampling, MaxPooling};
pub use random::{Dropout, Noise};
pub use softmax::{Softmax, stable_softmax};

use enum_dispatch::enum_dispatch;
use rand::Rng;
use rand_pcg::Pcg64Mcg;

use crate::tensor::Tensor;

/// Buffers handed to a forward pass
pub struct Forward<'a> {
    pub batch_size: usize,
    /// previous node outputs, empty for an input node
    pub input: &'a [Tensor],
    pub params: &'a Tensor,
    pub output: &'a mut [Tensor],
    pub rng: &'a mut Pcg64Mcg,
}

/// Buffers handed to a backward pass
pub struct Backward<'a> {
    pub batch_size: usize,
    pub input: &'a [Tensor],
    pub output: &'a [Tensor],
    pub output_sensitivity: &'a [Tensor],
    pub params: &'a Tensor,
    pub input_sensitivity: &'a mut [Tensor],
    /// per-lane accumulators, summed over calls until the next update
    pub params_sensitivity: &'a mut [Tensor],
}

/// Forward/backward contract shared by all layer kinds
#[enum_dispatch]
pub trait Kernel {
    fn name(&self) -> &'static str;
    fn forward(&mut self, pass: Forward<'_>);
    fn backward(&mut self, pass: Backward<'_>);
}

/// The closed set of layer kinds a node can hold
#[enum_dispatch(Kernel)]
#[derive(Debug, Clone)]
pub enum Layer {
    Input(Input),
    Linear(Linear),
    Bias(Bias),
    Convolution2D(Convolution2D),
    Deconvolution2D(Deconvolution2D),
    BatchNormalization(BatchNormalization),
    MaxPooling(MaxPooling),
    BilinearUpsampling(BilinearUpsampling),
    Border(Border),
    Dropout(Dropout),
    Noise(Noise),
    Relu(Relu),
    LeakyRelu(LeakyRelu),
    Sigmoid(Sigmoid),
    Tanh(Tanh),
    Softmax(Softmax),
}

/// A freshly constructed layer with its output shape and initial parameters
#[derive(Debug)]
pub struct Built {
    pub layer: Layer,
    pub output_sizes: Vec<usize>,
    pub params: Tensor,
}

impl Built {
    pub(crate) fn stateless(layer: impl Into<Layer>, output_sizes: Vec<usize>) -> Self {
        Self {
            layer: layer.into(),
            output_sizes,
            params: no_params(),
        }
    }
}

pub(crate) fn no_params() -> Tensor {
    Tensor::zeros(vec![0])
}

/// One seed per active lane, drawn in lane order so results do not depend on scheduling
pub(crate) fn lane_seeds(rng: &mut Pcg64Mcg, batch_size: usize) -> Vec<u64> {
    (0..batch_size).map(|_| rng.random::<u64>()).collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use rand::SeedableRng;

    use super::*;

    /// Runs one kernel outside of a graph on `inputs.len()` lanes
    pub(crate) struct Harness {
        pub layer: Layer,
        pub params: Tensor,
        pub inputs: Vec<Tensor>,
        pub outputs: Vec<Tensor>,
        pub input_sensitivity: Vec<Tensor>,
        pub params_sensitivity: Vec<Tensor>,
        pub rng: Pcg64Mcg,
    }

    impl Harness {
        pub fn new(built: Built, inputs: Vec<Tensor>) -> Self {
            let lanes = inputs.len();
            let input_sizes = inputs[0].sizes.clone();
            Self {
                outputs: vec![Tensor::zeros(built.output_sizes); lanes],
                input_sensitivity: vec![Tensor::zeros(input_sizes); lanes],
                params_sensitivity: vec![Tensor::zeros(built.params.sizes.clone()); lanes],
                layer: built.layer,
                params: built.params,
                inputs,
                rng: Pcg64Mcg::seed_from_u64(3),
            }
        }

        pub fn forward(&mut self) {
            let batch_size = self.inputs.len();
            self.layer.forward(Forward {
                batch_size,
                input: &self.inputs,
                params: &self.params,
                output: &mut self.outputs,
                rng: &mut self.rng,
            });
        }

        pub fn backward(&mut self, output_sensitivity: &[Tensor]) {
            let batch_size = self.inputs.len();
            self.layer.backward(Backward {
                batch_size,
                input: &self.inputs,
                output: &self.outputs,
                output_sensitivity,
                params: &self.params,
                input_sensitivity: &mut self.input_sensitivity,
                params_sensitivity: &mut self.params_sensitivity,
            });
        }

        /// `sum(weights * output)` on lane 0 after a forward pass
        pub fn objective(&mut self, weights: &Tensor) -> f32 {
            self.forward();
            self.outputs[0]
                .values
                .iter()
                .zip(weights.values.iter())
                .map(|(o, w)| o * w)
                .sum()
        }

        /// Compares input and parameter sensitivities of lane 0 with central differences
        pub fn check_gradients(&mut self, seed: u64) {
            let mut rng = Pcg64Mcg::seed_from_u64(seed);
            let weights = Tensor::random_normal(self.outputs[0].sizes.clone(), &mut rng);
            self.forward();
            let sensitivity = vec![weights.clone(); self.inputs.len()];
            for lane in self.params_sensitivity.iter_mut() {
                lane.fill(0.0);
            }
            self.backward(&sensitivity);

            let h = 5e-3;
            for i in 0..self.inputs[0].len() {
                let original = self.inputs[0][i];
                self.inputs[0][i] = original + h;
                let plus = self.objective(&weights);
                self.inputs[0][i] = original - h;
                let minus = self.objective(&weights);
                self.inputs[0][i] = original;
                let numeric = (plus - minus) / (2.0 * h);
                let analytic = self.input_sensitivity[0][i];
                assert!(
                    (numeric - analytic).abs() <= 2e-3 * (1.0 + analytic.abs()),
                    "{}: input {} analytic {} numeric {}",
                    self.layer.name(),
                    i,
                    analytic,
                    numeric
                );
            }

            // with every lane fed the same sensitivity, lane 0 alone holds its own share
            for p in 0..self.params.len() {
                let original = self.params[p];
                self.params[p] = original + h;
                let plus = self.objective(&weights);
                self.params[p] = original - h;
                let minus = self.objective(&weights);
                self.params[p] = original;
                let numeric = (plus - minus) / (2.0 * h);
                let analytic = self.params_sensitivity[0][p];
                assert!(
                    (numeric - analytic).abs() <= 2e-3 * (1.0 + analytic.abs()),
                    "{}: param {} analytic {} numeric {}",
                    self.layer.name(),
                    p,
                    analytic,
                    numeric
                );
            }
        }
    }

    pub(crate) fn lanes_of(sizes: &[usize], lanes: usize, seed: u64) -> Vec<Tensor> {
        let mut rng = Pcg64Mcg::seed_from_u64(seed);
        (0..lanes)
            .map(|_| Tensor::random_normal(sizes.to_vec(), &mut rng))
            .collect()
    }
}
