//! Element-wise activations

use rayon::prelude::*;

use super::{Backward, Forward, Kernel};

/// Slope of [`LeakyRelu`] for negative inputs
pub const LEAKY_RELU_SLOPE: f32 = 0.2;

fn forward_elementwise(pass: Forward<'_>, f: impl Fn(f32) -> f32 + Sync) {
    let Forward {
        batch_size,
        input,
        output,
        ..
    } = pass;
    output[..batch_size]
        .par_iter_mut()
        .zip(input[..batch_size].par_iter())
        .for_each(|(o, i)| {
            for (o, i) in o.values.iter_mut().zip(i.values.iter()) {
                *o = f(*i);
            }
        });
}

/// `IS = df(I, O) * OS`, the local derivative taking the input and output values
fn backward_elementwise(pass: Backward<'_>, df: impl Fn(f32, f32) -> f32 + Sync) {
    let Backward {
        batch_size,
        input,
        output,
        output_sensitivity,
        input_sensitivity,
        ..
    } = pass;
    input_sensitivity[..batch_size]
        .par_iter_mut()
        .zip(input[..batch_size].par_iter())
        .zip(output[..batch_size].par_iter())
        .zip(output_sensitivity[..batch_size].par_iter())
        .for_each(|(((is, i), o), os)| {
            for (k, is) in is.values.iter_mut().enumerate() {
                *is = df(i.values[k], o.values[k]) * os.values[k];
            }
        });
}

#[derive(Debug, Clone, Default)]
pub struct Relu;

impl Kernel for Relu {
    fn name(&self) -> &'static str {
        "Relu"
    }

    fn forward(&mut self, pass: Forward<'_>) {
        forward_elementwise(pass, |x| if x > 0.0 { x } else { 0.0 });
    }

    fn backward(&mut self, pass: Backward<'_>) {
        backward_elementwise(pass, |x, _| if x > 0.0 { 1.0 } else { 0.0 });
    }
}

#[derive(Debug, Clone, Default)]
pub struct LeakyRelu;

impl Kernel for LeakyRelu {
    fn name(&self) -> &'static str {
        "LeakyRelu"
    }

    fn forward(&mut self, pass: Forward<'_>) {
        forward_elementwise(pass, |x| if x > 0.0 { x } else { LEAKY_RELU_SLOPE * x });
    }

    fn backward(&mut self, pass: Backward<'_>) {
        backward_elementwise(pass, |x, _| if x > 0.0 { 1.0 } else { LEAKY_RELU_SLOPE });
    }
}

#[derive(Debug, Clone, Default)]
pub struct Sigmoid;

impl Kernel for Sigmoid {
    fn name(&self) -> &'static str {
        "Sigmoid"
    }

    fn forward(&mut self, pass: Forward<'_>) {
        forward_elementwise(pass, |x| 1.0 / (1.0 + (-x).exp()));
    }

    fn backward(&mut self, pass: Backward<'_>) {
        backward_elementwise(pass, |_, y| y * (1.0 - y));
    }
}

#[derive(Debug, Clone, Default)]
pub struct Tanh;

impl Kernel for Tanh {
    fn name(&self) -> &'static str {
        "Tanh"
    }

    fn forward(&mut self, pass: Forward<'_>) {
        forward_elementwise(pass, f32::tanh);
    }

    fn backward(&mut self, pass: Backward<'_>) {
        backward_elementwise(pass, |_, y| 1.0 - y * y);
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        assert_eq_float,
        layers::{
            Built, Layer,
            tests::{Harness, lanes_of},
        },
        tensor::Tensor,
    };

    use super::*;

    fn harness(layer: impl Into<Layer>, values: Vec<f32>) -> Harness {
        let n = values.len();
        let input = Tensor::from_values(vec![n], values).unwrap();
        Harness::new(Built::stateless(layer, vec![n]), vec![input])
    }

    #[test]
    fn test_relu() {
        let mut h = harness(Relu, vec![-1.0, 0.0, 2.0]);
        h.forward();
        assert_eq!(h.outputs[0].values, vec![0.0, 0.0, 2.0]);
        let os = Tensor::from_values(vec![3], vec![5.0, 5.0, 5.0]).unwrap();
        h.backward(&[os]);
        // gradient gated by the input sign
        assert_eq!(h.input_sensitivity[0].values, vec![0.0, 0.0, 5.0]);
    }

    #[test]
    fn test_leaky_relu() {
        let mut h = harness(LeakyRelu, vec![-1.0, 3.0]);
        h.forward();
        assert_eq_float!(h.outputs[0][0], -0.2);
        assert_eq!(h.outputs[0][1], 3.0);
        let os = Tensor::from_values(vec![2], vec![1.0, 1.0]).unwrap();
        h.backward(&[os]);
        assert_eq_float!(h.input_sensitivity[0][0], 0.2);
        assert_eq!(h.input_sensitivity[0][1], 1.0);
    }

    #[test]
    fn test_sigmoid_and_tanh_values() {
        let mut h = harness(Sigmoid, vec![0.0, 2.0]);
        h.forward();
        assert_eq_float!(h.outputs[0][0], 0.5);
        assert_eq_float!(h.outputs[0][1], 0.880797);

        let mut h = harness(Tanh, vec![0.0, 1.0]);
        h.forward();
        assert_eq_float!(h.outputs[0][0], 0.0);
        assert_eq_float!(h.outputs[0][1], 0.7615942);
    }

    #[test]
    fn test_smooth_activation_gradients() {
        for layer in [Layer::from(Sigmoid), Tanh.into()] {
            let inputs = lanes_of(&[4, 3], 2, 11);
            let mut h = Harness::new(Built::stateless(layer, vec![4, 3]), inputs);
            h.check_gradients(5);
        }
    }

    #[test]
    fn test_piecewise_activation_gradients() {
        for layer in [Layer::from(Relu), LeakyRelu.into()] {
            // keep every input clear of the kink at zero
            let mut inputs = lanes_of(&[6], 2, 12);
            for lane in inputs.iter_mut() {
                for v in lane.values.iter_mut() {
                    *v = v.signum() * (0.1 + v.abs());
                }
            }
            let mut h = Harness::new(Built::stateless(layer, vec![6]), inputs);
            h.check_gradients(6);
        }
    }
}
