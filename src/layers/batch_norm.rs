//! Per-element normalisation across the active lanes

use rayon::prelude::*;

use super::{Backward, Forward, Kernel};
use crate::tensor::Tensor;

/// Added to the variance before taking the inverse deviation
pub const BATCH_NORM_EPSILON: f32 = 1e-2;

/// Normalises every element position to zero mean and unit variance over the batch
///
/// The backward pass only scales the sensitivity by the stored inverse deviation, it does
/// not propagate through the batch statistics.
#[derive(Debug, Clone)]
pub struct BatchNormalization {
    mean: Tensor,
    inv_dev: Tensor,
}

impl BatchNormalization {
    pub fn new(sizes: &[usize]) -> Self {
        Self {
            mean: Tensor::zeros(sizes.to_vec()),
            inv_dev: Tensor::zeros(sizes.to_vec()),
        }
    }

    pub fn inv_dev(&self) -> &Tensor {
        &self.inv_dev
    }
}

impl Kernel for BatchNormalization {
    fn name(&self) -> &'static str {
        "BatchNormalization"
    }

    fn forward(&mut self, pass: Forward<'_>) {
        let Forward {
            batch_size,
            input,
            output,
            ..
        } = pass;
        if batch_size == 0 {
            return;
        }
        let n = batch_size as f32;
        self.mean.fill(0.0);
        self.inv_dev.fill(0.0);
        for lane in &input[..batch_size] {
            for (m, (v, x)) in self
                .mean
                .values
                .iter_mut()
                .zip(self.inv_dev.values.iter_mut().zip(lane.values.iter()))
            {
                *m += x;
                *v += x * x;
            }
        }
        for (m, v) in self.mean.values.iter_mut().zip(self.inv_dev.values.iter_mut()) {
            *m /= n;
            let variance = (*v / n - *m * *m).max(0.0);
            *v = 1.0 / (variance + BATCH_NORM_EPSILON).sqrt();
        }

        let (mean, inv_dev) = (&self.mean, &self.inv_dev);
        output[..batch_size]
            .par_iter_mut()
            .zip(input[..batch_size].par_iter())
            .for_each(|(o, i)| {
                for (k, o) in o.values.iter_mut().enumerate() {
                    *o = (i.values[k] - mean.values[k]) * inv_dev.values[k];
                }
            });
    }

    fn backward(&mut self, pass: Backward<'_>) {
        let Backward {
            batch_size,
            output_sensitivity,
            input_sensitivity,
            ..
        } = pass;
        let inv_dev = &self.inv_dev;
        input_sensitivity[..batch_size]
            .par_iter_mut()
            .zip(output_sensitivity[..batch_size].par_iter())
            .for_each(|(is, os)| {
                for (k, is) in is.values.iter_mut().enumerate() {
                    *is = inv_dev.values[k] * os.values[k];
                }
            });
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        assert_eq_float,
        layers::{Built, Layer, tests::Harness},
    };

    use super::*;

    fn harness(lanes: &[[f32; 2]]) -> Harness {
        let inputs = lanes
            .iter()
            .map(|v| Tensor::from_values(vec![2], v.to_vec()).unwrap())
            .collect();
        Harness::new(
            Built::stateless(BatchNormalization::new(&[2]), vec![2]),
            inputs,
        )
    }

    #[test]
    fn test_batch_norm_normalises_each_position() {
        let mut h = harness(&[[1.0, 10.0], [3.0, 10.0], [5.0, 10.0], [7.0, 10.0]]);
        h.forward();
        let column: Vec<f32> = h.outputs.iter().map(|o| o[0]).collect();
        let mean: f32 = column.iter().sum::<f32>() / 4.0;
        assert_eq_float!(mean, 0.0);
        // variance 5, so inv_dev = 1 / sqrt(5.01)
        assert_eq_float!(h.outputs[0][0], -3.0 / 5.01f32.sqrt(), 1e-5);
        let Layer::BatchNormalization(layer) = &h.layer else {
            panic!("expected a batch normalization layer");
        };
        assert_eq_float!(layer.inv_dev()[0], 1.0 / 5.01f32.sqrt(), 1e-6);
        // a constant position maps to zero
        for o in &h.outputs {
            assert_eq_float!(o[1], 0.0);
        }
    }

    #[test]
    fn test_batch_norm_backward_scales_by_inv_dev() {
        let mut h = harness(&[[0.0, 1.0], [2.0, 1.0]]);
        h.forward();
        let os = vec![Tensor::from_values(vec![2], vec![1.0, 1.0]).unwrap(); 2];
        h.backward(&os);
        let inv_dev = 1.0 / (1.0f32 + BATCH_NORM_EPSILON).sqrt();
        for is in &h.input_sensitivity {
            assert_eq_float!(is[0], inv_dev, 1e-6);
            assert_eq_float!(is[1], 1.0 / BATCH_NORM_EPSILON.sqrt(), 1e-4);
        }
    }

    #[test]
    fn test_batch_norm_only_uses_active_lanes() {
        let mut h = harness(&[[1.0, 0.0], [3.0, 0.0], [100.0, 0.0]]);
        h.layer.forward(Forward {
            batch_size: 2,
            input: &h.inputs,
            params: &h.params,
            output: &mut h.outputs,
            rng: &mut h.rng,
        });
        assert!(h.outputs[0][0] < 0.0 && h.outputs[1][0] > 0.0);
        assert_eq_float!(h.outputs[0][0], -h.outputs[1][0]);
        // lanes past the batch stay untouched
        assert_eq!(h.outputs[2].values, vec![0.0, 0.0]);
    }
}
