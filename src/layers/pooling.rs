//! Fixed 2x resampling layers

use rayon::prelude::*;

use super::{Backward, Built, Forward, Kernel};
use crate::{graph::GraphError, tensor::Dims};

/// 2x2 max pooling with stride 2, per channel
///
/// The backward pass hands the block sensitivity to every input cell equal to the block
/// maximum, so tied cells each receive the full value.
#[derive(Debug, Clone)]
pub struct MaxPooling {
    input: Dims,
    output: Dims,
}

impl MaxPooling {
    pub fn build(input_sizes: &[usize]) -> Result<Built, GraphError> {
        let input = Dims::of(input_sizes);
        if input.width < 2 || input.height < 2 || input.channels == 0 {
            return Err(GraphError::invalid(
                "MaxPooling",
                format!("input {}x{} is smaller than one block", input.width, input.height),
            ));
        }
        let output = Dims::new(input.width / 2, input.height / 2, input.channels);
        Ok(Built::stateless(Self { input, output }, output.sizes()))
    }

    fn block(&self, x: usize, y: usize, z: usize) -> [usize; 4] {
        let i = &self.input;
        [
            i.index(2 * x, 2 * y, z),
            i.index(2 * x + 1, 2 * y, z),
            i.index(2 * x, 2 * y + 1, z),
            i.index(2 * x + 1, 2 * y + 1, z),
        ]
    }
}

impl Kernel for MaxPooling {
    fn name(&self) -> &'static str {
        "MaxPooling"
    }

    fn forward(&mut self, pass: Forward<'_>) {
        let Forward {
            batch_size,
            input,
            output,
            ..
        } = pass;
        let this = &*self;
        output[..batch_size]
            .par_iter_mut()
            .zip(input[..batch_size].par_iter())
            .for_each(|(o, i)| {
                for z in 0..this.output.channels {
                    for y in 0..this.output.height {
                        for x in 0..this.output.width {
                            let max = this
                                .block(x, y, z)
                                .iter()
                                .map(|&k| i.values[k])
                                .fold(f32::NEG_INFINITY, f32::max);
                            o.values[this.output.index(x, y, z)] = max;
                        }
                    }
                }
            });
    }

    fn backward(&mut self, pass: Backward<'_>) {
        let Backward {
            batch_size,
            input,
            output,
            output_sensitivity,
            input_sensitivity,
            ..
        } = pass;
        let this = &*self;
        input_sensitivity[..batch_size]
            .par_iter_mut()
            .zip(input[..batch_size].par_iter())
            .zip(output[..batch_size].par_iter())
            .zip(output_sensitivity[..batch_size].par_iter())
            .for_each(|(((is, i), o), os)| {
                is.fill(0.0);
                for z in 0..this.output.channels {
                    for y in 0..this.output.height {
                        for x in 0..this.output.width {
                            let k = this.output.index(x, y, z);
                            for cell in this.block(x, y, z) {
                                if i.values[cell] == o.values[k] {
                                    is.values[cell] = os.values[k];
                                }
                            }
                        }
                    }
                }
            });
    }
}

const BILINEAR_KERNEL: [[f32; 3]; 3] = [[0.25, 0.5, 0.25], [0.5, 1.0, 0.5], [0.25, 0.5, 0.25]];

/// Doubles width and height by scattering each input value through a triangular 3x3 kernel
///
/// Each axis grows from `n` to `2n + 2` so the kernel footprint of the last cell fits.
#[derive(Debug, Clone)]
pub struct BilinearUpsampling {
    input: Dims,
    output: Dims,
}

impl BilinearUpsampling {
    pub fn build(input_sizes: &[usize]) -> Result<Built, GraphError> {
        let input = Dims::of(input_sizes);
        if input.is_empty() {
            return Err(GraphError::invalid(
                "BilinearUpsampling",
                "input must not be empty",
            ));
        }
        let output = Dims::new(2 * input.width + 2, 2 * input.height + 2, input.channels);
        Ok(Built::stateless(Self { input, output }, output.sizes()))
    }
}

impl Kernel for BilinearUpsampling {
    fn name(&self) -> &'static str {
        "BilinearUpsampling"
    }

    fn forward(&mut self, pass: Forward<'_>) {
        let Forward {
            batch_size,
            input,
            output,
            ..
        } = pass;
        let (dims_in, dims_out) = (self.input, self.output);
        output[..batch_size]
            .par_iter_mut()
            .zip(input[..batch_size].par_iter())
            .for_each(|(o, i)| {
                o.fill(0.0);
                for z in 0..dims_in.channels {
                    for y in 0..dims_in.height {
                        for x in 0..dims_in.width {
                            let v = i.values[dims_in.index(x, y, z)];
                            for (dy, row) in BILINEAR_KERNEL.iter().enumerate() {
                                for (dx, weight) in row.iter().enumerate() {
                                    o.values[dims_out.index(2 * x + dx, 2 * y + dy, z)] +=
                                        weight * v;
                                }
                            }
                        }
                    }
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
        let (dims_in, dims_out) = (self.input, self.output);
        input_sensitivity[..batch_size]
            .par_iter_mut()
            .zip(output_sensitivity[..batch_size].par_iter())
            .for_each(|(is, os)| {
                for z in 0..dims_in.channels {
                    for y in 0..dims_in.height {
                        for x in 0..dims_in.width {
                            let mut sum = 0.0f32;
                            for (dy, row) in BILINEAR_KERNEL.iter().enumerate() {
                                for (dx, weight) in row.iter().enumerate() {
                                    sum += weight
                                        * os.values[dims_out.index(2 * x + dx, 2 * y + dy, z)];
                                }
                            }
                            is.values[dims_in.index(x, y, z)] = sum;
                        }
                    }
                }
            });
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        layers::tests::{Harness, lanes_of},
        tensor::Tensor,
    };

    use super::*;

    #[test]
    fn test_max_pooling_routes_to_single_maximum() {
        let values = vec![
            1.0, 2.0, 0.5, 0.1, //
            3.0, 4.0, 0.2, 0.9, //
            5.0, 1.0, 7.0, 2.0, //
            0.0, 6.0, 8.0, 3.0,
        ];
        let input = Tensor::from_values(vec![4, 4, 1], values).unwrap();
        let mut h = Harness::new(MaxPooling::build(&[4, 4, 1]).unwrap(), vec![input]);
        h.forward();
        assert_eq!(h.outputs[0].values, vec![4.0, 0.9, 6.0, 8.0]);

        let mut os = Tensor::zeros(vec![2, 2, 1]);
        os[3] = 1.0;
        h.backward(&[os]);
        let mut expected = vec![0.0; 16];
        expected[14] = 1.0;
        assert_eq!(h.input_sensitivity[0].values, expected);
    }

    #[test]
    fn test_max_pooling_ties_route_to_every_tied_cell() {
        let input = Tensor::from_values(vec![2, 2, 1], vec![2.0, 2.0, 1.0, 2.0]).unwrap();
        let mut h = Harness::new(MaxPooling::build(&[2, 2, 1]).unwrap(), vec![input]);
        h.forward();
        h.backward(&[Tensor::from_values(vec![1, 1, 1], vec![0.5]).unwrap()]);
        assert_eq!(h.input_sensitivity[0].values, vec![0.5, 0.5, 0.0, 0.5]);
    }

    #[test]
    fn test_max_pooling_shape() {
        let built = MaxPooling::build(&[5, 4, 3]).unwrap();
        assert_eq!(built.output_sizes, vec![2, 2, 3]);
        assert!(matches!(
            MaxPooling::build(&[1, 4, 3]),
            Err(GraphError::InvalidLayer { .. })
        ));
    }

    #[test]
    fn test_bilinear_upsampling_scatter() {
        let built = BilinearUpsampling::build(&[1, 1, 1]).unwrap();
        assert_eq!(built.output_sizes, vec![4, 4, 1]);
        let input = Tensor::from_values(vec![1, 1, 1], vec![2.0]).unwrap();
        let mut h = Harness::new(built, vec![input]);
        h.forward();
        assert_eq!(
            h.outputs[0].values,
            vec![
                0.5, 1.0, 0.5, 0.0, //
                1.0, 2.0, 1.0, 0.0, //
                0.5, 1.0, 0.5, 0.0, //
                0.0, 0.0, 0.0, 0.0,
            ]
        );
    }

    #[test]
    fn test_bilinear_upsampling_gradients() {
        let built = BilinearUpsampling::build(&[3, 2, 2]).unwrap();
        let mut h = Harness::new(built, lanes_of(&[3, 2, 2], 2, 17));
        h.check_gradients(18);
    }
}
