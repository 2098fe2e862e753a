//! Valid cross-correlation over `[width, height, channels]` inputs

use rand::Rng;
use rayon::prelude::*;

use super::{Backward, Built, Forward, Kernel};
use crate::{
    graph::GraphError,
    tensor::{Dims, Tensor},
};

/// Shape shared by [`Convolution2D`] and its transpose
///
/// Filter parameters are laid out as `[filter_width, filter_height, channels, features]`,
/// so the weight for feature `f` at `(dx, dy, dz)` sits at
/// `dx + fw * (dy + fh * (dz + channels * f))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FilterBank {
    pub input: Dims,
    pub output: Dims,
    pub width: usize,
    pub height: usize,
    pub stride: usize,
}

impl FilterBank {
    pub fn weight_index(&self, dx: usize, dy: usize, dz: usize, f: usize) -> usize {
        dx + self.width * (dy + self.height * (dz + self.input.channels * f))
    }

    pub fn param_sizes(&self) -> Vec<usize> {
        vec![
            self.width,
            self.height,
            self.input.channels,
            self.output.channels,
        ]
    }

    pub fn init_params<R: Rng + ?Sized>(&self, rng: &mut R) -> Tensor {
        let mut params = Tensor::random_normal(self.param_sizes(), rng);
        params *= 1.0 / ((self.width * self.height * self.input.channels) as f32).sqrt();
        params
    }
}

pub(crate) fn validate_filter(
    layer: &'static str,
    input_sizes: &[usize],
    filter: [usize; 2],
    features: usize,
    stride: usize,
) -> Result<Dims, GraphError> {
    let input = Dims::of(input_sizes);
    if input.is_empty() {
        return Err(GraphError::invalid(layer, "input must not be empty"));
    }
    if stride == 0 {
        return Err(GraphError::invalid(layer, "stride must be positive"));
    }
    if filter[0] == 0 || filter[1] == 0 || features == 0 {
        return Err(GraphError::invalid(
            layer,
            "filter size and feature count must be positive",
        ));
    }
    Ok(input)
}

#[derive(Debug, Clone)]
pub struct Convolution2D {
    bank: FilterBank,
}

impl Convolution2D {
    /// Output size per axis is `(in - filter) / stride + 1`
    pub fn build<R: Rng + ?Sized>(
        input_sizes: &[usize],
        filter: [usize; 2],
        features: usize,
        stride: usize,
        rng: &mut R,
    ) -> Result<Built, GraphError> {
        let input = validate_filter("Convolution2D", input_sizes, filter, features, stride)?;
        if filter[0] > input.width || filter[1] > input.height {
            return Err(GraphError::invalid(
                "Convolution2D",
                format!(
                    "filter {}x{} does not fit input {}x{}",
                    filter[0], filter[1], input.width, input.height
                ),
            ));
        }
        let output = Dims::new(
            (input.width - filter[0]) / stride + 1,
            (input.height - filter[1]) / stride + 1,
            features,
        );
        let bank = FilterBank {
            input,
            output,
            width: filter[0],
            height: filter[1],
            stride,
        };
        Ok(Built {
            params: bank.init_params(rng),
            output_sizes: output.sizes(),
            layer: Self { bank }.into(),
        })
    }
}

impl Kernel for Convolution2D {
    fn name(&self) -> &'static str {
        "Convolution2D"
    }

    fn forward(&mut self, pass: Forward<'_>) {
        let Forward {
            batch_size,
            input,
            params,
            output,
            ..
        } = pass;
        let bank = self.bank;
        let w = &params.values;
        output[..batch_size]
            .par_iter_mut()
            .zip(input[..batch_size].par_iter())
            .for_each(|(o, i)| {
                for f in 0..bank.output.channels {
                    for y in 0..bank.output.height {
                        for x in 0..bank.output.width {
                            let mut sum = 0.0f32;
                            for dz in 0..bank.input.channels {
                                for dy in 0..bank.height {
                                    for dx in 0..bank.width {
                                        let ix = bank.input.index(
                                            bank.stride * x + dx,
                                            bank.stride * y + dy,
                                            dz,
                                        );
                                        sum += w[bank.weight_index(dx, dy, dz, f)] * i.values[ix];
                                    }
                                }
                            }
                            o.values[bank.output.index(x, y, f)] = sum;
                        }
                    }
                }
            });
    }

    fn backward(&mut self, pass: Backward<'_>) {
        let Backward {
            batch_size,
            input,
            output_sensitivity,
            params,
            input_sensitivity,
            params_sensitivity,
            ..
        } = pass;
        let bank = self.bank;
        let w = &params.values;
        input_sensitivity[..batch_size]
            .par_iter_mut()
            .zip(params_sensitivity[..batch_size].par_iter_mut())
            .zip(input[..batch_size].par_iter())
            .zip(output_sensitivity[..batch_size].par_iter())
            .for_each(|(((is, ps), i), os)| {
                is.fill(0.0);
                for f in 0..bank.output.channels {
                    for y in 0..bank.output.height {
                        for x in 0..bank.output.width {
                            let g = os.values[bank.output.index(x, y, f)];
                            if g == 0.0 {
                                continue;
                            }
                            for dz in 0..bank.input.channels {
                                for dy in 0..bank.height {
                                    for dx in 0..bank.width {
                                        let ix = bank.input.index(
                                            bank.stride * x + dx,
                                            bank.stride * y + dy,
                                            dz,
                                        );
                                        let k = bank.weight_index(dx, dy, dz, f);
                                        is.values[ix] += w[k] * g;
                                        ps.values[k] += i.values[ix] * g;
                                    }
                                }
                            }
                        }
                    }
                }
            });
    }
}
