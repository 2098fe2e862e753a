//! Transposed convolution

use rand::Rng;
use rayon::prelude::*;

use super::{
    Backward, Built, Forward, Kernel,
    convolution::{FilterBank, validate_filter},
};
use crate::{graph::GraphError, tensor::Dims};

/// Scatters every input value, weighted by the filter, into overlapping output cells
///
/// Uses the same parameter layout as [`super::Convolution2D`], so a deconvolution built
/// on the output shape of a convolution is its adjoint.
#[derive(Debug, Clone)]
pub struct Deconvolution2D {
    bank: FilterBank,
}

impl Deconvolution2D {
    /// Output size per axis is `(in - 1) * stride + filter`
    pub fn build<R: Rng + ?Sized>(
        input_sizes: &[usize],
        filter: [usize; 2],
        features: usize,
        stride: usize,
        rng: &mut R,
    ) -> Result<Built, GraphError> {
        let input = validate_filter("Deconvolution2D", input_sizes, filter, features, stride)?;
        let output = Dims::new(
            (input.width - 1) * stride + filter[0],
            (input.height - 1) * stride + filter[1],
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

impl Kernel for Deconvolution2D {
    fn name(&self) -> &'static str {
        "Deconvolution2D"
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
                o.fill(0.0);
                for dz in 0..bank.input.channels {
                    for y in 0..bank.input.height {
                        for x in 0..bank.input.width {
                            let v = i.values[bank.input.index(x, y, dz)];
                            for f in 0..bank.output.channels {
                                for dy in 0..bank.height {
                                    for dx in 0..bank.width {
                                        let ox = bank.output.index(
                                            bank.stride * x + dx,
                                            bank.stride * y + dy,
                                            f,
                                        );
                                        o.values[ox] += w[bank.weight_index(dx, dy, dz, f)] * v;
                                    }
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
                for dz in 0..bank.input.channels {
                    for y in 0..bank.input.height {
                        for x in 0..bank.input.width {
                            let ix = bank.input.index(x, y, dz);
                            let v = i.values[ix];
                            let mut sum = 0.0f32;
                            for f in 0..bank.output.channels {
                                for dy in 0..bank.height {
                                    for dx in 0..bank.width {
                                        let g = os.values[bank.output.index(
                                            bank.stride * x + dx,
                                            bank.stride * y + dy,
                                            f,
                                        )];
                                        let k = bank.weight_index(dx, dy, dz, f);
                                        sum += w[k] * g;
                                        ps.values[k] += v * g;
                                    }
                                }
                            }
                            is.values[ix] = sum;
                        }
                    }
                }
            });
    }
}
