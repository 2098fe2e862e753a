//! Fully connected layer

use rand::Rng;
use rayon::prelude::*;

use super::{Backward, Built, Forward, Kernel};
use crate::{graph::GraphError, tensor::Tensor};

/// `output[o] = sum_i input[i] * W[o, i] + b[o]`
///
/// Parameters are stored row by row, `input_size + 1` values per output unit with the
/// bias in the last column.
#[derive(Debug, Clone)]
pub struct Linear {
    input_size: usize,
}

impl Linear {
    pub fn build<R: Rng + ?Sized>(
        input_sizes: &[usize],
        output_sizes: Vec<usize>,
        rng: &mut R,
    ) -> Result<Built, GraphError> {
        let input_size: usize = input_sizes.iter().product();
        let output_size: usize = output_sizes.iter().product();
        if input_size == 0 || output_size == 0 {
            return Err(GraphError::invalid("Linear", "input and output must not be empty"));
        }

        let mut params = Tensor::random_normal(vec![input_size + 1, output_size], rng);
        params *= 1.0 / (input_size as f32).sqrt();
        Ok(Built {
            layer: Self { input_size }.into(),
            output_sizes,
            params,
        })
    }
}

impl Kernel for Linear {
    fn name(&self) -> &'static str {
        "Linear"
    }

    fn forward(&mut self, pass: Forward<'_>) {
        let Forward {
            batch_size,
            input,
            params,
            output,
            ..
        } = pass;
        let n = self.input_size;
        output[..batch_size]
            .par_iter_mut()
            .zip(input[..batch_size].par_iter())
            .for_each(|(o, i)| {
                for (o, row) in o.values.iter_mut().zip(params.values.chunks_exact(n + 1)) {
                    let linear: f32 = row[..n]
                        .iter()
                        .zip(i.values.iter())
                        .map(|(w, x)| w * x)
                        .sum();
                    *o = linear + row[n];
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
        let n = self.input_size;
        input_sensitivity[..batch_size]
            .par_iter_mut()
            .zip(params_sensitivity[..batch_size].par_iter_mut())
            .zip(input[..batch_size].par_iter())
            .zip(output_sensitivity[..batch_size].par_iter())
            .for_each(|(((is, ps), i), os)| {
                is.fill(0.0);
                for ((row, ps_row), &g) in params
                    .values
                    .chunks_exact(n + 1)
                    .zip(ps.values.chunks_exact_mut(n + 1))
                    .zip(os.values.iter())
                {
                    for k in 0..n {
                        ps_row[k] += i.values[k] * g;
                        is.values[k] += row[k] * g;
                    }
                    ps_row[n] += g;
                }
            });
    }
}
