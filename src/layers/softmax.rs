//! Lane-wise probability normalisation

use rayon::prelude::*;

use super::{Backward, Forward, Kernel};

/// Writes `exp(x - max) / sum` into `output`, which must have the length of `input`
pub fn stable_softmax(input: &[f32], output: &mut [f32]) {
    let max = input.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for (o, i) in output.iter_mut().zip(input.iter()) {
        *o = (i - max).exp();
        sum += *o;
    }
    for o in output.iter_mut() {
        *o /= sum;
    }
}

#[derive(Debug, Clone, Default)]
pub struct Softmax;

impl Kernel for Softmax {
    fn name(&self) -> &'static str {
        "Softmax"
    }

    fn forward(&mut self, pass: Forward<'_>) {
        let Forward {
            batch_size,
            input,
            output,
            ..
        } = pass;
        output[..batch_size]
            .par_iter_mut()
            .zip(input[..batch_size].par_iter())
            .for_each(|(o, i)| stable_softmax(&i.values, &mut o.values));
    }

    /// `IS[i] = O[i] * (OS[i] - sum_j O[j] * OS[j])`
    fn backward(&mut self, pass: Backward<'_>) {
        let Backward {
            batch_size,
            output,
            output_sensitivity,
            input_sensitivity,
            ..
        } = pass;
        input_sensitivity[..batch_size]
            .par_iter_mut()
            .zip(output[..batch_size].par_iter())
            .zip(output_sensitivity[..batch_size].par_iter())
            .for_each(|((is, o), os)| {
                let dot: f32 = o
                    .values
                    .iter()
                    .zip(os.values.iter())
                    .map(|(o, g)| o * g)
                    .sum();
                for (k, is) in is.values.iter_mut().enumerate() {
                    *is = o.values[k] * (os.values[k] - dot);
                }
            });
    }
}
