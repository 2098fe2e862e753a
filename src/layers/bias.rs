//! Learned per-element offset

use rand::Rng;
use rayon::prelude::*;

use super::{Backward, Built, Forward, Kernel};
use crate::{graph::GraphError, tensor::Tensor};

/// `output[i] = input[i] + b[i]` with one parameter per input element
#[derive(Debug, Clone)]
pub struct Bias;

impl Bias {
    pub fn build<R: Rng + ?Sized>(input_sizes: &[usize], rng: &mut R) -> Result<Built, GraphError> {
        if input_sizes.iter().product::<usize>() == 0 {
            return Err(GraphError::invalid("Bias", "input must not be empty"));
        }
        Ok(Built {
            layer: Bias.into(),
            output_sizes: input_sizes.to_vec(),
            params: Tensor::random_normal(input_sizes.to_vec(), rng),
        })
    }
}

impl Kernel for Bias {
    fn name(&self) -> &'static str {
        "Bias"
    }

    fn forward(&mut self, pass: Forward<'_>) {
        let Forward {
            batch_size,
            input,
            params,
            output,
            ..
        } = pass;
        output[..batch_size]
            .par_iter_mut()
            .zip(input[..batch_size].par_iter())
            .for_each(|(o, i)| {
                for (o, (x, b)) in o
                    .values
                    .iter_mut()
                    .zip(i.values.iter().zip(params.values.iter()))
                {
                    *o = x + b;
                }
            });
    }

    fn backward(&mut self, pass: Backward<'_>) {
        let Backward {
            batch_size,
            output_sensitivity,
            input_sensitivity,
            params_sensitivity,
            ..
        } = pass;
        input_sensitivity[..batch_size]
            .par_iter_mut()
            .zip(params_sensitivity[..batch_size].par_iter_mut())
            .zip(output_sensitivity[..batch_size].par_iter())
            .for_each(|((is, ps), os)| {
                is.values.copy_from_slice(&os.values);
                *ps += os;
            });
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use crate::layers::tests::{Harness, lanes_of};

    use super::*;

    #[test]
    fn test_bias_forward_and_backward() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let mut built = Bias::build(&[3], &mut rng).unwrap();
        assert_eq!(built.params.sizes, vec![3]);
        built.params.values = vec![1.0, -2.0, 0.5];
        let input = Tensor::from_values(vec![3], vec![1.0, 1.0, 1.0]).unwrap();
        let mut h = Harness::new(built, vec![input]);
        h.forward();
        assert_eq!(h.outputs[0].values, vec![2.0, -1.0, 1.5]);

        let os = Tensor::from_values(vec![3], vec![0.5, 1.0, -1.0]).unwrap();
        h.backward(&[os.clone()]);
        h.backward(&[os]);
        assert_eq!(h.input_sensitivity[0].values, vec![0.5, 1.0, -1.0]);
        assert_eq!(h.params_sensitivity[0].values, vec![1.0, 2.0, -2.0]);
    }

    #[test]
    fn test_bias_rejects_empty() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        assert!(matches!(
            Bias::build(&[0], &mut rng),
            Err(GraphError::InvalidLayer { .. })
        ));
    }

    #[test]
    fn test_bias_gradients() {
        let mut rng = Pcg64Mcg::seed_from_u64(5);
        let built = Bias::build(&[2, 2, 2], &mut rng).unwrap();
        let mut h = Harness::new(built, lanes_of(&[2, 2, 2], 2, 6));
        h.check_gradients(7);
    }
}
