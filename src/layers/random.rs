//! Layers drawing from the graph generator on every forward pass

use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rand_pcg::Pcg64Mcg;
use rayon::prelude::*;

use super::{Backward, Built, Forward, Kernel, lane_seeds};
use crate::{graph::GraphError, tensor::Tensor};

/// Keeps each element when a uniform draw `r` satisfies `r <= ratio`
///
/// Kept elements are scaled by `r` itself rather than by a constant, and the backward pass
/// reuses the stored per-lane mask.
#[derive(Debug, Clone)]
pub struct Dropout {
    ratio: f32,
    masks: Vec<Tensor>,
}

impl Dropout {
    pub fn build(input_sizes: &[usize], ratio: f32, lanes: usize) -> Result<Built, GraphError> {
        if !(0.0..=1.0).contains(&ratio) {
            return Err(GraphError::invalid(
                "Dropout",
                format!("ratio {} is outside [0, 1]", ratio),
            ));
        }
        Ok(Built::stateless(
            Self {
                ratio,
                masks: vec![Tensor::zeros(input_sizes.to_vec()); lanes],
            },
            input_sizes.to_vec(),
        ))
    }

    pub fn mask(&self, lane: usize) -> &Tensor {
        &self.masks[lane]
    }
}

impl Kernel for Dropout {
    fn name(&self) -> &'static str {
        "Dropout"
    }

    fn forward(&mut self, pass: Forward<'_>) {
        let Forward {
            batch_size,
            input,
            output,
            rng,
            ..
        } = pass;
        let ratio = self.ratio;
        let seeds = lane_seeds(rng, batch_size);
        self.masks[..batch_size]
            .par_iter_mut()
            .zip(output[..batch_size].par_iter_mut())
            .zip(input[..batch_size].par_iter())
            .zip(seeds.par_iter())
            .for_each(|(((mask, o), i), &seed)| {
                let mut rng = Pcg64Mcg::seed_from_u64(seed);
                for (k, m) in mask.values.iter_mut().enumerate() {
                    let r: f32 = rng.random();
                    *m = if r <= ratio { r } else { 0.0 };
                    o.values[k] = i.values[k] * *m;
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
        input_sensitivity[..batch_size]
            .par_iter_mut()
            .zip(output_sensitivity[..batch_size].par_iter())
            .zip(self.masks[..batch_size].par_iter())
            .for_each(|((is, os), mask)| {
                for (k, is) in is.values.iter_mut().enumerate() {
                    *is = os.values[k] * mask.values[k];
                }
            });
    }
}

/// Adds independent gaussian noise, identity gradient
#[derive(Debug, Clone)]
pub struct Noise {
    distribution: Normal<f32>,
}

impl Noise {
    pub fn build(input_sizes: &[usize], sigma: f32) -> Result<Built, GraphError> {
        let distribution = Normal::new(0.0, sigma)
            .map_err(|e| GraphError::invalid("Noise", format!("sigma {}: {}", sigma, e)))?;
        Ok(Built::stateless(Self { distribution }, input_sizes.to_vec()))
    }
}

impl Kernel for Noise {
    fn name(&self) -> &'static str {
        "Noise"
    }

    fn forward(&mut self, pass: Forward<'_>) {
        let Forward {
            batch_size,
            input,
            output,
            rng,
            ..
        } = pass;
        let distribution = self.distribution;
        let seeds = lane_seeds(rng, batch_size);
        output[..batch_size]
            .par_iter_mut()
            .zip(input[..batch_size].par_iter())
            .zip(seeds.par_iter())
            .for_each(|((o, i), &seed)| {
                let mut rng = Pcg64Mcg::seed_from_u64(seed);
                for (o, i) in o.values.iter_mut().zip(i.values.iter()) {
                    *o = i + distribution.sample(&mut rng);
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
        for (is, os) in input_sensitivity[..batch_size]
            .iter_mut()
            .zip(output_sensitivity[..batch_size].iter())
        {
            is.values.copy_from_slice(&os.values);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::layers::{Layer, tests::Harness};

    use super::*;

    fn ones(lanes: usize, n: usize) -> Vec<Tensor> {
        vec![Tensor::from_values(vec![n], vec![1.0; n]).unwrap(); lanes]
    }

    #[test]
    fn test_dropout_scales_by_mask() {
        let built = Dropout::build(&[200], 0.5, 2).unwrap();
        let mut h = Harness::new(built, ones(2, 200));
        h.forward();
        let Layer::Dropout(dropout) = &h.layer else {
            panic!("expected a dropout layer");
        };
        let mask = dropout.mask(0).clone();
        assert_eq!(h.outputs[0], mask);
        assert!(mask.values.iter().all(|&m| (0.0..=0.5).contains(&m)));
        let kept = mask.values.iter().filter(|&&m| m > 0.0).count();
        assert!(kept > 60 && kept < 140);
        // lanes draw independent masks
        assert_ne!(h.outputs[0], h.outputs[1]);

        let os = ones(2, 200);
        h.backward(&os);
        assert_eq!(h.input_sensitivity[0], mask);
    }

    #[test]
    fn test_dropout_ratio_bounds() {
        assert!(Dropout::build(&[4], 1.5, 1).is_err());
        let mut h = Harness::new(Dropout::build(&[50], 0.0, 1).unwrap(), ones(1, 50));
        h.forward();
        assert!(h.outputs[0].values.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_noise_forward_and_identity_gradient() {
        let mut h = Harness::new(Noise::build(&[1000], 0.5).unwrap(), ones(1, 1000));
        h.forward();
        let noise: Vec<f32> = h.outputs[0].values.iter().map(|v| v - 1.0).collect();
        let mean = noise.iter().sum::<f32>() / 1000.0;
        let variance = noise.iter().map(|v| v * v).sum::<f32>() / 1000.0;
        assert!(mean.abs() < 0.1);
        assert!((variance - 0.25).abs() < 0.05);

        let os = vec![Tensor::random_normal(vec![1000], &mut h.rng)];
        h.backward(&os);
        assert_eq!(h.input_sensitivity[0], os[0]);
    }

    #[test]
    fn test_noise_rejects_negative_sigma() {
        assert!(matches!(
            Noise::build(&[3], -1.0),
            Err(GraphError::InvalidLayer { .. })
        ));
    }
}
