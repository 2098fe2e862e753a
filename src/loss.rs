//! Loss functions
//!
//! A loss maps `(target, prediction)` to a scalar error and overwrites the sensitivity
//! buffer, shaped like the prediction, with the gradient of that error.

use crate::{layers::stable_softmax, tensor::Tensor};

/// Signature shared by every loss: `(target, prediction, sensitivity) -> error`
pub type LossFunction = fn(&Tensor, &Tensor, &mut Tensor) -> f32;

const LOG_FLOOR: f32 = 1e-10;

/// Sum of squared differences
pub struct SquaredDifference;

impl SquaredDifference {
    pub fn call(target: &Tensor, prediction: &Tensor, sensitivity: &mut Tensor) -> f32 {
        let mut error = 0.0f32;
        for (s, (t, p)) in sensitivity
            .values
            .iter_mut()
            .zip(target.values.iter().zip(prediction.values.iter()))
        {
            let d = p - t;
            *s = d;
            error += d * d;
        }
        error
    }
}

/// Cross entropy against the entries of a one-hot target
///
/// Only entries with a target above 0.5 contribute, each adding `-t * ln(p / t)`.
pub struct CrossEntropy;

impl CrossEntropy {
    pub fn call(target: &Tensor, prediction: &Tensor, sensitivity: &mut Tensor) -> f32 {
        let mut error = 0.0f32;
        for (s, (&t, &p)) in sensitivity
            .values
            .iter_mut()
            .zip(target.values.iter().zip(prediction.values.iter()))
        {
            if t > 0.5 {
                let p = p.max(LOG_FLOOR);
                error -= t * (p / t).ln();
                *s = -t / p;
            } else {
                *s = 0.0;
            }
        }
        error
    }
}

/// Softmax over the raw prediction followed by cross entropy
pub struct SoftmaxCrossEntropy;

impl SoftmaxCrossEntropy {
    pub fn call(target: &Tensor, prediction: &Tensor, sensitivity: &mut Tensor) -> f32 {
        stable_softmax(&prediction.values, &mut sensitivity.values);
        let mut error = 0.0f32;
        for (s, &t) in sensitivity.values.iter_mut().zip(target.values.iter()) {
            if t > 0.5 {
                error -= s.max(LOG_FLOOR).ln();
            }
            *s -= t;
        }
        error
    }
}

/// Critic loss of a Wasserstein GAN
///
/// The first prediction value is the score. The error is the score itself when the target
/// is above 0.5 and its negation otherwise, so minimising it lowers the score of the first
/// kind of sample and raises the score of the second.
pub struct Wasserstein;

impl Wasserstein {
    pub fn call(target: &Tensor, prediction: &Tensor, sensitivity: &mut Tensor) -> f32 {
        sensitivity.fill(0.0);
        let (Some(&t), Some(&p)) = (target.values.first(), prediction.values.first()) else {
            return 0.0;
        };
        let sign = if t > 0.5 { 1.0 } else { -1.0 };
        sensitivity.values[0] = sign;
        sign * p
    }
}
