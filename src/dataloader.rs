//! Example set fed to the model
//!
//! The loader cycles through its examples in order with wraparound. Shuffling is left to
//! the caller, between training calls.

use std::collections::HashSet;

use rand::{Rng, seq::SliceRandom};
use thiserror::Error;

use crate::tensor::Tensor;

/// Errors for the example set
#[derive(Debug, Error)]
pub enum ExampleError {
    #[error("The example set is empty")]
    Empty,
    #[error(
        "All input tensors must have the same length. Received different sizes: {input_dims:?}"
    )]
    InputDimensionMismatch { input_dims: HashSet<usize> },
    #[error(
        "All target tensors must have the same length. Received different sizes: {target_dims:?}"
    )]
    TargetDimensionMismatch { target_dims: HashSet<usize> },
}

/// One input with the output expected for it
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    pub input: Tensor,
    pub target: Tensor,
}

impl Example {
    pub fn new(input: Tensor, target: Tensor) -> Self {
        Self { input, target }
    }
}

/// Examples of consistent shape, read in chunks from a wrapping cursor
#[derive(Debug, Clone, Default)]
pub struct DataLoader {
    examples: Vec<Example>,
    cursor: usize,
}

impl DataLoader {
    pub fn new(examples: Vec<Example>) -> Result<Self, ExampleError> {
        let input_dims = examples
            .iter()
            .map(|e| e.input.len())
            .collect::<HashSet<_>>();
        if input_dims.len() > 1 {
            return Err(ExampleError::InputDimensionMismatch { input_dims });
        }
        let target_dims = examples
            .iter()
            .map(|e| e.target.len())
            .collect::<HashSet<_>>();
        if target_dims.len() > 1 {
            return Err(ExampleError::TargetDimensionMismatch { target_dims });
        }
        Ok(Self {
            examples,
            cursor: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn examples(&self) -> &[Example] {
        &self.examples
    }

    pub fn get(&self, index: usize) -> Option<&Example> {
        self.examples.get(index)
    }

    /// Index of the next example handed out
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn input_len(&self) -> Option<usize> {
        self.examples.first().map(|e| e.input.len())
    }

    pub fn target_len(&self) -> Option<usize> {
        self.examples.first().map(|e| e.target.len())
    }

    /// Returns the indices of the next `size` examples, wrapping around the set
    pub fn next_chunk(&mut self, size: usize) -> Result<Vec<usize>, ExampleError> {
        if self.examples.is_empty() {
            return Err(ExampleError::Empty);
        }
        let n = self.examples.len();
        let chunk = (0..size).map(|k| (self.cursor + k) % n).collect();
        self.cursor = (self.cursor + size) % n;
        Ok(chunk)
    }

    /// Shuffles the examples in place and restarts from the first one
    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.examples.shuffle(rng);
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;

    fn example(input: &[f32], target: &[f32]) -> Example {
        Example::new(
            Tensor::from_values(vec![input.len()], input.to_vec()).unwrap(),
            Tensor::from_values(vec![target.len()], target.to_vec()).unwrap(),
        )
    }

    #[test]
    fn test_chunks_wrap_around() {
        let mut loader = DataLoader::new(vec![
            example(&[0.0], &[1.0]),
            example(&[1.0], &[0.0]),
            example(&[2.0], &[1.0]),
        ])
        .unwrap();
        assert_eq!(loader.next_chunk(2).unwrap(), vec![0, 1]);
        assert_eq!(loader.next_chunk(2).unwrap(), vec![2, 0]);
        assert_eq!(loader.cursor(), 1);
        // a chunk longer than the set repeats examples
        assert_eq!(loader.next_chunk(5).unwrap(), vec![1, 2, 0, 1, 2]);
        assert_eq!(loader.input_len(), Some(1));
        assert_eq!(loader.get(2).map(|e| e.input[0]), Some(2.0));
        assert!(loader.get(3).is_none());
    }

    #[test]
    fn test_dataloader_errors() {
        let mismatched_inputs = DataLoader::new(vec![
            example(&[0.0], &[1.0]),
            example(&[0.0, 1.0], &[1.0]),
        ]);
        assert!(matches!(
            mismatched_inputs,
            Err(ExampleError::InputDimensionMismatch { input_dims }) if input_dims.len() == 2
        ));
        let mismatched_targets =
            DataLoader::new(vec![example(&[0.0], &[1.0]), example(&[1.0], &[])]);
        assert!(matches!(
            mismatched_targets,
            Err(ExampleError::TargetDimensionMismatch { .. })
        ));

        let mut empty = DataLoader::new(Vec::new()).unwrap();
        assert!(empty.is_empty());
        assert!(matches!(empty.next_chunk(1), Err(ExampleError::Empty)));
    }

    #[test]
    fn test_shuffle_resets_cursor() {
        let examples: Vec<_> = (0..10).map(|i| example(&[i as f32], &[0.0])).collect();
        let mut loader = DataLoader::new(examples.clone()).unwrap();
        loader.next_chunk(3).unwrap();
        loader.shuffle(&mut Pcg64Mcg::seed_from_u64(42));
        assert_eq!(loader.cursor(), 0);
        assert_ne!(loader.examples(), examples.as_slice());
        let mut inputs: Vec<f32> = loader.examples().iter().map(|e| e.input[0]).collect();
        inputs.sort_by(f32::total_cmp);
        assert_eq!(inputs, (0..10).map(|i| i as f32).collect::<Vec<_>>());
    }
}
