//! Pipeline entry point

use super::{Backward, Built, Forward, Kernel};

/// Holds no computation: the model writes each lane of its output before a forward pass
#[derive(Debug, Clone, Default)]
pub struct Input;

impl Input {
    pub fn build(sizes: Vec<usize>) -> Built {
        Built::stateless(Input, sizes)
    }
}

impl Kernel for Input {
    fn name(&self) -> &'static str {
        "Input"
    }

    fn forward(&mut self, _pass: Forward<'_>) {}

    fn backward(&mut self, _pass: Backward<'_>) {}
}
