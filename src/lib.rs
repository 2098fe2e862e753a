//! A small library for training feed-forward neural networks built as chains of layers
//! stored in a [`graph::Graph`] arena.
//!
//! Every node keeps one buffer per lane, so a batch runs forward and backward with one
//! example per lane in parallel.

pub mod dataloader;
pub mod datasets;
pub mod graph;
pub mod layers;
pub mod loss;
pub mod model;
pub mod node;
pub mod optim;
pub mod post_update;
pub mod range;
pub mod tensor;
