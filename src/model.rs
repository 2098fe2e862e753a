//! Training loop and parameter persistence around a linked chain
//!
//! A [`Model`] borrows nothing: it keeps the ids of the chain endpoints and is handed the
//! [`Graph`] on every call, so the nodes outlive it and can be shared between models.

use std::{fs, io::ErrorKind, path::Path};

use thiserror::Error;

use crate::{
    dataloader::{DataLoader, Example, ExampleError},
    graph::{Graph, GraphError, NodeId},
    loss::{LossFunction, SquaredDifference},
    post_update::{self, PostUpdateFunction},
    range::Range,
    tensor::{Tensor, TensorError},
};

/// Errors for the model
#[derive(Debug, Error)]
pub enum ModelError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Examples(#[from] ExampleError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error("Parameter file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Node {0} is not an input node")]
    NotAnInput(NodeId),
    #[error("The chain has no node after its input")]
    EmptyChain,
    #[error("Example inputs hold {got} values, the input node expects {expected}")]
    InputShape { expected: usize, got: usize },
    #[error("Example targets hold {got} values, the output node produces {expected}")]
    TargetShape { expected: usize, got: usize },
    #[error("Parameter data is truncated: expected {expected} values, got {got}")]
    TruncatedParams { expected: usize, got: usize },
    #[error("Parameter file of {len} bytes is not a sequence of f32 values")]
    MalformedParamFile { len: usize },
}

pub struct Model {
    input: NodeId,
    output: NodeId,
    examples: DataLoader,
    pub loss_function: LossFunction,
    pub post_update_function: PostUpdateFunction,
    iteration: usize,
    last_error: f32,
}

impl Model {
    /// Wraps the chain from `input` to `output`, which must already be linked
    pub fn new(
        graph: &Graph,
        input: NodeId,
        output: NodeId,
        examples: DataLoader,
    ) -> Result<Self, ModelError> {
        if !graph.node(input)?.is_input() {
            return Err(ModelError::NotAnInput(input));
        }
        if input == output {
            return Err(ModelError::EmptyChain);
        }
        Range::new(graph, input, output)?;
        let mut model = Self {
            input,
            output,
            examples: DataLoader::default(),
            loss_function: SquaredDifference::call,
            post_update_function: post_update::none(),
            iteration: 0,
            last_error: 0.0,
        };
        model.set_examples(graph, examples)?;
        Ok(model)
    }

    pub fn input(&self) -> NodeId {
        self.input
    }

    pub fn output(&self) -> NodeId {
        self.output
    }

    pub fn examples(&self) -> &DataLoader {
        &self.examples
    }

    /// Replaces the example set after checking it against the chain endpoints
    pub fn set_examples(&mut self, graph: &Graph, examples: DataLoader) -> Result<(), ModelError> {
        let expected_input: usize = graph.node(self.input)?.output_sizes().iter().product();
        if let Some(got) = examples.input_len().filter(|&got| got != expected_input) {
            return Err(ModelError::InputShape {
                expected: expected_input,
                got,
            });
        }
        let expected_target: usize = graph.node(self.output)?.output_sizes().iter().product();
        if let Some(got) = examples.target_len().filter(|&got| got != expected_target) {
            return Err(ModelError::TargetShape {
                expected: expected_target,
                got,
            });
        }
        self.examples = examples;
        Ok(())
    }

    /// Number of examples processed by [`Model::train`] so far
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Mean error over the examples of the last [`Model::train`] call
    pub fn last_error(&self) -> f32 {
        self.last_error
    }

    /// Nodes after the input, up to the output
    fn span(&self, graph: &Graph) -> Result<Range, ModelError> {
        let first = graph
            .node(self.input)?
            .next()
            .ok_or(ModelError::EmptyChain)?;
        Ok(Range::new(graph, first, self.output)?)
    }

    /// Trains on `iterations` examples in chunks of at most one example per lane
    ///
    /// Each chunk runs forward, the loss, backward, one update of every unlocked node and
    /// the post-update hook. Returns the mean error over the processed examples.
    pub fn train(
        &mut self,
        graph: &mut Graph,
        lambda: f32,
        iterations: usize,
    ) -> Result<f32, ModelError> {
        if iterations == 0 {
            return Ok(self.last_error);
        }
        let span = self.span(graph)?;
        let first = span.first().ok_or(ModelError::EmptyChain)?;
        let reverse = Range::reverse(graph, self.output, first)?;
        let lanes = graph.lanes();
        if lanes == 0 {
            return Err(GraphError::NoLanes.into());
        }
        let loss = self.loss_function;

        let mut sum_error = 0.0f32;
        let mut remaining = iterations;
        while remaining > 0 {
            let batch_size = remaining.min(lanes);
            let chunk = self.examples.next_chunk(batch_size)?;
            for (lane, &k) in chunk.iter().enumerate() {
                graph.set_input(self.input, lane, &self.examples.examples()[k].input)?;
            }
            span.forward(graph, batch_size)?;
            for (lane, &k) in chunk.iter().enumerate() {
                let target = &self.examples.examples()[k].target;
                sum_error += graph.with_prediction(self.output, lane, |prediction, sensitivity| {
                    loss(target, prediction, sensitivity)
                })?;
            }
            reverse.backward_from_loss(graph, batch_size)?;
            span.update(graph, batch_size, lambda)?;
            (self.post_update_function)(graph)?;

            self.iteration += batch_size;
            remaining -= batch_size;
        }

        self.last_error = sum_error / iterations as f32;
        log::debug!(
            "iteration: {}, last_error: {}",
            self.iteration,
            self.last_error
        );
        Ok(self.last_error)
    }

    /// Runs a single-lane forward pass, leaving every sensitivity untouched
    pub fn predict(&self, graph: &mut Graph, input: &Tensor) -> Result<Tensor, ModelError> {
        let span = self.span(graph)?;
        graph.set_input(self.input, 0, input)?;
        span.forward(graph, 1)?;
        Ok(graph.node(self.output)?.output(0).clone())
    }

    /// Runs every example forward, lanes filled in chunks, and calls `f(prediction, example)`
    fn evaluate<F>(&self, graph: &mut Graph, mut f: F) -> Result<(), ModelError>
    where
        F: FnMut(&Tensor, &Example) -> Result<(), ModelError>,
    {
        let span = self.span(graph)?;
        let examples = self.examples.examples();
        for chunk in examples.chunks(graph.lanes().max(1)) {
            for (lane, example) in chunk.iter().enumerate() {
                graph.set_input(self.input, lane, &example.input)?;
            }
            span.forward(graph, chunk.len())?;
            let output = graph.node(self.output)?;
            for (lane, example) in chunk.iter().enumerate() {
                f(output.output(lane), example)?;
            }
        }
        Ok(())
    }

    /// Mean over the example set of the squared distance between prediction and target
    pub fn error(&self, graph: &mut Graph) -> Result<f32, ModelError> {
        if self.examples.is_empty() {
            return Err(ExampleError::Empty.into());
        }
        let mut error = 0.0f32;
        self.evaluate(graph, |prediction, example| {
            error += prediction.checked_sub(&example.target)?.error();
            Ok(())
        })?;
        Ok(error / self.examples.len() as f32)
    }

    /// Fraction of examples whose prediction argmax differs from the target argmax
    pub fn error_integer(&self, graph: &mut Graph) -> Result<f32, ModelError> {
        if self.examples.is_empty() {
            return Err(ExampleError::Empty.into());
        }
        let mut wrong = 0usize;
        self.evaluate(graph, |prediction, example| {
            if prediction.argmax() != example.target.argmax() {
                wrong += 1;
            }
            Ok(())
        })?;
        Ok(wrong as f32 / self.examples.len() as f32)
    }

    /// Error of `input` against `target` and its sensitivity with respect to the input
    ///
    /// Every sensitivity of the chain is cleared afterwards, so no parameter gradient is
    /// left for the next update.
    pub fn input_gradient(
        &self,
        graph: &mut Graph,
        input: &Tensor,
        target: &Tensor,
    ) -> Result<(f32, Tensor), ModelError> {
        let span = self.span(graph)?;
        let first = span.first().ok_or(ModelError::EmptyChain)?;
        let expected: usize = graph.node(self.output)?.output_sizes().iter().product();
        if target.len() != expected {
            return Err(ModelError::TargetShape {
                expected,
                got: target.len(),
            });
        }
        graph.set_input(self.input, 0, input)?;
        span.forward(graph, 1)?;
        let loss = self.loss_function;
        let error = graph.with_prediction(self.output, 0, |prediction, sensitivity| {
            loss(target, prediction, sensitivity)
        })?;
        Range::reverse(graph, self.output, first)?.backward_from_loss(graph, 1)?;
        let gradient = graph.output_sensitivity(self.input, 0)?.clone();
        span.clear(graph)?;
        Ok((error, gradient))
    }

    /// Moves the input held in lane 0 one gradient step towards producing `target`
    ///
    /// Parameters are left untouched. Returns the error before the step.
    pub fn optimize_input(
        &self,
        graph: &mut Graph,
        target: &Tensor,
        lambda: f32,
    ) -> Result<f32, ModelError> {
        let mut input = graph.node(self.input)?.output(0).clone();
        let (error, gradient) = self.input_gradient(graph, &input, target)?;
        for (x, g) in input.values.iter_mut().zip(gradient.values.iter()) {
            *x -= lambda * g;
        }
        graph.set_input(self.input, 0, &input)?;
        Ok(error)
    }

    /// Flat dump of every node from input to output: params, squared-gradient average, momentum
    pub fn serialize_params(&self, graph: &Graph) -> Result<Vec<f32>, ModelError> {
        let config = graph.config().adam;
        let mut values = Vec::new();
        for id in &Range::new(graph, self.input, self.output)? {
            graph.node(*id)?.write_params(&mut values, &config);
        }
        Ok(values)
    }

    /// Restores a dump produced by [`Model::serialize_params`] on an identically built chain
    pub fn deserialize_params(&self, graph: &mut Graph, values: &[f32]) -> Result<(), ModelError> {
        let range = Range::new(graph, self.input, self.output)?;
        let mut expected = 0;
        for &id in range.ids() {
            expected += graph.node(id)?.serialized_len();
        }
        if values.len() < expected {
            return Err(ModelError::TruncatedParams {
                expected,
                got: values.len(),
            });
        }
        if values.len() > expected {
            log::warn!(
                "ignoring {} trailing parameter values",
                values.len() - expected
            );
        }
        let config = graph.config().adam;
        let mut offset = 0;
        for &id in range.ids() {
            offset += graph.node_mut(id)?.read_params(&values[offset..], &config);
        }
        Ok(())
    }

    /// Writes the parameter dump as raw native-endian f32 values
    pub fn serialize_params_to_file(
        &self,
        graph: &Graph,
        path: impl AsRef<Path>,
    ) -> Result<(), ModelError> {
        let values = self.serialize_params(graph)?;
        fs::write(path.as_ref(), bytemuck::cast_slice::<f32, u8>(&values))?;
        log::info!(
            "saved {} parameter values to '{}'",
            values.len(),
            path.as_ref().display()
        );
        Ok(())
    }

    /// Loads a parameter file, leaving the chain untouched when the file does not exist
    ///
    /// Returns whether anything was loaded.
    pub fn deserialize_params_from_file(
        &self,
        graph: &mut Graph,
        path: impl AsRef<Path>,
    ) -> Result<bool, ModelError> {
        let path = path.as_ref();
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::warn!(
                    "parameter file '{}' not found, keeping initial parameters",
                    path.display()
                );
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        if bytes.len() % size_of::<f32>() != 0 {
            return Err(ModelError::MalformedParamFile { len: bytes.len() });
        }
        let values: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes);
        self.deserialize_params(graph, &values)?;
        log::info!(
            "loaded {} parameter values from '{}'",
            values.len(),
            path.display()
        );
        Ok(true)
    }
}
