//! Trains a small network on one of the synthetic tasks provided by `grad_net::datasets`
//!
//! # Usage
//! Runnable via
//! ```sh
//! cargo run -- -h
//! RUST_LOG=info cargo run -- --task moon --plot
//! ```
//!
//! Learning rate, lane count, number of chunks and the parameter file are configurable.

use std::{error::Error, fs};

use clap::Parser;
use grad_net::{
    dataloader::DataLoader,
    datasets::{
        Task, affine_examples, derivative_examples, gen_moon_data, gen_xor_data,
        plot_data, plot_decision_boundary, plot_errors, plot_tensor,
    },
    graph::{Graph, GraphConfig, NodeId},
    loss::{CrossEntropy, SquaredDifference},
    model::Model,
    tensor::Tensor,
};
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

#[derive(Parser)]
struct Args {
    #[clap(short, long, default_value_t = Task::Moon)]
    task: Task,
    /// number of generated examples (per class for classification tasks)
    #[clap(short, long, default_value_t = 500)]
    examples: usize,
    /// number of training chunks, each holding one example per lane
    #[clap(short, long, default_value_t = 2000)]
    chunks: usize,
    #[clap(short, long, default_value_t = 0.01)]
    lr: f32,
    #[clap(long, default_value_t = 32)]
    lanes: usize,
    #[clap(short, long, default_value_t = 42)]
    seed: u64,
    #[clap(short, long, default_value_t = 100)]
    print_every: usize,
    #[clap(long, default_value_t = 16)]
    hidden_units: usize,
    /// side of the square images of the derivatives task
    #[clap(long, default_value_t = 16)]
    image_size: usize,
    /// parameters are restored from this file when it exists and saved to it after training
    #[clap(long)]
    params_file: Option<String>,
    #[clap(short, long, default_value_t = format!("output"))]
    output_dir: String,
    #[clap(long, default_value_t = false)]
    plot: bool,
}

/// Builds the chain for `task` and returns its input and output nodes
fn build_network(graph: &mut Graph, args: &Args) -> Result<(NodeId, NodeId), Box<dyn Error>> {
    let ends = match args.task {
        Task::Affine => {
            let input = graph.input(vec![3]);
            (input, graph.linear(input, vec![2])?)
        }
        Task::Derivatives => {
            let input = graph.input(vec![args.image_size, args.image_size, 1]);
            (input, graph.convolution_2d(input, [3, 3], 8, 1)?)
        }
        Task::Xor | Task::Moon => {
            let input = graph.input(vec![2]);
            let hidden = graph.linear(input, vec![args.hidden_units])?;
            let hidden = graph.leaky_relu(hidden)?;
            let logits = graph.linear(hidden, vec![2])?;
            (input, graph.softmax(logits)?)
        }
    };
    Ok(ends)
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();
    let mut rng = Pcg64Mcg::seed_from_u64(args.seed);
    let examples = match args.task {
        Task::Affine => affine_examples(args.examples, &mut rng),
        Task::Derivatives => derivative_examples(args.examples, args.image_size, &mut rng),
        Task::Xor => gen_xor_data(args.examples, &mut rng),
        Task::Moon => gen_moon_data(args.examples, &mut rng),
    };
    let classification = matches!(args.task, Task::Xor | Task::Moon);

    if args.plot {
        fs::create_dir_all(&args.output_dir)?;
        if classification {
            plot_data(
                &examples,
                &format!("{}/dataset_{}.png", args.output_dir, args.task),
                args.task,
            )?;
        }
    }

    let mut graph = Graph::new(GraphConfig {
        lanes: args.lanes,
        seed: Some(args.seed),
        ..GraphConfig::default()
    });
    let (input, output) = build_network(&mut graph, &args)?;
    let mut model = Model::new(&graph, input, output, DataLoader::new(examples)?)?;
    model.loss_function = if classification {
        CrossEntropy::call
    } else {
        SquaredDifference::call
    };

    if let Some(file) = &args.params_file {
        if model.deserialize_params_from_file(&mut graph, file)? {
            log::info!("Restored parameters from '{}'", file);
        }
    }

    let lanes = graph.lanes();
    let print_every = args.print_every.max(1);
    let mut errors = Vec::new();
    let mut chunk_error = 0.0f32;
    for chunk in 0..args.chunks {
        chunk_error += model.train(&mut graph, args.lr, lanes)?;
        if (chunk + 1) % print_every == 0 || chunk + 1 == args.chunks {
            let done = (chunk % print_every) + 1;
            let mean = chunk_error / done as f32;
            log::info!("chunk: {}, mean error: {}", chunk + 1, mean);
            errors.push(mean);
            chunk_error = 0.0;
        }
    }

    log::info!("error over the example set: {}", model.error(&mut graph)?);
    if classification {
        log::info!(
            "misclassified fraction: {}",
            model.error_integer(&mut graph)?
        );
    }

    if let Some(file) = &args.params_file {
        model.serialize_params_to_file(&graph, file)?;
    }

    if args.plot {
        plot_errors(
            &errors,
            print_every,
            &format!("{}/errors_{}.png", args.output_dir, args.task),
            args.task,
        )?;
        match args.task {
            Task::Xor | Task::Moon => plot_decision_boundary(
                &model,
                &mut graph,
                &format!("{}/decision_boundary_{}.png", args.output_dir, args.task),
                args.task,
            )?,
            Task::Derivatives => {
                // one [3, 3, 1] tile per learned filter
                let filters: Vec<Tensor> = graph
                    .node(output)?
                    .params()
                    .values
                    .chunks_exact(9)
                    .map(|f| Tensor::from_values(vec![3, 3, 1], f.to_vec()))
                    .collect::<Result<_, _>>()?;
                plot_tensor(
                    &Tensor::merge(&filters, 4)?,
                    32,
                    &format!("{}/filters_{}.png", args.output_dir, args.task),
                )?;
            }
            Task::Affine => {}
        }
    }
    Ok(())
}
