//! Synthetic tasks for the command line demo and utilities for plotting them
//!
//! By convention class 0 is plotted in red and class 1 is plotted in blue.

use std::{
    error::Error,
    f32::consts::PI,
    fmt::{self, Display},
};

use clap::ValueEnum;
use plotters::{
    chart::ChartBuilder,
    prelude::{BitMapBackend, Circle, IntoDrawingArea, LineSeries, Rectangle},
    style::{BLUE, Color, RED, RGBColor, WHITE},
};
use rand::Rng;

use crate::{
    dataloader::Example,
    graph::Graph,
    model::Model,
    tensor::{Dims, Tensor},
};

/// Toggles between demo tasks
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// regress a fixed affine map with a single linear layer
    Affine,
    /// learn an 8-channel finite-difference filter bank with one convolution
    Derivatives,
    /// classify the quadrants of the plane
    Xor,
    /// classify two interleaving half circles
    Moon,
}

impl Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Affine => write!(f, "affine"),
            Task::Derivatives => write!(f, "derivatives"),
            Task::Xor => write!(f, "xor"),
            Task::Moon => write!(f, "moon"),
        }
    }
}

/// `f(x) = [x0 + 2 x1 + 3 x2 + 4, 5 x0 + 6 x1 + 7 x2 + 8]`
pub fn affine_target(input: &Tensor) -> Tensor {
    let x = &input.values;
    Tensor {
        values: vec![
            x[0] + 2.0 * x[1] + 3.0 * x[2] + 4.0,
            5.0 * x[0] + 6.0 * x[1] + 7.0 * x[2] + 8.0,
        ],
        sizes: vec![2],
    }
}

/// Standard-normal inputs of length 3 labelled with [`affine_target`]
pub fn affine_examples<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Vec<Example> {
    (0..n)
        .map(|_| {
            let input = Tensor::random_normal(vec![3], rng);
            let target = affine_target(&input);
            Example::new(input, target)
        })
        .collect()
}

/// Offsets of the 8 neighbours compared with the centre pixel, one per output channel
pub const FINITE_DIFFERENCE_OFFSETS: [(isize, isize); 8] = [
    (1, 0),
    (-1, 0),
    (0, 1),
    (0, -1),
    (1, 1),
    (-1, 1),
    (1, -1),
    (-1, -1),
];

/// `out(x, y, f) = in(X + dx_f, Y + dy_f) - in(X, Y)` with `(X, Y) = (x + 1, y + 1)`
///
/// Reads the first channel of `input` and produces a `[w - 2, h - 2, 8]` tensor.
pub fn finite_difference_targets(input: &Tensor) -> Tensor {
    let dims = input.dims();
    let out = Dims::new(
        dims.width.saturating_sub(2),
        dims.height.saturating_sub(2),
        FINITE_DIFFERENCE_OFFSETS.len(),
    );
    let mut output = Tensor::zeros(out.sizes());
    for (f, &(dx, dy)) in FINITE_DIFFERENCE_OFFSETS.iter().enumerate() {
        for y in 0..out.height {
            for x in 0..out.width {
                let (cx, cy) = (x + 1, y + 1);
                let nx = cx.saturating_add_signed(dx);
                let ny = cy.saturating_add_signed(dy);
                *output.at_mut(x, y, f) = input.at(nx, ny, 0) - input.at(cx, cy, 0);
            }
        }
    }
    output
}

/// The `[3, 3, 1, 8]` convolution filters computing [`finite_difference_targets`]
pub fn finite_difference_kernels() -> Tensor {
    let mut kernels = Tensor::zeros(vec![3, 3, 1, 8]);
    for (f, &(dx, dy)) in FINITE_DIFFERENCE_OFFSETS.iter().enumerate() {
        let base = 9 * f;
        kernels[base + 1 + 3] = -1.0;
        let (x, y) = ((1 + dx) as usize, (1 + dy) as usize);
        kernels[base + x + 3 * y] = 1.0;
    }
    kernels
}

/// Random `[size, size, 1]` images labelled with their finite differences
pub fn derivative_examples<R: Rng + ?Sized>(n: usize, size: usize, rng: &mut R) -> Vec<Example> {
    (0..n)
        .map(|_| {
            let input = Tensor::random_normal(vec![size, size, 1], rng);
            let target = finite_difference_targets(&input);
            Example::new(input, target)
        })
        .collect()
}

fn one_hot(class: usize) -> Tensor {
    let mut target = Tensor::zeros(vec![2]);
    target[class] = 1.0;
    target
}

fn point(x: f32, y: f32) -> Tensor {
    Tensor {
        values: vec![x, y],
        sizes: vec![2],
    }
}

/// Points of the plane, class 0 in the first and third quadrants
pub fn gen_xor_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> Vec<Example> {
    (0..2 * class_size)
        .map(|_| {
            let x: f32 = rng.random_range(-5.0..5.0);
            let y: f32 = rng.random_range(-5.0..5.0);
            let class = if (x > 0.0 && y > 0.0) || (x < 0.0 && y < 0.0) {
                0
            } else {
                1
            };
            Example::new(point(x, y), one_hot(class))
        })
        .collect()
}

/// Two interleaving partial circles with a little uniform noise
pub fn gen_moon_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> Vec<Example> {
    let radius = 3.0f32;
    let mut examples = Vec::with_capacity(2 * class_size);
    for class in 0..2 {
        for _ in 0..class_size {
            let theta: f32 = rng.random_range(PI * -1.0 / 4.0..PI * 5.0 / 4.0);
            let (x, y) = if class == 0 {
                (radius * theta.cos(), radius * theta.sin())
            } else {
                (radius * theta.cos() + 2.0, -radius * theta.sin() - 0.2)
            };
            let noise_x: f32 = rng.random_range(-0.1..0.1);
            let noise_y: f32 = rng.random_range(-0.1..0.1);
            examples.push(Example::new(point(x + noise_x, y + noise_y), one_hot(class)));
        }
    }
    examples
}

/// Plots the points of a 2D classification task
pub fn plot_data(examples: &[Example], file_name: &str, task: Task) -> Result<(), Box<dyn Error>> {
    let root_area = BitMapBackend::new(file_name, (640, 480)).into_drawing_area();
    root_area.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root_area)
        .caption(format!("Dataset: {}", task), ("sans-serif", 50))
        .margin(20)
        .x_label_area_size(30)
        .y_label_area_size(30)
        .build_cartesian_2d(-6.0f32..6.0f32, -6.0f32..6.0f32)?;

    chart.configure_mesh().draw()?;
    chart.draw_series(examples.iter().map(|e| {
        let color = if e.target.argmax() == 0 { RED } else { BLUE };
        Circle::new((e.input[0], e.input[1]), 3, color.filled())
    }))?;

    root_area.present()?;
    log::info!("Data plot has been saved to '{}'.", file_name);
    Ok(())
}

/// Plots the decision boundary of a 2D classifier by sampling a grid of points
pub fn plot_decision_boundary(
    model: &Model,
    graph: &mut Graph,
    file_name: &str,
    task: Task,
) -> Result<(), Box<dyn Error>> {
    let root_area = BitMapBackend::new(file_name, (640, 480)).into_drawing_area();
    root_area.fill(&WHITE)?;

    let grid_min = -6.0f32;
    let grid_max = 6.0f32;

    let mut chart = ChartBuilder::on(&root_area)
        .caption(format!("Decision Boundary for {}", task), ("sans-serif", 50))
        .margin(20)
        .x_label_area_size(30)
        .y_label_area_size(30)
        .build_cartesian_2d(grid_min..grid_max, grid_min..grid_max)?;

    chart.configure_mesh().draw()?;

    let red_bg = RGBColor(255, 200, 200);
    let blue_bg = RGBColor(200, 200, 255);

    let step = 0.20f32;
    let n_steps: f32 = (grid_max - grid_min) / step;
    let n_steps = n_steps.round() as i32;
    let mut cells = Vec::new();
    for xi in 0..n_steps {
        let x = grid_min + xi as f32 * step;
        for yi in 0..n_steps {
            let y = grid_min + yi as f32 * step;
            let class = model.predict(graph, &point(x, y))?.argmax();
            let color = if class == 0 { red_bg } else { blue_bg };
            cells.push(Rectangle::new(
                [
                    (x - step / 2.0, y - step / 2.0),
                    (x + step / 2.0, y + step / 2.0),
                ],
                color.filled(),
            ));
        }
    }
    chart.draw_series(cells)?;

    chart.draw_series(model.examples().examples().iter().map(|e| {
        let color = if e.target.argmax() == 0 { RED } else { BLUE };
        Circle::new((e.input[0], e.input[1]), 3, color.filled())
    }))?;

    root_area.present()?;
    log::info!("Decision boundary plot saved to '{}'.", file_name);
    Ok(())
}

/// Plots the training error reported every `every` examples
pub fn plot_errors(
    errors: &[f32],
    every: usize,
    file_name: &str,
    task: Task,
) -> Result<(), Box<dyn Error>> {
    let root_area = BitMapBackend::new(file_name, (640, 480)).into_drawing_area();
    root_area.fill(&WHITE)?;

    let max_error = errors
        .iter()
        .copied()
        .filter(|e| e.is_finite())
        .fold(f32::MIN_POSITIVE, f32::max);
    let max_x = (errors.len() * every).max(1) as f32;

    let mut chart = ChartBuilder::on(&root_area)
        .caption(format!("Training error: {}", task), ("sans-serif", 40))
        .margin(20)
        .x_label_area_size(30)
        .y_label_area_size(50)
        .build_cartesian_2d(0f32..max_x, 0f32..max_error)?;

    chart.configure_mesh().draw()?;
    chart.draw_series(LineSeries::new(
        errors
            .iter()
            .enumerate()
            .map(|(i, &e)| (((i + 1) * every) as f32, e)),
        &BLUE,
    ))?;

    root_area.present()?;
    log::info!("Error plot saved to '{}'.", file_name);
    Ok(())
}

/// Draws the first channel of a tensor as a grayscale image, rescaled to its own range
pub fn plot_tensor(tensor: &Tensor, scale: u32, file_name: &str) -> Result<(), Box<dyn Error>> {
    let dims = tensor.dims();
    let mut image = tensor.clone();
    image.rescale(0.0, 255.0);

    let (width, height) = (dims.width as u32 * scale, dims.height as u32 * scale);
    let root_area = BitMapBackend::new(file_name, (width, height)).into_drawing_area();
    root_area.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root_area)
        .build_cartesian_2d(0..dims.width as i32, 0..dims.height as i32)?;
    let mut pixels = Vec::with_capacity(dims.plane());
    for y in 0..dims.height {
        for x in 0..dims.width {
            let v = image.at(x, y, 0) as u8;
            // image rows grow downwards
            let row = (dims.height - 1 - y) as i32;
            pixels.push(Rectangle::new(
                [(x as i32, row), (x as i32 + 1, row + 1)],
                RGBColor(v, v, v).filled(),
            ));
        }
    }
    chart.draw_series(pixels)?;

    root_area.present()?;
    log::info!("Tensor image saved to '{}'.", file_name);
    Ok(())
}
