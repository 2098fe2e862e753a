//! Constant frame around every channel

use rayon::prelude::*;

use super::{Backward, Built, Forward, Kernel};
use crate::{graph::GraphError, tensor::Dims};

#[derive(Debug, Clone)]
pub struct Border {
    value: f32,
    /// flat indices of the frame cells, every channel included
    cells: Vec<usize>,
}

impl Border {
    pub fn build(input_sizes: &[usize], size: usize, value: f32) -> Result<Built, GraphError> {
        let dims = Dims::of(input_sizes);
        if size > dims.width || size > dims.height {
            return Err(GraphError::invalid(
                "Border",
                format!(
                    "border of {} does not fit input {}x{}",
                    size, dims.width, dims.height
                ),
            ));
        }
        let mut cells = Vec::new();
        for z in 0..dims.channels {
            for y in 0..dims.height {
                for x in 0..dims.width {
                    let inside = x >= size
                        && y >= size
                        && x + size < dims.width
                        && y + size < dims.height;
                    if !inside {
                        cells.push(dims.index(x, y, z));
                    }
                }
            }
        }
        Ok(Built::stateless(
            Self { value, cells },
            input_sizes.to_vec(),
        ))
    }

    pub fn cells(&self) -> &[usize] {
        &self.cells
    }
}

impl Kernel for Border {
    fn name(&self) -> &'static str {
        "Border"
    }

    fn forward(&mut self, pass: Forward<'_>) {
        let Forward {
            batch_size,
            input,
            output,
            ..
        } = pass;
        let (value, cells) = (self.value, &self.cells);
        output[..batch_size]
            .par_iter_mut()
            .zip(input[..batch_size].par_iter())
            .for_each(|(o, i)| {
                o.values.copy_from_slice(&i.values);
                for &k in cells {
                    o.values[k] = value;
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
        let cells = &self.cells;
        input_sensitivity[..batch_size]
            .par_iter_mut()
            .zip(output_sensitivity[..batch_size].par_iter())
            .for_each(|(is, os)| {
                is.values.copy_from_slice(&os.values);
                for &k in cells {
                    is.values[k] = 0.0;
                }
            });
    }
}

#[cfg(test)]
mod tests {
    use crate::{layers::tests::Harness, tensor::Tensor};

    use super::*;

    #[test]
    fn test_border_forward_and_backward() {
        let built = Border::build(&[4, 3, 1], 1, -1.0).unwrap();
        let input = Tensor::from_values(vec![4, 3, 1], (1..=12).map(|v| v as f32).collect())
            .unwrap();
        let mut h = Harness::new(built, vec![input]);
        h.forward();
        assert_eq!(
            h.outputs[0].values,
            vec![
                -1.0, -1.0, -1.0, -1.0, //
                -1.0, 6.0, 7.0, -1.0, //
                -1.0, -1.0, -1.0, -1.0,
            ]
        );

        let os = Tensor::from_values(vec![4, 3, 1], vec![1.0; 12]).unwrap();
        h.backward(&[os]);
        let mut expected = vec![0.0; 12];
        expected[5] = 1.0;
        expected[6] = 1.0;
        assert_eq!(h.input_sensitivity[0].values, expected);
    }

    #[test]
    fn test_border_covers_every_channel() {
        let Built { layer, .. } = Border::build(&[3, 3, 2], 1, 0.0).unwrap();
        let crate::layers::Layer::Border(border) = layer else {
            panic!("expected a border layer");
        };
        assert_eq!(border.cells().len(), 16);
        assert!(!border.cells().contains(&4));
        assert!(!border.cells().contains(&13));
    }

    #[test]
    fn test_border_rejects_oversized_frame() {
        assert!(matches!(
            Border::build(&[2, 5, 1], 3, 0.0),
            Err(GraphError::InvalidLayer { .. })
        ));
    }
}
