//! Dense tensors which back every buffer flowing through the node pipeline
//!
//! A tensor is a flat, contiguous `f32` buffer plus its shape. Layers only ever see
//! the flat buffer and do their own index arithmetic, `x + width * (y + height * z)`.

use std::{
    fmt::{self, Display},
    ops::{AddAssign, Index, IndexMut, MulAssign, Sub, SubAssign},
};

use rand::Rng;
use rand_distr::StandardNormal;
use thiserror::Error;

/// Errors for shape preconditions at the tensor boundary
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TensorError {
    #[error("Shape mismatch: expected {expected} values, got {got}")]
    ShapeMismatch { expected: usize, got: usize },
    #[error("Height mismatch: left tensor has height {left}, right tensor has height {right}")]
    HeightMismatch { left: usize, right: usize },
    #[error("At least one tensor is required")]
    Empty,
}

/// Spatial reading of a shape: `[width, height, channels]`
///
/// Missing trailing axes count as 1 and every axis past the second is folded into
/// `channels`, so a `[3]` tensor is a 3x1x1 image and a `[4, 4, 2, 2]` tensor has 4 channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dims {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
}

impl Dims {
    pub fn new(width: usize, height: usize, channels: usize) -> Self {
        Self {
            width,
            height,
            channels,
        }
    }

    pub fn of(sizes: &[usize]) -> Self {
        let len: usize = sizes.iter().product();
        let width = sizes.first().copied().unwrap_or(1);
        let height = sizes.get(1).copied().unwrap_or(1);
        let plane = width * height;
        let channels = if plane == 0 { 0 } else { len / plane };
        Self::new(width, height, channels)
    }

    /// Number of values in one channel
    pub fn plane(&self) -> usize {
        self.width * self.height
    }

    pub fn len(&self) -> usize {
        self.plane() * self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn index(&self, x: usize, y: usize, z: usize) -> usize {
        x + self.width * (y + self.height * z)
    }

    pub fn sizes(&self) -> Vec<usize> {
        vec![self.width, self.height, self.channels]
    }
}

/// Flat buffer of `f32` values with its shape, `values.len() == product(sizes)`
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub values: Vec<f32>,
    pub sizes: Vec<usize>,
}

impl Tensor {
    /// Creates a zero-filled tensor of the given shape
    pub fn zeros(sizes: impl Into<Vec<usize>>) -> Self {
        let sizes = sizes.into();
        let len = sizes.iter().product();
        Self {
            values: vec![0.0; len],
            sizes,
        }
    }

    /// Wraps existing values, checking they fill the shape exactly
    pub fn from_values(
        sizes: impl Into<Vec<usize>>,
        values: Vec<f32>,
    ) -> Result<Self, TensorError> {
        let sizes = sizes.into();
        let expected: usize = sizes.iter().product();
        if values.len() != expected {
            return Err(TensorError::ShapeMismatch {
                expected,
                got: values.len(),
            });
        }
        Ok(Self { values, sizes })
    }

    /// Tensor of independent standard-normal samples
    pub fn random_normal<R: Rng + ?Sized>(sizes: impl Into<Vec<usize>>, rng: &mut R) -> Self {
        let mut tensor = Self::zeros(sizes);
        tensor.randomize(rng);
        tensor
    }

    /// Tensor of independent samples, uniform in `[0, 1)`
    pub fn random_uniform<R: Rng + ?Sized>(sizes: impl Into<Vec<usize>>, rng: &mut R) -> Self {
        let mut tensor = Self::zeros(sizes);
        tensor.uniform_randomize(rng);
        tensor
    }

    /// Normal sample projected on the unit sphere
    pub fn spherical_random<R: Rng + ?Sized>(sizes: impl Into<Vec<usize>>, rng: &mut R) -> Self {
        let mut tensor = Self::random_normal(sizes, rng);
        let norm = tensor.error().sqrt();
        if norm > 0.0 {
            tensor *= 1.0 / norm;
        }
        tensor
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn dims(&self) -> Dims {
        Dims::of(&self.sizes)
    }

    pub fn fill(&mut self, value: f32) {
        self.values.fill(value);
    }

    /// Overwrites every value with a standard-normal sample
    pub fn randomize<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        for v in self.values.iter_mut() {
            *v = rng.sample(StandardNormal);
        }
    }

    /// Overwrites every value with a uniform sample in `[0, 1)`
    pub fn uniform_randomize<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        for v in self.values.iter_mut() {
            *v = rng.random::<f32>();
        }
    }

    /// Sum of squares
    pub fn error(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum()
    }

    /// Index of the maximum value, the first one on ties
    pub fn argmax(&self) -> usize {
        let mut best = 0;
        for (i, v) in self.values.iter().enumerate().skip(1) {
            if *v > self.values[best] {
                best = i;
            }
        }
        best
    }

    /// Saturates every value to `[-bound, bound]`
    pub fn clip(&mut self, bound: f32) {
        self.clip_range(-bound, bound);
    }

    pub fn clip_range(&mut self, min: f32, max: f32) {
        for v in self.values.iter_mut() {
            *v = v.max(min).min(max);
        }
    }

    /// Affinely maps the observed `[min, max]` of the buffer onto `[min, max]`
    ///
    /// A constant buffer has no observed range and is filled with `min`.
    pub fn rescale(&mut self, min: f32, max: f32) {
        let Some(&first) = self.values.first() else {
            return;
        };
        let (input_min, input_max) = self
            .values
            .iter()
            .fold((first, first), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let range = input_max - input_min;
        if range == 0.0 {
            self.fill(min);
            return;
        }
        let scale = (max - min) / range;
        for v in self.values.iter_mut() {
            *v = (*v - input_min) * scale + min;
        }
    }

    #[inline]
    pub fn at(&self, x: usize, y: usize, z: usize) -> f32 {
        self.values[self.dims().index(x, y, z)]
    }

    #[inline]
    pub fn at_mut(&mut self, x: usize, y: usize, z: usize) -> &mut f32 {
        let index = self.dims().index(x, y, z);
        &mut self.values[index]
    }

    /// Tiles equally shaped tensors into one grid image, `columns` tiles per row
    ///
    /// `columns == 0` picks a square-ish grid of `floor(sqrt(n))` columns.
    pub fn merge(tensors: &[Tensor], columns: usize) -> Result<Tensor, TensorError> {
        let first = tensors.first().ok_or(TensorError::Empty)?;
        if let Some(other) = tensors.iter().find(|t| t.len() != first.len()) {
            return Err(TensorError::ShapeMismatch {
                expected: first.len(),
                got: other.len(),
            });
        }
        let columns = if columns == 0 {
            ((tensors.len() as f32).sqrt() as usize).max(1)
        } else {
            columns
        };
        let rows = tensors.len().div_ceil(columns);
        let dims = first.dims();

        let mut merged = Tensor::zeros(vec![
            dims.width * columns,
            dims.height * rows,
            dims.channels,
        ]);
        for (i, tensor) in tensors.iter().enumerate() {
            let offset_x = dims.width * (i % columns);
            let offset_y = dims.height * (i / columns);
            for z in 0..dims.channels {
                for y in 0..dims.height {
                    for x in 0..dims.width {
                        *merged.at_mut(x + offset_x, y + offset_y, z) =
                            tensor.values[dims.index(x, y, z)];
                    }
                }
            }
        }
        Ok(merged)
    }

    /// Places `b` to the right of `a`, both read as 2D images of equal height
    pub fn concatenate_horizontal(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
        let (da, db) = (a.dims(), b.dims());
        if da.height != db.height {
            return Err(TensorError::HeightMismatch {
                left: da.height,
                right: db.height,
            });
        }
        let mut out = Tensor::zeros(vec![da.width + db.width, da.height]);
        for y in 0..da.height {
            for x in 0..da.width {
                *out.at_mut(x, y, 0) = a.at(x, y, 0);
            }
            for x in 0..db.width {
                *out.at_mut(da.width + x, y, 0) = b.at(x, y, 0);
            }
        }
        Ok(out)
    }

    /// `self - other`, failing on a length mismatch
    pub fn checked_sub(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.check_len(other)?;
        Ok(self - other)
    }

    /// `self + other`, failing on a length mismatch
    pub fn checked_add(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.check_len(other)?;
        let mut out = self.clone();
        out += other;
        Ok(out)
    }

    fn check_len(&self, other: &Tensor) -> Result<(), TensorError> {
        if self.len() != other.len() {
            return Err(TensorError::ShapeMismatch {
                expected: self.len(),
                got: other.len(),
            });
        }
        Ok(())
    }
}

impl Index<usize> for Tensor {
    type Output = f32;

    fn index(&self, index: usize) -> &f32 {
        &self.values[index]
    }
}

impl IndexMut<usize> for Tensor {
    fn index_mut(&mut self, index: usize) -> &mut f32 {
        &mut self.values[index]
    }
}

impl Sub for &Tensor {
    type Output = Tensor;

    fn sub(self, other: &Tensor) -> Tensor {
        assert_eq!(self.len(), other.len(), "tensor length mismatch");
        let mut out = self.clone();
        out -= other;
        out
    }
}

impl AddAssign<&Tensor> for Tensor {
    fn add_assign(&mut self, other: &Tensor) {
        assert_eq!(self.len(), other.len(), "tensor length mismatch");
        for (a, b) in self.values.iter_mut().zip(other.values.iter()) {
            *a += b;
        }
    }
}

impl SubAssign<&Tensor> for Tensor {
    fn sub_assign(&mut self, other: &Tensor) {
        assert_eq!(self.len(), other.len(), "tensor length mismatch");
        for (a, b) in self.values.iter_mut().zip(other.values.iter()) {
            *a -= b;
        }
    }
}

impl MulAssign<f32> for Tensor {
    fn mul_assign(&mut self, lambda: f32) {
        for v in self.values.iter_mut() {
            *v *= lambda;
        }
    }
}

impl Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.values.iter().enumerate() {
            if i != 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, "]")
    }
}
