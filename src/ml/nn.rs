extern crate ndarray;
extern crate ndarray_rand;
extern crate rand;

use ndarray::{Array, Array1, Array3, Array4};
use ndarray::prelude::*;
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::rngs::StdRng;
use std::collections::VecDeque;

use crate::ml::error::{Result, StyleError};
use crate::ml::types::*;
use crate::ml::util::*;

//________________________________________________________________
/// Stride-1 convolution with zero "same" padding.
pub struct Conv2d {
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    weights: Array4<f32>,
    bias: Array1<f32>,
    input_dim: Option<(usize, usize, usize)>,
}

impl Conv2d {
    /// Kaiming-uniform initialised filters, zero bias.
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize, rng: &mut StdRng) -> Self {
        let fan_in = (in_channels * kernel_size * kernel_size) as f32;
        let bound = (6.0 / fan_in).sqrt();
        let weights = Array::random_using(
            (out_channels, in_channels, kernel_size, kernel_size),
            Uniform::new(-bound, bound),
            rng,
        );
        let bias = Array::zeros(out_channels);

        Self {
            in_channels,
            out_channels,
            kernel_size,
            weights,
            bias,
            input_dim: None,
        }
    }

    pub fn from_parameters(weights: Array4<f32>, bias: Array1<f32>) -> Result<Self> {
        let (out_channels, in_channels, kernel_size, kernel_w) = weights.dim();
        if kernel_size != kernel_w || kernel_size % 2 == 0 {
            return Err(StyleError::ShapeMismatch(format!(
                "Conv2d: kernel must be square and odd, got {}x{}", kernel_size, kernel_w)));
        }
        if bias.len() != out_channels {
            return Err(StyleError::shape(out_channels, bias.len()));
        }

        Ok(Self {
            in_channels,
            out_channels,
            kernel_size,
            weights: weights.as_standard_layout().to_owned(),
            bias,
            input_dim: None,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    fn weight_matrix(&self) -> Result<ArrayView2<'_, f32>> {
        let patch = self.in_channels * self.kernel_size * self.kernel_size;
        self.weights.view()
            .into_shape((self.out_channels, patch))
            .map_err(|e| StyleError::ShapeMismatch(e.to_string()))
    }
}

impl Layer for Conv2d {
    fn forward(&mut self, input: &Array3<f32>) -> Result<Array3<f32>> {
        let (channels, height, width) = input.dim();
        if channels != self.in_channels {
            return Err(StyleError::ShapeMismatch(format!(
                "Conv2d: expected {} input channels, got {}", self.in_channels, channels)));
        }
        self.input_dim = Some(input.dim());

        let cols = im2col(input, self.kernel_size);
        let weighted_sum = self.weight_matrix()?.dot(&cols);
        let bias_added = &weighted_sum + &self.bias.view().insert_axis(Axis(1));

        bias_added
            .into_shape((self.out_channels, height, width))
            .map_err(|e| StyleError::ShapeMismatch(e.to_string()))
    }

    fn backward(&mut self, d_out: &Array3<f32>) -> Result<Array3<f32>> {
        let input_dim = self.input_dim
            .ok_or_else(|| StyleError::ForwardNotRun("Conv2d::backward".to_string()))?;
        let (_, height, width) = input_dim;
        if d_out.dim() != (self.out_channels, height, width) {
            return Err(StyleError::shape((self.out_channels, height, width), d_out.dim()));
        }

        let reshaped_grad = d_out.as_standard_layout()
            .into_owned()
            .into_shape((self.out_channels, height * width))
            .map_err(|e| StyleError::ShapeMismatch(e.to_string()))?;
        let d_cols = self.weight_matrix()?.t().dot(&reshaped_grad);

        Ok(col2im(&d_cols, input_dim, self.kernel_size))
    }

    fn save_parameters_to_file(&self, file_lines: &mut Vec<String>) {
        file_lines.push("Weights:".to_string());
        for filter in self.weights.outer_iter() {
            file_lines.push(format_row(filter.iter()));
        }

        file_lines.push("Bias:".to_string());
        file_lines.push(format_row(self.bias.iter()));
    }

    fn load_parameters_from_file(&mut self, file_lines: &mut VecDeque<String>) -> Result<()> {
        let patch = self.in_channels * self.kernel_size * self.kernel_size;

        if take_line(file_lines)?.trim() != "Weights:" {
            return Err(StyleError::ModelFormat("Conv2d: expected `Weights:`".to_string()));
        }
        let mut weights: Vec<f32> = Vec::with_capacity(self.out_channels * patch);
        for _ in 0..self.out_channels {
            let row = parse_row(&take_line(file_lines)?)?;
            if row.len() != patch {
                return Err(StyleError::ModelFormat(format!(
                    "Conv2d: filter row has {} values, expected {}", row.len(), patch)));
            }
            weights.extend(row);
        }

        if take_line(file_lines)?.trim() != "Bias:" {
            return Err(StyleError::ModelFormat("Conv2d: expected `Bias:`".to_string()));
        }
        let bias = parse_row(&take_line(file_lines)?)?;
        if bias.len() != self.out_channels {
            return Err(StyleError::ModelFormat(format!(
                "Conv2d: bias has {} values, expected {}", bias.len(), self.out_channels)));
        }

        self.weights = Array::from_shape_vec(
            (self.out_channels, self.in_channels, self.kernel_size, self.kernel_size), weights)
            .map_err(|e| StyleError::ModelFormat(e.to_string()))?;
        self.bias = Array::from(bias);
        Ok(())
    }
}
//________________________________________________________________
pub struct ReLU {
    gradient: Option<Array3<f32>>,
}

impl ReLU {
    pub fn new() -> Self {
        Self { gradient: None }
    }
}

impl Layer for ReLU {
    fn forward(&mut self, input_vector: &Array3<f32>) -> Result<Array3<f32>> {
        self.gradient = Some(input_vector.mapv(|a| if a <= 0.0 { 0.0 } else { 1.0 }));
        Ok(input_vector.mapv(|a| a.max(0.0)))
    }

    fn backward(&mut self, gradient: &Array3<f32>) -> Result<Array3<f32>> {
        let mask = self.gradient.as_ref()
            .ok_or_else(|| StyleError::ForwardNotRun("ReLU::backward".to_string()))?;
        if mask.dim() != gradient.dim() {
            return Err(StyleError::shape(mask.dim(), gradient.dim()));
        }
        Ok(mask * gradient)
    }

    fn save_parameters_to_file(&self, _file_lines: &mut Vec<String>) {
    }
    fn load_parameters_from_file(&mut self, _file_lines: &mut VecDeque<String>) -> Result<()> {
        Ok(())
    }
}
//________________________________________________________________
/// Max pooling with ceil-mode output size: edge windows may be partial.
pub struct MaxPool2d {
    kernel_size: usize,
    stride: usize,
    input_dim: Option<(usize, usize, usize)>,
    // flat (y * width + x) index of the winner for every output cell
    argmax: Option<Array3<usize>>,
}

impl MaxPool2d {
    pub fn new(kernel_size: usize, stride: usize) -> Self {
        Self { kernel_size, stride, input_dim: None, argmax: None }
    }

    pub fn output_size(&self, size: usize) -> usize {
        if size <= self.kernel_size {
            1
        } else {
            (size - self.kernel_size + self.stride - 1) / self.stride + 1
        }
    }
}

impl Layer for MaxPool2d {
    fn forward(&mut self, input: &Array3<f32>) -> Result<Array3<f32>> {
        let (channels, height, width) = input.dim();
        let (out_h, out_w) = (self.output_size(height), self.output_size(width));

        let mut output = Array3::<f32>::zeros((channels, out_h, out_w));
        let mut argmax = Array3::<usize>::zeros((channels, out_h, out_w));

        for c in 0..channels {
            for oy in 0..out_h {
                let y0 = oy * self.stride;
                let y1 = (y0 + self.kernel_size).min(height);
                for ox in 0..out_w {
                    let x0 = ox * self.stride;
                    let x1 = (x0 + self.kernel_size).min(width);

                    let mut max_value = f32::NEG_INFINITY;
                    let mut max_index = y0 * width + x0;
                    for y in y0..y1 {
                        for x in x0..x1 {
                            let value = input[(c, y, x)];
                            if value > max_value {
                                max_value = value;
                                max_index = y * width + x;
                            }
                        }
                    }
                    output[(c, oy, ox)] = max_value;
                    argmax[(c, oy, ox)] = max_index;
                }
            }
        }

        self.input_dim = Some(input.dim());
        self.argmax = Some(argmax);
        Ok(output)
    }

    fn backward(&mut self, d_out: &Array3<f32>) -> Result<Array3<f32>> {
        let (input_dim, argmax) = match (self.input_dim, self.argmax.as_ref()) {
            (Some(dim), Some(argmax)) => (dim, argmax),
            _ => return Err(StyleError::ForwardNotRun("MaxPool2d::backward".to_string())),
        };
        if d_out.dim() != argmax.dim() {
            return Err(StyleError::shape(argmax.dim(), d_out.dim()));
        }

        let width = input_dim.2;
        let mut d_input = Array3::<f32>::zeros(input_dim);
        for ((c, oy, ox), &index) in argmax.indexed_iter() {
            d_input[(c, index / width, index % width)] += d_out[(c, oy, ox)];
        }
        Ok(d_input)
    }

    fn save_parameters_to_file(&self, _file_lines: &mut Vec<String>) {
    }
    fn load_parameters_from_file(&mut self, _file_lines: &mut VecDeque<String>) -> Result<()> {
        Ok(())
    }
}
//________________________________________________________________

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;

    #[test]
    fn conv_identity_kernel_copies_input() {
        let mut weights = Array4::<f32>::zeros((1, 1, 3, 3));
        weights[(0, 0, 1, 1)] = 1.0;
        let mut conv = Conv2d::from_parameters(weights, arr1(&[0.5])).unwrap();

        let input = Array3::from_shape_fn((1, 4, 4), |(_, y, x)| (y * 4 + x) as f32);
        let output = conv.forward(&input).unwrap();
        assert_eq!(output.dim(), (1, 4, 4));
        for ((_, y, x), v) in output.indexed_iter() {
            assert_abs_diff_eq!(*v, (y * 4 + x) as f32 + 0.5);
        }
    }

    #[test]
    fn conv_backward_matches_directional_derivative() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut conv = Conv2d::new(2, 3, 3, &mut rng);
        let input = Array::random_using((2, 5, 4), Uniform::new(-1.0, 1.0), &mut rng);
        let direction = Array::random_using((2, 5, 4), Uniform::new(-1.0, 1.0), &mut rng);
        let d_out = Array::random_using((3, 5, 4), Uniform::new(-1.0, 1.0), &mut rng);

        // conv is linear in its input, so <d_out, conv(x + d) - conv(x)> == <grad, d>
        let base = conv.forward(&input).unwrap();
        let moved = conv.forward(&(&input + &direction)).unwrap();
        let lhs = (&d_out * &(&moved - &base)).sum();
        let grad = conv.backward(&d_out).unwrap();
        let rhs = (&grad * &direction).sum();
        assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-3);
    }

    #[test]
    fn conv_rejects_wrong_channel_count() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut conv = Conv2d::new(3, 4, 3, &mut rng);
        let result = conv.forward(&Array3::zeros((2, 4, 4)));
        assert!(matches!(result, Err(StyleError::ShapeMismatch(_))));
    }

    #[test]
    fn conv_parameters_survive_save_and_load() {
        let mut rng = StdRng::seed_from_u64(11);
        let conv = Conv2d::new(2, 2, 3, &mut rng);
        let mut lines = Vec::new();
        conv.save_parameters_to_file(&mut lines);
        assert_eq!(lines.len(), 5);

        let mut lines: VecDeque<String> = lines.into_iter().collect();
        let mut other = Conv2d::new(2, 2, 3, &mut rng);
        other.load_parameters_from_file(&mut lines).unwrap();
        assert!(lines.is_empty());
        for (a, b) in conv.weights.iter().zip(other.weights.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn relu_masks_non_positive_units() {
        let mut relu = ReLU::new();
        let input = Array3::from_shape_vec((1, 1, 4), vec![-1.0, 0.0, 2.0, 3.0]).unwrap();
        let output = relu.forward(&input).unwrap();
        assert_eq!(output.iter().cloned().collect::<Vec<f32>>(), vec![0.0, 0.0, 2.0, 3.0]);
        let grad = relu.backward(&Array3::ones((1, 1, 4))).unwrap();
        assert_eq!(grad.iter().cloned().collect::<Vec<f32>>(), vec![0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn relu_backward_before_forward_fails() {
        let mut relu = ReLU::new();
        assert!(matches!(relu.backward(&Array3::ones((1, 1, 1))), Err(StyleError::ForwardNotRun(_))));
    }

    #[test]
    fn max_pool_uses_ceil_mode_and_routes_gradient() {
        let mut pool = MaxPool2d::new(2, 2);
        let input = Array3::from_shape_fn((1, 3, 3), |(_, y, x)| (y * 3 + x) as f32);
        let output = pool.forward(&input).unwrap();
        assert_eq!(output.dim(), (1, 2, 2));
        assert_eq!(output.iter().cloned().collect::<Vec<f32>>(), vec![4.0, 5.0, 7.0, 8.0]);

        let grad = pool.backward(&Array3::ones((1, 2, 2))).unwrap();
        assert_eq!(grad[(0, 1, 1)], 1.0);
        assert_eq!(grad[(0, 2, 2)], 1.0);
        assert_eq!(grad[(0, 0, 0)], 0.0);
        assert_eq!(grad.sum(), 4.0);
    }
}
