extern crate ndarray;

use ndarray::prelude::*;
use std::collections::VecDeque;

use crate::ml::error::{Result, StyleError};

//________________________________________________________________
/// Unfolds every kernel-sized patch of a zero-padded (C, H, W) tensor into
/// the columns of a (C*k*k, H*W) matrix. Stride is 1 and padding is k/2.
pub fn im2col(input: &Array3<f32>, kernel: usize) -> Array2<f32> {
    let (channels, height, width) = input.dim();
    let pad = (kernel / 2) as isize;
    let mut cols = Array2::<f32>::zeros((channels * kernel * kernel, height * width));

    for c in 0..channels {
        for ky in 0..kernel {
            for kx in 0..kernel {
                let row = (c * kernel + ky) * kernel + kx;
                let mut col_row = cols.row_mut(row);
                for y in 0..height {
                    let in_y = y as isize + ky as isize - pad;
                    if in_y < 0 || in_y >= height as isize {
                        continue;
                    }
                    for x in 0..width {
                        let in_x = x as isize + kx as isize - pad;
                        if in_x < 0 || in_x >= width as isize {
                            continue;
                        }
                        col_row[y * width + x] = input[(c, in_y as usize, in_x as usize)];
                    }
                }
            }
        }
    }

    cols
}
//________________________________________________________________
/// Adjoint of [`im2col`]: scatters columns back into a (C, H, W) tensor,
/// summing overlapping contributions.
pub fn col2im(cols: &Array2<f32>, dims: (usize, usize, usize), kernel: usize) -> Array3<f32> {
    let (channels, height, width) = dims;
    let pad = (kernel / 2) as isize;
    let mut output = Array3::<f32>::zeros(dims);

    for c in 0..channels {
        for ky in 0..kernel {
            for kx in 0..kernel {
                let row = (c * kernel + ky) * kernel + kx;
                let col_row = cols.row(row);
                for y in 0..height {
                    let in_y = y as isize + ky as isize - pad;
                    if in_y < 0 || in_y >= height as isize {
                        continue;
                    }
                    for x in 0..width {
                        let in_x = x as isize + kx as isize - pad;
                        if in_x < 0 || in_x >= width as isize {
                            continue;
                        }
                        output[(c, in_y as usize, in_x as usize)] += col_row[y * width + x];
                    }
                }
            }
        }
    }

    output
}
//________________________________________________________________
/// Flattens a 3D activation tensor (C, H, W) into a (C, H*W) matrix.
pub fn to_matrix(tensor: Array3<f32>) -> Result<Array2<f32>> {
    let (channels, height, width) = tensor.dim();
    let tensor = tensor.as_standard_layout().to_owned();
    tensor
        .into_shape((channels, height * width))
        .map_err(|e| StyleError::ShapeMismatch(e.to_string()))
}
//________________________________________________________________
pub fn format_row<'a, I: IntoIterator<Item = &'a f32>>(values: I) -> String {
    values.into_iter()
        .map(|x| x.to_string())
        .collect::<Vec<String>>()
        .join(", ")
}
//________________________________________________________________
pub fn parse_row(line: &str) -> Result<Vec<f32>> {
    line.split(',')
        .map(|x| x.trim().parse::<f32>()
            .map_err(|e| StyleError::ModelFormat(format!("bad value `{}`: {}", x.trim(), e))))
        .collect()
}
//________________________________________________________________
/// Removes and returns the first line, failing with a model-format error at end of input.
pub fn take_line(file_lines: &mut VecDeque<String>) -> Result<String> {
    file_lines.pop_front()
        .ok_or_else(|| StyleError::ModelFormat("unexpected end of parameters".to_string()))
}
//________________________________________________________________
