extern crate ndarray;

use ndarray::prelude::*;
use std::collections::{HashMap, VecDeque};

use crate::ml::error::Result;

/// Image in (height, width, channels) layout with intensities in [0, 1].
pub type Image = Array3<f32>;

/// Per-layer Gram matrices (channels x channels).
pub type StyleReprs = HashMap<String, Array2<f32>>;

/// Per-layer activation matrices (channels x spatial positions).
pub type ContentReprs = HashMap<String, Array2<f32>>;

//________________________________________________________________
/// One computational step of a network stage. Tensors are (channels, height, width).
pub trait Layer {
    fn forward(&mut self, input: &Array3<f32>) -> Result<Array3<f32>>;
    // gradient w.r.t. the input of the most recent forward call
    fn backward(&mut self, d_out: &Array3<f32>) -> Result<Array3<f32>>;
    fn save_parameters_to_file(&self, file_lines: &mut Vec<String>);
    fn load_parameters_from_file(&mut self, file_lines: &mut VecDeque<String>) -> Result<()>;
}
//________________________________________________________________
/// The contract the style objective needs from a feature network.
///
/// Layers are named and form a total order from input-adjacent to
/// output-adjacent. Every implementation owns its activation and gradient
/// buffers exclusively, so independent transfers need independent instances.
pub trait FeatureExtractor {
    /// Layer names in topological order.
    fn layer_names(&self) -> Vec<String>;

    /// Configured input shape as (channels, height, width).
    fn input_shape(&self) -> (usize, usize, usize);

    fn reshape_input(&mut self, height: usize, width: usize, channels: usize);

    /// Runs a full forward pass, replacing every activation buffer.
    fn forward(&mut self, input: &Array3<f32>) -> Result<()>;

    /// Copy of the activation tensor produced at `layer` by the last forward pass.
    fn activations(&self, layer: &str) -> Result<Array3<f32>>;

    /// Shape of the activation tensor at `layer` after the last forward pass.
    fn output_dim(&self, layer: &str) -> Result<(usize, usize, usize)>;

    /// Adds `grad` into the output-gradient buffer of `layer`.
    fn set_output_gradient(&mut self, layer: &str, grad: &Array3<f32>) -> Result<()>;

    fn output_gradient(&self, layer: &str) -> Result<Array3<f32>>;

    /// Zeroes every gradient buffer, including the input gradient.
    fn clear_gradients(&mut self);

    /// Propagates the gradient held at `from` back to the output buffer of
    /// `to`, or to the input gradient when `to` is `None`.
    fn backward(&mut self, from: &str, to: Option<&str>) -> Result<()>;

    fn input_gradient(&self) -> Result<Array3<f32>>;
}
//________________________________________________________________
