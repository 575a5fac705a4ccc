//! A small sequential convolutional network exposing named stages.
//!
//! Every stage owns a pipeline of [`Layer`]s and keeps two buffers: the
//! activation produced by its last layer on the most recent forward pass and
//! the gradient of the objective with respect to that activation. Conv stages
//! rectify their output, so their activations are post-ReLU.

extern crate ndarray;
extern crate rand;

use ndarray::Array3;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use tracing::{debug, info};

use crate::ml::error::{Result, StyleError};
use crate::ml::nn::*;
use crate::ml::types::*;
use crate::ml::util::take_line;

//________________________________________________________________
struct Stage {
    name: String,
    layers: Vec<Box<dyn Layer>>,
    activation: Option<Array3<f32>>,
    gradient: Option<Array3<f32>>,
}

impl Stage {
    fn new(name: &str, layers: Vec<Box<dyn Layer>>) -> Self {
        Self { name: name.to_string(), layers, activation: None, gradient: None }
    }
}
//________________________________________________________________
pub struct Network {
    input_shape: (usize, usize, usize),
    stages: Vec<Stage>,
    input_gradient: Option<Array3<f32>>,
}

impl Network {
    /// VGG-16 convolutional stack (no classifier head) with seeded random filters.
    /// Load pretrained parameters with [`Network::load_parameters_from_file`].
    pub fn vgg16(seed: u64) -> Result<Self> {
        let mut builder = NetworkBuilder::new(3, 224, 224).seed(seed);
        let blocks: [(usize, usize); 5] = [(2, 64), (2, 128), (3, 256), (3, 512), (3, 512)];

        for (block, &(convs, channels)) in blocks.iter().enumerate() {
            for i in 0..convs {
                builder = builder.conv(&format!("conv{}_{}", block + 1, i + 1), channels);
            }
            builder = builder.max_pool(&format!("pool{}", block + 1));
        }

        builder.build()
    }

    fn index_of(&self, layer: &str) -> Result<usize> {
        self.stages.iter()
            .position(|stage| stage.name == layer)
            .ok_or_else(|| StyleError::UnknownLayer(layer.to_string()))
    }

    pub fn contains(&self, layer: &str) -> bool {
        self.stages.iter().any(|stage| stage.name == layer)
    }

    pub fn save_parameters_to_file(&self, path: &Path) -> Result<()> {
        let mut file = File::create(path)?;
        let mut file_lines: Vec<String> = Vec::new();

        for stage in self.stages.iter() {
            file_lines.push(format!("Layer: {}", stage.name));
            for layer in stage.layers.iter() {
                layer.save_parameters_to_file(&mut file_lines);
            }
        }

        for line in file_lines.iter() {
            writeln!(file, "{}", line)?;
        }
        Ok(())
    }

    pub fn load_parameters_from_file(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);

        let mut file_lines: VecDeque<String> = VecDeque::new();
        for line in reader.lines() {
            let line = line?;
            if !line.trim().is_empty() {
                file_lines.push_back(line);
            }
        }

        for stage in self.stages.iter_mut() {
            let header = take_line(&mut file_lines)?;
            let expected = format!("Layer: {}", stage.name);
            if header.trim() != expected {
                return Err(StyleError::ModelFormat(format!("expected `{}`, found `{}`", expected, header.trim())));
            }
            for layer in stage.layers.iter_mut() {
                layer.load_parameters_from_file(&mut file_lines)?;
            }
        }

        if !file_lines.is_empty() {
            return Err(StyleError::ModelFormat(format!("{} trailing lines", file_lines.len())));
        }

        info!("loaded parameters for {} stages from {}", self.stages.len(), path.display());
        Ok(())
    }
}

impl FeatureExtractor for Network {
    fn layer_names(&self) -> Vec<String> {
        self.stages.iter().map(|stage| stage.name.clone()).collect()
    }

    fn input_shape(&self) -> (usize, usize, usize) {
        self.input_shape
    }

    fn reshape_input(&mut self, height: usize, width: usize, channels: usize) {
        debug!("reshaping network input to {}x{}x{}", channels, height, width);
        self.input_shape = (channels, height, width);
        self.input_gradient = None;
        for stage in self.stages.iter_mut() {
            stage.activation = None;
            stage.gradient = None;
        }
    }

    fn forward(&mut self, input: &Array3<f32>) -> Result<()> {
        if input.dim() != self.input_shape {
            return Err(StyleError::shape(self.input_shape, input.dim()));
        }

        let mut output = input.to_owned();
        for stage in self.stages.iter_mut() {
            for layer in stage.layers.iter_mut() {
                output = layer.forward(&output)?;
            }
            stage.gradient = Some(Array3::zeros(output.dim()));
            stage.activation = Some(output.clone());
        }
        self.input_gradient = Some(Array3::zeros(self.input_shape));

        Ok(())
    }

    fn activations(&self, layer: &str) -> Result<Array3<f32>> {
        let stage = &self.stages[self.index_of(layer)?];
        stage.activation.clone()
            .ok_or_else(|| StyleError::ForwardNotRun(format!("reading activations of `{}`", layer)))
    }

    fn output_dim(&self, layer: &str) -> Result<(usize, usize, usize)> {
        let stage = &self.stages[self.index_of(layer)?];
        stage.activation.as_ref()
            .map(|activation| activation.dim())
            .ok_or_else(|| StyleError::ForwardNotRun(format!("reading the shape of `{}`", layer)))
    }

    fn set_output_gradient(&mut self, layer: &str, grad: &Array3<f32>) -> Result<()> {
        let index = self.index_of(layer)?;
        let buffer = self.stages[index].gradient.as_mut()
            .ok_or_else(|| StyleError::ForwardNotRun(format!("writing gradient of `{}`", layer)))?;
        if buffer.dim() != grad.dim() {
            return Err(StyleError::shape(buffer.dim(), grad.dim()));
        }
        *buffer += grad;
        Ok(())
    }

    fn output_gradient(&self, layer: &str) -> Result<Array3<f32>> {
        let stage = &self.stages[self.index_of(layer)?];
        stage.gradient.clone()
            .ok_or_else(|| StyleError::ForwardNotRun(format!("reading gradient of `{}`", layer)))
    }

    fn clear_gradients(&mut self) {
        for stage in self.stages.iter_mut() {
            if let Some(gradient) = stage.gradient.as_mut() {
                gradient.fill(0.0);
            }
        }
        if let Some(gradient) = self.input_gradient.as_mut() {
            gradient.fill(0.0);
        }
    }

    fn backward(&mut self, from: &str, to: Option<&str>) -> Result<()> {
        let start = self.index_of(from)?;
        let first = match to {
            Some(end) => {
                let stop = self.index_of(end)?;
                if stop >= start {
                    return Err(StyleError::BackwardRange { start: from.to_string(), end: end.to_string() });
                }
                stop + 1
            },
            None => 0,
        };

        let mut grad = self.output_gradient(from)?;
        for index in (first..=start).rev() {
            for layer in self.stages[index].layers.iter_mut().rev() {
                grad = layer.backward(&grad)?;
            }
            // overwrite, the bottom buffer of this stage is fully determined by it
            if index == 0 {
                self.input_gradient = Some(grad.clone());
            } else {
                self.stages[index - 1].gradient = Some(grad.clone());
            }
        }

        Ok(())
    }

    fn input_gradient(&self) -> Result<Array3<f32>> {
        self.input_gradient.clone()
            .ok_or_else(|| StyleError::ForwardNotRun("reading the input gradient".to_string()))
    }
}
//________________________________________________________________
enum StageSpec {
    Conv { name: String, out_channels: usize, kernel_size: usize },
    MaxPool { name: String },
}

/// Assembles a [`Network`] stage by stage, tracking channel counts.
pub struct NetworkBuilder {
    input_shape: (usize, usize, usize),
    seed: u64,
    stages: Vec<StageSpec>,
}

impl NetworkBuilder {
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        Self { input_shape: (channels, height, width), seed: 0, stages: Vec::new() }
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// 3x3 convolution followed by a rectifier.
    pub fn conv(self, name: &str, out_channels: usize) -> Self {
        self.conv_with_kernel(name, out_channels, 3)
    }

    pub fn conv_with_kernel(mut self, name: &str, out_channels: usize, kernel_size: usize) -> Self {
        self.stages.push(StageSpec::Conv { name: name.to_string(), out_channels, kernel_size });
        self
    }

    /// 2x2 max pooling with stride 2.
    pub fn max_pool(mut self, name: &str) -> Self {
        self.stages.push(StageSpec::MaxPool { name: name.to_string() });
        self
    }

    pub fn build(self) -> Result<Network> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut channels = self.input_shape.0;
        let mut names: HashSet<String> = HashSet::new();
        let mut stages = Vec::with_capacity(self.stages.len());

        for spec in self.stages {
            match spec {
                StageSpec::Conv { name, out_channels, kernel_size } => {
                    if kernel_size % 2 == 0 {
                        return Err(StyleError::ShapeMismatch(format!("`{}`: kernel size must be odd", name)));
                    }
                    if !names.insert(name.clone()) {
                        return Err(StyleError::DuplicateLayer(name));
                    }
                    let conv = Conv2d::new(channels, out_channels, kernel_size, &mut rng);
                    stages.push(Stage::new(&name, vec![Box::new(conv), Box::new(ReLU::new())]));
                    channels = out_channels;
                },
                StageSpec::MaxPool { name } => {
                    if !names.insert(name.clone()) {
                        return Err(StyleError::DuplicateLayer(name));
                    }
                    stages.push(Stage::new(&name, vec![Box::new(MaxPool2d::new(2, 2))]));
                },
            }
        }

        Ok(Network { input_shape: self.input_shape, stages, input_gradient: None })
    }
}
//________________________________________________________________

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array;
    use ndarray_rand::RandomExt;
    use rand::distributions::Uniform;

    fn small_network() -> Network {
        NetworkBuilder::new(3, 8, 8)
            .seed(5)
            .conv("conv1", 4)
            .max_pool("pool1")
            .conv("conv2", 6)
            .build()
            .unwrap()
    }

    fn random_input(shape: (usize, usize, usize), seed: u64) -> Array3<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array::random_using(shape, Uniform::new(-1.0, 1.0), &mut rng)
    }

    #[test]
    fn layer_names_follow_topological_order() {
        let net = small_network();
        assert_eq!(net.layer_names(), vec!["conv1", "pool1", "conv2"]);
    }

    #[test]
    fn vgg16_has_the_standard_stage_names() {
        let net = Network::vgg16(0).unwrap();
        let names = net.layer_names();
        assert_eq!(names.len(), 18);
        assert_eq!(names[0], "conv1_1");
        assert!(net.contains("conv4_2"));
        assert_eq!(names.last().unwrap(), "pool5");
        assert_eq!(net.input_shape(), (3, 224, 224));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let result = NetworkBuilder::new(3, 8, 8).conv("a", 2).max_pool("a").build();
        assert!(matches!(result, Err(StyleError::DuplicateLayer(name)) if name == "a"));
    }

    #[test]
    fn forward_rejects_mismatched_input() {
        let mut net = small_network();
        let result = net.forward(&Array3::zeros((3, 9, 8)));
        assert!(matches!(result, Err(StyleError::ShapeMismatch(_))));

        net.reshape_input(9, 8, 3);
        assert!(net.forward(&Array3::zeros((3, 9, 8))).is_ok());
        assert_eq!(net.activations("conv2").unwrap().dim(), (6, 5, 4));
    }

    #[test]
    fn activations_are_post_relu() {
        let mut net = small_network();
        net.forward(&random_input((3, 8, 8), 1)).unwrap();
        let act = net.activations("conv1").unwrap();
        assert_eq!(act.dim(), (4, 8, 8));
        assert!(act.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn set_output_gradient_accumulates() {
        let mut net = small_network();
        net.forward(&random_input((3, 8, 8), 2)).unwrap();
        let grad = Array3::<f32>::ones((6, 4, 4));
        net.set_output_gradient("conv2", &grad).unwrap();
        net.set_output_gradient("conv2", &grad).unwrap();
        assert_abs_diff_eq!(net.output_gradient("conv2").unwrap().sum(), 2.0 * 96.0);

        net.clear_gradients();
        assert_eq!(net.output_gradient("conv2").unwrap().sum(), 0.0);
    }

    #[test]
    fn split_backward_matches_single_backward() {
        let input = random_input((3, 8, 8), 3);
        let grad = random_input((6, 4, 4), 4);

        let mut whole = small_network();
        whole.forward(&input).unwrap();
        whole.set_output_gradient("conv2", &grad).unwrap();
        whole.backward("conv2", None).unwrap();

        let mut split = small_network();
        split.forward(&input).unwrap();
        split.set_output_gradient("conv2", &grad).unwrap();
        split.backward("conv2", Some("conv1")).unwrap();
        assert_eq!(split.output_gradient("conv1").unwrap().dim(), (4, 8, 8));
        split.backward("conv1", None).unwrap();

        let a = whole.input_gradient().unwrap();
        let b = split.input_gradient().unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-5);
        }
    }

    #[test]
    fn backward_range_must_point_towards_the_input() {
        let mut net = small_network();
        net.forward(&random_input((3, 8, 8), 6)).unwrap();
        let result = net.backward("conv1", Some("conv2"));
        assert!(matches!(result, Err(StyleError::BackwardRange { .. })));
        assert!(matches!(net.backward("nope", None), Err(StyleError::UnknownLayer(_))));
    }

    #[test]
    fn parameter_file_round_trip_preserves_activations() {
        let dir = std::env::temp_dir().join(format!("neural_style_params_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("small.txt");

        let source = small_network();
        source.save_parameters_to_file(&path).unwrap();

        let mut target = NetworkBuilder::new(3, 8, 8)
            .seed(99)
            .conv("conv1", 4)
            .max_pool("pool1")
            .conv("conv2", 6)
            .build()
            .unwrap();
        target.load_parameters_from_file(&path).unwrap();

        let mut source = source;
        let input = random_input((3, 8, 8), 7);
        source.forward(&input).unwrap();
        target.forward(&input).unwrap();
        let a = source.activations("conv2").unwrap();
        let b = target.activations("conv2").unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-5);
        }

        let mut mismatched = NetworkBuilder::new(3, 8, 8).conv("other", 4).build().unwrap();
        assert!(matches!(mismatched.load_parameters_from_file(&path), Err(StyleError::ModelFormat(_))));
        std::fs::remove_dir_all(&dir).ok();
    }
}
