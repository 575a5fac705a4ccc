//! Style transfer objective: loss and input-space gradient of a candidate image.
//!
//! The weighted layers are visited from the output side towards the input.
//! At each one the style and content terms are added into the layer's output
//! gradient, then the combined gradient is carried back to the previous
//! weighted layer (or to the input) in a single partial backward pass.

extern crate ndarray;

use ndarray::{Array1, Array2, Array3};
use tracing::trace;

use crate::ml::config::StyleWeights;
use crate::ml::error::{Result, StyleError};
use crate::ml::functional::*;
use crate::ml::representation::{extract_features, gram_matrix};
use crate::ml::types::*;

//________________________________________________________________
/// A network layer that carries at least one loss weight.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedLayer {
    pub name: String,
    pub style: Option<f32>,
    pub content: Option<f32>,
}

/// Checks every weighted layer against the network and returns the weighted
/// layers in the network's topological order.
pub fn build_schedule<N>(net: &N, weights: &StyleWeights) -> Result<Vec<WeightedLayer>>
where
    N: FeatureExtractor + ?Sized,
{
    let names = net.layer_names();
    for layer in weights.style.keys().chain(weights.content.keys()) {
        if !names.iter().any(|name| name == layer) {
            return Err(StyleError::InvalidWeightsConfig(layer.clone()));
        }
    }

    let layers = names.into_iter()
        .filter_map(|name| {
            let style = weights.style.get(&name).copied();
            let content = weights.content.get(&name).copied();
            if style.is_none() && content.is_none() {
                None
            } else {
                Some(WeightedLayer { name, style, content })
            }
        })
        .collect();

    Ok(layers)
}
//________________________________________________________________
/// Fixed targets of an optimization run.
#[derive(Debug, Clone, Default)]
pub struct Targets {
    pub style: StyleReprs,
    pub content: ContentReprs,
}
//________________________________________________________________
/// Everything the objective needs besides the candidate itself. Holds the
/// network exclusively for the duration of the run.
pub struct StyleObjective<'a, N: FeatureExtractor + ?Sized> {
    net: &'a mut N,
    layers: &'a [WeightedLayer],
    targets: &'a Targets,
    ratio: f32,
    evaluations: usize,
}

impl<'a, N: FeatureExtractor + ?Sized> StyleObjective<'a, N> {
    pub fn new(net: &'a mut N, layers: &'a [WeightedLayer], targets: &'a Targets, ratio: f32) -> Self {
        Self { net, layers, targets, ratio, evaluations: 0 }
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    /// Total loss and gradient for the flattened (channel-major) candidate `x`.
    pub fn evaluate(&mut self, x: &Array1<f64>) -> Result<(f64, Array1<f64>)> {
        self.evaluations += 1;

        let shape = self.net.input_shape();
        let (c, h, w) = shape;
        if x.len() != c * h * w {
            return Err(StyleError::shape(c * h * w, x.len()));
        }
        let net_in = Array3::from_shape_vec(shape, x.iter().map(|&v| v as f32).collect())
            .map_err(|e| StyleError::ShapeMismatch(e.to_string()))?;

        let names: Vec<&str> = self.layers.iter().map(|layer| layer.name.as_str()).collect();
        let features = extract_features(&mut *self.net, &net_in, names.as_slice())?;

        self.net.clear_gradients();
        let mut loss = 0.0f64;

        for (i, layer) in self.layers.iter().enumerate().rev() {
            let next_layer = if i == 0 { None } else { Some(self.layers[i - 1].name.as_str()) };
            let fl = &features[&layer.name];
            let mut grad = Array2::<f32>::zeros(fl.dim());

            if let Some(wl) = layer.style {
                let target = self.targets.style.get(&layer.name)
                    .ok_or_else(|| StyleError::MissingTarget(layer.name.clone()))?;
                let gram = gram_matrix(fl, 1.0);
                let (l, g) = style_loss_and_grad(fl, &gram, target)?;
                loss += wl as f64 * l * self.ratio as f64;
                grad.scaled_add(wl * self.ratio, &g);
            }

            if let Some(wl) = layer.content {
                let target = self.targets.content.get(&layer.name)
                    .ok_or_else(|| StyleError::MissingTarget(layer.name.clone()))?;
                let (l, g) = content_loss_and_grad(fl, target)?;
                loss += wl as f64 * l;
                grad.scaled_add(wl, &g);
            }

            let dims = self.net.output_dim(&layer.name)?;
            let grad = grad.into_shape(dims)
                .map_err(|e| StyleError::ShapeMismatch(e.to_string()))?;
            self.net.set_output_gradient(&layer.name, &grad)?;
            self.net.backward(&layer.name, next_layer)?;
        }

        let input_grad = self.net.input_gradient()?;
        let grad = Array1::from_iter(input_grad.iter().map(|&v| v as f64));
        trace!(evaluation = self.evaluations, loss, "objective evaluated");

        Ok((loss, grad))
    }
}
//________________________________________________________________
