//! Style transfer session: rescaling, target representations, bounds and the
//! optimization run itself.

extern crate ndarray;

use ndarray::{Array1, Array3};
use tracing::{debug, info};

use crate::ml::config::{StyleWeights, TransferOptions};
use crate::ml::error::{Result, StyleError};
use crate::ml::network::Network;
use crate::ml::objective::{build_schedule, StyleObjective, Targets, WeightedLayer};
use crate::ml::optimisers::{Lbfgsb, Termination};
use crate::ml::representation::compute_representations;
use crate::ml::transformers::*;
use crate::ml::types::*;

//________________________________________________________________
/// Outcome of one `transfer_style` call.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferReport {
    /// Accepted optimizer iterations.
    pub nit: usize,
    /// Objective evaluations, line search included.
    pub nfev: usize,
    pub initial_loss: f64,
    pub final_loss: f64,
    pub termination: Termination,
    /// (height, width) the content image was rescaled to.
    pub output_dims: (usize, usize),
}
//________________________________________________________________
/// A single style transfer session owning its feature network.
///
/// The network's buffers are mutated by every run, so concurrent transfers
/// need separate sessions.
pub struct StyleTransfer<N: FeatureExtractor = Network> {
    net: N,
    transformer: Transformer,
    weights: StyleWeights,
    layers: Vec<WeightedLayer>,
    // short side of the network's native input
    input_size: usize,
    grad_iter: usize,
    generated: Option<Array3<f32>>,
}

impl<N: FeatureExtractor> StyleTransfer<N> {
    pub fn new(net: N, transformer: Transformer, weights: StyleWeights) -> Result<Self> {
        let layers = build_schedule(&net, &weights)?;
        let (_, height, width) = net.input_shape();
        debug!(layers = ?layers.iter().map(|l| l.name.as_str()).collect::<Vec<_>>(), "weighted layers");

        Ok(Self {
            net,
            transformer,
            weights,
            layers,
            input_size: height.min(width),
            grad_iter: 0,
            generated: None,
        })
    }

    pub fn weights(&self) -> &StyleWeights {
        &self.weights
    }

    pub fn layers(&self) -> &[WeightedLayer] {
        &self.layers
    }

    /// Iterations observed over every run of this session.
    pub fn grad_iter(&self) -> usize {
        self.grad_iter
    }

    pub fn network(&self) -> &N {
        &self.net
    }

    fn rescale_net(&mut self, image: &Image) {
        let (height, width, channels) = image.dim();
        self.net.reshape_input(height, width, channels);
    }

    /// Style Grams at the style size, scaled by content / style pixel count,
    /// then content activations at the content size. Leaves the network
    /// shaped for `img_content`.
    pub fn build_targets(&mut self, img_style: &Image, img_content: &Image) -> Result<Targets> {
        let style_layers = self.weights.style_layers();
        let content_layers = self.weights.content_layers();
        let no_layers: [String; 0] = [];

        self.rescale_net(img_style);
        let net_in = self.transformer.preprocess(img_style)?;
        let gram_scale = img_content.len() as f32 / img_style.len() as f32;
        let (style, _) = compute_representations(&mut self.net, &net_in, &style_layers, &no_layers, gram_scale)?;

        self.rescale_net(img_content);
        let net_in = self.transformer.preprocess(img_content)?;
        let (_, content) = compute_representations(&mut self.net, &net_in, &no_layers, &content_layers, 1.0)?;

        Ok(Targets { style, content })
    }

    /// Optimizes an image with the structure of `content` and the texture
    /// statistics of `style`. Both are (H, W, 3) RGB in [0, 1].
    pub fn transfer_style(&mut self, style: &Image, content: &Image, options: &TransferOptions) -> Result<TransferReport> {
        let (sh, sw, _) = style.dim();
        let scale = rescale_factor(sh, sw, options.length, self.input_size);
        let img_style = rescale(style, STYLE_SCALE * scale)?;

        let (ch, cw, _) = content.dim();
        let scale = rescale_factor(ch, cw, options.length, self.input_size);
        let img_content = rescale(content, scale)?;
        info!(style = ?img_style.dim(), content = ?img_content.dim(), "rescaled inputs");

        let targets = self.build_targets(&img_style, &img_content)?;
        let img0 = self.transformer.preprocess(&img_content)?;

        let (_, height, width) = img0.dim();
        let bounds = self.transformer.pixel_bounds(height, width);
        let x0 = Array1::from_iter(img0.iter().map(|&v| v as f64));

        let optimiser = Lbfgsb::new(options.n_iter).with_max_correction(options.max_correction);
        let n_iter = options.n_iter;
        let verbose = options.verbose;

        let grad_iter = &mut self.grad_iter;
        let mut objective = StyleObjective::new(&mut self.net, self.layers.as_slice(), &targets, options.ratio);
        let mut initial_loss = None;

        let result = optimiser.minimize(
            |x| {
                let (loss, grad) = objective.evaluate(x)?;
                initial_loss.get_or_insert(loss);
                Ok((loss, grad))
            },
            x0,
            &bounds,
            |state| {
                *grad_iter += 1;
                if verbose {
                    info!("Iteration: {}/{}", grad_iter, n_iter);
                } else {
                    debug!("Iteration: {}/{}", grad_iter, n_iter);
                }
                debug!(loss = state.loss, pg = state.projected_gradient_norm, "iteration {}", state.iteration);
            },
        )?;

        let generated = Array3::from_shape_vec((3, height, width), result.x.iter().map(|&v| v as f32).collect())
            .map_err(|e| StyleError::ShapeMismatch(e.to_string()))?;
        self.generated = Some(generated);

        let report = TransferReport {
            nit: result.nit,
            nfev: result.nfev,
            initial_loss: initial_loss.unwrap_or(result.fun),
            final_loss: result.fun,
            termination: result.termination,
            output_dims: (height, width),
        };
        info!(nit = report.nit, nfev = report.nfev, loss = report.final_loss, termination = ?report.termination, "style transfer finished");

        Ok(report)
    }

    /// The optimized image of the last run, back in (H, W, 3) RGB.
    pub fn get_generated(&self) -> Result<Image> {
        let data = self.generated.as_ref().ok_or(StyleError::NoResult)?;
        self.transformer.deprocess(data)
    }
}
//________________________________________________________________
