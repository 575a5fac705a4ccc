//! Run options and per-layer loss weights.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::ml::error::Result;

//________________________________________________________________
/// Knobs of a single style transfer run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferOptions {
    /// Target length of the long image side after rescaling.
    pub length: usize,
    /// Style-to-content balance applied to every style term.
    pub ratio: f32,
    /// Maximum number of optimizer iterations.
    pub n_iter: usize,
    /// Number of correction pairs kept by the quasi-Newton optimizer.
    pub max_correction: usize,
    /// Emit per-iteration progress at `info` level instead of `debug`.
    pub verbose: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            length: 512,
            ratio: 1e5,
            n_iter: 512,
            max_correction: 8,
            verbose: false,
        }
    }
}
//________________________________________________________________
/// Loss weights keyed by layer name.
///
/// A layer may carry a content weight, a style weight, or both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleWeights {
    #[serde(default)]
    pub content: BTreeMap<String, f32>,
    #[serde(default)]
    pub style: BTreeMap<String, f32>,
}

impl Default for StyleWeights {
    fn default() -> Self {
        let content = [("conv4_2", 1.0)];
        let style = [("conv1_1", 0.2), ("conv2_1", 0.2), ("conv3_1", 0.2), ("conv4_1", 0.2), ("conv5_1", 0.2)];

        Self {
            content: content.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            style: style.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }
}

impl StyleWeights {
    pub fn new() -> Self {
        Self { content: BTreeMap::new(), style: BTreeMap::new() }
    }

    pub fn with_content(mut self, layer: &str, weight: f32) -> Self {
        self.content.insert(layer.to_string(), weight);
        self
    }

    pub fn with_style(mut self, layer: &str, weight: f32) -> Self {
        self.style.insert(layer.to_string(), weight);
        self
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn content_layers(&self) -> Vec<String> {
        self.content.keys().cloned().collect()
    }

    pub fn style_layers(&self) -> Vec<String> {
        self.style.keys().cloned().collect()
    }
}
//________________________________________________________________
