extern crate ndarray;

use image::imageops::{self, FilterType};
use image::Rgb32FImage;
use ndarray::{Array3, Axis};

use crate::ml::error::{Result, StyleError};
use crate::ml::types::Image;

/// Oversampling applied to the style image on top of the content scale.
pub const STYLE_SCALE: f64 = 1.2;

/// ImageNet mean in BGR order, as expected by VGG-style networks.
pub const IMAGENET_MEAN_BGR: [f32; 3] = [104.00699, 116.66877, 122.67892];

//________________________________________________________________
/// Moves images between (H, W, 3) RGB in [0, 1] and the network's
/// (3, H, W) mean-subtracted input space.
#[derive(Debug, Clone, PartialEq)]
pub struct Transformer {
    pub mean: [f32; 3],
    pub raw_scale: f32,
    // input channel feeding each network channel
    pub channel_swap: [usize; 3],
}

impl Default for Transformer {
    fn default() -> Self {
        Self {
            mean: IMAGENET_MEAN_BGR,
            raw_scale: 255.0,
            channel_swap: [2, 1, 0],
        }
    }
}

impl Transformer {
    pub fn new(mean: [f32; 3], raw_scale: f32, channel_swap: [usize; 3]) -> Self {
        Self { mean, raw_scale, channel_swap }
    }

    pub fn preprocess(&self, image: &Image) -> Result<Array3<f32>> {
        let (height, width, channels) = image.dim();
        if channels != 3 {
            return Err(StyleError::shape((height, width, 3), image.dim()));
        }

        let chw = image.view().permuted_axes([2, 0, 1]);
        let mut data = Array3::<f32>::zeros((3, height, width));
        for (c, mut plane) in data.axis_iter_mut(Axis(0)).enumerate() {
            let source = chw.index_axis(Axis(0), self.channel_swap[c]);
            let (scale, mean) = (self.raw_scale, self.mean[c]);
            plane.zip_mut_with(&source, |d, &s| *d = s * scale - mean);
        }

        Ok(data)
    }

    pub fn deprocess(&self, data: &Array3<f32>) -> Result<Image> {
        let (channels, height, width) = data.dim();
        if channels != 3 {
            return Err(StyleError::shape((3, height, width), data.dim()));
        }

        let mut image = Array3::<f32>::zeros((height, width, 3));
        for (c, plane) in data.axis_iter(Axis(0)).enumerate() {
            let mut target = image.index_axis_mut(Axis(2), self.channel_swap[c]);
            let (scale, mean) = (self.raw_scale, self.mean[c]);
            target.zip_mut_with(&plane, |d, &s| *d = (s + mean) / scale);
        }

        Ok(image)
    }

    /// Per network channel (min, max) of any preprocessed [0, 1] image.
    pub fn channel_bounds(&self) -> [(f32, f32); 3] {
        let mut bounds = [(0.0, 0.0); 3];
        for (c, bound) in bounds.iter_mut().enumerate() {
            let min = -self.mean[c];
            *bound = (min, min + self.raw_scale);
        }
        bounds
    }

    /// Box constraints for a flattened (3, H, W) input: all channel-0 pixels,
    /// then channel 1, then channel 2.
    pub fn pixel_bounds(&self, height: usize, width: usize) -> Vec<(f64, f64)> {
        let plane = height * width;
        let mut bounds = Vec::with_capacity(3 * plane);
        for (min, max) in self.channel_bounds().iter() {
            bounds.extend(std::iter::repeat((*min as f64, *max as f64)).take(plane));
        }
        bounds
    }
}
//________________________________________________________________
/// Scale factor that makes the long side `length` while keeping the short
/// side at least `input_size`; the larger requirement wins.
pub fn rescale_factor(height: usize, width: usize, length: usize, input_size: usize) -> f64 {
    let long = height.max(width) as f64;
    let short = height.min(width) as f64;
    (length as f64 / long).max(input_size as f64 / short)
}
//________________________________________________________________
pub fn scaled_dims(height: usize, width: usize, scale: f64) -> (usize, usize) {
    let h = ((height as f64 * scale).round() as usize).max(1);
    let w = ((width as f64 * scale).round() as usize).max(1);
    (h, w)
}
//________________________________________________________________
/// Bilinear rescale of an (H, W, 3) image.
pub fn rescale(image: &Image, scale: f64) -> Result<Image> {
    let (height, width, channels) = image.dim();
    if channels != 3 {
        return Err(StyleError::shape((height, width, 3), image.dim()));
    }
    let (new_h, new_w) = scaled_dims(height, width, scale);

    let raw: Vec<f32> = image.as_standard_layout().iter().cloned().collect();
    let buffer = Rgb32FImage::from_raw(width as u32, height as u32, raw)
        .ok_or_else(|| StyleError::shape((height, width, 3), image.dim()))?;
    let resized = imageops::resize(&buffer, new_w as u32, new_h as u32, FilterType::Triangle);

    Array3::from_shape_vec((new_h, new_w, 3), resized.into_raw())
        .map_err(|e| StyleError::ShapeMismatch(e.to_string()))
}
//________________________________________________________________
