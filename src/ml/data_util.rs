extern crate ndarray;

use image::{Rgb32FImage, RgbImage};
use ndarray::Array3;
use std::path::Path;
use tracing::debug;

use crate::ml::error::{Result, StyleError};
use crate::ml::types::Image;

//________________________________________________________________
/// Decodes an image file into (H, W, 3) RGB floats in [0, 1].
pub fn load_image(path: &Path) -> Result<Image> {
    let decoded = image::open(path)?;
    let rgb: Rgb32FImage = decoded.into_rgb32f();
    let (width, height) = rgb.dimensions();
    debug!(path = %path.display(), height, width, "loaded image");

    Array3::from_shape_vec((height as usize, width as usize, 3), rgb.into_raw())
        .map_err(|e| StyleError::ShapeMismatch(e.to_string()))
}
//________________________________________________________________
/// Encodes an (H, W, 3) RGB image, clamping to [0, 1] and quantising to
/// 8 bits. The format follows the file extension.
pub fn save_image(image: &Image, path: &Path) -> Result<()> {
    let (height, width, channels) = image.dim();
    if channels != 3 {
        return Err(StyleError::shape((height, width, 3), image.dim()));
    }

    let raw: Vec<u8> = image.iter()
        .map(|&v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
        .collect();
    let buffer = RgbImage::from_raw(width as u32, height as u32, raw)
        .ok_or_else(|| StyleError::shape((height, width, 3), image.dim()))?;

    buffer.save(path)?;
    debug!(path = %path.display(), height, width, "saved image");
    Ok(())
}
//________________________________________________________________

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::env;
    use std::fs;

    #[test]
    fn png_round_trip_keeps_layout_and_values() {
        let image = Array3::from_shape_fn((4, 6, 3), |(y, x, c)| ((y * 6 + x) * 3 + c) as f32 / 72.0);
        let path = env::temp_dir().join(format!("neural_style_round_trip_{}.png", std::process::id()));

        save_image(&image, &path).unwrap();
        let loaded = load_image(&path).unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(loaded.dim(), (4, 6, 3));
        for (a, b) in image.iter().zip(loaded.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1.0 / 255.0);
        }
    }

    #[test]
    fn saving_clamps_out_of_range_values() {
        let mut image = Array3::<f32>::zeros((2, 2, 3));
        image[(0, 0, 0)] = 1.7;
        image[(1, 1, 2)] = -0.4;
        let path = env::temp_dir().join(format!("neural_style_clamp_{}.png", std::process::id()));

        save_image(&image, &path).unwrap();
        let loaded = load_image(&path).unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(loaded[(0, 0, 0)], 1.0);
        assert_eq!(loaded[(1, 1, 2)], 0.0);
    }

    #[test]
    fn missing_files_surface_the_decoder_error() {
        let result = load_image(Path::new("does/not/exist.png"));
        assert!(matches!(result, Err(StyleError::Image(_)) | Err(StyleError::Io(_))));
    }

    #[test]
    fn saving_rejects_non_rgb_arrays() {
        let image = Array3::<f32>::zeros((2, 2, 4));
        let result = save_image(&image, Path::new("unused.png"));
        assert!(matches!(result, Err(StyleError::ShapeMismatch(_))));
    }
}
