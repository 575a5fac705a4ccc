extern crate ndarray;

use ndarray::{Array2, Zip};

use crate::ml::error::{Result, StyleError};
use crate::ml::representation::gram_matrix;

//________________________________________________________________
/// Style loss and its gradient w.r.t. the activation matrix `features`
/// (channels x spatial) of one layer.
///
/// `gram` must be the Gram matrix of `features`. The gradient is gated by the
/// rectifier at the representation layer: it is zero wherever `features <= 0`.
pub fn style_loss_and_grad(features: &Array2<f32>, gram: &Array2<f32>, target_gram: &Array2<f32>) -> Result<(f64, Array2<f32>)> {
    let (channels, spatial) = features.dim();
    if gram.dim() != (channels, channels) {
        return Err(StyleError::shape((channels, channels), gram.dim()));
    }
    if target_gram.dim() != gram.dim() {
        return Err(StyleError::shape(gram.dim(), target_gram.dim()));
    }

    let c = 1.0 / ((channels as f64).powi(2) * (spatial as f64).powi(2));
    let error = gram - target_gram;
    let loss = c / 4.0 * error.iter().map(|&e| (e as f64).powi(2)).sum::<f64>();

    let mut grad = error.dot(features);
    let scale = c as f32;
    Zip::from(&mut grad).and(features).for_each(|g, &f| {
        *g = if f > 0.0 { *g * scale } else { 0.0 };
    });

    Ok((loss, grad))
}
//________________________________________________________________
/// Same as [`style_loss_and_grad`], computing the current Gram matrix itself.
pub fn style_loss_from_features(features: &Array2<f32>, target_gram: &Array2<f32>) -> Result<(f64, Array2<f32>)> {
    let gram = gram_matrix(features, 1.0);
    style_loss_and_grad(features, &gram, target_gram)
}
//________________________________________________________________
/// Squared-error content loss and its rectifier-gated gradient.
pub fn content_loss_and_grad(features: &Array2<f32>, target: &Array2<f32>) -> Result<(f64, Array2<f32>)> {
    if features.dim() != target.dim() {
        return Err(StyleError::shape(target.dim(), features.dim()));
    }

    let mut grad = features - target;
    let loss = grad.iter().map(|&e| (e as f64).powi(2)).sum::<f64>() / 2.0;
    Zip::from(&mut grad).and(features).for_each(|g, &f| {
        if f <= 0.0 {
            *g = 0.0;
        }
    });

    Ok((loss, grad))
}
//________________________________________________________________
