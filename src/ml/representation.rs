extern crate ndarray;

use ndarray::prelude::*;
use std::collections::{BTreeSet, HashMap};

use crate::ml::error::Result;
use crate::ml::types::*;
use crate::ml::util::to_matrix;

//________________________________________________________________
/// Channel x channel self-correlation of an activation matrix, times `scale`.
pub fn gram_matrix(features: &Array2<f32>, scale: f32) -> Array2<f32> {
    let mut gram = features.dot(&features.t());
    if scale != 1.0 {
        gram.mapv_inplace(|v| v * scale);
    }
    gram
}
//________________________________________________________________
/// Runs one forward pass and returns the (channels, H*W) activation matrix
/// of every requested layer.
pub fn extract_features<N, S>(net: &mut N, net_in: &Array3<f32>, layers: &[S]) -> Result<HashMap<String, Array2<f32>>>
where
    N: FeatureExtractor + ?Sized,
    S: AsRef<str>,
{
    net.forward(net_in)?;

    let mut features = HashMap::new();
    for layer in layers.iter() {
        let layer = layer.as_ref();
        if features.contains_key(layer) {
            continue;
        }
        features.insert(layer.to_string(), to_matrix(net.activations(layer)?)?);
    }
    Ok(features)
}
//________________________________________________________________
/// Style (Gram) and content (activation) representations of one image.
///
/// The content map holds the activation matrix of every requested layer,
/// style layers included, unless no content layers were requested at all.
/// Only style layers get a Gram matrix.
pub fn compute_representations<N, S>(
    net: &mut N,
    net_in: &Array3<f32>,
    layers_style: &[S],
    layers_content: &[S],
    gram_scale: f32,
) -> Result<(StyleReprs, ContentReprs)>
where
    N: FeatureExtractor + ?Sized,
    S: AsRef<str>,
{
    let style: BTreeSet<&str> = layers_style.iter().map(|l| l.as_ref()).collect();
    let union: Vec<&str> = style.iter().cloned()
        .chain(layers_content.iter().map(|l| l.as_ref()))
        .collect();

    let features = extract_features(net, net_in, union.as_slice())?;

    let mut repr_s: StyleReprs = HashMap::new();
    for layer in style.iter() {
        repr_s.insert(layer.to_string(), gram_matrix(&features[*layer], gram_scale));
    }

    let repr_c: ContentReprs = if layers_content.is_empty() {
        HashMap::new()
    } else {
        features
    };

    Ok((repr_s, repr_c))
}
//________________________________________________________________

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::network::{Network, NetworkBuilder};
    use approx::assert_abs_diff_eq;
    use ndarray::Array;
    use ndarray_rand::RandomExt;
    use rand::distributions::Uniform;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_network() -> Network {
        NetworkBuilder::new(3, 8, 8)
            .seed(21)
            .conv("conv1", 4)
            .max_pool("pool1")
            .conv("conv2", 5)
            .build()
            .unwrap()
    }

    fn random_input(seed: u64) -> Array3<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array::random_using((3, 8, 8), Uniform::new(-100.0, 100.0), &mut rng)
    }

    #[test]
    fn gram_matrix_is_symmetric_and_scaled() {
        let mut rng = StdRng::seed_from_u64(1);
        let features: Array2<f32> = Array::random_using((6, 17), Uniform::new(0.0, 3.0), &mut rng);
        let gram = gram_matrix(&features, 1.0);
        let scaled = gram_matrix(&features, 0.25);
        assert_eq!(gram.dim(), (6, 6));
        for i in 0..6 {
            for j in 0..6 {
                assert_abs_diff_eq!(gram[(i, j)], gram[(j, i)], epsilon = 1e-4);
                assert_abs_diff_eq!(scaled[(i, j)], 0.25 * gram[(i, j)], epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn empty_layer_sets_give_empty_maps() {
        let mut net = small_network();
        let none: [&str; 0] = [];
        let (repr_s, repr_c) = compute_representations(&mut net, &random_input(2), &none, &none, 1.0).unwrap();
        assert!(repr_s.is_empty());
        assert!(repr_c.is_empty());
    }

    #[test]
    fn style_only_and_content_only_requests() {
        let mut net = small_network();
        let input = random_input(3);

        let (repr_s, repr_c) = compute_representations(&mut net, &input, &["conv1", "conv2"], &[], 1.0).unwrap();
        assert_eq!(repr_s.len(), 2);
        assert_eq!(repr_s["conv1"].dim(), (4, 4));
        assert_eq!(repr_s["conv2"].dim(), (5, 5));
        assert!(repr_c.is_empty());

        let (repr_s, repr_c) = compute_representations(&mut net, &input, &[], &["conv2"], 1.0).unwrap();
        assert!(repr_s.is_empty());
        assert_eq!(repr_c["conv2"].dim(), (5, 16));
    }

    #[test]
    fn content_map_covers_the_union_of_layers() {
        let mut net = small_network();
        let (repr_s, repr_c) = compute_representations(&mut net, &random_input(4), &["conv1"], &["conv2"], 1.0).unwrap();
        assert_eq!(repr_s.len(), 1);
        assert_eq!(repr_c.len(), 2);
        assert_eq!(repr_c["conv1"].dim(), (4, 64));
    }

    #[test]
    fn representations_are_repeatable() {
        let mut net = small_network();
        let input = random_input(5);
        let first = compute_representations(&mut net, &input, &["conv1", "conv2"], &["conv2"], 0.5).unwrap();
        let second = compute_representations(&mut net, &input, &["conv1", "conv2"], &["conv2"], 0.5).unwrap();
        assert_eq!(first.0, second.0);
        assert_eq!(first.1, second.1);
    }

    #[test]
    fn unknown_layers_are_reported() {
        let mut net = small_network();
        let result = compute_representations(&mut net, &random_input(6), &["conv9"], &[], 1.0);
        assert!(result.is_err());
    }
}
