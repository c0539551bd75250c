//! Re-layouts of stored weights for use outside of training.

use std::collections::BTreeMap;

use ndarray::{Array2, Array4, ArrayD, ArrayViewD, Ix4};

use super::{CheckpointErr, Result};
use crate::state::StateDict;

const PREFIXES: [&str; 2] = ["module.encoder.", "encoder."];
const MASK_TOKEN: &str = "mask_token";
pub const PATCH_EMBED_WEIGHT: &str = "patch_embed.proj.weight";

/// Turns the weight of a linear patch projection into the kernel of the
/// equivalent strided convolution.
///
/// Each row of `weight` is a flattened `patch x patch x channels` patch, the
/// result is laid out as `[out, channels, patch, patch]`.
///
/// # Arguments
/// * `weight` - The linear weight, any shape whose element count divides into whole patches.
/// * `patch` - The side of a square patch.
/// * `channels` - The amount of input channels.
pub fn linear_to_conv(weight: ArrayViewD<'_, f32>, patch: usize, channels: usize) -> Result<Array4<f32>> {
    let per_row = patch * patch * channels;
    if per_row == 0 || weight.len() % per_row != 0 {
        return Err(CheckpointErr::Export(format!(
            "a weight of {} elements can't be split into {patch}x{patch}x{channels} patches",
            weight.len()
        )));
    }

    let data: Vec<f32> = weight.iter().copied().collect();
    let rows = data.len() / per_row;

    let kernel = Array4::from_shape_vec((rows, patch, patch, channels), data)
        .map_err(|e| CheckpointErr::Export(e.to_string()))?;

    Ok(kernel.permuted_axes([0, 3, 1, 2]).as_standard_layout().into_owned())
}

/// The inverse of `linear_to_conv`.
///
/// # Returns
/// A `[out, patch * patch * channels]` weight.
pub fn conv_to_linear(kernel: ArrayViewD<'_, f32>) -> Result<Array2<f32>> {
    let shape = kernel.shape().to_vec();
    let kernel = kernel
        .into_dimensionality::<Ix4>()
        .map_err(|_| CheckpointErr::Export(format!("expected a 4-d kernel, got {shape:?}")))?;

    let (rows, channels, patch_h, patch_w) = kernel.dim();
    let data: Vec<f32> = kernel.permuted_axes([0, 2, 3, 1]).iter().copied().collect();

    Array2::from_shape_vec((rows, patch_h * patch_w * channels), data)
        .map_err(|e| CheckpointErr::Export(e.to_string()))
}

/// Extracts the encoder of a model's state for inference.
///
/// Keeps the entries under `module.encoder.` or `encoder.` with the prefix
/// removed, drops everything else along with the mask token, and converts the
/// patch embedding to its convolutional layout.
///
/// # Arguments
/// * `model` - The model's full state.
/// * `patch`, `channels` - The patch embedding's geometry, see `linear_to_conv`.
pub fn encoder_state(model: StateDict, patch: usize, channels: usize) -> Result<StateDict> {
    let strip = |key: &str| -> Option<String> {
        PREFIXES.iter().find_map(|prefix| {
            let rest = key.strip_prefix(prefix)?;
            (rest != MASK_TOKEN).then(|| rest.to_string())
        })
    };

    let mut tensors: BTreeMap<String, ArrayD<f32>> = model
        .tensors
        .into_iter()
        .filter_map(|(k, v)| Some((strip(&k)?, v)))
        .collect();

    let values = model
        .values
        .into_iter()
        .filter_map(|(k, v)| Some((strip(&k)?, v)))
        .collect();

    let linear = tensors.get(PATCH_EMBED_WEIGHT).ok_or_else(|| {
        CheckpointErr::Export(format!("the encoder has no `{PATCH_EMBED_WEIGHT}`"))
    })?;
    let kernel = linear_to_conv(linear.view(), patch, channels)?;
    tensors.insert(PATCH_EMBED_WEIGHT.to_string(), kernel.into_dyn());

    Ok(StateDict { tensors, values })
}

#[cfg(test)]
mod tests {
    use ndarray::{Array, arr1};

    use super::*;

    #[test]
    fn conv_kernel_matches_the_linear_weight() {
        let (out, patch, channels) = (2, 4, 3);
        let linear = Array::from_iter((0..out * patch * patch * channels).map(|x| x as f32))
            .into_shape_with_order((out, patch * patch * channels))
            .unwrap();

        let kernel = linear_to_conv(linear.view().into_dyn(), patch, channels).unwrap();
        assert_eq!(kernel.shape(), &[out, channels, patch, patch]);

        for (o, c, p, q) in [(0, 0, 0, 0), (1, 2, 3, 1), (0, 1, 2, 3)] {
            let flat = (p * patch + q) * channels + c;
            assert_eq!(kernel[[o, c, p, q]], linear[[o, flat]]);
        }

        let back = conv_to_linear(kernel.view().into_dyn()).unwrap();
        assert_eq!(back, linear);
    }

    #[test]
    fn mismatched_geometry_is_rejected() {
        let linear = arr1(&[0.0f32; 10]).into_dyn();
        assert!(linear_to_conv(linear.view(), 2, 3).is_err());
        assert!(conv_to_linear(linear.view()).is_err());
    }

    #[test]
    fn encoder_keys_lose_their_prefix() {
        let mut model = StateDict::new();
        model.insert_tensor("module.encoder.patch_embed.proj.weight", ArrayD::zeros(vec![5, 12]));
        model.insert_tensor("encoder.blocks.0.w", ArrayD::zeros(vec![3]));
        model.insert_tensor("module.encoder.mask_token", ArrayD::zeros(vec![1]));
        model.insert_tensor("decoder.w", ArrayD::zeros(vec![1]));

        let encoder = encoder_state(model, 2, 3).unwrap();

        assert_eq!(
            encoder.tensors.keys().collect::<Vec<_>>(),
            vec!["blocks.0.w", "patch_embed.proj.weight"]
        );
        assert_eq!(encoder.tensors[PATCH_EMBED_WEIGHT].shape(), &[5, 3, 2, 2]);
    }
}
