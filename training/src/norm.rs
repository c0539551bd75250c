use rayon::prelude::*;

use crate::optim::Param;

const CLIP_EPS: f32 = 1e-6;

/// Which norm to reduce gradients with.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum NormType {
    #[default]
    L2,
    Inf,
}

/// Computes the global norm of every parameter's gradient.
///
/// Parameters without a gradient are skipped, and the norm is zero if none has one.
///
/// # Arguments
/// * `params` - The parameters whose gradients to measure.
/// * `norm_type` - `L2` for the square root of the sum of every gradient's squared
///   L2 norm, `Inf` for the largest absolute gradient value.
pub fn grad_norm(params: &[Param], norm_type: NormType) -> f32 {
    let grads = params.par_iter().filter_map(|p| p.grad.as_ref());

    match norm_type {
        NormType::L2 => grads
            .map(|g| {
                let norm = g.iter().map(|x| x * x).sum::<f32>().sqrt();
                norm * norm
            })
            .sum::<f32>()
            .sqrt(),
        NormType::Inf => grads
            .map(|g| g.iter().map(|x| x.abs()).fold(0f32, nan_max))
            .reduce(|| 0., nan_max),
    }
}

/// Like `f32::max`, but a NaN on either side wins.
fn nan_max(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::NAN
    } else {
        a.max(b)
    }
}

/// Scales every gradient down so that their global norm is at most `max_norm`.
///
/// # Returns
/// The global norm before clipping.
pub fn clip_grad_norm(params: &mut [Param], max_norm: f32, norm_type: NormType) -> f32 {
    let norm = grad_norm(params, norm_type);
    let coef = max_norm / (norm + CLIP_EPS);

    if coef < 1. {
        params
            .par_iter_mut()
            .filter_map(|p| p.grad.as_mut())
            .for_each(|g| g.mapv_inplace(|x| x * coef));
    }

    norm
}

#[cfg(test)]
mod tests {
    use ndarray::arr1;

    use super::*;

    fn params() -> Vec<Param> {
        let mut a = Param::new("a", arr1(&[0.0, 0.0]).into_dyn());
        a.grad = Some(arr1(&[3.0, 0.0]).into_dyn());
        let mut b = Param::new("b", arr1(&[0.0]).into_dyn());
        b.grad = Some(arr1(&[-4.0]).into_dyn());
        let c = Param::new("c", arr1(&[100.0]).into_dyn());
        vec![a, b, c]
    }

    #[test]
    fn norms_skip_params_without_gradients() {
        let params = params();
        assert_eq!(grad_norm(&params, NormType::L2), 5.0);
        assert_eq!(grad_norm(&params, NormType::Inf), 4.0);
        assert_eq!(grad_norm(&params[2..], NormType::L2), 0.0);
        assert_eq!(grad_norm(&[], NormType::Inf), 0.0);
    }

    #[test]
    fn clipping_bounds_the_norm() {
        let mut params = params();
        let before = clip_grad_norm(&mut params, 1.0, NormType::L2);

        assert_eq!(before, 5.0);
        assert!((grad_norm(&params, NormType::L2) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn small_gradients_are_left_alone() {
        let mut params = params();
        clip_grad_norm(&mut params, 10.0, NormType::L2);
        assert_eq!(params[0].grad, Some(arr1(&[3.0, 0.0]).into_dyn()));
    }

    #[test]
    fn non_finite_gradients_poison_the_norm() {
        for norm_type in [NormType::L2, NormType::Inf] {
            let mut params = params();
            params[0].grad = Some(arr1(&[f32::NAN, 1.0]).into_dyn());
            assert!(grad_norm(&params, norm_type).is_nan(), "{norm_type:?}");

            params[0].grad = Some(arr1(&[1.0, f32::NAN]).into_dyn());
            assert!(grad_norm(&params, norm_type).is_nan(), "{norm_type:?}");

            params[0].grad = Some(arr1(&[f32::NEG_INFINITY, 1.0]).into_dyn());
            assert_eq!(grad_norm(&params, norm_type), f32::INFINITY, "{norm_type:?}");
        }
    }
}
