use std::num::NonZeroU32;

use log::{debug, info};
use rayon::prelude::*;

use crate::{
    norm::{NormType, clip_grad_norm, grad_norm},
    optim::{OptimErr, Optimizer, Param},
    state::{self, StateDict, Stateful},
};

const DEFAULT_GROWTH_INTERVAL: NonZeroU32 = NonZeroU32::new(2000).unwrap();

/// Immutable settings of a `GradScaler`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalerConfig {
    /// When false the scaler is a pass-through: no scaling and no overflow checks.
    pub enabled: bool,
    pub init_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    /// Consecutive steps without overflow before the scale grows.
    pub growth_interval: NonZeroU32,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            init_scale: 65536.,
            growth_factor: 2.,
            backoff_factor: 0.5,
            growth_interval: DEFAULT_GROWTH_INTERVAL,
        }
    }
}

/// How a single call to `GradScaler::step` should treat the gradients.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct StepOpts {
    /// Clip the global gradient norm to this value before stepping.
    pub clip_grad: Option<f32>,
    pub norm_type: NormType,
    /// False while accumulating gradients, nothing past the backward pass runs then.
    pub update_grad: bool,
}

impl StepOpts {
    /// Options for a step that updates the parameters, without clipping.
    pub fn update() -> Self {
        Self {
            update_grad: true,
            ..Self::default()
        }
    }

    /// Options for a step that only accumulates gradients.
    pub fn accumulate() -> Self {
        Self::default()
    }

    pub fn with_clip(mut self, max_norm: f32) -> Self {
        self.clip_grad = Some(max_norm);
        self
    }
}

/// What happened during a call to `GradScaler::step`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    /// The global gradient norm, after clipping if it was requested.
    /// `None` if the step only accumulated gradients.
    pub norm: Option<f32>,
    /// Whether the gradients overflowed and the optimizer step was skipped.
    pub overflow: bool,
    /// The scale factor for the next step.
    pub scale: f32,
}

/// Mixed precision loss scaling with dynamic scale adjustment.
///
/// The loss is multiplied by the scale before the backward pass so that small
/// gradients stay representable in reduced precision. Gradients are divided
/// back before the optimizer sees them; if any of them isn't finite the step
/// is skipped and the scale shrinks, and after `growth_interval` clean steps
/// in a row the scale grows.
#[derive(Debug, Clone)]
pub struct GradScaler {
    cfg: ScalerConfig,
    scale: f32,
    growth_tracker: u32,
}

impl GradScaler {
    /// Creates a new `GradScaler`.
    pub fn new(cfg: ScalerConfig) -> Self {
        let scale = if cfg.enabled { cfg.init_scale } else { 1. };

        Self {
            cfg,
            scale,
            growth_tracker: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.cfg.enabled
    }

    /// The current scale factor, one when disabled.
    pub fn scale_factor(&self) -> f32 {
        self.scale
    }

    /// The amount of consecutive steps without overflow since the last change of scale.
    pub fn growth_tracker(&self) -> u32 {
        self.growth_tracker
    }

    pub fn scale(&self, loss: f32) -> f32 {
        loss * self.scale
    }

    /// Divides every gradient by the scale factor in place.
    ///
    /// # Returns
    /// Whether any unscaled gradient is not finite, always false when disabled.
    pub fn unscale(&self, params: &mut [Param]) -> bool {
        if !self.cfg.enabled {
            return false;
        }

        let inv_scale = self.scale.recip();

        params
            .par_iter_mut()
            .filter_map(|p| p.grad.as_mut())
            .map(|g| {
                g.mapv_inplace(|x| x * inv_scale);
                g.iter().any(|x| !x.is_finite())
            })
            .reduce(|| false, |a, b| a || b)
    }

    /// Adjusts the scale factor after a step.
    ///
    /// # Arguments
    /// * `found_inf` - Whether the step's gradients overflowed.
    pub fn update(&mut self, found_inf: bool) {
        if !self.cfg.enabled {
            return;
        }

        if found_inf {
            self.scale *= self.cfg.backoff_factor;
            self.growth_tracker = 0;
            return;
        }

        self.growth_tracker += 1;
        if self.growth_tracker == self.cfg.growth_interval.get() {
            let grown = self.scale * self.cfg.growth_factor;
            if grown.is_finite() {
                self.scale = grown;
            }
            self.growth_tracker = 0;
        }
    }

    /// Runs a backward pass on the scaled loss and, on update steps, unscales,
    /// measures or clips the gradients and steps the optimizer.
    ///
    /// # Arguments
    /// * `backward` - Accumulates into `params` the gradients of the loss multiplied
    ///   by the factor it's given.
    /// * `optimizer` - The optimizer to step if the gradients are finite.
    /// * `params` - The parameters being trained.
    /// * `opts` - Clipping and accumulation options.
    ///
    /// # Returns
    /// The outcome of the step, or the optimizer's error.
    pub fn step<F, O>(
        &mut self,
        backward: F,
        optimizer: &mut O,
        params: &mut [Param],
        opts: StepOpts,
    ) -> Result<StepOutcome, OptimErr>
    where
        F: FnOnce(f32, &mut [Param]) -> Result<(), OptimErr>,
        O: Optimizer + ?Sized,
    {
        backward(self.scale, params)?;

        if !opts.update_grad {
            return Ok(StepOutcome {
                norm: None,
                overflow: false,
                scale: self.scale,
            });
        }

        let found_inf = self.unscale(params);

        let norm = match opts.clip_grad {
            Some(max_norm) => {
                clip_grad_norm(params, max_norm, opts.norm_type);
                grad_norm(params, opts.norm_type)
            }
            None => grad_norm(params, opts.norm_type),
        };

        if found_inf {
            debug!(scale = self.scale; "gradient overflow, skipping the optimizer step");
        } else {
            optimizer.step(params)?;
        }

        let before = self.scale;
        self.update(found_inf);
        if self.scale > before {
            info!(scale = self.scale; "loss scale grew");
        }

        Ok(StepOutcome {
            norm: Some(norm),
            overflow: found_inf,
            scale: self.scale,
        })
    }
}

impl Stateful for GradScaler {
    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        if !self.cfg.enabled {
            return state;
        }

        state.insert_value("scale", &self.scale);
        state.insert_value("growth_factor", &self.cfg.growth_factor);
        state.insert_value("backoff_factor", &self.cfg.backoff_factor);
        state.insert_value("growth_interval", &self.cfg.growth_interval.get());
        state.insert_value("growth_tracker", &self.growth_tracker);
        state
    }

    fn load_state_dict(&mut self, state: StateDict) -> state::Result<()> {
        if !self.cfg.enabled {
            return Ok(());
        }

        let growth_interval: u32 = state.value("growth_interval")?;
        self.cfg.growth_interval =
            NonZeroU32::new(growth_interval).ok_or_else(|| state::StateErr::WrongType {
                key: "growth_interval".to_string(),
                detail: "must not be zero".to_string(),
            })?;
        self.scale = state.value("scale")?;
        self.cfg.growth_factor = state.value("growth_factor")?;
        self.cfg.backoff_factor = state.value("backoff_factor")?;
        self.growth_tracker = state.value("growth_tracker")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::arr1;

    use super::*;
    use crate::optim::Sgd;

    fn scaler(growth_interval: u32) -> GradScaler {
        GradScaler::new(ScalerConfig {
            init_scale: 8.,
            growth_interval: NonZeroU32::new(growth_interval).unwrap(),
            ..ScalerConfig::default()
        })
    }

    #[test]
    fn scale_shrinks_on_overflow_and_grows_after_the_interval() {
        let mut s = scaler(2);

        s.update(true);
        assert_eq!(s.scale_factor(), 4.);

        s.update(false);
        assert_eq!((s.scale_factor(), s.growth_tracker()), (4., 1));

        s.update(false);
        assert_eq!((s.scale_factor(), s.growth_tracker()), (8., 0));

        s.update(false);
        s.update(true);
        assert_eq!((s.scale_factor(), s.growth_tracker()), (4., 0));
    }

    #[test]
    fn unscale_divides_and_detects_non_finite() {
        let s = scaler(10);
        let mut p = Param::new("w", arr1(&[0.0, 0.0]).into_dyn());
        p.grad = Some(arr1(&[8.0, 16.0]).into_dyn());
        let mut params = vec![p];

        assert!(!s.unscale(&mut params));
        assert_eq!(params[0].grad, Some(arr1(&[1.0, 2.0]).into_dyn()));

        params[0].grad = Some(arr1(&[f32::NAN, 1.0]).into_dyn());
        assert!(s.unscale(&mut params));
    }

    #[test]
    fn accumulation_steps_return_no_norm() {
        let mut s = scaler(10);
        let mut sgd = Sgd::new(1.0, 0.0);
        let mut params = vec![Param::new("w", arr1(&[1.0]).into_dyn())];

        let outcome = s
            .step(
                |scale, params| params[0].accumulate_grad(arr1(&[scale]).into_dyn().view()),
                &mut sgd,
                &mut params,
                StepOpts::accumulate(),
            )
            .unwrap();

        assert_eq!(outcome.norm, None);
        assert_eq!(params[0].value, arr1(&[1.0]).into_dyn());
        assert_eq!(params[0].grad, Some(arr1(&[8.0]).into_dyn()));
    }

    #[test]
    fn update_steps_report_the_clipped_norm() {
        let mut s = scaler(10);
        let mut sgd = Sgd::new(1.0, 0.0);
        let mut params = vec![Param::new("w", arr1(&[0.0, 0.0]).into_dyn())];

        let outcome = s
            .step(
                |scale, params| {
                    params[0].accumulate_grad(arr1(&[3.0 * scale, 4.0 * scale]).into_dyn().view())
                },
                &mut sgd,
                &mut params,
                StepOpts::update().with_clip(1.0),
            )
            .unwrap();

        let norm = outcome.norm.unwrap();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(!outcome.overflow);
        let w: Vec<f32> = params[0].value.iter().copied().collect();
        assert!((w[0] + 0.6).abs() < 1e-5 && (w[1] + 0.8).abs() < 1e-5, "{w:?}");
    }

    #[test]
    fn disabled_scaler_is_a_pass_through() {
        let mut s = GradScaler::new(ScalerConfig {
            enabled: false,
            ..ScalerConfig::default()
        });

        assert_eq!(s.scale(3.0), 3.0);
        s.update(true);
        assert_eq!(s.scale_factor(), 1.0);
        assert!(s.state_dict().is_empty());

        let mut state = StateDict::new();
        state.insert_value("scale", &2.0f32);
        s.load_state_dict(state).unwrap();
        assert_eq!(s.scale_factor(), 1.0);
    }
}
