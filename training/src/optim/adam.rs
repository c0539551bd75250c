use std::collections::BTreeMap;

use ndarray::{ArrayD, Zip};

use super::{Optimizer, Param, Result};
use crate::state::{self, StateDict, Stateful};

const FIRST_MOMENT: &str = "m/";
const SECOND_MOMENT: &str = "v/";

#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    beta1_t: f32,
    beta2_t: f32,
    m: BTreeMap<String, ArrayD<f32>>,
    v: BTreeMap<String, ArrayD<f32>>,
}

impl Adam {
    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `beta1`, `beta2`, `epsilon` - Hyperparameters to the optimization algorithm.
    ///
    /// # Returns
    /// A new `Adam` instance.
    pub fn new(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            beta1_t: 1.,
            beta2_t: 1.,
            m: BTreeMap::new(),
            v: BTreeMap::new(),
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut [Param]) -> Result<()> {
        let Self {
            learning_rate: lr,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            ..
        } = *self;

        // nothing moves unless every param can take the step
        for p in params.iter() {
            let Some(grad) = &p.grad else {
                continue;
            };
            p.check_shape("gradient", grad.shape())?;
            if let Some(m) = self.m.get(&p.name) {
                p.check_shape("first moment", m.shape())?;
            }
            if let Some(v) = self.v.get(&p.name) {
                p.check_shape("second moment", v.shape())?;
            }
        }

        self.beta1_t *= b1;
        self.beta2_t *= b2;

        let bc1 = 1. - self.beta1_t;
        let bc2 = 1. - self.beta2_t;
        let step_size = lr * (bc2.sqrt() / bc1);

        for p in params.iter_mut() {
            let Some(grad) = &p.grad else {
                continue;
            };

            let zeros = || ArrayD::zeros(p.value.raw_dim());
            let m = self.m.entry(p.name.clone()).or_insert_with(zeros);
            let v = self.v.entry(p.name.clone()).or_insert_with(zeros);

            Zip::from(&mut p.value)
                .and(grad)
                .and(m)
                .and(v)
                .for_each(|w, &g, m, v| {
                    *m = b1 * *m + (1. - b1) * g;
                    *v = b2 * *v + (1. - b2) * g.powi(2);
                    *w -= step_size * *m / (v.sqrt() + eps);
                });
        }

        Ok(())
    }
}

impl Stateful for Adam {
    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert_value("learning_rate", &self.learning_rate);
        state.insert_value("beta1", &self.beta1);
        state.insert_value("beta2", &self.beta2);
        state.insert_value("epsilon", &self.epsilon);
        state.insert_value("beta1_t", &self.beta1_t);
        state.insert_value("beta2_t", &self.beta2_t);

        for (name, m) in &self.m {
            state.insert_tensor(format!("{FIRST_MOMENT}{name}"), m.clone());
        }
        for (name, v) in &self.v {
            state.insert_tensor(format!("{SECOND_MOMENT}{name}"), v.clone());
        }

        state
    }

    fn load_state_dict(&mut self, mut state: StateDict) -> state::Result<()> {
        self.learning_rate = state.value("learning_rate")?;
        self.beta1 = state.value("beta1")?;
        self.beta2 = state.value("beta2")?;
        self.epsilon = state.value("epsilon")?;
        self.beta1_t = state.value("beta1_t")?;
        self.beta2_t = state.value("beta2_t")?;
        self.m = state.take_prefixed(FIRST_MOMENT);
        self.v = state.take_prefixed(SECOND_MOMENT);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::arr1;

    use super::*;
    use crate::optim::OptimErr;

    #[test]
    fn first_step_moves_by_the_learning_rate() {
        let mut p = Param::new("w", arr1(&[1.0f32, 1.0]).into_dyn());
        p.grad = Some(arr1(&[3.0, -0.5]).into_dyn());
        let mut params = vec![p];

        Adam::new(0.1, 0.9, 0.999, 1e-8).step(&mut params).unwrap();

        let w: Vec<f32> = params[0].value.iter().copied().collect();
        assert!((w[0] - 0.9).abs() < 1e-4, "{w:?}");
        assert!((w[1] - 1.1).abs() < 1e-4, "{w:?}");
    }

    #[test]
    fn state_round_trip_keeps_the_moments() {
        let mut p = Param::new("w", arr1(&[0.5f32]).into_dyn());
        p.grad = Some(arr1(&[0.25]).into_dyn());
        let mut a = vec![p];

        let mut adam = Adam::new(0.01, 0.9, 0.999, 1e-8);
        adam.step(&mut a).unwrap();

        let mut restored = Adam::new(1.0, 0.0, 0.0, 0.0);
        restored.load_state_dict(adam.state_dict()).unwrap();

        let mut b = a.clone();
        adam.step(&mut a).unwrap();
        restored.step(&mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn mismatched_gradient_leaves_params_and_state_untouched() {
        let mut w = Param::new("w", arr1(&[1.0f32, 1.0]).into_dyn());
        w.grad = Some(arr1(&[0.5, 0.5]).into_dyn());
        let mut b = Param::new("b", arr1(&[2.0f32]).into_dyn());
        b.grad = Some(arr1(&[0.5, 0.5]).into_dyn());
        let mut params = vec![w, b];

        let mut adam = Adam::new(0.1, 0.9, 0.999, 1e-8);
        let before = (params.clone(), adam.state_dict());

        let err = adam.step(&mut params).unwrap_err();
        assert!(
            matches!(err, OptimErr::ShapeMismatch { ref param, what: "gradient", .. } if param == "b"),
            "{err}"
        );
        assert_eq!(params, before.0);
        assert_eq!(adam.state_dict(), before.1);

        // the stale moment of a reshaped param is caught before anything moves
        params[1] = Param::new("b", arr1(&[2.0f32]).into_dyn());
        params[1].grad = Some(arr1(&[0.5]).into_dyn());
        adam.step(&mut params).unwrap();

        let before = (params.clone(), adam.state_dict());
        params[1] = Param::new("b", arr1(&[2.0f32, 2.0]).into_dyn());
        params[1].grad = Some(arr1(&[0.5, 0.5]).into_dyn());
        let reshaped = params.clone();

        let err = adam.step(&mut params).unwrap_err();
        assert!(matches!(err, OptimErr::ShapeMismatch { what: "first moment", .. }), "{err}");
        assert_eq!(params[0], before.0[0]);
        assert_eq!(params, reshaped);
        assert_eq!(adam.state_dict(), before.1);
    }
}
