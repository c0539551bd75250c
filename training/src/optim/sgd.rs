use std::collections::BTreeMap;

use ndarray::{ArrayD, Zip};

use super::{Optimizer, Param, Result};
use crate::state::{self, StateDict, Stateful};

const VELOCITY: &str = "velocity/";

/// Stochastic gradient descent with optional momentum.
#[derive(Debug, Clone)]
pub struct Sgd {
    learning_rate: f32,
    momentum: f32,
    velocity: BTreeMap<String, ArrayD<f32>>,
}

impl Sgd {
    /// Creates a new `Sgd` optimizer.
    ///
    /// # Arguments
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `momentum` - Hyperparameter to the optimization algorithm, zero disables it.
    ///
    /// # Returns
    /// A new `Sgd` instance.
    pub fn new(learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            velocity: BTreeMap::new(),
        }
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut [Param]) -> Result<()> {
        let lr = self.learning_rate;
        let mu = self.momentum;

        for p in params.iter() {
            let Some(grad) = &p.grad else {
                continue;
            };
            p.check_shape("gradient", grad.shape())?;
            if let Some(v) = self.velocity.get(&p.name).filter(|_| mu != 0.) {
                p.check_shape("velocity", v.shape())?;
            }
        }

        for p in params.iter_mut() {
            let Some(grad) = &p.grad else {
                continue;
            };

            if mu == 0. {
                p.value.scaled_add(-lr, grad);
                continue;
            }

            let v = self
                .velocity
                .entry(p.name.clone())
                .or_insert_with(|| ArrayD::zeros(p.value.raw_dim()));

            Zip::from(&mut p.value)
                .and(grad)
                .and(v)
                .for_each(|w, &g, v| {
                    *v = (mu * *v) + g;
                    *w -= lr * *v;
                });
        }

        Ok(())
    }
}

impl Stateful for Sgd {
    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert_value("learning_rate", &self.learning_rate);
        state.insert_value("momentum", &self.momentum);

        for (name, v) in &self.velocity {
            state.insert_tensor(format!("{VELOCITY}{name}"), v.clone());
        }

        state
    }

    fn load_state_dict(&mut self, mut state: StateDict) -> state::Result<()> {
        self.learning_rate = state.value("learning_rate")?;
        self.momentum = state.value("momentum")?;
        self.velocity = state.take_prefixed(VELOCITY);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::arr1;

    use super::*;

    fn param(value: &[f32], grad: &[f32]) -> Param {
        let mut p = Param::new("w", arr1(value).into_dyn());
        p.grad = Some(arr1(grad).into_dyn());
        p
    }

    #[test]
    fn plain_descent_follows_the_gradient() {
        let mut params = vec![
            param(&[1.0, 1.0], &[0.5, -1.0]),
            Param::new("b", arr1(&[7.0]).into_dyn()),
        ];
        Sgd::new(0.5, 0.0).step(&mut params).unwrap();

        assert_eq!(params[0].value, arr1(&[0.75, 1.5]).into_dyn());
        assert_eq!(params[1].value, arr1(&[7.0]).into_dyn());
    }

    #[test]
    fn momentum_accumulates_velocity() {
        let mut params = vec![param(&[0.0], &[1.0])];
        let mut sgd = Sgd::new(1.0, 0.5);

        sgd.step(&mut params).unwrap();
        sgd.step(&mut params).unwrap();

        // v1 = 1, v2 = 0.5 + 1
        assert_eq!(params[0].value, arr1(&[-2.5]).into_dyn());
    }

    #[test]
    fn restored_optimizer_continues_the_same_trajectory() {
        let mut a = vec![param(&[0.0], &[1.0])];
        let mut sgd = Sgd::new(1.0, 0.9);
        sgd.step(&mut a).unwrap();

        let mut b = a.clone();
        let mut restored = Sgd::new(0.0, 0.0);
        restored.load_state_dict(sgd.state_dict()).unwrap();

        sgd.step(&mut a).unwrap();
        restored.step(&mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn stale_velocity_stops_the_whole_step() {
        let mut params = vec![param(&[0.0], &[1.0])];
        let mut sgd = Sgd::new(1.0, 0.5);
        sgd.step(&mut params).unwrap();

        let mut b = Param::new("b", arr1(&[3.0]).into_dyn());
        b.grad = Some(arr1(&[1.0]).into_dyn());
        params = vec![b, param(&[0.0, 0.0], &[1.0, 1.0])];
        let before = (params.clone(), sgd.state_dict());

        assert!(sgd.step(&mut params).is_err());
        assert_eq!(params, before.0);
        assert_eq!(sgd.state_dict(), before.1);
    }
}
