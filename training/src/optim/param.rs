use ndarray::{ArrayD, ArrayViewD};

use super::{OptimErr, Result};
use crate::state::{self, StateDict, Stateful};

/// A named trainable tensor and its accumulated gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub value: ArrayD<f32>,
    pub grad: Option<ArrayD<f32>>,
}

impl Param {
    /// Creates a new `Param` without a gradient.
    pub fn new(name: impl Into<String>, value: ArrayD<f32>) -> Self {
        Self {
            name: name.into(),
            value,
            grad: None,
        }
    }

    /// Adds `grad` to this parameter's gradient.
    ///
    /// # Returns
    /// An error if `grad` doesn't have this parameter's shape.
    pub fn accumulate_grad(&mut self, grad: ArrayViewD<'_, f32>) -> Result<()> {
        self.check_shape("gradient", grad.shape())?;

        match &mut self.grad {
            Some(acc) => *acc += &grad,
            None => self.grad = Some(grad.to_owned()),
        }

        Ok(())
    }

    pub fn zero_grad(&mut self) {
        self.grad = None;
    }

    pub(crate) fn check_shape(&self, what: &'static str, shape: &[usize]) -> Result<()> {
        if shape != self.value.shape() {
            return Err(OptimErr::ShapeMismatch {
                param: self.name.clone(),
                what,
                got: shape.to_vec(),
                expected: self.value.shape().to_vec(),
            });
        }

        Ok(())
    }
}

/// A model's parameters, stored by name.
impl Stateful for Vec<Param> {
    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        for p in self {
            state.insert_tensor(p.name.clone(), p.value.clone());
        }
        state
    }

    fn load_state_dict(&mut self, mut state: StateDict) -> state::Result<()> {
        let values = self
            .iter()
            .map(|p| state.take_tensor(&p.name, Some(p.value.shape())))
            .collect::<state::Result<Vec<_>>>()?;

        for (p, value) in self.iter_mut().zip(values) {
            p.value = value;
        }

        Ok(())
    }
}
