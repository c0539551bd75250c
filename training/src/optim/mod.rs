mod adam;
mod error;
mod param;
mod sgd;

pub use adam::Adam;
pub use error::{OptimErr, Result};
pub use param::Param;
pub use sgd::Sgd;

use crate::state::Stateful;

/// Defines the strategy for updating parameters based on their gradients.
pub trait Optimizer: Stateful {
    /// Updates every parameter that has a gradient, skipping the rest.
    ///
    /// # Arguments
    /// * `params` - The parameters to update, their gradients are left untouched.
    ///
    /// # Returns
    /// An error if a gradient's shape differs from its parameter's.
    fn step(&mut self, params: &mut [Param]) -> Result<()>;
}

/// Clears the gradient of every parameter.
pub fn zero_grad(params: &mut [Param]) {
    params.iter_mut().for_each(Param::zero_grad);
}
