use ndarray::{ArrayD, ArrayViewD, IxDyn};

use crate::{CollectiveErr, ProcessGroup, Result};

const GATHER: &str = "gather";
const SCATTER_GRAD: &str = "scatter_grad";

/// An all-gather that gradients can flow back through.
///
/// Autodiff is not available here, so the two halves are explicit:
/// `gather` runs in the forward pass and remembers the local shard's shape,
/// `scatter_grad` runs in the backward pass and hands this rank the part of the
/// gradient that belongs to its own shard.
#[derive(Debug, Default, Clone)]
pub struct DistributedGather {
    shard_shape: Option<Vec<usize>>,
}

impl DistributedGather {
    /// Creates a new `DistributedGather` with no forward pass recorded yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Concatenates every rank's shard along the first axis, in rank order.
    ///
    /// Slot `i` of the result holds rank `i`'s shard unchanged. A scalar shard
    /// is treated as a vector of length one.
    ///
    /// # Arguments
    /// * `group` - The process group, every rank must call this together.
    /// * `local` - This rank's shard, all ranks must use the same shape.
    ///
    /// # Returns
    /// An array of shape `[world_size * n, ...]` for a shard of shape `[n, ...]`.
    pub async fn gather<G: ProcessGroup>(
        &mut self,
        group: &mut G,
        local: ArrayViewD<'_, f32>,
    ) -> Result<ArrayD<f32>> {
        let out = concat_all_gather(group, local.view()).await?;
        self.shard_shape = Some(shard_shape(&local));
        Ok(out)
    }

    /// Routes the gradient of the gathered array back to this rank's shard.
    ///
    /// The gradient is summed across ranks first, since every rank computed its
    /// loss on the same gathered array, and then sliced at this rank's slot.
    ///
    /// # Arguments
    /// * `group` - The process group, every rank must call this together.
    /// * `grad` - The gradient w.r.t. the output of the last `gather`.
    ///
    /// # Returns
    /// A gradient with the shape of the local shard.
    ///
    /// # Errors
    /// `ShapeMismatch` if there was no forward pass or `grad` doesn't have the gathered shape.
    pub async fn scatter_grad<G: ProcessGroup>(
        &self,
        group: &mut G,
        grad: ArrayViewD<'_, f32>,
    ) -> Result<ArrayD<f32>> {
        let Some(shard_shape) = &self.shard_shape else {
            return Err(CollectiveErr::ShapeMismatch {
                op: SCATTER_GRAD,
                got: grad.shape().to_vec(),
                expected: Vec::new(),
            });
        };

        let expected = gathered_shape(shard_shape, group.world_size());
        if grad.shape() != expected.as_slice() {
            return Err(CollectiveErr::ShapeMismatch {
                op: SCATTER_GRAD,
                got: grad.shape().to_vec(),
                expected,
            });
        }

        let mut summed: Vec<f64> = grad.iter().map(|&g| f64::from(g)).collect();
        group.all_reduce_sum(&mut summed).await?;

        let n: usize = shard_shape.iter().product();
        let start = group.rank() * n;
        let local: Vec<f32> = summed[start..start + n].iter().map(|&g| g as f32).collect();

        ArrayD::from_shape_vec(IxDyn(shard_shape), local).map_err(|_| {
            CollectiveErr::ShapeMismatch {
                op: SCATTER_GRAD,
                got: vec![n],
                expected: shard_shape.clone(),
            }
        })
    }
}

/// Gathers every rank's shard without recording anything for a backward pass.
///
/// # Returns
/// The rank-ordered concatenation along the first axis.
pub async fn concat_all_gather<G: ProcessGroup>(
    group: &mut G,
    local: ArrayViewD<'_, f32>,
) -> Result<ArrayD<f32>> {
    let shape = shard_shape(&local);
    let flat: Vec<f32> = local.iter().copied().collect();

    let gathered = group.all_gather(&flat).await?;
    let got = vec![gathered.len()];
    let expected = gathered_shape(&shape, group.world_size());

    ArrayD::from_shape_vec(IxDyn(&expected), gathered).map_err(|_| CollectiveErr::ShapeMismatch {
        op: GATHER,
        got,
        expected,
    })
}

/// Averages a scalar across every rank.
pub async fn all_reduce_mean<G: ProcessGroup>(group: &mut G, value: f64) -> Result<f64> {
    let world_size = group.world_size();
    if world_size == 1 {
        return Ok(value);
    }

    let mut buf = [value];
    group.all_reduce_sum(&mut buf).await?;
    Ok(buf[0] / world_size as f64)
}

fn shard_shape(local: &ArrayViewD<'_, f32>) -> Vec<usize> {
    match local.shape() {
        [] => vec![1],
        shape => shape.to_vec(),
    }
}

fn gathered_shape(shard_shape: &[usize], world_size: usize) -> Vec<usize> {
    let mut shape = shard_shape.to_vec();
    shape[0] *= world_size;
    shape
}
