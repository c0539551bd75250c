use crate::Result;

/// A fixed set of cooperating processes and the collectives they can run.
///
/// Calls are blocking from the caller's point of view: every rank must call the
/// same operation, in the same order, with buffers of the same length.
#[allow(unused)]
#[trait_variant::make(ProcessGroup: Send)]
pub trait ProcessGroupTemplate {
    /// The rank of this process, in `0..world_size`.
    fn rank(&self) -> usize;

    /// The total amount of processes in the group.
    fn world_size(&self) -> usize;

    /// Waits until every rank has reached the barrier.
    async fn barrier(&mut self) -> Result<()>;

    /// Replaces `values` with the element-wise sum of every rank's `values`.
    ///
    /// The sum is accumulated in rank order, so every rank ends up with the
    /// same bits.
    async fn all_reduce_sum(&mut self, values: &mut [f64]) -> Result<()>;

    /// Returns the rank-ordered concatenation of every rank's `shard`.
    ///
    /// # Errors
    /// Fails on every rank when the shards don't have the same length.
    async fn all_gather(&mut self, shard: &[f32]) -> Result<Vec<f32>>;
}
