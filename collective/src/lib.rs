//! Collective communication between the processes of a training job.
//!
//! Every participant must reach the same collective calls in the same order;
//! a mismatch either hangs or fails every rank with a `CollectiveErr`.

mod bootstrap;
mod error;
mod gather;
mod group;
pub mod logging;
mod solo;
mod star;

pub use bootstrap::{DistEnv, connect, in_memory};
pub use error::{CollectiveErr, Result};
pub use gather::{DistributedGather, all_reduce_mean, concat_all_gather};
pub use group::ProcessGroup;
pub use solo::Solo;
pub use star::StarGroup;

/// The rank designated for singleton actions such as checkpoint writes.
pub const LEADER: usize = 0;
