//! Persistence of training state, written by the leader and read by every rank.

mod error;
pub mod export;
mod record;
mod store;

pub use error::{CheckpointErr, Result};
pub use store::{CheckpointConfig, CheckpointStore, Resume, find_resume_path};
