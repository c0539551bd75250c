//! The stateful building blocks of a data-parallel training loop.

pub mod checkpoint;
pub mod data;
pub mod metrics;
pub mod norm;
pub mod optim;
pub mod sampler;
pub mod scaler;
pub mod state;

pub use checkpoint::{CheckpointConfig, CheckpointErr, CheckpointStore, Resume};
pub use data::{DataLoader, InMemoryDataset};
pub use metrics::{MetricLogger, MetricsErr, SmoothedValue};
pub use norm::{NormType, clip_grad_norm, grad_norm};
pub use optim::{Adam, OptimErr, Optimizer, Param, Sgd};
pub use sampler::{ConfigErr, PartitionedSampler, SamplerConfig};
pub use scaler::{GradScaler, ScalerConfig, StepOpts, StepOutcome};
pub use state::{StateDict, StateErr, Stateful};
