use std::{
    env,
    error::Error,
    fmt::{self, Display},
    num::NonZeroUsize,
};

use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

use crate::state::{self, StateDict, Stateful};

/// The result type for partition arithmetic.
pub type Result<T> = std::result::Result<T, ConfigErr>;

/// An invalid data partitioning setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigErr {
    NotDivisible {
        what: &'static str,
        value: usize,
        divisor: usize,
    },
    RankOutOfRange {
        rank: usize,
        world_size: usize,
    },
    LocalRankOutOfRange {
        local_rank: usize,
        num_parts: usize,
    },
    EmptyPartition {
        local_rank: usize,
        num_parts: usize,
        len: usize,
    },
    Env {
        var: &'static str,
        value: String,
    },
}

impl Display for ConfigErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigErr::NotDivisible {
                what,
                value,
                divisor,
            } => write!(f, "{what} ({value}) is not divisible by {divisor}"),
            ConfigErr::RankOutOfRange { rank, world_size } => {
                write!(f, "rank {rank} is out of range for a world of size {world_size}")
            }
            ConfigErr::LocalRankOutOfRange {
                local_rank,
                num_parts,
            } => write!(f, "local rank {local_rank} is out of range for {num_parts} parts"),
            ConfigErr::EmptyPartition {
                local_rank,
                num_parts,
                len,
            } => write!(
                f,
                "a dataset of {len} items leaves part {local_rank} of {num_parts} empty"
            ),
            ConfigErr::Env { var, value } => write!(f, "invalid value for {var}: {value:?}"),
        }
    }
}

impl Error for ConfigErr {}

/// Where this process sits in the job, and how it draws its samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerConfig {
    pub world_size: NonZeroUsize,
    pub rank: usize,
    /// The amount of nodes the dataset is first split into.
    pub num_parts: NonZeroUsize,
    /// Which of those parts this process draws from.
    pub local_rank: usize,
    pub shuffle: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            world_size: NonZeroUsize::MIN,
            rank: 0,
            num_parts: NonZeroUsize::MIN,
            local_rank: 0,
            shuffle: true,
        }
    }
}

impl SamplerConfig {
    /// Creates a configuration for `rank` out of `world_size` whose node split
    /// comes from `LOCAL_RANK` and `LOCAL_SIZE`, defaulting to 0 and 1.
    ///
    /// # Returns
    /// An error if either variable is set but isn't a valid number.
    pub fn from_env(world_size: NonZeroUsize, rank: usize, shuffle: bool) -> Result<Self> {
        let local_rank = env_or("LOCAL_RANK", 0)?;
        let local_size = env_or("LOCAL_SIZE", 1)?;

        let num_parts = NonZeroUsize::new(local_size).ok_or(ConfigErr::Env {
            var: "LOCAL_SIZE",
            value: local_size.to_string(),
        })?;

        Ok(Self {
            world_size,
            rank,
            num_parts,
            local_rank,
            shuffle,
        })
    }
}

fn env_or(var: &'static str, default: usize) -> Result<usize> {
    match env::var(var) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigErr::Env { var, value }),
        Err(_) => Ok(default),
    }
}

/// Splits the indices of a dataset between the processes of a job.
///
/// The dataset is first split between `num_parts` nodes by `index % num_parts`,
/// and then each node's share is split between the ranks reading from it.
/// Every rank gets exactly `ceil(len / world_size)` indices, repeating some of
/// its node's indices when the division isn't exact.
#[derive(Debug, Clone)]
pub struct PartitionedSampler {
    len: usize,
    cfg: SamplerConfig,
    num_samples: usize,
    epoch: usize,
}

impl PartitionedSampler {
    /// Creates a new `PartitionedSampler`.
    ///
    /// # Arguments
    /// * `len` - The amount of items in the dataset.
    /// * `cfg` - This process' placement.
    ///
    /// # Returns
    /// An error if the placement is out of range or the arithmetic doesn't divide evenly.
    pub fn new(len: usize, cfg: SamplerConfig) -> Result<Self> {
        let world_size = cfg.world_size.get();
        let num_parts = cfg.num_parts.get();

        if cfg.rank >= world_size {
            return Err(ConfigErr::RankOutOfRange {
                rank: cfg.rank,
                world_size,
            });
        }

        if cfg.local_rank >= num_parts {
            return Err(ConfigErr::LocalRankOutOfRange {
                local_rank: cfg.local_rank,
                num_parts,
            });
        }

        if world_size % num_parts != 0 {
            return Err(ConfigErr::NotDivisible {
                what: "world size",
                value: world_size,
                divisor: num_parts,
            });
        }

        let num_samples = len.div_ceil(world_size);
        let total_size = num_samples * world_size;

        if total_size % num_parts != 0 {
            return Err(ConfigErr::NotDivisible {
                what: "padded dataset size",
                value: total_size,
                divisor: num_parts,
            });
        }

        let part_size = total_size / num_parts;
        let stride = world_size / num_parts;

        if part_size % stride != 0 {
            return Err(ConfigErr::NotDivisible {
                what: "padded part size",
                value: part_size,
                divisor: stride,
            });
        }

        if num_samples > 0 && len <= cfg.local_rank {
            return Err(ConfigErr::EmptyPartition {
                local_rank: cfg.local_rank,
                num_parts,
                len,
            });
        }

        Ok(Self {
            len,
            cfg,
            num_samples,
            epoch: 0,
        })
    }

    /// The amount of indices every rank gets per epoch.
    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Sets the epoch used to seed the next draws, call it before every epoch.
    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }

    /// Draws this rank's indices for the current epoch.
    ///
    /// # Returns
    /// Exactly `num_samples` indices, the same ones for the same epoch.
    pub fn indices(&self) -> Vec<usize> {
        let SamplerConfig {
            world_size,
            rank,
            num_parts,
            local_rank,
            shuffle,
        } = self.cfg;
        let (world_size, num_parts) = (world_size.get(), num_parts.get());

        let mut order: Vec<usize> = (0..self.len).collect();
        if shuffle {
            let mut rng = StdRng::seed_from_u64(self.epoch as u64);
            order.shuffle(&mut rng);
        }

        let part: Vec<usize> = order
            .into_iter()
            .filter(|i| i % num_parts == local_rank)
            .collect();

        let part_size = self.num_samples * world_size / num_parts;
        let stride = world_size / num_parts;

        part.iter()
            .copied()
            .cycle()
            .take(part_size)
            .skip(rank / num_parts)
            .step_by(stride)
            .collect()
    }
}

impl<'a> IntoIterator for &'a PartitionedSampler {
    type Item = usize;
    type IntoIter = std::vec::IntoIter<usize>;

    fn into_iter(self) -> Self::IntoIter {
        self.indices().into_iter()
    }
}

impl Stateful for PartitionedSampler {
    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert_value("epoch", &self.epoch);
        state
    }

    fn load_state_dict(&mut self, state: StateDict) -> state::Result<()> {
        self.epoch = state.value("epoch")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn cfg(world_size: usize, rank: usize, num_parts: usize, shuffle: bool) -> SamplerConfig {
        SamplerConfig {
            world_size: NonZeroUsize::new(world_size).unwrap(),
            rank,
            num_parts: NonZeroUsize::new(num_parts).unwrap(),
            local_rank: rank % num_parts,
            shuffle,
        }
    }

    fn draw(len: usize, world_size: usize, num_parts: usize, shuffle: bool, epoch: usize) -> Vec<Vec<usize>> {
        (0..world_size)
            .map(|rank| {
                let mut sampler =
                    PartitionedSampler::new(len, cfg(world_size, rank, num_parts, shuffle)).unwrap();
                sampler.set_epoch(epoch);
                sampler.indices()
            })
            .collect()
    }

    #[test]
    fn two_nodes_of_two_ranks() {
        let draws = draw(10, 4, 2, false, 0);

        assert_eq!(draws[0], vec![0, 4, 8]);
        assert_eq!(draws[1], vec![1, 5, 9]);
        assert_eq!(draws[2], vec![2, 6, 0]);
        assert_eq!(draws[3], vec![3, 7, 1]);
    }

    #[test]
    fn every_index_is_covered_with_equal_counts() {
        for (len, world_size, num_parts) in [(10, 4, 2), (7, 3, 1), (100, 8, 4), (5, 6, 3), (13, 2, 2)] {
            for epoch in 0..3 {
                let draws = draw(len, world_size, num_parts, true, epoch);
                let expected = len.div_ceil(world_size);

                assert!(draws.iter().all(|d| d.len() == expected));

                let seen: BTreeSet<usize> = draws.into_iter().flatten().collect();
                assert_eq!(seen, (0..len).collect(), "len {len}, world {world_size}");
            }
        }
    }

    #[test]
    fn same_epoch_same_draw() {
        assert_eq!(draw(50, 4, 2, true, 3), draw(50, 4, 2, true, 3));
        assert_ne!(draw(50, 4, 2, true, 3), draw(50, 4, 2, true, 4));
    }

    #[test]
    fn uneven_world_is_rejected() {
        let err = PartitionedSampler::new(10, cfg(3, 0, 2, false)).unwrap_err();
        assert!(matches!(err, ConfigErr::NotDivisible { what: "world size", .. }));
    }

    #[test]
    fn out_of_range_placement_is_rejected() {
        let mut bad = cfg(2, 0, 2, false);
        bad.rank = 2;
        assert!(matches!(
            PartitionedSampler::new(10, bad),
            Err(ConfigErr::RankOutOfRange { .. })
        ));

        let mut bad = cfg(2, 0, 2, false);
        bad.local_rank = 2;
        assert!(matches!(
            PartitionedSampler::new(10, bad),
            Err(ConfigErr::LocalRankOutOfRange { .. })
        ));
    }

    #[test]
    fn tiny_dataset_leaves_a_part_empty() {
        let err = PartitionedSampler::new(1, cfg(2, 1, 2, false)).unwrap_err();
        assert!(matches!(err, ConfigErr::EmptyPartition { .. }));
    }

    #[test]
    fn empty_dataset_yields_nothing() {
        let sampler = PartitionedSampler::new(0, cfg(4, 3, 2, true)).unwrap();
        assert_eq!(sampler.num_samples(), 0);
        assert!(sampler.indices().is_empty());
    }

    #[test]
    fn epoch_survives_a_state_round_trip() {
        let mut sampler = PartitionedSampler::new(10, cfg(1, 0, 1, true)).unwrap();
        sampler.set_epoch(9);

        let mut restored = PartitionedSampler::new(10, cfg(1, 0, 1, true)).unwrap();
        restored.load_state_dict(sampler.state_dict()).unwrap();

        assert_eq!(restored.epoch(), 9);
        assert_eq!(restored.indices(), sampler.indices());
    }
}
