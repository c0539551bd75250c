use std::{env, num::NonZeroUsize, path::PathBuf, str::FromStr};

use anyhow::{Context, anyhow};

const DEFAULT_EPOCHS: usize = 10;
const DEFAULT_BATCH_SIZE: usize = 32;
const DEFAULT_SAMPLES: usize = 1024;
const DEFAULT_FEATURES: usize = 8;
const DEFAULT_LR: f32 = 0.05;
const DEFAULT_MOMENTUM: f32 = 0.9;
const DEFAULT_PRINT_FREQ: usize = 10;
const DEFAULT_SEED: u64 = 42;
const DEFAULT_CKPT_DIR: &str = "checkpoints";

/// The knobs of a training run, read from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub epochs: usize,
    pub batch_size: NonZeroUsize,
    pub samples: usize,
    pub features: usize,
    pub lr: f32,
    pub momentum: f32,
    pub clip_grad: Option<f32>,
    pub mixed_precision: bool,
    pub print_freq: usize,
    pub seed: u64,
    pub ckpt_dir: PathBuf,
    pub save_freq: Option<NonZeroUsize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            epochs: DEFAULT_EPOCHS,
            // SAFETY: the default batch size is not zero.
            batch_size: NonZeroUsize::new(DEFAULT_BATCH_SIZE).unwrap(),
            samples: DEFAULT_SAMPLES,
            features: DEFAULT_FEATURES,
            lr: DEFAULT_LR,
            momentum: DEFAULT_MOMENTUM,
            clip_grad: None,
            mixed_precision: true,
            print_freq: DEFAULT_PRINT_FREQ,
            seed: DEFAULT_SEED,
            ckpt_dir: PathBuf::from(DEFAULT_CKPT_DIR),
            save_freq: None,
        }
    }
}

impl Config {
    /// Reads `EPOCHS`, `BATCH_SIZE`, `SAMPLES`, `FEATURES`, `LR`, `MOMENTUM`,
    /// `CLIP_GRAD`, `AMP`, `PRINT_FREQ`, `SEED`, `CKPT_DIR` and `SAVE_FREQ`,
    /// keeping the defaults for the missing ones.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let batch_size = var("BATCH_SIZE")?.unwrap_or(defaults.batch_size.get());

        Ok(Self {
            epochs: var("EPOCHS")?.unwrap_or(defaults.epochs),
            batch_size: NonZeroUsize::new(batch_size)
                .ok_or_else(|| anyhow!("BATCH_SIZE must not be zero"))?,
            samples: var("SAMPLES")?.unwrap_or(defaults.samples),
            features: var("FEATURES")?.unwrap_or(defaults.features),
            lr: var("LR")?.unwrap_or(defaults.lr),
            momentum: var("MOMENTUM")?.unwrap_or(defaults.momentum),
            clip_grad: var("CLIP_GRAD")?,
            mixed_precision: var("AMP")?.unwrap_or(defaults.mixed_precision),
            print_freq: var("PRINT_FREQ")?.unwrap_or(defaults.print_freq),
            seed: var("SEED")?.unwrap_or(defaults.seed),
            ckpt_dir: env::var("CKPT_DIR").map(PathBuf::from).unwrap_or(defaults.ckpt_dir),
            save_freq: var::<usize>("SAVE_FREQ")?.and_then(NonZeroUsize::new),
        })
    }
}

fn var<T>(name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid {name}: {value:?}")),
        Err(_) => Ok(None),
    }
}
