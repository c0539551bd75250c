use std::num::NonZeroUsize;

use anyhow::Context;
use collective::{DistributedGather, ProcessGroup};
use log::info;
use ndarray::{Array1, Array2, ArrayD, ArrayView1, ArrayView2, Axis, Ix1};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Normal};
use serde_json::{Map, Value};
use training::{
    CheckpointConfig, CheckpointStore, DataLoader, GradScaler, InMemoryDataset, MetricLogger,
    Param, PartitionedSampler, SamplerConfig, ScalerConfig, Sgd, Stateful, StepOpts,
    data::Batch, optim::zero_grad,
};

use crate::config::Config;

const NOISE_STD: f32 = 0.1;
const BIAS: f32 = 0.5;

/// Everything a checkpoint has to carry to resume a run.
struct Job {
    params: Vec<Param>,
    optimizer: Sgd,
    scaler: GradScaler,
    sampler: PartitionedSampler,
}

impl Job {
    fn components(&self) -> [(&str, &dyn Stateful); 4] {
        [
            ("model", &self.params),
            ("optimizer", &self.optimizer),
            ("scaler", &self.scaler),
            ("sampler", &self.sampler),
        ]
    }

    fn components_mut(&mut self) -> [(&str, &mut dyn Stateful); 4] {
        [
            ("model", &mut self.params),
            ("optimizer", &mut self.optimizer),
            ("scaler", &mut self.scaler),
            ("sampler", &mut self.sampler),
        ]
    }
}

/// Fits a linear regression on synthetic data, data parallel across `group`.
///
/// Every rank generates the same dataset from the seed, reads its own part of
/// it through a `PartitionedSampler` and averages its gradients with the rest
/// before stepping. The run resumes from the last checkpoint in the configured
/// directory, if any.
pub async fn run<G: ProcessGroup>(group: &mut G, cfg: &Config) -> anyhow::Result<()> {
    let rank = group.rank();
    let world_size = NonZeroUsize::new(group.world_size()).context("empty process group")?;

    let dataset = synthetic(cfg)?;

    let mut job = Job {
        params: vec![
            Param::new("linear.weight", ArrayD::zeros(vec![cfg.features])),
            Param::new("linear.bias", ArrayD::zeros(vec![1])),
        ],
        optimizer: Sgd::new(cfg.lr, cfg.momentum),
        scaler: GradScaler::new(ScalerConfig {
            enabled: cfg.mixed_precision,
            ..ScalerConfig::default()
        }),
        sampler: PartitionedSampler::new(
            dataset.len(),
            SamplerConfig::from_env(world_size, rank, true)?,
        )?,
    };

    let store = CheckpointStore::new(CheckpointConfig {
        save_freq: cfg.save_freq,
        rank,
        ..CheckpointConfig::new(&cfg.ckpt_dir)
    })?;
    let resume = store.auto_resume(&mut job.components_mut())?;
    if !resume.is_cold_start() {
        info!(rank = rank; "resuming at epoch {}", resume.next_epoch);
    }

    let mut gather = DistributedGather::new();
    let opts = StepOpts {
        clip_grad: cfg.clip_grad,
        ..StepOpts::update()
    };

    for epoch in resume.next_epoch..cfg.epochs {
        job.sampler.set_epoch(epoch);

        let logger = MetricLogger::default();
        let loader = DataLoader::new(&dataset, job.sampler.indices(), cfg.batch_size, false);
        let header = format!("Epoch: [{epoch}]");

        for batch in logger.log_every(loader, cfg.print_freq, &header) {
            let (loss, grads) = backward(&job.params, &batch)?;
            let grads = average_grads(group, &grads).await?;

            let outcome = job.scaler.step(
                |scale, params| {
                    for (p, g) in params.iter_mut().zip(&grads) {
                        p.accumulate_grad((g * scale).view())?;
                    }
                    Ok(())
                },
                &mut job.optimizer,
                &mut job.params,
                opts,
            )?;
            zero_grad(&mut job.params);

            logger.update_weighted("loss", loss as f64, batch.len() as u64);
            logger.update("scale", outcome.scale as f64);
            if let Some(norm) = outcome.norm {
                logger.update("grad_norm", norm as f64);
            }
        }

        logger.synchronize_between_processes(group).await?;
        let eval_mse = evaluate(group, &mut gather, &job.params, &dataset, &job.sampler).await?;
        info!(epoch = epoch, eval_mse = eval_mse; "averaged stats: {logger}");

        let mut extra = Map::new();
        extra.insert("eval_mse".to_string(), Value::from(eval_mse));
        store.checkpoint(epoch, &job.components(), &extra)?;
    }

    group.barrier().await?;
    Ok(())
}

/// `y = x . w + BIAS + noise`, with `x` and `w` uniform in `[-1, 1)`.
fn synthetic(cfg: &Config) -> anyhow::Result<InMemoryDataset> {
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let noise = Normal::new(0., NOISE_STD)?;

    let w = Array1::from_shape_fn(cfg.features, |_| rng.random::<f32>() * 2. - 1.);
    let xs = Array2::from_shape_fn((cfg.samples, cfg.features), |_| rng.random::<f32>() * 2. - 1.);
    let ys = xs.dot(&w).mapv(|y| y + BIAS + noise.sample(&mut rng));

    Ok(InMemoryDataset::new(xs, ys))
}

fn predict(params: &[Param], xs: ArrayView2<'_, f32>) -> anyhow::Result<Array1<f32>> {
    let w = params[0].value.view().into_dimensionality::<Ix1>()?;
    let b = params[1].value.first().copied().unwrap_or_default();

    Ok(xs.dot(&w) + b)
}

/// The mean squared error of a batch and its gradient w.r.t. every parameter.
fn backward(params: &[Param], batch: &Batch) -> anyhow::Result<(f32, Vec<ArrayD<f32>>)> {
    let residuals = predict(params, batch.xs.view())? - &batch.ys;
    let n = batch.len().max(1) as f32;

    let loss = residuals.mapv(|r| r * r).sum() / n;
    let dw = batch.xs.t().dot(&residuals) * (2. / n);
    let db = Array1::from_elem(1, residuals.sum() * (2. / n));

    Ok((loss, vec![dw.into_dyn(), db.into_dyn()]))
}

/// Replaces every rank's gradients with their mean across ranks.
async fn average_grads<G: ProcessGroup>(
    group: &mut G,
    grads: &[ArrayD<f32>],
) -> anyhow::Result<Vec<ArrayD<f32>>> {
    let mut flat: Vec<f64> = grads.iter().flatten().map(|&g| g as f64).collect();
    group.all_reduce_sum(&mut flat).await?;

    let world_size = group.world_size() as f64;
    let mut offset = 0;

    grads
        .iter()
        .map(|g| -> anyhow::Result<ArrayD<f32>> {
            let mean = flat[offset..offset + g.len()]
                .iter()
                .map(|&x| (x / world_size) as f32)
                .collect();
            offset += g.len();
            Ok(ArrayD::from_shape_vec(g.raw_dim(), mean)?)
        })
        .collect()
}

/// The mean squared error over every rank's share of the dataset.
async fn evaluate<G: ProcessGroup>(
    group: &mut G,
    gather: &mut DistributedGather,
    params: &[Param],
    dataset: &InMemoryDataset,
    sampler: &PartitionedSampler,
) -> anyhow::Result<f64> {
    let indices = sampler.indices();
    let xs = dataset.xs().select(Axis(0), &indices);
    let ys = dataset.ys().select(Axis(0), &indices);

    let residuals = predict(params, xs.view())? - &ys;
    let all = gather.gather(group, residuals.view().into_dyn()).await?;

    Ok(mse(all.view().into_dimensionality::<Ix1>()?))
}

fn mse(residuals: ArrayView1<'_, f32>) -> f64 {
    if residuals.is_empty() {
        return 0.;
    }

    residuals.iter().map(|&r| (r as f64).powi(2)).sum::<f64>() / residuals.len() as f64
}
