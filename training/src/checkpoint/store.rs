use std::{
    collections::BTreeMap,
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use collective::LEADER;
use log::{info, warn};
use serde_json::{Map, Value};

use super::{
    CheckpointErr, Result,
    error::io_err,
    export::encoder_state,
    record::Record,
};
use crate::state::{StateDict, Stateful};

const EXT: &str = "safetensors";
const LEGACY_LATEST: &str = "checkpoint-latest";
const LEGACY_PREFIX: &str = "checkpoint-";
const PREFIX: &str = "checkpoint_";
const EXPORT_COMPONENT: &str = "model";

/// Where and how often checkpoints are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointConfig {
    pub dir: PathBuf,
    /// Appended to every file name, so several runs can share a directory.
    pub suffix: String,
    /// Write a numbered snapshot every this many epochs.
    pub save_freq: Option<NonZeroUsize>,
    /// Epochs that get a numbered snapshot regardless of `save_freq`.
    pub save_list: Vec<usize>,
    /// This process' rank, only the leader writes.
    pub rank: usize,
}

impl CheckpointConfig {
    /// A configuration for the leader that only keeps the latest record.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            suffix: String::new(),
            save_freq: None,
            save_list: Vec::new(),
            rank: LEADER,
        }
    }
}

/// What `CheckpointStore::resume` found.
#[derive(Debug, Clone, PartialEq)]
pub struct Resume {
    /// The first epoch left to run.
    pub next_epoch: usize,
    /// The record the state was restored from, `None` on a cold start.
    pub source: Option<PathBuf>,
    /// The auxiliary fields saved along with the state.
    pub extra: Map<String, Value>,
}

impl Resume {
    fn cold() -> Self {
        Self {
            next_epoch: 0,
            source: None,
            extra: Map::new(),
        }
    }

    pub fn is_cold_start(&self) -> bool {
        self.source.is_none()
    }
}

/// Saves and restores the state of named training components.
///
/// The components aren't owned by the store, they are handed to every call
/// as `(name, component)` pairs.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    cfg: CheckpointConfig,
}

impl CheckpointStore {
    /// Creates a new `CheckpointStore`, creating its directory on the leader.
    pub fn new(cfg: CheckpointConfig) -> Result<Self> {
        if cfg.rank == LEADER {
            fs::create_dir_all(&cfg.dir).map_err(io_err(&cfg.dir))?;
        }

        Ok(Self { cfg })
    }

    pub fn is_leader(&self) -> bool {
        self.cfg.rank == LEADER
    }

    /// The record overwritten by every checkpoint.
    pub fn latest_path(&self) -> PathBuf {
        self.cfg.dir.join(format!("checkpoint_latest{}.{EXT}", self.cfg.suffix))
    }

    /// The write-once record of `epoch`.
    pub fn snapshot_path(&self, epoch: usize) -> PathBuf {
        self.cfg
            .dir
            .join(format!("{PREFIX}{epoch:04}{}.{EXT}", self.cfg.suffix))
    }

    /// The record holding the exported encoder.
    pub fn export_path(&self) -> PathBuf {
        self.cfg
            .dir
            .join(format!("checkpoint_latest_export{}.{EXT}", self.cfg.suffix))
    }

    fn wants_snapshot(&self, epoch: usize) -> bool {
        self.cfg.save_freq.is_some_and(|freq| epoch % freq.get() == 0)
            || self.cfg.save_list.contains(&epoch)
    }

    /// Saves the state of every component as the latest record, plus a
    /// numbered snapshot on the configured epochs. Does nothing off the leader.
    ///
    /// # Arguments
    /// * `epoch` - The epoch that just finished.
    /// * `modules` - The components to save, by name.
    /// * `extra` - Auxiliary fields to save along.
    ///
    /// # Returns
    /// The paths written.
    pub fn checkpoint(
        &self,
        epoch: usize,
        modules: &[(&str, &dyn Stateful)],
        extra: &Map<String, Value>,
    ) -> Result<Vec<PathBuf>> {
        if !self.is_leader() {
            return Ok(Vec::new());
        }

        let record = Record {
            epoch,
            components: modules
                .iter()
                .map(|(name, module)| (name.to_string(), module.state_dict()))
                .collect(),
            extra: extra.clone(),
        };

        let latest = self.latest_path();
        record.store(&latest)?;
        info!(epoch = epoch; "saved checkpoint {}", latest.display());

        let mut written = vec![latest];

        if self.wants_snapshot(epoch) {
            let snapshot = self.snapshot_path(epoch);

            if snapshot.exists() {
                warn!(epoch = epoch; "snapshot {} already exists, keeping it", snapshot.display());
            } else {
                record.store(&snapshot)?;
                info!(epoch = epoch; "saved checkpoint {}", snapshot.display());
                written.push(snapshot);
            }
        }

        Ok(written)
    }

    /// Restores every component from the latest record, if there's one.
    ///
    /// # Returns
    /// The epoch to continue from, zero on a cold start, or an error if the
    /// record is unreadable or lacks one of the components.
    pub fn resume(&self, modules: &mut [(&str, &mut dyn Stateful)]) -> Result<Resume> {
        let latest = self.latest_path();

        if !latest.is_file() {
            info!("no checkpoint found at {}", latest.display());
            return Ok(Resume::cold());
        }

        self.resume_from(&latest, modules)
    }

    /// Like `resume`, but falls back to the newest numbered snapshot, in the
    /// current or the legacy naming, when there's no latest record.
    pub fn auto_resume(&self, modules: &mut [(&str, &mut dyn Stateful)]) -> Result<Resume> {
        match find_resume_path(&self.cfg.dir, &self.cfg.suffix)? {
            Some(path) => {
                info!("auto resume checkpoint: {}", path.display());
                self.resume_from(&path, modules)
            }
            None => {
                info!("no checkpoint found in {}", self.cfg.dir.display());
                Ok(Resume::cold())
            }
        }
    }

    /// Restores every component from the record at `path`.
    pub fn resume_from(
        &self,
        path: &Path,
        modules: &mut [(&str, &mut dyn Stateful)],
    ) -> Result<Resume> {
        let Record {
            epoch,
            mut components,
            extra,
        } = Record::load(path)?;

        let mut states = Vec::with_capacity(modules.len());
        for (name, _) in modules.iter() {
            let state = components
                .remove(*name)
                .ok_or_else(|| CheckpointErr::Corrupted {
                    path: path.to_path_buf(),
                    detail: format!("missing component `{name}`"),
                })?;
            states.push(state);
        }

        // a component rejecting its state puts back the ones loaded before it
        let backups: Vec<StateDict> = modules.iter().map(|(_, m)| m.state_dict()).collect();

        let mut failed = None;
        for (i, state) in states.into_iter().enumerate() {
            let (name, module) = &mut modules[i];
            if let Err(source) = module.load_state_dict(state) {
                failed = Some((i, name.to_string(), source));
                break;
            }
        }

        if let Some((i, component, source)) = failed {
            rollback(&mut modules[..=i], backups);
            return Err(CheckpointErr::State {
                path: path.to_path_buf(),
                component,
                source,
            });
        }

        info!(epoch = epoch; "loaded checkpoint {}", path.display());

        Ok(Resume {
            next_epoch: epoch + 1,
            source: Some(path.to_path_buf()),
            extra,
        })
    }

    /// Writes the encoder part of `model` in inference layout. Does nothing off the leader.
    ///
    /// # Arguments
    /// * `epoch` - The epoch the model was trained up to.
    /// * `model` - The full model.
    /// * `patch`, `channels` - The patch embedding's geometry.
    ///
    /// # Returns
    /// The path written, if any.
    pub fn export_encoder(
        &self,
        epoch: usize,
        model: &dyn Stateful,
        patch: usize,
        channels: usize,
    ) -> Result<Option<PathBuf>> {
        if !self.is_leader() {
            return Ok(None);
        }

        let encoder = encoder_state(model.state_dict(), patch, channels)?;
        let record = Record {
            epoch,
            components: BTreeMap::from([(EXPORT_COMPONENT.to_string(), encoder)]),
            extra: Map::new(),
        };

        let path = self.export_path();
        record.store(&path)?;
        info!(epoch = epoch; "saved exported encoder {}", path.display());

        Ok(Some(path))
    }
}

fn rollback(modules: &mut [(&str, &mut dyn Stateful)], backups: Vec<StateDict>) {
    for ((name, module), backup) in modules.iter_mut().zip(backups) {
        if let Err(e) = module.load_state_dict(backup) {
            warn!("failed to restore the previous state of `{name}`: {e}");
        }
    }
}

/// Looks for the record to resume from in `dir`.
///
/// The latest record wins, in the current naming and then in the legacy
/// `checkpoint-latest` one; otherwise the numbered snapshot of the highest
/// epoch, either `checkpoint_NNNN<suffix>` or legacy `checkpoint-N`.
///
/// # Returns
/// `None` if `dir` doesn't exist or holds no record.
pub fn find_resume_path(dir: &Path, suffix: &str) -> Result<Option<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(dir)(e)),
    };

    let latest = format!("checkpoint_latest{suffix}");
    let mut legacy_latest = None;
    let mut newest: Option<(usize, PathBuf)> = None;

    for entry in entries {
        let path = entry.map_err(io_err(dir))?.path();

        let Some(stem) = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_suffix(&format!(".{EXT}")))
            .map(str::to_string)
        else {
            continue;
        };

        if stem == latest {
            return Ok(Some(path));
        }

        if stem == LEGACY_LATEST {
            legacy_latest = Some(path);
            continue;
        }

        let epoch = stem
            .strip_prefix(PREFIX)
            .and_then(|rest| rest.strip_suffix(suffix))
            .or_else(|| stem.strip_prefix(LEGACY_PREFIX))
            .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|digits| digits.parse::<usize>().ok());

        let Some(epoch) = epoch else {
            continue;
        };

        if newest.as_ref().is_none_or(|(best, _)| epoch > *best) {
            newest = Some((epoch, path));
        }
    }

    Ok(legacy_latest.or(newest.map(|(_, path)| path)))
}
