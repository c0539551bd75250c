use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, File},
    io::Write,
    path::Path,
};

use ndarray::{ArrayD, IxDyn};
use safetensors::{Dtype, SafeTensors, tensor::TensorView};
use serde_json::{Map, Value};

use super::{CheckpointErr, Result, error::io_err};
use crate::state::StateDict;

const EPOCH: &str = "epoch";
const COMPONENTS: &str = "components";
const EXTRA: &str = "extra";
const VALUES_PREFIX: &str = "values/";
const SEP: char = '/';

/// Everything stored in one checkpoint file.
#[derive(Debug, Default, Clone, PartialEq)]
pub(super) struct Record {
    pub epoch: usize,
    pub components: BTreeMap<String, StateDict>,
    pub extra: Map<String, Value>,
}

impl Record {
    /// Lays the record out as a safetensors buffer.
    ///
    /// Tensors are named `<component>/<tensor>`, the remaining state goes to
    /// the header metadata as JSON.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut metadata = HashMap::new();
        let names: Vec<&String> = self.components.keys().collect();

        metadata.insert(EPOCH.to_string(), self.epoch.to_string());
        metadata.insert(COMPONENTS.to_string(), to_json(&names)?);
        metadata.insert(EXTRA.to_string(), to_json(&self.extra)?);

        let mut blobs = Vec::new();

        for (component, state) in &self.components {
            if component.contains(SEP) {
                return Err(CheckpointErr::Encode(format!(
                    "component name `{component}` can't contain `{SEP}`"
                )));
            }

            metadata.insert(format!("{VALUES_PREFIX}{component}"), to_json(&state.values)?);

            for (name, tensor) in &state.tensors {
                let bytes: Vec<u8> = tensor.iter().flat_map(|x| x.to_le_bytes()).collect();
                blobs.push((format!("{component}{SEP}{name}"), tensor.shape().to_vec(), bytes));
            }
        }

        let views = blobs
            .iter()
            .map(|(name, shape, bytes)| {
                TensorView::new(Dtype::F32, shape.clone(), bytes)
                    .map(|view| (name.as_str(), view))
                    .map_err(|e| CheckpointErr::Encode(format!("tensor `{name}`: {e:?}")))
            })
            .collect::<Result<Vec<_>>>()?;

        safetensors::serialize(views, &Some(metadata))
            .map_err(|e| CheckpointErr::Encode(format!("{e:?}")))
    }

    /// Parses a buffer written by `encode`.
    ///
    /// # Arguments
    /// * `path` - Where `bytes` were read from, for diagnostics.
    /// * `bytes` - The file's content.
    pub fn decode(path: &Path, bytes: &[u8]) -> Result<Self> {
        let corrupted = |detail: String| CheckpointErr::Corrupted {
            path: path.to_path_buf(),
            detail,
        };

        let tensors = SafeTensors::deserialize(bytes).map_err(|e| corrupted(format!("{e:?}")))?;
        let (_, header) =
            SafeTensors::read_metadata(bytes).map_err(|e| corrupted(format!("{e:?}")))?;
        let metadata = header
            .metadata()
            .as_ref()
            .ok_or_else(|| corrupted("the header has no metadata".to_string()))?;

        let field = |key: &str| {
            metadata
                .get(key)
                .ok_or_else(|| corrupted(format!("missing `{key}` field")))
        };

        let epoch = field(EPOCH)?
            .parse()
            .map_err(|e| corrupted(format!("invalid epoch: {e}")))?;

        let names: Vec<String> = serde_json::from_str(field(COMPONENTS)?)
            .map_err(|e| corrupted(format!("invalid component list: {e}")))?;

        let extra = match metadata.get(EXTRA) {
            Some(json) => serde_json::from_str(json)
                .map_err(|e| corrupted(format!("invalid extra fields: {e}")))?,
            None => Map::new(),
        };

        let mut components = BTreeMap::new();
        for name in names {
            let values = serde_json::from_str(field(&format!("{VALUES_PREFIX}{name}"))?)
                .map_err(|e| corrupted(format!("invalid values of `{name}`: {e}")))?;

            components.insert(
                name,
                StateDict {
                    tensors: BTreeMap::new(),
                    values,
                },
            );
        }

        for (full_name, view) in tensors.tensors() {
            let (component, name) = full_name
                .split_once(SEP)
                .ok_or_else(|| corrupted(format!("tensor `{full_name}` has no component")))?;

            let state = components
                .get_mut(component)
                .ok_or_else(|| corrupted(format!("tensor `{full_name}` of unknown component")))?;

            if view.dtype() != Dtype::F32 {
                return Err(corrupted(format!(
                    "tensor `{full_name}` is {:?}, expected F32",
                    view.dtype()
                )));
            }

            let data: Vec<f32> = view
                .data()
                .chunks_exact(size_of::<f32>())
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();

            let tensor = ArrayD::from_shape_vec(IxDyn(view.shape()), data)
                .map_err(|e| corrupted(format!("tensor `{full_name}`: {e}")))?;

            state.tensors.insert(name.to_string(), tensor);
        }

        Ok(Self {
            epoch,
            components,
            extra,
        })
    }

    /// Reads and parses the record at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(io_err(path))?;
        Self::decode(path, &bytes)
    }

    /// Writes the record to `path` through a temporary file in the same
    /// directory, so `path` either keeps its old content or holds the whole record.
    pub fn store(&self, path: &Path) -> Result<()> {
        let bytes = self.encode()?;

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!(".{file_name}.tmp"));

        let mut file = File::create(&tmp).map_err(io_err(&tmp))?;
        file.write_all(&bytes).map_err(io_err(&tmp))?;
        file.sync_all().map_err(io_err(&tmp))?;
        drop(file);

        fs::rename(&tmp, path).map_err(io_err(path))
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| CheckpointErr::Encode(e.to_string()))
}
