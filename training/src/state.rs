use std::{
    collections::BTreeMap,
    error::Error,
    fmt::{self, Display},
};

use ndarray::ArrayD;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

/// The result type for loading component state.
pub type Result<T> = std::result::Result<T, StateErr>;

/// Failures while restoring a component from a `StateDict`.
#[derive(Debug)]
pub enum StateErr {
    Missing {
        key: String,
    },
    WrongType {
        key: String,
        detail: String,
    },
    ShapeMismatch {
        key: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
}

impl Display for StateErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateErr::Missing { key } => write!(f, "missing state entry `{key}`"),
            StateErr::WrongType { key, detail } => {
                write!(f, "state entry `{key}` has the wrong type: {detail}")
            }
            StateErr::ShapeMismatch { key, got, expected } => write!(
                f,
                "state tensor `{key}` has shape {got:?}, expected {expected:?}"
            ),
        }
    }
}

impl Error for StateErr {}

/// The serializable state of one component.
///
/// Tensors and plain values are kept apart so tensors can be stored in a
/// binary layout while everything else stays human readable.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StateDict {
    pub tensors: BTreeMap<String, ArrayD<f32>>,
    pub values: Map<String, Value>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether there's nothing to store.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty() && self.values.is_empty()
    }

    pub fn insert_tensor(&mut self, key: impl Into<String>, tensor: ArrayD<f32>) {
        self.tensors.insert(key.into(), tensor);
    }

    /// Stores `value` under `key`.
    ///
    /// # Panics
    /// If `T`'s `Serialize` implementation fails, which derived implementations never do.
    pub fn insert_value<T: Serialize + ?Sized>(&mut self, key: impl Into<String>, value: &T) {
        // SAFETY: every caller stores numbers, strings or derived structs of them.
        let value = serde_json::to_value(value).unwrap();
        self.values.insert(key.into(), value);
    }

    /// Removes and returns the tensor stored under `key`, checking its shape.
    ///
    /// # Arguments
    /// * `key` - The tensor's name.
    /// * `shape` - The shape the caller expects, `None` to accept any.
    pub fn take_tensor(&mut self, key: &str, shape: Option<&[usize]>) -> Result<ArrayD<f32>> {
        let tensor = self.tensors.remove(key).ok_or_else(|| StateErr::Missing {
            key: key.to_string(),
        })?;

        match shape {
            Some(expected) if tensor.shape() != expected => Err(StateErr::ShapeMismatch {
                key: key.to_string(),
                got: tensor.shape().to_vec(),
                expected: expected.to_vec(),
            }),
            _ => Ok(tensor),
        }
    }

    /// Removes every tensor whose key starts with `prefix`, returning them
    /// keyed by the rest of their name.
    pub fn take_prefixed(&mut self, prefix: &str) -> BTreeMap<String, ArrayD<f32>> {
        let keys: Vec<String> = self
            .tensors
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();

        keys.into_iter()
            .filter_map(|k| {
                let tensor = self.tensors.remove(&k)?;
                Some((k[prefix.len()..].to_string(), tensor))
            })
            .collect()
    }

    /// Reads the value stored under `key`.
    pub fn value<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self.values.get(key).ok_or_else(|| StateErr::Missing {
            key: key.to_string(),
        })?;

        serde_json::from_value(value.clone()).map_err(|e| StateErr::WrongType {
            key: key.to_string(),
            detail: e.to_string(),
        })
    }
}

/// A component whose state can be saved and later restored.
pub trait Stateful {
    /// Captures this component's state.
    fn state_dict(&self) -> StateDict;

    /// Restores a state previously returned by `state_dict`.
    ///
    /// # Returns
    /// An error if an entry is missing or doesn't match this component.
    fn load_state_dict(&mut self, state: StateDict) -> Result<()>;
}
