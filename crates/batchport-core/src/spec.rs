use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{BackendError, DType, IOName, Result};

/// One input or output as written in a model configuration file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorConfig {
    pub name: String,
    pub data_type: DType,
    /// `-1` marks a dynamic dimension. Excludes the batch dimension.
    pub dims: Vec<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    /// 0 means the model does not batch and tensors carry no batch dim.
    #[serde(default)]
    pub max_batch_size: usize,
    pub inputs: Vec<TensorConfig>,
    pub outputs: Vec<TensorConfig>,
    #[serde(default)]
    pub require_non_empty_output: bool,
}

impl ModelConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| BackendError::Config(format!("failed to parse model config: {e}")))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BackendError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    /// Checks the configuration and resolves it into a `ModelSpec`.
    pub fn to_spec(&self) -> Result<ModelSpec> {
        if self.inputs.is_empty() {
            return Err(BackendError::Config(format!(
                "model '{}' declares no inputs",
                self.name
            )));
        }
        if self.outputs.is_empty() {
            return Err(BackendError::Config(format!(
                "model '{}' declares no outputs",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for tensor in self.inputs.iter().chain(&self.outputs) {
            if !seen.insert(tensor.name.as_str()) {
                return Err(BackendError::Config(format!(
                    "model '{}' declares '{}' more than once",
                    self.name, tensor.name
                )));
            }
        }

        Ok(ModelSpec {
            name: self.name.clone(),
            inputs: self.inputs.iter().map(TensorSpec::from_config).collect::<Result<_>>()?,
            outputs: self.outputs.iter().map(TensorSpec::from_config).collect::<Result<_>>()?,
            max_batch: self.max_batch_size,
            require_non_empty_output: self.require_non_empty_output,
        })
    }
}

impl Default for ModelConfig {
    /// Mirrors the demonstration model: one dynamic UINT64 vector in, the
    /// same vector out.
    fn default() -> Self {
        Self {
            name: "batchport-identity".to_string(),
            max_batch_size: 8,
            inputs: vec![TensorConfig {
                name: "INPUT".to_string(),
                data_type: DType::U64,
                dims: vec![-1],
            }],
            outputs: vec![TensorConfig {
                name: "OUTPUT".to_string(),
                data_type: DType::U64,
                dims: vec![-1],
            }],
            require_non_empty_output: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorSpec {
    pub name: IOName,
    pub dtype: DType,
    pub rank: usize,
    pub dims: Vec<Option<usize>>, // None = dynamic
}

impl TensorSpec {
    fn from_config(config: &TensorConfig) -> Result<Self> {
        let dims = config
            .dims
            .iter()
            .map(|&d| match d {
                -1 => Ok(None),
                d => usize::try_from(d).map(Some).map_err(|_| {
                    BackendError::Config(format!("'{}' has invalid dimension {d}", config.name))
                }),
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name: IOName(config.name.clone()),
            dtype: config.data_type,
            rank: dims.len(),
            dims,
        })
    }

    /// Element count when every dim is fixed and the count fits a `usize`.
    pub fn fixed_numel(&self) -> Option<usize> {
        self.dims
            .iter()
            .try_fold(1usize, |acc, d| d.and_then(|d| acc.checked_mul(d)))
    }
}

#[derive(Clone, Debug)]
pub struct ModelSpec {
    pub name: String,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
    pub max_batch: usize,
    pub require_non_empty_output: bool,
}

impl ModelSpec {
    pub fn supports_batching(&self) -> bool {
        self.max_batch > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_style_config() {
        let config = ModelConfig::from_json(
            r#"{
                "name": "minimal",
                "max_batch_size": 8,
                "inputs": [{"name": "IN0", "data_type": "TYPE_INT32", "dims": [4]}],
                "outputs": [{"name": "OUT0", "data_type": "TYPE_INT32", "dims": [4]}]
            }"#,
        )
        .unwrap();
        let spec = config.to_spec().unwrap();
        assert_eq!(spec.inputs[0].dtype, DType::I32);
        assert_eq!(spec.inputs[0].fixed_numel(), Some(4));
        assert!(spec.supports_batching());
        assert!(!spec.require_non_empty_output);
    }

    #[test]
    fn rejects_duplicate_names_and_bad_dims() {
        let mut config = ModelConfig::default();
        config.outputs[0].name = "INPUT".to_string();
        assert!(matches!(config.to_spec(), Err(BackendError::Config(_))));

        let mut config = ModelConfig::default();
        config.inputs[0].dims = vec![-2];
        assert!(matches!(config.to_spec(), Err(BackendError::Config(_))));

        let mut config = ModelConfig::default();
        config.outputs.clear();
        assert!(matches!(config.to_spec(), Err(BackendError::Config(_))));
    }

    #[test]
    fn dynamic_dims_have_no_fixed_numel() {
        let spec = ModelConfig::default().to_spec().unwrap();
        assert_eq!(spec.inputs[0].dims, vec![None]);
        assert_eq!(spec.inputs[0].fixed_numel(), None);
    }
}
