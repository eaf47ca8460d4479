//! Engine configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::InferenceEngine;
use crate::onnx::TractRuntime;
use crate::runtime::AcceleratorRuntime;
use crate::simulated::SimulatedRuntime;
use crate::tensor::{Dims, Precision};
use crate::{InferenceError, Result};

/// Environment variable prefix, e.g. `INFER__MAX_BATCH_SIZE=64`
pub const ENV_PREFIX: &str = "INFER";

/// Accelerator runtime selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// JSON graph manifest on the simulated runtime
    #[default]
    Simulated,
    /// ONNX graph on tract
    Tract,
}

impl BackendKind {
    /// Instantiate the runtime
    pub fn runtime(&self) -> Box<dyn AcceleratorRuntime> {
        match self {
            BackendKind::Simulated => Box::new(SimulatedRuntime::new()),
            BackendKind::Tract => Box::new(TractRuntime::new()),
        }
    }
}

/// Input registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputConfig {
    pub name: String,
    /// Channel-first dims of one batch item
    pub dims: Dims,
    /// Bytes per element
    #[serde(default = "default_element_size")]
    pub element_size: usize,
}

/// Output registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub name: String,
    /// Bytes per batch item
    pub byte_size: usize,
}

/// Construction-time configuration of an engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Serialized graph artifact
    pub artifact_path: PathBuf,

    /// Largest batch served
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Compute precision
    #[serde(default)]
    pub precision: Precision,

    /// Runtime that compiles and executes the artifact
    #[serde(default)]
    pub backend: BackendKind,

    /// Inputs in binding order
    pub inputs: Vec<InputConfig>,

    /// Outputs in binding order
    pub outputs: Vec<OutputConfig>,
}

fn default_element_size() -> usize {
    std::mem::size_of::<f32>()
}

fn default_max_batch_size() -> usize {
    256
}

impl Default for EngineConfig {
    /// Two 1x30x40 float inputs and one float output, batch 256
    fn default() -> Self {
        Self {
            artifact_path: PathBuf::from("graph.json"),
            max_batch_size: default_max_batch_size(),
            precision: Precision::Full,
            backend: BackendKind::Simulated,
            inputs: vec![
                InputConfig {
                    name: "input_1".to_string(),
                    dims: Dims::chw(1, 30, 40),
                    element_size: 4,
                },
                InputConfig {
                    name: "input_2".to_string(),
                    dims: Dims::chw(1, 30, 40),
                    element_size: 4,
                },
            ],
            outputs: vec![OutputConfig {
                name: "dense_1/BiasAdd".to_string(),
                byte_size: 4,
            }],
        }
    }
}

impl EngineConfig {
    /// Load from a TOML/JSON/YAML file, overlaid with `INFER__*` variables
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_with_env_prefix(path, ENV_PREFIX)
    }

    /// Load from a file, overlaid with `<prefix>__*` variables
    pub fn load_with_env_prefix(path: impl AsRef<Path>, prefix: &str) -> Result<Self> {
        let path = path.as_ref();
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .add_source(
                ::config::Environment::with_prefix(prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| InferenceError::Configuration(format!("{}: {}", path.display(), e)))?;

        let config: EngineConfig = settings
            .try_deserialize()
            .map_err(|e| InferenceError::Configuration(format!("{}: {}", path.display(), e)))?;
        config.validate()?;

        info!(
            "Loaded engine config from {}: {} inputs, {} outputs, backend={:?}",
            path.display(),
            config.inputs.len(),
            config.outputs.len(),
            config.backend
        );
        Ok(config)
    }

    /// Check values a build would reject
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(InferenceError::Configuration(
                "max_batch_size must be positive".to_string(),
            ));
        }
        if self.inputs.is_empty() || self.outputs.is_empty() {
            return Err(InferenceError::Configuration(
                "at least one input and one output required".to_string(),
            ));
        }
        if let Some(input) = self.inputs.iter().find(|i| i.element_size == 0 || i.dims.rank() == 0) {
            return Err(InferenceError::Configuration(format!(
                "input '{}' needs non-empty dims and a positive element size",
                input.name
            )));
        }
        Ok(())
    }

    /// Register every input and output on `engine`, in order
    pub fn register(&self, engine: &mut InferenceEngine) -> Result<()> {
        for input in &self.inputs {
            engine.add_input(input.name.as_str(), input.dims.clone(), input.element_size)?;
        }
        for output in &self.outputs {
            engine.add_output(output.name.as_str(), output.byte_size)?;
        }
        Ok(())
    }

    /// Create, register and build an engine on the configured runtime
    pub fn build_engine(&self) -> Result<InferenceEngine> {
        self.validate()?;
        let mut engine = InferenceEngine::with_runtime(self.backend.runtime());
        self.register(&mut engine)?;
        engine.build(&self.artifact_path, self.max_batch_size, self.precision)?;
        Ok(engine)
    }
}
