//! Batched Inference Engine
//!
//! Compiles a serialized graph through an accelerator runtime once, then
//! serves synchronous batched predictions over a fixed device buffer table.

pub mod config;
mod engine;
pub mod logger;
pub mod onnx;
pub mod runtime;
pub mod simulated;
mod summary;
pub mod tensor;

pub use config::{BackendKind, EngineConfig, InputConfig, OutputConfig};
pub use engine::{BatchResult, InferenceEngine};
pub use logger::{RuntimeLogger, Severity, TracingLogger};
pub use onnx::TractRuntime;
pub use runtime::{AcceleratorRuntime, CompileRequest, CompiledGraph, ExecutionContext, RuntimeError};
pub use simulated::{GraphManifest, ReduceOp, SimulatedRuntime};
pub use summary::{BindingSummary, EngineSummary};
pub use tensor::{BindingInfo, DataType, Dims, Precision, TensorDescriptor};

pub use device_memory::{BindingLayout, DeviceAllocator, HostAllocator, MemoryError};

use thiserror::Error;

/// Errors during engine build and inference
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Build failed: {0}")]
    Compilation(String),

    #[error("Engine not ready: build has not completed successfully")]
    NotReady,

    #[error("Engine faulted after an execution failure; tear down before reuse")]
    Faulted,

    #[error("Batch of {requested} exceeds maximum batch size {max}")]
    CapacityExceeded { requested: usize, max: usize },

    #[error("Batch item {item} has {actual} input buffers, expected {expected}")]
    InputCountMismatch {
        item: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Batch item {item} input {input} is {actual} bytes, expected {expected}")]
    InputSizeMismatch {
        item: usize,
        input: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Device allocation failed: {0}")]
    Allocation(#[from] MemoryError),

    #[error("Execution failed: {0}")]
    Execution(String),
}

pub type Result<T> = std::result::Result<T, InferenceError>;
