//! Accelerator runtime capability
//!
//! The engine never optimizes graphs or schedules kernels itself. A runtime
//! parses the artifact, compiles it for a batch size and precision, reports
//! binding metadata, and executes over the device buffer table.

use std::path::Path;

use device_memory::{DeviceBufferTable, MemoryError};
use thiserror::Error;

use crate::logger::RuntimeLogger;
use crate::tensor::{BindingInfo, Precision, TensorDescriptor};

/// Errors reported by an accelerator runtime
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Failed to parse graph artifact: {0}")]
    Parse(String),

    #[error("Engine compilation failed: {0}")]
    Compile(String),

    #[error("Precision {0} not supported by this runtime")]
    UnsupportedPrecision(Precision),

    #[error("Execution rejected: {0}")]
    Execute(String),

    #[error("Device memory error: {0}")]
    Memory(#[from] MemoryError),
}

/// Everything a runtime needs to compile a graph
pub struct CompileRequest<'a> {
    /// Serialized graph artifact
    pub artifact: &'a Path,
    /// Registered inputs, in binding order
    pub inputs: &'a [TensorDescriptor],
    /// Registered outputs, in binding order
    pub outputs: &'a [TensorDescriptor],
    /// Largest batch the engine will execute
    pub max_batch_size: usize,
    /// Compute precision
    pub precision: Precision,
    /// Sink for parser and builder diagnostics
    pub logger: &'a dyn RuntimeLogger,
}

/// Parses and compiles graph artifacts
pub trait AcceleratorRuntime: Send {
    /// Runtime name for logs
    fn name(&self) -> &'static str;

    /// Parse the artifact and compile it into an executable engine
    fn compile(&self, request: &CompileRequest<'_>) -> Result<Box<dyn CompiledGraph>, RuntimeError>;
}

/// A compiled, executable engine
pub trait CompiledGraph: Send {
    /// Total bindings per batch slot
    fn num_bindings(&self) -> usize;

    /// Metadata for binding `index`
    fn binding(&self, index: usize) -> Option<BindingInfo>;

    /// Create a reusable execution context bound to this engine
    fn create_context(&self) -> Result<Box<dyn ExecutionContext>, RuntimeError>;
}

/// Issues execution requests against one compiled engine
pub trait ExecutionContext: Send {
    /// Run the first `batch_size` slots of `table` to completion.
    ///
    /// Inputs are already resident in the table; outputs must be written
    /// back into the same table before returning.
    fn execute(&mut self, batch_size: usize, table: &mut DeviceBufferTable) -> Result<(), RuntimeError>;
}
