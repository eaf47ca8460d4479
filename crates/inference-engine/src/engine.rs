//! Inference Engine Implementation

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use device_memory::{BindingLayout, DeviceAllocator, DeviceBufferTable, HostAllocator, MemoryError};
use tracing::{debug, error, info, warn};

use crate::logger::{RuntimeLogger, Severity, TracingLogger};
use crate::runtime::{AcceleratorRuntime, CompileRequest, CompiledGraph, ExecutionContext};
use crate::summary::{BindingSummary, EngineSummary};
use crate::tensor::{Dims, Precision, TensorDescriptor};
use crate::{InferenceError, Result};

/// Per-item output buffers, one entry per batch item, one buffer per output.
/// Owned by the caller once returned.
pub type BatchResult = Vec<Vec<Vec<u8>>>;

/// Resources that exist only between a successful build and teardown
struct BuiltEngine {
    // Field order is drop order: buffers, then context, then engine
    table: DeviceBufferTable,
    context: Box<dyn ExecutionContext>,
    graph: Box<dyn CompiledGraph>,
    precision: Precision,
    artifact: PathBuf,
}

/// Compiles a graph once and serves synchronous batched predictions
pub struct InferenceEngine {
    runtime: Box<dyn AcceleratorRuntime>,
    allocator: Arc<dyn DeviceAllocator>,
    logger: Arc<dyn RuntimeLogger>,
    inputs: Vec<TensorDescriptor>,
    outputs: Vec<TensorDescriptor>,
    built: Option<BuiltEngine>,
    /// Set when an execution fails; cleared by teardown
    faulted: bool,
}

impl InferenceEngine {
    /// Create an engine over `runtime` with host-backed device memory and
    /// the default tracing logger
    pub fn new(runtime: impl AcceleratorRuntime + 'static) -> Self {
        Self::with_runtime(Box::new(runtime))
    }

    /// Same as [`InferenceEngine::new`] for an already boxed runtime
    pub fn with_runtime(runtime: Box<dyn AcceleratorRuntime>) -> Self {
        Self::with_parts(
            runtime,
            Arc::new(HostAllocator::new()),
            Arc::new(TracingLogger::default()),
        )
    }

    /// Create an engine from explicit collaborators
    pub fn with_parts(
        runtime: Box<dyn AcceleratorRuntime>,
        allocator: Arc<dyn DeviceAllocator>,
        logger: Arc<dyn RuntimeLogger>,
    ) -> Self {
        info!("Creating inference engine on {} runtime", runtime.name());
        Self {
            runtime,
            allocator,
            logger,
            inputs: Vec::new(),
            outputs: Vec::new(),
            built: None,
            faulted: false,
        }
    }

    /// Replace the device allocator
    pub fn with_allocator(mut self, allocator: Arc<dyn DeviceAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Replace the runtime logger
    pub fn with_logger(mut self, logger: Arc<dyn RuntimeLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Register the next graph input.
    ///
    /// `dims` are channel-first even when the source graph is channel-last;
    /// converting the layout is the caller's job.
    pub fn add_input(&mut self, name: impl Into<String>, dims: Dims, element_size: usize) -> Result<()> {
        let name = name.into();
        self.check_registration(&name)?;

        let input = TensorDescriptor::input(name, dims, element_size);
        debug!(
            "Registered input {} '{}' dims={} ({} bytes/item)",
            self.inputs.len(),
            input.name(),
            input.dims().map(|d| d.to_string()).unwrap_or_default(),
            input.byte_size()
        );
        self.inputs.push(input);
        Ok(())
    }

    /// Register the next graph output by name. The compiled engine resolves
    /// its shape; `byte_size` is the per-item size copied back to the host.
    pub fn add_output(&mut self, name: impl Into<String>, byte_size: usize) -> Result<()> {
        let name = name.into();
        self.check_registration(&name)?;

        let output = TensorDescriptor::output(name, byte_size);
        debug!(
            "Registered output {} '{}' ({} bytes/item)",
            self.outputs.len(),
            output.name(),
            output.byte_size()
        );
        self.outputs.push(output);
        Ok(())
    }

    fn check_registration(&self, name: &str) -> Result<()> {
        if self.built.is_some() {
            return Err(InferenceError::Configuration(format!(
                "cannot register '{}' after build",
                name
            )));
        }
        if self.inputs.iter().chain(&self.outputs).any(|t| t.name() == name) {
            return Err(InferenceError::Configuration(format!(
                "tensor '{}' already registered",
                name
            )));
        }
        Ok(())
    }

    /// Compile the registered graph from `artifact` and allocate device
    /// buffers for `max_batch_size` items.
    ///
    /// On failure the engine stays unbuilt and holds no device memory.
    pub fn build(
        &mut self,
        artifact: impl AsRef<Path>,
        max_batch_size: usize,
        precision: Precision,
    ) -> Result<()> {
        let artifact = artifact.as_ref();

        if self.built.is_some() {
            return Err(InferenceError::Configuration(
                "engine already built; tear down before rebuilding".to_string(),
            ));
        }
        if self.inputs.is_empty() || self.outputs.is_empty() {
            return Err(InferenceError::Configuration(format!(
                "build requires registered inputs and outputs (have {} inputs, {} outputs)",
                self.inputs.len(),
                self.outputs.len()
            )));
        }
        if max_batch_size == 0 {
            return Err(InferenceError::Configuration(
                "max batch size must be positive".to_string(),
            ));
        }

        info!(
            "Building engine from {} (max_batch={}, precision={}, runtime={})",
            artifact.display(),
            max_batch_size,
            precision,
            self.runtime.name()
        );

        let request = CompileRequest {
            artifact,
            inputs: &self.inputs,
            outputs: &self.outputs,
            max_batch_size,
            precision,
            logger: self.logger.as_ref(),
        };
        let graph = self
            .runtime
            .compile(&request)
            .map_err(|e| self.build_failure(e.to_string()))?;

        let layout = BindingLayout::new(self.inputs.len(), self.outputs.len(), max_batch_size);
        if graph.num_bindings() != layout.step_size() {
            return Err(self.build_failure(format!(
                "engine reports {} bindings, {} registered",
                graph.num_bindings(),
                layout.step_size()
            )));
        }

        let context = graph
            .create_context()
            .map_err(|e| self.build_failure(format!("unable to create execution context: {}", e)))?;

        let sizes: Vec<usize> = self
            .inputs
            .iter()
            .chain(&self.outputs)
            .map(TensorDescriptor::byte_size)
            .collect();
        let table = DeviceBufferTable::allocate(self.allocator.as_ref(), layout, &sizes).map_err(|e| {
            self.logger
                .log(Severity::Error, &format!("Device buffer allocation failed: {}", e));
            InferenceError::Allocation(e)
        })?;

        info!(
            "Engine ready: {} bindings, {} device buffers",
            graph.num_bindings(),
            table.len()
        );

        self.built = Some(BuiltEngine {
            table,
            context,
            graph,
            precision,
            artifact: artifact.to_path_buf(),
        });
        self.faulted = false;
        Ok(())
    }

    fn build_failure(&self, reason: String) -> InferenceError {
        self.logger.log(Severity::Error, &reason);
        InferenceError::Compilation(reason)
    }

    /// Run inference on one batch.
    ///
    /// Each batch item supplies one host buffer per registered input, each
    /// exactly the input's registered byte size. Every check happens before
    /// device memory is touched.
    pub fn predict<I, B>(&mut self, batch: &[I]) -> Result<BatchResult>
    where
        I: AsRef<[B]>,
        B: AsRef<[u8]>,
    {
        let built = self.built.as_mut().ok_or(InferenceError::NotReady)?;
        if self.faulted {
            return Err(InferenceError::Faulted);
        }

        let max = built.table.layout().max_batch_size();
        if batch.len() > max {
            warn!("Rejecting batch of {} (max {})", batch.len(), max);
            return Err(InferenceError::CapacityExceeded {
                requested: batch.len(),
                max,
            });
        }
        validate_batch(&self.inputs, batch)?;

        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let result = run_batch(built, &self.outputs, batch);
        match &result {
            Ok(_) => debug!(
                "Predicted batch of {} in {}us",
                batch.len(),
                start.elapsed().as_micros()
            ),
            Err(e) => {
                error!("Predict failed, engine faulted: {}", e);
                self.logger.log(Severity::Error, &e.to_string());
                self.faulted = true;
            }
        }
        result
    }

    /// Report every binding of the compiled engine
    pub fn engine_summary(&self) -> Result<EngineSummary> {
        let built = self.built.as_ref().ok_or(InferenceError::NotReady)?;

        let bindings = (0..built.graph.num_bindings())
            .map(|i| {
                built
                    .graph
                    .binding(i)
                    .map(|info| BindingSummary::from_info(i, info))
                    .ok_or_else(|| {
                        InferenceError::Compilation(format!("engine did not report binding {}", i))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(EngineSummary { bindings })
    }

    /// Release device buffers, the execution context and the compiled
    /// engine, in that order. Safe to call repeatedly; registrations are
    /// kept so the engine can be rebuilt.
    pub fn teardown(&mut self) {
        if let Some(built) = self.built.take() {
            info!(
                "Tearing down engine built from {} ({} device buffers)",
                built.artifact.display(),
                built.table.len()
            );
            drop(built);
        }
        self.faulted = false;
    }

    /// Check if the engine is built and not faulted
    pub fn is_ready(&self) -> bool {
        self.built.is_some() && !self.faulted
    }

    /// Check if an execution failure has disabled the engine
    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    /// Registered inputs, in binding order
    pub fn inputs(&self) -> &[TensorDescriptor] {
        &self.inputs
    }

    /// Registered outputs, in binding order
    pub fn outputs(&self) -> &[TensorDescriptor] {
        &self.outputs
    }

    /// Number of registered inputs
    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Number of registered outputs
    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Device buffer layout of the built engine
    pub fn layout(&self) -> Option<BindingLayout> {
        self.built.as_ref().map(|b| *b.table.layout())
    }

    /// Maximum batch size of the built engine
    pub fn max_batch_size(&self) -> Option<usize> {
        self.layout().map(|l| l.max_batch_size())
    }

    /// Precision of the built engine
    pub fn precision(&self) -> Option<Precision> {
        self.built.as_ref().map(|b| b.precision)
    }

    /// Name of the accelerator runtime
    pub fn runtime_name(&self) -> &'static str {
        self.runtime.name()
    }
}

impl Drop for InferenceEngine {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for InferenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceEngine")
            .field("runtime", &self.runtime.name())
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("layout", &self.layout())
            .field("faulted", &self.faulted)
            .finish()
    }
}

fn validate_batch<I, B>(inputs: &[TensorDescriptor], batch: &[I]) -> Result<()>
where
    I: AsRef<[B]>,
    B: AsRef<[u8]>,
{
    for (item, buffers) in batch.iter().enumerate() {
        let buffers = buffers.as_ref();
        if buffers.len() != inputs.len() {
            return Err(InferenceError::InputCountMismatch {
                item,
                expected: inputs.len(),
                actual: buffers.len(),
            });
        }
        for (input, (buffer, desc)) in buffers.iter().zip(inputs).enumerate() {
            let actual = buffer.as_ref().len();
            if actual != desc.byte_size() {
                return Err(InferenceError::InputSizeMismatch {
                    item,
                    input,
                    expected: desc.byte_size(),
                    actual,
                });
            }
        }
    }
    Ok(())
}

/// Copy in, execute once, copy out. Each phase finishes before the next.
fn run_batch<I, B>(built: &mut BuiltEngine, outputs: &[TensorDescriptor], batch: &[I]) -> Result<BatchResult>
where
    I: AsRef<[B]>,
    B: AsRef<[u8]>,
{
    let device_error = |e: MemoryError| InferenceError::Execution(format!("device copy failed: {}", e));

    for (slot, buffers) in batch.iter().enumerate() {
        for (input, buffer) in buffers.as_ref().iter().enumerate() {
            built
                .table
                .write_input(slot, input, buffer.as_ref())
                .map_err(device_error)?;
        }
    }

    built
        .context
        .execute(batch.len(), &mut built.table)
        .map_err(|e| InferenceError::Execution(e.to_string()))?;

    let mut results = Vec::with_capacity(batch.len());
    for slot in 0..batch.len() {
        let mut item = Vec::with_capacity(outputs.len());
        for (output, desc) in outputs.iter().enumerate() {
            let mut host = vec![0u8; desc.byte_size()];
            built
                .table
                .read_output(slot, output, &mut host)
                .map_err(device_error)?;
            item.push(host);
        }
        results.push(item);
    }
    Ok(results)
}
