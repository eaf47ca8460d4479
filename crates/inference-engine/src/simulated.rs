//! Simulated accelerator runtime
//!
//! Compiles a JSON graph manifest instead of a real network. Execution
//! reduces every f32 input element of a batch item to one value and fills
//! each output of that item with it. Useful for exercising the engine's
//! buffer handling without accelerator hardware.

use std::path::Path;
use std::sync::Arc;

use device_memory::DeviceBufferTable;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::logger::Severity;
use crate::runtime::{AcceleratorRuntime, CompileRequest, CompiledGraph, ExecutionContext, RuntimeError};
use crate::tensor::{BindingInfo, DataType, Dims, Precision};

/// Reduction applied across all inputs of a batch item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReduceOp {
    #[default]
    Sum,
    Mean,
    Max,
}

impl ReduceOp {
    fn apply(&self, values: &[f32]) -> f32 {
        match self {
            ReduceOp::Sum => values.iter().sum(),
            ReduceOp::Mean if values.is_empty() => 0.0,
            ReduceOp::Mean => values.iter().sum::<f32>() / values.len() as f32,
            ReduceOp::Max => values.iter().copied().fold(f32::NEG_INFINITY, f32::max),
        }
    }
}

/// One named tensor in a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestTensor {
    pub name: String,
    pub dims: Dims,
}

/// Graph artifact understood by [`SimulatedRuntime`]
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GraphManifest {
    pub inputs: Vec<ManifestTensor>,
    pub outputs: Vec<ManifestTensor>,
    #[serde(default)]
    pub op: ReduceOp,
}

impl GraphManifest {
    /// Add an input tensor
    pub fn input(mut self, name: impl Into<String>, dims: Dims) -> Self {
        self.inputs.push(ManifestTensor {
            name: name.into(),
            dims,
        });
        self
    }

    /// Add an output tensor
    pub fn output(mut self, name: impl Into<String>, dims: Dims) -> Self {
        self.outputs.push(ManifestTensor {
            name: name.into(),
            dims,
        });
        self
    }

    /// Set the reduction
    pub fn with_op(mut self, op: ReduceOp) -> Self {
        self.op = op;
        self
    }

    /// Serialize to `path`
    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(self).map_err(std::io::Error::from)?;
        std::fs::write(path, json)
    }

    /// Read and parse a manifest file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| RuntimeError::Parse(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| RuntimeError::Parse(format!("{}: {}", path.display(), e)))
    }

    fn find<'a>(tensors: &'a [ManifestTensor], name: &str) -> Option<&'a ManifestTensor> {
        tensors.iter().find(|t| t.name == name)
    }
}

/// Accelerator runtime that executes [`GraphManifest`] artifacts on the host
#[derive(Debug, Clone, Default)]
pub struct SimulatedRuntime {
    fail_executions: bool,
}

impl SimulatedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every execution request fail, to exercise fault handling
    pub fn with_execution_fault(mut self) -> Self {
        self.fail_executions = true;
        self
    }
}

impl AcceleratorRuntime for SimulatedRuntime {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn compile(&self, request: &CompileRequest<'_>) -> Result<Box<dyn CompiledGraph>, RuntimeError> {
        let manifest = GraphManifest::load(request.artifact)?;
        let mut bindings = Vec::with_capacity(request.inputs.len() + request.outputs.len());

        for input in request.inputs {
            let tensor = GraphManifest::find(&manifest.inputs, input.name())
                .ok_or_else(|| RuntimeError::Parse(format!("graph has no input '{}'", input.name())))?;
            if input.dims() != Some(&tensor.dims) {
                return Err(RuntimeError::Parse(format!(
                    "input '{}' registered as {} but graph declares {}",
                    input.name(),
                    input.dims().map(|d| d.to_string()).unwrap_or_default(),
                    tensor.dims
                )));
            }
            if input.element_size() != DataType::Float.size() {
                return Err(RuntimeError::Compile(format!(
                    "input '{}' registered with {}-byte elements, graph takes {}",
                    input.name(),
                    input.element_size(),
                    DataType::Float
                )));
            }
            bindings.push(BindingInfo {
                name: tensor.name.clone(),
                is_input: true,
                data_type: DataType::Float,
                dims: tensor.dims.clone(),
            });
        }

        for output in request.outputs {
            let tensor = GraphManifest::find(&manifest.outputs, output.name())
                .ok_or_else(|| RuntimeError::Parse(format!("graph has no output '{}'", output.name())))?;
            let expected = tensor.dims.volume() * DataType::Float.size();
            if output.byte_size() != expected {
                return Err(RuntimeError::Compile(format!(
                    "output '{}' registered with {} bytes, graph produces {}",
                    output.name(),
                    output.byte_size(),
                    expected
                )));
            }
            bindings.push(BindingInfo {
                name: tensor.name.clone(),
                is_input: false,
                data_type: DataType::Float,
                dims: tensor.dims.clone(),
            });
        }

        match request.precision {
            Precision::Full => {}
            Precision::Half => request
                .logger
                .log(Severity::Info, "Half precision kernels selected; bindings stay FP32"),
            Precision::Int8 => request.logger.log(
                Severity::Warning,
                "No INT8 calibration data supplied; using default dynamic ranges",
            ),
        }

        debug!(
            "Simulated engine compiled: {} bindings, op={:?}, max_batch={}",
            bindings.len(),
            manifest.op,
            request.max_batch_size
        );

        Ok(Box::new(SimulatedGraph {
            inner: Arc::new(GraphInner {
                bindings,
                num_inputs: request.inputs.len(),
                op: manifest.op,
                max_batch_size: request.max_batch_size,
                fail_executions: self.fail_executions,
            }),
        }))
    }
}

struct GraphInner {
    bindings: Vec<BindingInfo>,
    num_inputs: usize,
    op: ReduceOp,
    max_batch_size: usize,
    fail_executions: bool,
}

struct SimulatedGraph {
    inner: Arc<GraphInner>,
}

impl CompiledGraph for SimulatedGraph {
    fn num_bindings(&self) -> usize {
        self.inner.bindings.len()
    }

    fn binding(&self, index: usize) -> Option<BindingInfo> {
        self.inner.bindings.get(index).cloned()
    }

    fn create_context(&self) -> Result<Box<dyn ExecutionContext>, RuntimeError> {
        Ok(Box::new(SimulatedContext {
            graph: Arc::clone(&self.inner),
            scratch: Vec::new(),
        }))
    }
}

struct SimulatedContext {
    graph: Arc<GraphInner>,
    /// Reused across executions
    scratch: Vec<f32>,
}

impl ExecutionContext for SimulatedContext {
    fn execute(&mut self, batch_size: usize, table: &mut DeviceBufferTable) -> Result<(), RuntimeError> {
        let graph = &self.graph;
        if graph.fail_executions {
            return Err(RuntimeError::Execute("injected execution fault".to_string()));
        }
        if batch_size > graph.max_batch_size {
            return Err(RuntimeError::Execute(format!(
                "batch size {} exceeds engine maximum {}",
                batch_size, graph.max_batch_size
            )));
        }
        let layout = *table.layout();
        if layout.step_size() != graph.bindings.len() || layout.num_inputs() != graph.num_inputs {
            return Err(RuntimeError::Execute(format!(
                "binding count mismatch: table has {}, engine has {}",
                layout.step_size(),
                graph.bindings.len()
            )));
        }

        let mut bytes = Vec::new();
        for slot in 0..batch_size {
            self.scratch.clear();
            for input in 0..layout.num_inputs() {
                bytes.resize(table.binding_size(input)?, 0);
                table.read_input(slot, input, &mut bytes)?;
                self.scratch.extend(
                    bytes
                        .chunks_exact(4)
                        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]])),
                );
            }

            let value = graph.op.apply(&self.scratch).to_ne_bytes();
            for output in 0..layout.num_outputs() {
                bytes.clear();
                bytes.resize(table.binding_size(layout.num_inputs() + output)?, 0);
                for chunk in bytes.chunks_exact_mut(4) {
                    chunk.copy_from_slice(&value);
                }
                table.write_output(slot, output, &bytes)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::tests::CapturingLogger;
    use crate::tensor::TensorDescriptor;
    use device_memory::{BindingLayout, HostAllocator};

    fn manifest() -> GraphManifest {
        GraphManifest::default()
            .input("a", Dims::new(vec![2]))
            .input("b", Dims::new(vec![2]))
            .output("out", Dims::new(vec![1]))
    }

    fn compile(
        manifest: &GraphManifest,
        inputs: &[TensorDescriptor],
        outputs: &[TensorDescriptor],
        precision: Precision,
        logger: &CapturingLogger,
    ) -> Result<Box<dyn CompiledGraph>, RuntimeError> {
        let file = tempfile::NamedTempFile::new().unwrap();
        manifest.save(file.path()).unwrap();
        SimulatedRuntime::new().compile(&CompileRequest {
            artifact: file.path(),
            inputs,
            outputs,
            max_batch_size: 2,
            precision,
            logger,
        })
    }

    fn registered() -> (Vec<TensorDescriptor>, Vec<TensorDescriptor>) {
        (
            vec![
                TensorDescriptor::input("a", Dims::new(vec![2]), 4),
                TensorDescriptor::input("b", Dims::new(vec![2]), 4),
            ],
            vec![TensorDescriptor::output("out", 4)],
        )
    }

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    #[test]
    fn test_reduce_ops() {
        assert_eq!(ReduceOp::Sum.apply(&[1.0, 2.0, 3.0]), 6.0);
        assert_eq!(ReduceOp::Mean.apply(&[1.0, 2.0, 3.0]), 2.0);
        assert_eq!(ReduceOp::Max.apply(&[1.0, 5.0, 3.0]), 5.0);
        assert_eq!(ReduceOp::Mean.apply(&[]), 0.0);
    }

    #[test]
    fn test_compile_reports_bindings() {
        let (inputs, outputs) = registered();
        let logger = CapturingLogger::default();
        let graph = compile(&manifest(), &inputs, &outputs, Precision::Full, &logger).unwrap();

        assert_eq!(graph.num_bindings(), 3);
        let b0 = graph.binding(0).unwrap();
        assert!(b0.is_input);
        assert_eq!(b0.dims, Dims::new(vec![2]));
        let b2 = graph.binding(2).unwrap();
        assert!(!b2.is_input);
        assert_eq!(b2.data_type, DataType::Float);
        assert!(graph.binding(3).is_none());
    }

    #[test]
    fn test_unknown_input_rejected() {
        let (mut inputs, outputs) = registered();
        inputs[1] = TensorDescriptor::input("missing", Dims::new(vec![2]), 4);
        let logger = CapturingLogger::default();

        let result = compile(&manifest(), &inputs, &outputs, Precision::Full, &logger);
        assert!(matches!(result, Err(RuntimeError::Parse(_))));
    }

    #[test]
    fn test_dims_mismatch_rejected() {
        let (mut inputs, outputs) = registered();
        inputs[0] = TensorDescriptor::input("a", Dims::new(vec![3]), 4);
        let logger = CapturingLogger::default();

        let result = compile(&manifest(), &inputs, &outputs, Precision::Full, &logger);
        assert!(matches!(result, Err(RuntimeError::Parse(_))));
    }

    #[test]
    fn test_output_size_mismatch_rejected() {
        let (inputs, _) = registered();
        let outputs = vec![TensorDescriptor::output("out", 8)];
        let logger = CapturingLogger::default();

        let result = compile(&manifest(), &inputs, &outputs, Precision::Full, &logger);
        assert!(matches!(result, Err(RuntimeError::Compile(_))));
    }

    #[test]
    fn test_input_element_size_mismatch_rejected() {
        let (mut inputs, outputs) = registered();
        // Dims match the graph but elements are half-width
        inputs[1] = TensorDescriptor::input("b", Dims::new(vec![2]), 2);
        let logger = CapturingLogger::default();

        let result = compile(&manifest(), &inputs, &outputs, Precision::Full, &logger);
        assert!(matches!(result, Err(RuntimeError::Compile(_))));
    }

    #[test]
    fn test_unparsable_artifact() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"not json").unwrap();
        let (inputs, outputs) = registered();
        let logger = CapturingLogger::default();

        let result = SimulatedRuntime::new().compile(&CompileRequest {
            artifact: file.path(),
            inputs: &inputs,
            outputs: &outputs,
            max_batch_size: 1,
            precision: Precision::Full,
            logger: &logger,
        });
        assert!(matches!(result, Err(RuntimeError::Parse(_))));
    }

    #[test]
    fn test_int8_warns() {
        let (inputs, outputs) = registered();
        let logger = CapturingLogger::default();
        compile(&manifest(), &inputs, &outputs, Precision::Int8, &logger).unwrap();

        let messages = logger.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, Severity::Warning);
    }

    #[test]
    fn test_execute_reduces_per_slot() {
        let (inputs, outputs) = registered();
        let logger = CapturingLogger::default();
        let graph = compile(&manifest(), &inputs, &outputs, Precision::Full, &logger).unwrap();
        let mut context = graph.create_context().unwrap();

        let allocator = HostAllocator::new();
        let mut table =
            DeviceBufferTable::allocate(&allocator, BindingLayout::new(2, 1, 2), &[8, 8, 4]).unwrap();
        table.write_input(0, 0, &f32_bytes(&[1.0, 2.0])).unwrap();
        table.write_input(0, 1, &f32_bytes(&[3.0, 4.0])).unwrap();
        table.write_input(1, 0, &f32_bytes(&[10.0, 0.0])).unwrap();
        table.write_input(1, 1, &f32_bytes(&[0.0, 0.5])).unwrap();

        context.execute(2, &mut table).unwrap();

        let mut out = [0u8; 4];
        table.read_output(0, 0, &mut out).unwrap();
        assert_eq!(f32::from_ne_bytes(out), 10.0);
        table.read_output(1, 0, &mut out).unwrap();
        assert_eq!(f32::from_ne_bytes(out), 10.5);
    }

    #[test]
    fn test_execute_over_capacity_rejected() {
        let (inputs, outputs) = registered();
        let logger = CapturingLogger::default();
        let graph = compile(&manifest(), &inputs, &outputs, Precision::Full, &logger).unwrap();
        let mut context = graph.create_context().unwrap();

        let allocator = HostAllocator::new();
        let mut table =
            DeviceBufferTable::allocate(&allocator, BindingLayout::new(2, 1, 2), &[8, 8, 4]).unwrap();

        assert!(matches!(context.execute(3, &mut table), Err(RuntimeError::Execute(_))));
    }
}
