//! CPU runtime over tract-onnx
//!
//! Registered inputs are pinned to `[max_batch, dims..]` f32 facts and the
//! graph is optimized into a runnable plan at build time. Every execution
//! runs the full fixed batch; slots beyond the requested batch are zeroed
//! and their results discarded.

use std::sync::Arc;

use device_memory::DeviceBufferTable;
use tracing::debug;
use tract_onnx::prelude::*;

use crate::logger::Severity;
use crate::runtime::{AcceleratorRuntime, CompileRequest, CompiledGraph, ExecutionContext, RuntimeError};
use crate::tensor::{BindingInfo, DataType, Dims, Precision};

type RunFn = dyn Fn(TVec<TValue>) -> TractResult<TVec<TValue>> + Send + Sync;

/// Accelerator runtime backed by tract's CPU executor
#[derive(Debug, Clone, Copy, Default)]
pub struct TractRuntime;

impl TractRuntime {
    pub fn new() -> Self {
        Self
    }
}

impl AcceleratorRuntime for TractRuntime {
    fn name(&self) -> &'static str {
        "tract-onnx"
    }

    fn compile(&self, request: &CompileRequest<'_>) -> Result<Box<dyn CompiledGraph>, RuntimeError> {
        if request.precision != Precision::Full {
            request.logger.log(
                Severity::Error,
                &format!("tract executes FP32 only; {} requested", request.precision),
            );
            return Err(RuntimeError::UnsupportedPrecision(request.precision));
        }

        let parse_err = |e: TractError| RuntimeError::Parse(format!("{:#}", e));
        let compile_err = |e: TractError| RuntimeError::Compile(format!("{:#}", e));

        let mut model = tract_onnx::onnx()
            .model_for_path(request.artifact)
            .map_err(parse_err)?
            .with_input_names(request.inputs.iter().map(|i| i.name()))
            .map_err(parse_err)?
            .with_output_names(request.outputs.iter().map(|o| o.name()))
            .map_err(parse_err)?;

        for (ix, input) in request.inputs.iter().enumerate() {
            let mut shape = vec![request.max_batch_size];
            shape.extend_from_slice(input.dims().map(Dims::as_slice).unwrap_or_default());
            model = model
                .with_input_fact(ix, f32::fact(shape).into())
                .map_err(parse_err)?;
        }

        let typed = model.into_optimized().map_err(compile_err)?;

        let mut bindings = Vec::with_capacity(request.inputs.len() + request.outputs.len());
        let mut output_volumes = Vec::with_capacity(request.outputs.len());
        for (ix, input) in request.inputs.iter().enumerate() {
            let fact = typed.input_fact(ix).map_err(compile_err)?;
            bindings.push(binding_info(input.name(), true, fact)?);
        }
        for (ix, output) in request.outputs.iter().enumerate() {
            let fact = typed.output_fact(ix).map_err(compile_err)?;
            let info = binding_info(output.name(), false, fact)?;
            let expected = info.dims.volume() * info.data_type.size();
            if output.byte_size() != expected {
                return Err(RuntimeError::Compile(format!(
                    "output '{}' registered with {} bytes, graph produces {}",
                    output.name(),
                    output.byte_size(),
                    expected
                )));
            }
            output_volumes.push(info.dims.volume());
            bindings.push(info);
        }

        let plan = typed.into_runnable().map_err(compile_err)?;
        let run: Box<RunFn> = Box::new(move |inputs: TVec<TValue>| plan.run(inputs));

        debug!(
            "tract plan ready: {} bindings, batch {}",
            bindings.len(),
            request.max_batch_size
        );

        Ok(Box::new(TractGraph {
            inner: Arc::new(TractInner {
                bindings,
                num_inputs: request.inputs.len(),
                output_volumes,
                max_batch_size: request.max_batch_size,
                run,
            }),
        }))
    }
}

fn binding_info(name: &str, is_input: bool, fact: &TypedFact) -> Result<BindingInfo, RuntimeError> {
    if fact.datum_type != f32::datum_type() {
        return Err(RuntimeError::Compile(format!(
            "binding '{}' has unsupported type {:?}",
            name, fact.datum_type
        )));
    }
    let shape = fact.shape.as_concrete().ok_or_else(|| {
        RuntimeError::Compile(format!("binding '{}' has a symbolic shape", name))
    })?;
    Ok(BindingInfo {
        name: name.to_string(),
        is_input,
        data_type: DataType::Float,
        // Leading axis is the batch
        dims: Dims::from(shape.get(1..).unwrap_or_default()),
    })
}

struct TractInner {
    bindings: Vec<BindingInfo>,
    num_inputs: usize,
    output_volumes: Vec<usize>,
    max_batch_size: usize,
    run: Box<RunFn>,
}

struct TractGraph {
    inner: Arc<TractInner>,
}

impl CompiledGraph for TractGraph {
    fn num_bindings(&self) -> usize {
        self.inner.bindings.len()
    }

    fn binding(&self, index: usize) -> Option<BindingInfo> {
        self.inner.bindings.get(index).cloned()
    }

    fn create_context(&self) -> Result<Box<dyn ExecutionContext>, RuntimeError> {
        Ok(Box::new(TractContext {
            graph: Arc::clone(&self.inner),
        }))
    }
}

struct TractContext {
    graph: Arc<TractInner>,
}

impl ExecutionContext for TractContext {
    fn execute(&mut self, batch_size: usize, table: &mut DeviceBufferTable) -> Result<(), RuntimeError> {
        let graph = &self.graph;
        if batch_size > graph.max_batch_size {
            return Err(RuntimeError::Execute(format!(
                "batch size {} exceeds engine maximum {}",
                batch_size, graph.max_batch_size
            )));
        }
        let layout = *table.layout();
        if layout.num_inputs() != graph.num_inputs || layout.step_size() != graph.bindings.len() {
            return Err(RuntimeError::Execute(format!(
                "binding count mismatch: table has {}, engine has {}",
                layout.step_size(),
                graph.bindings.len()
            )));
        }

        let mut inputs: TVec<TValue> = TVec::new();
        let mut bytes = Vec::new();
        for (ix, binding) in graph.bindings[..graph.num_inputs].iter().enumerate() {
            let volume = binding.dims.volume();
            let mut values = vec![0f32; graph.max_batch_size * volume];
            bytes.resize(table.binding_size(ix)?, 0);
            for slot in 0..batch_size {
                table.read_input(slot, ix, &mut bytes)?;
                for (dst, c) in values[slot * volume..(slot + 1) * volume]
                    .iter_mut()
                    .zip(bytes.chunks_exact(4))
                {
                    *dst = f32::from_ne_bytes([c[0], c[1], c[2], c[3]]);
                }
            }

            let mut shape = vec![graph.max_batch_size];
            shape.extend_from_slice(binding.dims.as_slice());
            let tensor = Tensor::from_shape::<f32>(&shape, &values)
                .map_err(|e| RuntimeError::Execute(format!("{:#}", e)))?;
            inputs.push(tensor.into());
        }

        let outputs = (graph.run)(inputs).map_err(|e| RuntimeError::Execute(format!("{:#}", e)))?;
        if outputs.len() != graph.output_volumes.len() {
            return Err(RuntimeError::Execute(format!(
                "plan produced {} outputs, {} expected",
                outputs.len(),
                graph.output_volumes.len()
            )));
        }

        for (ox, (output, &volume)) in outputs.iter().zip(&graph.output_volumes).enumerate() {
            let values = output
                .as_slice::<f32>()
                .map_err(|e| RuntimeError::Execute(format!("{:#}", e)))?;
            for slot in 0..batch_size {
                let item = values.get(slot * volume..(slot + 1) * volume).ok_or_else(|| {
                    RuntimeError::Execute(format!("output {} is shorter than the batch", ox))
                })?;
                bytes.clear();
                bytes.extend(item.iter().flat_map(|v| v.to_ne_bytes()));
                table.write_output(slot, ox, &bytes)?;
            }
        }
        Ok(())
    }
}
