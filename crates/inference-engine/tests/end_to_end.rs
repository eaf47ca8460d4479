//! End-to-end scenarios against the simulated runtime

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use device_memory::{DeviceBlock, DevicePtr};
use inference_engine::{
    DeviceAllocator, Dims, GraphManifest, HostAllocator, InferenceEngine, InferenceError, MemoryError,
    Precision, ReduceOp, SimulatedRuntime, TracingLogger,
};
use proptest::prelude::*;

const INPUT_BYTES: usize = 30 * 40 * 4;

fn write_graph(dir: &tempfile::TempDir) -> PathBuf {
    let path = dir.path().join("graph.json");
    GraphManifest::default()
        .input("input_1", Dims::chw(1, 30, 40))
        .input("input_2", Dims::chw(1, 30, 40))
        .output("dense_1/BiasAdd", Dims::new(vec![1]))
        .with_op(ReduceOp::Mean)
        .save(&path)
        .unwrap();
    path
}

/// Host allocator that counts every host-to-device copy
#[derive(Default)]
struct CountingAllocator {
    inner: HostAllocator,
    writes: Arc<AtomicUsize>,
}

impl CountingAllocator {
    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn live_blocks(&self) -> usize {
        self.inner.live_blocks()
    }
}

impl DeviceAllocator for CountingAllocator {
    fn allocate(&self, bytes: usize) -> Result<Box<dyn DeviceBlock>, MemoryError> {
        Ok(Box::new(CountingBlock {
            inner: self.inner.allocate(bytes)?,
            writes: Arc::clone(&self.writes),
        }))
    }
}

struct CountingBlock {
    inner: Box<dyn DeviceBlock>,
    writes: Arc<AtomicUsize>,
}

impl DeviceBlock for CountingBlock {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn copy_from_host(&mut self, src: &[u8]) -> Result<(), MemoryError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.copy_from_host(src)
    }

    fn copy_to_host(&self, dst: &mut [u8]) -> Result<(), MemoryError> {
        self.inner.copy_to_host(dst)
    }

    fn device_ptr(&self) -> DevicePtr {
        self.inner.device_ptr()
    }
}

fn engine(allocator: Arc<dyn DeviceAllocator>) -> InferenceEngine {
    let mut engine = InferenceEngine::with_parts(
        Box::new(SimulatedRuntime::new()),
        allocator,
        Arc::new(TracingLogger::default()),
    );
    engine.add_input("input_1", Dims::chw(1, 30, 40), 4).unwrap();
    engine.add_input("input_2", Dims::chw(1, 30, 40), 4).unwrap();
    engine.add_output("dense_1/BiasAdd", 4).unwrap();
    engine
}

fn zero_batch(size: usize) -> Vec<Vec<Vec<u8>>> {
    (0..size)
        .map(|_| vec![vec![0u8; INPUT_BYTES], vec![0u8; INPUT_BYTES]])
        .collect()
}

#[test]
fn full_batch_of_256() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = write_graph(&dir);
    let mut engine = engine(Arc::new(HostAllocator::new()));
    engine.build(&artifact, 256, Precision::Full).unwrap();

    let result = engine.predict(&zero_batch(256)).unwrap();

    assert_eq!(result.len(), 256);
    for item in &result {
        assert_eq!(item.len(), 1);
        assert_eq!(item[0].len(), 4);
        assert_eq!(f32::from_ne_bytes([item[0][0], item[0][1], item[0][2], item[0][3]]), 0.0);
    }
}

#[test]
fn batch_of_257_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = write_graph(&dir);
    let allocator = Arc::new(CountingAllocator::default());
    let mut engine = engine(allocator.clone());
    engine.build(&artifact, 256, Precision::Full).unwrap();

    engine.predict(&zero_batch(256)).unwrap();
    let writes = allocator.writes();
    // 256 items x (2 inputs + 1 output)
    assert_eq!(writes, 256 * 3);

    let result = engine.predict(&zero_batch(257));
    assert!(matches!(
        result,
        Err(InferenceError::CapacityExceeded { requested: 257, max: 256 })
    ));
    assert_eq!(allocator.writes(), writes);
    assert!(engine.is_ready());
    assert_eq!(allocator.live_blocks(), 256 * 3);

    assert_eq!(engine.predict(&zero_batch(256)).unwrap().len(), 256);
}

#[test]
fn invalid_inputs_never_reach_device() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = write_graph(&dir);
    let allocator = Arc::new(CountingAllocator::default());
    let mut engine = engine(allocator.clone());
    engine.build(&artifact, 4, Precision::Full).unwrap();

    // Item 0 is valid, so writing before validating item 1 would show up
    let mut missing_input = zero_batch(2);
    missing_input[1].pop();
    assert!(matches!(
        engine.predict(&missing_input),
        Err(InferenceError::InputCountMismatch { item: 1, expected: 2, actual: 1 })
    ));
    assert_eq!(allocator.writes(), 0);

    let mut short_input = zero_batch(2);
    short_input[1][1].truncate(INPUT_BYTES - 4);
    assert!(matches!(
        engine.predict(&short_input),
        Err(InferenceError::InputSizeMismatch { item: 1, input: 1, .. })
    ));
    assert_eq!(allocator.writes(), 0);

    assert!(engine.is_ready());
    engine.predict(&zero_batch(2)).unwrap();
    assert_eq!(allocator.writes(), 2 * 3);
}

#[test]
fn predict_before_build_is_not_ready() {
    let mut engine = engine(Arc::new(HostAllocator::new()));
    assert!(matches!(engine.predict(&zero_batch(1)), Err(InferenceError::NotReady)));
}

#[test]
fn summary_reports_every_binding() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = write_graph(&dir);
    let mut engine = engine(Arc::new(HostAllocator::new()));
    engine.build(&artifact, 16, Precision::Int8).unwrap();

    let summary = engine.engine_summary().unwrap();
    assert_eq!(summary.num_bindings(), engine.num_inputs() + engine.num_outputs());
    assert_eq!(summary.inputs().count(), 2);
    assert_eq!(summary.outputs().count(), 1);

    let text = summary.to_string();
    assert!(text.starts_with("--Binding 0--\nType: Input DataType: kFLOAT Dims: (1,30,40,)\n"));
    assert!(text.ends_with("--Binding 2--\nType: Output DataType: kFLOAT Dims: (1,)\n"));
}

#[test]
fn never_built_engine_drops_cleanly() {
    let allocator = Arc::new(HostAllocator::new());
    let mut engine = engine(allocator.clone());
    engine.teardown();
    drop(engine);
    assert_eq!(allocator.live_blocks(), 0);
}

#[test]
fn failed_build_then_successful_build() {
    let dir = tempfile::tempdir().unwrap();
    let allocator = Arc::new(HostAllocator::new());
    let mut engine = engine(allocator.clone());

    let missing = dir.path().join("missing.json");
    assert!(matches!(
        engine.build(&missing, 8, Precision::Full),
        Err(InferenceError::Compilation(_))
    ));
    assert_eq!(allocator.live_blocks(), 0);

    let artifact = write_graph(&dir);
    engine.build(&artifact, 8, Precision::Full).unwrap();
    assert_eq!(engine.predict(&zero_batch(8)).unwrap().len(), 8);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn result_shape_matches_batch(max_batch in 1usize..24, seed in any::<usize>()) {
        let dir = tempfile::tempdir().unwrap();
        let artifact = write_graph(&dir);
        let mut engine = engine(Arc::new(HostAllocator::new()));
        engine.build(&artifact, max_batch, Precision::Full).unwrap();

        let k = 1 + seed % max_batch;
        let result = engine.predict(&zero_batch(k)).unwrap();

        prop_assert_eq!(result.len(), k);
        for item in &result {
            prop_assert_eq!(item.len(), engine.num_outputs());
            for (buffer, desc) in item.iter().zip(engine.outputs()) {
                prop_assert_eq!(buffer.len(), desc.byte_size());
            }
        }

        let over = engine.predict(&zero_batch(max_batch + 1));
        let rejected = matches!(over, Err(InferenceError::CapacityExceeded { .. }));
        prop_assert!(rejected);
    }

    #[test]
    fn per_item_results_follow_inputs(values in prop::collection::vec(-100.0f32..100.0, 1..8)) {
        let dir = tempfile::tempdir().unwrap();
        let artifact = write_graph(&dir);
        let mut engine = engine(Arc::new(HostAllocator::new()));
        engine.build(&artifact, 8, Precision::Full).unwrap();

        // Each item has a constant input, so the mean equals that constant
        let batch: Vec<Vec<Vec<u8>>> = values
            .iter()
            .map(|v| {
                let bytes: Vec<u8> = std::iter::repeat(v.to_ne_bytes())
                    .take(INPUT_BYTES / 4)
                    .flatten()
                    .collect();
                vec![bytes.clone(), bytes]
            })
            .collect();

        let result = engine.predict(&batch).unwrap();
        for (item, v) in result.iter().zip(&values) {
            let out = f32::from_ne_bytes([item[0][0], item[0][1], item[0][2], item[0][3]]);
            prop_assert!((out - v).abs() <= v.abs() * 1e-3 + 1e-3);
        }
    }
}
