//! Batched inference latency benchmark

mod cli;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::Cli;
use inference_engine::{BackendKind, Dims, EngineConfig, GraphManifest, InferenceEngine};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log);

    info!("=== infer-bench v{} ===", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    if cli.init_graph {
        if config.backend != BackendKind::Simulated {
            bail!("--init-graph only applies to the simulated backend");
        }
        sample_manifest(&config)
            .save(&config.artifact_path)
            .with_context(|| format!("writing {}", config.artifact_path.display()))?;
        info!("Wrote sample graph to {}", config.artifact_path.display());
    }

    let engine = config.build_engine().context("building engine")?;
    println!("{}", engine.engine_summary()?);

    let batch_size = cli.batch_size.unwrap_or(config.max_batch_size);
    if batch_size == 0 || batch_size > config.max_batch_size {
        bail!(
            "batch size {} outside 1..={}",
            batch_size,
            config.max_batch_size
        );
    }

    let stop = Arc::new(AtomicBool::new(false));
    let worker_stop = Arc::clone(&stop);
    let (samples, rounds) = (cli.samples.max(1), cli.rounds);
    let mut worker = tokio::task::spawn_blocking(move || {
        let mut engine = engine;
        let batch = zero_batch(&engine, batch_size);
        run_rounds(&mut engine, &batch, samples, rounds, &worker_stop)
    });

    tokio::select! {
        result = &mut worker => {
            result.context("benchmark worker panicked")??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, finishing current round");
            stop.store(true, Ordering::Relaxed);
            worker.await.context("benchmark worker panicked")??;
        }
    }

    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Graph manifest whose bindings match `config`, one float per output element
fn sample_manifest(config: &EngineConfig) -> GraphManifest {
    let manifest = config
        .inputs
        .iter()
        .fold(GraphManifest::default(), |m, input| m.input(input.name.as_str(), input.dims.clone()));
    config.outputs.iter().fold(manifest, |m, output| {
        m.output(
            output.name.as_str(),
            Dims::new(vec![output.byte_size / std::mem::size_of::<f32>()]),
        )
    })
}

/// `batch_size` items of zeroed input buffers sized to the registered inputs
fn zero_batch(engine: &InferenceEngine, batch_size: usize) -> Vec<Vec<Vec<u8>>> {
    (0..batch_size)
        .map(|_| {
            engine
                .inputs()
                .iter()
                .map(|input| vec![0u8; input.byte_size()])
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Run `rounds` rounds (0 = until `stop`) of `samples` predicts each,
/// logging the mean latency per round. Returns the per-round means in ms.
fn run_rounds(
    engine: &mut InferenceEngine,
    batch: &[Vec<Vec<u8>>],
    samples: usize,
    rounds: usize,
    stop: &AtomicBool,
) -> Result<Vec<f64>> {
    let mut means = Vec::new();
    let mut round = 0;
    while (rounds == 0 || round < rounds) && !stop.load(Ordering::Relaxed) {
        let mut total_ms = 0.0;
        for _ in 0..samples {
            let started = Instant::now();
            let outputs = engine.predict(batch)?;
            total_ms += started.elapsed().as_secs_f64() * 1000.0;
            if outputs.len() != batch.len() {
                warn!("expected {} results, got {}", batch.len(), outputs.len());
            }
        }
        let mean = total_ms / samples as f64;
        info!("Average over {} runs is {:.3} ms.", samples, mean);
        means.push(mean);
        round += 1;
    }
    Ok(means)
}
