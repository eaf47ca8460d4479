use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "infer-bench", version, about = "Batched inference latency benchmark")]
pub struct Cli {
    /// Engine config file (TOML/JSON/YAML); built-in sample graph if omitted
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Predict calls averaged per round
    #[arg(long, default_value_t = 10)]
    pub samples: usize,

    /// Rounds to run, 0 loops until Ctrl-C
    #[arg(long, default_value_t = 0)]
    pub rounds: usize,

    /// Items per predict call, defaults to the engine maximum
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Write a simulated graph manifest matching the config before building
    #[arg(long)]
    pub init_graph: bool,

    /// Log level (RUST_LOG)
    #[arg(long, default_value = "info")]
    pub log: String,
}
