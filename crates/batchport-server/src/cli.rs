use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "batchportd", version, about = "BatchPort in-process inference host")]
pub struct Cli {
    /// Log level (RUST_LOG)
    #[arg(long, global = true, default_value = "info")]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load a model, send one request through it and print the result
    Demo(DemoArgs),

    /// Validate a model configuration file and print the resolved model
    CheckConfig {
        /// Path to a JSON model configuration
        path: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct DemoArgs {
    /// Path to a JSON model configuration (defaults to the built-in identity model)
    #[arg(long)]
    pub model_config: Option<PathBuf>,

    /// Number of execution instances
    #[arg(long, default_value_t = 1)]
    pub instances: u32,

    /// Device for inference (cpu or cuda:N)
    #[arg(long, default_value = "cpu")]
    pub device: String,

    /// Batching window in milliseconds
    #[arg(long, default_value_t = 5)]
    pub max_delay_ms: u64,

    /// Device pool capacity in bytes
    #[arg(long, default_value_t = 1 << 30)]
    pub device_capacity: usize,

    /// Pinned pool capacity in bytes
    #[arg(long, default_value_t = 256 << 20)]
    pub pinned_capacity: usize,
}
