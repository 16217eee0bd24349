mod cli;
mod demo;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use batchport_core::{Device, InstanceDescriptor, ModelConfig};
use batchport_host::{BatchPolicy, ModelRegistry, PoolConfig, PoolMemoryManager};
use batchport_runtime::{Compute, IdentityCompute};
use clap::Parser;
use cli::{Cli, Command, DemoArgs};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    std::env::set_var("RUST_LOG", &cli.log);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match cli.command {
        Command::Demo(args) => demo(args).await,
        Command::CheckConfig { path } => check_config(&path),
    }
}

async fn demo(args: DemoArgs) -> Result<()> {
    let device = parse_device(&args.device)?;
    let config = match &args.model_config {
        Some(path) => ModelConfig::from_file(path)?,
        None => ModelConfig::default(),
    };

    let devices = match device {
        Device::Cpu => 0,
        Device::Cuda { device_id } => device_id + 1,
    };
    let memory = Arc::new(PoolMemoryManager::new(PoolConfig {
        host_capacity: None,
        pinned_capacity: Some(args.pinned_capacity),
        device_capacity: Some(args.device_capacity),
        devices,
        peer_access: false,
    }));

    let instances = (0..args.instances.max(1))
        .map(|i| InstanceDescriptor::new(format!("{}_{i}", config.name), device.clone()))
        .collect();
    let policy = BatchPolicy {
        max_batch: config.max_batch_size.max(1),
        max_delay: Duration::from_millis(args.max_delay_ms),
    };

    let mut registry = ModelRegistry::new(memory);
    registry.load(&config, Arc::new(IdentityCompute), instances, policy)?;

    let outcome = demo::run(&registry, &config.name).await;
    registry.shutdown().await?;
    outcome
}

fn check_config(path: &std::path::Path) -> Result<()> {
    let config = ModelConfig::from_file(path)?;
    let spec = config
        .to_spec()
        .with_context(|| format!("{} is not a usable model", path.display()))?;
    IdentityCompute
        .validate(&spec)
        .with_context(|| format!("{} cannot be served by the identity backend", path.display()))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&config).context("failed to render config")?
    );
    tracing::info!(
        model = %spec.name,
        inputs = spec.inputs.len(),
        outputs = spec.outputs.len(),
        "configuration is valid"
    );
    Ok(())
}

fn parse_device(raw: &str) -> Result<Device> {
    if raw.eq_ignore_ascii_case("cpu") {
        return Ok(Device::Cpu);
    }

    if let Some(rest) = raw.strip_prefix("cuda:") {
        let device_id: u32 = rest.parse().context("invalid cuda device id")?;
        return Ok(Device::Cuda { device_id });
    }

    anyhow::bail!("unsupported device: {raw} (expected cpu or cuda:N)");
}
