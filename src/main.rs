//! CLI entry point for cnc-pipeline
//!
//! Provides commands for:
//! - Running the pipeline (acquisition, import, analysis) until Ctrl+C
//! - Validating a configuration file
//! - Inspecting the exchange queues of a machine
//!
//! # Usage
//!
//! ```bash
//! cnc-pipeline run --config config/cnc_pipeline.toml
//! cnc-pipeline check-config --print
//! cnc-pipeline queues --machine 7
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cnc_pipeline::config::{PipelineConfig, DEFAULT_CONFIG_PATH};
use cnc_pipeline::model::{Aggregation, Field, FieldType};
use cnc_pipeline::persistence::MemoryStore;
use cnc_pipeline::pipeline::Pipeline;
use cnc_pipeline::queue::QueueBus;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "cnc-pipeline")]
#[command(about = "CNC data acquisition and analysis pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline until Ctrl+C
    Run {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Load and validate a configuration file
    CheckConfig {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Print the effective configuration (file, defaults and environment)
        #[arg(long)]
        print: bool,
    },

    /// Show the queues of a machine and their depth
    Queues {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Machine id
        #[arg(long)]
        machine: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run(config).await,
        Commands::CheckConfig { config, print } => check_config(config, print),
        Commands::Queues { config, machine } => show_queues(config, machine),
    }
}

fn load(path: &Path) -> Result<PipelineConfig> {
    PipelineConfig::load_from(path)
        .with_context(|| format!("loading configuration from {}", path.display()))
}

/// In-memory store with the field catalogue of the mock drivers.
fn demo_store() -> MemoryStore {
    let store = MemoryStore::new();
    store.insert_field(Field::new(
        1,
        "SpindleSpeed",
        Aggregation::NewValue,
        FieldType::Int,
    ));
    store.insert_field(Field::new(2, "Feedrate", Aggregation::Average, FieldType::Double));
    store
}

async fn run(path: PathBuf) -> Result<()> {
    let config = load(&path)?;
    cnc_pipeline::logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
    info!(config = %path.display(), units = config.units.len(), "starting cnc-pipeline");

    let pipeline = Pipeline::new(config, Arc::new(demo_store()))?;
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl+C received"),
            Err(e) => warn!(error = %e, "cannot listen for Ctrl+C"),
        }
        trigger.cancel();
    });

    pipeline.run(cancel).await?;
    info!("cnc-pipeline stopped");
    Ok(())
}

fn check_config(path: PathBuf, print: bool) -> Result<()> {
    let config = load(&path)?;
    config.validate().map_err(anyhow::Error::msg)?;
    println!("Configuration {} is valid", path.display());
    println!("  units:    {}", config.units.len());
    println!("  machines: {:?}", config.machine_ids());
    if print {
        println!();
        print!("{}", toml::to_string_pretty(&config)?);
    }
    Ok(())
}

fn show_queues(path: PathBuf, machine: u32) -> Result<()> {
    let config = load(&path)?;
    let bus = QueueBus::new(config.queue.clone());

    let mut modules: Vec<u32> = config
        .units
        .iter()
        .filter(|unit| unit.machine_id == machine)
        .map(|unit| unit.module_id)
        .collect();
    if modules.is_empty() {
        modules.push(0);
    }

    for module in modules {
        let set = bus.machine_set(machine, module)?;
        println!("Machine {} module {}", machine, module);
        for info in set.inspect() {
            match info.count {
                Some(count) => println!("  {:<40} {}", info.name, count),
                None => println!("  {:<40} unavailable", info.name),
            }
        }
    }
    Ok(())
}
