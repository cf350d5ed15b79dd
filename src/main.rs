use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use l7lb::config::{Algorithm, Config};
use l7lb::driver::run_scenario;

#[derive(Parser, Debug)]
#[command(name = "l7lb")]
#[command(about = "Layer-7 TCP load balancer simulator")]
struct Args {
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Check the configuration and exit
    #[arg(long)]
    validate_config: bool,

    /// Override the configured balancing algorithm
    #[arg(short, long, value_enum)]
    algorithm: Option<Algorithm>,

    /// Override the configured random seed
    #[arg(short, long)]
    seed: Option<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting L7 load balancer simulation");

    // Load configuration
    let mut config = Config::load(&args.config)?;
    if let Some(algorithm) = args.algorithm {
        config.balancer.algorithm = algorithm;
    }
    if let Some(seed) = args.seed {
        config.simulation.seed = seed;
    }

    if args.validate_config {
        info!("Configuration is valid");
        return Ok(());
    }

    let report = run_scenario(&config)?;
    report.log_summary();

    info!("Simulation finished");
    Ok(())
}
