use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vesc_drive_runtime::config::{DEFAULT_CONFIG_PATH, VehicleConfig};
use vesc_drive_runtime::error::RuntimeError;
use vesc_drive_runtime::runtime::{self, RunOptions};

/// Motor drive runtime for VESC based e-bikes
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Vehicle configuration (JSON)
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Drive simulated controllers instead of the configured hardware
    #[arg(long)]
    simulate: bool,

    /// Serial device override for the motor link or CAN adapter
    #[arg(long)]
    port: Option<String>,

    /// Hardware watchdog device, e.g. /dev/watchdog
    #[arg(long)]
    watchdog: Option<PathBuf>,
}

fn load_config(args: &Args) -> Result<VehicleConfig, RuntimeError> {
    // A bench run needs no config file
    if args.simulate && !args.config.exists() {
        info!("No config at {}, using defaults", args.config.display());
        return Ok(VehicleConfig::default());
    }
    Ok(VehicleConfig::load(&args.config)?)
}

async fn start(args: Args) -> Result<(), RuntimeError> {
    let config = load_config(&args)?;
    let options = RunOptions {
        simulate: args.simulate,
        port: args.port,
        watchdog: args.watchdog,
    };
    runtime::run(config, options).await
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    if let Err(e) = start(args).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
