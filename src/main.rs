mod cli;

use anyhow::{Context, Result};
use ce_drivers::{BackendRegistry, DriverConfig, scenario, telemetry::TracingConfig};
use clap::Parser;
use cli::Cli;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    TracingConfig {
        enable_json_logs: cli.json_logs,
        ..TracingConfig::verbose(cli.verbose)
    }
    .init_tracing()?;

    info!("🚀 ce-drivers starting up...");

    let config = DriverConfig::load(cli.config.as_deref()).context("loading configuration")?;

    let registry = BackendRegistry::builtin();
    let driver = match registry.load(&cli.backend, &config).await {
        Ok(driver) => driver,
        Err(err) => {
            error!("{}", err);
            eprintln!("{}", err);
            std::process::exit(1);
        }
    };

    let report = scenario::run(&driver, &config.scenario).await?;

    for outcome in &report.execs {
        println!("$ {}", outcome.argv.join(" "));
        print!("{}", outcome.result.stdout_lossy());
        if let Some(stderr) = outcome.result.stderr_lossy() {
            eprint!("{}", stderr);
        }
    }

    info!(
        "🎉 {} scenario complete: container {} ({}) on network {}",
        report.backend,
        report.container_id,
        report.container_name.as_deref().unwrap_or("unnamed"),
        report.network_id
    );
    Ok(())
}
