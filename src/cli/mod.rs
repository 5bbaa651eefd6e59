use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ce-drivers")]
#[command(about = "Exercise a container engine through its pluggable driver")]
#[command(version, long_about = None)]
pub struct Cli {
    /// Backend to load (docker, podman)
    #[arg(value_name = "DRIVER")]
    pub backend: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, env = "CE_DRIVERS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,
}
