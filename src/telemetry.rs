use anyhow::Result;
use std::io;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Log output settings for the `ce-drivers` binary
#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub log_level: String,
    pub enable_json_logs: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            enable_json_logs: false,
        }
    }
}

impl TracingConfig {
    pub fn verbose(verbose: bool) -> Self {
        Self {
            log_level: if verbose { "debug" } else { "info" }.to_string(),
            ..Default::default()
        }
    }

    /// `RUST_LOG` wins over the configured level. Logs go to stderr so that
    /// stdout only carries command output.
    pub fn init_tracing(&self) -> Result<()> {
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.log_level))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        if self.enable_json_logs {
            let json_layer = fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_writer(io::stderr);
            Registry::default().with(env_filter).with(json_layer).try_init()?;
        } else {
            let simple_layer = fmt::layer().with_target(false).compact().with_writer(io::stderr);
            Registry::default().with(env_filter).with(simple_layer).try_init()?;
        }

        Ok(())
    }
}
