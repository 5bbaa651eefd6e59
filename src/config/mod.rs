use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Slightly offset from two minutes so timeouts caused by it are recognisable.
pub const DEFAULT_TIMEOUT_SECS: u64 = 119;
pub const DEFAULT_PULL_PROGRESS_DEADLINE_SECS: u64 = 10;
pub const DEFAULT_PULL_CHECK_INTERVAL_SECS: u64 = 10;

pub const ENV_TIMEOUT_SECS: &str = "CE_DRIVERS_TIMEOUT_SECS";
pub const ENV_DOCKER_SOCKET: &str = "CE_DRIVERS_DOCKER_SOCKET";
pub const ENV_PODMAN_URL: &str = "CE_DRIVERS_PODMAN_URL";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Upper bound for every short engine operation.
    pub timeout_secs: u64,
    pub pull: PullConfig,
    pub docker: DockerConfig,
    pub podman: PodmanConfig,
    pub scenario: ScenarioConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PullConfig {
    /// Cancel a pull when no progress event arrives for this long.
    pub progress_deadline_secs: u64,
    /// How often the watchdog looks at the latest progress timestamp.
    pub check_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct DockerConfig {
    /// Unix socket of the daemon. Unset means `DOCKER_HOST` or the platform default.
    pub socket: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PodmanConfig {
    pub binary: String,
    /// Remote service URL, e.g. `unix:///run/podman/podman.sock`.
    pub url: Option<String>,
}

/// The demo orchestration run by the binary
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub image: String,
    pub network: String,
    pub exec: Vec<Vec<String>>,
    pub wait_timeout_secs: u64,
    pub wait_interval_secs: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            pull: PullConfig::default(),
            docker: DockerConfig::default(),
            podman: PodmanConfig::default(),
            scenario: ScenarioConfig::default(),
        }
    }
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            progress_deadline_secs: DEFAULT_PULL_PROGRESS_DEADLINE_SECS,
            check_interval_secs: DEFAULT_PULL_CHECK_INTERVAL_SECS,
        }
    }
}

impl Default for PodmanConfig {
    fn default() -> Self {
        Self {
            binary: "podman".to_string(),
            url: None,
        }
    }
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            image: "quay.io/skupper/qdrouterd:0.4".to_string(),
            network: "skupper-network".to_string(),
            exec: vec![
                vec!["qdstat".to_string(), "-g".to_string()],
                vec!["qdstat".to_string(), "-l".to_string()],
            ],
            wait_timeout_secs: 30,
            wait_interval_secs: 5,
        }
    }
}

impl DriverConfig {
    /// Default config file location: `$XDG_CONFIG_HOME/ce-drivers/config.toml`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ce-drivers")
            .join("config.toml")
    }

    /// Load from `path` (or the default location), apply env overrides, validate.
    ///
    /// A missing file at the default location is not an error; a missing file
    /// that was asked for explicitly is.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    debug!("No config at {:?}, using defaults", path);
                    Self::default()
                }
            }
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {:?}", path))?;
        let config: DriverConfig =
            toml::from_str(&content).with_context(|| format!("Failed to parse config at {:?}", path))?;
        info!("📄 Loaded driver config from {:?}", path);
        Ok(config)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_TIMEOUT_SECS) {
            self.timeout_secs = value
                .trim()
                .parse()
                .with_context(|| format!("{} must be a number of seconds, got '{}'", ENV_TIMEOUT_SECS, value))?;
        }
        if let Some(socket) = lookup(ENV_DOCKER_SOCKET) {
            self.docker.socket = Some(socket);
        }
        if let Some(url) = lookup(ENV_PODMAN_URL) {
            self.podman.url = Some(url);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(anyhow!("timeout_secs must be greater than zero"));
        }
        if self.pull.progress_deadline_secs == 0 || self.pull.check_interval_secs == 0 {
            return Err(anyhow!("pull watchdog durations must be greater than zero"));
        }
        if self.pull.check_interval_secs > self.pull.progress_deadline_secs {
            return Err(anyhow!(
                "pull.check_interval_secs ({}) cannot exceed pull.progress_deadline_secs ({})",
                self.pull.check_interval_secs,
                self.pull.progress_deadline_secs
            ));
        }
        if self.podman.binary.trim().is_empty() {
            return Err(anyhow!("podman.binary cannot be empty"));
        }
        self.scenario.validate()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn watchdog(&self) -> WatchdogSettings {
        WatchdogSettings {
            stall_deadline: Duration::from_secs(self.pull.progress_deadline_secs),
            check_interval: Duration::from_secs(self.pull.check_interval_secs),
        }
    }
}

impl ScenarioConfig {
    fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(anyhow!("scenario.image cannot be empty"));
        }
        if self.network.contains(' ') {
            return Err(anyhow!("scenario.network cannot contain spaces: '{}'", self.network));
        }
        if self.wait_interval_secs == 0 || self.wait_timeout_secs <= self.wait_interval_secs {
            return Err(anyhow!(
                "scenario wait needs 0 < wait_interval_secs < wait_timeout_secs (got {} / {})",
                self.wait_interval_secs,
                self.wait_timeout_secs
            ));
        }
        if let Some(index) = self.exec.iter().position(|argv| argv.is_empty()) {
            return Err(anyhow!("scenario.exec[{}] is an empty command", index));
        }
        Ok(())
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn wait_interval(&self) -> Duration {
        Duration::from_secs(self.wait_interval_secs)
    }
}

/// Timing of the image pull watchdog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogSettings {
    pub stall_deadline: Duration,
    pub check_interval: Duration,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        DriverConfig::default().watchdog()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_engine_conventions() {
        let config = DriverConfig::default();
        assert_eq!(config.timeout(), Duration::from_secs(2 * 60 - 1));
        assert_eq!(config.watchdog().stall_deadline, Duration::from_secs(10));
        assert_eq!(config.podman.binary, "podman");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
timeout_secs = 45

[docker]
socket = "/var/run/docker.sock"

[scenario]
image = "alpine:3.19"
exec = [["echo", "hello"]]
"#,
        )
        .unwrap();

        let config = DriverConfig::load(Some(&path)).unwrap();
        assert_eq!(config.timeout_secs, 45);
        assert_eq!(config.docker.socket.as_deref(), Some("/var/run/docker.sock"));
        assert_eq!(config.scenario.image, "alpine:3.19");
        assert_eq!(config.scenario.exec, vec![vec!["echo".to_string(), "hello".to_string()]]);
        assert_eq!(config.scenario.network, "skupper-network");
        assert_eq!(config.pull, PullConfig::default());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let result = DriverConfig::load(Some(&dir.path().join("nope.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> = [
            (ENV_TIMEOUT_SECS, "7"),
            (ENV_PODMAN_URL, "unix:///run/podman/podman.sock"),
        ]
        .into_iter()
        .collect();

        let mut config = DriverConfig::default();
        config
            .apply_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.timeout_secs, 7);
        assert_eq!(config.podman.url.as_deref(), Some("unix:///run/podman/podman.sock"));
        assert_eq!(config.docker.socket, None);
    }

    #[test]
    fn bad_env_timeout_is_rejected() {
        let mut config = DriverConfig::default();
        let result = config.apply_env_overrides(|key| (key == ENV_TIMEOUT_SECS).then(|| "soon".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn check_interval_cannot_exceed_deadline() {
        let mut config = DriverConfig::default();
        config.pull.check_interval_secs = 20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn scenario_wait_must_fit_inside_timeout() {
        let mut config = DriverConfig::default();
        config.scenario.wait_timeout_secs = 5;
        assert!(config.validate().is_err());

        config.scenario = ScenarioConfig::default();
        config.scenario.exec.push(Vec::new());
        assert!(config.validate().is_err());
    }
}
