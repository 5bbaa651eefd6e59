use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

use crate::config::{DriverConfig, WatchdogSettings};
use crate::driver::{CONTRACT_VERSION, Driver, with_deadline};
use crate::error::{DriverError, Result};
use crate::exec;
use crate::progress::{self, PullEvent};
use crate::types::{
    Container, ContainerCreateResponse, ContainerListOptions, ExecResult, ImageInspect,
    ImageListOptions, ImagePullOptions, ImageSummary, InspectContainerData, NetworkCreateOptions,
    NetworkCreateResponse, NetworkResource,
};
use crate::wait::wait_for_state;

pub const BACKEND: &str = "podman";

/// Podman backend driving the `podman` command line with JSON output.
///
/// Every invocation gets its own pipes, so concurrent execs never share
/// process-wide stdout.
pub struct PodmanBackend {
    binary: String,
    url: Option<String>,
    timeout: Duration,
    watchdog: WatchdogSettings,
    connected: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PodmanImage {
    id: String,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
    #[serde(default)]
    repo_digests: Option<Vec<String>>,
    #[serde(default)]
    names: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PodmanImageInspect {
    id: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PodmanContainer {
    id: String,
    #[serde(default)]
    names: Option<Vec<String>>,
    #[serde(default)]
    image: String,
    #[serde(default, rename = "ImageID")]
    image_id: Option<String>,
    #[serde(default)]
    command: Option<Vec<String>>,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
    #[serde(default)]
    state: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PodmanContainerInspect {
    id: String,
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    path: String,
    #[serde(default)]
    args: Option<Vec<String>>,
    #[serde(default)]
    image: String,
    #[serde(default)]
    image_name: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    state: Option<PodmanState>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PodmanState {
    #[serde(default)]
    status: String,
}

impl PodmanBackend {
    pub fn new(config: &DriverConfig) -> Self {
        Self {
            binary: config.podman.binary.clone(),
            url: config.podman.url.clone(),
            timeout: config.timeout(),
            // The CLI reports per-layer completion rather than byte progress,
            // so a healthy pull of a large layer can be silent for a while.
            watchdog: WatchdogSettings {
                stall_deadline: config.timeout(),
                check_interval: config.watchdog().check_interval,
            },
            connected: false,
        }
    }

    fn command<S: AsRef<str>>(&self, args: &[S]) -> Command {
        let mut command = Command::new(&self.binary);
        if let Some(url) = &self.url {
            command.arg("--url").arg(url);
        }
        command
            .args(args.iter().map(AsRef::as_ref))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(DriverError::NotConnected {
                backend: BACKEND.to_string(),
            })
        }
    }

    /// Run one CLI invocation to completion and return its stdout.
    async fn invoke<S: AsRef<str>>(&self, operation: &'static str, target: &str, args: &[S]) -> Result<Vec<u8>> {
        let mut command = self.command(args);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        debug!(
            "Running {} {}",
            self.binary,
            args.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(" ")
        );

        let output = with_deadline(operation, target, self.timeout, async {
            command.output().await.map_err(|err| {
                DriverError::engine(operation, target, format!("failed to run {}: {}", self.binary, err))
            })
        })
        .await?;

        if !output.status.success() {
            return Err(DriverError::engine(
                operation,
                target,
                failure_message(&output.stderr, output.status),
            ));
        }
        Ok(output.stdout)
    }

    async fn run<S: AsRef<str>>(&self, operation: &'static str, target: &str, args: &[S]) -> Result<Vec<u8>> {
        self.ensure_connected()?;
        self.invoke(operation, target, args).await
    }

    async fn run_json<T, S>(&self, operation: &'static str, target: &str, args: &[S]) -> Result<T>
    where
        T: DeserializeOwned,
        S: AsRef<str>,
    {
        let stdout = self.run(operation, target, args).await?;
        serde_json::from_slice(&stdout).map_err(|err| DriverError::decode(operation, target, err.to_string()))
    }

    async fn inspect(&self, id: &str) -> Result<PodmanContainerInspect> {
        let mut found: Vec<PodmanContainerInspect> = self
            .run_json("container inspect", id, &["container", "inspect", id])
            .await?;
        if found.is_empty() {
            return Err(DriverError::engine("container inspect", id, "no such container"));
        }
        Ok(found.swap_remove(0))
    }

    async fn inspect_state(&self, id: &str) -> Result<String> {
        let info = self.inspect(id).await?;
        Ok(info.state.map(|state| state.status).unwrap_or_default())
    }
}

#[async_trait]
impl Driver for PodmanBackend {
    fn name(&self) -> &str {
        BACKEND
    }

    fn contract_version(&self) -> u32 {
        CONTRACT_VERSION
    }

    async fn connect(&mut self) -> Result<()> {
        let stdout = self
            .invoke("version", BACKEND, &["version", "--format", "json"])
            .await
            .map_err(|err| DriverError::Connection {
                backend: BACKEND.to_string(),
                reason: err.to_string(),
            })?;
        let version: serde_json::Value = serde_json::from_slice(&stdout).map_err(|err| DriverError::Connection {
            backend: BACKEND.to_string(),
            reason: format!("unreadable version report: {}", err),
        })?;

        info!(
            "🦭 Connected to Podman {}",
            version["Client"]["Version"].as_str().unwrap_or("(unknown version)")
        );
        self.connected = true;
        Ok(())
    }

    async fn images_pull(&self, reference: &str, options: &ImagePullOptions) -> Result<Vec<String>> {
        self.ensure_connected()?;
        let mut args = vec!["pull"];
        if let Some(platform) = &options.platform {
            args.extend(["--platform", platform.as_str()]);
        }
        args.push(reference);

        let mut child = self
            .command(args.as_slice())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| DriverError::engine("image pull", reference, format!("failed to run {}: {}", self.binary, err)))?;

        // Image IDs land on stdout once the pull is done.
        // Aborted on every early return below.
        let stdout_reader = child.stdout.take().map(|mut stdout| {
            AbortOnDrop(tokio::spawn(async move {
                let mut buf = Vec::new();
                stdout.read_to_end(&mut buf).await.map(|_| buf)
            }))
        });

        let events = match child.stderr.take() {
            Some(stderr) => {
                let lines = BufReader::new(stderr).lines();
                stream::unfold(lines, move |mut lines| async move {
                    match lines.next_line().await {
                        Ok(Some(line)) => Some((Ok(progress_line(&line)), lines)),
                        Ok(None) => None,
                        Err(err) => Some((Err(DriverError::from(err)), lines)),
                    }
                })
                .left_stream()
            }
            None => stream::empty().right_stream(),
        };

        if let Err(err) = progress::watch_pull(reference, self.watchdog, events).await {
            if let Err(kill_err) = child.kill().await {
                warn!("Failed to stop podman pull of {}: {}", reference, kill_err);
            }
            return Err(err);
        }

        let status = with_deadline("image pull", reference, self.timeout, async {
            child.wait().await.map_err(DriverError::from)
        })
        .await?;
        if !status.success() {
            return Err(DriverError::engine(
                "image pull",
                reference,
                format!("podman pull exited with {}", status),
            ));
        }

        let stdout = match stdout_reader {
            Some(reader) => reader
                .join()
                .await
                .map_err(|err| DriverError::engine("image pull", reference, err.to_string()))??,
            None => Vec::new(),
        };
        Ok(non_empty_lines(&stdout))
    }

    async fn images_list(&self, options: &ImageListOptions) -> Result<Vec<ImageSummary>> {
        let mut args = vec!["images".to_string(), "--format".to_string(), "json".to_string()];
        if options.all {
            args.push("--all".to_string());
        }
        args.extend(filter_args(&options.filters));

        let images: Vec<PodmanImage> = self.run_json("image list", "", args.as_slice()).await?;
        Ok(images.into_iter().map(image_summary).collect())
    }

    async fn image_inspect(&self, id: &str) -> Result<ImageInspect> {
        let mut found: Vec<PodmanImageInspect> = self
            .run_json("image inspect", id, &["image", "inspect", id])
            .await?;
        if found.is_empty() {
            return Err(DriverError::engine("image inspect", id, "no such image"));
        }
        let data = found.swap_remove(0);
        Ok(ImageInspect {
            id: data.id,
            size: data.size,
            repo_tags: data.repo_tags.unwrap_or_default(),
        })
    }

    async fn container_create(&self, image: &str) -> Result<ContainerCreateResponse> {
        let stdout = self.run("container create", image, &["create", image]).await?;
        let id = non_empty_lines(&stdout)
            .pop()
            .ok_or_else(|| DriverError::decode("container create", image, "no container id printed"))?;
        info!("📦 Created container {} from {}", id, image);
        Ok(ContainerCreateResponse {
            id,
            warnings: Vec::new(),
        })
    }

    async fn container_start(&self, id: &str) -> Result<()> {
        self.run("container start", id, &["start", id]).await.map(|_| ())
    }

    async fn container_wait(
        &self,
        id: &str,
        target_state: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<()> {
        wait_for_state(id, target_state, timeout, poll_interval, move || self.inspect_state(id))
            .await
            .map(|_| ())
    }

    async fn container_list(&self, options: &ContainerListOptions) -> Result<Vec<Container>> {
        let mut args = vec!["ps".to_string(), "--format".to_string(), "json".to_string()];
        if options.all {
            args.push("--all".to_string());
        }
        if let Some(limit) = options.limit {
            args.extend(["--last".to_string(), limit.to_string()]);
        }
        args.extend(filter_args(&options.filters));

        let containers: Vec<PodmanContainer> = self.run_json("container list", "", args.as_slice()).await?;
        Ok(containers.into_iter().map(container_summary).collect())
    }

    async fn container_inspect(&self, id: &str) -> Result<InspectContainerData> {
        let info = self.inspect(id).await?;
        Ok(InspectContainerData {
            id: info.id,
            created: info.created.as_deref().and_then(rfc3339),
            path: info.path,
            args: info.args.unwrap_or_default(),
            image: info.image,
            image_name: info.image_name,
            name: info.name,
        })
    }

    async fn container_stop(&self, id: &str) -> Result<()> {
        self.run("container stop", id, &["stop", id]).await.map(|_| ())
    }

    async fn container_remove(&self, id: &str) -> Result<()> {
        self.run("container remove", id, &["rm", "--force", id])
            .await
            .map(|_| ())
    }

    async fn container_exec(&self, id: &str, argv: &[String]) -> Result<ExecResult> {
        self.ensure_connected()?;
        let mut args = vec!["exec".to_string(), id.to_string()];
        args.extend(argv.iter().cloned());

        let mut command = self.command(args.as_slice());
        command.stdout(Stdio::piped()).stderr(Stdio::piped());

        with_deadline("container exec", id, self.timeout, async {
            let mut child = command.spawn().map_err(|err| {
                DriverError::engine("container exec", id, format!("failed to run {}: {}", self.binary, err))
            })?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| DriverError::engine("container exec", id, "stdout pipe unavailable"))?;
            let stderr = child.stderr.take();
            let label = format!("{}:{}", id, child.id().unwrap_or_default());

            let drain = exec::drain_pipes(&label, stdout, stderr);
            exec::capture(drain, move || async move {
                let status = child.wait().await?;
                Ok(exit_code(status))
            })
            .await
        })
        .await
    }

    async fn network_create(
        &self,
        name: &str,
        options: &NetworkCreateOptions,
    ) -> Result<NetworkCreateResponse> {
        let stdout = self
            .run("network create", name, network_create_args(name, options).as_slice())
            .await?;
        let id = non_empty_lines(&stdout).pop().unwrap_or_else(|| name.to_string());
        Ok(NetworkCreateResponse { id, warning: None })
    }

    async fn network_inspect(&self, id: &str) -> Result<NetworkResource> {
        let found: Vec<serde_json::Value> = self
            .run_json("network inspect", id, &["network", "inspect", id])
            .await?;
        found
            .first()
            .and_then(network_resource)
            .ok_or_else(|| DriverError::decode("network inspect", id, "no network description returned"))
    }

    async fn network_remove(&self, id: &str) -> Result<()> {
        self.run("network remove", id, &["network", "rm", "--force", id])
            .await
            .map(|_| ())
    }

    async fn network_connect(&self, id: &str, container_id: &str, aliases: &[String]) -> Result<()> {
        let mut args = vec!["network".to_string(), "connect".to_string()];
        for alias in aliases {
            args.extend(["--alias".to_string(), alias.clone()]);
        }
        args.extend([id.to_string(), container_id.to_string()]);
        self.run("network connect", id, args.as_slice()).await.map(|_| ())
    }

    async fn network_disconnect(&self, id: &str, container_id: &str, force: bool) -> Result<()> {
        let mut args = vec!["network", "disconnect"];
        if force {
            args.push("--force");
        }
        args.extend([id, container_id]);
        self.run("network disconnect", id, args.as_slice()).await.map(|_| ())
    }
}

/// Background task handle that is aborted when dropped unjoined.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> AbortOnDrop<T> {
    async fn join(mut self) -> std::result::Result<T, JoinError> {
        (&mut self.0).await
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn failure_message(stderr: &[u8], status: ExitStatus) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    let last = stderr.lines().rev().find(|line| !line.trim().is_empty());
    match last {
        Some(line) => line.trim().trim_start_matches("Error: ").to_string(),
        None => format!("podman exited with {}", status),
    }
}

fn exit_code(status: ExitStatus) -> i64 {
    if let Some(code) = status.code() {
        return i64::from(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + i64::from(signal);
        }
    }
    -1
}

fn non_empty_lines(output: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(output)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn filter_args(filters: &HashMap<String, Vec<String>>) -> Vec<String> {
    let mut keys: Vec<_> = filters.keys().collect();
    keys.sort();
    keys.into_iter()
        .flat_map(|key| {
            filters[key]
                .iter()
                .flat_map(move |value| ["--filter".to_string(), format!("{}={}", key, value)])
        })
        .collect()
}

fn network_create_args(name: &str, options: &NetworkCreateOptions) -> Vec<String> {
    let mut args = vec!["network".to_string(), "create".to_string()];
    args.extend([
        "--driver".to_string(),
        options.driver.clone().unwrap_or_else(|| "bridge".to_string()),
    ]);
    let mut opts: Vec<_> = options.options.iter().collect();
    opts.sort();
    for (key, value) in opts {
        args.extend(["--opt".to_string(), format!("{}={}", key, value)]);
    }
    let mut labels: Vec<_> = options.labels.iter().collect();
    labels.sort();
    for (key, value) in labels {
        args.extend(["--label".to_string(), format!("{}={}", key, value)]);
    }
    if options.internal {
        args.push("--internal".to_string());
    }
    args.push(name.to_string());
    args
}

/// Turn one line of `podman pull` stderr into a progress event.
fn progress_line(line: &str) -> PullEvent {
    let line = line.trim();
    if let Some(message) = line.strip_prefix("Error: ") {
        return PullEvent {
            error: Some(message.to_string()),
            ..PullEvent::status(line)
        };
    }
    for prefix in ["Copying blob", "Copying config"] {
        if let Some(rest) = line.strip_prefix(prefix) {
            let mut words = rest.split_whitespace();
            let id = words.next().map(|digest| {
                let hex = digest.trim_start_matches("sha256:");
                hex.chars().take(12).collect::<String>()
            });
            let tail: Vec<_> = words.collect();
            let status = if tail.is_empty() {
                prefix.to_string()
            } else {
                format!("{} {}", prefix, tail.join(" "))
            };
            return PullEvent {
                id,
                ..PullEvent::status(status)
            };
        }
    }
    PullEvent::status(line)
}

fn rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|time| time.with_timezone(&Utc))
}

fn image_summary(image: PodmanImage) -> ImageSummary {
    ImageSummary {
        id: image.id,
        created: image.created.and_then(|secs| DateTime::from_timestamp(secs, 0)),
        size: image.size,
        labels: image.labels.unwrap_or_default(),
        repo_tags: image.repo_tags.or(image.names).unwrap_or_default(),
        repo_digests: image.repo_digests.unwrap_or_default(),
    }
}

fn container_summary(container: PodmanContainer) -> Container {
    Container {
        id: container.id,
        names: container.names.unwrap_or_default(),
        image: container.image,
        image_id: container.image_id.unwrap_or_default(),
        command: container.command.unwrap_or_default().join(" "),
        labels: container.labels.unwrap_or_default(),
        state: container.state,
        status: container.status.unwrap_or_default(),
    }
}

/// Netavark reports lowercase keys, CNI-era podman PascalCase.
fn network_resource(value: &serde_json::Value) -> Option<NetworkResource> {
    let field = |lower: &str, pascal: &str| {
        value
            .get(lower)
            .or_else(|| value.get(pascal))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };
    let name = field("name", "Name")?;
    Some(NetworkResource {
        id: field("id", "Id").unwrap_or_else(|| name.clone()),
        driver: field("driver", "Driver"),
        name,
    })
}
