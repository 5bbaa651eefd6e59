use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::{
    ContainerInspectResponse, ContainerSummary, CreateImageInfo, EndpointSettings,
    ImageInspect as EngineImageInspect, ImageSummary as EngineImageSummary, Network,
};
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions, InspectNetworkOptions,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{DriverConfig, WatchdogSettings};
use crate::driver::{CONTRACT_VERSION, Driver, with_deadline};
use crate::error::{DriverError, Result};
use crate::exec::{self, OutputChunk};
use crate::progress::{self, ProgressDetail, PullEvent};
use crate::types::{
    Container, ContainerCreateResponse, ContainerListOptions, ExecResult, ImageInspect,
    ImageListOptions, ImagePullOptions, ImageSummary, InspectContainerData, NetworkCreateOptions,
    NetworkCreateResponse, NetworkResource,
};
use crate::wait::wait_for_state;

pub const BACKEND: &str = "docker";

/// Docker Engine backend speaking the Engine API
pub struct DockerBackend {
    socket: Option<String>,
    timeout: Duration,
    watchdog: WatchdogSettings,
    client: Option<Docker>,
}

impl DockerBackend {
    pub fn new(config: &DriverConfig) -> Self {
        Self {
            socket: config.docker.socket.clone(),
            timeout: config.timeout(),
            watchdog: config.watchdog(),
            client: None,
        }
    }

    fn client(&self) -> Result<&Docker> {
        self.client.as_ref().ok_or_else(|| DriverError::NotConnected {
            backend: BACKEND.to_string(),
        })
    }

    /// One engine request bounded by the default timeout.
    async fn call<T, F>(&self, operation: &'static str, target: &str, request: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, BollardError>>,
    {
        let limit = self.timeout;
        with_deadline(operation, target, limit, async {
            request
                .await
                .map_err(|err| engine_error(operation, target, limit, err))
        })
        .await
    }

    async fn inspect_state(&self, id: &str) -> Result<String> {
        let client = self.client()?;
        let info = self
            .call(
                "container inspect",
                id,
                client.inspect_container(id, None::<InspectContainerOptions>),
            )
            .await?;
        Ok(info
            .state
            .and_then(|state| state.status)
            .map(|status| status.to_string())
            .unwrap_or_default())
    }
}

#[async_trait]
impl Driver for DockerBackend {
    fn name(&self) -> &str {
        BACKEND
    }

    fn contract_version(&self) -> u32 {
        CONTRACT_VERSION
    }

    async fn connect(&mut self) -> Result<()> {
        let connection_error = |err: BollardError| DriverError::Connection {
            backend: BACKEND.to_string(),
            reason: err.to_string(),
        };

        let client = match &self.socket {
            Some(path) => {
                debug!("Connecting to Docker at {}", path);
                Docker::connect_with_socket(path, self.timeout.as_secs(), bollard::API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(connection_error)?;

        let client = with_deadline("api version negotiation", BACKEND, self.timeout, async {
            client.negotiate_version().await.map_err(connection_error)
        })
        .await?;

        info!("🐳 Connected to Docker Engine");
        self.client = Some(client);
        Ok(())
    }

    async fn images_pull(&self, reference: &str, options: &ImagePullOptions) -> Result<Vec<String>> {
        let client = self.client()?;
        let (image, tag) = split_reference(reference);
        debug!("Pulling {} (tag {:?})", image, tag);

        let request = CreateImageOptions {
            from_image: image.clone(),
            tag: tag.clone(),
            platform: options.platform.clone().unwrap_or_default(),
            ..Default::default()
        };
        let limit = self.timeout;
        let events = client
            .create_image(Some(request), None, None)
            .map(move |item| match item {
                Ok(info) => Ok(pull_event(info)),
                Err(err) => Err(engine_error("image pull", reference, limit, err)),
            });

        progress::watch_pull(reference, self.watchdog, events).await?;

        if tag.is_empty() {
            Ok(vec![image])
        } else {
            Ok(vec![format!("{}:{}", image, tag)])
        }
    }

    async fn images_list(&self, options: &ImageListOptions) -> Result<Vec<ImageSummary>> {
        let client = self.client()?;
        let request = ListImagesOptions::<String> {
            all: options.all,
            filters: options.filters.clone(),
            ..Default::default()
        };
        let images = self
            .call("image list", "", client.list_images(Some(request)))
            .await?;
        Ok(images.into_iter().map(image_summary).collect())
    }

    async fn image_inspect(&self, id: &str) -> Result<ImageInspect> {
        let client = self.client()?;
        let data = self.call("image inspect", id, client.inspect_image(id)).await?;
        Ok(image_inspect(data))
    }

    async fn container_create(&self, image: &str) -> Result<ContainerCreateResponse> {
        let client = self.client()?;
        let config = Config {
            image: Some(image.to_string()),
            ..Default::default()
        };
        let response = self
            .call(
                "container create",
                image,
                client.create_container(None::<CreateContainerOptions<String>>, config),
            )
            .await?;
        info!("📦 Created container {} from {}", response.id, image);
        Ok(ContainerCreateResponse {
            id: response.id,
            warnings: response.warnings,
        })
    }

    async fn container_start(&self, id: &str) -> Result<()> {
        let client = self.client()?;
        self.call(
            "container start",
            id,
            client.start_container(id, None::<StartContainerOptions<String>>),
        )
        .await
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
        let client = self.client()?;
        let request = ListContainersOptions::<String> {
            all: options.all,
            limit: options.limit.map(|limit| limit as isize),
            filters: options.filters.clone(),
            ..Default::default()
        };
        let containers = self
            .call("container list", "", client.list_containers(Some(request)))
            .await?;
        Ok(containers.into_iter().map(container_summary).collect())
    }

    async fn container_inspect(&self, id: &str) -> Result<InspectContainerData> {
        let client = self.client()?;
        let info = self
            .call(
                "container inspect",
                id,
                client.inspect_container(id, None::<InspectContainerOptions>),
            )
            .await?;
        Ok(inspect_container(info))
    }

    async fn container_stop(&self, id: &str) -> Result<()> {
        let client = self.client()?;
        self.call(
            "container stop",
            id,
            client.stop_container(id, None::<StopContainerOptions>),
        )
        .await
    }

    async fn container_remove(&self, id: &str) -> Result<()> {
        let client = self.client()?;
        self.call(
            "container remove",
            id,
            client.remove_container(id, None::<RemoveContainerOptions>),
        )
        .await
    }

    async fn container_exec(&self, id: &str, argv: &[String]) -> Result<ExecResult> {
        let client = self.client()?;
        let limit = self.timeout;

        with_deadline("container exec", id, limit, async {
            let request = CreateExecOptions {
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                cmd: Some(argv.to_vec()),
                ..Default::default()
            };
            let created = client
                .create_exec(id, request)
                .await
                .map_err(|err| engine_error("exec create", id, limit, err))?;
            let exec_id = created.id;

            // run with stdout and stderr attached
            let output = match client
                .start_exec(&exec_id, None)
                .await
                .map_err(|err| engine_error("exec start", &exec_id, limit, err))?
            {
                StartExecResults::Attached { output, .. } => output,
                StartExecResults::Detached => {
                    return Err(DriverError::engine(
                        "exec start",
                        exec_id.as_str(),
                        "engine started the exec detached",
                    ));
                }
            };

            let chunks = output.filter_map(|item| async move {
                match item {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        Some(Ok(OutputChunk::Stdout(message)))
                    }
                    Ok(LogOutput::StdErr { message }) => Some(Ok(OutputChunk::Stderr(message))),
                    Ok(LogOutput::StdIn { .. }) => None,
                    Err(err) => Some(Err(err)),
                }
            });
            let drain = exec::drain_stream(&exec_id, chunks);

            let exec_ref = &exec_id;
            exec::capture(drain, move || async move {
                let inspected = client
                    .inspect_exec(exec_ref)
                    .await
                    .map_err(|err| engine_error("exec inspect", exec_ref, limit, err))?;
                inspected
                    .exit_code
                    .ok_or_else(|| DriverError::decode("exec inspect", exec_ref.as_str(), "no exit code reported"))
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
        let client = self.client()?;
        let request = CreateNetworkOptions {
            name: name.to_string(),
            check_duplicate: true,
            driver: options.driver.clone().unwrap_or_else(|| "bridge".to_string()),
            internal: options.internal,
            options: options.options.clone(),
            labels: options.labels.clone(),
            ..Default::default()
        };
        let response = self
            .call("network create", name, client.create_network(request))
            .await?;
        let value = serde_json::to_value(&response)
            .map_err(|err| DriverError::decode("network create", name, err.to_string()))?;
        Ok(network_created(&value))
    }

    async fn network_inspect(&self, id: &str) -> Result<NetworkResource> {
        let client = self.client()?;
        let network = self
            .call(
                "network inspect",
                id,
                client.inspect_network(id, None::<InspectNetworkOptions<String>>),
            )
            .await?;
        Ok(network_resource(network))
    }

    async fn network_remove(&self, id: &str) -> Result<()> {
        let client = self.client()?;
        self.call("network remove", id, client.remove_network(id)).await
    }

    async fn network_connect(&self, id: &str, container_id: &str, aliases: &[String]) -> Result<()> {
        let client = self.client()?;
        let request = ConnectNetworkOptions {
            container: container_id.to_string(),
            endpoint_config: EndpointSettings {
                aliases: (!aliases.is_empty()).then(|| aliases.to_vec()),
                ..Default::default()
            },
        };
        self.call("network connect", id, client.connect_network(id, request))
            .await
    }

    async fn network_disconnect(&self, id: &str, container_id: &str, force: bool) -> Result<()> {
        let client = self.client()?;
        let request = DisconnectNetworkOptions {
            container: container_id.to_string(),
            force,
        };
        self.call("network disconnect", id, client.disconnect_network(id, request))
            .await
    }
}

fn engine_error(operation: &'static str, target: &str, limit: Duration, err: BollardError) -> DriverError {
    match err {
        BollardError::RequestTimeoutError => DriverError::timeout(operation, target, limit),
        BollardError::JsonDataError { message, .. } => DriverError::decode(operation, target, message),
        BollardError::JsonSerdeError { err } => DriverError::decode(operation, target, err.to_string()),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => DriverError::engine(operation, target, format!("{} (HTTP {})", message, status_code)),
        other => DriverError::engine(operation, target, other.to_string()),
    }
}

/// Split `name[:tag]`, defaulting to `latest`. Digest references keep an empty tag.
fn split_reference(reference: &str) -> (String, String) {
    if reference.contains('@') {
        return (reference.to_string(), String::new());
    }
    let name_start = reference.rfind('/').map_or(0, |slash| slash + 1);
    match reference[name_start..].rfind(':') {
        Some(colon) => {
            let split = name_start + colon;
            (reference[..split].to_string(), reference[split + 1..].to_string())
        }
        None => (reference.to_string(), "latest".to_string()),
    }
}

fn pull_event(info: CreateImageInfo) -> PullEvent {
    PullEvent {
        id: info.id,
        status: info.status.unwrap_or_default(),
        progress: info.progress_detail.and_then(|detail| {
            detail.current.map(|current| ProgressDetail {
                current,
                total: detail.total,
            })
        }),
        error: info.error,
    }
}

fn unix_time(seconds: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(seconds, 0)
}

fn rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|time| time.with_timezone(&Utc))
}

fn image_summary(image: EngineImageSummary) -> ImageSummary {
    ImageSummary {
        id: image.id,
        created: unix_time(image.created),
        size: image.size,
        labels: image.labels,
        repo_tags: image.repo_tags,
        repo_digests: image.repo_digests,
    }
}

fn image_inspect(data: EngineImageInspect) -> ImageInspect {
    ImageInspect {
        id: data.id.unwrap_or_default(),
        size: data.size.unwrap_or_default(),
        repo_tags: data.repo_tags.unwrap_or_default(),
    }
}

fn container_summary(container: ContainerSummary) -> Container {
    Container {
        id: container.id.unwrap_or_default(),
        names: container.names.unwrap_or_default(),
        image: container.image.unwrap_or_default(),
        image_id: container.image_id.unwrap_or_default(),
        command: container.command.unwrap_or_default(),
        labels: container.labels.unwrap_or_default(),
        state: container.state.unwrap_or_default(),
        status: container.status.unwrap_or_default(),
    }
}

fn inspect_container(info: ContainerInspectResponse) -> InspectContainerData {
    InspectContainerData {
        id: info.id.unwrap_or_default(),
        created: info.created.as_deref().and_then(rfc3339),
        path: info.path.unwrap_or_default(),
        args: info.args.unwrap_or_default(),
        image: info.image.unwrap_or_default(),
        image_name: info
            .config
            .and_then(|config| config.image)
            .unwrap_or_default(),
        name: info
            .name
            .map(|name| name.trim_start_matches('/').to_string())
            .unwrap_or_default(),
    }
}

/// The create response changed shape across API versions; read it structurally.
fn network_created(value: &serde_json::Value) -> NetworkCreateResponse {
    NetworkCreateResponse {
        id: value["Id"].as_str().unwrap_or_default().to_string(),
        warning: value["Warning"]
            .as_str()
            .filter(|warning| !warning.is_empty())
            .map(str::to_string),
    }
}

fn network_resource(network: Network) -> NetworkResource {
    NetworkResource {
        id: network.id.unwrap_or_default(),
        name: network.name.unwrap_or_default(),
        driver: network.driver,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerConfig, ContainerState, ContainerStateStatusEnum, ProgressDetail as EngineProgress};
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use test_case::test_case;

    #[test_case("alpine", "alpine", "latest" ; "bare name defaults to latest")]
    #[test_case("alpine:3.19", "alpine", "3.19" ; "explicit tag")]
    #[test_case("quay.io/skupper/qdrouterd:0.4", "quay.io/skupper/qdrouterd", "0.4" ; "registry path with tag")]
    #[test_case("localhost:5000/app", "localhost:5000/app", "latest" ; "registry port is not a tag")]
    #[test_case("alpine@sha256:abcd", "alpine@sha256:abcd", "" ; "digest keeps empty tag")]
    fn references_split_into_name_and_tag(reference: &str, image: &str, tag: &str) {
        assert_eq!(split_reference(reference), (image.to_string(), tag.to_string()));
    }

    #[test]
    fn image_summary_preserves_identity_size_and_labels() {
        let labels: HashMap<String, String> =
            [("maintainer".to_string(), "skupper".to_string())].into_iter().collect();
        let engine = EngineImageSummary {
            id: "sha256:1234".to_string(),
            repo_tags: vec!["quay.io/skupper/qdrouterd:0.4".to_string()],
            repo_digests: vec![],
            created: 1_600_000_000,
            size: 42_000_000,
            labels: labels.clone(),
            ..Default::default()
        };

        let summary = image_summary(engine);
        assert_eq!(summary.id, "sha256:1234");
        assert_eq!(summary.size, 42_000_000);
        assert_eq!(summary.labels, labels);
        assert_eq!(summary.created.map(|t| t.timestamp()), Some(1_600_000_000));
        assert_eq!(summary.repo_tags, vec!["quay.io/skupper/qdrouterd:0.4".to_string()]);
    }

    #[test]
    fn missing_optional_fields_become_zero_values() {
        let inspect = image_inspect(EngineImageInspect::default());
        assert_eq!(inspect, ImageInspect::default());

        let container = container_summary(ContainerSummary::default());
        assert_eq!(container, Container::default());
    }

    #[test]
    fn container_summary_maps_state_and_names() {
        let container = container_summary(ContainerSummary {
            id: Some("c0ffee".to_string()),
            names: Some(vec!["/skupper-router".to_string()]),
            image: Some("quay.io/skupper/qdrouterd:0.4".to_string()),
            image_id: Some("sha256:1234".to_string()),
            command: Some("/home/qdrouterd/bin/qdrouterd".to_string()),
            state: Some("running".to_string()),
            status: Some("Up 3 seconds".to_string()),
            ..Default::default()
        });

        assert_eq!(container.primary_name(), Some("skupper-router"));
        assert_eq!(container.state, "running");
        assert_eq!(container.status, "Up 3 seconds");
    }

    #[test]
    fn inspect_maps_created_time_and_image_name() {
        let data = inspect_container(ContainerInspectResponse {
            id: Some("c0ffee".to_string()),
            created: Some("2020-10-01T12:30:45.123456789Z".to_string()),
            path: Some("qdrouterd".to_string()),
            args: Some(vec!["-c".to_string(), "/etc/qpid-dispatch/qdrouterd.conf".to_string()]),
            image: Some("sha256:1234".to_string()),
            name: Some("/skupper-router".to_string()),
            config: Some(ContainerConfig {
                image: Some("quay.io/skupper/qdrouterd:0.4".to_string()),
                ..Default::default()
            }),
            state: Some(ContainerState {
                status: Some(ContainerStateStatusEnum::RUNNING),
                ..Default::default()
            }),
            ..Default::default()
        });

        assert_eq!(data.name, "skupper-router");
        assert_eq!(data.image_name, "quay.io/skupper/qdrouterd:0.4");
        assert_eq!(data.args.len(), 2);
        assert_eq!(
            data.created.map(|t| t.to_rfc3339()),
            Some("2020-10-01T12:30:45.123456789+00:00".to_string())
        );
    }

    #[test]
    fn state_enum_renders_engine_vocabulary() {
        assert_eq!(ContainerStateStatusEnum::RUNNING.to_string(), "running");
        assert_eq!(ContainerStateStatusEnum::EXITED.to_string(), "exited");
    }

    #[test]
    fn pull_event_keeps_progress_and_error() {
        let event = pull_event(CreateImageInfo {
            id: Some("a1b2c3".to_string()),
            status: Some("Downloading".to_string()),
            progress_detail: Some(EngineProgress {
                current: Some(512),
                total: Some(1024),
            }),
            ..Default::default()
        });
        assert_eq!(event.to_string(), "a1b2c3: Downloading 512/1024 (50%)");

        let failed = pull_event(CreateImageInfo {
            error: Some("manifest unknown".to_string()),
            ..Default::default()
        });
        assert_eq!(failed.error.as_deref(), Some("manifest unknown"));
    }

    #[test]
    fn network_create_response_is_read_structurally() {
        let created = network_created(&serde_json::json!({ "Id": "n123", "Warning": "" }));
        assert_eq!(created, NetworkCreateResponse { id: "n123".to_string(), warning: None });

        let warned = network_created(&serde_json::json!({ "Id": "n124", "Warning": "subnet overlaps" }));
        assert_eq!(warned.warning.as_deref(), Some("subnet overlaps"));
    }

    #[test]
    fn server_errors_are_engine_errors_and_timeouts_stay_timeouts() {
        let rejected = engine_error(
            "container start",
            "c0ffee",
            Duration::from_secs(1),
            BollardError::DockerResponseServerError {
                status_code: 404,
                message: "No such container: c0ffee".to_string(),
            },
        );
        assert!(rejected.is_engine());
        assert!(rejected.to_string().contains("HTTP 404"));

        let timed_out = engine_error("container start", "c0ffee", Duration::from_secs(1), BollardError::RequestTimeoutError);
        assert!(timed_out.is_timeout());
    }

    #[tokio::test]
    async fn calls_before_connect_are_rejected() {
        let backend = DockerBackend::new(&DriverConfig::default());
        let err = backend.image_inspect("alpine").await.unwrap_err();
        assert!(matches!(err, DriverError::NotConnected { .. }));
        assert_eq!(backend.name(), "docker");
        assert_eq!(backend.contract_version(), CONTRACT_VERSION);
    }
}
