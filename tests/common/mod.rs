#![allow(dead_code)]

//! In-memory engine implementing the driver contract, for exercising
//! callers without a container daemon.

use async_trait::async_trait;
use bytes::Bytes;
use ce_drivers::config::WatchdogSettings;
use ce_drivers::exec::{self, OutputChunk};
use ce_drivers::progress::{self, PullEvent};
use ce_drivers::wait::wait_for_state;
use ce_drivers::*;
use futures::{StreamExt, stream};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type CallLog = Arc<Mutex<Vec<String>>>;

#[derive(Debug, Default)]
struct FakeState {
    images: Vec<String>,
    containers: HashMap<String, FakeContainer>,
    networks: HashMap<String, Vec<String>>,
    next_id: u32,
}

#[derive(Debug, Clone)]
struct FakeContainer {
    image: String,
    state: String,
}

pub struct FakeEngine {
    calls: CallLog,
    connected: bool,
    fail_connect: bool,
    contract_version: u32,
    /// Inspect calls after start before the container reports `running`.
    running_after: u32,
    inspections: AtomicU32,
    /// Seconds to wait before each pull progress event.
    pull_delays: Vec<u64>,
    /// Registry answer for every pull, when it should fail.
    pull_failure: Option<String>,
    watchdog: WatchdogSettings,
    state: Mutex<FakeState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            connected: false,
            fail_connect: false,
            contract_version: CONTRACT_VERSION,
            running_after: 1,
            inspections: AtomicU32::new(0),
            pull_delays: vec![1, 1, 1],
            pull_failure: None,
            watchdog: WatchdogSettings::default(),
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn running_after(mut self, polls: u32) -> Self {
        self.running_after = polls;
        self
    }

    pub fn never_running(self) -> Self {
        self.running_after(u32::MAX)
    }

    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    pub fn with_contract_version(mut self, version: u32) -> Self {
        self.contract_version = version;
        self
    }

    pub fn with_pull_delays(mut self, delays: Vec<u64>) -> Self {
        self.pull_delays = delays;
        self
    }

    pub fn failing_pull(mut self, message: &str) -> Self {
        self.pull_failure = Some(message.to_string());
        self
    }

    /// Image present locally before any pull.
    pub fn with_cached_image(self, reference: &str) -> Self {
        self.state.lock().unwrap().images.push(reference.to_string());
        self
    }

    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }

    pub fn inspections(&self) -> u32 {
        self.inspections.load(Ordering::SeqCst)
    }

    fn record(&self, call: &str) -> Result<()> {
        self.calls.lock().unwrap().push(call.to_string());
        if self.connected {
            Ok(())
        } else {
            Err(DriverError::NotConnected {
                backend: "fake".to_string(),
            })
        }
    }

    fn container_state(&self, id: &str) -> Result<String> {
        let state = self.state.lock().unwrap();
        state
            .containers
            .get(id)
            .map(|container| container.state.clone())
            .ok_or_else(|| DriverError::engine("container inspect", id, "No such container"))
    }

    async fn observed_state(&self, id: &str) -> Result<String> {
        let seen = self.inspections.fetch_add(1, Ordering::SeqCst) + 1;
        let state = self.container_state(id)?;
        if state == "starting" {
            return Ok(if seen >= self.running_after {
                self.set_state(id, "running");
                "running".to_string()
            } else {
                "created".to_string()
            });
        }
        Ok(state)
    }

    fn set_state(&self, id: &str, value: &str) {
        if let Some(container) = self.state.lock().unwrap().containers.get_mut(id) {
            container.state = value.to_string();
        }
    }
}

/// Canned output for a command run inside a fake container.
fn scripted_output(argv: &[String]) -> (i64, Vec<OutputChunk>) {
    match argv.first().map(String::as_str) {
        Some("echo") => {
            let text = format!("{}\n", argv[1..].join(" "));
            let chunks = text
                .as_bytes()
                .chunks(2)
                .map(|piece| OutputChunk::Stdout(Bytes::copy_from_slice(piece)))
                .collect();
            (0, chunks)
        }
        Some("qdstat") => (
            0,
            vec![
                OutputChunk::Stdout(Bytes::from_static(b"Router Statistics\n")),
                OutputChunk::Stdout(Bytes::from_static(b"  Mode  interior\n")),
            ],
        ),
        Some("false") => (1, Vec::new()),
        _ => (
            127,
            vec![OutputChunk::Stderr(Bytes::from_static(b"executable file not found in $PATH\n"))],
        ),
    }
}

#[async_trait]
impl Driver for FakeEngine {
    fn name(&self) -> &str {
        "fake"
    }

    fn contract_version(&self) -> u32 {
        self.contract_version
    }

    async fn connect(&mut self) -> Result<()> {
        self.calls.lock().unwrap().push("connect".to_string());
        if self.fail_connect {
            return Err(DriverError::Connection {
                backend: "fake".to_string(),
                reason: "connection refused".to_string(),
            });
        }
        self.connected = true;
        Ok(())
    }

    async fn images_pull(&self, reference: &str, _options: &ImagePullOptions) -> Result<Vec<String>> {
        self.record("images_pull")?;
        if let Some(message) = &self.pull_failure {
            return Err(DriverError::engine("image pull", reference, message.clone()));
        }
        let events = stream::iter(self.pull_delays.clone().into_iter().enumerate()).then(|(layer, delay)| async move {
            tokio::time::sleep(Duration::from_secs(delay)).await;
            Ok(PullEvent {
                id: Some(format!("layer{}", layer)),
                ..PullEvent::status("Downloading")
            })
        });
        progress::watch_pull(reference, self.watchdog, events).await?;
        self.state.lock().unwrap().images.push(reference.to_string());
        Ok(vec![reference.to_string()])
    }

    async fn images_list(&self, _options: &ImageListOptions) -> Result<Vec<ImageSummary>> {
        self.record("images_list")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .images
            .iter()
            .map(|image| ImageSummary {
                id: format!("sha256:{}", image.len()),
                repo_tags: vec![image.clone()],
                ..Default::default()
            })
            .collect())
    }

    async fn image_inspect(&self, id: &str) -> Result<ImageInspect> {
        self.record("image_inspect")?;
        let state = self.state.lock().unwrap();
        if !state.images.iter().any(|image| image == id) {
            return Err(DriverError::engine("image inspect", id, "No such image"));
        }
        Ok(ImageInspect {
            id: format!("sha256:{}", id.len()),
            size: 1024,
            repo_tags: vec![id.to_string()],
        })
    }

    async fn container_create(&self, image: &str) -> Result<ContainerCreateResponse> {
        self.record("container_create")?;
        let mut state = self.state.lock().unwrap();
        if !state.images.iter().any(|known| known == image) {
            return Err(DriverError::engine("container create", image, "No such image"));
        }
        state.next_id += 1;
        let id = format!("fake{:04}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                image: image.to_string(),
                state: "created".to_string(),
            },
        );
        Ok(ContainerCreateResponse {
            id,
            warnings: Vec::new(),
        })
    }

    async fn container_start(&self, id: &str) -> Result<()> {
        self.record("container_start")?;
        self.container_state(id)?;
        self.set_state(id, "starting");
        Ok(())
    }

    async fn container_wait(
        &self,
        id: &str,
        target_state: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<()> {
        self.record("container_wait")?;
        wait_for_state(id, target_state, timeout, poll_interval, move || self.observed_state(id))
            .await
            .map(|_| ())
    }

    async fn container_list(&self, options: &ContainerListOptions) -> Result<Vec<Container>> {
        self.record("container_list")?;
        let state = self.state.lock().unwrap();
        let mut ids: Vec<_> = state.containers.keys().cloned().collect();
        ids.sort();
        Ok(ids
            .into_iter()
            .filter_map(|id| {
                let container = &state.containers[&id];
                (options.all || container.state == "running").then(|| Container {
                    names: vec![format!("/{}_name", id)],
                    image: container.image.clone(),
                    state: container.state.clone(),
                    id,
                    ..Default::default()
                })
            })
            .collect())
    }

    async fn container_inspect(&self, id: &str) -> Result<InspectContainerData> {
        self.record("container_inspect")?;
        let state = self.state.lock().unwrap();
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| DriverError::engine("container inspect", id, "No such container"))?;
        Ok(InspectContainerData {
            id: id.to_string(),
            path: "qdrouterd".to_string(),
            image_name: container.image.clone(),
            name: format!("{}_name", id),
            ..Default::default()
        })
    }

    async fn container_stop(&self, id: &str) -> Result<()> {
        self.record("container_stop")?;
        self.container_state(id)?;
        self.set_state(id, "exited");
        Ok(())
    }

    async fn container_remove(&self, id: &str) -> Result<()> {
        self.record("container_remove")?;
        let mut state = self.state.lock().unwrap();
        state
            .containers
            .remove(id)
            .ok_or_else(|| DriverError::engine("container remove", id, "No such container"))?;
        for members in state.networks.values_mut() {
            members.retain(|member| member != id);
        }
        Ok(())
    }

    async fn container_exec(&self, id: &str, argv: &[String]) -> Result<ExecResult> {
        self.record("container_exec")?;
        if self.container_state(id)? != "running" {
            return Err(DriverError::engine("container exec", id, "container is not running"));
        }

        let (code, chunks) = scripted_output(argv);
        let paced = stream::iter(chunks).then(|chunk| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, std::io::Error>(chunk)
        });
        let drain = exec::drain_stream(id, paced);
        let calls = self.calls.clone();
        exec::capture(drain, move || async move {
            calls.lock().unwrap().push("exec_inspect".to_string());
            Ok(code)
        })
        .await
    }

    async fn network_create(
        &self,
        name: &str,
        _options: &NetworkCreateOptions,
    ) -> Result<NetworkCreateResponse> {
        self.record("network_create")?;
        let mut state = self.state.lock().unwrap();
        if state.networks.contains_key(name) {
            return Err(DriverError::engine("network create", name, "network already exists"));
        }
        state.networks.insert(name.to_string(), Vec::new());
        Ok(NetworkCreateResponse {
            id: format!("net-{}", name),
            warning: None,
        })
    }

    async fn network_inspect(&self, id: &str) -> Result<NetworkResource> {
        self.record("network_inspect")?;
        let state = self.state.lock().unwrap();
        if !state.networks.contains_key(id) {
            return Err(DriverError::engine("network inspect", id, "network not found"));
        }
        Ok(NetworkResource {
            id: format!("net-{}", id),
            name: id.to_string(),
            driver: Some("bridge".to_string()),
        })
    }

    async fn network_remove(&self, id: &str) -> Result<()> {
        self.record("network_remove")?;
        let mut state = self.state.lock().unwrap();
        match state.networks.get(id) {
            None => Err(DriverError::engine("network remove", id, "network not found")),
            Some(members) if !members.is_empty() => {
                Err(DriverError::engine("network remove", id, "network has active endpoints"))
            }
            Some(_) => {
                state.networks.remove(id);
                Ok(())
            }
        }
    }

    async fn network_connect(&self, id: &str, container_id: &str, _aliases: &[String]) -> Result<()> {
        self.record("network_connect")?;
        let mut state = self.state.lock().unwrap();
        if !state.containers.contains_key(container_id) {
            return Err(DriverError::engine("network connect", container_id, "No such container"));
        }
        let members = state
            .networks
            .get_mut(id)
            .ok_or_else(|| DriverError::engine("network connect", id, "network not found"))?;
        members.push(container_id.to_string());
        Ok(())
    }

    async fn network_disconnect(&self, id: &str, container_id: &str, force: bool) -> Result<()> {
        self.record("network_disconnect")?;
        let mut state = self.state.lock().unwrap();
        let members = state
            .networks
            .get_mut(id)
            .ok_or_else(|| DriverError::engine("network disconnect", id, "network not found"))?;
        let before = members.len();
        members.retain(|member| member != container_id);
        if members.len() == before && !force {
            return Err(DriverError::engine("network disconnect", container_id, "not connected"));
        }
        Ok(())
    }
}
