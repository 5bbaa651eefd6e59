//! Backend loader: resolves a backend name to a connected `Driver`.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

use crate::backends::{DockerBackend, PodmanBackend, docker, podman};
use crate::config::DriverConfig;
use crate::driver::{CONTRACT_VERSION, Driver};
use crate::error::{LoaderError, Result};
use crate::types::{
    Container, ContainerCreateResponse, ContainerListOptions, ExecResult, ImageInspect,
    ImageListOptions, ImagePullOptions, ImageSummary, InspectContainerData, NetworkCreateOptions,
    NetworkCreateResponse, NetworkResource,
};

pub type BackendFactory = Box<dyn Fn(&DriverConfig) -> Box<dyn Driver> + Send + Sync>;

#[derive(Default)]
pub struct BackendRegistry {
    factories: BTreeMap<String, BackendFactory>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every backend compiled into this crate.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry
            .register(docker::BACKEND, |config| Box::new(DockerBackend::new(config)))
            .register(podman::BACKEND, |config| Box::new(PodmanBackend::new(config)));
        registry
    }

    /// Add or replace the factory for `name`.
    pub fn register<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn(&DriverConfig) -> Box<dyn Driver> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
        self
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Build the backend for `name` without connecting it.
    pub fn resolve(&self, name: &str, config: &DriverConfig) -> Result<Box<dyn Driver>, LoaderError> {
        let factory = self.factories.get(name).ok_or_else(|| LoaderError::NotFound {
            name: name.to_string(),
            available: self.names(),
        })?;

        let backend = factory(config);
        let found = backend.contract_version();
        if found != CONTRACT_VERSION {
            return Err(LoaderError::NotConforming {
                name: name.to_string(),
                expected: CONTRACT_VERSION,
                found,
            });
        }
        Ok(backend)
    }

    /// Resolve `name` and connect it. The first failure is final.
    pub async fn load(&self, name: &str, config: &DriverConfig) -> Result<Dispatcher, LoaderError> {
        let mut backend = self.resolve(name, config)?;
        debug!("Connecting {} backend", name);
        backend.connect().await.map_err(|source| LoaderError::Setup {
            name: name.to_string(),
            source,
        })?;

        info!("🔌 Loaded {} driver", name);
        Ok(Dispatcher { backend })
    }
}

/// A loaded backend. Every contract call is forwarded unchanged.
pub struct Dispatcher {
    backend: Box<dyn Driver>,
}

impl Dispatcher {
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn into_inner(self) -> Box<dyn Driver> {
        self.backend
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("backend", &self.backend.name())
            .finish()
    }
}

#[async_trait]
impl Driver for Dispatcher {
    fn name(&self) -> &str {
        self.backend.name()
    }

    fn contract_version(&self) -> u32 {
        self.backend.contract_version()
    }

    async fn connect(&mut self) -> Result<()> {
        self.backend.connect().await
    }

    async fn images_pull(&self, reference: &str, options: &ImagePullOptions) -> Result<Vec<String>> {
        self.backend.images_pull(reference, options).await
    }

    async fn images_list(&self, options: &ImageListOptions) -> Result<Vec<ImageSummary>> {
        self.backend.images_list(options).await
    }

    async fn image_inspect(&self, id: &str) -> Result<ImageInspect> {
        self.backend.image_inspect(id).await
    }

    async fn container_create(&self, image: &str) -> Result<ContainerCreateResponse> {
        self.backend.container_create(image).await
    }

    async fn container_start(&self, id: &str) -> Result<()> {
        self.backend.container_start(id).await
    }

    async fn container_wait(
        &self,
        id: &str,
        target_state: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<()> {
        self.backend
            .container_wait(id, target_state, timeout, poll_interval)
            .await
    }

    async fn container_list(&self, options: &ContainerListOptions) -> Result<Vec<Container>> {
        self.backend.container_list(options).await
    }

    async fn container_inspect(&self, id: &str) -> Result<InspectContainerData> {
        self.backend.container_inspect(id).await
    }

    async fn container_stop(&self, id: &str) -> Result<()> {
        self.backend.container_stop(id).await
    }

    async fn container_remove(&self, id: &str) -> Result<()> {
        self.backend.container_remove(id).await
    }

    async fn container_exec(&self, id: &str, argv: &[String]) -> Result<ExecResult> {
        self.backend.container_exec(id, argv).await
    }

    async fn network_create(
        &self,
        name: &str,
        options: &NetworkCreateOptions,
    ) -> Result<NetworkCreateResponse> {
        self.backend.network_create(name, options).await
    }

    async fn network_inspect(&self, id: &str) -> Result<NetworkResource> {
        self.backend.network_inspect(id).await
    }

    async fn network_remove(&self, id: &str) -> Result<()> {
        self.backend.network_remove(id).await
    }

    async fn network_connect(&self, id: &str, container_id: &str, aliases: &[String]) -> Result<()> {
        self.backend.network_connect(id, container_id, aliases).await
    }

    async fn network_disconnect(&self, id: &str, container_id: &str, force: bool) -> Result<()> {
        self.backend
            .network_disconnect(id, container_id, force)
            .await
    }
}
