//! The capability contract every container-engine backend implements.
//!
//! Callers only ever hold a `dyn Driver`; nothing above this seam branches on
//! which engine is in use.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use crate::error::{DriverError, Result};
use crate::types::{
    Container, ContainerCreateResponse, ContainerListOptions, ExecResult, ImageInspect,
    ImageListOptions, ImagePullOptions, ImageSummary, InspectContainerData, NetworkCreateOptions,
    NetworkCreateResponse, NetworkResource,
};

/// Bumped whenever the `Driver` trait changes shape or semantics.
pub const CONTRACT_VERSION: u32 = 1;

#[async_trait]
pub trait Driver: Send + Sync {
    /// Registry name of this backend.
    fn name(&self) -> &str;

    /// Contract revision this backend was written against.
    fn contract_version(&self) -> u32;

    /// Establish the engine session. Called once, before any other operation.
    async fn connect(&mut self) -> Result<()>;

    // Images
    async fn images_pull(&self, reference: &str, options: &ImagePullOptions) -> Result<Vec<String>>;
    async fn images_list(&self, options: &ImageListOptions) -> Result<Vec<ImageSummary>>;
    async fn image_inspect(&self, id: &str) -> Result<ImageInspect>;

    // Containers
    async fn container_create(&self, image: &str) -> Result<ContainerCreateResponse>;
    async fn container_start(&self, id: &str) -> Result<()>;

    /// Poll until the engine reports `target_state`, or fail with a timeout.
    async fn container_wait(
        &self,
        id: &str,
        target_state: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<()>;

    async fn container_list(&self, options: &ContainerListOptions) -> Result<Vec<Container>>;
    async fn container_inspect(&self, id: &str) -> Result<InspectContainerData>;
    async fn container_stop(&self, id: &str) -> Result<()>;
    async fn container_remove(&self, id: &str) -> Result<()>;
    async fn container_exec(&self, id: &str, argv: &[String]) -> Result<ExecResult>;

    // Networks
    async fn network_create(
        &self,
        name: &str,
        options: &NetworkCreateOptions,
    ) -> Result<NetworkCreateResponse>;
    async fn network_inspect(&self, id: &str) -> Result<NetworkResource>;
    async fn network_remove(&self, id: &str) -> Result<()>;
    async fn network_connect(&self, id: &str, container_id: &str, aliases: &[String]) -> Result<()>;
    async fn network_disconnect(&self, id: &str, container_id: &str, force: bool) -> Result<()>;
}

/// Run `fut` under `limit`, turning an elapsed deadline into `DriverError::Timeout`.
///
/// Errors produced by the future itself pass through untouched, so a caller
/// can always tell a tripped deadline from an engine rejection.
pub async fn with_deadline<T, F>(
    operation: &'static str,
    target: &str,
    limit: Duration,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::timeout(operation, target, limit)),
    }
}
