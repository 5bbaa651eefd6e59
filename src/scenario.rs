//! End-to-end exercise of a loaded backend: the full image, container and
//! network lifecycle against one engine.

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::ScenarioConfig;
use crate::driver::Driver;
use crate::types::{
    ContainerListOptions, ExecResult, ImageListOptions, ImagePullOptions, NetworkCreateOptions,
};

#[derive(Debug, Clone, Default)]
pub struct ScenarioReport {
    pub backend: String,
    pub pulled: Vec<String>,
    /// Set when the pull failed and the run fell back to a local image.
    pub pull_error: Option<String>,
    pub images_listed: usize,
    pub container_id: String,
    pub container_name: Option<String>,
    pub network_id: String,
    pub execs: Vec<ExecOutcome>,
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub argv: Vec<String>,
    pub result: ExecResult,
}

/// Drive `driver` through pull, create, start, wait, network attach, exec and
/// teardown. Apart from the pull, the first failing operation aborts the run
/// with its name and target in the error context.
pub async fn run(driver: &dyn Driver, plan: &ScenarioConfig) -> Result<ScenarioReport> {
    let mut report = ScenarioReport {
        backend: driver.name().to_string(),
        ..Default::default()
    };
    let image = plan.image.as_str();

    info!("⬇️  Pulling {} with {}", image, report.backend);
    // Pull failure is not fatal; inspect and create fail if the image is absent.
    match driver.images_pull(image, &ImagePullOptions::default()).await {
        Ok(pulled) => report.pulled = pulled,
        Err(err) => {
            warn!("image pull {} failed, continuing with local images: {}", image, err);
            report.pull_error = Some(err.to_string());
        }
    }

    let images = driver
        .images_list(&ImageListOptions::default())
        .await
        .context("image list")?;
    report.images_listed = images.len();
    for summary in &images {
        info!("  🖼️  {} {:?}", summary.id, summary.repo_tags);
    }

    let inspected = driver
        .image_inspect(image)
        .await
        .with_context(|| format!("image inspect {}", image))?;
    info!("🔍 Image {} is {} bytes", inspected.id, inspected.size);

    let created = driver
        .container_create(image)
        .await
        .with_context(|| format!("container create {}", image))?;
    for warning in &created.warnings {
        warn!("Container create warning: {}", warning);
    }
    let id = created.id;
    report.container_id = id.clone();

    driver
        .container_start(&id)
        .await
        .with_context(|| format!("container start {}", id))?;
    info!("▶️  Started container {}", id);

    driver
        .container_wait(&id, "running", plan.wait_timeout(), plan.wait_interval())
        .await
        .with_context(|| format!("container wait {}", id))?;
    info!("✅ Container {} is running", id);

    let containers = driver
        .container_list(&ContainerListOptions::default())
        .await
        .context("container list")?;
    report.container_name = containers
        .iter()
        .find(|container| container.id == id)
        .or_else(|| containers.first())
        .and_then(|container| container.primary_name())
        .map(str::to_string);
    match &report.container_name {
        Some(name) => info!("📋 Container name: {}", name),
        None => warn!("Container list did not include {}", id),
    }

    let details = driver
        .container_inspect(&id)
        .await
        .with_context(|| format!("container inspect {}", id))?;
    info!("🔍 Container {} runs {} from {}", details.name, details.path, details.image_name);

    let network = plan.network.as_str();
    let created_network = driver
        .network_create(network, &NetworkCreateOptions::default())
        .await
        .with_context(|| format!("network create {}", network))?;
    if let Some(warning) = &created_network.warning {
        warn!("Network create warning: {}", warning);
    }
    report.network_id = created_network.id;

    let resource = driver
        .network_inspect(network)
        .await
        .with_context(|| format!("network inspect {}", network))?;
    info!("🌐 Network {} ({})", resource.name, resource.id);

    driver
        .network_connect(network, &id, &[])
        .await
        .with_context(|| format!("network connect {} {}", network, id))?;

    for argv in &plan.exec {
        let result = driver
            .container_exec(&id, argv)
            .await
            .with_context(|| format!("container exec {} {}", id, argv.join(" ")))?;
        if let Some(err) = &result.drain_error {
            warn!("Output of '{}' may be incomplete: {}", argv.join(" "), err);
        }
        info!("⚙️  '{}' exited with {}", argv.join(" "), result.exit_code);
        report.execs.push(ExecOutcome {
            argv: argv.clone(),
            result,
        });
    }

    driver
        .network_disconnect(network, &id, true)
        .await
        .with_context(|| format!("network disconnect {} {}", network, id))?;

    driver
        .container_stop(&id)
        .await
        .with_context(|| format!("container stop {}", id))?;
    info!("⏹️  Stopped container {}", id);

    driver
        .container_remove(&id)
        .await
        .with_context(|| format!("container remove {}", id))?;
    info!("🗑️  Removed container {}", id);

    driver
        .network_remove(network)
        .await
        .with_context(|| format!("network remove {}", network))?;
    info!("🗑️  Removed network {}", network);

    Ok(report)
}
