//! Engine-agnostic data model shared by every backend.
//!
//! Values here are snapshots: they are built once from an engine response and
//! never fed back to an engine as state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::DrainError;

/// One image as reported by an image listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ImageSummary {
    pub id: String,
    pub created: Option<DateTime<Utc>>,
    pub size: i64,
    pub labels: HashMap<String, String>,
    pub repo_tags: Vec<String>,
    pub repo_digests: Vec<String>,
}

/// Single-image detail view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ImageInspect {
    pub id: String,
    pub size: i64,
    pub repo_tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContainerCreateResponse {
    pub id: String,
    pub warnings: Vec<String>,
}

/// Container information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Container {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    pub image_id: String,
    pub command: String,
    pub labels: HashMap<String, String>,
    pub state: String,
    pub status: String,
}

impl Container {
    /// The first reported name, without the leading `/` Docker adds.
    pub fn primary_name(&self) -> Option<&str> {
        self.names
            .first()
            .map(|name| name.strip_prefix('/').unwrap_or(name))
    }
}

/// Deeper single-container view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct InspectContainerData {
    pub id: String,
    pub created: Option<DateTime<Utc>>,
    pub path: String,
    pub args: Vec<String>,
    pub image: String,
    pub image_name: String,
    pub name: String,
}

/// Outcome of one command executed inside a container
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    /// `None` when the transport only delivered combined output.
    pub stderr: Option<Vec<u8>>,
    /// Set when the output stream failed mid-read; the exit code is still valid.
    pub drain_error: Option<DrainError>,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> Option<String> {
        self.stderr
            .as_deref()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NetworkCreateResponse {
    pub id: String,
    pub warning: Option<String>,
}

/// Network information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NetworkResource {
    pub id: String,
    pub name: String,
    pub driver: Option<String>,
}

// Option bags: every field's zero value means "use the backend default".

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ImagePullOptions {
    /// Target platform such as `linux/amd64`.
    pub platform: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ImageListOptions {
    /// Include intermediate images.
    pub all: bool,
    pub filters: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContainerListOptions {
    /// Include stopped containers.
    pub all: bool,
    /// Only the N most recently created containers.
    pub limit: Option<usize>,
    pub filters: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NetworkCreateOptions {
    pub driver: Option<String>,
    pub options: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub internal: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_name_strips_docker_slash() {
        let container = Container {
            names: vec!["/skupper-router".to_string(), "/alias".to_string()],
            ..Default::default()
        };
        assert_eq!(container.primary_name(), Some("skupper-router"));
        assert_eq!(Container::default().primary_name(), None);
    }

    #[test]
    fn exec_result_lossy_views() {
        let result = ExecResult {
            exit_code: 0,
            stdout: b"hello\n".to_vec(),
            stderr: None,
            drain_error: None,
        };
        assert!(result.success());
        assert_eq!(result.stdout_lossy(), "hello\n");
        assert_eq!(result.stderr_lossy(), None);
    }
}
