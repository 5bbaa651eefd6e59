//! Concrete engine backends.
//!
//! Each one implements [`crate::driver::Driver`] and is reachable through the
//! registry by its name constant.

pub mod docker;
pub mod podman;

pub use docker::DockerBackend;
pub use podman::PodmanBackend;
