//! ce-drivers - engine-agnostic container driver layer
//!
//! One capability contract ([`Driver`]) over interchangeable container
//! engines, selected by name at runtime through [`BackendRegistry`].

pub mod backends;
pub mod config;
pub mod driver;
pub mod error;
pub mod exec;
pub mod progress;
pub mod registry;
pub mod scenario;
pub mod telemetry;
pub mod types;
pub mod wait;

pub use config::DriverConfig;
pub use driver::{CONTRACT_VERSION, Driver};
pub use error::{DrainError, DriverError, LoaderError, Result};
pub use registry::{BackendRegistry, Dispatcher};
pub use types::*;

// Re-export anyhow for callers of the scenario runner
pub use anyhow;
