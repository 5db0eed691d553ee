//! Container engine seam.
//!
//! The agent drives a Docker-compatible engine through the `ContainerEngine`
//! trait so the lifecycle logic stays testable without a daemon. The Docker
//! implementation lives in `docker`; `mock` provides the in-memory engine the
//! integration tests run against.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

mod docker;
mod mock;

pub use docker::DockerEngine;
pub use mock::MockEngine;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine answered with an error status.
    #[error("engine API error {status}: {message}")]
    Api { status: u16, message: String },

    /// The named container/network/volume does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The engine could not be reached.
    #[error("engine transport error: {0}")]
    Transport(String),

    /// The call exceeded the per-call deadline.
    #[error("engine call timed out after {0:?}")]
    Timeout(Duration),
}

impl EngineError {
    /// Address-pool overlap on network creation.
    pub fn is_overlap(&self) -> bool {
        matches!(self, EngineError::Api { message, .. }
            if message.to_ascii_lowercase().contains("overlap"))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
            || matches!(self, EngineError::Api { status: 404, .. })
    }

    /// "Network has active endpoints" and friends.
    pub fn is_in_use(&self) -> bool {
        matches!(self, EngineError::Api { message, .. } if {
            let message = message.to_ascii_lowercase();
            message.contains("active endpoints") || message.contains("in use")
        })
    }
}

// =============================================================================
// Request types
// =============================================================================

/// Host device passthrough descriptor. Accepted on creation as an extension
/// hook; the core never populates it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceAttachment {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub permissions: Option<String>,
}

/// Container creation request.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub restart_always: bool,
    pub dns: Vec<String>,
    /// Initial network the container is attached to; further networks are
    /// connected before start.
    pub network: Option<String>,
    pub devices: Vec<DeviceAttachment>,
}

/// Network creation request.
#[derive(Debug, Clone, Default)]
pub struct NetworkSpec {
    pub name: String,
    pub driver: String,
    pub internal: bool,
    /// Parent host interface, for macvlan networks.
    pub parent: Option<String>,
    pub subnet: Option<String>,
    pub gateway: Option<String>,
}

/// Per-endpoint constraints when connecting a container to a network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointSpec {
    pub ipv4_address: Option<String>,
    pub mac_address: Option<String>,
}

// =============================================================================
// View types
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointView {
    pub ip_address: Option<String>,
    pub mac_address: Option<String>,
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerView {
    pub id: String,
    pub name: String,
    pub state: String,
    pub running: bool,
    pub restart_count: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    /// Network name -> endpoint, sorted for stable iteration.
    pub networks: BTreeMap<String, EndpointView>,
}

#[derive(Debug, Clone, Default)]
pub struct NetworkView {
    pub id: String,
    pub name: String,
    pub driver: String,
    pub parent: Option<String>,
    pub subnets: Vec<String>,
    pub gateways: Vec<String>,
    /// Names of attached containers (when the engine reports them).
    pub containers: Vec<String>,
}

/// Point-in-time container resource usage.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerUsage {
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

// =============================================================================
// Trait
// =============================================================================

/// Capability surface the agent needs from the container engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Pull an image from its registry.
    async fn pull_image(&self, reference: &str) -> Result<(), EngineError>;

    /// Whether the image tag exists locally.
    async fn image_present(&self, reference: &str) -> Result<bool, EngineError>;

    /// Create a container; returns the engine-side id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    async fn start_container(&self, name: &str) -> Result<(), EngineError>;

    async fn stop_container(&self, name: &str, grace_secs: i64) -> Result<(), EngineError>;

    async fn restart_container(&self, name: &str, grace_secs: i64) -> Result<(), EngineError>;

    async fn remove_container(&self, name: &str, force: bool) -> Result<(), EngineError>;

    /// `Ok(None)` when the container does not exist.
    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerView>, EngineError>;

    async fn create_network(&self, spec: &NetworkSpec) -> Result<(), EngineError>;

    async fn remove_network(&self, name: &str) -> Result<(), EngineError>;

    async fn list_networks(&self) -> Result<Vec<NetworkView>, EngineError>;

    /// `Ok(None)` when the network does not exist. Includes attached
    /// containers.
    async fn inspect_network(&self, name: &str) -> Result<Option<NetworkView>, EngineError>;

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        endpoint: &EndpointSpec,
    ) -> Result<(), EngineError>;

    async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
        force: bool,
    ) -> Result<(), EngineError>;

    /// One-shot CPU/memory usage sample; `Ok(None)` when the container is
    /// absent or not running.
    async fn container_usage(&self, name: &str) -> Result<Option<ContainerUsage>, EngineError>;

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError>;
}
