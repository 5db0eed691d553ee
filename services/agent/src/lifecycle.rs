//! Runtime container lifecycle engine.
//!
//! Owns the create/delete/inspect/reconfigure flows for vPLC runtime
//! containers. Every mutation is serialized per container name through the
//! operation tracker; creation is acknowledged immediately and completed in
//! the background.
//!
//! Network layout per managed container `K`:
//! - one internal bridge `{K}_internal` shared with the agent for
//!   control-plane traffic
//! - one macvlan attachment network `macvlan_{parent}_{subnet}` per distinct
//!   `(parent interface, subnet)` pair, reused across containers

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::engine::{
    ContainerEngine, ContainerSpec, ContainerView, DeviceAttachment, EndpointSpec, EngineError,
    NetworkSpec,
};
use crate::netmon::InterfaceCache;
use crate::ops::{OpKind, OpsTracker};
use crate::registry::{ContainerRecord, NetworkMode, Registry, VnicConfig};
use crate::usage::DeviceUsage;

/// Reserved operation-slot name for agent self-removal.
pub const ORCHESTRATOR_SLOT: &str = "__orchestrator__";

const STOP_GRACE_SECS: i64 = 10;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{current} operation already in progress")]
    Busy { current: &'static str },

    #[error("runtime image unavailable: {0}")]
    ImageUnavailable(String),

    #[error("cannot resolve subnet for interface {0}")]
    NetworkUnresolvable(String),

    #[error("address pool overlap for {interface} ({subnet}) with no reusable macvlan network")]
    NetworkOverlapUnresolved { interface: String, subnet: String },

    #[error("mac address {mac} already in use by container {container}")]
    MacConflict { mac: String, container: String },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl LifecycleError {
    /// Stable error kind carried in replies.
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleError::Busy { .. } => "busy",
            LifecycleError::ImageUnavailable(_) => "image_unavailable",
            LifecycleError::NetworkUnresolvable(_) => "network_unresolvable",
            LifecycleError::NetworkOverlapUnresolved { .. } => "network_overlap_unresolved",
            LifecycleError::MacConflict { .. } => "mac_conflict",
            LifecycleError::Engine(_) => "engine_error",
        }
    }
}

/// Admission decision for a create request.
pub enum CreateAdmission {
    /// Slot claimed; the caller acks and runs `create_runtime` in the
    /// background.
    Started,
    /// The container is already managed; creation is a no-op.
    AlreadyExists(ContainerRecord),
}

/// Admission decision for a delete request.
pub enum DeleteAdmission {
    Started,
    AlreadyAbsent,
}

/// Inspect snapshot handed to the status topic.
pub struct DeviceStatus {
    pub view: ContainerView,
    pub internal_ip: Option<String>,
}

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub runtime_image: String,
    pub self_container: String,
    pub netmon_container: String,
    pub shared_volume: String,
}

impl From<&crate::config::Config> for LifecycleConfig {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            runtime_image: config.runtime_image.clone(),
            self_container: config.self_container.clone(),
            netmon_container: config.netmon_container.clone(),
            shared_volume: config.shared_volume.clone(),
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

pub struct Lifecycle {
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<Registry>,
    ops: Arc<OpsTracker>,
    interfaces: Arc<InterfaceCache>,
    devices: Arc<DeviceUsage>,
    config: LifecycleConfig,
}

impl Lifecycle {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        registry: Arc<Registry>,
        ops: Arc<OpsTracker>,
        interfaces: Arc<InterfaceCache>,
        devices: Arc<DeviceUsage>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            engine,
            registry,
            ops,
            interfaces,
            devices,
            config,
        }
    }

    pub fn ops(&self) -> &OpsTracker {
        &self.ops
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    // -------------------------------------------------------------------------
    // Create
    // -------------------------------------------------------------------------

    /// Claim the create slot for `name`. Runs before the immediate ack so a
    /// busy slot or a MAC conflict is reported synchronously.
    pub fn begin_create(
        &self,
        name: &str,
        vnics: &[VnicConfig],
    ) -> Result<CreateAdmission, LifecycleError> {
        if let Some(existing) = self.registry.get(name) {
            debug!(container = name, "Container already managed, create is a no-op");
            return Ok(CreateAdmission::AlreadyExists(existing));
        }

        self.ops
            .begin(name, OpKind::Create)
            .map_err(|busy| LifecycleError::Busy {
                current: busy.current.status_str(),
            })?;

        if let Some((mac, container)) = self.registry.mac_conflict(name, vnics) {
            self.ops.end(name);
            return Err(LifecycleError::MacConflict { mac, container });
        }

        Ok(CreateAdmission::Started)
    }

    /// Background body of a create. The slot claimed by `begin_create` is
    /// released on success and left in a sticky failed state on error.
    pub async fn create_runtime(
        &self,
        name: &str,
        image_override: Option<String>,
        vnics: Vec<VnicConfig>,
        devices: Vec<DeviceAttachment>,
    ) -> Result<(), LifecycleError> {
        match self
            .create_inner(name, image_override, vnics, devices)
            .await
        {
            Ok(()) => {
                self.ops.end(name);
                Ok(())
            }
            Err(err) => {
                warn!(container = name, error = %err, "Runtime creation failed");
                self.ops
                    .fail(name, OpKind::Create, &format!("{}: {err}", err.kind()));
                Err(err)
            }
        }
    }

    async fn create_inner(
        &self,
        name: &str,
        image_override: Option<String>,
        mut vnics: Vec<VnicConfig>,
        devices: Vec<DeviceAttachment>,
    ) -> Result<(), LifecycleError> {
        let image = image_override.unwrap_or_else(|| self.config.runtime_image.clone());

        self.ops.set_step(name, "pulling_image");
        self.ensure_image(&image).await?;

        self.ops.set_step(name, "creating_networks");
        let internal = self.ensure_internal_network(name).await?;

        // Resolve every vNIC to its attachment network up front so an
        // unresolvable interface fails before anything is created.
        let mut attachments: Vec<(usize, String)> = Vec::new();
        for (index, vnic) in vnics.iter().enumerate() {
            let (subnet, gateway) = self.resolve_parent_network(vnic)?;
            let network = self
                .get_or_create_attachment(&vnic.parent_interface, &subnet, gateway.as_deref())
                .await?;
            attachments.push((index, network));
        }

        self.ops.set_step(name, "creating_container");
        let dns = aggregate_dns(&vnics);
        let spec = ContainerSpec {
            name: name.to_string(),
            image: image.clone(),
            restart_always: true,
            dns,
            network: Some(internal.clone()),
            devices,
        };
        self.engine.create_container(&spec).await?;

        self.ops.set_step(name, "connecting_networks");
        let mut connected: HashSet<String> = HashSet::new();
        for (index, network) in &attachments {
            if !connected.insert(network.clone()) {
                warn!(
                    container = name,
                    network = network.as_str(),
                    "Multiple vNICs resolve to the same attachment network, keeping the first"
                );
                continue;
            }
            let endpoint = endpoint_for(&vnics[*index]);
            self.engine
                .connect_network(network, name, &endpoint)
                .await?;
        }

        self.engine.start_container(name).await?;

        // Control-plane path into the runtime. Failure here degrades the
        // proxy, not the runtime itself.
        if let Err(err) = self
            .engine
            .connect_network(&internal, &self.config.self_container, &EndpointSpec::default())
            .await
        {
            warn!(
                container = name,
                error = %err,
                "Could not connect agent container to internal network"
            );
        }

        self.ops.set_step(name, "registering");
        let view = self.engine.inspect_container(name).await?;
        let internal_ip = view
            .as_ref()
            .and_then(|v| v.networks.get(&internal))
            .and_then(|e| e.ip_address.clone());

        // Fill engine-assigned MACs into vNICs that did not pin one, so they
        // stay stable across reconfigurations.
        if let Some(view) = &view {
            for (index, network) in &attachments {
                if vnics[*index].mac_address.is_none() {
                    if let Some(endpoint) = view.networks.get(network) {
                        vnics[*index].mac_address = endpoint.mac_address.clone();
                    }
                }
            }
        }

        self.registry
            .put(
                name,
                ContainerRecord {
                    vnics,
                    internal_ip: internal_ip.clone(),
                    image: Some(image),
                },
            )
            .await;
        self.devices.add_device(name);

        info!(
            container = name,
            internal_ip = internal_ip.as_deref().unwrap_or("-"),
            "Runtime container created"
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Delete
    // -------------------------------------------------------------------------

    /// Claim the delete slot. `AlreadyAbsent` when neither the engine nor the
    /// registry knows the container.
    pub async fn begin_delete(&self, name: &str) -> Result<DeleteAdmission, LifecycleError> {
        self.ops
            .begin(name, OpKind::Delete)
            .map_err(|busy| LifecycleError::Busy {
                current: busy.current.status_str(),
            })?;

        let present = self.engine.inspect_container(name).await?.is_some();
        if !present && self.registry.get(name).is_none() {
            self.ops.end(name);
            return Ok(DeleteAdmission::AlreadyAbsent);
        }

        Ok(DeleteAdmission::Started)
    }

    /// Background body of a delete.
    pub async fn delete_runtime(&self, name: &str) -> Result<(), LifecycleError> {
        match self.delete_inner(name).await {
            Ok(()) => {
                self.ops.end(name);
                Ok(())
            }
            Err(err) => {
                warn!(container = name, error = %err, "Runtime deletion failed");
                self.ops
                    .fail(name, OpKind::Delete, &format!("{}: {err}", err.kind()));
                Err(err)
            }
        }
    }

    async fn delete_inner(&self, name: &str) -> Result<(), LifecycleError> {
        // Capture attachment networks before the container disappears.
        let view = self.engine.inspect_container(name).await?;
        let mut attachment_networks: Vec<String> = view
            .as_ref()
            .map(|v| {
                v.networks
                    .keys()
                    .filter(|n| n.starts_with("macvlan_"))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if view.is_some() {
            self.ops.set_step(name, "stopping_container");
            if let Err(err) = self.engine.stop_container(name, STOP_GRACE_SECS).await {
                if !err.is_not_found() {
                    warn!(container = name, error = %err, "Error stopping container");
                }
            }

            self.ops.set_step(name, "removing_container");
            match self.engine.remove_container(name, true).await {
                Ok(()) => info!(container = name, "Container removed"),
                Err(err) if err.is_not_found() => {
                    debug!(container = name, "Container already gone")
                }
                Err(err) => return Err(err.into()),
            }
        } else {
            debug!(container = name, "Container not present, cleaning up resources");
            // Fall back to persisted intent for attachment cleanup.
            if let Some(record) = self.registry.get(name) {
                for vnic in &record.vnics {
                    if let Ok((subnet, _)) = self.resolve_parent_network(vnic) {
                        attachment_networks
                            .push(attachment_network_name(&vnic.parent_interface, &subnet));
                    }
                }
            }
        }

        self.registry.remove(name).await;
        self.devices.remove_device(name);

        self.ops.set_step(name, "removing_networks");
        self.remove_internal_network(name).await;

        attachment_networks.sort();
        attachment_networks.dedup();
        for network in attachment_networks {
            self.remove_attachment_if_unused(&network, name).await;
        }

        info!(container = name, "Runtime container deleted");
        Ok(())
    }

    async fn remove_internal_network(&self, name: &str) {
        let internal = internal_network_name(name);
        match self.engine.inspect_network(&internal).await {
            Ok(Some(network)) => {
                if network
                    .containers
                    .iter()
                    .any(|c| c == &self.config.self_container)
                {
                    if let Err(err) = self
                        .engine
                        .disconnect_network(&internal, &self.config.self_container, true)
                        .await
                    {
                        warn!(network = %internal, error = %err, "Could not detach agent from internal network");
                    }
                }
                match self.engine.remove_network(&internal).await {
                    Ok(()) => info!(network = %internal, "Internal network removed"),
                    Err(err) if err.is_not_found() => {}
                    Err(err) => {
                        warn!(network = %internal, error = %err, "Error removing internal network")
                    }
                }
            }
            Ok(None) => debug!(network = %internal, "Internal network already gone"),
            Err(err) => warn!(network = %internal, error = %err, "Error inspecting internal network"),
        }
    }

    /// Remove an attachment network only when no other container remains
    /// attached; shared networks are kept.
    async fn remove_attachment_if_unused(&self, network: &str, deleted: &str) {
        match self.engine.inspect_network(network).await {
            Ok(Some(view)) => {
                let still_used = view.containers.iter().any(|c| c.as_str() != deleted);
                if still_used {
                    debug!(
                        network,
                        users = view.containers.len(),
                        "Attachment network still in use, keeping"
                    );
                    return;
                }
                match self.engine.remove_network(network).await {
                    Ok(()) => info!(network, "Attachment network removed"),
                    Err(err) if err.is_not_found() || err.is_in_use() => {
                        debug!(network, error = %err, "Skipping attachment network removal")
                    }
                    Err(err) => warn!(network, error = %err, "Error removing attachment network"),
                }
            }
            Ok(None) => {}
            Err(err) => warn!(network, error = %err, "Error inspecting attachment network"),
        }
    }

    // -------------------------------------------------------------------------
    // Inspect
    // -------------------------------------------------------------------------

    pub async fn inspect_device(&self, name: &str) -> Result<Option<DeviceStatus>, EngineError> {
        let view = self.engine.inspect_container(name).await?;
        Ok(view.map(|view| DeviceStatus {
            internal_ip: self.registry.internal_ip(name),
            view,
        }))
    }

    /// Refresh each managed container's cached internal-network IP from the
    /// engine. Runs once at startup: containers restarted by the engine
    /// while the agent was down may hold a different address on their
    /// internal bridge, and the runtime proxy routes by the cached IP.
    pub async fn resync_internal_ips(&self) {
        for (name, record) in self.registry.snapshot() {
            let internal = internal_network_name(&name);
            match self.engine.inspect_container(&name).await {
                Ok(Some(view)) => {
                    let current = view
                        .networks
                        .get(&internal)
                        .and_then(|endpoint| endpoint.ip_address.clone());
                    if current != record.internal_ip {
                        info!(
                            container = %name,
                            internal_ip = current.as_deref().unwrap_or("-"),
                            "Internal IP changed while agent was down, updating registry"
                        );
                        self.registry.set_internal_ip(&name, current).await;
                    }
                }
                Ok(None) => {
                    debug!(container = %name, "Managed container not present, keeping record")
                }
                Err(err) => {
                    warn!(container = %name, error = %err, "Could not resync internal IP")
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Reconfigure
    // -------------------------------------------------------------------------

    /// Rewrite `name`'s attachments on `interface` to the interface's new
    /// subnet. Called by the reconfiguration loop only. Static IPs and MACs
    /// from manual-mode vNICs are reapplied verbatim; an IP incompatible with
    /// the new subnet is the operator's concern.
    pub async fn reconfigure_attachment(
        &self,
        name: &str,
        interface: &str,
        new_subnet: &str,
        new_gateway: Option<&str>,
    ) -> Result<(), LifecycleError> {
        self.ops
            .begin(name, OpKind::Reconfigure)
            .map_err(|busy| LifecycleError::Busy {
                current: busy.current.status_str(),
            })?;

        match self
            .reconfigure_inner(name, interface, new_subnet, new_gateway)
            .await
        {
            Ok(()) => {
                self.ops.end(name);
                Ok(())
            }
            Err(err) => {
                warn!(
                    container = name,
                    interface,
                    new_subnet,
                    error = %err,
                    "Attachment reconfiguration failed, will retry on next change"
                );
                self.ops
                    .fail(name, OpKind::Reconfigure, &format!("{}: {err}", err.kind()));
                Err(err)
            }
        }
    }

    async fn reconfigure_inner(
        &self,
        name: &str,
        interface: &str,
        new_subnet: &str,
        new_gateway: Option<&str>,
    ) -> Result<(), LifecycleError> {
        let Some(record) = self.registry.get(name) else {
            debug!(container = name, "Not in registry, skipping reconfiguration");
            return Ok(());
        };
        let Some(vnic) = record
            .vnics
            .iter()
            .find(|v| v.parent_interface == interface)
        else {
            return Ok(());
        };

        let Some(view) = self.engine.inspect_container(name).await? else {
            warn!(
                container = name,
                "Managed container missing from engine, skipping reconfiguration"
            );
            return Ok(());
        };

        let prefix = format!("macvlan_{interface}_");
        let legacy = format!("macvlan_{interface}");
        let old_networks: Vec<String> = view
            .networks
            .keys()
            .filter(|n| n.starts_with(&prefix) || **n == legacy)
            .cloned()
            .collect();

        // Replaying the current state is a no-op.
        for network in &old_networks {
            if let Some(net) = self.engine.inspect_network(network).await? {
                if net.subnets.iter().any(|s| s == new_subnet) {
                    debug!(
                        container = name,
                        network = network.as_str(),
                        subnet = new_subnet,
                        "Already attached on the new subnet, nothing to do"
                    );
                    return Ok(());
                }
            }
        }

        for network in &old_networks {
            match self.engine.disconnect_network(network, name, true).await {
                Ok(()) => info!(container = name, network = network.as_str(), "Disconnected from stale network"),
                Err(err) => {
                    debug!(container = name, network = network.as_str(), error = %err, "Could not disconnect from stale network")
                }
            }
        }

        let new_network = self
            .get_or_create_attachment(interface, new_subnet, new_gateway)
            .await?;

        if vnic.mac_address.is_none() {
            warn!(
                container = name,
                vnic = %vnic.name,
                "No persisted MAC address; the engine will assign a new one"
            );
        }
        let endpoint = endpoint_for(vnic);
        self.engine
            .connect_network(&new_network, name, &endpoint)
            .await?;

        info!(
            container = name,
            network = %new_network,
            subnet = new_subnet,
            "Reconnected to new attachment network"
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Passthrough operations
    // -------------------------------------------------------------------------

    pub async fn start_device(&self, name: &str) -> Result<(), LifecycleError> {
        self.ensure_idle(name)?;
        Ok(self.engine.start_container(name).await?)
    }

    pub async fn stop_device(&self, name: &str) -> Result<(), LifecycleError> {
        self.ensure_idle(name)?;
        Ok(self.engine.stop_container(name, STOP_GRACE_SECS).await?)
    }

    pub async fn restart_device(&self, name: &str) -> Result<(), LifecycleError> {
        self.ensure_idle(name)?;
        Ok(self.engine.restart_container(name, STOP_GRACE_SECS).await?)
    }

    fn ensure_idle(&self, name: &str) -> Result<(), LifecycleError> {
        match self.ops.in_progress(name) {
            Some(op) => Err(LifecycleError::Busy {
                current: op.status_str(),
            }),
            None => Ok(()),
        }
    }

    // -------------------------------------------------------------------------
    // Self-removal
    // -------------------------------------------------------------------------

    /// Remove every managed resource, the netmon sidecar, the shared volume,
    /// and finally the agent's own container. The process dies with it.
    pub async fn self_destruct(&self) -> Result<(), LifecycleError> {
        self.ops
            .begin(ORCHESTRATOR_SLOT, OpKind::Delete)
            .map_err(|busy| LifecycleError::Busy {
                current: busy.current.status_str(),
            })?;

        match self.self_destruct_inner().await {
            Ok(()) => {
                self.ops.end(ORCHESTRATOR_SLOT);
                Ok(())
            }
            Err(err) => {
                self.ops
                    .fail(ORCHESTRATOR_SLOT, OpKind::Delete, &format!("{}: {err}", err.kind()));
                Err(err)
            }
        }
    }

    async fn self_destruct_inner(&self) -> Result<(), LifecycleError> {
        warn!("Self-destruct: removing all managed resources");

        self.ops.set_step(ORCHESTRATOR_SLOT, "deleting_runtimes");
        for (name, _) in self.registry.snapshot() {
            match self.begin_delete(&name).await? {
                DeleteAdmission::Started => self.delete_runtime(&name).await?,
                DeleteAdmission::AlreadyAbsent => {}
            }
        }

        self.ops.set_step(ORCHESTRATOR_SLOT, "deleting_netmon");
        let netmon = self.config.netmon_container.clone();
        if let Err(err) = self.engine.stop_container(&netmon, STOP_GRACE_SECS).await {
            if !err.is_not_found() {
                warn!(container = %netmon, error = %err, "Error stopping netmon container");
            }
        }
        match self.engine.remove_container(&netmon, true).await {
            Ok(()) => info!(container = %netmon, "Netmon container removed"),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }

        // The agent's own container mounts this volume, so removal usually
        // fails until after self-removal; best effort only.
        self.ops.set_step(ORCHESTRATOR_SLOT, "deleting_volume");
        if let Err(err) = self.engine.remove_volume(&self.config.shared_volume).await {
            warn!(volume = %self.config.shared_volume, error = %err, "Could not remove shared volume");
        }

        self.ops.set_step(ORCHESTRATOR_SLOT, "removing_self");
        self.engine
            .remove_container(&self.config.self_container, true)
            .await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Network resolution
    // -------------------------------------------------------------------------

    /// Pull the runtime image, retrying once; a present local tag is an
    /// acceptable fallback when the registry is unreachable.
    async fn ensure_image(&self, image: &str) -> Result<(), LifecycleError> {
        let first = match self.engine.pull_image(image).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        warn!(image, error = %first, "Image pull failed, retrying once");
        if self.engine.pull_image(image).await.is_ok() {
            return Ok(());
        }

        match self.engine.image_present(image).await {
            Ok(true) => {
                warn!(image, "Pull failed, using local image");
                Ok(())
            }
            _ => Err(LifecycleError::ImageUnavailable(first.to_string())),
        }
    }

    /// Resolve `(subnet, gateway)` for a vNIC's parent interface: explicit
    /// configuration wins, the interface cache is the fallback.
    fn resolve_parent_network(
        &self,
        vnic: &VnicConfig,
    ) -> Result<(String, Option<String>), LifecycleError> {
        if let Some(subnet) = &vnic.parent_subnet {
            let normalized = normalize_subnet(subnet, vnic.parent_gateway.as_deref())
                .ok_or_else(|| LifecycleError::NetworkUnresolvable(vnic.parent_interface.clone()))?;
            return Ok((normalized, vnic.parent_gateway.clone()));
        }

        let state = self
            .interfaces
            .lookup(&vnic.parent_interface)
            .ok_or_else(|| LifecycleError::NetworkUnresolvable(vnic.parent_interface.clone()))?;
        let subnet = state
            .primary_subnet()
            .map(str::to_string)
            .ok_or_else(|| LifecycleError::NetworkUnresolvable(vnic.parent_interface.clone()))?;
        Ok((subnet, state.gateway.clone()))
    }

    async fn ensure_internal_network(&self, name: &str) -> Result<String, LifecycleError> {
        let internal = internal_network_name(name);
        if self.engine.inspect_network(&internal).await?.is_some() {
            debug!(network = %internal, "Internal network already exists");
            return Ok(internal);
        }

        let spec = NetworkSpec {
            name: internal.clone(),
            driver: "bridge".to_string(),
            internal: true,
            ..Default::default()
        };
        match self.engine.create_network(&spec).await {
            Ok(()) => info!(network = %internal, "Internal network created"),
            // A racing creation of the same name is fine.
            Err(EngineError::Api { status: 409, .. }) => {}
            Err(err) => return Err(err.into()),
        }
        Ok(internal)
    }

    /// Get or create the macvlan attachment network for `(interface,
    /// subnet)`. On an engine pool overlap, an existing macvlan network with
    /// the same parent and subnet is reused.
    async fn get_or_create_attachment(
        &self,
        interface: &str,
        subnet: &str,
        gateway: Option<&str>,
    ) -> Result<String, LifecycleError> {
        let name = attachment_network_name(interface, subnet);

        if self.engine.inspect_network(&name).await?.is_some() {
            debug!(network = %name, "Attachment network already exists, reusing");
            return Ok(name);
        }

        let spec = NetworkSpec {
            name: name.clone(),
            driver: "macvlan".to_string(),
            internal: false,
            parent: Some(interface.to_string()),
            subnet: Some(subnet.to_string()),
            gateway: gateway.map(str::to_string),
        };

        match self.engine.create_network(&spec).await {
            Ok(()) => {
                info!(network = %name, interface, subnet, "Attachment network created");
                Ok(name)
            }
            Err(err) if err.is_overlap() => {
                warn!(
                    interface,
                    subnet, "Address pool overlap, scanning for a reusable macvlan network"
                );
                for network in self.engine.list_networks().await? {
                    if network.driver == "macvlan"
                        && network.parent.as_deref() == Some(interface)
                        && network.subnets.iter().any(|s| s == subnet)
                    {
                        info!(network = %network.name, "Reusing overlapping macvlan network");
                        return Ok(network.name);
                    }
                }
                Err(LifecycleError::NetworkOverlapUnresolved {
                    interface: interface.to_string(),
                    subnet: subnet.to_string(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }
}

// =============================================================================
// Naming and subnet helpers
// =============================================================================

pub fn internal_network_name(container: &str) -> String {
    format!("{container}_internal")
}

/// Canonical attachment network name: `macvlan_{parent}_{subnet}` with the
/// CIDR slash flattened, e.g. `macvlan_ens37_192.168.1.0_24`.
pub fn attachment_network_name(interface: &str, subnet: &str) -> String {
    format!("macvlan_{interface}_{}", subnet.replace('/', "_"))
}

/// Normalize a configured subnet to CIDR. Dotted netmasks need the gateway
/// to derive the network base.
pub fn normalize_subnet(subnet: &str, gateway: Option<&str>) -> Option<String> {
    if subnet.contains('/') {
        return Some(subnet.to_string());
    }
    let gateway = gateway?;
    let prefix = netmask_prefix(subnet)?;
    let base = network_base(gateway, subnet)?;
    Some(format!("{base}/{prefix}"))
}

/// Count of set bits in a dotted netmask, e.g. `255.255.255.0` -> 24.
fn netmask_prefix(netmask: &str) -> Option<u32> {
    let octets = parse_octets(netmask)?;
    Some(octets.iter().map(|o| o.count_ones()).sum())
}

/// Apply a netmask to the gateway to get the network base address.
fn network_base(gateway: &str, netmask: &str) -> Option<String> {
    let gw = parse_octets(gateway)?;
    let mask = parse_octets(netmask)?;
    let base: Vec<String> = gw
        .iter()
        .zip(mask.iter())
        .map(|(g, m)| (g & m).to_string())
        .collect();
    Some(base.join("."))
}

fn parse_octets(address: &str) -> Option<[u8; 4]> {
    let mut octets = [0u8; 4];
    let mut parts = address.split('.');
    for octet in octets.iter_mut() {
        *octet = parts.next()?.parse().ok()?;
    }
    parts.next().is_none().then_some(octets)
}

/// DNS servers from all vNICs, deduplicated, first occurrence wins.
fn aggregate_dns(vnics: &[VnicConfig]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut servers = Vec::new();
    for vnic in vnics {
        for server in &vnic.dns {
            if seen.insert(server.clone()) {
                servers.push(server.clone());
            }
        }
    }
    servers
}

/// Endpoint constraints for a vNIC: manual mode pins the static IP, and a
/// persisted MAC is always reapplied.
fn endpoint_for(vnic: &VnicConfig) -> EndpointSpec {
    EndpointSpec {
        ipv4_address: (vnic.network_mode == NetworkMode::Manual)
            .then(|| vnic.ip_address.clone())
            .flatten()
            .map(|ip| ip.split('/').next().unwrap_or(&ip).to_string()),
        mac_address: vnic.mac_address.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attachment_network_name() {
        assert_eq!(
            attachment_network_name("ens37", "192.168.1.0/24"),
            "macvlan_ens37_192.168.1.0_24"
        );
        assert_eq!(
            attachment_network_name("eth0", "10.0.0.0/16"),
            "macvlan_eth0_10.0.0.0_16"
        );
    }

    #[test]
    fn test_normalize_subnet_cidr_passthrough() {
        assert_eq!(
            normalize_subnet("192.168.1.0/24", None),
            Some("192.168.1.0/24".to_string())
        );
    }

    #[test]
    fn test_normalize_subnet_from_netmask() {
        assert_eq!(
            normalize_subnet("255.255.255.0", Some("192.168.1.1")),
            Some("192.168.1.0/24".to_string())
        );
        assert_eq!(
            normalize_subnet("255.255.0.0", Some("10.1.2.1")),
            Some("10.1.0.0/16".to_string())
        );
        // Netmask without a gateway cannot be normalized.
        assert_eq!(normalize_subnet("255.255.255.0", None), None);
    }

    #[test]
    fn test_netmask_prefix() {
        assert_eq!(netmask_prefix("255.255.255.0"), Some(24));
        assert_eq!(netmask_prefix("255.255.255.252"), Some(30));
        assert_eq!(netmask_prefix("255.0.0.0"), Some(8));
        assert_eq!(netmask_prefix("not.a.mask"), None);
    }

    #[test]
    fn test_network_base_applies_mask() {
        assert_eq!(
            network_base("192.168.1.1", "255.255.255.0"),
            Some("192.168.1.0".to_string())
        );
        assert_eq!(
            network_base("10.1.2.254", "255.255.0.0"),
            Some("10.1.0.0".to_string())
        );
    }

    #[test]
    fn test_aggregate_dns_dedup_preserves_order() {
        let mut a = VnicConfig {
            name: "eth0".to_string(),
            parent_interface: "ens37".to_string(),
            network_mode: NetworkMode::Manual,
            parent_subnet: None,
            parent_gateway: None,
            ip_address: Some("192.168.1.100".to_string()),
            subnet: Some("192.168.1.0/24".to_string()),
            gateway: Some("192.168.1.1".to_string()),
            dns: vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()],
            mac_address: None,
        };
        let mut b = a.clone();
        b.name = "eth1".to_string();
        b.dns = vec!["1.1.1.1".to_string(), "9.9.9.9".to_string()];
        a.dns = vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()];

        assert_eq!(
            aggregate_dns(&[a, b]),
            vec!["8.8.8.8", "1.1.1.1", "9.9.9.9"]
        );
    }

    #[test]
    fn test_endpoint_for_manual_pins_ip_and_mac() {
        let vnic = VnicConfig {
            name: "eth0".to_string(),
            parent_interface: "ens37".to_string(),
            network_mode: NetworkMode::Manual,
            parent_subnet: None,
            parent_gateway: None,
            ip_address: Some("192.168.1.100/24".to_string()),
            subnet: Some("192.168.1.0/24".to_string()),
            gateway: Some("192.168.1.1".to_string()),
            dns: Vec::new(),
            mac_address: Some("02:42:ac:11:00:02".to_string()),
        };
        let endpoint = endpoint_for(&vnic);
        // Prefix stripped from the pinned address.
        assert_eq!(endpoint.ipv4_address.as_deref(), Some("192.168.1.100"));
        assert_eq!(endpoint.mac_address.as_deref(), Some("02:42:ac:11:00:02"));
    }

    #[test]
    fn test_endpoint_for_dhcp_pins_only_mac() {
        let vnic = VnicConfig {
            name: "eth0".to_string(),
            parent_interface: "ens37".to_string(),
            network_mode: NetworkMode::Dhcp,
            parent_subnet: None,
            parent_gateway: None,
            ip_address: Some("192.168.1.100".to_string()),
            subnet: None,
            gateway: None,
            dns: Vec::new(),
            mac_address: Some("02:42:ac:11:00:02".to_string()),
        };
        let endpoint = endpoint_for(&vnic);
        assert_eq!(endpoint.ipv4_address, None);
        assert_eq!(endpoint.mac_address.as_deref(), Some("02:42:ac:11:00:02"));
    }
}
