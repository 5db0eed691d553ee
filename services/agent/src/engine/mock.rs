//! In-memory engine for tests and development.
//!
//! Mimics the daemon behaviors the lifecycle logic depends on: name
//! conflicts, image presence checks, address-pool overlap on network
//! creation, endpoint IP/MAC assignment, and active-endpoint protection on
//! network removal. Failure knobs let tests exercise the error paths.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use super::{
    ContainerEngine, ContainerSpec, ContainerUsage, ContainerView, EndpointSpec, EndpointView,
    EngineError, NetworkSpec, NetworkView,
};

#[derive(Debug, Clone)]
struct MockContainer {
    id: String,
    running: bool,
    restart_count: i64,
    networks: BTreeMap<String, EndpointView>,
}

#[derive(Debug, Clone)]
struct MockNetwork {
    id: String,
    driver: String,
    internal: bool,
    parent: Option<String>,
    subnet: Option<String>,
    gateway: Option<String>,
}

#[derive(Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    networks: HashMap<String, MockNetwork>,
    images: HashSet<String>,
    volumes: HashSet<String>,
}

pub struct MockEngine {
    state: Mutex<MockState>,
    fail_pull: AtomicBool,
    id_counter: AtomicU64,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            fail_pull: AtomicBool::new(false),
            id_counter: AtomicU64::new(1),
        }
    }

    /// Make every subsequent pull fail (registry unreachable).
    pub fn set_fail_pull(&self, fail: bool) {
        self.fail_pull.store(fail, Ordering::SeqCst);
    }

    /// Mark an image tag as present locally without a pull.
    pub fn seed_local_image(&self, reference: &str) {
        self.lock().images.insert(reference.to_string());
    }

    /// Pre-create a container (e.g. the agent's own).
    pub fn seed_container(&self, name: &str) {
        let id = self.next_id("cont");
        self.lock().containers.insert(
            name.to_string(),
            MockContainer {
                id,
                running: true,
                restart_count: 0,
                networks: BTreeMap::new(),
            },
        );
    }

    /// Pre-create a network, as an operator or another tool might have.
    pub fn seed_network(&self, spec: &NetworkSpec) {
        let id = self.next_id("net");
        self.lock().networks.insert(
            spec.name.clone(),
            MockNetwork {
                id,
                driver: spec.driver.clone(),
                internal: spec.internal,
                parent: spec.parent.clone(),
                subnet: spec.subnet.clone(),
                gateway: spec.gateway.clone(),
            },
        );
    }

    pub fn network_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.lock().networks.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.lock().containers.keys().cloned().collect();
        names.sort();
        names
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.id_counter.fetch_add(1, Ordering::SeqCst);
        format!("{prefix}_{n:08x}")
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn view_network(state: &MockState, name: &str, network: &MockNetwork) -> NetworkView {
        let containers = state
            .containers
            .iter()
            .filter(|(_, c)| c.networks.contains_key(name))
            .map(|(container_name, _)| container_name.clone())
            .collect();

        NetworkView {
            id: network.id.clone(),
            name: name.to_string(),
            driver: network.driver.clone(),
            parent: network.parent.clone(),
            subnets: network.subnet.clone().into_iter().collect(),
            gateways: network.gateway.clone().into_iter().collect(),
            containers,
        }
    }

    /// Derive an endpoint address inside the network's subnet (or a fixed
    /// internal range) when the caller did not pin one.
    fn assign_ip(&self, network: &MockNetwork) -> String {
        let host = 2 + (self.id_counter.fetch_add(1, Ordering::SeqCst) % 250);
        match &network.subnet {
            Some(subnet) => {
                let base = subnet.split('/').next().unwrap_or("10.0.0.0");
                let mut octets: Vec<&str> = base.split('.').collect();
                let last = format!("{host}");
                if octets.len() == 4 {
                    octets[3] = &last;
                    octets.join(".")
                } else {
                    format!("10.0.0.{host}")
                }
            }
            None => format!("172.28.0.{host}"),
        }
    }

    fn assign_mac(&self) -> String {
        let n = self.id_counter.fetch_add(1, Ordering::SeqCst);
        format!("02:42:c0:a8:{:02x}:{:02x}", (n >> 8) & 0xff, n & 0xff)
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn pull_image(&self, reference: &str) -> Result<(), EngineError> {
        if self.fail_pull.load(Ordering::SeqCst) {
            return Err(EngineError::Transport("pull failed: registry unreachable".to_string()));
        }
        debug!(image = reference, "[mock] pulled image");
        self.lock().images.insert(reference.to_string());
        Ok(())
    }

    async fn image_present(&self, reference: &str) -> Result<bool, EngineError> {
        Ok(self.lock().images.contains(reference))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let id = self.next_id("cont");
        let mut state = self.lock();

        if state.containers.contains_key(&spec.name) {
            return Err(EngineError::Api {
                status: 409,
                message: format!("Conflict. The container name \"{}\" is already in use", spec.name),
            });
        }
        if !state.images.contains(&spec.image) {
            return Err(EngineError::NotFound(format!("No such image: {}", spec.image)));
        }

        let mut networks = BTreeMap::new();
        if let Some(initial) = &spec.network {
            let Some(network) = state.networks.get(initial).cloned() else {
                return Err(EngineError::NotFound(format!("network {initial} not found")));
            };
            networks.insert(
                initial.clone(),
                EndpointView {
                    ip_address: Some(self.assign_ip(&network)),
                    mac_address: Some(self.assign_mac()),
                    gateway: network.gateway.clone(),
                },
            );
        }

        state.containers.insert(
            spec.name.clone(),
            MockContainer {
                id: id.clone(),
                running: false,
                restart_count: 0,
                networks,
            },
        );

        Ok(id)
    }

    async fn start_container(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        match state.containers.get_mut(name) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(EngineError::NotFound(format!("No such container: {name}"))),
        }
    }

    async fn stop_container(&self, name: &str, _grace_secs: i64) -> Result<(), EngineError> {
        let mut state = self.lock();
        match state.containers.get_mut(name) {
            Some(container) => {
                container.running = false;
                Ok(())
            }
            None => Err(EngineError::NotFound(format!("No such container: {name}"))),
        }
    }

    async fn restart_container(&self, name: &str, _grace_secs: i64) -> Result<(), EngineError> {
        let mut state = self.lock();
        match state.containers.get_mut(name) {
            Some(container) => {
                container.running = true;
                container.restart_count += 1;
                Ok(())
            }
            None => Err(EngineError::NotFound(format!("No such container: {name}"))),
        }
    }

    async fn remove_container(&self, name: &str, force: bool) -> Result<(), EngineError> {
        let mut state = self.lock();
        match state.containers.get(name) {
            Some(container) if container.running && !force => Err(EngineError::Api {
                status: 409,
                message: format!("cannot remove running container {name}"),
            }),
            Some(_) => {
                state.containers.remove(name);
                Ok(())
            }
            None => Err(EngineError::NotFound(format!("No such container: {name}"))),
        }
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerView>, EngineError> {
        let state = self.lock();
        Ok(state.containers.get(name).map(|container| ContainerView {
            id: container.id.clone(),
            name: name.to_string(),
            state: if container.running { "running" } else { "exited" }.to_string(),
            running: container.running,
            restart_count: container.restart_count,
            started_at: container.running.then(chrono::Utc::now),
            exit_code: (!container.running).then_some(0),
            networks: container.networks.clone(),
        }))
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<(), EngineError> {
        let id = self.next_id("net");
        let mut state = self.lock();

        if state.networks.contains_key(&spec.name) {
            return Err(EngineError::Api {
                status: 409,
                message: format!("network with name {} already exists", spec.name),
            });
        }

        if let Some(subnet) = &spec.subnet {
            let overlapping = state
                .networks
                .values()
                .any(|n| n.subnet.as_deref() == Some(subnet));
            if overlapping {
                return Err(EngineError::Api {
                    status: 403,
                    message: "Pool overlaps with other one on this address space".to_string(),
                });
            }
        }

        state.networks.insert(
            spec.name.clone(),
            MockNetwork {
                id,
                driver: spec.driver.clone(),
                internal: spec.internal,
                parent: spec.parent.clone(),
                subnet: spec.subnet.clone(),
                gateway: spec.gateway.clone(),
            },
        );
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.lock();

        if !state.networks.contains_key(name) {
            return Err(EngineError::NotFound(format!("network {name} not found")));
        }
        let attached = state
            .containers
            .values()
            .any(|c| c.networks.contains_key(name));
        if attached {
            return Err(EngineError::Api {
                status: 403,
                message: format!("error while removing network: network {name} has active endpoints"),
            });
        }

        state.networks.remove(name);
        Ok(())
    }

    async fn list_networks(&self) -> Result<Vec<NetworkView>, EngineError> {
        let state = self.lock();
        let mut views: Vec<_> = state
            .networks
            .iter()
            .map(|(name, network)| Self::view_network(&state, name, network))
            .collect();
        views.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(views)
    }

    async fn inspect_network(&self, name: &str) -> Result<Option<NetworkView>, EngineError> {
        let state = self.lock();
        Ok(state
            .networks
            .get(name)
            .map(|network| Self::view_network(&state, name, network)))
    }

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        endpoint: &EndpointSpec,
    ) -> Result<(), EngineError> {
        let mut state = self.lock();

        let Some(net) = state.networks.get(network).cloned() else {
            return Err(EngineError::NotFound(format!("network {network} not found")));
        };
        let Some(cont) = state.containers.get_mut(container) else {
            return Err(EngineError::NotFound(format!("No such container: {container}")));
        };
        if cont.networks.contains_key(network) {
            return Err(EngineError::Api {
                status: 403,
                message: format!("container is already attached to network {network}"),
            });
        }

        let ip = endpoint
            .ipv4_address
            .clone()
            .unwrap_or_else(|| self.assign_ip(&net));
        let mac = endpoint
            .mac_address
            .clone()
            .unwrap_or_else(|| self.assign_mac());

        cont.networks.insert(
            network.to_string(),
            EndpointView {
                ip_address: Some(ip),
                mac_address: Some(mac),
                gateway: net.gateway.clone(),
            },
        );
        Ok(())
    }

    async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
        _force: bool,
    ) -> Result<(), EngineError> {
        let mut state = self.lock();
        let Some(cont) = state.containers.get_mut(container) else {
            return Err(EngineError::NotFound(format!("No such container: {container}")));
        };
        if cont.networks.remove(network).is_none() {
            return Err(EngineError::Api {
                status: 403,
                message: format!("container is not connected to network {network}"),
            });
        }
        Ok(())
    }

    async fn container_usage(&self, name: &str) -> Result<Option<ContainerUsage>, EngineError> {
        let state = self.lock();
        Ok(state
            .containers
            .get(name)
            .filter(|c| c.running)
            .map(|_| ContainerUsage {
                cpu_percent: 1.0,
                memory_mb: 64.0,
            }))
    }

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.volumes.remove(name);
        Ok(())
    }
}
