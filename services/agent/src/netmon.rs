//! Host interface event stream client.
//!
//! The network-monitor sidecar publishes newline-delimited JSON events on a
//! Unix socket: a full `network_discovery` on connect, then incremental
//! `network_change` events. The client keeps the interface cache current and
//! forwards eligible changes to the reconfiguration loop.
//!
//! The socket being absent is not an error: the sidecar may start after the
//! agent. The client retries forever with a bounded backoff and survives
//! malformed lines, unknown event types, and EOF.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Interface-name prefixes that belong to the container engine or kernel
/// plumbing, never to the physical host network.
const INFRASTRUCTURE_PREFIXES: &[&str] = &["veth", "br-"];
const INFRASTRUCTURE_NAMES: &[&str] = &["lo", "docker0"];

/// Broader virtual-interface filter used by the host-interface query topic.
const VIRTUAL_PREFIXES: &[&str] = &[
    "lo", "docker", "br-", "veth", "virbr", "tailscale", "zt", "cni", "flannel", "kube-ipvs",
    "wg", "cilium", "macvtap",
];

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ipv4Address {
    pub address: String,
    #[serde(default)]
    pub prefixlen: u8,
    pub subnet: String,
    #[serde(default)]
    pub network_address: Option<String>,
}

/// One host interface as reported by the sidecar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterfaceState {
    pub interface: String,
    #[serde(default)]
    pub index: i64,
    #[serde(default)]
    pub operstate: String,
    #[serde(default)]
    pub ipv4_addresses: Vec<Ipv4Address>,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl InterfaceState {
    pub fn is_up(&self) -> bool {
        self.operstate.eq_ignore_ascii_case("up")
    }

    /// The subnet of the first IPv4 address, the one attachments follow.
    pub fn primary_subnet(&self) -> Option<&str> {
        self.ipv4_addresses.first().map(|a| a.subnet.as_str())
    }
}

/// True for loopback, engine bridges, and veth-family interfaces.
pub fn is_infrastructure_interface(name: &str) -> bool {
    INFRASTRUCTURE_NAMES.contains(&name)
        || INFRASTRUCTURE_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
}

/// True for physical host interfaces (excludes bridges, VPNs, overlays).
pub fn is_physical_interface(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    !VIRTUAL_PREFIXES.iter().any(|prefix| lower.starts_with(prefix))
}

// =============================================================================
// Interface cache
// =============================================================================

/// The agent's picture of host interfaces, owned by the event stream client.
/// Everything reported by the sidecar is cached for diagnostics; `lookup`
/// only answers for usable interfaces.
#[derive(Default)]
pub struct InterfaceCache {
    entries: RwLock<HashMap<String, InterfaceState>>,
}

impl InterfaceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole cache from a discovery event.
    pub fn replace_all(&self, interfaces: Vec<InterfaceState>) {
        let mut entries = self.write();
        entries.clear();
        for state in interfaces {
            entries.insert(state.interface.clone(), state);
        }
    }

    pub fn upsert(&self, state: InterfaceState) {
        self.write().insert(state.interface.clone(), state);
    }

    pub fn remove(&self, interface: &str) {
        self.write().remove(interface);
    }

    /// Resolve an interface for attachment use. Infrastructure interfaces,
    /// interfaces that are not `UP`, and interfaces without an IPv4 address
    /// are never returned.
    pub fn lookup(&self, interface: &str) -> Option<InterfaceState> {
        if is_infrastructure_interface(interface) {
            return None;
        }
        let entries = self.read();
        entries
            .get(interface)
            .filter(|state| state.is_up() && !state.ipv4_addresses.is_empty())
            .cloned()
    }

    /// Everything cached, including diagnostic-only entries.
    pub fn snapshot(&self) -> Vec<InterfaceState> {
        let mut all: Vec<_> = self.read().values().cloned().collect();
        all.sort_by(|a, b| a.interface.cmp(&b.interface));
        all
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, InterfaceState>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, InterfaceState>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}

// =============================================================================
// Event stream client
// =============================================================================

pub struct NetmonClient {
    socket_path: PathBuf,
    cache: std::sync::Arc<InterfaceCache>,
    changes: mpsc::Sender<InterfaceState>,
}

impl NetmonClient {
    pub fn new(
        socket_path: PathBuf,
        cache: std::sync::Arc<InterfaceCache>,
        changes: mpsc::Sender<InterfaceState>,
    ) -> Self {
        Self {
            socket_path,
            cache,
            changes,
        }
    }

    /// Connect-and-read loop. Returns only on shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            if !self.socket_path.exists() {
                debug!(
                    path = %self.socket_path.display(),
                    "Network monitor socket not present, waiting"
                );
                if wait_or_shutdown(RETRY_DELAY, &mut shutdown).await {
                    break;
                }
                continue;
            }

            match UnixStream::connect(&self.socket_path).await {
                Ok(stream) => {
                    info!(path = %self.socket_path.display(), "Connected to network monitor");
                    self.read_events(stream, &mut shutdown).await;
                    if *shutdown.borrow() {
                        break;
                    }
                    warn!("Network monitor connection closed, reconnecting");
                }
                Err(err) => {
                    warn!(error = %err, "Failed to connect to network monitor");
                }
            }

            if wait_or_shutdown(RETRY_DELAY, &mut shutdown).await {
                break;
            }
        }

        info!("Network event listener stopped");
    }

    async fn read_events(&self, stream: UnixStream, shutdown: &mut watch::Receiver<bool>) {
        let mut lines = BufReader::new(stream).lines();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => self.handle_line(&line).await,
                        Ok(None) => return,
                        Err(err) => {
                            warn!(error = %err, "Error reading network event");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let event: Value = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "Failed to parse network event line");
                return;
            }
        };

        let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");
        match event_type {
            "network_discovery" => self.handle_discovery(&event),
            "network_change" => self.handle_change(&event).await,
            other => {
                debug!(event_type = other, "Skipping unknown network event type");
            }
        }
    }

    fn handle_discovery(&self, event: &Value) {
        let interfaces = event
            .get("data")
            .and_then(|d| d.get("interfaces"))
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));

        match serde_json::from_value::<Vec<InterfaceState>>(interfaces) {
            Ok(interfaces) => {
                info!(count = interfaces.len(), "Received network discovery");
                self.cache.replace_all(interfaces);
            }
            Err(err) => warn!(error = %err, "Malformed network discovery payload"),
        }
    }

    async fn handle_change(&self, event: &Value) {
        let data = event.get("data").cloned().unwrap_or(Value::Null);
        let state: InterfaceState = match serde_json::from_value(data) {
            Ok(state) => state,
            Err(err) => {
                warn!(error = %err, "Malformed network change payload");
                return;
            }
        };

        if state.ipv4_addresses.is_empty() {
            debug!(
                interface = %state.interface,
                "Interface lost its IPv4 addresses, dropping from cache"
            );
            self.cache.remove(&state.interface);
            return;
        }

        info!(
            interface = %state.interface,
            subnet = state.primary_subnet().unwrap_or("?"),
            gateway = state.gateway.as_deref().unwrap_or("-"),
            "Network change"
        );
        self.cache.upsert(state.clone());

        if !is_infrastructure_interface(&state.interface) {
            if self.changes.send(state).await.is_err() {
                debug!("Reconfiguration loop is gone, dropping change event");
            }
        }
    }
}

async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => *shutdown.borrow(),
    }
}
