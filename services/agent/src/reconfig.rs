//! Debounced network reconfiguration loop.
//!
//! Consumes interface change events from the netmon client. Changes for the
//! same interface are coalesced over a debounce window (only the last one is
//! acted on); when the window closes, every managed container with a vNIC on
//! that interface is reconfigured. Different containers proceed in parallel
//! up to a bounded fan-out; the operation tracker serializes work on the
//! same container.
//!
//! On shutdown no new work is started and in-flight reconfigurations drain.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::lifecycle::Lifecycle;
use crate::netmon::InterfaceState;
use crate::registry::Registry;

pub struct ReconfigLoop {
    lifecycle: Arc<Lifecycle>,
    registry: Arc<Registry>,
    changes: mpsc::Receiver<InterfaceState>,
    window: Duration,
    fanout: usize,
}

impl ReconfigLoop {
    pub fn new(
        lifecycle: Arc<Lifecycle>,
        registry: Arc<Registry>,
        changes: mpsc::Receiver<InterfaceState>,
        window: Duration,
        fanout: usize,
    ) -> Self {
        Self {
            lifecycle,
            registry,
            changes,
            window,
            fanout,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let ReconfigLoop {
            lifecycle,
            registry,
            mut changes,
            window,
            fanout,
        } = self;

        info!(
            window_secs = window.as_secs(),
            fanout, "Starting network reconfiguration loop"
        );

        let semaphore = Arc::new(Semaphore::new(fanout));
        let mut pending: HashMap<String, (InterfaceState, Instant)> = HashMap::new();
        let mut workers: JoinSet<()> = JoinSet::new();
        let mut tick = tokio::time::interval(Duration::from_millis(250));

        loop {
            tokio::select! {
                change = changes.recv() => {
                    match change {
                        Some(state) => {
                            let deadline = Instant::now() + window;
                            debug!(interface = %state.interface, "Debouncing network change");
                            // Later events for the same interface replace
                            // earlier ones and push the deadline out.
                            pending.insert(state.interface.clone(), (state, deadline));
                        }
                        None => break,
                    }
                }
                _ = tick.tick() => {
                    let now = Instant::now();
                    let due: Vec<String> = pending
                        .iter()
                        .filter(|(_, (_, deadline))| *deadline <= now)
                        .map(|(interface, _)| interface.clone())
                        .collect();

                    for interface in due {
                        if let Some((state, _)) = pending.remove(&interface) {
                            fire(&lifecycle, &registry, &state, &semaphore, &mut workers);
                        }
                    }
                    // Reap finished workers without blocking.
                    while workers.try_join_next().is_some() {}
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Drain in-flight reconfigurations; pending (not yet fired) changes
        // are dropped.
        if !workers.is_empty() {
            info!(in_flight = workers.len(), "Draining reconfiguration workers");
        }
        while workers.join_next().await.is_some() {}
        info!("Reconfiguration loop stopped");
    }
}

/// Kick off reconfiguration of every affected container for one settled
/// interface change.
fn fire(
    lifecycle: &Arc<Lifecycle>,
    registry: &Registry,
    state: &InterfaceState,
    semaphore: &Arc<Semaphore>,
    workers: &mut JoinSet<()>,
) {
    let Some(subnet) = state.primary_subnet().map(str::to_string) else {
        warn!(interface = %state.interface, "Change fired without a subnet, skipping");
        return;
    };
    let gateway = state.gateway.clone();

    let affected: Vec<String> = registry
        .snapshot()
        .into_iter()
        .filter(|(_, record)| {
            record
                .vnics
                .iter()
                .any(|v| v.parent_interface == state.interface)
        })
        .map(|(name, _)| name)
        .collect();

    if affected.is_empty() {
        debug!(interface = %state.interface, "No managed containers on changed interface");
        return;
    }

    info!(
        interface = %state.interface,
        subnet = %subnet,
        containers = affected.len(),
        "Processing settled network change"
    );

    for name in affected {
        let lifecycle = Arc::clone(lifecycle);
        let semaphore = Arc::clone(semaphore);
        let interface = state.interface.clone();
        let subnet = subnet.clone();
        let gateway = gateway.clone();

        workers.spawn(async move {
            let Ok(_permit) = semaphore.acquire().await else {
                return;
            };
            if let Err(err) = lifecycle
                .reconfigure_attachment(&name, &interface, &subnet, gateway.as_deref())
                .await
            {
                // Already audited by the lifecycle engine; retried on the
                // next change for this interface.
                debug!(container = %name, error = %err, "Reconfiguration worker finished with error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ContainerEngine, MockEngine};
    use crate::lifecycle::LifecycleConfig;
    use crate::netmon::{InterfaceCache, Ipv4Address};
    use crate::ops::OpsTracker;
    use crate::registry::{ContainerRecord, NetworkMode, VnicConfig};
    use crate::usage::DeviceUsage;

    fn change(interface: &str, subnet: &str, gateway: &str) -> InterfaceState {
        InterfaceState {
            interface: interface.to_string(),
            index: 2,
            operstate: "UP".to_string(),
            ipv4_addresses: vec![Ipv4Address {
                address: gateway.replace(".1", ".10"),
                prefixlen: 24,
                subnet: subnet.to_string(),
                network_address: None,
            }],
            gateway: Some(gateway.to_string()),
            timestamp: None,
        }
    }

    async fn test_fixture(dir: &std::path::Path) -> (Arc<Lifecycle>, Arc<Registry>, Arc<MockEngine>) {
        let engine = Arc::new(MockEngine::new());
        engine.seed_container("orchestrator-agent");
        let registry = Arc::new(Registry::open(dir.join("runtime_vnics.json")));
        let lifecycle = Arc::new(Lifecycle::new(
            engine.clone(),
            registry.clone(),
            Arc::new(OpsTracker::new()),
            Arc::new(InterfaceCache::new()),
            Arc::new(DeviceUsage::new()),
            LifecycleConfig {
                runtime_image: "img:latest".to_string(),
                self_container: "orchestrator-agent".to_string(),
                netmon_container: "autonomy_netmon".to_string(),
                shared_volume: "orchestrator-shared".to_string(),
            },
        ));
        (lifecycle, registry, engine)
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces_to_last_event() {
        let dir = tempfile::tempdir().unwrap();
        let (lifecycle, registry, engine) = test_fixture(dir.path()).await;

        // A managed container attached to the old subnet on ens37.
        engine.seed_local_image("img:latest");
        engine.seed_network(&crate::engine::NetworkSpec {
            name: "plc-001_internal".to_string(),
            driver: "bridge".to_string(),
            internal: true,
            ..Default::default()
        });
        engine.seed_network(&crate::engine::NetworkSpec {
            name: "macvlan_ens37_192.168.1.0_24".to_string(),
            driver: "macvlan".to_string(),
            parent: Some("ens37".to_string()),
            subnet: Some("192.168.1.0/24".to_string()),
            ..Default::default()
        });
        engine
            .create_container(&crate::engine::ContainerSpec {
                name: "plc-001".to_string(),
                image: "img:latest".to_string(),
                network: Some("plc-001_internal".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        engine
            .connect_network(
                "macvlan_ens37_192.168.1.0_24",
                "plc-001",
                &Default::default(),
            )
            .await
            .unwrap();

        registry
            .put(
                "plc-001",
                ContainerRecord {
                    vnics: vec![VnicConfig {
                        name: "eth0".to_string(),
                        parent_interface: "ens37".to_string(),
                        network_mode: NetworkMode::Dhcp,
                        parent_subnet: None,
                        parent_gateway: None,
                        ip_address: None,
                        subnet: None,
                        gateway: None,
                        dns: Vec::new(),
                        mac_address: Some("02:42:ac:11:00:02".to_string()),
                    }],
                    internal_ip: None,
                    image: None,
                },
            )
            .await;

        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reconfig = ReconfigLoop::new(
            lifecycle,
            registry,
            rx,
            Duration::from_secs(3),
            4,
        );
        let handle = tokio::spawn(reconfig.run(shutdown_rx));

        // Two changes inside the window: only the second subnet must win.
        tx.send(change("ens37", "10.0.0.0/24", "10.0.0.1"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(change("ens37", "10.0.1.0/24", "10.0.1.1"))
            .await
            .unwrap();

        // Let the second window elapse and workers run.
        tokio::time::sleep(Duration::from_secs(5)).await;

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let networks = engine.network_names();
        assert!(
            networks.contains(&"macvlan_ens37_10.0.1.0_24".to_string()),
            "expected network for the last change, got {networks:?}"
        );
        assert!(
            !networks.contains(&"macvlan_ens37_10.0.0.0_24".to_string()),
            "intermediate change must be coalesced away, got {networks:?}"
        );

        let view = engine.inspect_container("plc-001").await.unwrap().unwrap();
        assert!(view.networks.contains_key("macvlan_ens37_10.0.1.0_24"));
        assert!(!view.networks.contains_key("macvlan_ens37_192.168.1.0_24"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrelated_interface_change_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (lifecycle, registry, engine) = test_fixture(dir.path()).await;

        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(
            ReconfigLoop::new(lifecycle, registry, rx, Duration::from_secs(3), 4).run(shutdown_rx),
        );

        tx.send(change("ens99", "10.5.0.0/24", "10.5.0.1"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        // No containers on ens99: nothing was created.
        assert!(engine.network_names().is_empty());
    }
}
