//! Integration tests for attachment reconfiguration on host network changes.
//!
//! Covers the manual-address case: when a parent interface moves to a new
//! subnet, the container is reattached to the new macvlan network with its
//! persisted MAC address, and a manual static IP is reapplied verbatim even
//! if it no longer matches the subnet (operator's concern).

use std::path::Path;
use std::sync::Arc;

use vplc_agent::engine::{ContainerEngine, ContainerSpec, EndpointSpec, MockEngine, NetworkSpec};
use vplc_agent::lifecycle::{Lifecycle, LifecycleConfig, LifecycleError};
use vplc_agent::netmon::InterfaceCache;
use vplc_agent::ops::{OpKind, OpsTracker};
use vplc_agent::registry::{ContainerRecord, NetworkMode, Registry, VnicConfig};
use vplc_agent::usage::DeviceUsage;

const SELF: &str = "orchestrator-agent";
const OLD_NET: &str = "macvlan_ens37_192.168.1.0_24";
const NEW_NET: &str = "macvlan_ens37_10.0.0.0_24";
const MAC: &str = "02:42:ac:11:00:02";

struct Fixture {
    engine: Arc<MockEngine>,
    registry: Arc<Registry>,
    ops: Arc<OpsTracker>,
    lifecycle: Lifecycle,
}

fn manual_vnic() -> VnicConfig {
    VnicConfig {
        name: "eth0".to_string(),
        parent_interface: "ens37".to_string(),
        network_mode: NetworkMode::Manual,
        parent_subnet: None,
        parent_gateway: None,
        ip_address: Some("192.168.1.100".to_string()),
        subnet: Some("192.168.1.0/24".to_string()),
        gateway: Some("192.168.1.1".to_string()),
        dns: Vec::new(),
        mac_address: Some(MAC.to_string()),
    }
}

/// A managed container already attached to the old subnet's macvlan network.
async fn fixture(dir: &Path) -> Fixture {
    let engine = Arc::new(MockEngine::new());
    engine.seed_container(SELF);
    engine.seed_local_image("img:latest");

    engine.seed_network(&NetworkSpec {
        name: "plc-static_internal".to_string(),
        driver: "bridge".to_string(),
        internal: true,
        ..Default::default()
    });
    engine.seed_network(&NetworkSpec {
        name: OLD_NET.to_string(),
        driver: "macvlan".to_string(),
        internal: false,
        parent: Some("ens37".to_string()),
        subnet: Some("192.168.1.0/24".to_string()),
        gateway: Some("192.168.1.1".to_string()),
    });

    engine
        .create_container(&ContainerSpec {
            name: "plc-static".to_string(),
            image: "img:latest".to_string(),
            restart_always: true,
            network: Some("plc-static_internal".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    engine
        .connect_network(
            OLD_NET,
            "plc-static",
            &EndpointSpec {
                ipv4_address: Some("192.168.1.100".to_string()),
                mac_address: Some(MAC.to_string()),
            },
        )
        .await
        .unwrap();
    engine.start_container("plc-static").await.unwrap();

    let registry = Arc::new(Registry::open(dir.join("runtime_vnics.json")));
    registry
        .put(
            "plc-static",
            ContainerRecord {
                vnics: vec![manual_vnic()],
                internal_ip: Some("172.28.0.2".to_string()),
                image: None,
            },
        )
        .await;

    let ops = Arc::new(OpsTracker::new());
    let lifecycle = Lifecycle::new(
        engine.clone(),
        registry.clone(),
        ops.clone(),
        Arc::new(InterfaceCache::new()),
        Arc::new(DeviceUsage::new()),
        LifecycleConfig {
            runtime_image: "img:latest".to_string(),
            self_container: SELF.to_string(),
            netmon_container: "autonomy_netmon".to_string(),
            shared_volume: "orchestrator-shared".to_string(),
        },
    );

    Fixture {
        engine,
        registry,
        ops,
        lifecycle,
    }
}

#[tokio::test]
async fn manual_vnic_keeps_mac_and_static_ip_across_subnet_change() {
    let dir = tempfile::tempdir().unwrap();
    let fx = fixture(dir.path()).await;

    fx.lifecycle
        .reconfigure_attachment("plc-static", "ens37", "10.0.0.0/24", Some("10.0.0.1"))
        .await
        .unwrap();

    let view = fx
        .engine
        .inspect_container("plc-static")
        .await
        .unwrap()
        .unwrap();

    // Old attachment gone, new one present.
    assert!(!view.networks.contains_key(OLD_NET));
    let endpoint = view.networks.get(NEW_NET).expect("attached to new network");

    // MAC is stable; the static IP survives literally even though it does
    // not belong to the new subnet.
    assert_eq!(endpoint.mac_address.as_deref(), Some(MAC));
    assert_eq!(endpoint.ip_address.as_deref(), Some("192.168.1.100"));

    // The internal network is untouched.
    assert!(view.networks.contains_key("plc-static_internal"));

    // The slot is idle again.
    assert!(fx.ops.in_progress("plc-static").is_none());
}

#[tokio::test]
async fn replaying_current_subnet_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let fx = fixture(dir.path()).await;

    fx.lifecycle
        .reconfigure_attachment("plc-static", "ens37", "192.168.1.0/24", Some("192.168.1.1"))
        .await
        .unwrap();

    let view = fx
        .engine
        .inspect_container("plc-static")
        .await
        .unwrap()
        .unwrap();
    assert!(view.networks.contains_key(OLD_NET));

    // Nothing new was created.
    let macvlans: Vec<_> = fx
        .engine
        .network_names()
        .into_iter()
        .filter(|n| n.starts_with("macvlan_"))
        .collect();
    assert_eq!(macvlans, vec![OLD_NET.to_string()]);
}

#[tokio::test]
async fn reconfigure_is_blocked_while_delete_holds_the_slot() {
    let dir = tempfile::tempdir().unwrap();
    let fx = fixture(dir.path()).await;

    fx.ops.begin("plc-static", OpKind::Delete).unwrap();

    let err = fx
        .lifecycle
        .reconfigure_attachment("plc-static", "ens37", "10.0.0.0/24", Some("10.0.0.1"))
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::Busy { .. }));

    // No changes were made while busy.
    let view = fx
        .engine
        .inspect_container("plc-static")
        .await
        .unwrap()
        .unwrap();
    assert!(view.networks.contains_key(OLD_NET));
}

#[tokio::test]
async fn reconfigure_unmanaged_container_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let fx = fixture(dir.path()).await;
    fx.registry.remove("plc-static").await;

    fx.lifecycle
        .reconfigure_attachment("plc-static", "ens37", "10.0.0.0/24", Some("10.0.0.1"))
        .await
        .unwrap();

    let view = fx
        .engine
        .inspect_container("plc-static")
        .await
        .unwrap()
        .unwrap();
    assert!(view.networks.contains_key(OLD_NET));
    assert!(!fx.engine.network_names().contains(&NEW_NET.to_string()));
}

#[tokio::test]
async fn reconfigure_reuses_existing_network_for_new_subnet() {
    let dir = tempfile::tempdir().unwrap();
    let fx = fixture(dir.path()).await;

    // Another macvlan network already owns the new subnet.
    fx.engine.seed_network(&NetworkSpec {
        name: "operator-made".to_string(),
        driver: "macvlan".to_string(),
        internal: false,
        parent: Some("ens37".to_string()),
        subnet: Some("10.0.0.0/24".to_string()),
        gateway: Some("10.0.0.1".to_string()),
    });

    fx.lifecycle
        .reconfigure_attachment("plc-static", "ens37", "10.0.0.0/24", Some("10.0.0.1"))
        .await
        .unwrap();

    let view = fx
        .engine
        .inspect_container("plc-static")
        .await
        .unwrap()
        .unwrap();
    assert!(view.networks.contains_key("operator-made"));
    assert!(!fx.engine.network_names().contains(&NEW_NET.to_string()));
}
