//! Process supervisor: wires every subsystem together and owns shutdown.
//!
//! Startup order: identity (fail fast), engine client, registry (recovering
//! persisted containers), metrics, netmon client, reconfiguration loop,
//! dispatcher registration, cloud session. On SIGTERM/SIGINT the session
//! stops first so no new commands arrive, then the reconfiguration loop
//! drains, then the remaining tasks are joined.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::config::Config;
use crate::dispatch::{AgentContext, Dispatcher};
use crate::engine::{ContainerEngine, DockerEngine};
use crate::identity::Identity;
use crate::lifecycle::{Lifecycle, LifecycleConfig};
use crate::metrics::MetricsSampler;
use crate::netmon::{InterfaceCache, NetmonClient};
use crate::ops::OpsTracker;
use crate::proxy::RuntimeProxy;
use crate::reconfig::ReconfigLoop;
use crate::registry::Registry;
use crate::session::{Outbound, Session};
use crate::usage::{DeviceUsage, UsageBuffer};

pub async fn run(config: Config) -> Result<()> {
    let identity = Identity::load(&config).context("failed to load client identity")?;

    let engine: Arc<dyn ContainerEngine> = Arc::new(
        DockerEngine::connect(config.engine_socket.as_deref(), config.engine_timeout)
            .context("failed to connect to container engine")?,
    );

    let registry = Arc::new(Registry::open(config.registry_path()));
    let interfaces = Arc::new(InterfaceCache::new());
    let device_usage = Arc::new(DeviceUsage::new());
    let metrics = Arc::new(MetricsSampler::new());

    let lifecycle = Arc::new(Lifecycle::new(
        Arc::clone(&engine),
        Arc::clone(&registry),
        Arc::new(OpsTracker::new()),
        Arc::clone(&interfaces),
        Arc::clone(&device_usage),
        LifecycleConfig::from(&config),
    ));

    // Recovered containers keep reporting consumption without a re-adopt
    // command; their internal IPs may have moved while the agent was down.
    let recovered = registry.snapshot();
    for (name, _) in &recovered {
        device_usage.add_device(name);
    }
    lifecycle.resync_internal_ips().await;
    info!(
        agent_id = identity.agent_id(),
        recovered = recovered.len(),
        "Agent initialized"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (change_tx, change_rx) = mpsc::channel(64);
    let netmon = NetmonClient::new(config.netmon_socket(), Arc::clone(&interfaces), change_tx);
    let netmon_task = tokio::spawn(netmon.run(shutdown_rx.clone()));

    let reconfig = ReconfigLoop::new(
        Arc::clone(&lifecycle),
        Arc::clone(&registry),
        change_rx,
        config.debounce_window,
        config.reconfigure_fanout,
    );
    let reconfig_task = tokio::spawn(reconfig.run(shutdown_rx.clone()));

    let (outbound_tx, outbound_rx) = mpsc::channel(64);
    let ctx = Arc::new(AgentContext {
        agent_id: identity.agent_id().to_string(),
        lifecycle,
        registry,
        interfaces,
        metrics,
        agent_usage: Arc::new(Mutex::new(UsageBuffer::new())),
        device_usage,
        proxy: Arc::new(RuntimeProxy::new(config.runtime_api_port)),
        outbound: Outbound::new(outbound_tx),
        heartbeat_interval: config.heartbeat_interval,
    });

    let mut dispatcher = Dispatcher::new(ctx);
    dispatcher.register_default_topics();
    let dispatcher = Arc::new(dispatcher);

    let session = Session::new(
        config.server_url.clone(),
        identity.client_config(),
        dispatcher,
        outbound_rx,
    );
    let session_task = tokio::spawn(session.run(shutdown_rx));

    wait_for_signal().await;
    info!("Shutdown signal received");

    // Stop accepting commands first, then drain reconfiguration work.
    let _ = shutdown_tx.send(true);
    session_task.await.context("session task panicked")?;
    reconfig_task.await.context("reconfiguration task panicked")?;
    netmon_task.await.context("netmon task panicked")?;

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
