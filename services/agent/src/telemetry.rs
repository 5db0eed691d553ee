//! Heartbeat emitter.
//!
//! Runs only while the cloud session is connected (started by the
//! dispatcher's connect hook, aborted on disconnect). Every tick samples the
//! host, feeds the usage ring buffers for the agent and every managed
//! container, and emits the heartbeat topic. A failed sample skips one tick;
//! a dropped emit is fine because the next heartbeat carries fresh state.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

use crate::dispatch::{topics, AgentContext};

pub async fn run(ctx: Arc<AgentContext>) {
    let mut interval = tokio::time::interval(ctx.heartbeat_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; heartbeats start one interval in.
    interval.tick().await;

    loop {
        interval.tick().await;

        let snapshot = ctx.metrics.snapshot();

        {
            let mut buffer = ctx.agent_usage.lock().unwrap_or_else(|e| e.into_inner());
            buffer.push(snapshot.cpu_usage_percent, snapshot.memory_used_gb * 1024.0);
        }

        sample_devices(&ctx).await;

        let payload = json!({
            "agent_id": ctx.agent_id,
            "cpu_usage": snapshot.cpu_usage_percent,
            "memory_usage": snapshot.memory_used_gb,
            "memory_total": snapshot.memory_total_gb,
            "disk_usage": snapshot.disk_used_gb,
            "disk_total": snapshot.disk_total_gb,
            "uptime": snapshot.uptime_seconds,
            "status": "online",
            "timestamp": Utc::now().to_rfc3339(),
        });

        if ctx.outbound.emit(topics::HEARTBEAT, payload) {
            debug!(
                cpu = snapshot.cpu_usage_percent,
                memory_gb = snapshot.memory_used_gb,
                "Heartbeat emitted"
            );
        } else {
            debug!("Session outbound unavailable, heartbeat dropped");
        }
    }
}

/// Record one usage sample per managed container.
async fn sample_devices(ctx: &Arc<AgentContext>) {
    let engine = Arc::clone(ctx.lifecycle.engine());
    for device_id in ctx.device_usage.device_ids() {
        match engine.container_usage(&device_id).await {
            Ok(Some(usage)) => {
                ctx.device_usage
                    .record(&device_id, usage.cpu_percent, usage.memory_mb);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(device_id = %device_id, error = %err, "Could not sample container usage");
            }
        }
    }
}
