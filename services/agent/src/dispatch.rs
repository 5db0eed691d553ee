//! Cloud command dispatcher.
//!
//! Handlers are registered as `(topic, schema, handler)` entries at startup.
//! Every inbound payload is validated against its topic schema before the
//! handler runs; invalid messages are answered with the validator's field
//! path and never reach a handler. Replies always echo the request's
//! `correlation_id` and carry `action` = topic.
//!
//! Long-running operations (create/delete/self-removal) acknowledge
//! immediately and continue in a background task so the inbound stream is
//! never starved.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vplc_contract::{base_device, base_message, validate, Schema, TypeSpec};

use crate::engine::DeviceAttachment;
use crate::lifecycle::{CreateAdmission, DeleteAdmission, Lifecycle};
use crate::metrics::MetricsSampler;
use crate::netmon::{is_physical_interface, InterfaceCache};
use crate::ops::OpPhase;
use crate::proxy::{RuntimeCommand, RuntimeProxy};
use crate::registry::{Registry, VnicConfig};
use crate::session::Outbound;
use crate::telemetry;
use crate::usage::{parse_period, DeviceUsage, UsageBuffer, UsageSample};

// =============================================================================
// Topics
// =============================================================================

pub mod topics {
    pub const CREATE_NEW_RUNTIME: &str = "create_new_runtime";
    pub const DELETE_DEVICE: &str = "delete_device";
    pub const DELETE_ORCHESTRATOR: &str = "delete_orchestrator";
    pub const RUN_COMMAND: &str = "run_command";
    pub const GET_CONSUMPTION_DEVICE: &str = "get_consumption_device";
    pub const GET_CONSUMPTION_ORCHESTRATOR: &str = "get_consumption_orchestrator";
    pub const GET_DEVICE_STATUS: &str = "get_device_status";
    pub const GET_HOST_INTERFACES: &str = "get_host_interfaces";
    pub const START_DEVICE: &str = "start_device";
    pub const STOP_DEVICE: &str = "stop_device";
    pub const RESTART_DEVICE: &str = "restart_device";
    pub const HEARTBEAT: &str = "heartbeat";
}

// =============================================================================
// Context
// =============================================================================

/// Everything topic handlers operate on.
pub struct AgentContext {
    pub agent_id: String,
    pub lifecycle: Arc<Lifecycle>,
    pub registry: Arc<Registry>,
    pub interfaces: Arc<InterfaceCache>,
    pub metrics: Arc<MetricsSampler>,
    pub agent_usage: Arc<Mutex<UsageBuffer>>,
    pub device_usage: Arc<DeviceUsage>,
    pub proxy: Arc<RuntimeProxy>,
    pub outbound: Outbound,
    pub heartbeat_interval: Duration,
}

// =============================================================================
// Dispatcher
// =============================================================================

type HandlerFuture = BoxFuture<'static, Option<Value>>;
type HandlerFn = Arc<dyn Fn(Arc<AgentContext>, Value) -> HandlerFuture + Send + Sync>;

struct TopicEntry {
    schema: Option<Schema>,
    handler: HandlerFn,
}

pub struct Dispatcher {
    ctx: Arc<AgentContext>,
    handlers: HashMap<String, TopicEntry>,
    emitter: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self {
            ctx,
            handlers: HashMap::new(),
            emitter: Mutex::new(None),
        }
    }

    /// Register a topic handler. Open for extension: additional subsystems
    /// (e.g. peer-to-peer signaling) add their topics the same way.
    pub fn register<F, Fut>(&mut self, topic: &str, schema: Option<Schema>, handler: F)
    where
        F: Fn(Arc<AgentContext>, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Option<Value>> + Send + 'static,
    {
        let handler: HandlerFn = Arc::new(move |ctx, payload| Box::pin(handler(ctx, payload)));
        self.handlers
            .insert(topic.to_string(), TopicEntry { schema, handler });
    }

    /// Register every core topic.
    pub fn register_default_topics(&mut self) {
        use topics::*;

        self.register(CREATE_NEW_RUNTIME, Some(create_runtime_schema()), create_new_runtime);
        self.register(DELETE_DEVICE, Some(base_device()), delete_device);
        self.register(DELETE_ORCHESTRATOR, Some(base_message()), delete_orchestrator);
        self.register(RUN_COMMAND, Some(run_command_schema()), run_command);
        self.register(
            GET_CONSUMPTION_DEVICE,
            Some(consumption_device_schema()),
            get_consumption_device,
        );
        self.register(
            GET_CONSUMPTION_ORCHESTRATOR,
            Some(consumption_orchestrator_schema()),
            get_consumption_orchestrator,
        );
        self.register(GET_DEVICE_STATUS, Some(base_device()), get_device_status);
        self.register(
            GET_HOST_INTERFACES,
            Some(host_interfaces_schema()),
            get_host_interfaces,
        );
        self.register(START_DEVICE, Some(base_device()), start_device);
        self.register(STOP_DEVICE, Some(base_device()), stop_device);
        self.register(RESTART_DEVICE, Some(base_device()), restart_device);
    }

    /// Validate and route one inbound message. Returns the reply to emit.
    pub async fn dispatch(&self, topic: &str, payload: Value) -> Option<Value> {
        let Some(entry) = self.handlers.get(topic) else {
            warn!(topic, "Unknown topic");
            return Some(error_reply(topic, &correlation(&payload), "unknown_topic", None));
        };

        if let Some(schema) = &entry.schema {
            if let Err(err) = validate(schema, &payload) {
                warn!(topic, error = %err, "Inbound message failed validation");
                return Some(error_reply(
                    topic,
                    &correlation(&payload),
                    "validation_error",
                    Some(&err.to_string()),
                ));
            }
        }

        debug!(topic, "Dispatching message");
        (entry.handler)(Arc::clone(&self.ctx), payload).await
    }

    /// Session connected: start the telemetry emitter if it is not running.
    pub fn on_connect(&self) {
        let mut emitter = self.emitter.lock().unwrap_or_else(|e| e.into_inner());
        let running = emitter.as_ref().map(|h| !h.is_finished()).unwrap_or(false);
        if running {
            return;
        }
        info!("Connection established, starting telemetry emitter");
        *emitter = Some(tokio::spawn(telemetry::run(Arc::clone(&self.ctx))));
    }

    /// Session dropped: stop the emitter; the next connect restarts it with
    /// fresh state.
    pub fn on_disconnect(&self) {
        let mut emitter = self.emitter.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = emitter.take() {
            handle.abort();
            info!("Connection lost, telemetry emitter stopped");
        }
    }
}

// =============================================================================
// Schemas
// =============================================================================

fn vnic_schema() -> Schema {
    Schema::new()
        .field("name", TypeSpec::String)
        .field("parent_interface", TypeSpec::String)
        .field("network_mode", TypeSpec::Optional(Box::new(TypeSpec::String)))
        .field("parent_subnet", TypeSpec::Optional(Box::new(TypeSpec::String)))
        .field("parent_gateway", TypeSpec::Optional(Box::new(TypeSpec::String)))
        .field("ip_address", TypeSpec::Optional(Box::new(TypeSpec::String)))
        .field("subnet", TypeSpec::Optional(Box::new(TypeSpec::String)))
        .field("gateway", TypeSpec::Optional(Box::new(TypeSpec::String)))
        .field(
            "dns",
            TypeSpec::Optional(Box::new(TypeSpec::List(Box::new(TypeSpec::String)))),
        )
        .field("mac_address", TypeSpec::Optional(Box::new(TypeSpec::String)))
}

fn device_schema() -> Schema {
    Schema::new()
        .field("host_path", TypeSpec::String)
        .field("container_path", TypeSpec::String)
        .field("permissions", TypeSpec::Optional(Box::new(TypeSpec::String)))
}

fn create_runtime_schema() -> Schema {
    base_message()
        .field("container_name", TypeSpec::String)
        .field("container_image", TypeSpec::Optional(Box::new(TypeSpec::String)))
        .field(
            "vnic_configs",
            TypeSpec::List(Box::new(TypeSpec::Object(vnic_schema()))),
        )
        .field(
            "devices",
            TypeSpec::Optional(Box::new(TypeSpec::List(Box::new(TypeSpec::Object(
                device_schema(),
            ))))),
        )
}

fn run_command_schema() -> Schema {
    base_device().field(
        "command",
        TypeSpec::Object(
            Schema::new()
                .field("method", TypeSpec::String)
                .field("api", TypeSpec::String)
                .field("port", TypeSpec::Optional(Box::new(TypeSpec::Number))),
        ),
    )
}

fn consumption_device_schema() -> Schema {
    base_device()
        .field("cpuPeriod", TypeSpec::String)
        .field("memoryPeriod", TypeSpec::String)
}

fn consumption_orchestrator_schema() -> Schema {
    base_message()
        .field("cpuPeriod", TypeSpec::Optional(Box::new(TypeSpec::String)))
        .field("memoryPeriod", TypeSpec::Optional(Box::new(TypeSpec::String)))
}

fn host_interfaces_schema() -> Schema {
    base_message()
        .field("include_virtual", TypeSpec::Optional(Box::new(TypeSpec::Boolean)))
        .field("detailed", TypeSpec::Optional(Box::new(TypeSpec::Boolean)))
}

// =============================================================================
// Reply helpers
// =============================================================================

fn correlation(payload: &Value) -> Value {
    payload.get("correlation_id").cloned().unwrap_or(Value::Null)
}

fn reply_base(action: &str, correlation_id: &Value) -> serde_json::Map<String, Value> {
    let mut map = serde_json::Map::new();
    map.insert("action".to_string(), Value::String(action.to_string()));
    map.insert("correlation_id".to_string(), correlation_id.clone());
    map
}

fn ok_reply(action: &str, correlation_id: &Value) -> serde_json::Map<String, Value> {
    let mut map = reply_base(action, correlation_id);
    map.insert("status".to_string(), Value::String("success".to_string()));
    map
}

fn error_reply(action: &str, correlation_id: &Value, kind: &str, message: Option<&str>) -> Value {
    let mut map = reply_base(action, correlation_id);
    map.insert("status".to_string(), Value::String("error".to_string()));
    map.insert("error".to_string(), Value::String(kind.to_string()));
    if let Some(message) = message {
        map.insert("message".to_string(), Value::String(message.to_string()));
    }
    Value::Object(map)
}

fn device_id_of(payload: &Value) -> String {
    payload
        .get("device_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn series_reply(samples: &[UsageSample]) -> (Value, Value) {
    let cpu: Vec<Value> = samples
        .iter()
        .map(|s| json!({"registered_at": iso(s.timestamp), "cpu": s.cpu}))
        .collect();
    let memory: Vec<Value> = samples
        .iter()
        .map(|s| json!({"registered_at": iso(s.timestamp), "memory": s.memory_mb}))
        .collect();
    (Value::Array(cpu), Value::Array(memory))
}

fn iso(timestamp: i64) -> String {
    chrono::DateTime::from_timestamp(timestamp, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

// =============================================================================
// Handlers
// =============================================================================

async fn create_new_runtime(ctx: Arc<AgentContext>, payload: Value) -> Option<Value> {
    let action = topics::CREATE_NEW_RUNTIME;
    let corr = correlation(&payload);

    let name = payload
        .get("container_name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if name.trim().is_empty() {
        return Some(error_reply(
            action,
            &corr,
            "validation_error",
            Some("container_name must be a non-empty string"),
        ));
    }

    let image = payload
        .get("container_image")
        .and_then(Value::as_str)
        .map(str::to_string);

    let vnics: Vec<VnicConfig> =
        match serde_json::from_value(payload.get("vnic_configs").cloned().unwrap_or_default()) {
            Ok(vnics) => vnics,
            Err(err) => {
                return Some(error_reply(
                    action,
                    &corr,
                    "validation_error",
                    Some(&format!("vnic_configs: {err}")),
                ))
            }
        };

    for vnic in &vnics {
        if let Some(field) = vnic.missing_manual_field() {
            return Some(error_reply(
                action,
                &corr,
                "validation_error",
                Some(&format!("vNIC {}: manual mode requires {field}", vnic.name)),
            ));
        }
    }

    let devices: Vec<DeviceAttachment> = payload
        .get("devices")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .ok()
        .flatten()
        .unwrap_or_default();

    match ctx.lifecycle.begin_create(&name, &vnics) {
        Ok(CreateAdmission::Started) => {
            info!(container = %name, vnics = vnics.len(), "Creating runtime container");
            let lifecycle = Arc::clone(&ctx.lifecycle);
            let task_name = name.clone();
            tokio::spawn(async move {
                // Outcome is observable through get_device_status; errors are
                // tracked on the operation slot.
                let _ = lifecycle
                    .create_runtime(&task_name, image, vnics, devices)
                    .await;
            });

            let mut reply = reply_base(action, &corr);
            reply.insert("status".to_string(), json!("creating"));
            reply.insert("container_id".to_string(), json!(name));
            Some(Value::Object(reply))
        }
        Ok(CreateAdmission::AlreadyExists(record)) => {
            let mut reply = ok_reply(action, &corr);
            reply.insert("container_id".to_string(), json!(name));
            reply.insert("already_exists".to_string(), json!(true));
            if let Some(ip) = record.internal_ip {
                reply.insert("internal_ip".to_string(), json!(ip));
            }
            Some(Value::Object(reply))
        }
        Err(err) => Some(error_reply(action, &corr, err.kind(), Some(&err.to_string()))),
    }
}

async fn delete_device(ctx: Arc<AgentContext>, payload: Value) -> Option<Value> {
    let action = topics::DELETE_DEVICE;
    let corr = correlation(&payload);
    let device_id = device_id_of(&payload);

    match ctx.lifecycle.begin_delete(&device_id).await {
        Ok(DeleteAdmission::AlreadyAbsent) => {
            let mut reply = ok_reply(action, &corr);
            reply.insert("device_id".to_string(), json!(device_id));
            reply.insert("result".to_string(), json!("already_absent"));
            Some(Value::Object(reply))
        }
        Ok(DeleteAdmission::Started) => {
            info!(container = %device_id, "Deleting runtime container");
            let lifecycle = Arc::clone(&ctx.lifecycle);
            let name = device_id.clone();
            tokio::spawn(async move {
                let _ = lifecycle.delete_runtime(&name).await;
            });

            let mut reply = reply_base(action, &corr);
            reply.insert("status".to_string(), json!("deleting"));
            reply.insert("device_id".to_string(), json!(device_id));
            Some(Value::Object(reply))
        }
        Err(err) => Some(error_reply(action, &corr, err.kind(), Some(&err.to_string()))),
    }
}

async fn delete_orchestrator(ctx: Arc<AgentContext>, payload: Value) -> Option<Value> {
    let action = topics::DELETE_ORCHESTRATOR;
    let corr = correlation(&payload);

    warn!("Received delete_orchestrator command");
    let lifecycle = Arc::clone(&ctx.lifecycle);
    tokio::spawn(async move {
        if let Err(err) = lifecycle.self_destruct().await {
            error!(error = %err, "Self-destruct failed");
        }
    });

    let mut reply = reply_base(action, &corr);
    reply.insert("status".to_string(), json!("command_received"));
    Some(Value::Object(reply))
}

async fn run_command(ctx: Arc<AgentContext>, payload: Value) -> Option<Value> {
    let action = topics::RUN_COMMAND;
    let corr = correlation(&payload);
    let device_id = device_id_of(&payload);

    let Some(internal_ip) = ctx.registry.internal_ip(&device_id) else {
        return Some(error_reply(
            action,
            &corr,
            "unknown_device",
            Some(&format!("No managed runtime named {device_id}")),
        ));
    };

    let command: RuntimeCommand =
        match serde_json::from_value(payload.get("command").cloned().unwrap_or_default()) {
            Ok(command) => command,
            Err(err) => {
                return Some(error_reply(
                    action,
                    &corr,
                    "validation_error",
                    Some(&format!("command: {err}")),
                ))
            }
        };

    let response = ctx.proxy.execute(&internal_ip, &command).await;

    let mut reply = ok_reply(action, &corr);
    reply.insert("device_id".to_string(), json!(device_id));
    if let Value::Object(fields) = response {
        for (key, value) in fields {
            reply.insert(key, value);
        }
    }
    Some(Value::Object(reply))
}

async fn get_consumption_device(ctx: Arc<AgentContext>, payload: Value) -> Option<Value> {
    let action = topics::GET_CONSUMPTION_DEVICE;
    let corr = correlation(&payload);
    let device_id = device_id_of(&payload);

    let cpu_period = payload
        .get("cpuPeriod")
        .and_then(Value::as_str)
        .unwrap_or("1h");
    let memory_period = payload
        .get("memoryPeriod")
        .and_then(Value::as_str)
        .unwrap_or("1h");

    let (cpu_start, cpu_end) = parse_period(cpu_period);
    let (mem_start, mem_end) = parse_period(memory_period);

    let (cpu_usage, _) = series_reply(&ctx.device_usage.between(&device_id, cpu_start, cpu_end));
    let (_, memory_usage) = series_reply(&ctx.device_usage.between(&device_id, mem_start, mem_end));

    let mut reply = ok_reply(action, &corr);
    reply.insert("device_id".to_string(), json!(device_id));
    reply.insert("cpu_usage".to_string(), cpu_usage);
    reply.insert("memory_usage".to_string(), memory_usage);
    Some(Value::Object(reply))
}

async fn get_consumption_orchestrator(ctx: Arc<AgentContext>, payload: Value) -> Option<Value> {
    let action = topics::GET_CONSUMPTION_ORCHESTRATOR;
    let corr = correlation(&payload);

    let cpu_period = payload
        .get("cpuPeriod")
        .and_then(Value::as_str)
        .unwrap_or("1h");
    let memory_period = payload
        .get("memoryPeriod")
        .and_then(Value::as_str)
        .unwrap_or("1h");

    let (cpu_start, cpu_end) = parse_period(cpu_period);
    let (mem_start, mem_end) = parse_period(memory_period);

    let buffer = ctx.agent_usage.lock().unwrap_or_else(|e| e.into_inner());
    let (cpu_usage, _) = series_reply(&buffer.between(cpu_start, cpu_end));
    let (_, memory_usage) = series_reply(&buffer.between(mem_start, mem_end));
    drop(buffer);

    let mut reply = ok_reply(action, &corr);
    reply.insert("agent_id".to_string(), json!(ctx.agent_id));
    reply.insert(
        "memory".to_string(),
        json!(ctx.metrics.memory_total_bytes() / (1024 * 1024)),
    );
    reply.insert("cpu_usage".to_string(), cpu_usage);
    reply.insert("memory_usage".to_string(), memory_usage);
    Some(Value::Object(reply))
}

async fn get_device_status(ctx: Arc<AgentContext>, payload: Value) -> Option<Value> {
    let action = topics::GET_DEVICE_STATUS;
    let corr = correlation(&payload);
    let device_id = device_id_of(&payload);

    if device_id.trim().is_empty() {
        return Some(error_reply(
            action,
            &corr,
            "validation_error",
            Some("device_id must be a non-empty string"),
        ));
    }

    // A tracked operation (active or failed) wins over an engine snapshot.
    if let Some(state) = ctx.lifecycle.ops().state(&device_id) {
        let mut reply = reply_base(action, &corr);
        let status = match state.phase {
            OpPhase::Active => state.op.status_str().to_string(),
            OpPhase::Failed => "error".to_string(),
        };
        reply.insert("status".to_string(), json!(status));
        reply.insert("device_id".to_string(), json!(device_id));
        reply.insert("operation".to_string(), json!(state.op.as_str()));
        reply.insert("started_at".to_string(), json!(state.started_at.to_rfc3339()));
        reply.insert("updated_at".to_string(), json!(state.updated_at.to_rfc3339()));
        if let Some(step) = state.step {
            reply.insert("step".to_string(), json!(step));
        }
        if let Some(error) = state.error {
            reply.insert("message".to_string(), json!(format!("Operation failed: {error}")));
            reply.insert("error".to_string(), json!(error));
        }
        return Some(Value::Object(reply));
    }

    match ctx.lifecycle.inspect_device(&device_id).await {
        Ok(None) => {
            let mut reply = reply_base(action, &corr);
            reply.insert("status".to_string(), json!("not_found"));
            reply.insert("device_id".to_string(), json!(device_id));
            reply.insert(
                "message".to_string(),
                json!(format!("Container {device_id} does not exist")),
            );
            Some(Value::Object(reply))
        }
        Ok(Some(status)) => {
            let view = status.view;
            let networks: serde_json::Map<String, Value> = view
                .networks
                .iter()
                .map(|(name, endpoint)| {
                    (
                        name.clone(),
                        json!({
                            "ip_address": endpoint.ip_address,
                            "mac_address": endpoint.mac_address,
                            "gateway": endpoint.gateway,
                        }),
                    )
                })
                .collect();

            let mut reply = ok_reply(action, &corr);
            reply.insert("device_id".to_string(), json!(device_id));
            reply.insert("container_status".to_string(), json!(view.state));
            reply.insert("is_running".to_string(), json!(view.running));
            reply.insert("networks".to_string(), Value::Object(networks));
            reply.insert("restart_count".to_string(), json!(view.restart_count));
            if let Some(internal_ip) = status.internal_ip {
                reply.insert("internal_ip".to_string(), json!(internal_ip));
            }
            if let Some(started_at) = view.started_at {
                let uptime = (chrono::Utc::now() - started_at).num_seconds().max(0);
                reply.insert("uptime_seconds".to_string(), json!(uptime));
            }
            if let Some(exit_code) = view.exit_code {
                reply.insert("exit_code".to_string(), json!(exit_code));
            }
            Some(Value::Object(reply))
        }
        Err(err) => Some(error_reply(action, &corr, "engine_error", Some(&err.to_string()))),
    }
}

async fn get_host_interfaces(ctx: Arc<AgentContext>, payload: Value) -> Option<Value> {
    let action = topics::GET_HOST_INTERFACES;
    let corr = correlation(&payload);

    let include_virtual = payload
        .get("include_virtual")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let detailed = payload
        .get("detailed")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    let interfaces: Vec<Value> = ctx
        .interfaces
        .snapshot()
        .into_iter()
        .filter(|state| include_virtual || is_physical_interface(&state.interface))
        .map(|state| {
            let addresses: Vec<&str> = state
                .ipv4_addresses
                .iter()
                .map(|a| a.address.as_str())
                .collect();
            let mut entry = json!({
                "interface": state.interface,
                "operstate": state.operstate,
                "ip_addresses": addresses,
            });
            if detailed {
                entry["subnet"] = json!(state.primary_subnet());
                entry["gateway"] = json!(state.gateway);
            }
            entry
        })
        .collect();

    let mut reply = ok_reply(action, &corr);
    reply.insert("count".to_string(), json!(interfaces.len()));
    reply.insert("interfaces".to_string(), Value::Array(interfaces));
    Some(Value::Object(reply))
}

async fn start_device(ctx: Arc<AgentContext>, payload: Value) -> Option<Value> {
    passthrough(ctx, payload, topics::START_DEVICE).await
}

async fn stop_device(ctx: Arc<AgentContext>, payload: Value) -> Option<Value> {
    passthrough(ctx, payload, topics::STOP_DEVICE).await
}

async fn restart_device(ctx: Arc<AgentContext>, payload: Value) -> Option<Value> {
    passthrough(ctx, payload, topics::RESTART_DEVICE).await
}

async fn passthrough(ctx: Arc<AgentContext>, payload: Value, action: &str) -> Option<Value> {
    let corr = correlation(&payload);
    let device_id = device_id_of(&payload);

    let result = match action {
        topics::START_DEVICE => ctx.lifecycle.start_device(&device_id).await,
        topics::STOP_DEVICE => ctx.lifecycle.stop_device(&device_id).await,
        _ => ctx.lifecycle.restart_device(&device_id).await,
    };

    match result {
        Ok(()) => {
            let mut reply = ok_reply(action, &corr);
            reply.insert("device_id".to_string(), json!(device_id));
            reply.insert("success".to_string(), json!(true));
            Some(Value::Object(reply))
        }
        Err(err) => Some(error_reply(action, &corr, err.kind(), Some(&err.to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockEngine;
    use crate::lifecycle::LifecycleConfig;
    use crate::ops::OpsTracker;
    use crate::session::Envelope;
    use tokio::sync::mpsc;

    fn test_dispatcher(dir: &std::path::Path) -> (Dispatcher, mpsc::Receiver<Envelope>) {
        let engine = Arc::new(MockEngine::new());
        engine.seed_container("orchestrator-agent");
        engine.seed_local_image("img:latest");

        let registry = Arc::new(Registry::open(dir.join("runtime_vnics.json")));
        let interfaces = Arc::new(InterfaceCache::new());
        let device_usage = Arc::new(DeviceUsage::new());
        let lifecycle = Arc::new(Lifecycle::new(
            engine,
            registry.clone(),
            Arc::new(OpsTracker::new()),
            interfaces.clone(),
            device_usage.clone(),
            LifecycleConfig {
                runtime_image: "img:latest".to_string(),
                self_container: "orchestrator-agent".to_string(),
                netmon_container: "autonomy_netmon".to_string(),
                shared_volume: "orchestrator-shared".to_string(),
            },
        ));

        let (tx, rx) = mpsc::channel(16);
        let ctx = Arc::new(AgentContext {
            agent_id: "agent-test".to_string(),
            lifecycle,
            registry,
            interfaces,
            metrics: Arc::new(MetricsSampler::new()),
            agent_usage: Arc::new(Mutex::new(UsageBuffer::new())),
            device_usage,
            proxy: Arc::new(RuntimeProxy::new(8443)),
            outbound: Outbound::new(tx),
            heartbeat_interval: Duration::from_secs(5),
        });

        let mut dispatcher = Dispatcher::new(ctx);
        dispatcher.register_default_topics();
        (dispatcher, rx)
    }

    #[tokio::test]
    async fn test_unknown_topic_is_nacked() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _rx) = test_dispatcher(dir.path());

        let reply = dispatcher
            .dispatch("launch_missiles", json!({"correlation_id": 7}))
            .await
            .unwrap();
        assert_eq!(reply["status"], "error");
        assert_eq!(reply["error"], "unknown_topic");
        assert_eq!(reply["correlation_id"], 7);
        assert_eq!(reply["action"], "launch_missiles");
    }

    #[tokio::test]
    async fn test_validation_failure_never_reaches_handler() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _rx) = test_dispatcher(dir.path());

        // device_id is required for delete_device.
        let reply = dispatcher
            .dispatch(topics::DELETE_DEVICE, json!({"correlation_id": 1}))
            .await
            .unwrap();
        assert_eq!(reply["status"], "error");
        assert_eq!(reply["error"], "validation_error");
        assert!(reply["message"].as_str().unwrap().contains("device_id"));
    }

    #[tokio::test]
    async fn test_create_acks_immediately_with_creating() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _rx) = test_dispatcher(dir.path());

        let reply = dispatcher
            .dispatch(
                topics::CREATE_NEW_RUNTIME,
                json!({
                    "correlation_id": 12345,
                    "container_name": "plc-001",
                    "vnic_configs": [{
                        "name": "eth0",
                        "parent_interface": "ens37",
                        "network_mode": "dhcp",
                        "parent_subnet": "192.168.1.0/24",
                        "parent_gateway": "192.168.1.1"
                    }]
                }),
            )
            .await
            .unwrap();

        assert_eq!(reply["action"], "create_new_runtime");
        assert_eq!(reply["correlation_id"], 12345);
        assert_eq!(reply["status"], "creating");
        assert_eq!(reply["container_id"], "plc-001");
    }

    #[tokio::test]
    async fn test_delete_absent_device_is_already_absent() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _rx) = test_dispatcher(dir.path());

        let reply = dispatcher
            .dispatch(
                topics::DELETE_DEVICE,
                json!({"correlation_id": 2, "device_id": "nope"}),
            )
            .await
            .unwrap();
        assert_eq!(reply["status"], "success");
        assert_eq!(reply["result"], "already_absent");
    }

    #[tokio::test]
    async fn test_device_status_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _rx) = test_dispatcher(dir.path());

        let reply = dispatcher
            .dispatch(
                topics::GET_DEVICE_STATUS,
                json!({"correlation_id": 3, "device_id": "ghost"}),
            )
            .await
            .unwrap();
        assert_eq!(reply["status"], "not_found");
        assert_eq!(reply["device_id"], "ghost");
    }

    #[tokio::test]
    async fn test_consumption_orchestrator_series() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _rx) = test_dispatcher(dir.path());

        let reply = dispatcher
            .dispatch(
                topics::GET_CONSUMPTION_ORCHESTRATOR,
                json!({"correlation_id": 4, "cpuPeriod": "1h", "memoryPeriod": "1h"}),
            )
            .await
            .unwrap();
        assert_eq!(reply["status"], "success");
        assert_eq!(reply["agent_id"], "agent-test");
        assert!(reply["cpu_usage"].is_array());
        assert!(reply["memory_usage"].is_array());
    }

    #[tokio::test]
    async fn test_run_command_unknown_device() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _rx) = test_dispatcher(dir.path());

        let reply = dispatcher
            .dispatch(
                topics::RUN_COMMAND,
                json!({
                    "correlation_id": 5,
                    "device_id": "nope",
                    "command": {"method": "GET", "api": "/api/status"}
                }),
            )
            .await
            .unwrap();
        assert_eq!(reply["status"], "error");
        assert_eq!(reply["error"], "unknown_device");
    }

    #[tokio::test]
    async fn test_host_interfaces_filters_virtual() {
        use crate::netmon::{InterfaceState, Ipv4Address};

        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _rx) = test_dispatcher(dir.path());

        for name in ["ens37", "docker0"] {
            dispatcher.ctx.interfaces.upsert(InterfaceState {
                interface: name.to_string(),
                index: 2,
                operstate: "UP".to_string(),
                ipv4_addresses: vec![Ipv4Address {
                    address: "192.168.1.10".to_string(),
                    prefixlen: 24,
                    subnet: "192.168.1.0/24".to_string(),
                    network_address: None,
                }],
                gateway: Some("192.168.1.1".to_string()),
                timestamp: None,
            });
        }

        let reply = dispatcher
            .dispatch(topics::GET_HOST_INTERFACES, json!({"correlation_id": 6}))
            .await
            .unwrap();
        assert_eq!(reply["count"], 1);
        assert_eq!(reply["interfaces"][0]["interface"], "ens37");

        let reply = dispatcher
            .dispatch(
                topics::GET_HOST_INTERFACES,
                json!({"correlation_id": 7, "include_virtual": true}),
            )
            .await
            .unwrap();
        assert_eq!(reply["count"], 2);
    }
}
