//! HTTPS proxy for cloud-issued runtime commands.
//!
//! Forwards `run_command` requests to the runtime's API on its internal
//! network (`https://{internal_ip}:8443{api}`) and wraps the full HTTP
//! response for the reply envelope. Runtimes serve self-signed certificates,
//! so verification is disabled for this client only; it never talks to
//! anything outside the per-container internal networks.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

pub const DEFAULT_RUNTIME_PORT: u16 = 8443;

/// Cloud-supplied command to run against a runtime's API.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeCommand {
    pub method: String,
    pub api: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub params: Option<HashMap<String, String>>,
}

pub struct RuntimeProxy {
    client: reqwest::Client,
    default_port: u16,
}

impl RuntimeProxy {
    pub fn new(default_port: u16) -> Self {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            default_port,
        }
    }

    /// Execute a command against the runtime at `internal_ip`. The response
    /// is returned verbatim as `{status_code, headers, body, ok,
    /// content_type}`; transport failures map to a 502-shaped payload.
    pub async fn execute(&self, internal_ip: &str, command: &RuntimeCommand) -> Value {
        let method = match command.method.to_uppercase().parse::<Method>() {
            Ok(method) => method,
            Err(_) => {
                return error_payload(400, &format!("Unsupported method: {}", command.method))
            }
        };

        let port = command.port.unwrap_or(self.default_port);
        let api = if command.api.starts_with('/') {
            command.api.clone()
        } else {
            format!("/{}", command.api)
        };
        let url = format!("https://{internal_ip}:{port}{api}");

        debug!(method = %method, url = %url, "Proxying runtime command");

        let mut request = self.client.request(method, &url);
        for (key, value) in &command.headers {
            request = request.header(key, value);
        }
        if let Some(params) = &command.params {
            request = request.query(params);
        }
        if let Some(data) = &command.data {
            request = request.json(data);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(url = %url, error = %err, "Runtime command failed");
                return error_payload(502, &format!("Request to runtime failed: {err}"));
            }
        };

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
            .collect();

        let body_text = response.text().await.unwrap_or_default();
        let body: Value = serde_json::from_str(&body_text)
            .unwrap_or_else(|_| Value::String(body_text));

        json!({
            "status_code": status.as_u16(),
            "headers": headers,
            "body": body,
            "ok": status.is_success(),
            "content_type": content_type,
        })
    }
}

fn error_payload(status: u16, message: &str) -> Value {
    json!({
        "status_code": status,
        "headers": {},
        "body": {"error": message},
        "ok": false,
        "content_type": "application/json",
    })
}
