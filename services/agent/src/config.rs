use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_url: String,
    pub data_dir: PathBuf,
    pub credentials_dir: PathBuf,
    pub extra_ca_file: Option<PathBuf>,
    pub runtime_image: String,
    pub self_container: String,
    pub netmon_container: String,
    pub shared_volume: String,
    pub runtime_api_port: u16,
    pub engine_socket: Option<String>,
    pub heartbeat_interval: Duration,
    pub debounce_window: Duration,
    pub reconfigure_fanout: usize,
    pub engine_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let server_url = std::env::var("ORCH_SERVER_URL")
            .unwrap_or_else(|_| "wss://api.getedge.me/agent".to_string());

        let data_dir: PathBuf = std::env::var("ORCH_DATA_DIR")
            .unwrap_or_else(|_| "/var/orchestrator".to_string())
            .into();

        let credentials_dir: PathBuf = match std::env::var("ORCH_MTLS_DIR") {
            Ok(dir) => dir.into(),
            Err(_) => {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
                PathBuf::from(home).join(".mtls")
            }
        };

        let extra_ca_file = std::env::var("ORCH_SERVER_CA").ok().map(PathBuf::from);

        let runtime_image = std::env::var("ORCH_RUNTIME_IMAGE")
            .unwrap_or_else(|_| "ghcr.io/autonomy-logic/openplc-runtime:latest".to_string());

        let self_container = std::env::var("ORCH_SELF_CONTAINER")
            .unwrap_or_else(|_| "orchestrator-agent".to_string());

        let heartbeat_interval = Duration::from_secs(
            std::env::var("ORCH_HEARTBEAT_INTERVAL")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
        );

        let debounce_window = Duration::from_secs(
            std::env::var("ORCH_DEBOUNCE_SECONDS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
        );

        let reconfigure_fanout = std::env::var("ORCH_RECONFIGURE_FANOUT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(4);

        Ok(Self {
            server_url,
            data_dir,
            credentials_dir,
            extra_ca_file,
            runtime_image,
            self_container,
            netmon_container: "autonomy_netmon".to_string(),
            shared_volume: "orchestrator-shared".to_string(),
            runtime_api_port: 8443,
            engine_socket: std::env::var("ORCH_ENGINE_SOCKET").ok(),
            heartbeat_interval,
            debounce_window,
            reconfigure_fanout,
            engine_timeout: Duration::from_secs(30),
        })
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("runtime_vnics.json")
    }

    pub fn netmon_socket(&self) -> PathBuf {
        self.data_dir.join("netmon.sock")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn debug_dir(&self) -> PathBuf {
        self.data_dir.join("debug")
    }

    pub fn client_key_path(&self) -> PathBuf {
        self.credentials_dir.join("client.key")
    }

    pub fn client_cert_path(&self) -> PathBuf {
        self.credentials_dir.join("client.crt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_paths() {
        let config = Config {
            server_url: "wss://example.invalid/agent".to_string(),
            data_dir: "/var/orchestrator".into(),
            credentials_dir: "/home/agent/.mtls".into(),
            extra_ca_file: None,
            runtime_image: "img:latest".to_string(),
            self_container: "orchestrator-agent".to_string(),
            netmon_container: "autonomy_netmon".to_string(),
            shared_volume: "orchestrator-shared".to_string(),
            runtime_api_port: 8443,
            engine_socket: None,
            heartbeat_interval: Duration::from_secs(5),
            debounce_window: Duration::from_secs(3),
            reconfigure_fanout: 4,
            engine_timeout: Duration::from_secs(30),
        };

        assert_eq!(
            config.registry_path(),
            PathBuf::from("/var/orchestrator/runtime_vnics.json")
        );
        assert_eq!(
            config.netmon_socket(),
            PathBuf::from("/var/orchestrator/netmon.sock")
        );
        assert_eq!(
            config.client_key_path(),
            PathBuf::from("/home/agent/.mtls/client.key")
        );
    }
}
