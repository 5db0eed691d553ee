//! Persisted registry of managed containers and their vNIC configurations.
//!
//! The in-memory map is authoritative; it is mirrored to a JSON file so the
//! agent can recover managed containers after a restart. Writes are atomic
//! (sibling temp file + rename), so readers always observe either the pre-
//! or the post-image. A corrupt file is quarantined, never deleted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to write registry file: {0}")]
    Write(#[from] std::io::Error),

    #[error("failed to encode registry: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Addressing mode of a virtual NIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    #[default]
    Dhcp,
    Manual,
}

/// Persisted intent describing how a container attaches to one host parent
/// interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VnicConfig {
    pub name: String,
    pub parent_interface: String,
    #[serde(default)]
    pub network_mode: NetworkMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_subnet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

impl VnicConfig {
    /// Manual-mode vNICs must carry their full static addressing.
    pub fn missing_manual_field(&self) -> Option<&'static str> {
        if self.network_mode != NetworkMode::Manual {
            return None;
        }
        if self.ip_address.is_none() {
            Some("ip_address")
        } else if self.subnet.is_none() {
            Some("subnet")
        } else if self.gateway.is_none() {
            Some("gateway")
        } else {
            None
        }
    }
}

/// One managed container: its vNIC intents plus the fingerprint the agent
/// keeps for control-plane traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ContainerRecord {
    #[serde(default)]
    pub vnics: Vec<VnicConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Authoritative in-memory map of managed containers, mirrored to disk.
pub struct Registry {
    path: PathBuf,
    entries: Mutex<HashMap<String, ContainerRecord>>,
    // Serializes writers so persisted images never interleave.
    persist: tokio::sync::Mutex<()>,
}

impl Registry {
    /// Load the registry from `path`.
    ///
    /// A missing file yields an empty registry. A corrupt file is renamed to
    /// `<path>.corrupt-<unix-ts>` with a warning and a fresh registry starts.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match load_entries(&path) {
            Ok(entries) => entries,
            Err(err) => {
                let quarantine = quarantine_path(&path);
                warn!(
                    path = %path.display(),
                    quarantine = %quarantine.display(),
                    error = %err,
                    "Registry file is corrupt, quarantining and starting empty"
                );
                if let Err(rename_err) = std::fs::rename(&path, &quarantine) {
                    warn!(error = %rename_err, "Failed to quarantine corrupt registry file");
                }
                HashMap::new()
            }
        };

        debug!(
            path = %path.display(),
            containers = entries.len(),
            "Registry loaded"
        );

        Self {
            path,
            entries: Mutex::new(entries),
            persist: tokio::sync::Mutex::new(()),
        }
    }

    pub fn get(&self, name: &str) -> Option<ContainerRecord> {
        self.lock().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Stable-order snapshot for background reconciliation.
    pub fn snapshot(&self) -> Vec<(String, ContainerRecord)> {
        let mut entries: Vec<_> = self
            .lock()
            .iter()
            .map(|(name, record)| (name.clone(), record.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Upsert and persist. Persistence failures degrade to a warning: the
    /// in-memory state stays authoritative and the next write retries.
    pub async fn put(&self, name: &str, record: ContainerRecord) {
        let _guard = self.persist.lock().await;
        let image = {
            let mut entries = self.lock();
            entries.insert(name.to_string(), record);
            entries.clone()
        };
        self.write_image(image).await;
    }

    pub async fn remove(&self, name: &str) {
        let _guard = self.persist.lock().await;
        let image = {
            let mut entries = self.lock();
            entries.remove(name);
            entries.clone()
        };
        self.write_image(image).await;
    }

    /// Record the internal-network IP the container last presented.
    pub async fn set_internal_ip(&self, name: &str, internal_ip: Option<String>) {
        let _guard = self.persist.lock().await;
        let image = {
            let mut entries = self.lock();
            match entries.get_mut(name) {
                Some(record) => record.internal_ip = internal_ip,
                None => return,
            }
            entries.clone()
        };
        self.write_image(image).await;
    }

    pub fn internal_ip(&self, name: &str) -> Option<String> {
        self.lock().get(name).and_then(|r| r.internal_ip.clone())
    }

    /// MAC addresses in use across all managed containers, lowercased,
    /// mapped to the owning container name.
    pub fn all_mac_addresses(&self) -> HashMap<String, String> {
        let entries = self.lock();
        let mut macs = HashMap::new();
        for (name, record) in entries.iter() {
            for vnic in &record.vnics {
                if let Some(mac) = &vnic.mac_address {
                    macs.insert(mac.to_ascii_lowercase(), name.clone());
                }
            }
        }
        macs
    }

    /// First MAC in `vnics` already claimed by a different container.
    pub fn mac_conflict(&self, exclude: &str, vnics: &[VnicConfig]) -> Option<(String, String)> {
        let existing = self.all_mac_addresses();
        for vnic in vnics {
            if let Some(mac) = &vnic.mac_address {
                if let Some(owner) = existing.get(&mac.to_ascii_lowercase()) {
                    if owner != exclude {
                        return Some((mac.clone(), owner.clone()));
                    }
                }
            }
        }
        None
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ContainerRecord>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn write_image(&self, image: HashMap<String, ContainerRecord>) {
        if let Err(err) = persist_entries(&self.path, &image).await {
            warn!(
                path = %self.path.display(),
                error = %err,
                "Failed to persist registry, keeping in-memory state"
            );
        }
    }
}

fn load_entries(path: &Path) -> Result<HashMap<String, ContainerRecord>, serde_json::Error> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(_) => return Ok(HashMap::new()),
    };
    serde_json::from_slice(&bytes)
}

fn quarantine_path(path: &Path) -> PathBuf {
    let ts = chrono::Utc::now().timestamp();
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".corrupt-{ts}"));
    PathBuf::from(name)
}

async fn persist_entries(
    path: &Path,
    entries: &HashMap<String, ContainerRecord>,
) -> Result<(), RegistryError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let encoded = serde_json::to_vec_pretty(entries)?;

    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, &encoded).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vnic(name: &str, parent: &str) -> VnicConfig {
        VnicConfig {
            name: name.to_string(),
            parent_interface: parent.to_string(),
            network_mode: NetworkMode::Dhcp,
            parent_subnet: None,
            parent_gateway: None,
            ip_address: None,
            subnet: None,
            gateway: None,
            dns: Vec::new(),
            mac_address: None,
        }
    }

    #[tokio::test]
    async fn test_put_get_remove_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime_vnics.json");
        let registry = Registry::open(&path);

        let record = ContainerRecord {
            vnics: vec![vnic("eth0", "ens37")],
            internal_ip: None,
            image: None,
        };
        registry.put("plc-001", record.clone()).await;

        assert_eq!(registry.get("plc-001"), Some(record));
        assert!(path.exists());

        registry.remove("plc-001").await;
        assert!(registry.get("plc-001").is_none());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime_vnics.json");

        {
            let registry = Registry::open(&path);
            registry
                .put(
                    "plc-001",
                    ContainerRecord {
                        vnics: vec![vnic("eth0", "ens37")],
                        internal_ip: Some("172.28.0.2".to_string()),
                        image: None,
                    },
                )
                .await;
        }

        let reopened = Registry::open(&path);
        let record = reopened.get("plc-001").expect("record survives restart");
        assert_eq!(record.vnics.len(), 1);
        assert_eq!(record.internal_ip.as_deref(), Some("172.28.0.2"));
    }

    #[tokio::test]
    async fn test_missing_file_yields_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path().join("missing.json"));
        assert!(registry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime_vnics.json");
        std::fs::write(&path, "{not json").unwrap();

        let registry = Registry::open(&path);
        assert!(registry.snapshot().is_empty());

        // The corrupt file was moved aside, not deleted.
        let quarantined: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupt-"))
            .collect();
        assert_eq!(quarantined.len(), 1);

        // Subsequent writes succeed on a fresh file.
        registry.put("plc-001", ContainerRecord::default()).await;
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_snapshot_is_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path().join("r.json"));
        registry.put("b", ContainerRecord::default()).await;
        registry.put("a", ContainerRecord::default()).await;
        registry.put("c", ContainerRecord::default()).await;

        let names: Vec<_> = registry.snapshot().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_mac_conflict_detection() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path().join("r.json"));

        let mut owned = vnic("eth0", "ens37");
        owned.mac_address = Some("02:42:AC:11:00:02".to_string());
        registry
            .put(
                "plc-001",
                ContainerRecord {
                    vnics: vec![owned],
                    internal_ip: None,
                    image: None,
                },
            )
            .await;

        let mut wanted = vnic("eth0", "ens37");
        wanted.mac_address = Some("02:42:ac:11:00:02".to_string());

        // Case-insensitive conflict against another container.
        let conflict = registry.mac_conflict("plc-002", &[wanted.clone()]);
        assert_eq!(
            conflict,
            Some((
                "02:42:ac:11:00:02".to_string(),
                "plc-001".to_string()
            ))
        );

        // A container never conflicts with itself.
        assert!(registry.mac_conflict("plc-001", &[wanted]).is_none());
    }

    #[test]
    fn test_manual_mode_field_requirements() {
        let mut v = vnic("eth0", "ens37");
        v.network_mode = NetworkMode::Manual;
        assert_eq!(v.missing_manual_field(), Some("ip_address"));

        v.ip_address = Some("192.168.1.100".to_string());
        assert_eq!(v.missing_manual_field(), Some("subnet"));

        v.subnet = Some("192.168.1.0/24".to_string());
        assert_eq!(v.missing_manual_field(), Some("gateway"));

        v.gateway = Some("192.168.1.1".to_string());
        assert_eq!(v.missing_manual_field(), None);
    }

    #[test]
    fn test_vnic_deserializes_with_defaults() {
        let v: VnicConfig = serde_json::from_value(serde_json::json!({
            "name": "eth0",
            "parent_interface": "ens37"
        }))
        .unwrap();
        assert_eq!(v.network_mode, NetworkMode::Dhcp);
        assert!(v.dns.is_empty());

        let v: VnicConfig = serde_json::from_value(serde_json::json!({
            "name": "eth0",
            "parent_interface": "ens37",
            "network_mode": "manual",
            "ip_address": "192.168.1.100",
            "subnet": "192.168.1.0/24",
            "gateway": "192.168.1.1"
        }))
        .unwrap();
        assert_eq!(v.network_mode, NetworkMode::Manual);
    }
}
