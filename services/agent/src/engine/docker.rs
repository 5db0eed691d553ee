//! Docker implementation of the container engine seam.
//!
//! Talks to the local daemon over its Unix socket. Every call runs under the
//! agent-wide per-call deadline; a timeout surfaces as `EngineError::Timeout`
//! and the caller releases its operation slot.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, RestartContainerOptions,
    StartContainerOptions, Stats, StatsOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions, InspectNetworkOptions,
    ListNetworksOptions,
};
use bollard::service::{
    EndpointIpamConfig, EndpointSettings, HostConfig, Ipam, IpamConfig, RestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::volume::RemoveVolumeOptions;
use bollard::Docker;
use futures_util::StreamExt;
use tracing::debug;

use super::{
    ContainerEngine, ContainerSpec, ContainerUsage, ContainerView, EndpointSpec, EndpointView,
    EngineError, NetworkSpec, NetworkView,
};

pub struct DockerEngine {
    docker: Docker,
    call_timeout: Duration,
}

impl DockerEngine {
    /// Connect to the daemon, honoring an explicit socket path when given.
    pub fn connect(socket: Option<&str>, call_timeout: Duration) -> Result<Self, EngineError> {
        let docker = match socket {
            Some(path) => Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| EngineError::Transport(e.to_string()))?;

        Ok(Self {
            docker,
            call_timeout,
        })
    }

    async fn deadline<T, F>(&self, call: F) -> Result<T, EngineError>
    where
        F: std::future::Future<Output = Result<T, bollard::errors::Error>>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result.map_err(map_error),
            Err(_) => Err(EngineError::Timeout(self.call_timeout)),
        }
    }
}

fn map_error(err: bollard::errors::Error) -> EngineError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(message),
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => EngineError::Api {
            status: status_code,
            message,
        },
        other => EngineError::Transport(other.to_string()),
    }
}

/// Treat a 404 as `Ok(None)`.
fn optional<T>(result: Result<T, EngineError>) -> Result<Option<T>, EngineError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn pull_image(&self, reference: &str) -> Result<(), EngineError> {
        debug!(image = reference, "Pulling image");
        let options = Some(CreateImageOptions {
            from_image: reference.to_string(),
            ..Default::default()
        });

        let pull = async {
            let mut stream = self.docker.create_image(options, None, None);
            while let Some(progress) = stream.next().await {
                progress?;
            }
            Ok::<(), bollard::errors::Error>(())
        };

        self.deadline(pull).await
    }

    async fn image_present(&self, reference: &str) -> Result<bool, EngineError> {
        match optional(self.deadline(self.docker.inspect_image(reference)).await)? {
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let restart_policy = spec.restart_always.then(|| RestartPolicy {
            name: Some(RestartPolicyNameEnum::ALWAYS),
            maximum_retry_count: None,
        });

        let devices: Option<Vec<bollard::service::DeviceMapping>> =
            (!spec.devices.is_empty()).then(|| {
                spec.devices
                    .iter()
                    .map(|d| bollard::service::DeviceMapping {
                        path_on_host: Some(d.host_path.clone()),
                        path_in_container: Some(d.container_path.clone()),
                        cgroup_permissions: d.permissions.clone(),
                    })
                    .collect()
            });

        let host_config = HostConfig {
            restart_policy,
            dns: (!spec.dns.is_empty()).then(|| spec.dns.clone()),
            network_mode: spec.network.clone(),
            devices,
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = self
            .deadline(self.docker.create_container(Some(options), config))
            .await?;
        Ok(response.id)
    }

    async fn start_container(&self, name: &str) -> Result<(), EngineError> {
        self.deadline(
            self.docker
                .start_container(name, None::<StartContainerOptions<String>>),
        )
        .await
    }

    async fn stop_container(&self, name: &str, grace_secs: i64) -> Result<(), EngineError> {
        self.deadline(
            self.docker
                .stop_container(name, Some(StopContainerOptions { t: grace_secs })),
        )
        .await
    }

    async fn restart_container(&self, name: &str, grace_secs: i64) -> Result<(), EngineError> {
        self.deadline(self.docker.restart_container(
            name,
            Some(RestartContainerOptions {
                t: grace_secs as isize,
            }),
        ))
        .await
    }

    async fn remove_container(&self, name: &str, force: bool) -> Result<(), EngineError> {
        self.deadline(self.docker.remove_container(
            name,
            Some(RemoveContainerOptions {
                force,
                ..Default::default()
            }),
        ))
        .await
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerView>, EngineError> {
        let response = optional(self.deadline(self.docker.inspect_container(name, None)).await)?;
        let Some(response) = response else {
            return Ok(None);
        };

        let restart_count = response.restart_count.unwrap_or(0);
        let state = response.state.unwrap_or_default();
        let running = state.running.unwrap_or(false);

        let started_at = state
            .started_at
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));

        let mut networks = BTreeMap::new();
        if let Some(settings) = response.network_settings {
            for (net_name, endpoint) in settings.networks.unwrap_or_default() {
                networks.insert(
                    net_name,
                    EndpointView {
                        ip_address: endpoint.ip_address.filter(|ip| !ip.is_empty()),
                        mac_address: endpoint.mac_address.filter(|mac| !mac.is_empty()),
                        gateway: endpoint.gateway.filter(|gw| !gw.is_empty()),
                    },
                );
            }
        }

        Ok(Some(ContainerView {
            id: response.id.unwrap_or_default(),
            name: response
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_else(|| name.to_string()),
            state: state
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            running,
            restart_count,
            started_at,
            exit_code: (!running).then(|| state.exit_code.unwrap_or(0)),
            networks,
        }))
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<(), EngineError> {
        let mut options = HashMap::new();
        if let Some(parent) = &spec.parent {
            options.insert("parent".to_string(), parent.clone());
        }

        let ipam = spec.subnet.as_ref().map(|subnet| Ipam {
            config: Some(vec![IpamConfig {
                subnet: Some(subnet.clone()),
                gateway: spec.gateway.clone(),
                ..Default::default()
            }]),
            ..Default::default()
        });

        let create = CreateNetworkOptions {
            name: spec.name.clone(),
            driver: spec.driver.clone(),
            internal: spec.internal,
            options,
            ipam: ipam.unwrap_or_default(),
            ..Default::default()
        };

        self.deadline(self.docker.create_network(create))
            .await
            .map(|_| ())
    }

    async fn remove_network(&self, name: &str) -> Result<(), EngineError> {
        self.deadline(self.docker.remove_network(name)).await
    }

    async fn list_networks(&self) -> Result<Vec<NetworkView>, EngineError> {
        let networks = self
            .deadline(
                self.docker
                    .list_networks(None::<ListNetworksOptions<String>>),
            )
            .await?;

        Ok(networks.into_iter().map(map_network).collect())
    }

    async fn inspect_network(&self, name: &str) -> Result<Option<NetworkView>, EngineError> {
        let response = optional(
            self.deadline(self.docker.inspect_network(
                name,
                Some(InspectNetworkOptions::<String> {
                    verbose: true,
                    ..Default::default()
                }),
            ))
            .await,
        )?;

        Ok(response.map(map_network))
    }

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        endpoint: &EndpointSpec,
    ) -> Result<(), EngineError> {
        let ipam_config = endpoint.ipv4_address.as_ref().map(|ip| EndpointIpamConfig {
            ipv4_address: Some(ip.clone()),
            ..Default::default()
        });

        let options = ConnectNetworkOptions {
            container: container.to_string(),
            endpoint_config: EndpointSettings {
                ipam_config,
                mac_address: endpoint.mac_address.clone(),
                ..Default::default()
            },
        };

        self.deadline(self.docker.connect_network(network, options))
            .await
    }

    async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
        force: bool,
    ) -> Result<(), EngineError> {
        let options = DisconnectNetworkOptions {
            container: container.to_string(),
            force,
        };
        self.deadline(self.docker.disconnect_network(network, options))
            .await
    }

    async fn container_usage(&self, name: &str) -> Result<Option<ContainerUsage>, EngineError> {
        let sample = async {
            let mut stream = self.docker.stats(
                name,
                Some(StatsOptions {
                    stream: false,
                    one_shot: false,
                }),
            );
            stream.next().await.transpose()
        };

        let stats = match optional(self.deadline(sample).await)? {
            Some(Some(stats)) => stats,
            _ => return Ok(None),
        };

        Ok(Some(usage_from_stats(&stats)))
    }

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        self.deadline(
            self.docker
                .remove_volume(name, Some(RemoveVolumeOptions { force: true })),
        )
        .await
    }
}

fn map_network(network: bollard::service::Network) -> NetworkView {
    let options = network.options.unwrap_or_default();
    let mut subnets = Vec::new();
    let mut gateways = Vec::new();
    if let Some(ipam) = network.ipam {
        for config in ipam.config.unwrap_or_default() {
            if let Some(subnet) = config.subnet {
                subnets.push(subnet);
            }
            if let Some(gateway) = config.gateway {
                gateways.push(gateway);
            }
        }
    }

    let containers = network
        .containers
        .unwrap_or_default()
        .into_values()
        .filter_map(|c| c.name)
        .collect();

    NetworkView {
        id: network.id.unwrap_or_default(),
        name: network.name.unwrap_or_default(),
        driver: network.driver.unwrap_or_default(),
        parent: options.get("parent").cloned(),
        subnets,
        gateways,
        containers,
    }
}

/// CPU percent from the delta between the last two engine samples, scaled by
/// the online CPU count; memory in MB.
fn usage_from_stats(stats: &Stats) -> ContainerUsage {
    let cpu_delta = stats
        .cpu_stats
        .cpu_usage
        .total_usage
        .saturating_sub(stats.precpu_stats.cpu_usage.total_usage) as f64;

    let system_delta = stats
        .cpu_stats
        .system_cpu_usage
        .unwrap_or(0)
        .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0))
        as f64;

    let cpu_percent = if system_delta > 0.0 && cpu_delta > 0.0 {
        let cpus = stats.cpu_stats.online_cpus.unwrap_or(1).max(1) as f64;
        (cpu_delta / system_delta) * cpus * 100.0
    } else {
        0.0
    };

    let memory_mb = stats.memory_stats.usage.unwrap_or(0) as f64 / (1024.0 * 1024.0);

    ContainerUsage {
        cpu_percent,
        memory_mb,
    }
}
