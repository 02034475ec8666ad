use async_trait::async_trait;
use bollard::container::DownloadFromContainerOptions;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::io::Read;
use std::pin::Pin;

use super::{ContainerEvent, ContainerSnapshot, EventAction, RuntimeClient, RuntimeError};

pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    pub fn new(socket: &str) -> anyhow::Result<Self> {
        let client = if cfg!(windows) || socket.starts_with("npipe://") || socket.starts_with("tcp://") {
            Docker::connect_with_local_defaults()?
        } else {
            Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION)?
        };

        Ok(Self { client })
    }

    /// Pick the address a route should dial among a container's attached
    /// networks. Prefers a non-bridge network; ties among several
    /// non-bridge networks are broken by sorting on network name, so the
    /// same container always resolves to the same address.
    fn pick_address(
        networks: &HashMap<String, bollard::models::EndpointSettings>,
    ) -> (Option<String>, Option<String>) {
        let mut names: Vec<&String> = networks.keys().collect();
        names.sort();

        let chosen = names
            .iter()
            .find(|n| n.as_str() != "bridge")
            .or_else(|| names.first());

        match chosen {
            Some(name) => {
                let addr = networks
                    .get(*name)
                    .and_then(|ep| ep.ip_address.clone())
                    .filter(|ip| !ip.is_empty());
                (addr, Some((*name).clone()))
            }
            None => (None, None),
        }
    }

    fn map_inspect(
        container_id: &str,
        info: bollard::models::ContainerInspectResponse,
    ) -> ContainerSnapshot {
        let running = info.state.as_ref().and_then(|s| s.running).unwrap_or(false);

        let labels = info
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();

        let name = info
            .name
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string();

        let networks = info
            .network_settings
            .as_ref()
            .and_then(|ns| ns.networks.clone())
            .unwrap_or_default();
        let (address, network) = Self::pick_address(&networks);

        ContainerSnapshot {
            id: info.id.unwrap_or_else(|| container_id.to_string()),
            name,
            running,
            address,
            network,
            labels,
        }
    }
}

#[async_trait]
impl RuntimeClient for DockerRuntime {
    async fn enumerate(&self) -> Result<Vec<ContainerSnapshot>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("status".to_string(), vec!["running".to_string()]);

        let options = ListContainersOptions {
            all: false,
            filters,
            ..Default::default()
        };

        let summaries = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::Transient(e.to_string()))?;

        let mut out = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(id) = summary.id.clone() else {
                continue;
            };
            match self.inspect(&id).await {
                Ok(snapshot) => out.push(snapshot),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerSnapshot, RuntimeError> {
        let result = self
            .client
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await;

        match result {
            Ok(info) => Ok(Self::map_inspect(container_id, info)),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                Err(RuntimeError::NotFound(container_id.to_string()))
            }
            Err(e) => Err(RuntimeError::Transient(e.to_string())),
        }
    }

    async fn subscribe_events(
        &self,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<ContainerEvent, RuntimeError>> + Send>>, RuntimeError>
    {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert(
            "event".to_string(),
            vec![
                "start".to_string(),
                "stop".to_string(),
                "die".to_string(),
                "destroy".to_string(),
            ],
        );

        let options = EventsOptions::<String> {
            filters,
            ..Default::default()
        };

        let mapped = self.client.events(Some(options)).map(|result| match result {
            Ok(msg) => {
                let action = match msg.action.as_deref() {
                    Some("start") => EventAction::Start,
                    Some("stop") => EventAction::Stop,
                    Some("die") => EventAction::Die,
                    Some("destroy") => EventAction::Destroy,
                    _ => EventAction::Other,
                };
                let container_id = msg.actor.and_then(|a| a.id).unwrap_or_default();
                Ok(ContainerEvent { container_id, action })
            }
            Err(e) => Err(RuntimeError::Transient(e.to_string())),
        });

        Ok(Box::pin(mapped))
    }

    async fn copy_file(&self, container_id: &str, path: &str) -> Result<Vec<u8>, RuntimeError> {
        let options = DownloadFromContainerOptions { path };
        let mut stream = self.client.download_from_container(container_id, Some(options));

        let mut archive_bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } => {
                    RuntimeError::NotFound(path.to_string())
                }
                other => RuntimeError::Transient(other.to_string()),
            })?;
            archive_bytes.extend_from_slice(&chunk);
        }

        let wanted = std::path::Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string());

        let mut archive = tar::Archive::new(std::io::Cursor::new(archive_bytes));
        for entry in archive.entries().map_err(|e| RuntimeError::Transient(e.to_string()))? {
            let mut entry = entry.map_err(|e| RuntimeError::Transient(e.to_string()))?;
            let entry_path = entry
                .path()
                .map_err(|e| RuntimeError::Transient(e.to_string()))?
                .to_string_lossy()
                .to_string();
            let entry_name = std::path::Path::new(&entry_path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or(entry_path);
            if entry_name == wanted {
                let mut buf = Vec::new();
                entry
                    .read_to_end(&mut buf)
                    .map_err(|e| RuntimeError::Transient(e.to_string()))?;
                return Ok(buf);
            }
        }

        Err(RuntimeError::NotFound(path.to_string()))
    }

    async fn is_available(&self) -> bool {
        self.client.ping().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::EndpointSettings;

    fn endpoint(ip: &str) -> EndpointSettings {
        EndpointSettings {
            ip_address: Some(ip.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn prefers_non_bridge_network() {
        let mut networks = HashMap::new();
        networks.insert("bridge".to_string(), endpoint("172.17.0.2"));
        networks.insert("app_net".to_string(), endpoint("10.0.0.5"));

        let (addr, net) = DockerRuntime::pick_address(&networks);
        assert_eq!(addr, Some("10.0.0.5".to_string()));
        assert_eq!(net, Some("app_net".to_string()));
    }

    #[test]
    fn falls_back_to_bridge_when_only_network() {
        let mut networks = HashMap::new();
        networks.insert("bridge".to_string(), endpoint("172.17.0.2"));

        let (addr, net) = DockerRuntime::pick_address(&networks);
        assert_eq!(addr, Some("172.17.0.2".to_string()));
        assert_eq!(net, Some("bridge".to_string()));
    }

    #[test]
    fn deterministic_tie_break_among_non_bridge_networks() {
        let mut networks = HashMap::new();
        networks.insert("bridge".to_string(), endpoint("172.17.0.2"));
        networks.insert("zeta_net".to_string(), endpoint("10.0.0.9"));
        networks.insert("alpha_net".to_string(), endpoint("10.0.0.1"));

        let (addr, net) = DockerRuntime::pick_address(&networks);
        assert_eq!(net, Some("alpha_net".to_string()));
        assert_eq!(addr, Some("10.0.0.1".to_string()));
    }
}
