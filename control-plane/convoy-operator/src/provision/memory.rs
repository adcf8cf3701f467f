use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use convoy_client::{MemoryClient, ResourceClient};
use convoy_subnet::Ipv4Cidr;
use tokio::sync::RwLock;
use tracing::info;

use super::{ClusterRequest, ClusterState, ProvisionError, ProvisioningBackend};

struct Entry {
    request: ClusterRequest,
    /// Describes left before the cluster reports ready.
    warmup: u32,
    failure: Option<String>,
    api: MemoryClient,
}

/// In-process provisioner: clusters become ready after a fixed number of
/// `describe` calls and each one gets its own [`MemoryClient`].
#[derive(Clone, Default)]
pub struct MemoryProvisioner {
    clusters: Arc<RwLock<HashMap<String, Entry>>>,
    reserved: Arc<RwLock<Vec<(String, Ipv4Cidr)>>>,
    warmup: u32,
}

impl MemoryProvisioner {
    /// Clusters report `InProgress` for `warmup` describes before `Ready`.
    pub fn new(warmup: u32) -> Self {
        Self {
            warmup,
            ..Default::default()
        }
    }

    /// Marks `range` in `location` as taken by something outside convoy.
    pub async fn reserve(&self, location: &str, range: Ipv4Cidr) {
        self.reserved
            .write()
            .await
            .push((location.to_string(), range));
    }

    /// Makes the next describes of `name` report a failure.
    pub async fn fail(&self, name: &str, message: &str) {
        if let Some(entry) = self.clusters.write().await.get_mut(name) {
            entry.failure = Some(message.to_string());
        }
    }

    pub async fn request(&self, name: &str) -> Option<ClusterRequest> {
        self.clusters
            .read()
            .await
            .get(name)
            .map(|e| e.request.clone())
    }

    /// The API of cluster `name`, for seeding or inspecting its objects.
    pub async fn cluster_api(&self, name: &str) -> Option<MemoryClient> {
        self.clusters.read().await.get(name).map(|e| e.api.clone())
    }

    pub async fn cluster_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ProvisioningBackend for MemoryProvisioner {
    async fn describe(&self, name: &str) -> Result<ClusterState, ProvisionError> {
        let mut clusters = self.clusters.write().await;
        let Some(entry) = clusters.get_mut(name) else {
            return Ok(ClusterState::NotFound);
        };
        if let Some(msg) = &entry.failure {
            return Ok(ClusterState::Failed(msg.clone()));
        }
        if entry.warmup > 0 {
            entry.warmup -= 1;
            return Ok(ClusterState::InProgress);
        }
        Ok(ClusterState::Ready {
            endpoint: format!("https://{}.{}.convoy.local", name, entry.request.location),
            node_count: entry.request.node_count,
        })
    }

    async fn create(&self, req: &ClusterRequest) -> Result<(), ProvisionError> {
        let mut clusters = self.clusters.write().await;
        if clusters.contains_key(&req.name) {
            return Err(ProvisionError::AlreadyExists(req.name.clone()));
        }
        info!(cluster = %req.name, node_subnet = %req.node_subnet, service_subnet = %req.service_subnet, "memory provisioner: create");
        clusters.insert(
            req.name.clone(),
            Entry {
                request: req.clone(),
                warmup: self.warmup,
                failure: None,
                api: MemoryClient::new(),
            },
        );
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), ProvisionError> {
        match self.clusters.write().await.remove(name) {
            Some(_) => {
                info!(cluster = %name, "memory provisioner: delete");
                Ok(())
            }
            None => Err(ProvisionError::NotFound(name.to_string())),
        }
    }

    async fn used_ranges(&self, location: &str) -> Result<Vec<Ipv4Cidr>, ProvisionError> {
        let mut ranges: Vec<Ipv4Cidr> = self
            .reserved
            .read()
            .await
            .iter()
            .filter(|(loc, _)| loc == location)
            .map(|(_, r)| *r)
            .collect();
        for entry in self.clusters.read().await.values() {
            if entry.request.location == location {
                ranges.push(entry.request.node_subnet);
                ranges.push(entry.request.service_subnet);
            }
        }
        Ok(ranges)
    }

    async fn connect(&self, name: &str) -> Result<Arc<dyn ResourceClient>, ProvisionError> {
        self.clusters
            .read()
            .await
            .get(name)
            .map(|e| Arc::new(e.api.clone()) as Arc<dyn ResourceClient>)
            .ok_or_else(|| ProvisionError::NotFound(name.to_string()))
    }
}
