//! Boundary to whatever actually creates remote clusters.

use std::sync::Arc;

use async_trait::async_trait;
use convoy_client::ResourceClient;
use convoy_subnet::Ipv4Cidr;

mod memory;

pub use memory::MemoryProvisioner;

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("cluster {0} already exists")]
    AlreadyExists(String),

    #[error("cluster {0} not found")]
    NotFound(String),

    #[error("provisioning backend error: {0}")]
    Backend(String),
}

/// Externally observed state of one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterState {
    NotFound,
    InProgress,
    Ready { endpoint: String, node_count: u32 },
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRequest {
    pub name: String,
    pub location: String,
    pub node_count: u32,
    pub machine_type: Option<String>,
    pub node_subnet: Ipv4Cidr,
    pub service_subnet: Ipv4Cidr,
}

#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    async fn describe(&self, name: &str) -> Result<ClusterState, ProvisionError>;

    /// Fails with `AlreadyExists` when a cluster of that name is known.
    async fn create(&self, req: &ClusterRequest) -> Result<(), ProvisionError>;

    async fn delete(&self, name: &str) -> Result<(), ProvisionError>;

    /// Address ranges already taken in `location`, by any cluster.
    async fn used_ranges(&self, location: &str) -> Result<Vec<Ipv4Cidr>, ProvisionError>;

    /// A client for the API server of a ready cluster.
    async fn connect(&self, name: &str) -> Result<Arc<dyn ResourceClient>, ProvisionError>;
}
