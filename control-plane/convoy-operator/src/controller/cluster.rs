//! ManagedCluster sync handler.
//!
//! The remote name is generated once and persisted in status before the
//! backend is ever called, so a crash between the two can never leak a
//! cluster under a name nobody remembers. Deletion empties the remote
//! cluster with the [`Sweeper`] before asking the backend to delete it.

use std::sync::Arc;

use async_trait::async_trait;
use convoy_client::{Api, Resource};
use convoy_runtime::{
    ReconcileError, SweepConfig, SweepOutcome, Sweeper, SyncHandler, ensure_finalizer,
    remove_finalizer,
};
use convoy_subnet::{Ipv4Cidr, SubnetAllocator};
use tracing::{debug, info, instrument, trace, warn};

use super::{ControllerContext, SyncFault};
use crate::crd::FINALIZER;
use crate::crd::managed_cluster::{
    ClusterPhase, ManagedCluster, ManagedClusterSpec, ManagedClusterStatus,
};
use crate::provision::{ClusterRequest, ClusterState, ProvisionError, ProvisioningBackend};

const SUFFIX_LEN: usize = 6;

impl From<ProvisionError> for SyncFault {
    fn from(e: ProvisionError) -> Self {
        SyncFault::Transient(ReconcileError::Internal(e.to_string()))
    }
}

pub struct ClusterController {
    ctx: Arc<ControllerContext>,
    backend: Arc<dyn ProvisioningBackend>,
    sweep: SweepConfig,
}

impl ClusterController {
    pub fn new(ctx: Arc<ControllerContext>, backend: Arc<dyn ProvisioningBackend>) -> Self {
        let sweep = ctx.cfg.sweep_config();
        Self {
            ctx,
            backend,
            sweep,
        }
    }
}

#[async_trait]
impl SyncHandler for ClusterController {
    type Resource = ManagedCluster;

    #[instrument(skip_all, fields(ns = %obj.namespace().unwrap_or("default"), name = %obj.name()))]
    async fn sync(&self, obj: ManagedCluster) -> Result<(), ReconcileError> {
        self.reconcile(obj).await
    }
}

impl ClusterController {
    async fn reconcile(&self, mut obj: ManagedCluster) -> Result<(), ReconcileError> {
        let ns = obj.namespace().unwrap_or("default").to_string();
        let name = obj.name().to_string();
        let api: Api<ManagedCluster> = Api::namespaced(self.ctx.client.clone(), &ns);

        if obj.meta().is_deleting() {
            info!(%ns, %name, "reconcile: deletion timestamp detected; tearing down cluster");
            return self.finalize(&api, obj, &ns, &name).await;
        }

        if ensure_finalizer(&api, &mut obj, FINALIZER).await? {
            info!(%ns, %name, "reconcile: finalizer added");
            return Ok(());
        }

        let generation = obj.meta().generation;
        let mut current = obj.status.clone().unwrap_or_default();
        if current.state == ClusterPhase::Error && current.observed_generation == generation {
            trace!(%ns, %name, "reconcile: error recorded for this generation");
            return Ok(());
        }

        // The name write is this pass's only status update; the resulting
        // watch event starts provisioning.
        let Some(cluster_name) = current.cluster_name.clone() else {
            let n = format!("{}-{}", name, self.ctx.random_suffix(SUFFIX_LEN));
            current.cluster_name = Some(n.clone());
            current.state = ClusterPhase::Pending;
            current.message = Some("cluster name reserved".into());
            current.observed_generation = generation;
            obj.status = Some(current);
            api.replace_status(&obj).await?;
            info!(%ns, %name, cluster = %n, "reconcile: cluster name persisted");
            return Ok(());
        };

        let mut next = current;
        next.observed_generation = generation;
        match self.provision(&obj.spec, &cluster_name, &mut next).await {
            Ok(()) => {}
            Err(SyncFault::Domain(msg)) => {
                info!(%ns, %name, error = %msg, "reconcile: provisioning failed");
                next.state = ClusterPhase::Error;
                next.message = Some(msg);
            }
            Err(SyncFault::Transient(e)) => return Err(e),
        }

        if obj.status.as_ref() != Some(&next) {
            debug!(%ns, %name, state = ?next.state, "status: writing");
            obj.status = Some(next);
            api.replace_status(&obj).await?;
        }
        Ok(())
    }

    /// Moves the remote cluster one step forward and records what was seen.
    async fn provision(
        &self,
        spec: &ManagedClusterSpec,
        cluster_name: &str,
        next: &mut ManagedClusterStatus,
    ) -> Result<(), SyncFault> {
        match self.backend.describe(cluster_name).await? {
            ClusterState::NotFound => {
                let base: Ipv4Cidr = spec.base_cidr.parse().map_err(|e| {
                    SyncFault::Domain(format!("invalid baseCidr {}: {e}", spec.base_cidr))
                })?;
                let used = self.backend.used_ranges(&spec.location).await?;
                let mut alloc = SubnetAllocator::new(base);
                alloc.init(&used);
                let node_subnet = alloc
                    .generate_next_24()
                    .map_err(|e| SyncFault::Domain(e.to_string()))?;
                let service_subnet = alloc
                    .generate_next_25()
                    .map_err(|e| SyncFault::Domain(e.to_string()))?;

                let req = ClusterRequest {
                    name: cluster_name.to_string(),
                    location: spec.location.clone(),
                    node_count: spec.node_count,
                    machine_type: spec.machine_type.clone(),
                    node_subnet,
                    service_subnet,
                };
                match self.backend.create(&req).await {
                    Ok(()) => {
                        info!(cluster = %cluster_name, %node_subnet, %service_subnet, "reconcile: cluster create requested")
                    }
                    Err(ProvisionError::AlreadyExists(_)) => {
                        debug!(cluster = %cluster_name, "create raced an existing cluster")
                    }
                    Err(e) => return Err(e.into()),
                }
                next.state = ClusterPhase::Provisioning;
                next.message = Some("cluster creation requested".into());
                next.node_subnet = Some(node_subnet.to_string());
                next.service_subnet = Some(service_subnet.to_string());
            }
            ClusterState::InProgress => {
                next.state = ClusterPhase::Provisioning;
                next.message = Some("cluster provisioning".into());
            }
            ClusterState::Ready {
                endpoint,
                node_count,
            } => {
                next.state = ClusterPhase::Ready;
                next.message = None;
                next.endpoint = Some(endpoint);
                next.node_count = Some(node_count);
            }
            ClusterState::Failed(msg) => return Err(SyncFault::Domain(msg)),
        }
        Ok(())
    }

    async fn finalize(
        &self,
        api: &Api<ManagedCluster>,
        mut obj: ManagedCluster,
        ns: &str,
        name: &str,
    ) -> Result<(), ReconcileError> {
        if !obj.meta().has_finalizer(FINALIZER) {
            return Ok(());
        }

        let mut status = obj.status.clone().unwrap_or_default();
        let Some(cluster_name) = status.cluster_name.clone() else {
            info!(%ns, %name, "reconcile: no remote cluster recorded; removing finalizer");
            remove_finalizer(api, &mut obj, FINALIZER).await?;
            return Ok(());
        };
        if status.state != ClusterPhase::Deleting {
            status.state = ClusterPhase::Deleting;
            status.message = Some("deleting cluster".into());
            obj.status = Some(status);
            obj = api.replace_status(&obj).await?;
        }

        let state = self
            .backend
            .describe(&cluster_name)
            .await
            .map_err(|e| ReconcileError::Internal(e.to_string()))?;
        match state {
            ClusterState::NotFound => {
                info!(%ns, %name, cluster = %cluster_name, "reconcile: cluster gone; removing finalizer");
                remove_finalizer(api, &mut obj, FINALIZER).await?;
            }
            ClusterState::InProgress => {
                debug!(%ns, %name, cluster = %cluster_name, "reconcile: waiting for backend before teardown");
            }
            ClusterState::Ready { .. } => {
                let remote = self
                    .backend
                    .connect(&cluster_name)
                    .await
                    .map_err(|e| ReconcileError::Internal(e.to_string()))?;
                let outcome = Sweeper::new(remote, self.sweep.clone())
                    .sweep()
                    .await
                    .map_err(|e| ReconcileError::Internal(e.to_string()))?;
                match outcome {
                    SweepOutcome::Clean => self.delete_remote(&cluster_name).await?,
                    SweepOutcome::Pending => {
                        info!(%ns, %name, cluster = %cluster_name, "reconcile: workloads still terminating")
                    }
                }
            }
            ClusterState::Failed(msg) => {
                warn!(%ns, %name, cluster = %cluster_name, error = %msg, "reconcile: deleting failed cluster");
                self.delete_remote(&cluster_name).await?;
            }
        }
        Ok(())
    }

    async fn delete_remote(&self, cluster_name: &str) -> Result<(), ReconcileError> {
        match self.backend.delete(cluster_name).await {
            Ok(()) => {
                info!(cluster = %cluster_name, "reconcile: cluster delete requested");
                Ok(())
            }
            Err(ProvisionError::NotFound(_)) => Ok(()),
            Err(e) => Err(ReconcileError::Internal(e.to_string())),
        }
    }
}
