use std::sync::Arc;

use anyhow::{Context, bail};
use convoy_client::{Kind, ResourceClient};
use convoy_runtime::{Controller, SyncHandler};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ConvoyConfig;
use crate::controller::{CiJobController, ClusterController, ControllerContext};
use crate::crd::ci_job::JOB_LABEL;
use crate::credentials::{StaticTokenIssuer, TokenIssuer};
use crate::provision::{MemoryProvisioner, ProvisioningBackend};

/// Describes a fresh in-memory cluster takes before it reports ready.
const MEMORY_WARMUP: u32 = 2;

const DEV_TOKEN: &str = "dev-token";

/// Token issuer for CI jobs: the configured file, or a fixed token in dev.
pub async fn build_token_issuer(cfg: &ConvoyConfig) -> anyhow::Result<Arc<dyn TokenIssuer>> {
    match &cfg.token_file {
        Some(path) => {
            let issuer = StaticTokenIssuer::from_file(path)
                .await
                .with_context(|| format!("loading CI token from {path}"))?;
            Ok(Arc::new(issuer))
        }
        None if cfg.is_dev() => Ok(Arc::new(StaticTokenIssuer::new(DEV_TOKEN))),
        None => bail!("CONVOY_TOKEN_FILE must be set outside the dev profile"),
    }
}

/// Provisioning backend named by `CONVOY_PROVISIONER`, if any.
pub fn build_provisioner(
    cfg: &ConvoyConfig,
) -> anyhow::Result<Option<Arc<dyn ProvisioningBackend>>> {
    match cfg.provisioner.as_deref() {
        None => Ok(None),
        Some("memory") => Ok(Some(Arc::new(MemoryProvisioner::new(MEMORY_WARMUP)))),
        Some(other) => bail!("unknown provisioner {other}"),
    }
}

/// Spawn one controller loop.
pub fn spawn_controller<H: SyncHandler>(
    ctrl: Controller<H>,
    workers: usize,
    shutdown: CancellationToken,
) -> JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move { Ok(ctrl.run(workers, shutdown).await?) })
}

/// The CiJob loop. Pods carry no reference to the CiJob, so they are tied
/// back through the job label.
pub fn ci_job_controller(
    client: Arc<dyn ResourceClient>,
    ctx: Arc<ControllerContext>,
    cfg: &ConvoyConfig,
    service_kinds: Vec<Kind>,
) -> Controller<CiJobController> {
    let mut ctrl = Controller::new(
        client,
        Arc::new(CiJobController::new(ctx)),
        cfg.controller("ci-jobs"),
    )
    .owns(Kind::Job)
    .owns_via_label(Kind::Pod, JOB_LABEL);
    for kind in service_kinds {
        ctrl = ctrl.owns(kind);
    }
    ctrl
}

/// Start every enabled controller and wait until all of them finish.
pub async fn run_all(
    client: Arc<dyn ResourceClient>,
    cfg: ConvoyConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let tokens = build_token_issuer(&cfg).await?;
    let provisioner = build_provisioner(&cfg)?;
    let workers = cfg.workers();
    let ctx = Arc::new(ControllerContext::new(client.clone(), cfg.clone(), tokens));

    let clusters = match (cfg.features.clusters.unwrap_or(false), provisioner) {
        (false, _) => None,
        (true, Some(backend)) => Some(backend),
        (true, None) => {
            bail!("managed clusters are enabled but CONVOY_PROVISIONER is not set")
        }
    };

    let service_kinds = cfg.service_kinds()?;

    let mut handles = Vec::new();
    if cfg.features.ci_jobs.unwrap_or(true) {
        let ctrl = ci_job_controller(client.clone(), ctx.clone(), &cfg, service_kinds);
        handles.push(spawn_controller(ctrl, workers, shutdown.clone()));
    }
    if let Some(backend) = clusters {
        let ctrl = Controller::new(
            client.clone(),
            Arc::new(ClusterController::new(ctx.clone(), backend)),
            cfg.controller("managed-clusters"),
        );
        handles.push(spawn_controller(ctrl, workers, shutdown.clone()));
    }
    if handles.is_empty() {
        bail!("no controller enabled");
    }
    info!(controllers = handles.len(), workers, "convoy operator running");

    for handle in handles {
        handle.await??;
    }
    Ok(())
}
