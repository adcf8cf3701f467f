//! Forced cleanup of a whole target cluster before it is torn down.
//!
//! One pass lists every non-system namespace and sweeps each of them in its
//! own task, one sub-task per kind. Objects stuck in deletion past the grace
//! period have their finalizers stripped; then the kind is collection-deleted.
//! A kind is clean only when its list was already empty at the start of the
//! pass, so convergence takes at least two passes for a populated cluster.
//! The whole pass, listing included, runs under one wall-clock timeout.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use convoy_client::{ClientError, DeleteOptions, Kind, LabelSelector, ResourceClient};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    Clean,
    Pending,
}

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("listing {kind} in {scope} failed: {source}")]
    List {
        kind: Kind,
        scope: String,
        #[source]
        source: ClientError,
    },

    /// A finalizer strip or collection delete was refused. Retrying the
    /// pass will not help until the cause is fixed.
    #[error("cleaning {kind} in {scope} failed: {source}")]
    Cleanup {
        kind: Kind,
        scope: String,
        #[source]
        source: ClientError,
    },

    #[error("sweep did not finish within {0:?}")]
    Timeout(Duration),

    #[error("sweep task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// How long an object may sit with a deletion timestamp before its
    /// finalizers are stripped.
    pub grace: Duration,
    /// Wall-clock bound on one whole pass.
    pub timeout: Duration,
    pub system_namespaces: Vec<String>,
    /// Namespaced kinds swept in every namespace.
    pub kinds: Vec<Kind>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
            system_namespaces: vec!["kube-system".to_string()],
            kinds: default_kinds(),
        }
    }
}

pub fn default_kinds() -> Vec<Kind> {
    vec![
        Kind::PersistentVolumeClaim,
        Kind::Ingress,
        Kind::Pod,
        Kind::Deployment,
        Kind::StatefulSet,
        Kind::DaemonSet,
        Kind::Job,
    ]
}

/// Clean flag or error of one `(namespace, kind)` cell of a pass.
#[derive(Debug)]
struct KindReport {
    kind: Kind,
    result: Result<bool, SweepError>,
}

#[derive(Debug)]
struct NamespaceReport {
    namespace: String,
    kinds: Vec<KindReport>,
}

#[derive(Clone)]
pub struct Sweeper {
    client: Arc<dyn ResourceClient>,
    cfg: SweepConfig,
}

impl Sweeper {
    pub fn new(client: Arc<dyn ResourceClient>, cfg: SweepConfig) -> Self {
        Self { client, cfg }
    }

    /// Runs one pass. `Clean` only when nothing was found anywhere.
    #[instrument(skip_all)]
    pub async fn sweep(&self) -> Result<SweepOutcome, SweepError> {
        tokio::time::timeout(self.cfg.timeout, self.pass())
            .await
            .map_err(|_| SweepError::Timeout(self.cfg.timeout))?
    }

    async fn pass(&self) -> Result<SweepOutcome, SweepError> {
        let namespaces: Vec<String> = self
            .client
            .list(&Kind::Namespace, None, &LabelSelector::everything())
            .await
            .map_err(|source| SweepError::List {
                kind: Kind::Namespace,
                scope: "cluster".into(),
                source,
            })?
            .into_iter()
            .map(|o| o.metadata.name)
            .filter(|ns| !self.cfg.system_namespaces.contains(ns))
            .collect();

        let reports = self.sweep_namespaces(namespaces).await?;
        let mut clean = true;
        for report in reports {
            for cell in report.kinds {
                match cell.result {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(ns = %report.namespace, kind = %cell.kind, "not clean yet");
                        clean = false;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let volumes = sweep_kind(
            self.client.clone(),
            Kind::PersistentVolume,
            None,
            self.cfg.grace,
        )
        .await?;
        clean &= volumes;

        let outcome = if clean {
            SweepOutcome::Clean
        } else {
            SweepOutcome::Pending
        };
        info!(?outcome, "sweep pass finished");
        Ok(outcome)
    }

    async fn sweep_namespaces(
        &self,
        namespaces: Vec<String>,
    ) -> Result<Vec<NamespaceReport>, SweepError> {
        let expected = namespaces.len();
        if expected == 0 {
            return Ok(Vec::new());
        }
        let (tx, mut rx) = mpsc::channel(expected);
        for namespace in namespaces {
            let tx = tx.clone();
            let client = self.client.clone();
            let kinds = self.cfg.kinds.clone();
            let grace = self.cfg.grace;
            tokio::spawn(async move {
                let kinds = sweep_namespace(client, &namespace, kinds, grace).await;
                // The receiver is gone only after the pass timed out.
                let _ = tx.send(NamespaceReport { namespace, kinds }).await;
            });
        }
        drop(tx);

        let mut reports = Vec::with_capacity(expected);
        while let Some(report) = rx.recv().await {
            reports.push(report);
        }
        if reports.len() != expected {
            return Err(SweepError::Task(format!(
                "{} of {} namespace tasks reported",
                reports.len(),
                expected
            )));
        }
        Ok(reports)
    }
}

async fn sweep_namespace(
    client: Arc<dyn ResourceClient>,
    namespace: &str,
    kinds: Vec<Kind>,
    grace: Duration,
) -> Vec<KindReport> {
    let expected = kinds.len();
    if expected == 0 {
        return Vec::new();
    }
    let (tx, mut rx) = mpsc::channel(expected);
    for kind in kinds {
        let tx = tx.clone();
        let client = client.clone();
        let namespace = namespace.to_string();
        tokio::spawn(async move {
            let result = sweep_kind(client, kind.clone(), Some(&namespace), grace).await;
            let _ = tx.send(KindReport { kind, result }).await;
        });
    }
    drop(tx);

    let mut reports = Vec::with_capacity(expected);
    while let Some(report) = rx.recv().await {
        reports.push(report);
    }
    reports
}

/// Sweeps one kind in one scope. Ok(true) when nothing was there.
async fn sweep_kind(
    client: Arc<dyn ResourceClient>,
    kind: Kind,
    namespace: Option<&str>,
    grace: Duration,
) -> Result<bool, SweepError> {
    let scope = || namespace.unwrap_or("cluster").to_string();
    let everything = LabelSelector::everything();
    let objects = client
        .list(&kind, namespace, &everything)
        .await
        .map_err(|source| SweepError::List {
            kind: kind.clone(),
            scope: scope(),
            source,
        })?;
    if objects.is_empty() {
        return Ok(true);
    }

    let cutoff = chrono::Duration::from_std(grace)
        .ok()
        .and_then(|g| Utc::now().checked_sub_signed(g));
    for mut obj in objects {
        let stuck = match (obj.metadata.deletion_timestamp, cutoff) {
            (Some(ts), Some(cutoff)) => ts <= cutoff,
            _ => false,
        };
        if !stuck || obj.metadata.finalizers.is_empty() {
            continue;
        }
        let key = obj.key();
        obj.metadata.finalizers.clear();
        match client.update(&obj).await {
            Ok(_) => debug!(%key, "stripped finalizers"),
            // Gone already, or changed under us: the next pass looks again.
            Err(ClientError::NotFound(_)) | Err(ClientError::Conflict(_)) => {}
            Err(source) => {
                warn!(%key, error = %source, "cannot strip finalizers");
                return Err(SweepError::Cleanup {
                    kind,
                    scope: scope(),
                    source,
                });
            }
        }
    }

    let deleted = client
        .delete_collection(&kind, namespace, &everything, &DeleteOptions::background())
        .await;
    match deleted {
        Ok(()) | Err(ClientError::NotFound(_)) => Ok(false),
        Err(source) => {
            warn!(%kind, ?namespace, error = %source, "collection delete failed");
            Err(SweepError::Cleanup {
                kind,
                scope: scope(),
                source,
            })
        }
    }
}

#[cfg(test)]
mod sweeper_tests;
