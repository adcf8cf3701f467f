//! CiJob sync handler.
//!
//! A pass walks the job towards completion one step at a time: claim the
//! object with the finalizer, mint the token secret, bring up every service
//! requirement, wait until all of them report ready, create the batch Job
//! and mirror its pod into status. Deletion tears the children down in the
//! reverse order before the finalizer is released.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use convoy_client::{
    Api, ClientError, Container, ContainerState, EnvVar, Job, JobSpec, Kind,
    LabelSelector, Object, ObjectKey, ObjectMeta, OwnerReference, Pod, PodSpec, PodTemplateSpec,
    Resource, Secret,
};
use convoy_runtime::{
    Cleanup, ReconcileError, SyncHandler, Teardown, ensure_finalizer, remove_finalizer,
};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, trace};

use super::{ControllerContext, SyncFault, find_or_create};
use crate::crd::ci_job::{
    CiJob, CiJobState, CiJobStatus, JOB_LABEL, PROJECT_ANNOTATION, ServiceRequirement,
    ServiceStatus,
};
use crate::crd::{FINALIZER, OWNER_LABEL};

pub const MAIN_CONTAINER: &str = "main";
pub const TOKEN_KEY: &str = "token";

pub fn token_secret_name(job: &str) -> String {
    format!("{job}-token")
}

pub struct CiJobController {
    ctx: Arc<ControllerContext>,
}

impl CiJobController {
    pub fn new(ctx: Arc<ControllerContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl SyncHandler for CiJobController {
    type Resource = CiJob;

    #[instrument(skip_all, fields(ns = %obj.namespace().unwrap_or("default"), name = %obj.name()))]
    async fn sync(&self, obj: CiJob) -> Result<(), ReconcileError> {
        reconcile(&self.ctx, obj).await
    }
}

async fn reconcile(ctx: &ControllerContext, mut obj: CiJob) -> Result<(), ReconcileError> {
    let ns = obj.namespace().unwrap_or("default").to_string();
    let name = obj.name().to_string();
    let api: Api<CiJob> = Api::namespaced(ctx.client.clone(), &ns);

    if obj.meta().is_deleting() {
        info!(%ns, %name, "reconcile: deletion timestamp detected; starting child cleanup");
        return finalize(ctx, &api, obj, &ns, &name).await;
    }

    if ensure_finalizer(&api, &mut obj, FINALIZER).await? {
        info!(%ns, %name, "reconcile: finalizer added");
        return Ok(());
    }

    let generation = obj.meta().generation;
    if let Some(current) = &obj.status {
        let settled = matches!(current.state, CiJobState::Error | CiJobState::Terminated);
        if settled && current.observed_generation == generation {
            trace!(%ns, %name, state = ?current.state, "reconcile: settled for this generation");
            return Ok(());
        }
    }

    let next = match evaluate(ctx, &obj, &ns, &name).await {
        Ok(status) => status,
        Err(SyncFault::Domain(msg)) => {
            info!(%ns, %name, error = %msg, "reconcile: job failed");
            CiJobStatus::error(msg, generation)
        }
        Err(SyncFault::Transient(e)) => return Err(e),
    };
    write_status(&api, obj, next).await
}

/// Writes `next` unless it matches what is already stored.
async fn write_status(
    api: &Api<CiJob>,
    mut obj: CiJob,
    next: CiJobStatus,
) -> Result<(), ReconcileError> {
    if obj.status.as_ref() == Some(&next) {
        trace!(name = %obj.name(), "status unchanged");
        return Ok(());
    }
    debug!(name = %obj.name(), state = ?next.state, "status: writing");
    obj.status = Some(next);
    api.replace_status(&obj).await?;
    Ok(())
}

async fn evaluate(
    ctx: &ControllerContext,
    obj: &CiJob,
    ns: &str,
    name: &str,
) -> Result<CiJobStatus, SyncFault> {
    let generation = obj.meta().generation;
    let project = obj
        .meta()
        .annotations
        .get(PROJECT_ANNOTATION)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| SyncFault::Domain(format!("missing annotation {PROJECT_ANNOTATION}")))?;
    let owner = obj.controller_ref();

    ensure_token(ctx, ns, name, project, owner.as_ref()).await?;

    let services = ensure_services(ctx, &obj.spec.services, ns, name, owner.as_ref()).await?;
    let waiting: Vec<&str> = services
        .iter()
        .filter(|(_, s)| !s.ready)
        .map(|(n, _)| n.as_str())
        .collect();
    if !waiting.is_empty() {
        return Ok(CiJobStatus {
            state: CiJobState::Pending,
            message: Some(format!("waiting for services: {}", waiting.join(", "))),
            services,
            observed_generation: generation,
            ..Default::default()
        });
    }

    let job = ensure_job(ctx, obj, ns, name, project).await?;
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), ns);
    let pods = pods.list(&LabelSelector::matching(JOB_LABEL, name)).await?;

    let mut status = status_from_pods(&job, &pods);
    status.job_name = Some(name.to_string());
    status.services = services;
    status.observed_generation = generation;
    Ok(status)
}

fn child_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(OWNER_LABEL.to_string(), name.to_string())])
}

async fn ensure_token(
    ctx: &ControllerContext,
    ns: &str,
    name: &str,
    project: &str,
    owner: Option<&OwnerReference>,
) -> Result<(), SyncFault> {
    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), ns);
    let secret_name = token_secret_name(name);
    if api.get_opt(&secret_name).await?.is_some() {
        return Ok(());
    }
    let token = ctx
        .tokens
        .issue(project, name)
        .map_err(|e| SyncFault::Transient(ReconcileError::Internal(e.to_string())))?;
    let secret = Secret {
        metadata: ObjectMeta {
            labels: child_labels(name),
            owner_references: owner.cloned().into_iter().collect(),
            ..ObjectMeta::named(Some(ns), &secret_name)
        },
        type_: Some("Opaque".into()),
        string_data: BTreeMap::from([(TOKEN_KEY.to_string(), token)]),
        ..Default::default()
    };
    match api.create(&secret).await {
        Ok(_) => info!(%ns, %name, secret = %secret_name, "reconcile: token secret created"),
        Err(ClientError::AlreadyExists(_)) => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Creates any missing service child and reports each one's readiness.
/// A child reporting an error fails the whole job with its message.
async fn ensure_services(
    ctx: &ControllerContext,
    services: &[ServiceRequirement],
    ns: &str,
    name: &str,
    owner: Option<&OwnerReference>,
) -> Result<BTreeMap<String, ServiceStatus>, SyncFault> {
    let mut out = BTreeMap::new();
    for svc in services {
        let mut desired = Object::new(svc.kind(), Some(ns), &svc.child_name(name))
            .with_field("spec", Value::Object(svc.spec.clone()));
        desired.metadata.labels = child_labels(name);
        desired.metadata.owner_references.extend(owner.cloned());

        let live = find_or_create(ctx.client.as_ref(), &desired).await?;
        let status = match readiness(&live) {
            Readiness::Failed(msg) => return Err(SyncFault::Domain(msg)),
            Readiness::Ready => ServiceStatus {
                ready: true,
                message: None,
            },
            Readiness::NotReady(message) => ServiceStatus {
                ready: false,
                message,
            },
        };
        out.insert(svc.name.clone(), status);
    }
    Ok(out)
}

#[derive(Debug, PartialEq, Eq)]
enum Readiness {
    Ready,
    NotReady(Option<String>),
    Failed(String),
}

/// Reads a service child's status. Children either carry the same `state`
/// vocabulary as CiJob (`ready`, `error`) or a plain `ready` flag.
fn readiness(child: &Object) -> Readiness {
    let Some(status) = child.status() else {
        return Readiness::NotReady(None);
    };
    let message = status
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string);
    match status.get("state").and_then(Value::as_str) {
        Some("ready") => return Readiness::Ready,
        Some("error") | Some("failed") => {
            return Readiness::Failed(
                message.unwrap_or_else(|| format!("service {} failed", child.metadata.name)),
            );
        }
        _ => {}
    }
    if status.get("ready").and_then(Value::as_bool) == Some(true) {
        Readiness::Ready
    } else {
        Readiness::NotReady(message)
    }
}

fn job_template(obj: &CiJob, ns: &str, name: &str, project: &str) -> Job {
    let mut env: Vec<EnvVar> = obj
        .spec
        .env
        .iter()
        .map(|(k, v)| EnvVar {
            name: k.clone(),
            value: Some(v.clone()),
            value_from: None,
        })
        .collect();
    env.push(EnvVar {
        name: "CONVOY_PROJECT".into(),
        value: Some(project.to_string()),
        value_from: None,
    });
    env.push(EnvVar {
        name: "CONVOY_TOKEN".into(),
        value: None,
        value_from: Some(json!({
            "secretKeyRef": {"name": token_secret_name(name), "key": TOKEN_KEY}
        })),
    });

    let command = if obj.spec.commands.is_empty() {
        Vec::new()
    } else {
        vec![
            "/bin/sh".to_string(),
            "-ec".to_string(),
            obj.spec.commands.join("\n"),
        ]
    };

    let mut pod_labels = child_labels(name);
    pod_labels.insert(JOB_LABEL.to_string(), name.to_string());

    Job {
        metadata: ObjectMeta {
            labels: child_labels(name),
            owner_references: obj.controller_ref().into_iter().collect(),
            ..ObjectMeta::named(Some(ns), name)
        },
        spec: JobSpec {
            // The CiJob is the unit of retry, not the pod.
            backoff_limit: Some(0),
            active_deadline_seconds: obj.spec.active_deadline_seconds,
            template: PodTemplateSpec {
                metadata: ObjectMeta {
                    labels: pod_labels,
                    ..Default::default()
                },
                spec: PodSpec {
                    containers: vec![Container {
                        name: MAIN_CONTAINER.into(),
                        image: Some(obj.spec.image.clone()),
                        command,
                        env,
                        ..Default::default()
                    }],
                    restart_policy: Some("Never".into()),
                },
            },
        },
        ..Default::default()
    }
}

async fn ensure_job(
    ctx: &ControllerContext,
    obj: &CiJob,
    ns: &str,
    name: &str,
    project: &str,
) -> Result<Job, SyncFault> {
    let api: Api<Job> = Api::namespaced(ctx.client.clone(), ns);
    if let Some(job) = api.get_opt(name).await? {
        return Ok(job);
    }
    let job = job_template(obj, ns, name, project);
    match api.create(&job).await {
        Ok(created) => {
            info!(%ns, %name, image = %obj.spec.image, "reconcile: job created");
            Ok(created)
        }
        Err(ClientError::AlreadyExists(_)) => Ok(api.get(name).await?),
        Err(e) => Err(e.into()),
    }
}

/// Projects the job's newest pod onto a CiJob status. Only the `main`
/// container counts. Once the Job exists the CiJob is `running` until its
/// pod terminates; a pod that has not started yet only shows in `message`.
fn status_from_pods(job: &Job, pods: &[Pod]) -> CiJobStatus {
    let newest = pods
        .iter()
        .max_by_key(|p| (p.metadata.creation_timestamp, p.metadata.name.clone()));
    let Some(pod) = newest else {
        let failed = job.status.failed.unwrap_or(0) > 0;
        return CiJobStatus {
            state: if failed {
                CiJobState::Terminated
            } else {
                CiJobState::Running
            },
            message: Some(if failed {
                "job failed before its pod reported".into()
            } else {
                "waiting for job pod".into()
            }),
            ..Default::default()
        };
    };

    match pod.container_state(MAIN_CONTAINER) {
        None | Some(ContainerState::Unknown) => CiJobStatus {
            state: CiJobState::Running,
            message: Some(format!("pod {} scheduled", pod.metadata.name)),
            ..Default::default()
        },
        Some(ContainerState::Waiting { reason, message }) => CiJobStatus {
            state: CiJobState::Running,
            message: match (reason, message) {
                (Some(r), Some(m)) => Some(format!("{r}: {m}")),
                (r, m) => r.clone().or_else(|| m.clone()),
            },
            ..Default::default()
        },
        Some(ContainerState::Running { started_at }) => CiJobStatus {
            state: CiJobState::Running,
            started_at: started_at.or(pod.status.start_time),
            ..Default::default()
        },
        Some(ContainerState::Terminated {
            exit_code,
            reason,
            message,
            started_at,
            finished_at,
        }) => CiJobStatus {
            state: CiJobState::Terminated,
            message: message.clone().or_else(|| reason.clone()),
            started_at: *started_at,
            finished_at: *finished_at,
            exit_code: Some(*exit_code),
            ..Default::default()
        },
    }
}

async fn finalize(
    ctx: &ControllerContext,
    api: &Api<CiJob>,
    mut obj: CiJob,
    ns: &str,
    name: &str,
) -> Result<(), ReconcileError> {
    if !obj.meta().has_finalizer(FINALIZER) {
        return Ok(());
    }

    let mut status = obj.status.clone().unwrap_or_default();
    if status.state != CiJobState::Deleting {
        status.state = CiJobState::Deleting;
        status.message = Some("tearing down children".into());
        obj.status = Some(status);
        obj = api.replace_status(&obj).await?;
    }

    let mut teardown = Teardown::new(ctx.client.clone());
    // Services go first: the job may still be talking to them.
    teardown
        .confirm(
            obj.spec
                .services
                .iter()
                .map(|s| ObjectKey::new(s.kind(), Some(ns), &s.child_name(name))),
        )
        .await?;
    teardown
        .fire(&ObjectKey::new(Kind::Job, Some(ns), name))
        .await?;
    teardown
        .sweep(&Kind::Pod, ns, &LabelSelector::matching(JOB_LABEL, name))
        .await?;
    teardown
        .fire(&ObjectKey::new(Kind::Secret, Some(ns), &token_secret_name(name)))
        .await?;

    match teardown.finish() {
        Cleanup::Done => {
            info!(%ns, %name, "reconcile: children gone; removing finalizer");
            remove_finalizer(api, &mut obj, FINALIZER).await?;
        }
        Cleanup::Pending(left) => {
            info!(%ns, %name, remaining = left.len(), "reconcile: children still terminating");
            debug!(%ns, %name, ?left, "teardown pending");
        }
    }
    Ok(())
}
