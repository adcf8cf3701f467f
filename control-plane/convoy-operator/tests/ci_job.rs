use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use convoy_client::{
    Api, ContainerState, ContainerStatus, Job, Kind, LabelSelector, MemoryClient, Object,
    ObjectKey, ObjectMeta, Pod, PodStatus, Resource, ResourceClient, Secret,
};
use convoy_operator::config::ConvoyConfig;
use convoy_operator::controller::{CiJobController, ControllerContext};
use convoy_operator::credentials::StaticTokenIssuer;
use convoy_operator::crd::ci_job::{
    CiJob, CiJobSpec, CiJobState, JOB_LABEL, PROJECT_ANNOTATION, ServiceRequirement,
};
use convoy_operator::crd::{FINALIZER, OWNER_LABEL};
use convoy_operator::runtime::ci_job_controller;
use convoy_runtime::SyncHandler;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

const NS: &str = "ci";
const HOLD: &str = "test.convoy.io/hold";

struct Harness {
    mem: MemoryClient,
    ctrl: CiJobController,
    api: Api<CiJob>,
}

impl Harness {
    fn new() -> Self {
        let mem = MemoryClient::new();
        let client: Arc<dyn ResourceClient> = Arc::new(mem.clone());
        let ctx = ControllerContext::new(
            client.clone(),
            ConvoyConfig {
                seed: Some(1),
                ..Default::default()
            },
            Arc::new(StaticTokenIssuer::new("tok")),
        );
        Self {
            mem,
            ctrl: CiJobController::new(Arc::new(ctx)),
            api: Api::namespaced(client, NS),
        }
    }

    async fn submit(&self, name: &str, services: Vec<ServiceRequirement>, project: bool) {
        let mut metadata = ObjectMeta::named(Some(NS), name);
        if project {
            metadata
                .annotations
                .insert(PROJECT_ANNOTATION.into(), "payments".into());
        }
        let job = CiJob {
            metadata,
            spec: CiJobSpec {
                image: "rust:1.85".into(),
                commands: vec!["cargo test".into()],
                services,
                ..Default::default()
            },
            status: None,
        };
        self.api.create(&job).await.unwrap();
    }

    /// One sync pass against the latest stored object.
    async fn pass(&self, name: &str) {
        let obj = self.api.get(name).await.unwrap();
        self.ctrl.sync(obj).await.unwrap();
    }

    async fn get(&self, name: &str) -> CiJob {
        self.api.get(name).await.unwrap()
    }

    async fn set_child_status(&self, key: &ObjectKey, status: Value) {
        let child = self.mem.get(key).await.unwrap().with_field("status", status);
        self.mem.update_status(&child).await.unwrap();
    }

    async fn create_pod(&self, job: &str, state: ContainerState) -> Pod {
        let mut metadata = ObjectMeta::named(Some(NS), &format!("{job}-x7k2p"));
        metadata.labels.insert(JOB_LABEL.into(), job.into());
        let pod = Pod {
            metadata,
            status: PodStatus {
                container_statuses: vec![ContainerStatus {
                    name: "main".into(),
                    state,
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        };
        Api::<Pod>::namespaced(Arc::new(self.mem.clone()), NS)
            .create(&pod)
            .await
            .unwrap()
    }
}

fn postgres() -> ServiceRequirement {
    let mut spec = Map::new();
    spec.insert("version".into(), json!("16"));
    ServiceRequirement {
        api_version: "db.convoy.io/v1".into(),
        kind: "Postgres".into(),
        name: "db".into(),
        spec,
    }
}

fn db_key(job: &str) -> ObjectKey {
    ObjectKey::new(
        Kind::custom("db.convoy.io/v1", "Postgres"),
        Some(NS),
        &format!("{job}-db"),
    )
}

#[test_log::test(tokio::test)]
async fn first_pass_only_claims_the_object() {
    let h = Harness::new();
    h.submit("build", vec![postgres()], true).await;

    h.pass("build").await;
    let job = h.get("build").await;
    assert!(job.meta().has_finalizer(FINALIZER));
    assert!(job.status.is_none());
    assert_eq!(h.mem.len().await, 1);
}

#[test_log::test(tokio::test)]
async fn runs_job_once_services_are_ready() {
    let h = Harness::new();
    h.submit("build", vec![postgres()], true).await;
    h.pass("build").await;

    // Services come up first; the job waits for them.
    h.pass("build").await;
    let status = h.get("build").await.status.unwrap();
    assert_eq!(status.state, CiJobState::Pending);
    assert!(!status.services["db"].ready);
    let child = h.mem.get(&db_key("build")).await.unwrap();
    assert_eq!(child.field("spec").unwrap()["version"], "16");
    assert_eq!(child.metadata.labels[OWNER_LABEL], "build");
    assert_eq!(
        child.metadata.owner_references[0].uid,
        h.get("build").await.meta().uid.clone().unwrap()
    );
    let secret = Api::<Secret>::namespaced(Arc::new(h.mem.clone()), NS)
        .get("build-token")
        .await
        .unwrap();
    assert_eq!(secret.string_data["token"], "tok");
    assert!(h.mem.snapshot(&Kind::Job).await.is_empty());

    h.set_child_status(&db_key("build"), json!({"state": "ready"}))
        .await;
    h.pass("build").await;
    let status = h.get("build").await.status.unwrap();
    assert_eq!(status.state, CiJobState::Running);
    assert_eq!(status.message.as_deref(), Some("waiting for job pod"));
    assert_eq!(status.job_name.as_deref(), Some("build"));
    assert!(status.services["db"].ready);
    let batch = Api::<Job>::namespaced(Arc::new(h.mem.clone()), NS)
        .get("build")
        .await
        .unwrap();
    assert_eq!(batch.spec.backoff_limit, Some(0));
    assert_eq!(batch.spec.template.metadata.labels[JOB_LABEL], "build");

    let pod = h
        .create_pod(
            "build",
            ContainerState::Running {
                started_at: Some(Utc::now()),
            },
        )
        .await;
    h.pass("build").await;
    let status = h.get("build").await.status.unwrap();
    assert_eq!(status.state, CiJobState::Running);
    assert_eq!(status.message, None);
    assert!(status.started_at.is_some());

    let finished = Pod {
        status: PodStatus {
            container_statuses: vec![ContainerStatus {
                name: "main".into(),
                state: ContainerState::Terminated {
                    exit_code: 1,
                    reason: Some("Error".into()),
                    message: None,
                    started_at: None,
                    finished_at: Some(Utc::now()),
                },
                ..Default::default()
            }],
            ..Default::default()
        },
        ..pod
    };
    h.mem
        .update_status(&Object::from_resource(&finished).unwrap())
        .await
        .unwrap();

    h.pass("build").await;
    let done = h.get("build").await;
    let status = done.status.clone().unwrap();
    assert_eq!(status.state, CiJobState::Terminated);
    assert_eq!(status.exit_code, Some(1));
    assert_eq!(status.observed_generation, done.meta().generation);

    // Settled: further passes write nothing.
    h.pass("build").await;
    assert_eq!(
        h.get("build").await.meta().resource_version,
        done.meta().resource_version
    );
}

#[test_log::test(tokio::test)]
async fn repeated_passes_create_each_child_once() {
    let h = Harness::new();
    h.submit("build", vec![postgres()], true).await;
    for _ in 0..4 {
        h.pass("build").await;
    }
    h.set_child_status(&db_key("build"), json!({"ready": true}))
        .await;
    for _ in 0..4 {
        h.pass("build").await;
    }
    let owned = LabelSelector::matching(OWNER_LABEL, "build");
    for kind in [
        Kind::Secret,
        Kind::Job,
        Kind::custom("db.convoy.io/v1", "Postgres"),
    ] {
        let found = h.mem.list(&kind, Some(NS), &owned).await.unwrap();
        assert_eq!(found.len(), 1, "{kind}");
    }
    assert!(h.get("build").await.meta().has_finalizer(FINALIZER));
}

#[test_log::test(tokio::test)]
async fn failed_service_fails_the_job_with_its_message() {
    let h = Harness::new();
    h.submit("build", vec![postgres()], true).await;
    h.pass("build").await;
    h.pass("build").await;

    h.set_child_status(
        &db_key("build"),
        json!({"state": "error", "message": "database crashed"}),
    )
    .await;
    h.pass("build").await;
    let failed = h.get("build").await;
    let status = failed.status.clone().unwrap();
    assert_eq!(status.state, CiJobState::Error);
    assert_eq!(status.message.as_deref(), Some("database crashed"));
    assert!(h.mem.snapshot(&Kind::Job).await.is_empty());

    h.pass("build").await;
    assert_eq!(
        h.get("build").await.meta().resource_version,
        failed.meta().resource_version
    );
}

#[test_log::test(tokio::test)]
async fn missing_project_annotation_is_an_error() {
    let h = Harness::new();
    h.submit("build", Vec::new(), false).await;
    h.pass("build").await;
    h.pass("build").await;

    let status = h.get("build").await.status.unwrap();
    assert_eq!(status.state, CiJobState::Error);
    assert_eq!(
        status.message.as_deref(),
        Some("missing annotation convoy.io/project")
    );
    assert!(h.mem.snapshot(&Kind::Secret).await.is_empty());
}

#[test_log::test(tokio::test)]
async fn deletion_waits_for_children_before_releasing() {
    let h = Harness::new();
    h.submit("build", vec![postgres()], true).await;
    h.pass("build").await;
    h.pass("build").await;
    h.set_child_status(&db_key("build"), json!({"state": "ready"}))
        .await;
    h.pass("build").await;
    h.create_pod("build", ContainerState::Running { started_at: None })
        .await;

    // Something else holds the service open.
    let mut child = h.mem.get(&db_key("build")).await.unwrap();
    child.metadata.add_finalizer(HOLD);
    h.mem.update(&child).await.unwrap();

    h.api.delete("build").await.unwrap();
    h.pass("build").await;
    let deleting = h.get("build").await;
    assert_eq!(deleting.status.unwrap().state, CiJobState::Deleting);
    assert!(deleting.metadata.has_finalizer(FINALIZER));
    assert!(
        h.mem
            .get(&db_key("build"))
            .await
            .unwrap()
            .metadata
            .is_deleting()
    );
    // The job is not touched while a service is still there.
    assert_eq!(h.mem.snapshot(&Kind::Job).await.len(), 1);

    let mut child = h.mem.get(&db_key("build")).await.unwrap();
    child.metadata.remove_finalizer(HOLD);
    h.mem.update(&child).await.unwrap();
    assert!(!h.mem.contains(&db_key("build")).await);

    h.pass("build").await;
    assert!(h.mem.snapshot(&Kind::Job).await.is_empty());
    assert!(h.mem.snapshot(&Kind::Pod).await.is_empty());
    assert!(h.mem.snapshot(&Kind::Secret).await.is_empty());
    // The pods were still listed this pass, so the finalizer stays.
    assert!(h.get("build").await.meta().has_finalizer(FINALIZER));

    h.pass("build").await;
    assert!(h.api.get_opt("build").await.unwrap().is_none());
    assert!(h.mem.is_empty().await);
}

#[test_log::test(tokio::test)]
async fn env_is_passed_to_the_job() {
    let h = Harness::new();
    let mut job = CiJob {
        metadata: ObjectMeta::named(Some(NS), "env"),
        spec: CiJobSpec {
            image: "alpine".into(),
            env: BTreeMap::from([("MODE".to_string(), "fast".to_string())]),
            ..Default::default()
        },
        status: None,
    };
    job.metadata
        .annotations
        .insert(PROJECT_ANNOTATION.into(), "payments".into());
    h.api.create(&job).await.unwrap();
    h.pass("env").await;
    h.pass("env").await;

    let batch = Api::<Job>::namespaced(Arc::new(h.mem.clone()), NS)
        .get("env")
        .await
        .unwrap();
    let env = &batch.spec.template.spec.containers[0].env;
    assert!(
        env.iter()
            .any(|e| e.name == "MODE" && e.value.as_deref() == Some("fast"))
    );
    assert!(
        env.iter()
            .any(|e| e.name == "CONVOY_PROJECT" && e.value.as_deref() == Some("payments"))
    );
}

/// Polls the stored CiJob until `pred` holds.
async fn wait_for_status(api: &Api<CiJob>, name: &str, pred: impl Fn(&CiJob) -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(job) = api.get_opt(name).await.unwrap() {
                if pred(&job) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("CiJob never reached the expected status");
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn pod_and_service_changes_wake_the_job_without_resync() {
    let h = Harness::new();
    let client: Arc<dyn ResourceClient> = Arc::new(h.mem.clone());
    let mut cfg = ConvoyConfig {
        service_kinds: Some("db.convoy.io/v1/Postgres".into()),
        ..Default::default()
    };
    cfg.engine.resync_secs = Some(0);
    let ctx = Arc::new(ControllerContext::new(
        client.clone(),
        cfg.clone(),
        Arc::new(StaticTokenIssuer::new("tok")),
    ));
    let ctrl = ci_job_controller(client, ctx, &cfg, cfg.service_kinds().unwrap());
    let shutdown = CancellationToken::new();
    let running = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { ctrl.run(1, shutdown).await })
    };

    h.submit("build", vec![postgres()], true).await;
    wait_for_status(&h.api, "build", |j| {
        j.status.as_ref().is_some_and(|s| s.services.contains_key("db"))
    })
    .await;

    h.set_child_status(&db_key("build"), json!({"state": "ready"}))
        .await;
    wait_for_status(&h.api, "build", |j| {
        j.status.as_ref().is_some_and(|s| s.job_name.is_some())
    })
    .await;

    h.create_pod(
        "build",
        ContainerState::Running {
            started_at: Some(Utc::now()),
        },
    )
    .await;
    wait_for_status(&h.api, "build", |j| {
        j.status.as_ref().is_some_and(|s| s.started_at.is_some())
    })
    .await;

    shutdown.cancel();
    running.await.unwrap().unwrap();
}
