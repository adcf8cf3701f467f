use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use convoy_client::{Kind, ObjectMeta, impl_resource};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::GROUP_VERSION;

/// Annotation naming the project a job belongs to. Required.
pub const PROJECT_ANNOTATION: &str = "convoy.io/project";

/// Label on the job's pods, valued with the CiJob name.
pub const JOB_LABEL: &str = "convoy.io/job";

pub fn kind() -> Kind {
    Kind::custom(GROUP_VERSION, "CiJob")
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CiJob {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: CiJobSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CiJobStatus>,
}
impl_resource!(CiJob, kind());

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CiJobSpec {
    pub image: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Services that must be ready before the job starts.
    #[serde(default)]
    pub services: Vec<ServiceRequirement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,
}

/// A dependent object of any kind, e.g. a database the job talks to.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRequirement {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    /// Everything else becomes the child's spec.
    #[serde(flatten)]
    pub spec: Map<String, Value>,
}

impl ServiceRequirement {
    pub fn kind(&self) -> Kind {
        Kind::custom(&self.api_version, &self.kind)
    }

    /// Name of the child object created for `job`.
    pub fn child_name(&self, job: &str) -> String {
        format!("{}-{}", job, self.name)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CiJobState {
    #[default]
    Pending,
    Running,
    Terminated,
    Error,
    Deleting,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CiJobStatus {
    #[serde(default)]
    pub state: CiJobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, ServiceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl CiJobStatus {
    pub fn error(message: impl Into<String>, generation: Option<i64>) -> Self {
        Self {
            state: CiJobState::Error,
            message: Some(message.into()),
            observed_generation: generation,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn service_extension_fields_are_kept() {
        let spec: CiJobSpec = serde_json::from_value(json!({
            "image": "rust:1.85",
            "commands": ["cargo test"],
            "services": [{
                "apiVersion": "db.convoy.io/v1",
                "kind": "Postgres",
                "name": "db",
                "version": "16",
                "storage": {"size": "1Gi"}
            }]
        }))
        .unwrap();
        let svc = &spec.services[0];
        assert_eq!(svc.kind(), Kind::custom("db.convoy.io/v1", "Postgres"));
        assert_eq!(svc.child_name("build-7"), "build-7-db");
        assert_eq!(svc.spec["version"], "16");
        assert_eq!(svc.spec["storage"]["size"], "1Gi");
        assert!(!svc.spec.contains_key("name"));
    }

    #[test]
    fn status_uses_lowercase_states() {
        let v = serde_json::to_value(CiJobStatus::error("boom", Some(2))).unwrap();
        assert_eq!(v, json!({"state": "error", "message": "boom", "observedGeneration": 2}));
    }
}
