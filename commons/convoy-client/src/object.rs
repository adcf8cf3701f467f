use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::api::Resource;
use crate::error::{ClientError, ClientResult};
use crate::kind::Kind;

/// `(namespace, name)` identity of an object within one kind. This is the
/// work-queue key of the reconciliation engine.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedName {
    pub namespace: Option<String>,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Fully qualified address of one object: `(kind, namespace, name)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: Kind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: Kind, namespace: Option<&str>, name: &str) -> Self {
        // Cluster-scoped kinds never carry a namespace.
        let namespace = if kind.namespaced() {
            namespace.map(str::to_string)
        } else {
            None
        };
        Self {
            kind,
            namespace,
            name: name.to_string(),
        }
    }

    pub fn namespaced_name(&self) -> NamespacedName {
        NamespacedName {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_owner_deletion: Option<bool>,
}

impl OwnerReference {
    /// Controller reference pointing at `owner`; `None` until the owner has
    /// been persisted and assigned a uid.
    pub fn controller_of(kind: &Kind, owner: &ObjectMeta) -> Option<Self> {
        Some(Self {
            api_version: kind.api_version(),
            kind: kind.name().to_string(),
            name: owner.name.clone(),
            uid: owner.uid.clone()?,
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }
}

/// Subset of Kubernetes object metadata the controllers rely on. The serde
/// shape matches the API server's so objects can cross the kube backend.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMeta {
    pub fn named(namespace: Option<&str>, name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, token: &str) -> bool {
        self.finalizers.iter().any(|f| f == token)
    }

    /// Returns true when the token was not present yet.
    pub fn add_finalizer(&mut self, token: &str) -> bool {
        if self.has_finalizer(token) {
            return false;
        }
        self.finalizers.push(token.to_string());
        true
    }

    /// Returns true when the token was present.
    pub fn remove_finalizer(&mut self, token: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != token);
        before != self.finalizers.len()
    }

    pub fn is_owned_by(&self, uid: &str) -> bool {
        self.owner_references.iter().any(|r| r.uid == uid)
    }
}

#[derive(Serialize, Deserialize)]
struct Wire {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(flatten)]
    data: Map<String, Value>,
}

/// Untyped object: metadata plus the remaining top-level fields (`spec`,
/// `status`, `data`, ...). Typed views convert to and from it through serde.
#[derive(Clone, Debug, PartialEq)]
pub struct Object {
    pub kind: Kind,
    pub metadata: ObjectMeta,
    pub data: Map<String, Value>,
}

impl Object {
    pub fn new(kind: Kind, namespace: Option<&str>, name: &str) -> Self {
        let namespace = namespace.filter(|_| kind.namespaced());
        Self {
            kind,
            metadata: ObjectMeta::named(namespace, name),
            data: Map::new(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(
            self.kind.clone(),
            self.metadata.namespace.as_deref(),
            &self.metadata.name,
        )
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    pub fn with_field(mut self, name: &str, value: Value) -> Self {
        self.data.insert(name.to_string(), value);
        self
    }

    pub fn status(&self) -> Option<&Value> {
        self.field("status")
    }

    pub fn from_value(kind: Kind, value: Value) -> ClientResult<Self> {
        let mut wire: Wire = serde_json::from_value(value)?;
        wire.data.remove("apiVersion");
        wire.data.remove("kind");
        Ok(Self {
            kind,
            metadata: wire.metadata,
            data: wire.data,
        })
    }

    /// API-server shaped JSON including `apiVersion` and `kind`.
    pub fn to_value(&self) -> ClientResult<Value> {
        let mut value = serde_json::to_value(Wire {
            metadata: self.metadata.clone(),
            data: self.data.clone(),
        })?;
        if let Value::Object(map) = &mut value {
            map.insert("apiVersion".into(), Value::String(self.kind.api_version()));
            map.insert("kind".into(), Value::String(self.kind.name().to_string()));
        }
        Ok(value)
    }

    pub fn from_resource<R: Resource>(resource: &R) -> ClientResult<Self> {
        Self::from_value(R::kind(), serde_json::to_value(resource)?)
    }

    pub fn to_resource<R: Resource>(&self) -> ClientResult<R> {
        if self.kind != R::kind() {
            return Err(ClientError::Invalid(format!(
                "expected {}, got {}",
                R::kind(),
                self.kind
            )));
        }
        Ok(serde_json::from_value(self.to_value()?)?)
    }
}
