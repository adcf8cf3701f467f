use std::fmt;

/// Kinds of object the controllers read or write. Built-in Kubernetes kinds
/// are enumerated; custom resources and cross-kind service requirements go
/// through [`Kind::Custom`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    Namespace,
    Pod,
    Job,
    Secret,
    Service,
    Deployment,
    StatefulSet,
    DaemonSet,
    PersistentVolumeClaim,
    PersistentVolume,
    Ingress,
    Custom(CustomKind),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CustomKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl Kind {
    /// A namespaced custom kind from an `apiVersion` such as
    /// `convoy.io/v1alpha1`. The plural is derived the same way kube's
    /// `ApiResource::from_gvk` does it.
    pub fn custom(api_version: &str, kind: &str) -> Kind {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.to_string()),
        };
        Kind::Custom(CustomKind {
            group,
            version,
            kind: kind.to_string(),
            plural: format!("{}s", kind.to_ascii_lowercase()),
            namespaced: true,
        })
    }

    pub fn group(&self) -> &str {
        match self {
            Kind::Namespace
            | Kind::Pod
            | Kind::Secret
            | Kind::Service
            | Kind::PersistentVolumeClaim
            | Kind::PersistentVolume => "",
            Kind::Job => "batch",
            Kind::Deployment | Kind::StatefulSet | Kind::DaemonSet => "apps",
            Kind::Ingress => "networking.k8s.io",
            Kind::Custom(c) => &c.group,
        }
    }

    pub fn version(&self) -> &str {
        match self {
            Kind::Custom(c) => &c.version,
            _ => "v1",
        }
    }

    pub fn api_version(&self) -> String {
        if self.group().is_empty() {
            self.version().to_string()
        } else {
            format!("{}/{}", self.group(), self.version())
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Kind::Namespace => "Namespace",
            Kind::Pod => "Pod",
            Kind::Job => "Job",
            Kind::Secret => "Secret",
            Kind::Service => "Service",
            Kind::Deployment => "Deployment",
            Kind::StatefulSet => "StatefulSet",
            Kind::DaemonSet => "DaemonSet",
            Kind::PersistentVolumeClaim => "PersistentVolumeClaim",
            Kind::PersistentVolume => "PersistentVolume",
            Kind::Ingress => "Ingress",
            Kind::Custom(c) => &c.kind,
        }
    }

    pub fn plural(&self) -> String {
        match self {
            Kind::Custom(c) => c.plural.clone(),
            Kind::Ingress => "ingresses".into(),
            other => format!("{}s", other.name().to_ascii_lowercase()),
        }
    }

    pub fn namespaced(&self) -> bool {
        match self {
            Kind::Namespace | Kind::PersistentVolume => false,
            Kind::Custom(c) => c.namespaced,
            _ => true,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group().is_empty() {
            write!(f, "{}", self.name())
        } else {
            write!(f, "{}.{}", self.name(), self.group())
        }
    }
}
