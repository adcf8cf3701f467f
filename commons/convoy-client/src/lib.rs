//! Narrow facade over the control-plane API used by every convoy controller.
//!
//! Controllers talk to a [`ResourceClient`] trait object. The `memory`
//! backend is an in-process arena used by tests and the dev profile; the
//! `kube` backend forwards to a real API server.

pub mod api;
pub mod builtin;
pub mod error;
pub mod kind;
pub mod object;
pub mod selector;
pub mod traits;

#[cfg(feature = "kube")]
pub mod kube;
#[cfg(feature = "memory")]
pub mod memory;

pub use api::{Api, Resource};
pub use builtin::{
    Container, ContainerState, ContainerStatus, EnvVar, Job, JobSpec, JobStatus, Namespace, Pod,
    PodSpec, PodStatus, PodTemplateSpec, Secret,
};
pub use error::{ClientError, ClientResult, ClientResultExt};
pub use kind::{CustomKind, Kind};
pub use object::{NamespacedName, Object, ObjectKey, ObjectMeta, OwnerReference};
pub use selector::LabelSelector;
pub use traits::{DeleteOptions, Propagation, ResourceClient, WatchEvent};

#[cfg(feature = "kube")]
pub use kube::KubeClient;
#[cfg(feature = "memory")]
pub use memory::MemoryClient;
