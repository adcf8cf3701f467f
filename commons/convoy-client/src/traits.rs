use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::ClientResult;
use crate::kind::Kind;
use crate::object::{Object, ObjectKey};
use crate::selector::LabelSelector;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Propagation {
    /// Dependents are garbage-collected after the owner is gone.
    #[default]
    Background,
    Foreground,
    /// Dependents are left in place.
    Orphan,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    pub propagation: Propagation,
    pub grace_period_seconds: Option<i64>,
}

impl DeleteOptions {
    pub fn background() -> Self {
        Self::default()
    }

    pub fn foreground() -> Self {
        Self {
            propagation: Propagation::Foreground,
            ..Default::default()
        }
    }
}

/// Change notification. Only the key is carried: consumers always re-read the
/// object instead of trusting an event payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    Applied(ObjectKey),
    Deleted(ObjectKey),
}

impl WatchEvent {
    pub fn key(&self) -> &ObjectKey {
        match self {
            WatchEvent::Applied(k) | WatchEvent::Deleted(k) => k,
        }
    }
}

/// Minimal capability surface of the control-plane API. Every controller is
/// written against this trait, never against a concrete client.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> ClientResult<Object>;

    /// Fails with `AlreadyExists` when the key is taken.
    async fn create(&self, obj: &Object) -> ClientResult<Object>;

    /// Replaces metadata and body (not status). A stale `resourceVersion`
    /// fails with `Conflict`.
    async fn update(&self, obj: &Object) -> ClientResult<Object>;

    /// Replaces only the `status` field.
    async fn update_status(&self, obj: &Object) -> ClientResult<Object>;

    async fn delete(&self, key: &ObjectKey, opts: &DeleteOptions) -> ClientResult<()>;

    async fn delete_collection(
        &self,
        kind: &Kind,
        namespace: Option<&str>,
        selector: &LabelSelector,
        opts: &DeleteOptions,
    ) -> ClientResult<()>;

    /// `namespace == None` lists across all namespaces.
    async fn list(
        &self,
        kind: &Kind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> ClientResult<Vec<Object>>;

    fn watch(
        &self,
        kind: &Kind,
        namespace: Option<&str>,
    ) -> BoxStream<'static, ClientResult<WatchEvent>>;
}
