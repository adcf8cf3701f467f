//! [`ResourceClient`] backed by a live API server through `kube`.
//!
//! Every kind goes through `Api<DynamicObject>`; objects cross the boundary
//! as JSON so the same [`Object`] shape serves built-in and custom kinds.

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use kube::Client;
use kube::api::{
    Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
};
use kube::core::{ApiResource, GroupVersionKind};
use kube::runtime::watcher;
use serde_json::json;
use tracing::{debug, trace};

use crate::error::{ClientError, ClientResult};
use crate::kind::Kind;
use crate::object::{Object, ObjectKey};
use crate::selector::LabelSelector;
use crate::traits::{DeleteOptions, Propagation, ResourceClient, WatchEvent};

#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Uses the in-cluster service account or the local kubeconfig.
    pub async fn try_default() -> ClientResult<Self> {
        let client = Client::try_default().await.map_err(map_error)?;
        Ok(Self::new(client))
    }

    fn resource(kind: &Kind) -> ApiResource {
        let gvk = GroupVersionKind::gvk(kind.group(), kind.version(), kind.name());
        ApiResource::from_gvk_with_plural(&gvk, &kind.plural())
    }

    fn api(&self, kind: &Kind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = Self::resource(kind);
        match namespace.filter(|_| kind.namespaced()) {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }

    fn api_for(&self, key: &ObjectKey) -> Api<DynamicObject> {
        self.api(&key.kind, key.namespace.as_deref())
    }
}

fn map_error(e: kube::Error) -> ClientError {
    match e {
        kube::Error::Api(ae) => match ae.code {
            404 => ClientError::NotFound(ae.message),
            409 if ae.reason == "AlreadyExists" => ClientError::AlreadyExists(ae.message),
            409 => ClientError::Conflict(ae.message),
            410 => ClientError::ResourceExpired(ae.message),
            400 | 422 => ClientError::Invalid(ae.message),
            _ => ClientError::Backend(format!("{} ({}): {}", ae.reason, ae.code, ae.message)),
        },
        kube::Error::SerdeError(e) => ClientError::Serialization(e.to_string()),
        other => ClientError::Backend(other.to_string()),
    }
}

fn to_dynamic(obj: &Object) -> ClientResult<DynamicObject> {
    Ok(serde_json::from_value(obj.to_value()?)?)
}

fn from_dynamic(kind: &Kind, obj: DynamicObject) -> ClientResult<Object> {
    Object::from_value(kind.clone(), serde_json::to_value(obj)?)
}

fn delete_params(opts: &DeleteOptions) -> DeleteParams {
    let mut dp = match opts.propagation {
        Propagation::Background => DeleteParams::background(),
        Propagation::Foreground => DeleteParams::foreground(),
        Propagation::Orphan => DeleteParams::orphan(),
    };
    dp.grace_period_seconds = opts
        .grace_period_seconds
        .and_then(|s| u32::try_from(s).ok());
    dp
}

fn list_params(selector: &LabelSelector) -> ListParams {
    if selector.is_empty() {
        ListParams::default()
    } else {
        ListParams::default().labels(&selector.to_string())
    }
}

fn key_of(kind: &Kind, obj: &DynamicObject) -> ObjectKey {
    ObjectKey::new(
        kind.clone(),
        obj.metadata.namespace.as_deref(),
        obj.metadata.name.as_deref().unwrap_or_default(),
    )
}

#[async_trait]
impl ResourceClient for KubeClient {
    async fn get(&self, key: &ObjectKey) -> ClientResult<Object> {
        let obj = self
            .api_for(key)
            .get(&key.name)
            .await
            .map_err(map_error)?;
        from_dynamic(&key.kind, obj)
    }

    async fn create(&self, obj: &Object) -> ClientResult<Object> {
        let key = obj.key();
        trace!(%key, "kube: create");
        let created = self
            .api_for(&key)
            .create(&PostParams::default(), &to_dynamic(obj)?)
            .await
            .map_err(map_error)?;
        from_dynamic(&key.kind, created)
    }

    async fn update(&self, obj: &Object) -> ClientResult<Object> {
        let key = obj.key();
        trace!(%key, "kube: replace");
        let replaced = self
            .api_for(&key)
            .replace(&key.name, &PostParams::default(), &to_dynamic(obj)?)
            .await
            .map_err(map_error)?;
        from_dynamic(&key.kind, replaced)
    }

    async fn update_status(&self, obj: &Object) -> ClientResult<Object> {
        let key = obj.key();
        let status = obj.status().cloned().unwrap_or_default();
        let mut patch = json!({ "status": status });
        if let Some(rv) = &obj.metadata.resource_version {
            patch["metadata"] = json!({ "resourceVersion": rv });
        }
        trace!(%key, "kube: patch status");
        let patched = self
            .api_for(&key)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(map_error)?;
        from_dynamic(&key.kind, patched)
    }

    async fn delete(&self, key: &ObjectKey, opts: &DeleteOptions) -> ClientResult<()> {
        debug!(%key, propagation = ?opts.propagation, "kube: delete");
        self.api_for(key)
            .delete(&key.name, &delete_params(opts))
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn delete_collection(
        &self,
        kind: &Kind,
        namespace: Option<&str>,
        selector: &LabelSelector,
        opts: &DeleteOptions,
    ) -> ClientResult<()> {
        debug!(%kind, ?namespace, %selector, "kube: delete collection");
        self.api(kind, namespace)
            .delete_collection(&delete_params(opts), &list_params(selector))
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn list(
        &self,
        kind: &Kind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> ClientResult<Vec<Object>> {
        let list = self
            .api(kind, namespace)
            .list(&list_params(selector))
            .await
            .map_err(map_error)?;
        list.items
            .into_iter()
            .map(|o| from_dynamic(kind, o))
            .collect()
    }

    fn watch(
        &self,
        kind: &Kind,
        namespace: Option<&str>,
    ) -> BoxStream<'static, ClientResult<WatchEvent>> {
        let kind = kind.clone();
        watcher(self.api(&kind, namespace), watcher::Config::default())
            .filter_map(move |event| {
                let mapped = match event {
                    Ok(watcher::Event::Apply(o)) | Ok(watcher::Event::InitApply(o)) => {
                        Some(Ok(WatchEvent::Applied(key_of(&kind, &o))))
                    }
                    Ok(watcher::Event::Delete(o)) => {
                        Some(Ok(WatchEvent::Deleted(key_of(&kind, &o))))
                    }
                    Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => None,
                    Err(e) => Some(Err(ClientError::Backend(e.to_string()))),
                };
                futures_util::future::ready(mapped)
            })
            .boxed()
    }
}
