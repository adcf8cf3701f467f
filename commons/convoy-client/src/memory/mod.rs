use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::sync::{RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::trace;

use crate::error::{ClientError, ClientResult};
use crate::kind::Kind;
use crate::object::{Object, ObjectKey};
use crate::selector::LabelSelector;
use crate::traits::{DeleteOptions, Propagation, ResourceClient, WatchEvent};

const WATCH_BUFFER: usize = 1024;

type Store = BTreeMap<ObjectKey, Object>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Get,
    Create,
    Update,
    UpdateStatus,
    Delete,
    List,
}

#[derive(Clone, Debug)]
struct Fault {
    verb: Verb,
    kind: Kind,
    message: String,
}

/// In-process control plane: an arena of objects keyed by
/// `(kind, namespace, name)` whose owner references act as parent pointers.
///
/// Mirrors the API server semantics the controllers depend on: finalizers
/// hold deletion, resource versions detect stale writes, status is a separate
/// subresource and dependents are garbage-collected with their owner.
#[derive(Clone)]
pub struct MemoryClient {
    inner: Arc<Inner>,
}

struct Inner {
    store: RwLock<Store>,
    revision: AtomicU64,
    events: broadcast::Sender<WatchEvent>,
    faults: RwLock<Vec<Fault>>,
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryClient {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            inner: Arc::new(Inner {
                store: RwLock::new(BTreeMap::new()),
                revision: AtomicU64::new(0),
                events,
                faults: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Makes every subsequent `verb` call on `kind` fail with a backend error.
    pub async fn fail(&self, verb: Verb, kind: Kind, message: &str) {
        self.inner.faults.write().await.push(Fault {
            verb,
            kind,
            message: message.to_string(),
        });
    }

    pub async fn clear_faults(&self) {
        self.inner.faults.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.store.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.store.read().await.is_empty()
    }

    pub async fn contains(&self, key: &ObjectKey) -> bool {
        self.inner.store.read().await.contains_key(key)
    }

    /// Copy of every object of `kind`, in key order.
    pub async fn snapshot(&self, kind: &Kind) -> Vec<Object> {
        self.inner
            .store
            .read()
            .await
            .values()
            .filter(|o| &o.kind == kind)
            .cloned()
            .collect()
    }

    async fn check_fault(&self, verb: Verb, kind: &Kind) -> ClientResult<()> {
        let faults = self.inner.faults.read().await;
        match faults.iter().find(|f| f.verb == verb && &f.kind == kind) {
            Some(f) => Err(ClientError::Backend(f.message.clone())),
            None => Ok(()),
        }
    }

    fn next_revision(&self) -> String {
        (self.inner.revision.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn emit(&self, event: WatchEvent) {
        trace!(?event, "memory client: emit");
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn check_version(stored: &Object, incoming: &Object) -> ClientResult<()> {
        match &incoming.metadata.resource_version {
            Some(rv) if Some(rv) != stored.metadata.resource_version.as_ref() => {
                Err(ClientError::Conflict(format!(
                    "{}: resourceVersion {} is stale",
                    stored.key(),
                    rv
                )))
            }
            _ => Ok(()),
        }
    }

    /// Marks or removes `key`. Objects holding finalizers only get a deletion
    /// timestamp; the rest are removed together with their dependents.
    fn delete_locked(&self, store: &mut Store, key: &ObjectKey, cascade: bool) -> ClientResult<()> {
        let obj = store
            .get_mut(key)
            .ok_or_else(|| ClientError::NotFound(key.to_string()))?;
        if !obj.metadata.finalizers.is_empty() {
            if obj.metadata.deletion_timestamp.is_none() {
                obj.metadata.deletion_timestamp = Some(Utc::now());
                obj.metadata.resource_version = Some(self.next_revision());
                self.emit(WatchEvent::Applied(key.clone()));
            }
            return Ok(());
        }
        self.purge_locked(store, key, cascade);
        Ok(())
    }

    fn purge_locked(&self, store: &mut Store, key: &ObjectKey, cascade: bool) {
        let mut pending = vec![(key.clone(), cascade)];
        while let Some((key, cascade)) = pending.pop() {
            let Some(removed) = store.remove(&key) else {
                continue;
            };
            self.emit(WatchEvent::Deleted(key));
            let (true, Some(uid)) = (cascade, removed.metadata.uid) else {
                continue;
            };
            let dependents: Vec<ObjectKey> = store
                .values()
                .filter(|o| o.metadata.is_owned_by(&uid))
                .map(Object::key)
                .collect();
            for dep in dependents {
                let Some(child) = store.get_mut(&dep) else {
                    continue;
                };
                if child.metadata.finalizers.is_empty() {
                    pending.push((dep, true));
                } else if child.metadata.deletion_timestamp.is_none() {
                    child.metadata.deletion_timestamp = Some(Utc::now());
                    child.metadata.resource_version = Some(self.next_revision());
                    self.emit(WatchEvent::Applied(dep));
                }
            }
        }
    }
}

fn in_scope(obj: &Object, kind: &Kind, namespace: Option<&str>, selector: &LabelSelector) -> bool {
    &obj.kind == kind
        && namespace.is_none_or(|ns| obj.metadata.namespace.as_deref() == Some(ns))
        && selector.matches(&obj.metadata.labels)
}

#[async_trait]
impl ResourceClient for MemoryClient {
    async fn get(&self, key: &ObjectKey) -> ClientResult<Object> {
        self.check_fault(Verb::Get, &key.kind).await?;
        self.inner
            .store
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(key.to_string()))
    }

    async fn create(&self, obj: &Object) -> ClientResult<Object> {
        self.check_fault(Verb::Create, &obj.kind).await?;
        let key = obj.key();
        if key.name.is_empty() {
            return Err(ClientError::Invalid(format!("{} without a name", obj.kind)));
        }
        if obj.kind.namespaced() && key.namespace.is_none() {
            return Err(ClientError::Invalid(format!("{key} requires a namespace")));
        }
        let mut store = self.inner.store.write().await;
        if store.contains_key(&key) {
            return Err(ClientError::AlreadyExists(key.to_string()));
        }
        let mut stored = obj.clone();
        let revision = self.next_revision();
        stored.metadata.namespace = key.namespace.clone();
        stored.metadata.uid = Some(format!("uid-{revision}"));
        stored.metadata.resource_version = Some(revision);
        stored.metadata.generation = Some(1);
        stored.metadata.creation_timestamp = Some(Utc::now());
        stored.metadata.deletion_timestamp = None;
        store.insert(key.clone(), stored.clone());
        self.emit(WatchEvent::Applied(key));
        Ok(stored)
    }

    async fn update(&self, obj: &Object) -> ClientResult<Object> {
        self.check_fault(Verb::Update, &obj.kind).await?;
        let key = obj.key();
        let mut store = self.inner.store.write().await;
        let stored = store
            .get(&key)
            .ok_or_else(|| ClientError::NotFound(key.to_string()))?;
        Self::check_version(stored, obj)?;

        let mut next = obj.clone();
        // Status, identity and the deletion mark are server-owned.
        match stored.data.get("status") {
            Some(status) => next.data.insert("status".into(), status.clone()),
            None => next.data.remove("status"),
        };
        next.metadata.namespace = stored.metadata.namespace.clone();
        next.metadata.uid = stored.metadata.uid.clone();
        next.metadata.creation_timestamp = stored.metadata.creation_timestamp;
        next.metadata.deletion_timestamp = stored.metadata.deletion_timestamp;
        let generation = stored.metadata.generation.unwrap_or(1);
        let body_changed = {
            let mut a = stored.data.clone();
            let mut b = next.data.clone();
            a.remove("status");
            b.remove("status");
            a != b
        };
        next.metadata.generation = Some(if body_changed { generation + 1 } else { generation });
        next.metadata.resource_version = Some(self.next_revision());

        if next.metadata.is_deleting() && next.metadata.finalizers.is_empty() {
            store.insert(key.clone(), next.clone());
            self.purge_locked(&mut store, &key, true);
            return Ok(next);
        }
        store.insert(key.clone(), next.clone());
        self.emit(WatchEvent::Applied(key));
        Ok(next)
    }

    async fn update_status(&self, obj: &Object) -> ClientResult<Object> {
        self.check_fault(Verb::UpdateStatus, &obj.kind).await?;
        let key = obj.key();
        let mut store = self.inner.store.write().await;
        let stored = store
            .get_mut(&key)
            .ok_or_else(|| ClientError::NotFound(key.to_string()))?;
        Self::check_version(stored, obj)?;
        match obj.data.get("status") {
            Some(status) => stored.data.insert("status".into(), status.clone()),
            None => stored.data.remove("status"),
        };
        stored.metadata.resource_version = Some(self.next_revision());
        let updated = stored.clone();
        self.emit(WatchEvent::Applied(key));
        Ok(updated)
    }

    async fn delete(&self, key: &ObjectKey, opts: &DeleteOptions) -> ClientResult<()> {
        self.check_fault(Verb::Delete, &key.kind).await?;
        let mut store = self.inner.store.write().await;
        self.delete_locked(&mut store, key, opts.propagation != Propagation::Orphan)
    }

    async fn delete_collection(
        &self,
        kind: &Kind,
        namespace: Option<&str>,
        selector: &LabelSelector,
        opts: &DeleteOptions,
    ) -> ClientResult<()> {
        self.check_fault(Verb::Delete, kind).await?;
        let mut store = self.inner.store.write().await;
        let keys: Vec<ObjectKey> = store
            .values()
            .filter(|o| in_scope(o, kind, namespace, selector))
            .map(Object::key)
            .collect();
        for key in keys {
            match self.delete_locked(&mut store, &key, opts.propagation != Propagation::Orphan) {
                Ok(()) | Err(ClientError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn list(
        &self,
        kind: &Kind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> ClientResult<Vec<Object>> {
        self.check_fault(Verb::List, kind).await?;
        Ok(self
            .inner
            .store
            .read()
            .await
            .values()
            .filter(|o| in_scope(o, kind, namespace, selector))
            .cloned()
            .collect())
    }

    fn watch(
        &self,
        kind: &Kind,
        namespace: Option<&str>,
    ) -> BoxStream<'static, ClientResult<WatchEvent>> {
        let kind = kind.clone();
        let namespace = namespace.map(str::to_string);
        BroadcastStream::new(self.inner.events.subscribe())
            .filter_map(move |item| {
                let matched = match item {
                    Ok(event) => {
                        let key = event.key();
                        let in_ns = namespace
                            .as_deref()
                            .is_none_or(|ns| key.namespace.as_deref() == Some(ns));
                        (key.kind == kind && in_ns).then_some(Ok(event))
                    }
                    Err(BroadcastStreamRecvError::Lagged(n)) => Some(Err(
                        ClientError::ResourceExpired(format!("watch fell behind by {n} events")),
                    )),
                };
                futures_util::future::ready(matched)
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests;
