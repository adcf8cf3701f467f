//! Finalizer-gated deletion.
//!
//! A controller claims an object by adding its finalizer token, and releases
//! it only once every child it created is confirmed gone. [`Teardown`] runs
//! the child cleanup steps of one pass and reports whether anything is left;
//! the caller strips the finalizer only on [`Cleanup::Done`].

use std::sync::Arc;

use convoy_client::{
    Api, ClientError, ClientResult, ClientResultExt, DeleteOptions, Kind, LabelSelector,
    ObjectKey, Resource, ResourceClient,
};
use tracing::{debug, trace};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Cleanup {
    Done,
    /// Children that still exist, for logs and status messages.
    Pending(Vec<String>),
}

impl Cleanup {
    pub fn is_done(&self) -> bool {
        matches!(self, Cleanup::Done)
    }
}

/// Adds `token` to the object's finalizers and persists it. Returns true when
/// a write happened.
pub async fn ensure_finalizer<R: Resource>(
    api: &Api<R>,
    obj: &mut R,
    token: &str,
) -> ClientResult<bool> {
    if obj.meta().has_finalizer(token) {
        return Ok(false);
    }
    obj.meta_mut().add_finalizer(token);
    *obj = api.replace(obj).await?;
    debug!(name = %obj.name(), token, "finalizer added");
    Ok(true)
}

/// Strips `token` and persists. The object may be gone once this returns.
pub async fn remove_finalizer<R: Resource>(
    api: &Api<R>,
    obj: &mut R,
    token: &str,
) -> ClientResult<bool> {
    if !obj.meta_mut().remove_finalizer(token) {
        return Ok(false);
    }
    match api.replace(obj).await {
        Ok(updated) => *obj = updated,
        Err(ClientError::NotFound(_)) => {}
        Err(e) => return Err(e),
    }
    debug!(name = %obj.name(), token, "finalizer removed");
    Ok(true)
}

/// One deletion pass over an owner's children.
///
/// Steps run in call order. A [`Teardown::confirm`] step that still sees
/// children blocks every later step of the same pass.
pub struct Teardown {
    client: Arc<dyn ResourceClient>,
    pending: Vec<String>,
    blocked: bool,
}

impl Teardown {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        Self {
            client,
            pending: Vec::new(),
            blocked: false,
        }
    }

    async fn delete(&self, key: &ObjectKey) -> ClientResult<()> {
        match self.client.delete(key, &DeleteOptions::background()).await {
            Ok(()) | Err(ClientError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn exists(&self, key: &ObjectKey) -> ClientResult<bool> {
        Ok(self.client.get(key).await.optional()?.is_some())
    }

    /// Requests deletion of `keys` and re-reads them. Later steps only run
    /// once all of them are gone.
    pub async fn confirm<I>(&mut self, keys: I) -> ClientResult<()>
    where
        I: IntoIterator<Item = ObjectKey>,
    {
        if self.blocked {
            return Ok(());
        }
        let keys: Vec<ObjectKey> = keys.into_iter().collect();
        for key in &keys {
            self.delete(key).await?;
        }
        for key in keys {
            if self.exists(&key).await? {
                trace!(%key, "teardown: still present");
                self.pending.push(key.to_string());
                self.blocked = true;
            }
        }
        Ok(())
    }

    /// Deletes `key` and moves on; the pass is only done once it is gone.
    pub async fn fire(&mut self, key: &ObjectKey) -> ClientResult<()> {
        if self.blocked {
            return Ok(());
        }
        self.delete(key).await?;
        if self.exists(key).await? {
            self.pending.push(key.to_string());
        }
        Ok(())
    }

    /// Deletes every `kind` object in `namespace` matched by `selector`.
    /// Anything seen before the delete keeps the pass pending.
    pub async fn sweep(
        &mut self,
        kind: &Kind,
        namespace: &str,
        selector: &LabelSelector,
    ) -> ClientResult<()> {
        if self.blocked {
            return Ok(());
        }
        let live = self.client.list(kind, Some(namespace), selector).await?;
        if live.is_empty() {
            return Ok(());
        }
        self.client
            .delete_collection(kind, Some(namespace), selector, &DeleteOptions::background())
            .await?;
        self.pending.extend(live.iter().map(|o| o.key().to_string()));
        Ok(())
    }

    pub fn finish(self) -> Cleanup {
        if self.pending.is_empty() {
            Cleanup::Done
        } else {
            Cleanup::Pending(self.pending)
        }
    }
}
