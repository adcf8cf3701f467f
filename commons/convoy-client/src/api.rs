use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{ClientError, ClientResult, ClientResultExt};
use crate::kind::Kind;
use crate::object::{Object, ObjectKey, ObjectMeta, OwnerReference};
use crate::selector::LabelSelector;
use crate::traits::{DeleteOptions, ResourceClient};

/// A typed view over one kind of object.
pub trait Resource:
    Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
    fn kind() -> Kind;
    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn name(&self) -> &str {
        &self.meta().name
    }

    fn namespace(&self) -> Option<&str> {
        self.meta().namespace.as_deref()
    }

    fn key(&self) -> ObjectKey {
        ObjectKey::new(Self::kind(), self.namespace(), self.name())
    }

    fn controller_ref(&self) -> Option<OwnerReference> {
        OwnerReference::controller_of(&Self::kind(), self.meta())
    }
}

/// Implements [`Resource`] for a struct with a `metadata: ObjectMeta` field.
#[macro_export]
macro_rules! impl_resource {
    ($ty:ty, $kind:expr) => {
        impl $crate::Resource for $ty {
            fn kind() -> $crate::Kind {
                $kind
            }
            fn meta(&self) -> &$crate::ObjectMeta {
                &self.metadata
            }
            fn meta_mut(&mut self) -> &mut $crate::ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

/// Typed handle over a [`ResourceClient`], scoped to one namespace or to the
/// whole cluster.
pub struct Api<R> {
    client: Arc<dyn ResourceClient>,
    namespace: Option<String>,
    _marker: PhantomData<fn() -> R>,
}

impl<R> Clone for Api<R> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            namespace: self.namespace.clone(),
            _marker: PhantomData,
        }
    }
}

impl<R: Resource> Api<R> {
    pub fn namespaced(client: Arc<dyn ResourceClient>, namespace: &str) -> Self {
        Self {
            client,
            namespace: Some(namespace.to_string()),
            _marker: PhantomData,
        }
    }

    pub fn all(client: Arc<dyn ResourceClient>) -> Self {
        Self {
            client,
            namespace: None,
            _marker: PhantomData,
        }
    }

    pub fn client(&self) -> &Arc<dyn ResourceClient> {
        &self.client
    }

    fn key(&self, name: &str) -> ObjectKey {
        ObjectKey::new(R::kind(), self.namespace.as_deref(), name)
    }

    fn to_object(&self, resource: &R) -> ClientResult<Object> {
        let mut obj = Object::from_resource(resource)?;
        if R::kind().namespaced() && obj.metadata.namespace.is_none() {
            obj.metadata.namespace = self.namespace.clone();
        }
        if obj.metadata.name.is_empty() {
            return Err(ClientError::Invalid(format!("{} without a name", R::kind())));
        }
        Ok(obj)
    }

    pub async fn get(&self, name: &str) -> ClientResult<R> {
        self.client.get(&self.key(name)).await?.to_resource()
    }

    pub async fn get_opt(&self, name: &str) -> ClientResult<Option<R>> {
        self.get(name).await.optional()
    }

    pub async fn create(&self, resource: &R) -> ClientResult<R> {
        let obj = self.to_object(resource)?;
        self.client.create(&obj).await?.to_resource()
    }

    pub async fn replace(&self, resource: &R) -> ClientResult<R> {
        let obj = self.to_object(resource)?;
        self.client.update(&obj).await?.to_resource()
    }

    pub async fn replace_status(&self, resource: &R) -> ClientResult<R> {
        let obj = self.to_object(resource)?;
        self.client.update_status(&obj).await?.to_resource()
    }

    pub async fn delete(&self, name: &str) -> ClientResult<()> {
        self.client
            .delete(&self.key(name), &DeleteOptions::default())
            .await
    }

    pub async fn list(&self, selector: &LabelSelector) -> ClientResult<Vec<R>> {
        self.client
            .list(&R::kind(), self.namespace.as_deref(), selector)
            .await?
            .iter()
            .map(Object::to_resource)
            .collect()
    }
}
