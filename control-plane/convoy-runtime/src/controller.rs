//! The control loop: watch events feed a [`WorkQueue`] of object keys, a
//! fixed pool of workers pops keys, re-reads the object and hands a fresh copy
//! to the [`SyncHandler`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use convoy_client::{
    ClientError, Kind, LabelSelector, NamespacedName, ObjectKey, Resource, ResourceClient,
    WatchEvent,
};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{ErrorPolicy, ReconcileError, RuntimeError};
use crate::queue::WorkQueue;

type EventStream = BoxStream<'static, Result<WatchEvent, ClientError>>;

/// Level-triggered business logic for one resource kind.
///
/// `sync` receives the latest stored object. It must be idempotent: it may
/// run any number of times for the same state, and a pass that returns early
/// is resumed by the next event or resync.
#[async_trait]
pub trait SyncHandler: Send + Sync + 'static {
    type Resource: Resource;

    async fn sync(&self, obj: Self::Resource) -> Result<(), ReconcileError>;
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Used in logs only.
    pub name: String,
    /// Restrict the watch to one namespace; `None` watches all of them.
    pub namespace: Option<String>,
    /// Re-enqueue every managed object at this interval.
    pub resync: Option<Duration>,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Delay before a broken watch is re-established.
    pub rewatch_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: "controller".into(),
            namespace: None,
            resync: Some(Duration::from_secs(30)),
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(300),
            rewatch_delay: Duration::from_secs(1),
        }
    }
}

/// Result of one worker step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    Synced,
    /// The object no longer exists.
    Gone,
    Requeued,
    Dropped,
}

pub struct Controller<H: SyncHandler> {
    client: Arc<dyn ResourceClient>,
    handler: Arc<H>,
    queue: Arc<WorkQueue<NamespacedName>>,
    cfg: ControllerConfig,
    owned: Vec<(Kind, OwnerLink)>,
}

/// How an event on a secondary kind is traced back to the managed object.
#[derive(Debug, Clone)]
enum OwnerLink {
    /// Controller owner reference pointing at the managed kind.
    Reference,
    /// Label whose value is the managed object's name, same namespace.
    Label(String),
}

impl<H: SyncHandler> Clone for Controller<H> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            handler: self.handler.clone(),
            queue: self.queue.clone(),
            cfg: self.cfg.clone(),
            owned: self.owned.clone(),
        }
    }
}

impl<H: SyncHandler> Controller<H> {
    pub fn new(client: Arc<dyn ResourceClient>, handler: Arc<H>, cfg: ControllerConfig) -> Self {
        let queue = Arc::new(WorkQueue::with_backoff(cfg.backoff_base, cfg.backoff_max));
        Self {
            client,
            handler,
            queue,
            cfg,
            owned: Vec::new(),
        }
    }

    /// Also wake the owner when an object of `kind` that it controls
    /// changes. Owners are found through controller owner references.
    pub fn owns(mut self, kind: Kind) -> Self {
        self.owned.push((kind, OwnerLink::Reference));
        self
    }

    /// Also wake the object named by `label` on an object of `kind`. Used
    /// for grandchildren and children created without owner references.
    pub fn owns_via_label(mut self, kind: Kind, label: &str) -> Self {
        self.owned.push((kind, OwnerLink::Label(label.to_string())));
        self
    }

    pub fn queue(&self) -> &Arc<WorkQueue<NamespacedName>> {
        &self.queue
    }

    pub fn enqueue(&self, key: NamespacedName) {
        self.queue.add(key);
    }

    fn object_key(key: &NamespacedName) -> ObjectKey {
        ObjectKey::new(H::Resource::kind(), key.namespace.as_deref(), &key.name)
    }

    /// Lists every managed object and enqueues its key.
    pub async fn enqueue_all(&self) -> Result<usize, ClientError> {
        let objects = self
            .client
            .list(
                &H::Resource::kind(),
                self.cfg.namespace.as_deref(),
                &LabelSelector::everything(),
            )
            .await?;
        let count = objects.len();
        for obj in objects {
            self.queue.add(obj.key().namespaced_name());
        }
        Ok(count)
    }

    /// Pops one key and syncs it. `None` once the queue is shut down.
    pub async fn process_next(&self) -> Option<Processed> {
        let key = self.queue.get().await?;
        let outcome = match self.reconcile(&key).await {
            Ok(processed) => {
                self.queue.forget(&key);
                processed
            }
            Err(e) => match e.policy() {
                ErrorPolicy::Requeue => {
                    let delay = self.queue.add_rate_limited(key.clone());
                    warn!(controller = %self.cfg.name, %key, error = %e, ?delay, "sync failed; requeue");
                    Processed::Requeued
                }
                ErrorPolicy::Drop => {
                    self.queue.forget(&key);
                    warn!(controller = %self.cfg.name, %key, error = %e, "sync failed; dropped");
                    Processed::Dropped
                }
            },
        };
        self.queue.done(&key);
        Some(outcome)
    }

    #[instrument(skip_all, fields(controller = %self.cfg.name, key = %key))]
    async fn reconcile(&self, key: &NamespacedName) -> Result<Processed, ReconcileError> {
        let obj = match self.client.get(&Self::object_key(key)).await {
            Ok(obj) => obj,
            Err(ClientError::NotFound(_)) => {
                debug!("object gone; forgetting key");
                return Ok(Processed::Gone);
            }
            Err(e) => return Err(e.into()),
        };
        let typed: H::Resource = obj
            .to_resource()
            .map_err(|e| ReconcileError::Decode(e.to_string()))?;
        self.handler.sync(typed).await?;
        Ok(Processed::Synced)
    }

    async fn worker(self, id: usize) {
        debug!(controller = %self.cfg.name, id, "worker started");
        while self.process_next().await.is_some() {}
        debug!(controller = %self.cfg.name, id, "worker stopped");
    }

    async fn pump(
        self,
        kind: Kind,
        link: OwnerLink,
        mut events: EventStream,
        shutdown: CancellationToken,
    ) {
        let own_kind = kind == H::Resource::kind();
        loop {
            loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    next = events.next() => next,
                };
                match next {
                    Some(Ok(event)) if own_kind => {
                        self.queue.add(event.key().namespaced_name());
                    }
                    Some(Ok(WatchEvent::Applied(child))) => {
                        self.enqueue_owner(&child, &link).await
                    }
                    Some(Ok(WatchEvent::Deleted(_))) => {}
                    Some(Err(e)) => {
                        warn!(controller = %self.cfg.name, %kind, error = %e, "watch broken; relisting");
                        break;
                    }
                    None => {
                        debug!(controller = %self.cfg.name, %kind, "watch ended");
                        break;
                    }
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.cfg.rewatch_delay) => {}
            }
            events = self.client.watch(&kind, self.cfg.namespace.as_deref());
            // Events may have been missed while the stream was down.
            if own_kind {
                if let Err(e) = self.enqueue_all().await {
                    warn!(controller = %self.cfg.name, error = %e, "relist failed");
                }
            }
        }
    }

    async fn enqueue_owner(&self, child: &ObjectKey, link: &OwnerLink) {
        let obj = match self.client.get(child).await {
            Ok(obj) => obj,
            Err(_) => return,
        };
        let owner_name = match link {
            OwnerLink::Reference => {
                let owner_kind = H::Resource::kind();
                obj.metadata
                    .owner_references
                    .iter()
                    .find(|r| {
                        r.controller == Some(true)
                            && r.kind == owner_kind.name()
                            && r.api_version == owner_kind.api_version()
                    })
                    .map(|r| r.name.clone())
            }
            OwnerLink::Label(label) => obj.metadata.labels.get(label).cloned(),
        };
        if let Some(owner) = owner_name {
            self.queue
                .add(NamespacedName::new(obj.metadata.namespace.as_deref(), &owner));
        }
    }

    async fn resync(self, every: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; the initial list covers it.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match self.enqueue_all().await {
                Ok(n) => debug!(controller = %self.cfg.name, count = n, "resync"),
                Err(e) => warn!(controller = %self.cfg.name, error = %e, "resync list failed"),
            }
        }
    }

    /// Runs the watch pumps, the resync timer and `workers` workers until
    /// `shutdown` fires, then stops handing out keys and waits for the
    /// in-flight syncs to finish.
    pub async fn run(&self, workers: usize, shutdown: CancellationToken) -> Result<(), RuntimeError> {
        // Subscribe before the initial list so nothing falls in between.
        let mut kinds = vec![(H::Resource::kind(), OwnerLink::Reference)];
        kinds.extend(self.owned.iter().cloned());
        let streams: Vec<(Kind, OwnerLink, EventStream)> = kinds
            .into_iter()
            .map(|(kind, link)| {
                let events = self.client.watch(&kind, self.cfg.namespace.as_deref());
                (kind, link, events)
            })
            .collect();
        let initial = self.enqueue_all().await.map_err(RuntimeError::InitialList)?;
        info!(controller = %self.cfg.name, workers, initial, "controller starting");

        let mut background = JoinSet::new();
        for (kind, link, events) in streams {
            background.spawn(self.clone().pump(kind, link, events, shutdown.clone()));
        }
        if let Some(every) = self.cfg.resync {
            background.spawn(self.clone().resync(every, shutdown.clone()));
        }

        let mut pool = JoinSet::new();
        for id in 0..workers.max(1) {
            pool.spawn(self.clone().worker(id));
        }

        shutdown.cancelled().await;
        info!(controller = %self.cfg.name, "controller shutting down");
        self.queue.shut_down();

        let mut failure = None;
        while let Some(res) = pool.join_next().await {
            if let Err(e) = res {
                error!(controller = %self.cfg.name, error = %e, "worker task failed");
                failure.get_or_insert(RuntimeError::Worker(e.to_string()));
            }
        }
        background.shutdown().await;
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
