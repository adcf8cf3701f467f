#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use convoy_client::memory::Verb;
    use convoy_client::{
        ClientResult, DeleteOptions, Kind, LabelSelector, MemoryClient, Object, ObjectKey,
        ResourceClient, WatchEvent,
    };
    use futures_util::stream::BoxStream;

    use crate::sweeper::{SweepConfig, SweepError, SweepOutcome, Sweeper};

    async fn seed(mem: &MemoryClient) {
        for ns in ["kube-system", "team-a", "team-b"] {
            mem.create(&Object::new(Kind::Namespace, None, ns))
                .await
                .unwrap();
        }
        mem.create(&Object::new(Kind::Pod, Some("kube-system"), "dns"))
            .await
            .unwrap();
        mem.create(&Object::new(Kind::Pod, Some("team-a"), "web"))
            .await
            .unwrap();
        mem.create(&Object::new(
            Kind::PersistentVolumeClaim,
            Some("team-b"),
            "data",
        ))
        .await
        .unwrap();
        mem.create(&Object::new(Kind::PersistentVolume, None, "pv-1"))
            .await
            .unwrap();
    }

    fn sweeper(client: Arc<dyn ResourceClient>) -> Sweeper {
        Sweeper::new(
            client,
            SweepConfig {
                grace: Duration::from_secs(0),
                ..Default::default()
            },
        )
    }

    #[test_log::test(tokio::test)]
    async fn converges_over_two_passes_and_spares_system_namespace() {
        let mem = MemoryClient::new();
        seed(&mem).await;
        let sw = sweeper(Arc::new(mem.clone()));

        assert_eq!(sw.sweep().await.unwrap(), SweepOutcome::Pending);
        assert_eq!(sw.sweep().await.unwrap(), SweepOutcome::Clean);

        assert!(
            mem.contains(&ObjectKey::new(Kind::Pod, Some("kube-system"), "dns"))
                .await
        );
        assert!(
            !mem.contains(&ObjectKey::new(Kind::Pod, Some("team-a"), "web"))
                .await
        );
        assert!(mem.snapshot(&Kind::PersistentVolume).await.is_empty());
    }

    #[tokio::test]
    async fn empty_cluster_is_clean_immediately() {
        let mem = MemoryClient::new();
        mem.create(&Object::new(Kind::Namespace, None, "team-a"))
            .await
            .unwrap();
        let sw = sweeper(Arc::new(mem));
        assert_eq!(sw.sweep().await.unwrap(), SweepOutcome::Clean);
    }

    #[tokio::test]
    async fn stuck_finalizers_are_stripped() {
        let mem = MemoryClient::new();
        mem.create(&Object::new(Kind::Namespace, None, "team-a"))
            .await
            .unwrap();
        let mut pod = Object::new(Kind::Pod, Some("team-a"), "stuck");
        pod.metadata.add_finalizer("example.com/never");
        mem.create(&pod).await.unwrap();
        mem.delete(&pod.key(), &DeleteOptions::default())
            .await
            .unwrap();
        assert!(mem.contains(&pod.key()).await);

        let sw = sweeper(Arc::new(mem.clone()));
        assert_eq!(sw.sweep().await.unwrap(), SweepOutcome::Pending);
        assert!(!mem.contains(&pod.key()).await);
        assert_eq!(sw.sweep().await.unwrap(), SweepOutcome::Clean);
    }

    #[tokio::test]
    async fn finalizers_within_grace_are_kept() {
        let mem = MemoryClient::new();
        mem.create(&Object::new(Kind::Namespace, None, "team-a"))
            .await
            .unwrap();
        let mut pod = Object::new(Kind::Pod, Some("team-a"), "fresh");
        pod.metadata.add_finalizer("example.com/slow");
        mem.create(&pod).await.unwrap();
        mem.delete(&pod.key(), &DeleteOptions::default())
            .await
            .unwrap();

        let sw = Sweeper::new(
            Arc::new(mem.clone()),
            SweepConfig {
                grace: Duration::from_secs(3600),
                ..Default::default()
            },
        );
        assert_eq!(sw.sweep().await.unwrap(), SweepOutcome::Pending);
        let held = mem.get(&pod.key()).await.unwrap();
        assert!(held.metadata.has_finalizer("example.com/slow"));
        assert!(held.metadata.deletion_timestamp.unwrap() <= Utc::now());
    }

    #[tokio::test]
    async fn list_failure_is_reported() {
        let mem = MemoryClient::new();
        seed(&mem).await;
        mem.fail(Verb::List, Kind::Deployment, "apiserver unavailable")
            .await;
        let sw = sweeper(Arc::new(mem));
        match sw.sweep().await {
            Err(SweepError::List { kind, .. }) => assert_eq!(kind, Kind::Deployment),
            other => panic!("expected list error, got {other:?}"),
        }
    }

    /// Delegates to a memory client but never answers lists of one kind.
    struct Hanging(MemoryClient, Kind);

    #[async_trait]
    impl ResourceClient for Hanging {
        async fn get(&self, key: &ObjectKey) -> ClientResult<Object> {
            self.0.get(key).await
        }
        async fn create(&self, obj: &Object) -> ClientResult<Object> {
            self.0.create(obj).await
        }
        async fn update(&self, obj: &Object) -> ClientResult<Object> {
            self.0.update(obj).await
        }
        async fn update_status(&self, obj: &Object) -> ClientResult<Object> {
            self.0.update_status(obj).await
        }
        async fn delete(&self, key: &ObjectKey, opts: &DeleteOptions) -> ClientResult<()> {
            self.0.delete(key, opts).await
        }
        async fn delete_collection(
            &self,
            kind: &Kind,
            namespace: Option<&str>,
            selector: &LabelSelector,
            opts: &DeleteOptions,
        ) -> ClientResult<()> {
            self.0
                .delete_collection(kind, namespace, selector, opts)
                .await
        }
        async fn list(
            &self,
            kind: &Kind,
            namespace: Option<&str>,
            selector: &LabelSelector,
        ) -> ClientResult<Vec<Object>> {
            if *kind == self.1 {
                std::future::pending::<()>().await;
            }
            self.0.list(kind, namespace, selector).await
        }
        fn watch(
            &self,
            kind: &Kind,
            namespace: Option<&str>,
        ) -> BoxStream<'static, ClientResult<WatchEvent>> {
            self.0.watch(kind, namespace)
        }
    }

    async fn assert_times_out(hangs_on: Kind) {
        let mem = MemoryClient::new();
        seed(&mem).await;
        let sw = Sweeper::new(
            Arc::new(Hanging(mem, hangs_on.clone())),
            SweepConfig {
                timeout: Duration::from_secs(5),
                ..Default::default()
            },
        );
        match sw.sweep().await {
            Err(SweepError::Timeout(d)) => assert_eq!(d, Duration::from_secs(5)),
            other => panic!("expected timeout while {hangs_on} hangs, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_namespace_times_out() {
        assert_times_out(Kind::Pod).await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_volume_listing_times_out() {
        assert_times_out(Kind::PersistentVolume).await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_namespace_listing_times_out() {
        assert_times_out(Kind::Namespace).await;
    }

    #[tokio::test]
    async fn refused_delete_is_not_reported_as_pending() {
        let mem = MemoryClient::new();
        seed(&mem).await;
        mem.fail(Verb::Delete, Kind::Pod, "pods is forbidden").await;
        let sw = sweeper(Arc::new(mem.clone()));
        match sw.sweep().await {
            Err(SweepError::Cleanup { kind, scope, .. }) => {
                assert_eq!(kind, Kind::Pod);
                assert_eq!(scope, "team-a");
            }
            other => panic!("expected cleanup error, got {other:?}"),
        }

        mem.clear_faults().await;
        assert_eq!(sw.sweep().await.unwrap(), SweepOutcome::Pending);
        assert_eq!(sw.sweep().await.unwrap(), SweepOutcome::Clean);
    }

    #[tokio::test]
    async fn refused_finalizer_strip_is_reported() {
        let mem = MemoryClient::new();
        mem.create(&Object::new(Kind::Namespace, None, "team-a"))
            .await
            .unwrap();
        let mut pod = Object::new(Kind::Pod, Some("team-a"), "stuck");
        pod.metadata.add_finalizer("example.com/never");
        mem.create(&pod).await.unwrap();
        mem.delete(&pod.key(), &DeleteOptions::default())
            .await
            .unwrap();
        mem.fail(Verb::Update, Kind::Pod, "pods is forbidden").await;

        let sw = sweeper(Arc::new(mem.clone()));
        assert!(matches!(
            sw.sweep().await,
            Err(SweepError::Cleanup { kind: Kind::Pod, .. })
        ));
        assert!(mem.contains(&pod.key()).await);
    }
}
