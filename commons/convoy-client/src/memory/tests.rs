use std::time::Duration;

use futures_util::StreamExt;
use serde_json::json;

use super::*;
use crate::object::OwnerReference;

fn pod(ns: &str, name: &str) -> Object {
    Object::new(Kind::Pod, Some(ns), name).with_field("spec", json!({"containers": []}))
}

#[tokio::test]
async fn create_assigns_server_fields() {
    let client = MemoryClient::new();
    let created = client.create(&pod("ns", "a")).await.unwrap();
    assert!(created.metadata.uid.is_some());
    assert!(created.metadata.resource_version.is_some());
    assert_eq!(created.metadata.generation, Some(1));
    assert!(created.metadata.creation_timestamp.is_some());

    let err = client.create(&pod("ns", "a")).await.unwrap_err();
    assert!(err.is_already_exists());

    let err = client
        .create(&Object::new(Kind::Pod, None, "orphan"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Invalid(_)));
}

#[tokio::test]
async fn stale_update_conflicts() {
    let client = MemoryClient::new();
    let first = client.create(&pod("ns", "a")).await.unwrap();

    let mut fresh = first.clone();
    fresh.metadata.labels.insert("x".into(), "1".into());
    client.update(&fresh).await.unwrap();

    let mut stale = first;
    stale.metadata.labels.insert("x".into(), "2".into());
    assert!(client.update(&stale).await.unwrap_err().is_conflict());
}

#[tokio::test]
async fn update_keeps_status_and_bumps_generation_on_body_change() {
    let client = MemoryClient::new();
    let created = client.create(&pod("ns", "a")).await.unwrap();

    let with_status = created.clone().with_field("status", json!({"phase": "Running"}));
    let stored = client.update_status(&with_status).await.unwrap();
    assert_eq!(stored.status().unwrap()["phase"], "Running");
    assert_eq!(stored.metadata.generation, Some(1));

    let mut relabel = stored.clone();
    relabel.metadata.labels.insert("a".into(), "b".into());
    relabel.data.remove("status");
    let relabelled = client.update(&relabel).await.unwrap();
    assert_eq!(relabelled.metadata.generation, Some(1));
    assert_eq!(relabelled.status().unwrap()["phase"], "Running");

    let respec = relabelled.with_field("spec", json!({"containers": [{"name": "c"}]}));
    let respecced = client.update(&respec).await.unwrap();
    assert_eq!(respecced.metadata.generation, Some(2));
}

#[tokio::test]
async fn finalizers_hold_deletion_until_removed() {
    let client = MemoryClient::new();
    let mut obj = pod("ns", "a");
    obj.metadata.add_finalizer("test/hold");
    let created = client.create(&obj).await.unwrap();
    let key = created.key();

    client.delete(&key, &DeleteOptions::default()).await.unwrap();
    let marked = client.get(&key).await.unwrap();
    assert!(marked.metadata.is_deleting());

    // A second delete is a no-op while marked.
    client.delete(&key, &DeleteOptions::default()).await.unwrap();
    let again = client.get(&key).await.unwrap();
    assert_eq!(again.metadata.deletion_timestamp, marked.metadata.deletion_timestamp);

    let mut release = again;
    release.metadata.remove_finalizer("test/hold");
    client.update(&release).await.unwrap();
    assert!(client.get(&key).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn delete_cascades_to_owned_objects() {
    let client = MemoryClient::new();
    let parent = client
        .create(&Object::new(Kind::Job, Some("ns"), "parent"))
        .await
        .unwrap();
    let owner = OwnerReference::controller_of(&Kind::Job, &parent.metadata).unwrap();

    let mut child = pod("ns", "child");
    child.metadata.owner_references.push(owner.clone());
    client.create(&child).await.unwrap();

    let mut held = pod("ns", "held");
    held.metadata.owner_references.push(owner);
    held.metadata.add_finalizer("test/hold");
    client.create(&held).await.unwrap();

    client
        .delete(&parent.key(), &DeleteOptions::background())
        .await
        .unwrap();
    assert!(!client.contains(&parent.key()).await);
    assert!(
        !client
            .contains(&ObjectKey::new(Kind::Pod, Some("ns"), "child"))
            .await
    );
    let held = client
        .get(&ObjectKey::new(Kind::Pod, Some("ns"), "held"))
        .await
        .unwrap();
    assert!(held.metadata.is_deleting());
}

#[tokio::test]
async fn orphan_delete_leaves_dependents() {
    let client = MemoryClient::new();
    let parent = client
        .create(&Object::new(Kind::Job, Some("ns"), "parent"))
        .await
        .unwrap();
    let mut child = pod("ns", "child");
    child
        .metadata
        .owner_references
        .extend(OwnerReference::controller_of(&Kind::Job, &parent.metadata));
    client.create(&child).await.unwrap();

    let opts = DeleteOptions {
        propagation: Propagation::Orphan,
        ..Default::default()
    };
    client.delete(&parent.key(), &opts).await.unwrap();
    assert!(client.contains(&child.key()).await);
}

#[tokio::test]
async fn list_and_delete_collection_by_label() {
    let client = MemoryClient::new();
    for (ns, name, owner) in [("a", "p1", "x"), ("a", "p2", "y"), ("b", "p3", "x")] {
        let mut obj = pod(ns, name);
        obj.metadata.labels.insert("owner".into(), owner.into());
        client.create(&obj).await.unwrap();
    }
    let sel = LabelSelector::matching("owner", "x");
    assert_eq!(client.list(&Kind::Pod, None, &sel).await.unwrap().len(), 2);
    assert_eq!(client.list(&Kind::Pod, Some("a"), &sel).await.unwrap().len(), 1);

    client
        .delete_collection(&Kind::Pod, Some("a"), &sel, &DeleteOptions::default())
        .await
        .unwrap();
    let left = client
        .list(&Kind::Pod, None, &LabelSelector::everything())
        .await
        .unwrap();
    let names: Vec<_> = left.iter().map(|o| o.metadata.name.as_str()).collect();
    assert_eq!(names, vec!["p2", "p3"]);
}

#[tokio::test]
async fn injected_faults_surface_as_backend_errors() {
    let client = MemoryClient::new();
    client.fail(Verb::Create, Kind::Secret, "boom").await;
    let err = client
        .create(&Object::new(Kind::Secret, Some("ns"), "s"))
        .await
        .unwrap_err();
    assert_eq!(err, ClientError::Backend("boom".into()));
    // Other kinds are unaffected.
    client.create(&pod("ns", "a")).await.unwrap();

    client.clear_faults().await;
    client
        .create(&Object::new(Kind::Secret, Some("ns"), "s"))
        .await
        .unwrap();
}

#[tokio::test]
async fn watch_filters_by_kind_and_namespace() {
    let client = MemoryClient::new();
    let mut events = client.watch(&Kind::Pod, Some("a"));

    client
        .create(&Object::new(Kind::Secret, Some("a"), "s"))
        .await
        .unwrap();
    client.create(&pod("b", "other")).await.unwrap();
    let created = client.create(&pod("a", "mine")).await.unwrap();
    client
        .delete(&created.key(), &DeleteOptions::default())
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(1), events.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first, WatchEvent::Applied(created.key()));
    let second = tokio::time::timeout(Duration::from_secs(1), events.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(second, WatchEvent::Deleted(created.key()));
}
