//! In-process change-feed store used by tests, the demo binary, and offline play.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use dashmap::{DashMap, mapref::one::RefMut};
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use super::{
    ChangeFeedStore, CollectionFeed, CollectionSnapshot, DocPath, Document, DocumentFeed, Feed,
    Fields, Guard, Patch,
};
use crate::dao::storage::{StorageError, StorageResult};

/// Failures specific to the in-memory backend.
#[derive(Debug, Error)]
pub enum MemoryStoreError {
    /// The store was switched offline to simulate a network partition.
    #[error("memory store is offline")]
    Offline,
}

impl From<MemoryStoreError> for StorageError {
    fn from(err: MemoryStoreError) -> Self {
        StorageError::unavailable(err.to_string(), err)
    }
}

/// Change-feed store holding every collection in process memory.
///
/// Each collection sits behind its own map shard lock, so every write to a single
/// document is atomic and notifications are published before the lock is released.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    collections: DashMap<String, MemoryCollection>,
    online: AtomicBool,
}

struct MemoryCollection {
    documents: CollectionSnapshot,
    snapshot: watch::Sender<CollectionSnapshot>,
    watchers: HashMap<String, watch::Sender<Option<Document>>>,
}

impl MemoryCollection {
    fn new() -> Self {
        let (snapshot, _rx) = watch::channel(CollectionSnapshot::new());
        Self {
            documents: CollectionSnapshot::new(),
            snapshot,
            watchers: HashMap::new(),
        }
    }

    /// Push the current value of `id` and of the whole collection to subscribers.
    fn publish(&mut self, id: &str) {
        self.snapshot.send_replace(self.documents.clone());
        self.watchers.retain(|_, tx| tx.receiver_count() > 0);
        if let Some(tx) = self.watchers.get(id) {
            tx.send_replace(self.documents.get(id).cloned());
        }
    }

    fn write(&mut self, id: &str, fields: Fields) {
        let revision = self
            .documents
            .get(id)
            .map(|doc| doc.revision + 1)
            .unwrap_or(1);
        self.documents.insert(
            id.to_owned(),
            Document {
                id: id.to_owned(),
                revision,
                fields,
            },
        );
        self.publish(id);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Empty, online store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                collections: DashMap::new(),
                online: AtomicBool::new(true),
            }),
        }
    }

    /// Simulate losing (or regaining) connectivity; offline calls fail with
    /// [`StorageError::Unavailable`].
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
        debug!(online, "memory store connectivity changed");
    }

    fn ensure_online(&self) -> StorageResult<()> {
        if self.inner.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MemoryStoreError::Offline.into())
        }
    }

    fn collection(&self, name: &str) -> RefMut<'_, String, MemoryCollection> {
        self.inner
            .collections
            .entry(name.to_owned())
            .or_insert_with(MemoryCollection::new)
    }

    fn create_now(&self, collection: &str, fields: Fields) -> StorageResult<String> {
        self.ensure_online()?;
        let id = Uuid::new_v4().to_string();
        self.collection(collection).write(&id, fields);
        Ok(id)
    }

    fn put_now(&self, path: &DocPath, fields: Fields) -> StorageResult<()> {
        self.ensure_online()?;
        self.collection(&path.collection).write(&path.id, fields);
        Ok(())
    }

    fn get_now(&self, path: &DocPath) -> StorageResult<Option<Document>> {
        self.ensure_online()?;
        Ok(self
            .inner
            .collections
            .get(&path.collection)
            .and_then(|collection| collection.documents.get(&path.id).cloned()))
    }

    fn list_now(&self, collection: &str) -> StorageResult<Vec<Document>> {
        self.ensure_online()?;
        Ok(self
            .inner
            .collections
            .get(collection)
            .map(|collection| collection.documents.values().cloned().collect())
            .unwrap_or_default())
    }

    fn update_now(&self, path: &DocPath, guard: Option<&Guard>, patch: &Patch) -> StorageResult<bool> {
        self.ensure_online()?;
        let mut collection = self.collection(&path.collection);
        let Some(existing) = collection.documents.get(&path.id) else {
            return match guard {
                Some(_) => Ok(false),
                None => Err(StorageError::not_found(path)),
            };
        };
        if guard.is_some_and(|guard| !guard.is_satisfied_by(&existing.fields)) {
            return Ok(false);
        }
        let mut fields = existing.fields.clone();
        patch.apply_to(&mut fields);
        collection.write(&path.id, fields);
        Ok(true)
    }

    fn delete_now(&self, path: &DocPath) -> StorageResult<bool> {
        self.ensure_online()?;
        let mut collection = self.collection(&path.collection);
        let removed = collection.documents.shift_remove(&path.id).is_some();
        if removed {
            collection.publish(&path.id);
        }
        Ok(removed)
    }

    fn subscribe_now(&self, path: &DocPath) -> StorageResult<DocumentFeed> {
        self.ensure_online()?;
        let mut collection = self.collection(&path.collection);
        let current = collection.documents.get(&path.id).cloned();
        let receiver = collection
            .watchers
            .entry(path.id.clone())
            .or_insert_with(|| watch::channel(current).0)
            .subscribe();
        Ok(Feed::new(receiver))
    }

    fn subscribe_collection_now(&self, name: &str) -> StorageResult<CollectionFeed> {
        self.ensure_online()?;
        Ok(Feed::new(self.collection(name).snapshot.subscribe()))
    }
}

impl ChangeFeedStore for MemoryStore {
    fn create(&self, collection: &str, fields: Fields) -> BoxFuture<'static, StorageResult<String>> {
        let store = self.clone();
        let collection = collection.to_owned();
        Box::pin(async move { store.create_now(&collection, fields) })
    }

    fn put(&self, path: &DocPath, fields: Fields) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        let path = path.clone();
        Box::pin(async move { store.put_now(&path, fields) })
    }

    fn get(&self, path: &DocPath) -> BoxFuture<'static, StorageResult<Option<Document>>> {
        let store = self.clone();
        let path = path.clone();
        Box::pin(async move { store.get_now(&path) })
    }

    fn list(&self, collection: &str) -> BoxFuture<'static, StorageResult<Vec<Document>>> {
        let store = self.clone();
        let collection = collection.to_owned();
        Box::pin(async move { store.list_now(&collection) })
    }

    fn update(&self, path: &DocPath, patch: Patch) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        let path = path.clone();
        Box::pin(async move { store.update_now(&path, None, &patch).map(|_| ()) })
    }

    fn update_if(
        &self,
        path: &DocPath,
        guard: Guard,
        patch: Patch,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        let path = path.clone();
        Box::pin(async move { store.update_now(&path, Some(&guard), &patch) })
    }

    fn delete(&self, path: &DocPath) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        let path = path.clone();
        Box::pin(async move { store.delete_now(&path) })
    }

    fn subscribe(&self, path: &DocPath) -> BoxFuture<'static, StorageResult<DocumentFeed>> {
        let store = self.clone();
        let path = path.clone();
        Box::pin(async move { store.subscribe_now(&path) })
    }

    fn subscribe_collection(
        &self,
        collection: &str,
    ) -> BoxFuture<'static, StorageResult<CollectionFeed>> {
        let store = self.clone();
        let collection = collection.to_owned();
        Box::pin(async move { store.subscribe_collection_now(&collection) })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.ensure_online() })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.ensure_online() })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips_body() {
        let store = MemoryStore::new();
        let id = store
            .create("sessions", fields(json!({"status": "waiting"})))
            .await
            .unwrap();
        let doc = store
            .get(&DocPath::new("sessions", id.clone()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.id, id);
        assert_eq!(doc.revision, 1);
        assert_eq!(doc.field("status"), Some(&json!("waiting")));
    }

    #[tokio::test]
    async fn update_missing_document_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .update(&DocPath::new("sessions", "nope"), Patch::new().set("a", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn concurrent_guarded_writes_have_a_single_winner() {
        let store = MemoryStore::new();
        let path = DocPath::new("sessions", "s1");
        store
            .put(&path, fields(json!({"status": "playing"})))
            .await
            .unwrap();

        let attempts = (0..8).map(|i| {
            store.update_if(
                &path,
                Guard::new().field_eq("status", "playing"),
                Patch::new().set("status", "finished").set("winner", i),
            )
        });
        let results = futures::future::join_all(attempts).await;
        let wins = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(wins, 1);

        let doc = store.get(&path).await.unwrap().unwrap();
        assert_eq!(doc.revision, 2);
    }

    #[tokio::test]
    async fn only_first_delete_reports_removal() {
        let store = MemoryStore::new();
        let path = DocPath::new("tickets", "alice");
        store.put(&path, Fields::new()).await.unwrap();
        assert!(store.delete(&path).await.unwrap());
        assert!(!store.delete(&path).await.unwrap());
    }

    #[tokio::test]
    async fn subscription_fires_immediately_and_on_change() {
        let store = MemoryStore::new();
        let path = DocPath::new("sessions", "s1");
        store
            .put(&path, fields(json!({"turn": "white"})))
            .await
            .unwrap();

        let mut feed = store.subscribe(&path).await.unwrap();
        let first = feed.next().await.unwrap().unwrap();
        assert_eq!(first.field("turn"), Some(&json!("white")));

        store
            .update(&path, Patch::new().set("turn", "black"))
            .await
            .unwrap();
        let second = feed.next().await.unwrap().unwrap();
        assert_eq!(second.field("turn"), Some(&json!("black")));

        store.delete(&path).await.unwrap();
        assert_eq!(feed.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn collection_snapshot_keeps_discovery_order() {
        let store = MemoryStore::new();
        for uid in ["carol", "alice", "bob"] {
            store
                .put(&DocPath::new("tickets", uid), Fields::new())
                .await
                .unwrap();
        }
        let feed = store.subscribe_collection("tickets").await.unwrap();
        let order: Vec<_> = feed.current().keys().cloned().collect();
        assert_eq!(order, vec!["carol", "alice", "bob"]);

        store
            .delete(&DocPath::new("tickets", "alice"))
            .await
            .unwrap();
        let order: Vec<_> = store
            .list("tickets")
            .await
            .unwrap()
            .into_iter()
            .map(|doc| doc.id)
            .collect();
        assert_eq!(order, vec!["carol", "bob"]);
    }

    #[tokio::test]
    async fn offline_store_rejects_calls() {
        let store = MemoryStore::new();
        store.set_online(false);
        let err = store
            .get(&DocPath::new("sessions", "s1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Unavailable { .. }));
        assert!(store.health_check().await.is_err());
        store.set_online(true);
        assert!(store.health_check().await.is_ok());
    }
}
