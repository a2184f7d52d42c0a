//! Change-feed store port: a shared mutable record service with atomic field-group
//! updates and push notifications of the latest document value.

/// CouchDB backend polling `_changes`.
#[cfg(feature = "couch-store")]
pub mod couchdb;
/// In-process backend.
pub mod memory;

use std::fmt;

use async_stream::stream;
use futures::{Stream, future::BoxFuture};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::{sync::watch, task::JoinHandle};

use crate::dao::storage::StorageResult;

/// Raw key-value body of a stored document.
pub type Fields = Map<String, Value>;

/// Ordered view of a whole collection, keyed by document id in discovery order.
pub type CollectionSnapshot = IndexMap<String, Document>;

/// Latest-value feed of a single document (`None` while absent).
pub type DocumentFeed = Feed<Option<Document>>;

/// Latest-value feed of a whole collection.
pub type CollectionFeed = Feed<CollectionSnapshot>;

/// Address of a document inside a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocPath {
    /// Collection name, e.g. `sessions`.
    pub collection: String,
    /// Document id inside the collection.
    pub id: String,
}

impl DocPath {
    /// Address `id` inside `collection`.
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Snapshot of a stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Store-assigned identifier, unique inside the collection.
    pub id: String,
    /// Monotonic per-document revision, bumped on every write.
    pub revision: u64,
    /// Document body.
    pub fields: Fields,
}

impl Document {
    /// Decode the document body into a typed model.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.fields.clone()))
    }

    /// Read a (possibly dotted) field path.
    pub fn field(&self, path: &str) -> Option<&Value> {
        lookup(&self.fields, path)
    }
}

/// Field-group update applied atomically by the store.
///
/// Keys may be dotted paths (`clock.whiteRemainingMs`) addressing nested objects;
/// siblings of the addressed leaf are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch(Fields);

impl Patch {
    /// Patch touching nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `path` to `value`.
    pub fn set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(path.into(), value.into());
        self
    }

    /// Names of the fields touched by this patch.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Value this patch writes at `path`, matched literally.
    pub fn get(&self, path: &str) -> Option<&Value> {
        self.0.get(path)
    }

    /// Whether the patch writes nothing.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merge this patch into a document body.
    pub fn apply_to(&self, target: &mut Fields) {
        for (path, value) in &self.0 {
            set_path(target, path, value.clone());
        }
    }
}

/// Conjunction of `field == value` preconditions for a conditional write.
///
/// A `null` expectation also matches a missing field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Guard {
    conditions: Vec<(String, Value)>,
}

impl Guard {
    /// Guard that always holds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `path` to currently equal `value`.
    pub fn field_eq(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((path.into(), value.into()));
        self
    }

    /// Required `(path, value)` pairs in insertion order.
    pub fn conditions(&self) -> &[(String, Value)] {
        &self.conditions
    }

    /// Evaluate the guard against a document body.
    pub fn is_satisfied_by(&self, fields: &Fields) -> bool {
        self.conditions
            .iter()
            .all(|(path, expected)| match lookup(fields, path) {
                Some(actual) => actual == expected,
                None => expected.is_null(),
            })
    }
}

/// Abstraction over the shared document service both clients read and write.
pub trait ChangeFeedStore: Send + Sync {
    /// Create a document with a store-assigned id and return that id.
    fn create(&self, collection: &str, fields: Fields) -> BoxFuture<'static, StorageResult<String>>;
    /// Create or fully replace the document at `path`.
    fn put(&self, path: &DocPath, fields: Fields) -> BoxFuture<'static, StorageResult<()>>;
    /// Current document at `path`, `None` when absent.
    fn get(&self, path: &DocPath) -> BoxFuture<'static, StorageResult<Option<Document>>>;
    /// Every document of a collection in discovery order.
    fn list(&self, collection: &str) -> BoxFuture<'static, StorageResult<Vec<Document>>>;
    /// Atomically merge `patch` into an existing document.
    fn update(&self, path: &DocPath, patch: Patch) -> BoxFuture<'static, StorageResult<()>>;
    /// Atomically merge `patch` only if `guard` holds; `false` means nothing was written.
    fn update_if(
        &self,
        path: &DocPath,
        guard: Guard,
        patch: Patch,
    ) -> BoxFuture<'static, StorageResult<bool>>;
    /// Remove a document; `true` only for the call that actually removed it.
    fn delete(&self, path: &DocPath) -> BoxFuture<'static, StorageResult<bool>>;
    /// Feed of the latest value at `path`.
    fn subscribe(&self, path: &DocPath) -> BoxFuture<'static, StorageResult<DocumentFeed>>;
    /// Feed of the latest snapshot of a whole collection.
    fn subscribe_collection(
        &self,
        collection: &str,
    ) -> BoxFuture<'static, StorageResult<CollectionFeed>>;
    /// Cheap round trip proving the backend is reachable.
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
    /// Re-establish the backend connection after a failed health check.
    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>>;
}

/// Subscription handle delivering the current value first, then every later value.
///
/// Intermediate values may be coalesced, the latest one is never skipped. Dropping
/// the feed unsubscribes and stops any backing poller.
pub struct Feed<T> {
    receiver: watch::Receiver<T>,
    primed: bool,
    _poller: Option<AbortOnDrop>,
}

impl<T> Feed<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Feed over a channel whose sender lives elsewhere.
    pub fn new(receiver: watch::Receiver<T>) -> Self {
        Self {
            receiver,
            primed: false,
            _poller: None,
        }
    }

    /// Build a feed kept alive by a background task that owns the sending side.
    pub fn with_poller(receiver: watch::Receiver<T>, poller: JoinHandle<()>) -> Self {
        Self {
            receiver,
            primed: false,
            _poller: Some(AbortOnDrop(poller)),
        }
    }

    /// Latest value without waiting.
    pub fn current(&self) -> T {
        self.receiver.borrow().clone()
    }

    /// Wait for the next value; the first call resolves immediately.
    ///
    /// Returns `None` once the store side of the feed is gone.
    pub async fn next(&mut self) -> Option<T> {
        if self.primed {
            self.receiver.changed().await.ok()?;
        }
        self.primed = true;
        Some(self.receiver.borrow_and_update().clone())
    }

    /// Stop listening; same as dropping the feed.
    pub fn unsubscribe(self) {}

    /// Every value [`Self::next`] would return, as a stream.
    pub fn into_stream(mut self) -> impl Stream<Item = T> + Send {
        stream! {
            while let Some(value) = self.next().await {
                yield value;
            }
        }
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Resolve a dotted path inside a document body.
pub fn lookup<'a>(fields: &'a Fields, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = fields.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn set_path(target: &mut Fields, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            target.insert(path.to_owned(), value);
        }
        Some((head, rest)) => {
            let slot = target
                .entry(head.to_owned())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            if let Value::Object(inner) = slot {
                set_path(inner, rest, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn body(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn dotted_patch_only_touches_addressed_leaf() {
        let mut fields = body(json!({
            "clock": {"whiteRemainingMs": 1000, "blackRemainingMs": 900},
            "turn": "white"
        }));

        Patch::new()
            .set("clock.whiteRemainingMs", 750)
            .set("turn", "black")
            .apply_to(&mut fields);

        assert_eq!(
            Value::Object(fields),
            json!({
                "clock": {"whiteRemainingMs": 750, "blackRemainingMs": 900},
                "turn": "black"
            })
        );
    }

    #[test]
    fn dotted_patch_creates_missing_parents() {
        let mut fields = Fields::new();
        Patch::new().set("rematch.offered", true).apply_to(&mut fields);
        assert_eq!(lookup(&fields, "rematch.offered"), Some(&json!(true)));
    }

    #[test]
    fn guard_null_matches_missing_field() {
        let fields = body(json!({"players": {"white": {"uid": "a"}}}));
        assert!(Guard::new().field_eq("players.black", Value::Null).is_satisfied_by(&fields));
        assert!(
            !Guard::new()
                .field_eq("players.white", Value::Null)
                .is_satisfied_by(&fields)
        );
    }

    #[test]
    fn guard_requires_every_condition() {
        let fields = body(json!({"status": "playing", "generation": 2}));
        let guard = Guard::new()
            .field_eq("status", "playing")
            .field_eq("generation", 1);
        assert!(!guard.is_satisfied_by(&fields));
        let guard = Guard::new()
            .field_eq("status", "playing")
            .field_eq("generation", 2);
        assert!(guard.is_satisfied_by(&fields));
    }
}
