use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde_json::json;
use tokio::{sync::watch, time::sleep};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::dao::{
    change_feed::{
        ChangeFeedStore, CollectionFeed, CollectionSnapshot, DocPath, Document, DocumentFeed,
        Feed, Fields, Guard, Patch,
    },
    storage::{StorageError, StorageResult},
};

use super::{
    config::CouchConfig,
    error::{CouchDaoError, CouchResult},
    models::{
        AllDocsResponse, ChangesResponse, CouchDocument, DatabaseInfo, END_SUFFIX,
        collection_prefix, doc_id, seq_param,
    },
};

const CHANGES: &str = "_changes";
const ALL_DOCS: &str = "_all_docs";
const POLL_RETRY_INITIAL: Duration = Duration::from_millis(500);
const POLL_RETRY_MAX: Duration = Duration::from_secs(10);

/// Outcome of a single MVCC write attempt.
enum WriteAttempt {
    Written,
    Conflict,
}

/// Outcome of a read-modify-write cycle.
enum MergeOutcome {
    Written,
    GuardFailed,
    Missing,
}

/// Which documents a `_changes` long-poll should wake up for.
enum ChangesFilter {
    Document(String),
    Prefix(String),
}

/// Change-feed store backed by a CouchDB database.
///
/// Conditional writes ride on CouchDB's `_rev` MVCC: a write carrying a stale
/// revision is rejected with 409 and retried against the fresh body.
#[derive(Clone)]
pub struct CouchStore {
    client: Client,
    base_url: Arc<str>,
    database: Arc<str>,
    auth: Option<(Arc<str>, Arc<str>)>,
    feed_timeout: Duration,
}

impl CouchStore {
    /// Establish a connection to CouchDB and ensure the database exists.
    pub async fn connect(config: CouchConfig) -> CouchResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|source| CouchDaoError::ClientBuilder { source })?;

        let base_url = Arc::<str>::from(config.base_url.trim_end_matches('/'));
        let database = Arc::<str>::from(config.database);
        let auth = config
            .username
            .zip(config.password)
            .map(|(u, p)| (Arc::<str>::from(u), Arc::<str>::from(p)));

        let store = Self {
            client,
            base_url,
            database,
            auth,
            feed_timeout: config.feed_timeout,
        };

        store.ensure_database().await?;
        Ok(store)
    }

    fn database_url(&self) -> String {
        format!("{}/{}", self.base_url, self.database)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some((ref user, ref pass)) = self.auth {
            builder.basic_auth(user.as_ref(), Some(pass.as_ref()))
        } else {
            builder
        }
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.database_url(), path);
        self.authorize(self.client.request(method, url))
    }

    async fn ensure_database(&self) -> CouchResult<()> {
        let database = self.database.to_string();
        let url = self.database_url();

        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|source| CouchDaoError::DatabaseQuery {
                database: database.clone(),
                source,
            })?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => {
                let create = self
                    .authorize(self.client.put(&url))
                    .send()
                    .await
                    .map_err(|source| CouchDaoError::DatabaseCreate {
                        database: database.clone(),
                        source,
                    })?;
                if create.status().is_success() {
                    Ok(())
                } else {
                    Err(CouchDaoError::DatabaseStatus {
                        database,
                        status: create.status(),
                    })
                }
            }
            other => Err(CouchDaoError::DatabaseStatus {
                database,
                status: other,
            }),
        }
    }

    async fn update_seq(&self) -> CouchResult<serde_json::Value> {
        let url = self.database_url();
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|source| CouchDaoError::DatabaseQuery {
                database: self.database.to_string(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(CouchDaoError::DatabaseStatus {
                database: self.database.to_string(),
                status: response.status(),
            });
        }
        let info = response
            .json::<DatabaseInfo>()
            .await
            .map_err(|source| CouchDaoError::DecodeResponse { path: url, source })?;
        Ok(info.update_seq)
    }

    async fn get_document(&self, doc_id: &str) -> CouchResult<Option<CouchDocument>> {
        let response = self
            .request(Method::GET, doc_id)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: doc_id.to_string(),
                source,
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .json::<CouchDocument>()
                .await
                .map(Some)
                .map_err(|source| CouchDaoError::DecodeResponse {
                    path: doc_id.to_string(),
                    source,
                }),
            other => Err(CouchDaoError::RequestStatus {
                path: doc_id.to_string(),
                status: other,
            }),
        }
    }

    async fn put_document<T>(&self, doc_id: &str, document: &T) -> CouchResult<WriteAttempt>
    where
        T: ?Sized + Serialize,
    {
        let response = self
            .request(Method::PUT, doc_id)
            .json(document)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: doc_id.to_string(),
                source,
            })?;

        match response.status() {
            StatusCode::CONFLICT => Ok(WriteAttempt::Conflict),
            status if status.is_success() => Ok(WriteAttempt::Written),
            other => Err(CouchDaoError::RequestStatus {
                path: doc_id.to_string(),
                status: other,
            }),
        }
    }

    async fn list_documents(&self, prefix: &str) -> CouchResult<Vec<Document>> {
        let query = [
            ("include_docs", "true".to_string()),
            ("startkey", format!("\"{}\"", prefix)),
            ("endkey", format!("\"{}{}\"", prefix, END_SUFFIX)),
        ];

        let response = self
            .request(Method::GET, ALL_DOCS)
            .query(&query)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: ALL_DOCS.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(CouchDaoError::RequestStatus {
                path: ALL_DOCS.to_string(),
                status: response.status(),
            });
        }

        let payload = response.json::<AllDocsResponse>().await.map_err(|source| {
            CouchDaoError::DecodeResponse {
                path: ALL_DOCS.to_string(),
                source,
            }
        })?;

        payload
            .rows
            .into_iter()
            .filter_map(|row| row.doc)
            .map(CouchDocument::into_document)
            .collect()
    }

    /// Read-modify-write loop; retries whenever another writer bumped `_rev` in between.
    async fn merge(&self, path: &DocPath, guard: Option<&Guard>, patch: &Patch) -> CouchResult<MergeOutcome> {
        let id = doc_id(path);
        loop {
            let Some(mut document) = self.get_document(&id).await? else {
                return Ok(MergeOutcome::Missing);
            };
            if guard.is_some_and(|guard| !guard.is_satisfied_by(&document.body)) {
                return Ok(MergeOutcome::GuardFailed);
            }
            patch.apply_to(&mut document.body);
            match self.put_document(&id, &document).await? {
                WriteAttempt::Written => return Ok(MergeOutcome::Written),
                WriteAttempt::Conflict => {
                    debug!(path = %path, "revision conflict; retrying merge");
                }
            }
        }
    }

    async fn replace(&self, path: &DocPath, fields: Fields) -> CouchResult<()> {
        let id = doc_id(path);
        loop {
            let rev = self.get_document(&id).await?.and_then(|doc| doc.rev);
            let document = CouchDocument::new(path, rev, fields.clone());
            match self.put_document(&id, &document).await? {
                WriteAttempt::Written => return Ok(()),
                WriteAttempt::Conflict => {
                    debug!(path = %path, "revision conflict; retrying replace");
                }
            }
        }
    }

    async fn remove(&self, path: &DocPath) -> CouchResult<bool> {
        let id = doc_id(path);
        loop {
            let Some(rev) = self.get_document(&id).await?.and_then(|doc| doc.rev) else {
                return Ok(false);
            };
            let response = self
                .request(Method::DELETE, &id)
                .query(&[("rev", rev)])
                .send()
                .await
                .map_err(|source| CouchDaoError::RequestSend {
                    path: id.clone(),
                    source,
                })?;
            match response.status() {
                StatusCode::CONFLICT => continue,
                StatusCode::NOT_FOUND => return Ok(false),
                status if status.is_success() => return Ok(true),
                other => {
                    return Err(CouchDaoError::RequestStatus {
                        path: id,
                        status: other,
                    });
                }
            }
        }
    }

    /// Block on a `_changes` long-poll until something matching `filter` changes
    /// after `since`, or the server-side timeout elapses.
    async fn wait_for_changes(
        &self,
        since: &serde_json::Value,
        filter: &ChangesFilter,
    ) -> CouchResult<ChangesResponse> {
        let timeout = self.feed_timeout.as_millis().to_string();
        let mut query = vec![
            ("feed", "longpoll".to_string()),
            ("since", seq_param(since)),
            ("timeout", timeout),
        ];
        let body = match filter {
            ChangesFilter::Document(id) => {
                query.push(("filter", "_doc_ids".to_string()));
                json!({ "doc_ids": [id] })
            }
            ChangesFilter::Prefix(prefix) => {
                query.push(("filter", "_selector".to_string()));
                json!({ "selector": { "_id": { "$regex": format!("^{prefix}") } } })
            }
        };

        let response = self
            .request(Method::POST, CHANGES)
            .query(&query)
            .json(&body)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: CHANGES.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(CouchDaoError::RequestStatus {
                path: CHANGES.to_string(),
                status: response.status(),
            });
        }

        response
            .json::<ChangesResponse>()
            .await
            .map_err(|source| CouchDaoError::DecodeResponse {
                path: CHANGES.to_string(),
                source,
            })
    }

    async fn fetch(&self, path: &DocPath) -> CouchResult<Option<Document>> {
        self.get_document(&doc_id(path))
            .await?
            .map(CouchDocument::into_document)
            .transpose()
    }

    async fn snapshot(&self, collection: &str) -> CouchResult<CollectionSnapshot> {
        Ok(self
            .list_documents(&collection_prefix(collection))
            .await?
            .into_iter()
            .map(|doc| (doc.id.clone(), doc))
            .collect())
    }

    /// Long-poll `_changes` for one document and republish it after every change.
    fn spawn_document_poller(
        &self,
        path: DocPath,
        tx: watch::Sender<Option<Document>>,
        mut since: serde_json::Value,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let filter = ChangesFilter::Document(doc_id(&path));
            let mut delay = POLL_RETRY_INITIAL;
            while !tx.is_closed() {
                let outcome = match store.wait_for_changes(&since, &filter).await {
                    Ok(batch) if batch.results.is_empty() => Ok(batch.last_seq),
                    Ok(batch) => store.fetch(&path).await.map(|doc| {
                        tx.send_replace(doc);
                        batch.last_seq
                    }),
                    Err(err) => Err(err),
                };
                match outcome {
                    Ok(next) => {
                        since = next;
                        delay = POLL_RETRY_INITIAL;
                    }
                    Err(err) => {
                        warn!(path = %path, error = %err, "document feed poll failed; backing off");
                        sleep(delay).await;
                        delay = (delay * 2).min(POLL_RETRY_MAX);
                    }
                }
            }
            debug!(path = %path, "document feed closed");
        })
    }

    /// Long-poll `_changes` for a collection and republish the whole ordered listing.
    fn spawn_collection_poller(
        &self,
        collection: String,
        tx: watch::Sender<CollectionSnapshot>,
        mut since: serde_json::Value,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let filter = ChangesFilter::Prefix(collection_prefix(&collection));
            let mut delay = POLL_RETRY_INITIAL;
            while !tx.is_closed() {
                let outcome = match store.wait_for_changes(&since, &filter).await {
                    Ok(batch) if batch.results.is_empty() => Ok(batch.last_seq),
                    Ok(batch) => {
                        let removed = batch.results.iter().filter(|row| row.deleted).count();
                        debug!(%collection, changed = batch.results.len(), removed, "collection changed");
                        store.snapshot(&collection).await.map(|snapshot| {
                            tx.send_replace(snapshot);
                            batch.last_seq
                        })
                    }
                    Err(err) => Err(err),
                };
                match outcome {
                    Ok(next) => {
                        since = next;
                        delay = POLL_RETRY_INITIAL;
                    }
                    Err(err) => {
                        warn!(%collection, error = %err, "collection feed poll failed; backing off");
                        sleep(delay).await;
                        delay = (delay * 2).min(POLL_RETRY_MAX);
                    }
                }
            }
            debug!(%collection, "collection feed closed");
        })
    }
}

impl ChangeFeedStore for CouchStore {
    fn create(&self, collection: &str, fields: Fields) -> BoxFuture<'static, StorageResult<String>> {
        let store = self.clone();
        let collection = collection.to_owned();
        Box::pin(async move {
            let id = Uuid::new_v4().to_string();
            store
                .replace(&DocPath::new(collection, id.clone()), fields)
                .await?;
            Ok(id)
        })
    }

    fn put(&self, path: &DocPath, fields: Fields) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        let path = path.clone();
        Box::pin(async move { store.replace(&path, fields).await.map_err(Into::into) })
    }

    fn get(&self, path: &DocPath) -> BoxFuture<'static, StorageResult<Option<Document>>> {
        let store = self.clone();
        let path = path.clone();
        Box::pin(async move { store.fetch(&path).await.map_err(Into::into) })
    }

    fn list(&self, collection: &str) -> BoxFuture<'static, StorageResult<Vec<Document>>> {
        let store = self.clone();
        let prefix = collection_prefix(collection);
        Box::pin(async move { store.list_documents(&prefix).await.map_err(Into::into) })
    }

    fn update(&self, path: &DocPath, patch: Patch) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        let path = path.clone();
        Box::pin(async move {
            match store.merge(&path, None, &patch).await? {
                MergeOutcome::Missing => Err(StorageError::not_found(&path)),
                MergeOutcome::Written | MergeOutcome::GuardFailed => Ok(()),
            }
        })
    }

    fn update_if(
        &self,
        path: &DocPath,
        guard: Guard,
        patch: Patch,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        let path = path.clone();
        Box::pin(async move {
            let outcome = store.merge(&path, Some(&guard), &patch).await?;
            Ok(matches!(outcome, MergeOutcome::Written))
        })
    }

    fn delete(&self, path: &DocPath) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        let path = path.clone();
        Box::pin(async move { store.remove(&path).await.map_err(Into::into) })
    }

    fn subscribe(&self, path: &DocPath) -> BoxFuture<'static, StorageResult<DocumentFeed>> {
        let store = self.clone();
        let path = path.clone();
        Box::pin(async move {
            // Read the sequence first so no change between the read and the poll is lost.
            let since = store.update_seq().await?;
            let current = store.fetch(&path).await?;
            let (tx, rx) = watch::channel(current);
            let poller = store.spawn_document_poller(path, tx, since);
            Ok(Feed::with_poller(rx, poller))
        })
    }

    fn subscribe_collection(
        &self,
        collection: &str,
    ) -> BoxFuture<'static, StorageResult<CollectionFeed>> {
        let store = self.clone();
        let collection = collection.to_owned();
        Box::pin(async move {
            let since = store.update_seq().await?;
            let current = store.snapshot(&collection).await?;
            let (tx, rx) = watch::channel(current);
            let poller = store.spawn_collection_poller(collection, tx, since);
            Ok(Feed::with_poller(rx, poller))
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.update_seq().await.map(|_| ()).map_err(Into::into) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.ensure_database().await.map_err(Into::into) })
    }
}
