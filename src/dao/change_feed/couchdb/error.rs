use reqwest::StatusCode;
use thiserror::Error;

/// Result alias for the CouchDB backend.
pub type CouchResult<T> = Result<T, CouchDaoError>;

/// Failures of the CouchDB change-feed backend. All of them surface as
/// [`StorageError::Unavailable`](crate::dao::storage::StorageError::Unavailable).
#[derive(Debug, Error)]
pub enum CouchDaoError {
    /// A required environment variable is absent.
    #[error("`{var}` is not set")]
    MissingEnvVar {
        /// Variable name.
        var: &'static str,
    },
    /// An environment variable could not be parsed.
    #[error("`{var}` has an unusable value `{value}`")]
    InvalidEnvVar {
        /// Variable name.
        var: &'static str,
        /// Raw value found.
        value: String,
    },
    /// The HTTP client could not be configured.
    #[error("cannot build the CouchDB HTTP client")]
    ClientBuilder {
        /// Builder failure.
        #[source]
        source: reqwest::Error,
    },
    /// Probing the database (startup or health check) failed to reach the server.
    #[error("cannot reach database `{database}`")]
    DatabaseQuery {
        /// Database name.
        database: String,
        /// Transport failure.
        #[source]
        source: reqwest::Error,
    },
    /// The database was missing and creating it failed.
    #[error("cannot create database `{database}`")]
    DatabaseCreate {
        /// Database name.
        database: String,
        /// Transport failure.
        #[source]
        source: reqwest::Error,
    },
    /// Unexpected status while probing or creating the database.
    #[error("database `{database}` answered with status {status}")]
    DatabaseStatus {
        /// Database name.
        database: String,
        /// Status returned.
        status: StatusCode,
    },
    /// A request never reached the server.
    #[error("request to `{path}` was not sent")]
    RequestSend {
        /// Request path below the server root.
        path: String,
        /// Transport failure.
        #[source]
        source: reqwest::Error,
    },
    /// Any status the document or `_changes` endpoints should not return; conflicts
    /// are retried before this is raised.
    #[error("`{path}` answered with status {status}")]
    RequestStatus {
        /// Request path below the server root.
        path: String,
        /// Status returned.
        status: StatusCode,
    },
    /// A response body did not have the expected shape.
    #[error("unreadable response body from `{path}`")]
    DecodeResponse {
        /// Request path below the server root.
        path: String,
        /// Decoding failure.
        #[source]
        source: reqwest::Error,
    },
    /// A stored id without the `collection::id` shape.
    #[error("document id `{doc_id}` has no collection prefix")]
    InvalidDocId {
        /// The offending id.
        doc_id: String,
    },
}
