/// Change-feed store port and its backends.
pub mod change_feed;
/// Stored record shapes besides the session itself.
pub mod models;
/// Backend-agnostic storage errors.
pub mod storage;
