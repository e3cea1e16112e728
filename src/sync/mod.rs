//! Synchronization core: the generic engine behind every collection.
//!
//! This module reconciles two differently-timed data sources into one view:
//! - Cursor-paginated REST pages (the cold baseline)
//! - Entities delivered out of band (push messages, local writes)
//! - Reference-counted ownership of shared long-lived resources
//! - Per-parent collection registries with lease-based disposal

pub mod link;
pub mod merge;
pub mod pagination;
pub mod refcount;
pub mod registry;

pub use merge::{
    merge_view, CollectionWatcher, Entity, LiveMergeCollection, SyncedCollection, ViewOrder,
};
pub use pagination::{CursorPaginator, FetchStatus, Page, PageSource, RawPage};
pub use refcount::{RefCountedResource, ResourceLease};
pub use registry::{CollectionLease, CollectionRegistry};

use serde::{Deserialize, Serialize};

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during synchronization.
///
/// Errors are `Clone` so that paginators can keep the last failure as state
/// and in-flight futures can be shared between callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Network failure or timeout
    #[error("Transport error: {0}")]
    Transport(String),

    /// Authorization failed and could not be recovered
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Malformed response body or metadata
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server answered with a non-success status
    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    /// Caller broke an API contract (double release, cross-parent insert)
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// Request was aborted before it settled
    #[error("Request aborted")]
    Aborted,

    /// Client configuration rejected at startup
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// True for the final authorization failure
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, SyncError::Unauthorized(_))
    }

    /// True when retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport(_) | SyncError::Aborted => true,
            SyncError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

/// Ordered query-string parameters.
///
/// Keys may repeat (`q=dog&q=cat`), so this is a list of pairs rather than a
/// map. Insertion order is kept so requests are reproducible.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Set `key` to a single value, dropping earlier values for that key
    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        let key = key.into();
        self.0.retain(|(k, _)| *k != key);
        self.0.push((key, value.to_string()));
    }

    /// Add another value for `key`
    pub fn append(&mut self, key: impl Into<String>, value: impl ToString) {
        self.0.push((key.into(), value.to_string()));
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.insert(key, value);
        self
    }

    /// First value for `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.iter().any(|(k, _)| k == key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[(String, String)] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Overlay `overrides` on top of `self`.
    ///
    /// Every key present in `overrides` replaces all of its values in `self`;
    /// keys only present in `self` are kept in place.
    pub fn merged_with(&self, overrides: &QueryParams) -> QueryParams {
        let mut merged: Vec<(String, String)> = self
            .0
            .iter()
            .filter(|(k, _)| !overrides.contains_key(k))
            .cloned()
            .collect();
        merged.extend(overrides.0.iter().cloned());
        QueryParams(merged)
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for QueryParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        QueryParams(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.to_string()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_display() {
        let err = SyncError::Http {
            status: 404,
            message: "Not Found".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP error 404: Not Found");
        assert_eq!(
            SyncError::Unauthorized("expired".to_string()).to_string(),
            "Unauthorized: expired"
        );
    }

    #[test]
    fn test_sync_error_retryable() {
        assert!(SyncError::Transport("timeout".into()).is_retryable());
        assert!(SyncError::Http {
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(!SyncError::Unauthorized("nope".into()).is_retryable());
        assert!(!SyncError::ContractViolation("double release".into()).is_retryable());
    }

    #[test]
    fn test_query_params_merge_prefers_overrides() {
        let mut base = QueryParams::new().with("n", 32).with("av", "yes");
        base.append("q", "dog");
        base.append("q", "cat");

        let cursor = QueryParams::new().with("n", 32).with("cid", 118);
        let merged = base.merged_with(&cursor);

        assert_eq!(merged.get("av"), Some("yes"));
        assert_eq!(merged.get("cid"), Some("118"));
        assert_eq!(merged.get_all("q").collect::<Vec<_>>(), vec!["dog", "cat"]);
        assert_eq!(merged.get_all("n").count(), 1);
    }

    #[test]
    fn test_query_params_insert_replaces() {
        let mut params = QueryParams::new();
        params.append("reg", 1);
        params.append("reg", 2);
        params.insert("reg", 7);

        assert_eq!(params.get_all("reg").collect::<Vec<_>>(), vec!["7"]);
        assert_eq!(params.len(), 1);
    }
}
