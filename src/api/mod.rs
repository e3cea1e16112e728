//! REST access to the marketplace API.
//!
//! Requests are plain values ([`ApiRequest`]) executed by an
//! [`HttpTransport`]. The production transport is `reqwest`; tests script
//! responses instead. [`ApiClient`] layers the authorization retry on top.

pub mod client;
pub mod session;
pub mod transport;

pub use client::{ApiClient, ListEndpoint};
pub use session::{AuthSession, FileMarker, MemoryMarker, SessionMarkerStore, SessionState};
pub use transport::ReqwestTransport;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;

use crate::sync::{QueryParams, SyncError, SyncResult};

/// Whether a request may be sent a second time after a credential refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayPolicy {
    Safe,
    Unsafe,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
}

/// A request relative to the API base URL
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: QueryParams,
    pub body: RequestBody,
    pub replay: Option<ReplayPolicy>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: QueryParams::new(),
            body: RequestBody::Empty,
            replay: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_query(mut self, query: QueryParams) -> Self {
        self.query = query;
        self
    }

    pub fn with_json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn with_form<K: Into<String>, V: Into<String>>(
        mut self,
        fields: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        self.body = RequestBody::Form(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn with_replay(mut self, policy: ReplayPolicy) -> Self {
        self.replay = Some(policy);
        self
    }

    /// GET and HEAD replay by default, anything else must opt in
    pub fn can_replay(&self) -> bool {
        match self.replay {
            Some(ReplayPolicy::Safe) => true,
            Some(ReplayPolicy::Unsafe) => false,
            None => self.method == Method::GET || self.method == Method::HEAD,
        }
    }

    /// `"METHOD /path"`, used in logs
    pub fn route(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// A fully read response
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    /// Header names lowercased; repeated headers joined with `", "`
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_json(mut self, body: Value) -> Self {
        self.body = Bytes::from(body.to_string());
        self.with_header("content-type", "application/json")
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == 401
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn json<T: DeserializeOwned>(&self) -> SyncResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Turn non-success statuses into errors
    pub fn error_for_status(self) -> SyncResult<Self> {
        if self.is_success() {
            return Ok(self);
        }

        let message = self.error_message();
        if self.is_unauthorized() {
            Err(SyncError::Unauthorized(message))
        } else {
            Err(SyncError::Http {
                status: self.status,
                message,
            })
        }
    }

    /// `detail` field of an error body, or the raw body
    fn error_message(&self) -> String {
        if let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(&self.body) {
            if let Some(detail) = map.get("detail") {
                return match detail {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
            }
        }
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Executes API requests
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: &ApiRequest) -> SyncResult<ApiResponse>;
}
