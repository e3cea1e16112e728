//! `reqwest` implementation of [`HttpTransport`].

use async_trait::async_trait;
use reqwest::cookie::Jar;
use reqwest::{Client, Url};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{ApiRequest, ApiResponse, HttpTransport, RequestBody};
use crate::sync::{SyncError, SyncResult};

/// HTTP transport with a cookie store shared with the push socket
pub struct ReqwestTransport {
    client: Client,
    base_url: Url,
    jar: Arc<Jar>,
}

impl ReqwestTransport {
    pub fn new(base_url: Url, timeout: Duration) -> SyncResult<Self> {
        let jar = Arc::new(Jar::default());

        let client = Client::builder()
            .cookie_provider(jar.clone())
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            jar,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn cookie_jar(&self) -> Arc<Jar> {
        self.jar.clone()
    }

    fn url_for(&self, path: &str) -> SyncResult<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| SyncError::Protocol(format!("Invalid request path '{}': {}", path, e)))
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: &ApiRequest) -> SyncResult<ApiResponse> {
        let url = self.url_for(&request.path)?;
        debug!("{} {}", request.method, url);

        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .query(request.query.as_slice());

        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(body) => builder.json(body),
            RequestBody::Form(fields) => builder.form(fields),
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();

        let mut headers: HashMap<String, String> = HashMap::new();
        for (name, value) in response.headers() {
            let Ok(value) = value.to_str() else {
                continue;
            };
            headers
                .entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }

        let body = response.bytes().await?;

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}
