//! Client configuration.

use reqwest::Url;
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_API_URL: &str = "MARKETPLACE_API_URL";
pub const ENV_WS_PATH: &str = "MARKETPLACE_WS_PATH";
pub const ENV_SESSION_FILE: &str = "MARKETPLACE_SESSION_FILE";
pub const ENV_TIMEOUT_MS: &str = "MARKETPLACE_TIMEOUT_MS";
pub const ENV_PAGE_SIZE: &str = "MARKETPLACE_PAGE_SIZE";

/// Largest page the API serves
pub const MAX_PAGE_SIZE: u32 = 128;

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid API URL '{0}': {1}")]
    InvalidUrl(String, String),

    #[error("Invalid value '{value}' for {name}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for crate::sync::SyncError {
    fn from(err: ConfigError) -> Self {
        crate::sync::SyncError::Config(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Base URL of the REST API
    pub api_url: String,
    /// Path of the push socket, relative to `api_url`
    pub ws_path: String,
    /// Where the session marker is persisted; in memory when `None`
    pub session_file: Option<PathBuf>,
    pub timeout: Duration,
    /// Default `n` of list requests
    pub page_size: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000/".to_string(),
            ws_path: "/v1/me/websocket".to_string(),
            session_file: None,
            timeout: Duration::from_secs(30),
            page_size: 32,
        }
    }
}

impl ClientConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            ..Self::default()
        }
    }

    /// Load from the environment (and `.env`, if present)
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(api_url) = lookup(ENV_API_URL) {
            config.api_url = api_url;
        }
        if let Some(ws_path) = lookup(ENV_WS_PATH) {
            config.ws_path = ws_path;
        }
        if let Some(session_file) = lookup(ENV_SESSION_FILE) {
            config.session_file = Some(PathBuf::from(session_file));
        }
        if let Some(timeout) = lookup(ENV_TIMEOUT_MS) {
            let millis = timeout.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                name: ENV_TIMEOUT_MS,
                value: timeout.clone(),
            })?;
            config.timeout = Duration::from_millis(millis);
        }
        if let Some(page_size) = lookup(ENV_PAGE_SIZE) {
            config.page_size = page_size.parse().map_err(|_| ConfigError::InvalidValue {
                name: ENV_PAGE_SIZE,
                value: page_size.clone(),
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_ws_path(mut self, ws_path: impl Into<String>) -> Self {
        self.ws_path = ws_path.into();
        self
    }

    pub fn with_session_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.session_file = Some(path.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.api_base()?;
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "page size must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid("timeout must not be zero".to_string()));
        }
        Ok(())
    }

    /// API base URL, always ending with `/` so relative paths append
    pub fn api_base(&self) -> Result<Url, ConfigError> {
        let mut url = Url::parse(&self.api_url)
            .map_err(|e| ConfigError::InvalidUrl(self.api_url.clone(), e.to_string()))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidUrl(
                self.api_url.clone(),
                "scheme must be http or https".to_string(),
            ));
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }

    /// Push socket URL: the API base with a ws/wss scheme
    pub fn websocket_url(&self) -> Result<Url, ConfigError> {
        let base = self.api_base()?;
        let mut url = base
            .join(self.ws_path.trim_start_matches('/'))
            .map_err(|e| ConfigError::InvalidUrl(self.ws_path.clone(), e.to_string()))?;

        let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ConfigError::Invalid(format!("cannot use scheme {}", scheme)))?;
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_is_valid() {
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn test_urls_keep_base_path() {
        let config = ClientConfig::new("https://example.com/api");

        assert_eq!(config.api_base().unwrap().as_str(), "https://example.com/api/");
        assert_eq!(
            config.websocket_url().unwrap().as_str(),
            "wss://example.com/api/v1/me/websocket"
        );
        assert_eq!(
            ClientConfig::default().websocket_url().unwrap().as_str(),
            "ws://localhost:8000/v1/me/websocket"
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(ClientConfig::new("ftp://example.com").validate().is_err());
        assert!(ClientConfig::new("not a url").validate().is_err());
        assert!(ClientConfig::default().with_page_size(0).validate().is_err());
        assert!(ClientConfig::default().with_page_size(129).validate().is_err());
        assert!(ClientConfig::default()
            .with_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            (ENV_API_URL, "https://api.example.com"),
            (ENV_TIMEOUT_MS, "2500"),
            (ENV_PAGE_SIZE, "16"),
            (ENV_SESSION_FILE, "/tmp/session.json"),
        ]
        .into_iter()
        .collect();

        let config =
            ClientConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string())).unwrap();

        assert_eq!(config.api_url, "https://api.example.com");
        assert_eq!(config.timeout, Duration::from_millis(2500));
        assert_eq!(config.page_size, 16);
        assert_eq!(config.session_file, Some(PathBuf::from("/tmp/session.json")));
        assert_eq!(config.ws_path, "/v1/me/websocket");
    }

    #[test]
    fn test_from_lookup_invalid_number() {
        let result = ClientConfig::from_lookup(|name| {
            (name == ENV_TIMEOUT_MS).then(|| "soon".to_string())
        });

        assert_eq!(
            result,
            Err(ConfigError::InvalidValue {
                name: ENV_TIMEOUT_MS,
                value: "soon".to_string()
            })
        );
    }
}
