//! Client configuration

use std::time::Duration;
use url::Url;

use crate::error::{ChatError, Result};

pub const API_URL_ENV: &str = "ORALSUITE_API_URL";
pub const SOCKET_URL_ENV: &str = "ORALSUITE_SOCKET_URL";

/// Configuration for the chat engine
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Base URL of the REST API, including the `/api` prefix
    pub api_url: String,

    /// WebSocket endpoint; derived from `api_url` when unset
    pub socket_url: Option<String>,

    /// Local inactivity after which a typing-stop is emitted (default: 2s)
    pub typing_idle_timeout: Duration,

    /// Expiry for remote typers whose stop signal never arrived (default: 5s)
    pub remote_typing_ttl: Duration,

    /// Messages requested per history fetch (default: 50)
    pub history_page_size: u32,

    /// Notifications kept in memory (default: 50)
    pub notification_capacity: usize,

    /// Maximum characters of a notification summary (default: 100)
    pub summary_max_chars: usize,

    /// Timeout for a single REST request (default: 30s)
    pub request_timeout: Duration,

    /// First reconnect delay of the realtime transport (default: 1s)
    pub reconnect_delay: Duration,

    /// Upper bound of the reconnect backoff (default: 5s)
    pub reconnect_delay_max: Duration,

    /// Buffer of the engine event bus (default: 256)
    pub event_capacity: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:3000/api".to_string(),
            socket_url: None,
            typing_idle_timeout: Duration::from_secs(2),
            remote_typing_ttl: Duration::from_secs(5),
            history_page_size: 50,
            notification_capacity: 50,
            summary_max_chars: 100,
            request_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(1),
            reconnect_delay_max: Duration::from_secs(5),
            event_capacity: 256,
        }
    }
}

impl ChatConfig {
    /// Defaults overridden by `ORALSUITE_API_URL` / `ORALSUITE_SOCKET_URL`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(api_url) = std::env::var(API_URL_ENV) {
            config.api_url = api_url;
        }
        if let Ok(socket_url) = std::env::var(SOCKET_URL_ENV) {
            config.socket_url = Some(socket_url);
        }
        config
    }

    pub fn api_base(&self) -> Result<Url> {
        let mut url = Url::parse(&self.api_url)?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }

    /// The realtime endpoint: explicit `socket_url`, or the API origin with
    /// the `/api` suffix dropped, a WebSocket scheme and the `/ws` path.
    pub fn socket_endpoint(&self) -> Result<Url> {
        if let Some(socket_url) = &self.socket_url {
            return Ok(Url::parse(socket_url)?);
        }

        let mut url = Url::parse(&self.api_url)?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(ChatError::Config(format!(
                    "unsupported API scheme: {}",
                    other
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| ChatError::Config(format!("cannot use scheme {}", scheme)))?;

        let path = url.path().trim_end_matches('/');
        let base = path.strip_suffix("/api").unwrap_or(path).to_string();
        url.set_path(&format!("{}/ws", base));
        url.set_query(None);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_socket_endpoint() {
        let config = ChatConfig::default();
        assert_eq!(
            config.socket_endpoint().unwrap().as_str(),
            "ws://localhost:3000/ws"
        );
    }

    #[test]
    fn test_socket_endpoint_keeps_prefix_and_tls() {
        let config = ChatConfig {
            api_url: "https://dash.example.com/backend/api/".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.socket_endpoint().unwrap().as_str(),
            "wss://dash.example.com/backend/ws"
        );
    }

    #[test]
    fn test_explicit_socket_url_wins() {
        let config = ChatConfig {
            socket_url: Some("ws://127.0.0.1:9000/realtime".to_string()),
            ..Default::default()
        };
        assert_eq!(
            config.socket_endpoint().unwrap().as_str(),
            "ws://127.0.0.1:9000/realtime"
        );
    }

    #[test]
    fn test_api_base_joins_relative_paths() {
        let config = ChatConfig::default();
        let url = config.api_base().unwrap().join("chat/conversations").unwrap();
        assert_eq!(url.as_str(), "http://localhost:3000/api/chat/conversations");
    }
}
