/// Client for the hosted backend-as-a-service: REST tables, auth and the
/// realtime websocket all hang off one project URL and anon key.
pub mod auth;
pub mod realtime;
pub mod rest;

use crate::error::{Result, StudyHubError};
use reqwest::{RequestBuilder, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

pub use realtime::BackendRealtime;

/// Shared HTTP client plus the session token once signed in
#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
    access_token: Arc<RwLock<Option<String>>>,
}

impl BackendClient {
    pub fn new(base_url: &str, anon_key: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StudyHubError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            access_token: Arc::new(RwLock::new(None)),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    pub(crate) fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Websocket endpoint for realtime, derived from the project URL
    pub(crate) fn realtime_url(&self) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            format!("wss://{}", self.base_url)
        };
        format!(
            "{}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            ws_base, self.anon_key
        )
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub(crate) fn anon_key(&self) -> &str {
        &self.anon_key
    }

    pub async fn access_token(&self) -> Option<String> {
        self.access_token.read().await.clone()
    }

    pub(crate) async fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write().await = token;
    }

    /// Attach the api key and the user's token (anon key when signed out)
    pub(crate) async fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        let bearer = self
            .access_token()
            .await
            .unwrap_or_else(|| self.anon_key.clone());
        req.header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", bearer))
    }
}

/// Transport-level failure talking to the store
pub(crate) fn unreachable(e: reqwest::Error) -> StudyHubError {
    StudyHubError::StoreUnavailable(e.to_string())
}

/// Map non-success responses onto the error taxonomy
pub(crate) async fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    debug!("Backend responded {}: {}", status, body);
    Err(status_error(status, &body))
}

pub(crate) fn status_error(status: StatusCode, body: &str) -> StudyHubError {
    let detail = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            ["message", "msg", "error_description", "error"]
                .iter()
                .find_map(|k| v.get(*k).and_then(|m| m.as_str()).map(str::to_string))
        })
        .unwrap_or_else(|| format!("HTTP {}", status));
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StudyHubError::Auth(detail),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY | StatusCode::CONFLICT => {
            StudyHubError::Validation(detail)
        }
        _ => StudyHubError::StoreUnavailable(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(url: &str) -> BackendClient {
        BackendClient::new(url, "anon-key", Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_urls() {
        let c = client("https://proj.example.co/");
        assert_eq!(c.rest_url("messages"), "https://proj.example.co/rest/v1/messages");
        assert_eq!(c.auth_url("/token"), "https://proj.example.co/auth/v1/token");
        assert_eq!(
            c.realtime_url(),
            "wss://proj.example.co/realtime/v1/websocket?apikey=anon-key&vsn=1.0.0"
        );
        assert!(client("http://localhost:54321").realtime_url().starts_with("ws://localhost:54321/"));
    }

    #[test]
    fn test_status_mapping() {
        let e = status_error(StatusCode::SERVICE_UNAVAILABLE, "");
        assert!(e.is_store_unavailable());
        let e = status_error(StatusCode::UNAUTHORIZED, r#"{"message":"JWT expired"}"#);
        assert!(matches!(e, StudyHubError::Auth(ref m) if m == "JWT expired"));
        let e = status_error(StatusCode::BAD_REQUEST, r#"{"error_description":"bad"}"#);
        assert!(matches!(e, StudyHubError::Validation(_)));
    }

    #[tokio::test]
    async fn test_token_roundtrip() {
        let c = client("https://proj.example.co");
        assert!(c.access_token().await.is_none());
        c.set_access_token(Some("jwt".into())).await;
        assert_eq!(c.access_token().await.as_deref(), Some("jwt"));
    }
}
