//! HTTP transport adapter
//!
//! Posts each [`OperationRequest`] as JSON to `{endpoint}{path}` and maps the
//! HTTP outcome onto the three [`SendError`] classes.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client as ReqwestClient, Response as ReqwestResponse};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::endpoint::{EndpointSelectionPolicy, Failover};
use crate::error::{ConflictDetails, SendError, TransportBuildError};
use crate::transport::{OperationRequest, OperationResponse, Transport};

/// Header carrying the operation id so the backend can de-duplicate replays
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Statuses that indicate a network or availability problem
///
/// 522 and 524 are proxy timeouts reported by some CDNs.
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429 | 500..=599)
}

/// Configuration for [`HttpTransport`]
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Base URLs, in preference order
    pub endpoints: Vec<String>,
    /// Path appended to the selected endpoint
    pub path: String,
    /// Request timeout
    pub timeout: Duration,
    /// User agent string
    pub user_agent: String,
    /// Custom headers to include in all requests
    pub default_headers: HashMap<String, String>,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            path: "/operations".to_string(),
            timeout: Duration::from_secs(30),
            user_agent: format!("clinic-sync/{}", env!("CARGO_PKG_VERSION")),
            default_headers: HashMap::new(),
        }
    }
}

impl HttpTransportConfig {
    /// Create a config with a single endpoint
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { endpoints: vec![endpoint.into()], ..Default::default() }
    }

    /// Add a fallback endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    /// Set the request path
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the user agent
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Add a default header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(key.into(), value.into());
        self
    }
}

/// Error body returned by the backend for rejected requests
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ErrorBody {
    error: String,
    message: String,
}

impl ErrorBody {
    fn describe(&self, status: u16) -> String {
        match (self.error.is_empty(), self.message.is_empty()) {
            (true, true) => format!("HTTP {}", status),
            (false, true) => format!("HTTP {}: {}", status, self.error),
            (_, false) => format!("HTTP {}: {}", status, self.message),
        }
    }
}

/// [`Transport`] over HTTP
#[derive(Clone)]
pub struct HttpTransport {
    client: ReqwestClient,
    config: HttpTransportConfig,
    policy: Arc<dyn EndpointSelectionPolicy>,
}

impl HttpTransport {
    /// Build a transport that fails over between endpoints in order
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportBuildError> {
        Self::with_policy(config, Arc::new(Failover::new()))
    }

    /// Build a transport with a custom endpoint selection policy
    pub fn with_policy(
        config: HttpTransportConfig,
        policy: Arc<dyn EndpointSelectionPolicy>,
    ) -> Result<Self, TransportBuildError> {
        if config.endpoints.is_empty() {
            return Err(TransportBuildError::NoEndpoints);
        }

        let mut headers = HeaderMap::new();
        for (key, value) in &config.default_headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|_| TransportBuildError::InvalidHeader(key.clone()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| TransportBuildError::InvalidHeader(key.clone()))?;
            headers.insert(name, value);
        }

        let client = ReqwestClient::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .default_headers(headers)
            .build()?;

        Ok(Self { client, config, policy })
    }

    /// Configured endpoints
    pub fn endpoints(&self) -> &[String] {
        &self.config.endpoints
    }

    async fn parse_response(&self, response: ReqwestResponse) -> Result<OperationResponse, SendError> {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| SendError::Transport(format!("Failed to read response: {}", e)))?;

        if (200..300).contains(&status) {
            if body.trim().is_empty() {
                return Ok(OperationResponse::default());
            }
            return serde_json::from_str(&body)
                .map_err(|e| SendError::Transport(format!("Malformed response body: {}", e)));
        }

        if status == 409 {
            let details = serde_json::from_str::<ConflictDetails>(&body).unwrap_or_else(|_| {
                ConflictDetails { message: body.clone(), ..Default::default() }
            });
            return Err(SendError::Conflict(details));
        }

        let described = serde_json::from_str::<ErrorBody>(&body)
            .map(|e| e.describe(status))
            .unwrap_or_else(|_| format!("HTTP {}: {}", status, body));

        if is_transient_status(status) || !(400..500).contains(&status) {
            Err(SendError::Transport(described))
        } else {
            Err(SendError::Validation(described))
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &OperationRequest) -> Result<OperationResponse, SendError> {
        let count = self.config.endpoints.len();
        let index = self
            .policy
            .select(count)
            .ok_or_else(|| SendError::Transport("No endpoint available".to_string()))?;
        let endpoint = self.config.endpoints[index % count].trim_end_matches('/');
        let url = format!("{}{}", endpoint, self.config.path);

        let mut req = self.client.post(&url).json(request);
        if let Some(key) = &request.idempotency_key {
            req = req.header(IDEMPOTENCY_KEY_HEADER, key);
        }

        tracing::debug!(url = %url, operation = %request.operation, "Sending operation");

        let response = match req.send().await {
            Ok(response) => response,
            Err(e) => {
                self.policy.on_failure(index, count);
                return Err(SendError::Transport(format!("Request failed: {}", e)));
            }
        };

        if is_transient_status(response.status().as_u16()) {
            self.policy.on_failure(index, count);
        }

        self.parse_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_statuses() {
        for status in [408, 425, 429, 500, 502, 503, 504, 522, 524] {
            assert!(is_transient_status(status), "{} should be transient", status);
        }
        for status in [200, 400, 401, 404, 409, 422] {
            assert!(!is_transient_status(status), "{} should not be transient", status);
        }
    }

    #[test]
    fn test_config_builder() {
        let config = HttpTransportConfig::new("https://api.example.com")
            .with_endpoint("https://backup.example.com")
            .with_timeout(Duration::from_secs(5))
            .with_header("X-Client", "portal");

        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.path, "/operations");
        assert_eq!(config.default_headers.get("X-Client"), Some(&"portal".to_string()));
    }

    #[test]
    fn test_requires_endpoint() {
        let config = HttpTransportConfig::default();
        assert!(matches!(HttpTransport::new(config), Err(TransportBuildError::NoEndpoints)));
    }

    #[test]
    fn test_rejects_invalid_header() {
        let config = HttpTransportConfig::new("https://api.example.com").with_header("bad header", "x");
        assert!(matches!(
            HttpTransport::new(config),
            Err(TransportBuildError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_error_body_description() {
        let body = ErrorBody { error: "InvalidDate".to_string(), message: String::new() };
        assert_eq!(body.describe(422), "HTTP 422: InvalidDate");
        let body = ErrorBody::default();
        assert_eq!(body.describe(400), "HTTP 400");
    }
}
