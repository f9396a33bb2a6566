use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ApiError, BackendError, ErrorKind, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Post => "POST",
        })
    }
}

/// One request/response exchange with the backend.
///
/// Implementations return the envelope's `data` (or `Value::Null` when absent) and
/// never retry: every backend call except the pure reads has side effects.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, endpoint: &str, method: Method, body: Option<Value>) -> Result<Value, ApiError>;
}

/// Response envelope shared by every backend route.
#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    details: Option<Value>,
    #[serde(default)]
    debug_info: Option<Value>,
}

/// Turn a raw HTTP response into the envelope's data or a typed error.
pub fn decode_envelope(endpoint: &str, status: u16, body: &str) -> Result<Value, ApiError> {
    let ok_status = (200..300).contains(&status);

    let envelope: Envelope = match serde_json::from_str(body) {
        Ok(e) => e,
        Err(e) if ok_status => {
            return Err(TransportError::Malformed {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            }
            .into());
        }
        Err(_) => {
            return Err(TransportError::Status {
                endpoint: endpoint.to_string(),
                status,
                body: body.chars().take(200).collect(),
            }
            .into());
        }
    };

    if !envelope.success {
        let details = envelope.details.map(|d| match d {
            Value::String(s) => s,
            other => other.to_string(),
        });
        return Err(BackendError {
            endpoint: endpoint.to_string(),
            message: envelope
                .message
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "request failed".to_string()),
            kind: ErrorKind::from_error_type(envelope.error_type.as_deref()),
            details,
            debug_info: envelope.debug_info,
        }
        .into());
    }

    if !ok_status {
        return Err(TransportError::Status {
            endpoint: endpoint.to_string(),
            status,
            body: envelope.message.unwrap_or_default(),
        }
        .into());
    }

    Ok(envelope.data.unwrap_or(Value::Null))
}

/// reqwest-backed transport rooted at the backend's API base URL.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self, TransportError> {
        Self::with_base_url(
            &config.backend.base_url,
            config.request_timeout(),
            config.backend.user_agent.as_deref(),
        )
    }

    pub fn with_base_url(base_url: &str, timeout: Duration, user_agent: Option<&str>) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        let agent = match user_agent {
            Some(ua) => HeaderValue::from_str(ua).map_err(|_| TransportError::Malformed {
                endpoint: base_url.to_string(),
                message: format!("invalid user agent: {ua}"),
            })?,
            None => HeaderValue::from_static(concat!("pubdesk/", env!("CARGO_PKG_VERSION"))),
        };
        headers.insert(USER_AGENT, agent);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| TransportError::Http {
                endpoint: base_url.to_string(),
                source: e,
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, endpoint: &str, method: Method, body: Option<Value>) -> Result<Value, ApiError> {
        let url = self.url(endpoint);
        let started = Instant::now();
        debug!(%method, url = %url, "backend request");

        let request = match method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url).json(&body.unwrap_or_else(|| Value::Object(Default::default()))),
        };

        let result = async {
            let response = request.send().await.map_err(|e| TransportError::Http {
                endpoint: endpoint.to_string(),
                source: e,
            })?;
            let status = response.status().as_u16();
            let text = response.text().await.map_err(|e| TransportError::Http {
                endpoint: endpoint.to_string(),
                source: e,
            })?;
            decode_envelope(endpoint, status, &text)
        }
        .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => info!(%method, endpoint, elapsed_ms, "backend call succeeded"),
            Err(ApiError::Backend(e)) => warn!(
                %method,
                endpoint,
                elapsed_ms,
                error_type = ?e.kind,
                message = %e.message,
                details = e.details.as_deref().unwrap_or(""),
                debug_info = ?e.debug_info,
                "backend reported failure"
            ),
            Err(e) => warn!(%method, endpoint, elapsed_ms, error = %e, "backend call failed"),
        }
        result
    }
}
