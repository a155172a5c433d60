//! REST gateway to the case-management platform.
//!
//! Every call returns `Result<Value, RestError>`. An `Err` means the
//! operation did not happen; the gateway itself never panics or retries,
//! and each caller decides whether to skip, abort, or report.

pub mod http;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use opentelemetry_semantic_conventions::attribute::HTTP_REQUEST_METHOD;

pub use http::HttpTransport;
pub use memory::MemoryTransport;

/// Why a REST call produced no result.
#[derive(Debug, Error)]
pub enum RestError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("unexpected status {code}: {body}")]
    Status { code: u16, body: String },

    #[error("unparsable response body: {0}")]
    Parse(#[from] serde_json::Error),
}

impl RestError {
    fn outcome(&self) -> &'static str {
        match self {
            RestError::Transport(_) => "transport",
            RestError::Status { .. } => "status",
            RestError::Parse(_) => "parse",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

/// A single request as handed to a transport.
#[derive(Debug, Clone)]
pub struct RestRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
}

/// Raw status and body. Interpreting them is the gateway's job.
#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: u16,
    pub body: String,
}

impl RestResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Moves a request over the wire (or not, for [`MemoryTransport`]).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: RestRequest) -> Result<RestResponse, RestError>;
}

/// Typed GET/POST access to the platform REST API.
#[derive(Clone)]
pub struct RestGateway {
    transport: Arc<dyn Transport>,
    base_url: String,
}

impl RestGateway {
    pub fn new(transport: Arc<dyn Transport>, base_url: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url_for(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    /// GET `endpoint`. Returns the `data` field when present, except for
    /// `rest/container/...` lookups whose records carry their own `data`.
    pub async fn get(&self, endpoint: &str) -> Result<Value, RestError> {
        let content = self.call(Method::Get, endpoint, None).await?;
        Ok(unwrap_data(endpoint, content))
    }

    /// POST a JSON body to `endpoint`. Same unwrapping rule as [`get`](Self::get).
    pub async fn post<B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<Value, RestError> {
        let body = serde_json::to_value(body)?;
        let content = self.call(Method::Post, endpoint, Some(body)).await?;
        Ok(unwrap_data(endpoint, content))
    }

    async fn call(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
    ) -> Result<Value, RestError> {
        let url = self.url_for(endpoint);
        debug!(method = method.as_str(), %url, "rest request");

        let result = self
            .transport
            .send(RestRequest {
                method,
                url: url.clone(),
                body,
            })
            .await
            .and_then(|response| {
                if response.is_success() {
                    Ok(serde_json::from_str::<Value>(&response.body)?)
                } else {
                    Err(RestError::Status {
                        code: response.status,
                        body: response.body,
                    })
                }
            });

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => {
                debug!(method = method.as_str(), %url, error = %e, "rest request produced no result");
                e.outcome()
            }
        };
        metrics::rest_requests().add(
            1,
            &[
                KeyValue::new(HTTP_REQUEST_METHOD, method.as_str()),
                KeyValue::new("outcome", outcome),
            ],
        );

        result
    }
}

fn unwrap_data(endpoint: &str, mut content: Value) -> Value {
    let container_lookup = endpoint.trim_start_matches('/').starts_with("rest/container/");
    if !container_lookup {
        if let Some(data) = content.get_mut("data") {
            return data.take();
        }
    }
    content
}

/// Quote a filter value the way the platform query language expects.
pub fn quoted(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\\\""))
}
